//! Sub-process execution for the external archive tools
//!
//! Every program archivist starts -- the extractor, the metric lister and the
//! sampler -- is started through a [`ProcessRunner`]. Two shapes of call are
//! needed: run-to-completion with captured output, used for listing and
//! validation, and a streaming start whose stdout is read as a live pipe while
//! the process runs, used for the export. In the streaming case the exit
//! status must only be collected once stdout has been drained, otherwise a
//! full pipe buffer deadlocks the child.

use std::{
    ffi::OsString,
    fmt, io,
    path::PathBuf,
    pin::Pin,
    process::{ExitStatus, Stdio},
    time::Duration,
};

use futures::future::BoxFuture;
use tokio::{io::AsyncRead, process::Command, time};

/// Errors produced by [`ProcessRunner`] implementations
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The program could not be started.
    #[error("unable to spawn {program}: {source}")]
    Spawn {
        /// Program that failed to start
        program: String,
        /// Underlying IO error
        #[source]
        source: io::Error,
    },
    /// Output or exit status could not be collected.
    #[error("unable to wait for {program}: {source}")]
    Wait {
        /// Program being waited on
        program: String,
        /// Underlying IO error
        #[source]
        source: io::Error,
    },
    /// The program ran past its deadline and was killed.
    #[error("{program} did not finish within {timeout:?}")]
    Timeout {
        /// Program that was killed
        program: String,
        /// The deadline that elapsed
        timeout: Duration,
    },
    /// Stdout was requested as a pipe but none was attached.
    #[error("{0} has no stdout pipe")]
    NoStdout(String),
}

/// How a sub-process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Exit {
    code: Option<i32>,
}

impl Exit {
    /// An exit with the given code.
    #[must_use]
    pub fn with_code(code: i32) -> Self {
        Self { code: Some(code) }
    }

    /// Exit code, if the process exited normally.
    #[must_use]
    pub fn code(self) -> Option<i32> {
        self.code
    }

    /// `true` when the process exited with code zero.
    #[must_use]
    pub fn success(self) -> bool {
        self.code == Some(0)
    }
}

impl From<ExitStatus> for Exit {
    fn from(status: ExitStatus) -> Self {
        Self {
            code: status.code(),
        }
    }
}

impl fmt::Display for Exit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "exit code {code}"),
            None => write!(f, "terminated without exit code"),
        }
    }
}

/// A program and its arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    program: PathBuf,
    args: Vec<OsString>,
}

/// Arguments shown by the [`fmt::Display`] impl of [`Invocation`] before the
/// rest is summarized. Sampler invocations can carry thousands of metrics.
const DISPLAYED_ARGS: usize = 8;

impl Invocation {
    /// Start building an invocation of `program`.
    #[must_use]
    pub fn new<P>(program: P) -> Self
    where
        P: Into<PathBuf>,
    {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Append one argument.
    #[must_use]
    pub fn arg<A>(mut self, arg: A) -> Self
    where
        A: Into<OsString>,
    {
        self.args.push(arg.into());
        self
    }

    /// Append several arguments.
    #[must_use]
    pub fn args<I, A>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// The program's arguments.
    #[must_use]
    pub fn arguments(&self) -> &[OsString] {
        &self.args
    }

    /// Program name for error messages.
    #[must_use]
    pub fn name(&self) -> String {
        self.program.display().to_string()
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args).stdin(Stdio::null()).kill_on_drop(true);
        cmd
    }
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in self.args.iter().take(DISPLAYED_ARGS) {
            write!(f, " {}", arg.to_string_lossy())?;
        }
        if self.args.len() > DISPLAYED_ARGS {
            write!(f, " [+ {} more]", self.args.len() - DISPLAYED_ARGS)?;
        }
        Ok(())
    }
}

/// Result of a run-to-completion call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completed {
    /// How the process ended
    pub exit: Exit,
    /// Everything written to stdout
    pub stdout: Vec<u8>,
    /// Everything written to stderr
    pub stderr: Vec<u8>,
}

impl Completed {
    /// `true` when the process exited zero and wrote something other than
    /// whitespace to stdout.
    #[must_use]
    pub fn succeeded_with_output(&self) -> bool {
        self.exit.success() && self.stdout.iter().any(|b| !b.is_ascii_whitespace())
    }

    /// Stderr as text, lossily decoded and trimmed.
    #[must_use]
    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).trim().to_string()
    }
}

/// A running process with its stdout attached as a pipe.
pub struct Streaming {
    /// The live stdout pipe
    pub stdout: Pin<Box<dyn AsyncRead + Send>>,
    /// Resolves to the exit once the process ends. Await only after `stdout`
    /// has reached end of file.
    pub exit: BoxFuture<'static, Result<Exit, Error>>,
}

impl fmt::Debug for Streaming {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Streaming").finish_non_exhaustive()
    }
}

/// Capability to run external programs.
pub trait ProcessRunner {
    /// Run `invocation` to completion, capturing stdout and stderr.
    fn run(
        &self,
        invocation: &Invocation,
    ) -> impl Future<Output = Result<Completed, Error>> + Send;

    /// Start `invocation` with stdout attached as a pipe. Stderr is
    /// discarded.
    ///
    /// # Errors
    ///
    /// Function will error if the program cannot be started.
    fn spawn(&self, invocation: &Invocation) -> Result<Streaming, Error>;
}

/// [`ProcessRunner`] backed by real operating system processes.
///
/// Children are killed if their handle is dropped, which is what enforces the
/// optional deadline on [`ProcessRunner::run`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommandRunner {
    timeout: Option<Duration>,
}

impl CommandRunner {
    /// Create a new [`CommandRunner`]. `timeout` bounds every
    /// run-to-completion call; streaming calls are unbounded.
    #[must_use]
    pub fn new(timeout: Option<Duration>) -> Self {
        Self { timeout }
    }
}

impl ProcessRunner for CommandRunner {
    async fn run(&self, invocation: &Invocation) -> Result<Completed, Error> {
        let mut cmd = invocation.command();
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        let child = cmd.spawn().map_err(|source| Error::Spawn {
            program: invocation.name(),
            source,
        })?;
        // Dropping the child on timeout kills it.
        let output = child.wait_with_output();
        let output = match self.timeout {
            Some(timeout) => time::timeout(timeout, output)
                .await
                .map_err(|_| Error::Timeout {
                    program: invocation.name(),
                    timeout,
                })?,
            None => output.await,
        }
        .map_err(|source| Error::Wait {
            program: invocation.name(),
            source,
        })?;

        Ok(Completed {
            exit: output.status.into(),
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }

    fn spawn(&self, invocation: &Invocation) -> Result<Streaming, Error> {
        let mut cmd = invocation.command();
        cmd.stdout(Stdio::piped()).stderr(Stdio::null());
        let mut child = cmd.spawn().map_err(|source| Error::Spawn {
            program: invocation.name(),
            source,
        })?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::NoStdout(invocation.name()))?;

        let program = invocation.name();
        let exit = Box::pin(async move {
            child
                .wait()
                .await
                .map(Exit::from)
                .map_err(|source| Error::Wait { program, source })
        });

        Ok(Streaming {
            stdout: Box::pin(stdout),
            exit,
        })
    }
}
