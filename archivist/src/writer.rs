//! Points out to the store
//!
//! [`BatchedWriter`] is the write session for one archive. It feeds
//! [`WriteApi`], which batches and retries on its own task, and runs a second
//! task that drains the write-error channel for as long as the session lives.
//! Write errors never reach the exporter; they are logged and counted.

use archivist_influx::{Client, Point, WriteApi, write};
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Errors produced by [`PointSink`] implementations
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Wrapper around [`write::Error`].
    #[error(transparent)]
    Write(#[from] write::Error),
}

/// Somewhere converted points go.
pub trait PointSink {
    /// Accept one point. May wait for queue space but not for delivery.
    fn write_point(&mut self, point: Point) -> impl Future<Output = Result<(), Error>> + Send;
}

/// Outcome of a write session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Summary {
    /// Points accepted from the exporter
    pub points: u64,
    /// Batches the store client gave up on
    pub failed_batches: u64,
}

/// Batched, best-effort write session.
#[derive(Debug)]
pub struct BatchedWriter {
    api: WriteApi,
    drain: JoinHandle<u64>,
    points: u64,
}

impl BatchedWriter {
    /// Start a session against `client`. Must be called from within a tokio
    /// runtime.
    #[must_use]
    pub fn new(client: Client, options: write::Options) -> Self {
        let (api, errors) = WriteApi::new(client, options);
        Self {
            api,
            drain: tokio::spawn(drain_errors(errors)),
            points: 0,
        }
    }

    /// Block until every point written so far has been sent or reported as
    /// failed.
    ///
    /// # Errors
    ///
    /// Function will error if the write task has stopped.
    pub async fn flush(&self) -> Result<(), Error> {
        self.api.flush().await?;
        Ok(())
    }

    /// Flush, end the session and wait for the error drain to finish.
    ///
    /// # Errors
    ///
    /// Function will error if the write task has stopped or panicked.
    pub async fn finish(self) -> Result<Summary, Error> {
        let flushed = self.api.flush().await;
        let closed = self.api.close().await;
        // The drain ends once the write task has dropped its error sender.
        let failed_batches = self
            .drain
            .await
            .map_err(|e| Error::Write(write::Error::Join(e)))?;
        flushed?;
        closed?;

        info!(
            points = self.points,
            failed_batches, "write session finished"
        );
        Ok(Summary {
            points: self.points,
            failed_batches,
        })
    }
}

impl PointSink for BatchedWriter {
    async fn write_point(&mut self, point: Point) -> Result<(), Error> {
        self.api.write_point(point).await?;
        self.points += 1;
        Ok(())
    }
}

async fn drain_errors(mut errors: write::Errors) -> u64 {
    let mut failed = 0;
    while let Some(e) = errors.recv().await {
        failed += 1;
        metrics::counter!("write_errors").increment(1);
        error!("store write failed: {e}");
    }
    failed
}
