//! Asynchronous, batched point writes
//!
//! [`WriteApi`] owns a background task. Callers push points into a bounded
//! channel and carry on; the task encodes them to line protocol, ships a batch
//! whenever `batch_size` points have accumulated or `flush_interval` has
//! passed, and retries failed batches with exponential backoff. Batches that
//! still fail are published on the error channel returned from
//! [`WriteApi::new`] and then dropped. Delivery is best effort.
//!
//! The only synchronization point is [`WriteApi::flush`]: it returns once every
//! point queued before it has been sent or reported as failed.

use std::{mem, num::NonZeroUsize, time::Duration};

use bytes::Bytes;
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
    time::{self, MissedTickBehavior},
};
use tracing::{debug, warn};

use crate::{client, point::Point};

/// Errors produced by [`WriteApi`]
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// A batch could not be delivered and was dropped.
    #[error("dropped batch of {points} points after {attempts} attempts: {source}")]
    Batch {
        /// Number of points in the dropped batch
        points: usize,
        /// Number of delivery attempts made
        attempts: u32,
        /// The final delivery failure
        #[source]
        source: client::Error,
    },
    /// The background task is gone, no further points can be accepted.
    #[error("write task is no longer running")]
    Closed,
    /// The background task panicked.
    #[error("write task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Receiving half of the asynchronous error channel.
pub type Errors = mpsc::UnboundedReceiver<Error>;

/// Batching and retry behavior for [`WriteApi`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Options {
    /// Points per network batch
    pub batch_size: NonZeroUsize,
    /// Maximum time a point waits in a partial batch
    pub flush_interval: Duration,
    /// Retries after the first failed attempt of a batch
    pub max_retries: u32,
    /// Delay before the first retry, doubled for each subsequent one
    pub retry_interval: Duration,
    /// Points that may queue ahead of the background task before
    /// [`WriteApi::write_point`] waits
    pub queue_capacity: NonZeroUsize,
}

const DEFAULT_BATCH_SIZE: NonZeroUsize = NonZeroUsize::new(50_000).expect("non-zero");
const DEFAULT_QUEUE_CAPACITY: NonZeroUsize = NonZeroUsize::new(10_000).expect("non-zero");

impl Default for Options {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            flush_interval: Duration::from_secs(1),
            max_retries: 3,
            retry_interval: Duration::from_secs(1),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

#[derive(Debug)]
enum Command {
    Point(Point),
    Flush(oneshot::Sender<()>),
}

/// Handle to the background write task.
#[derive(Debug)]
pub struct WriteApi {
    commands: mpsc::Sender<Command>,
    task: JoinHandle<()>,
}

impl WriteApi {
    /// Spawn the background write task. Must be called from within a tokio
    /// runtime.
    ///
    /// The returned [`Errors`] receives every batch that could not be
    /// delivered. It may be dropped if the caller does not care.
    #[must_use]
    pub fn new(client: client::Client, options: Options) -> (Self, Errors) {
        let (cmd_snd, cmd_rcv) = mpsc::channel(options.queue_capacity.get());
        let (err_snd, err_rcv) = mpsc::unbounded_channel();
        let batcher = Batcher {
            client,
            options,
            body: String::new(),
            points: 0,
            errors: err_snd,
        };
        let task = tokio::spawn(batcher.run(cmd_rcv));
        (
            Self {
                commands: cmd_snd,
                task,
            },
            err_rcv,
        )
    }

    /// Queue a point. Waits only if the queue is full.
    ///
    /// # Errors
    ///
    /// Function will error if the background task has stopped.
    pub async fn write_point(&self, point: Point) -> Result<(), Error> {
        self.commands
            .send(Command::Point(point))
            .await
            .map_err(|_| Error::Closed)
    }

    /// Send everything queued so far and wait until it has been delivered or
    /// reported on the error channel.
    ///
    /// # Errors
    ///
    /// Function will error if the background task has stopped.
    pub async fn flush(&self) -> Result<(), Error> {
        let (ack_snd, ack_rcv) = oneshot::channel();
        self.commands
            .send(Command::Flush(ack_snd))
            .await
            .map_err(|_| Error::Closed)?;
        ack_rcv.await.map_err(|_| Error::Closed)
    }

    /// Flush, stop the background task and wait for it to exit. The error
    /// channel closes once this returns.
    ///
    /// # Errors
    ///
    /// Function will error if the background task panicked.
    pub async fn close(self) -> Result<(), Error> {
        drop(self.commands);
        self.task.await?;
        Ok(())
    }
}

struct Batcher {
    client: client::Client,
    options: Options,
    body: String,
    points: usize,
    errors: mpsc::UnboundedSender<Error>,
}

impl Batcher {
    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        let mut interval = time::interval(self.options.flush_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        interval.tick().await;

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Point(point)) => {
                        if !point.has_fields() {
                            debug!("dropping point without fields");
                            continue;
                        }
                        match point.to_line() {
                            Ok(line) => self.body.push_str(&line),
                            Err(e) => {
                                warn!("dropping point: {e}");
                                continue;
                            }
                        }
                        self.points += 1;
                        if self.points >= self.options.batch_size.get() {
                            self.send().await;
                            interval.reset();
                        }
                    }
                    Some(Command::Flush(ack)) => {
                        self.send().await;
                        interval.reset();
                        // The flusher may have given up waiting.
                        let _ = ack.send(());
                    }
                    None => {
                        self.send().await;
                        return;
                    }
                },
                _ = interval.tick() => self.send().await,
            }
        }
    }

    async fn send(&mut self) {
        if self.points == 0 {
            return;
        }
        let points = mem::take(&mut self.points);
        let body = Bytes::from(mem::take(&mut self.body));

        let mut attempts = 0;
        let mut delay = self.options.retry_interval;
        loop {
            attempts += 1;
            match self.client.write(body.clone()).await {
                Ok(()) => {
                    debug!(points, attempts, "batch delivered");
                    return;
                }
                Err(err) if err.is_retryable() && attempts <= self.options.max_retries => {
                    warn!(
                        points,
                        attempts,
                        "batch delivery failed, retrying in {delay:?}: {err}"
                    );
                    time::sleep(delay).await;
                    delay = delay.saturating_mul(2);
                }
                Err(source) => {
                    // Nobody listening is fine, the failure is best effort.
                    let _ = self.errors.send(Error::Batch {
                        points,
                        attempts,
                        source,
                    });
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    };

    use super::*;
    use warp::Filter;

    fn client(addr: std::net::SocketAddr) -> client::Client {
        client::Client::new(client::Config {
            url: format!("http://{addr}"),
            token: "t".to_string(),
            org: "o".to_string(),
            bucket: "b".to_string(),
            request_timeout: Duration::from_secs(5),
        })
        .expect("client")
    }

    fn point(ts: i64) -> Point {
        let mut p = Point::new("m", ts).tag("product_type", "SERVER1");
        p.add_field("f", 1.0);
        p
    }

    fn options(batch_size: usize) -> Options {
        Options {
            batch_size: NonZeroUsize::new(batch_size).expect("non-zero"),
            flush_interval: Duration::from_secs(3600),
            max_retries: 2,
            retry_interval: Duration::from_millis(10),
            queue_capacity: NonZeroUsize::new(16).expect("non-zero"),
        }
    }

    #[tokio::test]
    async fn full_batches_ship_and_flush_sends_the_remainder() {
        let bodies: Arc<Mutex<Vec<String>>> = Arc::default();
        let record = Arc::clone(&bodies);
        let route = warp::path!("api" / "v2" / "write")
            .and(warp::body::bytes())
            .map(move |body: bytes::Bytes| {
                record
                    .lock()
                    .expect("mutex poisoned")
                    .push(String::from_utf8_lossy(&body).into_owned());
                warp::reply::with_status("", warp::http::StatusCode::NO_CONTENT)
            });
        let (addr, serve) = warp::serve(route).bind_ephemeral(([127, 0, 0, 1], 0));
        let _server = tokio::spawn(serve);

        let (api, mut errors) = WriteApi::new(client(addr), options(2));
        for ts in 0..5 {
            api.write_point(point(ts)).await.expect("queued");
        }
        api.flush().await.expect("flushed");

        {
            let bodies = bodies.lock().expect("mutex poisoned");
            let lines: Vec<usize> = bodies.iter().map(|b| b.lines().count()).collect();
            assert_eq!(lines, vec![2, 2, 1]);
        }
        api.close().await.expect("closed");
        assert!(errors.recv().await.is_none());
    }

    #[tokio::test]
    async fn server_errors_are_retried_then_reported() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let route = warp::path!("api" / "v2" / "write").map(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            warp::reply::with_status("down", warp::http::StatusCode::SERVICE_UNAVAILABLE)
        });
        let (addr, serve) = warp::serve(route).bind_ephemeral(([127, 0, 0, 1], 0));
        let _server = tokio::spawn(serve);

        let (api, mut errors) = WriteApi::new(client(addr), options(10));
        api.write_point(point(1)).await.expect("queued");
        api.flush().await.expect("flushed");

        match errors.recv().await {
            Some(Error::Batch {
                points, attempts, ..
            }) => {
                assert_eq!(points, 1);
                assert_eq!(attempts, 3);
            }
            other => panic!("expected a dropped batch, got {other:?}"),
        }
        assert_eq!(hits.load(Ordering::SeqCst), 3);
        api.close().await.expect("closed");
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let route = warp::path!("api" / "v2" / "write").map(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            warp::reply::with_status("bad", warp::http::StatusCode::BAD_REQUEST)
        });
        let (addr, serve) = warp::serve(route).bind_ephemeral(([127, 0, 0, 1], 0));
        let _server = tokio::spawn(serve);

        let (api, mut errors) = WriteApi::new(client(addr), options(10));
        api.write_point(point(1)).await.expect("queued");
        api.close().await.expect("closed");

        assert!(matches!(
            errors.recv().await,
            Some(Error::Batch { attempts: 1, .. })
        ));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn points_without_fields_are_dropped() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let route = warp::path!("api" / "v2" / "write").map(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            warp::reply::with_status("", warp::http::StatusCode::NO_CONTENT)
        });
        let (addr, serve) = warp::serve(route).bind_ephemeral(([127, 0, 0, 1], 0));
        let _server = tokio::spawn(serve);

        let (api, _errors) = WriteApi::new(client(addr), options(1));
        api.write_point(Point::new("m", 1)).await.expect("queued");
        api.flush().await.expect("flushed");
        api.close().await.expect("closed");

        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }
}
