//! Worker runtime: pulls job batches off the single coordinator connection
//! and executes them on a bounded pool, writing each result back over the
//! same connection as it finishes.
//!
//! Admission is semaphore-gated: the frame reader holds off on the next job
//! while the pool is full, so in-flight executions never exceed the
//! configured concurrency. Results may be written out of admission order.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::{Mutex as AsyncMutex, Semaphore};
use tokio_util::bytes::Bytes;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::error::WorkerError;
use crate::wire::{BatchCodec, ResultCodec, ResultFrame, WireJob};

/// Shared framed writer for the result stream. The lock serializes
/// whole-frame sends so results from concurrent jobs never interleave.
type ResultWriter = Arc<AsyncMutex<FramedWrite<OwnedWriteHalf, ResultCodec>>>;

/// Executes one job's payload into its result bytes.
///
/// Invoked once per received job, concurrently up to the configured limit.
/// A panic in the handler is not caught and takes the worker down.
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    async fn run(&self, payload: Bytes) -> Bytes;
}

/// Adapter for synchronous, CPU-bound handlers (e.g. a simulation run).
///
/// Runs the closure on the blocking thread pool so a long job cannot stall
/// the frame reader or the other job tasks.
pub struct BlockingHandler<F> {
    f: Arc<F>,
}

impl<F> BlockingHandler<F>
where
    F: Fn(Bytes) -> Bytes + Send + Sync + 'static,
{
    pub fn new(f: F) -> Self {
        Self { f: Arc::new(f) }
    }
}

#[async_trait]
impl<F> JobHandler for BlockingHandler<F>
where
    F: Fn(Bytes) -> Bytes + Send + Sync + 'static,
{
    async fn run(&self, payload: Bytes) -> Bytes {
        let f = Arc::clone(&self.f);
        match tokio::task::spawn_blocking(move || f(payload)).await {
            Ok(result) => result,
            // Propagate a handler panic instead of swallowing it.
            Err(join_error) => std::panic::resume_unwind(join_error.into_panic()),
        }
    }
}

/// Worker runtime settings, supplied by the embedding application.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Coordinator endpoint, `host:port`.
    pub coordinator_addr: String,
    /// Maximum number of jobs executing at once.
    pub concurrency: usize,
    /// Delay between connection attempts while the coordinator is down.
    pub retry_delay: Duration,
}

impl WorkerConfig {
    /// Defaults: one job per available core, five seconds between
    /// connection attempts.
    pub fn new(coordinator_addr: impl Into<String>) -> Self {
        Self {
            coordinator_addr: coordinator_addr.into(),
            concurrency: std::thread::available_parallelism()
                .map(usize::from)
                .unwrap_or(1),
            retry_delay: Duration::from_secs(5),
        }
    }
}

/// Run the worker loop over a single coordinator connection.
///
/// Connects with indefinite retry (the worker is patient about the
/// coordinator not being up yet), then executes jobs until the coordinator
/// closes the connection or the stream desynchronizes. Reconnecting after a
/// mid-life disconnect is the embedding application's decision.
pub async fn run_worker<H: JobHandler>(
    handler: Arc<H>,
    config: WorkerConfig,
) -> Result<(), WorkerError> {
    let stream = connect_with_retry(&config.coordinator_addr, config.retry_delay).await;
    let (read_half, write_half) = stream.into_split();
    let mut batches = FramedRead::new(read_half, BatchCodec::new());
    let writer: ResultWriter = Arc::new(AsyncMutex::new(FramedWrite::new(
        write_half,
        ResultCodec,
    )));
    let permits = Arc::new(Semaphore::new(config.concurrency.max(1)));

    loop {
        let job = match batches.next().await {
            Some(Ok(job)) => job,
            Some(Err(error)) => {
                tracing::error!(%error, "Job stream desynchronized");
                return Err(error.into());
            }
            None => {
                tracing::info!("Coordinator closed the connection");
                return Err(WorkerError::ConnectionClosed);
            }
        };

        // Admission control: hold the frame reader until a slot frees up.
        let permit = Arc::clone(&permits)
            .acquire_owned()
            .await
            .expect("job semaphore is never closed");
        tracing::trace!(job = job.id, len = job.payload.len(), "Job admitted");

        let handler = Arc::clone(&handler);
        let writer = Arc::clone(&writer);
        tokio::spawn(async move {
            let _permit = permit;
            execute_job(job, handler, writer).await;
        });
    }
}

async fn connect_with_retry(addr: &str, retry_delay: Duration) -> TcpStream {
    loop {
        match TcpStream::connect(addr).await {
            Ok(stream) => {
                tracing::info!(%addr, "Connected to coordinator");
                return stream;
            }
            Err(error) => {
                tracing::warn!(%addr, %error, retry = ?retry_delay, "Could not connect to coordinator");
                tokio::time::sleep(retry_delay).await;
            }
        }
    }
}

async fn execute_job<H: JobHandler>(job: WireJob, handler: Arc<H>, writer: ResultWriter) {
    let id = job.id;
    let payload = handler.run(job.payload).await;
    tracing::trace!(job = id, len = payload.len(), "Job finished");

    let mut writer = writer.lock().await;
    if let Err(error) = writer.send(ResultFrame { id, payload }).await {
        tracing::error!(job = id, %error, "Failed to send result");
    }
}
