//! Coordinator: accepts worker connections, dispatches job batches, and
//! demultiplexes their results.
//!
//! One persistent TCP connection per worker. The accept loop registers each
//! connection and spawns a result-reader task for it; `assign_jobs` splits a
//! batch across the live workers and returns one deferred ticket per job.

pub mod pending;
pub mod registry;

use std::io;
use std::net::SocketAddr;
use std::ops::Range;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, ToSocketAddrs};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio_util::bytes::Bytes;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::error::DispatchError;
use crate::wire::{BatchCodec, JobBatch, JobId, ResultCodec, WireJob};
use pending::{JobTicket, PendingJobs};
use registry::{ConnectionRegistry, Liveness, WorkerId};

/// How long `assign_jobs` sleeps between live-worker checks while the pool
/// is empty.
const NO_WORKER_RETRY: Duration = Duration::from_secs(5);

/// State shared with the background tasks.
struct Shared {
    registry: ConnectionRegistry,
    pending: PendingJobs,
    reader_tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl Shared {
    fn track_reader(&self, handle: JoinHandle<()>) {
        let mut tasks = self
            .reader_tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        // Opportunistically drop bookkeeping for readers that already exited.
        tasks.retain(|task| !task.is_finished());
        tasks.push(handle);
    }

    fn abort_readers(&self) {
        let tasks = std::mem::take(
            &mut *self
                .reader_tasks
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for task in tasks {
            task.abort();
        }
    }
}

/// The coordinating side of the dispatch transport.
///
/// Owns the listening socket, the connection registry and the
/// pending-result registry. Background tasks (the accept loop and one
/// result reader per worker connection) run for the coordinator's lifetime
/// and are aborted on [`shutdown`](Self::shutdown) or drop.
pub struct Coordinator {
    shared: Arc<Shared>,
    local_addr: SocketAddr,
    /// Serializes `assign_jobs` calls process-wide and holds the job id
    /// counter they share.
    next_job_id: AsyncMutex<JobId>,
    accept_task: JoinHandle<()>,
}

impl Coordinator {
    /// Bind the listening socket and start accepting workers.
    pub async fn bind(addr: impl ToSocketAddrs) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let shared = Arc::new(Shared {
            registry: ConnectionRegistry::new(),
            pending: PendingJobs::new(),
            reader_tasks: StdMutex::new(Vec::new()),
        });

        let accept_shared = Arc::clone(&shared);
        let accept_task = tokio::spawn(accept_loop(listener, accept_shared));

        tracing::info!(%local_addr, "Listening for workers");
        Ok(Self {
            shared,
            local_addr,
            next_job_id: AsyncMutex::new(0),
            accept_task,
        })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of workers currently considered live.
    pub fn live_worker_count(&self) -> usize {
        self.shared.registry.live_count()
    }

    /// Number of jobs dispatched but not yet resolved.
    pub fn outstanding_jobs(&self) -> usize {
        self.shared.pending.outstanding()
    }

    /// Split `jobs` across the live workers and send one batch frame each.
    ///
    /// Returns one ticket per job, in submission order. Blocks until at
    /// least one live worker exists, re-checking every five seconds - an
    /// empty worker pool is backpressure, not an error. Each worker gets a
    /// contiguous slice of `len / live` jobs; the last live worker absorbs
    /// the remainder. Calls are serialized process-wide, but any number of
    /// dispatched batches may be awaiting results concurrently.
    pub async fn assign_jobs(&self, jobs: Vec<Bytes>) -> Result<Vec<JobTicket>, DispatchError> {
        if jobs.is_empty() {
            return Ok(Vec::new());
        }
        let mut next_id = self.next_job_id.lock().await;

        let workers = loop {
            let workers = self.shared.registry.live_workers();
            if !workers.is_empty() {
                break workers;
            }
            tracing::warn!(
                jobs = jobs.len(),
                retry = ?NO_WORKER_RETRY,
                "No live workers available to process jobs"
            );
            tokio::time::sleep(NO_WORKER_RETRY).await;
        };

        tracing::debug!(jobs = jobs.len(), workers = workers.len(), "Dispatching job batch");

        let mut tickets = Vec::with_capacity(jobs.len());
        for (slot, range) in partition(jobs.len(), workers.len()).into_iter().enumerate() {
            if range.is_empty() {
                continue;
            }
            let (worker, writer) = &workers[slot];

            let mut batch = JobBatch::new(Vec::with_capacity(range.len()));
            for payload in &jobs[range] {
                let id = *next_id;
                *next_id += 1;
                tickets.push(self.shared.pending.register(id));
                batch.jobs.push(WireJob {
                    id,
                    payload: payload.clone(),
                });
            }

            tracing::debug!(worker, jobs = batch.jobs.len(), "Sending batch frame");
            let mut writer = writer.lock().await;
            if let Err(source) = writer.send(batch).await {
                tracing::error!(worker, error = %source, "Batch send failed");
                self.shared.registry.transition(*worker, Liveness::SuspectedDead);
                return Err(DispatchError::Send {
                    worker: *worker,
                    source,
                });
            }
        }

        Ok(tickets)
    }

    /// Stop accepting connections and reading results. Outstanding tickets
    /// resolve with [`DispatchError::ResultChannelClosed`] once the
    /// coordinator itself is dropped.
    pub fn shutdown(&self) {
        self.accept_task.abort();
        self.shared.abort_readers();
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Contiguous slice bounds for each of `workers` workers over `jobs` jobs.
///
/// Every worker gets `jobs / workers`; the last absorbs the remainder, so
/// load is only approximately balanced.
fn partition(jobs: usize, workers: usize) -> Vec<Range<usize>> {
    let per_worker = jobs / workers;
    (0..workers)
        .map(|slot| {
            let start = slot * per_worker;
            let end = if slot == workers - 1 {
                jobs
            } else {
                start + per_worker
            };
            start..end
        })
        .collect()
}

async fn accept_loop(listener: TcpListener, shared: Arc<Shared>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let (read_half, write_half) = stream.into_split();
                let writer = FramedWrite::new(write_half, BatchCodec::new());
                let worker = shared.registry.insert(writer);
                tracing::info!(worker, %peer, "Worker connected");

                let reader = FramedRead::new(read_half, ResultCodec);
                let reader_shared = Arc::clone(&shared);
                let handle =
                    tokio::spawn(result_reader_task(worker, reader, reader_shared));
                shared.track_reader(handle);
            }
            Err(error) => {
                tracing::warn!(%error, "Failed to accept worker connection");
            }
        }
    }
}

/// Reads result frames off one worker connection and resolves the pending
/// registry. Runs until the connection closes or desynchronizes; either way
/// the worker ends up `Removed`. Its outstanding jobs are left unresolved.
async fn result_reader_task(
    worker: WorkerId,
    mut frames: FramedRead<OwnedReadHalf, ResultCodec>,
    shared: Arc<Shared>,
) {
    loop {
        match frames.next().await {
            Some(Ok(frame)) => {
                tracing::trace!(
                    worker,
                    job = frame.id,
                    len = frame.payload.len(),
                    "Result received"
                );
                if let Err(error) = shared.pending.resolve(frame.id, frame.payload) {
                    tracing::error!(worker, %error, "Protocol violation, closing connection");
                    shared.registry.transition(worker, Liveness::Removed);
                    return;
                }
            }
            Some(Err(error)) => {
                tracing::error!(worker, %error, "Result stream desynchronized, closing connection");
                shared.registry.transition(worker, Liveness::Removed);
                return;
            }
            None => {
                tracing::info!(worker, "Worker disconnected");
                shared.registry.transition(worker, Liveness::Removed);
                return;
            }
        }
    }
}
