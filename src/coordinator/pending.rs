//! Correlation between outstanding jobs and asynchronously arriving results.

use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::oneshot;
use tokio_util::bytes::Bytes;

use crate::error::{DispatchError, ProtocolError};
use crate::wire::JobId;

/// Registry of jobs dispatched but not yet resolved.
///
/// Single producer (the connection reader that saw the result frame),
/// single consumer (the one ticket awaiting that job). The oneshot channel
/// is the completion signal; removing the sender on resolve makes a
/// duplicate result structurally detectable.
pub struct PendingJobs {
    inner: DashMap<JobId, oneshot::Sender<Bytes>>,
}

impl PendingJobs {
    pub fn new() -> Self {
        Self {
            inner: DashMap::new(),
        }
    }

    /// Register a dispatched job, producing its caller-visible ticket.
    pub fn register(&self, id: JobId) -> JobTicket {
        let (tx, rx) = oneshot::channel();
        let previous = self.inner.insert(id, tx);
        debug_assert!(previous.is_none(), "job id {id} reused");
        JobTicket { id, rx }
    }

    /// Deliver a result, releasing the matching ticket.
    ///
    /// A result for a job that was never registered, or was already
    /// resolved, is a protocol violation.
    pub fn resolve(&self, id: JobId, payload: Bytes) -> Result<(), ProtocolError> {
        let (_, tx) = self
            .inner
            .remove(&id)
            .ok_or(ProtocolError::UnknownJob(id))?;
        // A dropped ticket means the caller discarded the result; that is
        // their choice, not an error.
        let _ = tx.send(payload);
        Ok(())
    }

    /// Number of jobs dispatched but not yet resolved.
    pub fn outstanding(&self) -> usize {
        self.inner.len()
    }
}

impl Default for PendingJobs {
    fn default() -> Self {
        Self::new()
    }
}

/// Deferred handle to one job's result.
///
/// Resolves when the worker's result frame arrives. If the worker
/// disappears first, [`wait`](Self::wait) pends forever - outstanding jobs
/// are not rebalanced or failed. Callers that need an upper bound opt in
/// with [`wait_timeout`](Self::wait_timeout).
#[derive(Debug)]
pub struct JobTicket {
    id: JobId,
    rx: oneshot::Receiver<Bytes>,
}

impl JobTicket {
    pub fn id(&self) -> JobId {
        self.id
    }

    /// Wait for the result, indefinitely.
    pub async fn wait(self) -> Result<Bytes, DispatchError> {
        let id = self.id;
        self.rx
            .await
            .map_err(|_| DispatchError::ResultChannelClosed(id))
    }

    /// Wait for the result, giving up after `limit`.
    pub async fn wait_timeout(self, limit: Duration) -> Result<Bytes, DispatchError> {
        let id = self.id;
        match tokio::time::timeout(limit, self.rx).await {
            Ok(Ok(payload)) => Ok(payload),
            Ok(Err(_)) => Err(DispatchError::ResultChannelClosed(id)),
            Err(_) => Err(DispatchError::WaitTimeout(id)),
        }
    }
}
