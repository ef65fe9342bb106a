//! Error taxonomy for the dispatch transport.
//!
//! Three layers: [`ProtocolError`] for wire-level desynchronization (always
//! fatal for the connection it occurred on), [`DispatchError`] for
//! coordinator-side dispatch and result retrieval, [`WorkerError`] for the
//! worker runtime. Transient conditions - no live workers, a coordinator
//! that is not up yet - are handled by retry loops and never surface here.

use std::io;

use crate::coordinator::registry::WorkerId;
use crate::wire::JobId;

/// Wire-level failures.
///
/// Once a frame's declared lengths disagree with the bytes on the stream
/// there is no way to find the next frame boundary, so any of these closes
/// the offending connection rather than attempting resynchronization.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("bad {field} header field: {content:?}")]
    BadHeaderField { field: &'static str, content: String },

    #[error("declared length {declared} exceeds the frame cap")]
    FrameTooLarge { declared: u64 },

    #[error("item declares {declared} payload bytes but the batch item width is {item_len}")]
    ItemOverflow { declared: u64, item_len: u64 },

    #[error("batch declares item width {declared}, below the {min}-byte item header")]
    ItemTooNarrow { declared: u64, min: u64 },

    #[error("value {value} does not fit the {field} header field")]
    FieldOverflow { field: &'static str, value: u64 },

    #[error("result for unknown or already-resolved job {0}")]
    UnknownJob(JobId),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl ProtocolError {
    pub(crate) fn bad_field(field: &'static str, raw: &[u8]) -> Self {
        Self::BadHeaderField {
            field,
            content: String::from_utf8_lossy(raw).into_owned(),
        }
    }
}

/// Coordinator-side dispatch failures.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// Writing a batch frame to a worker failed. The worker is marked
    /// suspected-dead and the whole `assign_jobs` call fails; jobs are not
    /// rebalanced onto other workers.
    #[error("failed to send batch to worker {worker}: {source}")]
    Send {
        worker: WorkerId,
        source: ProtocolError,
    },

    /// The opt-in wait bound elapsed before the result arrived.
    #[error("timed out waiting for the result of job {0}")]
    WaitTimeout(JobId),

    /// The pending entry vanished without being resolved. This indicates a
    /// logic bug (or a dropped coordinator), not a runtime condition.
    #[error("result channel for job {0} closed before a result arrived")]
    ResultChannelClosed(JobId),
}

/// Worker-side runtime failures.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The coordinator closed the connection. Whether to reconnect is the
    /// embedding application's decision.
    #[error("coordinator closed the connection")]
    ConnectionClosed,

    #[error(transparent)]
    Io(#[from] io::Error),
}
