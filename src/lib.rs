//! jobfarm: distributes opaque job payloads from one coordinating process to
//! a pool of remote workers over plain TCP and collects their results
//! asynchronously.
//!
//! The coordinator treats connected workers as an elastic pool: a batch of
//! jobs submitted through [`Coordinator::assign_jobs`] is split across the
//! live workers and one [`JobTicket`] per job is returned, resolving as
//! workers finish. The worker side runs each received job on a bounded pool
//! and writes framed results back over the same connection.
//!
//! Architecture:
//! - [`wire`]: framing shared by both roles (job batch and result frames)
//! - [`coordinator`]: connection acceptance, batch dispatch, result demux
//! - [`worker`]: the remote execution loop driving a [`JobHandler`]

pub mod coordinator;
pub mod error;
pub mod wire;
pub mod worker;

pub use coordinator::Coordinator;
pub use coordinator::pending::JobTicket;
pub use coordinator::registry::{Liveness, WorkerId};
pub use error::{DispatchError, ProtocolError, WorkerError};
pub use wire::JobId;
pub use worker::{BlockingHandler, JobHandler, WorkerConfig, run_worker};
