//! Bookkeeping for worker connections.

use std::sync::{Arc, Mutex, PoisonError};

use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::codec::FramedWrite;

use crate::wire::BatchCodec;

/// Stable handle for one worker connection: its insertion index.
///
/// Never reused, even after the connection dies, so an id held elsewhere
/// can never silently start referring to a different worker.
pub type WorkerId = usize;

/// Shared framed writer for one worker's batch stream. The async lock
/// serializes whole-frame sends.
pub type BatchWriter = Arc<AsyncMutex<FramedWrite<OwnedWriteHalf, BatchCodec>>>;

/// Liveness of one worker connection.
///
/// Transitions only move forward: `Live -> SuspectedDead -> Removed`.
/// Suspected-dead marks a worker that failed a send but whose socket has
/// not been observed closed yet; removed means the connection is gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Live,
    SuspectedDead,
    Removed,
}

impl Liveness {
    fn rank(self) -> u8 {
        match self {
            Liveness::Live => 0,
            Liveness::SuspectedDead => 1,
            Liveness::Removed => 2,
        }
    }
}

struct ConnectionEntry {
    /// `None` once the worker is removed: dropping the write half sends
    /// FIN, so the peer observes the connection closing.
    writer: Option<BatchWriter>,
    liveness: Liveness,
}

/// Append-only table of worker connections.
///
/// Entries are appended on accept and transitioned on liveness changes,
/// never deleted, which keeps `WorkerId`s stable for the process lifetime.
/// The table lock is held only for bookkeeping; sends go through the
/// per-entry [`BatchWriter`] outside it.
pub struct ConnectionRegistry {
    entries: Mutex<Vec<ConnectionEntry>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<ConnectionEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a new live connection, returning its stable id.
    pub fn insert(&self, writer: FramedWrite<OwnedWriteHalf, BatchCodec>) -> WorkerId {
        let mut entries = self.lock();
        let id = entries.len();
        entries.push(ConnectionEntry {
            writer: Some(Arc::new(AsyncMutex::new(writer))),
            liveness: Liveness::Live,
        });
        id
    }

    /// Advance a connection's liveness. Backward transitions are ignored.
    ///
    /// Reaching `Removed` releases the entry's writer, closing the
    /// connection so the worker sees EOF instead of writing into a socket
    /// nobody reads.
    pub fn transition(&self, id: WorkerId, to: Liveness) {
        let mut entries = self.lock();
        let Some(entry) = entries.get_mut(id) else {
            tracing::warn!(worker = id, "Liveness transition for unknown worker");
            return;
        };
        if to.rank() <= entry.liveness.rank() {
            return;
        }
        tracing::info!(worker = id, from = ?entry.liveness, to = ?to, "Worker liveness changed");
        entry.liveness = to;
        if to == Liveness::Removed {
            entry.writer = None;
        }
    }

    pub fn liveness(&self, id: WorkerId) -> Option<Liveness> {
        self.lock().get(id).map(|entry| entry.liveness)
    }

    /// Ids and writers of all live workers, in id order.
    pub fn live_workers(&self) -> Vec<(WorkerId, BatchWriter)> {
        self.lock()
            .iter()
            .enumerate()
            .filter(|(_, entry)| entry.liveness == Liveness::Live)
            .filter_map(|(id, entry)| entry.writer.as_ref().map(|w| (id, Arc::clone(w))))
            .collect()
    }

    pub fn live_count(&self) -> usize {
        self.lock()
            .iter()
            .filter(|entry| entry.liveness == Liveness::Live)
            .count()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::{TcpListener, TcpStream};

    /// A framed write half backed by a real loopback socket. The returned
    /// peer stream keeps the connection open for the test's duration.
    async fn framed_writer() -> (FramedWrite<OwnedWriteHalf, BatchCodec>, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (peer, _) = listener.accept().await.unwrap();
        let (_read, write) = client.into_split();
        (FramedWrite::new(write, BatchCodec::new()), peer)
    }

    #[tokio::test]
    async fn ids_are_sequential_and_stable() {
        let registry = ConnectionRegistry::new();
        let (w1, _p1) = framed_writer().await;
        let (w2, _p2) = framed_writer().await;

        assert_eq!(registry.insert(w1), 0);
        assert_eq!(registry.insert(w2), 1);

        registry.transition(0, Liveness::Removed);
        let (w3, _p3) = framed_writer().await;
        // Dead entries are never reclaimed, so ids keep growing.
        assert_eq!(registry.insert(w3), 2);
    }

    #[tokio::test]
    async fn live_workers_excludes_non_live_entries() {
        let registry = ConnectionRegistry::new();
        let (w1, _p1) = framed_writer().await;
        let (w2, _p2) = framed_writer().await;
        let (w3, _p3) = framed_writer().await;
        registry.insert(w1);
        registry.insert(w2);
        registry.insert(w3);

        registry.transition(1, Liveness::SuspectedDead);
        registry.transition(2, Liveness::Removed);

        let live: Vec<WorkerId> = registry.live_workers().iter().map(|(id, _)| *id).collect();
        assert_eq!(live, vec![0]);
        assert_eq!(registry.live_count(), 1);
    }

    #[tokio::test]
    async fn liveness_only_moves_forward() {
        let registry = ConnectionRegistry::new();
        let (writer, _peer) = framed_writer().await;
        let id = registry.insert(writer);

        registry.transition(id, Liveness::Removed);
        registry.transition(id, Liveness::Live);
        registry.transition(id, Liveness::SuspectedDead);
        assert_eq!(registry.liveness(id), Some(Liveness::Removed));
    }

    #[tokio::test]
    async fn removed_worker_connection_is_closed() {
        use tokio::io::AsyncReadExt;

        let registry = ConnectionRegistry::new();
        let (writer, mut peer) = framed_writer().await;
        let id = registry.insert(writer);

        registry.transition(id, Liveness::Removed);

        // The registry held the only writer handle, so removal drops the
        // write half and the peer reads EOF.
        let mut buf = [0u8; 1];
        assert_eq!(peer.read(&mut buf).await.unwrap(), 0);
        assert!(registry.live_workers().is_empty());
    }

    #[tokio::test]
    async fn unknown_worker_transition_is_ignored() {
        let registry = ConnectionRegistry::new();
        registry.transition(7, Liveness::Removed);
        assert_eq!(registry.liveness(7), None);
    }
}
