//! Shared Control State
//!
//! Small per-node state exposing the pause flag, the current election term,
//! the voting status and the announced winner. Written only by this node's
//! monitor/voting engine and by commands executed on this node (including
//! those arriving over the Remote Command Channel); read by the monitor loop
//! at every iteration.
//!
//! The storage backend is injected: memory for tests and the simulation, a
//! checksummed file for production.

mod state;
mod store;

pub use state::{ControlRecord, ElectionState, VotingStatus};
pub use store::{ControlStore, FileControlStore, MemoryControlStore};

use std::sync::{Arc, Mutex};

use uuid::Uuid;

use crate::error::ClusterResult;
use crate::registry::{EventRecord, NodeId};

/// Handle to one node's control state.
///
/// Read-modify-write cycles are serialised within the process; no lock is
/// held across anything but the store call itself.
#[derive(Clone)]
pub struct ControlState {
    store: Arc<dyn ControlStore>,
    write_lock: Arc<Mutex<()>>,
}

impl ControlState {
    pub fn new(store: Arc<dyn ControlStore>) -> Self {
        Self {
            store,
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Control state backed by memory.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryControlStore::new()))
    }

    /// Current record.
    pub fn snapshot(&self) -> ClusterResult<ControlRecord> {
        self.store.load()
    }

    fn modify<T>(&self, f: impl FnOnce(&mut ControlRecord) -> T) -> ClusterResult<T> {
        let _guard = self.write_lock.lock().unwrap_or_else(|p| p.into_inner());
        let mut record = self.store.load()?;
        let result = f(&mut record);
        self.store.store(&record)?;
        Ok(result)
    }

    pub fn is_paused(&self) -> ClusterResult<bool> {
        Ok(self.store.load()?.paused)
    }

    /// Set the pause flag; returns the previous value.
    pub fn set_paused(&self, paused: bool) -> ClusterResult<bool> {
        self.modify(|r| std::mem::replace(&mut r.paused, paused))
    }

    /// Start a new election past every term in `seen` and return its term.
    pub fn start_election(&self, seen: u64) -> ClusterResult<u64> {
        self.modify(|r| r.election.start(seen))
    }

    /// Announce the winner of the current term.
    pub fn announce(&self, winner: NodeId, won: bool) -> ClusterResult<()> {
        self.modify(|r| r.election.decide(winner, won))
    }

    /// Store a follow directive; returns false if it was stale.
    pub fn receive_follow(&self, leader: NodeId, term: u64) -> ClusterResult<bool> {
        self.modify(|r| r.election.receive_follow(leader, term))
    }

    /// Outstanding follow directive, if any.
    pub fn pending_follow(&self) -> ClusterResult<Option<NodeId>> {
        Ok(self.store.load()?.election.pending_follow())
    }

    /// End the election, keeping the term.
    pub fn reset_election(&self) -> ClusterResult<()> {
        self.modify(|r| r.election.reset())
    }

    /// Keep an event until a registry accepts it.
    pub fn defer_event(&self, event: EventRecord) -> ClusterResult<()> {
        self.modify(|r| r.deferred_events.push(event))
    }

    /// Deferred events, oldest first.
    pub fn deferred_events(&self) -> ClusterResult<Vec<EventRecord>> {
        Ok(self.store.load()?.deferred_events)
    }

    /// Forget the deferred events with these ids once they are written.
    pub fn discard_deferred(&self, written: &[Uuid]) -> ClusterResult<()> {
        self.modify(|r| r.deferred_events.retain(|e| !written.contains(&e.id)))
    }
}
