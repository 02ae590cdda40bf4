//! The connection table: maps a sub-connection's `ComKey` (`sk`, `uk`) to its
//! live half of a TCP socket.
//!
//! The original engine hashes a `ComKey` on `sk` alone and compares on both
//! fields, so a hangup (which only knows the local socket's `sk`) can find
//! its entry without the `uk` half of the name. Every reader task here
//! closes over the full `ComKey` it was spawned with instead of a bare `sk`
//! (see `spawn_sub_reader` in `engine.rs`), so a hangup already carries the
//! complete key by the time it reaches the table -- there is no code path
//! that only has `sk` to look up with, and no secondary index is kept (see
//! design note in DESIGN.md).

use std::collections::HashMap;

use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::task::JoinHandle;

use super::bridge::BridgeProtocol;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ComKey {
    pub sk: u64,
    pub uk: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubState {
    /// Client only: accepted locally, `CONNECT` sent, awaiting `TCP_ESTABLISHED`.
    Pending,
    Established,
}

pub struct SubConnection {
    pub state: SubState,
    pub bridge: u16,
    pub protocol: BridgeProtocol,
    pub writer: OwnedWriteHalf,
    /// The read-side task forwarding bytes/hangup back to the engine. `None`
    /// while `state == Pending`: the original leaves the accepted socket's
    /// poll events at zero until `TCP_ESTABLISHED` arrives, so we hold the
    /// read half unread rather than spawn a task against it early.
    pub reader_task: Option<JoinHandle<()>>,
    /// The read half waiting to be handed to a reader task once established.
    pub pending_reader: Option<OwnedReadHalf>,
}

impl Drop for SubConnection {
    fn drop(&mut self) {
        if let Some(task) = &self.reader_task {
            task.abort();
        }
    }
}

#[derive(Default)]
pub struct ConnectionTable {
    by_key: HashMap<ComKey, SubConnection>,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: ComKey, conn: SubConnection) {
        self.by_key.insert(key, conn);
    }

    pub fn get(&self, key: &ComKey) -> Option<&SubConnection> {
        self.by_key.get(key)
    }

    pub fn get_mut(&mut self, key: &ComKey) -> Option<&mut SubConnection> {
        self.by_key.get_mut(key)
    }

    pub fn remove(&mut self, key: &ComKey) -> Option<SubConnection> {
        self.by_key.remove(key)
    }

    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }

    pub fn clear(&mut self) {
        self.by_key.clear();
    }

    pub fn keys(&self) -> impl Iterator<Item = &ComKey> {
        self.by_key.keys()
    }
}

/// Monotonic `uk` allocator, owned by the client (see §3: "a monotonically
/// increasing counter assigned by the client side").
#[derive(Default)]
pub struct UkAllocator {
    next: u64,
}

impl UkAllocator {
    pub fn new() -> Self {
        Self { next: 0 }
    }

    pub fn alloc(&mut self) -> u64 {
        let uk = self.next;
        self.next += 1;
        uk
    }
}

/// Stands in for the raw socket descriptor the original uses as `sk`: a
/// per-role monotonic counter, opaque to the peer and unique among
/// currently-live sub-connections on this side, which is all §3 requires of
/// it.
#[derive(Default)]
pub struct SkAllocator {
    next: u64,
}

impl SkAllocator {
    pub fn new() -> Self {
        Self { next: 0 }
    }

    pub fn alloc(&mut self) -> u64 {
        let sk = self.next;
        self.next += 1;
        sk
    }
}
