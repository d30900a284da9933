//! Peer contract and registry bookkeeping.
//!
//! The synchronizer does not own a transport; it talks to peers through the
//! [`SnapPeer`] contract and tracks their availability per request class.
//! A peer is idle or busy independently for every class, and a peer that
//! answered a well-formed request with an empty response is marked stateless
//! and skipped by every assigner for the remainder of the cycle.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use ethereum_types::H256;

use crate::error::PeerError;
use crate::trie::TriePath;

/// The five classes of outstanding network requests. Idleness, live-request
/// tracking and failure channels are all segregated by class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    AccountRange,
    ByteCodes,
    StorageRanges,
    TrienodeHeal,
    BytecodeHeal,
}

impl RequestKind {
    pub const COUNT: usize = 5;

    pub(crate) fn index(self) -> usize {
        match self {
            RequestKind::AccountRange => 0,
            RequestKind::ByteCodes => 1,
            RequestKind::StorageRanges => 2,
            RequestKind::TrienodeHeal => 3,
            RequestKind::BytecodeHeal => 4,
        }
    }
}

/// A remote data source able to serve snapshot retrieval requests.
///
/// Every request method takes a caller-chosen 64-bit request id; the
/// transport only delivers callbacks, which are correlated back to their
/// originating request through that id. The methods return once the request
/// has been handed to the wire, not once it has been answered.
#[async_trait]
pub trait SnapPeer: Clone + Send + Sync + 'static {
    /// The peer's unique identifier.
    fn id(&self) -> H256;

    /// Fetch a batch of accounts rooted in a specific account trie, starting
    /// at `origin` and not crossing `limit`.
    async fn request_account_range(
        &self,
        id: u64,
        root: H256,
        origin: H256,
        limit: H256,
        bytes: u64,
    ) -> Result<(), PeerError>;

    /// Fetch batches of storage slots belonging to one or more accounts. If
    /// slots of a single account are requested, an origin/limit window may
    /// be given to retrieve a sub-range.
    async fn request_storage_ranges(
        &self,
        id: u64,
        root: H256,
        accounts: Vec<H256>,
        origin: Option<H256>,
        limit: Option<H256>,
        bytes: u64,
    ) -> Result<(), PeerError>;

    /// Fetch a batch of bytecodes by hash.
    async fn request_byte_codes(
        &self,
        id: u64,
        hashes: Vec<H256>,
        bytes: u64,
    ) -> Result<(), PeerError>;

    /// Fetch a batch of account or storage trie nodes rooted in a specific
    /// state trie, addressed by path.
    async fn request_trie_nodes(
        &self,
        id: u64,
        root: H256,
        paths: Vec<TriePath>,
        bytes: u64,
    ) -> Result<(), PeerError>;
}

/// Registry of currently connected peers together with their per-class idle
/// markers and the cycle-local stateless set. Lives behind the syncer's
/// shared lock; never touched off the lock.
pub(crate) struct PeerPool<P> {
    peers: HashMap<H256, P>,
    stateless: HashSet<H256>,
    idlers: [HashSet<H256>; RequestKind::COUNT],
}

impl<P: SnapPeer> PeerPool<P> {
    pub(crate) fn new() -> Self {
        Self {
            peers: HashMap::new(),
            stateless: HashSet::new(),
            idlers: Default::default(),
        }
    }

    /// Inserts a new peer and marks it idle for every request class, even if
    /// no sync is running.
    pub(crate) fn register(&mut self, peer: P) -> Result<H256, PeerError> {
        let id = peer.id();
        if self.peers.contains_key(&id) {
            return Err(PeerError::AlreadyRegistered(id));
        }
        self.peers.insert(id, peer);
        for idlers in &mut self.idlers {
            idlers.insert(id);
        }
        Ok(id)
    }

    /// Removes all traces of a peer, including status markers.
    pub(crate) fn unregister(&mut self, id: H256) -> Result<(), PeerError> {
        if self.peers.remove(&id).is_none() {
            return Err(PeerError::NotRegistered(id));
        }
        self.stateless.remove(&id);
        for idlers in &mut self.idlers {
            idlers.remove(&id);
        }
        Ok(())
    }

    pub(crate) fn get(&self, id: &H256) -> Option<&P> {
        self.peers.get(id)
    }

    pub(crate) fn has_idlers(&self, kind: RequestKind) -> bool {
        !self.idlers[kind.index()].is_empty()
    }

    /// First idle peer for the class that has not rejected a query this
    /// cycle. Does not consume the idle marker.
    pub(crate) fn first_idle(&self, kind: RequestKind) -> Option<H256> {
        self.idlers[kind.index()]
            .iter()
            .find(|id| !self.stateless.contains(id))
            .copied()
    }

    /// Removes the idle marker once a request has been assigned to the peer.
    pub(crate) fn set_busy(&mut self, kind: RequestKind, id: H256) {
        self.idlers[kind.index()].remove(&id);
    }

    /// Re-marks a peer as idle for the class, if it is still registered.
    pub(crate) fn set_idle(&mut self, kind: RequestKind, id: H256) {
        if self.peers.contains_key(&id) {
            self.idlers[kind.index()].insert(id);
        }
    }

    /// Flags a peer as unable to serve state for the rest of the cycle.
    pub(crate) fn set_stateless(&mut self, id: H256) {
        self.stateless.insert(id);
    }

    /// Drops the stateless markers at the start of a new cycle.
    pub(crate) fn reset_stateless(&mut self) {
        self.stateless.clear();
    }
}
