//! Snapshot-based state trie synchronizer.
//!
//! The syncer downloads the entire leaf-level state of an
//! account-and-storage trie (accounts, contract bytecodes, storage slots)
//! from a dynamic set of peers speaking a request/response snapshot
//! protocol, reassembles the interior trie nodes from Merkle range proofs,
//! and then heals the residual gaps left by chunked retrieval by fetching
//! missing interior nodes directly.
//!
//! A single event loop owns all task state: it chunks the 256-bit account
//! keyspace across concurrent retrievals, tracks a set of cancellable
//! timeout-bound requests against a churning peer set, splices verified
//! ranges back into durable trie nodes while withholding boundary and
//! overflow nodes, and resumes across restarts from a persisted task list.
//! Cryptography, persistence, the transport and the heal-phase scheduler
//! are all externally provided collaborators; see [`SnapPeer`],
//! [`StateStore`], [`TrieBackend`] and [`NodeScheduler`].

pub mod constants;
mod error;
mod peer;
mod request;
mod store;
mod sync;
mod task;
mod trie;

pub use error::{PeerError, ProofError, StoreError, SyncError};
pub use peer::{RequestKind, SnapPeer};
pub use store::{BatchEntry, StateStore, WriteBatch};
pub use sync::{SyncConfig, SyncHandle, SyncStats, Syncer};
pub use task::{AccountTask, StorageTask, SyncProgress};
pub use trie::{
    Account, HealSink, MissingNodes, NodeScheduler, PartialTrie, ProcessOutcome, TrieBackend,
    TriePath, VerifiedRange,
};
