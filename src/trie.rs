//! Contracts for the cryptographic collaborators.
//!
//! The synchronizer never verifies proofs, hashes data or walks tries
//! itself; it drives a [`TrieBackend`] that bundles the range-proof
//! verifier, the account codec, the hash primitive and the state-trie sync
//! scheduler used during the heal phase.

use std::collections::HashSet;
use std::sync::Arc;

use bytes::Bytes;
use ethereum_types::{H256, U256};
use serde::{Deserialize, Serialize};

use crate::error::{ProofError, StoreError};
use crate::store::{FlatStateWriter, WriteBatch};

/// A decoded account record from the account trie's leaf level.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub nonce: u64,
    pub balance: U256,
    pub storage_root: H256,
    pub code_hash: H256,
}

/// Path of a trie node requested during healing: the account trie path,
/// optionally followed by a storage trie path for nodes inside a contract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriePath(pub Vec<Bytes>);

/// Outcome of handing a healed node to the sync scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    Committed,
    AlreadyProcessed,
    NotRequested,
    Failed(String),
}

/// The partial trie reconstructed by a successful range verification,
/// together with the boundary nodes the proof touched and whether more data
/// exists past the returned range.
pub struct VerifiedRange {
    pub trie: Box<dyn PartialTrie>,
    pub bounds: HashSet<H256>,
    pub cont: bool,
}

/// A partial trie assembled from one verified range response.
pub trait PartialTrie: Send {
    /// The reconstructed interior nodes, keyed by their own hash.
    fn nodes(&self) -> Vec<(H256, Bytes)>;

    /// Adds the hashes of the nodes witnessing `key` to `witness`. Only ever
    /// called for keys the verified range contains.
    fn prove(&self, key: H256, witness: &mut HashSet<H256>) -> Result<(), ProofError>;
}

/// Hashes and paths the scheduler still wants retrieved.
#[derive(Debug, Default)]
pub struct MissingNodes {
    pub node_hashes: Vec<H256>,
    pub node_paths: Vec<TriePath>,
    pub code_hashes: Vec<H256>,
}

/// The external state-trie sync scheduler driving the heal phase. It
/// discovers missing interior nodes by walking references from the root and
/// keeps account of everything requested but not yet processed.
pub trait NodeScheduler: Send {
    /// Up to `limit` retrieval tasks, split into trie nodes and bytecodes.
    fn missing(&mut self, limit: usize) -> MissingNodes;

    /// Feeds one retrieved node or bytecode back into the scheduler.
    fn process(&mut self, hash: H256, data: Bytes) -> ProcessOutcome;

    /// Drains everything committable into `batch`.
    fn commit(&mut self, batch: &mut WriteBatch) -> Result<(), StoreError>;

    /// Number of retrievals requested from the scheduler but not yet
    /// processed. Zero means the trie is complete.
    fn pending(&self) -> usize;
}

/// Bundle of externally provided cryptographic primitives.
pub trait TrieBackend: Send + Sync {
    /// Verifies that `keys`/`values` form a contiguous range of the trie
    /// rooted at `root`, starting at `origin`, witnessed by `proof`. An
    /// empty proof means the response must cover the entire key space.
    fn verify_range(
        &self,
        root: H256,
        origin: H256,
        keys: &[H256],
        values: &[Bytes],
        proof: &[Bytes],
    ) -> Result<VerifiedRange, ProofError>;

    /// Decodes a wire-encoded account leaf.
    fn decode_account(&self, blob: &[u8]) -> Result<Account, ProofError>;

    /// Re-encodes an account into the slim snapshot representation.
    fn slim_account(&self, account: &Account) -> Vec<u8>;

    /// Keccak256 of a wire blob, used to align delivered bytecodes and heal
    /// nodes with the hashes they were requested under.
    fn keccak(&self, blob: &[u8]) -> H256;

    /// Builds the heal-phase sync scheduler seeded with the target state
    /// root. Flat states recovered while healing are delivered to `sink`.
    fn scheduler(&self, root: H256, sink: HealSink) -> Box<dyn NodeScheduler>;
}

/// Destination for flat account and storage-slot states recovered during
/// healing. They may be outdated while the sync runs and are fixed up later
/// during snapshot generation, so they are persisted blindly.
#[derive(Clone)]
pub struct HealSink {
    flat: Arc<FlatStateWriter>,
    backend: Arc<dyn TrieBackend>,
}

impl HealSink {
    pub(crate) fn new(flat: Arc<FlatStateWriter>, backend: Arc<dyn TrieBackend>) -> Self {
        Self { flat, backend }
    }

    /// Accepts a healed flat state: a single-element path carries an account
    /// leaf, a two-element path carries a raw storage slot.
    pub fn on_heal_state(&self, paths: &[Bytes], value: &[u8]) -> Result<(), StoreError> {
        if paths.len() == 1 && paths[0].len() == 32 {
            let Ok(account) = self.backend.decode_account(value) else {
                return Ok(());
            };
            let slim = self.backend.slim_account(&account);
            self.flat
                .write_account(H256::from_slice(&paths[0]), slim)?;
        }
        if paths.len() == 2 && paths[0].len() == 32 && paths[1].len() == 32 {
            self.flat.write_slot(
                H256::from_slice(&paths[0]),
                H256::from_slice(&paths[1]),
                Bytes::copy_from_slice(value),
            )?;
        }
        Ok(())
    }
}
