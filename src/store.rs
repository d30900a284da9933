//! Persistence seam.
//!
//! The synchronizer writes through an externally provided key-value store.
//! Interior trie nodes are keyed by their own hash; flat account and
//! storage-slot snapshot records and contract codes go through the store's
//! well-known key prefixes, which is why the batch carries typed entries
//! instead of raw keys. One additional key holds the serialized resume
//! record.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use ethereum_types::H256;
use parking_lot::Mutex;

use crate::constants::IDEAL_BATCH_SIZE;
use crate::error::StoreError;

/// One typed record in a write batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchEntry {
    /// Interior trie node, keyed by its own 32-byte hash.
    TrieNode { hash: H256, node: Bytes },
    /// Slim flat snapshot record of one account.
    AccountSnapshot { account: H256, slim: Vec<u8> },
    /// Flat snapshot record of one storage slot.
    StorageSnapshot {
        account: H256,
        slot: H256,
        value: Bytes,
    },
    /// Contract bytecode, keyed by its hash.
    Code { hash: H256, code: Bytes },
}

/// A set of records landed atomically by [`StateStore::write_batch`].
#[derive(Debug, Default)]
pub struct WriteBatch {
    entries: Vec<BatchEntry>,
    size: usize,
}

impl WriteBatch {
    pub fn put_trie_node(&mut self, hash: H256, node: Bytes) {
        self.size += 32 + node.len();
        self.entries.push(BatchEntry::TrieNode { hash, node });
    }

    pub fn put_account_snapshot(&mut self, account: H256, slim: Vec<u8>) {
        self.size += 1 + 32 + slim.len();
        self.entries.push(BatchEntry::AccountSnapshot { account, slim });
    }

    pub fn put_storage_snapshot(&mut self, account: H256, slot: H256, value: Bytes) {
        self.size += 1 + 64 + value.len();
        self.entries.push(BatchEntry::StorageSnapshot {
            account,
            slot,
            value,
        });
    }

    pub fn put_code(&mut self, hash: H256, code: Bytes) {
        self.size += 32 + code.len();
        self.entries.push(BatchEntry::Code { hash, code });
    }

    /// Approximate byte weight of the pending entries.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn into_entries(self) -> Vec<BatchEntry> {
        self.entries
    }
}

/// The key-value store the synchronizer fills. Writes must land atomically
/// per batch; any failure is fatal for the running cycle.
pub trait StateStore: Send + Sync {
    /// Reads the serialized resume record, if one was persisted.
    fn read_progress(&self) -> Result<Option<Vec<u8>>, StoreError>;

    /// Persists the serialized resume record.
    fn write_progress(&self, blob: Vec<u8>) -> Result<(), StoreError>;

    /// Whether a trie node with the given hash is already on disk.
    fn has_trie_node(&self, hash: H256) -> Result<bool, StoreError>;

    /// Whether a contract code with the given hash is already on disk.
    fn has_code(&self, hash: H256) -> Result<bool, StoreError>;

    /// Atomically lands a batch of records.
    fn write_batch(&self, batch: WriteBatch) -> Result<(), StoreError>;
}

/// Shared writer for flat states recovered during healing. Entries
/// accumulate across integration events and are flushed once the pending
/// batch grows past the ideal batch size, plus once at cycle teardown.
pub(crate) struct FlatStateWriter {
    db: Arc<dyn StateStore>,
    batch: Mutex<WriteBatch>,
    accounts_healed: AtomicU64,
    account_bytes: AtomicU64,
    slots_healed: AtomicU64,
    slot_bytes: AtomicU64,
}

impl FlatStateWriter {
    pub(crate) fn new(db: Arc<dyn StateStore>) -> Self {
        Self {
            db,
            batch: Mutex::new(WriteBatch::default()),
            accounts_healed: AtomicU64::new(0),
            account_bytes: AtomicU64::new(0),
            slots_healed: AtomicU64::new(0),
            slot_bytes: AtomicU64::new(0),
        }
    }

    pub(crate) fn write_account(&self, account: H256, slim: Vec<u8>) -> Result<(), StoreError> {
        let bytes = 1 + 32 + slim.len();
        {
            let mut batch = self.batch.lock();
            batch.put_account_snapshot(account, slim);
        }
        self.accounts_healed.fetch_add(1, Ordering::Relaxed);
        self.account_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
        self.flush_if_full()
    }

    pub(crate) fn write_slot(
        &self,
        account: H256,
        slot: H256,
        value: Bytes,
    ) -> Result<(), StoreError> {
        let bytes = 1 + 64 + value.len();
        {
            let mut batch = self.batch.lock();
            batch.put_storage_snapshot(account, slot, value);
        }
        self.slots_healed.fetch_add(1, Ordering::Relaxed);
        self.slot_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
        self.flush_if_full()
    }

    fn flush_if_full(&self) -> Result<(), StoreError> {
        let pending = {
            let mut batch = self.batch.lock();
            if batch.size() < IDEAL_BATCH_SIZE {
                return Ok(());
            }
            std::mem::take(&mut *batch)
        };
        self.db.write_batch(pending)
    }

    /// Flushes whatever is pending, used at cycle teardown.
    pub(crate) fn flush(&self) -> Result<(), StoreError> {
        let pending = std::mem::take(&mut *self.batch.lock());
        if pending.is_empty() {
            return Ok(());
        }
        self.db.write_batch(pending)
    }

    /// (healed accounts, their bytes, healed slots, their bytes)
    pub(crate) fn stats(&self) -> (u64, u64, u64, u64) {
        (
            self.accounts_healed.load(Ordering::Relaxed),
            self.account_bytes.load(Ordering::Relaxed),
            self.slots_healed.load(Ordering::Relaxed),
            self.slot_bytes.load(Ordering::Relaxed),
        )
    }
}
