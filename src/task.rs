//! Retrieval tasks and the persisted resume record.
//!
//! Account tasks partition the 256-bit account keyspace into disjoint,
//! contiguous intervals. `next` advances as ranges are finalized; `last` is
//! immutable for the task's lifetime. Large contracts whose storage cannot
//! fit a single response get their own interval set under `sub_tasks`.
//! Only the interval fields survive a restart; everything else is rebuilt
//! from responses.

use std::collections::{BTreeMap, HashMap, HashSet};

use ethereum_types::{BigEndianHash, H256, U256};
use serde::{Deserialize, Serialize};

use crate::request::AccountResponse;
use crate::trie::{NodeScheduler, TriePath};

/// Cycle-local identifier correlating requests back to the task they fill.
pub type TaskId = u64;

/// Sync task for one chunk of the account keyspace.
#[derive(Serialize, Deserialize)]
pub struct AccountTask {
    #[serde(skip)]
    pub id: TaskId,

    /// Next account to sync in this interval.
    pub next: H256,
    /// Last account to sync in this interval.
    pub last: H256,
    /// Storage intervals needing fetching for large contracts.
    pub sub_tasks: BTreeMap<H256, Vec<StorageTask>>,

    /// Pending request filling this task.
    #[serde(skip)]
    pub req: Option<u64>,
    /// Validated response filling this task.
    #[serde(skip)]
    pub res: Option<AccountResponse>,
    /// Number of outstanding sub-retrievals for the current response.
    #[serde(skip)]
    pub pend: usize,

    /// Whether the filling accounts need code retrieval.
    #[serde(skip)]
    pub need_code: Vec<bool>,
    /// Whether the filling accounts need storage retrieval.
    #[serde(skip)]
    pub need_state: Vec<bool>,
    /// Whether the filling accounts' state was chunked and needs healing.
    #[serde(skip)]
    pub need_heal: Vec<bool>,

    /// Code hashes that need retrieval.
    #[serde(skip)]
    pub code_tasks: HashSet<H256>,
    /// Account hash -> storage root for small contracts needing retrieval.
    #[serde(skip)]
    pub state_tasks: HashMap<H256, H256>,

    #[serde(skip)]
    pub done: bool,
}

impl AccountTask {
    pub(crate) fn new(id: TaskId, next: H256, last: H256) -> Self {
        Self {
            id,
            next,
            last,
            sub_tasks: BTreeMap::new(),
            req: None,
            res: None,
            pend: 0,
            need_code: Vec::new(),
            need_state: Vec::new(),
            need_heal: Vec::new(),
            code_tasks: HashSet::new(),
            state_tasks: HashMap::new(),
            done: false,
        }
    }
}

/// Sync task for one chunk of a large contract's storage keyspace.
#[derive(Serialize, Deserialize)]
pub struct StorageTask {
    #[serde(skip)]
    pub id: TaskId,

    /// Next storage slot to sync in this interval.
    pub next: H256,
    /// Last storage slot to sync in this interval.
    pub last: H256,

    /// Storage root this interval refers to. Refreshed on resume if the
    /// account's root moved between cycles.
    #[serde(skip)]
    pub root: H256,
    /// Pending request filling this task.
    #[serde(skip)]
    pub req: Option<u64>,
    #[serde(skip)]
    pub done: bool,
}

/// The heal-phase task: the external sync scheduler plus the two queues of
/// retrievals it has handed out. A single heal task exists per cycle.
pub struct HealTask {
    pub scheduler: Box<dyn NodeScheduler>,
    /// Trie node retrievals currently queued, hash -> path.
    pub trie_tasks: HashMap<H256, TriePath>,
    /// Bytecode retrievals currently queued.
    pub code_tasks: HashSet<H256>,
}

impl HealTask {
    pub(crate) fn new(scheduler: Box<dyn NodeScheduler>) -> Self {
        Self {
            scheduler,
            trie_tasks: HashMap::new(),
            code_tasks: HashSet::new(),
        }
    }
}

/// Database entry allowing a suspended sync to resume at task granularity.
#[derive(Default, Serialize, Deserialize)]
pub struct SyncProgress {
    /// The suspended account tasks (contract tasks within).
    pub tasks: Vec<AccountTask>,

    // Status report during the snap phase
    pub account_synced: u64,
    pub account_bytes: u64,
    pub bytecode_synced: u64,
    pub bytecode_bytes: u64,
    pub storage_synced: u64,
    pub storage_bytes: u64,

    // Status report during the heal phase
    pub trienode_heal_synced: u64,
    pub trienode_heal_bytes: u64,
    pub bytecode_heal_synced: u64,
    pub bytecode_heal_bytes: u64,
}

/// Splits the hash keyspace into `chunks` equal-width intervals. The last
/// interval is stretched to the maximum hash to absorb the division
/// remainder.
pub(crate) fn chunk_hash_ranges(chunks: usize) -> Vec<(H256, H256)> {
    debug_assert!(chunks > 0);
    let step = U256::MAX / U256::from(chunks as u64);
    let mut ranges = Vec::with_capacity(chunks);
    let mut next = U256::zero();
    for i in 0..chunks {
        let last = if i == chunks - 1 { U256::MAX } else { next + step };
        ranges.push((H256::from_uint(&next), H256::from_uint(&last)));
        if i < chunks - 1 {
            next = last + U256::one();
        }
    }
    ranges
}

/// The hash immediately after `hash`, wrapping at the top of the keyspace.
/// Only observable mid-range: a range ending on the maximum hash never has
/// a continuation.
pub(crate) fn hash_successor(hash: H256) -> H256 {
    let (next, _) = hash.into_uint().overflowing_add(U256::one());
    H256::from_uint(&next)
}
