//! In-flight request tracking.
//!
//! Every network request is identified by a cycle-local non-zero 64-bit id
//! and carries the cycle cancel token, its own single-shot `stale` token and
//! a timeout timer. The stale token fires exactly once, when the request is
//! either consumed by its response or reverted; after that the request must
//! not be consulted again.
//!
//! Requests and responses are handled concurrently off the event loop to
//! keep proof verification on the peer's context. A request therefore
//! carries everything needed to build its response without touching loop
//! internals; tasks are referenced by id only, for the loop to restore
//! fragment state during reverts.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::Bytes;
use ethereum_types::H256;
use tokio_util::sync::CancellationToken;

use crate::task::TaskId;
use crate::trie::{Account, PartialTrie, TriePath};

/// Common request envelope; the payload differs per request class.
pub(crate) struct Request<P> {
    /// Peer this request is assigned to.
    pub peer: H256,
    /// Cycle-local request id.
    pub id: u64,
    /// Cycle-wide cancellation signal.
    pub cancel: CancellationToken,
    /// Fired once the request was consumed or reverted.
    pub stale: CancellationToken,
    /// Delivery timeout; expiry schedules a revert.
    pub timeout: RequestTimer,
    pub payload: P,
}

pub(crate) struct AccountRangePayload {
    /// First account requested, to allow continuation checks.
    pub origin: H256,
    /// Last account requested, to allow non-overlapping chunking.
    pub limit: H256,
    pub task: TaskId,
}

pub(crate) struct ByteCodesPayload {
    /// Code hashes to validate responses against.
    pub hashes: Vec<H256>,
    pub task: TaskId,
}

pub(crate) struct StorageRangesPayload {
    /// Account hashes to validate responses against.
    pub accounts: Vec<H256>,
    /// Storage roots to validate responses against.
    pub roots: Vec<H256>,
    /// First storage slot requested; zero unless filling a subtask.
    pub origin: H256,
    /// Last storage slot requested; zero unless filling a subtask.
    pub limit: H256,
    pub main_task: TaskId,
    /// Large-contract subtask being filled, as (account hash, subtask id).
    pub sub_task: Option<(H256, TaskId)>,
}

pub(crate) struct TrienodeHealPayload {
    /// Trie node hashes to validate responses against.
    pub hashes: Vec<H256>,
    /// Requested paths, kept for rescheduling missing entries.
    pub paths: Vec<TriePath>,
}

pub(crate) struct BytecodeHealPayload {
    pub hashes: Vec<H256>,
}

pub(crate) type AccountRequest = Request<AccountRangePayload>;
pub(crate) type ByteCodesRequest = Request<ByteCodesPayload>;
pub(crate) type StorageRangesRequest = Request<StorageRangesPayload>;
pub(crate) type TrienodeHealRequest = Request<TrienodeHealPayload>;
pub(crate) type BytecodeHealRequest = Request<BytecodeHealPayload>;

/// A verified account range response: the reconstructed partial trie plus
/// the node sets that must not be persisted yet.
pub struct AccountResponse {
    pub(crate) task: TaskId,

    pub(crate) hashes: Vec<H256>,
    pub(crate) accounts: Vec<Account>,

    pub(crate) trie: Box<dyn PartialTrie>,
    /// Boundary nodes, incomplete until the bounding range is finalized.
    pub(crate) bounds: HashSet<H256>,
    /// Proof witnesses of trimmed hashes; they belong to a neighboring task.
    pub(crate) overflow: HashSet<H256>,
    /// Whether the range has a continuation.
    pub(crate) cont: bool,
}

/// A verified bytecode response; undelivered entries are `None`.
pub(crate) struct ByteCodesResponse {
    pub task: TaskId,
    pub hashes: Vec<H256>,
    pub codes: Vec<Option<Bytes>>,
}

/// A verified storage ranges response, possibly covering several accounts.
/// Only the last account's range may be partial.
pub(crate) struct StorageRangesResponse {
    pub main_task: TaskId,
    pub sub_task: Option<(H256, TaskId)>,

    /// Account hashes requested, may be only partially filled.
    pub accounts: Vec<H256>,
    /// Storage roots requested, may be only partially filled.
    pub roots: Vec<H256>,

    pub hashes: Vec<Vec<H256>>,
    pub slots: Vec<Vec<Bytes>>,
    pub tries: Vec<Box<dyn PartialTrie>>,

    /// Boundary and overflow sets, relevant for the last account only.
    pub bounds: HashSet<H256>,
    pub overflow: HashSet<H256>,
    /// Whether the last storage range has a continuation.
    pub cont: bool,
}

/// A verified trienode heal response; undelivered entries are `None`.
pub(crate) struct TrienodeHealResponse {
    pub hashes: Vec<H256>,
    pub paths: Vec<TriePath>,
    pub nodes: Vec<Option<Bytes>>,
}

/// A verified bytecode heal response; undelivered entries are `None`.
pub(crate) struct BytecodeHealResponse {
    pub hashes: Vec<H256>,
    pub codes: Vec<Option<Bytes>>,
}

/// Live requests of one class, keyed by request id.
pub(crate) struct RequestTable<P> {
    reqs: HashMap<u64, Arc<Request<P>>>,
}

impl<P> RequestTable<P> {
    pub(crate) fn new() -> Self {
        Self {
            reqs: HashMap::new(),
        }
    }

    /// A fresh non-zero id not colliding with the live set. Ids may be
    /// reused after their request is removed.
    pub(crate) fn alloc_id(&self) -> u64 {
        loop {
            let id: u64 = rand::random();
            if id != 0 && !self.reqs.contains_key(&id) {
                return id;
            }
        }
    }

    pub(crate) fn insert(&mut self, req: Arc<Request<P>>) {
        self.reqs.insert(req.id, req);
    }

    pub(crate) fn remove(&mut self, id: u64) -> Option<Arc<Request<P>>> {
        self.reqs.remove(&id)
    }

    /// All live requests assigned to `peer`, for the drop-revert sweep.
    pub(crate) fn for_peer(&self, peer: H256) -> Vec<Arc<Request<P>>> {
        self.reqs
            .values()
            .filter(|req| req.peer == peer)
            .cloned()
            .collect()
    }

    pub(crate) fn clear(&mut self) {
        self.reqs.clear();
    }
}

/// Single-shot delivery timer with a race-free stop. Whichever of the
/// expiry task and the integrator defuses it first wins; the loser backs
/// off.
#[derive(Clone)]
pub(crate) struct RequestTimer {
    defused: Arc<AtomicBool>,
}

impl RequestTimer {
    pub(crate) fn new() -> Self {
        Self {
            defused: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Arms the timer: after `after`, unless defused, runs `on_expire`. The
    /// expiry task also unblocks when the request goes stale or the cycle
    /// is cancelled.
    pub(crate) fn spawn(
        &self,
        after: Duration,
        stale: CancellationToken,
        cancel: CancellationToken,
        on_expire: impl Future<Output = ()> + Send + 'static,
    ) {
        let defused = self.defused.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(after) => {
                    if !defused.swap(true, Ordering::AcqRel) {
                        on_expire.await;
                    }
                }
                _ = stale.cancelled() => {}
                _ = cancel.cancelled() => {}
            }
        });
    }

    /// Stops the timer. Returns false if it already fired, in which case a
    /// revert is en route and the caller must yield to it.
    pub(crate) fn stop(&self) -> bool {
        !self.defused.swap(true, Ordering::AcqRel)
    }
}
