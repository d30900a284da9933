//! The coordination core.
//!
//! One event loop arbitrates every state transition: it garbage-collects
//! finished tasks, assigns idle peers to pending retrievals, and integrates
//! verified responses back into the task set. Worker contexts only send the
//! network call (reverting on failure) or verify a delivery and publish it
//! over a channel; they never touch task state. The only fields mutated off
//! the loop live behind [`Shared`]'s lock: the peer pool, the per-class
//! live-request tables, the current root and the phase flag.

mod assign;
mod deliver;
mod process;
mod revert;

use std::sync::Arc;
use std::time::Duration;

use ethereum_types::{BigEndianHash, H256, U256, U512};
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::constants::{ACCOUNT_CONCURRENCY, EMPTY_TRIE_ROOT};
use crate::error::{PeerError, SyncError};
use crate::peer::{PeerPool, SnapPeer};
use crate::request::{
    AccountRangePayload, AccountRequest, AccountResponse, ByteCodesPayload, ByteCodesRequest,
    ByteCodesResponse, BytecodeHealPayload, BytecodeHealRequest, BytecodeHealResponse,
    RequestTable, StorageRangesPayload, StorageRangesRequest, StorageRangesResponse,
    TrienodeHealPayload, TrienodeHealRequest, TrienodeHealResponse,
};
use crate::store::{FlatStateWriter, StateStore};
use crate::task::{AccountTask, HealTask, SyncProgress, TaskId, chunk_hash_ranges};
use crate::trie::{HealSink, TrieBackend};

/// Buffer depth of the failure and response channels. The loop drains them
/// serially; senders park on a guarded select, so depth only affects
/// batching, not correctness.
const EVENT_CHANNEL_CAPACITY: usize = 16;

/// Tunables that vary between deployments and tests. Everything else is a
/// constant in [`crate::constants`].
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Maximum time a peer may spend serving one request.
    pub request_timeout: Duration,
    /// Minimum interval between progress reports.
    pub report_interval: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            request_timeout: crate::constants::REQUEST_TIMEOUT,
            report_interval: crate::constants::REPORT_INTERVAL,
        }
    }
}

/// Cumulative retrieval counters, also part of the persisted resume record.
#[derive(Debug, Default, Clone, Copy)]
pub struct SyncStats {
    pub account_synced: u64,
    pub account_bytes: u64,
    pub bytecode_synced: u64,
    pub bytecode_bytes: u64,
    pub storage_synced: u64,
    pub storage_bytes: u64,

    pub trienode_heal_synced: u64,
    pub trienode_heal_bytes: u64,
    pub trienode_heal_dups: u64,
    pub trienode_heal_nops: u64,
    pub bytecode_heal_synced: u64,
    pub bytecode_heal_bytes: u64,
    pub bytecode_heal_dups: u64,
    pub bytecode_heal_nops: u64,

    pub accounts_healed: u64,
    pub account_heal_bytes: u64,
    pub slots_healed: u64,
    pub slot_heal_bytes: u64,
}

/// Senders feeding the event loop. Recreated for every cycle so that late
/// packets from a previous cycle can never reach the current one.
pub(crate) struct Channels {
    pub update: mpsc::Sender<()>,
    pub peer_join: mpsc::UnboundedSender<H256>,
    pub peer_drop: mpsc::UnboundedSender<H256>,

    pub account_fails: mpsc::Sender<Arc<AccountRequest>>,
    pub bytecode_fails: mpsc::Sender<Arc<ByteCodesRequest>>,
    pub storage_fails: mpsc::Sender<Arc<StorageRangesRequest>>,
    pub trienode_heal_fails: mpsc::Sender<Arc<TrienodeHealRequest>>,
    pub bytecode_heal_fails: mpsc::Sender<Arc<BytecodeHealRequest>>,

    pub account_resps: mpsc::Sender<AccountResponse>,
    pub bytecode_resps: mpsc::Sender<ByteCodesResponse>,
    pub storage_resps: mpsc::Sender<StorageRangesResponse>,
    pub trienode_heal_resps: mpsc::Sender<TrienodeHealResponse>,
    pub bytecode_heal_resps: mpsc::Sender<BytecodeHealResponse>,
}

pub(crate) struct Receivers {
    update: mpsc::Receiver<()>,
    peer_join: mpsc::UnboundedReceiver<H256>,
    peer_drop: mpsc::UnboundedReceiver<H256>,

    account_fails: mpsc::Receiver<Arc<AccountRequest>>,
    bytecode_fails: mpsc::Receiver<Arc<ByteCodesRequest>>,
    storage_fails: mpsc::Receiver<Arc<StorageRangesRequest>>,
    trienode_heal_fails: mpsc::Receiver<Arc<TrienodeHealRequest>>,
    bytecode_heal_fails: mpsc::Receiver<Arc<BytecodeHealRequest>>,

    account_resps: mpsc::Receiver<AccountResponse>,
    bytecode_resps: mpsc::Receiver<ByteCodesResponse>,
    storage_resps: mpsc::Receiver<StorageRangesResponse>,
    trienode_heal_resps: mpsc::Receiver<TrienodeHealResponse>,
    bytecode_heal_resps: mpsc::Receiver<BytecodeHealResponse>,
}

fn event_channels() -> (Channels, Receivers) {
    let (update_tx, update_rx) = mpsc::channel(1);
    let (join_tx, join_rx) = mpsc::unbounded_channel();
    let (drop_tx, drop_rx) = mpsc::unbounded_channel();

    let (account_fail_tx, account_fail_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    let (bytecode_fail_tx, bytecode_fail_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    let (storage_fail_tx, storage_fail_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    let (trienode_heal_fail_tx, trienode_heal_fail_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    let (bytecode_heal_fail_tx, bytecode_heal_fail_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

    let (account_resp_tx, account_resp_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    let (bytecode_resp_tx, bytecode_resp_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    let (storage_resp_tx, storage_resp_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    let (trienode_heal_resp_tx, trienode_heal_resp_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    let (bytecode_heal_resp_tx, bytecode_heal_resp_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

    (
        Channels {
            update: update_tx,
            peer_join: join_tx,
            peer_drop: drop_tx,
            account_fails: account_fail_tx,
            bytecode_fails: bytecode_fail_tx,
            storage_fails: storage_fail_tx,
            trienode_heal_fails: trienode_heal_fail_tx,
            bytecode_heal_fails: bytecode_heal_fail_tx,
            account_resps: account_resp_tx,
            bytecode_resps: bytecode_resp_tx,
            storage_resps: storage_resp_tx,
            trienode_heal_resps: trienode_heal_resp_tx,
            bytecode_heal_resps: bytecode_heal_resp_tx,
        },
        Receivers {
            update: update_rx,
            peer_join: join_rx,
            peer_drop: drop_rx,
            account_fails: account_fail_rx,
            bytecode_fails: bytecode_fail_rx,
            storage_fails: storage_fail_rx,
            trienode_heal_fails: trienode_heal_fail_rx,
            bytecode_heal_fails: bytecode_heal_fail_rx,
            account_resps: account_resp_rx,
            bytecode_resps: bytecode_resp_rx,
            storage_resps: storage_resp_rx,
            trienode_heal_resps: trienode_heal_resp_rx,
            bytecode_heal_resps: bytecode_heal_resp_rx,
        },
    )
}

/// The slice of syncer state that worker contexts may touch, guarded by one
/// read-write lock.
pub(crate) struct Shared<P> {
    pub root: H256,
    /// Set once the account task list first drains; flips bytecode
    /// deliveries from the snap handler to the heal handler.
    pub snapped: bool,
    pub pool: PeerPool<P>,

    pub account_reqs: RequestTable<AccountRangePayload>,
    pub bytecode_reqs: RequestTable<ByteCodesPayload>,
    pub storage_reqs: RequestTable<StorageRangesPayload>,
    pub trienode_heal_reqs: RequestTable<TrienodeHealPayload>,
    pub bytecode_heal_reqs: RequestTable<BytecodeHealPayload>,

    pub tx: Channels,
}

pub(crate) struct Inner<P> {
    pub shared: RwLock<Shared<P>>,
}

/// Account-and-storage trie syncer downloading leaves from remote peers and
/// reassembling chunks of the state trie, on top of which the heal phase
/// fixes any gaps and overlaps.
///
/// Every network request has a variety of failure events:
///   - the peer disconnects after task assignment, failing the send
///   - the peer disconnects after the send, before delivering
///   - the peer stays connected but does not deliver in time
///   - the peer delivers a stale response after a previous timeout
///   - the peer delivers a refusal to serve the requested state
pub struct Syncer<P: SnapPeer> {
    inner: Arc<Inner<P>>,
    db: Arc<dyn StateStore>,
    backend: Arc<dyn TrieBackend>,
    config: SyncConfig,

    pub(crate) tasks: Vec<AccountTask>,
    pub(crate) healer: Option<HealTask>,
    pub(crate) stats: SyncStats,

    flat: Arc<FlatStateWriter>,
    next_task_id: TaskId,
    pub(crate) workers: JoinSet<()>,

    start_time: Option<Instant>,
    log_time: Option<Instant>,
}

impl<P: SnapPeer> Syncer<P> {
    pub fn new(db: Arc<dyn StateStore>, backend: Arc<dyn TrieBackend>, config: SyncConfig) -> Self {
        // The initial channels have no receivers; they are replaced at the
        // start of every cycle, so pre-cycle events just evaporate.
        let (tx, _) = event_channels();
        let flat = Arc::new(FlatStateWriter::new(db.clone()));
        Self {
            inner: Arc::new(Inner {
                shared: RwLock::new(Shared {
                    root: H256::zero(),
                    snapped: false,
                    pool: PeerPool::new(),
                    account_reqs: RequestTable::new(),
                    bytecode_reqs: RequestTable::new(),
                    storage_reqs: RequestTable::new(),
                    trienode_heal_reqs: RequestTable::new(),
                    bytecode_heal_reqs: RequestTable::new(),
                    tx,
                }),
            }),
            db,
            backend,
            config,
            tasks: Vec::new(),
            healer: None,
            stats: SyncStats::default(),
            flat,
            next_task_id: 0,
            workers: JoinSet::new(),
            start_time: None,
            log_time: None,
        }
    }

    /// A cheap handle for the transport side: peer registration and the
    /// delivery callbacks. Cloneable and usable from any context.
    pub fn handle(&self) -> SyncHandle<P> {
        SyncHandle {
            inner: self.inner.clone(),
            backend: self.backend.clone(),
        }
    }

    /// Snapshot of the cumulative retrieval counters.
    pub fn stats(&self) -> SyncStats {
        let mut stats = self.stats;
        let (accounts, account_bytes, slots, slot_bytes) = self.flat.stats();
        stats.accounts_healed = accounts;
        stats.account_heal_bytes = account_bytes;
        stats.slots_healed = slots;
        stats.slot_heal_bytes = slot_bytes;
        stats
    }

    pub(crate) fn alloc_task_id(&mut self) -> TaskId {
        self.next_task_id += 1;
        self.next_task_id
    }

    /// Starts (or resumes) a sync cycle against the given state root.
    /// Previously downloaded segments are not redownloaded or fixed; any
    /// errors are healed after the leaves are fully accumulated.
    pub async fn sync(&mut self, root: H256, cancel: CancellationToken) -> Result<(), SyncError> {
        // Move the root from any previous value, revert stateless markers
        // and install fresh event channels so stale packets cannot land.
        let (tx, mut rx) = event_channels();
        {
            let mut shared = self.inner.shared.write();
            shared.root = root;
            shared.pool.reset_stateless();
            shared.tx = tx;
        }
        let sink = HealSink::new(self.flat.clone(), self.backend.clone());
        self.healer = Some(HealTask::new(self.backend.scheduler(root, sink)));
        if self.start_time.is_none() {
            self.start_time = Some(Instant::now());
        }

        self.load_sync_status(root);
        self.inner.shared.write().snapped = self.tasks.is_empty();
        let pending = self.healer.as_ref().map_or(0, |h| h.scheduler.pending());
        if self.tasks.is_empty() && pending == 0 {
            debug!("Snapshot sync already completed");
            return Ok(());
        }
        debug!(%root, "Starting snapshot sync cycle");

        let cycle = cancel.child_token();
        let result = self.run(&cycle, &mut rx).await;

        // Whether the cycle completed or not, disregard any future packets:
        // unwind the in-flight workers, drop the live request tables, then
        // persist anything still integrable.
        debug!(%root, "Terminating snapshot sync cycle");
        cycle.cancel();
        while self.workers.join_next().await.is_some() {}
        {
            let mut shared = self.inner.shared.write();
            shared.account_reqs.clear();
            shared.bytecode_reqs.clear();
            shared.storage_reqs.clear();
            shared.trienode_heal_reqs.clear();
            shared.bytecode_heal_reqs.clear();
        }
        self.report(true);

        let mut teardown: Result<(), SyncError> = Ok(());
        if let Err(err) = self.flat.flush() {
            teardown = Err(err.into());
        }
        for pos in 0..self.tasks.len() {
            if let Err(err) = self.forward_account_task(pos) {
                if teardown.is_ok() {
                    teardown = Err(err);
                }
            }
        }
        self.clean_account_tasks();
        if let Err(err) = self.save_sync_status() {
            if teardown.is_ok() {
                teardown = Err(err);
            }
        }

        match (result, teardown) {
            (Err(err), td) => {
                if let Err(td) = td {
                    error!(error = %td, "Sync teardown failed");
                }
                Err(err)
            }
            (Ok(()), td) => td,
        }
    }

    async fn run(
        &mut self,
        cycle: &CancellationToken,
        rx: &mut Receivers,
    ) -> Result<(), SyncError> {
        loop {
            // Remove all completed tasks and terminate if everything's done.
            self.clean_storage_tasks()?;
            self.clean_account_tasks();
            let pending = self.healer.as_ref().map_or(0, |h| h.scheduler.pending());
            if self.tasks.is_empty() && pending == 0 {
                return Ok(());
            }
            // Assign all the data retrieval tasks to any free peers.
            self.assign_account_tasks(cycle);
            self.assign_bytecode_tasks(cycle);
            self.assign_storage_tasks(cycle);

            if self.tasks.is_empty() {
                // Snap phase done, run the heal phase.
                self.assign_trienode_heal_tasks(cycle);
                self.assign_bytecode_heal_tasks(cycle);
            }
            // Wait for something to happen.
            tokio::select! {
                _ = cycle.cancelled() => return Err(SyncError::Cancelled),

                Some(_) = rx.update.recv() => {
                    // Something happened (delivery, timeout), recheck tasks
                }
                Some(_) = rx.peer_join.recv() => {
                    // A new peer joined, try to schedule it new tasks
                }
                Some(id) = rx.peer_drop.recv() => self.revert_peer_requests(id),

                Some(req) = rx.account_fails.recv() => self.revert_account_request(&req),
                Some(req) = rx.bytecode_fails.recv() => self.revert_bytecode_request(&req),
                Some(req) = rx.storage_fails.recv() => self.revert_storage_request(&req),
                Some(req) = rx.trienode_heal_fails.recv() => self.revert_trienode_heal_request(&req),
                Some(req) = rx.bytecode_heal_fails.recv() => self.revert_bytecode_heal_request(&req),

                Some(res) = rx.account_resps.recv() => self.process_account_response(res)?,
                Some(res) = rx.bytecode_resps.recv() => self.process_bytecode_response(res)?,
                Some(res) = rx.storage_resps.recv() => self.process_storage_response(res)?,
                Some(res) = rx.trienode_heal_resps.recv() => self.process_trienode_heal_response(res)?,
                Some(res) = rx.bytecode_heal_resps.recv() => self.process_bytecode_heal_response(res)?,
            }
            // Report stats if something meaningful happened.
            self.report(false);
        }
    }

    /// Restores a previously aborted sync from the database, or chunks up
    /// the account range afresh if there is none (or it fails to decode).
    fn load_sync_status(&mut self, root: H256) {
        let blob = match self.db.read_progress() {
            Ok(blob) => blob,
            Err(err) => {
                error!(error = %err, "Failed to read sync progress");
                None
            }
        };
        if let Some(blob) = blob {
            match serde_json::from_slice::<SyncProgress>(&blob) {
                Ok(progress) => {
                    self.tasks = progress.tasks;
                    let mut next_id = self.next_task_id;
                    for task in &mut self.tasks {
                        next_id += 1;
                        task.id = next_id;
                        for subtasks in task.sub_tasks.values_mut() {
                            for sub in subtasks.iter_mut() {
                                next_id += 1;
                                sub.id = next_id;
                            }
                        }
                        debug!(from = %task.next, last = %task.last, "Scheduled account sync task");
                    }
                    self.next_task_id = next_id;
                    self.stats.account_synced = progress.account_synced;
                    self.stats.account_bytes = progress.account_bytes;
                    self.stats.bytecode_synced = progress.bytecode_synced;
                    self.stats.bytecode_bytes = progress.bytecode_bytes;
                    self.stats.storage_synced = progress.storage_synced;
                    self.stats.storage_bytes = progress.storage_bytes;
                    self.stats.trienode_heal_synced = progress.trienode_heal_synced;
                    self.stats.trienode_heal_bytes = progress.trienode_heal_bytes;
                    self.stats.bytecode_heal_synced = progress.bytecode_heal_synced;
                    self.stats.bytecode_heal_bytes = progress.bytecode_heal_bytes;
                    return;
                }
                Err(err) => error!(error = %err, "Failed to decode sync progress, restarting"),
            }
        }
        // Either there was no previous state or it failed to decode. Start
        // a fresh sync by chunking up the account range.
        self.tasks = Vec::new();
        self.stats = SyncStats::default();
        if root == *EMPTY_TRIE_ROOT {
            // An empty trie has no leaves to retrieve.
            debug!("Empty state root, nothing to schedule");
            return;
        }
        for (next, last) in chunk_hash_ranges(ACCOUNT_CONCURRENCY) {
            let id = self.alloc_task_id();
            debug!(from = %next, last = %last, "Created account sync task");
            self.tasks.push(AccountTask::new(id, next, last));
        }
    }

    /// Serializes the remaining sync tasks into the database.
    fn save_sync_status(&mut self) -> Result<(), SyncError> {
        let progress = SyncProgress {
            tasks: std::mem::take(&mut self.tasks),
            account_synced: self.stats.account_synced,
            account_bytes: self.stats.account_bytes,
            bytecode_synced: self.stats.bytecode_synced,
            bytecode_bytes: self.stats.bytecode_bytes,
            storage_synced: self.stats.storage_synced,
            storage_bytes: self.stats.storage_bytes,
            trienode_heal_synced: self.stats.trienode_heal_synced,
            trienode_heal_bytes: self.stats.trienode_heal_bytes,
            bytecode_heal_synced: self.stats.bytecode_heal_synced,
            bytecode_heal_bytes: self.stats.bytecode_heal_bytes,
        };
        let encoded = serde_json::to_vec(&progress);
        self.tasks = progress.tasks;
        let blob = encoded.map_err(|err| SyncError::Progress(err.to_string()))?;
        self.db.write_progress(blob)?;
        Ok(())
    }

    /// Removes account range retrieval tasks that have completed.
    fn clean_account_tasks(&mut self) {
        self.tasks.retain(|task| !task.done);
        if self.tasks.is_empty() {
            self.inner.shared.write().snapped = true;
        }
    }

    /// Iterates over all storage subtasks, cleaning completed ones and
    /// completing their parent accounts once every chunk is in.
    fn clean_storage_tasks(&mut self) -> Result<(), SyncError> {
        for pos in 0..self.tasks.len() {
            let mut forward = false;
            {
                let task = &mut self.tasks[pos];
                let mut completed = Vec::new();
                for (account, subtasks) in task.sub_tasks.iter_mut() {
                    subtasks.retain(|sub| !sub.done);
                    if subtasks.is_empty() {
                        completed.push(*account);
                    }
                }
                for account in completed {
                    // All storage chunks are in, the account is done too.
                    task.sub_tasks.remove(&account);
                    if let Some(res) = &task.res {
                        for (idx, hash) in res.hashes.iter().enumerate() {
                            if *hash == account {
                                task.need_state[idx] = false;
                            }
                        }
                    }
                    task.pend = task.pend.saturating_sub(1);
                    if task.pend == 0 {
                        forward = true;
                    }
                }
            }
            if forward {
                self.forward_account_task(pos)?;
            }
        }
        Ok(())
    }

    fn report(&mut self, force: bool) {
        if !self.tasks.is_empty() {
            self.report_sync_progress(force);
        } else {
            self.report_heal_progress(force);
        }
    }

    /// Extrapolates total state size from the fraction of the keyspace the
    /// tasks have covered so far.
    fn report_sync_progress(&mut self, force: bool) {
        if !force
            && self
                .log_time
                .is_some_and(|at| at.elapsed() < self.config.report_interval)
        {
            return;
        }
        // Don't report anything until there is meaningful progress.
        let synced = self.stats.account_bytes + self.stats.bytecode_bytes + self.stats.storage_bytes;
        if synced == 0 {
            return;
        }
        let mut gaps = U256::zero();
        for task in &self.tasks {
            // A just-finished task may sit at one past its boundary until
            // the next cleanup pass.
            let gap = task.last.into_uint().saturating_sub(task.next.into_uint());
            gaps = gaps.saturating_add(gap);
        }
        let space = U512::one() << 256usize;
        let fills = space - U512::from(gaps);
        if fills.is_zero() {
            return;
        }
        self.log_time = Some(Instant::now());

        let est_bytes = ((U512::from(synced) * space) / fills).low_u128() as f64;
        let elapsed = self.start_time.map(|at| at.elapsed()).unwrap_or_default();
        let eta_secs = if est_bytes > synced as f64 {
            elapsed.as_secs_f64() / synced as f64 * (est_bytes - synced as f64)
        } else {
            0.0
        };
        let progress = format!("{:.2}%", synced as f64 * 100.0 / est_bytes);
        info!(
            synced = %progress,
            state_bytes = synced,
            accounts = self.stats.account_synced,
            slots = self.stats.storage_synced,
            codes = self.stats.bytecode_synced,
            eta_secs = eta_secs as u64,
            "State sync in progress"
        );
    }

    fn report_heal_progress(&mut self, force: bool) {
        if !force
            && self
                .log_time
                .is_some_and(|at| at.elapsed() < self.config.report_interval)
        {
            return;
        }
        self.log_time = Some(Instant::now());

        let (accounts, _, slots, _) = self.flat.stats();
        let pending = self.healer.as_ref().map_or(0, |h| h.scheduler.pending());
        info!(
            nodes = self.stats.trienode_heal_synced,
            node_bytes = self.stats.trienode_heal_bytes,
            codes = self.stats.bytecode_heal_synced,
            code_bytes = self.stats.bytecode_heal_bytes,
            accounts,
            slots,
            pending,
            "State heal in progress"
        );
    }
}

/// Transport-facing handle: registration plus the delivery callbacks. The
/// callbacks run on the caller's context, performing verification there and
/// publishing validated responses to the event loop.
pub struct SyncHandle<P: SnapPeer> {
    pub(crate) inner: Arc<Inner<P>>,
    pub(crate) backend: Arc<dyn TrieBackend>,
}

impl<P: SnapPeer> Clone for SyncHandle<P> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            backend: self.backend.clone(),
        }
    }
}

impl<P: SnapPeer> SyncHandle<P> {
    /// Injects a new data source into the syncer's peer set. The peer
    /// becomes immediately eligible, even mid-cycle.
    pub fn register(&self, peer: P) -> Result<(), PeerError> {
        let mut shared = self.inner.shared.write();
        let id = match shared.pool.register(peer) {
            Ok(id) => id,
            Err(err) => {
                error!(error = %err, "Snap peer already registered");
                return Err(err);
            }
        };
        // Notify any active cycle that a new peer can be assigned data.
        let _ = shared.tx.peer_join.send(id);
        Ok(())
    }

    /// Removes all traces of a peer. Any live requests it owned are
    /// reverted and their fragments rescheduled onto other peers.
    pub fn unregister(&self, id: H256) -> Result<(), PeerError> {
        let mut shared = self.inner.shared.write();
        if let Err(err) = shared.pool.unregister(id) {
            error!(error = %err, "Snap peer not registered");
            return Err(err);
        }
        let _ = shared.tx.peer_drop.send(id);
        Ok(())
    }
}

/// Sends `value` unless the request is torn down first. Workers park here
/// instead of blocking past cycle teardown; returns whether the value was
/// actually delivered.
pub(crate) async fn guarded_send<T>(
    tx: mpsc::Sender<T>,
    cancel: CancellationToken,
    stale: CancellationToken,
    value: T,
) -> bool {
    tokio::select! {
        sent = tx.send(value) => sent.is_ok(),
        _ = cancel.cancelled() => false,
        _ = stale.cancelled() => false,
    }
}
