//! End-to-end scenarios for the snapshot synchronizer, driven through mock
//! collaborators: a scripted peer transport, an in-memory store, a proof
//! "verifier" steered by directives embedded in the proof blob, and a
//! scripted heal scheduler.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use ethereum_types::{BigEndianHash, H256, U256};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha3::{Digest, Keccak256};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use snap_sync::constants::{EMPTY_CODE_HASH, EMPTY_TRIE_ROOT, HASH_MAX};
use snap_sync::{
    Account, HealSink, MissingNodes, NodeScheduler, PartialTrie, PeerError, ProcessOutcome,
    ProofError, SnapPeer, StateStore, StoreError, SyncConfig, SyncError, SyncHandle, SyncProgress,
    Syncer, TrieBackend, TriePath, VerifiedRange, WriteBatch,
};

// =============================================================================
// Mock store
// =============================================================================

#[derive(Default)]
struct MemStoreInner {
    progress: Option<Vec<u8>>,
    trie_nodes: HashMap<H256, Bytes>,
    codes: HashMap<H256, Bytes>,
    account_snapshots: HashMap<H256, Vec<u8>>,
    storage_snapshots: HashMap<(H256, H256), Bytes>,
}

#[derive(Clone, Default)]
struct MemStore(Arc<Mutex<MemStoreInner>>);

impl StateStore for MemStore {
    fn read_progress(&self) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.0.lock().progress.clone())
    }

    fn write_progress(&self, blob: Vec<u8>) -> Result<(), StoreError> {
        self.0.lock().progress = Some(blob);
        Ok(())
    }

    fn has_trie_node(&self, hash: H256) -> Result<bool, StoreError> {
        Ok(self.0.lock().trie_nodes.contains_key(&hash))
    }

    fn has_code(&self, hash: H256) -> Result<bool, StoreError> {
        Ok(self.0.lock().codes.contains_key(&hash))
    }

    fn write_batch(&self, batch: WriteBatch) -> Result<(), StoreError> {
        let mut inner = self.0.lock();
        for entry in batch.into_entries() {
            match entry {
                snap_sync::BatchEntry::TrieNode { hash, node } => {
                    inner.trie_nodes.insert(hash, node);
                }
                snap_sync::BatchEntry::AccountSnapshot { account, slim } => {
                    inner.account_snapshots.insert(account, slim);
                }
                snap_sync::BatchEntry::StorageSnapshot {
                    account,
                    slot,
                    value,
                } => {
                    inner.storage_snapshots.insert((account, slot), value);
                }
                snap_sync::BatchEntry::Code { hash, code } => {
                    inner.codes.insert(hash, code);
                }
            }
        }
        Ok(())
    }
}

// =============================================================================
// Mock trie backend
// =============================================================================

/// Test control block smuggled through the proof blob: the continuation
/// flag, an optional forced verification failure and the boundary set.
#[derive(Default, Serialize, Deserialize)]
struct ProofDirective {
    cont: bool,
    #[serde(default)]
    fail: bool,
    #[serde(default)]
    bounds: Vec<H256>,
}

fn directive(cont: bool) -> Bytes {
    serde_json::to_vec(&ProofDirective {
        cont,
        ..Default::default()
    })
    .unwrap()
    .into()
}

/// Partial trie whose "interior nodes" are simply the delivered leaves,
/// keyed by their own hash. Witnessing a key witnesses exactly that node,
/// which makes boundary / overflow / incompletes exclusion observable.
struct MockTrie {
    nodes: Vec<(H256, Bytes)>,
}

impl PartialTrie for MockTrie {
    fn nodes(&self) -> Vec<(H256, Bytes)> {
        self.nodes.clone()
    }

    fn prove(&self, key: H256, witness: &mut HashSet<H256>) -> Result<(), ProofError> {
        witness.insert(key);
        Ok(())
    }
}

#[derive(Default)]
struct HealState {
    missing_nodes: Vec<(H256, TriePath)>,
    missing_codes: Vec<H256>,
    outstanding: HashSet<H256>,
    processed: HashSet<H256>,
    committable: Vec<(H256, Bytes)>,
    pending: usize,
}

struct MockScheduler {
    state: Arc<Mutex<HealState>>,
}

impl NodeScheduler for MockScheduler {
    fn missing(&mut self, limit: usize) -> MissingNodes {
        let mut state = self.state.lock();
        let mut missing = MissingNodes::default();
        while missing.node_hashes.len() + missing.code_hashes.len() < limit {
            if let Some((hash, path)) = state.missing_nodes.pop() {
                missing.node_hashes.push(hash);
                missing.node_paths.push(path);
            } else if let Some(hash) = state.missing_codes.pop() {
                missing.code_hashes.push(hash);
            } else {
                break;
            }
        }
        missing
    }

    fn process(&mut self, hash: H256, data: Bytes) -> ProcessOutcome {
        let mut state = self.state.lock();
        if state.processed.contains(&hash) {
            return ProcessOutcome::AlreadyProcessed;
        }
        if !state.outstanding.contains(&hash) {
            return ProcessOutcome::NotRequested;
        }
        state.processed.insert(hash);
        state.committable.push((hash, data));
        state.pending -= 1;
        ProcessOutcome::Committed
    }

    fn commit(&mut self, batch: &mut WriteBatch) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        for (hash, data) in state.committable.drain(..) {
            batch.put_trie_node(hash, data);
        }
        Ok(())
    }

    fn pending(&self) -> usize {
        self.state.lock().pending
    }
}

#[derive(Default)]
struct MockBackend {
    /// Scripted heal work, shared with every scheduler built per cycle.
    heal: Arc<Mutex<HealState>>,
    /// Every (root, origin) pair handed to the range verifier.
    verified: Mutex<Vec<(H256, H256)>>,
}

impl TrieBackend for MockBackend {
    fn verify_range(
        &self,
        root: H256,
        origin: H256,
        keys: &[H256],
        values: &[Bytes],
        proof: &[Bytes],
    ) -> Result<VerifiedRange, ProofError> {
        self.verified.lock().push((root, origin));
        let directive = match proof.first() {
            Some(blob) => serde_json::from_slice::<ProofDirective>(blob)
                .map_err(|err| ProofError::Verify(err.to_string()))?,
            None => ProofDirective::default(),
        };
        if directive.fail {
            return Err(ProofError::Verify("scripted proof failure".into()));
        }
        if keys.len() != values.len() {
            return Err(ProofError::Verify("key/value length mismatch".into()));
        }
        let nodes = keys
            .iter()
            .zip(values.iter())
            .map(|(key, value)| (*key, value.clone()))
            .collect();
        Ok(VerifiedRange {
            trie: Box::new(MockTrie { nodes }),
            bounds: directive.bounds.into_iter().collect(),
            cont: directive.cont,
        })
    }

    fn decode_account(&self, blob: &[u8]) -> Result<Account, ProofError> {
        serde_json::from_slice(blob).map_err(|err| ProofError::Decode(err.to_string()))
    }

    fn slim_account(&self, account: &Account) -> Vec<u8> {
        serde_json::to_vec(account).unwrap_or_default()
    }

    fn keccak(&self, blob: &[u8]) -> H256 {
        H256(Keccak256::digest(blob).into())
    }

    fn scheduler(&self, _root: H256, _sink: HealSink) -> Box<dyn NodeScheduler> {
        Box::new(MockScheduler {
            state: self.heal.clone(),
        })
    }
}

// =============================================================================
// Mock peer
// =============================================================================

#[derive(Debug)]
enum PeerCall {
    AccountRange {
        peer: H256,
        id: u64,
        origin: H256,
        limit: H256,
    },
    StorageRanges {
        peer: H256,
        id: u64,
        accounts: Vec<H256>,
        origin: Option<H256>,
        limit: Option<H256>,
    },
    ByteCodes {
        peer: H256,
        id: u64,
        hashes: Vec<H256>,
    },
    TrieNodes {
        peer: H256,
        id: u64,
        paths: Vec<TriePath>,
    },
}

/// A peer that records every outgoing request; the test body plays the
/// remote side by answering through the delivery callbacks.
#[derive(Clone)]
struct MockPeer {
    id: H256,
    outbox: mpsc::UnboundedSender<PeerCall>,
}

#[async_trait]
impl SnapPeer for MockPeer {
    fn id(&self) -> H256 {
        self.id
    }

    async fn request_account_range(
        &self,
        id: u64,
        _root: H256,
        origin: H256,
        limit: H256,
        _bytes: u64,
    ) -> Result<(), PeerError> {
        let _ = self.outbox.send(PeerCall::AccountRange {
            peer: self.id,
            id,
            origin,
            limit,
        });
        Ok(())
    }

    async fn request_storage_ranges(
        &self,
        id: u64,
        _root: H256,
        accounts: Vec<H256>,
        origin: Option<H256>,
        limit: Option<H256>,
        _bytes: u64,
    ) -> Result<(), PeerError> {
        let _ = self.outbox.send(PeerCall::StorageRanges {
            peer: self.id,
            id,
            accounts,
            origin,
            limit,
        });
        Ok(())
    }

    async fn request_byte_codes(
        &self,
        id: u64,
        hashes: Vec<H256>,
        _bytes: u64,
    ) -> Result<(), PeerError> {
        let _ = self.outbox.send(PeerCall::ByteCodes {
            peer: self.id,
            id,
            hashes,
        });
        Ok(())
    }

    async fn request_trie_nodes(
        &self,
        id: u64,
        _root: H256,
        paths: Vec<TriePath>,
        _bytes: u64,
    ) -> Result<(), PeerError> {
        let _ = self.outbox.send(PeerCall::TrieNodes {
            peer: self.id,
            id,
            paths,
        });
        Ok(())
    }
}

// =============================================================================
// Harness helpers
// =============================================================================

fn keccak(blob: &[u8]) -> H256 {
    H256(Keccak256::digest(blob).into())
}

fn account_blob(account: &Account) -> Bytes {
    serde_json::to_vec(account).unwrap().into()
}

fn plain_account() -> Account {
    Account {
        nonce: 1,
        balance: U256::from(1000u64),
        storage_root: *EMPTY_TRIE_ROOT,
        code_hash: *EMPTY_CODE_HASH,
    }
}

fn hash_of(value: U256) -> H256 {
    H256::from_uint(&value)
}

fn successor(hash: H256) -> H256 {
    hash_of(hash.into_uint() + U256::one())
}

fn new_syncer(
    db: &MemStore,
    backend: &Arc<MockBackend>,
    timeout: Duration,
) -> (
    Syncer<MockPeer>,
    SyncHandle<MockPeer>,
    mpsc::UnboundedReceiver<PeerCall>,
    mpsc::UnboundedSender<PeerCall>,
) {
    let syncer = Syncer::new(
        Arc::new(db.clone()),
        backend.clone(),
        SyncConfig {
            request_timeout: timeout,
            report_interval: Duration::from_secs(3),
        },
    );
    let handle = syncer.handle();
    let (outbox, calls) = mpsc::unbounded_channel();
    (syncer, handle, calls, outbox)
}

fn spawn_sync(
    mut syncer: Syncer<MockPeer>,
    root: H256,
    cancel: CancellationToken,
) -> JoinHandle<(Syncer<MockPeer>, Result<(), SyncError>)> {
    tokio::spawn(async move {
        let result = syncer.sync(root, cancel).await;
        (syncer, result)
    })
}

async fn finish(
    task: JoinHandle<(Syncer<MockPeer>, Result<(), SyncError>)>,
) -> (Syncer<MockPeer>, Result<(), SyncError>) {
    tokio::time::timeout(Duration::from_secs(30), task)
        .await
        .expect("sync did not terminate")
        .expect("sync task panicked")
}

/// Answers an account range request with a well-formed empty range: no
/// leaves in the window, proven complete.
async fn serve_empty_range(handle: &SyncHandle<MockPeer>, peer: H256, id: u64) {
    handle
        .on_accounts(peer, id, vec![], vec![], vec![directive(false)])
        .await
        .unwrap();
}

// =============================================================================
// Scenarios
// =============================================================================

/// Syncing the empty state root completes immediately: nothing is
/// scheduled and nothing is requested.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn empty_state_root_completes_immediately() {
    let db = MemStore::default();
    let backend = Arc::new(MockBackend::default());
    let (syncer, handle, mut calls, outbox) = new_syncer(&db, &backend, Duration::from_secs(15));
    handle
        .register(MockPeer {
            id: H256::repeat_byte(1),
            outbox,
        })
        .unwrap();

    let task = spawn_sync(syncer, *EMPTY_TRIE_ROOT, CancellationToken::new());
    let (syncer, result) = finish(task).await;
    result.unwrap();

    assert_eq!(syncer.stats().account_synced, 0);
    assert!(calls.try_recv().is_err(), "no requests should go out");
}

/// A single account in one of the 16 chunks: every chunk completes, the
/// account and its bytecode land in the store.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn single_account_state_syncs_across_chunks() {
    let db = MemStore::default();
    let backend = Arc::new(MockBackend::default());
    let (syncer, handle, mut calls, outbox) = new_syncer(&db, &backend, Duration::from_secs(15));

    let code = Bytes::from_static(b"contract-bytecode");
    let code_hash = keccak(&code);
    let target = H256::repeat_byte(0xaa);
    let account = Account {
        nonce: 7,
        balance: U256::from(42u64),
        storage_root: *EMPTY_TRIE_ROOT,
        code_hash,
    };

    for peer in [H256::repeat_byte(1), H256::repeat_byte(2)] {
        handle
            .register(MockPeer {
                id: peer,
                outbox: outbox.clone(),
            })
            .unwrap();
    }

    let task = spawn_sync(syncer, H256::repeat_byte(0x42), CancellationToken::new());
    let driver = {
        let handle = handle.clone();
        let account = account.clone();
        let code = code.clone();
        tokio::spawn(async move {
            let mut range_requests = 0usize;
            while let Some(call) = calls.recv().await {
                match call {
                    PeerCall::AccountRange {
                        peer,
                        id,
                        origin,
                        limit,
                    } => {
                        range_requests += 1;
                        if origin <= target && target <= limit {
                            handle
                                .on_accounts(
                                    peer,
                                    id,
                                    vec![target],
                                    vec![account_blob(&account)],
                                    vec![directive(false)],
                                )
                                .await
                                .unwrap();
                        } else {
                            serve_empty_range(&handle, peer, id).await;
                        }
                    }
                    PeerCall::ByteCodes { peer, id, hashes } => {
                        assert_eq!(hashes, vec![keccak(&code)]);
                        handle.on_byte_codes(peer, id, vec![code.clone()]).await.unwrap();
                    }
                    other => panic!("unexpected request: {other:?}"),
                }
            }
            range_requests
        })
    };

    let (syncer, result) = finish(task).await;
    result.unwrap();
    driver.abort();

    let stats = syncer.stats();
    assert_eq!(stats.account_synced, 1);
    assert_eq!(stats.bytecode_synced, 1);

    let store = db.0.lock();
    assert!(store.account_snapshots.contains_key(&target));
    assert_eq!(store.codes.get(&code_hash), Some(&code));
    // The account's "interior node" was finalized and persisted.
    assert!(store.trie_nodes.contains_key(&target));
    // Terminal progress has no remaining tasks.
    let progress: SyncProgress =
        serde_json::from_slice(store.progress.as_ref().unwrap()).unwrap();
    assert!(progress.tasks.is_empty());
    assert_eq!(progress.account_synced, 1);
}

/// A response overflowing past the task boundary is trimmed; the trimmed
/// leaves are neither persisted as nodes nor as snapshot records.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn overflowing_range_is_trimmed() {
    let db = MemStore::default();
    let backend = Arc::new(MockBackend::default());
    let (syncer, handle, mut calls, outbox) = new_syncer(&db, &backend, Duration::from_secs(15));
    handle
        .register(MockPeer {
            id: H256::repeat_byte(1),
            outbox,
        })
        .unwrap();

    let inside = H256::from_low_u64_be(0x0101);
    let account = plain_account();

    let task = spawn_sync(syncer, H256::repeat_byte(0x42), CancellationToken::new());
    let driver = {
        let handle = handle.clone();
        let account = account.clone();
        tokio::spawn(async move {
            let mut first = true;
            while let Some(call) = calls.recv().await {
                match call {
                    PeerCall::AccountRange {
                        peer,
                        id,
                        origin: _,
                        limit,
                    } => {
                        if first {
                            first = false;
                            // One leaf inside the window, one past it. The
                            // peer claims a continuation which the trim
                            // must override.
                            let outside = successor(limit);
                            handle
                                .on_accounts(
                                    peer,
                                    id,
                                    vec![inside, outside],
                                    vec![account_blob(&account), account_blob(&account)],
                                    vec![directive(true)],
                                )
                                .await
                                .unwrap();
                        } else {
                            serve_empty_range(&handle, peer, id).await;
                        }
                    }
                    other => panic!("unexpected request: {other:?}"),
                }
            }
        })
    };

    let (syncer, result) = finish(task).await;
    result.unwrap();
    driver.abort();

    assert_eq!(syncer.stats().account_synced, 1);
    let store = db.0.lock();
    assert!(store.trie_nodes.contains_key(&inside));
    assert!(store.account_snapshots.contains_key(&inside));
    // Nothing past the task boundary may be persisted here.
    assert_eq!(store.trie_nodes.len(), 1);
    assert_eq!(store.account_snapshots.len(), 1);
}

/// Dropping a peer mid-flight reverts its request; a newly registered peer
/// picks up the exact same fragment.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn peer_drop_reverts_and_reassigns() {
    let db = MemStore::default();
    let backend = Arc::new(MockBackend::default());
    let (syncer, handle, mut calls, outbox) = new_syncer(&db, &backend, Duration::from_secs(15));

    let peer_p = H256::repeat_byte(1);
    let peer_q = H256::repeat_byte(2);
    handle
        .register(MockPeer {
            id: peer_p,
            outbox: outbox.clone(),
        })
        .unwrap();

    let task = spawn_sync(syncer, H256::repeat_byte(0x42), CancellationToken::new());

    // First request lands on P; drop P before answering.
    let first = tokio::time::timeout(Duration::from_secs(5), calls.recv())
        .await
        .unwrap()
        .unwrap();
    let PeerCall::AccountRange { peer, origin, limit, .. } = first else {
        panic!("expected an account range request");
    };
    assert_eq!(peer, peer_p);
    handle.unregister(peer_p).unwrap();

    // A new peer becomes eligible and receives the reverted fragment.
    handle
        .register(MockPeer {
            id: peer_q,
            outbox: outbox.clone(),
        })
        .unwrap();

    let windows: Arc<Mutex<Vec<(H256, H256)>>> = Arc::new(Mutex::new(Vec::new()));
    let driver = {
        let handle = handle.clone();
        let windows = windows.clone();
        tokio::spawn(async move {
            while let Some(call) = calls.recv().await {
                match call {
                    PeerCall::AccountRange {
                        peer,
                        id,
                        origin,
                        limit,
                    } => {
                        assert_eq!(peer, peer_q, "dropped peer must not be assigned");
                        windows.lock().push((origin, limit));
                        serve_empty_range(&handle, peer, id).await;
                    }
                    other => panic!("unexpected request: {other:?}"),
                }
            }
        })
    };

    let (_, result) = finish(task).await;
    result.unwrap();
    driver.abort();

    // The reverted fragment went back out with its window untouched.
    assert!(
        windows.lock().contains(&(origin, limit)),
        "abandoned fragment was never reassigned"
    );
}

/// A request that times out is reverted; the late delivery finds its id
/// gone from the live table and is dropped silently.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn timeout_reverts_and_late_reply_is_dropped() {
    let db = MemStore::default();
    let backend = Arc::new(MockBackend::default());
    let (syncer, handle, mut calls, outbox) =
        new_syncer(&db, &backend, Duration::from_millis(150));
    let peer = H256::repeat_byte(1);
    handle
        .register(MockPeer {
            id: peer,
            outbox,
        })
        .unwrap();

    // The target sits in the first chunk, so the withheld request is the
    // one that would deliver it.
    let target = H256::from_low_u64_be(5);
    let account = plain_account();

    let task = spawn_sync(syncer, H256::repeat_byte(0x42), CancellationToken::new());

    // Withhold the first answer until well past the timeout.
    let first = tokio::time::timeout(Duration::from_secs(5), calls.recv())
        .await
        .unwrap()
        .unwrap();
    let PeerCall::AccountRange { id: stale_id, origin, limit, .. } = first else {
        panic!("expected an account range request");
    };
    tokio::time::sleep(Duration::from_millis(400)).await;

    // The late reply is silently dropped (its id was reverted), but it
    // does mark the peer idle again.
    if origin <= target && target <= limit {
        handle
            .on_accounts(
                peer,
                stale_id,
                vec![target],
                vec![account_blob(&account)],
                vec![directive(false)],
            )
            .await
            .unwrap();
    } else {
        serve_empty_range(&handle, peer, stale_id).await;
    }

    let driver = {
        let handle = handle.clone();
        let account = account.clone();
        tokio::spawn(async move {
            let mut replayed = false;
            while let Some(call) = calls.recv().await {
                match call {
                    PeerCall::AccountRange {
                        peer,
                        id,
                        origin,
                        limit,
                    } => {
                        if origin <= target && target <= limit {
                            replayed = true;
                            handle
                                .on_accounts(
                                    peer,
                                    id,
                                    vec![target],
                                    vec![account_blob(&account)],
                                    vec![directive(false)],
                                )
                                .await
                                .unwrap();
                        } else {
                            serve_empty_range(&handle, peer, id).await;
                        }
                    }
                    other => panic!("unexpected request: {other:?}"),
                }
            }
            replayed
        })
    };

    let (syncer, result) = finish(task).await;
    result.unwrap();
    driver.abort();

    // The dropped reply was not double counted.
    assert_eq!(syncer.stats().account_synced, 1);
}

/// An empty-but-well-formed response flags the peer stateless: its request
/// reverts, it receives nothing else this cycle, and no error surfaces.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stateless_peer_is_excluded_for_the_cycle() {
    let db = MemStore::default();
    let backend = Arc::new(MockBackend::default());
    let (syncer, handle, mut calls, outbox) = new_syncer(&db, &backend, Duration::from_secs(15));
    let peer_p = H256::repeat_byte(1);
    let peer_q = H256::repeat_byte(2);
    handle
        .register(MockPeer {
            id: peer_p,
            outbox: outbox.clone(),
        })
        .unwrap();

    let task = spawn_sync(syncer, H256::repeat_byte(0x42), CancellationToken::new());

    let first = tokio::time::timeout(Duration::from_secs(5), calls.recv())
        .await
        .unwrap()
        .unwrap();
    let PeerCall::AccountRange { peer, id, .. } = first else {
        panic!("expected an account range request");
    };
    assert_eq!(peer, peer_p);
    // Rejection: empty hashes, accounts and proof.
    handle
        .on_accounts(peer, id, vec![], vec![], vec![])
        .await
        .unwrap();

    handle
        .register(MockPeer {
            id: peer_q,
            outbox: outbox.clone(),
        })
        .unwrap();

    let driver = {
        let handle = handle.clone();
        tokio::spawn(async move {
            while let Some(call) = calls.recv().await {
                match call {
                    PeerCall::AccountRange { peer, id, .. } => {
                        assert_eq!(peer, peer_q, "stateless peer must be skipped");
                        serve_empty_range(&handle, peer, id).await;
                    }
                    other => panic!("unexpected request: {other:?}"),
                }
            }
        })
    };

    let (_, result) = finish(task).await;
    result.unwrap();
    driver.abort();
}

/// A storage trie too large for one response is split into 16 subtasks;
/// the first resumes right after the delivered slots and the chunks are
/// consumed serially.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn large_contract_storage_is_chunked() {
    let db = MemStore::default();
    let backend = Arc::new(MockBackend::default());
    let (syncer, handle, mut calls, outbox) = new_syncer(&db, &backend, Duration::from_secs(15));
    handle
        .register(MockPeer {
            id: H256::repeat_byte(1),
            outbox,
        })
        .unwrap();

    let contract = H256::repeat_byte(0x55);
    let storage_root = H256::repeat_byte(0x77);
    let account = Account {
        nonce: 1,
        balance: U256::zero(),
        storage_root,
        code_hash: *EMPTY_CODE_HASH,
    };
    let slot_value = Bytes::from_static(b"slot-value");

    // One slot low in the keyspace triggers the chunked continuation; one
    // more in every sixteenth of the keyspace keeps each subtask busy.
    let first_slot = H256::from_low_u64_be(1);
    let spread: Vec<H256> = (0..16u64)
        .map(|k| hash_of((U256::from(k) << 252usize) + U256::from(1000u64)))
        .collect();

    let windows: Arc<Mutex<Vec<(Option<H256>, Option<H256>)>>> = Arc::new(Mutex::new(Vec::new()));
    let task = spawn_sync(syncer, H256::repeat_byte(0x42), CancellationToken::new());
    let driver = {
        let handle = handle.clone();
        let account = account.clone();
        let spread = spread.clone();
        let slot_value = slot_value.clone();
        let windows = windows.clone();
        tokio::spawn(async move {
            while let Some(call) = calls.recv().await {
                match call {
                    PeerCall::AccountRange {
                        peer,
                        id,
                        origin,
                        limit,
                    } => {
                        if origin <= contract && contract <= limit {
                            handle
                                .on_accounts(
                                    peer,
                                    id,
                                    vec![contract],
                                    vec![account_blob(&account)],
                                    vec![directive(false)],
                                )
                                .await
                                .unwrap();
                        } else {
                            serve_empty_range(&handle, peer, id).await;
                        }
                    }
                    PeerCall::StorageRanges {
                        peer,
                        id,
                        accounts,
                        origin,
                        limit,
                    } => {
                        assert_eq!(accounts, vec![contract]);
                        windows.lock().push((origin, limit));
                        match origin {
                            None => {
                                // Initial batched request: deliver one slot
                                // and signal a continuation.
                                handle
                                    .on_storage(
                                        peer,
                                        id,
                                        vec![vec![first_slot]],
                                        vec![vec![slot_value.clone()]],
                                        vec![directive(true)],
                                    )
                                    .await
                                    .unwrap();
                            }
                            Some(origin) => {
                                let limit = limit.unwrap();
                                let in_window: Vec<H256> = spread
                                    .iter()
                                    .copied()
                                    .filter(|slot| origin <= *slot && *slot <= limit)
                                    .collect();
                                let values =
                                    vec![slot_value.clone(); in_window.len()];
                                handle
                                    .on_storage(
                                        peer,
                                        id,
                                        vec![in_window],
                                        vec![values],
                                        vec![directive(false)],
                                    )
                                    .await
                                    .unwrap();
                            }
                        }
                    }
                    other => panic!("unexpected request: {other:?}"),
                }
            }
        })
    };

    let (syncer, result) = finish(task).await;
    result.unwrap();
    driver.abort();

    let stats = syncer.stats();
    assert_eq!(stats.account_synced, 1);
    assert_eq!(stats.storage_synced, 17);

    // One initial batched request plus one per subtask, consumed serially
    // in keyspace order; the first subtask resumes right after the slots
    // already delivered and the final chunk is stretched to the top.
    let windows = windows.lock();
    assert_eq!(windows.len(), 17);
    assert_eq!(windows[0], (None, None));
    assert_eq!(windows[1].0, Some(successor(first_slot)));
    let origins: Vec<H256> = windows[1..].iter().map(|(origin, _)| origin.unwrap()).collect();
    let mut sorted = origins.clone();
    sorted.sort();
    assert_eq!(origins, sorted, "subtasks must be consumed in order");
    assert_eq!(windows.last().unwrap().1, Some(HASH_MAX));

    let store = db.0.lock();
    // Every delivered slot has a flat snapshot record.
    assert!(store.storage_snapshots.contains_key(&(contract, first_slot)));
    for slot in &spread {
        assert!(store.storage_snapshots.contains_key(&(contract, *slot)));
    }
    // The chunked account was marked for healing, so its own account node
    // is withheld from the trie while its snapshot is persisted.
    assert!(store.account_snapshots.contains_key(&contract));
    assert!(!store.trie_nodes.contains_key(&contract));
}

/// Cancellation surfaces as `Cancelled` and persists resumable progress.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancellation_persists_progress() {
    let db = MemStore::default();
    let backend = Arc::new(MockBackend::default());
    let (syncer, _handle, _calls, _outbox) = new_syncer(&db, &backend, Duration::from_secs(15));

    let cancel = CancellationToken::new();
    let task = spawn_sync(syncer, H256::repeat_byte(0x42), cancel.clone());
    tokio::time::sleep(Duration::from_millis(50)).await;
    cancel.cancel();

    let (_, result) = finish(task).await;
    let err = result.unwrap_err();
    assert!(matches!(err, SyncError::Cancelled));
    assert!(err.is_recoverable());

    let store = db.0.lock();
    let progress: SyncProgress =
        serde_json::from_slice(store.progress.as_ref().unwrap()).unwrap();
    // All 16 chunks survive untouched for the next cycle.
    assert_eq!(progress.tasks.len(), 16);
    assert_eq!(progress.tasks[0].next, H256::zero());
    assert_eq!(progress.tasks.last().unwrap().last, HASH_MAX);
}

/// Resuming from persisted progress skips finalized ranges and refreshes
/// suspended subtask roots from the fresh account data.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn resume_refreshes_suspended_subtask_roots() {
    let db = MemStore::default();
    let backend = Arc::new(MockBackend::default());

    let contract = H256::repeat_byte(0x55);
    let resume_from = H256::repeat_byte(0x10);
    let sub_next = H256::repeat_byte(0x20);
    let new_root = H256::repeat_byte(0x99);

    // Persist a single suspended task with one in-progress subtask whose
    // root belongs to the previous cycle.
    {
        let mut sub_tasks = std::collections::BTreeMap::new();
        sub_tasks.insert(
            contract,
            vec![snap_sync::StorageTask {
                id: 0,
                next: sub_next,
                last: HASH_MAX,
                root: H256::zero(),
                req: None,
                done: false,
            }],
        );
        let progress = SyncProgress {
            tasks: vec![snap_sync::AccountTask {
                id: 0,
                next: resume_from,
                last: HASH_MAX,
                sub_tasks,
                req: None,
                res: None,
                pend: 0,
                need_code: Vec::new(),
                need_state: Vec::new(),
                need_heal: Vec::new(),
                code_tasks: HashSet::new(),
                state_tasks: HashMap::new(),
                done: false,
            }],
            account_synced: 7,
            ..Default::default()
        };
        db.write_progress(serde_json::to_vec(&progress).unwrap())
            .unwrap();
    }

    let (syncer, handle, mut calls, outbox) = new_syncer(&db, &backend, Duration::from_secs(15));
    handle
        .register(MockPeer {
            id: H256::repeat_byte(1),
            outbox,
        })
        .unwrap();

    let account = Account {
        nonce: 3,
        balance: U256::zero(),
        storage_root: new_root,
        code_hash: *EMPTY_CODE_HASH,
    };
    let slot = H256::repeat_byte(0x30);
    let slot_value = Bytes::from_static(b"resumed-slot");

    let task = spawn_sync(syncer, H256::repeat_byte(0x43), CancellationToken::new());
    let driver = {
        let handle = handle.clone();
        let account = account.clone();
        tokio::spawn(async move {
            while let Some(call) = calls.recv().await {
                match call {
                    PeerCall::AccountRange {
                        peer,
                        id,
                        origin,
                        ..
                    } => {
                        // The finalized prefix must not be re-requested.
                        assert_eq!(origin, resume_from);
                        handle
                            .on_accounts(
                                peer,
                                id,
                                vec![contract],
                                vec![account_blob(&account)],
                                vec![directive(false)],
                            )
                            .await
                            .unwrap();
                    }
                    PeerCall::StorageRanges {
                        peer,
                        id,
                        accounts,
                        origin,
                        ..
                    } => {
                        assert_eq!(accounts, vec![contract]);
                        // The suspended subtask resumes mid-keyspace.
                        assert_eq!(origin, Some(sub_next));
                        handle
                            .on_storage(
                                peer,
                                id,
                                vec![vec![slot]],
                                vec![vec![slot_value.clone()]],
                                vec![directive(false)],
                            )
                            .await
                            .unwrap();
                    }
                    other => panic!("unexpected request: {other:?}"),
                }
            }
        })
    };

    let (syncer, result) = finish(task).await;
    result.unwrap();
    driver.abort();

    let stats = syncer.stats();
    assert_eq!(stats.account_synced, 7 + 1);
    assert_eq!(stats.storage_synced, 1);

    // The subtask's storage was verified against the refreshed root, not
    // the stale persisted one.
    let verified = backend.verified.lock();
    assert!(
        verified
            .iter()
            .any(|(root, origin)| *root == new_root && *origin == sub_next),
        "storage range must verify against the refreshed root"
    );
}

/// A corrupt progress record is treated as no progress at all: the cycle
/// restarts from a fresh 16-way chunking.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn corrupt_progress_restarts_fresh() {
    let db = MemStore::default();
    db.write_progress(b"not json at all".to_vec()).unwrap();
    let backend = Arc::new(MockBackend::default());
    let (syncer, handle, mut calls, outbox) = new_syncer(&db, &backend, Duration::from_secs(15));
    handle
        .register(MockPeer {
            id: H256::repeat_byte(1),
            outbox,
        })
        .unwrap();

    let served = Arc::new(Mutex::new(0usize));
    let task = spawn_sync(syncer, H256::repeat_byte(0x42), CancellationToken::new());
    let driver = {
        let handle = handle.clone();
        let served = served.clone();
        tokio::spawn(async move {
            while let Some(call) = calls.recv().await {
                match call {
                    PeerCall::AccountRange { peer, id, .. } => {
                        *served.lock() += 1;
                        serve_empty_range(&handle, peer, id).await;
                    }
                    other => panic!("unexpected request: {other:?}"),
                }
            }
        })
    };

    let (_, result) = finish(task).await;
    result.unwrap();
    driver.abort();
    assert_eq!(*served.lock(), 16, "fresh chunking must cover all 16 ranges");
}

/// A completed cycle leaves a terminal progress record: re-running against
/// the same root is a no-op that restores the counters.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn completed_cycle_reruns_as_noop() {
    let db = MemStore::default();
    let backend = Arc::new(MockBackend::default());
    let root = H256::repeat_byte(0x42);

    // First cycle: empty-but-proven ranges everywhere, completes cleanly.
    {
        let (syncer, handle, mut calls, outbox) = new_syncer(&db, &backend, Duration::from_secs(15));
        handle
            .register(MockPeer {
                id: H256::repeat_byte(1),
                outbox,
            })
            .unwrap();
        let task = spawn_sync(syncer, root, CancellationToken::new());
        let driver = {
            let handle = handle.clone();
            tokio::spawn(async move {
                while let Some(call) = calls.recv().await {
                    match call {
                        PeerCall::AccountRange { peer, id, .. } => {
                            serve_empty_range(&handle, peer, id).await;
                        }
                        other => panic!("unexpected request: {other:?}"),
                    }
                }
            })
        };
        let (_, result) = finish(task).await;
        result.unwrap();
        driver.abort();
    }

    // Second cycle on the same root: nothing to schedule, no requests.
    let (syncer, handle, mut calls, outbox) = new_syncer(&db, &backend, Duration::from_secs(15));
    handle
        .register(MockPeer {
            id: H256::repeat_byte(1),
            outbox,
        })
        .unwrap();
    let task = spawn_sync(syncer, root, CancellationToken::new());
    let (_, result) = finish(task).await;
    result.unwrap();
    assert!(calls.try_recv().is_err(), "no requests should go out");
}

/// Once the account tasks drain, heal requests retrieve whatever the
/// scheduler reports missing; bytecode deliveries are dispatched to the
/// heal handler by the phase flag.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn heal_phase_drains_the_scheduler() {
    let db = MemStore::default();
    let backend = Arc::new(MockBackend::default());

    let node_data = Bytes::from_static(b"interior-trie-node");
    let node_hash = keccak(&node_data);
    let code_data = Bytes::from_static(b"healed-bytecode");
    let code_hash = keccak(&code_data);
    {
        let mut heal = backend.heal.lock();
        heal.missing_nodes
            .push((node_hash, TriePath(vec![Bytes::from_static(b"\x01\x02")])));
        heal.missing_codes.push(code_hash);
        heal.outstanding.insert(node_hash);
        heal.outstanding.insert(code_hash);
        heal.pending = 2;
    }

    let (syncer, handle, mut calls, outbox) = new_syncer(&db, &backend, Duration::from_secs(15));
    handle
        .register(MockPeer {
            id: H256::repeat_byte(1),
            outbox,
        })
        .unwrap();

    let task = spawn_sync(syncer, H256::repeat_byte(0x42), CancellationToken::new());
    let driver = {
        let handle = handle.clone();
        let node_data = node_data.clone();
        let code_data = code_data.clone();
        tokio::spawn(async move {
            while let Some(call) = calls.recv().await {
                match call {
                    PeerCall::AccountRange { peer, id, .. } => {
                        serve_empty_range(&handle, peer, id).await;
                    }
                    PeerCall::TrieNodes { peer, id, paths } => {
                        assert_eq!(paths.len(), 1);
                        handle
                            .on_trie_nodes(peer, id, vec![node_data.clone()])
                            .await
                            .unwrap();
                    }
                    PeerCall::ByteCodes { peer, id, hashes } => {
                        assert_eq!(hashes, vec![code_hash]);
                        handle
                            .on_byte_codes(peer, id, vec![code_data.clone()])
                            .await
                            .unwrap();
                    }
                    other => panic!("unexpected request: {other:?}"),
                }
            }
        })
    };

    let (syncer, result) = finish(task).await;
    result.unwrap();
    driver.abort();

    let stats = syncer.stats();
    assert_eq!(stats.trienode_heal_synced, 1);
    assert_eq!(stats.bytecode_heal_synced, 1);
    assert_eq!(stats.trienode_heal_dups, 0);

    let store = db.0.lock();
    // The scheduler committed both retrievals through the batch.
    assert!(store.trie_nodes.contains_key(&node_hash));
    assert!(store.trie_nodes.contains_key(&code_hash));
}
