//! The five request assigners.
//!
//! All share one template: skip if no peer is idle for the class, pick the
//! first eligible task, allocate a fresh request id, arm the timeout and
//! fire the network call from a worker context. Only the task-eligibility
//! criterion and the payload shape differ per class.

use std::sync::Arc;

use ethereum_types::H256;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::constants::{
    MAX_CODE_REQUEST_COUNT, MAX_REQUEST_SIZE, MAX_STORAGE_SET_REQUEST_COUNT,
    MAX_TRIE_REQUEST_COUNT,
};
use crate::peer::{RequestKind, SnapPeer};
use crate::request::{
    AccountRangePayload, ByteCodesPayload, BytecodeHealPayload, Request, RequestTimer,
    StorageRangesPayload, TrienodeHealPayload,
};
use crate::task::TaskId;
use crate::trie::TriePath;

use super::Syncer;

impl<P: SnapPeer> Syncer<P> {
    /// Matches idle peers to pending account range retrievals.
    pub(super) fn assign_account_tasks(&mut self, cycle: &CancellationToken) {
        let inner = self.inner.clone();
        let timeout = self.config.request_timeout;
        let mut shared = inner.shared.write();

        if !shared.pool.has_idlers(RequestKind::AccountRange) {
            return;
        }
        for task in self.tasks.iter_mut() {
            // Skip any tasks already filling.
            if task.req.is_some() || task.res.is_some() {
                continue;
            }
            // If no peer is idle (or all idle ones are stateless), abort the
            // entire assignment round.
            let Some(peer_id) = shared.pool.first_idle(RequestKind::AccountRange) else {
                return;
            };
            let Some(peer) = shared.pool.get(&peer_id).cloned() else {
                continue;
            };
            let id = shared.account_reqs.alloc_id();
            let stale = CancellationToken::new();
            let req = Arc::new(Request {
                peer: peer_id,
                id,
                cancel: cycle.clone(),
                stale: stale.clone(),
                timeout: RequestTimer::new(),
                payload: AccountRangePayload {
                    origin: task.next,
                    limit: task.last,
                    task: task.id,
                },
            });
            req.timeout.spawn(timeout, stale, cycle.clone(), {
                let inner = inner.clone();
                let req = req.clone();
                async move {
                    debug!(reqid = req.id, peer = %req.peer, "Account range request timed out");
                    inner.schedule_revert_account(req).await;
                }
            });
            shared.account_reqs.insert(req.clone());
            shared.pool.set_busy(RequestKind::AccountRange, peer_id);
            // Inject the request into the task to block further assignments.
            task.req = Some(id);

            let root = shared.root;
            self.workers.spawn({
                let inner = inner.clone();
                let req = req.clone();
                async move {
                    // Attempt the remote request and revert if it fails.
                    if let Err(err) = peer
                        .request_account_range(
                            req.id,
                            root,
                            req.payload.origin,
                            req.payload.limit,
                            MAX_REQUEST_SIZE,
                        )
                        .await
                    {
                        debug!(error = %err, "Failed to request account range");
                        inner.schedule_revert_account(req).await;
                    }
                }
            });
        }
    }

    /// Matches idle peers to pending code retrievals.
    pub(super) fn assign_bytecode_tasks(&mut self, cycle: &CancellationToken) {
        let inner = self.inner.clone();
        let timeout = self.config.request_timeout;
        let mut shared = inner.shared.write();

        if !shared.pool.has_idlers(RequestKind::ByteCodes) {
            return;
        }
        for task in self.tasks.iter_mut() {
            // Skip any tasks not in the bytecode retrieval phase, or already
            // retrieving (or done with) all their codes.
            if task.res.is_none() || task.code_tasks.is_empty() {
                continue;
            }
            let Some(peer_id) = shared.pool.first_idle(RequestKind::ByteCodes) else {
                return;
            };
            let Some(peer) = shared.pool.get(&peer_id).cloned() else {
                continue;
            };
            let id = shared.bytecode_reqs.alloc_id();

            let hashes: Vec<H256> = task
                .code_tasks
                .iter()
                .take(MAX_CODE_REQUEST_COUNT)
                .copied()
                .collect();
            for hash in &hashes {
                task.code_tasks.remove(hash);
            }
            let stale = CancellationToken::new();
            let req = Arc::new(Request {
                peer: peer_id,
                id,
                cancel: cycle.clone(),
                stale: stale.clone(),
                timeout: RequestTimer::new(),
                payload: ByteCodesPayload {
                    hashes,
                    task: task.id,
                },
            });
            req.timeout.spawn(timeout, stale, cycle.clone(), {
                let inner = inner.clone();
                let req = req.clone();
                async move {
                    debug!(reqid = req.id, peer = %req.peer, "Bytecode request timed out");
                    inner.schedule_revert_bytecodes(req).await;
                }
            });
            shared.bytecode_reqs.insert(req.clone());
            shared.pool.set_busy(RequestKind::ByteCodes, peer_id);

            self.workers.spawn({
                let inner = inner.clone();
                let req = req.clone();
                async move {
                    let hashes = req.payload.hashes.clone();
                    if let Err(err) = peer
                        .request_byte_codes(req.id, hashes, MAX_REQUEST_SIZE)
                        .await
                    {
                        debug!(error = %err, "Failed to request bytecodes");
                        inner.schedule_revert_bytecodes(req).await;
                    }
                }
            });
        }
    }

    /// Matches idle peers to pending storage range retrievals. Large
    /// contract subtasks are consumed one at a time per account; otherwise
    /// small contracts are batched by root.
    pub(super) fn assign_storage_tasks(&mut self, cycle: &CancellationToken) {
        let inner = self.inner.clone();
        let timeout = self.config.request_timeout;
        let mut shared = inner.shared.write();

        if !shared.pool.has_idlers(RequestKind::StorageRanges) {
            return;
        }
        for task in self.tasks.iter_mut() {
            // Skip any tasks not in the storage retrieval phase, or with
            // neither large-contract chunks nor batched roots left.
            if task.res.is_none() || (task.sub_tasks.is_empty() && task.state_tasks.is_empty()) {
                continue;
            }
            let Some(peer_id) = shared.pool.first_idle(RequestKind::StorageRanges) else {
                return;
            };
            let Some(peer) = shared.pool.get(&peer_id).cloned() else {
                continue;
            };
            let id = shared.storage_reqs.alloc_id();

            // If there are large contract chunks pending, complete those
            // before diving into even more new contracts.
            let mut accounts = Vec::with_capacity(MAX_STORAGE_SET_REQUEST_COUNT);
            let mut roots = Vec::with_capacity(MAX_STORAGE_SET_REQUEST_COUNT);
            let mut subtask: Option<(H256, TaskId, H256, H256)> = None;
            'chunks: for (account, subtasks) in task.sub_tasks.iter() {
                // Chunks of one contract are consumed serially: while one is
                // in flight, the rest of that account's list waits.
                if subtasks.iter().any(|sub| sub.req.is_some()) {
                    continue;
                }
                for sub in subtasks {
                    accounts.push(*account);
                    roots.push(sub.root);
                    subtask = Some((*account, sub.id, sub.next, sub.last));
                    // Large contract chunks are downloaded individually.
                    break 'chunks;
                }
            }
            if subtask.is_none() {
                // No large contract retrieval required, batch small ones.
                let selected: Vec<(H256, H256)> = task
                    .state_tasks
                    .iter()
                    .take(MAX_STORAGE_SET_REQUEST_COUNT)
                    .map(|(account, root)| (*account, *root))
                    .collect();
                for (account, root) in selected {
                    task.state_tasks.remove(&account);
                    accounts.push(account);
                    roots.push(root);
                }
            }
            // If nothing was found, the task is already fully retrieving,
            // but large contracts are hard to detect. Skip to the next.
            if accounts.is_empty() {
                continue;
            }
            let (origin, limit) = subtask
                .map(|(_, _, next, last)| (next, last))
                .unwrap_or_default();
            let stale = CancellationToken::new();
            let req = Arc::new(Request {
                peer: peer_id,
                id,
                cancel: cycle.clone(),
                stale: stale.clone(),
                timeout: RequestTimer::new(),
                payload: StorageRangesPayload {
                    accounts: accounts.clone(),
                    roots,
                    origin,
                    limit,
                    main_task: task.id,
                    sub_task: subtask.map(|(account, sub_id, _, _)| (account, sub_id)),
                },
            });
            req.timeout.spawn(timeout, stale, cycle.clone(), {
                let inner = inner.clone();
                let req = req.clone();
                async move {
                    debug!(reqid = req.id, peer = %req.peer, "Storage request timed out");
                    inner.schedule_revert_storage(req).await;
                }
            });
            shared.storage_reqs.insert(req.clone());
            shared.pool.set_busy(RequestKind::StorageRanges, peer_id);
            // Inject the request into the subtask to block further
            // assignments.
            if let Some((account, sub_id, _, _)) = subtask {
                if let Some(subtasks) = task.sub_tasks.get_mut(&account) {
                    if let Some(sub) = subtasks.iter_mut().find(|sub| sub.id == sub_id) {
                        sub.req = Some(id);
                    }
                }
            }

            let root = shared.root;
            let window = subtask.map(|(_, _, next, last)| (next, last));
            self.workers.spawn({
                let inner = inner.clone();
                let req = req.clone();
                async move {
                    if let Err(err) = peer
                        .request_storage_ranges(
                            req.id,
                            root,
                            accounts,
                            window.map(|(next, _)| next),
                            window.map(|(_, last)| last),
                            MAX_REQUEST_SIZE,
                        )
                        .await
                    {
                        debug!(error = %err, "Failed to request storage ranges");
                        inner.schedule_revert_storage(req).await;
                    }
                }
            });
        }
    }

    /// Matches idle peers to trie node requests healing the gaps left by
    /// the chunked retrieval model.
    pub(super) fn assign_trienode_heal_tasks(&mut self, cycle: &CancellationToken) {
        let inner = self.inner.clone();
        let timeout = self.config.request_timeout;
        let Some(healer) = self.healer.as_mut() else {
            return;
        };
        let mut shared = inner.shared.write();

        if !shared.pool.has_idlers(RequestKind::TrienodeHeal) {
            return;
        }
        while !healer.trie_tasks.is_empty() || healer.scheduler.pending() > 0 {
            // Keep the queues topped up from the scheduler. Trie nodes and
            // bytecodes are scheduled together, so refill them combined.
            let have = healer.trie_tasks.len() + healer.code_tasks.len();
            let want = MAX_TRIE_REQUEST_COUNT + MAX_CODE_REQUEST_COUNT;
            if have < want {
                let missing = healer.scheduler.missing(want - have);
                for (hash, path) in missing
                    .node_hashes
                    .into_iter()
                    .zip(missing.node_paths.into_iter())
                {
                    healer.trie_tasks.insert(hash, path);
                }
                for hash in missing.code_hashes {
                    healer.code_tasks.insert(hash);
                }
            }
            // If all the heal tasks are bytecodes or already running, bail.
            if healer.trie_tasks.is_empty() {
                return;
            }
            let Some(peer_id) = shared.pool.first_idle(RequestKind::TrienodeHeal) else {
                return;
            };
            let Some(peer) = shared.pool.get(&peer_id).cloned() else {
                return;
            };
            let id = shared.trienode_heal_reqs.alloc_id();

            let selected: Vec<(H256, TriePath)> = healer
                .trie_tasks
                .iter()
                .take(MAX_TRIE_REQUEST_COUNT)
                .map(|(hash, path)| (*hash, path.clone()))
                .collect();
            let mut hashes = Vec::with_capacity(selected.len());
            let mut paths = Vec::with_capacity(selected.len());
            for (hash, path) in selected {
                healer.trie_tasks.remove(&hash);
                hashes.push(hash);
                paths.push(path);
            }
            let stale = CancellationToken::new();
            let req = Arc::new(Request {
                peer: peer_id,
                id,
                cancel: cycle.clone(),
                stale: stale.clone(),
                timeout: RequestTimer::new(),
                payload: TrienodeHealPayload { hashes, paths },
            });
            req.timeout.spawn(timeout, stale, cycle.clone(), {
                let inner = inner.clone();
                let req = req.clone();
                async move {
                    debug!(reqid = req.id, peer = %req.peer, "Trienode heal request timed out");
                    inner.schedule_revert_trienode_heal(req).await;
                }
            });
            shared.trienode_heal_reqs.insert(req.clone());
            shared.pool.set_busy(RequestKind::TrienodeHeal, peer_id);

            let root = shared.root;
            self.workers.spawn({
                let inner = inner.clone();
                let req = req.clone();
                async move {
                    let paths = req.payload.paths.clone();
                    if let Err(err) = peer
                        .request_trie_nodes(req.id, root, paths, MAX_REQUEST_SIZE)
                        .await
                    {
                        debug!(error = %err, "Failed to request trienode healers");
                        inner.schedule_revert_trienode_heal(req).await;
                    }
                }
            });
        }
    }

    /// Matches idle peers to bytecode requests healing references found by
    /// the scheduler while walking the trie.
    pub(super) fn assign_bytecode_heal_tasks(&mut self, cycle: &CancellationToken) {
        let inner = self.inner.clone();
        let timeout = self.config.request_timeout;
        let Some(healer) = self.healer.as_mut() else {
            return;
        };
        let mut shared = inner.shared.write();

        if !shared.pool.has_idlers(RequestKind::BytecodeHeal) {
            return;
        }
        while !healer.code_tasks.is_empty() || healer.scheduler.pending() > 0 {
            let have = healer.trie_tasks.len() + healer.code_tasks.len();
            let want = MAX_TRIE_REQUEST_COUNT + MAX_CODE_REQUEST_COUNT;
            if have < want {
                let missing = healer.scheduler.missing(want - have);
                for (hash, path) in missing
                    .node_hashes
                    .into_iter()
                    .zip(missing.node_paths.into_iter())
                {
                    healer.trie_tasks.insert(hash, path);
                }
                for hash in missing.code_hashes {
                    healer.code_tasks.insert(hash);
                }
            }
            // If all the heal tasks are trie nodes or already running, bail.
            if healer.code_tasks.is_empty() {
                return;
            }
            let Some(peer_id) = shared.pool.first_idle(RequestKind::BytecodeHeal) else {
                return;
            };
            let Some(peer) = shared.pool.get(&peer_id).cloned() else {
                return;
            };
            let id = shared.bytecode_heal_reqs.alloc_id();

            let hashes: Vec<H256> = healer
                .code_tasks
                .iter()
                .take(MAX_CODE_REQUEST_COUNT)
                .copied()
                .collect();
            for hash in &hashes {
                healer.code_tasks.remove(hash);
            }
            let stale = CancellationToken::new();
            let req = Arc::new(Request {
                peer: peer_id,
                id,
                cancel: cycle.clone(),
                stale: stale.clone(),
                timeout: RequestTimer::new(),
                payload: BytecodeHealPayload { hashes },
            });
            req.timeout.spawn(timeout, stale, cycle.clone(), {
                let inner = inner.clone();
                let req = req.clone();
                async move {
                    debug!(reqid = req.id, peer = %req.peer, "Bytecode heal request timed out");
                    inner.schedule_revert_bytecode_heal(req).await;
                }
            });
            shared.bytecode_heal_reqs.insert(req.clone());
            shared.pool.set_busy(RequestKind::BytecodeHeal, peer_id);

            self.workers.spawn({
                let inner = inner.clone();
                let req = req.clone();
                async move {
                    let hashes = req.payload.hashes.clone();
                    if let Err(err) = peer
                        .request_byte_codes(req.id, hashes, MAX_REQUEST_SIZE)
                        .await
                    {
                        debug!(error = %err, "Failed to request bytecode healers");
                        inner.schedule_revert_bytecode_heal(req).await;
                    }
                }
            });
        }
    }
}
