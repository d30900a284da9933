//! The revert protocol.
//!
//! `schedule_revert_*` is callable from any context: it posts the request
//! onto the class failure channel, giving up silently if the cycle was
//! cancelled or the request already went stale. `revert_*` runs on the
//! event loop only: it is idempotent through the stale token and returns
//! the request's task fragments to the pending queues for reassignment.

use std::sync::Arc;

use ethereum_types::H256;
use tracing::{debug, trace};

use crate::peer::SnapPeer;
use crate::request::{
    AccountRequest, ByteCodesRequest, BytecodeHealRequest, StorageRangesRequest,
    TrienodeHealRequest,
};

use super::{Inner, Syncer, guarded_send};

impl<P: SnapPeer> Inner<P> {
    pub(crate) async fn schedule_revert_account(&self, req: Arc<AccountRequest>) {
        let tx = self.shared.read().tx.account_fails.clone();
        let (cancel, stale) = (req.cancel.clone(), req.stale.clone());
        guarded_send(tx, cancel, stale, req).await;
    }

    pub(crate) async fn schedule_revert_bytecodes(&self, req: Arc<ByteCodesRequest>) {
        let tx = self.shared.read().tx.bytecode_fails.clone();
        let (cancel, stale) = (req.cancel.clone(), req.stale.clone());
        guarded_send(tx, cancel, stale, req).await;
    }

    pub(crate) async fn schedule_revert_storage(&self, req: Arc<StorageRangesRequest>) {
        let tx = self.shared.read().tx.storage_fails.clone();
        let (cancel, stale) = (req.cancel.clone(), req.stale.clone());
        guarded_send(tx, cancel, stale, req).await;
    }

    pub(crate) async fn schedule_revert_trienode_heal(&self, req: Arc<TrienodeHealRequest>) {
        let tx = self.shared.read().tx.trienode_heal_fails.clone();
        let (cancel, stale) = (req.cancel.clone(), req.stale.clone());
        guarded_send(tx, cancel, stale, req).await;
    }

    pub(crate) async fn schedule_revert_bytecode_heal(&self, req: Arc<BytecodeHealRequest>) {
        let tx = self.shared.read().tx.bytecode_heal_fails.clone();
        let (cancel, stale) = (req.cancel.clone(), req.stale.clone());
        guarded_send(tx, cancel, stale, req).await;
    }
}

impl<P: SnapPeer> Syncer<P> {
    /// Locates all pending requests assigned to a dropped peer and reverts
    /// them, rescheduling their fragments onto other peers.
    pub(super) fn revert_peer_requests(&mut self, peer: H256) {
        let (accounts, bytecodes, storages, trienode_heals, bytecode_heals) = {
            let shared = self.inner.shared.read();
            (
                shared.account_reqs.for_peer(peer),
                shared.bytecode_reqs.for_peer(peer),
                shared.storage_reqs.for_peer(peer),
                shared.trienode_heal_reqs.for_peer(peer),
                shared.bytecode_heal_reqs.for_peer(peer),
            )
        };
        for req in accounts {
            self.revert_account_request(&req);
        }
        for req in bytecodes {
            self.revert_bytecode_request(&req);
        }
        for req in storages {
            self.revert_storage_request(&req);
        }
        for req in trienode_heals {
            self.revert_trienode_heal_request(&req);
        }
        for req in bytecode_heals {
            self.revert_bytecode_heal_request(&req);
        }
    }

    pub(super) fn revert_account_request(&mut self, req: &AccountRequest) {
        debug!(peer = %req.peer, reqid = req.id, "Reverting account range request");
        if req.stale.is_cancelled() {
            trace!(peer = %req.peer, reqid = req.id, "Account range request already reverted");
            return;
        }
        req.stale.cancel();
        self.inner.shared.write().account_reqs.remove(req.id);
        req.timeout.stop();

        // Mark the account task as not-pending, ready for rescheduling.
        if let Some(task) = self.tasks.iter_mut().find(|task| task.id == req.payload.task) {
            if task.req == Some(req.id) {
                task.req = None;
            }
        }
    }

    pub(super) fn revert_bytecode_request(&mut self, req: &ByteCodesRequest) {
        debug!(peer = %req.peer, reqid = req.id, "Reverting bytecode request");
        if req.stale.is_cancelled() {
            trace!(peer = %req.peer, reqid = req.id, "Bytecode request already reverted");
            return;
        }
        req.stale.cancel();
        self.inner.shared.write().bytecode_reqs.remove(req.id);
        req.timeout.stop();

        // Return the code retrievals to the pending queue.
        if let Some(task) = self.tasks.iter_mut().find(|task| task.id == req.payload.task) {
            for hash in &req.payload.hashes {
                task.code_tasks.insert(*hash);
            }
        }
    }

    pub(super) fn revert_storage_request(&mut self, req: &StorageRangesRequest) {
        debug!(peer = %req.peer, reqid = req.id, "Reverting storage request");
        if req.stale.is_cancelled() {
            trace!(peer = %req.peer, reqid = req.id, "Storage request already reverted");
            return;
        }
        req.stale.cancel();
        self.inner.shared.write().storage_reqs.remove(req.id);
        req.timeout.stop();

        // Return the large-contract chunk or the batched roots to the
        // pending queues.
        let Some(task) = self
            .tasks
            .iter_mut()
            .find(|task| task.id == req.payload.main_task)
        else {
            return;
        };
        if let Some((account, sub_id)) = req.payload.sub_task {
            if let Some(subtasks) = task.sub_tasks.get_mut(&account) {
                if let Some(sub) = subtasks.iter_mut().find(|sub| sub.id == sub_id) {
                    if sub.req == Some(req.id) {
                        sub.req = None;
                    }
                }
            }
        } else {
            for (idx, account) in req.payload.accounts.iter().enumerate() {
                task.state_tasks.insert(*account, req.payload.roots[idx]);
            }
        }
    }

    pub(super) fn revert_trienode_heal_request(&mut self, req: &TrienodeHealRequest) {
        debug!(peer = %req.peer, reqid = req.id, "Reverting trienode heal request");
        if req.stale.is_cancelled() {
            trace!(peer = %req.peer, reqid = req.id, "Trienode heal request already reverted");
            return;
        }
        req.stale.cancel();
        self.inner.shared.write().trienode_heal_reqs.remove(req.id);
        req.timeout.stop();

        if let Some(healer) = self.healer.as_mut() {
            for (idx, hash) in req.payload.hashes.iter().enumerate() {
                healer
                    .trie_tasks
                    .insert(*hash, req.payload.paths[idx].clone());
            }
        }
    }

    pub(super) fn revert_bytecode_heal_request(&mut self, req: &BytecodeHealRequest) {
        debug!(peer = %req.peer, reqid = req.id, "Reverting bytecode heal request");
        if req.stale.is_cancelled() {
            trace!(peer = %req.peer, reqid = req.id, "Bytecode heal request already reverted");
            return;
        }
        req.stale.cancel();
        self.inner.shared.write().bytecode_heal_reqs.remove(req.id);
        req.timeout.stop();

        if let Some(healer) = self.healer.as_mut() {
            for hash in &req.payload.hashes {
                healer.code_tasks.insert(*hash);
            }
        }
    }
}
