//! Transport-facing delivery callbacks.
//!
//! These run on the caller's context, never on the event loop. They mark
//! the peer idle, correlate the delivery to its live request, stop the
//! timeout (yielding to a pending revert if it already fired), verify the
//! payload cryptographically and publish the validated response to the
//! loop, guarded so a worker can never block past cycle teardown.

use std::collections::HashSet;

use bytes::Bytes;
use ethereum_types::H256;
use tracing::{debug, trace, warn};

use crate::error::SyncError;
use crate::peer::{RequestKind, SnapPeer};
use crate::request::{
    AccountResponse, ByteCodesResponse, BytecodeHealResponse, StorageRangesResponse,
    TrienodeHealResponse,
};

use super::{SyncHandle, guarded_send};

impl<P: SnapPeer> SyncHandle<P> {
    /// Delivery callback for a range of accounts.
    pub async fn on_accounts(
        &self,
        peer: H256,
        id: u64,
        hashes: Vec<H256>,
        accounts: Vec<Bytes>,
        proof: Vec<Bytes>,
    ) -> Result<(), SyncError> {
        trace!(
            peer = %peer,
            reqid = id,
            hashes = hashes.len(),
            accounts = accounts.len(),
            proofs = proof.len(),
            "Delivering range of accounts"
        );
        let mut reject = false;
        let (req, root, resps) = {
            let mut shared = self.inner.shared.write();
            // Whether or not the response is valid, the peer can serve
            // again; an invalid response drops it in a bit anyway.
            shared.pool.set_idle(RequestKind::AccountRange, peer);
            let _ = shared.tx.update.try_send(());

            let Some(req) = shared.account_reqs.remove(id) else {
                // Stale: the peer timed out but came through in the end.
                warn!(peer = %peer, reqid = id, "Unexpected account range packet");
                return Ok(());
            };
            if !req.timeout.stop() {
                // The timeout already fired; a revert is en route.
                return Ok(());
            }
            if hashes.is_empty() && accounts.is_empty() && proof.is_empty() {
                // The peer has no state for this root: pruned remotely, or
                // not yet synced to our head.
                debug!(peer = %peer, root = %shared.root, "Peer rejected account range request");
                shared.pool.set_stateless(peer);
                reject = true;
            }
            (req, shared.root, shared.tx.account_resps.clone())
        };
        if reject {
            self.inner.schedule_revert_account(req).await;
            return Ok(());
        }
        // Reconstruct a partial trie from the response and verify it.
        let verified = match self.backend.verify_range(
            root,
            req.payload.origin,
            &hashes,
            &accounts,
            &proof,
        ) {
            Ok(verified) => verified,
            Err(err) => {
                warn!(peer = %peer, reqid = id, error = %err, "Account range failed proof");
                self.inner.schedule_revert_account(req).await;
                return Err(err.into());
            }
        };
        let mut decoded = Vec::with_capacity(accounts.len());
        for blob in &accounts {
            match self.backend.decode_account(blob) {
                Ok(account) => decoded.push(account),
                Err(err) => {
                    warn!(peer = %peer, reqid = id, error = %err, "Account range failed decoding");
                    self.inner.schedule_revert_account(req).await;
                    return Err(err.into());
                }
            }
        }
        let response = AccountResponse {
            task: req.payload.task,
            hashes,
            accounts: decoded,
            trie: verified.trie,
            bounds: verified.bounds,
            overflow: HashSet::new(),
            cont: verified.cont,
        };
        let (cancel, stale) = (req.cancel.clone(), req.stale.clone());
        if guarded_send(resps, cancel, stale.clone(), response).await {
            stale.cancel();
        }
        Ok(())
    }

    /// Delivery callback for a batch of contract bytecodes. Dispatched to
    /// the snap-phase or heal-phase handler based on the current phase.
    pub async fn on_byte_codes(
        &self,
        peer: H256,
        id: u64,
        bytecodes: Vec<Bytes>,
    ) -> Result<(), SyncError> {
        let syncing = !self.inner.shared.read().snapped;
        if syncing {
            self.on_snap_byte_codes(peer, id, bytecodes).await
        } else {
            self.on_heal_byte_codes(peer, id, bytecodes).await
        }
    }

    async fn on_snap_byte_codes(
        &self,
        peer: H256,
        id: u64,
        bytecodes: Vec<Bytes>,
    ) -> Result<(), SyncError> {
        trace!(peer = %peer, reqid = id, bytecodes = bytecodes.len(), "Delivering set of bytecodes");
        let mut reject = false;
        let (req, resps) = {
            let mut shared = self.inner.shared.write();
            shared.pool.set_idle(RequestKind::ByteCodes, peer);
            let _ = shared.tx.update.try_send(());

            let Some(req) = shared.bytecode_reqs.remove(id) else {
                warn!(peer = %peer, reqid = id, "Unexpected bytecode packet");
                return Ok(());
            };
            if !req.timeout.stop() {
                return Ok(());
            }
            if bytecodes.is_empty() {
                debug!(peer = %peer, "Peer rejected bytecode request");
                shared.pool.set_stateless(peer);
                reject = true;
            }
            (req, shared.tx.bytecode_resps.clone())
        };
        if reject {
            self.inner.schedule_revert_bytecodes(req).await;
            return Ok(());
        }
        // Cross reference the requested bytecodes with the response to find
        // gaps the serving node is missing.
        let Some(codes) = self.align_with_requested(&req.payload.hashes, &bytecodes) else {
            warn!(peer = %peer, reqid = id, "Unexpected bytecodes");
            self.inner.schedule_revert_bytecodes(req).await;
            return Err(SyncError::UnexpectedPayload("unexpected bytecode"));
        };
        let response = ByteCodesResponse {
            task: req.payload.task,
            hashes: req.payload.hashes.clone(),
            codes,
        };
        let (cancel, stale) = (req.cancel.clone(), req.stale.clone());
        if guarded_send(resps, cancel, stale.clone(), response).await {
            stale.cancel();
        }
        Ok(())
    }

    /// Delivery callback for ranges of storage slots.
    pub async fn on_storage(
        &self,
        peer: H256,
        id: u64,
        hashes: Vec<Vec<H256>>,
        slots: Vec<Vec<Bytes>>,
        proof: Vec<Bytes>,
    ) -> Result<(), SyncError> {
        trace!(
            peer = %peer,
            reqid = id,
            accounts = hashes.len(),
            proofs = proof.len(),
            "Delivering ranges of storage slots"
        );
        let mut mismatch = false;
        let mut oversized = false;
        let mut reject = false;
        let (req, resps) = {
            let mut shared = self.inner.shared.write();
            shared.pool.set_idle(RequestKind::StorageRanges, peer);
            let _ = shared.tx.update.try_send(());

            let Some(req) = shared.storage_reqs.remove(id) else {
                warn!(peer = %peer, reqid = id, "Unexpected storage ranges packet");
                return Ok(());
            };
            if !req.timeout.stop() {
                return Ok(());
            }
            // Reject mismatched or oversized deliveries outright.
            if hashes.len() != slots.len() {
                mismatch = true;
            } else if hashes.len() > req.payload.accounts.len() {
                oversized = true;
            } else if hashes.is_empty() {
                debug!(peer = %peer, "Peer rejected storage request");
                shared.pool.set_stateless(peer);
                reject = true;
            }
            (req, shared.tx.storage_resps.clone())
        };
        if mismatch {
            warn!(
                peer = %peer,
                reqid = id,
                hashsets = hashes.len(),
                slotsets = slots.len(),
                "Hash and slot set size mismatch"
            );
            self.inner.schedule_revert_storage(req).await;
            return Err(SyncError::UnexpectedPayload("hash and slot set size mismatch"));
        }
        if oversized {
            warn!(
                peer = %peer,
                reqid = id,
                hashsets = hashes.len(),
                requested = req.payload.accounts.len(),
                "Hash set larger than requested"
            );
            self.inner.schedule_revert_storage(req).await;
            return Err(SyncError::UnexpectedPayload("hash set larger than requested"));
        }
        if reject {
            self.inner.schedule_revert_storage(req).await;
            return Ok(());
        }
        // Reconstruct the partial tries from the response and verify them.
        // Only the last account may carry an edge proof; every other range
        // must cover its contract's whole key space.
        let mut tries = Vec::with_capacity(hashes.len());
        let mut bounds = HashSet::new();
        let mut cont = false;
        for i in 0..hashes.len() {
            let with_proof = i == hashes.len() - 1 && !proof.is_empty();
            let origin = if with_proof {
                req.payload.origin
            } else {
                H256::zero()
            };
            let proof_slice: &[Bytes] = if with_proof { &proof } else { &[] };
            match self.backend.verify_range(
                req.payload.roots[i],
                origin,
                &hashes[i],
                &slots[i],
                proof_slice,
            ) {
                Ok(verified) => {
                    if with_proof {
                        bounds = verified.bounds;
                        cont = verified.cont;
                    }
                    tries.push(verified.trie);
                }
                Err(err) => {
                    warn!(peer = %peer, reqid = id, error = %err, "Storage slots failed proof");
                    self.inner.schedule_revert_storage(req).await;
                    return Err(err.into());
                }
            }
        }
        let response = StorageRangesResponse {
            main_task: req.payload.main_task,
            sub_task: req.payload.sub_task,
            accounts: req.payload.accounts.clone(),
            roots: req.payload.roots.clone(),
            hashes,
            slots,
            tries,
            bounds,
            overflow: HashSet::new(),
            cont,
        };
        let (cancel, stale) = (req.cancel.clone(), req.stale.clone());
        if guarded_send(resps, cancel, stale.clone(), response).await {
            stale.cancel();
        }
        Ok(())
    }

    /// Delivery callback for a batch of healing trie nodes.
    pub async fn on_trie_nodes(
        &self,
        peer: H256,
        id: u64,
        trienodes: Vec<Bytes>,
    ) -> Result<(), SyncError> {
        trace!(peer = %peer, reqid = id, trienodes = trienodes.len(), "Delivering set of healing trienodes");
        let mut reject = false;
        let (req, resps) = {
            let mut shared = self.inner.shared.write();
            shared.pool.set_idle(RequestKind::TrienodeHeal, peer);
            let _ = shared.tx.update.try_send(());

            let Some(req) = shared.trienode_heal_reqs.remove(id) else {
                warn!(peer = %peer, reqid = id, "Unexpected trienode heal packet");
                return Ok(());
            };
            if !req.timeout.stop() {
                return Ok(());
            }
            if trienodes.is_empty() {
                debug!(peer = %peer, "Peer rejected trienode heal request");
                shared.pool.set_stateless(peer);
                reject = true;
            }
            (req, shared.tx.trienode_heal_resps.clone())
        };
        if reject {
            self.inner.schedule_revert_trienode_heal(req).await;
            return Ok(());
        }
        let Some(nodes) = self.align_with_requested(&req.payload.hashes, &trienodes) else {
            warn!(peer = %peer, reqid = id, "Unexpected healing trienodes");
            self.inner.schedule_revert_trienode_heal(req).await;
            return Err(SyncError::UnexpectedPayload("unexpected healing trienode"));
        };
        let response = TrienodeHealResponse {
            hashes: req.payload.hashes.clone(),
            paths: req.payload.paths.clone(),
            nodes,
        };
        let (cancel, stale) = (req.cancel.clone(), req.stale.clone());
        if guarded_send(resps, cancel, stale.clone(), response).await {
            stale.cancel();
        }
        Ok(())
    }

    async fn on_heal_byte_codes(
        &self,
        peer: H256,
        id: u64,
        bytecodes: Vec<Bytes>,
    ) -> Result<(), SyncError> {
        trace!(peer = %peer, reqid = id, bytecodes = bytecodes.len(), "Delivering set of healing bytecodes");
        let mut reject = false;
        let (req, resps) = {
            let mut shared = self.inner.shared.write();
            shared.pool.set_idle(RequestKind::BytecodeHeal, peer);
            let _ = shared.tx.update.try_send(());

            let Some(req) = shared.bytecode_heal_reqs.remove(id) else {
                warn!(peer = %peer, reqid = id, "Unexpected bytecode heal packet");
                return Ok(());
            };
            if !req.timeout.stop() {
                return Ok(());
            }
            if bytecodes.is_empty() {
                debug!(peer = %peer, "Peer rejected bytecode heal request");
                shared.pool.set_stateless(peer);
                reject = true;
            }
            (req, shared.tx.bytecode_heal_resps.clone())
        };
        if reject {
            self.inner.schedule_revert_bytecode_heal(req).await;
            return Ok(());
        }
        let Some(codes) = self.align_with_requested(&req.payload.hashes, &bytecodes) else {
            warn!(peer = %peer, reqid = id, "Unexpected healing bytecodes");
            self.inner.schedule_revert_bytecode_heal(req).await;
            return Err(SyncError::UnexpectedPayload("unexpected healing bytecode"));
        };
        let response = BytecodeHealResponse {
            hashes: req.payload.hashes.clone(),
            codes,
        };
        let (cancel, stale) = (req.cancel.clone(), req.stale.clone());
        if guarded_send(resps, cancel, stale.clone(), response).await {
            stale.cancel();
        }
        Ok(())
    }

    /// Aligns delivered blobs to the hash list they were requested under.
    /// Misses stay `None`; any unrequested or out-of-order blob fails the
    /// whole delivery.
    fn align_with_requested(
        &self,
        requested: &[H256],
        delivered: &[Bytes],
    ) -> Option<Vec<Option<Bytes>>> {
        let mut aligned: Vec<Option<Bytes>> = vec![None; requested.len()];
        let mut cursor = 0;
        for blob in delivered {
            let hash = self.backend.keccak(blob);
            while cursor < requested.len() && hash != requested[cursor] {
                cursor += 1;
            }
            if cursor >= requested.len() {
                return None;
            }
            aligned[cursor] = Some(blob.clone());
            cursor += 1;
        }
        Some(aligned)
    }
}
