//! Event-loop side response integration.
//!
//! Responses arrive already verified; these handlers splice them into the
//! task set, persist whatever became durable and advance the task cursors.
//! Boundary nodes are never persisted until the bounding range is
//! finalized; overflow nodes belong to a neighboring task and are never
//! persisted here.

use std::collections::HashSet;

use ethereum_types::H256;
use tracing::{debug, error};

use crate::constants::{EMPTY_CODE_HASH, EMPTY_TRIE_ROOT, STORAGE_CONCURRENCY};
use crate::error::SyncError;
use crate::peer::SnapPeer;
use crate::request::{
    AccountResponse, ByteCodesResponse, BytecodeHealResponse, StorageRangesResponse,
    TrienodeHealResponse,
};
use crate::store::WriteBatch;
use crate::task::{StorageTask, chunk_hash_ranges, hash_successor};
use crate::trie::ProcessOutcome;

use super::Syncer;

impl<P: SnapPeer> Syncer<P> {
    /// Integrates a verified account range response into its task.
    pub(super) fn process_account_response(
        &mut self,
        mut res: AccountResponse,
    ) -> Result<(), SyncError> {
        let Some(pos) = self.tasks.iter().position(|task| task.id == res.task) else {
            debug!("Account range response for stale task");
            return Ok(());
        };
        // Switch the task from pending to filling.
        self.tasks[pos].req = None;

        // Ensure the response doesn't overflow into the subsequent task.
        let last = self.tasks[pos].last;
        let mut cut = None;
        for idx in 0..res.hashes.len() {
            // A range ending exactly on the task boundary is complete; keep
            // scanning to drop anything past it.
            if res.hashes[idx] == last {
                res.cont = false;
                continue;
            }
            if res.hashes[idx] > last {
                // Chunk overflown: cut off the excess, and keep their proof
                // witnesses out of persistence.
                for j in idx..res.hashes.len() {
                    res.trie.prove(res.hashes[j], &mut res.overflow)?;
                }
                res.cont = false;
                cut = Some(idx);
                break;
            }
        }
        if let Some(idx) = cut {
            res.hashes.truncate(idx);
            res.accounts.truncate(idx);
        }
        // Assemble which accounts need further sub-filling before the
        // entire range can be persisted.
        {
            let task = &mut self.tasks[pos];
            task.need_code = vec![false; res.accounts.len()];
            task.need_state = vec![false; res.accounts.len()];
            task.need_heal = vec![false; res.accounts.len()];
            task.code_tasks.clear();
            task.state_tasks.clear();
            task.pend = 0;

            let mut resumed: HashSet<H256> = HashSet::new();
            for (idx, account) in res.accounts.iter().enumerate() {
                // Contract with an unknown code.
                if account.code_hash != *EMPTY_CODE_HASH && !self.db.has_code(account.code_hash)? {
                    task.code_tasks.insert(account.code_hash);
                    task.need_code[idx] = true;
                    task.pend += 1;
                }
                // Contract with an unknown storage trie.
                if account.storage_root != *EMPTY_TRIE_ROOT
                    && !self.db.has_trie_node(account.storage_root)?
                {
                    if let Some(subtasks) = task.sub_tasks.get_mut(&res.hashes[idx]) {
                        // A previous large state retrieval is suspended;
                        // don't restart it from scratch, but do refresh the
                        // root hash.
                        debug!(
                            account = %res.hashes[idx],
                            root = %account.storage_root,
                            "Resuming large storage retrieval"
                        );
                        for sub in subtasks.iter_mut() {
                            sub.root = account.storage_root;
                        }
                        task.need_heal[idx] = true;
                        resumed.insert(res.hashes[idx]);
                    } else {
                        task.state_tasks.insert(res.hashes[idx], account.storage_root);
                    }
                    task.need_state[idx] = true;
                    task.pend += 1;
                }
            }
            // Drop subtasks that were suspended but not resumed: the new
            // range disagrees on those accounts. This may undo some
            // progress if the new peer served fewer accounts than the old.
            task.sub_tasks.retain(|account, _| {
                if resumed.contains(account) {
                    true
                } else {
                    debug!(account = %account, "Aborting suspended storage retrieval");
                    false
                }
            });
            task.res = Some(res);
        }
        // If the range contained no contracts, or all were filled before,
        // short circuit storage filling and forward to the next chunk.
        if self.tasks[pos].pend == 0 {
            self.forward_account_task(pos)?;
        }
        Ok(())
    }

    /// Integrates a verified bytecode response into its task.
    pub(super) fn process_bytecode_response(
        &mut self,
        res: ByteCodesResponse,
    ) -> Result<(), SyncError> {
        let Some(pos) = self.tasks.iter().position(|task| task.id == res.task) else {
            debug!("Bytecode response for stale task");
            return Ok(());
        };
        let mut batch = WriteBatch::default();
        let mut codes = 0u64;
        let mut bytes = 0u64;
        {
            let task = &mut self.tasks[pos];
            let filling_codes: Vec<H256> = task
                .res
                .as_ref()
                .map(|res| res.accounts.iter().map(|account| account.code_hash).collect())
                .unwrap_or_default();
            for (idx, hash) in res.hashes.iter().enumerate() {
                let Some(code) = res.codes[idx].clone() else {
                    // Not delivered, reschedule the retrieval.
                    task.code_tasks.insert(*hash);
                    continue;
                };
                // Delivered, mark it not needed any more.
                for (j, code_hash) in filling_codes.iter().enumerate() {
                    if task.need_code[j] && *hash == *code_hash {
                        task.need_code[j] = false;
                        task.pend -= 1;
                    }
                }
                codes += 1;
                bytes += code.len() as u64;
                batch.put_code(*hash, code);
            }
        }
        self.stats.bytecode_synced += codes;
        self.stats.bytecode_bytes += bytes;
        self.db.write_batch(batch)?;
        debug!(count = codes, bytes, "Persisted set of bytecodes");

        // If this delivery completed the last pending retrieval, forward
        // the account task to the next chunk.
        if self.tasks[pos].pend == 0 {
            self.forward_account_task(pos)?;
        }
        Ok(())
    }

    /// Integrates a verified storage ranges response into its tasks.
    pub(super) fn process_storage_response(
        &mut self,
        res: StorageRangesResponse,
    ) -> Result<(), SyncError> {
        let StorageRangesResponse {
            main_task,
            mut sub_task,
            accounts,
            roots,
            mut hashes,
            mut slots,
            tries,
            bounds,
            mut overflow,
            mut cont,
        } = res;
        let Some(pos) = self.tasks.iter().position(|task| task.id == main_task) else {
            debug!("Storage response for stale task");
            return Ok(());
        };
        // Switch the subtask from pending to idle.
        if let Some((account, sub_id)) = sub_task {
            if let Some(subtasks) = self.tasks[pos].sub_tasks.get_mut(&account) {
                if let Some(sub) = subtasks.iter_mut().find(|sub| sub.id == sub_id) {
                    sub.req = None;
                }
            }
        }
        // Snapshot of the filling account range these storages map into.
        let (main_hashes, main_roots): (Vec<H256>, Vec<H256>) = match &self.tasks[pos].res {
            Some(res) => (
                res.hashes.clone(),
                res.accounts.iter().map(|account| account.storage_root).collect(),
            ),
            None => (Vec::new(), Vec::new()),
        };

        let mut next_task_id = self.next_task_id;
        let mut batch = WriteBatch::default();
        let mut slot_count = 0usize;
        let mut node_count = 0usize;
        let mut skipped = 0usize;
        let mut bytes = 0u64;

        let delivered = hashes.len();
        for i in 0..accounts.len() {
            let account = accounts[i];
            // Account not delivered at all, reschedule it.
            if i >= delivered {
                self.tasks[pos].state_tasks.insert(account, roots[i]);
                continue;
            }
            let is_last = i == delivered - 1;
            for j in 0..main_hashes.len() {
                if account != main_hashes[j] {
                    continue;
                }
                let account_root = main_roots[j];
                let task = &mut self.tasks[pos];

                // If the packet contains multiple contracts, all but the
                // last are surely complete. The last may be chunked, so
                // check its continuation flag.
                if sub_task.is_none() && task.need_state[j] && (!is_last || !cont) {
                    task.need_state[j] = false;
                    task.pend -= 1;
                }
                // A chunked trailing contract needs healing, to avoid
                // writing it out to disk prematurely.
                if sub_task.is_none() && !task.need_heal[j] && is_last && cont {
                    task.need_heal[j] = true;
                }
                // A chunked trailing contract switches the account into
                // large contract handling mode.
                if sub_task.is_none() && is_last && cont && !task.sub_tasks.contains_key(&account) {
                    let mut subtasks = Vec::with_capacity(STORAGE_CONCURRENCY);
                    for (next, last) in chunk_hash_ranges(STORAGE_CONCURRENCY) {
                        next_task_id += 1;
                        debug!(
                            account = %account,
                            root = %account_root,
                            from = %next,
                            last = %last,
                            "Created storage sync task"
                        );
                        subtasks.push(StorageTask {
                            id: next_task_id,
                            next,
                            last,
                            root: account_root,
                            req: None,
                            done: false,
                        });
                    }
                    let first = subtasks[0].id;
                    task.sub_tasks.insert(account, subtasks);
                    // The subtasks were created just now, so this response
                    // is surely for the first one (zero origin).
                    sub_task = Some((account, first));
                }
                // In large contract mode, forward the relevant chunk.
                if let Some((sub_account, sub_id)) = sub_task {
                    let Some(sub) = task
                        .sub_tasks
                        .get_mut(&sub_account)
                        .and_then(|subs| subs.iter_mut().find(|sub| sub.id == sub_id))
                    else {
                        continue;
                    };
                    // Ensure the response doesn't overflow into the
                    // subsequent chunk.
                    let sub_last = sub.last;
                    let mut cut = None;
                    for k in 0..hashes[i].len() {
                        if hashes[i][k] == sub_last {
                            cont = false;
                            continue;
                        }
                        if hashes[i][k] > sub_last {
                            for l in k..hashes[i].len() {
                                tries[i].prove(hashes[i][l], &mut overflow)?;
                            }
                            cont = false;
                            cut = Some(k);
                            break;
                        }
                    }
                    if let Some(k) = cut {
                        hashes[i].truncate(k);
                        slots[i].truncate(k);
                    }
                    if cont {
                        if let Some(last_hash) = hashes[i].last() {
                            sub.next = hash_successor(*last_hash);
                        }
                    } else {
                        sub.done = true;
                    }
                }
            }
            // Persist the reconstructed trie nodes. Boundary and overflow
            // nodes of the trailing (incomplete) chunk are withheld.
            slot_count += hashes[i].len();
            for (node_hash, node) in tries[i].nodes() {
                if is_last && sub_task.is_some() {
                    if bounds.contains(&node_hash) || overflow.contains(&node_hash) {
                        skipped += 1;
                        continue;
                    }
                }
                bytes += (32 + node.len()) as u64;
                batch.put_trie_node(node_hash, node);
                node_count += 1;
            }
            // Persist the flat storage slots regardless; outdated values
            // are fixed up later during snapshot generation.
            for k in 0..hashes[i].len() {
                bytes += (1 + 64 + slots[i][k].len()) as u64;
                batch.put_storage_snapshot(account, hashes[i][k], slots[i][k].clone());
            }
        }
        self.next_task_id = next_task_id;
        self.db.write_batch(batch)?;
        self.stats.storage_synced += slot_count as u64;
        self.stats.storage_bytes += bytes;
        debug!(
            accounts = delivered,
            slots = slot_count,
            nodes = node_count,
            skipped,
            bytes,
            "Persisted set of storage slots"
        );

        // If this delivery completed the last pending retrieval, forward
        // the account task to the next chunk.
        if self.tasks[pos].pend == 0 {
            self.forward_account_task(pos)?;
        }
        Ok(())
    }

    /// Feeds a verified trienode heal response into the sync scheduler.
    pub(super) fn process_trienode_heal_response(
        &mut self,
        res: TrienodeHealResponse,
    ) -> Result<(), SyncError> {
        let Some(healer) = self.healer.as_mut() else {
            return Ok(());
        };
        let mut synced = 0u64;
        let mut synced_bytes = 0u64;
        let mut dups = 0u64;
        let mut nops = 0u64;
        for (idx, hash) in res.hashes.iter().enumerate() {
            let Some(node) = res.nodes[idx].clone() else {
                // Not delivered, retry from elsewhere.
                healer.trie_tasks.insert(*hash, res.paths[idx].clone());
                continue;
            };
            synced += 1;
            synced_bytes += node.len() as u64;
            match healer.scheduler.process(*hash, node) {
                ProcessOutcome::Committed => {}
                ProcessOutcome::AlreadyProcessed => dups += 1,
                ProcessOutcome::NotRequested => nops += 1,
                ProcessOutcome::Failed(err) => {
                    error!(hash = %hash, error = %err, "Invalid trienode processed")
                }
            }
        }
        let mut batch = WriteBatch::default();
        if let Err(err) = healer.scheduler.commit(&mut batch) {
            error!(error = %err, "Failed to commit healing data");
        }
        self.stats.trienode_heal_synced += synced;
        self.stats.trienode_heal_bytes += synced_bytes;
        self.stats.trienode_heal_dups += dups;
        self.stats.trienode_heal_nops += nops;

        let size = batch.size();
        self.db.write_batch(batch)?;
        debug!(kind = "trienodes", bytes = size, "Persisted set of healing data");
        Ok(())
    }

    /// Feeds a verified bytecode heal response into the sync scheduler.
    pub(super) fn process_bytecode_heal_response(
        &mut self,
        res: BytecodeHealResponse,
    ) -> Result<(), SyncError> {
        let Some(healer) = self.healer.as_mut() else {
            return Ok(());
        };
        let mut synced = 0u64;
        let mut synced_bytes = 0u64;
        let mut dups = 0u64;
        let mut nops = 0u64;
        for (idx, hash) in res.hashes.iter().enumerate() {
            let Some(code) = res.codes[idx].clone() else {
                healer.code_tasks.insert(*hash);
                continue;
            };
            synced += 1;
            synced_bytes += code.len() as u64;
            match healer.scheduler.process(*hash, code) {
                ProcessOutcome::Committed => {}
                ProcessOutcome::AlreadyProcessed => dups += 1,
                ProcessOutcome::NotRequested => nops += 1,
                ProcessOutcome::Failed(err) => {
                    error!(hash = %hash, error = %err, "Invalid bytecode processed")
                }
            }
        }
        let mut batch = WriteBatch::default();
        if let Err(err) = healer.scheduler.commit(&mut batch) {
            error!(error = %err, "Failed to commit healing data");
        }
        self.stats.bytecode_heal_synced += synced;
        self.stats.bytecode_heal_bytes += synced_bytes;
        self.stats.bytecode_heal_dups += dups;
        self.stats.bytecode_heal_nops += nops;

        let size = batch.size();
        self.db.write_batch(batch)?;
        debug!(kind = "bytecodes", bytes = size, "Persisted set of healing data");
        Ok(())
    }

    /// Persists whatever the task's current response made durable, then
    /// pushes the chunk cursor forward to the first account still missing
    /// data. Incomplete accounts' witness nodes are withheld along with
    /// boundary and overflow nodes.
    pub(super) fn forward_account_task(&mut self, pos: usize) -> Result<(), SyncError> {
        let task = &mut self.tasks[pos];
        let Some(res) = task.res.take() else {
            return Ok(());
        };
        // Gather the incomplete trie nodes: everything past the first
        // account still waiting on code or storage (the filling was
        // interrupted there), plus every account whose storage arrived
        // chunked and needs healing.
        let mut incompletes: HashSet<H256> = HashSet::new();
        for idx in 0..res.accounts.len() {
            if task.need_code[idx] || task.need_state[idx] {
                for j in idx..res.accounts.len() {
                    res.trie.prove(res.hashes[j], &mut incompletes)?;
                }
                break;
            }
            if task.need_heal[idx] {
                res.trie.prove(res.hashes[idx], &mut incompletes)?;
            }
        }
        // Persist every finalized trie node that's not on a boundary.
        let mut batch = WriteBatch::default();
        let mut nodes = 0usize;
        let mut skipped = 0usize;
        let mut bytes = 0u64;
        for (node_hash, node) in res.trie.nodes() {
            if res.bounds.contains(&node_hash)
                || res.overflow.contains(&node_hash)
                || incompletes.contains(&node_hash)
            {
                skipped += 1;
                continue;
            }
            bytes += (32 + node.len()) as u64;
            batch.put_trie_node(node_hash, node);
            nodes += 1;
        }
        // Persist the flat account records; outdated values are fixed up
        // later during snapshot generation.
        for (idx, hash) in res.hashes.iter().enumerate() {
            let slim = self.backend.slim_account(&res.accounts[idx]);
            bytes += (1 + 32 + slim.len()) as u64;
            batch.put_account_snapshot(*hash, slim);
        }
        self.db.write_batch(batch)?;
        self.stats.account_synced += res.accounts.len() as u64;
        self.stats.account_bytes += bytes;
        debug!(
            accounts = res.accounts.len(),
            nodes,
            skipped,
            bytes,
            "Persisted range of accounts"
        );

        // Push the chunk marker forward up to the first account still
        // missing data.
        for (idx, hash) in res.hashes.iter().enumerate() {
            if task.need_code[idx] || task.need_state[idx] {
                return Ok(());
            }
            task.next = hash_successor(*hash);
        }
        // Every delivered account is complete; the task is done once the
        // range had no continuation.
        task.done = !res.cont;
        Ok(())
    }
}
