//! Tuning knobs for the snapshot synchronizer.
//!
//! Constants are grouped by their functional area. The count limits are
//! derived from the byte budget so that responses are filled without being
//! capped by the serving side.

use std::time::Duration;

use ethereum_types::H256;
use lazy_static::lazy_static;
use sha3::{Digest, Keccak256};

// =============================================================================
// REQUEST LIMITS
// =============================================================================

/// Soft byte budget carried by every outgoing request (512 KB).
///
/// Peers cap their responses near this size, so count limits below are sized
/// to fill it without forcing truncation.
pub const MAX_REQUEST_SIZE: u64 = 512 * 1024;

/// Maximum number of contracts to batch into a single storage ranges request.
pub const MAX_STORAGE_SET_REQUEST_COUNT: usize = (MAX_REQUEST_SIZE / 1024) as usize;

/// Maximum number of bytecode blobs to request in a single query.
///
/// Deployed bytecodes are capped at 24KB, so the floor is the byte budget
/// divided by that. Most contracts stay well below the cap, so requesting 4x
/// is a good approximation.
pub const MAX_CODE_REQUEST_COUNT: usize = (MAX_REQUEST_SIZE / (24 * 1024) * 4) as usize;

/// Maximum number of trie node blobs to request in a single heal query.
pub const MAX_TRIE_REQUEST_COUNT: usize = 512;

/// Maximum time a peer is allowed to spend serving a single request.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

// =============================================================================
// KEYSPACE CHUNKING
// =============================================================================

/// Number of chunks to split the account trie into for concurrent retrieval.
pub const ACCOUNT_CONCURRENCY: usize = 16;

/// Number of chunks to split a large contract's storage trie into once a
/// single response proves unable to cover it.
pub const STORAGE_CONCURRENCY: usize = 16;

/// Upper bound of the account / storage keyspace.
pub const HASH_MAX: H256 = H256([0xff; 32]);

// =============================================================================
// PERSISTENCE & REPORTING
// =============================================================================

/// Flat-state writer is flushed once its pending batch grows past this.
pub const IDEAL_BATCH_SIZE: usize = 100 * 1024;

/// Minimum interval between progress reports, unless forced.
pub const REPORT_INTERVAL: Duration = Duration::from_secs(3);

lazy_static! {
    /// Root hash of an empty trie, `keccak(rlp(null))`.
    pub static ref EMPTY_TRIE_ROOT: H256 =
        H256(Keccak256::digest([0x80u8]).into());

    /// Hash of empty contract code, `keccak([])`.
    pub static ref EMPTY_CODE_HASH: H256 =
        H256(Keccak256::digest([]).into());
}
