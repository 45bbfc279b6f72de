//! Splits a batch into per-key sub-batches for parallel delivery.
//!
//! Entries are routed by a stable hash of their partition key so that all
//! entries of one region travel together and keep their WAL order.

use crate::entry::{SubBatch, WalEntry};

/// Entries per additional worker before the batch is split further.
pub const ENTRIES_PER_WORKER: usize = 100;

/// Number of sub-batches to split a batch of `entry_count` entries into.
///
/// The minimum of the configured thread cap, one worker per
/// [`ENTRIES_PER_WORKER`] entries (plus one), and the number of sinks that
/// are currently available.
pub fn partition_count(max_threads: usize, entry_count: usize, sink_count: usize) -> usize {
    max_threads
        .min(entry_count / ENTRIES_PER_WORKER + 1)
        .min(sink_count)
}

/// Stable 32-bit hash of a partition key.
///
/// Computes `h = 31 * h + b` over the key's bytes taken as signed values,
/// starting from 1, with wrapping arithmetic. The same key always hashes the
/// same way on every node.
pub fn partition_key_hash(key: &[u8]) -> i32 {
    key.iter()
        .fold(1i32, |h, &b| h.wrapping_mul(31).wrapping_add(b as i8 as i32))
}

/// Index of the sub-batch `key` is routed to when splitting into `n` parts.
pub fn partition_index(key: &[u8], n: usize) -> usize {
    if n <= 1 {
        return 0;
    }
    (partition_key_hash(key) % n as i32).unsigned_abs() as usize
}

/// Split `entries` into `n` ordered sub-batches.
///
/// With `n <= 1` the whole batch becomes sub-batch 0 unchanged. Otherwise
/// exactly `n` sub-batches are returned, with ordinals `0..n`; some may be
/// empty when no key hashes to them.
pub fn partition_batch(entries: &[WalEntry], n: usize) -> Vec<SubBatch> {
    if n <= 1 {
        return vec![SubBatch::new(0, entries.to_vec())];
    }

    let mut lists: Vec<Vec<WalEntry>> = (0..n)
        .map(|_| Vec::with_capacity(entries.len() / n + 1))
        .collect();
    for entry in entries {
        lists[partition_index(&entry.partition_key, n)].push(entry.clone());
    }

    lists
        .into_iter()
        .enumerate()
        .map(|(ordinal, list)| SubBatch::new(ordinal, list))
        .collect()
}
