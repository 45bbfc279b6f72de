//! WAL entries, replication batches and the sub-batches they are split into.

use bytes::Bytes;
use std::sync::Arc;

/// A single already-serialized WAL entry handed to the shipper.
///
/// Entries are immutable once received; cloning shares the underlying buffers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalEntry {
    /// Sequence number within the source WAL.
    pub seq: u64,
    /// Key used to co-locate related entries (encoded region name).
    pub partition_key: Bytes,
    /// Milliseconds since Unix epoch at which the entry was written.
    pub write_time_ms: u64,
    /// Serialized entry body, opaque to the shipper.
    pub payload: Bytes,
}

impl WalEntry {
    /// Create a new entry.
    pub fn new(
        seq: u64,
        partition_key: impl Into<Bytes>,
        write_time_ms: u64,
        payload: impl Into<Bytes>,
    ) -> Self {
        Self {
            seq,
            partition_key: partition_key.into(),
            write_time_ms,
            payload: payload.into(),
        }
    }

    /// Approximate in-memory size of this entry in bytes.
    pub fn size_bytes(&self) -> u64 {
        (self.partition_key.len() + self.payload.len()) as u64
    }
}

/// An ordered batch of entries read from one WAL group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicateBatch {
    /// Entries in WAL order.
    pub entries: Vec<WalEntry>,
    /// Total size of the batch as reported by the reader.
    pub size_bytes: u64,
    /// WAL group the entries were read from.
    pub group_id: String,
}

impl ReplicateBatch {
    /// Create a batch, computing its size from the entries.
    pub fn new(group_id: impl Into<String>, entries: Vec<WalEntry>) -> Self {
        let size_bytes = entries.iter().map(WalEntry::size_bytes).sum();
        Self {
            entries,
            size_bytes,
            group_id: group_id.into(),
        }
    }

    /// Number of entries in the batch.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if the batch holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Write time of the last entry, if any.
    pub fn last_write_time_ms(&self) -> Option<u64> {
        self.entries.last().map(|e| e.write_time_ms)
    }
}

/// A slice of a batch assigned to one dispatch unit.
///
/// The ordinal identifies the sub-batch across retry rounds; it is never
/// reassigned and the entries are never re-split.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubBatch {
    /// Position of this sub-batch in `[0, n)`.
    pub ordinal: usize,
    /// Entries in their original relative order.
    pub entries: Arc<[WalEntry]>,
}

impl SubBatch {
    /// Create a sub-batch.
    pub fn new(ordinal: usize, entries: Vec<WalEntry>) -> Self {
        Self {
            ordinal,
            entries: entries.into(),
        }
    }

    /// Number of entries in the sub-batch.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if the sub-batch holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Age in milliseconds of the oldest entry, relative to `now_ms`.
    pub fn oldest_age_ms(&self, now_ms: u64) -> u64 {
        self.entries
            .iter()
            .map(|e| e.write_time_ms)
            .min()
            .map(|ts| now_ms.saturating_sub(ts))
            .unwrap_or(0)
    }
}

/// Current wall-clock time in milliseconds since Unix epoch.
pub(crate) fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
