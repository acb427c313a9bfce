//! On-disk envelope + dead-letter types (spec.md §3, §6).

use crate::value::Record;
use serde::{Deserialize, Serialize};

/// One line of an overflow log file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedEnvelope {
    pub sequence_id: u64,
    pub retry_count: u32,
    pub persisted_at: i64,
    pub data: Record,
}

/// A record that exceeded the retry budget and will not be retried.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub payload: Record,
    pub reason: String,
    pub moved_at: i64,
}

/// Point-in-time counters exposed by `GetStats`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PersistenceStats {
    pub total_persisted: u64,
    pub total_recovered: u64,
    pub total_dropped: u64,
    pub dead_letter_count: u64,
    pub pending_recovery: u64,
}
