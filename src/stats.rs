//! Process-wide counters. No exporter; the CLI prints a snapshot after bulk
//! operations.

use std::sync::atomic::{AtomicU64, Ordering};

/// Calls made to the external listening source.
pub static SOURCE_API_CALLS: AtomicU64 = AtomicU64::new(0);
/// Source calls that failed (any category).
pub static SOURCE_ERRORS: AtomicU64 = AtomicU64::new(0);
/// Source calls rejected for bad credentials.
pub static SOURCE_BAD_AUTH: AtomicU64 = AtomicU64::new(0);
/// Completed user syncs.
pub static INDEXED_USERS: AtomicU64 = AtomicU64::new(0);
/// Crown contests that ended in a transfer.
pub static CROWNS_TRANSFERRED: AtomicU64 = AtomicU64::new(0);

pub fn inc(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

#[derive(Debug, Clone, Copy)]
pub struct Snapshot {
    pub source_api_calls: u64,
    pub source_errors: u64,
    pub source_bad_auth: u64,
    pub indexed_users: u64,
    pub crowns_transferred: u64,
}

pub fn snapshot() -> Snapshot {
    Snapshot {
        source_api_calls: SOURCE_API_CALLS.load(Ordering::Relaxed),
        source_errors: SOURCE_ERRORS.load(Ordering::Relaxed),
        source_bad_auth: SOURCE_BAD_AUTH.load(Ordering::Relaxed),
        indexed_users: INDEXED_USERS.load(Ordering::Relaxed),
        crowns_transferred: CROWNS_TRANSFERRED.load(Ordering::Relaxed),
    }
}
