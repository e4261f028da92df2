//! Process-wide transfer counters. Executors fold their per-instance totals
//! in when they are dropped; failure counters are updated inline.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;

#[derive(Debug, Default)]
struct Totals {
    run_count: u64,
    run_time: Duration,
    bytes_transferred: u64,
}

static TOTALS: Mutex<Totals> = Mutex::new(Totals {
    run_count: 0,
    run_time: Duration::ZERO,
    bytes_transferred: 0,
});

static TRANSPORT_FAILURES: AtomicU64 = AtomicU64::new(0);
static REQUEST_FAILURES: AtomicU64 = AtomicU64::new(0);
static TIMEOUTS: AtomicU64 = AtomicU64::new(0);
static ABORTS: AtomicU64 = AtomicU64::new(0);
static HOOK_RETRIES: AtomicU64 = AtomicU64::new(0);

/// Point-in-time copy of the process-wide counters.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct TransferSnapshot {
    pub run_count: u64,
    #[serde(serialize_with = "as_seconds", rename = "run_time_s")]
    pub run_time: Duration,
    pub bytes_transferred: u64,
    pub transport_failures: u64,
    pub request_failures: u64,
    pub timeouts: u64,
    pub aborts: u64,
    pub hook_retries: u64,
}

fn as_seconds<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_f64(d.as_secs_f64())
}

/// Dump a snapshot as pretty JSON, e.g. to the configured stats file at
/// unmount.
pub fn write_stats_file(path: &Path, snapshot: &TransferSnapshot) -> crate::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let data = serde_json::to_vec_pretty(snapshot)?;
    std::fs::write(path, data)?;
    Ok(())
}

pub fn snapshot() -> TransferSnapshot {
    let totals = TOTALS.lock();
    TransferSnapshot {
        run_count: totals.run_count,
        run_time: totals.run_time,
        bytes_transferred: totals.bytes_transferred,
        transport_failures: TRANSPORT_FAILURES.load(Ordering::Relaxed),
        request_failures: REQUEST_FAILURES.load(Ordering::Relaxed),
        timeouts: TIMEOUTS.load(Ordering::Relaxed),
        aborts: ABORTS.load(Ordering::Relaxed),
        hook_retries: HOOK_RETRIES.load(Ordering::Relaxed),
    }
}

pub(crate) fn fold_totals(run_count: u64, run_time: Duration, bytes_transferred: u64) {
    let mut totals = TOTALS.lock();
    totals.run_count += run_count;
    totals.run_time += run_time;
    totals.bytes_transferred += bytes_transferred;
}

pub(crate) fn note_transport_failure() {
    TRANSPORT_FAILURES.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn note_request_failure() {
    REQUEST_FAILURES.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn note_timeout() {
    TIMEOUTS.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn note_abort() {
    ABORTS.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn note_hook_retry() {
    HOOK_RETRIES.fetch_add(1, Ordering::Relaxed);
}
