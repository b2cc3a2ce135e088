//! Process-wide counters for the gateway hot paths.
//! Read them with [`snapshot`]; there is no exposition endpoint.
use std::sync::atomic::{AtomicU64, Ordering};

static SCANS_RECEIVED: AtomicU64 = AtomicU64::new(0);
static SCANS_UNRECOGNIZED: AtomicU64 = AtomicU64::new(0);
static BATCHES_FORWARDED: AtomicU64 = AtomicU64::new(0);
static RESOLVER_CALLS: AtomicU64 = AtomicU64::new(0);
static PUBLISH_OK: AtomicU64 = AtomicU64::new(0);
static PUBLISH_FAILED: AtomicU64 = AtomicU64::new(0);
static CREDENTIAL_EXCHANGES: AtomicU64 = AtomicU64::new(0);
static ECHOES_EMITTED: AtomicU64 = AtomicU64::new(0);
static HEARTBEATS_EMITTED: AtomicU64 = AtomicU64::new(0);

pub fn inc_scans_received() {
    SCANS_RECEIVED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_scans_unrecognized() {
    SCANS_UNRECOGNIZED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_batches_forwarded() {
    BATCHES_FORWARDED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_resolver_calls() {
    RESOLVER_CALLS.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_publish_ok() {
    PUBLISH_OK.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_publish_failed() {
    PUBLISH_FAILED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_credential_exchanges() {
    CREDENTIAL_EXCHANGES.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_echoes_emitted() {
    ECHOES_EMITTED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_heartbeats_emitted() {
    HEARTBEATS_EMITTED.fetch_add(1, Ordering::Relaxed);
}

#[derive(Debug, Default, Clone)]
pub struct Snapshot {
    pub scans_received: u64,
    pub scans_unrecognized: u64,
    pub batches_forwarded: u64,
    pub resolver_calls: u64,
    pub publish_ok: u64,
    pub publish_failed: u64,
    pub credential_exchanges: u64,
    pub echoes_emitted: u64,
    pub heartbeats_emitted: u64,
}

pub fn snapshot() -> Snapshot {
    Snapshot {
        scans_received: SCANS_RECEIVED.load(Ordering::Relaxed),
        scans_unrecognized: SCANS_UNRECOGNIZED.load(Ordering::Relaxed),
        batches_forwarded: BATCHES_FORWARDED.load(Ordering::Relaxed),
        resolver_calls: RESOLVER_CALLS.load(Ordering::Relaxed),
        publish_ok: PUBLISH_OK.load(Ordering::Relaxed),
        publish_failed: PUBLISH_FAILED.load(Ordering::Relaxed),
        credential_exchanges: CREDENTIAL_EXCHANGES.load(Ordering::Relaxed),
        echoes_emitted: ECHOES_EMITTED.load(Ordering::Relaxed),
        heartbeats_emitted: HEARTBEATS_EMITTED.load(Ordering::Relaxed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Counters are global and other unit tests bump them concurrently, so only
    // assert that values move forward.
    #[test]
    fn counters_advance() {
        let before = snapshot();
        inc_scans_received();
        inc_publish_failed();
        inc_echoes_emitted();
        let after = snapshot();
        assert!(after.scans_received > before.scans_received);
        assert!(after.publish_failed > before.publish_failed);
        assert!(after.echoes_emitted > before.echoes_emitted);
    }
}
