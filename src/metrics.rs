//! Minimal process-wide counters for ingestion and persistence health.
use std::sync::atomic::{AtomicU64, Ordering};

static PACKETS_INGESTED: AtomicU64 = AtomicU64::new(0);
static PACKETS_MALFORMED: AtomicU64 = AtomicU64::new(0);
static GATEWAY_HITS_RECORDED: AtomicU64 = AtomicU64::new(0);
static GATEWAY_EVIDENCE_REJECTED: AtomicU64 = AtomicU64::new(0);
static ALERTS_EMITTED: AtomicU64 = AtomicU64::new(0);
static SAVES_COMPLETED: AtomicU64 = AtomicU64::new(0);
static SAVES_FAILED: AtomicU64 = AtomicU64::new(0);

pub fn inc_packets_ingested() {
    PACKETS_INGESTED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_packets_malformed() {
    PACKETS_MALFORMED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_gateway_hits_recorded() {
    GATEWAY_HITS_RECORDED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_gateway_evidence_rejected() {
    GATEWAY_EVIDENCE_REJECTED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_alerts_emitted() {
    ALERTS_EMITTED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_saves_completed() {
    SAVES_COMPLETED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_saves_failed() {
    SAVES_FAILED.fetch_add(1, Ordering::Relaxed);
}

#[derive(Debug, Default, Clone)]
pub struct Snapshot {
    pub packets_ingested: u64,
    pub packets_malformed: u64,
    pub gateway_hits_recorded: u64,
    pub gateway_evidence_rejected: u64,
    pub alerts_emitted: u64,
    pub saves_completed: u64,
    pub saves_failed: u64,
}

pub fn snapshot() -> Snapshot {
    Snapshot {
        packets_ingested: PACKETS_INGESTED.load(Ordering::Relaxed),
        packets_malformed: PACKETS_MALFORMED.load(Ordering::Relaxed),
        gateway_hits_recorded: GATEWAY_HITS_RECORDED.load(Ordering::Relaxed),
        gateway_evidence_rejected: GATEWAY_EVIDENCE_REJECTED.load(Ordering::Relaxed),
        alerts_emitted: ALERTS_EMITTED.load(Ordering::Relaxed),
        saves_completed: SAVES_COMPLETED.load(Ordering::Relaxed),
        saves_failed: SAVES_FAILED.load(Ordering::Relaxed),
    }
}
