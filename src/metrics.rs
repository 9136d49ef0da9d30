//! Process-wide bridge counters.
//! Plain atomics; a `Snapshot` is taken on demand for status output and tests.
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

static FRAMES_RX: AtomicU64 = AtomicU64::new(0);
static FRAMES_TX: AtomicU64 = AtomicU64::new(0);
static DECODE_ERRORS: AtomicU64 = AtomicU64::new(0);
static NOISE_BYTES: AtomicU64 = AtomicU64::new(0);
static RECONNECTS: AtomicU64 = AtomicU64::new(0);
static PASSKEY_REQUESTS: AtomicU64 = AtomicU64::new(0);
static PASSKEY_CACHE_HITS: AtomicU64 = AtomicU64::new(0);
static REQUEST_TIMEOUTS: AtomicU64 = AtomicU64::new(0);
static LATE_RESPONSES: AtomicU64 = AtomicU64::new(0);
static DELIVERY_CONFIRMED: AtomicU64 = AtomicU64::new(0);
static DELIVERY_FAILED: AtomicU64 = AtomicU64::new(0);
static ACK_LATENCY_SUM_MS: AtomicU64 = AtomicU64::new(0);
static ACK_LATENCY_COUNT: AtomicU64 = AtomicU64::new(0);
static VIRTUAL_CLIENTS_DROPPED: AtomicU64 = AtomicU64::new(0);

pub fn inc_frames_rx() {
    FRAMES_RX.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_frames_tx() {
    FRAMES_TX.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_decode_errors() {
    DECODE_ERRORS.fetch_add(1, Ordering::Relaxed);
}
pub fn add_noise_bytes(n: usize) {
    NOISE_BYTES.fetch_add(n as u64, Ordering::Relaxed);
}
pub fn inc_reconnects() {
    RECONNECTS.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_passkey_requests() {
    PASSKEY_REQUESTS.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_passkey_cache_hits() {
    PASSKEY_CACHE_HITS.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_request_timeouts() {
    REQUEST_TIMEOUTS.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_late_responses() {
    LATE_RESPONSES.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_delivery_confirmed() {
    DELIVERY_CONFIRMED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_delivery_failed() {
    DELIVERY_FAILED.fetch_add(1, Ordering::Relaxed);
}
pub fn observe_ack_latency(sent_at: Instant) {
    let ms = sent_at.elapsed().as_millis() as u64;
    ACK_LATENCY_SUM_MS.fetch_add(ms, Ordering::Relaxed);
    ACK_LATENCY_COUNT.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_virtual_clients_dropped() {
    VIRTUAL_CLIENTS_DROPPED.fetch_add(1, Ordering::Relaxed);
}

#[derive(Debug, Default, Clone, serde::Serialize)]
pub struct Snapshot {
    pub frames_rx: u64,
    pub frames_tx: u64,
    pub decode_errors: u64,
    pub noise_bytes: u64,
    pub reconnects: u64,
    pub passkey_requests: u64,
    pub passkey_cache_hits: u64,
    pub request_timeouts: u64,
    pub late_responses: u64,
    pub delivery_confirmed: u64,
    pub delivery_failed: u64,
    pub ack_latency_avg_ms: Option<u64>,
    pub virtual_clients_dropped: u64,
}

pub fn snapshot() -> Snapshot {
    let sum = ACK_LATENCY_SUM_MS.load(Ordering::Relaxed);
    let count = ACK_LATENCY_COUNT.load(Ordering::Relaxed);
    Snapshot {
        frames_rx: FRAMES_RX.load(Ordering::Relaxed),
        frames_tx: FRAMES_TX.load(Ordering::Relaxed),
        decode_errors: DECODE_ERRORS.load(Ordering::Relaxed),
        noise_bytes: NOISE_BYTES.load(Ordering::Relaxed),
        reconnects: RECONNECTS.load(Ordering::Relaxed),
        passkey_requests: PASSKEY_REQUESTS.load(Ordering::Relaxed),
        passkey_cache_hits: PASSKEY_CACHE_HITS.load(Ordering::Relaxed),
        request_timeouts: REQUEST_TIMEOUTS.load(Ordering::Relaxed),
        late_responses: LATE_RESPONSES.load(Ordering::Relaxed),
        delivery_confirmed: DELIVERY_CONFIRMED.load(Ordering::Relaxed),
        delivery_failed: DELIVERY_FAILED.load(Ordering::Relaxed),
        ack_latency_avg_ms: if count > 0 { Some(sum / count) } else { None },
        virtual_clients_dropped: VIRTUAL_CLIENTS_DROPPED.load(Ordering::Relaxed),
    }
}
