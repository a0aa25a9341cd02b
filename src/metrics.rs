use crate::session::ShardState;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Metrics for observability
///
/// Counters are shared by every shard of a manager and by the REST client
/// when one is given the same instance. Use `snapshot()` for a consistent
/// point-in-time view.
///
/// # Example
/// ```ignore
/// let metrics = manager.metrics();
/// println!("Dispatches: {}", metrics.dispatches());
/// let snapshot = metrics.snapshot();
/// ```
#[derive(Debug, Default)]
pub struct Metrics {
    connections_total: AtomicU64,
    reconnections_total: AtomicU64,
    identifies_total: AtomicU64,
    resumes_total: AtomicU64,
    dispatches_total: AtomicU64,
    unhandled_dispatches_total: AtomicU64,
    heartbeats_sent_total: AtomicU64,
    heartbeat_acks_total: AtomicU64,
    zombie_closes_total: AtomicU64,
    invalid_sessions_total: AtomicU64,
    errors_total: AtomicU64,
    rest_requests_total: AtomicU64,
    rest_rate_limited_total: AtomicU64,

    shard_metrics: RwLock<BTreeMap<u32, ShardMetrics>>,
}

/// Metrics for a single shard
#[derive(Debug, Clone)]
pub struct ShardMetrics {
    pub shard_id: u32,
    pub state: ShardState,
    /// Whether the shard currently has an established session
    pub is_connected: bool,
    /// Sequence of the last dispatch delivered
    pub last_sequence: Option<u64>,
    /// Round trip of the last acknowledged heartbeat
    pub heartbeat_latency: Option<Duration>,
    /// Time since the session was last established (None if never)
    pub time_since_connected: Option<Duration>,
    /// Current reconnection attempt (0 if connected)
    pub reconnect_attempt: u32,
    #[doc(hidden)]
    pub(crate) last_connected_at: Option<Instant>,
}

impl ShardMetrics {
    fn new(shard_id: u32) -> Self {
        Self {
            shard_id,
            state: ShardState::Disconnected,
            is_connected: false,
            last_sequence: None,
            heartbeat_latency: None,
            time_since_connected: None,
            reconnect_attempt: 0,
            last_connected_at: None,
        }
    }

    fn snapshot(&self) -> ShardMetrics {
        ShardMetrics {
            time_since_connected: self.last_connected_at.map(|t| t.elapsed()),
            ..self.clone()
        }
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    // ========== Getters ==========

    /// Sessions established (identify or resume)
    pub fn connections(&self) -> u64 {
        self.connections_total.load(Ordering::Relaxed)
    }

    pub fn reconnections(&self) -> u64 {
        self.reconnections_total.load(Ordering::Relaxed)
    }

    pub fn identifies(&self) -> u64 {
        self.identifies_total.load(Ordering::Relaxed)
    }

    pub fn resumes(&self) -> u64 {
        self.resumes_total.load(Ordering::Relaxed)
    }

    pub fn dispatches(&self) -> u64 {
        self.dispatches_total.load(Ordering::Relaxed)
    }

    pub fn unhandled_dispatches(&self) -> u64 {
        self.unhandled_dispatches_total.load(Ordering::Relaxed)
    }

    pub fn heartbeats_sent(&self) -> u64 {
        self.heartbeats_sent_total.load(Ordering::Relaxed)
    }

    pub fn heartbeat_acks(&self) -> u64 {
        self.heartbeat_acks_total.load(Ordering::Relaxed)
    }

    pub fn zombie_closes(&self) -> u64 {
        self.zombie_closes_total.load(Ordering::Relaxed)
    }

    pub fn invalid_sessions(&self) -> u64 {
        self.invalid_sessions_total.load(Ordering::Relaxed)
    }

    pub fn errors(&self) -> u64 {
        self.errors_total.load(Ordering::Relaxed)
    }

    pub fn rest_requests(&self) -> u64 {
        self.rest_requests_total.load(Ordering::Relaxed)
    }

    /// 429 responses absorbed by the rate limiter
    pub fn rest_rate_limited(&self) -> u64 {
        self.rest_rate_limited_total.load(Ordering::Relaxed)
    }

    // ========== Recording methods (called internally) ==========

    pub(crate) fn record_connection(&self) {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_reconnection(&self) {
        self.reconnections_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_identify(&self) {
        self.identifies_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_resume(&self) {
        self.resumes_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_dispatch(&self, unhandled: bool) {
        self.dispatches_total.fetch_add(1, Ordering::Relaxed);
        if unhandled {
            self.unhandled_dispatches_total.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_heartbeat(&self) {
        self.heartbeats_sent_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_heartbeat_ack(&self) {
        self.heartbeat_acks_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_zombie(&self) {
        self.zombie_closes_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_invalid_session(&self) {
        self.invalid_sessions_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_error(&self) {
        self.errors_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_rest_request(&self) {
        self.rest_requests_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_rest_rate_limited(&self) {
        self.rest_rate_limited_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Update metrics for a specific shard, creating its entry on first use
    pub(crate) fn update_shard(&self, shard_id: u32, update_fn: impl FnOnce(&mut ShardMetrics)) {
        let mut shards = self.shard_metrics.write();
        let entry = shards
            .entry(shard_id)
            .or_insert_with(|| ShardMetrics::new(shard_id));
        update_fn(entry);
    }

    /// Forget per-shard entries, e.g. after the shard set was replaced
    pub(crate) fn clear_shards(&self) {
        self.shard_metrics.write().clear();
    }

    /// Snapshot of all shard metrics, ordered by shard id
    pub fn shard_metrics(&self) -> Vec<ShardMetrics> {
        self.shard_metrics.read().values().map(|s| s.snapshot()).collect()
    }

    pub fn shard(&self, shard_id: u32) -> Option<ShardMetrics> {
        self.shard_metrics.read().get(&shard_id).map(|s| s.snapshot())
    }

    /// Shards with an established session
    pub fn active_connections(&self) -> usize {
        self.shard_metrics
            .read()
            .values()
            .filter(|s| s.is_connected)
            .count()
    }

    /// Get a point-in-time snapshot of all metrics for export
    pub fn snapshot(&self) -> MetricsSnapshot {
        let shards = self.shard_metrics.read();
        let shard_snapshots: Vec<ShardMetrics> = shards.values().map(|s| s.snapshot()).collect();

        MetricsSnapshot {
            connections_total: self.connections_total.load(Ordering::Acquire),
            reconnections_total: self.reconnections_total.load(Ordering::Acquire),
            identifies_total: self.identifies_total.load(Ordering::Acquire),
            resumes_total: self.resumes_total.load(Ordering::Acquire),
            dispatches_total: self.dispatches_total.load(Ordering::Acquire),
            unhandled_dispatches_total: self.unhandled_dispatches_total.load(Ordering::Acquire),
            heartbeats_sent_total: self.heartbeats_sent_total.load(Ordering::Acquire),
            heartbeat_acks_total: self.heartbeat_acks_total.load(Ordering::Acquire),
            zombie_closes_total: self.zombie_closes_total.load(Ordering::Acquire),
            invalid_sessions_total: self.invalid_sessions_total.load(Ordering::Acquire),
            errors_total: self.errors_total.load(Ordering::Acquire),
            rest_requests_total: self.rest_requests_total.load(Ordering::Acquire),
            rest_rate_limited_total: self.rest_rate_limited_total.load(Ordering::Acquire),
            active_connections: shard_snapshots.iter().filter(|s| s.is_connected).count(),
            shards: shard_snapshots,
        }
    }
}

/// A point-in-time snapshot of all metrics
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub connections_total: u64,
    pub reconnections_total: u64,
    pub identifies_total: u64,
    pub resumes_total: u64,
    pub dispatches_total: u64,
    pub unhandled_dispatches_total: u64,
    pub heartbeats_sent_total: u64,
    pub heartbeat_acks_total: u64,
    pub zombie_closes_total: u64,
    pub invalid_sessions_total: u64,
    pub errors_total: u64,
    pub rest_requests_total: u64,
    pub rest_rate_limited_total: u64,
    pub active_connections: usize,
    pub shards: Vec<ShardMetrics>,
}
