use crate::config::HeartbeatConfig;
use tokio::time::{Duration, Instant};

/// What to do when a heartbeat comes due
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Beat {
    /// Send a heartbeat now
    Send,
    /// Too many beats went unacknowledged; the connection is a zombie
    Zombie,
}

/// Tracks heartbeat state for a single connection.
///
/// Pure bookkeeping: the shard task asks when the next beat is due, sleeps
/// until then and reports back. Uses tokio's clock so paused-time tests can
/// drive it.
#[derive(Debug)]
pub struct HeartbeatTracker {
    config: HeartbeatConfig,

    /// Interval announced by hello; `None` until then
    interval: Option<Duration>,

    /// When the next beat is due
    next_beat_at: Option<Instant>,

    /// Time the last beat was sent
    last_sent: Option<Instant>,

    /// Time the last ack arrived
    last_ack: Option<Instant>,

    /// Round trip of the last acknowledged beat
    latency: Option<Duration>,

    /// Whether the last beat is still unacknowledged
    ack_pending: bool,

    /// Beats that came due while an ack was still pending
    missed_acks: u32,
}

impl HeartbeatTracker {
    pub fn new(config: HeartbeatConfig) -> Self {
        Self {
            config,
            interval: None,
            next_beat_at: None,
            last_sent: None,
            last_ack: None,
            latency: None,
            ack_pending: false,
            missed_acks: 0,
        }
    }

    /// Arm the timer with the interval from hello, clearing previous state
    pub fn start(&mut self, interval: Duration) {
        let first = if self.config.jitter_first_beat {
            interval.mul_f64(rand::random::<f64>())
        } else {
            interval
        };
        self.interval = Some(interval);
        self.next_beat_at = Some(Instant::now() + first);
        self.last_sent = None;
        self.last_ack = None;
        self.ack_pending = false;
        self.missed_acks = 0;
    }

    /// Disarm the timer (the connection is gone)
    pub fn stop(&mut self) {
        self.interval = None;
        self.next_beat_at = None;
        self.ack_pending = false;
        self.missed_acks = 0;
    }

    /// When the next beat is due, if armed
    pub fn next_beat_at(&self) -> Option<Instant> {
        self.next_beat_at
    }

    /// Whether a beat is due now
    pub fn is_due(&self) -> bool {
        matches!(self.next_beat_at, Some(at) if Instant::now() >= at)
    }

    /// Called when the timer fires.
    ///
    /// If the previous beat is still unacknowledged it counts as missed; once
    /// `max_missed_acks` are missed the connection is declared a zombie and the
    /// timer is disarmed. Otherwise the beat is recorded as sent and the timer
    /// rearmed one interval later.
    pub fn on_due(&mut self) -> Beat {
        if self.ack_pending {
            self.missed_acks += 1;
            if self.missed_acks >= self.config.max_missed_acks {
                self.next_beat_at = None;
                return Beat::Zombie;
            }
        }

        let now = Instant::now();
        self.last_sent = Some(now);
        self.ack_pending = true;
        self.next_beat_at = self.interval.map(|interval| now + interval);
        Beat::Send
    }

    /// Record a heartbeat ack
    pub fn record_ack(&mut self) {
        let now = Instant::now();
        self.last_ack = Some(now);
        self.latency = self.last_sent.map(|sent| now.duration_since(sent));
        self.ack_pending = false;
        self.missed_acks = 0;
    }

    pub fn ack_pending(&self) -> bool {
        self.ack_pending
    }

    pub fn missed_acks(&self) -> u32 {
        self.missed_acks
    }

    /// Round trip of the last acknowledged beat
    pub fn latency(&self) -> Option<Duration> {
        self.latency
    }

    pub fn interval(&self) -> Option<Duration> {
        self.interval
    }

    pub fn last_ack(&self) -> Option<Instant> {
        self.last_ack
    }
}
