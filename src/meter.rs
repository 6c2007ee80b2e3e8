//! Activity Meter: per-tunnel traffic and liveness counters, safe for
//! concurrent updates from many Forwarding Sessions and occasional readers.

use std::sync::atomic::{AtomicI32, AtomicI64, AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

const EWMA_HALF_LIFE: Duration = Duration::from_secs(2);
const BANDWIDTH_FLOOR: Duration = Duration::from_millis(50);

/// A point-in-time view of a tunnel's activity, suitable for serializing
/// into a `TunnelInfo` reply.
#[derive(Debug, Clone)]
pub struct MeterView {
    pub created_at_unix: u64,
    pub last_activity_unix: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub total_conns: u64,
    pub active_conns: i32,
    pub bandwidth_up: f64,
    pub bandwidth_down: f64,
}

/// Tracks a single direction's byte rate using an exponentially weighted
/// moving average, sampled lazily at read time so the pump loop never
/// blocks on anything but an atomic add.
struct RateEstimator {
    rate: f64,
    last_sample: Instant,
}

impl RateEstimator {
    fn new(now: Instant) -> Self {
        Self {
            rate: 0.0,
            last_sample: now,
        }
    }

    /// Folds `bytes` transferred at `now` into the running rate estimate.
    fn record(&mut self, bytes: u64, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_sample).max(BANDWIDTH_FLOOR);
        let instantaneous = bytes as f64 / elapsed.as_secs_f64();
        let alpha = ewma_alpha(elapsed);
        self.rate = self.rate + alpha * (instantaneous - self.rate);
        self.last_sample = now;
    }

    /// Decays the estimate toward zero if no bytes have moved recently,
    /// without requiring a writer to ever observe idle time directly.
    fn decayed(&self, now: Instant) -> f64 {
        let elapsed = now.saturating_duration_since(self.last_sample);
        if elapsed >= Duration::from_secs(5) {
            0.0
        } else {
            let alpha = ewma_alpha(elapsed.max(BANDWIDTH_FLOOR));
            self.rate * (1.0 - alpha)
        }
    }
}

fn ewma_alpha(elapsed: Duration) -> f64 {
    // alpha such that after EWMA_HALF_LIFE the weight on the old value is 0.5
    let lambda = std::f64::consts::LN_2 / EWMA_HALF_LIFE.as_secs_f64();
    1.0 - (-lambda * elapsed.as_secs_f64()).exp()
}

pub struct ActivityMeter {
    created_at: Instant,
    created_at_unix: u64,
    last_activity_millis: AtomicI64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    total_conns: AtomicU64,
    active_conns: AtomicI32,
    up: Mutex<RateEstimator>,
    down: Mutex<RateEstimator>,
}

impl ActivityMeter {
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            created_at: now,
            created_at_unix: unix_now(),
            last_activity_millis: AtomicI64::new(millis_since(now, now)),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            total_conns: AtomicU64::new(0),
            active_conns: AtomicI32::new(0),
            up: Mutex::new(RateEstimator::new(now)),
            down: Mutex::new(RateEstimator::new(now)),
        }
    }

    pub fn record_bytes_sent(&self, n: u64) {
        if n == 0 {
            return;
        }
        self.bytes_sent.fetch_add(n, Ordering::Relaxed);
        self.up.lock().record(n, Instant::now());
        self.touch();
    }

    pub fn record_bytes_received(&self, n: u64) {
        if n == 0 {
            return;
        }
        self.bytes_received.fetch_add(n, Ordering::Relaxed);
        self.down.lock().record(n, Instant::now());
        self.touch();
    }

    pub fn session_began(&self) {
        self.total_conns.fetch_add(1, Ordering::Relaxed);
        self.active_conns.fetch_add(1, Ordering::AcqRel);
        self.touch();
    }

    /// Decrements `active_conns`. Safe to call from any exit path, including
    /// abnormal ones; callers must ensure exactly one call per `session_began`.
    pub fn session_ended(&self) {
        let prev = self.active_conns.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "active_conns underflow");
        self.touch();
    }

    pub fn touch(&self) {
        let now = Instant::now();
        let ms = millis_since(self.created_at, now);
        // Monotonic non-decreasing: never let a stale write move it backward.
        self.last_activity_millis.fetch_max(ms, Ordering::Relaxed);
    }

    pub fn active_conns(&self) -> i32 {
        self.active_conns.load(Ordering::Acquire)
    }

    pub fn snapshot(&self) -> MeterView {
        let now = Instant::now();
        let last_activity_ms = self.last_activity_millis.load(Ordering::Relaxed);
        let last_activity_unix = self.created_at_unix + (last_activity_ms.max(0) as u64) / 1000;

        MeterView {
            created_at_unix: self.created_at_unix,
            last_activity_unix,
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            total_conns: self.total_conns.load(Ordering::Relaxed),
            active_conns: self.active_conns.load(Ordering::Acquire),
            bandwidth_up: self.up.lock().decayed(now).max(0.0),
            bandwidth_down: self.down.lock().decayed(now).max(0.0),
        }
    }
}

impl Default for ActivityMeter {
    fn default() -> Self {
        Self::new()
    }
}

fn millis_since(start: Instant, now: Instant) -> i64 {
    now.saturating_duration_since(start).as_millis() as i64
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn session_counting_never_goes_negative_and_tracks_total() {
        let m = ActivityMeter::new();
        m.session_began();
        m.session_began();
        assert_eq!(m.active_conns(), 2);
        m.session_ended();
        assert_eq!(m.active_conns(), 1);
        m.session_ended();
        assert_eq!(m.active_conns(), 0);

        let snap = m.snapshot();
        assert_eq!(snap.total_conns, 2);
        assert_eq!(snap.active_conns, 0);
    }

    #[test]
    fn last_activity_never_moves_backward() {
        let m = ActivityMeter::new();
        let created = m.snapshot().created_at_unix;
        m.touch();
        let first = m.snapshot().last_activity_unix;
        assert!(first >= created);
        m.touch();
        let second = m.snapshot().last_activity_unix;
        assert!(second >= first);
    }

    #[test]
    fn byte_counters_are_monotonic_under_concurrency() {
        let m = Arc::new(ActivityMeter::new());
        let mut handles = vec![];
        for _ in 0..8 {
            let m = Arc::clone(&m);
            handles.push(thread::spawn(move || {
                for _ in 0..1000 {
                    m.record_bytes_sent(10);
                    m.record_bytes_received(5);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        let snap = m.snapshot();
        assert_eq!(snap.bytes_sent, 8 * 1000 * 10);
        assert_eq!(snap.bytes_received, 8 * 1000 * 5);
    }

    #[test]
    fn bandwidth_settles_and_decays() {
        let m = ActivityMeter::new();
        for _ in 0..20 {
            m.record_bytes_sent(32 * 1024);
            thread::sleep(Duration::from_millis(50));
        }
        let warm = m.snapshot();
        assert!(warm.bandwidth_up > 0.0);

        thread::sleep(Duration::from_secs(5));
        let cold = m.snapshot();
        assert_eq!(cold.bandwidth_up, 0.0);
    }
}
