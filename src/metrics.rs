//! Sync counters shared across rooms.
//!
//! Plain atomic registry; callers bump fields directly. The harness dumps
//! `to_json()` on its status interval. There is no HTTP listener here, the
//! admin surface lives outside this crate.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::RwLock;

/// Metrics registry for the sync server
#[derive(Debug)]
pub struct SyncMetrics {
    // Room counts
    pub rooms_active: AtomicU64,

    // Session lifecycle
    pub sessions_active: AtomicU64,
    pub players_bound: AtomicU64,
    pub joins_total: AtomicU64,
    pub join_errors: AtomicU64,
    pub duplicate_kicks: AtomicU64,
    pub leaves_total: AtomicU64,
    pub first_syncs: AtomicU64,

    // Inbound
    pub messages_received: AtomicU64,
    pub bytes_received: AtomicU64,
    pub decode_errors: AtomicU64,
    pub actions_applied: AtomicU64,

    // Outbound
    pub frames_broadcast: AtomicU64,
    pub frames_targeted: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub fields_skipped: AtomicU64,

    // Event queue
    pub events_enqueued: AtomicU64,
    pub stale_events_dropped: AtomicU64,

    // Tick timing (microseconds)
    pub tick_time_us: AtomicU64,
    pub tick_time_p95_us: AtomicU64,
    pub tick_time_p99_us: AtomicU64,
    pub tick_time_max_us: AtomicU64,
    pub tick_count: AtomicU64,

    start_time: Instant,

    // Rolling tick times for percentile calculation (VecDeque for O(1) pop_front)
    tick_history: RwLock<VecDeque<u64>>,
}

impl SyncMetrics {
    pub fn new() -> Self {
        Self {
            rooms_active: AtomicU64::new(0),
            sessions_active: AtomicU64::new(0),
            players_bound: AtomicU64::new(0),
            joins_total: AtomicU64::new(0),
            join_errors: AtomicU64::new(0),
            duplicate_kicks: AtomicU64::new(0),
            leaves_total: AtomicU64::new(0),
            first_syncs: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            decode_errors: AtomicU64::new(0),
            actions_applied: AtomicU64::new(0),
            frames_broadcast: AtomicU64::new(0),
            frames_targeted: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            fields_skipped: AtomicU64::new(0),
            events_enqueued: AtomicU64::new(0),
            stale_events_dropped: AtomicU64::new(0),
            tick_time_us: AtomicU64::new(0),
            tick_time_p95_us: AtomicU64::new(0),
            tick_time_p99_us: AtomicU64::new(0),
            tick_time_max_us: AtomicU64::new(0),
            tick_count: AtomicU64::new(0),
            start_time: Instant::now(),
            tick_history: RwLock::new(VecDeque::with_capacity(1000)),
        }
    }

    /// Record a tick time and update percentiles
    pub fn record_tick_time(&self, duration: Duration) {
        let us = duration.as_micros() as u64;
        self.tick_time_us.store(us, Ordering::Relaxed);
        self.tick_count.fetch_add(1, Ordering::Relaxed);

        let mut history = self.tick_history.write();
        history.push_back(us);

        // Keep last 1000 samples - O(1) with VecDeque
        while history.len() > 1000 {
            history.pop_front();
        }

        if history.len() >= 10 {
            let mut sorted: Vec<u64> = history.iter().copied().collect();
            sorted.sort_unstable();

            let p95_idx = (sorted.len() as f32 * 0.95) as usize;
            let p99_idx = (sorted.len() as f32 * 0.99) as usize;

            self.tick_time_p95_us
                .store(sorted[p95_idx.min(sorted.len() - 1)], Ordering::Relaxed);
            self.tick_time_p99_us
                .store(sorted[p99_idx.min(sorted.len() - 1)], Ordering::Relaxed);
            self.tick_time_max_us
                .store(sorted.last().copied().unwrap_or(0), Ordering::Relaxed);
        }
    }

    /// Get uptime in seconds
    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// JSON dump for the harness status log
    pub fn to_json(&self) -> String {
        format!(
            r#"{{
  "rooms": {{
    "active": {}
  }},
  "sessions": {{
    "active": {},
    "players_bound": {},
    "joins_total": {},
    "join_errors": {},
    "duplicate_kicks": {},
    "leaves_total": {},
    "first_syncs": {}
  }},
  "inbound": {{
    "messages_received": {},
    "bytes_received": {},
    "decode_errors": {},
    "actions_applied": {}
  }},
  "outbound": {{
    "frames_broadcast": {},
    "frames_targeted": {},
    "bytes_sent": {},
    "fields_skipped": {}
  }},
  "events": {{
    "enqueued": {},
    "stale_dropped": {}
  }},
  "ticks": {{
    "count": {},
    "last_us": {},
    "p95_us": {},
    "p99_us": {},
    "max_us": {}
  }},
  "uptime_seconds": {}
}}"#,
            self.rooms_active.load(Ordering::Relaxed),
            self.sessions_active.load(Ordering::Relaxed),
            self.players_bound.load(Ordering::Relaxed),
            self.joins_total.load(Ordering::Relaxed),
            self.join_errors.load(Ordering::Relaxed),
            self.duplicate_kicks.load(Ordering::Relaxed),
            self.leaves_total.load(Ordering::Relaxed),
            self.first_syncs.load(Ordering::Relaxed),
            self.messages_received.load(Ordering::Relaxed),
            self.bytes_received.load(Ordering::Relaxed),
            self.decode_errors.load(Ordering::Relaxed),
            self.actions_applied.load(Ordering::Relaxed),
            self.frames_broadcast.load(Ordering::Relaxed),
            self.frames_targeted.load(Ordering::Relaxed),
            self.bytes_sent.load(Ordering::Relaxed),
            self.fields_skipped.load(Ordering::Relaxed),
            self.events_enqueued.load(Ordering::Relaxed),
            self.stale_events_dropped.load(Ordering::Relaxed),
            self.tick_count.load(Ordering::Relaxed),
            self.tick_time_us.load(Ordering::Relaxed),
            self.tick_time_p95_us.load(Ordering::Relaxed),
            self.tick_time_p99_us.load(Ordering::Relaxed),
            self.tick_time_max_us.load(Ordering::Relaxed),
            self.uptime_seconds(),
        )
    }
}

impl Default for SyncMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_new() {
        let metrics = SyncMetrics::new();
        assert_eq!(metrics.sessions_active.load(Ordering::Relaxed), 0);
        assert_eq!(metrics.tick_count.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_record_tick_time() {
        let metrics = SyncMetrics::new();

        for i in 0..100 {
            metrics.record_tick_time(Duration::from_micros(100 + i * 10));
        }

        assert_eq!(metrics.tick_count.load(Ordering::Relaxed), 100);
        assert!(metrics.tick_time_p95_us.load(Ordering::Relaxed) > 0);
        assert!(metrics.tick_time_p99_us.load(Ordering::Relaxed) > 0);
        assert!(
            metrics.tick_time_p99_us.load(Ordering::Relaxed)
                >= metrics.tick_time_p95_us.load(Ordering::Relaxed)
        );
    }

    #[test]
    fn test_tick_history_bounded() {
        let metrics = SyncMetrics::new();
        for i in 0..1500u64 {
            metrics.record_tick_time(Duration::from_micros(i));
        }
        assert_eq!(metrics.tick_count.load(Ordering::Relaxed), 1500);
        // Window keeps the most recent samples only.
        assert!(metrics.tick_time_max_us.load(Ordering::Relaxed) >= 1000);
    }

    #[test]
    fn test_json_format() {
        let metrics = SyncMetrics::new();
        metrics.joins_total.store(3, Ordering::Relaxed);
        metrics.stale_events_dropped.store(2, Ordering::Relaxed);

        let output = metrics.to_json();
        let parsed: serde_json::Value = serde_json::from_str(&output).unwrap();
        assert_eq!(parsed["sessions"]["joins_total"], 3);
        assert_eq!(parsed["events"]["stale_dropped"], 2);
        assert!(parsed["ticks"]["count"].is_number());
    }
}
