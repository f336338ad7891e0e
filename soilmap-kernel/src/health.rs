use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

#[derive(Debug, Serialize)]
pub struct KernelHealth {
    pub uptime_seconds: u64,
    pub store_status: String,
    pub store_reconnects: u64,
    pub markers_rendered: u64,
    pub snapshots_applied: u64,
    pub snapshots_suppressed: u64,
    pub acknowledgments_written: u64,
    pub acknowledgments_failed: u64,
    pub last_snapshot_at: Option<String>,
}

#[derive(Default)]
struct Counters {
    store_reconnects: AtomicU64,
    markers_rendered: AtomicU64,
    snapshots_applied: AtomicU64,
    snapshots_suppressed: AtomicU64,
    acknowledgments_written: AtomicU64,
    acknowledgments_failed: AtomicU64,
}

/// Compteurs de santé partagés entre le store, la boucle de sync et l'API
#[derive(Clone)]
pub struct HealthTracker {
    start_time: Instant,
    counters: Arc<Counters>,
    store_status: Arc<Mutex<String>>,
    last_snapshot: Arc<Mutex<Option<OffsetDateTime>>>,
}

impl HealthTracker {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            counters: Arc::new(Counters::default()),
            store_status: Arc::new(Mutex::new("connecting".to_string())),
            last_snapshot: Arc::new(Mutex::new(None)),
        }
    }

    pub fn mark_store_connected(&self) {
        *self.store_status.lock() = "connected".to_string();
    }

    pub fn mark_store_disconnected(&self) {
        *self.store_status.lock() = "disconnected".to_string();
    }

    pub fn increment_reconnects(&self) {
        self.counters.store_reconnects.fetch_add(1, Ordering::Relaxed);
        *self.store_status.lock() = "reconnecting".to_string();
    }

    pub fn record_snapshot_applied(&self, markers: usize) {
        self.counters.snapshots_applied.fetch_add(1, Ordering::Relaxed);
        self.counters.markers_rendered.store(markers as u64, Ordering::Relaxed);
        *self.last_snapshot.lock() = Some(OffsetDateTime::now_utc());
    }

    pub fn record_snapshot_suppressed(&self) {
        self.counters.snapshots_suppressed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_acknowledgment(&self, written: bool) {
        let counter = if written {
            &self.counters.acknowledgments_written
        } else {
            &self.counters.acknowledgments_failed
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_health(&self) -> KernelHealth {
        let c = &self.counters;
        KernelHealth {
            uptime_seconds: self.start_time.elapsed().as_secs(),
            store_status: self.store_status.lock().clone(),
            store_reconnects: c.store_reconnects.load(Ordering::Relaxed),
            markers_rendered: c.markers_rendered.load(Ordering::Relaxed),
            snapshots_applied: c.snapshots_applied.load(Ordering::Relaxed),
            snapshots_suppressed: c.snapshots_suppressed.load(Ordering::Relaxed),
            acknowledgments_written: c.acknowledgments_written.load(Ordering::Relaxed),
            acknowledgments_failed: c.acknowledgments_failed.load(Ordering::Relaxed),
            last_snapshot_at: self
                .last_snapshot
                .lock()
                .and_then(|ts| ts.format(&Rfc3339).ok()),
        }
    }
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let health = HealthTracker::new();
        assert_eq!(health.get_health().store_status, "connecting");
        assert!(health.get_health().last_snapshot_at.is_none());

        health.mark_store_connected();
        health.record_snapshot_applied(3);
        health.record_snapshot_suppressed();
        health.record_acknowledgment(true);
        health.record_acknowledgment(false);
        health.increment_reconnects();

        let h = health.clone().get_health();
        assert_eq!(h.store_status, "reconnecting");
        assert_eq!(h.store_reconnects, 1);
        assert_eq!(h.markers_rendered, 3);
        assert_eq!(h.snapshots_applied, 1);
        assert_eq!(h.snapshots_suppressed, 1);
        assert_eq!(h.acknowledgments_written, 1);
        assert_eq!(h.acknowledgments_failed, 1);
        assert!(h.last_snapshot_at.is_some());
    }
}
