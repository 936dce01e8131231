//! Diagnostics / Health (spec §2, §4.3, §4.4): readiness, liveness, disk usage, and
//! last-successful-upload timestamp, shared between the Collector's HTTP surface and
//! the Shipper's heartbeat.

use crate::store::{DiskUsage, Store, HARD_PRESSURE};
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub struct Health {
    store: Arc<Store>,
    shutting_down: AtomicBool,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ReadinessReport {
    pub ready: bool,
    pub usage: UsageReport,
    pub shutting_down: bool,
}

#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct UsageReport {
    pub total_bytes: u64,
    pub used_bytes: u64,
    pub used_fraction: f64,
}

impl From<DiskUsage> for UsageReport {
    fn from(u: DiskUsage) -> Self {
        Self {
            total_bytes: u.total_bytes,
            used_bytes: u.used_bytes,
            used_fraction: u.used_fraction(),
        }
    }
}

impl Health {
    pub fn new(store: Arc<Store>) -> Self {
        Self {
            store,
            shutting_down: AtomicBool::new(false),
        }
    }

    pub fn begin_shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Ready when the store is writable and disk pressure is below the hard
    /// threshold (spec §4.3, §7).
    pub fn readiness(&self) -> ReadinessReport {
        let usage = self.store.usage().ok();
        let ready = !self.is_shutting_down() && usage.map(|u| u.used_fraction() < HARD_PRESSURE).unwrap_or(false);
        ReadinessReport {
            ready,
            usage: usage.map(UsageReport::from).unwrap_or(UsageReport {
                total_bytes: 0,
                used_bytes: 0,
                used_fraction: 0.0,
            }),
            shutting_down: self.is_shutting_down(),
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct HeartbeatReport {
    pub shipper_id: String,
    pub last_successful_upload_at: Option<DateTime<Utc>>,
}
