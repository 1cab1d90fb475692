//! Per-stage packet counters and measured bitrate

use std::sync::Mutex;
use std::sync::PoisonError;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use serde::Serialize;

use crate::packet::PKT_SIZE_BITS;

/// Counters updated by the stage thread and read by the control surface.
#[derive(Debug)]
pub struct StageStats {
    /// Packets handed to the plugin
    processed: AtomicU64,
    /// Packets moved without invoking the plugin (suspended, failed, label filter)
    passed: AtomicU64,
    dropped: AtomicU64,
    nullified: AtomicU64,
    /// Packets that left the stage, downstream or to the sink
    emitted: AtomicU64,
    started_at: Mutex<Option<Instant>>,
}

impl StageStats {
    pub fn new() -> Self {
        Self {
            processed: AtomicU64::new(0),
            passed: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            nullified: AtomicU64::new(0),
            emitted: AtomicU64::new(0),
            started_at: Mutex::new(None),
        }
    }

    /// Starts the bitrate clock on the first call only.
    pub fn mark_started(&self) {
        let mut started = self
            .started_at
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if started.is_none() {
            *started = Some(Instant::now());
        }
    }

    pub fn record_processed(&self, count: u64) {
        self.processed.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_passed(&self, count: u64) {
        self.passed.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_nullified(&self) {
        self.nullified.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_emitted(&self, count: u64) {
        self.emitted.fetch_add(count, Ordering::Relaxed);
    }

    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    pub fn passed(&self) -> u64 {
        self.passed.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn nullified(&self) -> u64 {
        self.nullified.load(Ordering::Relaxed)
    }

    pub fn emitted(&self) -> u64 {
        self.emitted.load(Ordering::Relaxed)
    }

    /// Bits per second emitted since the stage started, 0 before that.
    pub fn measured_bitrate(&self) -> u64 {
        let started = *self
            .started_at
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let Some(started) = started else {
            return 0;
        };
        let secs = started.elapsed().as_secs_f64();
        if secs <= 0.0 {
            return 0;
        }
        ((self.emitted() * PKT_SIZE_BITS) as f64 / secs) as u64
    }

    pub fn summary(&self) -> StatsSummary {
        StatsSummary {
            processed: self.processed(),
            passed: self.passed(),
            dropped: self.dropped(),
            nullified: self.nullified(),
            emitted: self.emitted(),
            bitrate: self.measured_bitrate(),
        }
    }
}

impl Default for StageStats {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatsSummary {
    pub processed: u64,
    pub passed: u64,
    pub dropped: u64,
    pub nullified: u64,
    pub emitted: u64,
    pub bitrate: u64,
}

impl std::fmt::Display for StatsSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "processed={} passed={} dropped={} nullified={} emitted={} bitrate={}",
            self.processed, self.passed, self.dropped, self.nullified, self.emitted, self.bitrate
        )
    }
}
