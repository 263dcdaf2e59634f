//! Process-wide job counters.
//!
//! Counters are bumped silently; [`Metrics::flush`] emits them all as one
//! `tracing::info!` event (e.g. at shutdown or on a timer).

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics singleton.
pub static METRICS: Metrics = Metrics::new();

/// Lock-free job counters.
pub struct Metrics {
    jobs_started: AtomicU64,
    jobs_completed: AtomicU64,
    jobs_failed: AtomicU64,
    jobs_timed_out: AtomicU64,
    jobs_crashed: AtomicU64,
    on_demand_taps: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            jobs_started: AtomicU64::new(0),
            jobs_completed: AtomicU64::new(0),
            jobs_failed: AtomicU64::new(0),
            jobs_timed_out: AtomicU64::new(0),
            jobs_crashed: AtomicU64::new(0),
            on_demand_taps: AtomicU64::new(0),
        }
    }

    pub fn inc_started(&self) {
        self.jobs_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_completed(&self) {
        self.jobs_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_failed(&self) {
        self.jobs_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_timed_out(&self) {
        self.jobs_timed_out.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_crashed(&self) {
        self.jobs_crashed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_on_demand_taps(&self) {
        self.on_demand_taps.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "on_demand_taps", "counter incremented");
    }

    /// Emit all counters as a single `info!` event.
    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            jobs_started = self.jobs_started(),
            jobs_completed = self.jobs_completed(),
            jobs_failed = self.jobs_failed(),
            jobs_timed_out = self.jobs_timed_out(),
            jobs_crashed = self.jobs_crashed(),
            on_demand_taps = self.on_demand_taps(),
        );
    }

    pub fn jobs_started(&self) -> u64 {
        self.jobs_started.load(Ordering::Relaxed)
    }

    pub fn jobs_completed(&self) -> u64 {
        self.jobs_completed.load(Ordering::Relaxed)
    }

    pub fn jobs_failed(&self) -> u64 {
        self.jobs_failed.load(Ordering::Relaxed)
    }

    pub fn jobs_timed_out(&self) -> u64 {
        self.jobs_timed_out.load(Ordering::Relaxed)
    }

    pub fn jobs_crashed(&self) -> u64 {
        self.jobs_crashed.load(Ordering::Relaxed)
    }

    pub fn on_demand_taps(&self) -> u64 {
        self.on_demand_taps.load(Ordering::Relaxed)
    }
}
