//! Sliding admission window.
//!
//! Tracks the instants at which work was admitted to the external service
//! and answers whether another admission fits in the trailing 60 seconds.
//! An admission at `t` counts against the budget while `now - t < 60s`.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Length of the rate-limit window.
pub const WINDOW: Duration = Duration::from_secs(60);

/// Admission timestamps within the trailing window, oldest first.
#[derive(Debug, Clone)]
pub struct AdmissionWindow {
    timestamps: VecDeque<Instant>,
    rpm: u32,
}

impl AdmissionWindow {
    pub fn new(rpm: u32) -> Self {
        Self {
            timestamps: VecDeque::with_capacity(rpm as usize),
            rpm,
        }
    }

    /// Requests-per-minute budget.
    pub fn rpm(&self) -> u32 {
        self.rpm
    }

    /// Change the budget. Keeps only the most recent `rpm` admissions.
    pub fn set_rpm(&mut self, rpm: u32) {
        self.rpm = rpm;
        self.cap();
    }

    /// Drop admissions that have aged out of the window.
    pub fn prune(&mut self, now: Instant) {
        let expired = self.expired_prefix(now);
        self.timestamps.drain(..expired);
    }

    /// Prune, then report whether another admission fits.
    pub fn can_admit(&mut self, now: Instant) -> bool {
        self.prune(now);
        self.timestamps.len() < self.rpm as usize
    }

    /// Record one admission at `now`.
    pub fn record_admission(&mut self, now: Instant) {
        self.timestamps.push_back(now);
        self.cap();
    }

    /// Admissions still inside the window at `now`.
    pub fn admitted(&self, now: Instant) -> usize {
        self.timestamps.len() - self.expired_prefix(now)
    }

    /// Budget left in the window at `now`.
    pub fn remaining(&self, now: Instant) -> usize {
        (self.rpm as usize).saturating_sub(self.admitted(now))
    }

    /// Instant at which the next slot opens, or None if one is open now.
    ///
    /// Also None when `rpm` is zero: no slot will ever open.
    pub fn next_slot_at(&self, now: Instant) -> Option<Instant> {
        let rpm = self.rpm as usize;
        let expired = self.expired_prefix(now);
        let live = self.timestamps.len() - expired;
        if rpm == 0 || live < rpm {
            return None;
        }
        // rpm-th most recent live admission
        self.timestamps
            .get(expired + live - rpm)
            .map(|oldest| *oldest + WINDOW)
    }

    /// Whole seconds until the next slot opens, rounded up. Zero when a slot
    /// is open. Recompute on every call; the value decays with time.
    pub fn seconds_until_next_slot(&self, now: Instant) -> u64 {
        match self.next_slot_at(now) {
            Some(at) => ceil_secs(at.saturating_duration_since(now)),
            None => 0,
        }
    }

    /// Number of leading timestamps that fall outside the window at `now`.
    fn expired_prefix(&self, now: Instant) -> usize {
        self.timestamps
            .partition_point(|t| now.saturating_duration_since(*t) >= WINDOW)
    }

    fn cap(&mut self) {
        let rpm = self.rpm as usize;
        if self.timestamps.len() > rpm {
            let excess = self.timestamps.len() - rpm;
            self.timestamps.drain(..excess);
        }
    }
}

fn ceil_secs(d: Duration) -> u64 {
    d.as_secs() + u64::from(d.subsec_nanos() > 0)
}
