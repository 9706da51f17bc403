//! Admission limits: requests per minute and concurrent in-flight calls.

use serde::{Deserialize, Serialize};

/// Configured ceilings for the dispatcher.
///
/// When `coupled` is set, the concurrency cap follows `rpm` on every rpm
/// change. Setting `max_concurrent` explicitly decouples the two.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Limits {
    pub rpm: u32,
    pub max_concurrent: u32,
    #[serde(default = "default_coupled")]
    pub coupled: bool,
}

fn default_coupled() -> bool {
    true
}

impl Default for Limits {
    fn default() -> Self {
        Self::coupled(Self::DEFAULT_RPM)
    }
}

impl Limits {
    pub const DEFAULT_RPM: u32 = 10;

    /// Concurrency cap equal to the rate limit.
    pub fn coupled(rpm: u32) -> Self {
        Self {
            rpm,
            max_concurrent: rpm,
            coupled: true,
        }
    }

    /// Independently tuned rate and concurrency.
    pub fn independent(rpm: u32, max_concurrent: u32) -> Self {
        Self {
            rpm,
            max_concurrent,
            coupled: false,
        }
    }

    pub fn set_rpm(&mut self, rpm: u32) {
        self.rpm = rpm;
        if self.coupled {
            self.max_concurrent = rpm;
        }
    }

    pub fn set_max_concurrent(&mut self, max_concurrent: u32) {
        self.max_concurrent = max_concurrent;
        self.coupled = false;
    }

    /// Effective ceiling on simultaneously processing items.
    pub fn concurrency_cap(&self) -> usize {
        self.max_concurrent.min(self.rpm) as usize
    }

    /// False when either ceiling is zero, meaning nothing can be admitted.
    pub fn admits_anything(&self) -> bool {
        self.rpm > 0 && self.max_concurrent > 0
    }
}

/// Number of queued items that may be promoted right now.
///
/// `in_flight` is the number of outstanding service calls and
/// `window_remaining` is `rpm` minus the admissions still in the window.
/// Concurrency is bounded by `min(max_concurrent, rpm)`. Clamps to zero on
/// any exhausted or zero ceiling.
pub fn available_slots(
    limits: &Limits,
    in_flight: usize,
    window_remaining: usize,
    queued: usize,
) -> usize {
    limits
        .concurrency_cap()
        .saturating_sub(in_flight)
        .min(window_remaining)
        .min(queued)
}
