//! Coarse monotonic timestamps used for availability hysteresis.
//!
//! Timestamps are milliseconds since a process-wide monotonic base, stored in
//! a wrapping 32-bit counter (~49.7 days of range). Holders must discard a
//! timestamp once [`Timestamp::is_rollover_danger`] reports true, otherwise
//! arithmetic against "now" could produce the wrong sign.

use std::sync::OnceLock;
use std::time::Instant;

/// Margin before counter wraparound at which timestamps must be discarded.
const ROLLOVER_MARGIN_MILLIS: i32 = 24 * 60 * 60 * 1000;

static BASE: OnceLock<Instant> = OnceLock::new();

fn now_millis() -> u32 {
    let base = *BASE.get_or_init(Instant::now);
    (base.elapsed().as_millis() & u128::from(u32::MAX)) as u32
}

/// A coarse-grained monotonic timestamp.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Timestamp {
    millis: u32,
}

impl Timestamp {
    /// Capture the current instant.
    pub fn now() -> Self {
        Self {
            millis: now_millis(),
        }
    }

    /// Signed milliseconds between this timestamp and now; positive if this
    /// timestamp lies in the past.
    pub fn offset_from_now(&self) -> i32 {
        now_millis().wrapping_sub(self.millis) as i32
    }

    /// Whether this timestamp is close enough to counter wraparound that
    /// comparisons against "now" can no longer be trusted.
    pub fn is_rollover_danger(&self) -> bool {
        self.offset_from_now() >= i32::MAX - ROLLOVER_MARGIN_MILLIS
    }

    #[cfg(test)]
    fn from_raw(millis: u32) -> Self {
        Self { millis }
    }
}
