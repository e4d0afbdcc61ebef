//! The partition-tolerant fallback facade and its moving parts.

mod core;
mod migration;
mod probe;
mod target;
mod transaction;

pub use self::core::FallbackKvDatabase;
pub use self::target::{
    AvailabilityChecker, FallbackTarget, TransactionChecker, DEFAULT_CHECK_INTERVAL,
    DEFAULT_MIN_AVAILABLE_TIME, DEFAULT_MIN_UNAVAILABLE_TIME, DEFAULT_PROBE_TIMEOUT,
};
pub use self::transaction::FallbackKvTransaction;
