//! Network-adjusted time source.
//!
//! Both the synchronizer and the minter gate on a synchronized clock:
//! chain-weight comparison and candidate timestamps are meaningless while
//! the local clock offset is unknown.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

pub trait NetworkTime: Send + Sync {
	/// Current network-adjusted time in milliseconds since the epoch, or
	/// `None` until the clock has been synchronized.
	fn now_millis(&self) -> Option<u64>;
}

/// System clock assumed to be synchronized out-of-band (NTP daemon etc.).
#[derive(Clone, Copy, Default)]
pub struct SystemTimeSource;

impl NetworkTime for SystemTimeSource {
	fn now_millis(&self) -> Option<u64> {
		SystemTime::now()
			.duration_since(UNIX_EPOCH)
			.ok()
			.map(|elapsed| elapsed.as_millis() as u64)
	}
}

/// Manually advanced clock. A value of zero means "not synchronized yet".
#[derive(Default)]
pub struct FixedTimeSource {
	now: AtomicU64,
}

impl FixedTimeSource {
	pub fn new(now: u64) -> Self {
		FixedTimeSource {
			now: AtomicU64::new(now),
		}
	}

	pub fn set(&self, now: u64) {
		self.now.store(now, Ordering::Relaxed);
	}
}

impl NetworkTime for FixedTimeSource {
	fn now_millis(&self) -> Option<u64> {
		match self.now.load(Ordering::Relaxed) {
			0 => None,
			now => Some(now),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn fixed_source_reports_unsynchronized_at_zero() {
		let time = FixedTimeSource::default();
		assert_eq!(time.now_millis(), None);

		time.set(12_345);
		assert_eq!(time.now_millis(), Some(12_345));
	}

	#[test]
	fn system_source_reports_some() {
		assert!(SystemTimeSource.now_millis().is_some());
	}
}
