//! Monotonically-increasing run counters (§3 "Stats").
//!
//! All mutation goes through a single mutex; readers take a value-copy
//! snapshot so nothing outside this module ever sees a torn read.

use std::sync::Mutex;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct StatsSnapshot {
	pub files_processed: u64,
	pub files_failed: u64,
	pub files_skipped: u64,
	pub files_not_found: u64,
	pub dirs_created: u64,
	pub bytes_copied: u64,
}

#[derive(Debug, Default)]
pub struct Stats(Mutex<StatsSnapshot>);

impl Stats {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn snapshot(&self) -> StatsSnapshot {
		*self.0.lock().expect("stats mutex poisoned")
	}

	pub fn inc_files_processed(&self) {
		self.0.lock().expect("stats mutex poisoned").files_processed += 1;
	}

	pub fn inc_files_failed(&self) {
		self.0.lock().expect("stats mutex poisoned").files_failed += 1;
	}

	pub fn inc_files_skipped(&self) {
		self.0.lock().expect("stats mutex poisoned").files_skipped += 1;
	}

	pub fn inc_files_not_found(&self) {
		self.0.lock().expect("stats mutex poisoned").files_not_found += 1;
	}

	pub fn inc_dirs_created(&self) {
		self.0.lock().expect("stats mutex poisoned").dirs_created += 1;
	}

	pub fn add_bytes_copied(&self, bytes: u64) {
		self.0.lock().expect("stats mutex poisoned").bytes_copied += bytes;
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn snapshot_is_a_value_copy() {
		let stats = Stats::new();
		stats.inc_files_processed();
		let a = stats.snapshot();
		stats.inc_files_processed();
		let b = stats.snapshot();
		assert_eq!(a.files_processed, 1);
		assert_eq!(b.files_processed, 2);
	}

	#[test]
	fn bytes_copied_advances_by_exact_amount() {
		let stats = Stats::new();
		stats.add_bytes_copied(128);
		stats.add_bytes_copied(256);
		assert_eq!(stats.snapshot().bytes_copied, 384);
	}
}
