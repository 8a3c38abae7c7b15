//! Diagnostic counters carried over from the original driver's small
//! counter block: interrupts seen per class, self-ID rejects, context
//! restarts. Observability only — reading these never changes behavior.

use std::sync::atomic::AtomicU64;

#[derive(Default)]
pub struct Stats {
	pub self_id_completes: AtomicU64,
	pub self_id_rejects: AtomicU64,
	pub reg_access_failures: AtomicU64,
	pub posted_write_errors: AtomicU64,
	pub unrecoverable_errors: AtomicU64,
	pub context_restarts: AtomicU64,
	/// Extended by `Cycle64Seconds` wrap detection; feeds
	/// [`crate::time::uptime`].
	pub bus_seconds: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StatsSnapshot {
	pub self_id_completes: u64,
	pub self_id_rejects: u64,
	pub reg_access_failures: u64,
	pub posted_write_errors: u64,
	pub unrecoverable_errors: u64,
	pub context_restarts: u64,
	pub bus_seconds: u64,
}

impl Stats {
	pub fn snapshot(&self) -> StatsSnapshot {
		use std::sync::atomic::Ordering::Relaxed;
		StatsSnapshot {
			self_id_completes: self.self_id_completes.load(Relaxed),
			self_id_rejects: self.self_id_rejects.load(Relaxed),
			reg_access_failures: self.reg_access_failures.load(Relaxed),
			posted_write_errors: self.posted_write_errors.load(Relaxed),
			unrecoverable_errors: self.unrecoverable_errors.load(Relaxed),
			context_restarts: self.context_restarts.load(Relaxed),
			bus_seconds: self.bus_seconds.load(Relaxed),
		}
	}
}
