//! Construction-time tunables for a [`crate::unit::Unit`].
//!
//! Defaults mirror the constants named directly by the OHCI register
//! contract rather than values picked for convenience: AR uses a fixed
//! 10-page ring, the PHY gateway polls 100 times at 5 ms, and context
//! stop polls for ~50 ms in 25 ms steps.

use std::time::Duration;

/// Worker thread priorities. These are advisory: `std::thread` does not
/// expose priority control portably, so [`crate::sync::Worker::spawn`]
/// records them for diagnostics and best-effort `nice`-style hints but
/// does not fail if the platform ignores them.
#[derive(Debug, Clone, Copy)]
pub struct Priorities {
	pub bus_reset: u8,
	pub at: u8,
	pub ar: u8,
	pub ir: u8,
	pub split_timeout: u8,
}

impl Default for Priorities {
	fn default() -> Self {
		Priorities { bus_reset: 21, at: 20, ar: 20, ir: 21, split_timeout: 20 }
	}
}

/// Size, in bytes, of one AR page. Must fit the largest S400 packet
/// (2 068 bytes minimum) and stay quadlet-aligned.
pub const AR_PAGE_SIZE: usize = 65_532;

/// Fixed AR ring depth.
pub const AR_PAGE_COUNT: usize = 10;

/// Default AT buffer pool size per context: a fixed pool sized from a
/// byte budget divided by buffer size.
pub const AT_DMA_BUFFER_SIZE: usize = 32 * 1024;
pub const AT_BUFFER_RECORD_SIZE: usize = 256;
pub const DEFAULT_AT_BUFFERS: usize = AT_DMA_BUFFER_SIZE / AT_BUFFER_RECORD_SIZE;

/// PHY register gateway poll budget.
pub const PHY_POLL_INTERVAL: Duration = Duration::from_millis(5);
pub const PHY_POLL_ITERS: u32 = 100;

/// Generic context-stop poll budget.
pub const CONTEXT_STOP_POLL: Duration = Duration::from_millis(25);
pub const CONTEXT_STOP_ITERS: u32 = 2;

/// CSR compare-swap poll budget, same cadence as PHY.
pub const CSR_POLL_INTERVAL: Duration = Duration::from_millis(5);
pub const CSR_POLL_ITERS: u32 = 100;

/// Consecutive topology-refresh failures tolerated before the unit is
/// disabled.
pub const MAX_BAD_TOPO: u32 = 10;

#[derive(Debug, Clone)]
pub struct UnitConfig {
	pub at_buffers_per_context: usize,
	pub ar_page_count: usize,
	pub ar_page_size: usize,
	pub max_iso_receive_ctx: usize,
	pub priorities: Priorities,
}

impl Default for UnitConfig {
	fn default() -> Self {
		UnitConfig {
			at_buffers_per_context: DEFAULT_AT_BUFFERS,
			ar_page_count: AR_PAGE_COUNT,
			ar_page_size: AR_PAGE_SIZE,
			max_iso_receive_ctx: 32,
			priorities: Priorities::default(),
		}
	}
}
