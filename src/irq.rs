//! IRQ dispatcher: the top half that reads-and-clears `IntEvent` and
//! fans bits out as worker signals.
//!
//! Contract: must not block and must not acquire the unit lock. This
//! module only ever touches the register gateway and raises
//! [`crate::sync::Signal`]s; all actual work happens in the signalled
//! worker.

use bitflags::bitflags;

use crate::config::MAX_BAD_TOPO;
use crate::regs::{offset, RawWindow, Registers};
use crate::stats::Stats;
use crate::sync::Signal;
use std::sync::atomic::Ordering;

bitflags! {
	#[derive(Debug, Clone, Copy, PartialEq, Eq)]
	pub struct IntEvent: u32 {
		const REQ_TX_COMPLETE    = 1 << 0;
		const RESP_TX_COMPLETE   = 1 << 1;
		const RQ_PKT             = 1 << 2;
		const RS_PKT             = 1 << 3;
		const ISO_XMIT           = 1 << 4;
		const ISO_RECV           = 1 << 5;
		const SELF_ID_COMPLETE   = 1 << 16;
		const BUS_RESET          = 1 << 17;
		const REG_ACCESS_FAIL    = 1 << 18;
		const POSTED_WRITE_ERR   = 1 << 19;
		const UNRECOVERABLE_ERR  = 1 << 20;
		const CYCLE_TOO_LONG     = 1 << 21;
		const CYCLE64_SECONDS    = 1 << 22;
	}
}

/// The set of worker signals the dispatcher fans events out to.
pub struct DispatchTargets<'a> {
	pub bus_reset: &'a Signal,
	pub at_request: &'a Signal,
	pub at_response: &'a Signal,
	pub ar_request: &'a Signal,
	pub ar_response: &'a Signal,
	/// Indexed the same way as the iso event registers' bit position.
	pub iso_recv: &'a [std::sync::Arc<Signal>],
}

/// Runs one dispatch pass: reads the masked event register, clears
/// everything except `BusReset` (cleared later by the bus-reset worker
/// per OHCI 7.2.3.2), and raises the corresponding signals. Returns
/// immediately on a spurious read (all-zero or all-one word).
pub fn dispatch<W: RawWindow>(regs: &Registers<W>, stats: &Stats, targets: &DispatchTargets<'_>) {
	let event = regs.read(offset::INT_EVENT_SET);
	if event == 0 || event == u32::MAX {
		return;
	}

	let bits = IntEvent::from_bits_truncate(event);
	let to_clear = bits & !IntEvent::BUS_RESET;
	if !to_clear.is_empty() {
		regs.write(offset::INT_EVENT_CLEAR, to_clear.bits());
	}

	if bits.contains(IntEvent::SELF_ID_COMPLETE) {
		stats.self_id_completes.fetch_add(1, Ordering::Relaxed);
		targets.bus_reset.raise();
	}
	if bits.contains(IntEvent::REQ_TX_COMPLETE) {
		targets.at_request.raise();
	}
	if bits.contains(IntEvent::RESP_TX_COMPLETE) {
		targets.at_response.raise();
	}
	if bits.contains(IntEvent::RQ_PKT) {
		targets.ar_request.raise();
	}
	if bits.contains(IntEvent::RS_PKT) {
		targets.ar_response.raise();
	}
	if bits.contains(IntEvent::ISO_RECV) {
		let iso_event = regs.read(offset::ISO_RECV_INT_EVENT_CLEAR);
		regs.write(offset::ISO_RECV_INT_EVENT_CLEAR, iso_event);
		for (idx, signal) in targets.iso_recv.iter().enumerate() {
			if iso_event & (1 << idx) != 0 {
				signal.raise();
			}
		}
	}

	if bits.contains(IntEvent::REG_ACCESS_FAIL) {
		log::error!("register access failed");
		stats.reg_access_failures.fetch_add(1, Ordering::Relaxed);
	}
	if bits.contains(IntEvent::POSTED_WRITE_ERR) {
		log::error!("a posted write failed");
		stats.posted_write_errors.fetch_add(1, Ordering::Relaxed);
	}
	if bits.contains(IntEvent::UNRECOVERABLE_ERR) {
		log::error!("unit reports UnrecoverableError");
		stats.unrecoverable_errors.fetch_add(1, Ordering::Relaxed);
	}
	if bits.contains(IntEvent::CYCLE_TOO_LONG) {
		log::warn!("CycleTooLong: rearming cycle master");
		rearm_cycle_master(regs);
	}
	if bits.contains(IntEvent::CYCLE64_SECONDS) {
		let cycle_timer = regs.read(offset::ISOCHRONOUS_CYCLE_TIMER);
		// Wrap detection: only bump the extended seconds counter when
		// the cycle-timer MSB is clear.
		if cycle_timer & (1 << 31) == 0 {
			stats.bus_seconds.fetch_add(1, Ordering::Relaxed);
		}
	}

	debug_assert!(stats.unrecoverable_errors.load(Ordering::Relaxed) <= MAX_BAD_TOPO as u64 * 10_000, "sanity");
}

fn rearm_cycle_master<W: RawWindow>(regs: &Registers<W>) {
	const CYCLE_MASTER: u32 = 1 << 8;
	regs.write(offset::LINK_CONTROL_CLEAR, CYCLE_MASTER);
	regs.write(offset::LINK_CONTROL_SET, CYCLE_MASTER);
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::regs::test_support::FakeWindow;

	#[test]
	fn spurious_all_zero_event_does_not_raise_anything() {
		let window = FakeWindow::new();
		let regs = Registers::new(window);
		let stats = Stats::default();
		let bus_reset = Signal::new();
		let at_request = Signal::new();
		let at_response = Signal::new();
		let ar_request = Signal::new();
		let ar_response = Signal::new();
		let targets = DispatchTargets {
			bus_reset: &bus_reset,
			at_request: &at_request,
			at_response: &at_response,
			ar_request: &ar_request,
			ar_response: &ar_response,
			iso_recv: &[],
		};
		dispatch(&regs, &stats, &targets);
	}

	#[test]
	fn self_id_complete_raises_bus_reset_signal_and_counts_it() {
		let window = FakeWindow::new();
		window.preset(offset::INT_EVENT_SET, IntEvent::SELF_ID_COMPLETE.bits());
		let regs = Registers::new(window);
		let stats = Stats::default();
		let bus_reset = Signal::new();
		let at_request = Signal::new();
		let at_response = Signal::new();
		let ar_request = Signal::new();
		let ar_response = Signal::new();
		let targets = DispatchTargets {
			bus_reset: &bus_reset,
			at_request: &at_request,
			at_response: &at_response,
			ar_request: &ar_request,
			ar_response: &ar_response,
			iso_recv: &[],
		};
		dispatch(&regs, &stats, &targets);
		assert_eq!(bus_reset.wait(), crate::sync::Wake::Signalled);
		assert_eq!(stats.self_id_completes.load(Ordering::Relaxed), 1);
	}
}
