//! Bus-reset worker: consumes self-ID streams, validates them, updates
//! generation/node-ID, swaps Config-ROM, triggers topology refresh.

use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::{Mutex, RwLock};

use crate::error::{DriverError, Result};
use crate::regs::{offset, RawWindow, Registers};
use crate::sync::spin_poll;
use crate::config::{MAX_BAD_TOPO, PHY_POLL_INTERVAL, PHY_POLL_ITERS};
use crate::stats::Stats;

/// `NodeID` bits this worker reads directly.
mod node_id_bits {
	pub const IDVALID: u32 = 1 << 31;
	pub const NODE_NUMBER_MASK: u32 = 0x3F;
}

/// `SelfIDCount` bits.
mod self_id_count_bits {
	pub const SELF_ID_ERROR: u32 = 1 << 31;
	pub const GENERATION_SHIFT: u32 = 16;
	pub const GENERATION_MASK: u32 = 0xFF;
	pub const SIZE_MASK: u32 = 0x7FF;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusResetOutcome {
	Adopted { generation: u8, node_id: u16 },
	Aborted,
	Rejected,
}

/// Everything the bus-reset worker needs from the rest of the unit,
/// gathered behind narrow traits so this module stays testable without
/// a full `Unit`.
pub trait BusResetCallbacks {
	/// Halts both AT contexts and marks them as under an uncommitted
	/// generation.
	fn halt_at_contexts(&self);
	/// Flushes all outstanding TL transactions with `RCODE_GENERATION`.
	fn flush_tl(&self);
	/// Invalidates the previously built topology, called as soon as a
	/// bus reset is adopted and before `rebuild_topology` is attempted.
	fn invalidate_topology(&self);
	/// Delivers self-ID quadlets to the topology builder; returns
	/// `true` on success.
	fn rebuild_topology(&self, self_ids: &[u32]) -> bool;
	/// Commits a previously queued ROM image, if any.
	fn commit_pending_rom(&self);
	fn set_unrecoverable(&self);
	fn disable_unit(&self);
}

pub struct BusResetWorker {
	pub generation: AtomicU8,
	pub node_id: AtomicU32,
	bad_topo_count: AtomicU32,
	previous_generation: Mutex<u8>,
	pub topology_valid: RwLock<bool>,
}

impl BusResetWorker {
	pub fn new() -> Self {
		BusResetWorker {
			generation: AtomicU8::new(0),
			node_id: AtomicU32::new(0),
			bad_topo_count: AtomicU32::new(0),
			previous_generation: Mutex::new(0),
			topology_valid: RwLock::new(false),
		}
	}

	/// Validates the self-ID buffer: each quadlet at odd index must be
	/// the bitwise-NOT of its successor, and the generation read before
	/// the scan must match the one read after.
	pub fn validate_self_ids(buffer: &[u32], generation_before: u8, generation_after: u8) -> Result<()> {
		if generation_before != generation_after {
			return Err(DriverError::SelfIdInvalid);
		}
		let mut i = 1;
		while i + 1 < buffer.len() {
			if buffer[i] != !buffer[i + 1] {
				return Err(DriverError::SelfIdInvalid);
			}
			i += 2;
		}
		Ok(())
	}

	/// Runs the full bus-reset adoption procedure, given a register
	/// gateway to read hardware state from and read the self-ID DMA
	/// buffer through, plus the unit-level callbacks.
	pub fn run<W: RawWindow, C: BusResetCallbacks>(
		&self,
		regs: &Registers<W>,
		self_id_buffer: &[u32],
		stats: &Stats,
		callbacks: &C,
	) -> BusResetOutcome {
		let node_id_reg = regs.read(offset::NODE_ID);
		if node_id_reg & node_id_bits::IDVALID == 0 || (node_id_reg & node_id_bits::NODE_NUMBER_MASK) == 63 {
			return BusResetOutcome::Aborted;
		}

		let self_id_count_before = regs.read(offset::SELF_ID_COUNT);
		if self_id_count_before & self_id_count_bits::SELF_ID_ERROR != 0
			|| (self_id_count_before & self_id_count_bits::SIZE_MASK) == 0
		{
			return BusResetOutcome::Aborted;
		}

		let generation_before = self_id_buffer.first().map(|w| (*w & 0xFF) as u8).unwrap_or(0);
		let self_id_count_after = regs.read(offset::SELF_ID_COUNT);
		let generation_after = ((self_id_count_after >> self_id_count_bits::GENERATION_SHIFT) & self_id_count_bits::GENERATION_MASK) as u8;

		if Self::validate_self_ids(self_id_buffer, generation_before, generation_after).is_err() {
			stats.self_id_rejects.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
			log::warn!("self-ID buffer failed validation, attempting short reset");
			if self.raise_bus_reset(regs, true).is_err() {
				callbacks.set_unrecoverable();
			}
			return BusResetOutcome::Rejected;
		}

		let prev_gen = *self.previous_generation.lock().unwrap();

		callbacks.halt_at_contexts();
		*self.topology_valid.write().unwrap() = false;
		callbacks.invalidate_topology();
		self.generation.store(generation_after, Ordering::Release);
		self.node_id.store(node_id_reg & 0xFFFF, Ordering::Release);
		regs.write(offset::INT_EVENT_CLEAR, 1 << 17); // BusReset bit

		callbacks.commit_pending_rom();

		regs.write(offset::PHY_REQUEST_FILTER_HI_SET, u32::MAX);
		regs.write(offset::PHY_REQUEST_FILTER_LO_SET, u32::MAX);

		callbacks.flush_tl();
		log::info!("bus reset adopted: generation={generation_after}");

		let topology_ok = callbacks.rebuild_topology(self_id_buffer);

		if generation_after != prev_gen.wrapping_add(1) {
			*self.topology_valid.write().unwrap() = false;
		}

		*self.previous_generation.lock().unwrap() = generation_after;

		if !topology_ok {
			let bad = self.bad_topo_count.fetch_add(1, Ordering::AcqRel) + 1;
			let _ = self.raise_bus_reset(regs, true);
			if bad >= MAX_BAD_TOPO {
				callbacks.disable_unit();
			}
		} else {
			self.bad_topo_count.store(0, Ordering::Release);
			*self.topology_valid.write().unwrap() = true;
		}

		BusResetOutcome::Adopted { generation: generation_after, node_id: (node_id_reg & 0xFFFF) as u16 }
	}

	/// `raise_bus_reset(short)` goes through the same `writePHY` gateway
	/// as ordinary PHY programming.
	/// PHY register 1, bit 6 (`IBR`) for a long (full) reset, register
	/// 5 for a short arbitrated reset.
	pub fn raise_bus_reset<W: RawWindow>(&self, regs: &Registers<W>, short: bool) -> Result<()> {
		let (addr, bit) = if short { (5u8, 0x40u8) } else { (1u8, 0x40u8) };
		let done = spin_poll(PHY_POLL_INTERVAL, PHY_POLL_ITERS, || regs.write_phy(addr, 0, bit).is_ok());
		if done {
			Ok(())
		} else {
			Err(DriverError::PhyWriteTimeout)
		}
	}
}

impl Default for BusResetWorker {
	fn default() -> Self {
		Self::new()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::regs::test_support::FakeWindow;
	use std::sync::atomic::AtomicBool;

	struct NullCallbacks {
		topology_ok: bool,
		disabled: AtomicBool,
	}

	impl BusResetCallbacks for NullCallbacks {
		fn halt_at_contexts(&self) {}
		fn flush_tl(&self) {}
		fn invalidate_topology(&self) {}
		fn rebuild_topology(&self, _self_ids: &[u32]) -> bool {
			self.topology_ok
		}
		fn commit_pending_rom(&self) {}
		fn set_unrecoverable(&self) {}
		fn disable_unit(&self) {
			self.disabled.store(true, Ordering::Release);
		}
	}

	#[test]
	fn validate_self_ids_accepts_complement_pairs_and_matching_generations() {
		let buf = [0x0000_0005u32, 0x8040_0000, !0x8040_0000u32];
		assert!(BusResetWorker::validate_self_ids(&buf, 5, 5).is_ok());
	}

	#[test]
	fn validate_self_ids_rejects_broken_complement() {
		let buf = [0x0000_0005u32, 0x8040_0000, 0x7FBF_FFFE];
		assert!(BusResetWorker::validate_self_ids(&buf, 5, 5).is_err());
	}

	#[test]
	fn validate_self_ids_rejects_generation_mismatch() {
		let buf = [0x0000_0005u32, 0x8040_0000, !0x8040_0000u32];
		assert!(BusResetWorker::validate_self_ids(&buf, 5, 6).is_err());
	}

	#[test]
	fn run_aborts_when_node_id_invalid() {
		let window = FakeWindow::new();
		let regs = Registers::new(window);
		let worker = BusResetWorker::new();
		let stats = Stats::default();
		let callbacks = NullCallbacks { topology_ok: true, disabled: AtomicBool::new(false) };
		let outcome = worker.run(&regs, &[], &stats, &callbacks);
		assert_eq!(outcome, BusResetOutcome::Aborted);
	}

	#[test]
	fn run_disables_unit_after_max_bad_topo_failures() {
		let window = FakeWindow::new();
		window.preset(offset::NODE_ID, node_id_bits::IDVALID | 3);
		window.preset(offset::SELF_ID_COUNT, 1 << 16 | 4);
		let regs = Registers::new(window);
		let worker = BusResetWorker::new();
		let stats = Stats::default();
		let callbacks = NullCallbacks { topology_ok: false, disabled: AtomicBool::new(false) };
		let self_ids = [0x0000_0001u32, 0x8040_0000, !0x8040_0000u32];

		for _ in 0..MAX_BAD_TOPO {
			worker.run(&regs, &self_ids, &stats, &callbacks);
		}
		assert!(callbacks.disabled.load(Ordering::Acquire));
	}
}
