//! `Unit`: the process-wide handle for one OHCI-1394 controller —
//! lifecycle, the upward contract to the TL, and the worker wiring
//! between the register gateway, the DMA contexts, and the
//! bus-reset/split-timeout workers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use bitflags::bitflags;

use crate::ar::{ArContext, ArDirection};
use crate::at::{AckCallback, AtContext, AtDirection};
use crate::busreset::{BusResetCallbacks, BusResetOutcome, BusResetWorker};
use crate::config::UnitConfig;
use crate::context::{ContextBase, ContextRegs};
use crate::csr;
use crate::descriptor::DescriptorMemory;
use crate::error::{DriverError, Result};
use crate::ir::{IrCallback, IrContext};
use crate::irq::{self, DispatchTargets};
use crate::packet::{Packet, RCode};
use crate::regs::{offset, RawWindow, Registers};
use crate::stats::{Stats, StatsSnapshot};
use crate::sync::{Signal, Wake, Worker};
use crate::time;
use crate::timeout::{TimeoutQueue, TransactionKey};
use crate::upcalls::{TopologyBuilder, Transaction, TransactionLayer};

bitflags! {
	#[derive(Debug, Clone, Copy, PartialEq, Eq)]
	pub struct UnitFlags: u8 {
		const ENABLED             = 0b001;
		const INITIALIZED         = 0b010;
		const UNRECOVERABLE_ERROR = 0b100;
	}
}

/// Split-timeout budget for an outstanding AT request. Real hardware
/// derives this from
/// `SPLIT_TIMEOUT_HI`/`_LO`; this crate uses a fixed budget since it
/// does not own the CSR that would let the TL configure it.
const SPLIT_TIMEOUT: Duration = Duration::from_millis(100);

struct RomState {
	current: Vec<u32>,
	pending: Option<Vec<u32>>,
}

/// Register offsets for the four mandatory async contexts, relative to
/// the unit's register window. Matches the `ContextBase::at_offset`
/// convention from `crate::context`.
pub struct UnitLayout {
	pub at_request_base: u32,
	pub at_response_base: u32,
	pub ar_request_base: u32,
	pub ar_response_base: u32,
}

impl Default for UnitLayout {
	fn default() -> Self {
		UnitLayout { at_request_base: 0x180, at_response_base: 0x1A0, ar_request_base: 0x1C0, ar_response_base: 0x1E0 }
	}
}

/// The signals [`Unit::on_interrupt`] raises, owned by the worker
/// threads spawned in [`Unit::enable`]. `None` before the unit is
/// enabled or after it is disabled.
struct DispatchSignals {
	bus_reset: Arc<Signal>,
	at_request: Arc<Signal>,
	at_response: Arc<Signal>,
	ar_request: Arc<Signal>,
	ar_response: Arc<Signal>,
	/// Indexed by IR channel number, one per context actually constructed.
	iso_recv: Vec<Arc<Signal>>,
}

pub struct Unit<W: RawWindow + 'static> {
	regs: Arc<Registers<W>>,
	guid: u64,
	flags: Arc<AtomicU8>,
	rom: Arc<RwLock<RomState>>,

	at_request: Arc<AtContext>,
	at_response: Arc<AtContext>,
	ar_request: Arc<ArContext>,
	ar_response: Arc<ArContext>,
	ir_contexts: RwLock<HashMap<usize, Arc<Mutex<IrContext>>>>,
	bus_reset: Arc<BusResetWorker>,
	stats: Arc<Stats>,
	timeouts: Arc<TimeoutQueue>,
	self_id_reader: Arc<dyn Fn() -> Vec<u32> + Send + Sync>,

	tl: Arc<dyn TransactionLayer>,
	topology: Arc<dyn TopologyBuilder>,

	layout: UnitLayout,
	workers: Mutex<Vec<Worker>>,
	dispatch: Mutex<Option<DispatchSignals>>,
}

impl<W: RawWindow + 'static> Unit<W> {
	#[allow(clippy::too_many_arguments)]
	pub fn new(
		window: W,
		guid: u64,
		rom: Vec<u32>,
		config: &UnitConfig,
		layout: UnitLayout,
		mem: Arc<dyn DescriptorMemory>,
		tl: Arc<dyn TransactionLayer>,
		topology: Arc<dyn TopologyBuilder>,
		self_id_reader: Arc<dyn Fn() -> Vec<u32> + Send + Sync>,
		ack_request: AckCallback,
		ack_response: AckCallback,
		ir_callback_factory: impl Fn(usize) -> IrCallback,
	) -> Arc<Self> {
		let regs = Arc::new(Registers::new(window));

		let at_request = Arc::new(AtContext::new(
			AtDirection::Request,
			ContextBase::at_offset(layout.at_request_base),
			0x0010_0000,
			config.at_buffers_per_context,
			Arc::clone(&mem),
			ack_request,
		));
		let at_response = Arc::new(AtContext::new(
			AtDirection::Response,
			ContextBase::at_offset(layout.at_response_base),
			0x0011_0000,
			config.at_buffers_per_context,
			Arc::clone(&mem),
			ack_response,
		));

		let tl_for_request = Arc::clone(&tl);
		let ar_request = Arc::new(ArContext::new(
			ArDirection::Request,
			config.ar_page_size,
			config.ar_page_count,
			0x0020_0000,
			Arc::clone(&mem),
			crate::ar::Upcall::Request(Box::new(move |packet, generation| tl_for_request.handle_request(packet, generation))),
		));
		let tl_for_response = Arc::clone(&tl);
		let ar_response = Arc::new(ArContext::new(
			ArDirection::Response,
			config.ar_page_size,
			config.ar_page_count,
			0x0030_0000,
			Arc::clone(&mem),
			crate::ar::Upcall::Response(Box::new(move |packet| tl_for_response.handle_response(packet))),
		));

		let mut ir_contexts = HashMap::new();
		for idx in 0..config.max_iso_receive_ctx.min(4) {
			let callback = ir_callback_factory(idx);
			if let Ok(ctx) =
				IrContext::new(8, 0x0040_0000 + (idx as u32) * 0x1_0000, 2048, true, Arc::clone(&mem), callback)
			{
				ir_contexts.insert(idx, Arc::new(Mutex::new(ctx)));
			}
		}

		Arc::new(Unit {
			regs,
			guid,
			flags: Arc::new(AtomicU8::new(0)),
			rom: Arc::new(RwLock::new(RomState { current: rom, pending: None })),
			at_request,
			at_response,
			ar_request,
			ar_response,
			ir_contexts: RwLock::new(ir_contexts),
			bus_reset: Arc::new(BusResetWorker::new()),
			stats: Arc::new(Stats::default()),
			timeouts: Arc::new(TimeoutQueue::new()),
			self_id_reader,
			tl,
			topology,
			layout,
			workers: Mutex::new(Vec::new()),
			dispatch: Mutex::new(None),
		})
	}

	fn flags_bits(&self) -> UnitFlags {
		UnitFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
	}

	fn set_flag(&self, bit: UnitFlags, on: bool) {
		set_flag_bits(&self.flags, bit, on);
	}

	fn ctx_regs(&self, base: ContextBase) -> ContextRegs<'_, W> {
		ContextRegs { regs: &self.regs, base }
	}

	fn base_of(&self, direction: AtDirection) -> ContextBase {
		let block = match direction {
			AtDirection::Request => self.layout.at_request_base,
			AtDirection::Response => self.layout.at_response_base,
		};
		ContextBase::at_offset(block)
	}

	/// Brings the controller up: soft-reset, LPS handshake, IRQ mask
	/// programming, self-ID buffer setup.
	pub fn init(&self) -> Result<()> {
		const SOFT_RESET: u32 = 1 << 16;
		const LPS: u32 = 1 << 19;
		const POSTED_WRITE_ERR: u32 = 1 << 19;
		const UNRECOVERABLE_ERR: u32 = 1 << 20;
		const SELF_ID_COMPLETE: u32 = 1 << 16;
		const BUS_RESET_BIT: u32 = 1 << 17;

		self.regs.write(offset::HC_CONTROL_SET, SOFT_RESET);
		self.regs.write(offset::HC_CONTROL_SET, LPS);
		self.regs.write(
			offset::INT_MASK_SET,
			SELF_ID_COMPLETE | BUS_RESET_BIT | POSTED_WRITE_ERR | UNRECOVERABLE_ERR | 0x3F,
		);
		self.set_flag(UnitFlags::INITIALIZED, true);
		Ok(())
	}

	/// Enables the unit: adopts the current generation into every DMA
	/// context, starts the two AR rings, and spawns one worker thread
	/// per context plus the bus-reset and split-timeout workers.
	pub fn enable(&self) {
		let generation = self.bus_reset.generation.load(Ordering::Acquire);
		self.at_request.set_generation(generation);
		self.at_response.set_generation(generation);
		self.ar_request.set_generation(generation);
		self.ar_response.set_generation(generation);
		self.ar_request.start(&self.ctx_regs(self.ar_base(ArDirection::Request)));
		self.ar_response.start(&self.ctx_regs(self.ar_base(ArDirection::Response)));

		self.spawn_workers();
		self.set_flag(UnitFlags::ENABLED, true);
	}

	fn ar_base(&self, direction: ArDirection) -> ContextBase {
		let block = match direction {
			ArDirection::Request => self.layout.ar_request_base,
			ArDirection::Response => self.layout.ar_response_base,
		};
		ContextBase::at_offset(block)
	}

	fn spawn_workers(&self) {
		let mut workers = self.workers.lock().unwrap();
		let priorities = crate::config::Priorities::default();

		let (at_request_worker, at_request_signal) = {
			let ctx = Arc::clone(&self.at_request);
			let regs = Arc::clone(&self.regs);
			let base = self.base_of(AtDirection::Request);
			spawn_signal_worker("at-request", priorities.at, move || {
				ctx.reconcile(&ContextRegs { regs: &regs, base });
			})
		};
		let (at_response_worker, at_response_signal) = {
			let ctx = Arc::clone(&self.at_response);
			let regs = Arc::clone(&self.regs);
			let base = self.base_of(AtDirection::Response);
			spawn_signal_worker("at-response", priorities.at, move || {
				ctx.reconcile(&ContextRegs { regs: &regs, base });
			})
		};
		let (ar_request_worker, ar_request_signal) = {
			let ctx = Arc::clone(&self.ar_request);
			let regs = Arc::clone(&self.regs);
			let base = self.ar_base(ArDirection::Request);
			spawn_signal_worker("ar-request", priorities.ar, move || {
				ctx.drain(&ContextRegs { regs: &regs, base });
			})
		};
		let (ar_response_worker, ar_response_signal) = {
			let ctx = Arc::clone(&self.ar_response);
			let regs = Arc::clone(&self.regs);
			let base = self.ar_base(ArDirection::Response);
			spawn_signal_worker("ar-response", priorities.ar, move || {
				ctx.drain(&ContextRegs { regs: &regs, base });
			})
		};
		let (bus_reset_worker, bus_reset_signal) = {
			let bus_reset = Arc::clone(&self.bus_reset);
			let regs = Arc::clone(&self.regs);
			let stats = Arc::clone(&self.stats);
			let at_request = Arc::clone(&self.at_request);
			let at_response = Arc::clone(&self.at_response);
			let ar_request = Arc::clone(&self.ar_request);
			let ar_response = Arc::clone(&self.ar_response);
			let tl = Arc::clone(&self.tl);
			let topology = Arc::clone(&self.topology);
			let self_id_reader = Arc::clone(&self.self_id_reader);
			let rom = Arc::clone(&self.rom);
			let flags = Arc::clone(&self.flags);
			let at_request_base = self.base_of(AtDirection::Request);
			let at_response_base = self.base_of(AtDirection::Response);
			spawn_signal_worker("bus-reset", priorities.bus_reset, move || {
				let self_ids = self_id_reader();
				let callbacks = WorkerBusResetCallbacks {
					regs: &regs,
					at_request: &at_request,
					at_response: &at_response,
					at_request_base,
					at_response_base,
					tl: &tl,
					topology: &topology,
					rom: &rom,
					flags: &flags,
				};
				let outcome = bus_reset.run(&regs, &self_ids, &stats, &callbacks);
				if let BusResetOutcome::Adopted { generation, .. } = outcome {
					at_request.set_generation(generation);
					at_response.set_generation(generation);
					at_request.set_bus_reset_pending(false);
					at_response.set_bus_reset_pending(false);
					ar_request.set_generation(generation);
					ar_response.set_generation(generation);
				}
			})
		};
		let ir_channel_count = self.ir_contexts.read().unwrap().len();
		let mut iso_recv_signals = Vec::with_capacity(ir_channel_count);
		for idx in 0..ir_channel_count {
			let ctx = Arc::clone(&self.ir_contexts.read().unwrap()[&idx]);
			let regs = Arc::clone(&self.regs);
			let base = ContextBase::at_offset(0x0040_0000 + (idx as u32) * 0x1_0000);
			let (worker, signal) = spawn_signal_worker(&format!("ir-recv-{idx}"), priorities.ir, move || {
				ctx.lock().unwrap().drain(&ContextRegs { regs: &regs, base });
			});
			iso_recv_signals.push(signal);
			workers.push(worker);
		}

		let split_timeout_worker = {
			let timeouts = Arc::clone(&self.timeouts);
			let tl = Arc::clone(&self.tl);
			Worker::spawn("split-timeout", priorities.split_timeout, move |signal| loop {
				let wait = timeouts.next_wait().unwrap_or(Duration::from_millis(50)).min(Duration::from_millis(50));
				// Runs on its own clock rather than waiting for an explicit
				// raise, since expiry is time-driven; a spurious or timed-out
				// wakeup both just mean "recheck the queue".
				if let Wake::Kill = signal.wait_timeout(wait) {
					break;
				}
				for key in timeouts.pop_due() {
					tl.finish(Transaction { node_id: key.0, tlabel: key.1 }, RCode::SendError);
				}
			})
		};

		*self.dispatch.lock().unwrap() = Some(DispatchSignals {
			bus_reset: bus_reset_signal,
			at_request: at_request_signal,
			at_response: at_response_signal,
			ar_request: ar_request_signal,
			ar_response: ar_response_signal,
			iso_recv: iso_recv_signals,
		});

		workers.push(at_request_worker);
		workers.push(at_response_worker);
		workers.push(ar_request_worker);
		workers.push(ar_response_worker);
		workers.push(bus_reset_worker);
		workers.push(split_timeout_worker);
	}

	pub fn disable(&self) {
		let _ = self.ctx_regs(self.base_of(AtDirection::Request)).stop();
		let _ = self.ctx_regs(self.base_of(AtDirection::Response)).stop();
		let _ = self.ctx_regs(self.ar_base(ArDirection::Request)).stop();
		let _ = self.ctx_regs(self.ar_base(ArDirection::Response)).stop();
		for worker in self.workers.lock().unwrap().iter_mut() {
			worker.stop();
		}
		self.workers.lock().unwrap().clear();
		*self.dispatch.lock().unwrap() = None;
		self.set_flag(UnitFlags::ENABLED, false);
	}

	pub fn terminate(&self) {
		self.disable();
		self.set_flag(UnitFlags::INITIALIZED, false);
	}

	/// Top-half entry point: the embedder's actual ISR calls this. Must
	/// not block; it only reads the event register and raises worker
	/// signals owned by [`Unit::enable`].
	pub fn on_interrupt(&self) {
		let dispatch = self.dispatch.lock().unwrap();
		let Some(signals) = dispatch.as_ref() else { return };
		let targets = DispatchTargets {
			bus_reset: &signals.bus_reset,
			at_request: &signals.at_request,
			at_response: &signals.at_response,
			ar_request: &signals.ar_request,
			ar_response: &signals.ar_response,
			iso_recv: &signals.iso_recv,
		};
		irq::dispatch(&self.regs, &self.stats, &targets);
	}

	// ---- Upward contract to the TL ----

	pub fn send(&self, direction: AtDirection, packet: Packet, tlabel_override: Option<u8>) -> Result<()> {
		if self.flags_bits().contains(UnitFlags::UNRECOVERABLE_ERROR) {
			return Err(DriverError::UnrecoverableError);
		}
		let (ctx, base) = match direction {
			AtDirection::Request => (&self.at_request, self.base_of(AtDirection::Request)),
			AtDirection::Response => (&self.at_response, self.base_of(AtDirection::Response)),
		};

		let timeout_key = if direction == AtDirection::Request {
			Some(TransactionKey(packet.destination_id, tlabel_override.unwrap_or(packet.tlabel)))
		} else {
			None
		};

		ctx.send(&self.ctx_regs(base), packet, tlabel_override)?;
		if let Some(key) = timeout_key {
			self.timeouts.schedule(key, SPLIT_TIMEOUT);
		}
		Ok(())
	}

	pub fn cancel(&self, direction: AtDirection, buffer_index: usize) {
		match direction {
			AtDirection::Request => self.at_request.cancel_at(buffer_index),
			AtDirection::Response => self.at_response.cancel_at(buffer_index),
		}
	}

	/// Cancels a pending split-timeout for `node_id`/`tlabel` (implicit
	/// cancellation): call when the TL retires the transaction through
	/// its normal completion path instead of waiting for the timer.
	pub fn cancel_timeout(&self, node_id: u16, tlabel: u8) {
		self.timeouts.cancel(TransactionKey(node_id, tlabel));
	}

	pub fn generation_ok(&self, generation: u8) -> bool {
		generation == self.bus_reset.generation.load(Ordering::Acquire)
	}

	/// `set_rom(data)`: queues a new ROM to be adopted at the next
	/// bus-reset; `RomUpdatePending` if one is already queued.
	pub fn set_rom(&self, data: Vec<u32>) -> Result<()> {
		let mut rom = self.rom.write().unwrap();
		if rom.pending.is_some() {
			return Err(DriverError::RomUpdatePending);
		}
		rom.pending = Some(data);
		Ok(())
	}

	pub fn raise_bus_reset(&self, short: bool) -> bool {
		self.bus_reset.raise_bus_reset(&self.regs, short).is_ok()
	}

	pub fn uptime(&self) -> u64 {
		let cycle = self.regs.read(offset::ISOCHRONOUS_CYCLE_TIMER);
		time::uptime(self.stats.bus_seconds.load(Ordering::Acquire), cycle)
	}

	pub fn timestamp_now(&self) -> u16 {
		time::timestamp_now(self.regs.read(offset::ISOCHRONOUS_CYCLE_TIMER))
	}

	pub fn compute_response_timestamp(&self, req_ts: u16, offset_cycles: u16) -> u16 {
		time::compute_response_timestamp(req_ts, offset_cycles)
	}

	pub fn stats(&self) -> StatsSnapshot {
		self.stats.snapshot()
	}

	pub fn guid(&self) -> u64 {
		self.guid
	}

	/// Services a request targeting this node's local CSR space.
	pub fn handle_local_csr_request(
		&self,
		tcode: crate::packet::Tcode,
		offset_in_csr: u32,
		req_timestamp: u16,
		write_data: Option<u32>,
		compare_data: Option<u32>,
	) -> csr::CsrResponse {
		let rom = self.rom.read().unwrap();
		csr::handle_request(&self.regs, &rom.current, tcode, offset_in_csr, req_timestamp, write_data, compare_data)
	}

	/// Drains one IR channel's descriptor ring. Call when that
	/// channel's `IsoRecv` bit fires.
	pub fn drain_iso_receive(&self, channel: usize) {
		let contexts = self.ir_contexts.read().unwrap();
		if let Some(ctx) = contexts.get(&channel) {
			let base = ContextBase::at_offset(0x0040_0000 + (channel as u32) * 0x1_0000);
			ctx.lock().unwrap().drain(&self.ctx_regs(base));
		}
	}
}

/// Bridges [`BusResetCallbacks`] to the pieces the bus-reset worker
/// thread holds by reference, so [`BusResetWorker::run`] stays generic
/// over a narrow trait rather than needing a full `&Unit`.
struct WorkerBusResetCallbacks<'a, W: RawWindow> {
	regs: &'a Registers<W>,
	at_request: &'a AtContext,
	at_response: &'a AtContext,
	at_request_base: ContextBase,
	at_response_base: ContextBase,
	tl: &'a Arc<dyn TransactionLayer>,
	topology: &'a Arc<dyn TopologyBuilder>,
	rom: &'a Arc<RwLock<RomState>>,
	flags: &'a Arc<AtomicU8>,
}

impl<'a, W: RawWindow> BusResetCallbacks for WorkerBusResetCallbacks<'a, W> {
	fn halt_at_contexts(&self) {
		self.at_request.set_bus_reset_pending(true);
		self.at_response.set_bus_reset_pending(true);
		let _ = ContextRegs { regs: self.regs, base: self.at_request_base }.stop();
		let _ = ContextRegs { regs: self.regs, base: self.at_response_base }.stop();
	}

	fn flush_tl(&self) {
		self.tl.flush_all();
	}

	fn invalidate_topology(&self) {
		self.topology.invalidate();
	}

	fn rebuild_topology(&self, self_ids: &[u32]) -> bool {
		self.topology.rebuild(self_ids)
	}

	fn commit_pending_rom(&self) {
		let mut rom = self.rom.write().unwrap();
		if let Some(pending) = rom.pending.take() {
			self.regs.write(offset::CONFIG_ROM_HDR, pending.first().copied().unwrap_or(0));
			self.regs.write(offset::BUS_OPTIONS, pending.get(2).copied().unwrap_or(0));
			log::info!("config-ROM swap committed at bus reset");
			rom.current = pending;
		}
	}

	fn set_unrecoverable(&self) {
		log::error!("self-ID validation failed twice; unit entering unrecoverable state");
		set_flag_bits(self.flags, UnitFlags::UNRECOVERABLE_ERROR, true);
	}

	fn disable_unit(&self) {
		log::error!("disabling unit after repeated topology failures");
		set_flag_bits(self.flags, UnitFlags::ENABLED, false);
	}
}

/// CAS loop setting or clearing `bit` in a flags word shared across
/// threads, used both by `Unit::set_flag` and by the bus-reset worker's
/// callbacks, which hold their own `Arc<AtomicU8>` clone rather than a
/// `&Unit`.
fn set_flag_bits(flags: &AtomicU8, bit: UnitFlags, on: bool) {
	let mut current = flags.load(Ordering::Acquire);
	loop {
		let mut next = UnitFlags::from_bits_truncate(current);
		if on {
			next.insert(bit);
		} else {
			next.remove(bit);
		}
		match flags.compare_exchange(current, next.bits(), Ordering::AcqRel, Ordering::Acquire) {
			Ok(_) => return,
			Err(observed) => current = observed,
		}
	}
}

fn spawn_signal_worker<F>(name: &str, priority: u8, work: F) -> (Worker, Arc<Signal>)
where
	F: Fn() + Send + 'static,
{
	let worker = Worker::spawn(name, priority, move |signal| loop {
		match signal.wait() {
			Wake::Signalled => work(),
			Wake::Kill => break,
			Wake::Timeout => {}
		}
	});
	let signal = Arc::clone(&worker.signal);
	(worker, signal)
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::regs::test_support::FakeWindow;

	struct NullTl;
	impl TransactionLayer for NullTl {
		fn handle_request(&self, _packet: Packet, _generation: u8) {}
		fn handle_response(&self, _packet: Packet) {}
		fn flush_all(&self) {}
		fn finish(&self, _transaction: Transaction, _rcode: RCode) {}
	}

	struct NullTopology;
	impl TopologyBuilder for NullTopology {
		fn rebuild(&self, _self_ids: &[u32]) -> bool {
			true
		}
		fn invalidate(&self) {}
	}

	fn make_unit() -> Arc<Unit<FakeWindow>> {
		Unit::new(
			FakeWindow::new(),
			0xDEAD_BEEF_0000_0001,
			vec![0u32; 4],
			&UnitConfig::default(),
			UnitLayout::default(),
			Arc::new(crate::descriptor::test_support::FakeDescriptorMemory::new()),
			Arc::new(NullTl),
			Arc::new(NullTopology),
			Arc::new(|| Vec::new()),
			Box::new(|_, _, _| {}),
			Box::new(|_, _, _| {}),
			|_idx| Box::new(|_outcome| {}),
		)
	}

	#[test]
	fn set_rom_rejects_second_queue_while_pending() {
		let unit = make_unit();
		assert!(unit.set_rom(vec![1, 2, 3]).is_ok());
		assert_eq!(unit.set_rom(vec![4, 5, 6]), Err(DriverError::RomUpdatePending));
	}

	#[test]
	fn generation_ok_reflects_bus_reset_worker_state() {
		let unit = make_unit();
		assert!(unit.generation_ok(0));
		assert!(!unit.generation_ok(1));
	}

	#[test]
	fn enable_then_disable_spawns_and_joins_workers_cleanly() {
		let unit = make_unit();
		unit.init().unwrap();
		unit.enable();
		assert!(unit.flags_bits().contains(UnitFlags::ENABLED));
		unit.disable();
		assert!(!unit.flags_bits().contains(UnitFlags::ENABLED));
		assert!(unit.workers.lock().unwrap().is_empty());
	}
}
