//! AT (asynchronous transmit) context: builds outbound descriptor
//! chains and reconciles completions.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use crate::context::{is_stamped, ContextBase, ContextControlBits, ContextRegs};
use crate::descriptor::{ControlBits, Descriptor, DescriptorMemory};
use crate::error::Result as DriverResult;
use crate::packet::{event_to_outcome, AckCode, Packet, RCode, Tcode};
use crate::pool::AtBufferPool;
use crate::regs::{RawWindow, Registers};

pub type AckCallback = Box<dyn Fn(Result<AckCode, RCode>, u16, Option<Packet>) + Send + Sync>;

/// Which of the two mandatory AT contexts this instance drives. Only
/// affects which side `Parse`'s directional split hands received
/// responses/requests to (`crate::ar`); the DMA mechanics are
/// identical.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AtDirection {
	Request,
	Response,
}

pub struct AtContext {
	direction: AtDirection,
	base: ContextBase,
	pool: Mutex<AtBufferPool>,
	callback: AckCallback,
	/// Mirrors the unit's current generation; updated by the bus-reset
	/// worker under the unit lock before `BusReset` is cleared.
	generation: AtomicU8,
	bus_reset_pending: std::sync::atomic::AtomicBool,
	/// Gateway onto the real DMA memory the controller stamps
	/// completion status into.
	mem: Arc<dyn DescriptorMemory>,
}

impl AtContext {
	pub fn new(
		direction: AtDirection,
		base: ContextBase,
		base_physical: u32,
		buffer_count: usize,
		mem: Arc<dyn DescriptorMemory>,
		callback: AckCallback,
	) -> Self {
		AtContext {
			direction,
			base,
			pool: Mutex::new(AtBufferPool::new(buffer_count, base_physical, 256)),
			callback,
			generation: AtomicU8::new(0),
			bus_reset_pending: std::sync::atomic::AtomicBool::new(false),
			mem,
		}
	}

	pub fn direction(&self) -> AtDirection {
		self.direction
	}

	pub fn set_generation(&self, generation: u8) {
		self.generation.store(generation, Ordering::Release);
	}

	pub fn set_bus_reset_pending(&self, pending: bool) {
		self.bus_reset_pending.store(pending, Ordering::Release);
	}

	/// Builds and chains the DMA program for `packet`, or synthesizes
	/// `RCODE_GENERATION` immediately if the packet predates the unit's
	/// current generation.
	pub fn send<W: RawWindow>(&self, regs: &ContextRegs<'_, W>, mut packet: Packet, tlabel_override: Option<u8>) -> DriverResult<()> {
		if packet.generation != self.generation.load(Ordering::Acquire) || self.bus_reset_pending.load(Ordering::Acquire) {
			(self.callback)(Err(RCode::Generation), packet.timestamp, Some(packet));
			return Ok(());
		}

		let shape = match packet.tcode.shape() {
			Some(shape) => shape,
			None => {
				log::debug!("unrecognized tcode for AT send, rejecting");
				(self.callback)(Err(RCode::TypeError), packet.timestamp, Some(packet));
				return Ok(());
			}
		};

		if !matches!(packet.tcode, Tcode::WriteStream | Tcode::WritePhy) {
			if let Some(tlabel) = tlabel_override {
				packet.tlabel = tlabel;
				packet.header[0] = (packet.header[0] & !(0x3F << 10)) | ((tlabel as u32 & 0x3F) << 10);
			}
		}

		let mut pool = self.pool.lock().unwrap();
		let idx = pool.acquire()?;

		{
			let buffer = pool.get_mut(idx);
			buffer.header = Descriptor {
				control: (ControlBits::OUTPUT_LAST | ControlBits::KEY_IMMEDIATE).bits(),
				req_count: shape.header_len as u16,
				data_address: 0,
				branch_address: 0,
				res_count: 0,
				transfer_status: 0,
				immediate: packet.header,
			};
			// `trailer` is not chained to hardware; it is where this buffer's
			// completion status and timestamp land once the context reports it.
			buffer.trailer = Descriptor {
				res_count: if self.direction == AtDirection::Response { packet.timestamp } else { 0 },
				..Descriptor::default()
			};
			if shape.needs_payload {
				buffer.header.control = (ControlBits::OUTPUT_LAST | ControlBits::KEY_IMMEDIATE).bits()
					& !ControlBits::OUTPUT_LAST.bits();
				buffer.payload = Descriptor {
					control: (ControlBits::OUTPUT_LAST | ControlBits::IRQ_ALWAYS | ControlBits::BRANCH_ALWAYS).bits(),
					req_count: packet.payload.len() as u16,
					data_address: packet.payload_phys.unwrap_or(0),
					branch_address: 0,
					res_count: 0,
					transfer_status: 0,
					immediate: [0; 4],
				};
				buffer.has_payload = true;
			} else {
				buffer.header.control |= (ControlBits::IRQ_ALWAYS | ControlBits::BRANCH_ALWAYS).bits();
				buffer.has_payload = false;
			}
			buffer.link.set(packet);
		}

		self.chain(regs, &mut pool, idx, shape.z);
		pool.mark_in_flight(idx);
		Ok(())
	}

	/// `CommandPtr` may only be written while RUN and ACTIVE are clear,
	/// so the context is either idle (write CommandPtr directly) or
	/// already running (splice onto the prior tail and rely on WAKE).
	fn chain<W: RawWindow>(&self, regs: &ContextRegs<'_, W>, pool: &mut AtBufferPool, idx: usize, z: u8) {
		let physical = pool.get(idx).physical_address;
		if let Some(prev_tail) = pool.tail() {
			let branch = Descriptor::branch(physical, z);
			let prev = pool.get_mut(prev_tail);
			prev.payload.branch_address = branch;
			prev.header.branch_address = branch;
			pool.set_tail(idx);
			regs.wake();
		} else {
			pool.set_tail(idx);
			if regs.command_ptr() == 0 {
				regs.write_command_ptr(Descriptor::branch(physical, z));
				regs.run();
			}
		}
		regs.wake();
	}

	/// Reconciles completed sends against the in-flight list. Call when
	/// the context's `ReqTxComplete`/`RespTxComplete` signal fires.
	pub fn reconcile<W: RawWindow>(&self, regs: &ContextRegs<'_, W>) {
		let mut pool = self.pool.lock().unwrap();

		if regs.is_dead() {
			self.recover_dead(regs, &mut pool);
			return;
		}

		let direction = self.direction;
		let mem = &self.mem;
		let drained = pool.drain_completed(|buffer| {
			let stamped = mem.read_descriptor(buffer.status_physical_address());
			if !is_stamped(&stamped) {
				return false;
			}
			buffer.trailer.transfer_status = stamped.transfer_status;
			if direction == AtDirection::Request {
				buffer.trailer.res_count = stamped.res_count;
			}
			true
		});
		for idx in drained {
			self.complete_one(&mut pool, idx);
		}
	}

	fn recover_dead<W: RawWindow>(&self, regs: &ContextRegs<'_, W>, pool: &mut AtBufferPool) {
		log::warn!("AT context reported DEAD, recovering");
		let command_ptr = regs.command_ptr();
		let last_fetched = Descriptor::branch_target(command_ptr);

		let drained = pool.drain_all_in_flight();
		for idx in &drained {
			{
				let buffer = pool.get_mut(*idx);
				buffer.trailer.transfer_status = MISSING_ACK_EVENT;
			}
			self.complete_one(pool, *idx);
			if pool.get(*idx).physical_address == last_fetched {
				break;
			}
		}

		regs.clear_control(ContextControlBits::RUN | ContextControlBits::DEAD | ContextControlBits::ACTIVE | ContextControlBits::WAKE);
		if let Some(head) = pool.tail() {
			regs.write_command_ptr(Descriptor::branch(pool.get(head).physical_address, 1));
			regs.run();
		}
	}

	fn complete_one(&self, pool: &mut AtBufferPool, idx: usize) {
		let outcome = {
			let buffer = pool.get(idx);
			event_to_outcome(buffer.trailer.transfer_status)
		};
		let timestamp = pool.get(idx).trailer.res_count;
		let packet = pool.get(idx).link.take();
		if packet.is_some() {
			(self.callback)(outcome, timestamp, packet);
		}
		pool.release(idx);
	}

	/// `cancel(packet)`: nulls the bidirectional link so the
	/// completion path suppresses the callback.
	pub fn cancel_at(&self, idx: usize) {
		let pool = self.pool.lock().unwrap();
		pool.get(idx).link.take();
	}

	pub fn free_buffers(&self) -> usize {
		self.pool.lock().unwrap().free_count()
	}
}

/// Synthetic event value this module stamps into a recovered buffer's
/// trailer so `event_to_outcome` resolves it to `RCode::MissingAck`
/// during DEAD-context recovery.
const MISSING_ACK_EVENT: u16 = 0x01;

#[cfg(test)]
mod tests {
	use super::*;
	use crate::config::DEFAULT_AT_BUFFERS;
	use crate::descriptor::test_support::FakeDescriptorMemory;
	use crate::regs::test_support::FakeWindow;
	use std::sync::{Arc, Mutex as StdMutex};

	fn ctx_base() -> ContextBase {
		ContextBase { control_set: 0x10, control_clear: 0x14, command_ptr: 0x1C }
	}

	fn fake_mem() -> Arc<dyn DescriptorMemory> {
		Arc::new(FakeDescriptorMemory::new())
	}

	fn make_packet(generation: u8) -> Packet {
		Packet {
			destination_id: 0xFFC0,
			source_id: 0x0000,
			tlabel: 0,
			tcode: Tcode::WriteQuadletReq,
			header: [0x0000_0000, 0xFFC0_0000, 0x0000_1000, 0xDEAD_BEEF],
			header_len: 16,
			payload: Vec::new(),
			payload_phys: None,
			timestamp: 0,
			speed: 0,
			generation,
		}
	}

	#[test]
	fn send_with_stale_generation_synthesizes_rcode_generation() {
		let window = FakeWindow::new();
		let regs = Registers::new(window);
		let ctx_regs = ContextRegs { regs: &regs, base: ctx_base() };
		let results: Arc<StdMutex<Vec<Result<AckCode, RCode>>>> = Arc::new(StdMutex::new(Vec::new()));
		let results_clone = Arc::clone(&results);
		let at = AtContext::new(
			AtDirection::Request,
			ctx_base(),
			0x2000,
			DEFAULT_AT_BUFFERS,
			fake_mem(),
			Box::new(move |outcome, _ts, _pkt| results_clone.lock().unwrap().push(outcome)),
		);
		at.set_generation(5);
		at.send(&ctx_regs, make_packet(4), None).unwrap();
		assert_eq!(results.lock().unwrap()[0], Err(RCode::Generation));
	}

	#[test]
	fn send_acquires_buffer_and_chains_when_idle() {
		let window = FakeWindow::new();
		let regs = Registers::new(window);
		let ctx_regs = ContextRegs { regs: &regs, base: ctx_base() };
		let at =
			AtContext::new(AtDirection::Request, ctx_base(), 0x2000, DEFAULT_AT_BUFFERS, fake_mem(), Box::new(|_, _, _| {}));
		at.set_generation(1);
		at.send(&ctx_regs, make_packet(1), Some(3)).unwrap();
		assert_eq!(at.free_buffers(), DEFAULT_AT_BUFFERS - 1);
		assert_ne!(ctx_regs.command_ptr(), 0);
	}

	#[test]
	fn unrecognized_tcode_is_rejected_with_type_error() {
		let window = FakeWindow::new();
		let regs = Registers::new(window);
		let ctx_regs = ContextRegs { regs: &regs, base: ctx_base() };
		let results: Arc<StdMutex<Vec<Result<AckCode, RCode>>>> = Arc::new(StdMutex::new(Vec::new()));
		let results_clone = Arc::clone(&results);
		let at = AtContext::new(
			AtDirection::Request,
			ctx_base(),
			0x2000,
			DEFAULT_AT_BUFFERS,
			fake_mem(),
			Box::new(move |outcome, _ts, _pkt| results_clone.lock().unwrap().push(outcome)),
		);
		at.set_generation(1);
		let mut packet = make_packet(1);
		packet.tcode = Tcode::Cycle;
		at.send(&ctx_regs, packet, None).unwrap();
		assert_eq!(results.lock().unwrap()[0], Err(RCode::TypeError));
	}

	#[test]
	fn reconcile_fires_ack_once_hardware_stamps_the_status_descriptor() {
		let window = FakeWindow::new();
		let regs = Registers::new(window);
		let ctx_regs = ContextRegs { regs: &regs, base: ctx_base() };
		let mem = Arc::new(FakeDescriptorMemory::new());
		let results: Arc<StdMutex<Vec<Result<AckCode, RCode>>>> = Arc::new(StdMutex::new(Vec::new()));
		let results_clone = Arc::clone(&results);
		let at = AtContext::new(
			AtDirection::Request,
			ctx_base(),
			0x2000,
			DEFAULT_AT_BUFFERS,
			mem.clone(),
			Box::new(move |outcome, _ts, _pkt| results_clone.lock().unwrap().push(outcome)),
		);
		at.set_generation(1);
		at.send(&ctx_regs, make_packet(1), None).unwrap();
		assert!(results.lock().unwrap().is_empty(), "no completion before the status descriptor is stamped");

		mem.stamp(0x2000, Descriptor { transfer_status: 0x11, res_count: 0x1234, ..Descriptor::default() });
		at.reconcile(&ctx_regs);
		assert_eq!(results.lock().unwrap()[0], Ok(AckCode::Complete));
	}

	#[test]
	fn cancel_suppresses_the_callback_even_after_the_status_descriptor_is_stamped() {
		let window = FakeWindow::new();
		let regs = Registers::new(window);
		let ctx_regs = ContextRegs { regs: &regs, base: ctx_base() };
		let mem = Arc::new(FakeDescriptorMemory::new());
		let results: Arc<StdMutex<Vec<Result<AckCode, RCode>>>> = Arc::new(StdMutex::new(Vec::new()));
		let results_clone = Arc::clone(&results);
		let at = AtContext::new(
			AtDirection::Request,
			ctx_base(),
			0x2000,
			DEFAULT_AT_BUFFERS,
			mem.clone(),
			Box::new(move |outcome, _ts, _pkt| results_clone.lock().unwrap().push(outcome)),
		);
		at.set_generation(1);
		at.send(&ctx_regs, make_packet(1), None).unwrap();

		at.cancel_at(0);
		mem.stamp(0x2000, Descriptor { transfer_status: 0x11, res_count: 0x1234, ..Descriptor::default() });
		at.reconcile(&ctx_regs);

		assert!(results.lock().unwrap().is_empty(), "cancelled buffer must never fire its ack callback");
		assert_eq!(at.free_buffers(), DEFAULT_AT_BUFFERS, "cancelled buffer is still released back to the pool");
	}
}
