//! IR (isochronous receive) context: per-channel descriptor rings with
//! user callbacks.

use std::sync::Arc;

use crate::context::{ContextBase, ContextRegs};
use crate::descriptor::{ControlBits, Descriptor, DescriptorMemory};
use crate::error::{DriverError, Result};
use crate::regs::RawWindow;

/// One packet-per-buffer block: header descriptor (INPUT_MORE) plus
/// payload descriptor (INPUT_LAST|IRQ_ALWAYS|BRANCH_ALWAYS), sharing
/// one page whose header region is padded so payload starts at
/// `payload_alignment`.
struct IrBlock {
	header: Descriptor,
	payload: Descriptor,
}

/// Events an IR block's status is allowed to carry and still be
/// treated as an ordinary filled buffer.
const EVENT_ACK_COMPLETE: u8 = 0x11;
const EVENT_LONG_PACKET: u8 = 0x02;

pub struct DrainOutcome {
	pub header: Vec<u8>,
	pub payload: Vec<u8>,
	pub event: u8,
	pub stopped: bool,
}

pub type IrCallback = Box<dyn Fn(DrainOutcome) + Send + Sync>;

pub struct IrContext {
	blocks: Vec<IrBlock>,
	block_data: Vec<Vec<u8>>,
	first: usize,
	drop_empty: bool,
	callback: IrCallback,
	stopped: bool,
	/// Gateway onto the real DMA memory the controller writes received
	/// header/payload bytes and stamps per-descriptor status into.
	mem: Arc<dyn DescriptorMemory>,
}

impl IrContext {
	pub fn new(
		count: usize,
		base_physical: u32,
		block_size: usize,
		drop_empty: bool,
		mem: Arc<dyn DescriptorMemory>,
		callback: IrCallback,
	) -> Result<Self> {
		if count == 0 {
			return Err(DriverError::NoMem);
		}
		let mut blocks = Vec::with_capacity(count);
		let mut block_data = Vec::with_capacity(count);
		for i in 0..count {
			let phys = base_physical + (i * block_size) as u32;
			let z = if i + 1 == count { 0 } else { 2 };
			let next_phys = base_physical + (((i + 1) % count) * block_size) as u32;
			blocks.push(IrBlock {
				header: Descriptor {
					control: ControlBits::INPUT_MORE.bits(),
					req_count: 8,
					data_address: phys,
					branch_address: 0,
					res_count: 8,
					transfer_status: 0,
					immediate: [0; 4],
				},
				payload: Descriptor {
					control: (ControlBits::INPUT_LAST | ControlBits::IRQ_ALWAYS | ControlBits::BRANCH_ALWAYS).bits(),
					req_count: (block_size - 8) as u16,
					data_address: phys + 8,
					branch_address: Descriptor::branch(next_phys, z),
					res_count: (block_size - 8) as u16,
					transfer_status: 0,
					immediate: [0; 4],
				},
			});
			block_data.push(vec![0u8; block_size]);
		}
		Ok(IrContext { blocks, block_data, first: 0, drop_empty, callback, stopped: false, mem })
	}

	pub fn start<W: RawWindow>(&self, regs: &ContextRegs<'_, W>) {
		regs.write_command_ptr(Descriptor::branch(self.blocks[self.first].header.data_address, 2));
		regs.run();
	}

	/// Drains filled blocks in ring order, invoking the callback for each.
	/// Reads each block's actual stamped status and bytes through
	/// [`DescriptorMemory`] rather than this ring's own bookkeeping copy,
	/// which only ever reflects the driver's last rearm.
	pub fn drain<W: RawWindow>(&mut self, regs: &ContextRegs<'_, W>) {
		if self.stopped {
			return;
		}
		let count = self.blocks.len();
		let mut advanced = false;
		let mut idx = self.first;

		for _ in 0..count {
			let header_addr = self.blocks[idx].header.data_address;
			let payload_addr = self.blocks[idx].payload.data_address;
			let stamped_header = self.mem.read_descriptor(header_addr);
			let stamped_payload = self.mem.read_descriptor(payload_addr);
			let status = stamped_header.transfer_status | stamped_payload.transfer_status;
			if status == 0 {
				break;
			}

			let event = (status & 0x1F) as u8;
			let active_clear = status & (1 << 13) == 0;
			if (event != EVENT_ACK_COMPLETE && event != EVENT_LONG_PACKET) || !active_clear {
				(self.callback)(DrainOutcome { header: Vec::new(), payload: Vec::new(), event, stopped: true });
				self.stopped = true;
				return;
			}

			let header_used = (8usize).saturating_sub(stamped_header.res_count as usize);
			let payload_req = self.blocks[idx].payload.req_count as usize;
			let payload_used = payload_req.saturating_sub(stamped_payload.res_count as usize);

			self.mem.read_bytes(header_addr, &mut self.block_data[idx][..8]);
			self.mem.read_bytes(payload_addr, &mut self.block_data[idx][8..8 + payload_req]);

			let header_bytes = self.block_data[idx][..header_used].to_vec();
			let payload_bytes = self.block_data[idx][8..8 + payload_used].to_vec();
			let empty = header_used == 0 && payload_used == 0;

			self.blocks[idx].header.res_count = 8;
			self.blocks[idx].header.transfer_status = 0;
			self.blocks[idx].payload.res_count = self.blocks[idx].payload.req_count;
			self.blocks[idx].payload.transfer_status = 0;

			if !(empty && self.drop_empty) {
				(self.callback)(DrainOutcome { header: header_bytes, payload: payload_bytes, event, stopped: false });
			}

			idx = (idx + 1) % count;
			advanced = true;
		}

		if advanced {
			let old_last = (self.first + count - 1) % count;
			let new_last = (idx + count - 1) % count;
			self.blocks[old_last].payload.branch_address &= !0xF;
			self.blocks[new_last].payload.branch_address =
				(self.blocks[new_last].payload.branch_address & !0xF) | 2;
			self.first = idx;
			regs.wake();
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::descriptor::test_support::FakeDescriptorMemory;
	use crate::regs::test_support::FakeWindow;
	use crate::regs::Registers;
	use std::sync::{Arc, Mutex as StdMutex};

	fn ctx_regs(regs: &Registers<FakeWindow>) -> ContextRegs<'_, FakeWindow> {
		ContextRegs { regs, base: ContextBase { control_set: 0x10, control_clear: 0x14, command_ptr: 0x1C } }
	}

	#[test]
	fn drop_empty_suppresses_empty_block_callbacks() {
		let seen: Arc<StdMutex<Vec<DrainOutcome>>> = Arc::new(StdMutex::new(Vec::new()));
		let seen_clone = Arc::clone(&seen);
		let mem = Arc::new(FakeDescriptorMemory::new());
		let mut ir = IrContext::new(3, 0x9000, 64, true, mem.clone(), Box::new(move |o| seen_clone.lock().unwrap().push(o)))
			.unwrap();

		let payload_req = 64 - 8;
		for i in 0..2u32 {
			let phys = 0x9000 + i * 64;
			mem.stamp(phys, Descriptor { transfer_status: 0x0011, res_count: 8, ..Descriptor::default() });
			mem.stamp(
				phys + 8,
				Descriptor { transfer_status: 0x0011, res_count: payload_req as u16, ..Descriptor::default() },
			);
		}
		let phys2 = 0x9000 + 2 * 64;
		mem.stamp(phys2, Descriptor { transfer_status: 0x0011, res_count: 4, ..Descriptor::default() });
		mem.stamp(
			phys2 + 8,
			Descriptor { transfer_status: 0x0011, res_count: (payload_req - 16) as u16, ..Descriptor::default() },
		);

		let window = FakeWindow::new();
		let regs = Registers::new(window);
		let ctx = ctx_regs(&regs);
		ir.drain(&ctx);

		assert_eq!(seen.lock().unwrap().len(), 1);
	}
}
