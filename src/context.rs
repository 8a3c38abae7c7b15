//! Generic OHCI DMA context control: the `ContextControl`/`CommandPtr`
//! register pair shared by every AT, AR, and IR context, plus the
//! bounded stop sequence.

use bitflags::bitflags;

use crate::config::{CONTEXT_STOP_ITERS, CONTEXT_STOP_POLL};
use crate::descriptor::Descriptor;
use crate::error::Result;
use crate::regs::{RawWindow, Registers};
use crate::sync::spin_poll;

bitflags! {
	#[derive(Debug, Clone, Copy, PartialEq, Eq)]
	pub struct ContextControlBits: u32 {
		const RUN    = 1 << 15;
		const WAKE   = 1 << 12;
		const DEAD   = 1 << 11;
		const ACTIVE = 1 << 10;
	}
}

/// Byte offsets of a context's two registers, relative to the unit's
/// register window (each context block is 16 bytes: ContextControlSet,
/// ContextControlClear, unused, CommandPtr).
#[derive(Debug, Clone, Copy)]
pub struct ContextBase {
	pub control_set: u32,
	pub control_clear: u32,
	pub command_ptr: u32,
}

impl ContextBase {
	pub const fn at_offset(block_base: u32) -> ContextBase {
		ContextBase { control_set: block_base, control_clear: block_base + 4, command_ptr: block_base + 12 }
	}
}

/// Thin wrapper pairing a context's register offsets with the shared
/// register gateway, used by [`crate::at`], [`crate::ar`], and
/// [`crate::ir`].
pub struct ContextRegs<'a, W: RawWindow> {
	pub regs: &'a Registers<W>,
	pub base: ContextBase,
}

impl<'a, W: RawWindow> ContextRegs<'a, W> {
	pub fn control(&self) -> ContextControlBits {
		ContextControlBits::from_bits_truncate(self.regs.read(self.base.control_set))
	}

	pub fn set_control(&self, bits: ContextControlBits) {
		self.regs.write(self.base.control_set, bits.bits());
	}

	pub fn clear_control(&self, bits: ContextControlBits) {
		self.regs.write(self.base.control_clear, bits.bits());
	}

	/// `CommandPtr` may only be written while both RUN and ACTIVE are
	/// clear.
	pub fn write_command_ptr(&self, branch: u32) {
		debug_assert!(
			!self.control().intersects(ContextControlBits::RUN | ContextControlBits::ACTIVE),
			"CommandPtr written while RUN|ACTIVE set"
		);
		self.regs.write(self.base.command_ptr, branch);
	}

	pub fn command_ptr(&self) -> u32 {
		self.regs.read(self.base.command_ptr)
	}

	pub fn run(&self) {
		self.set_control(ContextControlBits::RUN);
	}

	pub fn wake(&self) {
		self.set_control(ContextControlBits::WAKE);
	}

	pub fn is_dead(&self) -> bool {
		self.control().contains(ContextControlBits::DEAD)
	}

	/// Clears `RUN` then polls `ACTIVE`. A timeout is reported, not
	/// fatal: the caller decides whether to retry.
	pub fn stop(&self) -> Result<()> {
		self.clear_control(ContextControlBits::RUN);
		let quiesced = spin_poll(CONTEXT_STOP_POLL, CONTEXT_STOP_ITERS, || {
			!self.control().contains(ContextControlBits::ACTIVE)
		});
		if quiesced {
			Ok(())
		} else {
			Err(crate::error::DriverError::ContextStopTimeout)
		}
	}
}

/// Returns `true` once a descriptor's `transferStatus` has been
/// stamped by the hardware (non-zero), the completion test used by
/// both AT reconciliation and IR drain.
pub fn is_stamped(descriptor: &Descriptor) -> bool {
	descriptor.transfer_status != 0
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::regs::test_support::FakeWindow;

	#[test]
	fn stop_reports_timeout_when_active_never_clears() {
		let window = FakeWindow::new();
		window.preset(0x10, ContextControlBits::ACTIVE.bits());
		let regs = Registers::new(window);
		let ctx = ContextRegs { regs: &regs, base: ContextBase { control_set: 0x10, control_clear: 0x14, command_ptr: 0x1C } };
		assert!(ctx.stop().is_err());
	}

	#[test]
	fn stop_succeeds_when_active_already_clear() {
		let window = FakeWindow::new();
		let regs = Registers::new(window);
		let ctx = ContextRegs { regs: &regs, base: ContextBase { control_set: 0x10, control_clear: 0x14, command_ptr: 0x1C } };
		assert!(ctx.stop().is_ok());
	}
}
