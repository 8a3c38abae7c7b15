//! Byte-swapped register gateway and PHY register indirection.
//!
//! The embedder owns the actual memory-mapped 2 KiB register window; it
//! implements [`RawWindow`] over it (a thin adapter, typically a
//! volatile `u32` read/write at a byte offset). This module supplies
//! the byte-swap-on-access and the PHY read/write protocol on top.

use std::sync::atomic::{fence, Ordering};

use crate::config::{PHY_POLL_INTERVAL, PHY_POLL_ITERS};
use crate::error::{DriverError, Result};
use crate::sync::spin_poll;

/// Raw access to the controller's 2 KiB register window. The embedder
/// implements this over whatever MMIO primitive its platform provides;
/// values crossing this boundary are in **bus** (little-endian) order,
/// never host order.
pub trait RawWindow: Send + Sync {
	fn raw_read(&self, offset: u32) -> u32;
	fn raw_write(&self, offset: u32, value: u32);
}

/// OHCI 1.1 register offsets this driver touches directly. Offsets not
/// listed here (context blocks) are computed by [`crate::context`]
/// relative to a context's base.
pub mod offset {
	pub const VERSION: u32 = 0x000;
	pub const CSR_DATA: u32 = 0x00C;
	pub const CSR_COMPARE_DATA: u32 = 0x010;
	pub const CSR_CONTROL: u32 = 0x014;
	pub const CONFIG_ROM_HDR: u32 = 0x018;
	pub const BUS_OPTIONS: u32 = 0x020;
	pub const GUID_HI: u32 = 0x024;
	pub const GUID_LO: u32 = 0x028;
	pub const CONFIG_ROM_MAP: u32 = 0x034;
	pub const HC_CONTROL_SET: u32 = 0x050;
	pub const HC_CONTROL_CLEAR: u32 = 0x054;
	pub const SELF_ID_BUFFER: u32 = 0x064;
	pub const SELF_ID_COUNT: u32 = 0x068;
	pub const INT_EVENT_SET: u32 = 0x080;
	pub const INT_EVENT_CLEAR: u32 = 0x084;
	pub const INT_MASK_SET: u32 = 0x088;
	pub const INT_MASK_CLEAR: u32 = 0x08C;
	pub const ISO_XMIT_INT_EVENT_CLEAR: u32 = 0x094;
	pub const ISO_RECV_INT_EVENT_CLEAR: u32 = 0x0A4;
	pub const LINK_CONTROL_SET: u32 = 0x0E0;
	pub const LINK_CONTROL_CLEAR: u32 = 0x0E4;
	pub const NODE_ID: u32 = 0x0E8;
	pub const PHY_CONTROL: u32 = 0x0EC;
	pub const ISOCHRONOUS_CYCLE_TIMER: u32 = 0x0F0;
	pub const ASYNC_REQUEST_FILTER_HI_SET: u32 = 0x100;
	pub const ASYNC_REQUEST_FILTER_LO_SET: u32 = 0x108;
	pub const PHY_REQUEST_FILTER_HI_SET: u32 = 0x110;
	pub const PHY_REQUEST_FILTER_LO_SET: u32 = 0x118;
	pub const PHYSICAL_UPPER_BOUND: u32 = 0x120;
}

/// `PHY_CONTROL` bit layout used by [`Registers::write_phy`]:
/// `RdReg` / `RdAddr` / `RdData` for the read half, `WrReg` / `WrAddr`
/// / `WrData` for the write half.
mod phy_bits {
	pub const RD_REG: u32 = 1 << 31;
	pub const RD_DONE: u32 = 1 << 30;
	pub const RD_ADDR_SHIFT: u32 = 24;
	pub const RD_DATA_SHIFT: u32 = 16;
	pub const WR_REG: u32 = 1 << 14;
	pub const WR_ADDR_SHIFT: u32 = 8;
	pub const WR_DATA_SHIFT: u32 = 0;
}

/// Whether the host is big-endian, decided once at construction so
/// every access pays only a branch, not a syscall.
fn host_is_big_endian() -> bool {
	cfg!(target_endian = "big")
}

pub struct Registers<W: RawWindow> {
	window: W,
	swap: bool,
}

impl<W: RawWindow> Registers<W> {
	pub fn new(window: W) -> Self {
		Registers { window, swap: host_is_big_endian() }
	}

	/// Byte-swap-on-access, as the hardware always presents registers
	/// little-endian on the bus. An involution: see the
	/// `byte_swap_is_involution` test.
	fn to_host(&self, raw: u32) -> u32 {
		if self.swap { raw.swap_bytes() } else { raw }
	}

	fn to_bus(&self, value: u32) -> u32 {
		if self.swap { value.swap_bytes() } else { value }
	}

	pub fn read(&self, offset: u32) -> u32 {
		let raw = self.window.raw_read(offset);
		fence(Ordering::Acquire);
		self.to_host(raw)
	}

	pub fn write(&self, offset: u32, value: u32) {
		self.window.raw_write(offset, self.to_bus(value));
		fence(Ordering::Release);
	}

	/// Read-modify-write a PHY register through the indirect gateway.
	/// `clear_mask`/`set_mask` apply to the byte read back from the PHY
	/// before the write-back.
	pub fn write_phy(&self, addr: u8, clear_mask: u8, set_mask: u8) -> Result<u8> {
		if self.read(offset::PHY_CONTROL) & phy_bits::RD_REG != 0 {
			return Err(DriverError::PhyBusy);
		}
		self.write(offset::PHY_CONTROL, phy_bits::RD_REG | ((addr as u32) << phy_bits::RD_ADDR_SHIFT));

		let mut result = 0u32;
		let done = spin_poll(PHY_POLL_INTERVAL, PHY_POLL_ITERS, || {
			result = self.read(offset::PHY_CONTROL);
			result & phy_bits::RD_DONE != 0
		});
		if !done {
			return Err(DriverError::PhyReadTimeout);
		}

		let got_addr = ((result >> phy_bits::RD_ADDR_SHIFT) & 0xF) as u8;
		if got_addr != addr {
			return Err(DriverError::PhyAddrMismatch);
		}
		let current = ((result >> phy_bits::RD_DATA_SHIFT) & 0xFF) as u8;
		let new_value = (current & !clear_mask) | set_mask;

		self.write(
			offset::PHY_CONTROL,
			phy_bits::WR_REG | ((addr as u32) << phy_bits::WR_ADDR_SHIFT) | ((new_value as u32) << phy_bits::WR_DATA_SHIFT),
		);

		let wrote = spin_poll(PHY_POLL_INTERVAL, PHY_POLL_ITERS, || self.read(offset::PHY_CONTROL) & phy_bits::WR_REG == 0);
		if !wrote {
			return Err(DriverError::PhyWriteTimeout);
		}
		Ok(new_value)
	}
}


#[cfg(test)]
mod tests {
	use super::test_support::FakeWindow;
	use super::*;

	#[test]
	fn byte_swap_is_involution() {
		let regs = Registers::new(FakeWindow::new());
		let value = 0xDEAD_BEEFu32;
		assert_eq!(regs.to_host(regs.to_bus(value)), value);
	}

	#[test]
	fn write_phy_reads_back_and_applies_masks() {
		let regs = Registers::new(FakeWindow::new());
		let result = regs.write_phy(5, 0xFF, 0x01).unwrap();
		assert_eq!(result, 0x01);
	}

	#[test]
	fn write_phy_read_timeout_surfaces_error() {
		let mut window = FakeWindow::new();
		window.phy_read_fails = true;
		let regs = Registers::new(window);
		assert_eq!(regs.write_phy(5, 0xFF, 0x01), Err(DriverError::PhyReadTimeout));
	}

	#[test]
	fn write_phy_rejects_when_a_read_is_already_in_flight() {
		let window = FakeWindow::new();
		window.preset(offset::PHY_CONTROL, phy_bits::RD_REG | (3 << phy_bits::RD_ADDR_SHIFT));
		let regs = Registers::new(window);
		assert_eq!(regs.write_phy(5, 0xFF, 0x01), Err(DriverError::PhyBusy));
	}
}
