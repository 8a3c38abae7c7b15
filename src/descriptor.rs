//! The OHCI DMA descriptor: a 16-byte hardware record, always
//! little-endian on the bus.
//!
//! Descriptor fields are stored in **host** byte order in this struct;
//! [`Descriptor::to_bus_bytes`] / [`Descriptor::from_bus_bytes`] are the
//! only places endianness is handled, matching the design note that
//! reads/writes go through explicit swap helpers rather than typed
//! pointers.

use bitflags::bitflags;

bitflags! {
	/// Control-word command/interrupt/branch/key bits.
	#[derive(Debug, Clone, Copy, PartialEq, Eq)]
	pub struct ControlBits: u16 {
		const OUTPUT_LAST   = 0x1000;
		const INPUT_MORE    = 0x2800;
		const INPUT_LAST    = 0x2C00;
		const KEY_IMMEDIATE = 0x0200;
		const BRANCH_ALWAYS = 0x0030;
		const IRQ_ALWAYS    = 0x000C;
		const STATUS        = 0x0800;
	}
}

/// Number of contiguous descriptors at a branch target; 0 terminates a
/// chain.
pub type Z = u8;

/// A single 16-byte DMA descriptor record, plus the optional 16-byte
/// immediate region used by `OUTPUT_LAST | KEY_IMMEDIATE` header
/// descriptors.
#[derive(Debug, Clone, Copy, Default)]
pub struct Descriptor {
	pub control: u16,
	pub req_count: u16,
	pub data_address: u32,
	pub branch_address: u32,
	pub res_count: u16,
	pub transfer_status: u16,
	/// Only meaningful for AT header descriptors: the embedded header
	/// quadlets that follow the 16-byte record proper.
	pub immediate: [u32; 4],
}

/// Access to the DMA-coherent memory a context's descriptors and
/// payload bytes live in — the bulk-memory counterpart to
/// [`crate::regs::RawWindow`]'s 2 KiB register window. The embedder
/// owns the actual buffer the controller DMAs into and out of and
/// implements this over it; a descriptor read through here carries
/// whatever the controller has actually stamped (`transfer_status`,
/// `res_count`), not this crate's own in-process bookkeeping copy.
pub trait DescriptorMemory: Send + Sync {
	/// Reads the 16-byte descriptor record currently at `physical_address`.
	fn read_descriptor(&self, physical_address: u32) -> Descriptor;

	/// Reads `buf.len()` bytes of payload/header data starting at
	/// `physical_address`.
	fn read_bytes(&self, physical_address: u32, buf: &mut [u8]);
}

impl Descriptor {
	pub const SIZE: usize = 16;

	pub fn branch(target_phys: u32, z: Z) -> u32 {
		debug_assert!(z < 16);
		(target_phys & !0xF) | z as u32
	}

	pub fn branch_z(branch_address: u32) -> Z {
		(branch_address & 0xF) as Z
	}

	pub fn branch_target(branch_address: u32) -> u32 {
		branch_address & !0xF
	}

	/// Serializes the fixed 16-byte portion to bus (little-endian)
	/// bytes. The immediate region, when present, follows as four more
	/// little-endian u32s.
	pub fn to_bus_bytes(&self) -> [u8; 16] {
		let mut out = [0u8; 16];
		out[0..2].copy_from_slice(&self.control.to_le_bytes());
		out[2..4].copy_from_slice(&self.req_count.to_le_bytes());
		out[4..8].copy_from_slice(&self.data_address.to_le_bytes());
		out[8..12].copy_from_slice(&self.branch_address.to_le_bytes());
		out[12..14].copy_from_slice(&self.res_count.to_le_bytes());
		out[14..16].copy_from_slice(&self.transfer_status.to_le_bytes());
		out
	}

	pub fn from_bus_bytes(bytes: &[u8; 16]) -> Self {
		Descriptor {
			control: u16::from_le_bytes([bytes[0], bytes[1]]),
			req_count: u16::from_le_bytes([bytes[2], bytes[3]]),
			data_address: u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
			branch_address: u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]),
			res_count: u16::from_le_bytes([bytes[12], bytes[13]]),
			transfer_status: u16::from_le_bytes([bytes[14], bytes[15]]),
			immediate: [0; 4],
		}
	}
}

#[cfg(test)]
pub mod test_support {
	use super::*;
	use std::cell::RefCell;
	use std::collections::HashMap;

	/// A `HashMap`-backed fake DMA memory for unit tests: [`Self::stamp`]
	/// sets what a later `read_descriptor` returns for a physical
	/// address; an address never stamped reads back as a zeroed
	/// descriptor (the "nothing landed yet" state).
	#[derive(Default)]
	pub struct FakeDescriptorMemory {
		descriptors: RefCell<HashMap<u32, Descriptor>>,
		bytes: RefCell<HashMap<u32, Vec<u8>>>,
	}

	impl FakeDescriptorMemory {
		pub fn new() -> Self {
			Self::default()
		}

		pub fn stamp(&self, physical_address: u32, descriptor: Descriptor) {
			self.descriptors.borrow_mut().insert(physical_address, descriptor);
		}

		pub fn put_bytes(&self, physical_address: u32, data: Vec<u8>) {
			self.bytes.borrow_mut().insert(physical_address, data);
		}
	}

	impl DescriptorMemory for FakeDescriptorMemory {
		fn read_descriptor(&self, physical_address: u32) -> Descriptor {
			self.descriptors.borrow().get(&physical_address).copied().unwrap_or_default()
		}

		fn read_bytes(&self, physical_address: u32, buf: &mut [u8]) {
			if let Some(src) = self.bytes.borrow().get(&physical_address) {
				let n = buf.len().min(src.len());
				buf[..n].copy_from_slice(&src[..n]);
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn branch_address_packs_and_unpacks_z() {
		let phys = 0xDEAD_BEE0u32;
		let b = Descriptor::branch(phys, 7);
		assert_eq!(Descriptor::branch_z(b), 7);
		assert_eq!(Descriptor::branch_target(b), phys);
	}

	#[test]
	fn bus_round_trip_preserves_fixed_fields() {
		let d = Descriptor {
			control: ControlBits::OUTPUT_LAST.bits() | ControlBits::IRQ_ALWAYS.bits(),
			req_count: 16,
			data_address: 0x1000_2000,
			branch_address: Descriptor::branch(0x3000_4000, 2),
			res_count: 0,
			transfer_status: 0,
			immediate: [0; 4],
		};
		let bytes = d.to_bus_bytes();
		let back = Descriptor::from_bus_bytes(&bytes);
		assert_eq!(back.control, d.control);
		assert_eq!(back.req_count, d.req_count);
		assert_eq!(back.data_address, d.data_address);
		assert_eq!(back.branch_address, d.branch_address);
	}
}
