//! Local Config-ROM and CSR request handling.

use crate::config::{CSR_POLL_INTERVAL, CSR_POLL_ITERS};
use crate::error::{DriverError, Result};
use crate::packet::{RCode, Tcode};
use crate::regs::{offset, RawWindow, Registers};
use crate::sync::spin_poll;
use crate::time::compute_response_timestamp;

/// CSR address space this node answers locally, in quadlet offsets
/// from the 1394 CSR base (0xFFFF_F000_0000).
pub const CSR_BASE_LO: u32 = 0x0000;
pub const CSR_BASE_HI: u32 = 0x0400;
pub const CONFIG_ROM_BASE: u32 = 0x0400;

pub const BUS_MANAGER_ID: u32 = 0x021C;
pub const BANDWIDTH_AVAILABLE: u32 = 0x0220;
pub const CHANNELS_AVAILABLE_HI: u32 = 0x0224;
pub const CHANNELS_AVAILABLE_LO: u32 = 0x0228;

/// Timestamp offset applied to compare-swap/ROM responses:
/// `(req_ts & 0x1fff) + 4000`.
const RESPONSE_TIMESTAMP_OFFSET: u16 = 4000;

fn is_lockable_csr(offset: u32) -> bool {
	matches!(offset, BUS_MANAGER_ID | BANDWIDTH_AVAILABLE | CHANNELS_AVAILABLE_HI | CHANNELS_AVAILABLE_LO)
}

pub struct CsrResponse {
	pub rcode: RCode,
	pub data: u32,
	pub timestamp: u16,
}

/// Answers a local-CSR request. `offset` is relative to `CSR_BASE_LO`.
/// `rom` is the current Config-ROM image; `write_data`/`compare_data`
/// are only consulted for lock requests against the compare-swap CSRs.
pub fn handle_request<W: RawWindow>(
	regs: &Registers<W>,
	rom: &[u32],
	tcode: Tcode,
	offset_in_csr: u32,
	req_timestamp: u16,
	write_data: Option<u32>,
	compare_data: Option<u32>,
) -> CsrResponse {
	let timestamp = compute_response_timestamp(req_timestamp, RESPONSE_TIMESTAMP_OFFSET);

	if offset_in_csr < CSR_BASE_LO || offset_in_csr >= CSR_BASE_HI {
		return CsrResponse { rcode: RCode::AddressError, data: 0, timestamp };
	}

	if offset_in_csr >= CONFIG_ROM_BASE {
		return read_rom(rom, tcode, offset_in_csr, timestamp);
	}

	if is_lockable_csr(offset_in_csr) {
		return compare_swap(regs, offset_in_csr, write_data, compare_data, timestamp);
	}

	CsrResponse { rcode: RCode::AddressError, data: 0, timestamp }
}

fn read_rom(rom: &[u32], tcode: Tcode, offset_in_csr: u32, timestamp: u16) -> CsrResponse {
	if !matches!(tcode, Tcode::ReadQuadletReq | Tcode::ReadBlockReq) {
		return CsrResponse { rcode: RCode::TypeError, data: 0, timestamp };
	}
	let quadlet_index = ((offset_in_csr - CONFIG_ROM_BASE) / 4) as usize;
	match rom.get(quadlet_index) {
		Some(&value) => CsrResponse { rcode: RCode::Complete, data: value, timestamp },
		None => CsrResponse { rcode: RCode::AddressError, data: 0, timestamp },
	}
}

/// Drives the hardware compare-and-swap registers for the bus-manager
/// lock CSRs: write `CSR_WRITE_DATA`/`CSR_COMPARE_DATA`, then
/// `CSR_CONTROL = (offset - BUS_MANAGER_ID)/4`, poll `DONE`.
fn compare_swap<W: RawWindow>(
	regs: &Registers<W>,
	offset_in_csr: u32,
	write_data: Option<u32>,
	compare_data: Option<u32>,
	timestamp: u16,
) -> CsrResponse {
	const DONE: u32 = 1 << 31;

	regs.write(offset::CSR_DATA, write_data.unwrap_or(0));
	regs.write(offset::CSR_COMPARE_DATA, compare_data.unwrap_or(0));
	regs.write(offset::CSR_CONTROL, (offset_in_csr - BUS_MANAGER_ID) / 4);

	let done = spin_poll(CSR_POLL_INTERVAL, CSR_POLL_ITERS, || regs.read(offset::CSR_CONTROL) & DONE != 0);
	if !done {
		return CsrResponse { rcode: RCode::SendError, data: 0, timestamp };
	}
	CsrResponse { rcode: RCode::Complete, data: regs.read(offset::CSR_DATA), timestamp }
}

/// Returns `Unimplemented` for CSR writes this driver does not support
/// as a general write path (only the compare-swap lock CSRs and ROM
/// are serviced; broadcast writes are out of scope).
pub fn reject_unsupported_write(offset_in_csr: u32) -> Result<()> {
	if is_lockable_csr(offset_in_csr) || offset_in_csr >= CONFIG_ROM_BASE {
		Ok(())
	} else {
		Err(DriverError::Unimplemented("broadcast CSR writes"))
	}
}
