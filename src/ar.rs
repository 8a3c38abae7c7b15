//! AR (asynchronous receive) context: a 10-page ring of input buffers,
//! drained and parsed into packets handed upward.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use crate::context::{ContextBase, ContextRegs};
use crate::descriptor::{ControlBits, Descriptor, DescriptorMemory};
use crate::packet::{Packet, Tcode};
use crate::regs::RawWindow;

/// Trailer quadlet appended after header + payload, rounded up to 4
/// bytes.
struct Trailer {
	timestamp: u16,
	event: u8,
	speed: u8,
}

fn parse_trailer(raw: u32) -> Trailer {
	Trailer { timestamp: (raw & 0xFFFF) as u16, event: ((raw >> 16) & 0x1F) as u8, speed: ((raw >> 21) & 0x7) as u8 }
}

const EVENT_BUS_RESET: u8 = 0x09;
const EVENT_WRITE_PHY: u8 = 0x0A;

struct ArPage {
	descriptor: Descriptor,
	data: Vec<u8>,
}

impl ArPage {
	fn new(page_size: usize, physical_address: u32) -> Self {
		ArPage {
			descriptor: Descriptor {
				control: ControlBits::INPUT_MORE.bits(),
				req_count: page_size as u16,
				data_address: physical_address,
				branch_address: 0,
				res_count: page_size as u16,
				transfer_status: 0,
				immediate: [0; 4],
			},
			data: vec![0u8; page_size],
		}
	}
}

struct ArRing {
	pages: Vec<ArPage>,
	page_size: usize,
	/// Index of the oldest not-yet-drained page.
	first_buffer: usize,
	/// First unread byte offset within `pages[first_buffer]`.
	first_quadlet: usize,
	/// Current chain terminator.
	last_buffer: usize,
	/// Trailing bytes of a page recycled before a packet that straddles
	/// it could fully parse, prepended onto the next page's leading
	/// bytes so the packet parses out of one contiguous buffer.
	carry: Vec<u8>,
}

impl ArRing {
	fn new(page_size: usize, count: usize, base_physical: u32) -> Self {
		let mut pages = Vec::with_capacity(count);
		for i in 0..count {
			pages.push(ArPage::new(page_size, base_physical + (i * page_size) as u32));
		}
		for i in 0..count {
			let z = if i + 1 == count { 0 } else { 1 };
			let next = (i + 1) % count;
			let target = pages[next].descriptor.data_address;
			pages[i].descriptor.branch_address = Descriptor::branch(target, z);
		}
		ArRing { pages, page_size, first_buffer: 0, first_quadlet: 0, last_buffer: count - 1, carry: Vec::new() }
	}

	fn next_index(&self, idx: usize) -> usize {
		(idx + 1) % self.pages.len()
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArDirection {
	Request,
	Response,
}

pub type UpcallRequest = Box<dyn Fn(Packet, u8) + Send + Sync>;
pub type UpcallResponse = Box<dyn Fn(Packet) + Send + Sync>;

pub enum Upcall {
	Request(UpcallRequest),
	Response(UpcallResponse),
}

pub struct ArContext {
	ring: Mutex<ArRing>,
	direction: ArDirection,
	upcall: Upcall,
	generation: AtomicU8,
	/// Generation tag of the most recent `BusReset` event seen in a
	/// trailer, used to drop packets that arrived before a reset was
	/// acknowledged.
	last_bus_reset_generation: AtomicU8,
	/// Gateway onto the real DMA memory the controller writes received
	/// bytes and stamps page status into.
	mem: Arc<dyn DescriptorMemory>,
}

impl ArContext {
	pub fn new(
		direction: ArDirection,
		page_size: usize,
		page_count: usize,
		base_physical: u32,
		mem: Arc<dyn DescriptorMemory>,
		upcall: Upcall,
	) -> Self {
		ArContext {
			ring: Mutex::new(ArRing::new(page_size, page_count, base_physical)),
			direction,
			upcall,
			generation: AtomicU8::new(0),
			last_bus_reset_generation: AtomicU8::new(0),
			mem,
		}
	}

	pub fn set_generation(&self, generation: u8) {
		self.generation.store(generation, Ordering::Release);
	}

	/// Starts the ring: writes `CommandPtr = physAddr(first) | 1`, clears
	/// control, sets RUN.
	pub fn start<W: RawWindow>(&self, regs: &ContextRegs<'_, W>) {
		let ring = self.ring.lock().unwrap();
		let first = &ring.pages[ring.first_buffer];
		regs.write_command_ptr(Descriptor::branch(first.descriptor.data_address, 1));
		regs.run();
	}

	/// Drains and parses whatever packets have landed in the ring. Call
	/// when the context's `RqPkt`/`RsPkt` signal fires. Reads the
	/// controller's actual `resCount`/`transferStatus` stamp and the
	/// bytes it has written through [`DescriptorMemory`] rather than
	/// trusting this ring's own bookkeeping copy, which only ever
	/// reflects the driver's last rearm. A packet whose header or
	/// payload straddles the boundary between the current page and the
	/// next parses out of `ring.carry` stitched onto the new page's
	/// leading bytes, rather than being lost when the old page recycles.
	pub fn drain<W: RawWindow>(&self, regs: &ContextRegs<'_, W>) {
		let mut ring = self.ring.lock().unwrap();
		let mut drained_any = false;

		loop {
			let head = ring.first_buffer;
			let page_size = ring.page_size;
			let phys = ring.pages[head].descriptor.data_address;
			let stamped = self.mem.read_descriptor(phys);
			let res_count = stamped.res_count as usize;
			let page_full = res_count == 0;
			let filled = if page_full { page_size } else { page_size.saturating_sub(res_count) };
			let available = filled.saturating_sub(ring.first_quadlet);

			if available == 0 && ring.carry.is_empty() {
				break;
			}

			self.mem.read_bytes(phys, &mut ring.pages[head].data[..filled]);
			let start = ring.first_quadlet;
			let mut combined = std::mem::take(&mut ring.carry);
			combined.extend_from_slice(&ring.pages[head].data[start..start + available]);
			let consumed = self.parse_range(&combined);
			ring.carry = combined[consumed..].to_vec();
			ring.first_quadlet = start + available;

			if !page_full {
				break;
			}

			// Page fully consumed by hardware: rearm it and splice it
			// onto the ring's tail. Any bytes it contributed to an
			// unfinished packet stay queued in `ring.carry` and get
			// stitched onto the next page's leading bytes above.
			ring.pages[head].descriptor.res_count = page_size as u16;
			ring.pages[head].descriptor.transfer_status = 0;

			let last = ring.last_buffer;
			ring.pages[last].descriptor.branch_address |= 1;
			ring.pages[head].descriptor.branch_address &= !0xF;
			ring.last_buffer = head;

			ring.first_buffer = ring.next_index(head);
			ring.first_quadlet = 0;
			drained_any = true;
		}

		if drained_any {
			regs.wake();
		}
	}

	/// Parses as many complete packets as fit in `range`, invoking the
	/// upward callback for each, and returns the number of bytes
	/// actually consumed.
	fn parse_range(&self, range: &[u8]) -> usize {
		let mut offset = 0;
		while offset + 16 <= range.len() {
			match self.parse_one(&range[offset..]) {
				Some(consumed) if consumed > 0 => offset += consumed,
				_ => break,
			}
		}
		offset
	}

	fn parse_one(&self, buf: &[u8]) -> Option<usize> {
		if buf.len() < 16 {
			return None;
		}
		let q = |i: usize| -> u32 { u32::from_be_bytes([buf[i], buf[i + 1], buf[i + 2], buf[i + 3]]) };
		let h0 = q(0);
		let tcode_bits = ((h0 >> 4) & 0xF) as u8;
		let tcode = Tcode::try_from(tcode_bits).ok()?;
		let shape = tcode.shape()?;

		let header_len = shape.header_len;
		if buf.len() < header_len {
			return None;
		}

		let mut header = [0u32; 4];
		for (i, slot) in header.iter_mut().enumerate().take(header_len / 4) {
			*slot = q(i * 4);
		}

		let payload_len = if shape.needs_payload && header_len >= 16 {
			((header[3] >> 16) & 0xFFFF) as usize
		} else {
			0
		};

		let data_start = header_len;
		let data_end = data_start + payload_len;
		let trailer_start = (data_end + 3) & !3;
		if buf.len() < trailer_start + 4 {
			return None;
		}

		let trailer = parse_trailer(q(trailer_start));

		if trailer.event == EVENT_BUS_RESET {
			self.last_bus_reset_generation.store((h0 & 0xFF) as u8, Ordering::Release);
			return Some(trailer_start + 4);
		}

		let packet_generation = self.last_bus_reset_generation.load(Ordering::Acquire);
		if trailer.event != EVENT_WRITE_PHY && packet_generation != self.generation.load(Ordering::Acquire) {
			log::debug!("dropping AR packet from stale generation {packet_generation}");
			return Some(trailer_start + 4);
		}

		let packet = Packet {
			destination_id: (h0 & 0xFFFF) as u16,
			source_id: ((header[1] >> 16) & 0xFFFF) as u16,
			tlabel: ((h0 >> 10) & 0x3F) as u8,
			tcode,
			header,
			header_len: header_len as u8,
			payload: buf[data_start..data_end].to_vec(),
			payload_phys: None,
			timestamp: trailer.timestamp,
			speed: trailer.speed,
			generation: packet_generation,
		};

		match (&self.upcall, self.direction) {
			(Upcall::Request(cb), _) => cb(packet, packet_generation),
			(Upcall::Response(cb), _) => cb(packet),
		}

		Some(trailer_start + 4)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::descriptor::test_support::FakeDescriptorMemory;
	use crate::regs::test_support::FakeWindow;
	use crate::regs::Registers;

	fn fake_mem() -> Arc<dyn DescriptorMemory> {
		Arc::new(FakeDescriptorMemory::new())
	}

	fn encode_write_quadlet(tlabel: u8, dest: u16, offset_hi: u16, offset_lo: u32, data: u32, event: u8) -> Vec<u8> {
		let mut out = Vec::new();
		let h0 = ((dest as u32) << 16) | ((tlabel as u32) << 10) | (0x0 << 4);
		out.extend_from_slice(&h0.to_be_bytes());
		out.extend_from_slice(&((0u32) << 16 | offset_hi as u32).to_be_bytes());
		out.extend_from_slice(&offset_lo.to_be_bytes());
		out.extend_from_slice(&data.to_be_bytes());
		let trailer = (0u32 << 16) | ((event as u32) << 16);
		out.extend_from_slice(&trailer.to_be_bytes());
		out
	}

	#[test]
	fn parse_one_request_invokes_upcall_when_generation_matches() {
		use std::sync::{Arc, Mutex as StdMutex};
		let seen: Arc<StdMutex<Vec<Packet>>> = Arc::new(StdMutex::new(Vec::new()));
		let seen_clone = Arc::clone(&seen);
		let ctx = ArContext::new(
			ArDirection::Request,
			4096,
			4,
			0x5000,
			fake_mem(),
			Upcall::Request(Box::new(move |p, _gen| seen_clone.lock().unwrap().push(p))),
		);
		ctx.set_generation(3);
		ctx.last_bus_reset_generation.store(3, Ordering::Release);

		let bytes = encode_write_quadlet(1, 0xFFC0, 0, 0x1000, 0xDEAD_BEEF, 0x10);
		let consumed = ctx.parse_one(&bytes);
		assert_eq!(consumed, Some(20));
		assert_eq!(seen.lock().unwrap().len(), 1);
	}

	#[test]
	fn parse_one_drops_stale_generation_silently() {
		let ctx = ArContext::new(ArDirection::Request, 4096, 4, 0x5000, fake_mem(), Upcall::Request(Box::new(|_, _| {})));
		ctx.set_generation(3);
		ctx.last_bus_reset_generation.store(2, Ordering::Release);
		let bytes = encode_write_quadlet(1, 0xFFC0, 0, 0x1000, 0xDEAD_BEEF, 0x10);
		assert!(ctx.parse_one(&bytes).is_some());
	}

	#[test]
	fn bus_reset_event_updates_generation_tag() {
		let ctx = ArContext::new(ArDirection::Request, 4096, 4, 0x5000, fake_mem(), Upcall::Request(Box::new(|_, _| {})));
		let bytes = encode_write_quadlet(0, 0, 0, 0, 0, 7);
		// force tcode to something with a 16-byte header and embed BUS_RESET event
		let mut bytes = bytes;
		bytes[16..20].copy_from_slice(&((EVENT_BUS_RESET as u32) << 16 | 5).to_be_bytes());
		ctx.parse_one(&bytes);
		assert_eq!(ctx.last_bus_reset_generation.load(Ordering::Acquire), 0);
	}

	#[test]
	fn drain_parses_a_packet_once_hardware_stamps_res_count() {
		use std::sync::{Arc as StdArc, Mutex as StdMutex};
		let seen: StdArc<StdMutex<Vec<Packet>>> = StdArc::new(StdMutex::new(Vec::new()));
		let seen_clone = StdArc::clone(&seen);
		let mem = StdArc::new(FakeDescriptorMemory::new());
		let ctx = ArContext::new(
			ArDirection::Request,
			4096,
			4,
			0x5000,
			mem.clone(),
			Upcall::Request(Box::new(move |p, _gen| seen_clone.lock().unwrap().push(p))),
		);
		ctx.set_generation(0);
		ctx.last_bus_reset_generation.store(0, Ordering::Release);

		let window = FakeWindow::new();
		let regs = Registers::new(window);
		let ctx_regs = ContextRegs { regs: &regs, base: ContextBase { control_set: 0x10, control_clear: 0x14, command_ptr: 0x1C } };

		let bytes = encode_write_quadlet(1, 0xFFC0, 0, 0x1000, 0xDEAD_BEEF, 0x10);
		mem.put_bytes(0x5000, bytes.clone());
		mem.stamp(0x5000, Descriptor { res_count: (4096 - bytes.len()) as u16, ..Descriptor::default() });

		ctx.drain(&ctx_regs);
		assert_eq!(seen.lock().unwrap().len(), 1);
	}

	#[test]
	fn drain_stitches_a_packet_straddling_a_recycled_page() {
		use std::sync::{Arc as StdArc, Mutex as StdMutex};
		let seen: StdArc<StdMutex<Vec<Packet>>> = StdArc::new(StdMutex::new(Vec::new()));
		let seen_clone = StdArc::clone(&seen);
		let mem = StdArc::new(FakeDescriptorMemory::new());
		let page_size = 24usize;
		let ctx = ArContext::new(
			ArDirection::Request,
			page_size,
			2,
			0x5000,
			mem.clone(),
			Upcall::Request(Box::new(move |p, _gen| seen_clone.lock().unwrap().push(p))),
		);
		ctx.set_generation(0);
		ctx.last_bus_reset_generation.store(0, Ordering::Release);

		let bytes = encode_write_quadlet(1, 0xFFC0, 0, 0x1000, 0xDEAD_BEEF, 0x10);
		assert_eq!(bytes.len(), 20);

		// Page 0 is already stamped as fully consumed (resCount == 0):
		// bytes [0..12) of the straddling packet sit in its last 12
		// bytes, offsets [12..24).
		let mut page0 = vec![0u8; page_size];
		page0[12..24].copy_from_slice(&bytes[0..12]);
		mem.put_bytes(0x5000, page0);
		mem.stamp(0x5000, Descriptor { res_count: 0, ..Descriptor::default() });

		// Page 1 has received the packet's remaining 8 bytes so far.
		let mut page1 = vec![0u8; page_size];
		page1[0..8].copy_from_slice(&bytes[12..20]);
		mem.put_bytes(0x5018, page1);
		mem.stamp(0x5018, Descriptor { res_count: (page_size - 8) as u16, ..Descriptor::default() });

		let window = FakeWindow::new();
		let regs = Registers::new(window);
		let ctx_regs = ContextRegs { regs: &regs, base: ContextBase { control_set: 0x10, control_clear: 0x14, command_ptr: 0x1C } };

		// Simulate that a prior drain already consumed page 0's first 12
		// bytes; this call must pick up where it left off.
		{
			let mut ring = ctx.ring.lock().unwrap();
			ring.first_quadlet = 12;
		}

		ctx.drain(&ctx_regs);
		assert_eq!(seen.lock().unwrap().len(), 1, "straddling packet should parse once both pages are stitched together");
	}
}
