//! Fixed-size buffer pools and the intrusive free/in-flight/completed
//! lists that back them.
//!
//! The original threads these as doubly-linked lists of heap records;
//! what matters operationally is O(1) splice under a held lock, so
//! this crate uses a fixed `Vec<AtBuffer>` arena addressed by index,
//! with three `VecDeque<usize>` lists playing the role of the
//! free/in-flight/completed chains. Splicing a buffer between lists is
//! then a `VecDeque` push/pop, not a pointer-fixup.

use std::collections::VecDeque;
use std::sync::Mutex;

use crate::descriptor::Descriptor;
use crate::error::{DriverError, Result};
use crate::packet::Packet;

/// The bidirectional, nullable link between an AT buffer and the
/// upper-layer packet it carries. Either side nulls both ends under
/// the unit lock to denote "orphaned"; [`crate::at::AtContext::cancel_at`]
/// is the only place that nulls it from the packet side.
#[derive(Default)]
pub struct PacketLink(Mutex<Option<Packet>>);

impl PacketLink {
	pub fn set(&self, packet: Packet) {
		*self.0.lock().unwrap() = Some(packet);
	}

	/// Nulls the link, returning the packet if one was attached. Used
	/// both by normal completion (to hand the packet to the ack
	/// callback) and by `cancel()` (to suppress it).
	pub fn take(&self) -> Option<Packet> {
		self.0.lock().unwrap().take()
	}

	pub fn is_orphaned(&self) -> bool {
		self.0.lock().unwrap().is_none()
	}
}

/// Three descriptors (header-immediate, payload-pointer, trailer) plus
/// the back-pointer to the originating packet.
pub struct AtBuffer {
	pub header: Descriptor,
	pub payload: Descriptor,
	pub trailer: Descriptor,
	pub link: PacketLink,
	pub physical_address: u32,
	/// Set by `AtContext::send` when this buffer chains a payload
	/// descriptor, so completion reconciliation knows whether the
	/// controller stamps status onto the header or the payload
	/// descriptor (whichever carries `OUTPUT_LAST`).
	pub has_payload: bool,
}

impl AtBuffer {
	fn new(physical_address: u32) -> Self {
		AtBuffer {
			header: Descriptor::default(),
			payload: Descriptor::default(),
			trailer: Descriptor::default(),
			link: PacketLink::default(),
			physical_address,
			has_payload: false,
		}
	}

	/// Physical address of whichever descriptor the controller stamps
	/// completion status into. Descriptors within a buffer's block are
	/// laid out contiguously, header then payload, 16 bytes apart.
	pub fn status_physical_address(&self) -> u32 {
		if self.has_payload {
			self.physical_address + Descriptor::SIZE as u32
		} else {
			self.physical_address
		}
	}
}

/// A fixed pool of `AtBuffer`s plus the free/in-flight/completed chains.
pub struct AtBufferPool {
	arena: Vec<AtBuffer>,
	free: VecDeque<usize>,
	in_flight: VecDeque<usize>,
	completed: VecDeque<usize>,
	/// Index of the buffer presently serving as the DMA chain
	/// terminator, if any. Protected from release by
	/// [`AtBufferPool::release`] (the "last-buffer pinning" invariant).
	tail: Option<usize>,
}

impl AtBufferPool {
	/// `base_physical` and `stride` let the embedder describe where
	/// each buffer record physically lives so `branchAddress` splicing
	/// can use real physical addresses.
	pub fn new(count: usize, base_physical: u32, stride: u32) -> Self {
		let mut arena = Vec::with_capacity(count);
		let mut free = VecDeque::with_capacity(count);
		for i in 0..count {
			arena.push(AtBuffer::new(base_physical + (i as u32) * stride));
			free.push_back(i);
		}
		AtBufferPool { arena, free, in_flight: VecDeque::new(), completed: VecDeque::new(), tail: None }
	}

	pub fn get(&self, idx: usize) -> &AtBuffer {
		&self.arena[idx]
	}

	pub fn get_mut(&mut self, idx: usize) -> &mut AtBuffer {
		&mut self.arena[idx]
	}

	/// Takes a buffer off the free list. Fails with `UnitBusy` when the
	/// pool is exhausted.
	pub fn acquire(&mut self) -> Result<usize> {
		self.free.pop_front().ok_or(DriverError::UnitBusy)
	}

	pub fn mark_in_flight(&mut self, idx: usize) {
		self.in_flight.push_back(idx);
	}

	pub fn set_tail(&mut self, idx: usize) {
		self.tail = Some(idx);
	}

	pub fn tail(&self) -> Option<usize> {
		self.tail
	}

	/// Scans the in-flight list head-first for completed buffers.
	/// `is_done` inspects (and may stamp bookkeeping fields onto) the
	/// buffer itself; it returns `false` to stop the scan at the first
	/// buffer that has not completed yet, since completions land in
	/// chain order. Returns completed indices in completion order,
	/// moving each to the completed list.
	pub fn drain_completed<F: FnMut(&mut AtBuffer) -> bool>(&mut self, mut is_done: F) -> Vec<usize> {
		let mut drained = Vec::new();
		while let Some(&idx) = self.in_flight.front() {
			if is_done(&mut self.arena[idx]) {
				self.in_flight.pop_front();
				self.completed.push_back(idx);
				drained.push(idx);
			} else {
				break;
			}
		}
		drained
	}

	/// Forces the whole in-flight list to completed, used by the DEAD
	/// context recovery path. Returns the indices in order; the caller
	/// re-derives the new head/tail.
	pub fn drain_all_in_flight(&mut self) -> Vec<usize> {
		let mut drained = Vec::new();
		while let Some(idx) = self.in_flight.pop_front() {
			self.completed.push_back(idx);
			drained.push(idx);
		}
		drained
	}

	/// Returns a completed buffer to the free list, unless it is
	/// pinned as the chain tail (the last-buffer pinning invariant).
	pub fn release(&mut self, idx: usize) {
		if self.tail == Some(idx) {
			return;
		}
		self.completed.retain(|&i| i != idx);
		self.free.push_back(idx);
	}

	pub fn free_count(&self) -> usize {
		self.free.len()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn acquire_exhausts_then_fails_with_unit_busy() {
		let mut pool = AtBufferPool::new(2, 0x1000, 256);
		assert!(pool.acquire().is_ok());
		assert!(pool.acquire().is_ok());
		assert_eq!(pool.acquire(), Err(DriverError::UnitBusy));
	}

	#[test]
	fn release_does_not_free_pinned_tail() {
		let mut pool = AtBufferPool::new(1, 0x1000, 256);
		let idx = pool.acquire().unwrap();
		pool.set_tail(idx);
		pool.mark_in_flight(idx);
		pool.drain_all_in_flight();
		pool.release(idx);
		assert_eq!(pool.free_count(), 0);
	}

	#[test]
	fn packet_link_take_is_idempotent_none_after_first_take() {
		let link = PacketLink::default();
		assert!(link.is_orphaned());
	}
}
