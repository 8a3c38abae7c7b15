//! Split-timeout worker: fires TL timeouts via a monotonic timer queue.
//!
//! Cancellation is implicit: removing a transaction from the TL removes
//! its pending timer, so this queue only needs to support "pop
//! everything due" and "remove by key".

use std::collections::BinaryHeap;
use std::cmp::Ordering as CmpOrdering;
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TransactionKey(pub u16, pub u8);

struct Entry {
	deadline: Instant,
	key: TransactionKey,
}

impl PartialEq for Entry {
	fn eq(&self, other: &Self) -> bool {
		self.deadline == other.deadline
	}
}
impl Eq for Entry {}
impl PartialOrd for Entry {
	fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
		Some(self.cmp(other))
	}
}
impl Ord for Entry {
	fn cmp(&self, other: &Self) -> CmpOrdering {
		// Reversed so `BinaryHeap` (a max-heap) pops the earliest deadline.
		other.deadline.cmp(&self.deadline)
	}
}

#[derive(Default)]
pub struct TimeoutQueue {
	heap: Mutex<BinaryHeap<Entry>>,
}

impl TimeoutQueue {
	pub fn new() -> Self {
		TimeoutQueue { heap: Mutex::new(BinaryHeap::new()) }
	}

	pub fn schedule(&self, key: TransactionKey, after: Duration) {
		let deadline = Instant::now() + after;
		self.heap.lock().unwrap().push(Entry { deadline, key });
	}

	/// Implicit cancellation: drops every pending entry for `key`.
	/// O(n) — the queue is expected to stay small (bounded by in-flight
	/// transaction count).
	pub fn cancel(&self, key: TransactionKey) {
		let mut heap = self.heap.lock().unwrap();
		let remaining: Vec<Entry> = heap.drain().filter(|e| e.key != key).collect();
		*heap = remaining.into_iter().collect();
	}

	/// Pops every entry whose deadline has passed, in deadline order.
	pub fn pop_due(&self) -> Vec<TransactionKey> {
		let mut heap = self.heap.lock().unwrap();
		let now = Instant::now();
		let mut due = Vec::new();
		while let Some(top) = heap.peek() {
			if top.deadline <= now {
				due.push(heap.pop().unwrap().key);
			} else {
				break;
			}
		}
		due
	}

	/// Time until the next deadline, for the worker to sleep on its
	/// signal with a bounded wait rather than spin.
	pub fn next_wait(&self) -> Option<Duration> {
		let heap = self.heap.lock().unwrap();
		heap.peek().map(|e| e.deadline.saturating_duration_since(Instant::now()))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn pop_due_returns_only_expired_entries_in_order() {
		let q = TimeoutQueue::new();
		q.schedule(TransactionKey(1, 0), Duration::from_millis(0));
		q.schedule(TransactionKey(2, 0), Duration::from_secs(60));
		let due = q.pop_due();
		assert_eq!(due, vec![TransactionKey(1, 0)]);
		assert!(q.next_wait().is_some());
	}

	#[test]
	fn cancel_removes_pending_entry() {
		let q = TimeoutQueue::new();
		q.schedule(TransactionKey(5, 2), Duration::from_secs(60));
		q.cancel(TransactionKey(5, 2));
		assert!(q.next_wait().is_none());
	}
}
