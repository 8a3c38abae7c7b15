//! Concurrency substrate for worker tasks.
//!
//! Each context runs as a dedicated worker with its own wake-up signal
//! bit and a mailbox kill message; ordinary register spin-polls
//! relinquish the CPU with bounded sleeps. This is built here on
//! `std::thread` plus a single-slot [`Signal`] (the same role a
//! counting semaphore plays for in-kernel tasks elsewhere in this
//! codebase), rather than a bare-metal scheduler, since this crate runs
//! hosted rather than as the kernel itself.

use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

/// A single-slot wake-up signal: a worker blocks in [`Signal::wait`]
/// until `raise` is called at least once since the last wait. Multiple
/// raises before a wait coalesce into one wakeup: a portable equivalent
/// of a single hardware signal bit, where spurious wakeups must be
/// harmless.
pub struct Signal {
	state: Mutex<SignalState>,
	cond: Condvar,
}

struct SignalState {
	pending: bool,
	kill: bool,
}

impl Signal {
	pub fn new() -> Self {
		Signal { state: Mutex::new(SignalState { pending: false, kill: false }), cond: Condvar::new() }
	}

	/// Raises the signal bit. Safe to call from interrupt-like contexts
	/// (the IRQ dispatcher); never blocks.
	pub fn raise(&self) {
		let mut state = self.state.lock().unwrap();
		state.pending = true;
		self.cond.notify_one();
	}

	/// Sends a dedicated kill message. The worker's next `wait` observes
	/// it and returns [`Wake::Kill`].
	pub fn kill(&self) {
		let mut state = self.state.lock().unwrap();
		state.kill = true;
		self.cond.notify_one();
	}

	/// Blocks until raised or killed. Coalesces pending raises.
	pub fn wait(&self) -> Wake {
		let mut state = self.state.lock().unwrap();
		while !state.pending && !state.kill {
			state = self.cond.wait(state).unwrap();
		}
		if state.kill {
			return Wake::Kill;
		}
		state.pending = false;
		Wake::Signalled
	}

	/// Like [`Signal::wait`] but gives up after `timeout`, for workers
	/// that also have their own clock to run on (the split-timeout
	/// worker's expiry sweep). A timed-out wait is not distinguished
	/// from a spurious raise by callers that treat both as "recheck
	/// your own state".
	pub fn wait_timeout(&self, timeout: Duration) -> Wake {
		let mut state = self.state.lock().unwrap();
		loop {
			if state.kill {
				return Wake::Kill;
			}
			if state.pending {
				state.pending = false;
				return Wake::Signalled;
			}
			let (guard, result) = self.cond.wait_timeout(state, timeout).unwrap();
			state = guard;
			if result.timed_out() {
				if state.kill {
					return Wake::Kill;
				}
				if state.pending {
					state.pending = false;
					return Wake::Signalled;
				}
				return Wake::Timeout;
			}
		}
	}
}

impl Default for Signal {
	fn default() -> Self {
		Self::new()
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wake {
	Signalled,
	Kill,
	Timeout,
}

/// A running worker: its thread handle and the signal used to wake or
/// kill it.
pub struct Worker {
	pub signal: Arc<Signal>,
	join: Option<JoinHandle<()>>,
}

impl Worker {
	/// Spawns `body` on its own thread, named for the priority class it
	/// plays. Priority is advisory metadata here — `std::thread` does
	/// not expose portable priority control — so `name` carries it into
	/// thread listings for diagnostics.
	pub fn spawn<F>(name: &str, priority: u8, body: F) -> Worker
	where
		F: FnOnce(Arc<Signal>) + Send + 'static,
	{
		let signal = Arc::new(Signal::new());
		let worker_signal = Arc::clone(&signal);
		let join = std::thread::Builder::new()
			.name(format!("{name}(prio={priority})"))
			.spawn(move || body(worker_signal))
			.expect("failed to spawn worker thread");
		Worker { signal, join: Some(join) }
	}

	/// Sends the kill message and waits for the worker's reply (its
	/// thread exit).
	pub fn stop(&mut self) {
		self.signal.kill();
		if let Some(join) = self.join.take() {
			let _ = join.join();
		}
	}
}

impl Drop for Worker {
	fn drop(&mut self) {
		if self.join.is_some() {
			self.stop();
		}
	}
}

/// Spins on `poll` with `interval` sleeps for up to `iters` attempts,
/// the shape every bounded register poll shares (PHY, context stop, CSR
/// lock). Returns `true` on the first `true` from `poll`.
pub fn spin_poll<F: FnMut() -> bool>(interval: Duration, iters: u32, mut poll: F) -> bool {
	for _ in 0..iters {
		if poll() {
			return true;
		}
		std::thread::sleep(interval);
	}
	poll()
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::atomic::{AtomicUsize, Ordering};

	#[test]
	fn signal_coalesces_multiple_raises() {
		let sig = Signal::new();
		sig.raise();
		sig.raise();
		assert_eq!(sig.wait(), Wake::Signalled);
	}

	#[test]
	fn worker_stop_joins_thread() {
		let counter = Arc::new(AtomicUsize::new(0));
		let c = Arc::clone(&counter);
		let mut w = Worker::spawn("test", 20, move |signal| loop {
			match signal.wait() {
				Wake::Signalled => {
					c.fetch_add(1, Ordering::SeqCst);
				}
				Wake::Kill => break,
				Wake::Timeout => {}
			}
		});
		w.signal.raise();
		w.stop();
		assert!(counter.load(Ordering::SeqCst) >= 1);
	}

	#[test]
	fn wait_timeout_returns_timeout_when_never_raised() {
		let sig = Signal::new();
		assert_eq!(sig.wait_timeout(Duration::from_millis(5)), Wake::Timeout);
	}

	#[test]
	fn spin_poll_stops_as_soon_as_true() {
		let mut n = 0;
		let ok = spin_poll(Duration::from_millis(0), 100, || {
			n += 1;
			n >= 3
		});
		assert!(ok);
		assert_eq!(n, 3);
	}
}
