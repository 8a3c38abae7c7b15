//! Inward contract the upper-layer transaction layer (TL) and topology
//! builder must implement. This crate treats the TL and topology
//! builder as external collaborators; it only calls through these
//! traits, never owns an implementation of either.

use crate::packet::{Packet, RCode};

/// A single pending AT send the split-timeout worker can expire.
#[derive(Debug, Clone, Copy)]
pub struct Transaction {
	pub node_id: u16,
	pub tlabel: u8,
}

pub trait TransactionLayer: Send + Sync {
	/// Delivers a received request packet for `unit`'s local node,
	/// tagged with the generation it arrived under.
	fn handle_request(&self, packet: Packet, generation: u8);

	/// Delivers a received response packet.
	fn handle_response(&self, packet: Packet);

	/// Flushes every outstanding transaction with `RCODE_GENERATION`,
	/// called by the bus-reset worker before `BusReset` is cleared.
	fn flush_all(&self);

	/// Completes `transaction` with `rcode`, called by the
	/// split-timeout worker when a deadline expires.
	fn finish(&self, transaction: Transaction, rcode: RCode);
}

/// Topology builder contract: interprets self-ID streams into a node
/// graph, explicitly out of scope for this crate beyond invoking it.
pub trait TopologyBuilder: Send + Sync {
	/// Returns `true` on success; `false` triggers the bus-reset
	/// worker's short-reset retry path.
	fn rebuild(&self, self_ids: &[u32]) -> bool;

	fn invalidate(&self);
}
