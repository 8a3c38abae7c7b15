//! Abstract packet representation and the tcode table that drives AT
//! descriptor construction and AR header parsing.

use num_enum::{IntoPrimitive, TryFromPrimitive};

/// IEEE-1394 transaction codes this driver knows how to frame or parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum Tcode {
	WriteQuadletReq = 0x0,
	WriteBlockReq = 0x1,
	WriteResponse = 0x2,
	ReadQuadletReq = 0x4,
	ReadBlockReq = 0x5,
	ReadQuadletResponse = 0x6,
	ReadBlockResponse = 0x7,
	Cycle = 0x8,
	Lock = 0x9,
	WriteStream = 0xa,
	Lock64 = 0xb,
	ReadQuadletResponseLock = 0xc,
	WritePhy = 0xe,
}

/// Static shape of the DMA program a tcode needs: header length in
/// bytes, whether a payload descriptor is required, and the resulting
/// descriptor count (`Z`).
#[derive(Debug, Clone, Copy)]
pub struct TcodeShape {
	pub header_len: usize,
	pub needs_payload: bool,
	pub z: u8,
}

impl Tcode {
	/// Returns `None` for tcodes this driver does not frame for transmit
	/// (e.g. isochronous stream reception tcodes that only ever arrive,
	/// never get sent from this table).
	pub fn shape(self) -> Option<TcodeShape> {
		use Tcode::*;
		let (header_len, needs_payload, z) = match self {
			ReadQuadletReq => (12, false, 2),
			WriteQuadletReq => (16, false, 2),
			WritePhy => (12, false, 2),
			ReadBlockReq => (16, false, 2),
			WriteBlockReq | Lock | Lock64 => (16, true, 3),
			WriteStream => (8, true, 3),
			WriteResponse => (12, false, 2),
			ReadQuadletResponse => (16, false, 2),
			ReadBlockResponse | ReadQuadletResponseLock => (16, true, 3),
			Cycle => return None,
		};
		Some(TcodeShape { header_len, needs_payload, z })
	}
}

/// Ack codes returned over the wire by the responder, or synthesized by
/// this driver when a send could not reach the wire at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum AckCode {
	Complete = 0x1,
	Pending = 0x2,
	Busy1X = 0x4,
	Busy2X = 0x5,
	BusyOffset = 0x6,
	DataError = 0xd,
	TypeError = 0xe,
}

/// Response codes this driver can hand an upper-layer completion
/// callback without ever touching the wire (generation mismatch, a
/// missing ack, a cancelled send, …).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RCode {
	Complete,
	ConflictError,
	DataError,
	TypeError,
	AddressError,
	/// The send predates the current bus generation.
	Generation,
	/// The hardware never posted an ack for this buffer.
	MissingAck,
	/// The send was cancelled by the caller before it reached the wire.
	Cancelled,
	/// A hardware event this driver does not otherwise recognize.
	SendError,
}

/// Translates a raw DMA transfer-status "event" field into either a
/// bare [`AckCode`] (the packet made it to the wire and got a real ack)
/// or a synthesized [`RCode`] (it didn't).
pub fn event_to_outcome(event: u16) -> Result<AckCode, RCode> {
	match event {
		0x01 => Err(RCode::MissingAck),
		0x02 => Err(RCode::Generation),
		0x03 => Err(RCode::Cancelled),
		0x10..=0x1e => {
			AckCode::try_from_primitive((event - 0x10) as u8).map_err(|_| RCode::SendError)
		}
		_ => Err(RCode::SendError),
	}
}

/// An abstract asynchronous packet as it crosses the boundary between
/// this driver and the upper-layer transaction layer. Header quadlets
/// are kept in wire order (3 or 4 of them, per tcode).
#[derive(Debug, Clone)]
pub struct Packet {
	pub destination_id: u16,
	pub source_id: u16,
	pub tlabel: u8,
	pub tcode: Tcode,
	pub header: [u32; 4],
	pub header_len: u8,
	pub payload: Vec<u8>,
	/// Physical address of `payload`, already DMA-mapped by the
	/// embedder (this crate does not own the DMA-able memory pool).
	/// `None` iff `payload` is empty.
	pub payload_phys: Option<u32>,
	pub timestamp: u16,
	pub speed: u8,
	pub generation: u8,
}

impl Packet {
	pub fn header_quadlets(&self) -> &[u32] {
		let n = (self.header_len as usize) / 4;
		&self.header[..n]
	}
}
