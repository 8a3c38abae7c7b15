//! Error kinds surfaced by the DMA context engine and bus-reset state
//! machine.
//!
//! Per the propagation policy: errors raised *inside* a worker loop are
//! logged and converted to an ack/rcode value handed to the upper layer
//! (see [`crate::packet::AckCode`] and [`crate::packet::RCode`]); they
//! never unwind the worker. Only [`DriverError`] variants that represent
//! a genuinely fatal or caller-facing condition escape a worker.

use thiserror::Error;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum DriverError {
	/// `PHY_CONTROL.RD_REG` never cleared for the local PHY register read.
	#[error("phy register access is already in progress")]
	PhyBusy,
	/// Polling `PHY_CONTROL.RD_REG` exceeded the retry budget.
	#[error("phy register read timed out")]
	PhyReadTimeout,
	/// The address echoed back by the PHY read did not match the request.
	#[error("phy register read returned the wrong address")]
	PhyAddrMismatch,
	/// The PHY did not acknowledge the write within the retry budget.
	#[error("phy register write timed out")]
	PhyWriteTimeout,
	/// An AT context's buffer pool is empty.
	#[error("no free AT buffers in context pool")]
	UnitBusy,
	/// A fixed-size pool (AT buffers, IR contexts) has no capacity left.
	#[error("no memory available for this allocation")]
	NoMem,
	/// `UnrecoverableError` was latched by the IRQ dispatcher or the
	/// bus-reset worker exhausted its retry budget.
	#[error("unit has entered the unrecoverable error state")]
	UnrecoverableError,
	/// `RegAccessFail` event bit.
	#[error("register access failed")]
	RegAccessFail,
	/// `PostedWriteErr` event bit.
	#[error("a posted write failed")]
	PostedWriteErr,
	/// Self-ID buffer failed the complement check or the generation
	/// double-read did not agree.
	#[error("self-ID buffer failed validation")]
	SelfIdInvalid,
	/// [`crate::context::stop`] polled `ACTIVE` past its retry budget.
	#[error("context did not quiesce within the poll budget")]
	ContextStopTimeout,
	/// [`crate::unit::Unit::set_rom`] was called while a previous update
	/// has not yet been committed at a bus-reset.
	#[error("a config-ROM update is already pending")]
	RomUpdatePending,
	/// An operation this driver core deliberately does not support
	/// (broadcast writes, full isochronous transmit, …).
	#[error("{0} is not implemented by this driver core")]
	Unimplemented(&'static str),
}

pub type Result<T> = core::result::Result<T, DriverError>;
