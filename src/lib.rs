//! `ohci1394`: a DMA context engine and bus-reset state machine for an
//! OHCI-1394 (IEEE 1394) host controller.
//!
//! [`unit::Unit`] is the crate's single entry point: it owns the
//! register gateway, the four mandatory AT/AR contexts, an isochronous
//! receive context per channel, the bus-reset worker, and the
//! split-timeout worker, and wires them together with one OS thread per
//! context (see [`sync`]). Everything above the wire format — framing a
//! request, building a topology from self-ID streams, deciding when a
//! transaction has timed out — is the caller's [`upcalls::TransactionLayer`]
//! and [`upcalls::TopologyBuilder`]; this crate only drives the hardware.

pub mod ar;
pub mod at;
pub mod busreset;
pub mod config;
pub mod context;
pub mod csr;
pub mod descriptor;
pub mod error;
pub mod ir;
pub mod irq;
pub mod packet;
pub mod pool;
pub mod regs;
pub mod stats;
pub mod sync;
pub mod time;
pub mod timeout;
pub mod unit;
pub mod upcalls;

pub use ar::{ArContext, ArDirection, Upcall, UpcallRequest, UpcallResponse};
pub use at::{AckCallback, AtContext, AtDirection};
pub use busreset::{BusResetCallbacks, BusResetOutcome, BusResetWorker};
pub use config::{Priorities, UnitConfig};
pub use context::{ContextBase, ContextControlBits, ContextRegs};
pub use descriptor::{ControlBits, Descriptor};
pub use error::{DriverError, Result};
pub use ir::{DrainOutcome, IrCallback, IrContext};
pub use irq::{DispatchTargets, IntEvent};
pub use packet::{AckCode, Packet, RCode, Tcode, TcodeShape};
pub use regs::{offset, RawWindow, Registers};
pub use stats::{Stats, StatsSnapshot};
pub use sync::{Signal, Wake, Worker};
pub use timeout::{TimeoutQueue, TransactionKey};
pub use unit::{Unit, UnitLayout};
pub use upcalls::{TopologyBuilder, Transaction, TransactionLayer};
