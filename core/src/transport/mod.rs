// Transport module: protocol adapters and drivers

pub mod abstraction;
mod adapter;
mod driver;
pub mod memory;
pub mod tcp;

pub use abstraction::{
    InboundSink, Protocol, ReceivedTransfer, TransferId, TransferIds, TransferReport,
    TransferStatus, TransportError,
};
pub use adapter::{AdapterEvent, AdapterState, TransportAdapter};
pub use driver::TransportDriver;
pub use memory::{MemoryDriver, MemoryNetwork};
pub use tcp::{TcpDriver, TcpDriverConfig};
