//! Networking layer of the SPN data plane
//!
//! This crate provides:
//! - Ships: byte-stream transports (TCP, in-memory pairs for tests)
//! - Cranes: shipment framing, padding and encryption over one ship
//! - Terminals: flow-controlled logical channels multiplexed on a crane
//! - Operations: expansion, gossip, lane measurements and publishing

pub mod config;
pub mod crane;
pub mod dock;
pub mod msg;
pub mod ops;
pub mod shipment;
pub mod ships;
pub mod terminal;

pub use config::NetConfig;
pub use crane::{Crane, CraneRegistry, RuntimeInfo};
pub use dock::{CraneEvent, Dock};
pub use msg::{Msg, MsgType, Upstream};
pub use ships::{Ship, TcpShip, TestShip, TestShipOptions};
pub use terminal::{
    DuplexFlowQueue, Operation, OperationFactory, OperationRegistry, Permission, Terminal,
    TerminalInterface, TerminalOpts,
};
