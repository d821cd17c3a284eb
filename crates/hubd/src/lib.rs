//! hubd - SPN hub daemon
//!
//! This daemon provides:
//! - A TCP listener that runs a crane on every accepted connection
//! - Cranes to bootstrap hubs, published and gossiping
//! - Periodic exchange key rotation and lane measurements

pub mod config;
pub mod server;

pub use config::Config;
pub use server::Server;
