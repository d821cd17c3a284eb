//! SPN Core Library
//!
//! This crate provides the types shared by every layer of the SPN data
//! plane: error kinds that travel on the wire, varint framing helpers,
//! hub identities and the Wire-V1 session format.
//!
//! # Modules
//!
//! - [`error`]: Error kinds, packing and unpacking
//! - [`varint`]: Unsigned LEB128 varints and length-delimited blocks
//! - [`canonical`]: Deterministic postcard encoding of structured blobs
//! - [`hub`]: Hub identifiers, announcements, status and the hub cache
//! - [`identity`]: The local private identity of a hub
//! - [`jess`]: Wire-V1 authenticated encryption sessions

pub mod canonical;
pub mod error;
pub mod hub;
pub mod identity;
pub mod jess;
pub mod varint;

pub use error::{Error, ErrorKind, Result};
pub use hub::{Announcement, ExchangeKey, Hub, HubCache, HubId, HubInfoImporter, Status};
pub use identity::Identity;
