#![forbid(unsafe_code)]

//! BPAK is a container format for distributing signed firmware and system
//! images. An archive is a fixed-size header followed by aligned payload
//! *parts*; typed *metadata* entries live inside the header. The archive
//! carries its own payload hash and a signature over the header, and can be
//! re-encoded for transport, replacing parts with compressed images or
//! binary deltas against an origin archive. A salted hash tree provides
//! authenticated random-access verification of individual payload blocks.

pub mod compression;
pub mod crypto;
pub mod error;
pub mod header;
pub mod id;
pub mod merkle;
pub mod meta;
pub mod package;
pub mod transport;

pub use error::{Error, Result};
pub use header::{Header, HeaderLocation, MetaHeader, PartHeader};
pub use package::{OpenMode, Package};
