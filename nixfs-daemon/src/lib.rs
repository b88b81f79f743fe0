//! Client side of the Nix daemon wire protocol.
//!
//! This crate provides everything `nixfs-fuse` needs before a mount can
//! begin: a version-negotiated session with the daemon over its Unix socket,
//! the framed request/response primitives, the `query-path-info` operation
//! and the closure resolver built on top of it.
//!
//! Requests on a session are strictly sequential. The daemon interleaves a
//! stderr sub-channel with typed responses on the same stream, so a request
//! must be fully drained before the next one is written.
#![deny(missing_docs, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod client;
pub mod closure;
pub mod error;
pub mod protocol;
pub mod wire;

pub use client::{DaemonClient, PathInfo};
pub use closure::closure;
pub use error::{Error, Result};
pub use protocol::ProtocolVersion;
