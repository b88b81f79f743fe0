//! Read-only FUSE view of a Nix store filtered to one closure.
//!
//! The pieces compose bottom-up: [`AccessPolicy`] answers membership queries
//! against the resolved closure, [`FilteredDirStream`] applies it to
//! directory listings at the store root, [`Overlay`] guards every
//! path-revealing operation and refuses all mutation, and [`NixFs`] adapts
//! the result to the kernel via `fuser`. The real syscalls live behind the
//! [`PassthroughNode`] trait, so everything above it can be exercised
//! without a kernel mount.

#![deny(rust_2018_idioms)]

pub mod dirstream;
pub mod fs;
pub mod loopback;
pub mod node;
pub mod policy;

pub use dirstream::FilteredDirStream;
pub use fs::{mount, NixFs};
pub use loopback::LoopbackNode;
pub use node::{DirEntry, Errno, FileHandle, Overlay, PassthroughNode, RawDirStream};
pub use policy::AccessPolicy;
