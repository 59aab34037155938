//! # ninebox-fs
//!
//! Filesystem backends for ninebox.
//!
//! This crate provides the in-process side of the 9P bridge:
//!
//! - [`MemFs`]: an in-memory POSIX-style tree implementing the
//!   [`Backend`](ninebox_9p::Backend) trait the dispatcher drives.
//! - [`BlobStore`]: content-addressed storage (sha256 → bytes) that file
//!   contents live in, with [`MemoryBlobStore`] as the default
//!   implementation.
//!
//! Node identity is stable across renames and shared by hardlinks, which
//! is what gives the protocol layer its QID guarantees.

#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod blob;
pub mod memfs;

pub use blob::{BlobId, BlobStore, MemoryBlobStore};
pub use memfs::MemFs;
