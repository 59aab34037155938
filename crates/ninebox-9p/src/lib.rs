//! # ninebox-9p
//!
//! Server-side 9P2000.L protocol core.
//!
//! This crate decodes 9P request frames, executes the corresponding
//! operations against a pluggable async [`Backend`], and encodes reply
//! frames for the transport. It owns the protocol state machine — fid
//! lifecycle, in-flight tags and cancellation, QID identity, attribute
//! fan-out and partial read/write framing — and nothing else: the virtio
//! transport lives in `ninebox-virtio`, backends in `ninebox-fs`.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────┐
//! │                   ninebox-9p                     │
//! │                                                  │
//! │  frame ──► Dispatcher ──► handler ──► Backend    │
//! │              │   ▲                    (async)    │
//! │              ▼   │ completion window             │
//! │         ┌─────────────┐                          │
//! │         │   Session   │  msize · fids · tags     │
//! │         │ reply buffer│  (2 × msize bytes)       │
//! │         └──────┬──────┘                          │
//! │                ▼                                 │
//! │           ReplySink ──► transport                │
//! └──────────────────────────────────────────────────┘
//! ```
//!
//! Requests may be cancelled mid-flight by `Tflush`; handlers observe this
//! through the tag registry and never touch the reply buffer afterwards.

#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod backend;
pub mod dispatcher;
pub mod error;
pub mod fid;
pub mod qid;
pub mod session;
pub mod tag;
pub mod wire;

pub use backend::{Backend, BackendError, BackendResult, DirEntry, FsUsage, NodeKind, NodeStat};
pub use dispatcher::{Dispatcher, NinepConfig, Reply, ReplySink};
pub use error::{NinepError, Result};
pub use fid::{FidKind, FidRecord, FidTable, NOFID};
pub use qid::Qid;
pub use session::{SessionSnapshot, BLOCKSIZE, DEFAULT_MSIZE, HEADER_SIZE, PROTOCOL_VERSION};
pub use tag::{TagRegistry, NOTAG};
