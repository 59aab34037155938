//! FID table.
//!
//! FIDs are client-chosen 32-bit handles to filesystem entities. The table
//! is a plain handle arena: no aliasing, no pointer graph, recycled only
//! after `Tclunk`.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Sentinel meaning "no fid" (used by `Tattach` for the auth fid).
pub const NOFID: u32 = 0xFFFF_FFFF;

/// What a fid refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FidKind {
    /// A filesystem node.
    Inode,
    /// An extended-attribute handle (stub).
    Xattr,
    /// A handle bound by `Txattrwalk` that carries no data.
    None,
}

/// Record bound to a fid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FidRecord {
    /// Absolute path in the backend namespace.
    pub path: String,
    /// Handle kind.
    pub kind: FidKind,
    /// Numeric uid of the attaching user.
    pub uid: u32,
}

impl FidRecord {
    /// Creates an inode record.
    #[must_use]
    pub fn inode(path: impl Into<String>, uid: u32) -> Self {
        Self {
            path: path.into(),
            kind: FidKind::Inode,
            uid,
        }
    }
}

/// Mapping from fid to record.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct FidTable {
    entries: HashMap<u32, FidRecord>,
}

impl FidTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `fid` to `record`, replacing any previous binding.
    pub fn insert(&mut self, fid: u32, record: FidRecord) {
        self.entries.insert(fid, record);
    }

    /// Looks up a fid. `None` maps to `EBADF` at the dispatcher.
    #[must_use]
    pub fn get(&self, fid: u32) -> Option<&FidRecord> {
        self.entries.get(&fid)
    }

    /// Mutable lookup.
    pub fn get_mut(&mut self, fid: u32) -> Option<&mut FidRecord> {
        self.entries.get_mut(&fid)
    }

    /// Drops a fid (`Tclunk`).
    pub fn remove(&mut self, fid: u32) -> Option<FidRecord> {
        self.entries.remove(&fid)
    }

    /// Drops every fid (`Tversion`).
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Number of live fids.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if no fids are bound.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
