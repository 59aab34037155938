//! QID derivation.
//!
//! A QID is the server-assigned 13-byte identity of a filesystem node.
//! Derivation is pure: the same backend node identity always yields the
//! same QID, so renames preserve identity and two fids pointing at one
//! hardlinked node compare equal.

use serde::{Deserialize, Serialize};

use crate::backend::{NodeKind, NodeStat};

/// QID type bits.
pub mod kind {
    /// Directory.
    pub const DIR: u8 = 0x80;
    /// Append-only file.
    pub const APPEND: u8 = 0x40;
    /// Exclusive-use file.
    pub const EXCL: u8 = 0x20;
    /// Mount point.
    pub const MOUNT: u8 = 0x10;
    /// Authentication file.
    pub const AUTH: u8 = 0x08;
    /// Temporary file.
    pub const TMP: u8 = 0x04;
    /// Symbolic link.
    pub const SYMLINK: u8 = 0x02;
    /// Hard link.
    pub const LINK: u8 = 0x01;
    /// Plain file.
    pub const FILE: u8 = 0x00;
}

/// A 13-byte QID: `type[1] version[4] path[8]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Qid {
    /// Type bitmask (see [`kind`]).
    pub kind: u8,
    /// Backend-provided monotonic file version.
    pub version: u32,
    /// Stable hash of the backend node identity, zero-extended to 64 bits.
    pub path: u64,
}

impl Qid {
    /// Encoded size on the wire.
    pub const WIRE_SIZE: usize = 13;

    /// Derives the QID for a backend node.
    ///
    /// `path` is a 32-bit FNV-1a hash of the node id; two QIDs collide iff
    /// the node ids hash-collide.
    #[must_use]
    pub fn for_node(node: u64, version: u32, type_bits: u8) -> Self {
        Self {
            kind: type_bits,
            version,
            path: u64::from(hash32(&node.to_le_bytes())),
        }
    }

    /// Derives the QID for a stat result.
    #[must_use]
    pub fn from_stat(stat: &NodeStat) -> Self {
        let type_bits = match stat.kind {
            NodeKind::Directory => kind::DIR,
            NodeKind::Symlink => kind::SYMLINK,
            NodeKind::File => kind::FILE,
        };
        Self::for_node(stat.node, stat.version, type_bits)
    }

    /// True if the DIR type bit is set.
    #[must_use]
    pub const fn is_dir(&self) -> bool {
        self.kind & kind::DIR != 0
    }
}

/// 32-bit FNV-1a.
fn hash32(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for &b in bytes {
        hash ^= u32::from(b);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}
