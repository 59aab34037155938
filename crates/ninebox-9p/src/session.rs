//! Session state: negotiated msize, fid table, tag registry, reply buffer.
//!
//! The reply buffer is a single contiguous region of `2 × msize` bytes.
//! Handlers marshal reply bodies at offset 7; [`Session::build_reply`]
//! backfills the `size[4] type[1] tag[2]` header at offset 0 and releases
//! the tag.

use serde::{Deserialize, Serialize};

use crate::fid::FidTable;
use crate::tag::TagRegistry;

/// Default and initial maximum message size, header included.
pub const DEFAULT_MSIZE: u32 = 8192;

/// Filesystem block size reported by `Tgetattr`/`Tstatfs`.
pub const BLOCKSIZE: u32 = 8192;

/// The only protocol variant spoken.
pub const PROTOCOL_VERSION: &str = "9P2000.L";

/// Size of the `size[4] type[1] tag[2]` frame header.
pub const HEADER_SIZE: usize = 7;

/// Mutable per-connection state owned by the dispatcher.
#[derive(Debug)]
pub struct Session {
    /// Negotiated maximum message size.
    pub msize: u32,
    /// Live fid bindings.
    pub fids: FidTable,
    /// In-flight request tags.
    pub tags: TagRegistry,
    reply_buf: Vec<u8>,
    reply_len: usize,
}

impl Session {
    /// Creates a session with the given msize.
    #[must_use]
    pub fn new(msize: u32) -> Self {
        Self {
            msize,
            fids: FidTable::new(),
            tags: TagRegistry::new(),
            reply_buf: vec![0u8; msize as usize * 2],
            reply_len: 0,
        }
    }

    /// Applies a newly negotiated msize, re-sizing the reply buffer.
    pub fn set_msize(&mut self, msize: u32) {
        self.msize = msize;
        self.reply_buf = vec![0u8; msize as usize * 2];
        self.reply_len = 0;
    }

    /// The body region of the reply buffer (offset 7 onward).
    pub fn body_mut(&mut self) -> &mut [u8] {
        &mut self.reply_buf[HEADER_SIZE..]
    }

    /// Writes the reply header for a `body_len`-byte body and releases the
    /// tag. After this call [`Self::reply_frame`] covers exactly
    /// `body_len + 7` bytes.
    #[allow(clippy::cast_possible_truncation)] // total is bounded by 2 * msize
    pub fn build_reply(&mut self, id: u8, tag: u16, body_len: usize) {
        let total = body_len + HEADER_SIZE;
        let size = total as u32;
        self.reply_buf[0..4].copy_from_slice(&size.to_le_bytes());
        self.reply_buf[4] = id;
        self.reply_buf[5..7].copy_from_slice(&tag.to_le_bytes());
        self.reply_len = total;
        self.tags.complete(tag);
    }

    /// The assembled reply frame.
    #[must_use]
    pub fn reply_frame(&self) -> &[u8] {
        &self.reply_buf[..self.reply_len]
    }

    /// Occupied length of the reply buffer.
    #[must_use]
    pub const fn reply_len(&self) -> usize {
        self.reply_len
    }

    /// Captures the restorable session state.
    #[must_use]
    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            version: PROTOCOL_VERSION.to_string(),
            msize: self.msize,
            blocksize: BLOCKSIZE,
            reply_buffer: self.reply_buf.clone(),
            reply_len: self.reply_len,
            fids: self.fids.clone(),
        }
    }

    /// Rebuilds a session from a snapshot. In-flight tags do not survive a
    /// snapshot; the registry starts empty.
    #[must_use]
    pub fn restore(snapshot: SessionSnapshot) -> Self {
        Self {
            msize: snapshot.msize,
            fids: snapshot.fids,
            tags: TagRegistry::new(),
            reply_buf: snapshot.reply_buffer,
            reply_len: snapshot.reply_len,
        }
    }
}

/// Serializable session state for save/restore.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSnapshot {
    /// Protocol version string.
    pub version: String,
    /// Negotiated msize.
    pub msize: u32,
    /// Block size constant.
    pub blocksize: u32,
    /// Reply buffer contents.
    pub reply_buffer: Vec<u8>,
    /// Occupied reply-buffer length.
    pub reply_len: usize,
    /// Fid table.
    pub fids: FidTable,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fid::FidRecord;

    #[test]
    fn build_reply_writes_header_and_length() {
        let mut session = Session::new(DEFAULT_MSIZE);
        session.tags.register(5);

        let body = [0xaa, 0xbb, 0xcc];
        session.body_mut()[..3].copy_from_slice(&body);
        session.build_reply(101, 5, body.len());

        let frame = session.reply_frame();
        assert_eq!(frame.len(), body.len() + HEADER_SIZE);
        assert_eq!(session.reply_len(), body.len() + HEADER_SIZE);
        assert_eq!(u32::from_le_bytes(frame[0..4].try_into().unwrap()), 10);
        assert_eq!(frame[4], 101);
        assert_eq!(u16::from_le_bytes(frame[5..7].try_into().unwrap()), 5);
        assert_eq!(&frame[7..], &body);
    }

    #[test]
    fn build_reply_releases_the_tag() {
        let mut session = Session::new(DEFAULT_MSIZE);
        session.tags.register(9);
        session.build_reply(101, 9, 0);
        assert!(session.tags.should_abort(9));
    }

    #[test]
    fn reply_buffer_is_twice_msize() {
        let mut session = Session::new(100);
        assert_eq!(session.body_mut().len(), 200 - HEADER_SIZE);
        session.set_msize(4096);
        assert_eq!(session.body_mut().len(), 8192 - HEADER_SIZE);
    }

    #[test]
    fn snapshot_roundtrip_preserves_fids_and_buffer() {
        let mut session = Session::new(DEFAULT_MSIZE);
        session.fids.insert(0, FidRecord::inode("/", 1000));
        session.tags.register(1);
        session.body_mut()[0] = 0x42;
        session.build_reply(101, 1, 1);

        let snapshot = session.snapshot();
        assert_eq!(snapshot.version, PROTOCOL_VERSION);
        assert_eq!(snapshot.blocksize, BLOCKSIZE);

        let restored = Session::restore(snapshot);
        assert_eq!(restored.msize, DEFAULT_MSIZE);
        assert_eq!(restored.fids.get(0).unwrap().path, "/");
        assert_eq!(restored.reply_frame(), session.reply_frame());
    }
}
