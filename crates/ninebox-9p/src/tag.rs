//! Tag registry.
//!
//! Every in-flight request occupies one tag slot. A `Tflush` removes the
//! slot while the original handler may still be suspended in backend I/O;
//! the handler observes this through [`TagRegistry::should_abort`] and
//! suppresses its reply.
//!
//! Each tag also carries scratch space for read-amplified buffers. The
//! scratch outlives the reply on purpose: clients chunk large reads by
//! re-issuing `Tread`/`Treaddir` under the same tag value, and the cached
//! buffer lets the whole sequence cost one backend fetch. Only `Tflush`
//! (or a session reset) discards it.

use std::collections::HashMap;
use std::sync::Arc;

/// Tag reserved for `Tversion`.
pub const NOTAG: u16 = 0xFFFF;

/// A buffer cached for the path it was built from.
#[derive(Debug, Clone)]
pub struct CachedBuffer {
    /// Path the buffer was fetched or serialized for.
    pub path: String,
    /// Buffer contents.
    pub data: Arc<Vec<u8>>,
}

impl CachedBuffer {
    /// Creates a cache entry.
    #[must_use]
    pub fn new(path: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            path: path.into(),
            data: Arc::new(data),
        }
    }
}

/// Per-tag scratch state.
#[derive(Debug, Clone, Default)]
pub struct TagScratch {
    /// Whole-file cache for chunked `Tread`.
    pub read_cache: Option<CachedBuffer>,
    /// Serialized directory buffer for chunked `Treaddir`.
    pub dir_cache: Option<CachedBuffer>,
}

#[derive(Debug, Default)]
struct TagEntry {
    in_flight: bool,
    scratch: TagScratch,
}

/// Registry of request tags.
#[derive(Debug, Default)]
pub struct TagRegistry {
    entries: HashMap<u16, TagEntry>,
}

impl TagRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks `tag` in flight. Scratch from an earlier request under the
    /// same tag value is retained.
    pub fn register(&mut self, tag: u16) {
        self.entries.entry(tag).or_default().in_flight = true;
    }

    /// True if no reply may be written for `tag` (it was flushed, or was
    /// never registered).
    #[must_use]
    pub fn should_abort(&self, tag: u16) -> bool {
        !self.entries.get(&tag).is_some_and(|e| e.in_flight)
    }

    /// Records that the reply for `tag` was sent. The scratch stays.
    pub fn complete(&mut self, tag: u16) {
        if let Some(entry) = self.entries.get_mut(&tag) {
            entry.in_flight = false;
        }
    }

    /// Removes `tag` and its scratch (`Tflush`).
    pub fn flush(&mut self, tag: u16) {
        self.entries.remove(&tag);
    }

    /// Scratch access for a live tag.
    pub fn scratch_mut(&mut self, tag: u16) -> Option<&mut TagScratch> {
        self.entries.get_mut(&tag).map(|e| &mut e.scratch)
    }

    /// Read-only scratch access.
    #[must_use]
    pub fn scratch(&self, tag: u16) -> Option<&TagScratch> {
        self.entries.get(&tag).map(|e| &e.scratch)
    }

    /// Drops every tag.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
