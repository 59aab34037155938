//! In-memory filesystem backend.
//!
//! Two-level structure: a name table mapping rooted paths to node ids, and
//! an inode table mapping node ids to metadata. Hardlinks are two names
//! sharing one node id; rename moves names (and a directory's whole
//! subtree) without touching node ids, so QIDs derived from node identity
//! survive both.
//!
//! File contents live in a [`BlobStore`](crate::blob::BlobStore); an inode
//! holds only the blob id of its current contents.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;

use ninebox_9p::backend::{
    open_flags, Backend, BackendError, BackendResult, DirEntry, FsUsage, NodeKind, NodeStat,
};

use crate::blob::{BlobId, BlobStore, MemoryBlobStore};

const S_IFDIR: u32 = 0o040_000;
const S_IFREG: u32 = 0o100_000;
const S_IFLNK: u32 = 0o120_000;
const PERM_MASK: u32 = 0o7777;

/// Symlink chains longer than this report ELOOP.
const MAX_SYMLINK_DEPTH: usize = 8;

const ROOT_NODE: u64 = 1;

#[derive(Debug, Clone)]
struct Inode {
    kind: NodeKind,
    mode: u32,
    uid: u32,
    gid: u32,
    nlinks: u64,
    size: u64,
    atime_ms: u64,
    mtime_ms: u64,
    ctime_ms: u64,
    version: u32,
    content: Option<BlobId>,
    target: Option<String>,
}

impl Inode {
    fn file(mode: u32, now: u64) -> Self {
        Self {
            kind: NodeKind::File,
            mode: S_IFREG | (mode & PERM_MASK),
            uid: 0,
            gid: 0,
            nlinks: 1,
            size: 0,
            atime_ms: now,
            mtime_ms: now,
            ctime_ms: now,
            version: 0,
            content: None,
            target: None,
        }
    }

    fn dir(mode: u32, now: u64) -> Self {
        Self {
            kind: NodeKind::Directory,
            mode: S_IFDIR | (mode & PERM_MASK),
            nlinks: 2,
            ..Self::file(0, now)
        }
    }

    fn symlink(target: String, now: u64) -> Self {
        Self {
            kind: NodeKind::Symlink,
            mode: S_IFLNK | 0o777,
            target: Some(target),
            ..Self::file(0, now)
        }
    }

    fn stat(&self, node: u64) -> NodeStat {
        NodeStat {
            kind: self.kind,
            mode: self.mode,
            uid: self.uid,
            gid: self.gid,
            nlinks: self.nlinks,
            size: self.size,
            atime_ms: self.atime_ms,
            mtime_ms: self.mtime_ms,
            ctime_ms: self.ctime_ms,
            version: self.version,
            node,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct OpenFile {
    node: u64,
}

#[derive(Debug)]
struct FsState {
    entries: HashMap<String, u64>,
    inodes: HashMap<u64, Inode>,
    fds: HashMap<u64, OpenFile>,
    next_node: u64,
    next_fd: u64,
}

/// In-memory [`Backend`].
pub struct MemFs {
    state: Mutex<FsState>,
    blobs: Arc<dyn BlobStore>,
}

impl Default for MemFs {
    fn default() -> Self {
        Self::new()
    }
}

impl MemFs {
    /// Creates an empty tree with its own private blob store.
    #[must_use]
    pub fn new() -> Self {
        Self::with_blob_store(Arc::new(MemoryBlobStore::new()))
    }

    /// Creates an empty tree over a caller-provided blob store.
    #[must_use]
    pub fn with_blob_store(blobs: Arc<dyn BlobStore>) -> Self {
        let now = now_ms();
        let mut entries = HashMap::new();
        entries.insert("/".to_string(), ROOT_NODE);
        let mut inodes = HashMap::new();
        inodes.insert(ROOT_NODE, Inode::dir(0o755, now));

        Self {
            state: Mutex::new(FsState {
                entries,
                inodes,
                fds: HashMap::new(),
                next_node: ROOT_NODE + 1,
                next_fd: 1,
            }),
            blobs,
        }
    }

    fn lock(&self) -> MutexGuard<'_, FsState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn read_blob(&self, inode: &Inode) -> BackendResult<Vec<u8>> {
        match &inode.content {
            Some(id) => self
                .blobs
                .get(id)
                .map(|data| data.as_ref().clone())
                .ok_or(BackendError::Io),
            None => Ok(Vec::new()),
        }
    }
}

// ============================================================================
// Path and Lookup Helpers
// ============================================================================

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

fn parent_of(path: &str) -> String {
    match path.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(idx) => path[..idx].to_string(),
    }
}

fn join(base: &str, name: &str) -> String {
    if base == "/" {
        format!("/{name}")
    } else {
        format!("{base}/{name}")
    }
}

fn validate(path: &str) -> BackendResult<()> {
    if path == "/" {
        return Ok(());
    }
    if !path.starts_with('/') || path.ends_with('/') {
        return Err(BackendError::InvalidArgument);
    }
    if path.split('/').skip(1).any(str::is_empty) {
        return Err(BackendError::InvalidArgument);
    }
    Ok(())
}

impl FsState {
    fn node_at(&self, path: &str) -> BackendResult<u64> {
        self.entries
            .get(path)
            .copied()
            .ok_or(BackendError::NotFound)
    }

    fn inode(&self, node: u64) -> BackendResult<&Inode> {
        self.inodes.get(&node).ok_or(BackendError::Io)
    }

    fn inode_mut(&mut self, node: u64) -> BackendResult<&mut Inode> {
        self.inodes.get_mut(&node).ok_or(BackendError::Io)
    }

    /// Resolves a path, following a trailing symlink chain.
    fn resolve(&self, path: &str) -> BackendResult<u64> {
        let mut current = path.to_string();
        for _ in 0..MAX_SYMLINK_DEPTH {
            let node = self.node_at(&current)?;
            let inode = self.inode(node)?;
            if inode.kind != NodeKind::Symlink {
                return Ok(node);
            }
            let target = inode.target.clone().ok_or(BackendError::Io)?;
            current = if target.starts_with('/') {
                target
            } else {
                join(&parent_of(&current), &target)
            };
        }
        Err(BackendError::SymlinkLoop)
    }

    /// Checks the parent of `path` is an existing directory and `path`
    /// itself is free.
    fn check_create(&self, path: &str) -> BackendResult<()> {
        validate(path)?;
        if path == "/" || self.entries.contains_key(path) {
            return Err(BackendError::AlreadyExists);
        }
        let parent = self.node_at(&parent_of(path))?;
        if self.inode(parent)?.kind != NodeKind::Directory {
            return Err(BackendError::NotDirectory);
        }
        Ok(())
    }

    fn alloc_node(&mut self) -> u64 {
        let node = self.next_node;
        self.next_node += 1;
        node
    }

    fn insert_node(&mut self, path: &str, inode: Inode) -> u64 {
        let node = self.alloc_node();
        self.inodes.insert(node, inode);
        self.entries.insert(path.to_string(), node);
        node
    }

    fn has_children(&self, path: &str) -> bool {
        let prefix = if path == "/" {
            "/".to_string()
        } else {
            format!("{path}/")
        };
        self.entries
            .keys()
            .any(|p| p.starts_with(&prefix) && p.len() > prefix.len())
    }

    /// Drops one name for a node, releasing the inode when its last name
    /// goes away. Directories have exactly one name.
    fn drop_name(&mut self, path: &str) -> BackendResult<()> {
        let node = self
            .entries
            .remove(path)
            .ok_or(BackendError::NotFound)?;
        if let Some(inode) = self.inodes.get_mut(&node) {
            if inode.kind == NodeKind::Directory || inode.nlinks <= 1 {
                self.inodes.remove(&node);
            } else {
                inode.nlinks -= 1;
            }
        }
        Ok(())
    }
}

// ============================================================================
// Backend Implementation
// ============================================================================

#[async_trait]
impl Backend for MemFs {
    async fn stat(&self, path: &str) -> BackendResult<NodeStat> {
        validate(path)?;
        let state = self.lock();
        let node = state.resolve(path)?;
        Ok(state.inode(node)?.stat(node))
    }

    async fn lstat(&self, path: &str) -> BackendResult<NodeStat> {
        validate(path)?;
        let state = self.lock();
        let node = state.node_at(path)?;
        Ok(state.inode(node)?.stat(node))
    }

    async fn read_file(&self, path: &str) -> BackendResult<Vec<u8>> {
        validate(path)?;
        let state = self.lock();
        let node = state.resolve(path)?;
        let inode = state.inode(node)?;
        if inode.kind == NodeKind::Directory {
            return Err(BackendError::IsDirectory);
        }
        self.read_blob(inode)
    }

    async fn open(&self, path: &str, flags: u32, mode: u32) -> BackendResult<u64> {
        validate(path)?;
        let mut state = self.lock();
        let now = now_ms();

        let node = match state.resolve(path) {
            Ok(node) => {
                if flags & open_flags::CREATE != 0 && flags & open_flags::EXCL != 0 {
                    return Err(BackendError::AlreadyExists);
                }
                node
            }
            Err(BackendError::NotFound) if flags & open_flags::CREATE != 0 => {
                state.check_create(path)?;
                state.insert_node(path, Inode::file(mode, now))
            }
            Err(err) => return Err(err),
        };

        let inode = state.inode_mut(node)?;
        if inode.kind == NodeKind::Directory && flags & open_flags::ACCMODE != open_flags::RDONLY
        {
            return Err(BackendError::IsDirectory);
        }
        if flags & open_flags::TRUNC != 0 && inode.kind == NodeKind::File {
            inode.content = None;
            inode.size = 0;
            inode.mtime_ms = now;
            inode.version += 1;
        }

        let fd = state.next_fd;
        state.next_fd += 1;
        state.fds.insert(fd, OpenFile { node });
        Ok(fd)
    }

    async fn close(&self, fd: u64) -> BackendResult<()> {
        self.lock()
            .fds
            .remove(&fd)
            .map(|_| ())
            .ok_or(BackendError::BadDescriptor)
    }

    async fn write(&self, fd: u64, data: &[u8], offset: u64) -> BackendResult<u32> {
        let mut state = self.lock();
        let open = *state.fds.get(&fd).ok_or(BackendError::BadDescriptor)?;

        let contents = {
            let inode = state.inode(open.node)?;
            if inode.kind != NodeKind::File {
                return Err(BackendError::IsDirectory);
            }
            self.read_blob(inode)?
        };

        let offset = usize::try_from(offset).map_err(|_| BackendError::InvalidArgument)?;
        let mut contents = contents;
        if contents.len() < offset + data.len() {
            contents.resize(offset + data.len(), 0);
        }
        contents[offset..offset + data.len()].copy_from_slice(data);

        let size = contents.len() as u64;
        let blob = self.blobs.put(contents);
        let now = now_ms();
        let inode = state.inode_mut(open.node)?;
        inode.content = Some(blob);
        inode.size = size;
        inode.mtime_ms = now;
        inode.ctime_ms = now;
        inode.version += 1;

        u32::try_from(data.len()).map_err(|_| BackendError::InvalidArgument)
    }

    async fn readlink(&self, path: &str) -> BackendResult<String> {
        validate(path)?;
        let state = self.lock();
        let node = state.node_at(path)?;
        let inode = state.inode(node)?;
        inode
            .target
            .clone()
            .ok_or(BackendError::InvalidArgument)
    }

    async fn symlink(&self, target: &str, path: &str) -> BackendResult<()> {
        let mut state = self.lock();
        state.check_create(path)?;
        state.insert_node(path, Inode::symlink(target.to_string(), now_ms()));
        Ok(())
    }

    async fn mkdir(&self, path: &str, mode: u32) -> BackendResult<()> {
        let mut state = self.lock();
        state.check_create(path)?;
        state.insert_node(path, Inode::dir(mode, now_ms()));
        Ok(())
    }

    async fn mknod(&self, path: &str, mode: u32) -> BackendResult<()> {
        let mut state = self.lock();
        state.check_create(path)?;
        state.insert_node(path, Inode::file(mode, now_ms()));
        Ok(())
    }

    async fn link(&self, existing: &str, new_path: &str) -> BackendResult<()> {
        let mut state = self.lock();
        let node = state.node_at(existing)?;
        if state.inode(node)?.kind == NodeKind::Directory {
            return Err(BackendError::PermissionDenied);
        }
        state.check_create(new_path)?;
        state.entries.insert(new_path.to_string(), node);
        let now = now_ms();
        let inode = state.inode_mut(node)?;
        inode.nlinks += 1;
        inode.ctime_ms = now;
        Ok(())
    }

    async fn rename(&self, old: &str, new: &str) -> BackendResult<()> {
        validate(old)?;
        validate(new)?;
        let mut state = self.lock();
        let node = state.node_at(old)?;
        if old == new {
            return Ok(());
        }

        // An existing destination is replaced, POSIX-style.
        if let Ok(dest) = state.node_at(new) {
            let dest_kind = state.inode(dest)?.kind;
            let src_kind = state.inode(node)?.kind;
            match (src_kind, dest_kind) {
                (_, NodeKind::Directory) if state.has_children(new) => {
                    return Err(BackendError::NotEmpty);
                }
                (NodeKind::Directory, k) if k != NodeKind::Directory => {
                    return Err(BackendError::NotDirectory);
                }
                (k, NodeKind::Directory) if k != NodeKind::Directory => {
                    return Err(BackendError::IsDirectory);
                }
                _ => state.drop_name(new)?,
            }
        } else {
            let parent = state.node_at(&parent_of(new))?;
            if state.inode(parent)?.kind != NodeKind::Directory {
                return Err(BackendError::NotDirectory);
            }
        }

        // Move the name and, for directories, the whole subtree under it.
        state.entries.remove(old);
        state.entries.insert(new.to_string(), node);
        let old_prefix = format!("{old}/");
        let moved: Vec<(String, u64)> = state
            .entries
            .iter()
            .filter(|(p, _)| p.starts_with(&old_prefix))
            .map(|(p, n)| (p.clone(), *n))
            .collect();
        for (path, child) in moved {
            state.entries.remove(&path);
            let suffix = &path[old_prefix.len()..];
            state.entries.insert(join(new, suffix), child);
        }

        let now = now_ms();
        state.inode_mut(node)?.ctime_ms = now;
        tracing::debug!("renamed {} -> {}", old, new);
        Ok(())
    }

    async fn unlink(&self, path: &str) -> BackendResult<()> {
        validate(path)?;
        let mut state = self.lock();
        let node = state.node_at(path)?;
        if state.inode(node)?.kind == NodeKind::Directory {
            return Err(BackendError::IsDirectory);
        }
        state.drop_name(path)
    }

    async fn rmdir(&self, path: &str) -> BackendResult<()> {
        validate(path)?;
        let mut state = self.lock();
        if path == "/" {
            return Err(BackendError::Busy);
        }
        let node = state.node_at(path)?;
        if state.inode(node)?.kind != NodeKind::Directory {
            return Err(BackendError::NotDirectory);
        }
        if state.has_children(path) {
            return Err(BackendError::NotEmpty);
        }
        state.drop_name(path)
    }

    async fn chmod(&self, path: &str, mode: u32) -> BackendResult<()> {
        validate(path)?;
        let mut state = self.lock();
        let node = state.resolve(path)?;
        let now = now_ms();
        let inode = state.inode_mut(node)?;
        inode.mode = (inode.mode & !PERM_MASK) | (mode & PERM_MASK);
        inode.ctime_ms = now;
        Ok(())
    }

    async fn chown(&self, path: &str, uid: u32, gid: u32) -> BackendResult<()> {
        validate(path)?;
        let mut state = self.lock();
        // Ownership changes apply to the named node itself, never a
        // symlink target.
        let node = state.node_at(path)?;
        let now = now_ms();
        let inode = state.inode_mut(node)?;
        inode.uid = uid;
        inode.gid = gid;
        inode.ctime_ms = now;
        Ok(())
    }

    async fn utimes(&self, path: &str, atime_ms: u64, mtime_ms: u64) -> BackendResult<()> {
        validate(path)?;
        let mut state = self.lock();
        let node = state.resolve(path)?;
        let now = now_ms();
        let inode = state.inode_mut(node)?;
        inode.atime_ms = atime_ms;
        inode.mtime_ms = mtime_ms;
        inode.ctime_ms = now;
        Ok(())
    }

    async fn truncate(&self, path: &str, size: u64) -> BackendResult<()> {
        validate(path)?;
        let mut state = self.lock();
        let node = state.resolve(path)?;

        let mut contents = {
            let inode = state.inode(node)?;
            if inode.kind != NodeKind::File {
                return Err(BackendError::IsDirectory);
            }
            self.read_blob(inode)?
        };
        let new_len = usize::try_from(size).map_err(|_| BackendError::InvalidArgument)?;
        contents.resize(new_len, 0);

        let blob = self.blobs.put(contents);
        let now = now_ms();
        let inode = state.inode_mut(node)?;
        inode.content = Some(blob);
        inode.size = size;
        inode.mtime_ms = now;
        inode.ctime_ms = now;
        inode.version += 1;
        Ok(())
    }

    async fn fsync(&self, path: &str) -> BackendResult<()> {
        // Nothing to flush; validate the path so a bogus fsync still errors.
        validate(path)?;
        let state = self.lock();
        state.node_at(path).map(|_| ())
    }

    async fn list(&self, path: &str) -> BackendResult<Vec<DirEntry>> {
        validate(path)?;
        let state = self.lock();
        let node = state.resolve(path)?;
        if state.inode(node)?.kind != NodeKind::Directory {
            return Err(BackendError::NotDirectory);
        }

        let prefix = if path == "/" {
            "/".to_string()
        } else {
            format!("{path}/")
        };
        let mut entries: Vec<DirEntry> = state
            .entries
            .iter()
            .filter(|(p, _)| {
                p.starts_with(&prefix)
                    && p.len() > prefix.len()
                    && !p[prefix.len()..].contains('/')
            })
            .filter_map(|(p, n)| {
                state.inodes.get(n).map(|inode| DirEntry {
                    name: p[prefix.len()..].to_string(),
                    stat: inode.stat(*n),
                })
            })
            .collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    async fn statfs(&self) -> BackendResult<FsUsage> {
        let state = self.lock();
        let files = state.inodes.len() as u64;
        Ok(FsUsage {
            files,
            ffree: 1_000_000_u64.saturating_sub(files),
            ..FsUsage::default()
        })
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn root_exists_and_is_a_directory() {
        let fs = MemFs::new();
        let stat = fs.stat("/").await.unwrap();
        assert_eq!(stat.kind, NodeKind::Directory);
        assert_eq!(stat.mode & PERM_MASK, 0o755);
        assert_eq!(stat.node, ROOT_NODE);
    }

    #[tokio::test]
    async fn create_write_read_roundtrip() {
        let fs = MemFs::new();
        let fd = fs
            .open("/f", open_flags::CREATE | open_flags::WRONLY, 0o644)
            .await
            .unwrap();
        assert_eq!(fs.write(fd, b"hello", 0).await.unwrap(), 5);
        fs.close(fd).await.unwrap();

        assert_eq!(fs.read_file("/f").await.unwrap(), b"hello");
        let stat = fs.stat("/f").await.unwrap();
        assert_eq!(stat.size, 5);
        assert_eq!(stat.mode & PERM_MASK, 0o644);
    }

    #[tokio::test]
    async fn write_at_offset_zero_fills_gap() {
        let fs = MemFs::new();
        let fd = fs
            .open("/g", open_flags::CREATE | open_flags::WRONLY, 0o644)
            .await
            .unwrap();
        fs.write(fd, b"ab", 4).await.unwrap();
        fs.close(fd).await.unwrap();

        assert_eq!(fs.read_file("/g").await.unwrap(), b"\0\0\0\0ab");
    }

    #[tokio::test]
    async fn rename_preserves_node_identity() {
        let fs = MemFs::new();
        fs.mknod("/a", 0o644).await.unwrap();
        let before = fs.stat("/a").await.unwrap();

        fs.rename("/a", "/b").await.unwrap();
        let after = fs.stat("/b").await.unwrap();
        assert_eq!(before.node, after.node);
        assert!(fs.stat("/a").await.is_err());
    }

    #[tokio::test]
    async fn rename_moves_directory_subtree() {
        let fs = MemFs::new();
        fs.mkdir("/d", 0o755).await.unwrap();
        fs.mknod("/d/inner", 0o644).await.unwrap();

        fs.rename("/d", "/e").await.unwrap();
        assert!(fs.stat("/e/inner").await.is_ok());
        assert!(fs.stat("/d/inner").await.is_err());
    }

    #[tokio::test]
    async fn hardlinks_share_node_and_contents() {
        let fs = MemFs::new();
        let fd = fs
            .open("/orig", open_flags::CREATE | open_flags::WRONLY, 0o644)
            .await
            .unwrap();
        fs.write(fd, b"shared", 0).await.unwrap();
        fs.close(fd).await.unwrap();

        fs.link("/orig", "/alias").await.unwrap();
        let a = fs.stat("/orig").await.unwrap();
        let b = fs.stat("/alias").await.unwrap();
        assert_eq!(a.node, b.node);
        assert_eq!(a.nlinks, 2);
        assert_eq!(fs.read_file("/alias").await.unwrap(), b"shared");

        fs.unlink("/orig").await.unwrap();
        assert_eq!(fs.stat("/alias").await.unwrap().nlinks, 1);
        assert_eq!(fs.read_file("/alias").await.unwrap(), b"shared");
    }

    #[tokio::test]
    async fn rmdir_refuses_non_empty_directories() {
        let fs = MemFs::new();
        fs.mkdir("/d", 0o755).await.unwrap();
        fs.mknod("/d/f", 0o644).await.unwrap();
        assert_eq!(fs.rmdir("/d").await.unwrap_err(), BackendError::NotEmpty);

        fs.unlink("/d/f").await.unwrap();
        fs.rmdir("/d").await.unwrap();
        assert!(fs.stat("/d").await.is_err());
    }

    #[tokio::test]
    async fn symlinks_resolve_on_stat_but_not_lstat() {
        let fs = MemFs::new();
        fs.mknod("/real", 0o644).await.unwrap();
        fs.symlink("/real", "/ln").await.unwrap();

        assert_eq!(fs.stat("/ln").await.unwrap().kind, NodeKind::File);
        assert_eq!(fs.lstat("/ln").await.unwrap().kind, NodeKind::Symlink);
        assert_eq!(fs.readlink("/ln").await.unwrap(), "/real");
    }

    #[tokio::test]
    async fn relative_symlink_targets_resolve_against_their_directory() {
        let fs = MemFs::new();
        fs.mkdir("/d", 0o755).await.unwrap();
        fs.mknod("/d/real", 0o644).await.unwrap();
        fs.symlink("real", "/d/ln").await.unwrap();

        let stat = fs.stat("/d/ln").await.unwrap();
        assert_eq!(stat.kind, NodeKind::File);
    }

    #[tokio::test]
    async fn symlink_cycles_report_eloop() {
        let fs = MemFs::new();
        fs.symlink("/b", "/a").await.unwrap();
        fs.symlink("/a", "/b").await.unwrap();
        assert_eq!(fs.stat("/a").await.unwrap_err(), BackendError::SymlinkLoop);
    }

    #[tokio::test]
    async fn list_returns_direct_children_only() {
        let fs = MemFs::new();
        fs.mkdir("/d", 0o755).await.unwrap();
        fs.mknod("/d/f", 0o644).await.unwrap();
        fs.mknod("/top", 0o644).await.unwrap();

        let names: Vec<String> = fs
            .list("/")
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names, vec!["d", "top"]);
    }

    #[tokio::test]
    async fn truncate_grows_and_shrinks() {
        let fs = MemFs::new();
        let fd = fs
            .open("/t", open_flags::CREATE | open_flags::WRONLY, 0o644)
            .await
            .unwrap();
        fs.write(fd, b"123456", 0).await.unwrap();
        fs.close(fd).await.unwrap();

        fs.truncate("/t", 3).await.unwrap();
        assert_eq!(fs.read_file("/t").await.unwrap(), b"123");

        fs.truncate("/t", 5).await.unwrap();
        assert_eq!(fs.read_file("/t").await.unwrap(), b"123\0\0");
    }

    #[tokio::test]
    async fn version_bumps_on_every_mutation() {
        let fs = MemFs::new();
        fs.mknod("/v", 0o644).await.unwrap();
        let v0 = fs.stat("/v").await.unwrap().version;

        let fd = fs.open("/v", open_flags::WRONLY, 0).await.unwrap();
        fs.write(fd, b"x", 0).await.unwrap();
        fs.close(fd).await.unwrap();
        let v1 = fs.stat("/v").await.unwrap().version;
        assert!(v1 > v0);
    }

    #[tokio::test]
    async fn open_excl_fails_on_existing_file() {
        let fs = MemFs::new();
        fs.mknod("/x", 0o644).await.unwrap();
        let err = fs
            .open(
                "/x",
                open_flags::CREATE | open_flags::EXCL | open_flags::WRONLY,
                0o644,
            )
            .await
            .unwrap_err();
        assert_eq!(err, BackendError::AlreadyExists);
    }

    #[tokio::test]
    async fn identical_files_share_blob_storage() {
        let blobs = Arc::new(MemoryBlobStore::new());
        let fs = MemFs::with_blob_store(Arc::clone(&blobs) as Arc<dyn BlobStore>);

        for path in ["/one", "/two"] {
            let fd = fs
                .open(path, open_flags::CREATE | open_flags::WRONLY, 0o644)
                .await
                .unwrap();
            fs.write(fd, b"same bytes", 0).await.unwrap();
            fs.close(fd).await.unwrap();
        }
        assert_eq!(blobs.count(), 1);
    }

    #[tokio::test]
    async fn statfs_reports_inode_usage() {
        let fs = MemFs::new();
        fs.mknod("/a", 0o644).await.unwrap();
        let usage = fs.statfs().await.unwrap();
        assert_eq!(usage.files, 2); // root + /a
        assert_eq!(usage.ffree, 1_000_000 - 2);
    }
}
