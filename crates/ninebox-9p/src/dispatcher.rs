//! 9P2000.L request dispatcher.
//!
//! This module parses request frames and routes them to per-message
//! handlers. It is the bridge between the raw wire protocol and the
//! pluggable [`Backend`].
//!
//! Every handler runs the same shape: unmarshal its body, perform backend
//! work (suspending at each call), then enter the completion window — take
//! the session lock, check the tag is still live, marshal the reply body at
//! offset 7 of the reply buffer, backfill the header, and hand the frame to
//! the [`ReplySink`]. A request flushed by `Tflush` while suspended is
//! dropped silently; the client has already been promised, by `Rflush`,
//! that no reply is coming.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::backend::{errno, open_flags, Backend, BackendError, DirEntry, NodeStat};
use crate::error::{NinepError, Result};
use crate::fid::{FidKind, FidRecord};
use crate::qid::Qid;
use crate::session::{Session, SessionSnapshot, BLOCKSIZE, DEFAULT_MSIZE};
use crate::wire::{self, ByteSource, Field, SliceSource, WireError};

/// 9P2000.L message type ids. Replies are request id + 1.
pub mod msg {
    /// Rlerror, the only error reply.
    pub const RLERROR: u8 = 7;
    /// Tstatfs.
    pub const TSTATFS: u8 = 8;
    /// Tlopen.
    pub const TLOPEN: u8 = 12;
    /// Tlcreate.
    pub const TLCREATE: u8 = 14;
    /// Tsymlink.
    pub const TSYMLINK: u8 = 16;
    /// Tmknod.
    pub const TMKNOD: u8 = 18;
    /// Treadlink.
    pub const TREADLINK: u8 = 22;
    /// Tgetattr.
    pub const TGETATTR: u8 = 24;
    /// Tsetattr.
    pub const TSETATTR: u8 = 26;
    /// Txattrwalk.
    pub const TXATTRWALK: u8 = 30;
    /// Txattrcreate.
    pub const TXATTRCREATE: u8 = 32;
    /// Treaddir.
    pub const TREADDIR: u8 = 40;
    /// Tfsync.
    pub const TFSYNC: u8 = 50;
    /// Tlock.
    pub const TLOCK: u8 = 52;
    /// Tgetlock.
    pub const TGETLOCK: u8 = 54;
    /// Tlink.
    pub const TLINK: u8 = 70;
    /// Tmkdir.
    pub const TMKDIR: u8 = 72;
    /// Trenameat.
    pub const TRENAMEAT: u8 = 74;
    /// Tunlinkat.
    pub const TUNLINKAT: u8 = 76;
    /// Tversion.
    pub const TVERSION: u8 = 100;
    /// Tattach.
    pub const TATTACH: u8 = 104;
    /// Tflush.
    pub const TFLUSH: u8 = 108;
    /// Twalk.
    pub const TWALK: u8 = 110;
    /// Tread.
    pub const TREAD: u8 = 116;
    /// Twrite.
    pub const TWRITE: u8 = 118;
    /// Tclunk.
    pub const TCLUNK: u8 = 120;
}

/// `Tsetattr` valid-mask bits.
pub mod setattr {
    /// Apply the mode field.
    pub const MODE: u32 = 0x1;
    /// Apply the uid field.
    pub const UID: u32 = 0x2;
    /// Apply the gid field.
    pub const GID: u32 = 0x4;
    /// Apply the size field.
    pub const SIZE: u32 = 0x8;
    /// Touch atime with the current wall time.
    pub const ATIME: u32 = 0x10;
    /// Touch mtime with the current wall time.
    pub const MTIME: u32 = 0x20;
    /// Touch ctime (accepted and ignored).
    pub const CTIME: u32 = 0x40;
    /// Use the provided atime seconds.
    pub const ATIME_SET: u32 = 0x80;
    /// Use the provided mtime seconds.
    pub const MTIME_SET: u32 = 0x100;
}

/// `Rgetattr` validity mask: everything up to data_version except
/// btime/gen, which are reported as zero anyway.
const GETATTR_VALID: u64 = 0x7ff;

/// Advisory-lock status: not locked.
const LOCK_TYPE_UNLOCKED: u8 = 2;

// ============================================================================
// Reply Plumbing
// ============================================================================

/// A completed reply frame addressed to a transport slot.
#[derive(Debug, Clone)]
pub struct Reply {
    /// Transport index the request arrived under.
    pub index: u16,
    /// Full reply frame, header included.
    pub frame: Vec<u8>,
}

/// Sink the dispatcher delivers completed replies to.
pub trait ReplySink: Send + Sync {
    /// Delivers one reply frame for the given transport index.
    fn send_reply(&self, index: u16, frame: &[u8]);
}

impl ReplySink for tokio::sync::mpsc::UnboundedSender<Reply> {
    fn send_reply(&self, index: u16, frame: &[u8]) {
        // A dropped receiver means the transport is gone; nothing to do.
        let _ = self.send(Reply {
            index,
            frame: frame.to_vec(),
        });
    }
}

// ============================================================================
// Handler Outcomes
// ============================================================================

/// Why a handler produced no reply body.
#[derive(Debug, PartialEq, Eq)]
enum Fail {
    /// Answer with `Rlerror` carrying this errno.
    Errno(u32),
    /// The tag was flushed; suppress the reply entirely.
    Aborted,
}

impl From<BackendError> for Fail {
    fn from(err: BackendError) -> Self {
        Self::Errno(err.errno())
    }
}

impl From<WireError> for Fail {
    fn from(err: WireError) -> Self {
        match err {
            WireError::Overflow { .. } => Self::Errno(errno::EIO),
            _ => Self::Errno(errno::EINVAL),
        }
    }
}

/// Reply body: marshalled fields, optionally followed by raw payload bytes.
#[derive(Debug, Default)]
struct ReplyBody {
    fields: Vec<Field>,
    data: Vec<u8>,
}

impl ReplyBody {
    fn new(fields: Vec<Field>) -> Self {
        Self {
            fields,
            data: Vec::new(),
        }
    }

    fn with_data(fields: Vec<Field>, data: Vec<u8>) -> Self {
        Self { fields, data }
    }

    fn empty() -> Self {
        Self::default()
    }

    /// Marshals the body into `buf`, returning its length.
    fn write_to(&self, buf: &mut [u8]) -> wire::Result<usize> {
        let fmt: String = self.fields.iter().map(Field::code).collect();
        let mut len = wire::marshal(&fmt, &self.fields, buf, 0)?;
        if !self.data.is_empty() {
            let end = len + self.data.len();
            if end > buf.len() {
                return Err(WireError::Overflow {
                    needed: self.data.len(),
                    offset: len,
                    capacity: buf.len(),
                });
            }
            buf[len..end].copy_from_slice(&self.data);
            len = end;
        }
        Ok(len)
    }
}

type HandlerResult = std::result::Result<ReplyBody, Fail>;

// ============================================================================
// Dispatcher
// ============================================================================

/// Dispatcher configuration.
#[derive(Debug, Clone)]
pub struct NinepConfig {
    /// Server msize cap; `Tversion` negotiates `min(client, cap)`.
    pub msize: u32,
}

impl Default for NinepConfig {
    fn default() -> Self {
        Self {
            msize: DEFAULT_MSIZE,
        }
    }
}

/// 9P request dispatcher.
///
/// Owns all mutable session state behind a lock that is never held across
/// an await: handlers take it briefly to consult fids and tags, and once
/// more in the completion window to write the reply. That is the
/// serialization discipline the protocol requires — one reply-buffer user
/// at a time — while any number of requests are suspended in backend I/O.
pub struct Dispatcher<B> {
    backend: Arc<B>,
    sink: Arc<dyn ReplySink>,
    state: Mutex<Session>,
    config: NinepConfig,
}

impl<B: Backend> Dispatcher<B> {
    /// Creates a dispatcher over a backend and a reply sink.
    pub fn new(backend: Arc<B>, sink: Arc<dyn ReplySink>, config: NinepConfig) -> Self {
        let msize = config.msize;
        Self {
            backend,
            sink,
            state: Mutex::new(Session::new(msize)),
            config,
        }
    }

    /// Handles one request frame.
    ///
    /// Recoverable failures are answered on the wire; the returned error is
    /// session-fatal (unknown message id, unparsable header) and the
    /// transport must abort the connection.
    ///
    /// # Errors
    ///
    /// Returns [`NinepError`] only for protocol violations that end the
    /// session.
    pub async fn dispatch(&self, index: u16, frame: &[u8]) -> Result<()> {
        let mut src = SliceSource::new(frame);
        let (id, tag) = match (src.read_u32(), src.read_u8(), src.read_u16()) {
            (Ok(_size), Ok(id), Ok(tag)) => (id, tag),
            _ => return Err(NinepError::MalformedHeader),
        };
        tracing::trace!("request id={} tag={} index={}", id, tag, index);
        self.state().tags.register(tag);

        let result = match id {
            msg::TVERSION => self.tversion(&mut src).await,
            msg::TATTACH => self.tattach(tag, &mut src).await,
            msg::TFLUSH => self.tflush(&mut src),
            msg::TWALK => self.twalk(tag, &mut src).await,
            msg::TLOPEN => self.tlopen(tag, &mut src).await,
            msg::TLCREATE => self.tlcreate(tag, &mut src).await,
            msg::TSYMLINK => self.tsymlink(tag, &mut src).await,
            msg::TMKNOD => self.tmknod(tag, &mut src).await,
            msg::TREADLINK => self.treadlink(tag, &mut src).await,
            msg::TGETATTR => self.tgetattr(tag, &mut src).await,
            msg::TSETATTR => self.tsetattr(tag, &mut src).await,
            msg::TXATTRWALK => self.txattrwalk(&mut src),
            msg::TXATTRCREATE => self.txattrcreate(&mut src),
            msg::TREADDIR => self.treaddir(tag, &mut src).await,
            msg::TREAD => self.tread(tag, &mut src).await,
            msg::TWRITE => self.twrite(tag, &mut src).await,
            msg::TRENAMEAT => self.trenameat(tag, &mut src).await,
            msg::TUNLINKAT => self.tunlinkat(tag, &mut src).await,
            msg::TLINK => self.tlink(tag, &mut src).await,
            msg::TMKDIR => self.tmkdir(tag, &mut src).await,
            msg::TSTATFS => self.tstatfs(tag, &mut src).await,
            msg::TCLUNK => self.tclunk(&mut src),
            msg::TFSYNC => self.tfsync(tag, &mut src).await,
            msg::TLOCK => self.tlock(&mut src),
            msg::TGETLOCK => self.tgetlock(&mut src),
            other => {
                tracing::error!("unknown message id {}, aborting session", other);
                return Err(NinepError::UnknownMessage(other));
            }
        };

        self.finish(index, id, tag, result);
        Ok(())
    }

    /// Captures the restorable protocol state.
    pub fn snapshot(&self) -> SessionSnapshot {
        self.state().snapshot()
    }

    /// Replaces the session with a restored snapshot.
    pub fn restore(&self, snapshot: SessionSnapshot) {
        *self.state() = Session::restore(snapshot);
    }

    /// The negotiated msize.
    pub fn msize(&self) -> u32 {
        self.state().msize
    }

    // ========================================================================
    // Completion Window
    // ========================================================================

    /// Writes the reply (or error) for a finished handler and signals the
    /// transport. No-op if the tag was flushed while the handler ran.
    fn finish(&self, index: u16, id: u8, tag: u16, result: HandlerResult) {
        let mut session = self.state();
        if session.tags.should_abort(tag) {
            tracing::debug!("reply for tag {} suppressed after flush", tag);
            return;
        }

        match result {
            Ok(body) => match body.write_to(session.body_mut()) {
                Ok(len) => session.build_reply(id + 1, tag, len),
                Err(err) => {
                    tracing::warn!("reply marshal failed for id {}: {}", id, err);
                    if !Self::send_error(&mut session, tag, errno::EIO) {
                        return;
                    }
                }
            },
            Err(Fail::Errno(ecode)) => {
                if !Self::send_error(&mut session, tag, ecode) {
                    return;
                }
            }
            Err(Fail::Aborted) => return,
        }

        self.sink.send_reply(index, session.reply_frame());
    }

    /// Encodes `Rlerror` with a 4-byte errno body and releases the tag.
    fn send_error(session: &mut Session, tag: u16, ecode: u32) -> bool {
        match wire::marshal("w", &[Field::W(ecode)], session.body_mut(), 0) {
            Ok(len) => {
                session.build_reply(msg::RLERROR, tag, len);
                true
            }
            Err(err) => {
                tracing::error!("cannot encode Rlerror: {}", err);
                false
            }
        }
    }

    // ========================================================================
    // Session / Fid Helpers
    // ========================================================================

    fn state(&self) -> MutexGuard<'_, Session> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, fid: u32) -> std::result::Result<FidRecord, Fail> {
        self.state()
            .fids
            .get(fid)
            .cloned()
            .ok_or(Fail::Errno(errno::EBADF))
    }

    fn aborted(&self, tag: u16) -> bool {
        self.state().tags.should_abort(tag)
    }

    fn check_abort(&self, tag: u16) -> std::result::Result<(), Fail> {
        if self.aborted(tag) {
            Err(Fail::Aborted)
        } else {
            Ok(())
        }
    }

    fn iounit(&self) -> u32 {
        self.state().msize.saturating_sub(24)
    }

    // ========================================================================
    // Session Management Handlers
    // ========================================================================

    /// `Tversion`: negotiate msize, reset all fids.
    async fn tversion(&self, src: &mut SliceSource<'_>) -> HandlerResult {
        let client_msize = src.read_u32().map_err(Fail::from)?;
        let client_version = src.read_string().map_err(Fail::from)?;
        let msize = client_msize.min(self.config.msize);
        tracing::debug!(
            "Tversion client msize={} version={:?}, negotiated {}",
            client_msize,
            client_version,
            msize
        );

        let mut session = self.state();
        session.set_msize(msize);
        session.fids.clear();
        drop(session);

        Ok(ReplyBody::new(vec![
            Field::W(msize),
            Field::S(crate::session::PROTOCOL_VERSION.to_string()),
        ]))
    }

    /// `Tattach`: bind a root fid for a user. Authentication is accepted
    /// but not enforced; the afid is ignored.
    async fn tattach(&self, tag: u16, src: &mut SliceSource<'_>) -> HandlerResult {
        let fid = src.read_u32().map_err(Fail::from)?;
        let _afid = src.read_u32().map_err(Fail::from)?;
        let uname = src.read_string().map_err(Fail::from)?;
        let _aname = src.read_string().map_err(Fail::from)?;
        let uid = src.read_u32().map_err(Fail::from)?;
        tracing::debug!("Tattach fid={} uname={:?} uid={}", fid, uname, uid);

        let stat = self.backend.stat("/").await?;
        self.check_abort(tag)?;

        self.state().fids.insert(fid, FidRecord::inode("/", uid));
        Ok(ReplyBody::new(vec![Field::Q(Qid::from_stat(&stat))]))
    }

    /// `Tflush`: drop the referenced tag so its handler goes silent.
    fn tflush(&self, src: &mut SliceSource<'_>) -> HandlerResult {
        let oldtag = src.read_u16().map_err(Fail::from)?;
        tracing::debug!("Tflush oldtag={}", oldtag);
        self.state().tags.flush(oldtag);
        Ok(ReplyBody::empty())
    }

    /// `Twalk`: stat each component in turn. Strict prefix: any failing
    /// component fails the whole walk and `newfid` stays unbound.
    async fn twalk(&self, tag: u16, src: &mut SliceSource<'_>) -> HandlerResult {
        let fid = src.read_u32().map_err(Fail::from)?;
        let newfid = src.read_u32().map_err(Fail::from)?;
        let nwname = src.read_u16().map_err(Fail::from)?;
        let mut names = Vec::with_capacity(nwname as usize);
        for _ in 0..nwname {
            names.push(src.read_string().map_err(Fail::from)?);
        }

        let rec = self.record(fid)?;
        if names.is_empty() {
            self.state().fids.insert(newfid, rec);
            return Ok(ReplyBody::new(vec![Field::H(0)]));
        }

        let mut path = rec.path;
        let mut fields = vec![Field::H(nwname)];
        for name in &names {
            path = join(&path, name);
            // lstat: a component that is a symlink reports its own qid so
            // the client can resolve it with Treadlink.
            let stat = self.backend.lstat(&path).await?;
            self.check_abort(tag)?;
            fields.push(Field::Q(Qid::from_stat(&stat)));
        }

        self.state()
            .fids
            .insert(newfid, FidRecord::inode(path, rec.uid));
        Ok(ReplyBody::new(fields))
    }

    /// `Tclunk`: drop the fid. Never fails, even for an unknown fid.
    fn tclunk(&self, src: &mut SliceSource<'_>) -> HandlerResult {
        let fid = src.read_u32().map_err(Fail::from)?;
        self.state().fids.remove(fid);
        Ok(ReplyBody::empty())
    }

    // ========================================================================
    // Node Creation Handlers
    // ========================================================================

    /// `Tlopen`: stat the fid's path and report qid + iounit. File
    /// handles are not held open; later I/O re-opens per request.
    async fn tlopen(&self, tag: u16, src: &mut SliceSource<'_>) -> HandlerResult {
        let fid = src.read_u32().map_err(Fail::from)?;
        let _flags = src.read_u32().map_err(Fail::from)?;

        let rec = self.record(fid)?;
        let stat = self.backend.stat(&rec.path).await?;
        self.check_abort(tag)?;

        Ok(ReplyBody::new(vec![
            Field::Q(Qid::from_stat(&stat)),
            Field::W(self.iounit()),
        ]))
    }

    /// `Tlcreate`: create-and-open a regular file under the fid's
    /// directory, then point the fid at it.
    async fn tlcreate(&self, tag: u16, src: &mut SliceSource<'_>) -> HandlerResult {
        let fid = src.read_u32().map_err(Fail::from)?;
        let name = src.read_string().map_err(Fail::from)?;
        let flags = src.read_u32().map_err(Fail::from)?;
        let mode = src.read_u32().map_err(Fail::from)?;
        let gid = src.read_u32().map_err(Fail::from)?;

        let rec = self.record(fid)?;
        let path = join(&rec.path, &name);

        let fd = self
            .backend
            .open(&path, flags | open_flags::CREATE, mode)
            .await?;
        if self.aborted(tag) {
            let _ = self.backend.close(fd).await;
            return Err(Fail::Aborted);
        }
        self.backend.close(fd).await?;

        self.backend.chown(&path, rec.uid, gid).await?;
        self.check_abort(tag)?;

        let stat = self.backend.stat(&path).await?;
        self.check_abort(tag)?;

        self.state()
            .fids
            .insert(fid, FidRecord::inode(path, rec.uid));
        Ok(ReplyBody::new(vec![
            Field::Q(Qid::from_stat(&stat)),
            Field::W(self.iounit()),
        ]))
    }

    /// `Tsymlink`: create a symlink under the fid's directory.
    async fn tsymlink(&self, tag: u16, src: &mut SliceSource<'_>) -> HandlerResult {
        let fid = src.read_u32().map_err(Fail::from)?;
        let name = src.read_string().map_err(Fail::from)?;
        let target = src.read_string().map_err(Fail::from)?;
        let gid = src.read_u32().map_err(Fail::from)?;

        let rec = self.record(fid)?;
        let path = join(&rec.path, &name);
        self.backend.symlink(&target, &path).await?;
        self.check_abort(tag)?;

        self.backend.chown(&path, rec.uid, gid).await?;
        self.check_abort(tag)?;

        let stat = self.backend.lstat(&path).await?;
        self.check_abort(tag)?;
        Ok(ReplyBody::new(vec![Field::Q(Qid::from_stat(&stat))]))
    }

    /// `Tmknod`: special-file kinds collapse to regular files; device
    /// numbers are parsed and ignored.
    async fn tmknod(&self, tag: u16, src: &mut SliceSource<'_>) -> HandlerResult {
        let dfid = src.read_u32().map_err(Fail::from)?;
        let name = src.read_string().map_err(Fail::from)?;
        let mode = src.read_u32().map_err(Fail::from)?;
        let _major = src.read_u32().map_err(Fail::from)?;
        let _minor = src.read_u32().map_err(Fail::from)?;
        let gid = src.read_u32().map_err(Fail::from)?;

        let rec = self.record(dfid)?;
        let path = join(&rec.path, &name);
        self.backend.mknod(&path, mode).await?;
        self.check_abort(tag)?;

        self.backend.chown(&path, rec.uid, gid).await?;
        self.check_abort(tag)?;

        let stat = self.backend.stat(&path).await?;
        self.check_abort(tag)?;
        Ok(ReplyBody::new(vec![Field::Q(Qid::from_stat(&stat))]))
    }

    /// `Tmkdir`: create a directory under the fid's directory.
    async fn tmkdir(&self, tag: u16, src: &mut SliceSource<'_>) -> HandlerResult {
        let dfid = src.read_u32().map_err(Fail::from)?;
        let name = src.read_string().map_err(Fail::from)?;
        let mode = src.read_u32().map_err(Fail::from)?;
        let gid = src.read_u32().map_err(Fail::from)?;

        let rec = self.record(dfid)?;
        let path = join(&rec.path, &name);
        self.backend.mkdir(&path, mode).await?;
        self.check_abort(tag)?;

        self.backend.chown(&path, rec.uid, gid).await?;
        self.check_abort(tag)?;

        let stat = self.backend.stat(&path).await?;
        self.check_abort(tag)?;
        Ok(ReplyBody::new(vec![Field::Q(Qid::from_stat(&stat))]))
    }

    // ========================================================================
    // Attribute Handlers
    // ========================================================================

    /// `Treadlink`.
    async fn treadlink(&self, tag: u16, src: &mut SliceSource<'_>) -> HandlerResult {
        let fid = src.read_u32().map_err(Fail::from)?;
        let rec = self.record(fid)?;
        let target = self.backend.readlink(&rec.path).await?;
        self.check_abort(tag)?;
        Ok(ReplyBody::new(vec![Field::S(target)]))
    }

    /// `Tgetattr`: lstat and report the full attribute block. btime, gen
    /// and data_version are not tracked and read as zero.
    async fn tgetattr(&self, tag: u16, src: &mut SliceSource<'_>) -> HandlerResult {
        let fid = src.read_u32().map_err(Fail::from)?;
        let _request_mask = src.read_u64().map_err(Fail::from)?;

        let rec = self.record(fid)?;
        let stat = self.backend.lstat(&rec.path).await?;
        self.check_abort(tag)?;

        let (atime_sec, atime_nsec) = time_fields(stat.atime_ms);
        let (mtime_sec, mtime_nsec) = time_fields(stat.mtime_ms);
        let (ctime_sec, ctime_nsec) = time_fields(stat.ctime_ms);

        Ok(ReplyBody::new(vec![
            Field::D(GETATTR_VALID),
            Field::Q(Qid::from_stat(&stat)),
            Field::W(stat.mode),
            Field::W(stat.uid),
            Field::W(stat.gid),
            Field::D(stat.nlinks),
            Field::D(0), // rdev
            Field::D(stat.size),
            Field::D(u64::from(BLOCKSIZE)),
            Field::D(stat.size / 512 + 1),
            Field::D(atime_sec),
            Field::D(atime_nsec),
            Field::D(mtime_sec),
            Field::D(mtime_nsec),
            Field::D(ctime_sec),
            Field::D(ctime_nsec),
            Field::D(0), // btime_sec
            Field::D(0), // btime_nsec
            Field::D(0), // gen
            Field::D(0), // data_version
        ]))
    }

    /// `Tsetattr`: fan out one backend call per requested change. All must
    /// succeed before `Rsetattr`; the first failure answers with its error.
    async fn tsetattr(&self, tag: u16, src: &mut SliceSource<'_>) -> HandlerResult {
        let fid = src.read_u32().map_err(Fail::from)?;
        let valid = src.read_u32().map_err(Fail::from)?;
        let mode = src.read_u32().map_err(Fail::from)?;
        let uid = src.read_u32().map_err(Fail::from)?;
        let gid = src.read_u32().map_err(Fail::from)?;
        let size = src.read_u64().map_err(Fail::from)?;
        let atime_sec = src.read_u64().map_err(Fail::from)?;
        let _atime_nsec = src.read_u64().map_err(Fail::from)?;
        let mtime_sec = src.read_u64().map_err(Fail::from)?;
        let _mtime_nsec = src.read_u64().map_err(Fail::from)?;

        let rec = self.record(fid)?;

        if valid & setattr::MODE != 0 {
            self.backend.chmod(&rec.path, mode).await?;
            self.check_abort(tag)?;
        }

        // uid and gid change together or not at all; a lone bit is ignored.
        if valid & (setattr::UID | setattr::GID) == setattr::UID | setattr::GID {
            self.backend.chown(&rec.path, uid, gid).await?;
            self.check_abort(tag)?;
        }

        if valid & setattr::SIZE != 0 {
            self.backend.truncate(&rec.path, size).await?;
            self.check_abort(tag)?;
        }

        let time_bits =
            setattr::ATIME | setattr::MTIME | setattr::ATIME_SET | setattr::MTIME_SET;
        if valid & time_bits != 0 {
            let stat = self.backend.lstat(&rec.path).await?;
            self.check_abort(tag)?;

            let mut atime_ms = stat.atime_ms;
            let mut mtime_ms = stat.mtime_ms;
            if valid & setattr::ATIME_SET != 0 {
                atime_ms = atime_sec.saturating_mul(1000);
            } else if valid & setattr::ATIME != 0 {
                atime_ms = now_ms();
            }
            if valid & setattr::MTIME_SET != 0 {
                mtime_ms = mtime_sec.saturating_mul(1000);
            } else if valid & setattr::MTIME != 0 {
                mtime_ms = now_ms();
            }

            self.backend.utimes(&rec.path, atime_ms, mtime_ms).await?;
            self.check_abort(tag)?;
        }

        // CTIME is accepted and ignored.
        Ok(ReplyBody::empty())
    }

    // ========================================================================
    // Data Handlers
    // ========================================================================

    /// `Treaddir`: serialize the whole directory once, cache it in the tag
    /// scratch, and slice `[offset, offset + count)` out of it per request.
    async fn treaddir(&self, tag: u16, src: &mut SliceSource<'_>) -> HandlerResult {
        let fid = src.read_u32().map_err(Fail::from)?;
        let offset = src.read_u64().map_err(Fail::from)?;
        let count = src.read_u32().map_err(Fail::from)?.min(self.iounit());

        let rec = self.record(fid)?;
        let cached = self.state().tags.scratch(tag).and_then(|s| {
            s.dir_cache
                .as_ref()
                .filter(|c| c.path == rec.path)
                .map(|c| Arc::clone(&c.data))
        });

        let buffer = match cached {
            Some(data) => data,
            None => {
                let self_stat = self.backend.stat(&rec.path).await?;
                self.check_abort(tag)?;
                let parent_stat = self.backend.stat(&parent_of(&rec.path)).await?;
                self.check_abort(tag)?;
                let entries = self.backend.list(&rec.path).await?;
                self.check_abort(tag)?;

                let data = build_dir_buffer(&self_stat, &parent_stat, &entries)?;
                let mut session = self.state();
                match session.tags.scratch_mut(tag) {
                    Some(scratch) => {
                        let cache = crate::tag::CachedBuffer::new(rec.path.clone(), data);
                        let shared = Arc::clone(&cache.data);
                        scratch.dir_cache = Some(cache);
                        shared
                    }
                    None => return Err(Fail::Aborted),
                }
            }
        };

        let total = buffer.len() as u64;
        let start = offset.min(total) as usize;
        let end = (offset.saturating_add(u64::from(count))).min(total) as usize;
        let slice = buffer[start..end].to_vec();

        #[allow(clippy::cast_possible_truncation)] // bounded by count
        let reply_count = slice.len() as u32;
        Ok(ReplyBody::with_data(vec![Field::W(reply_count)], slice))
    }

    /// `Tread`: the first read under a tag fetches the whole file into the
    /// tag scratch; later chunks under the same tag slice the cache.
    async fn tread(&self, tag: u16, src: &mut SliceSource<'_>) -> HandlerResult {
        let fid = src.read_u32().map_err(Fail::from)?;
        let offset = src.read_u64().map_err(Fail::from)?;
        let count = src.read_u32().map_err(Fail::from)?.min(self.iounit());

        let rec = self.record(fid)?;
        if rec.kind != FidKind::Inode {
            // Xattr fids advertise no data.
            return Ok(ReplyBody::new(vec![Field::W(0)]));
        }

        let cached = self.state().tags.scratch(tag).and_then(|s| {
            s.read_cache
                .as_ref()
                .filter(|c| c.path == rec.path)
                .map(|c| Arc::clone(&c.data))
        });

        let contents = match cached {
            Some(data) => data,
            None => {
                let data = self.backend.read_file(&rec.path).await?;
                self.check_abort(tag)?;
                let mut session = self.state();
                match session.tags.scratch_mut(tag) {
                    Some(scratch) => {
                        let cache = crate::tag::CachedBuffer::new(rec.path.clone(), data);
                        let shared = Arc::clone(&cache.data);
                        scratch.read_cache = Some(cache);
                        shared
                    }
                    None => return Err(Fail::Aborted),
                }
            }
        };

        let size = contents.len() as u64;
        let start = offset.min(size) as usize;
        let end = (offset.saturating_add(u64::from(count))).min(size) as usize;
        let slice = contents[start..end].to_vec();

        #[allow(clippy::cast_possible_truncation)] // bounded by count
        let reply_count = slice.len() as u32;
        Ok(ReplyBody::with_data(vec![Field::W(reply_count)], slice))
    }

    /// `Twrite`: open for write, write the chunk at its offset, close.
    async fn twrite(&self, tag: u16, src: &mut SliceSource<'_>) -> HandlerResult {
        let fid = src.read_u32().map_err(Fail::from)?;
        let offset = src.read_u64().map_err(Fail::from)?;
        let count = src.read_u32().map_err(Fail::from)?;
        let data = src.read_bytes(count as usize).map_err(Fail::from)?;

        let rec = self.record(fid)?;
        if rec.kind != FidKind::Inode {
            // Xattr writes are swallowed.
            return Ok(ReplyBody::new(vec![Field::W(count)]));
        }

        let fd = self
            .backend
            .open(&rec.path, open_flags::WRONLY, 0)
            .await?;
        if self.aborted(tag) {
            let _ = self.backend.close(fd).await;
            return Err(Fail::Aborted);
        }

        let written = match self.backend.write(fd, &data, offset).await {
            Ok(n) => n,
            Err(err) => {
                let _ = self.backend.close(fd).await;
                return Err(err.into());
            }
        };
        if self.aborted(tag) {
            let _ = self.backend.close(fd).await;
            return Err(Fail::Aborted);
        }
        self.backend.close(fd).await?;
        self.check_abort(tag)?;

        Ok(ReplyBody::new(vec![Field::W(written)]))
    }

    // ========================================================================
    // Namespace Handlers
    // ========================================================================

    /// `Trenameat`.
    async fn trenameat(&self, tag: u16, src: &mut SliceSource<'_>) -> HandlerResult {
        let olddirfid = src.read_u32().map_err(Fail::from)?;
        let oldname = src.read_string().map_err(Fail::from)?;
        let newdirfid = src.read_u32().map_err(Fail::from)?;
        let newname = src.read_string().map_err(Fail::from)?;

        let old_rec = self.record(olddirfid)?;
        let new_rec = self.record(newdirfid)?;
        let old_path = join(&old_rec.path, &oldname);
        let new_path = join(&new_rec.path, &newname);

        self.backend.rename(&old_path, &new_path).await?;
        self.check_abort(tag)?;
        Ok(ReplyBody::empty())
    }

    /// `Tunlinkat`: directories get `rmdir`, everything else `unlink`.
    async fn tunlinkat(&self, tag: u16, src: &mut SliceSource<'_>) -> HandlerResult {
        let dirfid = src.read_u32().map_err(Fail::from)?;
        let name = src.read_string().map_err(Fail::from)?;
        let _flags = src.read_u32().map_err(Fail::from)?;

        let rec = self.record(dirfid)?;
        let path = join(&rec.path, &name);

        let stat = self.backend.lstat(&path).await?;
        self.check_abort(tag)?;

        if stat.kind == crate::backend::NodeKind::Directory {
            self.backend.rmdir(&path).await?;
        } else {
            self.backend.unlink(&path).await?;
        }
        self.check_abort(tag)?;
        Ok(ReplyBody::empty())
    }

    /// `Tlink`: hard-link the fid's node under another directory.
    async fn tlink(&self, tag: u16, src: &mut SliceSource<'_>) -> HandlerResult {
        let dfid = src.read_u32().map_err(Fail::from)?;
        let fid = src.read_u32().map_err(Fail::from)?;
        let name = src.read_string().map_err(Fail::from)?;

        let dir_rec = self.record(dfid)?;
        let rec = self.record(fid)?;
        let new_path = join(&dir_rec.path, &name);

        self.backend.link(&rec.path, &new_path).await?;
        self.check_abort(tag)?;
        Ok(ReplyBody::empty())
    }

    // ========================================================================
    // Miscellaneous Handlers
    // ========================================================================

    /// `Tstatfs`: fixed type/bsize/namelen, usage figures from the backend.
    async fn tstatfs(&self, tag: u16, src: &mut SliceSource<'_>) -> HandlerResult {
        let fid = src.read_u32().map_err(Fail::from)?;
        let _rec = self.record(fid)?;

        let usage = self.backend.statfs().await?;
        self.check_abort(tag)?;

        Ok(ReplyBody::new(vec![
            Field::W(0x0102_1997), // V9FS_MAGIC
            Field::W(BLOCKSIZE),
            Field::D(usage.blocks),
            Field::D(usage.bfree),
            Field::D(usage.bavail),
            Field::D(usage.files),
            Field::D(usage.ffree),
            Field::D(usage.fsid),
            Field::W(256), // namelen
        ]))
    }

    /// `Tfsync`: delegate when a fid is present; always succeeds.
    async fn tfsync(&self, tag: u16, src: &mut SliceSource<'_>) -> HandlerResult {
        if let Ok(fid) = src.read_u32() {
            if let Ok(rec) = self.record(fid) {
                self.backend.fsync(&rec.path).await?;
                self.check_abort(tag)?;
            }
        }
        Ok(ReplyBody::empty())
    }

    /// `Tlock`: advisory locks always succeed.
    fn tlock(&self, src: &mut SliceSource<'_>) -> HandlerResult {
        let _fid = src.read_u32().map_err(Fail::from)?;
        Ok(ReplyBody::new(vec![Field::B(0)])) // status: success
    }

    /// `Tgetlock`: the queried range is always reported unlocked.
    fn tgetlock(&self, src: &mut SliceSource<'_>) -> HandlerResult {
        let _fid = src.read_u32().map_err(Fail::from)?;
        Ok(ReplyBody::new(vec![
            Field::B(LOCK_TYPE_UNLOCKED),
            Field::D(0),
            Field::D(0),
            Field::W(0),
            Field::S(String::new()),
        ]))
    }

    /// `Txattrwalk`: bind a data-less fid and advertise zero xattr bytes.
    fn txattrwalk(&self, src: &mut SliceSource<'_>) -> HandlerResult {
        let fid = src.read_u32().map_err(Fail::from)?;
        let newfid = src.read_u32().map_err(Fail::from)?;
        let _name = src.read_string().map_err(Fail::from)?;

        let rec = self.record(fid)?;
        self.state().fids.insert(
            newfid,
            FidRecord {
                path: rec.path,
                kind: FidKind::None,
                uid: rec.uid,
            },
        );
        Ok(ReplyBody::new(vec![Field::D(0)]))
    }

    /// `Txattrcreate`: accept and ignore; the fid becomes an xattr stub.
    fn txattrcreate(&self, src: &mut SliceSource<'_>) -> HandlerResult {
        let fid = src.read_u32().map_err(Fail::from)?;
        let _name = src.read_string().map_err(Fail::from)?;
        let _attr_size = src.read_u64().map_err(Fail::from)?;
        let _flags = src.read_u32().map_err(Fail::from)?;

        let mut session = self.state();
        let rec = session.fids.get_mut(fid).ok_or(Fail::Errno(errno::EBADF))?;
        rec.kind = FidKind::Xattr;
        Ok(ReplyBody::empty())
    }
}

// ============================================================================
// Free Helpers
// ============================================================================

/// Joins a directory path and a child name.
fn join(base: &str, name: &str) -> String {
    if base == "/" {
        format!("/{name}")
    } else {
        format!("{base}/{name}")
    }
}

/// Parent directory of a rooted path; the root is its own parent.
fn parent_of(path: &str) -> String {
    match path.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(idx) => path[..idx].to_string(),
    }
}

/// Splits a millisecond timestamp into the second/nanosecond pair the
/// attribute block carries: seconds are rounded, nanoseconds carry the
/// full millisecond value scaled up.
fn time_fields(ms: u64) -> (u64, u64) {
    ((ms + 500) / 1000, ms.saturating_mul(1_000_000))
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

/// Serializes a directory: synthetic `.` and `..` first, then the backend
/// listing in order. Each entry's offset field is the byte offset of the
/// next entry.
fn build_dir_buffer(
    self_stat: &NodeStat,
    parent_stat: &NodeStat,
    entries: &[DirEntry],
) -> std::result::Result<Vec<u8>, Fail> {
    let mut out = Vec::new();

    let dot = DirEntry {
        name: ".".to_string(),
        stat: self_stat.clone(),
    };
    let dotdot = DirEntry {
        name: "..".to_string(),
        stat: parent_stat.clone(),
    };

    for entry in [&dot, &dotdot].into_iter().chain(entries) {
        let entry_size = Qid::WIRE_SIZE + 8 + 1 + 2 + entry.name.len();
        let next_offset = (out.len() + entry_size) as u64;
        #[allow(clippy::cast_possible_truncation)] // top nibble of the mode word
        let type_byte = (entry.stat.mode >> 12) as u8;

        let mut buf = vec![0u8; entry_size];
        wire::marshal(
            "Qdbs",
            &[
                Field::Q(Qid::from_stat(&entry.stat)),
                Field::D(next_offset),
                Field::B(type_byte),
                Field::S(entry.name.clone()),
            ],
            &mut buf,
            0,
        )
        .map_err(Fail::from)?;
        out.extend_from_slice(&buf);
    }
    Ok(out)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendResult, FsUsage, NodeKind};
    use crate::session::HEADER_SIZE;
    use async_trait::async_trait;
    use tokio::sync::mpsc;

    /// Minimal backend: a root directory containing one file, plus a gate
    /// that lets tests hold a read open while they issue a flush.
    struct StubBackend {
        file_data: Vec<u8>,
        read_gate: Option<tokio::sync::Semaphore>,
        reads: std::sync::atomic::AtomicUsize,
    }

    impl StubBackend {
        fn new() -> Self {
            Self {
                file_data: b"stub contents".to_vec(),
                read_gate: None,
                reads: std::sync::atomic::AtomicUsize::new(0),
            }
        }

        fn gated() -> Self {
            Self {
                read_gate: Some(tokio::sync::Semaphore::new(0)),
                ..Self::new()
            }
        }

        fn root_stat() -> NodeStat {
            NodeStat {
                kind: NodeKind::Directory,
                mode: 0o040_755,
                uid: 0,
                gid: 0,
                nlinks: 2,
                size: 0,
                atime_ms: 0,
                mtime_ms: 0,
                ctime_ms: 0,
                version: 0,
                node: 1,
            }
        }

        fn file_stat(&self) -> NodeStat {
            NodeStat {
                kind: NodeKind::File,
                mode: 0o100_644,
                uid: 0,
                gid: 0,
                nlinks: 1,
                size: self.file_data.len() as u64,
                atime_ms: 0,
                mtime_ms: 0,
                ctime_ms: 0,
                version: 1,
                node: 2,
            }
        }
    }

    #[async_trait]
    impl Backend for StubBackend {
        async fn stat(&self, path: &str) -> BackendResult<NodeStat> {
            match path {
                "/" => Ok(Self::root_stat()),
                "/file" => Ok(self.file_stat()),
                _ => Err(BackendError::NotFound),
            }
        }

        async fn lstat(&self, path: &str) -> BackendResult<NodeStat> {
            self.stat(path).await
        }

        async fn read_file(&self, path: &str) -> BackendResult<Vec<u8>> {
            if path != "/file" {
                return Err(BackendError::NotFound);
            }
            self.reads.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            if let Some(gate) = &self.read_gate {
                let permit = gate.acquire().await.map_err(|_| BackendError::Io)?;
                permit.forget();
            }
            Ok(self.file_data.clone())
        }

        async fn open(&self, _path: &str, _flags: u32, _mode: u32) -> BackendResult<u64> {
            Ok(1)
        }

        async fn close(&self, _fd: u64) -> BackendResult<()> {
            Ok(())
        }

        async fn write(&self, _fd: u64, data: &[u8], _offset: u64) -> BackendResult<u32> {
            Ok(data.len() as u32)
        }

        async fn readlink(&self, _path: &str) -> BackendResult<String> {
            Err(BackendError::InvalidArgument)
        }

        async fn symlink(&self, _target: &str, _path: &str) -> BackendResult<()> {
            Ok(())
        }

        async fn mkdir(&self, _path: &str, _mode: u32) -> BackendResult<()> {
            Ok(())
        }

        async fn mknod(&self, _path: &str, _mode: u32) -> BackendResult<()> {
            Ok(())
        }

        async fn link(&self, _existing: &str, _new_path: &str) -> BackendResult<()> {
            Ok(())
        }

        async fn rename(&self, _old: &str, _new: &str) -> BackendResult<()> {
            Ok(())
        }

        async fn unlink(&self, _path: &str) -> BackendResult<()> {
            Ok(())
        }

        async fn rmdir(&self, _path: &str) -> BackendResult<()> {
            Ok(())
        }

        async fn chmod(&self, _path: &str, _mode: u32) -> BackendResult<()> {
            Ok(())
        }

        async fn chown(&self, _path: &str, _uid: u32, _gid: u32) -> BackendResult<()> {
            Ok(())
        }

        async fn utimes(&self, _path: &str, _atime: u64, _mtime: u64) -> BackendResult<()> {
            Ok(())
        }

        async fn truncate(&self, _path: &str, _size: u64) -> BackendResult<()> {
            Ok(())
        }

        async fn fsync(&self, _path: &str) -> BackendResult<()> {
            Ok(())
        }

        async fn list(&self, path: &str) -> BackendResult<Vec<DirEntry>> {
            if path != "/" {
                return Err(BackendError::NotDirectory);
            }
            Ok(vec![DirEntry {
                name: "file".to_string(),
                stat: self.file_stat(),
            }])
        }

        async fn statfs(&self) -> BackendResult<FsUsage> {
            Ok(FsUsage::default())
        }
    }

    fn frame(id: u8, tag: u16, body: &[Field]) -> Vec<u8> {
        let fmt: String = body.iter().map(Field::code).collect();
        let mut buf = vec![0u8; 4096];
        let n = wire::marshal(&fmt, body, &mut buf, HEADER_SIZE).unwrap();
        let total = (n + HEADER_SIZE) as u32;
        buf[0..4].copy_from_slice(&total.to_le_bytes());
        buf[4] = id;
        buf[5..7].copy_from_slice(&tag.to_le_bytes());
        buf.truncate(n + HEADER_SIZE);
        buf
    }

    fn setup(
        backend: StubBackend,
    ) -> (Arc<Dispatcher<StubBackend>>, mpsc::UnboundedReceiver<Reply>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::new(backend),
            Arc::new(tx),
            NinepConfig::default(),
        ));
        (dispatcher, rx)
    }

    async fn attach(dispatcher: &Dispatcher<StubBackend>, rx: &mut mpsc::UnboundedReceiver<Reply>) {
        let req = frame(
            msg::TATTACH,
            0,
            &[
                Field::W(0),
                Field::W(crate::fid::NOFID),
                Field::S("u".to_string()),
                Field::S(String::new()),
                Field::W(1000),
            ],
        );
        dispatcher.dispatch(0, &req).await.unwrap();
        let reply = rx.recv().await.unwrap();
        assert_eq!(reply.frame[4], msg::TATTACH + 1);
    }

    #[tokio::test]
    async fn version_negotiates_minimum_msize() {
        let (dispatcher, mut rx) = setup(StubBackend::new());
        let req = frame(
            msg::TVERSION,
            crate::tag::NOTAG,
            &[Field::W(65536), Field::S("9P2000.L".to_string())],
        );
        dispatcher.dispatch(0, &req).await.unwrap();

        let reply = rx.recv().await.unwrap();
        assert_eq!(reply.frame[4], msg::TVERSION + 1);
        let mut src = SliceSource::new(&reply.frame[HEADER_SIZE..]);
        assert_eq!(src.read_u32().unwrap(), DEFAULT_MSIZE);
        assert_eq!(src.read_string().unwrap(), "9P2000.L");
        assert_eq!(dispatcher.msize(), DEFAULT_MSIZE);
    }

    #[tokio::test]
    async fn unknown_fid_answers_ebadf() {
        let (dispatcher, mut rx) = setup(StubBackend::new());
        let req = frame(msg::TGETATTR, 1, &[Field::W(99), Field::D(0x7ff)]);
        dispatcher.dispatch(0, &req).await.unwrap();

        let reply = rx.recv().await.unwrap();
        assert_eq!(reply.frame[4], msg::RLERROR);
        let mut src = SliceSource::new(&reply.frame[HEADER_SIZE..]);
        assert_eq!(src.read_u32().unwrap(), errno::EBADF);
    }

    #[tokio::test]
    async fn unknown_message_id_is_session_fatal() {
        let (dispatcher, _rx) = setup(StubBackend::new());
        let req = frame(200, 1, &[]);
        let err = dispatcher.dispatch(0, &req).await.unwrap_err();
        assert!(matches!(err, NinepError::UnknownMessage(200)));
    }

    #[tokio::test]
    async fn truncated_body_answers_einval() {
        let (dispatcher, mut rx) = setup(StubBackend::new());
        // Tgetattr with no body at all.
        let req = frame(msg::TGETATTR, 3, &[]);
        dispatcher.dispatch(0, &req).await.unwrap();

        let reply = rx.recv().await.unwrap();
        assert_eq!(reply.frame[4], msg::RLERROR);
        let mut src = SliceSource::new(&reply.frame[HEADER_SIZE..]);
        assert_eq!(src.read_u32().unwrap(), errno::EINVAL);
    }

    #[tokio::test]
    async fn flush_suppresses_suspended_read() {
        let (dispatcher, mut rx) = setup(StubBackend::gated());
        attach(&dispatcher, &mut rx).await;

        // Walk fid 0 -> fid 1 at /file.
        let walk = frame(
            msg::TWALK,
            2,
            &[Field::W(0), Field::W(1), Field::H(1), Field::S("file".to_string())],
        );
        dispatcher.dispatch(0, &walk).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().frame[4], msg::TWALK + 1);

        // Start a read under tag 7; the backend gate keeps it suspended.
        let read = frame(
            msg::TREAD,
            7,
            &[Field::W(1), Field::D(0), Field::W(100)],
        );
        let reader = {
            let dispatcher = Arc::clone(&dispatcher);
            tokio::spawn(async move { dispatcher.dispatch(1, &read).await })
        };
        tokio::task::yield_now().await;

        // Flush tag 7 under tag 8, then release the gate.
        let flush = frame(msg::TFLUSH, 8, &[Field::H(7)]);
        dispatcher.dispatch(2, &flush).await.unwrap();
        dispatcher
            .backend
            .read_gate
            .as_ref()
            .unwrap()
            .add_permits(1);
        reader.await.unwrap().unwrap();

        // Exactly one reply: the Rflush with tag 8. No Rread for tag 7.
        let reply = rx.recv().await.unwrap();
        assert_eq!(reply.frame[4], msg::TFLUSH + 1);
        assert_eq!(
            u16::from_le_bytes(reply.frame[5..7].try_into().unwrap()),
            8
        );
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn chunked_reads_under_one_tag_fetch_once() {
        let (dispatcher, mut rx) = setup(StubBackend::new());
        attach(&dispatcher, &mut rx).await;

        let walk = frame(
            msg::TWALK,
            2,
            &[Field::W(0), Field::W(1), Field::H(1), Field::S("file".to_string())],
        );
        dispatcher.dispatch(0, &walk).await.unwrap();
        rx.recv().await.unwrap();

        let mut assembled = Vec::new();
        for offset in [0u64, 4, 8, 12] {
            let read = frame(
                msg::TREAD,
                5,
                &[Field::W(1), Field::D(offset), Field::W(4)],
            );
            dispatcher.dispatch(0, &read).await.unwrap();
            let reply = rx.recv().await.unwrap();
            assert_eq!(reply.frame[4], msg::TREAD + 1);
            let mut src = SliceSource::new(&reply.frame[HEADER_SIZE..]);
            let n = src.read_u32().unwrap() as usize;
            assembled.extend_from_slice(&src.read_bytes(n).unwrap());
        }

        assert_eq!(assembled, b"stub contents");
        assert_eq!(
            dispatcher
                .backend
                .reads
                .load(std::sync::atomic::Ordering::SeqCst),
            1
        );
    }

    #[tokio::test]
    async fn read_clamps_count_to_file_end() {
        let (dispatcher, mut rx) = setup(StubBackend::new());
        attach(&dispatcher, &mut rx).await;

        let walk = frame(
            msg::TWALK,
            2,
            &[Field::W(0), Field::W(1), Field::H(1), Field::S("file".to_string())],
        );
        dispatcher.dispatch(0, &walk).await.unwrap();
        rx.recv().await.unwrap();

        let read = frame(
            msg::TREAD,
            3,
            &[Field::W(1), Field::D(8), Field::W(4096)],
        );
        dispatcher.dispatch(0, &read).await.unwrap();
        let reply = rx.recv().await.unwrap();
        let mut src = SliceSource::new(&reply.frame[HEADER_SIZE..]);
        let n = src.read_u32().unwrap() as usize;
        assert_eq!(src.read_bytes(n).unwrap(), b"tents");
    }

    #[tokio::test]
    async fn readdir_starts_with_dot_entries() {
        let (dispatcher, mut rx) = setup(StubBackend::new());
        attach(&dispatcher, &mut rx).await;

        let readdir = frame(
            msg::TREADDIR,
            4,
            &[Field::W(0), Field::D(0), Field::W(4096)],
        );
        dispatcher.dispatch(0, &readdir).await.unwrap();
        let reply = rx.recv().await.unwrap();
        assert_eq!(reply.frame[4], msg::TREADDIR + 1);

        let mut src = SliceSource::new(&reply.frame[HEADER_SIZE..]);
        let count = src.read_u32().unwrap() as usize;
        let data = src.read_bytes(count).unwrap();

        let mut entries = SliceSource::new(&data);
        let mut names = Vec::new();
        while entries.remaining() > 0 {
            let _qid = entries.read_qid().unwrap();
            let _offset = entries.read_u64().unwrap();
            let _type = entries.read_u8().unwrap();
            names.push(entries.read_string().unwrap());
        }
        assert_eq!(names, vec![".", "..", "file"]);
    }

    #[test]
    fn join_and_parent_are_inverse_at_one_level() {
        assert_eq!(join("/", "a"), "/a");
        assert_eq!(join("/a", "b"), "/a/b");
        assert_eq!(parent_of("/a/b"), "/a");
        assert_eq!(parent_of("/a"), "/");
        assert_eq!(parent_of("/"), "/");
    }

    #[test]
    fn time_fields_round_seconds_and_scale_nanos() {
        assert_eq!(time_fields(1500), (2, 1_500_000_000));
        assert_eq!(time_fields(1499), (1, 1_499_000_000));
        assert_eq!(time_fields(0), (0, 0));
    }
}
