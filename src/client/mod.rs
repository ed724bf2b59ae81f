//! Remote share protocol-client interface.
//!
//! The wire protocol itself (encoding, negotiation, authentication) lives
//! behind [`ShareClient`]; this crate only classifies its outcomes and
//! sequences its calls. A client instance represents one connected session
//! and dies with it — reconnection builds a new instance through a
//! [`crate::session::Connector`].

pub mod memshare;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

pub use nix::errno::Errno;

/// Client-scoped identifier of an open file on the remote side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileId(pub u64);

/// Client-scoped identifier of an open directory enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DirId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    ReadWrite,
    ReadOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
    Symlink,
}

/// Seconds/nanoseconds pair as carried by the protocol.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UnixTime {
    pub sec: i64,
    pub nsec: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct ShareStat {
    pub kind: EntryKind,
    pub ino: u64,
    pub nlink: u32,
    pub size: u64,
    pub atime: UnixTime,
    pub mtime: UnixTime,
    pub ctime: UnixTime,
}

#[derive(Debug, Clone)]
pub struct ShareDirEntry {
    pub name: String,
    pub stat: ShareStat,
}

/// Raw volume statistics as reported by the remote share.
#[derive(Debug, Clone, Copy)]
pub struct VolumeStat {
    pub bsize: u32,
    pub frsize: u32,
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub files: u64,
    pub ffree: u64,
    pub favail: u64,
    pub fsid: u64,
    pub namemax: u32,
}

/// Failure originating in the connection/session layer.
///
/// All variants are treated identically by the recovery machinery; the
/// distinction exists for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FaultKind {
    #[error("connection reset")]
    ConnectionReset,
    #[error("send failed")]
    SendFailed,
    #[error("receive failed")]
    RecvFailed,
    #[error("operation cancelled by transport")]
    Cancelled,
    #[error("operation timed out")]
    TimedOut,
}

/// Outcome classification for every remote call.
///
/// `Fault` is transient connectivity trouble and drives reconnection;
/// `Errno` is a well-defined filesystem-level result and is returned to the
/// caller verbatim, without retry or session teardown. Conflating the two
/// would either retry-loop forever on real errors or tear down a healthy
/// session on recoverable noise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ShareError {
    #[error("transport fault: {0}")]
    Fault(FaultKind),
    #[error("{0}")]
    Errno(Errno),
}

impl From<Errno> for ShareError {
    fn from(errno: Errno) -> Self {
        ShareError::Errno(errno)
    }
}

impl From<FaultKind> for ShareError {
    fn from(kind: FaultKind) -> Self {
        ShareError::Fault(kind)
    }
}

pub type ShareResult<T> = Result<T, ShareError>;

/// Fatal session-establishment failures.
///
/// These surface to the operator and never enter the retry loop.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("invalid share location {0:?}")]
    InvalidLocation(String),
    #[error("no password available for {user}@{server}")]
    MissingPassword { user: String, server: String },
    #[error("authentication rejected for {user}@{server}: {reason}")]
    AuthRejected {
        user: String,
        server: String,
        reason: String,
    },
    #[error("failed to reach {server}: {reason}")]
    Unreachable { server: String, reason: String },
}

/// One connected protocol session.
///
/// Paths are share-relative without a leading slash (the empty string is
/// the share root). Read/write are offset-based and bounded by the
/// server-negotiated maximum transfer sizes; callers are expected to chunk
/// accordingly and to call [`ShareClient::service`] periodically during
/// long transfers so the credit-based transport does not stall.
#[async_trait]
pub trait ShareClient: Send + Sync {
    async fn statvfs(&self, path: &str) -> ShareResult<VolumeStat>;
    async fn stat(&self, path: &str) -> ShareResult<ShareStat>;
    async fn fstat(&self, file: FileId) -> ShareResult<ShareStat>;

    async fn open(&self, path: &str, mode: OpenMode) -> ShareResult<FileId>;
    /// Exclusive create, opened read-write.
    async fn create(&self, path: &str) -> ShareResult<FileId>;
    async fn close(&self, file: FileId) -> ShareResult<()>;

    /// Reads up to `len` bytes at `offset`; an empty buffer signals EOF.
    async fn read(&self, file: FileId, offset: u64, len: u32) -> ShareResult<Bytes>;
    /// Writes `data` at `offset`, returning the number of bytes accepted.
    async fn write(&self, file: FileId, offset: u64, data: &[u8]) -> ShareResult<u32>;

    async fn truncate(&self, path: &str, size: u64) -> ShareResult<()>;
    async fn ftruncate(&self, file: FileId, size: u64) -> ShareResult<()>;
    async fn utimens(&self, path: &str, atime: UnixTime, mtime: UnixTime) -> ShareResult<()>;

    async fn mkdir(&self, path: &str) -> ShareResult<()>;
    async fn rmdir(&self, path: &str) -> ShareResult<()>;
    async fn unlink(&self, path: &str) -> ShareResult<()>;
    async fn rename(&self, from: &str, to: &str) -> ShareResult<()>;
    async fn readlink(&self, path: &str) -> ShareResult<String>;

    async fn opendir(&self, path: &str) -> ShareResult<DirId>;
    /// Next entry of an open enumeration, `None` once exhausted.
    async fn readdir(&self, dir: DirId) -> ShareResult<Option<ShareDirEntry>>;
    async fn closedir(&self, dir: DirId) -> ShareResult<()>;

    /// Non-blocking servicing of pending protocol responses.
    ///
    /// Returns how many responses were processed; `0` means none were
    /// pending. Never blocks.
    async fn service(&self) -> ShareResult<u32>;
    /// Protocol-level keep-alive request.
    async fn echo(&self) -> ShareResult<()>;

    /// Server-negotiated maximum read size in bytes.
    fn max_read_size(&self) -> u32;
    /// Server-negotiated maximum write size in bytes.
    fn max_write_size(&self) -> u32;
    /// Human-readable description of the most recent failure.
    fn last_error(&self) -> String;

    /// Orderly teardown on unmount. Faulted sessions are simply dropped.
    async fn disconnect(&self) -> ShareResult<()>;
}
