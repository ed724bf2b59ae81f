//! Path/handle operation surface.
//!
//! Every operation wraps its remote calls in a classification loop: a
//! protocol outcome is returned to the host verbatim, a transport fault is
//! handed to the session manager and the original operation retried once
//! recovery completes — or reported as `ENODEV` when recovery is exhausted
//! or disabled. Streaming reads and writes additionally run under the flow
//! controller and, when enabled, transparently re-open their file handle
//! after a reconnect.

use std::time::Instant;

use bytes::{Bytes, BytesMut};
use log::{debug, warn};
use nix::errno::Errno;

use crate::client::{
    ConnectError, EntryKind, FileId, OpenMode, ShareClient, ShareError, ShareResult, ShareStat,
    UnixTime,
};
use crate::config::MountOptions;
use crate::flow::{self, TransferState, WriteChunk};
use crate::session::{Connector, Prompter, Resource, SessionManager};

pub type OpResult<T> = Result<T, Errno>;

/// Per-open state handed across the host boundary, in the manner of
/// `fuse_file_info`: nothing but the integer handle.
///
/// Stream operations may rewrite `fh` during handle recovery; the value is
/// not numerically stable across reconnects.
#[derive(Debug, Default, Clone, Copy)]
pub struct FileInfo {
    pub fh: u64,
}

/// Attributes in host shape: a mode word plus pass-through fields.
#[derive(Debug, Clone, Copy)]
pub struct FileAttr {
    pub mode: u32,
    pub ino: u64,
    pub nlink: u32,
    pub size: u64,
    pub atime: UnixTime,
    pub mtime: UnixTime,
    pub ctime: UnixTime,
}

#[derive(Debug, Clone)]
pub struct DirEntry {
    pub name: String,
    pub attr: FileAttr,
}

/// Volume statistics after host-side shaping.
#[derive(Debug, Clone, Copy)]
pub struct FsStat {
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
    pub read_only: bool,
}

fn fill_attr(st: &ShareStat) -> FileAttr {
    let kind_bits = match st.kind {
        EntryKind::File => libc::S_IFREG,
        EntryKind::Directory => libc::S_IFDIR,
        EntryKind::Symlink => libc::S_IFLNK,
    };
    // The protocol carries no POSIX permission bits; grant the owner
    // everything, matching what the share will actually enforce remotely.
    FileAttr {
        mode: (kind_bits | libc::S_IRWXU) as u32,
        ino: st.ino,
        nlink: st.nlink,
        size: st.size,
        atime: st.atime,
        mtime: st.mtime,
        ctime: st.ctime,
    }
}

/// Classification loop shared by the plain path operations: protocol
/// outcomes break out verbatim, transport faults drive the session manager
/// and retry, exhausted recovery yields `ENODEV`.
macro_rules! retry_remote {
    ($self:ident, $sess:ident, $call:expr) => {{
        loop {
            let (_, $sess) = $self.manager.ensure().await?;
            match $call {
                Ok(value) => break Ok::<_, Errno>(value),
                Err(ShareError::Errno(errno)) => break Err(errno),
                Err(ShareError::Fault(fault)) => {
                    if !$self.manager.fault(fault).await {
                        break Err(Errno::ENODEV);
                    }
                }
            }
        }
    }};
}

/// The mounted share: one session manager plus the host-facing operations.
pub struct ShareFs<B: Connector, P: Prompter> {
    manager: SessionManager<B, P>,
    volume: String,
}

impl<B: Connector, P: Prompter> std::fmt::Debug for ShareFs<B, P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShareFs")
            .field("volume", &self.volume)
            .finish_non_exhaustive()
    }
}

impl<B: Connector, P: Prompter> ShareFs<B, P> {
    /// Mounts the share. Establishment failures are fatal here and never
    /// enter the retry loop.
    pub async fn mount(connector: B, prompter: P, opts: MountOptions) -> Result<Self, ConnectError> {
        let volume = opts.volume_name();
        let mut manager = SessionManager::new(connector, prompter, opts);
        manager.establish().await?;
        Ok(Self { manager, volume })
    }

    pub fn volume_name(&self) -> &str {
        &self.volume
    }

    pub async fn unmount(&mut self) {
        self.manager.shutdown().await;
    }

    fn deny_if_read_only(&self) -> OpResult<()> {
        if self.manager.options().read_only {
            Err(Errno::EROFS)
        } else {
            Ok(())
        }
    }

    /// Volume statistics with host shaping: block counts are halved (and
    /// the fragment size doubled) until they fit a 32-bit host field, and
    /// name length is capped at 255.
    ///
    /// When no session is up this reports `ENODEV` without attempting
    /// reconnection — the host polls statfs far too often for prompting to
    /// be tolerable. Faults during an in-flight statfs still take the
    /// normal recovery path.
    pub async fn statfs(&mut self, path: &str) -> OpResult<FsStat> {
        if self.manager.online().is_none() {
            return Err(Errno::ENODEV);
        }
        let path = if path.is_empty() { "/" } else { path };
        let vs = retry_remote!(self, sess, {
            let full = sess.full_path(path);
            sess.client.statvfs(&full).await
        })?;

        let mut frsize = vs.frsize;
        let (mut blocks, mut bfree, mut bavail) = (vs.blocks, vs.bfree, vs.bavail);
        while blocks > i32::MAX as u64 {
            frsize <<= 1;
            blocks >>= 1;
            bfree >>= 1;
            bavail >>= 1;
        }

        Ok(FsStat {
            bsize: vs.bsize,
            frsize,
            blocks,
            bfree,
            bavail,
            files: vs.files,
            ffree: vs.ffree,
            favail: vs.favail,
            fsid: vs.fsid,
            namemax: vs.namemax.min(255),
            read_only: self.manager.options().read_only,
        })
    }

    pub async fn getattr(&mut self, path: &str) -> OpResult<FileAttr> {
        let st = retry_remote!(self, sess, {
            let full = sess.full_path(path);
            sess.client.stat(&full).await
        })?;
        Ok(fill_attr(&st))
    }

    /// Attribute query by handle. No handle recovery here: after a
    /// reconnect the retry re-resolves against the new registry and
    /// surfaces `EINVAL`.
    pub async fn fgetattr(&mut self, _path: &str, fi: &FileInfo) -> OpResult<FileAttr> {
        loop {
            let (_, sess) = self.manager.ensure().await?;
            let Some(Resource::File(file)) = sess.handles.resolve(fi.fh as u32) else {
                return Err(Errno::EINVAL);
            };
            match sess.client.fstat(file).await {
                Ok(st) => return Ok(fill_attr(&st)),
                Err(ShareError::Errno(errno)) => return Err(errno),
                Err(ShareError::Fault(fault)) => {
                    if !self.manager.fault(fault).await {
                        return Err(Errno::ENODEV);
                    }
                }
            }
        }
    }

    pub async fn mkdir(&mut self, path: &str) -> OpResult<()> {
        self.deny_if_read_only()?;
        retry_remote!(self, sess, {
            let full = sess.full_path(path);
            sess.client.mkdir(&full).await
        })
    }

    pub async fn opendir(&mut self, path: &str) -> OpResult<FileInfo> {
        loop {
            let (_, sess) = self.manager.ensure().await?;
            let full = sess.full_path(path);
            match sess.client.opendir(&full).await {
                Ok(dir) => {
                    let fh = sess.handles.allocate(Resource::Dir(dir));
                    if fh == 0 {
                        warn!("handle table exhausted opening directory {full:?}");
                        if let Err(err) = sess.client.closedir(dir).await {
                            debug!("closedir after table exhaustion: {err}");
                        }
                        return Err(Errno::ENOMEM);
                    }
                    return Ok(FileInfo { fh: fh as u64 });
                }
                Err(ShareError::Errno(errno)) => return Err(errno),
                Err(ShareError::Fault(fault)) => {
                    if !self.manager.fault(fault).await {
                        return Err(Errno::ENODEV);
                    }
                }
            }
        }
    }

    /// Full enumeration of an open directory, attributes included.
    pub async fn readdir(&mut self, _path: &str, fi: &FileInfo) -> OpResult<Vec<DirEntry>> {
        loop {
            let (_, sess) = self.manager.ensure().await?;
            let Some(Resource::Dir(dir)) = sess.handles.resolve(fi.fh as u32) else {
                return Err(Errno::EINVAL);
            };
            let mut entries = Vec::new();
            let mut fault = None;
            loop {
                match sess.client.readdir(dir).await {
                    Ok(Some(entry)) => entries.push(DirEntry {
                        attr: fill_attr(&entry.stat),
                        name: entry.name,
                    }),
                    Ok(None) => return Ok(entries),
                    Err(ShareError::Errno(errno)) => return Err(errno),
                    Err(ShareError::Fault(kind)) => {
                        fault = Some(kind);
                        break;
                    }
                }
            }
            if let Some(kind) = fault {
                if !self.manager.fault(kind).await {
                    return Err(Errno::ENODEV);
                }
            }
            // retry re-resolves the handle, which the fresh registry
            // rejects — no handle recovery for directory enumerations
        }
    }

    pub async fn releasedir(&mut self, _path: &str, fi: &mut FileInfo) -> OpResult<()> {
        let (_, sess) = self.manager.ensure().await?;
        let Some(Resource::Dir(dir)) = sess.handles.resolve(fi.fh as u32) else {
            return Err(Errno::EINVAL);
        };
        if let Err(err) = sess.client.closedir(dir).await {
            debug!("closedir: {err}");
        }
        sess.handles.release(fi.fh as u32);
        fi.fh = 0;
        Ok(())
    }

    /// Opens read-write (read-only on a read-only mount), degrading to
    /// read-only when the protocol rejects that specific mode.
    pub async fn open(&mut self, path: &str) -> OpResult<FileInfo> {
        loop {
            let (_, sess) = self.manager.ensure().await?;
            let full = sess.full_path(path);
            let mode = if sess.read_only {
                OpenMode::ReadOnly
            } else {
                OpenMode::ReadWrite
            };
            match open_with_fallback(&sess.client, &full, mode).await {
                Ok(file) => {
                    let fh = sess.handles.allocate(Resource::File(file));
                    if fh == 0 {
                        warn!("handle table exhausted opening {full:?}");
                        if let Err(err) = sess.client.close(file).await {
                            debug!("close after table exhaustion: {err}");
                        }
                        return Err(Errno::ENOMEM);
                    }
                    return Ok(FileInfo { fh: fh as u64 });
                }
                Err(ShareError::Errno(errno)) => return Err(errno),
                Err(ShareError::Fault(fault)) => {
                    if !self.manager.fault(fault).await {
                        return Err(Errno::ENODEV);
                    }
                }
            }
        }
    }

    /// Exclusive create, opened read-write. No mode fallback.
    pub async fn create(&mut self, path: &str) -> OpResult<FileInfo> {
        self.deny_if_read_only()?;
        loop {
            let (_, sess) = self.manager.ensure().await?;
            let full = sess.full_path(path);
            match sess.client.create(&full).await {
                Ok(file) => {
                    let fh = sess.handles.allocate(Resource::File(file));
                    if fh == 0 {
                        warn!("handle table exhausted creating {full:?}");
                        if let Err(err) = sess.client.close(file).await {
                            debug!("close after table exhaustion: {err}");
                        }
                        return Err(Errno::ENOMEM);
                    }
                    return Ok(FileInfo { fh: fh as u64 });
                }
                Err(ShareError::Errno(errno)) => return Err(errno),
                Err(ShareError::Fault(fault)) => {
                    if !self.manager.fault(fault).await {
                        return Err(Errno::ENODEV);
                    }
                }
            }
        }
    }

    pub async fn release(&mut self, _path: &str, fi: &mut FileInfo) -> OpResult<()> {
        let (_, sess) = self.manager.ensure().await?;
        let Some(Resource::File(file)) = sess.handles.resolve(fi.fh as u32) else {
            return Err(Errno::EINVAL);
        };
        if let Err(err) = sess.client.close(file).await {
            debug!("close: {err}");
        }
        sess.handles.release(fi.fh as u32);
        fi.fh = 0;
        Ok(())
    }

    /// Streaming read. Chunks are bounded by the negotiated maximum read
    /// size; pending responses are drained on the flow controller's
    /// cadence, one final drain runs after the loop, and an empty chunk
    /// (EOF) ends the transfer early with the bytes gathered so far.
    pub async fn read(
        &mut self,
        path: &str,
        fi: &mut FileInfo,
        offset: u64,
        size: u32,
    ) -> OpResult<Bytes> {
        let recovery = self.manager.options().handle_recovery;
        let mut reopen_first = false;
        loop {
            if reopen_first {
                self.recover_handle(path, fi).await?;
                reopen_first = false;
            }
            let (fresh, _) = self.manager.ensure().await?;
            if fresh && recovery {
                // the session was just re-established on entry; the caller
                // still holds a handle from the dead registry
                reopen_first = true;
                continue;
            }
            let (_, sess) = self.manager.ensure().await?;
            let Some(Resource::File(file)) = sess.handles.resolve(fi.fh as u32) else {
                return Err(Errno::EINVAL);
            };

            let max_read = sess.client.max_read_size().max(1);
            let mut pacing = TransferState::new(Instant::now());
            let mut out = BytesMut::with_capacity(size as usize);
            let mut outcome: ShareResult<()> = Ok(());

            while (out.len() as u32) < size {
                let want = (size - out.len() as u32).min(max_read);
                match sess.client.read(file, offset + out.len() as u64, want).await {
                    Ok(chunk) if chunk.is_empty() => break,
                    Ok(chunk) => {
                        out.extend_from_slice(&chunk);
                        if pacing.service_due(chunk.len() as u64) {
                            flow::drain(&sess.client).await;
                        }
                        if pacing.keepalive_due(Instant::now()) {
                            if let Err(err) = sess.client.echo().await {
                                debug!("keep-alive failed: {err}");
                            }
                        }
                    }
                    Err(err) => {
                        outcome = Err(err);
                        break;
                    }
                }
            }

            match outcome {
                Ok(()) => {
                    flow::drain(&sess.client).await;
                    return Ok(out.freeze());
                }
                Err(ShareError::Errno(errno)) => {
                    flow::drain(&sess.client).await;
                    return Err(errno);
                }
                Err(ShareError::Fault(fault)) => {
                    if !self.manager.fault(fault).await {
                        return Err(Errno::ENODEV);
                    }
                    if !recovery {
                        // session is back, but the stream handle is gone
                        return Err(Errno::EIO);
                    }
                    reopen_first = true;
                }
            }
        }
    }

    /// Streaming write under adaptive chunk sizing: 64 KiB initial chunk,
    /// doubling after four consecutive successes up to the negotiated
    /// maximum, never shrinking on failure. A transport fault restarts the
    /// whole transfer on the recovered session.
    pub async fn write(
        &mut self,
        path: &str,
        fi: &mut FileInfo,
        offset: u64,
        data: &[u8],
    ) -> OpResult<usize> {
        self.deny_if_read_only()?;
        let recovery = self.manager.options().handle_recovery;
        let mut reopen_first = false;
        loop {
            if reopen_first {
                self.recover_handle(path, fi).await?;
                reopen_first = false;
            }
            let (fresh, _) = self.manager.ensure().await?;
            if fresh && recovery {
                reopen_first = true;
                continue;
            }
            let (_, sess) = self.manager.ensure().await?;
            let Some(Resource::File(file)) = sess.handles.resolve(fi.fh as u32) else {
                return Err(Errno::EINVAL);
            };

            let mut chunk = WriteChunk::new(sess.client.max_write_size().max(1));
            let mut pacing = TransferState::new(Instant::now());
            let mut written = 0usize;
            let mut outcome: ShareResult<()> = Ok(());

            while written < data.len() {
                let end = (written + chunk.size() as usize).min(data.len());
                match sess
                    .client
                    .write(file, offset + written as u64, &data[written..end])
                    .await
                {
                    Ok(0) => break, // server accepted nothing; report the partial count
                    Ok(accepted) => {
                        written += accepted as usize;
                        if pacing.service_due(accepted as u64) {
                            flow::drain(&sess.client).await;
                        }
                        if pacing.keepalive_due(Instant::now()) {
                            if let Err(err) = sess.client.echo().await {
                                debug!("keep-alive failed: {err}");
                            }
                        }
                        chunk.note_success();
                    }
                    Err(err) => {
                        outcome = Err(err);
                        break;
                    }
                }
            }

            match outcome {
                Ok(()) => {
                    flow::drain(&sess.client).await;
                    return Ok(written);
                }
                Err(ShareError::Errno(errno)) => {
                    flow::drain(&sess.client).await;
                    return Err(errno);
                }
                Err(ShareError::Fault(fault)) => {
                    if !self.manager.fault(fault).await {
                        return Err(Errno::ENODEV);
                    }
                    if !recovery {
                        return Err(Errno::EIO);
                    }
                    reopen_first = true;
                }
            }
        }
    }

    pub async fn truncate(&mut self, path: &str, size: u64) -> OpResult<()> {
        self.deny_if_read_only()?;
        retry_remote!(self, sess, {
            let full = sess.full_path(path);
            sess.client.truncate(&full, size).await
        })
    }

    /// Handle-based truncate; participates in handle recovery like the
    /// stream operations.
    pub async fn ftruncate(&mut self, path: &str, fi: &mut FileInfo, size: u64) -> OpResult<()> {
        self.deny_if_read_only()?;
        let recovery = self.manager.options().handle_recovery;
        let mut reopen_first = false;
        loop {
            if reopen_first {
                self.recover_handle(path, fi).await?;
                reopen_first = false;
            }
            let (fresh, _) = self.manager.ensure().await?;
            if fresh && recovery {
                reopen_first = true;
                continue;
            }
            let (_, sess) = self.manager.ensure().await?;
            let Some(Resource::File(file)) = sess.handles.resolve(fi.fh as u32) else {
                return Err(Errno::EINVAL);
            };
            match sess.client.ftruncate(file, size).await {
                Ok(()) => return Ok(()),
                Err(ShareError::Errno(errno)) => return Err(errno),
                Err(ShareError::Fault(fault)) => {
                    if !self.manager.fault(fault).await {
                        return Err(Errno::ENODEV);
                    }
                    if !recovery {
                        return Err(Errno::EIO);
                    }
                    reopen_first = true;
                }
            }
        }
    }

    pub async fn utimens(&mut self, path: &str, atime: UnixTime, mtime: UnixTime) -> OpResult<()> {
        self.deny_if_read_only()?;
        retry_remote!(self, sess, {
            let full = sess.full_path(path);
            sess.client.utimens(&full, atime, mtime).await
        })
    }

    pub async fn unlink(&mut self, path: &str) -> OpResult<()> {
        self.deny_if_read_only()?;
        retry_remote!(self, sess, {
            let full = sess.full_path(path);
            sess.client.unlink(&full).await
        })
    }

    /// Directory removal with an explicit emptiness pre-check, so the host
    /// sees `ENOTEMPTY` instead of a protocol-mapped failure, and the
    /// deletion call is never issued for a populated directory.
    pub async fn rmdir(&mut self, path: &str) -> OpResult<()> {
        self.deny_if_read_only()?;
        'attempt: loop {
            let (_, sess) = self.manager.ensure().await?;
            let full = sess.full_path(path);
            let dir = match sess.client.opendir(&full).await {
                Ok(dir) => dir,
                Err(ShareError::Errno(errno)) => return Err(errno),
                Err(ShareError::Fault(fault)) => {
                    if !self.manager.fault(fault).await {
                        return Err(Errno::ENODEV);
                    }
                    continue 'attempt;
                }
            };

            let mut not_empty = false;
            loop {
                match sess.client.readdir(dir).await {
                    Ok(Some(entry)) => {
                        if entry.name != "." && entry.name != ".." {
                            not_empty = true;
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(ShareError::Errno(errno)) => {
                        if let Err(err) = sess.client.closedir(dir).await {
                            debug!("closedir: {err}");
                        }
                        return Err(errno);
                    }
                    Err(ShareError::Fault(fault)) => {
                        if !self.manager.fault(fault).await {
                            return Err(Errno::ENODEV);
                        }
                        continue 'attempt;
                    }
                }
            }
            if let Err(err) = sess.client.closedir(dir).await {
                debug!("closedir: {err}");
            }
            if not_empty {
                return Err(Errno::ENOTEMPTY);
            }

            match sess.client.rmdir(&full).await {
                Ok(()) => return Ok(()),
                Err(ShareError::Errno(errno)) => return Err(errno),
                Err(ShareError::Fault(fault)) => {
                    if !self.manager.fault(fault).await {
                        return Err(Errno::ENODEV);
                    }
                }
            }
        }
    }

    pub async fn readlink(&mut self, path: &str) -> OpResult<String> {
        retry_remote!(self, sess, {
            let full = sess.full_path(path);
            sess.client.readlink(&full).await
        })
    }

    pub async fn rename(&mut self, from: &str, to: &str) -> OpResult<()> {
        self.deny_if_read_only()?;
        retry_remote!(self, sess, {
            let src = sess.full_path(from);
            let dst = sess.full_path(to);
            sess.client.rename(&src, &dst).await
        })
    }

    /// Volume relabeling is accepted and ignored; the label is fixed at
    /// mount time.
    pub async fn relabel(&mut self, _label: &str) -> OpResult<()> {
        Ok(())
    }

    /// Handle recovery: re-opens the file by its original path (the mode
    /// logic of [`ShareFs::open`] re-applies, read-write degrading to
    /// read-only) and rewrites the caller's handle from the new registry.
    /// Any failure to re-open is reported as an I/O error.
    async fn recover_handle(&mut self, path: &str, fi: &mut FileInfo) -> OpResult<()> {
        match self.open(path).await {
            Ok(reopened) => {
                debug!("recovered stream handle for {path:?}");
                fi.fh = reopened.fh;
                Ok(())
            }
            Err(errno) => {
                warn!("handle recovery failed to re-open {path:?}: {errno}");
                Err(Errno::EIO)
            }
        }
    }
}

async fn open_with_fallback<C: ShareClient>(
    client: &C,
    path: &str,
    mode: OpenMode,
) -> ShareResult<FileId> {
    match client.open(path, mode).await {
        Err(ShareError::Errno(errno)) if mode == OpenMode::ReadWrite => {
            debug!("read-write open of {path:?} rejected ({errno}); retrying read-only");
            client.open(path, OpenMode::ReadOnly).await
        }
        outcome => outcome,
    }
}
