//! In-memory share backend with scripted fault injection.
//!
//! Backs the demo binary and the test suites: a real [`ShareClient`]
//! implementation over a process-local tree, sharing its store across
//! session generations the way a remote server survives a dropped
//! connection. Faults are injected per operation through a [`FaultPlan`];
//! once one fires, the session is dead and every further call on it
//! faults, until the connector hands out a replacement.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use nix::errno::Errno;

use crate::client::{
    ConnectError, DirId, EntryKind, FaultKind, FileId, OpenMode, ShareClient, ShareDirEntry,
    ShareError, ShareResult, ShareStat, UnixTime, VolumeStat,
};
use crate::config::MountOptions;
use crate::session::{Connector, Prompter};

/// Operation selector for fault injection and call accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    Statvfs,
    Stat,
    Fstat,
    Open,
    Create,
    Close,
    Read,
    Write,
    Truncate,
    Ftruncate,
    Utimens,
    Mkdir,
    Rmdir,
    Unlink,
    Rename,
    Readlink,
    Opendir,
    Readdir,
    Closedir,
    Service,
    Echo,
}

struct FaultArm {
    op: OpKind,
    /// Calls of `op` to let through before firing.
    after: u32,
    kind: FaultKind,
}

/// Scripted transport faults, shared between the connector and its
/// sessions so a script outlives any single session generation.
#[derive(Default)]
pub struct FaultPlan {
    arms: Mutex<Vec<FaultArm>>,
}

impl FaultPlan {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arms a fault: the `after`-th next call of `op` (0 = the very next)
    /// fails with `kind` and kills the session.
    pub fn inject(&self, op: OpKind, after: u32, kind: FaultKind) {
        self.arms.lock().unwrap().push(FaultArm { op, after, kind });
    }

    fn take(&self, op: OpKind) -> Option<FaultKind> {
        let mut arms = self.arms.lock().unwrap();
        let pos = arms.iter().position(|arm| arm.op == op)?;
        if arms[pos].after > 0 {
            arms[pos].after -= 1;
            return None;
        }
        Some(arms.remove(pos).kind)
    }
}

/// Call counters shared across session generations, for assertions.
#[derive(Default)]
pub struct CallStats {
    pub connects: AtomicU32,
    pub reads: AtomicU32,
    pub service_calls: AtomicU32,
    pub drains: AtomicU32,
    pub echoes: AtomicU32,
    pub rmdir_calls: AtomicU32,
    pub write_sizes: Mutex<Vec<u32>>,
}

struct Node {
    kind: EntryKind,
    ino: u64,
    data: Vec<u8>,
    target: String,
    atime: UnixTime,
    mtime: UnixTime,
}

impl Node {
    fn stat(&self) -> ShareStat {
        let size = match self.kind {
            EntryKind::File => self.data.len() as u64,
            EntryKind::Symlink => self.target.len() as u64,
            EntryKind::Directory => 0,
        };
        ShareStat {
            kind: self.kind,
            ino: self.ino,
            nlink: if self.kind == EntryKind::Directory { 2 } else { 1 },
            size,
            atime: self.atime,
            mtime: self.mtime,
            ctime: self.mtime,
        }
    }
}

/// The share-side tree, keyed by share-relative path (`""` is the root).
pub struct MemStore {
    nodes: BTreeMap<String, Node>,
    next_ino: u64,
    vfs: VolumeStat,
}

impl MemStore {
    fn new() -> Self {
        let mut store = Self {
            nodes: BTreeMap::new(),
            next_ino: 1,
            vfs: VolumeStat {
                bsize: 4096,
                frsize: 4096,
                blocks: 1 << 20,
                bfree: 1 << 19,
                bavail: 1 << 19,
                files: 1 << 16,
                ffree: 1 << 15,
                favail: 1 << 15,
                fsid: 0x534d_4202,
                namemax: 255,
            },
        };
        store.insert("", EntryKind::Directory);
        store
    }

    fn key(path: &str) -> String {
        path.trim_matches('/').to_string()
    }

    fn insert(&mut self, path: &str, kind: EntryKind) -> &mut Node {
        let key = Self::key(path);
        let ino = self.next_ino;
        self.next_ino += 1;
        self.nodes.entry(key).or_insert(Node {
            kind,
            ino,
            data: Vec::new(),
            target: String::new(),
            atime: UnixTime::default(),
            mtime: UnixTime::default(),
        })
    }

    fn parent_exists(&self, key: &str) -> bool {
        match key.rsplit_once('/') {
            Some((parent, _)) => {
                matches!(self.nodes.get(parent), Some(n) if n.kind == EntryKind::Directory)
            }
            None => true, // parent is the root
        }
    }

    fn children(&self, key: &str) -> Vec<(String, ShareStat)> {
        let prefix = if key.is_empty() {
            String::new()
        } else {
            format!("{key}/")
        };
        self.nodes
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .filter(|(k, _)| !k.is_empty() && !k[prefix.len()..].contains('/'))
            .map(|(k, n)| (k[prefix.len()..].to_string(), n.stat()))
            .collect()
    }

    /// Test/demo seeding helpers.
    pub fn add_dir(&mut self, path: &str) {
        self.insert(path, EntryKind::Directory);
    }

    pub fn add_file(&mut self, path: &str, data: &[u8]) {
        self.insert(path, EntryKind::File).data = data.to_vec();
    }

    pub fn add_symlink(&mut self, path: &str, target: &str) {
        self.insert(path, EntryKind::Symlink).target = target.to_string();
    }

    pub fn file_data(&self, path: &str) -> Option<Vec<u8>> {
        self.nodes.get(&Self::key(path)).map(|n| n.data.clone())
    }

    pub fn set_volume_stat(&mut self, vfs: VolumeStat) {
        self.vfs = vfs;
    }
}

struct OpenState {
    path: String,
    mode: OpenMode,
}

struct DirSnapshot {
    entries: Vec<ShareDirEntry>,
    cursor: usize,
}

/// One in-memory session.
pub struct MemShare {
    store: Arc<Mutex<MemStore>>,
    faults: Arc<FaultPlan>,
    stats: Arc<CallStats>,
    alive: AtomicBool,
    opens: Mutex<HashMap<u64, OpenState>>,
    dirs: Mutex<HashMap<u64, DirSnapshot>>,
    next_id: AtomicU64,
    /// Responses not yet consumed by `service`; grows with every data
    /// transfer, models the credit bookkeeping of a real transport.
    pending: AtomicU32,
    max_read: u32,
    max_write: u32,
    deny_read_write_open: bool,
    last_error: Mutex<String>,
}

impl MemShare {
    fn gate(&self, op: OpKind) -> ShareResult<()> {
        if !self.alive.load(Ordering::Relaxed) {
            return Err(ShareError::Fault(FaultKind::ConnectionReset));
        }
        if let Some(kind) = self.faults.take(op) {
            self.alive.store(false, Ordering::Relaxed);
            *self.last_error.lock().unwrap() = format!("injected fault on {op:?}: {kind}");
            return Err(ShareError::Fault(kind));
        }
        Ok(())
    }

    fn fresh_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }
}

#[async_trait]
impl ShareClient for MemShare {
    async fn statvfs(&self, _path: &str) -> ShareResult<VolumeStat> {
        self.gate(OpKind::Statvfs)?;
        Ok(self.store.lock().unwrap().vfs)
    }

    async fn stat(&self, path: &str) -> ShareResult<ShareStat> {
        self.gate(OpKind::Stat)?;
        let store = self.store.lock().unwrap();
        match store.nodes.get(&MemStore::key(path)) {
            Some(node) => Ok(node.stat()),
            None => Err(Errno::ENOENT.into()),
        }
    }

    async fn fstat(&self, file: FileId) -> ShareResult<ShareStat> {
        self.gate(OpKind::Fstat)?;
        let opens = self.opens.lock().unwrap();
        let open = opens.get(&file.0).ok_or(ShareError::Errno(Errno::EBADF))?;
        let store = self.store.lock().unwrap();
        match store.nodes.get(&open.path) {
            Some(node) => Ok(node.stat()),
            None => Err(Errno::ENOENT.into()),
        }
    }

    async fn open(&self, path: &str, mode: OpenMode) -> ShareResult<FileId> {
        self.gate(OpKind::Open)?;
        let key = MemStore::key(path);
        {
            let store = self.store.lock().unwrap();
            let node = store.nodes.get(&key).ok_or(ShareError::Errno(Errno::ENOENT))?;
            if node.kind == EntryKind::Directory {
                return Err(Errno::EISDIR.into());
            }
            if mode == OpenMode::ReadWrite && self.deny_read_write_open {
                return Err(Errno::EACCES.into());
            }
        }
        let id = self.fresh_id();
        self.opens
            .lock()
            .unwrap()
            .insert(id, OpenState { path: key, mode });
        Ok(FileId(id))
    }

    async fn create(&self, path: &str) -> ShareResult<FileId> {
        self.gate(OpKind::Create)?;
        let key = MemStore::key(path);
        {
            let mut store = self.store.lock().unwrap();
            if store.nodes.contains_key(&key) {
                return Err(Errno::EEXIST.into());
            }
            if !store.parent_exists(&key) {
                return Err(Errno::ENOENT.into());
            }
            store.insert(&key, EntryKind::File);
        }
        let id = self.fresh_id();
        self.opens.lock().unwrap().insert(
            id,
            OpenState {
                path: key,
                mode: OpenMode::ReadWrite,
            },
        );
        Ok(FileId(id))
    }

    async fn close(&self, file: FileId) -> ShareResult<()> {
        self.gate(OpKind::Close)?;
        match self.opens.lock().unwrap().remove(&file.0) {
            Some(_) => Ok(()),
            None => Err(Errno::EBADF.into()),
        }
    }

    async fn read(&self, file: FileId, offset: u64, len: u32) -> ShareResult<Bytes> {
        self.gate(OpKind::Read)?;
        self.stats.reads.fetch_add(1, Ordering::Relaxed);
        let len = len.min(self.max_read);
        let opens = self.opens.lock().unwrap();
        let open = opens.get(&file.0).ok_or(ShareError::Errno(Errno::EBADF))?;
        let store = self.store.lock().unwrap();
        let node = store
            .nodes
            .get(&open.path)
            .ok_or(ShareError::Errno(Errno::ENOENT))?;
        let start = (offset as usize).min(node.data.len());
        let end = (start + len as usize).min(node.data.len());
        self.pending.fetch_add(1, Ordering::Relaxed);
        Ok(Bytes::copy_from_slice(&node.data[start..end]))
    }

    async fn write(&self, file: FileId, offset: u64, data: &[u8]) -> ShareResult<u32> {
        self.gate(OpKind::Write)?;
        let data = &data[..data.len().min(self.max_write as usize)];
        let opens = self.opens.lock().unwrap();
        let open = opens.get(&file.0).ok_or(ShareError::Errno(Errno::EBADF))?;
        if open.mode == OpenMode::ReadOnly {
            return Err(Errno::EACCES.into());
        }
        let mut store = self.store.lock().unwrap();
        let node = store
            .nodes
            .get_mut(&open.path)
            .ok_or(ShareError::Errno(Errno::ENOENT))?;
        let end = offset as usize + data.len();
        if node.data.len() < end {
            node.data.resize(end, 0);
        }
        node.data[offset as usize..end].copy_from_slice(data);
        self.stats
            .write_sizes
            .lock()
            .unwrap()
            .push(data.len() as u32);
        self.pending.fetch_add(1, Ordering::Relaxed);
        Ok(data.len() as u32)
    }

    async fn truncate(&self, path: &str, size: u64) -> ShareResult<()> {
        self.gate(OpKind::Truncate)?;
        let mut store = self.store.lock().unwrap();
        let node = store
            .nodes
            .get_mut(&MemStore::key(path))
            .ok_or(ShareError::Errno(Errno::ENOENT))?;
        if node.kind != EntryKind::File {
            return Err(Errno::EISDIR.into());
        }
        node.data.resize(size as usize, 0);
        Ok(())
    }

    async fn ftruncate(&self, file: FileId, size: u64) -> ShareResult<()> {
        self.gate(OpKind::Ftruncate)?;
        let opens = self.opens.lock().unwrap();
        let open = opens.get(&file.0).ok_or(ShareError::Errno(Errno::EBADF))?;
        if open.mode == OpenMode::ReadOnly {
            return Err(Errno::EACCES.into());
        }
        let mut store = self.store.lock().unwrap();
        let node = store
            .nodes
            .get_mut(&open.path)
            .ok_or(ShareError::Errno(Errno::ENOENT))?;
        node.data.resize(size as usize, 0);
        Ok(())
    }

    async fn utimens(&self, path: &str, atime: UnixTime, mtime: UnixTime) -> ShareResult<()> {
        self.gate(OpKind::Utimens)?;
        let mut store = self.store.lock().unwrap();
        let node = store
            .nodes
            .get_mut(&MemStore::key(path))
            .ok_or(ShareError::Errno(Errno::ENOENT))?;
        node.atime = atime;
        node.mtime = mtime;
        Ok(())
    }

    async fn mkdir(&self, path: &str) -> ShareResult<()> {
        self.gate(OpKind::Mkdir)?;
        let key = MemStore::key(path);
        let mut store = self.store.lock().unwrap();
        if store.nodes.contains_key(&key) {
            return Err(Errno::EEXIST.into());
        }
        if !store.parent_exists(&key) {
            return Err(Errno::ENOENT.into());
        }
        store.insert(&key, EntryKind::Directory);
        Ok(())
    }

    async fn rmdir(&self, path: &str) -> ShareResult<()> {
        self.gate(OpKind::Rmdir)?;
        self.stats.rmdir_calls.fetch_add(1, Ordering::Relaxed);
        let key = MemStore::key(path);
        let mut store = self.store.lock().unwrap();
        match store.nodes.get(&key) {
            Some(node) if node.kind == EntryKind::Directory => {}
            Some(_) => return Err(Errno::ENOTDIR.into()),
            None => return Err(Errno::ENOENT.into()),
        }
        if !store.children(&key).is_empty() {
            return Err(Errno::ENOTEMPTY.into());
        }
        store.nodes.remove(&key);
        Ok(())
    }

    async fn unlink(&self, path: &str) -> ShareResult<()> {
        self.gate(OpKind::Unlink)?;
        let key = MemStore::key(path);
        let mut store = self.store.lock().unwrap();
        match store.nodes.get(&key) {
            Some(node) if node.kind == EntryKind::Directory => Err(Errno::EISDIR.into()),
            Some(_) => {
                store.nodes.remove(&key);
                Ok(())
            }
            None => Err(Errno::ENOENT.into()),
        }
    }

    async fn rename(&self, from: &str, to: &str) -> ShareResult<()> {
        self.gate(OpKind::Rename)?;
        let from = MemStore::key(from);
        let to = MemStore::key(to);
        let mut store = self.store.lock().unwrap();
        if !store.nodes.contains_key(&from) {
            return Err(Errno::ENOENT.into());
        }
        if !store.parent_exists(&to) {
            return Err(Errno::ENOENT.into());
        }
        // move the node and, for directories, everything below it
        let moved: Vec<String> = store
            .nodes
            .keys()
            .filter(|k| **k == from || k.starts_with(&format!("{from}/")))
            .cloned()
            .collect();
        for old in moved {
            let node = store.nodes.remove(&old).unwrap();
            let new = format!("{}{}", to, &old[from.len()..]);
            store.nodes.insert(new, node);
        }
        Ok(())
    }

    async fn readlink(&self, path: &str) -> ShareResult<String> {
        self.gate(OpKind::Readlink)?;
        let store = self.store.lock().unwrap();
        match store.nodes.get(&MemStore::key(path)) {
            Some(node) if node.kind == EntryKind::Symlink => Ok(node.target.clone()),
            Some(_) => Err(Errno::EINVAL.into()),
            None => Err(Errno::ENOENT.into()),
        }
    }

    async fn opendir(&self, path: &str) -> ShareResult<DirId> {
        self.gate(OpKind::Opendir)?;
        let key = MemStore::key(path);
        let entries = {
            let store = self.store.lock().unwrap();
            let node = store.nodes.get(&key).ok_or(ShareError::Errno(Errno::ENOENT))?;
            if node.kind != EntryKind::Directory {
                return Err(Errno::ENOTDIR.into());
            }
            // snapshot semantics, dot entries included, like a real
            // directory enumeration
            let mut entries = vec![
                ShareDirEntry {
                    name: ".".into(),
                    stat: node.stat(),
                },
                ShareDirEntry {
                    name: "..".into(),
                    stat: node.stat(),
                },
            ];
            entries.extend(
                store
                    .children(&key)
                    .into_iter()
                    .map(|(name, stat)| ShareDirEntry { name, stat }),
            );
            entries
        };
        let id = self.fresh_id();
        self.dirs
            .lock()
            .unwrap()
            .insert(id, DirSnapshot { entries, cursor: 0 });
        Ok(DirId(id))
    }

    async fn readdir(&self, dir: DirId) -> ShareResult<Option<ShareDirEntry>> {
        self.gate(OpKind::Readdir)?;
        let mut dirs = self.dirs.lock().unwrap();
        let snapshot = dirs.get_mut(&dir.0).ok_or(ShareError::Errno(Errno::EBADF))?;
        let entry = snapshot.entries.get(snapshot.cursor).cloned();
        if entry.is_some() {
            snapshot.cursor += 1;
        }
        Ok(entry)
    }

    async fn closedir(&self, dir: DirId) -> ShareResult<()> {
        self.gate(OpKind::Closedir)?;
        match self.dirs.lock().unwrap().remove(&dir.0) {
            Some(_) => Ok(()),
            None => Err(Errno::EBADF.into()),
        }
    }

    async fn service(&self) -> ShareResult<u32> {
        self.gate(OpKind::Service)?;
        self.stats.service_calls.fetch_add(1, Ordering::Relaxed);
        let processed = self.pending.swap(0, Ordering::Relaxed);
        if processed > 0 {
            self.stats.drains.fetch_add(1, Ordering::Relaxed);
        }
        Ok(processed)
    }

    async fn echo(&self) -> ShareResult<()> {
        self.gate(OpKind::Echo)?;
        self.stats.echoes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn max_read_size(&self) -> u32 {
        self.max_read
    }

    fn max_write_size(&self) -> u32 {
        self.max_write
    }

    fn last_error(&self) -> String {
        self.last_error.lock().unwrap().clone()
    }

    async fn disconnect(&self) -> ShareResult<()> {
        self.alive.store(false, Ordering::Relaxed);
        Ok(())
    }
}

/// Hands out [`MemShare`] sessions over one shared store.
pub struct MemConnector {
    store: Arc<Mutex<MemStore>>,
    faults: Arc<FaultPlan>,
    stats: Arc<CallStats>,
    max_read: u32,
    max_write: u32,
    deny_read_write_open: AtomicBool,
    fail_connects: AtomicU32,
}

impl MemConnector {
    pub fn new() -> Self {
        Self {
            store: Arc::new(Mutex::new(MemStore::new())),
            faults: Arc::new(FaultPlan::new()),
            stats: Arc::new(CallStats::default()),
            max_read: 64 * 1024,
            max_write: 64 * 1024,
            deny_read_write_open: AtomicBool::new(false),
            fail_connects: AtomicU32::new(0),
        }
    }

    pub fn with_limits(max_read: u32, max_write: u32) -> Self {
        Self {
            max_read,
            max_write,
            ..Self::new()
        }
    }

    pub fn store(&self) -> &Arc<Mutex<MemStore>> {
        &self.store
    }

    pub fn faults(&self) -> &Arc<FaultPlan> {
        &self.faults
    }

    pub fn stats(&self) -> &Arc<CallStats> {
        &self.stats
    }

    /// Rejects read-write opens with `EACCES`, exercising the read-only
    /// open fallback.
    pub fn deny_read_write_opens(&self) {
        self.deny_read_write_open.store(true, Ordering::Relaxed);
    }

    /// Makes the next `n` connection attempts fail.
    pub fn fail_next_connects(&self, n: u32) {
        self.fail_connects.store(n, Ordering::Relaxed);
    }
}

impl Default for MemConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for MemConnector {
    type Client = MemShare;

    async fn connect(
        &self,
        opts: &MountOptions,
        prompter: &dyn Prompter,
    ) -> Result<MemShare, ConnectError> {
        if opts.server.is_empty() || opts.share.is_empty() {
            return Err(ConnectError::InvalidLocation(format!(
                "//{}/{}",
                opts.server, opts.share
            )));
        }
        let user = opts.user.clone().unwrap_or_else(|| "guest".into());
        if opts.password.is_none()
            && opts.prompt_password
            && prompter.request_password(&user, &opts.server).await.is_none()
        {
            return Err(ConnectError::MissingPassword {
                user,
                server: opts.server.clone(),
            });
        }

        let outstanding = self.fail_connects.load(Ordering::Relaxed);
        if outstanding > 0 {
            self.fail_connects.store(outstanding - 1, Ordering::Relaxed);
            return Err(ConnectError::Unreachable {
                server: opts.server.clone(),
                reason: "injected connect failure".into(),
            });
        }

        self.stats.connects.fetch_add(1, Ordering::Relaxed);
        Ok(MemShare {
            store: Arc::clone(&self.store),
            faults: Arc::clone(&self.faults),
            stats: Arc::clone(&self.stats),
            alive: AtomicBool::new(true),
            opens: Mutex::new(HashMap::new()),
            dirs: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            pending: AtomicU32::new(0),
            max_read: self.max_read,
            max_write: self.max_write,
            deny_read_write_open: self.deny_read_write_open.load(Ordering::Relaxed),
            last_error: Mutex::new(String::new()),
        })
    }
}

/// Non-interactive prompter with canned answers; `reconnects` is the
/// number of reconnect confirmations to grant (negative = unlimited).
pub struct AutoPrompter {
    pub password: Option<String>,
    reconnects: Mutex<i32>,
    pub reconnect_asks: AtomicU32,
}

impl AutoPrompter {
    pub fn new(password: Option<&str>, reconnects: i32) -> Self {
        Self {
            password: password.map(String::from),
            reconnects: Mutex::new(reconnects),
            reconnect_asks: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl Prompter for AutoPrompter {
    async fn request_password(&self, _user: &str, _server: &str) -> Option<String> {
        self.password.clone()
    }

    async fn confirm_reconnect(&self, _server: &str) -> bool {
        self.reconnect_asks.fetch_add(1, Ordering::Relaxed);
        let mut left = self.reconnects.lock().unwrap();
        if *left < 0 {
            return true;
        }
        if *left == 0 {
            return false;
        }
        *left -= 1;
        true
    }
}
