//! FUSE passthrough adapter for origin source trees.
//!
//! This module implements the `fuser::Filesystem` trait for `OriginFuseFS`,
//! forwarding every request to the directory being served.

use crate::provider::{is_mount_point, AttachedFilesystem, FilesystemProvider, ProviderError};
use crate::vfs::{InodeTable, ROOT_INODE};
use fuser::{
    FileAttr, FileType, Filesystem, MountOption, ReplyAttr, ReplyCreate, ReplyData,
    ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, Request,
    TimeOrNow,
};
use libc::{c_int, EINVAL, EIO, ENOENT, ENOTDIR, EROFS};
use log::{debug, info, trace, warn};
use origin_format::{staging, OriginKind};
use std::ffi::{CString, OsStr};
use std::fs::{self, DirBuilder, File, FileTimes, Metadata, OpenOptions};
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{DirBuilderExt, FileExt, MetadataExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tempfile::TempDir;

/// Time-to-live for cached attributes.
const TTL: Duration = Duration::from_secs(1);

/// FUSE filesystem serving a directory tree.
pub struct OriginFuseFS {
    /// Inode to relative path mapping.
    inodes: InodeTable,
    /// Reject every mutating request with `EROFS`.
    read_only: bool,
}

impl OriginFuseFS {
    /// Serve the tree rooted at `root`.
    pub fn new<P: Into<PathBuf>>(root: P, read_only: bool) -> Self {
        Self {
            inodes: InodeTable::new(root),
            read_only,
        }
    }

    /// Directory being served.
    pub fn root(&self) -> &Path {
        self.inodes.root()
    }

    /// Attributes of a relative path, assigning it an inode.
    fn attr_for(&mut self, rel: &Path) -> io::Result<FileAttr> {
        let meta = fs::symlink_metadata(self.inodes.root().join(rel))?;
        let ino = self.inodes.get_or_assign(rel);
        Ok(self.to_attr(ino, &meta))
    }

    fn attr_for_inode(&self, ino: u64) -> io::Result<FileAttr> {
        let path = self
            .inodes
            .absolute(ino)
            .ok_or_else(|| io::Error::from_raw_os_error(ENOENT))?;
        let meta = fs::symlink_metadata(path)?;
        Ok(self.to_attr(ino, &meta))
    }

    fn to_attr(&self, ino: u64, meta: &Metadata) -> FileAttr {
        let mut perm = (meta.mode() & 0o7777) as u16;
        if self.read_only {
            perm &= !0o222;
        }
        let mtime = to_system_time(meta.mtime(), meta.mtime_nsec());
        FileAttr {
            ino,
            size: meta.size(),
            blocks: meta.blocks(),
            atime: to_system_time(meta.atime(), meta.atime_nsec()),
            mtime,
            ctime: to_system_time(meta.ctime(), meta.ctime_nsec()),
            crtime: meta.created().unwrap_or(mtime),
            kind: file_type(meta.file_type()),
            perm,
            nlink: meta.nlink() as u32,
            uid: meta.uid(),
            gid: meta.gid(),
            rdev: meta.rdev() as u32,
            blksize: meta.blksize() as u32,
            flags: 0,
        }
    }

    fn child(&self, parent: u64, name: &OsStr) -> Result<PathBuf, c_int> {
        let name = name.to_str().ok_or(EINVAL)?;
        self.inodes.child_path(parent, name).ok_or(ENOENT)
    }

    fn writable(&self) -> Result<(), c_int> {
        if self.read_only {
            Err(EROFS)
        } else {
            Ok(())
        }
    }

    fn apply_setattr(
        &mut self,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
    ) -> Result<FileAttr, c_int> {
        self.writable()?;
        let path = self.inodes.absolute(ino).ok_or(ENOENT)?;

        if let Some(mode) = mode {
            fs::set_permissions(&path, fs::Permissions::from_mode(mode & 0o7777))
                .map_err(|e| errno(&e))?;
        }
        if uid.is_some() || gid.is_some() {
            std::os::unix::fs::chown(&path, uid, gid).map_err(|e| errno(&e))?;
        }
        if let Some(size) = size {
            let file = OpenOptions::new()
                .write(true)
                .open(&path)
                .map_err(|e| errno(&e))?;
            file.set_len(size).map_err(|e| errno(&e))?;
        }
        if atime.is_some() || mtime.is_some() {
            let mut times = FileTimes::new();
            if let Some(t) = atime {
                times = times.set_accessed(resolve_time(t));
            }
            if let Some(t) = mtime {
                times = times.set_modified(resolve_time(t));
            }
            let file = File::open(&path).map_err(|e| errno(&e))?;
            file.set_times(times).map_err(|e| errno(&e))?;
        }

        self.attr_for_inode(ino).map_err(|e| errno(&e))
    }

    fn list_dir(&mut self, ino: u64) -> Result<Vec<(u64, FileType, String)>, c_int> {
        let rel = self.inodes.relative(ino).ok_or(ENOENT)?.to_path_buf();
        let abs = self.inodes.root().join(&rel);
        if !abs.is_dir() {
            return Err(ENOTDIR);
        }

        let parent_ino = rel
            .parent()
            .and_then(|p| self.inodes.lookup(p))
            .unwrap_or(ROOT_INODE);
        let mut entries = vec![
            (ino, FileType::Directory, ".".to_string()),
            (parent_ino, FileType::Directory, "..".to_string()),
        ];

        let mut children = Vec::new();
        for entry in fs::read_dir(&abs).map_err(|e| errno(&e))? {
            let entry = entry.map_err(|e| errno(&e))?;
            let name = entry.file_name().to_string_lossy().to_string();
            let kind = entry
                .file_type()
                .map(file_type)
                .unwrap_or(FileType::RegularFile);
            children.push((name, kind));
        }
        // Stable order keeps readdir offsets meaningful across calls.
        children.sort_by(|a, b| a.0.cmp(&b.0));

        for (name, kind) in children {
            let child_ino = self.inodes.get_or_assign(&rel.join(&name));
            entries.push((child_ino, kind, name));
        }
        Ok(entries)
    }
}

impl Filesystem for OriginFuseFS {
    /// Look up a directory entry by name.
    fn lookup(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEntry) {
        trace!("lookup(parent={}, name={:?})", parent, name);
        let rel = match self.child(parent, name) {
            Ok(rel) => rel,
            Err(code) => return reply.error(code),
        };
        match self.attr_for(&rel) {
            Ok(attr) => reply.entry(&TTL, &attr, 0),
            Err(e) => reply.error(errno(&e)),
        }
    }

    /// Get file attributes.
    fn getattr(&mut self, _req: &Request, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        trace!("getattr(ino={})", ino);
        match self.attr_for_inode(ino) {
            Ok(attr) => reply.attr(&TTL, &attr),
            Err(e) => {
                debug!("getattr: inode {} unavailable: {}", ino, e);
                reply.error(errno(&e));
            }
        }
    }

    /// Change mode, ownership, size or timestamps.
    fn setattr(
        &mut self,
        _req: &Request,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        trace!("setattr(ino={}, mode={:?}, size={:?})", ino, mode, size);
        match self.apply_setattr(ino, mode, uid, gid, size, atime, mtime) {
            Ok(attr) => reply.attr(&TTL, &attr),
            Err(code) => reply.error(code),
        }
    }

    /// Read directory entries.
    fn readdir(
        &mut self,
        _req: &Request,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        trace!("readdir(ino={}, offset={})", ino, offset);
        let entries = match self.list_dir(ino) {
            Ok(entries) => entries,
            Err(code) => return reply.error(code),
        };

        for (i, (ino, kind, name)) in entries.into_iter().enumerate().skip(offset as usize) {
            if reply.add(ino, (i + 1) as i64, kind, &name) {
                break;
            }
        }
        reply.ok();
    }

    /// Open a file.
    fn open(&mut self, _req: &Request, ino: u64, flags: i32, reply: ReplyOpen) {
        trace!("open(ino={}, flags={:#o})", ino, flags);
        if flags & libc::O_ACCMODE != libc::O_RDONLY && self.read_only {
            return reply.error(EROFS);
        }
        match self.inodes.absolute(ino) {
            // Stateless handles: every read and write opens the path itself.
            Some(path) if path.exists() => reply.opened(0, 0),
            _ => reply.error(ENOENT),
        }
    }

    /// Read file data.
    fn read(
        &mut self,
        _req: &Request,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        trace!("read(ino={}, offset={}, size={})", ino, offset, size);
        let path = match self.inodes.absolute(ino) {
            Some(path) => path,
            None => return reply.error(ENOENT),
        };
        if offset < 0 {
            return reply.error(EINVAL);
        }

        let result = File::open(&path).and_then(|file| {
            let mut buffer = vec![0u8; size as usize];
            let read = file.read_at(&mut buffer, offset as u64)?;
            buffer.truncate(read);
            Ok(buffer)
        });
        match result {
            Ok(data) => reply.data(&data),
            Err(e) => {
                warn!("read: I/O error on {}: {}", path.display(), e);
                reply.error(errno(&e));
            }
        }
    }

    /// Write file data.
    fn write(
        &mut self,
        _req: &Request,
        ino: u64,
        _fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        trace!("write(ino={}, offset={}, len={})", ino, offset, data.len());
        if let Err(code) = self.writable() {
            return reply.error(code);
        }
        let path = match self.inodes.absolute(ino) {
            Some(path) => path,
            None => return reply.error(ENOENT),
        };
        if offset < 0 {
            return reply.error(EINVAL);
        }

        let result = OpenOptions::new()
            .write(true)
            .open(&path)
            .and_then(|file| file.write_all_at(data, offset as u64));
        match result {
            Ok(()) => reply.written(data.len() as u32),
            Err(e) => {
                warn!("write: I/O error on {}: {}", path.display(), e);
                reply.error(errno(&e));
            }
        }
    }

    fn flush(&mut self, _req: &Request, _ino: u64, _fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        reply.ok();
    }

    fn fsync(&mut self, _req: &Request, ino: u64, _fh: u64, _datasync: bool, reply: ReplyEmpty) {
        let result = self
            .inodes
            .absolute(ino)
            .ok_or_else(|| io::Error::from_raw_os_error(ENOENT))
            .and_then(|path| File::open(path)?.sync_all());
        match result {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno(&e)),
        }
    }

    /// Create and open a regular file.
    fn create(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        trace!("create(parent={}, name={:?}, mode={:#o})", parent, name, mode);
        if let Err(code) = self.writable() {
            return reply.error(code);
        }
        let rel = match self.child(parent, name) {
            Ok(rel) => rel,
            Err(code) => return reply.error(code),
        };

        let created = OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(mode & !umask & 0o7777)
            .open(self.inodes.root().join(&rel));
        match created.and_then(|_| self.attr_for(&rel)) {
            Ok(attr) => reply.created(&TTL, &attr, 0, 0, 0),
            Err(e) => reply.error(errno(&e)),
        }
    }

    /// Create a directory.
    fn mkdir(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        reply: ReplyEntry,
    ) {
        trace!("mkdir(parent={}, name={:?})", parent, name);
        if let Err(code) = self.writable() {
            return reply.error(code);
        }
        let rel = match self.child(parent, name) {
            Ok(rel) => rel,
            Err(code) => return reply.error(code),
        };

        let created = DirBuilder::new()
            .mode(mode & !umask & 0o7777)
            .create(self.inodes.root().join(&rel));
        match created.and_then(|_| self.attr_for(&rel)) {
            Ok(attr) => reply.entry(&TTL, &attr, 0),
            Err(e) => reply.error(errno(&e)),
        }
    }

    /// Remove a file.
    fn unlink(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        trace!("unlink(parent={}, name={:?})", parent, name);
        if let Err(code) = self.writable() {
            return reply.error(code);
        }
        let rel = match self.child(parent, name) {
            Ok(rel) => rel,
            Err(code) => return reply.error(code),
        };
        match fs::remove_file(self.inodes.root().join(&rel)) {
            Ok(()) => {
                self.inodes.remove(&rel);
                reply.ok();
            }
            Err(e) => reply.error(errno(&e)),
        }
    }

    /// Remove an empty directory.
    fn rmdir(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        trace!("rmdir(parent={}, name={:?})", parent, name);
        if let Err(code) = self.writable() {
            return reply.error(code);
        }
        let rel = match self.child(parent, name) {
            Ok(rel) => rel,
            Err(code) => return reply.error(code),
        };
        match fs::remove_dir(self.inodes.root().join(&rel)) {
            Ok(()) => {
                self.inodes.remove(&rel);
                reply.ok();
            }
            Err(e) => reply.error(errno(&e)),
        }
    }

    /// Move an entry.
    fn rename(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        trace!("rename({:?} -> {:?})", name, newname);
        if let Err(code) = self.writable() {
            return reply.error(code);
        }
        let (from, to) = match (self.child(parent, name), self.child(newparent, newname)) {
            (Ok(from), Ok(to)) => (from, to),
            (Err(code), _) | (_, Err(code)) => return reply.error(code),
        };
        let root = self.inodes.root().to_path_buf();
        match fs::rename(root.join(&from), root.join(&to)) {
            Ok(()) => {
                self.inodes.rename(&from, &to);
                reply.ok();
            }
            Err(e) => reply.error(errno(&e)),
        }
    }

    /// Get filesystem statistics of the backing filesystem.
    fn statfs(&mut self, _req: &Request, _ino: u64, reply: ReplyStatfs) {
        trace!("statfs");
        let c_path = match CString::new(self.inodes.root().as_os_str().as_bytes()) {
            Ok(p) => p,
            Err(_) => return reply.error(EINVAL),
        };
        let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
        if unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) } != 0 {
            return reply.error(errno(&io::Error::last_os_error()));
        }
        reply.statfs(
            stat.f_blocks as u64,
            stat.f_bfree as u64,
            stat.f_bavail as u64,
            stat.f_files as u64,
            stat.f_ffree as u64,
            stat.f_bsize as u32,
            stat.f_namemax as u32,
            stat.f_frsize as u32,
        );
    }
}

/// Provider that serves origins through FUSE.
#[derive(Debug, Default, Clone, Copy)]
pub struct FuseProvider;

impl FilesystemProvider for FuseProvider {
    fn attach(
        &self,
        source: &Path,
        kind: OriginKind,
        mount_point: &Path,
    ) -> Result<Box<dyn AttachedFilesystem>, ProviderError> {
        let attach_failed = |reason: String| ProviderError::AttachFailed {
            source_path: source.to_path_buf(),
            mount_point: mount_point.to_path_buf(),
            reason,
        };

        // Read-only archives are served from a private extraction that lives
        // exactly as long as the session.
        let (root, scratch, read_only) = match kind {
            OriginKind::Archive => {
                let scratch = tempfile::Builder::new()
                    .prefix("originfs-ro-")
                    .tempdir()?;
                staging::unpack(source, scratch.path()).map_err(|e| attach_failed(e.to_string()))?;
                (scratch.path().to_path_buf(), Some(scratch), true)
            }
            OriginKind::Directory | OriginKind::LazyArchive => (source.to_path_buf(), None, false),
        };

        let fs = OriginFuseFS::new(&root, read_only);
        let options = vec![
            if read_only { MountOption::RO } else { MountOption::RW },
            MountOption::FSName("originfs".to_string()),
            MountOption::Subtype("origin".to_string()),
            MountOption::DefaultPermissions,
        ];

        debug!(
            "Mounting {} at {} ({}, read_only={})",
            root.display(),
            mount_point.display(),
            kind,
            read_only
        );

        let session = fuser::spawn_mount2(fs, mount_point, &options)
            .map_err(|e| attach_failed(format!("FUSE mount failed: {}", e)))?;
        info!("FUSE session attached at {}", mount_point.display());

        Ok(Box::new(FuseSession {
            session,
            mount_point: mount_point.to_path_buf(),
            _scratch: scratch,
        }))
    }
}

/// A running FUSE session. Dropping it unmounts.
pub struct FuseSession {
    session: fuser::BackgroundSession,
    mount_point: PathBuf,
    _scratch: Option<TempDir>,
}

impl AttachedFilesystem for FuseSession {
    fn is_attached(&self) -> bool {
        is_mount_point(&self.mount_point)
    }

    fn detach(self: Box<Self>) -> io::Result<()> {
        let FuseSession {
            session,
            mount_point,
            _scratch,
        } = *self;
        debug!("Detaching FUSE session at {}", mount_point.display());
        drop(session);
        Ok(())
    }
}

fn file_type(ft: fs::FileType) -> FileType {
    if ft.is_dir() {
        FileType::Directory
    } else if ft.is_symlink() {
        FileType::Symlink
    } else {
        FileType::RegularFile
    }
}

fn to_system_time(secs: i64, nsecs: i64) -> SystemTime {
    if secs >= 0 {
        UNIX_EPOCH + Duration::new(secs as u64, nsecs as u32)
    } else {
        UNIX_EPOCH
    }
}

fn resolve_time(t: TimeOrNow) -> SystemTime {
    match t {
        TimeOrNow::SpecificTime(t) => t,
        TimeOrNow::Now => SystemTime::now(),
    }
}

fn errno(e: &io::Error) -> c_int {
    e.raw_os_error().unwrap_or(EIO)
}
