//! FUSE adapter that projects the remote bucket through the engine facade.
//! Keeps the kernel-facing bookkeeping (inode <-> path maps) and translates
//! engine results into replies; all remote semantics live in the engine.

use std::{
    collections::HashMap,
    ffi::OsStr,
    path::Path,
    sync::Mutex,
    time::{Duration, SystemTime},
};

use fuser::{
    BackgroundSession, FileAttr, FileType, Filesystem, MountOption, ReplyAttr, ReplyCreate,
    ReplyData, ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyWrite, ReplyXattr, Request,
    TimeOrNow,
};
use libc::{EINVAL, ENOENT, ERANGE};
use tracing::debug;

use crate::fs::engine::{Engine, ObjectAttr};
use crate::store::ObjectKind;
use crate::Result;

const ATTR_TTL: Duration = Duration::from_secs(1);

pub struct ObjectFs {
    engine: Engine,
    paths: Mutex<HashMap<u64, String>>,  // ino -> canonical path
    inodes: Mutex<HashMap<String, u64>>, // canonical path -> ino
    next_ino: Mutex<u64>,
}

impl ObjectFs {
    pub fn new(engine: Engine) -> Self {
        let mut paths = HashMap::new();
        let mut inodes = HashMap::new();
        paths.insert(1, String::new());
        inodes.insert(String::new(), 1);
        Self {
            engine,
            paths: Mutex::new(paths),
            inodes: Mutex::new(inodes),
            next_ino: Mutex::new(2),
        }
    }

    fn path_for(&self, ino: u64) -> Option<String> {
        self.paths.lock().unwrap().get(&ino).cloned()
    }

    fn get_or_insert_ino(&self, path: &str) -> u64 {
        if let Some(id) = self.inodes.lock().unwrap().get(path).copied() {
            return id;
        }
        let mut next = self.next_ino.lock().unwrap();
        let ino = *next;
        *next += 1;
        self.paths.lock().unwrap().insert(ino, path.to_string());
        self.inodes.lock().unwrap().insert(path.to_string(), ino);
        ino
    }

    fn forget_path(&self, path: &str) {
        if let Some(ino) = self.inodes.lock().unwrap().remove(path) {
            self.paths.lock().unwrap().remove(&ino);
        }
    }

    fn rebind_path(&self, from: &str, to: &str) {
        let mut inodes = self.inodes.lock().unwrap();
        if let Some(ino) = inodes.remove(from) {
            inodes.insert(to.to_string(), ino);
            self.paths.lock().unwrap().insert(ino, to.to_string());
        }
    }

    fn child_path(&self, parent: u64, name: &OsStr) -> Option<String> {
        let parent_path = self.path_for(parent)?;
        let name = name.to_str()?;
        Some(if parent_path.is_empty() {
            name.to_string()
        } else {
            format!("{parent_path}/{name}")
        })
    }

    fn file_attr(&self, path: &str, attr: &ObjectAttr) -> FileAttr {
        let kind = match attr.kind {
            ObjectKind::Directory => FileType::Directory,
            ObjectKind::Symlink => FileType::Symlink,
            ObjectKind::File => FileType::RegularFile,
        };
        FileAttr {
            ino: self.get_or_insert_ino(path),
            size: attr.size,
            blocks: attr.size.div_ceil(512),
            atime: attr.mtime,
            mtime: attr.mtime,
            ctime: attr.mtime,
            crtime: attr.mtime,
            kind,
            perm: attr.mode as u16,
            nlink: 1,
            uid: attr.uid,
            gid: attr.gid,
            rdev: 0,
            blksize: 4096,
            flags: 0,
        }
    }

    fn stat_path(&self, path: &str) -> std::result::Result<FileAttr, i32> {
        let attr = self.engine.getattr(path)?;
        Ok(self.file_attr(path, &attr))
    }
}

impl Filesystem for ObjectFs {
    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let Some(path) = self.child_path(parent, name) else {
            reply.error(ENOENT);
            return;
        };
        match self.stat_path(&path) {
            Ok(attr) => reply.entry(&ATTR_TTL, &attr, 0),
            Err(errno) => reply.error(errno),
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyAttr) {
        let Some(path) = self.path_for(ino) else {
            reply.error(ENOENT);
            return;
        };
        match self.stat_path(&path) {
            Ok(attr) => reply.attr(&ATTR_TTL, &attr),
            Err(errno) => reply.error(errno),
        }
    }

    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        _atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let Some(path) = self.path_for(ino) else {
            reply.error(ENOENT);
            return;
        };

        if let Some(mode) = mode {
            if let Err(errno) = self.engine.chmod(&path, mode) {
                reply.error(errno);
                return;
            }
        }
        if uid.is_some() || gid.is_some() {
            if let Err(errno) = self.engine.chown(&path, uid, gid) {
                reply.error(errno);
                return;
            }
        }
        if let Some(size) = size {
            let result = match fh {
                Some(fh) => self.engine.truncate_handle(fh, size),
                None => self.engine.truncate(&path, size),
            };
            if let Err(errno) = result {
                reply.error(errno);
                return;
            }
        }
        if let Some(mtime) = mtime {
            let when = match mtime {
                TimeOrNow::SpecificTime(t) => t,
                TimeOrNow::Now => SystemTime::now(),
            };
            if let Err(errno) = self.engine.utimens(&path, when) {
                reply.error(errno);
                return;
            }
        }

        match self.stat_path(&path) {
            Ok(attr) => reply.attr(&ATTR_TTL, &attr),
            Err(errno) => reply.error(errno),
        }
    }

    fn mknod(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        _rdev: u32,
        reply: ReplyEntry,
    ) {
        let Some(path) = self.child_path(parent, name) else {
            reply.error(ENOENT);
            return;
        };
        if let Err(errno) = self.engine.create(&path, mode) {
            reply.error(errno);
            return;
        }
        match self.stat_path(&path) {
            Ok(attr) => reply.entry(&ATTR_TTL, &attr, 0),
            Err(errno) => reply.error(errno),
        }
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        let Some(path) = self.child_path(parent, name) else {
            reply.error(ENOENT);
            return;
        };
        if let Err(errno) = self.engine.create(&path, mode) {
            reply.error(errno);
            return;
        }
        let fh = match self.engine.open(&path) {
            Ok(fh) => fh,
            Err(errno) => {
                reply.error(errno);
                return;
            }
        };
        match self.stat_path(&path) {
            Ok(attr) => reply.created(&ATTR_TTL, &attr, 0, fh, 0),
            Err(errno) => reply.error(errno),
        }
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let Some(path) = self.child_path(parent, name) else {
            reply.error(ENOENT);
            return;
        };
        if let Err(errno) = self.engine.mkdir(&path, mode) {
            reply.error(errno);
            return;
        }
        match self.stat_path(&path) {
            Ok(attr) => reply.entry(&ATTR_TTL, &attr, 0),
            Err(errno) => reply.error(errno),
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let Some(path) = self.child_path(parent, name) else {
            reply.error(ENOENT);
            return;
        };
        match self.engine.unlink(&path) {
            Ok(()) => {
                self.forget_path(&path);
                reply.ok();
            }
            Err(errno) => reply.error(errno),
        }
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let Some(path) = self.child_path(parent, name) else {
            reply.error(ENOENT);
            return;
        };
        match self.engine.rmdir(&path) {
            Ok(()) => {
                self.forget_path(&path);
                reply.ok();
            }
            Err(errno) => reply.error(errno),
        }
    }

    fn symlink(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        link_name: &OsStr,
        target: &Path,
        reply: ReplyEntry,
    ) {
        let Some(path) = self.child_path(parent, link_name) else {
            reply.error(ENOENT);
            return;
        };
        let Some(target) = target.to_str() else {
            reply.error(EINVAL);
            return;
        };
        if let Err(errno) = self.engine.symlink(target, &path) {
            reply.error(errno);
            return;
        }
        match self.stat_path(&path) {
            Ok(attr) => reply.entry(&ATTR_TTL, &attr, 0),
            Err(errno) => reply.error(errno),
        }
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        let Some(path) = self.path_for(ino) else {
            reply.error(ENOENT);
            return;
        };
        match self.engine.readlink(&path) {
            Ok(target) => reply.data(target.as_bytes()),
            Err(errno) => reply.error(errno),
        }
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        let (Some(from), Some(to)) = (
            self.child_path(parent, name),
            self.child_path(newparent, newname),
        ) else {
            reply.error(ENOENT);
            return;
        };
        match self.engine.rename(&from, &to) {
            Ok(()) => {
                self.forget_path(&to);
                self.rebind_path(&from, &to);
                reply.ok();
            }
            Err(errno) => reply.error(errno),
        }
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        let Some(path) = self.path_for(ino) else {
            reply.error(ENOENT);
            return;
        };
        match self.engine.open(&path) {
            Ok(fh) => reply.opened(fh, 0),
            Err(errno) => reply.error(errno),
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        if offset < 0 {
            reply.error(EINVAL);
            return;
        }
        match self.engine.read(fh, offset as u64, size) {
            Ok(bytes) => reply.data(&bytes),
            Err(errno) => reply.error(errno),
        }
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        if offset < 0 {
            reply.error(EINVAL);
            return;
        }
        match self.engine.write(fh, offset as u64, data) {
            Ok(written) => reply.written(written),
            Err(errno) => reply.error(errno),
        }
    }

    fn flush(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _lock_owner: u64,
        reply: ReplyEmpty,
    ) {
        match self.engine.flush(fh) {
            Ok(()) => reply.ok(),
            Err(errno) => reply.error(errno),
        }
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        match self.engine.release(fh) {
            Ok(()) => reply.ok(),
            Err(errno) => reply.error(errno),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        if offset != 0 {
            reply.ok();
            return;
        }
        let Some(path) = self.path_for(ino) else {
            reply.error(ENOENT);
            return;
        };

        let children = match self.engine.readdir(&path) {
            Ok(children) => children,
            Err(errno) => {
                reply.error(errno);
                return;
            }
        };

        let mut entries = Vec::new();
        entries.push((ino, FileType::Directory, ".".to_string()));
        let parent_ino = if path.is_empty() {
            ino
        } else {
            let parent = path.rsplit_once('/').map(|(p, _)| p).unwrap_or("");
            self.get_or_insert_ino(parent)
        };
        entries.push((parent_ino, FileType::Directory, "..".to_string()));

        for child in children {
            let child_path = if path.is_empty() {
                child.name.clone()
            } else {
                format!("{path}/{}", child.name)
            };
            let kind = match child.kind {
                ObjectKind::Directory => FileType::Directory,
                ObjectKind::Symlink => FileType::Symlink,
                ObjectKind::File => FileType::RegularFile,
            };
            entries.push((self.get_or_insert_ino(&child_path), kind, child.name));
        }

        for (i, (ino, kind, name)) in entries.into_iter().enumerate() {
            if reply.add(ino, (i + 1) as i64, kind, name) {
                break;
            }
        }
        reply.ok();
    }

    fn getxattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        name: &OsStr,
        size: u32,
        reply: ReplyXattr,
    ) {
        let (Some(path), Some(name)) = (self.path_for(ino), name.to_str()) else {
            reply.error(ENOENT);
            return;
        };
        match self.engine.getxattr(&path, name) {
            Ok(value) => {
                if size == 0 {
                    reply.size(value.len() as u32);
                } else if (size as usize) < value.len() {
                    reply.error(ERANGE);
                } else {
                    reply.data(&value);
                }
            }
            Err(errno) => reply.error(errno),
        }
    }

    fn setxattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        name: &OsStr,
        value: &[u8],
        _flags: i32,
        _position: u32,
        reply: ReplyEmpty,
    ) {
        let (Some(path), Some(name)) = (self.path_for(ino), name.to_str()) else {
            reply.error(ENOENT);
            return;
        };
        match self.engine.setxattr(&path, name, value) {
            Ok(()) => reply.ok(),
            Err(errno) => reply.error(errno),
        }
    }

    fn listxattr(&mut self, _req: &Request<'_>, ino: u64, size: u32, reply: ReplyXattr) {
        let Some(path) = self.path_for(ino) else {
            reply.error(ENOENT);
            return;
        };
        match self.engine.listxattr(&path) {
            Ok(names) => {
                let mut packed = Vec::new();
                for name in names {
                    packed.extend_from_slice(name.as_bytes());
                    packed.push(0);
                }
                if size == 0 {
                    reply.size(packed.len() as u32);
                } else if (size as usize) < packed.len() {
                    reply.error(ERANGE);
                } else {
                    reply.data(&packed);
                }
            }
            Err(errno) => reply.error(errno),
        }
    }

    fn removexattr(&mut self, _req: &Request<'_>, ino: u64, name: &OsStr, reply: ReplyEmpty) {
        let (Some(path), Some(name)) = (self.path_for(ino), name.to_str()) else {
            reply.error(ENOENT);
            return;
        };
        match self.engine.removexattr(&path, name) {
            Ok(()) => reply.ok(),
            Err(errno) => reply.error(errno),
        }
    }
}

/// A live FUSE session. The mount stays attached until `unmount` joins the
/// session or something external detaches it; merely dropping the handle
/// leaves the mount up.
pub struct MountHandle {
    mountpoint: std::path::PathBuf,
    session: BackgroundSession,
}

impl MountHandle {
    pub fn mountpoint(&self) -> &Path {
        &self.mountpoint
    }

    /// Block until the kernel session winds down, detaching the mount.
    pub fn unmount(self) {
        self.session.join();
    }
}

impl std::fmt::Debug for MountHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MountHandle({})", self.mountpoint.display())
    }
}

/// Spawn a background FUSE session serving the engine at `mountpoint`.
pub fn spawn_objectfs<P: AsRef<Path>>(engine: Engine, mountpoint: P) -> Result<MountHandle> {
    let mountpoint = mountpoint.as_ref().to_path_buf();
    let options = [
        MountOption::FSName("objfs".into()),
        MountOption::DefaultPermissions,
    ];
    debug!(mountpoint = %mountpoint.display(), "starting FUSE session");
    let session = fuser::spawn_mount2(ObjectFs::new(engine), &mountpoint, &options)?;
    Ok(MountHandle {
        mountpoint,
        session,
    })
}
