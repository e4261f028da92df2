//! Filesystem facade: every FUSE operation is packaged as a closure over an
//! executor supplied by a worker, submitted to the foreground pool, and its
//! outcome translated to a POSIX errno. Speculative work (readdir prefill)
//! rides the background pool.

use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::config::Config;
use crate::http::hook::{ListPage, RequestHook};
use crate::http::request::{HttpRequest, Method};
use crate::pool::{ExecutorFactory, WorkItem, WorkerPool};
use crate::store::object::{Hint, Object, ObjectKind};
use crate::store::{self, ObjectCache, StoreContext, RESERVED_META_KEYS};
use crate::{errno_of, Error, Result};

/// Positive POSIX errno, as handed to FUSE replies.
pub type Errno = i32;
pub type OpResult<T> = std::result::Result<T, Errno>;

/// Attribute view of a descriptor, enough to build a FUSE `FileAttr`.
#[derive(Debug, Clone)]
pub struct ObjectAttr {
    pub kind: ObjectKind,
    pub size: u64,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub mtime: SystemTime,
}

impl From<&Object> for ObjectAttr {
    fn from(object: &Object) -> Self {
        Self {
            kind: object.kind(),
            size: object.size(),
            mode: object.mode(),
            uid: object.uid(),
            gid: object.gid(),
            mtime: object.mtime(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DirEntry {
    pub name: String,
    pub kind: ObjectKind,
}

pub struct EngineInner {
    ctx: Arc<StoreContext>,
    cache: Arc<ObjectCache>,
    handles: Arc<crate::fs::handles::OpenFileTable>,
    hook: Arc<dyn RequestHook>,
    fg: WorkerPool,
    bg: WorkerPool,
}

/// Cheaply cloneable facade; owns the pools, the cache, and the open-file
/// table for the process lifetime.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("open_handles", &self.inner.handles.open_count())
            .finish()
    }
}

impl Engine {
    /// Production construction: each worker builds its own reqwest-backed
    /// executor with the hook installed.
    pub fn new(config: &Config, hook: Arc<dyn RequestHook>) -> Self {
        let factory: ExecutorFactory = {
            let config = config.clone();
            let hook = hook.clone();
            Arc::new(move || HttpRequest::new(&config, Some(hook.clone())))
        };
        Self::with_factory(config, hook, factory)
    }

    /// Construction with an explicit executor factory; tests inject
    /// transports that never touch the network.
    pub fn with_factory(
        config: &Config,
        hook: Arc<dyn RequestHook>,
        factory: ExecutorFactory,
    ) -> Self {
        let inner = Arc::new(EngineInner {
            ctx: StoreContext::new(config),
            cache: Arc::new(ObjectCache::new(config.cache_ttl())),
            handles: Arc::new(crate::fs::handles::OpenFileTable::new()),
            hook,
            fg: WorkerPool::new("objfs-fg", config.fg_worker_count, factory.clone()),
            bg: WorkerPool::new("objfs-bg", config.bg_worker_count, factory),
        });
        Self { inner }
    }

    /// Verify the endpoint is reachable and credentials work before
    /// mounting: one listing of the bucket root.
    pub fn probe(&self) -> OpResult<()> {
        self.submit_fg(|req, inner| inner.list_page(req, "", None, true).map(drop))
    }

    /// Fail pending work and join both pools.
    pub fn shutdown(&self) {
        self.inner.fg.shutdown();
        self.inner.bg.shutdown();
    }

    pub fn open_handle_count(&self) -> usize {
        self.inner.handles.open_count()
    }

    fn submit_fg<T, F>(&self, f: F) -> OpResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut HttpRequest, &Arc<EngineInner>) -> Result<T> + Send + 'static,
    {
        let inner = self.inner.clone();
        let slot: Arc<Mutex<Option<T>>> = Arc::new(Mutex::new(None));
        let out = slot.clone();
        let item = WorkItem::new(move |req| match f(req, &inner) {
            Ok(value) => {
                *out.lock() = Some(value);
                0
            }
            Err(err) => -errno_of(&err),
        });
        self.inner.fg.post(item.clone());
        match item.wait() {
            0 => slot.lock().take().ok_or(libc::EIO),
            code => Err(-code),
        }
    }

    // ---- metadata ----

    pub fn getattr(&self, path: &str) -> OpResult<ObjectAttr> {
        let path = store::canonicalize(path);
        self.submit_fg(move |req, inner| {
            let object = inner.cache.get(req, &inner.ctx, &path, Hint::None)?;
            Ok(ObjectAttr::from(&*object))
        })
    }

    pub fn chmod(&self, path: &str, mode: u32) -> OpResult<()> {
        let path = store::canonicalize(path);
        self.submit_fg(move |req, inner| {
            let object = inner.cache.get(req, &inner.ctx, &path, Hint::None)?;
            let mut updated = (*object).clone();
            updated.set_mode(mode);
            updated.commit(req, &inner.ctx)?;
            inner.cache.invalidate(&path);
            Ok(())
        })
    }

    pub fn chown(&self, path: &str, uid: Option<u32>, gid: Option<u32>) -> OpResult<()> {
        let path = store::canonicalize(path);
        self.submit_fg(move |req, inner| {
            let object = inner.cache.get(req, &inner.ctx, &path, Hint::None)?;
            let mut updated = (*object).clone();
            updated.set_owner(uid, gid);
            updated.commit(req, &inner.ctx)?;
            inner.cache.invalidate(&path);
            Ok(())
        })
    }

    pub fn utimens(&self, path: &str, mtime: SystemTime) -> OpResult<()> {
        let path = store::canonicalize(path);
        self.submit_fg(move |req, inner| {
            let object = inner.cache.get(req, &inner.ctx, &path, Hint::None)?;
            let mut updated = (*object).clone();
            updated.set_mtime(mtime);
            updated.commit(req, &inner.ctx)?;
            inner.cache.invalidate(&path);
            Ok(())
        })
    }

    // ---- directory operations ----

    pub fn readdir(&self, path: &str) -> OpResult<Vec<DirEntry>> {
        let path = store::canonicalize(path);
        self.submit_fg(move |req, inner| {
            if !path.is_empty() {
                let object = inner.cache.get(req, &inner.ctx, &path, Hint::None)?;
                if object.kind() != ObjectKind::Directory {
                    return Err(Error::NotADirectory(path.clone()).into());
                }
            }

            let prefix = dir_prefix(&path);
            let mut entries = Vec::new();
            let mut marker: Option<String> = None;
            loop {
                let page = inner.list_page(req, &prefix, marker.as_deref(), true)?;
                for key in &page.keys {
                    let Some(name) = key.strip_prefix(prefix.as_str()) else {
                        continue;
                    };
                    // The directory's own marker object lists under its
                    // prefix; nested keys only show up in undelimited
                    // listings.
                    if name.is_empty() || name.contains('/') {
                        continue;
                    }
                    entries.push(DirEntry {
                        name: name.to_string(),
                        kind: ObjectKind::File,
                    });
                    inner.prefill(format!("{prefix}{name}"), Hint::IsFile);
                }
                for common in &page.prefixes {
                    let Some(name) = common
                        .strip_prefix(prefix.as_str())
                        .map(|n| n.trim_end_matches('/'))
                    else {
                        continue;
                    };
                    if name.is_empty() {
                        continue;
                    }
                    entries.push(DirEntry {
                        name: name.to_string(),
                        kind: ObjectKind::Directory,
                    });
                    inner.prefill(format!("{prefix}{name}"), Hint::IsDir);
                }
                match page.next_marker {
                    Some(next) => marker = Some(next),
                    None => break,
                }
            }
            entries.sort_by(|a, b| a.name.cmp(&b.name));
            entries.dedup_by(|a, b| a.name == b.name);
            Ok(entries)
        })
    }

    pub fn mkdir(&self, path: &str, mode: u32) -> OpResult<()> {
        self.create_node(path, ObjectKind::Directory, mode)
    }

    pub fn rmdir(&self, path: &str) -> OpResult<()> {
        let path = store::canonicalize(path);
        self.submit_fg(move |req, inner| {
            let object = inner.cache.get(req, &inner.ctx, &path, Hint::None)?;
            if object.kind() != ObjectKind::Directory {
                return Err(Error::NotADirectory(path.clone()).into());
            }
            let prefix = dir_prefix(&path);
            let page = inner.list_page(req, &prefix, None, true)?;
            let has_children = page
                .keys
                .iter()
                .any(|key| key != &prefix)
                || !page.prefixes.is_empty();
            if has_children {
                return Err(Error::NotEmpty(path.clone()).into());
            }
            inner.delete_key(req, &object.key())?;
            inner.cache.invalidate(&path);
            Ok(())
        })
    }

    // ---- file creation and removal ----

    pub fn create(&self, path: &str, mode: u32) -> OpResult<()> {
        self.create_node(path, ObjectKind::File, mode)
    }

    fn create_node(&self, path: &str, kind: ObjectKind, mode: u32) -> OpResult<()> {
        let path = store::canonicalize(path);
        if path.is_empty() {
            return Err(libc::EEXIST);
        }
        self.submit_fg(move |req, inner| {
            match inner.cache.get(req, &inner.ctx, &path, Hint::None) {
                Ok(_) => return Err(Error::Exists(path.clone()).into()),
                Err(err) if errno_of(&err) == libc::ENOENT => {}
                Err(err) => return Err(err),
            }
            let mut object = Object::for_new(&inner.ctx, &path, kind, mode);
            inner.put_object(req, &mut object, Vec::new())?;
            inner.cache.insert(object);
            Ok(())
        })
    }

    pub fn unlink(&self, path: &str) -> OpResult<()> {
        let path = store::canonicalize(path);
        self.submit_fg(move |req, inner| {
            let object = inner.cache.get(req, &inner.ctx, &path, Hint::None)?;
            if object.kind() == ObjectKind::Directory {
                return Err(Error::IsADirectory(path.clone()).into());
            }
            inner.delete_key(req, &object.key())?;
            inner.cache.invalidate(&path);
            Ok(())
        })
    }

    // ---- symlinks ----

    pub fn symlink(&self, target: &str, linkpath: &str) -> OpResult<()> {
        let path = store::canonicalize(linkpath);
        let target = target.to_string();
        self.submit_fg(move |req, inner| {
            match inner.cache.get(req, &inner.ctx, &path, Hint::None) {
                Ok(_) => return Err(Error::Exists(path.clone()).into()),
                Err(err) if errno_of(&err) == libc::ENOENT => {}
                Err(err) => return Err(err),
            }
            let mut object = Object::for_new(&inner.ctx, &path, ObjectKind::Symlink, 0o777);
            inner.put_object(req, &mut object, target.into_bytes())?;
            inner.cache.insert(object);
            Ok(())
        })
    }

    pub fn readlink(&self, path: &str) -> OpResult<String> {
        let path = store::canonicalize(path);
        self.submit_fg(move |req, inner| {
            let object = inner.cache.get(req, &inner.ctx, &path, Hint::None)?;
            if object.kind() != ObjectKind::Symlink {
                return Err(Error::InvalidArgument(path.clone()).into());
            }
            req.init(Method::Get)?;
            req.set_url(&inner.ctx.object_url(&object.key()), "");
            req.run()?;
            match req.response_code() {
                200 => String::from_utf8(req.take_output())
                    .map_err(|_| Error::Corrupt(format!("symlink target for {path}")).into()),
                404 => Err(Error::NoEntry(path.clone()).into()),
                code => Err(Error::Status {
                    code,
                    url: req.url().to_string(),
                }
                .into()),
            }
        })
    }

    // ---- rename ----

    pub fn rename(&self, from: &str, to: &str) -> OpResult<()> {
        let from = store::canonicalize(from);
        let to = store::canonicalize(to);
        if from.is_empty() || to.is_empty() {
            return Err(libc::EINVAL);
        }
        self.submit_fg(move |req, inner| {
            let source = inner.cache.get(req, &inner.ctx, &from, Hint::None)?;

            match inner.cache.get(req, &inner.ctx, &to, Hint::None) {
                Ok(existing) if existing.kind() == ObjectKind::Directory => {
                    return Err(Error::Exists(to.clone()).into());
                }
                Ok(existing) => {
                    // POSIX rename replaces an existing file target.
                    inner.delete_key(req, &existing.key())?;
                    inner.cache.invalidate(&to);
                }
                Err(err) if errno_of(&err) == libc::ENOENT => {}
                Err(err) => return Err(err),
            }

            if source.kind() == ObjectKind::Directory {
                inner.rename_tree(req, &from, &to)?;
            } else {
                inner.copy_key(req, &source.key(), &to)?;
                inner.delete_key(req, &source.key())?;
            }

            inner.cache.invalidate(&from);
            inner.cache.invalidate(&to);
            Ok(())
        })
    }

    // ---- open files ----

    pub fn open(&self, path: &str) -> OpResult<u64> {
        let path = store::canonicalize(path);
        self.submit_fg(move |req, inner| {
            let object = inner.cache.get(req, &inner.ctx, &path, Hint::None)?;
            inner.handles.open(req, &inner.ctx, &object)
        })
    }

    /// Scratch-only; never touches the remote, so it bypasses the pools.
    pub fn read(&self, fh: u64, offset: u64, size: u32) -> OpResult<Vec<u8>> {
        self.inner
            .handles
            .read(fh, offset, size)
            .map_err(|err| errno_of(&err))
    }

    /// Scratch-only; never touches the remote, so it bypasses the pools.
    pub fn write(&self, fh: u64, offset: u64, data: &[u8]) -> OpResult<u32> {
        self.inner
            .handles
            .write(fh, offset, data)
            .map_err(|err| errno_of(&err))
    }

    pub fn flush(&self, fh: u64) -> OpResult<()> {
        self.submit_fg(move |req, inner| {
            inner.handles.flush(req, &inner.ctx, &inner.cache, fh)
        })
    }

    pub fn release(&self, fh: u64) -> OpResult<()> {
        self.submit_fg(move |req, inner| {
            inner.handles.release(req, &inner.ctx, &inner.cache, fh)
        })
    }

    pub fn truncate(&self, path: &str, size: u64) -> OpResult<()> {
        let path = store::canonicalize(path);
        self.submit_fg(move |req, inner| {
            let object = inner.cache.get(req, &inner.ctx, &path, Hint::None)?;
            let fh = inner.handles.open(req, &inner.ctx, &object)?;
            let staged = inner
                .handles
                .truncate(fh, size)
                .and_then(|_| inner.handles.flush(req, &inner.ctx, &inner.cache, fh));
            let released = inner.handles.release(req, &inner.ctx, &inner.cache, fh);
            staged.and(released)
        })
    }

    pub fn truncate_handle(&self, fh: u64, size: u64) -> OpResult<()> {
        self.inner
            .handles
            .truncate(fh, size)
            .map_err(|err| errno_of(&err))
    }

    // ---- extended attributes ----

    pub fn getxattr(&self, path: &str, name: &str) -> OpResult<Vec<u8>> {
        let path = store::canonicalize(path);
        let name = name.to_string();
        self.submit_fg(move |req, inner| {
            let object = inner.cache.get(req, &inner.ctx, &path, Hint::None)?;
            object
                .user_meta(&name)
                .map(|value| value.as_bytes().to_vec())
                .ok_or_else(|| Error::NoAttribute(name.clone()).into())
        })
    }

    pub fn setxattr(&self, path: &str, name: &str, value: &[u8]) -> OpResult<()> {
        let path = store::canonicalize(path);
        let name = name.to_string();
        if is_reserved_meta(&name) {
            return Err(libc::EPERM);
        }
        let Ok(value) = std::str::from_utf8(value).map(str::to_string) else {
            return Err(libc::EINVAL);
        };
        self.submit_fg(move |req, inner| {
            let object = inner.cache.get(req, &inner.ctx, &path, Hint::None)?;
            let mut updated = (*object).clone();
            updated.set_user_meta(&name, &value);
            updated.commit(req, &inner.ctx)?;
            inner.cache.invalidate(&path);
            Ok(())
        })
    }

    pub fn listxattr(&self, path: &str) -> OpResult<Vec<String>> {
        let path = store::canonicalize(path);
        self.submit_fg(move |req, inner| {
            let object = inner.cache.get(req, &inner.ctx, &path, Hint::None)?;
            Ok(object
                .user_metadata()
                .iter()
                .map(|(key, _)| key.clone())
                .collect())
        })
    }

    pub fn removexattr(&self, path: &str, name: &str) -> OpResult<()> {
        let path = store::canonicalize(path);
        let name = name.to_string();
        if is_reserved_meta(&name) {
            return Err(libc::EPERM);
        }
        self.submit_fg(move |req, inner| {
            let object = inner.cache.get(req, &inner.ctx, &path, Hint::None)?;
            let mut updated = (*object).clone();
            if !updated.remove_user_meta(&name) {
                return Err(Error::NoAttribute(name.clone()).into());
            }
            updated.commit(req, &inner.ctx)?;
            inner.cache.invalidate(&path);
            Ok(())
        })
    }
}

impl EngineInner {
    /// Queue a best-effort descriptor warm-up on the background pool.
    fn prefill(self: &Arc<Self>, path: String, hint: Hint) {
        let inner = self.clone();
        let item = WorkItem::new(move |req| {
            inner.cache.prefill(req, &inner.ctx, &path, hint);
            0
        });
        self.bg.post(item);
    }

    fn list_page(
        &self,
        req: &mut HttpRequest,
        prefix: &str,
        marker: Option<&str>,
        delimited: bool,
    ) -> Result<ListPage> {
        req.init(Method::Get)?;
        let query = self.hook.list_query(prefix, marker, delimited);
        req.set_url(&self.ctx.bucket_url(), &query);
        req.run()?;
        match req.response_code() {
            200 => self.hook.parse_list(req.output_bytes()),
            403 => Err(Error::AccessDenied(format!("list {prefix}")).into()),
            404 => Err(Error::NoEntry(format!("bucket {}", self.ctx.bucket())).into()),
            code => Err(Error::Status {
                code,
                url: req.url().to_string(),
            }
            .into()),
        }
    }

    fn put_object(
        &self,
        req: &mut HttpRequest,
        object: &mut Object,
        body: Vec<u8>,
    ) -> Result<()> {
        object.set_size(body.len() as u64);
        req.init(Method::Put)?;
        req.set_url(&self.ctx.object_url(&object.key()), "");
        object.apply_write_headers(req);
        req.set_input_buffer(body)?;
        req.run()?;
        match req.response_code() {
            200 => {
                if let Some(etag) = req.response_headers().get("ETag") {
                    object.set_etag(etag.trim_matches('"'));
                }
                Ok(())
            }
            403 => Err(Error::AccessDenied(object.path().to_string()).into()),
            code => Err(Error::Status {
                code,
                url: req.url().to_string(),
            }
            .into()),
        }
    }

    fn delete_key(&self, req: &mut HttpRequest, key: &str) -> Result<()> {
        req.init(Method::Delete)?;
        req.set_url(&self.ctx.object_url(key), "");
        req.run()?;
        match req.response_code() {
            200 | 204 => Ok(()),
            404 => Err(Error::NoEntry(key.to_string()).into()),
            403 => Err(Error::AccessDenied(key.to_string()).into()),
            code => Err(Error::Status {
                code,
                url: req.url().to_string(),
            }
            .into()),
        }
    }

    /// Server-side copy of `src_key` to the same-kind key for `dst_path`,
    /// keeping stored metadata.
    fn copy_key(&self, req: &mut HttpRequest, src_key: &str, dst_path: &str) -> Result<()> {
        let dst_key = if src_key.ends_with('/') {
            format!("{dst_path}/")
        } else {
            dst_path.to_string()
        };
        req.init(Method::Put)?;
        req.set_url(&self.ctx.object_url(&dst_key), "");
        req.set_header("x-amz-copy-source", &self.ctx.copy_source(src_key));
        req.set_header("x-amz-metadata-directive", "COPY");
        req.run()?;
        match req.response_code() {
            200 => Ok(()),
            404 => Err(Error::NoEntry(src_key.to_string()).into()),
            403 => Err(Error::AccessDenied(src_key.to_string()).into()),
            code => Err(Error::Status {
                code,
                url: req.url().to_string(),
            }
            .into()),
        }
    }

    /// Rename every object under `from/`, the directory marker included,
    /// then delete the sources. Children are enumerated without a delimiter
    /// so the whole subtree moves.
    fn rename_tree(&self, req: &mut HttpRequest, from: &str, to: &str) -> Result<()> {
        let src_prefix = dir_prefix(from);
        let mut moved: Vec<String> = Vec::new();
        let mut marker: Option<String> = None;
        loop {
            let page = self.list_page(req, &src_prefix, marker.as_deref(), false)?;
            for key in &page.keys {
                // The marker object lists under its own prefix; it moves
                // separately, last.
                if key != &src_prefix {
                    moved.push(key.clone());
                }
            }
            match page.next_marker {
                Some(next) => marker = Some(next),
                None => break,
            }
        }

        for key in &moved {
            let Some(rest) = key.strip_prefix(src_prefix.as_str()) else {
                continue;
            };
            let dst_path = format!("{to}/{}", rest.trim_end_matches('/'));
            self.copy_key(req, key, &dst_path)?;
        }
        // Move the marker itself last so a crash leaves the source
        // directory visible.
        self.copy_key(req, &src_prefix, to)?;

        for key in &moved {
            self.delete_key(req, key)?;
            self.cache.invalidate(key.trim_end_matches('/'));
        }
        self.delete_key(req, &src_prefix)?;
        debug!(from, to, objects = moved.len(), "renamed directory tree");
        Ok(())
    }
}

impl Drop for EngineInner {
    fn drop(&mut self) {
        if self.handles.open_count() > 0 {
            warn!(
                open_handles = self.handles.open_count(),
                "engine dropped with open handles"
            );
        }
    }
}

fn dir_prefix(path: &str) -> String {
    if path.is_empty() {
        String::new()
    } else {
        format!("{path}/")
    }
}

fn is_reserved_meta(name: &str) -> bool {
    RESERVED_META_KEYS
        .iter()
        .any(|reserved| reserved.eq_ignore_ascii_case(name))
}
