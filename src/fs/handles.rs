//! Open-file table: bridges POSIX handle semantics to whole-object GET/PUT
//! against the store, staging content in anonymous local scratch files.

use std::fs::File;
use std::os::unix::fs::FileExt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use tracing::debug;

use crate::http::request::{HttpRequest, Method};
use crate::store::object::{Object, ObjectKind};
use crate::store::{ObjectCache, StoreContext};
use crate::{Error, Result};

/// Flush-related handle state. `Flushing` means a PUT of a scratch snapshot
/// is in progress; writers wait for it to clear so every PUT body is a
/// coherent snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FlushState {
    Clean,
    Dirty,
    Flushing,
}

struct HandleState {
    flush: FlushState,
    /// Descriptor snapshot carried from open, updated after each successful
    /// flush; supplies content type and metadata for PUT headers.
    object: Object,
}

/// One open file. The scratch file holds the entire object body; reads and
/// writes are serialized through the state mutex.
pub struct FileHandle {
    id: u64,
    path: String,
    scratch: File,
    state: Mutex<HandleState>,
    changed: Condvar,
}

impl FileHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Etag recorded at open (or at the most recent flush). Advisory only:
    /// a mismatch at PUT time is overwritten, last writer wins.
    pub fn etag(&self) -> String {
        self.state.lock().object.etag().to_string()
    }

    pub fn is_dirty(&self) -> bool {
        self.state.lock().flush != FlushState::Clean
    }

    fn read(&self, offset: u64, size: u32) -> Result<Vec<u8>> {
        let _state = self.state.lock();
        let len = self.scratch.metadata()?.len();
        if offset >= len {
            return Ok(Vec::new());
        }
        let wanted = (size as u64).min(len - offset) as usize;
        let mut buf = vec![0u8; wanted];
        self.scratch.read_exact_at(&mut buf, offset)?;
        Ok(buf)
    }

    fn write(&self, offset: u64, data: &[u8]) -> Result<u32> {
        let mut state = self.state.lock();
        while state.flush == FlushState::Flushing {
            self.changed.wait(&mut state);
        }
        self.scratch.write_all_at(data, offset)?;
        state.flush = FlushState::Dirty;
        Ok(data.len() as u32)
    }

    fn truncate(&self, size: u64) -> Result<()> {
        let mut state = self.state.lock();
        while state.flush == FlushState::Flushing {
            self.changed.wait(&mut state);
        }
        self.scratch.set_len(size)?;
        state.flush = FlushState::Dirty;
        Ok(())
    }

    /// If dirty, PUT the scratch contents and publish the fresh descriptor.
    /// On failure the handle stays dirty; a concurrent flush is waited out
    /// rather than doubled up.
    fn flush(&self, req: &mut HttpRequest, ctx: &StoreContext, cache: &ObjectCache) -> Result<()> {
        let mut object = {
            let mut state = self.state.lock();
            while state.flush == FlushState::Flushing {
                self.changed.wait(&mut state);
            }
            if state.flush == FlushState::Clean {
                return Ok(());
            }
            state.flush = FlushState::Flushing;
            state.object.clone()
        };

        // Writers wait on Flushing, so the scratch file cannot change under
        // this read: the PUT body is a coherent snapshot.
        let result = self.put_snapshot(req, ctx, &mut object);

        let mut state = self.state.lock();
        match &result {
            Ok(()) => {
                state.flush = FlushState::Clean;
                state.object = object.clone();
                cache.insert(object);
            }
            Err(_) => {
                state.flush = FlushState::Dirty;
            }
        }
        self.changed.notify_all();
        drop(state);

        result
    }

    fn put_snapshot(
        &self,
        req: &mut HttpRequest,
        ctx: &StoreContext,
        object: &mut Object,
    ) -> Result<()> {
        let len = self.scratch.metadata()?.len();
        let mut body = vec![0u8; len as usize];
        self.scratch.read_exact_at(&mut body, 0)?;

        object.set_mtime(SystemTime::now());
        object.set_size(len);

        req.init(Method::Put)?;
        req.set_url(&ctx.object_url(&object.key()), "");
        object.apply_write_headers(req);
        req.set_input_buffer(body)?;
        req.run()?;

        match req.response_code() {
            200 => {
                if let Some(etag) = req.response_headers().get("ETag") {
                    object.set_etag(etag.trim_matches('"'));
                }
                debug!(path = %self.path, etag = %object.etag(), size = len, "flushed");
                Ok(())
            }
            403 => Err(Error::AccessDenied(self.path.clone()).into()),
            code => Err(Error::Status {
                code,
                url: req.url().to_string(),
            }
            .into()),
        }
    }
}

/// Maps integer handles to open files. Handle ids are nonzero and never
/// reused within the process lifetime.
pub struct OpenFileTable {
    handles: DashMap<u64, Arc<FileHandle>>,
    next_id: AtomicU64,
}

impl Default for OpenFileTable {
    fn default() -> Self {
        Self::new()
    }
}

impl OpenFileTable {
    pub fn new() -> Self {
        Self {
            handles: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Fetch the object body into a fresh scratch file and register a
    /// handle for it. Directories cannot be opened.
    pub fn open(
        &self,
        req: &mut HttpRequest,
        ctx: &StoreContext,
        object: &Object,
    ) -> Result<u64> {
        if object.kind() == ObjectKind::Directory {
            return Err(Error::IsADirectory(object.path().to_string()).into());
        }

        let scratch = tempfile::tempfile_in(ctx.scratch_dir())?;

        req.init(Method::Get)?;
        req.set_url(&ctx.object_url(&object.key()), "");
        req.run()?;
        match req.response_code() {
            200 => {}
            404 => return Err(Error::NoEntry(object.path().to_string()).into()),
            403 => return Err(Error::AccessDenied(object.path().to_string()).into()),
            code => {
                return Err(Error::Status {
                    code,
                    url: req.url().to_string(),
                }
                .into())
            }
        }
        let body = req.take_output();
        scratch.write_all_at(&body, 0)?;

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let handle = Arc::new(FileHandle {
            id,
            path: object.path().to_string(),
            scratch,
            state: Mutex::new(HandleState {
                flush: FlushState::Clean,
                object: object.clone(),
            }),
            changed: Condvar::new(),
        });
        self.handles.insert(id, handle);
        debug!(id, path = %object.path(), size = body.len(), "opened handle");
        Ok(id)
    }

    pub fn get(&self, id: u64) -> Result<Arc<FileHandle>> {
        self.handles
            .get(&id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Error::BadHandle(id).into())
    }

    pub fn read(&self, id: u64, offset: u64, size: u32) -> Result<Vec<u8>> {
        self.get(id)?.read(offset, size)
    }

    pub fn write(&self, id: u64, offset: u64, data: &[u8]) -> Result<u32> {
        self.get(id)?.write(offset, data)
    }

    pub fn truncate(&self, id: u64, size: u64) -> Result<()> {
        self.get(id)?.truncate(size)
    }

    pub fn flush(
        &self,
        req: &mut HttpRequest,
        ctx: &StoreContext,
        cache: &ObjectCache,
        id: u64,
    ) -> Result<()> {
        self.get(id)?.flush(req, ctx, cache)
    }

    /// Final flush, then drop the handle. The handle id is gone either way;
    /// a flush failure is still reported so close can surface prior write
    /// errors. Releasing an unknown id yields EBADF.
    pub fn release(
        &self,
        req: &mut HttpRequest,
        ctx: &StoreContext,
        cache: &ObjectCache,
        id: u64,
    ) -> Result<()> {
        let Some((_, handle)) = self.handles.remove(&id) else {
            return Err(Error::BadHandle(id).into());
        };
        let result = handle.flush(req, ctx, cache);
        debug!(id, path = %handle.path(), "released handle");
        result
    }

    pub fn open_count(&self) -> usize {
        self.handles.len()
    }
}
