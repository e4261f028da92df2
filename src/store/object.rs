//! The in-memory reflection of a remote blob: fetched by HEAD, published
//! after PUT, rewritten in place through server-side self-copy.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::debug;

use crate::http::request::{HttpRequest, Method};
use crate::store::{
    self, mime, StoreContext, DEFAULT_CONTENT_TYPE, DIRECTORY_CONTENT_TYPE, META_GID, META_MODE,
    META_MTIME, META_PREFIX, META_UID, SYMLINK_CONTENT_TYPE,
};
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    File,
    Directory,
    Symlink,
}

/// Path resolution hint: directories live under a trailing-slash key, so a
/// caller that already knows the kind can skip one HEAD.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Hint {
    #[default]
    None,
    IsDir,
    IsFile,
}

#[derive(Debug, Clone)]
pub struct Object {
    path: String,
    kind: ObjectKind,
    mode: u32,
    uid: u32,
    gid: u32,
    mtime: SystemTime,
    size: u64,
    etag: String,
    content_type: String,
    /// User metadata, reserved keys excluded. Case preserved on write,
    /// compared case-insensitively on read.
    metadata: Vec<(String, String)>,
}

impl Object {
    /// Resolve `path` against the remote with up to two HEAD requests (the
    /// trailing-slash directory variant first unless the hint says file).
    pub fn fetch(
        req: &mut HttpRequest,
        ctx: &StoreContext,
        path: &str,
        hint: Hint,
    ) -> Result<Object> {
        if path.is_empty() {
            return Ok(Self::root(ctx));
        }
        if hint != Hint::IsFile {
            if let Some(object) = Self::head(req, ctx, path, true)? {
                return Ok(object);
            }
        }
        if hint != Hint::IsDir {
            if let Some(object) = Self::head(req, ctx, path, false)? {
                return Ok(object);
            }
        }
        Err(Error::NoEntry(path.to_string()).into())
    }

    fn head(
        req: &mut HttpRequest,
        ctx: &StoreContext,
        path: &str,
        as_dir: bool,
    ) -> Result<Option<Object>> {
        let key = if as_dir {
            format!("{path}/")
        } else {
            path.to_string()
        };
        req.init(Method::Head)?;
        req.set_url(&ctx.object_url(&key), "");
        req.run()?;

        match req.response_code() {
            200 => Ok(Some(Self::from_response(req, ctx, path, as_dir))),
            404 => Ok(None),
            403 => Err(Error::AccessDenied(path.to_string()).into()),
            code => Err(Error::Status {
                code,
                url: req.url().to_string(),
            }
            .into()),
        }
    }

    fn from_response(req: &HttpRequest, ctx: &StoreContext, path: &str, as_dir: bool) -> Object {
        let headers = req.response_headers();
        let content_type = headers
            .get("Content-Type")
            .unwrap_or(DEFAULT_CONTENT_TYPE)
            .to_string();
        let kind = if as_dir || content_type == DIRECTORY_CONTENT_TYPE {
            ObjectKind::Directory
        } else if content_type == SYMLINK_CONTENT_TYPE {
            ObjectKind::Symlink
        } else {
            ObjectKind::File
        };

        let size = headers
            .get("Content-Length")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let etag = headers
            .get("ETag")
            .map(|v| v.trim_matches('"').to_string())
            .unwrap_or_default();

        let (default_uid, default_gid) = ctx.default_owner();
        let mut object = Object {
            path: path.to_string(),
            kind,
            mode: default_mode(kind),
            uid: default_uid,
            gid: default_gid,
            mtime: req.last_modified().unwrap_or(UNIX_EPOCH),
            size: if kind == ObjectKind::Directory { 0 } else { size },
            etag,
            content_type,
            metadata: Vec::new(),
        };

        for (name, value) in headers.iter() {
            let Some(key) = strip_meta_prefix(name) else {
                continue;
            };
            if key.eq_ignore_ascii_case(META_MODE) {
                if let Ok(mode) = u32::from_str_radix(value, 8) {
                    object.mode = mode & 0o7777;
                }
            } else if key.eq_ignore_ascii_case(META_UID) {
                if let Ok(uid) = value.parse() {
                    object.uid = uid;
                }
            } else if key.eq_ignore_ascii_case(META_GID) {
                if let Ok(gid) = value.parse() {
                    object.gid = gid;
                }
            } else if key.eq_ignore_ascii_case(META_MTIME) {
                if let Ok(secs) = value.parse() {
                    object.mtime = UNIX_EPOCH + Duration::from_secs(secs);
                }
            } else {
                object.metadata.push((key.to_string(), value.to_string()));
            }
        }

        debug!(path, etag = %object.etag, size = object.size, "fetched descriptor");
        object
    }

    /// Build a brand-new descriptor for an object about to be created.
    pub fn for_new(ctx: &StoreContext, path: &str, kind: ObjectKind, mode: u32) -> Object {
        let (uid, gid) = ctx.default_owner();
        let content_type = match kind {
            ObjectKind::Directory => DIRECTORY_CONTENT_TYPE.to_string(),
            ObjectKind::Symlink => SYMLINK_CONTENT_TYPE.to_string(),
            ObjectKind::File => {
                mime::guess(path).unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string())
            }
        };
        Object {
            path: path.to_string(),
            kind,
            mode: mode & 0o7777,
            uid,
            gid,
            mtime: SystemTime::now(),
            size: 0,
            etag: String::new(),
            content_type,
            metadata: Vec::new(),
        }
    }

    /// Synthetic descriptor for the mount root; never hits the remote.
    pub fn root(ctx: &StoreContext) -> Object {
        let (uid, gid) = ctx.default_owner();
        Object {
            path: String::new(),
            kind: ObjectKind::Directory,
            mode: 0o755,
            uid,
            gid,
            mtime: UNIX_EPOCH,
            size: 0,
            etag: String::new(),
            content_type: DIRECTORY_CONTENT_TYPE.to_string(),
            metadata: Vec::new(),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Remote key: directories carry the trailing-slash variant.
    pub fn key(&self) -> String {
        match self.kind {
            ObjectKind::Directory => format!("{}/", self.path),
            _ => self.path.clone(),
        }
    }

    pub fn kind(&self) -> ObjectKind {
        self.kind
    }

    pub fn mode(&self) -> u32 {
        self.mode
    }

    pub fn uid(&self) -> u32 {
        self.uid
    }

    pub fn gid(&self) -> u32 {
        self.gid
    }

    pub fn mtime(&self) -> SystemTime {
        self.mtime
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn etag(&self) -> &str {
        &self.etag
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    pub fn set_mode(&mut self, mode: u32) {
        self.mode = mode & 0o7777;
    }

    pub fn set_owner(&mut self, uid: Option<u32>, gid: Option<u32>) {
        if let Some(uid) = uid {
            self.uid = uid;
        }
        if let Some(gid) = gid {
            self.gid = gid;
        }
    }

    pub fn set_mtime(&mut self, mtime: SystemTime) {
        self.mtime = mtime;
    }

    pub fn set_size(&mut self, size: u64) {
        self.size = size;
    }

    pub fn set_etag(&mut self, etag: impl Into<String>) {
        self.etag = etag.into();
    }

    pub fn set_path(&mut self, path: impl Into<String>) {
        self.path = path.into();
    }

    pub fn user_metadata(&self) -> &[(String, String)] {
        &self.metadata
    }

    pub fn user_meta(&self, key: &str) -> Option<&str> {
        self.metadata
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    pub fn set_user_meta(&mut self, key: &str, value: &str) {
        if let Some(entry) = self
            .metadata
            .iter_mut()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
        {
            entry.1 = value.to_string();
        } else {
            self.metadata.push((key.to_string(), value.to_string()));
        }
    }

    pub fn remove_user_meta(&mut self, key: &str) -> bool {
        let before = self.metadata.len();
        self.metadata.retain(|(k, _)| !k.eq_ignore_ascii_case(key));
        self.metadata.len() != before
    }

    /// Apply the headers a PUT of this object must carry: content type plus
    /// the reserved and user metadata.
    pub fn apply_write_headers(&self, req: &mut HttpRequest) {
        req.set_header("Content-Type", &self.content_type);
        req.set_header(&store::meta_header(META_MODE), &format!("{:o}", self.mode));
        req.set_header(&store::meta_header(META_UID), &self.uid.to_string());
        req.set_header(&store::meta_header(META_GID), &self.gid.to_string());
        req.set_header(
            &store::meta_header(META_MTIME),
            &unix_secs(self.mtime).to_string(),
        );
        for (key, value) in &self.metadata {
            req.set_header(&store::meta_header(key), value);
        }
    }

    /// Rewrite the object's metadata in place with a server-side self-copy.
    /// No body moves; the store replaces the stored headers.
    pub fn commit(&self, req: &mut HttpRequest, ctx: &StoreContext) -> Result<()> {
        let key = self.key();
        req.init(Method::Put)?;
        req.set_url(&ctx.object_url(&key), "");
        req.set_header("x-amz-copy-source", &ctx.copy_source(&key));
        req.set_header("x-amz-metadata-directive", "REPLACE");
        self.apply_write_headers(req);
        req.run()?;

        match req.response_code() {
            200 => Ok(()),
            404 => Err(Error::NoEntry(self.path.clone()).into()),
            403 => Err(Error::AccessDenied(self.path.clone()).into()),
            code => Err(Error::Status {
                code,
                url: req.url().to_string(),
            }
            .into()),
        }
    }
}

fn default_mode(kind: ObjectKind) -> u32 {
    match kind {
        ObjectKind::Directory => 0o755,
        ObjectKind::Symlink => 0o777,
        ObjectKind::File => 0o644,
    }
}

fn strip_meta_prefix(name: &str) -> Option<&str> {
    if name.len() >= META_PREFIX.len()
        && name[..META_PREFIX.len()].eq_ignore_ascii_case(META_PREFIX)
    {
        Some(&name[META_PREFIX.len()..])
    } else {
        None
    }
}

pub fn unix_secs(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs()
}
