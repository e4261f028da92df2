//! Remote store addressing: bucket URL shaping, key encoding, and the
//! metadata header namespace shared by descriptors and handles.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::Config;

pub mod cache;
pub mod mime;
pub mod object;

pub use cache::ObjectCache;
pub use object::{Hint, Object, ObjectKind};

/// User-metadata headers carry this prefix on the wire.
pub const META_PREFIX: &str = "x-amz-meta-";

/// Engine-reserved metadata keys (mode/ownership/mtime survive the store's
/// flat namespace as user metadata).
pub const META_MODE: &str = "objfs-mode";
pub const META_UID: &str = "objfs-uid";
pub const META_GID: &str = "objfs-gid";
pub const META_MTIME: &str = "objfs-mtime";

pub const RESERVED_META_KEYS: [&str; 4] = [META_MODE, META_UID, META_GID, META_MTIME];

pub const DIRECTORY_CONTENT_TYPE: &str = "application/x-directory";
pub const SYMLINK_CONTENT_TYPE: &str = "text/symlink";
pub const DEFAULT_CONTENT_TYPE: &str = "binary/octet-stream";

/// Immutable addressing context shared by the cache, the open-file table,
/// and the facade.
#[derive(Debug)]
pub struct StoreContext {
    endpoint: String,
    bucket: String,
    scratch_dir: PathBuf,
    uid: u32,
    gid: u32,
}

impl StoreContext {
    pub fn new(config: &Config) -> Arc<Self> {
        Arc::new(Self {
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            bucket: config.bucket.clone(),
            scratch_dir: config.scratch_dir.clone(),
            uid: unsafe { libc::getuid() },
            gid: unsafe { libc::getgid() },
        })
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// URL of the bucket root, used for listings.
    pub fn bucket_url(&self) -> String {
        format!("{}/{}", self.endpoint, self.bucket)
    }

    /// URL of one object.
    pub fn object_url(&self, key: &str) -> String {
        format!("{}/{}/{}", self.endpoint, self.bucket, encode_key(key))
    }

    /// `x-amz-copy-source` value addressing one of our own objects.
    pub fn copy_source(&self, key: &str) -> String {
        format!("/{}/{}", self.bucket, encode_key(key))
    }

    pub fn scratch_dir(&self) -> &Path {
        &self.scratch_dir
    }

    /// Default ownership for objects that carry no stored uid/gid.
    pub fn default_owner(&self) -> (u32, u32) {
        (self.uid, self.gid)
    }
}

/// Full metadata header name for a user-metadata key.
pub fn meta_header(key: &str) -> String {
    format!("{META_PREFIX}{key}")
}

/// Percent-encode an object key for use in a URL path, preserving '/'.
pub fn encode_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for byte in key.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' | b'/' => {
                out.push(byte as char)
            }
            other => out.push_str(&format!("%{other:02X}")),
        }
    }
    out
}

/// Strip the leading slash and any trailing slash from a FUSE path, yielding
/// the canonical object path ("" is the root).
pub fn canonicalize(path: &str) -> String {
    path.trim_start_matches('/').trim_end_matches('/').to_string()
}
