//! Configuration loaded from a `key=value` text file at startup. Immutable
//! for the lifetime of the process.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::{Error, Result};

pub const DEFAULT_MAX_TRANSFER_RETRIES: u32 = 3;
pub const DEFAULT_REQUEST_TIMEOUT_IN_S: u64 = 30;
pub const DEFAULT_FG_WORKER_COUNT: usize = 8;
pub const DEFAULT_BG_WORKER_COUNT: usize = 2;
pub const DEFAULT_CACHE_TTL_S: u64 = 120;

#[derive(Debug, Clone)]
pub struct Config {
    /// Base URL of the store, e.g. `https://s3.example.com`.
    pub endpoint: String,
    /// Bucket name; becomes the leading path segment of every object URL.
    pub bucket: String,
    pub region: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub max_transfer_retries: u32,
    pub request_timeout_in_s: u64,
    pub fg_worker_count: usize,
    pub bg_worker_count: usize,
    pub cache_ttl_s: u64,
    pub verbose_requests: bool,
    pub ssl_ca_file: Option<PathBuf>,
    /// Directory for anonymous scratch files backing open handles.
    pub scratch_dir: PathBuf,
    /// Where to dump transfer counters at unmount, if anywhere.
    pub stats_file: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            bucket: String::new(),
            region: "us-east-1".to_string(),
            access_key_id: String::new(),
            secret_access_key: String::new(),
            max_transfer_retries: DEFAULT_MAX_TRANSFER_RETRIES,
            request_timeout_in_s: DEFAULT_REQUEST_TIMEOUT_IN_S,
            fg_worker_count: DEFAULT_FG_WORKER_COUNT,
            bg_worker_count: DEFAULT_BG_WORKER_COUNT,
            cache_ttl_s: DEFAULT_CACHE_TTL_S,
            verbose_requests: false,
            ssl_ca_file: None,
            scratch_dir: std::env::temp_dir(),
            stats_file: None,
        }
    }
}

impl Config {
    /// Load and validate a config file. Lines are `key=value`; blank lines
    /// and lines starting with `#` are skipped. Unknown keys are rejected so
    /// a typo cannot silently fall back to a default.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            Error::Config(format!(
                "cannot read {}: {e}",
                path.as_ref().display()
            ))
        })?;
        Self::parse(&contents)
    }

    pub fn parse(contents: &str) -> Result<Self> {
        let mut pairs = HashMap::new();
        for (lineno, raw) in contents.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (key, value) = line.split_once('=').ok_or_else(|| {
                Error::Config(format!("line {}: expected key=value", lineno + 1))
            })?;
            let key = key.trim().to_string();
            if pairs.insert(key.clone(), value.trim().to_string()).is_some() {
                return Err(Error::Config(format!("duplicate key: {key}")).into());
            }
        }

        let mut config = Config::default();
        for (key, value) in pairs {
            match key.as_str() {
                "endpoint" => config.endpoint = value.trim_end_matches('/').to_string(),
                "bucket" => config.bucket = value,
                "region" => config.region = value,
                "access_key_id" => config.access_key_id = value,
                "secret_access_key" => config.secret_access_key = value,
                "max_transfer_retries" => {
                    config.max_transfer_retries = parse_int(&key, &value, 1)?
                }
                "request_timeout_in_s" => {
                    config.request_timeout_in_s = parse_int(&key, &value, 1)?
                }
                "fg_worker_count" => config.fg_worker_count = parse_int(&key, &value, 1)?,
                "bg_worker_count" => config.bg_worker_count = parse_int(&key, &value, 1)?,
                "cache_ttl_s" => config.cache_ttl_s = parse_int(&key, &value, 0)?,
                "verbose_requests" => config.verbose_requests = parse_bool(&key, &value)?,
                "ssl_ca_file" => config.ssl_ca_file = Some(PathBuf::from(value)),
                "scratch_dir" => config.scratch_dir = PathBuf::from(value),
                "stats_file" => config.stats_file = Some(PathBuf::from(value)),
                other => {
                    return Err(Error::Config(format!("unrecognized key: {other}")).into())
                }
            }
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.endpoint.is_empty() {
            return Err(Error::Config("endpoint is required".into()).into());
        }
        if self.bucket.is_empty() {
            return Err(Error::Config("bucket is required".into()).into());
        }
        if self.bucket.contains('/') {
            return Err(Error::Config("bucket must not contain '/'".into()).into());
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_in_s)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_s)
    }
}

fn parse_int<T>(key: &str, value: &str, min: T) -> Result<T>
where
    T: std::str::FromStr + PartialOrd + std::fmt::Display + Copy,
{
    let parsed: T = value
        .parse()
        .map_err(|_| Error::Config(format!("{key}: not an integer: {value}")))?;
    if parsed < min {
        return Err(Error::Config(format!("{key}: must be >= {min}")).into());
    }
    Ok(parsed)
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value {
        "true" | "yes" | "1" => Ok(true),
        "false" | "no" | "0" => Ok(false),
        other => Err(Error::Config(format!("{key}: not a boolean: {other}")).into()),
    }
}
