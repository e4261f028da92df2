use thiserror::Error;

pub mod cli;
pub mod config;
pub mod fs;
pub mod http;
pub mod logging;
pub mod pool;
pub mod services;
pub mod store;

pub type Result<T> = anyhow::Result<T>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("transfer aborted: {0}")]
    Aborted(String),
    #[error("request timed out")]
    TimedOut,
    #[error("executor has been canceled")]
    Canceled,
    #[error("worker pool is shutting down")]
    ShuttingDown,
    #[error("no such object: {0}")]
    NoEntry(String),
    #[error("access denied: {0}")]
    AccessDenied(String),
    #[error("not a directory: {0}")]
    NotADirectory(String),
    #[error("is a directory: {0}")]
    IsADirectory(String),
    #[error("directory not empty: {0}")]
    NotEmpty(String),
    #[error("object already exists: {0}")]
    Exists(String),
    #[error("bad file handle: {0}")]
    BadHandle(u64),
    #[error("remote returned status {code} for {url}")]
    Status { code: u16, url: String },
    #[error("corrupt response: {0}")]
    Corrupt(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("no such attribute: {0}")]
    NoAttribute(String),
    #[error("not mounted: {0}")]
    NotMounted(String),
    #[error("mount target busy: {0}")]
    Busy(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("cli error: {0}")]
    Cli(String),
}

impl Error {
    /// POSIX errno for this error, as a positive value.
    pub fn errno(&self) -> i32 {
        match self {
            Error::NoEntry(_) => libc::ENOENT,
            Error::AccessDenied(_) => libc::EACCES,
            Error::NotADirectory(_) => libc::ENOTDIR,
            Error::IsADirectory(_) => libc::EISDIR,
            Error::NotEmpty(_) => libc::ENOTEMPTY,
            Error::Exists(_) => libc::EEXIST,
            Error::BadHandle(_) => libc::EBADF,
            Error::ShuttingDown => libc::ESHUTDOWN,
            Error::InvalidArgument(_) => libc::EINVAL,
            Error::NoAttribute(_) => libc::ENODATA,
            Error::NotMounted(_) => libc::EINVAL,
            Error::Busy(_) => libc::EBUSY,
            Error::Status { code, .. } => match code {
                403 => libc::EACCES,
                404 => libc::ENOENT,
                _ => libc::EIO,
            },
            Error::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            _ => libc::EIO,
        }
    }

    /// Rebuild an error from a positive errno, e.g. when a shared fetch
    /// outcome is replayed to single-flight waiters.
    pub fn from_errno(errno: i32, path: &str) -> Error {
        match errno {
            libc::ENOENT => Error::NoEntry(path.to_string()),
            libc::EACCES => Error::AccessDenied(path.to_string()),
            libc::ENOTDIR => Error::NotADirectory(path.to_string()),
            libc::EISDIR => Error::IsADirectory(path.to_string()),
            libc::ESHUTDOWN => Error::ShuttingDown,
            other => Error::Io(std::io::Error::from_raw_os_error(other)),
        }
    }
}

/// Convert any engine-level error into a positive POSIX errno. Closures
/// submitted to the worker pools return `-errno_of(&err)` on failure.
pub fn errno_of(err: &anyhow::Error) -> i32 {
    if let Some(e) = err.downcast_ref::<Error>() {
        return e.errno();
    }
    if let Some(io) = err.downcast_ref::<std::io::Error>() {
        return io.raw_os_error().unwrap_or(libc::EIO);
    }
    libc::EIO
}

/// Entry point for the library, called by the CLI thin wrapper.
pub fn run<I, S>(args: I) -> Result<()>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let cli_args = cli::parse_args(args.into_iter().map(Into::into))?;
    cli::dispatch(cli_args)
}
