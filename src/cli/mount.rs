//! Implementation of `objfs mount` subcommand.

use std::{
    fs,
    path::{Path, PathBuf},
    sync::atomic::{AtomicBool, Ordering},
    sync::Arc,
    thread,
    time::Duration,
};

use clap::Args;
use tracing::{info, instrument};

use crate::{
    config::Config,
    fs::{fuse, MountSession, MountTarget},
    http::stats,
    logging,
    services::S3Hook,
    Error, Result,
};

const MOUNT_POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Args)]
pub struct MountArgs {
    /// Path to the key=value configuration file
    #[arg(short = 'c', long = "config")]
    pub config: Option<PathBuf>,

    /// Mount target directory
    pub mountpoint: Option<PathBuf>,

    /// Append logs to this file instead of stderr
    #[arg(long = "log-file")]
    pub log_file: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long = "log-json", default_value_t = false)]
    pub log_json: bool,

    /// Enable trace-level logging
    #[arg(long = "debug", default_value_t = false)]
    pub debug: bool,
}

#[derive(Debug)]
pub struct MountContext {
    pub config: Config,
    pub session: MountSession,
    pub fuse_handle: Option<fuse::MountHandle>,
    pub engine: crate::fs::Engine,
}

/// Mount, then stay attached until SIGINT/SIGTERM arrives or the target
/// disappears from the mount table (external `umount`).
pub fn execute(args: MountArgs) -> Result<()> {
    let mut ctx = mount(args)?;

    if let Some(handle) = ctx.fuse_handle.take() {
        info!("objfs mount active; press Ctrl+C to unmount");

        let interrupted = Arc::new(AtomicBool::new(false));
        ctrlc::set_handler({
            let interrupted = interrupted.clone();
            move || interrupted.store(true, Ordering::SeqCst)
        })
        .map_err(|e| Error::Cli(format!("failed to install signal handler: {e}")))?;

        loop {
            if interrupted.load(Ordering::SeqCst) {
                info!(
                    "signal received; unmounting {}",
                    ctx.session.mountpoint.display()
                );
                break;
            }
            if !is_mounted(&ctx.session.mountpoint) {
                info!(
                    "mountpoint {} detached externally; exiting",
                    ctx.session.mountpoint.display()
                );
                break;
            }
            thread::sleep(MOUNT_POLL_INTERVAL);
        }

        // Joining the session detaches the mount (or reaps an already
        // detached one) and stops the kernel callbacks.
        handle.unmount();

        ctx.session.mark_unmounted();
        ctx.engine.shutdown();

        let snapshot = stats::snapshot();
        logging::log_transfer_metrics(snapshot, false);
        if let Some(stats_path) = &ctx.config.stats_file {
            if let Err(err) = stats::write_stats_file(stats_path, &snapshot) {
                tracing::warn!(path = %stats_path.display(), error = %err, "failed to write stats file");
            }
        }
    }

    Ok(())
}

/// A mount stays visible as the second field of `/proc/self/mounts` until
/// the kernel detaches it.
fn is_mounted(mountpoint: &Path) -> bool {
    let Ok(table) = fs::read_to_string("/proc/self/mounts") else {
        return false;
    };
    let needle = mountpoint.to_string_lossy();
    table.lines().any(|entry| {
        let mut fields = entry.split_whitespace();
        fields.next();
        fields.next() == Some(needle.as_ref())
    })
}

/// Perform mount orchestration used by both the CLI and tests.
#[instrument(skip(args), fields(mountpoint = ?args.mountpoint, config = ?args.config))]
pub fn mount(args: MountArgs) -> Result<MountContext> {
    logging::init_logging(logging::LoggingConfig {
        format: if args.log_json {
            logging::LogFormat::Json
        } else {
            logging::LogFormat::Human
        },
        sink: match &args.log_file {
            Some(path) => logging::LogSink::File(path.clone()),
            None => logging::LogSink::Console,
        },
        debug: args.debug,
    })?;

    let config_path = args
        .config
        .ok_or_else(|| Error::Cli("config is required".into()))?;
    let mountpoint = args
        .mountpoint
        .ok_or_else(|| Error::Cli("mountpoint is required".into()))?;

    let config = Config::load(&config_path)?;
    info!(endpoint = %config.endpoint, bucket = %config.bucket, "configuration loaded");

    let target = MountTarget::new(&mountpoint);
    target.validate()?;
    info!("validated mount target");

    let hook = Arc::new(S3Hook::new(&config));
    let engine = crate::fs::Engine::new(&config, hook);

    // Fail before mounting if the endpoint is unreachable or the
    // credentials are rejected.
    match engine.probe() {
        Ok(()) => info!(bucket = %config.bucket, "startup probe succeeded"),
        Err(errno) if errno == libc::EACCES => {
            engine.shutdown();
            return Err(Error::Cli(format!(
                "authentication failed for bucket {}",
                config.bucket
            ))
            .into());
        }
        Err(errno) => {
            engine.shutdown();
            return Err(Error::Cli(format!(
                "endpoint {} unreachable (errno {errno})",
                config.endpoint
            ))
            .into());
        }
    }

    let mut session = MountSession::new(&mountpoint);
    let fuse_handle = Some(fuse::spawn_objectfs(engine.clone(), &mountpoint)?);
    session.mark_ready();
    info!(mount_id = %session.mount_id, "mount ready");

    Ok(MountContext {
        config,
        session,
        fuse_handle,
        engine,
    })
}
