//! Implementation of `objfs unmount` subcommand.

use std::path::{Path, PathBuf};
use std::process::Command;

use clap::Args;

use crate::{Error, Result};

#[derive(Debug, Clone, Args)]
pub struct UnmountArgs {
    /// Mount target directory
    pub mountpoint: Option<PathBuf>,
}

pub fn execute(args: UnmountArgs) -> Result<()> {
    let mountpoint = args
        .mountpoint
        .ok_or_else(|| Error::Cli("mountpoint is required".into()))?;
    if !mountpoint.is_dir() {
        return Err(Error::Cli(format!(
            "invalid mountpoint: {}",
            mountpoint.display()
        ))
        .into());
    }
    system_unmount(&mountpoint)
}

/// What one unmount tool invocation told us.
enum ToolOutcome {
    Detached,
    Missing,
    NotMounted,
    Busy(String),
    Failed(String),
}

fn run_unmount_tool(program: &str, args: &[&str]) -> Result<ToolOutcome> {
    let output = match Command::new(program).args(args).output() {
        Ok(output) => output,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Ok(ToolOutcome::Missing)
        }
        Err(err) => return Err(Error::Io(err).into()),
    };
    if output.status.success() {
        return Ok(ToolOutcome::Detached);
    }

    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    let lower = stderr.to_lowercase();
    if lower.contains("not mounted") || lower.contains("not found in /etc/mtab") {
        Ok(ToolOutcome::NotMounted)
    } else if lower.contains("busy") {
        Ok(ToolOutcome::Busy(stderr))
    } else {
        Ok(ToolOutcome::Failed(format!("{program}: {stderr}")))
    }
}

/// Detach a FUSE mount through the system tools, preferring `fusermount -u`
/// and falling back to plain `umount` where fusermount is absent.
pub fn system_unmount(mountpoint: &Path) -> Result<()> {
    let target = mountpoint.to_string_lossy();
    let attempts: [(&str, Vec<&str>); 2] = [
        ("fusermount", vec!["-u", target.as_ref()]),
        ("umount", vec![target.as_ref()]),
    ];

    let mut saw_not_mounted = false;
    let mut last_failure: Option<String> = None;

    for (program, args) in attempts {
        match run_unmount_tool(program, &args)? {
            ToolOutcome::Detached => return Ok(()),
            ToolOutcome::Missing => {}
            ToolOutcome::NotMounted => saw_not_mounted = true,
            // A busy target will stay busy no matter which tool asks.
            ToolOutcome::Busy(detail) => {
                return Err(Error::Busy(format!(
                    "{} ({detail})",
                    mountpoint.display()
                ))
                .into())
            }
            ToolOutcome::Failed(detail) => last_failure = Some(detail),
        }
    }

    if saw_not_mounted {
        return Err(Error::NotMounted(mountpoint.display().to_string()).into());
    }
    match last_failure {
        Some(detail) => Err(Error::Cli(format!(
            "failed to unmount {}: {detail}",
            mountpoint.display()
        ))
        .into()),
        None => Err(Error::NotMounted(mountpoint.display().to_string()).into()),
    }
}
