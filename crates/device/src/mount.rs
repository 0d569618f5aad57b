//! The safe format-and-mount helper and bind-mount plumbing used by
//! NodeStage/Publish. `mountpoints` answers "is this path
//! currently mounted" and "what backs this mountpoint", `sys-mount` issues
//! the actual `mount(2)` calls, `blkid`/`mkfs.*` are shelled out to via
//! `tokio::process::Command` the same way the LUKS helper is.

use std::path::{Path, PathBuf};

use sys_mount::{Mount, MountFlags, UnmountFlags};
use tokio::process::Command;

use crate::error::Error;

/// Filesystems this driver knows how to format and mount.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsType {
    Ext4,
    Xfs,
}

impl FsType {
    pub fn parse(s: &str) -> Result<Self, Error> {
        match s {
            "" | "ext4" => Ok(FsType::Ext4),
            "xfs" => Ok(FsType::Xfs),
            other => Err(Error::UnsupportedFsType(other.to_string())),
        }
    }

    fn mkfs_binary(self) -> &'static str {
        match self {
            FsType::Ext4 => "mkfs.ext4",
            FsType::Xfs => "mkfs.xfs",
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            FsType::Ext4 => "ext4",
            FsType::Xfs => "xfs",
        }
    }
}

/// Returns whether `device` already carries a recognized filesystem
/// signature, via `blkid -p -s TYPE -o value`.
async fn is_formatted(device: &Path) -> Result<bool, Error> {
    let output = Command::new("blkid")
        .arg("-p")
        .arg("-s")
        .arg("TYPE")
        .arg("-o")
        .arg("value")
        .arg(device)
        .output()
        .await
        .map_err(|source| Error::Spawn {
            cmd: "blkid".into(),
            source,
        })?;

    Ok(output.status.success() && !output.stdout.is_empty())
}

/// Check whether `path` is currently a mount point.
pub fn is_mount_point(path: &Path) -> Result<bool, Error> {
    let mounts = mountpoints::mountpaths().map_err(|err| Error::MountTable(err.to_string()))?;
    Ok(mounts.contains(&path.to_path_buf()))
}

/// The device path currently mounted at `path`, if any. `mountpoints` only
/// reports the mount paths, not their backing device, so this reads
/// `/proc/mounts` directly (Linux-only, same as the rest of this crate).
pub fn mount_source(path: &Path) -> Result<Option<PathBuf>, Error> {
    let contents = std::fs::read_to_string("/proc/mounts")?;

    for line in contents.lines() {
        let mut fields = line.split_whitespace();
        let Some(device) = fields.next() else { continue };
        let Some(mount_point) = fields.next() else {
            continue;
        };

        if Path::new(mount_point) == path {
            return Ok(Some(PathBuf::from(device)));
        }
    }

    Ok(None)
}

/// Format `device` with `fs_type` if it isn't already formatted, then mount
/// it at `target` with `options`. Idempotent: a formatted device is never
/// reformatted.
pub async fn format_and_mount(
    device: &Path,
    target: &Path,
    fs_type: FsType,
    options: &[&str],
) -> Result<(), Error> {
    if !is_formatted(device).await? {
        log::info!(
            "formatting {} as {} before first mount",
            device.display(),
            fs_type.as_str()
        );

        let output = Command::new(fs_type.mkfs_binary())
            .arg(device)
            .output()
            .await
            .map_err(|source| Error::Spawn {
                cmd: fs_type.mkfs_binary().into(),
                source,
            })?;

        if !output.status.success() {
            return Err(Error::CommandFailed {
                cmd: fs_type.mkfs_binary().into(),
                detail: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
    }

    mount(device, target, fs_type.as_str(), options, false)
}

/// Bind-mount `source` onto `target` (NodePublishVolume), optionally
/// read-only.
pub fn bind_mount(source: &Path, target: &Path, readonly: bool) -> Result<(), Error> {
    mount(source, target, "none", &[], true).and_then(|_| {
        if readonly {
            remount_readonly(target)
        } else {
            Ok(())
        }
    })
}

fn mount(
    source: &Path,
    target: &Path,
    fstype: &str,
    options: &[&str],
    bind: bool,
) -> Result<(), Error> {
    let mut flags = MountFlags::empty();
    if bind {
        flags |= MountFlags::BIND;
    }

    let mut builder = Mount::builder().fstype(fstype).flags(flags);
    if !options.is_empty() {
        builder = builder.data(&options.join(","));
    }

    builder
        .mount(source, target)
        .map_err(|err| Error::CommandFailed {
            cmd: "mount".into(),
            detail: err.to_string(),
        })?;

    Ok(())
}

fn remount_readonly(target: &Path) -> Result<(), Error> {
    Mount::builder()
        .fstype("none")
        .flags(MountFlags::BIND | MountFlags::RDONLY | MountFlags::REMOUNT)
        .mount(target, target)
        .map_err(|err| Error::CommandFailed {
            cmd: "mount (remount,ro)".into(),
            detail: err.to_string(),
        })?;

    Ok(())
}

/// Unmount `target`. Idempotent: unmounting a path that isn't mounted is a
/// no-op, not an error.
pub fn unmount(target: &Path) -> Result<(), Error> {
    if !is_mount_point(target)? {
        return Ok(());
    }

    sys_mount::unmount(target, UnmountFlags::empty()).map_err(|err| Error::CommandFailed {
        cmd: "umount".into(),
        detail: err.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fs_type_parses_default_and_xfs() {
        assert_eq!(FsType::parse("").unwrap(), FsType::Ext4);
        assert_eq!(FsType::parse("ext4").unwrap(), FsType::Ext4);
        assert_eq!(FsType::parse("xfs").unwrap(), FsType::Xfs);
        assert!(FsType::parse("zfs").is_err());
    }
}
