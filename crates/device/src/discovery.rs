//! Device-path discovery. The provider never tells us the
//! `/dev/disk/by-id/...` path ahead of time with perfect timing — the
//! kernel sometimes lags the symlink behind the device actually appearing,
//! so we nudge `udevadm` before every probe.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::process::Command;

use crate::error::Error;

const BY_ID_DIR: &str = "/dev/disk/by-id";
const DEV_DIR: &str = "/dev";

/// Deterministic candidate paths for a volume's label, in probe order.
pub fn candidate_paths(label: &str, partition: Option<&str>) -> Vec<PathBuf> {
    let mut bases = vec![
        format!("{BY_ID_DIR}/linode-{label}"),
        format!("{BY_ID_DIR}/scsi-0Linode_Volume_{label}"),
    ];

    if let Some(part) = partition {
        for base in bases.iter_mut() {
            base.push_str(&format!("-part{part}"));
        }
    }

    bases.into_iter().map(PathBuf::from).collect()
}

/// Snapshot the `/dev/sd*` device nodes currently present.
async fn snapshot_sd_devices() -> Result<HashSet<PathBuf>, Error> {
    let mut entries = tokio::fs::read_dir(DEV_DIR).await?;
    let mut found = HashSet::new();

    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        if name.to_string_lossy().starts_with("sd") {
            found.insert(PathBuf::from(DEV_DIR).join(name));
        }
    }

    Ok(found)
}

/// Ask udev to re-evaluate rules for `device`. Best-effort: a failure here
/// never blocks the device search.
async fn trigger_udev_change(device: &Path) {
    let devname = device.to_string_lossy();
    let result = Command::new("udevadm")
        .arg("trigger")
        .arg("--action=change")
        .arg(format!("--property-match=DEVNAME={devname}"))
        .output()
        .await;

    if let Err(err) = result {
        log::warn!("udevadm trigger failed for {devname}: {err}");
    }
}

/// One discovery attempt: nudge udev for anything that appeared since
/// `before` was snapshotted, then return the first candidate path that
/// exists. `Ok(None)` means "not there yet, caller should retry" — not an
/// error.
pub async fn discover_device(
    label: &str,
    partition: Option<&str>,
    before: &HashSet<PathBuf>,
) -> Result<Option<PathBuf>, Error> {
    let candidates = candidate_paths(label, partition);

    let after = snapshot_sd_devices().await?;
    for new_device in after.difference(before) {
        trigger_udev_change(new_device).await;
    }

    for candidate in &candidates {
        // `exists()` follows symlinks, which is exactly what we want: a
        // dangling by-id symlink doesn't count as the device being present.
        if candidate.exists() {
            return Ok(Some(candidate.clone()));
        }
    }

    Ok(None)
}

/// Retry [`discover_device`] until it finds something or `cap` elapses.
///
/// The `/dev/sd*` snapshot is taken once, before the first attempt, and
/// reused across every retry: a device that hotplugs mid-wait must show up
/// as new relative to that original snapshot, not relative to whatever the
/// previous retry happened to see.
pub async fn wait_for_device(
    label: &str,
    partition: Option<&str>,
    cap: Duration,
) -> Result<PathBuf, Error> {
    let deadline = tokio::time::Instant::now() + cap;
    let mut retry_delay = Duration::from_millis(500);
    let before = snapshot_sd_devices().await?;

    loop {
        if let Some(path) = discover_device(label, partition, &before).await? {
            return Ok(path);
        }

        if tokio::time::Instant::now() >= deadline {
            return Err(Error::DeviceNotFound(label.to_string()));
        }

        tokio::time::sleep(retry_delay.min(deadline - tokio::time::Instant::now())).await;
        retry_delay = (retry_delay * 2).min(Duration::from_secs(5));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candidate_paths_cover_both_naming_schemes() {
        let paths = candidate_paths("1234-myvol", None);
        assert_eq!(
            paths,
            vec![
                PathBuf::from("/dev/disk/by-id/linode-1234-myvol"),
                PathBuf::from("/dev/disk/by-id/scsi-0Linode_Volume_1234-myvol"),
            ]
        );
    }

    #[test]
    fn candidate_paths_append_partition_suffix() {
        let paths = candidate_paths("myvol", Some("1"));
        assert_eq!(
            paths,
            vec![
                PathBuf::from("/dev/disk/by-id/linode-myvol-part1"),
                PathBuf::from("/dev/disk/by-id/scsi-0Linode_Volume_myvol-part1"),
            ]
        );
    }
}
