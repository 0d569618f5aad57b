//! Filesystem-stat primitive for NodeGetVolumeStats.
//!
//! The raw `statfs(2)` syscall itself is out of scope here — this
//! is a thin wrapper over `nix::sys::statvfs`, returning the raw `Errno` so
//! the caller can apply the EIO/ENOENT/other error-taxonomy mapping
//! verbatim rather than this crate guessing at gRPC semantics it has no
//! business knowing about.

use std::path::Path;

use nix::errno::Errno;
use nix::sys::statvfs::statvfs;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsageTriple {
    pub available: u64,
    pub total: u64,
    pub used: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VolumeStats {
    pub bytes: UsageTriple,
    pub inodes: UsageTriple,
}

/// `statvfs(path)`, converted into the byte/inode triples NodeGetVolumeStats
/// reports. Errors are passed through as raw `Errno`.
pub fn stat_volume(path: &Path) -> Result<VolumeStats, Errno> {
    let stat = statvfs(path)?;

    let block_size = stat.fragment_size().max(1) as u64;
    let blocks = stat.blocks() as u64;
    let blocks_free = stat.blocks_free() as u64;
    let blocks_available = stat.blocks_available() as u64;

    let files = stat.files() as u64;
    let files_free = stat.files_free() as u64;

    Ok(VolumeStats {
        bytes: UsageTriple {
            available: blocks_available * block_size,
            total: blocks * block_size,
            used: blocks.saturating_sub(blocks_free) * block_size,
        },
        inodes: UsageTriple {
            available: files_free,
            total: files,
            used: files.saturating_sub(files_free),
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stats_on_an_existing_directory_succeed() {
        let stats = stat_volume(Path::new("/")).expect("statvfs on / should succeed");
        assert!(stats.bytes.total > 0);
    }

    #[test]
    fn stats_on_a_missing_path_return_enoent() {
        let err = stat_volume(Path::new("/this/path/does/not/exist/honest")).unwrap_err();
        assert_eq!(err, Errno::ENOENT);
    }
}
