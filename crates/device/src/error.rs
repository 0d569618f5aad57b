use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("device for volume label `{0}` did not appear under /dev/disk/by-id")]
    DeviceNotFound(String),

    #[error("helper command `{cmd}` failed: {detail}")]
    CommandFailed { cmd: String, detail: String },

    #[error("failed to spawn helper command `{cmd}`: {source}")]
    Spawn {
        cmd: String,
        #[source]
        source: std::io::Error,
    },

    #[error("filesystem type `{0}` is not supported")]
    UnsupportedFsType(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("could not determine mount table: {0}")]
    MountTable(String),
}
