use thiserror::Error;

/// Errors surfaced by the cloud API client. The `csi` crate maps each
/// variant to a gRPC status at the RPC boundary; this crate
/// stays free of any `tonic` dependency.
#[derive(Debug, Error)]
pub enum Error {
    #[error("resource not found")]
    NotFound,

    #[error("request was rejected: {0}")]
    BadRequest(String),

    #[error("provider reported volume `{volume_id}` as already attached")]
    AlreadyAttached { volume_id: u64 },

    #[error("transport error talking to provider API: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("provider returned an unexpected response: {0}")]
    UnexpectedResponse(String),

    #[error("timed out waiting for volume to reach the expected state")]
    Timeout,
}
