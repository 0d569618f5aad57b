//! Maps every backend error type onto the gRPC status taxonomy. Kept as a
//! handful of free functions rather than a blanket `From` impl because the
//! same backend error means different things at different call sites
//! (e.g. `linode_api::Error::NotFound` is `NotFound` almost everywhere,
//! but idempotent on delete/detach).

use tonic::Status;

/// Default mapping for a cloud-API error, used wherever the call site has
/// no more specific idempotency rule to apply.
pub fn linode_status(err: linode_api::Error) -> Status {
    match err {
        linode_api::Error::NotFound => Status::not_found(err.to_string()),
        linode_api::Error::BadRequest(_) => Status::invalid_argument(err.to_string()),
        linode_api::Error::AlreadyAttached { .. } => Status::unavailable(err.to_string()),
        linode_api::Error::Transport(_)
        | linode_api::Error::UnexpectedResponse(_)
        | linode_api::Error::Timeout => Status::internal(err.to_string()),
    }
}

pub fn device_status(err: device::Error) -> Status {
    match err {
        device::Error::DeviceNotFound(_) => Status::deadline_exceeded(err.to_string()),
        device::Error::UnsupportedFsType(_) => Status::invalid_argument(err.to_string()),
        device::Error::CommandFailed { .. }
        | device::Error::Spawn { .. }
        | device::Error::Io(_)
        | device::Error::MountTable(_) => Status::internal(err.to_string()),
    }
}

pub fn volume_key_status(err: volume_key::Error) -> Status {
    Status::invalid_argument(err.to_string())
}

pub fn metadata_status(err: metadata::Error) -> Status {
    Status::internal(err.to_string())
}
