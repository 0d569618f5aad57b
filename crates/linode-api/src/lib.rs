pub mod capacity;
pub mod client;
pub mod error;
pub mod poll;
pub mod types;

pub use client::{Client, LinodeApiOps};
pub use error::Error;
pub use poll::poll_until;
pub use types::{
    AttachVolumeParams, CloneVolumeParams, CreateVolumeParams, Instance, InstanceDisk,
    InstanceSpecs, ResizeVolumeParams, Volume, VolumeStatus,
};
