pub mod config;
pub mod context_keys;
pub mod controller;
pub mod error;
pub mod identity;
pub mod lock;
pub mod node;
pub mod sizing;

pub mod csi {
    pub mod v1 {
        tonic::include_proto!("csi.v1");
    }
}

/// Minimum requestable volume size, in whole gigabytes.
pub const MIN_VOLUME_SIZE_GB: u32 = 10;

pub const MIN_VOLUME_SIZE_BYTES: u64 = MIN_VOLUME_SIZE_GB as u64 * 1024 * 1024 * 1024;

/// The CSI topology key this driver publishes.
pub fn topology_key(provider_domain: &str) -> String {
    format!("topology.{provider_domain}.com/region")
}
