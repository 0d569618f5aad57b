use serde::{Deserialize, Serialize};

/// A provider-owned block-storage volume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Volume {
    pub id: u64,
    pub label: String,
    /// Size in whole gigabytes.
    pub size: u32,
    pub region: String,
    /// `None` when detached; at most one instance may hold a volume.
    pub linode_id: Option<u64>,
    pub status: VolumeStatus,
    /// The `/dev/disk/by-id/...` path the provider promises once attached.
    pub filesystem_path: String,
    #[serde(default)]
    pub tags: Vec<String>,
    /// At-rest provider-side encryption, when the region supports it.
    #[serde(default)]
    pub encryption: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VolumeStatus {
    Creating,
    Active,
    Resizing,
    Deleting,
    #[serde(other)]
    Other,
}

impl VolumeStatus {
    pub fn is_active(&self) -> bool {
        matches!(self, VolumeStatus::Active)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CreateVolumeParams {
    pub region: String,
    pub label: String,
    pub size: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encryption: Option<&'static str>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CloneVolumeParams {
    pub label: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResizeVolumeParams {
    pub size: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct AttachVolumeParams {
    pub linode_id: u64,
    pub persist_across_boots: bool,
}

/// A compute instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    pub id: u64,
    pub label: String,
    pub region: String,
    pub specs: InstanceSpecs,
    #[serde(default)]
    pub disks: Vec<InstanceDisk>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceSpecs {
    pub memory: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceDisk {
    pub id: u64,
    pub label: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct Page<T> {
    pub data: Vec<T>,
    pub page: usize,
    pub pages: usize,
    #[serde(default)]
    pub results: usize,
}
