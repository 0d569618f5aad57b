use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use device::luks::LuksOps;
use linode_api::LinodeApiOps;
use metadata::NodeMetadata;
use nix::errno::Errno;
use tonic::{Request, Response, Status};
use volume_key::VolumeKey;

use crate::context_keys::{LUKS_CIPHER, LUKS_ENCRYPTED, LUKS_KEY_SIZE, LUKS_KEY_SECRET, VOLUME_NAME};
use crate::csi::v1::node_server::{Node, NodeServer};
use crate::csi::v1::volume_capability::access_mode::Mode;
use crate::csi::v1::volume_capability::AccessType;
use crate::csi::v1::volume_usage::Unit;
use crate::csi::v1::{
    NodeExpandVolumeRequest, NodeExpandVolumeResponse, NodeGetCapabilitiesRequest,
    NodeGetCapabilitiesResponse, NodeGetInfoRequest, NodeGetInfoResponse,
    NodeGetVolumeStatsRequest, NodeGetVolumeStatsResponse, NodePublishVolumeRequest,
    NodePublishVolumeResponse, NodeStageVolumeRequest, NodeStageVolumeResponse,
    NodeUnpublishVolumeRequest, NodeUnpublishVolumeResponse, NodeUnstageVolumeRequest,
    NodeUnstageVolumeResponse, Topology, VolumeCapability, VolumeCondition, VolumeUsage,
};
use crate::error::device_status;
use crate::lock::NodeLock;
use crate::sizing::{effective_size_gb, gb_to_bytes};

const PROVIDER_DOMAIN: &str = "linode";
const DEVICE_WAIT: Duration = Duration::from_secs(30);

macro_rules! node_capability {
    ( $capability:ident ) => {
        crate::csi::v1::NodeServiceCapability {
            r#type: Some(crate::csi::v1::node_service_capability::Type::Rpc(
                crate::csi::v1::node_service_capability::Rpc {
                    r#type: crate::csi::v1::node_service_capability::rpc::Type::$capability.into(),
                },
            )),
        }
    };
}

pub struct NodeService {
    api: Arc<dyn LinodeApiOps>,
    luks: Arc<dyn LuksOps>,
    metadata: NodeMetadata,
    lock: NodeLock,
}

impl NodeService {
    pub fn new(api: Arc<dyn LinodeApiOps>, luks: Arc<dyn LuksOps>, metadata: NodeMetadata) -> Self {
        Self {
            api,
            luks,
            metadata,
            lock: NodeLock::new(),
        }
    }

    pub fn into_service(self) -> NodeServer<Self> {
        NodeServer::new(self)
    }

    fn topology(&self) -> Topology {
        Topology {
            segments: HashMap::from([(crate::topology_key(PROVIDER_DOMAIN), self.metadata.region.clone())]),
        }
    }
}

fn parse_volume_id(id: &str) -> Result<VolumeKey, Status> {
    if id.is_empty() {
        return Err(Status::invalid_argument("missing required field `volume_id`"));
    }
    VolumeKey::parse(id).map_err(|err| Status::invalid_argument(err.to_string()))
}

fn require_path(path: &str, field: &str) -> Result<(), Status> {
    if path.is_empty() {
        return Err(Status::invalid_argument(format!("missing required field `{field}`")));
    }
    Ok(())
}

fn is_readonly(cap: Option<&VolumeCapability>, req_readonly: bool) -> bool {
    if req_readonly {
        return true;
    }
    cap.and_then(|c| c.access_mode.clone())
        .map(|m| m.mode() == Mode::SingleNodeReaderOnly)
        .unwrap_or(false)
}

fn is_block_mode(cap: Option<&VolumeCapability>) -> bool {
    matches!(
        cap.and_then(|c| c.access_type.clone()),
        Some(AccessType::Block(_))
    )
}

/// Close whatever LUKS mapping (if any) backed `source` — unstage/unpublish
/// share this defensive cleanup.
async fn close_luks_mapping_for(luks: &Arc<dyn LuksOps>, source: Option<&Path>) -> Result<(), Status> {
    let Some(source) = source else { return Ok(()) };

    let Some(name) = source
        .strip_prefix("/dev/mapper")
        .ok()
        .and_then(|p| p.to_str())
        .map(|s| s.to_string())
    else {
        return Ok(());
    };

    if luks.init_by_name(&name).await.map_err(device_status)? {
        luks.deactivate(&name).await.map_err(device_status)?;
    }

    Ok(())
}

#[tonic::async_trait]
impl Node for NodeService {
    async fn node_stage_volume(
        &self,
        request: Request<NodeStageVolumeRequest>,
    ) -> Result<Response<NodeStageVolumeResponse>, Status> {
        let req = request.into_inner();
        log::info!("NodeStageVolume: {}", req.volume_id);

        let key = parse_volume_id(&req.volume_id)?;
        require_path(&req.staging_target_path, "staging_target_path")?;
        let cap = req
            .volume_capability
            .as_ref()
            .ok_or_else(|| Status::invalid_argument("missing required field `volume_capability`"))?;

        let _guard = self.lock.acquire().await;
        let staging_path = Path::new(&req.staging_target_path);

        if device::mount::is_mount_point(staging_path).map_err(device_status)? {
            return Ok(Response::new(NodeStageVolumeResponse {}));
        }

        let device_path = device::discovery::wait_for_device(&key.label, None, DEVICE_WAIT)
            .await
            .map_err(device_status)?;

        if is_block_mode(Some(cap)) {
            return Ok(Response::new(NodeStageVolumeResponse {}));
        }

        let effective_source = if req
            .volume_context
            .get(LUKS_ENCRYPTED)
            .map(|v| v == "true")
            .unwrap_or(false)
        {
            let mapping_name = req
                .volume_context
                .get(VOLUME_NAME)
                .cloned()
                .unwrap_or_else(|| key.label.clone());
            let cipher = req
                .volume_context
                .get(LUKS_CIPHER)
                .cloned()
                .unwrap_or_else(|| "aes-xts-plain64".to_string());
            let key_size: u32 = req
                .volume_context
                .get(LUKS_KEY_SIZE)
                .and_then(|v| v.parse().ok())
                .unwrap_or(512);
            let passphrase = req.secrets.get(LUKS_KEY_SECRET).ok_or_else(|| {
                Status::invalid_argument("missing required secret `luks-key`")
            })?;

            if !self.luks.probe(&device_path).await.map_err(device_status)? {
                let master_key = self
                    .luks
                    .format(&device_path, &cipher, key_size)
                    .await
                    .map_err(device_status)?;
                self.luks
                    .add_key_slot(&device_path, 0, passphrase, &master_key)
                    .await
                    .map_err(device_status)?;
            }

            self.luks.load(&device_path).await.map_err(device_status)?;
            self.luks
                .activate(&device_path, &mapping_name, passphrase)
                .await
                .map_err(device_status)?;

            device::luks::mapper_path(&mapping_name)
        } else {
            device_path
        };

        let fs_type_str = match cap.access_type.clone() {
            Some(AccessType::Mount(mount)) => mount.fs_type,
            _ => String::new(),
        };
        let fs_type = device::mount::FsType::parse(&fs_type_str).map_err(device_status)?;

        device::mount::format_and_mount(&effective_source, staging_path, fs_type, &["defaults"])
            .await
            .map_err(device_status)?;

        Ok(Response::new(NodeStageVolumeResponse {}))
    }

    async fn node_unstage_volume(
        &self,
        request: Request<NodeUnstageVolumeRequest>,
    ) -> Result<Response<NodeUnstageVolumeResponse>, Status> {
        let req = request.into_inner();
        log::info!("NodeUnstageVolume: {}", req.volume_id);

        parse_volume_id(&req.volume_id)?;
        require_path(&req.staging_target_path, "staging_target_path")?;

        let _guard = self.lock.acquire().await;
        let staging_path = Path::new(&req.staging_target_path);

        let mounted_source = device::mount::mount_source(staging_path).map_err(device_status)?;
        device::mount::unmount(staging_path).map_err(device_status)?;
        close_luks_mapping_for(&self.luks, mounted_source.as_deref()).await?;

        Ok(Response::new(NodeUnstageVolumeResponse {}))
    }

    async fn node_publish_volume(
        &self,
        request: Request<NodePublishVolumeRequest>,
    ) -> Result<Response<NodePublishVolumeResponse>, Status> {
        let req = request.into_inner();
        log::info!("NodePublishVolume: {}", req.volume_id);

        let key = parse_volume_id(&req.volume_id)?;
        require_path(&req.staging_target_path, "staging_target_path")?;
        require_path(&req.target_path, "target_path")?;
        let cap = req
            .volume_capability
            .as_ref()
            .ok_or_else(|| Status::invalid_argument("missing required field `volume_capability`"))?;

        let _guard = self.lock.acquire().await;
        let target_path = Path::new(&req.target_path);

        if device::mount::is_mount_point(target_path).map_err(device_status)? {
            return Ok(Response::new(NodePublishVolumeResponse {}));
        }

        let readonly = is_readonly(Some(cap), req.readonly);

        if is_block_mode(Some(cap)) {
            if let Some(parent) = target_path.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|err| Status::internal(format!("could not create parent dir: {err}")))?;
            }
            tokio::fs::OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(false)
                .open(target_path)
                .await
                .map_err(|err| Status::internal(format!("could not create target file: {err}")))?;

            let device_path = device::discovery::wait_for_device(&key.label, None, DEVICE_WAIT)
                .await
                .map_err(device_status)?;

            device::mount::bind_mount(&device_path, target_path, readonly).map_err(device_status)?;
        } else {
            tokio::fs::create_dir_all(target_path)
                .await
                .map_err(|err| Status::internal(format!("could not create target dir: {err}")))?;

            device::mount::bind_mount(Path::new(&req.staging_target_path), target_path, readonly)
                .map_err(device_status)?;
        }

        Ok(Response::new(NodePublishVolumeResponse {}))
    }

    async fn node_unpublish_volume(
        &self,
        request: Request<NodeUnpublishVolumeRequest>,
    ) -> Result<Response<NodeUnpublishVolumeResponse>, Status> {
        let req = request.into_inner();
        log::info!("NodeUnpublishVolume: {}", req.volume_id);

        parse_volume_id(&req.volume_id)?;
        require_path(&req.target_path, "target_path")?;

        let _guard = self.lock.acquire().await;
        let target_path = Path::new(&req.target_path);

        let mounted_source = device::mount::mount_source(target_path).map_err(device_status)?;
        device::mount::unmount(target_path).map_err(device_status)?;

        if target_path.is_dir() {
            tokio::fs::remove_dir(target_path).await.ok();
        } else {
            tokio::fs::remove_file(target_path).await.ok();
        }

        // Defensive: some mount hierarchies keep the mapping alive through
        // the bind mount, so we check again here as well as in unstage.
        close_luks_mapping_for(&self.luks, mounted_source.as_deref()).await?;

        Ok(Response::new(NodeUnpublishVolumeResponse {}))
    }

    async fn node_get_volume_stats(
        &self,
        request: Request<NodeGetVolumeStatsRequest>,
    ) -> Result<Response<NodeGetVolumeStatsResponse>, Status> {
        let req = request.into_inner();
        require_path(&req.volume_path, "volume_path")?;

        match device::stats::stat_volume(Path::new(&req.volume_path)) {
            Ok(stats) => Ok(Response::new(NodeGetVolumeStatsResponse {
                usage: vec![
                    VolumeUsage {
                        available: stats.bytes.available as i64,
                        total: stats.bytes.total as i64,
                        used: stats.bytes.used as i64,
                        unit: Unit::Bytes.into(),
                    },
                    VolumeUsage {
                        available: stats.inodes.available as i64,
                        total: stats.inodes.total as i64,
                        used: stats.inodes.used as i64,
                        unit: Unit::Inodes.into(),
                    },
                ],
                volume_condition: Some(VolumeCondition {
                    abnormal: false,
                    message: "healthy".to_string(),
                }),
            })),
            Err(Errno::EIO) => Ok(Response::new(NodeGetVolumeStatsResponse {
                usage: vec![],
                volume_condition: Some(VolumeCondition {
                    abnormal: true,
                    message: "I/O error reading volume statistics".to_string(),
                }),
            })),
            Err(Errno::ENOENT) => Err(Status::not_found(format!(
                "volume path `{}` does not exist",
                req.volume_path
            ))),
            Err(errno) => Err(Status::internal(format!("statvfs failed: {errno}"))),
        }
    }

    async fn node_expand_volume(
        &self,
        request: Request<NodeExpandVolumeRequest>,
    ) -> Result<Response<NodeExpandVolumeResponse>, Status> {
        let req = request.into_inner();
        let key = parse_volume_id(&req.volume_id)?;

        self.api.get_volume(key.id).await.map_err(crate::error::linode_status)?;

        let size_gb = effective_size_gb(req.capacity_range)?;

        Ok(Response::new(NodeExpandVolumeResponse {
            capacity_bytes: gb_to_bytes(size_gb),
        }))
    }

    async fn node_get_capabilities(
        &self,
        _request: Request<NodeGetCapabilitiesRequest>,
    ) -> Result<Response<NodeGetCapabilitiesResponse>, Status> {
        Ok(Response::new(NodeGetCapabilitiesResponse {
            capabilities: vec![
                node_capability!(StageUnstageVolume),
                node_capability!(GetVolumeStats),
                node_capability!(ExpandVolume),
                node_capability!(VolumeCondition),
            ],
        }))
    }

    async fn node_get_info(
        &self,
        _request: Request<NodeGetInfoRequest>,
    ) -> Result<Response<NodeGetInfoResponse>, Status> {
        let instance = self
            .api
            .get_instance(self.metadata.id)
            .await
            .map_err(crate::error::linode_status)?;

        let max_volumes =
            linode_api::capacity::max_attachments(self.metadata.memory_bytes, instance.disks.len());

        Ok(Response::new(NodeGetInfoResponse {
            node_id: self.metadata.id.to_string(),
            max_volumes_per_node: max_volumes,
            accessible_topology: Some(self.topology()),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_luks_mapping_ignores_non_mapper_paths() {
        let luks: Arc<dyn LuksOps> = Arc::new(device::luks::fake::FakeLuks::default());
        let result = futures_lite_block_on(close_luks_mapping_for(&luks, Some(Path::new("/dev/sda"))));
        assert!(result.is_ok());
    }

    fn futures_lite_block_on<F: std::future::Future>(fut: F) -> F::Output {
        tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap()
            .block_on(fut)
    }
}
