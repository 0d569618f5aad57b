use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use linode_api::{poll_until, CreateVolumeParams, LinodeApiOps, Volume};
use tonic::{Request, Response, Status};
use volume_key::VolumeKey;

use crate::csi::v1::controller_server::{Controller, ControllerServer};
use crate::csi::v1::volume_capability::access_mode::Mode;
use crate::csi::v1::volume_capability::AccessType;
use crate::csi::v1::volume_content_source::Type as ContentSourceType;
use crate::csi::v1::{
    list_volumes_response::Entry as VolumeEntry, ControllerExpandVolumeRequest,
    ControllerExpandVolumeResponse, ControllerGetCapabilitiesRequest,
    ControllerGetCapabilitiesResponse, ControllerGetVolumeRequest, ControllerGetVolumeResponse,
    ControllerPublishVolumeRequest, ControllerPublishVolumeResponse,
    ControllerUnpublishVolumeRequest, ControllerUnpublishVolumeResponse, CreateSnapshotRequest,
    CreateSnapshotResponse, CreateVolumeRequest, CreateVolumeResponse, DeleteSnapshotRequest,
    DeleteSnapshotResponse, DeleteVolumeRequest, DeleteVolumeResponse, ListSnapshotsRequest,
    ListSnapshotsResponse, ListVolumesRequest, ListVolumesResponse, Topology,
    ValidateVolumeCapabilitiesRequest, ValidateVolumeCapabilitiesResponse, Volume as WireVolume,
    VolumeCapability, VolumeContentSource,
};
use crate::context_keys::{LUKS_CIPHER, LUKS_ENCRYPTED, LUKS_KEY_SIZE, PARAM_PREFIX, REGION, VOLUME_NAME};
use crate::error::linode_status;
use crate::sizing::{effective_size_gb, gb_to_bytes};

const PROVIDER_DOMAIN: &str = "linode";

const CREATE_TIMEOUT: Duration = Duration::from_secs(5 * 60);
const CLONE_TIMEOUT: Duration = Duration::from_secs(15 * 60);
const ATTACH_TIMEOUT: Duration = Duration::from_secs(5 * 60);
const DETACH_TIMEOUT: Duration = Duration::from_secs(5 * 60);
const EXPAND_TIMEOUT: Duration = Duration::from_secs(5 * 60);
const DEFAULT_PAGE_SIZE: usize = 100;

macro_rules! controller_capability {
    ( $capability:ident ) => {
        crate::csi::v1::ControllerServiceCapability {
            r#type: Some(crate::csi::v1::controller_service_capability::Type::Rpc(
                crate::csi::v1::controller_service_capability::Rpc {
                    r#type: crate::csi::v1::controller_service_capability::rpc::Type::$capability
                        .into(),
                },
            )),
        }
    };
}

#[derive(Clone)]
pub struct ControllerService {
    api: Arc<dyn LinodeApiOps>,
    /// This driver's own region, used when the request carries no topology
    /// preference.
    region: String,
    label_prefix: String,
}

impl ControllerService {
    pub fn new(api: Arc<dyn LinodeApiOps>, region: impl Into<String>, label_prefix: impl Into<String>) -> Self {
        Self {
            api,
            region: region.into(),
            label_prefix: label_prefix.into(),
        }
    }

    pub fn into_service(self) -> ControllerServer<Self> {
        ControllerServer::new(self)
    }

    fn topology_for(&self, region: &str) -> Topology {
        Topology {
            segments: HashMap::from([(topology_key(), region.to_string())]),
        }
    }

    /// Pick the region from accessibility requirements (preferred first,
    /// then requisite), falling back to this driver's own region.
    fn select_region(&self, accessibility: Option<&crate::csi::v1::TopologyRequirement>) -> String {
        let topo_key = topology_key();

        if let Some(req) = accessibility {
            for topology in req.preferred.iter().chain(req.requisite.iter()) {
                if let Some(region) = topology.segments.get(&topo_key) {
                    return region.clone();
                }
            }
        }

        self.region.clone()
    }

    fn wire_volume(
        &self,
        volume: &Volume,
        content_source: Option<VolumeContentSource>,
        extra_context: HashMap<String, String>,
    ) -> WireVolume {
        let mut volume_context = HashMap::from([(REGION.to_string(), volume.region.clone())]);
        volume_context.insert(VOLUME_NAME.to_string(), volume.label.clone());
        volume_context.extend(extra_context);

        WireVolume {
            capacity_bytes: gb_to_bytes(volume.size),
            volume_id: VolumeKey::new(volume.id, volume.label.clone()).to_string(),
            volume_context,
            content_source,
            accessible_topology: vec![self.topology_for(&volume.region)],
        }
    }
}

pub fn topology_key() -> String {
    crate::topology_key(PROVIDER_DOMAIN)
}

fn require_single_node_writer(caps: &[VolumeCapability]) -> Result<(), Status> {
    if caps.is_empty() {
        return Err(Status::invalid_argument(
            "at least one volume_capability is required",
        ));
    }

    for cap in caps {
        let mode = cap.access_mode.clone().unwrap_or_default().mode();
        if mode != Mode::SingleNodeWriter {
            return Err(Status::invalid_argument(format!(
                "unsupported access mode {mode:?}: only SINGLE_NODE_WRITER is allowed"
            )));
        }
    }

    Ok(())
}

fn parse_volume_id(id: &str) -> Result<VolumeKey, Status> {
    if id.is_empty() {
        return Err(Status::invalid_argument("missing required field `volume_id`"));
    }
    VolumeKey::parse(id).map_err(|err| Status::invalid_argument(err.to_string()))
}

fn parse_node_id(id: &str) -> Result<u64, Status> {
    id.parse()
        .map_err(|_| Status::invalid_argument(format!("`node_id` `{id}` is not a numeric instance id")))
}

#[tonic::async_trait]
impl Controller for ControllerService {
    async fn create_volume(
        &self,
        request: Request<CreateVolumeRequest>,
    ) -> Result<Response<CreateVolumeResponse>, Status> {
        let req = request.into_inner();
        log::info!("CreateVolume: {:?}", req.name);

        if req.name.is_empty() {
            return Err(Status::invalid_argument("missing volume name"));
        }
        require_single_node_writer(&req.volume_capabilities)?;

        let content_source = match req.volume_content_source.as_ref().and_then(|s| s.r#type.clone()) {
            Some(ContentSourceType::Volume(src)) => Some(src),
            Some(ContentSourceType::Snapshot(_)) => {
                return Err(Status::invalid_argument(
                    "snapshot content sources are not supported",
                ))
            }
            None => None,
        };

        let size_gb = effective_size_gb(req.capacity_range.clone())?;
        let region = self.select_region(req.accessibility_requirements.as_ref());
        let label = volume_key::derive_label(&self.label_prefix, &req.name);

        let encrypted = req
            .parameters
            .get(&format!("{PARAM_PREFIX}/encrypted"))
            .map(|v| v == "true")
            .unwrap_or(false);
        if encrypted && !self.api.region_supports_encryption(&region).await.map_err(linode_status)? {
            return Err(Status::internal(format!(
                "region `{region}` does not support at-rest block storage encryption"
            )));
        }

        let tags: Vec<String> = req
            .parameters
            .get(&format!("{PARAM_PREFIX}/volumeTags"))
            .map(|v| v.split(',').map(|s| s.trim().to_string()).collect())
            .unwrap_or_default();

        let matches = self
            .api
            .list_volumes_by_label(&label)
            .await
            .map_err(linode_status)?;

        let volume = if matches.len() > 1 {
            return Err(Status::already_exists(format!(
                "label `{label}` matches {} volumes at the provider",
                matches.len()
            )));
        } else if let Some(existing) = matches.into_iter().next() {
            if content_source.is_none() && existing.size != size_gb {
                return Err(Status::already_exists(format!(
                    "volume `{label}` already exists with size {} GiB, requested {} GiB",
                    existing.size, size_gb
                )));
            }
            existing
        } else if let Some(source) = content_source.as_ref() {
            let source_key = parse_volume_id(&source.volume_id)?;
            let source_id = source_key.id;

            let source_volume = self.api.get_volume(source_id).await.map_err(linode_status)?;
            if source_volume.region != region {
                return Err(Status::invalid_argument(format!(
                    "source volume is in region `{}`, requested region is `{region}`",
                    source_volume.region
                )));
            }

            let created = self
                .api
                .clone_volume(source_id, &linode_api::CloneVolumeParams { label: label.clone() })
                .await
                .map_err(linode_status)?;

            poll_until(CLONE_TIMEOUT, || async {
                let v = self.api.get_volume(created.id).await?;
                Ok(v.status.is_active().then_some(v))
            })
            .await
            .map_err(|_| Status::internal("timed out waiting for cloned volume to become active"))?
        } else {
            let created = self
                .api
                .create_volume(&CreateVolumeParams {
                    region: region.clone(),
                    label: label.clone(),
                    size: size_gb,
                    encryption: encrypted.then_some("enabled"),
                    tags,
                })
                .await
                .map_err(linode_status)?;

            poll_until(CREATE_TIMEOUT, || async {
                let v = self.api.get_volume(created.id).await?;
                Ok(v.status.is_active().then_some(v))
            })
            .await
            .map_err(|_| Status::internal("timed out waiting for created volume to become active"))?
        };

        let content_source_echo = content_source.map(|src| VolumeContentSource {
            r#type: Some(ContentSourceType::Volume(src)),
        });

        let mut luks_context = HashMap::new();
        if req
            .parameters
            .get(&format!("{PARAM_PREFIX}/luks-encrypted"))
            .map(|v| v == "true")
            .unwrap_or(false)
        {
            luks_context.insert(LUKS_ENCRYPTED.to_string(), "true".to_string());
            if let Some(cipher) = req.parameters.get(&format!("{PARAM_PREFIX}/luks-cipher")) {
                luks_context.insert(LUKS_CIPHER.to_string(), cipher.clone());
            }
            if let Some(key_size) = req.parameters.get(&format!("{PARAM_PREFIX}/luks-key-size")) {
                luks_context.insert(LUKS_KEY_SIZE.to_string(), key_size.clone());
            }
        }

        Ok(Response::new(CreateVolumeResponse {
            volume: Some(self.wire_volume(&volume, content_source_echo, luks_context)),
        }))
    }

    async fn delete_volume(
        &self,
        request: Request<DeleteVolumeRequest>,
    ) -> Result<Response<DeleteVolumeResponse>, Status> {
        let req = request.into_inner();
        let key = parse_volume_id(&req.volume_id)?;

        match self.api.get_volume(key.id).await {
            Ok(volume) => {
                if volume.linode_id.is_some() {
                    return Err(Status::failed_precondition(format!(
                        "volume `{}` is still attached to instance {}",
                        key,
                        volume.linode_id.unwrap()
                    )));
                }

                self.api.delete_volume(key.id).await.map_err(linode_status)?;
            }
            Err(linode_api::Error::NotFound) => {
                log::info!("DeleteVolume: `{key}` already gone, treating as success");
            }
            Err(err) => return Err(linode_status(err)),
        }

        Ok(Response::new(DeleteVolumeResponse {}))
    }

    async fn controller_publish_volume(
        &self,
        request: Request<ControllerPublishVolumeRequest>,
    ) -> Result<Response<ControllerPublishVolumeResponse>, Status> {
        let req = request.into_inner();
        let key = parse_volume_id(&req.volume_id)?;
        let node_id = parse_node_id(&req.node_id)?;

        let cap = req
            .volume_capability
            .as_ref()
            .ok_or_else(|| Status::invalid_argument("missing required field `volume_capability`"))?;
        require_single_node_writer(std::slice::from_ref(cap))?;

        let instance = self.api.get_instance(node_id).await.map_err(linode_status)?;
        let volume = self.api.get_volume(key.id).await.map_err(linode_status)?;

        if volume.linode_id == Some(node_id) {
            return Ok(Response::new(ControllerPublishVolumeResponse {
                publish_context: HashMap::from([(
                    "devicePath".to_string(),
                    volume.filesystem_path.clone(),
                )]),
            }));
        }
        if volume.linode_id.is_some() {
            return Err(Status::failed_precondition(format!(
                "volume `{key}` is attached to a different instance"
            )));
        }
        if volume.region != instance.region {
            return Err(Status::invalid_argument(format!(
                "volume `{key}` is in region `{}`, instance is in `{}`",
                volume.region, instance.region
            )));
        }

        let limit = linode_api::capacity::max_attachments(
            linode_api::capacity::memory_to_bytes(instance.specs.memory),
            instance.disks.len(),
        );
        let attached = self
            .api
            .list_instance_volumes(node_id)
            .await
            .map_err(linode_status)?
            .len() as i64;
        if attached >= limit {
            return Err(Status::resource_exhausted(format!(
                "instance {node_id} has reached its attachment limit of {limit}"
            )));
        }

        if let Err(err) = self
            .api
            .attach_volume(
                key.id,
                &linode_api::AttachVolumeParams {
                    linode_id: node_id,
                    persist_across_boots: false,
                },
            )
            .await
        {
            return Err(match &err {
                linode_api::Error::AlreadyAttached { .. } => Status::unavailable(err.to_string()),
                linode_api::Error::BadRequest(msg) if msg.to_lowercase().contains("already attached") => {
                    Status::unavailable(err.to_string())
                }
                _ => linode_status(err),
            });
        }

        let attached_volume = poll_until(ATTACH_TIMEOUT, || async {
            let v = self.api.get_volume(key.id).await?;
            Ok((v.linode_id == Some(node_id)).then_some(v))
        })
        .await
        .map_err(|_| Status::internal("timed out waiting for volume to attach"))?;

        Ok(Response::new(ControllerPublishVolumeResponse {
            publish_context: HashMap::from([(
                "devicePath".to_string(),
                attached_volume.filesystem_path,
            )]),
        }))
    }

    async fn controller_unpublish_volume(
        &self,
        request: Request<ControllerUnpublishVolumeRequest>,
    ) -> Result<Response<ControllerUnpublishVolumeResponse>, Status> {
        let req = request.into_inner();
        let key = parse_volume_id(&req.volume_id)?;
        let node_id = parse_node_id(&req.node_id)?;

        let volume = match self.api.get_volume(key.id).await {
            Ok(volume) => volume,
            Err(linode_api::Error::NotFound) => {
                return Ok(Response::new(ControllerUnpublishVolumeResponse {}))
            }
            Err(err) => return Err(linode_status(err)),
        };

        if volume.linode_id != Some(node_id) {
            return Ok(Response::new(ControllerUnpublishVolumeResponse {}));
        }

        match self.api.detach_volume(key.id).await {
            Ok(()) | Err(linode_api::Error::NotFound) => {}
            Err(err) => return Err(linode_status(err)),
        }

        poll_until(DETACH_TIMEOUT, || async {
            let v = self.api.get_volume(key.id).await?;
            Ok(v.linode_id.is_none().then_some(()))
        })
        .await
        .map_err(|_| Status::internal("timed out waiting for volume to detach"))?;

        Ok(Response::new(ControllerUnpublishVolumeResponse {}))
    }

    async fn validate_volume_capabilities(
        &self,
        request: Request<ValidateVolumeCapabilitiesRequest>,
    ) -> Result<Response<ValidateVolumeCapabilitiesResponse>, Status> {
        let req = request.into_inner();
        let key = parse_volume_id(&req.volume_id)?;
        if req.volume_capabilities.is_empty() {
            return Err(Status::invalid_argument(
                "missing required field `volume_capabilities`",
            ));
        }

        let volume = self.api.get_volume(key.id).await.map_err(linode_status)?;

        use crate::csi::v1::validate_volume_capabilities_response::Confirmed;
        use crate::csi::v1::volume_capability::{AccessMode, BlockVolume, MountVolume};

        let reply = ValidateVolumeCapabilitiesResponse {
            confirmed: Some(Confirmed {
                volume_context: HashMap::from([(REGION.to_string(), volume.region)]),
                volume_capabilities: vec![
                    VolumeCapability {
                        access_mode: Some(AccessMode {
                            mode: Mode::SingleNodeWriter.into(),
                        }),
                        access_type: Some(AccessType::Block(BlockVolume {})),
                    },
                    VolumeCapability {
                        access_mode: Some(AccessMode {
                            mode: Mode::SingleNodeWriter.into(),
                        }),
                        access_type: Some(AccessType::Mount(MountVolume {
                            fs_type: "ext4".into(),
                            mount_flags: vec![],
                            volume_mount_group: String::new(),
                        })),
                    },
                ],
                parameters: HashMap::new(),
            }),
            message: String::new(),
        };

        Ok(Response::new(reply))
    }

    async fn list_volumes(
        &self,
        request: Request<ListVolumesRequest>,
    ) -> Result<Response<ListVolumesResponse>, Status> {
        let req = request.into_inner();

        let page_size = if req.max_entries > 0 {
            req.max_entries as usize
        } else {
            DEFAULT_PAGE_SIZE
        };

        let page = if req.starting_token.is_empty() {
            1
        } else {
            req.starting_token
                .parse::<usize>()
                .map_err(|_| Status::aborted("`starting_token` is not a valid page token"))?
        };

        let (volumes, has_more) = self
            .api
            .list_volumes_page(page, page_size)
            .await
            .map_err(linode_status)?;

        let entries = volumes
            .iter()
            .map(|v| VolumeEntry {
                volume: Some(self.wire_volume(v, None, HashMap::new())),
                status: None,
            })
            .collect();

        Ok(Response::new(ListVolumesResponse {
            entries,
            next_token: if has_more {
                (page + 1).to_string()
            } else {
                String::new()
            },
        }))
    }

    async fn controller_get_capabilities(
        &self,
        _request: Request<ControllerGetCapabilitiesRequest>,
    ) -> Result<Response<ControllerGetCapabilitiesResponse>, Status> {
        Ok(Response::new(ControllerGetCapabilitiesResponse {
            capabilities: vec![
                controller_capability!(CreateDeleteVolume),
                controller_capability!(PublishUnpublishVolume),
                controller_capability!(ListVolumes),
                controller_capability!(CloneVolume),
                controller_capability!(ExpandVolume),
                controller_capability!(GetVolume),
            ],
        }))
    }

    async fn controller_expand_volume(
        &self,
        request: Request<ControllerExpandVolumeRequest>,
    ) -> Result<Response<ControllerExpandVolumeResponse>, Status> {
        let req = request.into_inner();
        let key = parse_volume_id(&req.volume_id)?;
        let new_size_gb = effective_size_gb(req.capacity_range)?;

        let volume = self.api.get_volume(key.id).await.map_err(linode_status)?;
        if volume.size > new_size_gb {
            return Err(Status::internal(format!(
                "cannot shrink volume `{key}` from {} GiB to {new_size_gb} GiB",
                volume.size
            )));
        }

        self.api
            .resize_volume(key.id, new_size_gb)
            .await
            .map_err(linode_status)?;

        poll_until(EXPAND_TIMEOUT, || async {
            let v = self.api.get_volume(key.id).await?;
            Ok(v.status.is_active().then_some(()))
        })
        .await
        .map_err(|_| Status::internal("timed out waiting for resized volume to become active"))?;

        Ok(Response::new(ControllerExpandVolumeResponse {
            capacity_bytes: gb_to_bytes(new_size_gb),
            node_expansion_required: true,
        }))
    }

    async fn controller_get_volume(
        &self,
        request: Request<ControllerGetVolumeRequest>,
    ) -> Result<Response<ControllerGetVolumeResponse>, Status> {
        let req = request.into_inner();
        let key = parse_volume_id(&req.volume_id)?;
        let volume = self.api.get_volume(key.id).await.map_err(linode_status)?;

        use crate::csi::v1::controller_get_volume_response::VolumeStatus;

        Ok(Response::new(ControllerGetVolumeResponse {
            volume: Some(self.wire_volume(&volume, None, HashMap::new())),
            status: Some(VolumeStatus {
                published_node_ids: volume.linode_id.map(|id| id.to_string()).into_iter().collect(),
                volume_condition: None,
            }),
        }))
    }

    async fn create_snapshot(
        &self,
        _request: Request<CreateSnapshotRequest>,
    ) -> Result<Response<CreateSnapshotResponse>, Status> {
        Err(Status::unimplemented("snapshots are not supported"))
    }

    async fn delete_snapshot(
        &self,
        _request: Request<DeleteSnapshotRequest>,
    ) -> Result<Response<DeleteSnapshotResponse>, Status> {
        Err(Status::unimplemented("snapshots are not supported"))
    }

    async fn list_snapshots(
        &self,
        _request: Request<ListSnapshotsRequest>,
    ) -> Result<Response<ListSnapshotsResponse>, Status> {
        Err(Status::unimplemented("snapshots are not supported"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_node_writer_accepted() {
        let caps = vec![VolumeCapability {
            access_mode: Some(crate::csi::v1::volume_capability::AccessMode {
                mode: Mode::SingleNodeWriter.into(),
            }),
            access_type: None,
        }];
        assert!(require_single_node_writer(&caps).is_ok());
    }

    #[test]
    fn multi_writer_rejected() {
        let caps = vec![VolumeCapability {
            access_mode: Some(crate::csi::v1::volume_capability::AccessMode {
                mode: Mode::MultiNodeMultiWriter.into(),
            }),
            access_type: None,
        }];
        assert!(require_single_node_writer(&caps).is_err());
    }

    #[test]
    fn empty_capabilities_rejected() {
        assert!(require_single_node_writer(&[]).is_err());
    }
}
