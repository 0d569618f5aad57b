//! End-to-end Controller scenarios, exercised against
//! `linode_api::fake::FakeApi` rather than the real cloud API.

use std::sync::Arc;

use csi::controller::ControllerService;
use csi::csi::v1::controller_server::Controller;
use csi::csi::v1::volume_capability::{access_mode::Mode, AccessMode};
use csi::csi::v1::{
    CapacityRange, ControllerExpandVolumeRequest, ControllerPublishVolumeRequest,
    ControllerUnpublishVolumeRequest, CreateVolumeRequest, DeleteVolumeRequest, VolumeCapability,
};
use linode_api::fake::FakeApi;
use linode_api::{Instance, InstanceSpecs};
use tonic::Request;

fn single_writer_cap() -> VolumeCapability {
    VolumeCapability {
        access_mode: Some(AccessMode {
            mode: Mode::SingleNodeWriter.into(),
        }),
        access_type: None,
    }
}

fn service_with(api: FakeApi) -> ControllerService {
    ControllerService::new(Arc::new(api), "us-east", "csi")
}

#[tokio::test]
async fn create_then_delete_is_idempotent() {
    let service = service_with(FakeApi::new());

    let create_req = Request::new(CreateVolumeRequest {
        name: "my-pv".into(),
        capacity_range: Some(CapacityRange {
            required_bytes: 10 * (1 << 30),
            limit_bytes: 0,
        }),
        volume_capabilities: vec![single_writer_cap()],
        parameters: Default::default(),
        secrets: Default::default(),
        volume_content_source: None,
        accessibility_requirements: None,
    });

    let created = service.create_volume(create_req).await.unwrap().into_inner();
    let volume = created.volume.expect("volume in response");

    // Calling CreateVolume again with the same name/size is idempotent.
    let create_again = Request::new(CreateVolumeRequest {
        name: "my-pv".into(),
        capacity_range: Some(CapacityRange {
            required_bytes: 10 * (1 << 30),
            limit_bytes: 0,
        }),
        volume_capabilities: vec![single_writer_cap()],
        parameters: Default::default(),
        secrets: Default::default(),
        volume_content_source: None,
        accessibility_requirements: None,
    });
    let repeated = service.create_volume(create_again).await.unwrap().into_inner();
    assert_eq!(repeated.volume.unwrap().volume_id, volume.volume_id);

    service
        .delete_volume(Request::new(DeleteVolumeRequest {
            volume_id: volume.volume_id.clone(),
            secrets: Default::default(),
        }))
        .await
        .unwrap();

    // Deleting an already-gone volume is still success.
    service
        .delete_volume(Request::new(DeleteVolumeRequest {
            volume_id: volume.volume_id,
            secrets: Default::default(),
        }))
        .await
        .unwrap();
}

fn clone_request(volume_id: &str) -> Request<CreateVolumeRequest> {
    Request::new(CreateVolumeRequest {
        name: "clone-target".into(),
        capacity_range: None,
        volume_capabilities: vec![single_writer_cap()],
        parameters: Default::default(),
        secrets: Default::default(),
        volume_content_source: Some(csi::csi::v1::VolumeContentSource {
            r#type: Some(csi::csi::v1::volume_content_source::Type::Volume(
                csi::csi::v1::volume_content_source::VolumeSource {
                    volume_id: volume_id.into(),
                },
            )),
        }),
        accessibility_requirements: None,
    })
}

#[tokio::test]
async fn clone_in_same_region_succeeds() {
    let api = FakeApi::new();
    api.insert_volume(linode_api::Volume {
        id: 1,
        label: "source".into(),
        size: 10,
        region: "us-east".into(),
        linode_id: None,
        status: linode_api::VolumeStatus::Active,
        filesystem_path: "/dev/disk/by-id/linode-1-source".into(),
        tags: vec![],
        encryption: None,
    });
    let service = service_with(api);

    let response = service
        .create_volume(clone_request("1-source"))
        .await
        .unwrap()
        .into_inner();
    let volume = response.volume.unwrap();
    assert_eq!(volume.volume_context.get("region").unwrap(), "us-east");
}

#[tokio::test]
async fn clone_rejects_source_in_different_region() {
    let api = FakeApi::new();
    api.insert_volume(linode_api::Volume {
        id: 2,
        label: "source".into(),
        size: 10,
        region: "us-west".into(),
        linode_id: None,
        status: linode_api::VolumeStatus::Active,
        filesystem_path: "/dev/disk/by-id/linode-2-source".into(),
        tags: vec![],
        encryption: None,
    });
    let service = service_with(api);

    let result = service.create_volume(clone_request("2-source")).await;
    let status = result.unwrap_err();
    assert_eq!(status.code(), tonic::Code::InvalidArgument);
}

#[tokio::test]
async fn publish_above_attachment_limit_is_resource_exhausted() {
    let api = FakeApi::new();
    api.insert_instance(Instance {
        id: 42,
        label: "node-a".into(),
        region: "us-east".into(),
        specs: InstanceSpecs { memory: 1024 },
        disks: vec![],
    });
    // memory_to_bytes(1024) -> 1 GiB -> clamp(1,8,64) = 8 attachments allowed.
    for i in 0..8 {
        api.insert_volume(linode_api::Volume {
            id: i + 1,
            label: format!("vol-{i}"),
            size: 10,
            region: "us-east".into(),
            linode_id: Some(42),
            status: linode_api::VolumeStatus::Active,
            filesystem_path: format!("/dev/disk/by-id/linode-{}-vol", i + 1),
            tags: vec![],
            encryption: None,
        });
    }
    api.insert_volume(linode_api::Volume {
        id: 100,
        label: "extra".into(),
        size: 10,
        region: "us-east".into(),
        linode_id: None,
        status: linode_api::VolumeStatus::Active,
        filesystem_path: "/dev/disk/by-id/linode-100-extra".into(),
        tags: vec![],
        encryption: None,
    });

    let service = service_with(api);
    let result = service
        .controller_publish_volume(Request::new(ControllerPublishVolumeRequest {
            volume_id: "100-extra".into(),
            node_id: "42".into(),
            volume_capability: Some(single_writer_cap()),
            readonly: false,
            secrets: Default::default(),
            volume_context: Default::default(),
        }))
        .await;

    let status = result.unwrap_err();
    assert_eq!(status.code(), tonic::Code::ResourceExhausted);
}

#[tokio::test]
async fn publish_rejects_missing_volume_capability() {
    let api = FakeApi::new();
    api.insert_instance(Instance {
        id: 42,
        label: "node-a".into(),
        region: "us-east".into(),
        specs: InstanceSpecs { memory: 1024 },
        disks: vec![],
    });
    api.insert_volume(linode_api::Volume {
        id: 100,
        label: "extra".into(),
        size: 10,
        region: "us-east".into(),
        linode_id: None,
        status: linode_api::VolumeStatus::Active,
        filesystem_path: "/dev/disk/by-id/linode-100-extra".into(),
        tags: vec![],
        encryption: None,
    });

    let service = service_with(api);
    let result = service
        .controller_publish_volume(Request::new(ControllerPublishVolumeRequest {
            volume_id: "100-extra".into(),
            node_id: "42".into(),
            volume_capability: None,
            readonly: false,
            secrets: Default::default(),
            volume_context: Default::default(),
        }))
        .await;

    let status = result.unwrap_err();
    assert_eq!(status.code(), tonic::Code::InvalidArgument);
}

#[tokio::test]
async fn unpublish_is_idempotent_on_already_detached_volume() {
    let api = FakeApi::new();
    api.insert_volume(linode_api::Volume {
        id: 7,
        label: "detached".into(),
        size: 10,
        region: "us-east".into(),
        linode_id: None,
        status: linode_api::VolumeStatus::Active,
        filesystem_path: "/dev/disk/by-id/linode-7-detached".into(),
        tags: vec![],
        encryption: None,
    });
    let service = service_with(api);

    service
        .controller_unpublish_volume(Request::new(ControllerUnpublishVolumeRequest {
            volume_id: "7-detached".into(),
            node_id: "42".into(),
            secrets: Default::default(),
        }))
        .await
        .unwrap();
}

#[tokio::test]
async fn expand_volume_rejects_shrink() {
    let api = FakeApi::new();
    api.insert_volume(linode_api::Volume {
        id: 9,
        label: "big".into(),
        size: 50,
        region: "us-east".into(),
        linode_id: None,
        status: linode_api::VolumeStatus::Active,
        filesystem_path: "/dev/disk/by-id/linode-9-big".into(),
        tags: vec![],
        encryption: None,
    });
    let service = service_with(api);

    let result = service
        .controller_expand_volume(Request::new(ControllerExpandVolumeRequest {
            volume_id: "9-big".into(),
            capacity_range: Some(CapacityRange {
                required_bytes: 10 * (1 << 30),
                limit_bytes: 0,
            }),
            secrets: Default::default(),
            volume_capability: None,
        }))
        .await;

    assert!(result.is_err());
}
