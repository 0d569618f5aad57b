//! End-to-end Node scenarios, exercised against
//! `linode_api::fake::FakeApi` and `device::luks::fake::FakeLuks`.

use std::sync::Arc;

use csi::csi::v1::node_server::Node;
use csi::csi::v1::{
    NodeExpandVolumeRequest, NodeGetCapabilitiesRequest, NodeGetInfoRequest,
    NodeGetVolumeStatsRequest, NodeStageVolumeRequest, NodeUnstageVolumeRequest,
};
use csi::node::NodeService;
use device::luks::fake::FakeLuks;
use linode_api::fake::FakeApi;
use linode_api::{Instance, InstanceSpecs};
use metadata::NodeMetadata;
use tonic::Request;

fn service_with(api: FakeApi) -> NodeService {
    let metadata = NodeMetadata {
        id: 42,
        label: "node-a".into(),
        region: "us-east".into(),
        memory_bytes: linode_api::capacity::memory_to_bytes(1024),
    };
    NodeService::new(Arc::new(api), Arc::new(FakeLuks::default()), metadata)
}

#[tokio::test]
async fn node_get_info_reports_attachment_limit() {
    let api = FakeApi::new();
    api.insert_instance(Instance {
        id: 42,
        label: "node-a".into(),
        region: "us-east".into(),
        specs: InstanceSpecs { memory: 1024 },
        disks: vec![],
    });
    let service = service_with(api);

    let response = service
        .node_get_info(Request::new(NodeGetInfoRequest {}))
        .await
        .unwrap()
        .into_inner();

    assert_eq!(response.node_id, "42");
    assert!(response.max_volumes_per_node > 0);
    assert_eq!(
        response
            .accessible_topology
            .unwrap()
            .segments
            .get("topology.linode.com/region")
            .unwrap(),
        "us-east"
    );
}

#[tokio::test]
async fn node_get_capabilities_advertises_stage_unstage() {
    let service = service_with(FakeApi::new());

    let response = service
        .node_get_capabilities(Request::new(NodeGetCapabilitiesRequest {}))
        .await
        .unwrap()
        .into_inner();

    assert_eq!(response.capabilities.len(), 4);
}

#[tokio::test]
async fn node_expand_volume_rejects_unknown_volume() {
    let service = service_with(FakeApi::new());

    let result = service
        .node_expand_volume(Request::new(NodeExpandVolumeRequest {
            volume_id: "9-missing".into(),
            volume_path: "/tmp".into(),
            capacity_range: None,
            staging_target_path: String::new(),
            volume_capability: None,
            secrets: Default::default(),
        }))
        .await;

    assert!(result.is_err());
}

#[tokio::test]
async fn node_expand_volume_reports_requested_capacity() {
    let api = FakeApi::new();
    api.insert_volume(linode_api::Volume {
        id: 9,
        label: "big".into(),
        size: 50,
        region: "us-east".into(),
        linode_id: Some(42),
        status: linode_api::VolumeStatus::Active,
        filesystem_path: "/dev/disk/by-id/linode-9-big".into(),
        tags: vec![],
        encryption: None,
    });
    let service = service_with(api);

    let response = service
        .node_expand_volume(Request::new(NodeExpandVolumeRequest {
            volume_id: "9-big".into(),
            volume_path: "/tmp".into(),
            capacity_range: Some(csi::csi::v1::CapacityRange {
                required_bytes: 100 * (1 << 30),
                limit_bytes: 0,
            }),
            staging_target_path: String::new(),
            volume_capability: None,
            secrets: Default::default(),
        }))
        .await
        .unwrap()
        .into_inner();

    assert_eq!(response.capacity_bytes, 100 * (1 << 30));
}

#[tokio::test]
async fn node_get_volume_stats_reports_healthy_for_existing_path() {
    let service = service_with(FakeApi::new());

    let response = service
        .node_get_volume_stats(Request::new(NodeGetVolumeStatsRequest {
            volume_id: "9-big".into(),
            volume_path: "/".into(),
            staging_target_path: String::new(),
        }))
        .await
        .unwrap()
        .into_inner();

    assert_eq!(response.usage.len(), 2);
    assert!(!response.volume_condition.unwrap().abnormal);
}

#[tokio::test]
async fn node_get_volume_stats_not_found_for_missing_path() {
    let service = service_with(FakeApi::new());

    let result = service
        .node_get_volume_stats(Request::new(NodeGetVolumeStatsRequest {
            volume_id: "9-big".into(),
            volume_path: "/this/path/does/not/exist/honest".into(),
            staging_target_path: String::new(),
        }))
        .await;

    let status = result.unwrap_err();
    assert_eq!(status.code(), tonic::Code::NotFound);
}

#[tokio::test]
async fn node_stage_volume_rejects_malformed_volume_id() {
    let service = service_with(FakeApi::new());

    let result = service
        .node_stage_volume(Request::new(NodeStageVolumeRequest {
            volume_id: "not-a-valid-id".into(),
            staging_target_path: "/tmp/staging".into(),
            volume_capability: None,
            publish_context: Default::default(),
            volume_context: Default::default(),
            secrets: Default::default(),
        }))
        .await;

    let status = result.unwrap_err();
    assert_eq!(status.code(), tonic::Code::InvalidArgument);
}

#[tokio::test]
async fn node_unstage_volume_rejects_missing_staging_path() {
    let service = service_with(FakeApi::new());

    let result = service
        .node_unstage_volume(Request::new(NodeUnstageVolumeRequest {
            volume_id: "9-big".into(),
            staging_target_path: String::new(),
        }))
        .await;

    let status = result.unwrap_err();
    assert_eq!(status.code(), tonic::Code::InvalidArgument);
}
