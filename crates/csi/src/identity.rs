use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tonic::{Request, Response, Status};

use crate::csi::v1::identity_server::{Identity, IdentityServer};
use crate::csi::v1::{
    GetPluginCapabilitiesRequest, GetPluginCapabilitiesResponse, GetPluginInfoRequest,
    GetPluginInfoResponse, PluginCapability, ProbeRequest, ProbeResponse,
};

/// Construct the needed structure for a plugin capability. Takes the
/// capability type (`Service` or `VolumeExpansion`) and variant.
macro_rules! plugin_capability {
    ( Service : $variant:ident ) => {
        PluginCapability {
            r#type: Some(crate::csi::v1::plugin_capability::Type::Service(
                crate::csi::v1::plugin_capability::Service {
                    r#type: crate::csi::v1::plugin_capability::service::Type::$variant.into(),
                },
            )),
        }
    };
    ( VolumeExpansion : $variant:ident ) => {
        PluginCapability {
            r#type: Some(crate::csi::v1::plugin_capability::Type::VolumeExpansion(
                crate::csi::v1::plugin_capability::VolumeExpansion {
                    r#type: crate::csi::v1::plugin_capability::volume_expansion::Type::$variant.into(),
                },
            )),
        }
    };
}

/// Process-wide readiness gate. Set exactly once, at the end of startup,
/// by whichever role (controller or node) is running in this process;
/// never cleared afterward.
#[derive(Clone, Default)]
pub struct Readiness(Arc<AtomicBool>);

impl Readiness {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_ready(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    fn is_ready(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

pub struct IdentityService {
    driver_name: String,
    vendor_version: String,
    is_controller: bool,
    readiness: Readiness,
}

impl IdentityService {
    pub fn new(
        driver_name: String,
        vendor_version: String,
        is_controller: bool,
        readiness: Readiness,
    ) -> Self {
        Self {
            driver_name,
            vendor_version,
            is_controller,
            readiness,
        }
    }

    pub fn into_service(self) -> IdentityServer<Self> {
        IdentityServer::new(self)
    }
}

#[tonic::async_trait]
impl Identity for IdentityService {
    async fn get_plugin_info(
        &self,
        _request: Request<GetPluginInfoRequest>,
    ) -> Result<Response<GetPluginInfoResponse>, Status> {
        Ok(Response::new(GetPluginInfoResponse {
            name: self.driver_name.clone(),
            vendor_version: self.vendor_version.clone(),
            manifest: HashMap::new(),
        }))
    }

    async fn get_plugin_capabilities(
        &self,
        _request: Request<GetPluginCapabilitiesRequest>,
    ) -> Result<Response<GetPluginCapabilitiesResponse>, Status> {
        let mut capabilities = vec![plugin_capability!(VolumeExpansion: Online)];

        if self.is_controller {
            capabilities.push(plugin_capability!(Service: ControllerService));
            capabilities.push(plugin_capability!(Service: VolumeAccessibilityConstraints));
        }

        Ok(Response::new(GetPluginCapabilitiesResponse { capabilities }))
    }

    async fn probe(&self, _request: Request<ProbeRequest>) -> Result<Response<ProbeResponse>, Status> {
        Ok(Response::new(ProbeResponse {
            ready: self.readiness.is_ready(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn probe_reports_not_ready_until_marked() {
        let readiness = Readiness::new();
        let service = IdentityService::new("test.csi".into(), "0.0.0".into(), true, readiness.clone());

        let before = service.probe(Request::new(ProbeRequest {})).await.unwrap();
        assert!(!before.into_inner().ready);

        readiness.mark_ready();

        let after = service.probe(Request::new(ProbeRequest {})).await.unwrap();
        assert!(after.into_inner().ready);
    }

    #[tokio::test]
    async fn node_role_omits_controller_capabilities() {
        let service = IdentityService::new("test.csi".into(), "0.0.0".into(), false, Readiness::new());
        let response = service
            .get_plugin_capabilities(Request::new(GetPluginCapabilitiesRequest {}))
            .await
            .unwrap()
            .into_inner();

        assert_eq!(response.capabilities.len(), 1);
    }
}
