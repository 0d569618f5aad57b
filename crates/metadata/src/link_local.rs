//! Layer 1: the link-local instance metadata service.

use serde::Deserialize;

use crate::error::Error;
use crate::NodeMetadata;

const DEFAULT_BASE_URL: &str = "http://169.254.169.254/v1";

#[derive(Debug, Deserialize)]
struct InstanceData {
    id: u64,
    label: String,
    region: String,
    memory: u64,
}

pub struct MetadataServiceClient {
    http: reqwest::Client,
    base_url: String,
}

impl MetadataServiceClient {
    /// Construct a client for the link-local service. Fails fast (rather
    /// than on first request) if the underlying HTTP client can't be
    /// built, so the three-layer fallback in [`crate::resolve`] can treat
    /// "could not even instantiate" the same as "service unreachable".
    pub fn new() -> Result<Self, Error> {
        Self::with_base_url(DEFAULT_BASE_URL)
    }

    fn with_base_url(base_url: &str) -> Result<Self, Error> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(2))
            .build()
            .map_err(|err| Error::MetadataServiceUnavailable(err.to_string()))?;

        Ok(Self {
            http,
            base_url: base_url.to_string(),
        })
    }

    pub async fn fetch(&self) -> Result<NodeMetadata, Error> {
        let data: InstanceData = self
            .http
            .get(format!("{}/instance", self.base_url))
            .send()
            .await
            .map_err(|err| Error::MetadataServiceUnavailable(err.to_string()))?
            .error_for_status()
            .map_err(|err| Error::MetadataServiceUnavailable(err.to_string()))?
            .json()
            .await
            .map_err(|err| Error::MetadataServiceUnavailable(err.to_string()))?;

        Ok(NodeMetadata {
            id: data.id,
            label: data.label,
            region: data.region,
            memory_bytes: linode_api::capacity::memory_to_bytes(data.memory),
        })
    }
}
