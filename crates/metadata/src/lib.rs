//! Node identity bootstrap: three-layer fallback, stop at first success.
//! Each layer has a distinct failure mode, so `resolve` collects all three
//! error messages into [`error::Error::Exhausted`] rather than only
//! surfacing the last one.

pub mod dmi;
pub mod error;
pub mod link_local;
pub mod orchestrator;

pub use error::Error;

use linode_api::Client as ApiClient;

/// `{id, label, region, memory_bytes}` for the current host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeMetadata {
    pub id: u64,
    pub label: String,
    pub region: String,
    pub memory_bytes: u64,
}

/// Run the three-layer fallback to end of section 4.6: link-local metadata
/// service, then the DMI product-serial file, then the orchestrator's Node
/// object. `api` is used by layers 2 and 3 to turn a bare instance id into
/// full instance data.
pub async fn resolve(api: &ApiClient) -> Result<NodeMetadata, Error> {
    let metadata_err = match link_local::MetadataServiceClient::new() {
        Ok(client) => match client.fetch().await {
            Ok(meta) => return Ok(meta),
            Err(err) => err,
        },
        Err(err) => err,
    };
    log::warn!("link-local metadata layer failed: {metadata_err}");

    let dmi_err = match dmi::resolve(api, dmi::DMI_PRODUCT_SERIAL_PATH).await {
        Ok(meta) => return Ok(meta),
        Err(err) => err,
    };
    log::warn!("DMI product-serial layer failed: {dmi_err}");

    let node_err = match orchestrator::resolve(api).await {
        Ok(meta) => return Ok(meta),
        Err(err) => err,
    };
    log::warn!("orchestrator node-object layer failed: {node_err}");

    Err(Error::Exhausted {
        metadata: metadata_err.to_string(),
        dmi: dmi_err.to_string(),
        node: node_err.to_string(),
    })
}
