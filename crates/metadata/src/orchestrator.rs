//! Layer 3: the container orchestrator's Node object.

use k8s_openapi::api::core::v1::Node;
use kube::{Api, Client};
use linode_api::Client as ApiClient;

use crate::error::Error;
use crate::NodeMetadata;

/// The only scheme this driver accepts in a Node's `providerID`.
pub const PROVIDER_ID_SCHEME: &str = "linode";

pub async fn resolve(api: &ApiClient) -> Result<NodeMetadata, Error> {
    let node_name = std::env::var("NODE_NAME").map_err(|_| Error::MissingNodeName)?;

    let client = Client::try_default()
        .await
        .map_err(|err| Error::NodeLookupFailed(node_name.clone(), err.to_string()))?;

    let nodes: Api<Node> = Api::all(client);
    let node = nodes
        .get(&node_name)
        .await
        .map_err(|err| Error::NodeLookupFailed(node_name.clone(), err.to_string()))?;

    let provider_id = node
        .spec
        .and_then(|spec| spec.provider_id)
        .ok_or(Error::MissingProviderId { node: node_name })?;

    let id = parse_provider_id(&provider_id)?;
    let instance = api.get_instance(id).await?;

    Ok(NodeMetadata {
        id: instance.id,
        label: instance.label,
        region: instance.region,
        memory_bytes: linode_api::capacity::memory_to_bytes(instance.specs.memory),
    })
}

/// Parse a `providerID` of the form `<scheme>://<decimal-id>`, rejecting
/// anything whose scheme doesn't match [`PROVIDER_ID_SCHEME`] exactly.
fn parse_provider_id(provider_id: &str) -> Result<u64, Error> {
    let (scheme, id_part) = provider_id
        .split_once("://")
        .ok_or_else(|| Error::BadProviderIdScheme(provider_id.to_string(), PROVIDER_ID_SCHEME))?;

    if scheme != PROVIDER_ID_SCHEME {
        return Err(Error::BadProviderIdScheme(
            provider_id.to_string(),
            PROVIDER_ID_SCHEME,
        ));
    }

    id_part
        .parse()
        .map_err(|_| Error::BadProviderIdId(provider_id.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_well_formed_provider_id() {
        assert_eq!(parse_provider_id("linode://12345").unwrap(), 12345);
    }

    #[test]
    fn rejects_wrong_scheme() {
        assert!(matches!(
            parse_provider_id("aws://12345"),
            Err(Error::BadProviderIdScheme(_, _))
        ));
    }

    #[test]
    fn rejects_non_numeric_id() {
        assert!(matches!(
            parse_provider_id("linode://not-a-number"),
            Err(Error::BadProviderIdId(_))
        ));
    }
}
