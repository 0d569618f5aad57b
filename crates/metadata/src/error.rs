use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("link-local metadata service unavailable: {0}")]
    MetadataServiceUnavailable(String),

    #[error("could not read DMI product serial at {path}: {source}")]
    DmiFileUnreadable {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("DMI product serial `{0}` is not a valid decimal instance id")]
    DmiSerialNotNumeric(String),

    #[error("NODE_NAME is not set in the environment")]
    MissingNodeName,

    #[error("could not fetch node object `{0}` from the orchestrator API: {1}")]
    NodeLookupFailed(String, String),

    #[error("node `{node}` has no providerID set")]
    MissingProviderId { node: String },

    #[error("providerID `{0}` does not use the expected `{1}://` scheme")]
    BadProviderIdScheme(String, &'static str),

    #[error("providerID `{0}` has a non-numeric instance id")]
    BadProviderIdId(String),

    #[error("cloud API lookup failed: {0}")]
    Api(#[from] linode_api::Error),

    #[error(
        "all three identity resolution layers failed: metadata={metadata}, dmi={dmi}, node={node}"
    )]
    Exhausted {
        metadata: String,
        dmi: String,
        node: String,
    },
}
