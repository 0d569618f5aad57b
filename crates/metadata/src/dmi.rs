//! Layer 2: the DMI product-serial file.

use linode_api::Client as ApiClient;

use crate::error::Error;
use crate::NodeMetadata;

pub const DMI_PRODUCT_SERIAL_PATH: &str = "/sys/class/dmi/id/product_serial";

pub async fn resolve(api: &ApiClient, path: &str) -> Result<NodeMetadata, Error> {
    let contents =
        tokio::fs::read_to_string(path)
            .await
            .map_err(|source| Error::DmiFileUnreadable {
                path: path.to_string(),
                source,
            })?;

    let serial = contents.trim();
    let id: u64 = serial
        .parse()
        .map_err(|_| Error::DmiSerialNotNumeric(serial.to_string()))?;

    let instance = api.get_instance(id).await?;

    Ok(NodeMetadata {
        id: instance.id,
        label: instance.label,
        region: instance.region,
        memory_bytes: linode_api::capacity::memory_to_bytes(instance.specs.memory),
    })
}
