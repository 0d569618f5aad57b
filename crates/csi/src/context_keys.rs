//! Key names shared between the Controller (which writes the Volume
//! Context) and the Node (which reads it back).

/// Prefix for CreateVolume request `parameters` (StorageClass-facing).
pub const PARAM_PREFIX: &str = "csi.linodebs.linode.com";

/// Volume Context key: the region the volume was created in.
pub const REGION: &str = "region";

/// Volume Context key: the in-cluster volume name, used to derive the LUKS
/// mapping name.
pub const VOLUME_NAME: &str = "volumeName";

/// Volume Context key: `"true"` when the Node should manage a LUKS mapping.
pub const LUKS_ENCRYPTED: &str = "luks-encrypted";

/// Volume Context key: LUKS cipher spec, e.g. `aes-xts-plain64`.
pub const LUKS_CIPHER: &str = "luks-cipher";

/// Volume Context key: LUKS key size in bits, as a decimal string.
pub const LUKS_KEY_SIZE: &str = "luks-key-size";

/// Secrets map key supplying the LUKS passphrase.
pub const LUKS_KEY_SECRET: &str = "luks-key";
