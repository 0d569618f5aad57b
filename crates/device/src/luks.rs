//! LUKS lifecycle wrapper. Encapsulated behind [`LuksOps`]
//! so tests can substitute [`FakeLuks`] instead of actually shelling out to
//! `cryptsetup`. Every call is a `tokio::process::Command` invocation —
//! dropping the future kills the child, which is what gives us context
//! cancellation for free at this boundary.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::error::Error;

const MAPPER_DIR: &str = "/dev/mapper";

pub fn mapper_path(mapping_name: &str) -> PathBuf {
    PathBuf::from(MAPPER_DIR).join(mapping_name)
}

/// Master key material generated for a fresh `luksFormat`, held only for
/// the duration of format + key-slot-add. Dropping it removes the backing
/// temp file; the passphrase itself never touches disk.
pub struct MasterKey {
    file: tempfile::NamedTempFile,
}

impl MasterKey {
    fn path(&self) -> &Path {
        self.file.path()
    }
}

#[async_trait]
pub trait LuksOps: Send + Sync {
    /// Returns whether `device` already carries a LUKS header.
    async fn probe(&self, device: &Path) -> Result<bool, Error>;

    /// Write a fresh LUKS header to `device` with an internally generated
    /// master key — no user-supplied passphrase touches `luksFormat`
    /// directly, matching the format/add-key split above.
    async fn format(&self, device: &Path, cipher: &str, key_size_bits: u32) -> Result<MasterKey, Error>;

    /// Register `passphrase` as the given key slot, authenticated by the
    /// master key `format` produced.
    async fn add_key_slot(
        &self,
        device: &Path,
        slot: u32,
        passphrase: &str,
        master_key: &MasterKey,
    ) -> Result<(), Error>;

    /// Load an existing LUKS header (sanity check before activation).
    async fn load(&self, device: &Path) -> Result<(), Error>;

    /// Activate `device` under `/dev/mapper/<mapping_name>`, unlocked by
    /// `passphrase`.
    async fn activate(&self, device: &Path, mapping_name: &str, passphrase: &str) -> Result<(), Error>;

    /// Open a handle onto an existing mapping by name. Returns `false`
    /// (not an error) when no such mapping exists.
    async fn init_by_name(&self, mapping_name: &str) -> Result<bool, Error>;

    /// Tear down a mapping, removing `/dev/mapper/<mapping_name>`.
    async fn deactivate(&self, mapping_name: &str) -> Result<(), Error>;
}

/// The real implementation: shells out to the `cryptsetup` CLI.
#[derive(Debug, Default, Clone, Copy)]
pub struct Cryptsetup;

async fn run(cmd: &mut Command) -> Result<std::process::Output, Error> {
    let name = format!("{:?}", cmd.as_std());
    cmd.output().await.map_err(|source| Error::Spawn { cmd: name, source })
}

fn ensure_success(cmd_name: &str, output: &std::process::Output) -> Result<(), Error> {
    if output.status.success() {
        return Ok(());
    }

    Err(Error::CommandFailed {
        cmd: cmd_name.to_string(),
        detail: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    })
}

#[async_trait]
impl LuksOps for Cryptsetup {
    async fn probe(&self, device: &Path) -> Result<bool, Error> {
        let output = run(Command::new("cryptsetup").arg("isLuks").arg(device)).await?;
        Ok(output.status.success())
    }

    async fn format(&self, device: &Path, cipher: &str, key_size_bits: u32) -> Result<MasterKey, Error> {
        let key_bytes = (key_size_bits / 8) as usize;
        // `/dev/urandom` never hits EOF, so we read exactly the bytes we
        // need rather than `tokio::fs::read`-to-completion.
        let random = read_random_bytes(key_bytes).await?;

        let mut key_file = tempfile::NamedTempFile::new()?;
        std::io::Write::write_all(&mut key_file, &random)?;

        let output = run(Command::new("cryptsetup")
            .arg("luksFormat")
            .arg("--type")
            .arg("luks2")
            .arg("--cipher")
            .arg(cipher)
            .arg("--key-size")
            .arg(key_size_bits.to_string())
            .arg("--batch-mode")
            .arg("--master-key-file")
            .arg(key_file.path())
            .arg(device))
        .await?;
        ensure_success("cryptsetup luksFormat", &output)?;

        Ok(MasterKey { file: key_file })
    }

    async fn add_key_slot(
        &self,
        device: &Path,
        slot: u32,
        passphrase: &str,
        master_key: &MasterKey,
    ) -> Result<(), Error> {
        let mut child = Command::new("cryptsetup")
            .arg("luksAddKey")
            .arg("--master-key-file")
            .arg(master_key.path())
            .arg("--key-slot")
            .arg(slot.to_string())
            .arg(device)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::piped())
            .spawn()
            .map_err(|source| Error::Spawn {
                cmd: "cryptsetup luksAddKey".into(),
                source,
            })?;

        let mut stdin = child.stdin.take().expect("stdin was piped");
        stdin.write_all(passphrase.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        drop(stdin);

        let output = child.wait_with_output().await?;
        ensure_success("cryptsetup luksAddKey", &output)
    }

    async fn load(&self, device: &Path) -> Result<(), Error> {
        let output = run(Command::new("cryptsetup").arg("luksDump").arg(device)).await?;
        ensure_success("cryptsetup luksDump", &output)
    }

    async fn activate(&self, device: &Path, mapping_name: &str, passphrase: &str) -> Result<(), Error> {
        let mut child = Command::new("cryptsetup")
            .arg("luksOpen")
            .arg(device)
            .arg(mapping_name)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::piped())
            .spawn()
            .map_err(|source| Error::Spawn {
                cmd: "cryptsetup luksOpen".into(),
                source,
            })?;

        let mut stdin = child.stdin.take().expect("stdin was piped");
        stdin.write_all(passphrase.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        drop(stdin);

        let output = child.wait_with_output().await?;
        ensure_success("cryptsetup luksOpen", &output)
    }

    async fn init_by_name(&self, mapping_name: &str) -> Result<bool, Error> {
        Ok(mapper_path(mapping_name).exists())
    }

    async fn deactivate(&self, mapping_name: &str) -> Result<(), Error> {
        let output = run(Command::new("cryptsetup").arg("luksClose").arg(mapping_name)).await?;

        // Closing a mapping that's already gone is not an error at this
        // layer; the caller (node.rs unstage/unpublish path) treats
        // "absence" as success regardless.
        if output.status.success() {
            return Ok(());
        }
        if !mapper_path(mapping_name).exists() {
            return Ok(());
        }

        ensure_success("cryptsetup luksClose", &output)
    }
}

async fn read_random_bytes(n: usize) -> Result<Vec<u8>, Error> {
    use tokio::io::AsyncReadExt;
    let mut file = tokio::fs::File::open("/dev/urandom").await?;
    let mut buf = vec![0u8; n];
    file.read_exact(&mut buf).await?;
    Ok(buf)
}

/// In-memory fake for tests: tracks formatted devices and active mappings
/// without touching the host.
#[cfg(any(test, feature = "test-util"))]
pub mod fake {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct FakeLuks {
        formatted: Mutex<HashSet<PathBuf>>,
        active: Mutex<HashSet<String>>,
    }

    #[async_trait]
    impl LuksOps for FakeLuks {
        async fn probe(&self, device: &Path) -> Result<bool, Error> {
            Ok(self.formatted.lock().unwrap().contains(device))
        }

        async fn format(&self, device: &Path, _cipher: &str, _key_size_bits: u32) -> Result<MasterKey, Error> {
            self.formatted.lock().unwrap().insert(device.to_path_buf());
            Ok(MasterKey {
                file: tempfile::NamedTempFile::new()?,
            })
        }

        async fn add_key_slot(
            &self,
            _device: &Path,
            _slot: u32,
            _passphrase: &str,
            _master_key: &MasterKey,
        ) -> Result<(), Error> {
            Ok(())
        }

        async fn load(&self, device: &Path) -> Result<(), Error> {
            if self.formatted.lock().unwrap().contains(device) {
                Ok(())
            } else {
                Err(Error::CommandFailed {
                    cmd: "luksDump".into(),
                    detail: "not a luks device".into(),
                })
            }
        }

        async fn activate(&self, _device: &Path, mapping_name: &str, _passphrase: &str) -> Result<(), Error> {
            self.active.lock().unwrap().insert(mapping_name.to_string());
            Ok(())
        }

        async fn init_by_name(&self, mapping_name: &str) -> Result<bool, Error> {
            Ok(self.active.lock().unwrap().contains(mapping_name))
        }

        async fn deactivate(&self, mapping_name: &str) -> Result<(), Error> {
            self.active.lock().unwrap().remove(mapping_name);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fake::FakeLuks;
    use super::*;

    #[tokio::test]
    async fn fake_round_trips_format_and_activate() {
        let luks = FakeLuks::default();
        let device = Path::new("/dev/fake0");

        assert!(!luks.probe(device).await.unwrap());
        let key = luks.format(device, "aes-xts-plain64", 512).await.unwrap();
        assert!(luks.probe(device).await.unwrap());

        luks.add_key_slot(device, 0, "hunter2", &key).await.unwrap();
        luks.activate(device, "myvol", "hunter2").await.unwrap();
        assert!(luks.init_by_name("myvol").await.unwrap());

        luks.deactivate("myvol").await.unwrap();
        assert!(!luks.init_by_name("myvol").await.unwrap());
    }
}
