use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde::{de::DeserializeOwned, Serialize};

use crate::types::{
    AttachVolumeParams, CloneVolumeParams, CreateVolumeParams, Instance, Page, ResizeVolumeParams,
    Volume,
};
use crate::Error;

/// Every cloud-provider operation the `csi` crate's Controller/Node
/// services need, as a trait object seam so tests can substitute a fake
/// backend instead of talking HTTP (trait-based interface,
/// applied here the same way `device::luks::LuksOps` applies it to
/// `cryptsetup`).
#[async_trait]
pub trait LinodeApiOps: Send + Sync {
    async fn get_volume(&self, id: u64) -> Result<Volume, Error>;
    async fn list_volumes_by_label(&self, label: &str) -> Result<Vec<Volume>, Error>;
    async fn list_volumes_page(&self, page: usize, page_size: usize) -> Result<(Vec<Volume>, bool), Error>;
    async fn create_volume(&self, params: &CreateVolumeParams) -> Result<Volume, Error>;
    async fn clone_volume(&self, source_id: u64, params: &CloneVolumeParams) -> Result<Volume, Error>;
    async fn delete_volume(&self, id: u64) -> Result<(), Error>;
    async fn resize_volume(&self, id: u64, size: u32) -> Result<(), Error>;
    async fn attach_volume(&self, id: u64, params: &AttachVolumeParams) -> Result<Volume, Error>;
    async fn detach_volume(&self, id: u64) -> Result<(), Error>;
    async fn get_instance(&self, id: u64) -> Result<Instance, Error>;
    async fn list_instance_volumes(&self, instance_id: u64) -> Result<Vec<Volume>, Error>;
    async fn region_supports_encryption(&self, region: &str) -> Result<bool, Error>;
}

const DEFAULT_BASE_URL: &str = "https://api.linode.com/v4";

/// Thin async wrapper over the cloud provider's JSON API. Shared and safe
/// for concurrent use — `reqwest::Client` already pools connections
/// internally, so a single instance is cloned wherever a backend handle
/// needs to be threaded through.
#[derive(Clone)]
pub struct Client {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print the token.
        f.debug_struct("Client")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl Client {
    pub fn new(token: impl Into<String>) -> Result<Self, Error> {
        Self::with_base_url(token, DEFAULT_BASE_URL)
    }

    pub fn with_base_url(token: impl Into<String>, base_url: impl Into<String>) -> Result<Self, Error> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            http,
            base_url: base_url.into(),
            token: token.into(),
        })
    }

    async fn request<B: Serialize + ?Sized, R: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<R, Error> {
        let url = format!("{}{}", self.base_url, path);
        let mut req = self
            .http
            .request(method, url)
            .bearer_auth(&self.token);

        if let Some(body) = body {
            req = req.json(body);
        }

        let resp = req.send().await?;
        let status = resp.status();

        if status == StatusCode::NOT_FOUND {
            return Err(Error::NotFound);
        }
        if status == StatusCode::BAD_REQUEST || status == StatusCode::UNPROCESSABLE_ENTITY {
            let text = resp.text().await.unwrap_or_default();
            return Err(Error::BadRequest(text));
        }
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(Error::UnexpectedResponse(format!(
                "status {}: {}",
                status, text
            )));
        }

        resp.json::<R>()
            .await
            .map_err(|err| Error::UnexpectedResponse(err.to_string()))
    }

    /// Like [`Client::request`], but for endpoints whose success body isn't
    /// worth (or safe to) deserialize — plain `DELETE`/`POST` actions that
    /// return an empty object.
    async fn request_no_content<B: Serialize + ?Sized>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<(), Error> {
        let url = format!("{}{}", self.base_url, path);
        let mut req = self.http.request(method, url).bearer_auth(&self.token);

        if let Some(body) = body {
            req = req.json(body);
        }

        let resp = req.send().await?;
        let status = resp.status();

        if status == StatusCode::NOT_FOUND {
            return Err(Error::NotFound);
        }
        if status == StatusCode::BAD_REQUEST || status == StatusCode::UNPROCESSABLE_ENTITY {
            let text = resp.text().await.unwrap_or_default();
            return Err(Error::BadRequest(text));
        }
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(Error::UnexpectedResponse(format!(
                "status {}: {}",
                status, text
            )));
        }

        Ok(())
    }

    pub async fn get_volume(&self, id: u64) -> Result<Volume, Error> {
        self.request::<(), _>(Method::GET, &format!("/volumes/{id}"), None)
            .await
    }

    pub async fn list_volumes_by_label(&self, label: &str) -> Result<Vec<Volume>, Error> {
        let page: Page<Volume> = self
            .request::<(), _>(
                Method::GET,
                &format!("/volumes?filter=label:{label}"),
                None,
            )
            .await?;

        Ok(page.data)
    }

    /// List volumes with decimal page-token pagination
    /// "ListVolumes pagination"). Returns the page of volumes plus whether
    /// another page may follow (the page we got back was full).
    pub async fn list_volumes_page(
        &self,
        page: usize,
        page_size: usize,
    ) -> Result<(Vec<Volume>, bool), Error> {
        let resp: Page<Volume> = self
            .request::<(), _>(
                Method::GET,
                &format!("/volumes?page={page}&page_size={page_size}"),
                None,
            )
            .await?;

        let has_more = resp.data.len() >= page_size;
        Ok((resp.data, has_more))
    }

    pub async fn create_volume(&self, params: &CreateVolumeParams) -> Result<Volume, Error> {
        self.request(Method::POST, "/volumes", Some(params)).await
    }

    pub async fn clone_volume(
        &self,
        source_id: u64,
        params: &CloneVolumeParams,
    ) -> Result<Volume, Error> {
        self.request(
            Method::POST,
            &format!("/volumes/{source_id}/clone"),
            Some(params),
        )
        .await
    }

    pub async fn delete_volume(&self, id: u64) -> Result<(), Error> {
        self.request_no_content::<()>(Method::DELETE, &format!("/volumes/{id}"), None)
            .await
    }

    pub async fn resize_volume(&self, id: u64, size: u32) -> Result<(), Error> {
        self.request_no_content(
            Method::POST,
            &format!("/volumes/{id}/resize"),
            Some(&ResizeVolumeParams { size }),
        )
        .await
    }

    pub async fn attach_volume(
        &self,
        id: u64,
        params: &AttachVolumeParams,
    ) -> Result<Volume, Error> {
        self.request(
            Method::POST,
            &format!("/volumes/{id}/attach"),
            Some(params),
        )
        .await
    }

    pub async fn detach_volume(&self, id: u64) -> Result<(), Error> {
        self.request_no_content::<()>(Method::POST, &format!("/volumes/{id}/detach"), None)
            .await
    }

    pub async fn get_instance(&self, id: u64) -> Result<Instance, Error> {
        self.request::<(), _>(Method::GET, &format!("/linode/instances/{id}"), None)
            .await
    }

    /// Volumes currently attached to `instance_id`, used for the
    /// attachment-capacity check in `ControllerPublishVolume`
    /// §4.2).
    pub async fn list_instance_volumes(&self, instance_id: u64) -> Result<Vec<Volume>, Error> {
        let page: Page<Volume> = self
            .request::<(), _>(
                Method::GET,
                &format!("/linode/instances/{instance_id}/volumes"),
                None,
            )
            .await?;

        Ok(page.data)
    }

    /// Whether the given region advertises at-rest Block Storage
    /// Encryption via the optional `encrypted=true` parameter.
    pub async fn region_supports_encryption(&self, region: &str) -> Result<bool, Error> {
        #[derive(serde::Deserialize)]
        struct RegionCapabilities {
            capabilities: Vec<String>,
        }

        let region: RegionCapabilities = self
            .request::<(), _>(Method::GET, &format!("/regions/{region}"), None)
            .await?;

        Ok(region
            .capabilities
            .iter()
            .any(|cap| cap == "Block Storage Encryption"))
    }
}

#[async_trait]
impl LinodeApiOps for Client {
    async fn get_volume(&self, id: u64) -> Result<Volume, Error> {
        Client::get_volume(self, id).await
    }

    async fn list_volumes_by_label(&self, label: &str) -> Result<Vec<Volume>, Error> {
        Client::list_volumes_by_label(self, label).await
    }

    async fn list_volumes_page(&self, page: usize, page_size: usize) -> Result<(Vec<Volume>, bool), Error> {
        Client::list_volumes_page(self, page, page_size).await
    }

    async fn create_volume(&self, params: &CreateVolumeParams) -> Result<Volume, Error> {
        Client::create_volume(self, params).await
    }

    async fn clone_volume(&self, source_id: u64, params: &CloneVolumeParams) -> Result<Volume, Error> {
        Client::clone_volume(self, source_id, params).await
    }

    async fn delete_volume(&self, id: u64) -> Result<(), Error> {
        Client::delete_volume(self, id).await
    }

    async fn resize_volume(&self, id: u64, size: u32) -> Result<(), Error> {
        Client::resize_volume(self, id, size).await
    }

    async fn attach_volume(&self, id: u64, params: &AttachVolumeParams) -> Result<Volume, Error> {
        Client::attach_volume(self, id, params).await
    }

    async fn detach_volume(&self, id: u64) -> Result<(), Error> {
        Client::detach_volume(self, id).await
    }

    async fn get_instance(&self, id: u64) -> Result<Instance, Error> {
        Client::get_instance(self, id).await
    }

    async fn list_instance_volumes(&self, instance_id: u64) -> Result<Vec<Volume>, Error> {
        Client::list_instance_volumes(self, instance_id).await
    }

    async fn region_supports_encryption(&self, region: &str) -> Result<bool, Error> {
        Client::region_supports_encryption(self, region).await
    }
}

/// In-memory fake for tests: holds volumes/instances in `Mutex`-guarded
/// maps instead of talking HTTP. Mirrors `device::luks::fake::FakeLuks`.
#[cfg(any(test, feature = "test-util"))]
pub mod fake {
    use super::*;
    use std::collections::HashMap as Map;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct FakeApi {
        pub volumes: Mutex<Map<u64, Volume>>,
        pub instances: Mutex<Map<u64, Instance>>,
        pub encrypted_regions: Mutex<std::collections::HashSet<String>>,
        next_id: AtomicU64,
    }

    impl FakeApi {
        pub fn new() -> Self {
            Self {
                next_id: AtomicU64::new(1),
                ..Default::default()
            }
        }

        pub fn insert_volume(&self, volume: Volume) {
            self.volumes.lock().unwrap().insert(volume.id, volume);
        }

        pub fn insert_instance(&self, instance: Instance) {
            self.instances.lock().unwrap().insert(instance.id, instance);
        }

        fn allocate_id(&self) -> u64 {
            self.next_id.fetch_add(1, Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl LinodeApiOps for FakeApi {
        async fn get_volume(&self, id: u64) -> Result<Volume, Error> {
            self.volumes.lock().unwrap().get(&id).cloned().ok_or(Error::NotFound)
        }

        async fn list_volumes_by_label(&self, label: &str) -> Result<Vec<Volume>, Error> {
            Ok(self
                .volumes
                .lock()
                .unwrap()
                .values()
                .filter(|v| v.label == label)
                .cloned()
                .collect())
        }

        async fn list_volumes_page(&self, page: usize, page_size: usize) -> Result<(Vec<Volume>, bool), Error> {
            let mut all: Vec<Volume> = self.volumes.lock().unwrap().values().cloned().collect();
            all.sort_by_key(|v| v.id);

            let start = (page - 1) * page_size;
            let chunk: Vec<Volume> = all.iter().skip(start).take(page_size).cloned().collect();
            let has_more = start + chunk.len() < all.len();

            Ok((chunk, has_more))
        }

        async fn create_volume(&self, params: &CreateVolumeParams) -> Result<Volume, Error> {
            let id = self.allocate_id();
            let volume = Volume {
                id,
                label: params.label.clone(),
                size: params.size,
                region: params.region.clone(),
                linode_id: None,
                status: crate::types::VolumeStatus::Active,
                filesystem_path: format!("/dev/disk/by-id/linode-{id}-{}", params.label),
                tags: params.tags.clone(),
                encryption: params.encryption.map(|_| true),
            };
            self.insert_volume(volume.clone());
            Ok(volume)
        }

        async fn clone_volume(&self, source_id: u64, params: &CloneVolumeParams) -> Result<Volume, Error> {
            let source = self.get_volume(source_id).await?;
            let id = self.allocate_id();
            let volume = Volume {
                id,
                label: params.label.clone(),
                linode_id: None,
                status: crate::types::VolumeStatus::Active,
                filesystem_path: format!("/dev/disk/by-id/linode-{id}-{}", params.label),
                ..source
            };
            self.insert_volume(volume.clone());
            Ok(volume)
        }

        async fn delete_volume(&self, id: u64) -> Result<(), Error> {
            self.volumes
                .lock()
                .unwrap()
                .remove(&id)
                .map(|_| ())
                .ok_or(Error::NotFound)
        }

        async fn resize_volume(&self, id: u64, size: u32) -> Result<(), Error> {
            let mut volumes = self.volumes.lock().unwrap();
            let volume = volumes.get_mut(&id).ok_or(Error::NotFound)?;
            volume.size = size;
            Ok(())
        }

        async fn attach_volume(&self, id: u64, params: &AttachVolumeParams) -> Result<Volume, Error> {
            let mut volumes = self.volumes.lock().unwrap();
            let volume = volumes.get_mut(&id).ok_or(Error::NotFound)?;
            if let Some(existing) = volume.linode_id {
                if existing != params.linode_id {
                    return Err(Error::AlreadyAttached { volume_id: id });
                }
            }
            volume.linode_id = Some(params.linode_id);
            Ok(volume.clone())
        }

        async fn detach_volume(&self, id: u64) -> Result<(), Error> {
            let mut volumes = self.volumes.lock().unwrap();
            let volume = volumes.get_mut(&id).ok_or(Error::NotFound)?;
            volume.linode_id = None;
            Ok(())
        }

        async fn get_instance(&self, id: u64) -> Result<Instance, Error> {
            self.instances.lock().unwrap().get(&id).cloned().ok_or(Error::NotFound)
        }

        async fn list_instance_volumes(&self, instance_id: u64) -> Result<Vec<Volume>, Error> {
            Ok(self
                .volumes
                .lock()
                .unwrap()
                .values()
                .filter(|v| v.linode_id == Some(instance_id))
                .cloned()
                .collect())
        }

        async fn region_supports_encryption(&self, region: &str) -> Result<bool, Error> {
            Ok(self.encrypted_regions.lock().unwrap().contains(region))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_impl_never_prints_the_token() {
        let client = Client::new("super-secret-token").unwrap();
        let debug = format!("{:?}", client);
        assert!(!debug.contains("super-secret-token"));
    }
}
