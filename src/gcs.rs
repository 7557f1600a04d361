//! Google Cloud Storage backend.
//!
//! Object reads, writes, and listings go through `object_store`'s GCS client,
//! which also owns token acquisition (service account, authorized user, or
//! the metadata server). Bucket listing and creation are project-level calls
//! `object_store` does not offer; those go to the JSON API with a token from
//! the same credential provider.

use crate::backend::StorageBackend;
use crate::config::HttpOptions;
use crate::credentials::{CredentialBundle, CredentialField, Environment};
use crate::error::{Error, Result};
use crate::http::{check_status, error_body};
use crate::store::{self, StoreCache};
use crate::types::{BackendKind, ByteSource, ByteStream};
use async_trait::async_trait;
use object_store::gcp::{GcpCredentialProvider, GoogleCloudStorageBuilder};
use object_store::ObjectStore;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::debug;

const METADATA_BASE: &str = "http://metadata.google.internal/computeMetadata/v1";
const STORAGE_API: &str = "https://storage.googleapis.com";
/// Bucket name for the handle that only supplies the credential provider
const CREDENTIALS_BUCKET: &str = "objstore-bridge";

/// Settings applied when creating buckets
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GcsOptions {
    pub location: String,
    pub storage_class: String,
}

impl Default for GcsOptions {
    fn default() -> Self {
        Self {
            location: "US".to_string(),
            storage_class: "COLDLINE".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GcsMode {
    /// Unauthenticated requests to a local emulator
    Emulator,
    CredentialsFile,
    /// Instance identity from the metadata server
    Metadata,
}

#[derive(Deserialize)]
struct ListPage {
    #[serde(default)]
    items: Vec<NamedItem>,
    #[serde(rename = "nextPageToken")]
    next_page_token: Option<String>,
}

#[derive(Deserialize)]
struct NamedItem {
    name: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct NewBucket<'a> {
    name: &'a str,
    location: &'a str,
    storage_class: &'a str,
}

/// GCS client handle
#[derive(Clone)]
pub struct GcsClient {
    client: Client,
    api_base: String,
    metadata_base: String,
    mode: GcsMode,
    builder: GoogleCloudStorageBuilder,
    credentials: GcpCredentialProvider,
    stores: Arc<StoreCache>,
    options: GcsOptions,
    configured_project: Option<String>,
    project: Arc<OnceCell<String>>,
}

impl std::fmt::Debug for GcsClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GcsClient")
            .field("api_base", &self.api_base)
            .field("mode", &self.mode)
            .field("project", &self.configured_project)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl GcsClient {
    /// Build a client from a credentials file, an emulator endpoint, or the
    /// metadata server identity.
    pub fn connect(
        bundle: &CredentialBundle,
        env: &dyn Environment,
        http: &HttpOptions,
        options: GcsOptions,
    ) -> Result<Self> {
        let mut project = bundle.resolve(CredentialField::ProjectId, env);

        let emulator = bundle
            .explicit(CredentialField::Endpoint)
            .or_else(|| bundle.resolve(CredentialField::EmulatorHost, env));

        let builder = GoogleCloudStorageBuilder::new().with_retry(http.retry_config());
        let (api_base, mode, builder) = if let Some(emulator) = emulator {
            let base = emulator_base(&emulator);
            let key = serde_json::json!({
                "gcs_base_url": base,
                "disable_oauth": true,
                "client_email": "",
                "private_key": "",
                "private_key_id": "",
            });
            let builder = builder
                .with_service_account_key(key.to_string())
                .with_client_options(http.client_options().with_allow_http(true));
            (base, GcsMode::Emulator, builder)
        } else if let Some(path) = bundle.resolve(CredentialField::CredentialsFile, env) {
            project = project.or(file_project(Path::new(&path))?);
            let builder = builder
                .with_application_credentials(path)
                .with_client_options(http.client_options());
            (STORAGE_API.to_string(), GcsMode::CredentialsFile, builder)
        } else {
            let builder = builder.with_client_options(http.client_options());
            (STORAGE_API.to_string(), GcsMode::Metadata, builder)
        };

        let credentials = builder
            .clone()
            .with_bucket_name(CREDENTIALS_BUCKET)
            .build()
            .map_err(|e| Error::Configuration(format!("GCS credentials: {}", e)))?
            .credentials()
            .clone();

        debug!(api = %api_base, mode = ?mode, project = ?project, "GCS client configured");

        Ok(Self {
            client: http.build_client()?,
            api_base,
            metadata_base: METADATA_BASE.to_string(),
            mode,
            builder,
            credentials,
            stores: Arc::default(),
            options,
            configured_project: project,
            project: Arc::new(OnceCell::new()),
        })
    }

    pub fn options(&self) -> &GcsOptions {
        &self.options
    }

    /// The `object_store` handle for one bucket, sharing this client's
    /// credential provider
    fn store(&self, bucket: &str) -> Result<Arc<dyn ObjectStore>> {
        self.stores.get_or_build(bucket, || {
            let store = self
                .builder
                .clone()
                .with_bucket_name(bucket)
                .with_credentials(Arc::clone(&self.credentials))
                .build()?;
            Ok(Arc::new(store) as Arc<dyn ObjectStore>)
        })
    }

    /// Project that owns bucket listings and new buckets
    async fn project_id(&self) -> Result<String> {
        if let Some(project) = &self.configured_project {
            return Ok(project.clone());
        }
        if self.mode != GcsMode::Metadata {
            return Err(Error::Configuration(
                "GCS bucket operations need a project id (bundle 'project_id' or GOOGLE_CLOUD_PROJECT)"
                    .to_string(),
            ));
        }

        self.project
            .get_or_try_init(|| async {
                debug!("fetching GCS project id from metadata server");
                let response = self
                    .client
                    .get(format!("{}/project/project-id", self.metadata_base))
                    .header("Metadata-Flavor", "Google")
                    .send()
                    .await
                    .map_err(|e| {
                        Error::Configuration(format!("metadata server unreachable: {}", e))
                    })?;
                let project = check_status(response, BackendKind::Gcs).await?.text().await?;
                Ok::<_, Error>(project.trim().to_string())
            })
            .await
            .cloned()
    }

    async fn authorize(&self, request: RequestBuilder) -> Result<RequestBuilder> {
        let credential = self
            .credentials
            .get_credential()
            .await
            .map_err(|e| Error::Token(e.to_string()))?;
        if credential.bearer.is_empty() {
            return Ok(request);
        }
        Ok(request.bearer_auth(&credential.bearer))
    }

    async fn list_page(&self, url: String, query: Vec<(&str, String)>) -> Result<Option<ListPage>> {
        let request = self.authorize(self.client.get(url).query(&query)).await?;
        let response = request.send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let body = check_status(response, BackendKind::Gcs).await?.text().await?;
        Ok(Some(serde_json::from_str(&body)?))
    }

    fn store_error(&self, err: object_store::Error, bucket: &str, key: Option<&str>) -> Error {
        store::store_error(err, BackendKind::Gcs, bucket, key)
    }
}

fn emulator_base(host: &str) -> String {
    let trimmed = host.trim().trim_end_matches('/');
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("http://{}", trimmed)
    }
}

/// Project named in an application credentials file: `project_id` for
/// service accounts, `quota_project_id` for authorized users
fn file_project(path: &Path) -> Result<Option<String>> {
    let contents = std::fs::read_to_string(path).map_err(|e| {
        Error::Configuration(format!("cannot read credentials file {}: {}", path.display(), e))
    })?;
    let parsed: serde_json::Value = serde_json::from_str(&contents).map_err(|e| {
        Error::Configuration(format!("malformed credentials file {}: {}", path.display(), e))
    })?;

    Ok(["project_id", "quota_project_id"]
        .iter()
        .find_map(|field| parsed.get(field).and_then(|v| v.as_str()))
        .filter(|project| !project.is_empty())
        .map(str::to_string))
}

#[async_trait]
impl StorageBackend for GcsClient {
    fn kind(&self) -> BackendKind {
        BackendKind::Gcs
    }

    async fn list_containers(&self) -> Result<Vec<String>> {
        let project = self.project_id().await?;
        let url = format!("{}/storage/v1/b", self.api_base);
        let mut names = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut query = vec![("project", project.clone())];
            if let Some(token) = page_token.take() {
                query.push(("pageToken", token));
            }
            let page = self
                .list_page(url.clone(), query)
                .await?
                .ok_or_else(|| Error::Configuration(format!("unknown GCS project '{}'", project)))?;

            names.extend(page.items.into_iter().map(|item| item.name));
            match page.next_page_token {
                Some(next) if !next.is_empty() => page_token = Some(next),
                _ => break,
            }
        }

        Ok(names)
    }

    async fn create_container(&self, name: &str) -> Result<()> {
        let project = self.project_id().await?;
        let request = self
            .client
            .post(format!("{}/storage/v1/b", self.api_base))
            .query(&[("project", project.as_str())])
            .json(&NewBucket {
                name,
                location: &self.options.location,
                storage_class: &self.options.storage_class,
            });
        let response = self.authorize(request).await?.send().await?;
        if response.status() == StatusCode::CONFLICT {
            let body = error_body(response).await;
            debug!(bucket = name, body = %body, "GCS bucket exists");
            return Err(Error::ContainerConflict(name.to_string()));
        }
        check_status(response, BackendKind::Gcs).await?;

        debug!(
            bucket = name,
            location = %self.options.location,
            storage_class = %self.options.storage_class,
            "GCS bucket created"
        );
        Ok(())
    }

    async fn list_objects(&self, container: &str) -> Result<Vec<String>> {
        let store = self.store(container)?;
        match store::list_keys(store.as_ref()).await {
            Ok(keys) => Ok(keys),
            Err(err) => {
                if matches!(self.container_exists(container).await, Ok(false)) {
                    return Err(Error::ContainerNotFound(container.to_string()));
                }
                Err(self.store_error(err, container, None))
            }
        }
    }

    async fn upload(&self, container: &str, key: &str, source: &ByteSource) -> Result<()> {
        let store = self.store(container)?;
        store::upload_file(store, key, source)
            .await
            .map_err(|e| match e {
                Error::ObjectStore(err) => self.store_error(err, container, None),
                other => other,
            })?;

        debug!(bucket = container, key = key, bytes = source.len(), "GCS upload complete");
        Ok(())
    }

    async fn download(&self, container: &str, key: &str) -> Result<ByteStream> {
        let store = self.store(container)?;
        let result = store::download(store.as_ref(), BackendKind::Gcs, container, key).await;
        if let Err(Error::ObjectNotFound { .. }) = &result {
            if matches!(self.container_exists(container).await, Ok(false)) {
                return Err(Error::ContainerNotFound(container.to_string()));
            }
        }
        result
    }
}
