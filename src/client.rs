use crate::azure::AzureBlobClient;
use crate::backend::StorageBackend;
use crate::config::BackendConfig;
use crate::credentials::{Environment, ProcessEnv};
use crate::dataverse::DataverseClient;
use crate::error::Result;
use crate::gcs::GcsClient;
use crate::memory::MemoryBackend;
use crate::s3::S3Client;
use crate::types::{BackendKind, ByteSource, ByteStream};
use async_trait::async_trait;
use tracing::info;

/// Unified client over every supported backend
#[derive(Debug, Clone)]
pub enum StorageClient {
    S3(S3Client),
    Azure(AzureBlobClient),
    Gcs(GcsClient),
    Dataverse(DataverseClient),
    Memory(MemoryBackend),
}

impl StorageClient {
    /// Build the client `config` describes, resolving missing credentials
    /// from `env`.
    ///
    /// No request is sent here; credentials are validated by the first
    /// operation.
    pub fn connect(config: &BackendConfig, env: &dyn Environment) -> Result<Self> {
        let bundle = &config.credentials;
        let client = match config.backend {
            BackendKind::S3 => StorageClient::S3(S3Client::connect(bundle, env, &config.http)?),
            BackendKind::Azure => StorageClient::Azure(AzureBlobClient::connect(
                bundle,
                config.account_url.as_deref(),
                env,
                &config.http,
            )?),
            BackendKind::Gcs => StorageClient::Gcs(GcsClient::connect(
                bundle,
                env,
                &config.http,
                config.gcs.clone(),
            )?),
            BackendKind::Dataverse => StorageClient::Dataverse(DataverseClient::connect(
                bundle,
                env,
                &config.http,
                config.dataverse.clone(),
            )?),
            BackendKind::Memory => StorageClient::Memory(MemoryBackend::new()),
        };

        info!(backend = %config.backend, "storage client ready");
        Ok(client)
    }

    /// [`connect`](Self::connect) against the process environment
    pub fn from_env(config: &BackendConfig) -> Result<Self> {
        Self::connect(config, &ProcessEnv)
    }
}

impl From<S3Client> for StorageClient {
    fn from(client: S3Client) -> Self {
        StorageClient::S3(client)
    }
}

impl From<AzureBlobClient> for StorageClient {
    fn from(client: AzureBlobClient) -> Self {
        StorageClient::Azure(client)
    }
}

impl From<GcsClient> for StorageClient {
    fn from(client: GcsClient) -> Self {
        StorageClient::Gcs(client)
    }
}

impl From<DataverseClient> for StorageClient {
    fn from(client: DataverseClient) -> Self {
        StorageClient::Dataverse(client)
    }
}

impl From<MemoryBackend> for StorageClient {
    fn from(backend: MemoryBackend) -> Self {
        StorageClient::Memory(backend)
    }
}

#[async_trait]
impl StorageBackend for StorageClient {
    fn kind(&self) -> BackendKind {
        match self {
            StorageClient::S3(client) => client.kind(),
            StorageClient::Azure(client) => client.kind(),
            StorageClient::Gcs(client) => client.kind(),
            StorageClient::Dataverse(client) => client.kind(),
            StorageClient::Memory(backend) => backend.kind(),
        }
    }

    async fn list_containers(&self) -> Result<Vec<String>> {
        match self {
            StorageClient::S3(client) => client.list_containers().await,
            StorageClient::Azure(client) => client.list_containers().await,
            StorageClient::Gcs(client) => client.list_containers().await,
            StorageClient::Dataverse(client) => client.list_containers().await,
            StorageClient::Memory(backend) => backend.list_containers().await,
        }
    }

    async fn create_container(&self, name: &str) -> Result<()> {
        match self {
            StorageClient::S3(client) => client.create_container(name).await,
            StorageClient::Azure(client) => client.create_container(name).await,
            StorageClient::Gcs(client) => client.create_container(name).await,
            StorageClient::Dataverse(client) => client.create_container(name).await,
            StorageClient::Memory(backend) => backend.create_container(name).await,
        }
    }

    async fn list_objects(&self, container: &str) -> Result<Vec<String>> {
        match self {
            StorageClient::S3(client) => client.list_objects(container).await,
            StorageClient::Azure(client) => client.list_objects(container).await,
            StorageClient::Gcs(client) => client.list_objects(container).await,
            StorageClient::Dataverse(client) => client.list_objects(container).await,
            StorageClient::Memory(backend) => backend.list_objects(container).await,
        }
    }

    async fn upload(&self, container: &str, key: &str, source: &ByteSource) -> Result<()> {
        match self {
            StorageClient::S3(client) => client.upload(container, key, source).await,
            StorageClient::Azure(client) => client.upload(container, key, source).await,
            StorageClient::Gcs(client) => client.upload(container, key, source).await,
            StorageClient::Dataverse(client) => client.upload(container, key, source).await,
            StorageClient::Memory(backend) => backend.upload(container, key, source).await,
        }
    }

    async fn download(&self, container: &str, key: &str) -> Result<ByteStream> {
        match self {
            StorageClient::S3(client) => client.download(container, key).await,
            StorageClient::Azure(client) => client.download(container, key).await,
            StorageClient::Gcs(client) => client.download(container, key).await,
            StorageClient::Dataverse(client) => client.download(container, key).await,
            StorageClient::Memory(backend) => backend.download(container, key).await,
        }
    }
}
