use crate::error::Result;
use crate::types::{BackendKind, ByteSource, ByteStream};
use async_trait::async_trait;

/// Capability set every storage backend provides.
///
/// Adapters handle only the raw remote calls. Container bookkeeping,
/// retries, local files, and error classification live in
/// [`DataTransfer`](crate::DataTransfer), so the behavioral contract is the
/// same for every backend.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Which backend this handle talks to
    fn kind(&self) -> BackendKind;

    /// Names of every container in the account, all pages included
    async fn list_containers(&self) -> Result<Vec<String>>;

    /// Create a container; `Error::ContainerConflict` if the name is taken
    async fn create_container(&self, name: &str) -> Result<()>;

    /// Every object key in `container`, all pages included, in the
    /// backend's stable listing order
    async fn list_objects(&self, container: &str) -> Result<Vec<String>>;

    /// Store the file as `container/key`, replacing any existing object
    async fn upload(&self, container: &str, key: &str, source: &ByteSource) -> Result<()>;

    /// Start downloading `container/key`.
    ///
    /// Resolves only after the backend confirmed the object exists, so a
    /// missing object fails here with `Error::ObjectNotFound` before the
    /// caller touches any local file.
    async fn download(&self, container: &str, key: &str) -> Result<ByteStream>;

    /// Whether a container named `name` exists, compared by name
    async fn container_exists(&self, name: &str) -> Result<bool> {
        Ok(self.list_containers().await?.iter().any(|c| c == name))
    }
}

#[async_trait]
impl<T: StorageBackend + ?Sized> StorageBackend for Box<T> {
    fn kind(&self) -> BackendKind {
        (**self).kind()
    }

    async fn list_containers(&self) -> Result<Vec<String>> {
        (**self).list_containers().await
    }

    async fn create_container(&self, name: &str) -> Result<()> {
        (**self).create_container(name).await
    }

    async fn list_objects(&self, container: &str) -> Result<Vec<String>> {
        (**self).list_objects(container).await
    }

    async fn upload(&self, container: &str, key: &str, source: &ByteSource) -> Result<()> {
        (**self).upload(container, key, source).await
    }

    async fn download(&self, container: &str, key: &str) -> Result<ByteStream> {
        (**self).download(container, key).await
    }

    async fn container_exists(&self, name: &str) -> Result<bool> {
        (**self).container_exists(name).await
    }
}
