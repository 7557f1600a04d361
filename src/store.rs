//! Helpers shared by the backends whose object operations go through
//! `object_store` (Azure Blob and GCS).
//!
//! `object_store` handles are scoped to one bucket or container, so each
//! backend keeps one handle per container name, built on first use.

use crate::config::HttpOptions;
use crate::error::{Error, Result};
use crate::types::{BackendKind, ByteSource, ByteStream};
use futures::{StreamExt, TryStreamExt};
use object_store::buffered::BufWriter;
use object_store::path::Path as ObjectPath;
use object_store::{BackoffConfig, ClientOptions, ObjectStore, RetryConfig};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tracing::debug;

impl HttpOptions {
    pub(crate) fn client_options(&self) -> ClientOptions {
        ClientOptions::default()
            .with_timeout(Duration::from_secs(self.timeout_secs))
            .with_connect_timeout(Duration::from_secs(self.connect_timeout_secs))
    }

    pub(crate) fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            backoff: BackoffConfig::default(),
            max_retries: self.max_retries as usize,
            retry_timeout: Duration::from_secs(self.timeout_secs),
        }
    }
}

/// Per-container `object_store` handles
#[derive(Default)]
pub(crate) struct StoreCache {
    stores: Mutex<HashMap<String, Arc<dyn ObjectStore>>>,
}

impl StoreCache {
    pub(crate) fn get_or_build<F>(&self, container: &str, build: F) -> Result<Arc<dyn ObjectStore>>
    where
        F: FnOnce() -> Result<Arc<dyn ObjectStore>>,
    {
        let mut stores = self.stores.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(store) = stores.get(container) {
            return Ok(Arc::clone(store));
        }
        let store = build()?;
        debug!(container = container, store = %store, "object store handle built");
        stores.insert(container.to_string(), Arc::clone(&store));
        Ok(store)
    }
}

/// Object key as an `object_store` path. Keys that are already valid paths
/// are taken as-is so listed keys round-trip unchanged.
pub(crate) fn object_path(key: &str) -> ObjectPath {
    ObjectPath::parse(key).unwrap_or_else(|_| ObjectPath::from(key))
}

/// Map an `object_store` failure on `container` (and `key`, for object
/// reads) onto the crate's error kinds
pub(crate) fn store_error(
    err: object_store::Error,
    backend: BackendKind,
    container: &str,
    key: Option<&str>,
) -> Error {
    match err {
        object_store::Error::NotFound { .. } => match key {
            Some(key) => Error::ObjectNotFound {
                container: container.to_string(),
                key: key.to_string(),
            },
            None => Error::ContainerNotFound(container.to_string()),
        },
        object_store::Error::Unauthenticated { source, .. }
        | object_store::Error::PermissionDenied { source, .. } => Error::Authentication {
            backend,
            message: source.to_string(),
        },
        other => Error::ObjectStore(other),
    }
}

/// Every object key in the store, in listing order
pub(crate) async fn list_keys(store: &dyn ObjectStore) -> object_store::Result<Vec<String>> {
    store
        .list(None)
        .map_ok(|meta| meta.location.to_string())
        .try_collect()
        .await
}

/// Stream a local file into `key`. Small files go up in one request, larger
/// ones as a multipart upload.
pub(crate) async fn upload_file(
    store: Arc<dyn ObjectStore>,
    key: &str,
    source: &ByteSource,
) -> Result<()> {
    let file = tokio::fs::File::open(source.path())
        .await
        .map_err(|e| Error::local_io(source.path(), e))?;
    let mut chunks = ReaderStream::new(file);
    let mut writer = BufWriter::new(store, object_path(key));

    while let Some(chunk) = chunks.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => {
                abort(&mut writer, key).await;
                return Err(Error::local_io(source.path(), e));
            }
        };
        if let Err(e) = writer.write_all(&chunk).await {
            abort(&mut writer, key).await;
            return Err(writer_error(e));
        }
    }
    writer.shutdown().await.map_err(writer_error)
}

async fn abort(writer: &mut BufWriter, key: &str) {
    if let Err(e) = writer.abort().await {
        debug!(key = key, error = %e, "abandoned upload could not be aborted");
    }
}

/// Recover the `object_store` error carried inside the writer's I/O error
fn writer_error(err: std::io::Error) -> Error {
    let kind = err.kind();
    match err.into_inner() {
        Some(inner) => match inner.downcast::<object_store::Error>() {
            Ok(store_error) => Error::ObjectStore(*store_error),
            Err(other) => Error::Transport(other.to_string()),
        },
        None => Error::Transport(kind.to_string()),
    }
}

/// Start reading `key`; the body arrives as a stream of chunks
pub(crate) async fn download(
    store: &dyn ObjectStore,
    backend: BackendKind,
    container: &str,
    key: &str,
) -> Result<ByteStream> {
    let result = store
        .get(&object_path(key))
        .await
        .map_err(|e| store_error(e, backend, container, Some(key)))?;
    Ok(result.into_stream().map_err(Error::ObjectStore).boxed())
}

#[cfg(test)]
mod tests {
    use super::*;
    use object_store::memory::InMemory;
    use object_store::PutPayload;

    #[test]
    fn test_object_path_keeps_listed_keys() {
        assert_eq!(object_path("reports/2024/q1.csv").to_string(), "reports/2024/q1.csv");
        assert_eq!(object_path("q1 final.csv").to_string(), "q1 final.csv");
    }

    #[test]
    fn test_retry_config_follows_http_options() {
        let http = HttpOptions {
            max_retries: 3,
            ..HttpOptions::default()
        };
        let retry = http.retry_config();
        assert_eq!(retry.max_retries, 3);
        assert_eq!(retry.retry_timeout, Duration::from_secs(300));
        assert_eq!(HttpOptions::default().retry_config().max_retries, 0);
    }

    #[test]
    fn test_store_error_mapping() {
        let not_found = || object_store::Error::NotFound {
            path: "q1.csv".to_string(),
            source: "404".into(),
        };
        assert!(matches!(
            store_error(not_found(), BackendKind::Gcs, "reports", Some("q1.csv")),
            Error::ObjectNotFound { container, key } if container == "reports" && key == "q1.csv"
        ));
        assert!(matches!(
            store_error(not_found(), BackendKind::Gcs, "reports", None),
            Error::ContainerNotFound(name) if name == "reports"
        ));

        let denied = object_store::Error::PermissionDenied {
            path: "q1.csv".to_string(),
            source: "AuthorizationFailure".into(),
        };
        assert!(matches!(
            store_error(denied, BackendKind::Azure, "reports", None),
            Error::Authentication { backend: BackendKind::Azure, .. }
        ));
    }

    #[test]
    fn test_store_cache_builds_once() {
        let cache = StoreCache::default();
        let mut builds = 0;
        for _ in 0..3 {
            cache
                .get_or_build("reports", || {
                    builds += 1;
                    Ok(Arc::new(InMemory::new()) as Arc<dyn ObjectStore>)
                })
                .unwrap();
        }
        assert_eq!(builds, 1);
    }

    #[tokio::test]
    async fn test_upload_list_and_download() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("q1.csv");
        std::fs::write(&path, b"region,total\nnorth,10\n").unwrap();
        let source = ByteSource::from_path(&path).await.unwrap();

        let store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        store
            .put(&object_path("2024/a.csv"), PutPayload::from_static(b"a"))
            .await
            .unwrap();
        upload_file(Arc::clone(&store), "2024/q1.csv", &source).await.unwrap();

        assert_eq!(
            list_keys(store.as_ref()).await.unwrap(),
            vec!["2024/a.csv", "2024/q1.csv"]
        );

        let chunks: Vec<bytes::Bytes> =
            download(store.as_ref(), BackendKind::Gcs, "reports", "2024/q1.csv")
                .await
                .unwrap()
                .try_collect()
                .await
                .unwrap();
        assert_eq!(chunks.concat(), b"region,total\nnorth,10\n");
    }

    #[tokio::test]
    async fn test_download_missing_object() {
        let store = InMemory::new();
        let err = download(&store, BackendKind::Azure, "reports", "absent.csv")
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::ObjectNotFound { .. }));
    }
}
