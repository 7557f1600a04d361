//! `DataTransfer` - the backend-independent facade.
//!
//! Every operation follows the same contract regardless of the backend:
//! local preconditions are checked before any remote call, transient remote
//! failures are retried per [`RetryPolicy`](crate::RetryPolicy), and errors
//! leave with the operation and `container/key` they concern.

use crate::backend::StorageBackend;
use crate::client::StorageClient;
use crate::config::{Config, GetAllMode, TransferConfig};
use crate::credentials::Environment;
use crate::error::{Error, Result};
use crate::retry::retry;
use crate::types::{ByteSource, ByteStream, GetAllOutcome, GetOutcome, Operation, PutOutcome};
use bytes::Bytes;
use futures::stream::{self, StreamExt, TryStreamExt};
use std::path::{Path, PathBuf};
use tempfile::TempPath;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

/// Container and object transfers over one backend handle
#[derive(Debug)]
pub struct DataTransfer<B: StorageBackend> {
    backend: B,
    config: TransferConfig,
}

impl DataTransfer<StorageClient> {
    /// Connect the configured backend and wrap it with the configured behavior
    pub fn from_config(config: &Config, env: &dyn Environment) -> Result<Self> {
        Ok(Self::with_config(
            StorageClient::connect(&config.backend, env)?,
            config.transfer.clone(),
        ))
    }
}

impl<B: StorageBackend> DataTransfer<B> {
    pub fn new(backend: B) -> Self {
        Self::with_config(backend, TransferConfig::default())
    }

    pub fn with_config(backend: B, config: TransferConfig) -> Self {
        Self { backend, config }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    /// Create a container.
    ///
    /// A name that is already taken fails with `Error::ContainerConflict`.
    pub async fn create_container(&self, name: &str) -> Result<()> {
        // Some backends answer a create for a name the caller already owns
        // with success (S3 in us-east-1), so existence is checked first.
        let exists = retry(&self.config.retry, "list_containers", move || {
            self.backend.container_exists(name)
        })
        .await
        .map_err(|e| self.remote_write(Operation::CreateContainer, name, e))?;
        if exists {
            return Err(Error::ContainerConflict(name.to_string()));
        }

        retry(&self.config.retry, "create_container", move || {
            self.backend.create_container(name)
        })
        .await
        .map_err(|e| self.remote_write(Operation::CreateContainer, name, e))?;

        info!(backend = %self.backend.kind(), container = name, "container created");
        Ok(())
    }

    /// Upload a local file as `container/key`, creating the container first
    /// when no container of that name exists.
    pub async fn put_data(
        &self,
        local_path: impl AsRef<Path>,
        container: &str,
        key: &str,
    ) -> Result<PutOutcome> {
        let source = ByteSource::from_path(local_path.as_ref()).await?;
        let target = object_target(container, key);

        let exists = retry(&self.config.retry, "list_containers", move || {
            self.backend.container_exists(container)
        })
        .await
        .map_err(|e| self.remote_write(Operation::PutData, container, e))?;

        let mut container_created = false;
        if !exists {
            let created = retry(&self.config.retry, "create_container", move || {
                self.backend.create_container(container)
            })
            .await;
            match created {
                Ok(()) => {
                    container_created = true;
                    info!(backend = %self.backend.kind(), container = container, "container created");
                }
                Err(Error::ContainerConflict(_)) => {
                    warn!(
                        backend = %self.backend.kind(),
                        container = container,
                        "container was created concurrently, uploading into it"
                    );
                }
                Err(e) => return Err(self.remote_write(Operation::PutData, container, e)),
            }
        }

        let upload = &source;
        retry(&self.config.retry, "upload", move || {
            self.backend.upload(container, key, upload)
        })
        .await
        .map_err(|e| self.remote_write(Operation::PutData, &target, e))?;

        info!(
            backend = %self.backend.kind(),
            container = container,
            key = key,
            bytes = source.len(),
            "object uploaded"
        );
        Ok(PutOutcome {
            container: container.to_string(),
            key: key.to_string(),
            bytes: source.len(),
            container_created,
        })
    }

    /// Download `container/key` into `local_out_path`, truncating the file or
    /// appending to it.
    ///
    /// The destination is opened only after the backend confirmed the object
    /// exists, so a missing object leaves it untouched.
    pub async fn get_data(
        &self,
        container: &str,
        key: &str,
        local_out_path: impl AsRef<Path>,
        append: bool,
    ) -> Result<GetOutcome> {
        let out = local_out_path.as_ref();
        let target = object_target(container, key);

        let stream = retry(&self.config.retry, "download", move || {
            self.backend.download(container, key)
        })
        .await
        .map_err(|e| self.remote_read(Operation::GetData, &target, e))?;

        let mut file = open_destination(out, append).await?;
        let bytes = match write_stream(stream, &mut file, out).await {
            Ok(bytes) => bytes,
            Err(StreamFailure { bytes_written, error }) => {
                flush_partial(&mut file, out).await;
                let error = self.remote_read(Operation::GetData, &target, error);
                return Err(partial_or_remote(out, 0, bytes_written, error));
            }
        };
        file.flush().await.map_err(|e| Error::local_io(out, e))?;

        info!(
            backend = %self.backend.kind(),
            container = container,
            key = key,
            path = %out.display(),
            bytes = bytes,
            append = append,
            "object downloaded"
        );
        Ok(GetOutcome {
            container: container.to_string(),
            key: key.to_string(),
            path: out.to_path_buf(),
            bytes,
            appended: append,
        })
    }

    /// Concatenate every object of `container`, in listing order, into
    /// `local_out_path`.
    pub async fn get_all_data(
        &self,
        container: &str,
        local_out_path: impl AsRef<Path>,
    ) -> Result<GetAllOutcome> {
        let out = local_out_path.as_ref();

        let keys = retry(&self.config.retry, "list_objects", move || {
            self.backend.list_objects(container)
        })
        .await
        .map_err(|e| self.remote_read(Operation::GetAllData, container, e))?;
        debug!(container = container, objects = keys.len(), "listed objects");

        let bytes = match self.config.get_all_mode {
            GetAllMode::Atomic => self.concatenate_atomic(container, &keys, out).await?,
            GetAllMode::Incremental => self.concatenate_incremental(container, &keys, out).await?,
        };

        info!(
            backend = %self.backend.kind(),
            container = container,
            path = %out.display(),
            objects = keys.len(),
            bytes = bytes,
            mode = ?self.config.get_all_mode,
            "container downloaded"
        );
        Ok(GetAllOutcome {
            container: container.to_string(),
            path: out.to_path_buf(),
            objects: keys,
            bytes,
        })
    }

    /// Write into a temporary sibling of `out` and rename it over `out` on success
    async fn concatenate_atomic(&self, container: &str, keys: &[String], out: &Path) -> Result<u64> {
        let dir = match out.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let temp = tempfile::Builder::new()
            .prefix(".objstore-")
            .suffix(".part")
            .tempfile_in(&dir)
            .map_err(|e| Error::local_io(&dir, e))?;
        let (file, temp_path) = temp.into_parts();

        let mut sink = Sink::opened(temp_path.to_path_buf(), File::from_std(file));
        if let Err(e) = self.concatenate(container, keys, &mut sink).await {
            debug!(path = %temp_path.display(), "discarding partial download");
            return Err(e);
        }
        let bytes = sink.finish().await?;

        persist(temp_path, out)?;
        Ok(bytes)
    }

    /// Write straight into `out`, which is truncated by the first object
    async fn concatenate_incremental(
        &self,
        container: &str,
        keys: &[String],
        out: &Path,
    ) -> Result<u64> {
        let mut sink = Sink::lazy(out.to_path_buf());
        match self.concatenate(container, keys, &mut sink).await {
            Ok(()) => sink.finish().await,
            Err(e @ Error::LocalIo { .. }) => Err(e),
            Err(e) if sink.is_open() => {
                if let Some(file) = sink.file.as_mut() {
                    flush_partial(file, out).await;
                }
                Err(Error::PartialDownload {
                    path: out.to_path_buf(),
                    objects_written: sink.objects_written,
                    bytes_written: sink.bytes_written,
                    source: Box::new(e),
                })
            }
            Err(e) => Err(e),
        }
    }

    async fn concatenate(&self, container: &str, keys: &[String], sink: &mut Sink) -> Result<()> {
        if self.config.download_concurrency <= 1 {
            for key in keys {
                let target = object_target(container, key);
                let stream = retry(&self.config.retry, "download", move || {
                    self.backend.download(container, key)
                })
                .await
                .map_err(|e| self.remote_read(Operation::GetAllData, &target, e))?;

                let path = sink.path.clone();
                let file = sink.file().await?;
                match write_stream(stream, file, &path).await {
                    Ok(bytes) => sink.object_written(key, bytes),
                    Err(StreamFailure { bytes_written, error }) => {
                        sink.bytes_written += bytes_written;
                        return Err(self.remote_read(Operation::GetAllData, &target, error));
                    }
                }
            }
            return Ok(());
        }

        let fetches = stream::iter(keys)
            .map(|key| async move { (key, self.fetch_object(container, key).await) })
            .buffered(self.config.download_concurrency);
        let mut fetches = std::pin::pin!(fetches);

        while let Some((key, fetched)) = fetches.next().await {
            let data = fetched?;
            let path = sink.path.clone();
            let file = sink.file().await?;
            file.write_all(&data)
                .await
                .map_err(|e| Error::local_io(&path, e))?;
            sink.object_written(key, data.len() as u64);
        }
        Ok(())
    }

    /// Download a whole object into memory, retrying the complete fetch
    async fn fetch_object(&self, container: &str, key: &str) -> Result<Bytes> {
        retry(&self.config.retry, "download", move || async move {
            let chunks: Vec<Bytes> = self.backend.download(container, key).await?.try_collect().await?;
            Ok(Bytes::from(chunks.concat()))
        })
        .await
        .map_err(|e| self.remote_read(Operation::GetAllData, &object_target(container, key), e))
    }

    fn remote_read(&self, operation: Operation, target: &str, err: Error) -> Error {
        self.classify(operation, target, err, false)
    }

    fn remote_write(&self, operation: Operation, target: &str, err: Error) -> Error {
        self.classify(operation, target, err, true)
    }

    /// Wrap transport-level failures with the operation and target; pass
    /// already classified errors through.
    fn classify(&self, operation: Operation, target: &str, err: Error, write: bool) -> Error {
        match err {
            Error::Http(_)
            | Error::ObjectStore(_)
            | Error::Transport(_)
            | Error::Status { .. }
            | Error::InvalidResponse(_)
            | Error::Serialization(_)
            | Error::InvalidUrl(_) => {
                let target = target.to_string();
                let source = Box::new(err);
                if write {
                    Error::RemoteWrite {
                        operation,
                        target,
                        source,
                    }
                } else {
                    Error::RemoteRead {
                        operation,
                        target,
                        source,
                    }
                }
            }
            Error::Token(message) => Error::Authentication {
                backend: self.backend.kind(),
                message,
            },
            other => other,
        }
    }
}

fn object_target(container: &str, key: &str) -> String {
    format!("{}/{}", container, key)
}

/// A download stream failed after `bytes_written` bytes reached the file
struct StreamFailure {
    bytes_written: u64,
    error: Error,
}

/// Copy `stream` into `file`. Local write failures come back as `LocalIo`
/// with no byte count attached.
async fn write_stream(
    mut stream: ByteStream,
    file: &mut File,
    path: &Path,
) -> std::result::Result<u64, StreamFailure> {
    let mut written = 0u64;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|error| StreamFailure {
            bytes_written: written,
            error,
        })?;
        file.write_all(&chunk).await.map_err(|e| StreamFailure {
            bytes_written: written,
            error: Error::local_io(path, e),
        })?;
        written += chunk.len() as u64;
    }
    Ok(written)
}

/// `PartialDownload` when bytes already reached `path`, the error itself otherwise
fn partial_or_remote(path: &Path, objects_written: usize, bytes_written: u64, error: Error) -> Error {
    if bytes_written == 0 || matches!(error, Error::LocalIo { .. }) {
        return error;
    }
    Error::PartialDownload {
        path: path.to_path_buf(),
        objects_written,
        bytes_written,
        source: Box::new(error),
    }
}

/// Flush what a failed download already wrote. A flush failure is logged
/// and reported as `false`; the download error stays the one returned.
async fn flush_partial(file: &mut File, path: &Path) -> bool {
    match file.flush().await {
        Ok(()) => true,
        Err(e) => {
            warn!(
                path = %path.display(),
                error = %e,
                "could not flush partially downloaded data"
            );
            false
        }
    }
}

async fn open_destination(path: &Path, append: bool) -> Result<File> {
    OpenOptions::new()
        .write(true)
        .create(true)
        .append(append)
        .truncate(!append)
        .open(path)
        .await
        .map_err(|e| Error::local_io(path, e))
}

fn persist(temp_path: TempPath, out: &Path) -> Result<()> {
    temp_path
        .persist(out)
        .map_err(|e| Error::local_io(out, e.error))
}

/// Destination of a concatenated download, opened on first use
struct Sink {
    path: PathBuf,
    file: Option<File>,
    objects_written: usize,
    bytes_written: u64,
}

impl Sink {
    fn opened(path: PathBuf, file: File) -> Self {
        Self {
            path,
            file: Some(file),
            objects_written: 0,
            bytes_written: 0,
        }
    }

    fn lazy(path: PathBuf) -> Self {
        Self {
            path,
            file: None,
            objects_written: 0,
            bytes_written: 0,
        }
    }

    fn is_open(&self) -> bool {
        self.file.is_some()
    }

    async fn file(&mut self) -> Result<&mut File> {
        let file = match self.file.take() {
            Some(file) => file,
            None => open_destination(&self.path, false).await?,
        };
        Ok(self.file.insert(file))
    }

    fn object_written(&mut self, key: &str, bytes: u64) {
        debug!(key = key, bytes = bytes, path = %self.path.display(), "object appended");
        self.objects_written += 1;
        self.bytes_written += bytes;
    }

    /// Flush and close; an empty listing still yields an empty file
    async fn finish(mut self) -> Result<u64> {
        let path = self.path.clone();
        let file = self.file().await?;
        file.flush().await.map_err(|e| Error::local_io(&path, e))?;
        file.sync_all().await.map_err(|e| Error::local_io(&path, e))?;
        Ok(self.bytes_written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{BackendCall, FaultKind, MemoryBackend};
    use crate::retry::RetryPolicy;
    use std::time::Duration;

    fn transfer(backend: &MemoryBackend) -> DataTransfer<MemoryBackend> {
        DataTransfer::new(backend.clone())
    }

    #[test]
    fn test_classify_wraps_transport_errors() {
        let transfer = transfer(&MemoryBackend::new());
        let err = transfer.remote_read(
            Operation::GetData,
            "reports/q1.csv",
            Error::Status {
                status: 500,
                message: "boom".to_string(),
            },
        );
        match err {
            Error::RemoteRead {
                operation, target, ..
            } => {
                assert_eq!(operation, Operation::GetData);
                assert_eq!(target, "reports/q1.csv");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_flush_partial_reports_success() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("partial.bin");
        let mut file = open_destination(&path, false).await.unwrap();
        file.write_all(b"first half").await.unwrap();

        assert!(flush_partial(&mut file, &path).await);
        assert_eq!(std::fs::read(&path).unwrap(), b"first half");
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_flush_partial_reports_failure() {
        // Writes to /dev/full are accepted into tokio's buffer and fail on flush
        let path = Path::new("/dev/full");
        let mut file = OpenOptions::new().write(true).open(path).await.unwrap();
        file.write_all(b"does not fit").await.unwrap();

        assert!(!flush_partial(&mut file, path).await);
    }

    #[test]
    fn test_classify_keeps_domain_errors() {
        let transfer = transfer(&MemoryBackend::new());
        let err = transfer.remote_write(
            Operation::PutData,
            "reports",
            Error::ContainerNotFound("reports".to_string()),
        );
        assert!(matches!(err, Error::ContainerNotFound(_)));

        let err = transfer.remote_write(Operation::PutData, "reports", Error::Token("expired".to_string()));
        assert!(matches!(err, Error::Authentication { .. }));
    }

    #[test]
    fn test_partial_or_remote() {
        let cause = || Error::Status {
            status: 503,
            message: String::new(),
        };
        let path = Path::new("/tmp/out.bin");
        assert!(matches!(partial_or_remote(path, 0, 0, cause()), Error::Status { .. }));
        assert!(matches!(
            partial_or_remote(path, 1, 10, cause()),
            Error::PartialDownload {
                objects_written: 1,
                bytes_written: 10,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_get_data_interrupted_stream_is_partial() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out.csv");
        let backend = MemoryBackend::new().with_chunk_size(2);
        backend.insert_object("reports", "q1.csv", "abcdef");
        backend.inject_fault_for_key(BackendCall::Download, "q1.csv", FaultKind::Interrupted);

        let err = transfer(&backend)
            .get_data("reports", "q1.csv", &out, false)
            .await
            .unwrap_err();

        match err {
            Error::PartialDownload {
                path,
                bytes_written,
                source,
                ..
            } => {
                assert_eq!(path, out);
                assert_eq!(bytes_written, 2);
                assert!(matches!(*source, Error::RemoteRead { .. }));
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(std::fs::read(&out).unwrap(), b"ab");
    }

    #[tokio::test]
    async fn test_retry_covers_download_start() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out.csv");
        let backend = MemoryBackend::new();
        backend.insert_object("reports", "q1.csv", "a,b");
        backend.inject_fault(BackendCall::Download, FaultKind::Transient);

        let transfer = DataTransfer::with_config(
            backend.clone(),
            TransferConfig::default().with_retry(
                RetryPolicy::exponential(2)
                    .with_backoff(Duration::from_millis(1), Duration::from_millis(2)),
            ),
        );
        transfer
            .get_data("reports", "q1.csv", &out, false)
            .await
            .unwrap();

        assert_eq!(backend.call_count(BackendCall::Download), 2);
        assert_eq!(std::fs::read(&out).unwrap(), b"a,b");
    }

    #[tokio::test]
    async fn test_atomic_get_all_leaves_no_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("all.csv");
        let backend = MemoryBackend::new();
        backend.insert_object("reports", "a", "1");
        backend.insert_object("reports", "b", "2");
        backend.inject_fault_for_key(BackendCall::Download, "b", FaultKind::Permanent);

        assert!(transfer(&backend).get_all_data("reports", &out).await.is_err());

        let leftovers: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert!(leftovers.is_empty());
    }
}
