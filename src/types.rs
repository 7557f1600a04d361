use crate::error::{Error, Result};
use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use tokio_util::io::ReaderStream;

/// Stream of object bytes returned by a backend download
pub type ByteStream = BoxStream<'static, Result<Bytes>>;

/// Supported storage backends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    S3,
    Azure,
    Gcs,
    Dataverse,
    Memory,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::S3 => "s3",
            BackendKind::Azure => "azure",
            BackendKind::Gcs => "gcs",
            BackendKind::Dataverse => "dataverse",
            BackendKind::Memory => "memory",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operations exposed by the transfer facade and the backend capability set
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    CreateContainer,
    PutData,
    GetData,
    GetAllData,
    ListContainers,
    ListObjects,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::CreateContainer => "create_container",
            Operation::PutData => "put_data",
            Operation::GetData => "get_data",
            Operation::GetAllData => "get_all_data",
            Operation::ListContainers => "list_containers",
            Operation::ListObjects => "list_objects",
        };
        f.write_str(name)
    }
}

/// A local file to be uploaded.
///
/// Construction checks that the path names a readable regular file, so an
/// upload never reaches the network for a missing source.
#[derive(Debug, Clone)]
pub struct ByteSource {
    path: PathBuf,
    len: u64,
}

impl ByteSource {
    /// Inspect `path` and capture its current length
    pub async fn from_path(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let meta = tokio::fs::metadata(&path)
            .await
            .map_err(|e| Error::local_io(&path, e))?;

        if !meta.is_file() {
            return Err(Error::local_io(
                &path,
                std::io::Error::new(std::io::ErrorKind::InvalidInput, "not a regular file"),
            ));
        }

        // Opening once up front surfaces permission problems before any remote call.
        tokio::fs::File::open(&path)
            .await
            .map_err(|e| Error::local_io(&path, e))?;

        Ok(Self {
            path,
            len: meta.len(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Open the file as a chunked byte stream
    pub async fn open(&self) -> Result<ByteStream> {
        let file = tokio::fs::File::open(&self.path)
            .await
            .map_err(|e| Error::local_io(&self.path, e))?;
        let path = self.path.clone();

        Ok(ReaderStream::new(file)
            .map_err(move |e| Error::local_io(&path, e))
            .boxed())
    }

    /// Read the whole file into memory
    pub async fn read_all(&self) -> Result<Bytes> {
        tokio::fs::read(&self.path)
            .await
            .map(Bytes::from)
            .map_err(|e| Error::local_io(&self.path, e))
    }
}

/// Result of a successful `put_data`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutOutcome {
    pub container: String,
    pub key: String,
    pub bytes: u64,
    /// Whether this call created the container
    pub container_created: bool,
}

/// Result of a successful `get_data`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetOutcome {
    pub container: String,
    pub key: String,
    pub path: PathBuf,
    pub bytes: u64,
    pub appended: bool,
}

/// Result of a successful `get_all_data`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetAllOutcome {
    pub container: String,
    pub path: PathBuf,
    /// Keys in the order their bytes were written
    pub objects: Vec<String>,
    pub bytes: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_kind_serialization() {
        assert_eq!(serde_json::to_string(&BackendKind::S3).unwrap(), "\"s3\"");
        let kind: BackendKind = serde_json::from_str("\"dataverse\"").unwrap();
        assert_eq!(kind, BackendKind::Dataverse);
    }

    #[test]
    fn test_operation_display() {
        assert_eq!(Operation::GetAllData.to_string(), "get_all_data");
        assert_eq!(Operation::CreateContainer.to_string(), "create_container");
    }

    #[tokio::test]
    async fn test_byte_source_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = ByteSource::from_path(dir.path().join("absent.csv"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::LocalIo { .. }));
    }

    #[tokio::test]
    async fn test_byte_source_rejects_directory() {
        let dir = tempfile::tempdir().unwrap();
        let err = ByteSource::from_path(dir.path()).await.unwrap_err();
        assert!(matches!(err, Error::LocalIo { .. }));
    }

    #[tokio::test]
    async fn test_byte_source_stream_matches_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        std::fs::write(&path, b"hello world").unwrap();

        let source = ByteSource::from_path(&path).await.unwrap();
        assert_eq!(source.len(), 11);

        let chunks: Vec<Bytes> = source.open().await.unwrap().try_collect().await.unwrap();
        assert_eq!(chunks.concat(), b"hello world");
        assert_eq!(source.read_all().await.unwrap(), Bytes::from("hello world"));
    }
}
