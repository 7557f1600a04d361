use crate::credentials::{CredentialBundle, CredentialField};
use crate::dataverse::DataverseOptions;
use crate::error::{Error, Result};
use crate::gcs::GcsOptions;
use crate::retry::RetryPolicy;
use crate::types::BackendKind;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// HTTP client settings shared by every remote backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpOptions {
    /// Whole-request timeout, including the body transfer
    pub timeout_secs: u64,
    pub connect_timeout_secs: u64,
    /// Retries the SDK clients (aws-sdk-s3, object_store) make on their own
    /// for transient failures, before the transfer policy sees the error
    pub max_retries: u32,
}

impl Default for HttpOptions {
    fn default() -> Self {
        Self {
            timeout_secs: 300,
            connect_timeout_secs: 30,
            max_retries: 0,
        }
    }
}

/// How `get_all_data` treats the destination file
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GetAllMode {
    /// Write to a temporary file beside the destination and rename it over the
    /// destination only after every object was written.
    #[default]
    Atomic,
    /// Write straight into the destination. A failure leaves the objects
    /// written so far and is reported as `Error::PartialDownload`.
    Incremental,
}

/// Behavior of the transfer facade
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    pub retry: RetryPolicy,
    pub get_all_mode: GetAllMode,
    /// Objects fetched at once by `get_all_data`; bytes are still written in
    /// listing order. `1` streams each object straight to disk.
    pub download_concurrency: usize,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            get_all_mode: GetAllMode::default(),
            download_concurrency: 1,
        }
    }
}

impl TransferConfig {
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_get_all_mode(mut self, mode: GetAllMode) -> Self {
        self.get_all_mode = mode;
        self
    }

    pub fn with_download_concurrency(mut self, concurrency: usize) -> Self {
        self.download_concurrency = concurrency.max(1);
        self
    }
}

/// Everything the connection factory needs to build one backend handle
///
/// # Examples
///
/// ```
/// use objstore_bridge::{BackendConfig, CredentialField};
///
/// let config = BackendConfig::s3()
///     .with_credential(CredentialField::Region, "us-east-1")
///     .with_credential(CredentialField::AccessKeyId, "ACCESS_KEY")
///     .with_credential(CredentialField::SecretAccessKey, "SECRET_KEY");
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendConfig {
    #[serde(rename = "type")]
    pub backend: BackendKind,

    #[serde(default)]
    pub credentials: CredentialBundle,

    /// Azure account URL used when no connection string resolves
    #[serde(default)]
    pub account_url: Option<String>,

    #[serde(default)]
    pub http: HttpOptions,

    #[serde(default)]
    pub gcs: GcsOptions,

    #[serde(default)]
    pub dataverse: DataverseOptions,
}

impl BackendConfig {
    pub fn new(backend: BackendKind) -> Self {
        Self {
            backend,
            credentials: CredentialBundle::default(),
            account_url: None,
            http: HttpOptions::default(),
            gcs: GcsOptions::default(),
            dataverse: DataverseOptions::default(),
        }
    }

    pub fn s3() -> Self {
        Self::new(BackendKind::S3)
    }

    pub fn azure() -> Self {
        Self::new(BackendKind::Azure)
    }

    pub fn gcs() -> Self {
        Self::new(BackendKind::Gcs)
    }

    pub fn dataverse() -> Self {
        Self::new(BackendKind::Dataverse)
    }

    pub fn memory() -> Self {
        Self::new(BackendKind::Memory)
    }

    pub fn with_credential(mut self, field: CredentialField, value: impl Into<String>) -> Self {
        self.credentials = self.credentials.with(field, value);
        self
    }

    pub fn with_credentials(mut self, credentials: CredentialBundle) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn with_account_url(mut self, account_url: impl Into<String>) -> Self {
        self.account_url = Some(account_url.into());
        self
    }

    pub fn with_http(mut self, http: HttpOptions) -> Self {
        self.http = http;
        self
    }
}

/// Top-level configuration document: one backend plus facade behavior
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub backend: BackendConfig,
    #[serde(default)]
    pub transfer: TransferConfig,
}

impl Config {
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents =
            std::fs::read_to_string(path).map_err(|e| Error::local_io(path, e))?;
        serde_json::from_str(&contents).map_err(|e| {
            Error::Configuration(format!("invalid config {}: {}", path.display(), e))
        })
    }
}
