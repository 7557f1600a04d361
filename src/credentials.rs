//! Credential bundles and their resolution against the process environment.
//!
//! Every field resolves in the same order: the explicit bundle value, then the
//! environment variable(s) of the same meaning, then absent. Empty strings are
//! treated as absent at every step.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Source of environment variables
pub trait Environment: Send + Sync {
    fn var(&self, name: &str) -> Option<String>;
}

/// The real process environment
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessEnv;

impl Environment for ProcessEnv {
    fn var(&self, name: &str) -> Option<String> {
        std::env::var(name).ok()
    }
}

impl Environment for HashMap<String, String> {
    fn var(&self, name: &str) -> Option<String> {
        self.get(name).cloned()
    }
}

/// Named credential and connection settings understood by the backends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CredentialField {
    Region,
    AccessKeyId,
    SecretAccessKey,
    SessionToken,
    Endpoint,
    EmulatorHost,
    ConnectionString,
    AccountUrl,
    SasToken,
    TenantId,
    ClientId,
    ClientSecret,
    AuthorityHost,
    CredentialsFile,
    ProjectId,
    AuthHost,
    AuthToken,
    Alias,
}

impl CredentialField {
    /// Canonical key inside a bundle
    pub fn name(&self) -> &'static str {
        match self {
            CredentialField::Region => "region",
            CredentialField::AccessKeyId => "access_key_id",
            CredentialField::SecretAccessKey => "secret_access_key",
            CredentialField::SessionToken => "session_token",
            CredentialField::Endpoint => "endpoint",
            CredentialField::EmulatorHost => "emulator_host",
            CredentialField::ConnectionString => "connection_string",
            CredentialField::AccountUrl => "account_url",
            CredentialField::SasToken => "sas_token",
            CredentialField::TenantId => "tenant_id",
            CredentialField::ClientId => "client_id",
            CredentialField::ClientSecret => "client_secret",
            CredentialField::AuthorityHost => "authority_host",
            CredentialField::CredentialsFile => "credentials_file",
            CredentialField::ProjectId => "project_id",
            CredentialField::AuthHost => "auth_host",
            CredentialField::AuthToken => "auth_token",
            CredentialField::Alias => "alias",
        }
    }

    /// Environment variables consulted, in order, when the bundle has no value.
    /// The same names are also accepted as bundle keys.
    pub fn env_vars(&self) -> &'static [&'static str] {
        match self {
            CredentialField::Region => &["AWS_REGION", "AWS_DEFAULT_REGION"],
            CredentialField::AccessKeyId => &["AWS_ACCESS_KEY_ID"],
            CredentialField::SecretAccessKey => &["AWS_SECRET_ACCESS_KEY"],
            CredentialField::SessionToken => &["AWS_SESSION_TOKEN"],
            CredentialField::Endpoint => &["AWS_ENDPOINT_URL"],
            CredentialField::EmulatorHost => &["STORAGE_EMULATOR_HOST"],
            CredentialField::ConnectionString => &["AZURE_STORAGE_CONNECTION_STRING"],
            CredentialField::AccountUrl => &["AZURE_STORAGE_ACCOUNT_URL"],
            CredentialField::SasToken => &["AZURE_STORAGE_SAS_TOKEN"],
            CredentialField::TenantId => &["AZURE_TENANT_ID"],
            CredentialField::ClientId => &["AZURE_CLIENT_ID"],
            CredentialField::ClientSecret => &["AZURE_CLIENT_SECRET"],
            CredentialField::AuthorityHost => &["AZURE_AUTHORITY_HOST"],
            CredentialField::CredentialsFile => &["GOOGLE_APPLICATION_CREDENTIALS"],
            CredentialField::ProjectId => &["GOOGLE_CLOUD_PROJECT", "GCLOUD_PROJECT"],
            CredentialField::AuthHost => &["DATAVERSE_HOST"],
            CredentialField::AuthToken => &["DATAVERSE_TOKEN"],
            CredentialField::Alias => &["DATAVERSE_ALIAS"],
        }
    }
}

/// Caller-supplied authentication material for one backend
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CredentialBundle {
    values: HashMap<String, String>,
}

impl CredentialBundle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a field by its canonical name
    pub fn with(mut self, field: CredentialField, value: impl Into<String>) -> Self {
        self.values.insert(field.name().to_string(), value.into());
        self
    }

    /// Set an arbitrary key, e.g. an environment-style name like `AWS_REGION`
    pub fn with_value(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }

    /// True when the bundle carries no non-empty value at all
    pub fn is_empty(&self) -> bool {
        self.values.values().all(|v| v.is_empty())
    }

    /// Value present in the bundle itself, ignoring the environment
    pub fn explicit(&self, field: CredentialField) -> Option<String> {
        std::iter::once(field.name())
            .chain(field.env_vars().iter().copied())
            .filter_map(|key| self.values.get(key))
            .find(|v| !v.is_empty())
            .cloned()
    }

    /// Bundle value, else environment, else `None`
    pub fn resolve(&self, field: CredentialField, env: &dyn Environment) -> Option<String> {
        self.explicit(field).or_else(|| {
            field
                .env_vars()
                .iter()
                .filter_map(|name| env.var(name))
                .find(|v| !v.is_empty())
        })
    }
}

impl From<HashMap<String, String>> for CredentialBundle {
    fn from(values: HashMap<String, String>) -> Self {
        Self { values }
    }
}
