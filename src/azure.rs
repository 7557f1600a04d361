//! Azure Blob Storage backend.
//!
//! Blob reads, writes, and listings go through `object_store`'s Azure client.
//! Entra ID tokens come from `azure_identity`. Listing and creating containers
//! are account-level calls `object_store` does not offer; those two requests
//! are made directly against the Blob service REST API with the same
//! credentials (SharedKey signature, SAS query string, or bearer token).

use crate::backend::StorageBackend;
use crate::config::HttpOptions;
use crate::credentials::{CredentialBundle, CredentialField, Environment};
use crate::error::{Error, Result};
use crate::http::{canonical_query, check_status, error_body};
use crate::signing::hmac_sha256;
use crate::store::{self, StoreCache};
use crate::types::{BackendKind, ByteSource, ByteStream};
use crate::xml;
use async_trait::async_trait;
use azure_core::auth::TokenCredential;
use azure_identity::{ClientSecretCredential, DefaultAzureCredentialBuilder};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use object_store::azure::{AzureCredential, MicrosoftAzureBuilder};
use object_store::{CredentialProvider, ObjectStore};
use reqwest::header::CONTENT_LENGTH;
use reqwest::{Client, Method, Response, StatusCode};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;
use url::Url;

const API_VERSION: &str = "2021-08-06";
const STORAGE_SCOPE: &str = "https://storage.azure.com/.default";
const DEFAULT_AUTHORITY: &str = "https://login.microsoftonline.com";

const DEV_ACCOUNT: &str = "devstoreaccount1";
const DEV_ACCOUNT_KEY: &str =
    "Eby8vdM02xNOcqFlqUwJPLlmEtlCDXJ1OUzFT50uSRZ6IFsuFq2UVErCz4I6tq/K1SZFPTOtr/KBHBeksoGMGw==";
const DEV_BLOB_ENDPOINT: &str = "http://127.0.0.1:10000/devstoreaccount1";

/// Fields of an Azure Storage connection string the client uses
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ConnectionString {
    pub account_name: String,
    pub account_key: Option<String>,
    pub sas_token: Option<String>,
    pub blob_endpoint: String,
}

impl ConnectionString {
    pub(crate) fn parse(raw: &str) -> Result<Self> {
        let mut fields = BTreeMap::new();
        for part in raw.split(';').map(str::trim).filter(|p| !p.is_empty()) {
            let (name, value) = part.split_once('=').ok_or_else(|| {
                Error::Configuration(format!("malformed connection string segment '{}'", part))
            })?;
            fields.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
        }

        let field = |name: &str| fields.get(name).filter(|v| !v.is_empty()).cloned();

        if field("usedevelopmentstorage").is_some_and(|v| v.eq_ignore_ascii_case("true")) {
            return Ok(Self {
                account_name: DEV_ACCOUNT.to_string(),
                account_key: Some(DEV_ACCOUNT_KEY.to_string()),
                sas_token: None,
                blob_endpoint: field("blobendpoint").unwrap_or_else(|| DEV_BLOB_ENDPOINT.to_string()),
            });
        }

        let blob_endpoint = field("blobendpoint");
        let account_name = match (field("accountname"), blob_endpoint.as_deref()) {
            (Some(name), _) => name,
            (None, Some(endpoint)) => account_from_url(endpoint)?,
            (None, None) => {
                return Err(Error::Configuration(
                    "connection string has neither AccountName nor BlobEndpoint".to_string(),
                ))
            }
        };

        let blob_endpoint = blob_endpoint.unwrap_or_else(|| {
            format!(
                "{}://{}.blob.{}",
                field("defaultendpointsprotocol").unwrap_or_else(|| "https".to_string()),
                account_name,
                field("endpointsuffix").unwrap_or_else(|| "core.windows.net".to_string())
            )
        });

        let parsed = Self {
            account_name,
            account_key: field("accountkey"),
            sas_token: field("sharedaccesssignature"),
            blob_endpoint,
        };
        if parsed.account_key.is_none() && parsed.sas_token.is_none() {
            return Err(Error::Authentication {
                backend: BackendKind::Azure,
                message: "connection string has neither AccountKey nor SharedAccessSignature"
                    .to_string(),
            });
        }
        Ok(parsed)
    }
}

/// Storage account name: the first label of the blob endpoint host
fn account_from_url(endpoint: &str) -> Result<String> {
    let url = Url::parse(endpoint)?;
    url.host_str()
        .and_then(|host| host.split('.').next())
        .filter(|label| !label.is_empty())
        .map(str::to_string)
        .ok_or_else(|| Error::Configuration(format!("no account name in '{}'", endpoint)))
}


/// Where an Entra ID token comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IdentitySource {
    ClientSecret,
    /// Environment, workload identity, or managed identity
    Ambient,
}

#[derive(Clone)]
enum AzureAuth {
    SharedKey {
        key: Vec<u8>,
        encoded: String,
    },
    Sas(String),
    Identity {
        credential: Arc<dyn TokenCredential>,
        source: IdentitySource,
    },
}

impl AzureAuth {
    fn shared_key(encoded: String) -> Result<Self> {
        let key = STANDARD
            .decode(encoded.as_bytes())
            .map_err(|e| Error::Authentication {
                backend: BackendKind::Azure,
                message: format!("AccountKey is not valid base64: {}", e),
            })?;
        Ok(AzureAuth::SharedKey { key, encoded })
    }

    fn describe(&self) -> &'static str {
        match self {
            AzureAuth::SharedKey { .. } => "shared key",
            AzureAuth::Sas(_) => "SAS token",
            AzureAuth::Identity {
                source: IdentitySource::ClientSecret,
                ..
            } => "client secret",
            AzureAuth::Identity {
                source: IdentitySource::Ambient,
                ..
            } => "ambient identity",
        }
    }
}

/// Hands `azure_identity` tokens to the `object_store` client
#[derive(Clone)]
struct IdentityCredential(Arc<dyn TokenCredential>);

impl std::fmt::Debug for IdentityCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("IdentityCredential")
    }
}

#[async_trait]
impl CredentialProvider for IdentityCredential {
    type Credential = AzureCredential;

    async fn get_credential(&self) -> object_store::Result<Arc<AzureCredential>> {
        let token = self
            .0
            .get_token(&[STORAGE_SCOPE])
            .await
            .map_err(|e| object_store::Error::Generic {
                store: "MicrosoftAzure",
                source: Box::new(e),
            })?;
        Ok(Arc::new(AzureCredential::BearerToken(
            token.token.secret().to_string(),
        )))
    }
}

/// Azure Blob Storage client handle
#[derive(Clone)]
pub struct AzureBlobClient {
    client: Client,
    http: HttpOptions,
    base_url: Url,
    account: String,
    auth: AzureAuth,
    stores: Arc<StoreCache>,
}

impl std::fmt::Debug for AzureBlobClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AzureBlobClient")
            .field("base_url", &self.base_url.as_str())
            .field("account", &self.account)
            .field("auth", &self.auth.describe())
            .finish_non_exhaustive()
    }
}

impl AzureBlobClient {
    /// Build a client from a connection string, or from an account URL plus
    /// an Entra ID identity.
    pub fn connect(
        bundle: &CredentialBundle,
        account_url: Option<&str>,
        env: &dyn Environment,
        http: &HttpOptions,
    ) -> Result<Self> {
        let client = http.build_client()?;

        if let Some(raw) = bundle.resolve(CredentialField::ConnectionString, env) {
            let parsed = ConnectionString::parse(&raw)?;
            let auth = match (parsed.account_key, parsed.sas_token) {
                (Some(key), _) => AzureAuth::shared_key(key)?,
                (None, Some(sas)) => AzureAuth::Sas(sas.trim_start_matches('?').to_string()),
                (None, None) => {
                    return Err(Error::Authentication {
                        backend: BackendKind::Azure,
                        message: "connection string carries no secret".to_string(),
                    })
                }
            };
            debug!(account = %parsed.account_name, auth = auth.describe(), "Azure client from connection string");
            return Ok(Self {
                client,
                http: http.clone(),
                base_url: Url::parse(parsed.blob_endpoint.trim_end_matches('/'))?,
                account: parsed.account_name,
                auth,
                stores: Arc::default(),
            });
        }

        let account_url = account_url
            .map(str::to_string)
            .or_else(|| bundle.resolve(CredentialField::AccountUrl, env))
            .ok_or_else(|| {
                Error::Configuration(
                    "Azure requires a connection string or an account URL".to_string(),
                )
            })?;

        let auth = if let Some(sas) = bundle.resolve(CredentialField::SasToken, env) {
            AzureAuth::Sas(sas.trim_start_matches('?').to_string())
        } else {
            let tenant_id = bundle.resolve(CredentialField::TenantId, env);
            let client_id = bundle.resolve(CredentialField::ClientId, env);
            let client_secret = bundle.resolve(CredentialField::ClientSecret, env);
            match (tenant_id, client_id, client_secret) {
                (Some(tenant_id), Some(client_id), Some(client_secret)) => {
                    let authority = bundle
                        .resolve(CredentialField::AuthorityHost, env)
                        .unwrap_or_else(|| DEFAULT_AUTHORITY.to_string());
                    AzureAuth::Identity {
                        credential: Arc::new(ClientSecretCredential::new(
                            azure_core::new_http_client(),
                            azure_core::Url::parse(&authority)?,
                            tenant_id,
                            client_id,
                            client_secret,
                        )),
                        source: IdentitySource::ClientSecret,
                    }
                }
                (_, _, None) => {
                    let credential = DefaultAzureCredentialBuilder::new()
                        .exclude_azure_cli_credential()
                        .build()
                        .map_err(|e| Error::Authentication {
                            backend: BackendKind::Azure,
                            message: e.to_string(),
                        })?;
                    AzureAuth::Identity {
                        credential: Arc::new(credential),
                        source: IdentitySource::Ambient,
                    }
                }
                (_, _, Some(_)) => {
                    return Err(Error::Authentication {
                        backend: BackendKind::Azure,
                        message: "client secret resolved without tenant and client ids"
                            .to_string(),
                    })
                }
            }
        };

        debug!(account_url = %account_url, auth = auth.describe(), "Azure client from account URL");
        Ok(Self {
            client,
            http: http.clone(),
            account: account_from_url(&account_url)?,
            base_url: Url::parse(account_url.trim_end_matches('/'))?,
            auth,
            stores: Arc::default(),
        })
    }

    pub fn account(&self) -> &str {
        &self.account
    }

    /// The `object_store` handle for one container
    fn store(&self, container: &str) -> Result<Arc<dyn ObjectStore>> {
        self.stores.get_or_build(container, || {
            let builder = MicrosoftAzureBuilder::new()
                .with_account(&self.account)
                .with_container_name(container)
                .with_endpoint(self.base_url.as_str().trim_end_matches('/').to_string())
                .with_allow_http(self.base_url.scheme() == "http")
                .with_client_options(self.http.client_options())
                .with_retry(self.http.retry_config());

            let builder = match &self.auth {
                AzureAuth::SharedKey { encoded, .. } => builder.with_access_key(encoded),
                AzureAuth::Sas(sas) => builder.with_sas_authorization(
                    url::form_urlencoded::parse(sas.as_bytes())
                        .into_owned()
                        .collect::<Vec<_>>(),
                ),
                AzureAuth::Identity { credential, .. } => {
                    builder.with_credentials(Arc::new(IdentityCredential(Arc::clone(credential))))
                }
            };
            Ok(Arc::new(builder.build()?) as Arc<dyn ObjectStore>)
        })
    }

    fn store_error(&self, err: object_store::Error, container: &str, key: Option<&str>) -> Error {
        store::store_error(err, BackendKind::Azure, container, key)
    }

    /// Account-level path (`/` or `/{container}`) under the endpoint's own prefix
    fn resource_path(&self, container: Option<&str>) -> String {
        let mut path = self.base_url.path().trim_end_matches('/').to_string();
        path.push('/');
        if let Some(container) = container {
            path.push_str(&urlencoding::encode(container));
        }
        path
    }

    async fn bearer_token(&self, credential: &dyn TokenCredential) -> Result<String> {
        let token = credential
            .get_token(&[STORAGE_SCOPE])
            .await
            .map_err(|e| Error::Token(e.to_string()))?;
        Ok(token.token.secret().to_string())
    }

    /// Send a container-level request (list containers, create container)
    async fn send(
        &self,
        method: Method,
        container: Option<&str>,
        query: &[(&str, &str)],
    ) -> Result<Response> {
        let path = self.resource_path(container);
        let mut query_string = canonical_query(query);
        if let AzureAuth::Sas(sas) = &self.auth {
            if !query_string.is_empty() {
                query_string.push('&');
            }
            query_string.push_str(sas);
        }

        let mut ms_headers = BTreeMap::new();
        ms_headers.insert("x-ms-date".to_string(), rfc1123(Utc::now()));
        ms_headers.insert("x-ms-version".to_string(), API_VERSION.to_string());

        let authorization = match &self.auth {
            AzureAuth::SharedKey { key, .. } => {
                let to_sign =
                    string_to_sign(method.as_str(), 0, &ms_headers, &self.account, &path, query);
                Some(format!(
                    "SharedKey {}:{}",
                    self.account,
                    shared_key_signature(key, &to_sign)?
                ))
            }
            AzureAuth::Sas(_) => None,
            AzureAuth::Identity { credential, .. } => Some(format!(
                "Bearer {}",
                self.bearer_token(credential.as_ref()).await?
            )),
        };

        let mut url = format!("{}{}", origin(&self.base_url), path);
        if !query_string.is_empty() {
            url.push('?');
            url.push_str(&query_string);
        }

        debug!(method = %method, path = %path, "Azure request");

        let mut request = self.client.request(method.clone(), &url);
        for (name, value) in &ms_headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if let Some(authorization) = authorization {
            request = request.header("authorization", authorization);
        }
        if method == Method::PUT {
            request = request.header(CONTENT_LENGTH, 0u64);
        }

        Ok(request.send().await?)
    }
}

#[async_trait]
impl StorageBackend for AzureBlobClient {
    fn kind(&self) -> BackendKind {
        BackendKind::Azure
    }

    async fn list_containers(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let mut marker: Option<String> = None;

        loop {
            let mut query = vec![("comp", "list")];
            if let Some(marker) = marker.as_deref() {
                query.push(("marker", marker));
            }

            let response = self.send(Method::GET, None, &query).await?;
            let body = check_status(response, BackendKind::Azure)
                .await?
                .text()
                .await?;

            names.extend(xml::child_texts(&body, "Container", "Name"));
            match xml::first_text(&body, "NextMarker") {
                Some(next) if !next.is_empty() => marker = Some(next),
                _ => break,
            }
        }

        Ok(names)
    }

    async fn create_container(&self, name: &str) -> Result<()> {
        let response = self
            .send(Method::PUT, Some(name), &[("restype", "container")])
            .await?;
        if response.status() == StatusCode::CONFLICT {
            let body = error_body(response).await;
            debug!(container = name, body = %body, "Azure container exists");
            return Err(Error::ContainerConflict(name.to_string()));
        }
        check_status(response, BackendKind::Azure).await?;

        debug!(container = name, "Azure container created");
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

        debug!(container = container, blob = key, bytes = source.len(), "Azure upload complete");
        Ok(())
    }

    async fn download(&self, container: &str, key: &str) -> Result<ByteStream> {
        let store = self.store(container)?;
        let result = store::download(store.as_ref(), BackendKind::Azure, container, key).await;
        if let Err(Error::ObjectNotFound { .. }) = &result {
            if matches!(self.container_exists(container).await, Ok(false)) {
                return Err(Error::ContainerNotFound(container.to_string()));
            }
        }
        result
    }
}

/// `scheme://host[:port]` of a URL
fn origin(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default();
    match url.port() {
        Some(port) => format!("{}://{}:{}", url.scheme(), host, port),
        None => format!("{}://{}", url.scheme(), host),
    }
}

fn rfc1123(now: DateTime<Utc>) -> String {
    now.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// SharedKey string-to-sign for a request without standard optional headers
/// other than `Content-Length`
pub(crate) fn string_to_sign(
    method: &str,
    content_length: u64,
    ms_headers: &BTreeMap<String, String>,
    account: &str,
    path: &str,
    query: &[(&str, &str)],
) -> String {
    let length = if content_length == 0 {
        String::new()
    } else {
        content_length.to_string()
    };

    // Content-Encoding, Content-Language, Content-Length, Content-MD5,
    // Content-Type, Date, If-Modified-Since, If-Match, If-None-Match,
    // If-Unmodified-Since, Range
    let standard = ["", "", length.as_str(), "", "", "", "", "", "", "", ""];

    let mut out = String::from(method);
    out.push('\n');
    for value in standard {
        out.push_str(value);
        out.push('\n');
    }
    for (name, value) in ms_headers {
        out.push_str(&name.to_ascii_lowercase());
        out.push(':');
        out.push_str(value.trim());
        out.push('\n');
    }

    out.push('/');
    out.push_str(account);
    out.push_str(path);

    let mut params: BTreeMap<String, Vec<&str>> = BTreeMap::new();
    for (name, value) in query {
        params.entry(name.to_ascii_lowercase()).or_default().push(*value);
    }
    for (name, mut values) in params {
        values.sort_unstable();
        out.push('\n');
        out.push_str(&name);
        out.push(':');
        out.push_str(&values.join(","));
    }
    out
}

pub(crate) fn shared_key_signature(key: &[u8], string_to_sign: &str) -> Result<String> {
    Ok(STANDARD.encode(hmac_sha256(key, string_to_sign.as_bytes())?))
}
