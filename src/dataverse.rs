//! Dataverse backend over the native API.
//!
//! Dataverse has no flat bucket namespace, so the mapping is:
//! container = sub-collection (by alias) under the configured parent
//! collection, object = data file (by label) in one of that collection's
//! datasets. Every new object gets its own dataset, titled with the key.

use crate::backend::StorageBackend;
use crate::config::HttpOptions;
use crate::credentials::{CredentialBundle, CredentialField, Environment};
use crate::error::{Error, Result};
use crate::http::{body_stream, check_status, error_body, file_body, normalize_base_url};
use crate::types::{BackendKind, ByteSource, ByteStream};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{StreamExt, TryStreamExt};
use reqwest::multipart::{Form, Part};
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

const API_KEY_HEADER: &str = "X-Dataverse-key";
const DEFAULT_PARENT: &str = ":root";

/// Metadata used when the backend creates collections and datasets
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataverseOptions {
    /// Dataset author
    pub author: String,
    /// Contact address required by Dataverse for new collections and datasets
    pub contact_email: Option<String>,
    /// Citation subject (controlled vocabulary)
    pub subject: String,
    /// Rewrite tab-separated `.tab` downloads as comma-separated
    pub convert_tabular: bool,
}

impl Default for DataverseOptions {
    fn default() -> Self {
        Self {
            author: "Anonymous".to_string(),
            contact_email: None,
            subject: "Other".to_string(),
            convert_tabular: false,
        }
    }
}

#[derive(Deserialize)]
struct Envelope<T> {
    data: Option<T>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum ContentItem {
    Dataverse {
        id: u64,
    },
    Dataset {
        protocol: String,
        authority: String,
        identifier: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Deserialize)]
struct CollectionInfo {
    alias: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileEntry {
    label: String,
    #[serde(default)]
    directory_label: Option<String>,
    data_file: DataFile,
}

impl FileEntry {
    fn key(&self) -> String {
        match self.directory_label.as_deref().filter(|d| !d.is_empty()) {
            Some(dir) => format!("{}/{}", dir, self.label),
            None => self.label.clone(),
        }
    }
}

#[derive(Deserialize)]
struct DataFile {
    id: u64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreatedDataset {
    persistent_id: String,
}

/// Dataverse client handle
#[derive(Clone)]
pub struct DataverseClient {
    client: Client,
    base_url: String,
    token: String,
    parent: String,
    options: DataverseOptions,
}

impl std::fmt::Debug for DataverseClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataverseClient")
            .field("base_url", &self.base_url)
            .field("parent", &self.parent)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl DataverseClient {
    /// Build a client for `auth_host` authenticated with `auth_token`
    pub fn connect(
        bundle: &CredentialBundle,
        env: &dyn Environment,
        http: &HttpOptions,
        options: DataverseOptions,
    ) -> Result<Self> {
        let host = bundle.resolve(CredentialField::AuthHost, env).ok_or_else(|| {
            Error::Configuration("Dataverse requires auth_host (or DATAVERSE_HOST)".to_string())
        })?;
        let token = bundle
            .resolve(CredentialField::AuthToken, env)
            .ok_or_else(|| Error::Authentication {
                backend: BackendKind::Dataverse,
                message: "no API token in bundle 'auth_token' or DATAVERSE_TOKEN".to_string(),
            })?;
        let parent = bundle
            .resolve(CredentialField::Alias, env)
            .unwrap_or_else(|| DEFAULT_PARENT.to_string());

        Ok(Self {
            client: http.build_client()?,
            base_url: normalize_base_url(&host),
            token,
            parent,
            options,
        })
    }

    pub fn parent_alias(&self) -> &str {
        &self.parent
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        debug!(method = %method, path = path, "Dataverse request");
        self.client
            .request(method, format!("{}{}", self.base_url, path))
            .header(API_KEY_HEADER, &self.token)
    }

    fn contact_email(&self) -> Result<&str> {
        self.options.contact_email.as_deref().ok_or_else(|| {
            Error::Configuration(
                "Dataverse collection and dataset creation need dataverse.contact_email"
                    .to_string(),
            )
        })
    }

    /// Parse a `{"status": ..., "data": ...}` envelope
    async fn read_data<T: DeserializeOwned>(response: reqwest::Response) -> Result<T> {
        let body = check_status(response, BackendKind::Dataverse)
            .await?
            .text()
            .await?;
        let envelope: Envelope<T> = serde_json::from_str(&body)?;
        envelope.data.ok_or_else(|| {
            Error::InvalidResponse(
                envelope
                    .message
                    .unwrap_or_else(|| "Dataverse response without data".to_string()),
            )
        })
    }

    /// Contents of a collection, or `None` when the collection does not exist
    async fn contents(&self, alias: &str) -> Result<Option<Vec<ContentItem>>> {
        let response = self
            .request(
                Method::GET,
                &format!("/api/dataverses/{}/contents", urlencoding::encode(alias)),
            )
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Ok(Some(Self::read_data(response).await?))
    }

    async fn dataset_files(&self, persistent_id: &str) -> Result<Vec<FileEntry>> {
        let response = self
            .request(Method::GET, "/api/datasets/:persistentId/versions/:latest/files")
            .query(&[("persistentId", persistent_id)])
            .send()
            .await?;
        Self::read_data(response).await
    }

    /// Every file in the collection's datasets, in listing order
    async fn collection_files(&self, container: &str) -> Result<Vec<FileEntry>> {
        let items = self
            .contents(container)
            .await?
            .ok_or_else(|| Error::ContainerNotFound(container.to_string()))?;

        let mut files = Vec::new();
        for item in items {
            if let ContentItem::Dataset {
                protocol,
                authority,
                identifier,
            } = item
            {
                let pid = format!("{}:{}/{}", protocol, authority, identifier);
                files.extend(self.dataset_files(&pid).await?);
            }
        }
        Ok(files)
    }

    async fn create_dataset(&self, container: &str, key: &str) -> Result<String> {
        let contact = self.contact_email()?;
        let primitive = |name: &str, value: &str| {
            json!({"typeName": name, "multiple": false, "typeClass": "primitive", "value": value})
        };
        let body = json!({
            "datasetVersion": {
                "metadataBlocks": {
                    "citation": {
                        "displayName": "Citation Metadata",
                        "fields": [
                            primitive("title", key),
                            {
                                "typeName": "author",
                                "multiple": true,
                                "typeClass": "compound",
                                "value": [{"authorName": primitive("authorName", &self.options.author)}]
                            },
                            {
                                "typeName": "datasetContact",
                                "multiple": true,
                                "typeClass": "compound",
                                "value": [{"datasetContactEmail": primitive("datasetContactEmail", contact)}]
                            },
                            {
                                "typeName": "dsDescription",
                                "multiple": true,
                                "typeClass": "compound",
                                "value": [{"dsDescriptionValue": primitive(
                                    "dsDescriptionValue",
                                    &format!("Output data for {}.", key)
                                )}]
                            },
                            {
                                "typeName": "subject",
                                "multiple": true,
                                "typeClass": "controlledVocabulary",
                                "value": [self.options.subject]
                            }
                        ]
                    }
                }
            }
        });

        let response = self
            .request(
                Method::POST,
                &format!("/api/dataverses/{}/datasets", urlencoding::encode(container)),
            )
            .json(&body)
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(Error::ContainerNotFound(container.to_string()));
        }
        let created: CreatedDataset = Self::read_data(response).await?;
        debug!(collection = container, dataset = %created.persistent_id, "Dataverse dataset created");
        Ok(created.persistent_id)
    }

    async fn add_file(&self, persistent_id: &str, key: &str, source: &ByteSource) -> Result<()> {
        let response = self
            .request(Method::POST, "/api/datasets/:persistentId/add")
            .query(&[("persistentId", persistent_id)])
            .multipart(self.file_form(key, source, false).await?)
            .send()
            .await?;
        check_status(response, BackendKind::Dataverse).await?;
        Ok(())
    }

    /// Delete the draft of a dataset whose file never arrived, so the next
    /// upload of the same key does not find an empty dataset titled with it
    async fn discard_dataset(&self, persistent_id: &str) {
        let outcome = match self
            .request(Method::DELETE, "/api/datasets/:persistentId/versions/:draft")
            .query(&[("persistentId", persistent_id)])
            .send()
            .await
        {
            Ok(response) => check_status(response, BackendKind::Dataverse).await.map(|_| ()),
            Err(e) => Err(e.into()),
        };
        match outcome {
            Ok(()) => debug!(dataset = persistent_id, "discarded empty Dataverse dataset"),
            Err(e) => warn!(
                dataset = persistent_id,
                error = %e,
                "file upload failed and the empty dataset could not be deleted"
            ),
        }
    }

    async fn file_form(&self, key: &str, source: &ByteSource, replace: bool) -> Result<Form> {
        let (directory, label) = match key.rsplit_once('/') {
            Some((dir, label)) => (Some(dir), label),
            None => (None, key),
        };

        let mut metadata = json!({ "tabIngest": false });
        if let Some(dir) = directory {
            metadata["directoryLabel"] = json!(dir);
        }
        if replace {
            metadata["forceReplace"] = json!(true);
        }

        let part = Part::stream_with_length(file_body(source).await?, source.len())
            .file_name(label.to_string())
            .mime_str("application/octet-stream")?;
        Ok(Form::new()
            .part("file", part)
            .text("jsonData", metadata.to_string()))
    }
}

/// Rewrite tab separators as commas
fn tab_to_csv(chunk: Bytes) -> Bytes {
    if !chunk.contains(&b'\t') {
        return chunk;
    }
    chunk
        .iter()
        .map(|b| if *b == b'\t' { b',' } else { *b })
        .collect::<Vec<u8>>()
        .into()
}

#[async_trait]
impl StorageBackend for DataverseClient {
    fn kind(&self) -> BackendKind {
        BackendKind::Dataverse
    }

    async fn list_containers(&self) -> Result<Vec<String>> {
        let items = self.contents(&self.parent).await?.ok_or_else(|| {
            Error::Configuration(format!("parent collection '{}' not found", self.parent))
        })?;

        let mut aliases = Vec::new();
        for item in items {
            if let ContentItem::Dataverse { id } = item {
                let response = self
                    .request(Method::GET, &format!("/api/dataverses/{}", id))
                    .send()
                    .await?;
                let info: CollectionInfo = Self::read_data(response).await?;
                aliases.push(info.alias);
            }
        }
        Ok(aliases)
    }

    async fn create_container(&self, name: &str) -> Result<()> {
        let existing = self
            .request(
                Method::GET,
                &format!("/api/dataverses/{}", urlencoding::encode(name)),
            )
            .send()
            .await?;
        if existing.status().is_success() {
            return Err(Error::ContainerConflict(name.to_string()));
        }

        let body = json!({
            "name": name,
            "alias": name,
            "dataverseContacts": [{"contactEmail": self.contact_email()?}],
            "dataverseType": "UNCATEGORIZED"
        });
        let response = self
            .request(
                Method::POST,
                &format!("/api/dataverses/{}", urlencoding::encode(&self.parent)),
            )
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::BAD_REQUEST || status == StatusCode::CONFLICT {
            let message = error_body(response).await;
            if message.contains("already exists") {
                return Err(Error::ContainerConflict(name.to_string()));
            }
            return Err(Error::Status {
                status: status.as_u16(),
                message,
            });
        }
        check_status(response, BackendKind::Dataverse).await?;

        debug!(collection = name, parent = %self.parent, "Dataverse collection created");
        Ok(())
    }

    async fn list_objects(&self, container: &str) -> Result<Vec<String>> {
        let mut keys: Vec<String> = Vec::new();
        for file in self.collection_files(container).await? {
            let key = file.key();
            if !keys.contains(&key) {
                keys.push(key);
            }
        }
        Ok(keys)
    }

    async fn upload(&self, container: &str, key: &str, source: &ByteSource) -> Result<()> {
        let existing = self
            .collection_files(container)
            .await?
            .into_iter()
            .find(|file| file.key() == key);

        let response = match existing {
            Some(file) => {
                debug!(collection = container, key = key, file_id = file.data_file.id, "replacing Dataverse file");
                self.request(
                    Method::POST,
                    &format!("/api/files/{}/replace", file.data_file.id),
                )
                .multipart(self.file_form(key, source, true).await?)
                .send()
                .await?
            }
            None => {
                let pid = self.create_dataset(container, key).await?;
                if let Err(e) = self.add_file(&pid, key, source).await {
                    self.discard_dataset(&pid).await;
                    return Err(e);
                }
                debug!(collection = container, key = key, bytes = source.len(), "Dataverse upload complete");
                return Ok(());
            }
        };
        check_status(response, BackendKind::Dataverse).await?;

        debug!(collection = container, key = key, bytes = source.len(), "Dataverse upload complete");
        Ok(())
    }

    async fn download(&self, container: &str, key: &str) -> Result<ByteStream> {
        let file = self
            .collection_files(container)
            .await?
            .into_iter()
            .find(|file| file.key() == key)
            .ok_or_else(|| Error::ObjectNotFound {
                container: container.to_string(),
                key: key.to_string(),
            })?;

        let response = self
            .request(
                Method::GET,
                &format!("/api/access/datafile/{}", file.data_file.id),
            )
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(Error::ObjectNotFound {
                container: container.to_string(),
                key: key.to_string(),
            });
        }
        let stream = body_stream(check_status(response, BackendKind::Dataverse).await?);

        if self.options.convert_tabular && key.ends_with(".tab") {
            debug!(key = key, "converting tabular download to CSV");
            return Ok(stream.map_ok(tab_to_csv).boxed());
        }
        Ok(stream)
    }
}
