//! S3-compatible backend.
//!
//! Built on the AWS SDK client. With a custom endpoint (MinIO and other
//! S3-compatible services) buckets are addressed path-style
//! (`{endpoint}/{bucket}/{key}`).

use crate::backend::StorageBackend;
use crate::config::HttpOptions;
use crate::credentials::{CredentialBundle, CredentialField, Environment};
use crate::error::{Error, Result};
use crate::types::{BackendKind, ByteSource, ByteStream};
use async_trait::async_trait;
use aws_config::retry::RetryConfig;
use aws_config::timeout::TimeoutConfig;
use aws_credential_types::Credentials;
use aws_sdk_s3::config::http::HttpResponse;
use aws_sdk_s3::config::{BehaviorVersion, Region};
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_s3::primitives::ByteStream as SdkBody;
use aws_sdk_s3::types::{BucketLocationConstraint, CreateBucketConfiguration};
use aws_sdk_s3::Client;
use futures::{StreamExt, TryStreamExt};
use std::time::Duration;
use tokio_util::io::ReaderStream;
use tracing::debug;

const DEFAULT_REGION: &str = "us-east-1";

/// S3 client handle
#[derive(Clone)]
pub struct S3Client {
    client: Client,
    region: String,
    endpoint: Option<String>,
    access_key_id: String,
}

impl std::fmt::Debug for S3Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Client")
            .field("region", &self.region)
            .field("endpoint", &self.endpoint)
            .field("access_key_id", &self.access_key_id)
            .finish_non_exhaustive()
    }
}

impl S3Client {
    /// Build a client from a credential bundle, falling back to the environment.
    ///
    /// Requires a region and an access key pair. A session token and a custom
    /// endpoint are optional.
    pub fn connect(
        bundle: &CredentialBundle,
        env: &dyn Environment,
        http: &HttpOptions,
    ) -> Result<Self> {
        let region = bundle.resolve(CredentialField::Region, env).ok_or_else(|| {
            Error::Configuration(
                "S3 requires a region (bundle 'region' or AWS_REGION)".to_string(),
            )
        })?;

        let access_key_id = bundle.resolve(CredentialField::AccessKeyId, env);
        let secret_access_key = bundle.resolve(CredentialField::SecretAccessKey, env);
        let (access_key_id, secret_access_key) = match (access_key_id, secret_access_key) {
            (Some(id), Some(secret)) => (id, secret),
            (Some(_), None) => {
                return Err(Error::Authentication {
                    backend: BackendKind::S3,
                    message: "access key id resolved without a secret access key".to_string(),
                })
            }
            (None, Some(_)) => {
                return Err(Error::Authentication {
                    backend: BackendKind::S3,
                    message: "secret access key resolved without an access key id".to_string(),
                })
            }
            (None, None) => {
                return Err(Error::Authentication {
                    backend: BackendKind::S3,
                    message: "no access key pair in bundle or environment".to_string(),
                })
            }
        };

        let endpoint = bundle
            .resolve(CredentialField::Endpoint, env)
            .map(|e| e.trim_end_matches('/').to_string());
        if let Some(endpoint) = &endpoint {
            url::Url::parse(endpoint)?;
        }

        let credentials = Credentials::new(
            access_key_id.clone(),
            secret_access_key,
            bundle.resolve(CredentialField::SessionToken, env),
            None,
            "objstore-bridge",
        );

        let mut builder = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(region.clone()))
            .credentials_provider(credentials)
            .retry_config(sdk_retry_config(http))
            .timeout_config(
                TimeoutConfig::builder()
                    .operation_timeout(Duration::from_secs(http.timeout_secs))
                    .connect_timeout(Duration::from_secs(http.connect_timeout_secs))
                    .build(),
            );
        if let Some(endpoint) = &endpoint {
            builder = builder.endpoint_url(endpoint.as_str()).force_path_style(true);
        }

        Ok(Self {
            client: Client::from_conf(builder.build()),
            region,
            endpoint,
            access_key_id,
        })
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    /// The endpoint override, if any; `None` means the AWS regional endpoint
    pub fn endpoint(&self) -> Option<&str> {
        self.endpoint.as_deref()
    }
}

/// SDK-internal retries; the transfer layer's `RetryPolicy` sits on top
fn sdk_retry_config(http: &HttpOptions) -> RetryConfig {
    if http.max_retries == 0 {
        RetryConfig::disabled()
    } else {
        RetryConfig::standard().with_max_attempts(http.max_retries + 1)
    }
}

/// Map an SDK failure that no operation-specific arm claimed
fn sdk_error<E>(err: SdkError<E, HttpResponse>) -> Error
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
{
    let status = match &err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) => {
            return Error::Transport(DisplayErrorContext(&err).to_string())
        }
        SdkError::ServiceError(service) => Some(service.raw().status().as_u16()),
        SdkError::ResponseError(response) => Some(response.raw().status().as_u16()),
        _ => None,
    };

    let message = match err.as_service_error().and_then(|e| e.code()) {
        Some(code) => code.to_string(),
        None => DisplayErrorContext(&err).to_string(),
    };
    match status {
        Some(401 | 403) => Error::Authentication {
            backend: BackendKind::S3,
            message,
        },
        Some(status) => Error::Status { status, message },
        None => Error::InvalidResponse(message),
    }
}

fn service_code<E: ProvideErrorMetadata>(err: &SdkError<E, HttpResponse>) -> Option<&str> {
    err.as_service_error().and_then(|e| e.code())
}

#[async_trait]
impl StorageBackend for S3Client {
    fn kind(&self) -> BackendKind {
        BackendKind::S3
    }

    async fn list_containers(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let mut token: Option<String> = None;

        loop {
            let page = self
                .client
                .list_buckets()
                .set_continuation_token(token.take())
                .send()
                .await
                .map_err(sdk_error)?;

            names.extend(page.buckets().iter().filter_map(|b| b.name()).map(String::from));
            match page.continuation_token() {
                Some(next) if !next.is_empty() => token = Some(next.to_string()),
                _ => break,
            }
        }

        Ok(names)
    }

    async fn create_container(&self, name: &str) -> Result<()> {
        let configuration = (self.region != DEFAULT_REGION).then(|| {
            CreateBucketConfiguration::builder()
                .location_constraint(BucketLocationConstraint::from(self.region.as_str()))
                .build()
        });

        let result = self
            .client
            .create_bucket()
            .bucket(name)
            .set_create_bucket_configuration(configuration)
            .send()
            .await;
        if let Err(err) = result {
            if let Some(service) = err.as_service_error() {
                if service.is_bucket_already_owned_by_you() || service.is_bucket_already_exists() {
                    debug!(bucket = name, code = ?service.code(), "S3 bucket exists");
                    return Err(Error::ContainerConflict(name.to_string()));
                }
            }
            return Err(sdk_error(err));
        }

        debug!(bucket = name, region = %self.region, "S3 bucket created");
        Ok(())
    }

    async fn list_objects(&self, container: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut pages = self
            .client
            .list_objects_v2()
            .bucket(container)
            .into_paginator()
            .send();

        while let Some(page) = pages.next().await {
            let page = match page {
                Ok(page) => page,
                Err(err) => {
                    if err.as_service_error().is_some_and(|e| e.is_no_such_bucket()) {
                        return Err(Error::ContainerNotFound(container.to_string()));
                    }
                    return Err(sdk_error(err));
                }
            };
            keys.extend(page.contents().iter().filter_map(|o| o.key()).map(String::from));
        }

        Ok(keys)
    }

    async fn upload(&self, container: &str, key: &str, source: &ByteSource) -> Result<()> {
        let body = SdkBody::from_path(source.path()).await.map_err(|e| {
            Error::local_io(source.path(), std::io::Error::new(std::io::ErrorKind::Other, e))
        })?;

        let result = self
            .client
            .put_object()
            .bucket(container)
            .key(key)
            .content_length(source.len() as i64)
            .body(body)
            .send()
            .await;
        if let Err(err) = result {
            if service_code(&err) == Some("NoSuchBucket") {
                return Err(Error::ContainerNotFound(container.to_string()));
            }
            return Err(sdk_error(err));
        }

        debug!(bucket = container, key = key, bytes = source.len(), "S3 upload complete");
        Ok(())
    }

    async fn download(&self, container: &str, key: &str) -> Result<ByteStream> {
        let output = match self.client.get_object().bucket(container).key(key).send().await {
            Ok(output) => output,
            Err(err) => {
                if service_code(&err) == Some("NoSuchBucket") {
                    return Err(Error::ContainerNotFound(container.to_string()));
                }
                if err.as_service_error().is_some_and(|e| e.is_no_such_key()) {
                    return Err(Error::ObjectNotFound {
                        container: container.to_string(),
                        key: key.to_string(),
                    });
                }
                return Err(sdk_error(err));
            }
        };

        Ok(ReaderStream::new(output.body.into_async_read())
            .map_err(|e| Error::Transport(e.to_string()))
            .boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_connect_requires_region() {
        let bundle = CredentialBundle::new()
            .with(CredentialField::AccessKeyId, "AKID")
            .with(CredentialField::SecretAccessKey, "SECRET");
        let err = S3Client::connect(&bundle, &env(&[]), &HttpOptions::default()).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn test_connect_requires_secret() {
        let bundle = CredentialBundle::new()
            .with(CredentialField::Region, "us-east-1")
            .with(CredentialField::AccessKeyId, "AKID");
        let err = S3Client::connect(&bundle, &env(&[]), &HttpOptions::default()).unwrap_err();
        assert!(matches!(err, Error::Authentication { backend: BackendKind::S3, .. }));
    }

    #[test]
    fn test_connect_from_environment() {
        let client = S3Client::connect(
            &CredentialBundle::new(),
            &env(&[
                ("AWS_REGION", "eu-central-1"),
                ("AWS_ACCESS_KEY_ID", "AKID"),
                ("AWS_SECRET_ACCESS_KEY", "SECRET"),
            ]),
            &HttpOptions::default(),
        )
        .unwrap();
        assert_eq!(client.region(), "eu-central-1");
        assert_eq!(client.endpoint(), None);
    }

    #[test]
    fn test_connect_rejects_malformed_endpoint() {
        let bundle = CredentialBundle::new()
            .with(CredentialField::Region, "us-east-1")
            .with(CredentialField::AccessKeyId, "AKID")
            .with(CredentialField::SecretAccessKey, "SECRET")
            .with(CredentialField::Endpoint, "not a url");
        let err = S3Client::connect(&bundle, &env(&[]), &HttpOptions::default()).unwrap_err();
        assert!(matches!(err, Error::InvalidUrl(_)));
    }

    #[test]
    fn test_sdk_retries_follow_http_options() {
        assert_eq!(sdk_retry_config(&HttpOptions::default()).max_attempts(), 1);
        let http = HttpOptions {
            max_retries: 2,
            ..HttpOptions::default()
        };
        assert_eq!(sdk_retry_config(&http).max_attempts(), 3);
    }

    fn mock_client(server: &mockito::Server, region: &str) -> S3Client {
        S3Client::connect(
            &CredentialBundle::new()
                .with(CredentialField::Region, region)
                .with(CredentialField::AccessKeyId, "AKID")
                .with(CredentialField::SecretAccessKey, "SECRET")
                .with(CredentialField::Endpoint, server.url()),
            &env(&[]),
            &HttpOptions::default(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_list_objects_follows_continuation() {
        let mut server = mockito::Server::new_async().await;
        let second = server
            .mock("GET", "/reports")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("list-type".into(), "2".into()),
                Matcher::UrlEncoded("continuation-token".into(), "page-2".into()),
            ]))
            .with_status(200)
            .with_body(
                "<ListBucketResult><IsTruncated>false</IsTruncated>\
                 <Contents><Key>c.csv</Key></Contents></ListBucketResult>",
            )
            .create_async()
            .await;
        let first = server
            .mock("GET", "/reports")
            .match_query(Matcher::Exact("list-type=2".into()))
            .match_header("authorization", Matcher::Regex("^AWS4-HMAC-SHA256 ".into()))
            .with_status(200)
            .with_body(
                "<ListBucketResult><IsTruncated>true</IsTruncated>\
                 <Contents><Key>a.csv</Key></Contents>\
                 <Contents><Key>b &amp; c.csv</Key></Contents>\
                 <NextContinuationToken>page-2</NextContinuationToken></ListBucketResult>",
            )
            .create_async()
            .await;

        let client = mock_client(&server, "us-east-1");
        let keys = client.list_objects("reports").await.unwrap();

        first.assert_async().await;
        second.assert_async().await;
        assert_eq!(keys, vec!["a.csv", "b & c.csv", "c.csv"]);
    }

    #[tokio::test]
    async fn test_list_objects_missing_bucket() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/absent")
            .match_query(Matcher::Any)
            .with_status(404)
            .with_body("<Error><Code>NoSuchBucket</Code></Error>")
            .create_async()
            .await;

        let client = mock_client(&server, "us-east-1");
        let err = client.list_objects("absent").await.unwrap_err();
        assert!(matches!(err, Error::ContainerNotFound(name) if name == "absent"));
    }

    #[tokio::test]
    async fn test_list_containers() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(
                "<ListAllMyBucketsResult><Buckets>\
                 <Bucket><Name>alpha</Name></Bucket><Bucket><Name>beta</Name></Bucket>\
                 </Buckets></ListAllMyBucketsResult>",
            )
            .create_async()
            .await;

        let client = mock_client(&server, "us-east-1");
        assert_eq!(client.list_containers().await.unwrap(), vec!["alpha", "beta"]);
        assert!(client.container_exists("beta").await.unwrap());
        assert!(!client.container_exists("gamma").await.unwrap());
    }

    #[tokio::test]
    async fn test_list_containers_rejected_credentials() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/")
            .match_query(Matcher::Any)
            .with_status(403)
            .with_body("<Error><Code>InvalidAccessKeyId</Code></Error>")
            .create_async()
            .await;

        let client = mock_client(&server, "us-east-1");
        let err = client.list_containers().await.unwrap_err();
        assert!(matches!(err, Error::Authentication { backend: BackendKind::S3, message } if message == "InvalidAccessKeyId"));
    }

    #[tokio::test]
    async fn test_create_bucket_sends_location_constraint() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("PUT", "/reports")
            .match_query(Matcher::Any)
            .match_body(Matcher::Regex(
                "<LocationConstraint>eu-west-1</LocationConstraint>".into(),
            ))
            .with_status(200)
            .create_async()
            .await;

        let client = mock_client(&server, "eu-west-1");
        client.create_container("reports").await.unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_create_bucket_conflict() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("PUT", "/reports")
            .match_query(Matcher::Any)
            .with_status(409)
            .with_body("<Error><Code>BucketAlreadyOwnedByYou</Code></Error>")
            .create_async()
            .await;

        let client = mock_client(&server, "us-east-1");
        let err = client.create_container("reports").await.unwrap_err();
        assert!(matches!(err, Error::ContainerConflict(name) if name == "reports"));
    }

    #[tokio::test]
    async fn test_download_streams_body() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/reports/2024/q1.csv")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_header("content-length", "8")
            .with_body("a,b\n1,2\n")
            .create_async()
            .await;

        let client = mock_client(&server, "us-east-1");
        let chunks: Vec<bytes::Bytes> = client
            .download("reports", "2024/q1.csv")
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert_eq!(chunks.concat(), b"a,b\n1,2\n");
    }

    #[tokio::test]
    async fn test_download_missing_key() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/reports/absent.csv")
            .match_query(Matcher::Any)
            .with_status(404)
            .with_body("<Error><Code>NoSuchKey</Code></Error>")
            .create_async()
            .await;

        let client = mock_client(&server, "us-east-1");
        let err = client.download("reports", "absent.csv").await.err().unwrap();
        assert!(matches!(err, Error::ObjectNotFound { .. }));
    }

    #[tokio::test]
    async fn test_download_missing_bucket() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/absent/q1.csv")
            .match_query(Matcher::Any)
            .with_status(404)
            .with_body("<Error><Code>NoSuchBucket</Code></Error>")
            .create_async()
            .await;

        let client = mock_client(&server, "us-east-1");
        let err = client.download("absent", "q1.csv").await.err().unwrap();
        assert!(matches!(err, Error::ContainerNotFound(name) if name == "absent"));
    }

    #[tokio::test]
    async fn test_upload_sends_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("q1.csv");
        std::fs::write(&path, b"a,b\n1,2\n").unwrap();
        let source = ByteSource::from_path(&path).await.unwrap();

        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("PUT", "/reports/2024/q1.csv")
            .match_query(Matcher::Any)
            .with_status(200)
            .create_async()
            .await;

        let client = mock_client(&server, "us-east-1");
        client.upload("reports", "2024/q1.csv", &source).await.unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_server_errors_keep_status() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/reports/q1.csv")
            .match_query(Matcher::Any)
            .with_status(503)
            .with_body("<Error><Code>SlowDown</Code></Error>")
            .create_async()
            .await;

        let client = mock_client(&server, "us-east-1");
        let err = client.download("reports", "q1.csv").await.err().unwrap();
        assert!(err.is_transient());
        assert!(matches!(err, Error::Status { status: 503, .. }));
    }
}
