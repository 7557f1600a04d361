//! Shared reqwest plumbing: the Dataverse client and the container-level
//! Azure and GCS requests.

use crate::config::HttpOptions;
use crate::error::{Error, Result};
use crate::types::{BackendKind, ByteSource, ByteStream};
use futures::stream::{StreamExt, TryStreamExt};
use reqwest::{Body, Client, Response, StatusCode};
use std::time::Duration;
use tokio_util::io::ReaderStream;

const MAX_ERROR_BODY: usize = 512;

impl HttpOptions {
    /// Build the HTTP client owned by one backend handle
    pub(crate) fn build_client(&self) -> Result<Client> {
        Client::builder()
            .timeout(Duration::from_secs(self.timeout_secs))
            .connect_timeout(Duration::from_secs(self.connect_timeout_secs))
            .build()
            .map_err(|e| Error::Configuration(e.to_string()))
    }
}

/// Pass successful responses through; turn the rest into classified errors.
///
/// Callers map backend-specific statuses (404, 409) before calling this.
pub(crate) async fn check_status(response: Response, backend: BackendKind) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let message = error_body(response).await;
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Err(Error::Authentication {
            backend,
            message: format!("{}: {}", status, message),
        });
    }

    Err(Error::Status {
        status: status.as_u16(),
        message,
    })
}

/// Read (a bounded prefix of) an error response body
pub(crate) async fn error_body(response: Response) -> String {
    let mut body = response.text().await.unwrap_or_default();
    if body.len() > MAX_ERROR_BODY {
        let mut cut = MAX_ERROR_BODY;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        body.truncate(cut);
    }
    body
}

/// Stream a local file as a request body
pub(crate) async fn file_body(source: &ByteSource) -> Result<Body> {
    let file = tokio::fs::File::open(source.path())
        .await
        .map_err(|e| Error::local_io(source.path(), e))?;
    Ok(Body::wrap_stream(ReaderStream::new(file)))
}

/// Expose a response body as a `ByteStream`
pub(crate) fn body_stream(response: Response) -> ByteStream {
    response.bytes_stream().map_err(Error::from).boxed()
}

/// Sorted, percent-encoded query string
pub(crate) fn canonical_query(params: &[(&str, &str)]) -> String {
    let mut encoded: Vec<(String, String)> = params
        .iter()
        .map(|(k, v)| (urlencoding::encode(k).into_owned(), urlencoding::encode(v).into_owned()))
        .collect();
    encoded.sort();
    encoded
        .into_iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&")
}

/// Prefix bare host names with `https://` and drop trailing slashes
pub(crate) fn normalize_base_url(host_or_url: &str) -> String {
    let trimmed = host_or_url.trim().trim_end_matches('/');
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("https://{}", trimmed)
    }
}
