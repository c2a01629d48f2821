//! Plain HTTP/S sources
//!
//! Also hosts the status and error mapping shared by the REST based adapters.

use crate::client::{ByteStream, Capabilities, ListOptions, RemoteDataClient};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use reqwest::{Response, StatusCode};
use transfers_types::{Error, FileInfo, Result, SystemType};

/// Map a transport level failure
pub(crate) fn map_reqwest_error(error: &reqwest::Error, what: &str) -> Error {
    if let Some(status) = error.status() {
        return map_status(status, what, &error.to_string());
    }
    if error.is_timeout() {
        return Error::io(format!("{what}: request timed out"));
    }
    Error::io(format!("{what}: {error}"))
}

/// Map a non-success HTTP status
pub(crate) fn map_status(status: StatusCode, what: &str, detail: &str) -> Error {
    match status {
        StatusCode::NOT_FOUND => Error::not_found(what.to_string()),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            Error::forbidden(format!("{what}: {detail}"))
        }
        StatusCode::TOO_MANY_REQUESTS | StatusCode::REQUEST_TIMEOUT => {
            Error::io(format!("{what}: {status} {detail}"))
        }
        s if s.is_server_error() => Error::io(format!("{what}: {status} {detail}")),
        _ => Error::unrecoverable(format!("{what}: {status} {detail}")),
    }
}

/// Turn an error status into an [`Error`], reading the body for context
pub(crate) async fn check_response(response: Response, what: &str) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let detail = response.text().await.unwrap_or_default();
    Err(map_status(status, what, detail.trim()))
}

/// Adapt a response body into a [`ByteStream`]
pub(crate) fn body_stream(response: Response, what: String) -> ByteStream {
    Box::pin(
        response
            .bytes_stream()
            .map(move |chunk| chunk.map_err(|e| map_reqwest_error(&e, &what))),
    )
}

/// Read-only client for one web resource
#[derive(Debug, Clone)]
pub struct HttpClient {
    url: String,
    http: reqwest::Client,
}

impl HttpClient {
    /// Create a client for `url`
    pub fn new(url: impl Into<String>, http: reqwest::Client) -> Self {
        Self {
            url: url.into(),
            http,
        }
    }

    fn name(&self) -> String {
        let trimmed = self.url.split(['?', '#']).next().unwrap_or_default();
        crate::path::file_name(trimmed).to_string()
    }

    fn read_only(operation: &str) -> Error {
        Error::not_supported(operation, "HTTP")
    }
}

#[async_trait]
impl RemoteDataClient for HttpClient {
    fn system_type(&self) -> SystemType {
        SystemType::Http
    }

    fn system_id(&self) -> &str {
        &self.url
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            native_ops: false,
            directories: false,
            streaming: true,
            backend_transfers: false,
            writable: false,
        }
    }

    async fn list(&self, path: &str, options: &ListOptions) -> Result<Vec<FileInfo>> {
        let info = self
            .get_file_info(path, true)
            .await?
            .ok_or_else(|| Error::not_found(self.url.clone()))?;
        Ok(options.apply(vec![info]))
    }

    async fn get_file_info(&self, _path: &str, _follow_links: bool) -> Result<Option<FileInfo>> {
        let response = self
            .http
            .head(&self.url)
            .send()
            .await
            .map_err(|e| map_reqwest_error(&e, &self.url))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        // Some servers reject HEAD, the GET in get_stream decides then.
        let size = if response.status().is_success() {
            response.content_length().unwrap_or(0)
        } else {
            0
        };
        let last_modified = response
            .headers()
            .get(reqwest::header::LAST_MODIFIED)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| DateTime::parse_from_rfc2822(v).ok())
            .map(|v| v.with_timezone(&Utc));
        let name = self.name();
        Ok(Some(FileInfo {
            path: name.clone(),
            name,
            size,
            is_dir: false,
            native_permissions: None,
            last_modified,
            url: self.url.clone(),
        }))
    }

    async fn get_stream(&self, _path: &str) -> Result<ByteStream> {
        let response = self
            .http
            .get(&self.url)
            .send()
            .await
            .map_err(|e| map_reqwest_error(&e, &self.url))?;
        let response = check_response(response, &self.url).await?;
        Ok(body_stream(response, self.url.clone()))
    }

    async fn upload(&self, _path: &str, _stream: ByteStream) -> Result<u64> {
        Err(Self::read_only("upload"))
    }

    async fn mkdir(&self, _path: &str) -> Result<()> {
        Err(Self::read_only("mkdir"))
    }

    async fn move_path(&self, _from: &str, _to: &str) -> Result<()> {
        Err(Self::read_only("move"))
    }

    async fn delete(&self, _path: &str) -> Result<()> {
        Err(Self::read_only("delete"))
    }
}
