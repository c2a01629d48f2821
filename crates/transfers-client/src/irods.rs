//! iRODS zones reached through the iRODS HTTP API
//!
//! Every call carries a bearer token obtained with basic authentication. The
//! token is cached per client and refreshed after the server rejects it.

use crate::client::{ByteStream, Capabilities, ListOptions, RemoteDataClient};
use crate::http::{check_response, map_reqwest_error};
use crate::{listing, path};
use async_trait::async_trait;
use bytes::BytesMut;
use chrono::{DateTime, TimeZone, Utc};
use futures::StreamExt;
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::debug;
use transfers_types::{Error, FileInfo, Result, SystemDescriptor, SystemType};

const DEFAULT_PORT: u16 = 9001;
const API_PATH: &str = "irods-http-api/0.3.0";
const WRITE_BLOCK: usize = 4 * 1024 * 1024;

/// Error codes meaning the logical path does not exist
const NOT_FOUND_CODES: [i64; 2] = [-808_000, -310_000];

#[derive(Debug, Default, Deserialize)]
struct IrodsStatus {
    #[serde(default)]
    status_code: i64,
    #[serde(default)]
    status_message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StatResponse {
    irods_response: IrodsStatus,
    #[serde(default, rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    size: Option<u64>,
    #[serde(default)]
    modified_at: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct ListResponse {
    irods_response: IrodsStatus,
    #[serde(default)]
    entries: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct StatusOnly {
    irods_response: IrodsStatus,
}

fn check_status(status: &IrodsStatus, what: &str) -> Result<()> {
    match status.status_code {
        0 => Ok(()),
        code if NOT_FOUND_CODES.contains(&code) => Err(Error::not_found(what.to_string())),
        code => Err(Error::unrecoverable(format!(
            "{what}: iRODS error {code} {}",
            status.status_message.as_deref().unwrap_or_default()
        ))),
    }
}

/// Client for one iRODS zone
#[derive(Debug)]
pub struct IrodsClient {
    tenant: String,
    system_id: String,
    root: String,
    base_url: String,
    user: String,
    password: String,
    http: reqwest::Client,
    token: RwLock<Option<String>>,
}

impl IrodsClient {
    /// Create a client for `system`. `host` is either a bare host or a full
    /// base URL of the HTTP API.
    pub fn new(system: &SystemDescriptor, http: reqwest::Client) -> Result<Self> {
        let password = system.credentials.password.clone().ok_or_else(|| {
            Error::forbidden(format!("No iRODS credentials for system {}", system.id))
        })?;
        let base_url = if system.host.contains("://") {
            system.host.trim_end_matches('/').to_string()
        } else {
            format!(
                "https://{}:{}/{}",
                system.host,
                system.port.unwrap_or(DEFAULT_PORT),
                API_PATH
            )
        };
        Ok(Self {
            tenant: system.tenant.clone(),
            system_id: system.id.clone(),
            root: system.root_dir.clone(),
            base_url,
            user: system.effective_user.clone(),
            password,
            http,
            token: RwLock::new(None),
        })
    }

    fn logical_path(&self, relative: &str) -> Result<String> {
        path::resolve(&self.root, relative)
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}/{}", self.base_url, endpoint)
    }

    async fn token(&self) -> Result<String> {
        if let Some(token) = self.token.read().await.clone() {
            return Ok(token);
        }
        let mut slot = self.token.write().await;
        if let Some(token) = slot.clone() {
            return Ok(token);
        }
        let response = self
            .http
            .post(self.url("authenticate"))
            .basic_auth(&self.user, Some(&self.password))
            .send()
            .await
            .map_err(|e| map_reqwest_error(&e, &self.base_url))?;
        let response = check_response(response, "iRODS authentication").await?;
        let token = response
            .text()
            .await
            .map_err(|e| map_reqwest_error(&e, &self.base_url))?
            .trim()
            .to_string();
        debug!(system = %self.system_id, "Authenticated against iRODS");
        *slot = Some(token.clone());
        Ok(token)
    }

    async fn send(&self, request: reqwest::RequestBuilder, what: &str) -> Result<reqwest::Response> {
        let token = self.token().await?;
        let response = request
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| map_reqwest_error(&e, what))?;
        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            // Expired token, the retry picks up a fresh one.
            *self.token.write().await = None;
            return Err(Error::io(format!("{what}: iRODS token rejected")));
        }
        check_response(response, what).await
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(
        &self,
        endpoint: &str,
        query: &[(&str, &str)],
        what: &str,
    ) -> Result<T> {
        let request = self.http.get(self.url(endpoint)).query(query);
        self.send(request, what)
            .await?
            .json::<T>()
            .await
            .map_err(|e| map_reqwest_error(&e, what))
    }

    async fn post_form(&self, endpoint: &str, form: &[(&str, &str)], what: &str) -> Result<()> {
        let request = self.http.post(self.url(endpoint)).form(form);
        let reply: StatusOnly = self
            .send(request, what)
            .await?
            .json()
            .await
            .map_err(|e| map_reqwest_error(&e, what))?;
        check_status(&reply.irods_response, what)
    }

    /// Stat a logical path as data object first, then as collection
    async fn stat(&self, relative: &str) -> Result<Option<FileInfo>> {
        let lpath = self.logical_path(relative)?;
        for endpoint in ["data-objects", "collections"] {
            let reply: StatResponse = self
                .get_json(endpoint, &[("op", "stat"), ("lpath", &lpath)], &lpath)
                .await?;
            match check_status(&reply.irods_response, &lpath) {
                Ok(()) => {
                    let is_dir = endpoint == "collections"
                        || reply.kind.as_deref() == Some("collection");
                    return Ok(Some(self.file_info(
                        relative,
                        if is_dir { 0 } else { reply.size.unwrap_or(0) },
                        is_dir,
                        reply.modified_at,
                    )));
                }
                Err(err) if err.is_not_found() => {}
                Err(err) => return Err(err),
            }
        }
        Ok(None)
    }

    fn file_info(&self, relative: &str, size: u64, is_dir: bool, modified_at: Option<i64>) -> FileInfo {
        FileInfo {
            path: relative.to_string(),
            name: path::file_name(relative).to_string(),
            size,
            is_dir,
            native_permissions: None,
            last_modified: modified_at.and_then(|secs| Utc.timestamp_opt(secs, 0).single()),
            url: path::file_url(&self.tenant, &self.system_id, relative),
        }
    }

    async fn write_block(&self, lpath: &str, block: Vec<u8>, offset: u64) -> Result<()> {
        let form = Form::new()
            .text("op", "write")
            .text("lpath", lpath.to_string())
            .text("offset", offset.to_string())
            .text("truncate", if offset == 0 { "1" } else { "0" })
            .part("bytes", Part::bytes(block));
        let request = self.http.post(self.url("data-objects")).multipart(form);
        let reply: StatusOnly = self
            .send(request, lpath)
            .await?
            .json()
            .await
            .map_err(|e| map_reqwest_error(&e, lpath))?;
        check_status(&reply.irods_response, lpath)
    }
}

#[async_trait]
impl RemoteDataClient for IrodsClient {
    fn system_type(&self) -> SystemType {
        SystemType::Irods
    }

    fn system_id(&self) -> &str {
        &self.system_id
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            native_ops: false,
            directories: true,
            streaming: true,
            backend_transfers: false,
            writable: true,
        }
    }

    async fn list(&self, path: &str, options: &ListOptions) -> Result<Vec<FileInfo>> {
        if options.recurse {
            return listing::walk(self, path, options).await;
        }
        let relative = path::normalize(path)?;
        let info = self
            .stat(&relative)
            .await?
            .ok_or_else(|| Error::not_found(format!("{}:/{}", self.system_id, relative)))?;
        if !info.is_dir {
            return Ok(options.apply(vec![info]));
        }

        let lpath = self.logical_path(&relative)?;
        let reply: ListResponse = self
            .get_json("collections", &[("op", "list"), ("lpath", &lpath)], &lpath)
            .await?;
        check_status(&reply.irods_response, &lpath)?;

        let mut entries = Vec::with_capacity(reply.entries.len());
        for entry in &reply.entries {
            let child = path::relativize(&self.root, entry);
            if let Some(info) = self.stat(&child).await? {
                entries.push(info);
            }
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(options.apply(entries))
    }

    async fn get_file_info(&self, path: &str, _follow_links: bool) -> Result<Option<FileInfo>> {
        self.stat(&path::normalize(path)?).await
    }

    async fn get_stream(&self, path: &str) -> Result<ByteStream> {
        let lpath = self.logical_path(path)?;
        let request = self
            .http
            .get(self.url("data-objects"))
            .query(&[("op", "read"), ("lpath", lpath.as_str())]);
        let response = self.send(request, &lpath).await?;
        Ok(crate::http::body_stream(response, lpath))
    }

    async fn upload(&self, path: &str, mut stream: ByteStream) -> Result<u64> {
        let relative = path::normalize(path)?;
        let parent = path::parent(&relative).to_string();
        if !parent.is_empty() {
            self.mkdir(&parent).await?;
        }
        let lpath = self.logical_path(&relative)?;

        let mut offset = 0u64;
        let mut buffer = BytesMut::new();
        let mut wrote_any = false;
        while let Some(chunk) = stream.next().await {
            buffer.extend_from_slice(&chunk?);
            if buffer.len() >= WRITE_BLOCK {
                let block = buffer.split().to_vec();
                let len = block.len() as u64;
                self.write_block(&lpath, block, offset).await?;
                offset += len;
                wrote_any = true;
            }
        }
        if !buffer.is_empty() || !wrote_any {
            let block = buffer.to_vec();
            let len = block.len() as u64;
            self.write_block(&lpath, block, offset).await?;
            offset += len;
        }
        Ok(offset)
    }

    async fn mkdir(&self, path: &str) -> Result<()> {
        let lpath = self.logical_path(path)?;
        self.post_form(
            "collections",
            &[("op", "create"), ("lpath", &lpath), ("create-intermediates", "1")],
            &lpath,
        )
        .await
    }

    async fn move_path(&self, from: &str, to: &str) -> Result<()> {
        let from_relative = path::normalize(from)?;
        let info = self
            .stat(&from_relative)
            .await?
            .ok_or_else(|| Error::not_found(format!("{}:/{}", self.system_id, from_relative)))?;
        let old = self.logical_path(&from_relative)?;
        let new = self.logical_path(to)?;
        let endpoint = if info.is_dir { "collections" } else { "data-objects" };
        self.post_form(
            endpoint,
            &[("op", "rename"), ("old-lpath", &old), ("new-lpath", &new)],
            &old,
        )
        .await
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let relative = path::normalize(path)?;
        let Some(info) = self.stat(&relative).await? else {
            return Err(Error::not_found(format!("{}:/{}", self.system_id, relative)));
        };
        let lpath = self.logical_path(&relative)?;
        if info.is_dir {
            self.post_form(
                "collections",
                &[("op", "remove"), ("lpath", &lpath), ("recurse", "1"), ("no-trash", "1")],
                &lpath,
            )
            .await
        } else {
            self.post_form(
                "data-objects",
                &[("op", "remove"), ("lpath", &lpath), ("no-trash", "1")],
                &lpath,
            )
            .await
        }
    }
}
