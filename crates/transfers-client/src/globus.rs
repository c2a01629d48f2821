//! Globus collections through the Globus Transfer REST API
//!
//! Globus moves bytes itself: a transfer between two collections is submitted
//! as a backend task and polled. There is no byte streaming through the worker.

use crate::client::{BackendTransferStatus, ByteStream, Capabilities, ListOptions, RemoteDataClient};
use crate::http::{check_response, map_reqwest_error};
use crate::{listing, path};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info};
use transfers_types::{Error, FileInfo, Result, SystemDescriptor, SystemType};

#[derive(Debug, Deserialize)]
struct GlobusEntry {
    name: String,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    size: u64,
    #[serde(default)]
    last_modified: Option<String>,
    #[serde(default)]
    permissions: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Listing {
    #[serde(rename = "DATA", default)]
    data: Vec<GlobusEntry>,
}

#[derive(Debug, Deserialize)]
struct SubmissionId {
    value: String,
}

#[derive(Debug, Deserialize)]
struct TaskCreated {
    task_id: String,
}

#[derive(Debug, Deserialize)]
struct TaskState {
    status: String,
    #[serde(default)]
    nice_status_short_description: Option<String>,
}

fn parse_timestamp(value: Option<&str>) -> Option<DateTime<Utc>> {
    value
        .and_then(|v| DateTime::parse_from_str(v, "%Y-%m-%d %H:%M:%S%:z").ok())
        .map(|v| v.with_timezone(&Utc))
}

fn task_status(state: &TaskState) -> BackendTransferStatus {
    match state.status.as_str() {
        "SUCCEEDED" => BackendTransferStatus::Succeeded,
        "FAILED" => BackendTransferStatus::Failed(
            state
                .nice_status_short_description
                .clone()
                .unwrap_or_else(|| "Globus task failed".to_string()),
        ),
        // Cancelled tasks are reported as FAILED by Globus; INACTIVE is paused.
        _ => BackendTransferStatus::Active,
    }
}

/// Client for one Globus collection. The system host holds the collection id.
#[derive(Debug, Clone)]
pub struct GlobusClient {
    tenant: String,
    system_id: String,
    endpoint_id: String,
    root: String,
    base_url: String,
    token: String,
    http: reqwest::Client,
}

impl GlobusClient {
    /// Create a client against the Transfer API at `base_url`
    pub fn new(system: &SystemDescriptor, base_url: &str, http: reqwest::Client) -> Result<Self> {
        let token = system.credentials.access_token.clone().ok_or_else(|| {
            Error::forbidden(format!("No Globus token for system {}", system.id))
        })?;
        if system.host.is_empty() {
            return Err(Error::config(format!(
                "System {} has no Globus collection id",
                system.id
            )));
        }
        Ok(Self {
            tenant: system.tenant.clone(),
            system_id: system.id.clone(),
            endpoint_id: system.host.clone(),
            root: system.root_dir.clone(),
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
            http,
        })
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}/{}", self.base_url, endpoint)
    }

    fn operation(&self, op: &str) -> String {
        self.url(&format!("operation/endpoint/{}/{}", self.endpoint_id, op))
    }

    fn absolute(&self, relative: &str) -> Result<String> {
        path::resolve(&self.root, relative)
    }

    async fn get(&self, url: &str, query: &[(&str, &str)], what: &str) -> Result<reqwest::Response> {
        let response = self
            .http
            .get(url)
            .bearer_auth(&self.token)
            .query(query)
            .send()
            .await
            .map_err(|e| map_reqwest_error(&e, what))?;
        check_response(response, what).await
    }

    async fn post(&self, url: &str, body: &Value, what: &str) -> Result<reqwest::Response> {
        let response = self
            .http
            .post(url)
            .bearer_auth(&self.token)
            .json(body)
            .send()
            .await
            .map_err(|e| map_reqwest_error(&e, what))?;
        check_response(response, what).await
    }

    async fn submission_id(&self) -> Result<String> {
        let response = self.get(&self.url("submission_id"), &[], "submission id").await?;
        let id: SubmissionId = response
            .json()
            .await
            .map_err(|e| map_reqwest_error(&e, "submission id"))?;
        Ok(id.value)
    }

    fn file_info(&self, relative: &str, entry: &GlobusEntry) -> FileInfo {
        let is_dir = entry.kind == "dir";
        FileInfo {
            path: relative.to_string(),
            name: entry.name.clone(),
            size: if is_dir { 0 } else { entry.size },
            is_dir,
            native_permissions: entry.permissions.clone(),
            last_modified: parse_timestamp(entry.last_modified.as_deref()),
            url: path::file_url(&self.tenant, &self.system_id, relative),
        }
    }

    async fn stat(&self, relative: &str) -> Result<Option<FileInfo>> {
        let absolute = self.absolute(relative)?;
        match self.get(&self.operation("stat"), &[("path", &absolute)], &absolute).await {
            Ok(response) => {
                let entry: GlobusEntry = response
                    .json()
                    .await
                    .map_err(|e| map_reqwest_error(&e, &absolute))?;
                Ok(Some(self.file_info(relative, &entry)))
            }
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err),
        }
    }

    fn streaming(operation: &str) -> Error {
        Error::not_supported(operation, "GLOBUS")
    }
}

#[async_trait]
impl RemoteDataClient for GlobusClient {
    fn system_type(&self) -> SystemType {
        SystemType::Globus
    }

    fn system_id(&self) -> &str {
        &self.system_id
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            native_ops: false,
            directories: true,
            streaming: false,
            backend_transfers: true,
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

        let absolute = self.absolute(&relative)?;
        let listing: Listing = self
            .get(&self.operation("ls"), &[("path", &absolute)], &absolute)
            .await?
            .json()
            .await
            .map_err(|e| map_reqwest_error(&e, &absolute))?;
        let mut entries: Vec<FileInfo> = listing
            .data
            .iter()
            .map(|entry| self.file_info(&path::join(&relative, &entry.name), entry))
            .collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(options.apply(entries))
    }

    async fn get_file_info(&self, path: &str, _follow_links: bool) -> Result<Option<FileInfo>> {
        self.stat(&path::normalize(path)?).await
    }

    async fn get_stream(&self, _path: &str) -> Result<ByteStream> {
        Err(Self::streaming("getStream"))
    }

    async fn upload(&self, _path: &str, _stream: ByteStream) -> Result<u64> {
        Err(Self::streaming("upload"))
    }

    async fn mkdir(&self, path: &str) -> Result<()> {
        let absolute = self.absolute(path)?;
        let body = json!({ "DATA_TYPE": "mkdir", "path": absolute });
        match self.post(&self.operation("mkdir"), &body, &absolute).await {
            Ok(_) => Ok(()),
            // Globus answers 502 ExternalError.MkdirFailed.Exists for existing paths.
            Err(err) if self.stat(&path::normalize(path)?).await?.is_some_and(|i| i.is_dir) => {
                debug!(path = %absolute, "Directory already exists: {}", err);
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    async fn move_path(&self, from: &str, to: &str) -> Result<()> {
        let old_path = self.absolute(from)?;
        let new_path = self.absolute(to)?;
        let body = json!({ "DATA_TYPE": "rename", "old_path": old_path, "new_path": new_path });
        self.post(&self.operation("rename"), &body, &old_path).await?;
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let absolute = self.absolute(path)?;
        let body = json!({
            "DATA_TYPE": "delete",
            "submission_id": self.submission_id().await?,
            "endpoint": self.endpoint_id,
            "recursive": true,
            "DATA": [{ "DATA_TYPE": "delete_item", "path": absolute }],
        });
        self.post(&self.url("delete"), &body, &absolute).await?;
        Ok(())
    }

    async fn submit_backend_transfer(
        &self,
        src_path: &str,
        destination: &SystemDescriptor,
        dest_path: &str,
        recursive: bool,
    ) -> Result<String> {
        if destination.system_type != SystemType::Globus {
            return Err(Error::validation(format!(
                "Globus can only transfer to another Globus collection, not {}",
                destination.system_type
            )));
        }
        let source_path = self.absolute(src_path)?;
        let destination_path = path::resolve(&destination.root_dir, dest_path)?;
        let body = json!({
            "DATA_TYPE": "transfer",
            "submission_id": self.submission_id().await?,
            "source_endpoint": self.endpoint_id,
            "destination_endpoint": destination.host,
            "DATA": [{
                "DATA_TYPE": "transfer_item",
                "source_path": source_path,
                "destination_path": destination_path,
                "recursive": recursive,
            }],
        });
        let created: TaskCreated = self
            .post(&self.url("transfer"), &body, &source_path)
            .await?
            .json()
            .await
            .map_err(|e| map_reqwest_error(&e, &source_path))?;
        info!(
            task_id = %created.task_id,
            source = %source_path,
            destination = %destination_path,
            "Submitted Globus transfer"
        );
        Ok(created.task_id)
    }

    async fn backend_transfer_status(&self, external_id: &str) -> Result<BackendTransferStatus> {
        let state: TaskState = self
            .get(&self.url(&format!("task/{external_id}")), &[], external_id)
            .await?
            .json()
            .await
            .map_err(|e| map_reqwest_error(&e, external_id))?;
        Ok(task_status(&state))
    }

    async fn cancel_backend_transfer(&self, external_id: &str) -> Result<()> {
        self.post(
            &self.url(&format!("task/{external_id}/cancel")),
            &json!({}),
            external_id,
        )
        .await?;
        Ok(())
    }
}
