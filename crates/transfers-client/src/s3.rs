//! S3-compatible object stores
//!
//! Object stores have no directories: a "directory" is the set of keys sharing a
//! prefix, `mkdir` is a no-op and moves are copy-then-delete per object.

use crate::client::{ByteStream, Capabilities, ListOptions, RemoteDataClient};
use crate::path;
use async_trait::async_trait;
use aws_sdk_s3::config::http::HttpResponse;
use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};
use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::primitives::{ByteStream as S3Body, DateTime as S3DateTime};
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client;
use bytes::BytesMut;
use chrono::{DateTime, TimeZone, Utc};
use futures::StreamExt;
use tokio_util::io::ReaderStream;
use tracing::{debug, warn};
use transfers_types::{Error, FileInfo, Result, SystemDescriptor, SystemType};

const DEFAULT_REGION: &str = "us-east-1";
const PART_SIZE: usize = 8 * 1024 * 1024;

/// Listing entries kept across result pages. Entries deeper than
/// `max_depth` are dropped before they count toward `wanted`.
struct Collected {
    entries: Vec<FileInfo>,
    base_depth: usize,
    max_depth: Option<usize>,
    wanted: Option<usize>,
}

impl Collected {
    fn new(base: &str, max_depth: Option<usize>, wanted: Option<usize>) -> Self {
        Self {
            entries: Vec::new(),
            base_depth: base.split('/').filter(|s| !s.is_empty()).count(),
            max_depth,
            wanted,
        }
    }

    fn push(&mut self, entry: FileInfo) {
        let depth = entry.path.split('/').count().saturating_sub(self.base_depth);
        if self.max_depth.map_or(true, |max| depth <= max) {
            self.entries.push(entry);
        }
    }

    fn is_full(&self) -> bool {
        self.wanted.is_some_and(|wanted| self.entries.len() >= wanted)
    }
}

/// Map an SDK failure onto the engine's error kinds
fn map_sdk_error<E>(err: &SdkError<E, HttpResponse>, what: &str) -> Error
where
    E: std::error::Error + 'static,
{
    match err {
        SdkError::ServiceError(service) => {
            let status = service.raw().status().as_u16();
            let detail = format!("{what}: {}", aws_sdk_s3::error::DisplayErrorContext(err));
            match status {
                404 => Error::not_found(what.to_string()),
                401 | 403 => Error::forbidden(detail),
                429 | 500..=599 => Error::io(detail),
                _ => Error::unrecoverable(detail),
            }
        }
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => {
            Error::io(format!("{what}: {err}"))
        }
        _ => Error::unrecoverable(format!("{what}: {err}")),
    }
}

fn to_chrono(value: Option<&S3DateTime>) -> Option<DateTime<Utc>> {
    value.and_then(|dt| Utc.timestamp_opt(dt.secs(), dt.subsec_nanos()).single())
}

/// Encode `bucket/key` for the copy source header
fn copy_source(bucket: &str, key: &str) -> String {
    let mut encoded = String::with_capacity(bucket.len() + key.len() + 1);
    encoded.push_str(bucket);
    encoded.push('/');
    for byte in key.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' | b'/' => {
                encoded.push(byte as char);
            }
            other => encoded.push_str(&format!("%{other:02X}")),
        }
    }
    encoded
}

/// Client for one bucket, with the system root as key prefix
#[derive(Debug, Clone)]
pub struct S3Client {
    client: Client,
    tenant: String,
    system_id: String,
    bucket: String,
    prefix: String,
}

impl S3Client {
    /// Build a client from the system's endpoint, bucket and access keys
    pub fn new(system: &SystemDescriptor) -> Result<Self> {
        let bucket = system
            .bucket_name
            .clone()
            .filter(|b| !b.is_empty())
            .ok_or_else(|| Error::config(format!("System {} has no bucket", system.id)))?;
        let (Some(access_key), Some(secret)) = (
            system.credentials.access_key.clone(),
            system.credentials.access_secret.clone(),
        ) else {
            return Err(Error::forbidden(format!(
                "No S3 credentials for system {}",
                system.id
            )));
        };

        let mut builder = aws_sdk_s3::config::Builder::new()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(DEFAULT_REGION))
            .credentials_provider(Credentials::new(access_key, secret, None, None, "transfers"));
        if !system.host.is_empty() {
            let endpoint = match system.port {
                Some(port) if !system.host.contains("://") => {
                    format!("https://{}:{}", system.host, port)
                }
                _ if !system.host.contains("://") => format!("https://{}", system.host),
                _ => system.host.clone(),
            };
            // Required for most S3-compatible services
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }

        Ok(Self {
            client: Client::from_conf(builder.build()),
            tenant: system.tenant.clone(),
            system_id: system.id.clone(),
            bucket,
            prefix: path::normalize(&system.root_dir)?,
        })
    }

    fn key(&self, relative: &str) -> String {
        path::join(&self.prefix, relative)
    }

    fn relative<'a>(&self, key: &'a str) -> &'a str {
        key.strip_prefix(&self.prefix)
            .unwrap_or(key)
            .trim_matches('/')
    }

    fn entry(&self, key: &str, size: u64, is_dir: bool, modified: Option<DateTime<Utc>>) -> FileInfo {
        let relative = self.relative(key).to_string();
        FileInfo {
            name: path::file_name(&relative).to_string(),
            url: path::file_url(&self.tenant, &self.system_id, &relative),
            path: relative,
            size,
            is_dir,
            native_permissions: None,
            last_modified: modified,
        }
    }

    async fn head(&self, key: &str) -> Result<Option<FileInfo>> {
        match self.client.head_object().bucket(&self.bucket).key(key).send().await {
            Ok(head) => Ok(Some(self.entry(
                key,
                head.content_length().unwrap_or(0).max(0) as u64,
                false,
                to_chrono(head.last_modified()),
            ))),
            Err(err) => match map_sdk_error(&err, key) {
                Error::NotFound { .. } => Ok(None),
                other => Err(other),
            },
        }
    }

    /// Every key under `prefix`, lazily page by page until `wanted` is reached
    async fn list_prefix(
        &self,
        prefix: &str,
        delimited: bool,
        mut entries: Collected,
    ) -> Result<Vec<FileInfo>> {
        let mut token: Option<String> = None;
        loop {
            let mut request = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix);
            if delimited {
                request = request.delimiter("/");
            }
            if let Some(token) = token.take() {
                request = request.continuation_token(token);
            }
            let page = request
                .send()
                .await
                .map_err(|err| map_sdk_error(&err, prefix))?;

            for common in page.common_prefixes() {
                if let Some(dir) = common.prefix() {
                    entries.push(self.entry(dir.trim_end_matches('/'), 0, true, None));
                }
            }
            for object in page.contents() {
                let Some(key) = object.key() else { continue };
                // Folder placeholder objects
                if key.ends_with('/') {
                    continue;
                }
                entries.push(self.entry(
                    key,
                    object.size().unwrap_or(0).max(0) as u64,
                    false,
                    to_chrono(object.last_modified()),
                ));
            }

            if entries.is_full() {
                break;
            }
            match page.next_continuation_token() {
                Some(next) if page.is_truncated().unwrap_or(false) => {
                    token = Some(next.to_string());
                }
                _ => break,
            }
        }
        Ok(entries.entries)
    }

    async fn keys_under(&self, relative: &str) -> Result<Vec<String>> {
        let key = self.key(relative);
        if self.head(&key).await?.is_some() {
            return Ok(vec![key]);
        }
        let prefix = if key.is_empty() { String::new() } else { format!("{key}/") };
        let keys: Vec<String> = self
            .list_prefix(&prefix, false, Collected::new("", None, None))
            .await?
            .into_iter()
            .map(|entry| self.key(&entry.path))
            .collect();
        if keys.is_empty() {
            return Err(Error::not_found(format!("{}:/{}", self.system_id, relative)));
        }
        Ok(keys)
    }

    async fn put_single(&self, key: &str, body: Vec<u8>) -> Result<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(S3Body::from(body))
            .send()
            .await
            .map_err(|err| map_sdk_error(&err, key))?;
        Ok(())
    }

    async fn upload_multipart(&self, key: &str, first: BytesMut, stream: &mut ByteStream) -> Result<u64> {
        let created = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|err| map_sdk_error(&err, key))?;
        let upload_id = created
            .upload_id()
            .ok_or_else(|| Error::io(format!("{key}: no multipart upload id returned")))?
            .to_string();

        let result = self.send_parts(key, &upload_id, first, stream).await;
        if result.is_err() {
            if let Err(err) = self
                .client
                .abort_multipart_upload()
                .bucket(&self.bucket)
                .key(key)
                .upload_id(&upload_id)
                .send()
                .await
            {
                warn!(key, "Failed to abort multipart upload: {}", err);
            }
        }
        result
    }

    async fn send_parts(
        &self,
        key: &str,
        upload_id: &str,
        mut buffer: BytesMut,
        stream: &mut ByteStream,
    ) -> Result<u64> {
        let mut parts = Vec::new();
        let mut total = 0u64;
        let mut finished = false;

        while !finished {
            while buffer.len() < PART_SIZE {
                match stream.next().await {
                    Some(chunk) => buffer.extend_from_slice(&chunk?),
                    None => {
                        finished = true;
                        break;
                    }
                }
            }
            if buffer.is_empty() {
                break;
            }

            let part_number = i32::try_from(parts.len() + 1)
                .map_err(|_| Error::unrecoverable(format!("{key}: too many parts")))?;
            let body = buffer.split().freeze();
            total += body.len() as u64;
            let uploaded = self
                .client
                .upload_part()
                .bucket(&self.bucket)
                .key(key)
                .upload_id(upload_id)
                .part_number(part_number)
                .body(S3Body::from(body.to_vec()))
                .send()
                .await
                .map_err(|err| map_sdk_error(&err, key))?;
            parts.push(
                CompletedPart::builder()
                    .set_e_tag(uploaded.e_tag().map(str::to_string))
                    .part_number(part_number)
                    .build(),
            );
        }

        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(parts))
                    .build(),
            )
            .send()
            .await
            .map_err(|err| map_sdk_error(&err, key))?;
        Ok(total)
    }
}

#[async_trait]
impl RemoteDataClient for S3Client {
    fn system_type(&self) -> SystemType {
        SystemType::S3
    }

    fn system_id(&self) -> &str {
        &self.system_id
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            native_ops: false,
            directories: false,
            streaming: true,
            backend_transfers: false,
            writable: true,
        }
    }

    async fn list(&self, path: &str, options: &ListOptions) -> Result<Vec<FileInfo>> {
        let relative = path::normalize(path)?;
        let key = self.key(&relative);
        if !relative.is_empty() {
            if let Some(object) = self.head(&key).await? {
                return Ok(options.apply(vec![object]));
            }
        }

        let prefix = if key.is_empty() { String::new() } else { format!("{key}/") };
        let wanted = match (&options.filter, options.limit) {
            (None, Some(limit)) => Some(limit.saturating_add(options.offset)),
            _ => None,
        };
        let max_depth = options.max_depth.filter(|_| options.recurse);
        let entries = self
            .list_prefix(&prefix, !options.recurse, Collected::new(&relative, max_depth, wanted))
            .await?;
        if entries.is_empty() && !relative.is_empty() {
            return Err(Error::not_found(format!("{}:/{}", self.system_id, relative)));
        }
        Ok(options.apply(entries))
    }

    async fn get_file_info(&self, path: &str, _follow_links: bool) -> Result<Option<FileInfo>> {
        let relative = path::normalize(path)?;
        let key = self.key(&relative);
        if relative.is_empty() {
            return Ok(Some(self.entry(&key, 0, true, None)));
        }
        if let Some(object) = self.head(&key).await? {
            return Ok(Some(object));
        }
        let page = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(format!("{key}/"))
            .max_keys(1)
            .send()
            .await
            .map_err(|err| map_sdk_error(&err, &key))?;
        if page.contents().is_empty() {
            return Ok(None);
        }
        Ok(Some(self.entry(&key, 0, true, None)))
    }

    async fn get_stream(&self, path: &str) -> Result<ByteStream> {
        let key = self.key(&path::normalize(path)?);
        let object = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .map_err(|err| map_sdk_error(&err, &key))?;
        let stream = ReaderStream::new(object.body.into_async_read())
            .map(|chunk| chunk.map_err(Error::from));
        Ok(Box::pin(stream))
    }

    async fn upload(&self, path: &str, mut stream: ByteStream) -> Result<u64> {
        let key = self.key(&path::normalize(path)?);
        let mut buffer = BytesMut::new();
        while buffer.len() < PART_SIZE {
            match stream.next().await {
                Some(chunk) => buffer.extend_from_slice(&chunk?),
                None => {
                    let size = buffer.len() as u64;
                    self.put_single(&key, buffer.to_vec()).await?;
                    debug!(key, bytes = size, "Uploaded object");
                    return Ok(size);
                }
            }
        }
        let size = self.upload_multipart(&key, buffer, &mut stream).await?;
        debug!(key, bytes = size, "Uploaded object in parts");
        Ok(size)
    }

    async fn mkdir(&self, _path: &str) -> Result<()> {
        Ok(())
    }

    async fn move_path(&self, from: &str, to: &str) -> Result<()> {
        let from_relative = path::normalize(from)?;
        let to_relative = path::normalize(to)?;
        for key in self.keys_under(&from_relative).await? {
            let suffix = self
                .relative(&key)
                .strip_prefix(from_relative.as_str())
                .unwrap_or_default()
                .trim_start_matches('/')
                .to_string();
            let target = self.key(&path::join(&to_relative, &suffix));
            self.client
                .copy_object()
                .bucket(&self.bucket)
                .copy_source(copy_source(&self.bucket, &key))
                .key(&target)
                .send()
                .await
                .map_err(|err| map_sdk_error(&err, &key))?;
            self.client
                .delete_object()
                .bucket(&self.bucket)
                .key(&key)
                .send()
                .await
                .map_err(|err| map_sdk_error(&err, &key))?;
        }
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let relative = path::normalize(path)?;
        for key in self.keys_under(&relative).await? {
            self.client
                .delete_object()
                .bucket(&self.bucket)
                .key(&key)
                .send()
                .await
                .map_err(|err| map_sdk_error(&err, &key))?;
        }
        Ok(())
    }
}
