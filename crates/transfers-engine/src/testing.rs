//! In-memory client for a backend that runs transfers itself

use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use transfers_client::{
    BackendTransferStatus, ByteStream, Capabilities, ClientFactory, ListOptions, RemoteDataClient,
};
use transfers_types::{Error, FileInfo, Result, SystemDescriptor, SystemType, TransferUri};

pub struct BackendStub {
    pub status: Mutex<BackendTransferStatus>,
    pub source_is_dir: bool,
    pub entries: Vec<FileInfo>,
    pub listings: Mutex<Vec<ListOptions>>,
    pub submitted: Mutex<Vec<String>>,
    pub polled: Mutex<Vec<String>>,
    pub cancelled: Mutex<Vec<String>>,
}

impl BackendStub {
    pub fn new(status: BackendTransferStatus) -> Self {
        Self {
            status: Mutex::new(status),
            source_is_dir: false,
            entries: Vec::new(),
            listings: Mutex::new(Vec::new()),
            submitted: Mutex::new(Vec::new()),
            polled: Mutex::new(Vec::new()),
            cancelled: Mutex::new(Vec::new()),
        }
    }

    pub fn with_directory(mut self, entries: Vec<FileInfo>) -> Self {
        self.source_is_dir = true;
        self.entries = entries;
        self
    }

    pub fn factory(self: &Arc<Self>) -> Arc<dyn ClientFactory> {
        Arc::new(StubFactory(Arc::clone(self)))
    }
}

pub fn entry(path: &str, is_dir: bool, size: u64) -> FileInfo {
    FileInfo {
        path: path.trim_start_matches('/').to_string(),
        name: path.rsplit('/').next().unwrap_or(path).to_string(),
        size,
        is_dir,
        native_permissions: None,
        last_modified: None,
        url: String::new(),
    }
}

#[async_trait]
impl RemoteDataClient for BackendStub {
    fn system_type(&self) -> SystemType {
        SystemType::Globus
    }

    fn system_id(&self) -> &str {
        "globus"
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

    async fn list(&self, _path: &str, options: &ListOptions) -> Result<Vec<FileInfo>> {
        self.listings.lock().unwrap().push(options.clone());
        Ok(options.apply(self.entries.clone()))
    }

    async fn get_file_info(&self, path: &str, _follow_links: bool) -> Result<Option<FileInfo>> {
        Ok(Some(entry(path, self.source_is_dir, 0)))
    }

    async fn get_stream(&self, _path: &str) -> Result<ByteStream> {
        Err(Error::not_supported("stream", "GLOBUS"))
    }

    async fn upload(&self, _path: &str, _stream: ByteStream) -> Result<u64> {
        Err(Error::not_supported("upload", "GLOBUS"))
    }

    async fn mkdir(&self, _path: &str) -> Result<()> {
        Ok(())
    }

    async fn move_path(&self, _from: &str, _to: &str) -> Result<()> {
        Ok(())
    }

    async fn delete(&self, _path: &str) -> Result<()> {
        Ok(())
    }

    async fn submit_backend_transfer(
        &self,
        src_path: &str,
        _destination: &SystemDescriptor,
        _dest_path: &str,
        _recursive: bool,
    ) -> Result<String> {
        let mut submitted = self.submitted.lock().unwrap();
        submitted.push(src_path.to_string());
        Ok(format!("ext-{}", submitted.len()))
    }

    async fn backend_transfer_status(&self, external_id: &str) -> Result<BackendTransferStatus> {
        self.polled.lock().unwrap().push(external_id.to_string());
        Ok(self.status.lock().unwrap().clone())
    }

    async fn cancel_backend_transfer(&self, external_id: &str) -> Result<()> {
        self.cancelled.lock().unwrap().push(external_id.to_string());
        Ok(())
    }
}

struct StubFactory(Arc<BackendStub>);

#[async_trait]
impl ClientFactory for StubFactory {
    async fn client_for_system(&self, _system: &SystemDescriptor) -> Result<Arc<dyn RemoteDataClient>> {
        Ok(Arc::clone(&self.0) as Arc<dyn RemoteDataClient>)
    }

    fn client_for_url(&self, uri: &TransferUri) -> Result<Arc<dyn RemoteDataClient>> {
        Err(Error::validation(format!("no client for {uri}")))
    }
}
