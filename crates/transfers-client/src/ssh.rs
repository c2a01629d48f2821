//! POSIX hosts reached over SSH/SFTP
//!
//! `ssh2` is a blocking library, so every operation checks a session out of the
//! shared pool and runs on the blocking thread pool. Streams are bridged to async
//! code through bounded channels.

use crate::client::{ByteStream, Capabilities, ListOptions, NativeOp, NativeOpResult, RemoteDataClient};
use crate::pool::{ConnectionPool, Pooled};
use crate::{listing, path};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{TimeZone, Utc};
use futures::StreamExt;
use ssh2::{ErrorCode, FileStat, Session, Sftp};
use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::Path;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use transfers_types::{Credentials, Error, FileInfo, Result, SystemDescriptor, SystemType};

const DEFAULT_SSH_PORT: u16 = 22;
const OPERATION_TIMEOUT_MS: u32 = 120_000;
const SFTP_NO_SUCH_FILE: i32 = 2;
const SFTP_PERMISSION_DENIED: i32 = 3;

/// Pool of authenticated SSH sessions shared by every SSH client
pub type SshPool = ConnectionPool<Session>;

#[derive(Clone)]
struct ConnectParams {
    host: String,
    port: u16,
    user: String,
    credentials: Credentials,
    timeout: Duration,
}

impl ConnectParams {
    fn key(&self) -> String {
        format!("{}@{}:{}", self.user, self.host, self.port)
    }

    fn connect(&self) -> Result<Session> {
        let addr = (self.host.as_str(), self.port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| Error::io(format!("Cannot resolve host {}", self.host)))?;
        let tcp = TcpStream::connect_timeout(&addr, self.timeout)?;

        let mut session = Session::new().map_err(|e| map_ssh_error(&e, &self.host))?;
        session.set_timeout(self.timeout.as_millis().min(u128::from(u32::MAX)) as u32);
        session.set_tcp_stream(tcp);
        session
            .handshake()
            .map_err(|e| Error::io(format!("SSH handshake with {} failed: {}", self.host, e)))?;

        let auth = if let Some(private_key) = &self.credentials.private_key {
            session.userauth_pubkey_memory(
                &self.user,
                self.credentials.public_key.as_deref(),
                private_key,
                None,
            )
        } else if let Some(password) = &self.credentials.password {
            session.userauth_password(&self.user, password)
        } else {
            return Err(Error::forbidden(format!(
                "No SSH credentials for {}",
                self.key()
            )));
        };

        if let Err(e) = auth {
            return Err(Error::forbidden(format!(
                "SSH authentication failed for {}: {}",
                self.key(),
                e
            )));
        }
        if !session.authenticated() {
            return Err(Error::forbidden(format!(
                "SSH authentication failed for {}",
                self.key()
            )));
        }

        session.set_timeout(OPERATION_TIMEOUT_MS);
        debug!(target = %self.key(), "SSH session established");
        Ok(session)
    }
}

fn map_ssh_error(error: &ssh2::Error, path: &str) -> Error {
    match error.code() {
        ErrorCode::SFTP(SFTP_NO_SUCH_FILE) => Error::not_found(path.to_string()),
        ErrorCode::SFTP(SFTP_PERMISSION_DENIED) => {
            Error::forbidden(format!("Permission denied: {path}"))
        }
        _ => Error::io(format!("{path}: {error}")),
    }
}

fn quote(arg: &str) -> String {
    format!("'{}'", arg.replace('\'', r"'\''"))
}

/// Client for a Linux host over SFTP
pub struct SshClient {
    tenant: String,
    system_id: String,
    root: String,
    params: ConnectParams,
    pool: SshPool,
    chunk_size: usize,
}

impl SshClient {
    /// Create a client for `system`, sharing sessions through `pool`
    pub fn new(
        system: &SystemDescriptor,
        pool: SshPool,
        connect_timeout: Duration,
        chunk_size: usize,
    ) -> Self {
        Self {
            tenant: system.tenant.clone(),
            system_id: system.id.clone(),
            root: system.root_dir.clone(),
            params: ConnectParams {
                host: system.host.clone(),
                port: system.port.unwrap_or(DEFAULT_SSH_PORT),
                user: system.effective_user.clone(),
                credentials: system.credentials.clone(),
                timeout: connect_timeout,
            },
            pool,
            chunk_size,
        }
    }

    async fn session(&self) -> Result<Pooled<Session>> {
        let params = self.params.clone();
        self.pool
            .checkout(&self.params.key(), || async move {
                tokio::task::spawn_blocking(move || params.connect())
                    .await
                    .map_err(|e| Error::other(format!("SSH connect task failed: {e}")))?
            })
            .await
    }

    /// Run `op` with a pooled session on the blocking pool
    async fn run<R, F>(&self, op: F) -> Result<R>
    where
        F: FnOnce(&Session) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let mut conn = self.session().await?;
        tokio::task::spawn_blocking(move || {
            let result = op(&conn);
            if matches!(&result, Err(e) if e.is_retryable()) {
                conn.mark_broken();
            }
            result
        })
        .await
        .map_err(|e| Error::other(format!("SSH task failed: {e}")))?
    }

    fn absolute(&self, relative: &str) -> Result<String> {
        path::resolve(&self.root, relative)
    }

    fn file_info(&self, relative: &str, stat: &FileStat) -> FileInfo {
        let is_dir = stat.is_dir();
        FileInfo {
            path: relative.to_string(),
            name: path::file_name(relative).to_string(),
            size: if is_dir { 0 } else { stat.size.unwrap_or(0) },
            is_dir,
            native_permissions: stat.perm.map(|mode| FileInfo::mode_string(mode, is_dir)),
            last_modified: stat
                .mtime
                .and_then(|secs| Utc.timestamp_opt(secs as i64, 0).single()),
            url: path::file_url(&self.tenant, &self.system_id, relative),
        }
    }
}

fn open_sftp(session: &Session, path: &str) -> Result<Sftp> {
    session.sftp().map_err(|e| map_ssh_error(&e, path))
}

fn mkdirs(sftp: &Sftp, absolute: &str) -> Result<()> {
    let mut current = String::new();
    for segment in absolute.split('/').filter(|s| !s.is_empty()) {
        current.push('/');
        current.push_str(segment);
        let dir = Path::new(&current);
        if sftp.stat(dir).is_err() {
            if let Err(e) = sftp.mkdir(dir, 0o755) {
                // Lost a race with another writer.
                if !sftp.stat(dir).is_ok_and(|s| s.is_dir()) {
                    return Err(map_ssh_error(&e, &current));
                }
            }
        }
    }
    Ok(())
}

fn remove_tree(sftp: &Sftp, absolute: &str) -> Result<()> {
    let target = Path::new(absolute);
    let stat = sftp.lstat(target).map_err(|e| map_ssh_error(&e, absolute))?;
    if stat.is_dir() {
        for (child, _) in sftp.readdir(target).map_err(|e| map_ssh_error(&e, absolute))? {
            let name = child.file_name().map(|n| n.to_string_lossy().into_owned());
            if matches!(name.as_deref(), Some(".") | Some("..") | None) {
                continue;
            }
            remove_tree(sftp, &child.to_string_lossy())?;
        }
        sftp.rmdir(target).map_err(|e| map_ssh_error(&e, absolute))
    } else {
        sftp.unlink(target).map_err(|e| map_ssh_error(&e, absolute))
    }
}

fn read_file(session: &Session, absolute: &str, chunk_size: usize, tx: &mpsc::Sender<Result<Bytes>>) -> Result<()> {
    let sftp = open_sftp(session, absolute)?;
    let mut file = sftp
        .open(Path::new(absolute))
        .map_err(|e| map_ssh_error(&e, absolute))?;
    let mut buffer = vec![0u8; chunk_size];
    loop {
        let n = file.read(&mut buffer)?;
        if n == 0 {
            return Ok(());
        }
        if tx.blocking_send(Ok(Bytes::copy_from_slice(&buffer[..n]))).is_err() {
            // Reader went away.
            return Ok(());
        }
    }
}

fn write_file(session: &Session, absolute: &str, rx: &mut mpsc::Receiver<Bytes>) -> Result<u64> {
    let sftp = open_sftp(session, absolute)?;
    if let Some((parent, _)) = absolute.rsplit_once('/') {
        if !parent.is_empty() {
            mkdirs(&sftp, parent)?;
        }
    }
    let mut file = sftp
        .create(Path::new(absolute))
        .map_err(|e| map_ssh_error(&e, absolute))?;
    let mut written = 0u64;
    while let Some(chunk) = rx.blocking_recv() {
        file.write_all(&chunk)?;
        written += chunk.len() as u64;
    }
    file.flush()?;
    Ok(written)
}

#[async_trait]
impl RemoteDataClient for SshClient {
    fn system_type(&self) -> SystemType {
        SystemType::Linux
    }

    fn system_id(&self) -> &str {
        &self.system_id
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            native_ops: true,
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
        let absolute = self.absolute(&relative)?;
        let base = relative.clone();
        let raw = self
            .run(move |session| {
                let sftp = open_sftp(session, &absolute)?;
                let stat = sftp
                    .stat(Path::new(&absolute))
                    .map_err(|e| map_ssh_error(&e, &absolute))?;
                if !stat.is_dir() {
                    return Ok(vec![(base, stat)]);
                }
                let entries = sftp
                    .readdir(Path::new(&absolute))
                    .map_err(|e| map_ssh_error(&e, &absolute))?;
                Ok(entries
                    .into_iter()
                    .filter_map(|(child, stat)| {
                        let name = child.file_name()?.to_string_lossy().into_owned();
                        (name != "." && name != "..").then(|| (path::join(&base, &name), stat))
                    })
                    .collect())
            })
            .await?;

        let mut entries: Vec<FileInfo> = raw
            .iter()
            .map(|(rel, stat)| self.file_info(rel, stat))
            .collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(options.apply(entries))
    }

    async fn get_file_info(&self, path: &str, follow_links: bool) -> Result<Option<FileInfo>> {
        let relative = path::normalize(path)?;
        let absolute = self.absolute(&relative)?;
        let stat = self
            .run(move |session| {
                let sftp = open_sftp(session, &absolute)?;
                let target = Path::new(&absolute);
                let stat = if follow_links {
                    sftp.stat(target)
                } else {
                    sftp.lstat(target)
                };
                match stat {
                    Ok(stat) => Ok(Some(stat)),
                    Err(e) => match map_ssh_error(&e, &absolute) {
                        Error::NotFound { .. } => Ok(None),
                        other => Err(other),
                    },
                }
            })
            .await?;
        Ok(stat.map(|stat| self.file_info(&relative, &stat)))
    }

    async fn get_stream(&self, path: &str) -> Result<ByteStream> {
        let absolute = self.absolute(path)?;
        let mut conn = self.session().await?;
        let chunk_size = self.chunk_size;
        let (tx, rx) = mpsc::channel::<Result<Bytes>>(4);

        tokio::task::spawn_blocking(move || {
            if let Err(e) = read_file(&conn, &absolute, chunk_size, &tx) {
                if e.is_retryable() {
                    conn.mark_broken();
                }
                let _ = tx.blocking_send(Err(e));
            }
        });

        let stream = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });
        Ok(Box::pin(stream))
    }

    async fn upload(&self, path: &str, mut stream: ByteStream) -> Result<u64> {
        let absolute = self.absolute(path)?;
        let mut conn = self.session().await?;
        let (tx, mut rx) = mpsc::channel::<Bytes>(4);

        let writer = tokio::task::spawn_blocking(move || {
            let result = write_file(&conn, &absolute, &mut rx);
            if matches!(&result, Err(e) if e.is_retryable()) {
                conn.mark_broken();
            }
            result
        });

        let mut source_error = None;
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(chunk) => {
                    if tx.send(chunk).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    source_error = Some(e);
                    break;
                }
            }
        }
        drop(tx);

        let written = writer
            .await
            .map_err(|e| Error::other(format!("SSH upload task failed: {e}")))??;
        match source_error {
            Some(e) => Err(e),
            None => Ok(written),
        }
    }

    async fn mkdir(&self, path: &str) -> Result<()> {
        let absolute = self.absolute(path)?;
        self.run(move |session| mkdirs(&open_sftp(session, &absolute)?, &absolute))
            .await
    }

    async fn move_path(&self, from: &str, to: &str) -> Result<()> {
        let source = self.absolute(from)?;
        let target = self.absolute(to)?;
        self.run(move |session| {
            let sftp = open_sftp(session, &source)?;
            if let Some((parent, _)) = target.rsplit_once('/') {
                if !parent.is_empty() {
                    mkdirs(&sftp, parent)?;
                }
            }
            sftp.rename(Path::new(&source), Path::new(&target), None)
                .map_err(|e| map_ssh_error(&e, &source))
        })
        .await
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let absolute = self.absolute(path)?;
        self.run(move |session| remove_tree(&open_sftp(session, &absolute)?, &absolute))
            .await
    }

    async fn native_op(
        &self,
        op: &NativeOp,
        path: &str,
        recursive: bool,
    ) -> Result<NativeOpResult> {
        op.validate()?;
        let absolute = self.absolute(path)?;
        let argument = match op {
            NativeOp::Chmod(value) | NativeOp::Chown(value) | NativeOp::Chgrp(value) => value.clone(),
        };
        let command = format!(
            "{}{} {} {}",
            op.command(),
            if recursive { " -R" } else { "" },
            argument,
            quote(&absolute)
        );

        self.run(move |session| {
            let mut channel = session
                .channel_session()
                .map_err(|e| map_ssh_error(&e, &absolute))?;
            channel
                .exec(&command)
                .map_err(|e| map_ssh_error(&e, &absolute))?;
            let mut stdout = String::new();
            channel.read_to_string(&mut stdout)?;
            let mut stderr = String::new();
            channel.stderr().read_to_string(&mut stderr)?;
            channel
                .wait_close()
                .map_err(|e| map_ssh_error(&e, &absolute))?;
            let exit_code = channel
                .exit_status()
                .map_err(|e| map_ssh_error(&e, &absolute))?;
            if exit_code != 0 {
                warn!(command = %command, exit_code, "Native operation returned non-zero exit code");
            }
            Ok(NativeOpResult {
                exit_code,
                stdout,
                stderr,
            })
        })
        .await
    }
}
