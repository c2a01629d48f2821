//! # Transfers Client
//!
//! Uniform access to heterogeneous storage backends. Each backend implements
//! [`RemoteDataClient`]; the [`ClientFactory`] picks the implementation from the
//! system type once, so nothing above this crate branches on the backend.
//!
//! | Backend | Client | Notes |
//! |---------|--------|-------|
//! | `LOCAL` | [`LocalClient`] | filesystem on the worker host |
//! | `LINUX` | [`SshClient`] | SFTP over pooled SSH sessions |
//! | `S3` | [`S3Client`] | no directories |
//! | `IRODS` | [`IrodsClient`] | iRODS HTTP API |
//! | `GLOBUS` | [`GlobusClient`] | backend managed transfers |
//! | `HTTP` | [`HttpClient`] | read-only sources |
//!
//! All paths are relative to the system root and are normalised with
//! [`path::normalize`], which rejects any `..` leaving the root.

#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod client;
pub mod factory;
pub mod glob;
pub mod globus;
pub mod http;
pub mod irods;
pub mod listing;
pub mod local;
pub mod path;
pub mod pool;
pub mod s3;
pub mod ssh;

pub use client::{
    BackendTransferStatus, ByteStream, Capabilities, ListOptions, NativeOp, NativeOpResult,
    RemoteDataClient,
};
pub use factory::{ClientFactory, DefaultClientFactory};
pub use globus::GlobusClient;
pub use http::HttpClient;
pub use irods::IrodsClient;
pub use local::LocalClient;
pub use pool::{ConnectionPool, PoolConfig, Pooled};
pub use s3::S3Client;
pub use ssh::{SshClient, SshPool};
