//! Storage system descriptors returned by the systems registry

use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of storage backend behind a system
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SystemType {
    /// POSIX host reached over SSH/SFTP
    Linux,
    /// S3-compatible object store
    S3,
    /// iRODS zone
    Irods,
    /// Globus collection
    Globus,
    /// POSIX filesystem mounted on the worker host
    Local,
    /// Plain web source addressed by URL, never registered
    Http,
}

impl SystemType {
    /// Whether permission bits and native ops make sense
    pub fn is_posix(self) -> bool {
        matches!(self, Self::Linux | Self::Local)
    }

    /// Whether the backend models directories
    pub fn supports_directories(self) -> bool {
        !matches!(self, Self::S3 | Self::Http)
    }
}

impl fmt::Display for SystemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Linux => "LINUX",
            Self::S3 => "S3",
            Self::Irods => "IRODS",
            Self::Globus => "GLOBUS",
            Self::Local => "LOCAL",
            Self::Http => "HTTP",
        };
        f.write_str(name)
    }
}

/// Permission checked against the permission service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Permission {
    /// Read access, required on sources
    Read,
    /// Write access, required on destinations
    Modify,
}

/// Credentials resolved for the effective user of a system
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Credentials {
    /// Password login
    pub password: Option<String>,
    /// PEM private key
    pub private_key: Option<String>,
    /// Public key matching `private_key`
    pub public_key: Option<String>,
    /// Object store access key
    pub access_key: Option<String>,
    /// Object store secret
    pub access_secret: Option<String>,
    /// OAuth bearer token
    pub access_token: Option<String>,
}

// Secrets never reach logs.
impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mask = |v: &Option<String>| v.as_ref().map(|_| "***");
        f.debug_struct("Credentials")
            .field("password", &mask(&self.password))
            .field("private_key", &mask(&self.private_key))
            .field("public_key", &self.public_key.is_some())
            .field("access_key", &self.access_key)
            .field("access_secret", &mask(&self.access_secret))
            .field("access_token", &mask(&self.access_token))
            .finish()
    }
}

/// Everything needed to open a client against a system
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemDescriptor {
    /// System id
    pub id: String,
    /// Owning tenant
    pub tenant: String,
    /// Backend kind
    pub system_type: SystemType,
    /// Host name, endpoint URL or collection id depending on the backend
    #[serde(default)]
    pub host: String,
    /// Port, backend default when absent
    #[serde(default)]
    pub port: Option<u16>,
    /// Disabled systems reject every transfer
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// All paths are resolved beneath this directory
    #[serde(default = "default_root_dir")]
    pub root_dir: String,
    /// Bucket for object stores
    #[serde(default)]
    pub bucket_name: Option<String>,
    /// System owner
    #[serde(default)]
    pub owner: String,
    /// Login user on the backend
    #[serde(default)]
    pub effective_user: String,
    /// Resolved credentials
    #[serde(default)]
    pub credentials: Credentials,
}

fn default_enabled() -> bool {
    true
}

fn default_root_dir() -> String {
    "/".to_string()
}

impl SystemDescriptor {
    /// A minimal enabled descriptor
    pub fn new(
        tenant: impl Into<String>,
        id: impl Into<String>,
        system_type: SystemType,
        root_dir: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            tenant: tenant.into(),
            system_type,
            host: String::new(),
            port: None,
            enabled: true,
            root_dir: root_dir.into(),
            bucket_name: None,
            owner: String::new(),
            effective_user: String::new(),
            credentials: Credentials::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_defaults_from_yaml_like_json() {
        let system: SystemDescriptor =
            serde_json::from_str(r#"{"id":"sysA","tenant":"t1","systemType":"LINUX"}"#).unwrap();
        assert!(system.enabled);
        assert_eq!(system.root_dir, "/");
        assert!(system.system_type.is_posix());
    }

    #[test]
    fn test_credentials_debug_masks_secrets() {
        let credentials = Credentials {
            password: Some("hunter2".into()),
            access_secret: Some("s3cr3t".into()),
            ..Credentials::default()
        };
        let debug = format!("{credentials:?}");
        assert!(!debug.contains("hunter2"));
        assert!(!debug.contains("s3cr3t"));
    }

    #[test]
    fn test_capability_flags() {
        assert!(!SystemType::S3.supports_directories());
        assert!(SystemType::Irods.supports_directories());
        assert!(!SystemType::Globus.is_posix());
        assert_eq!(SystemType::Globus.to_string(), "GLOBUS");
    }
}
