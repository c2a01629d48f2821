//! Transfer URIs
//!
//! Two forms are accepted: `tapis://tenant/systemId/path` addressing a registered
//! storage system, and plain `http://` or `https://` URLs usable as sources only.

use crate::error::Error;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

const TAPIS_SCHEME: &str = "tapis://";

/// A parsed source or destination address
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum TransferUri {
    /// A path on a registered storage system
    Tapis {
        /// Tenant the system belongs to
        tenant: String,
        /// System identifier
        system_id: String,
        /// Absolute path on the system, always starting with `/`
        path: String,
    },
    /// A plain web resource
    Http {
        /// The full URL
        url: String,
    },
}

impl TransferUri {
    /// Build a tapis URI
    pub fn tapis(tenant: impl Into<String>, system_id: impl Into<String>, path: &str) -> Self {
        Self::Tapis {
            tenant: tenant.into(),
            system_id: system_id.into(),
            path: format!("/{}", path.trim_start_matches('/')),
        }
    }

    /// Whether this URI addresses a registered storage system
    pub fn is_tapis(&self) -> bool {
        matches!(self, Self::Tapis { .. })
    }

    /// Tenant of a tapis URI
    pub fn tenant(&self) -> Option<&str> {
        match self {
            Self::Tapis { tenant, .. } => Some(tenant),
            Self::Http { .. } => None,
        }
    }

    /// System id of a tapis URI
    pub fn system_id(&self) -> Option<&str> {
        match self {
            Self::Tapis { system_id, .. } => Some(system_id),
            Self::Http { .. } => None,
        }
    }

    /// Path on the system, or the URL path for HTTP sources
    pub fn path(&self) -> &str {
        match self {
            Self::Tapis { path, .. } => path,
            Self::Http { url } => url
                .split_once("://")
                .and_then(|(_, rest)| rest.find('/').map(|idx| &rest[idx..]))
                .unwrap_or("/"),
        }
    }

    /// Last path segment, empty for a root path
    pub fn file_name(&self) -> &str {
        self.path()
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .unwrap_or_default()
    }

    /// Append a relative path
    pub fn join(&self, relative: &str) -> Self {
        let relative = relative.trim_start_matches('/');
        if relative.is_empty() {
            return self.clone();
        }
        match self {
            Self::Tapis {
                tenant,
                system_id,
                path,
            } => Self::Tapis {
                tenant: tenant.clone(),
                system_id: system_id.clone(),
                path: format!("{}/{}", path.trim_end_matches('/'), relative),
            },
            Self::Http { url } => Self::Http {
                url: format!("{}/{}", url.trim_end_matches('/'), relative),
            },
        }
    }
}

impl FromStr for TransferUri {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(rest) = s.strip_prefix(TAPIS_SCHEME) {
            let mut parts = rest.splitn(3, '/');
            let tenant = parts.next().unwrap_or_default();
            let system_id = parts.next().unwrap_or_default();
            if tenant.is_empty() || system_id.is_empty() {
                return Err(Error::validation(format!(
                    "Invalid URI {s}: expected tapis://tenant/systemId/path"
                )));
            }
            let path = parts.next().unwrap_or_default();
            return Ok(Self::tapis(tenant, system_id, path));
        }

        let lower = s.to_ascii_lowercase();
        if lower.starts_with("http://") || lower.starts_with("https://") {
            let host = s.split_once("://").map(|(_, rest)| rest).unwrap_or_default();
            if host.is_empty() || host.starts_with('/') {
                return Err(Error::validation(format!("Invalid URI {s}: missing host")));
            }
            return Ok(Self::Http { url: s.to_string() });
        }

        Err(Error::validation(format!(
            "Invalid URI {s}: unsupported protocol"
        )))
    }
}

impl TryFrom<String> for TransferUri {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<TransferUri> for String {
    fn from(uri: TransferUri) -> Self {
        uri.to_string()
    }
}

impl fmt::Display for TransferUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tapis {
                tenant,
                system_id,
                path,
            } => write!(f, "{TAPIS_SCHEME}{tenant}/{system_id}{path}"),
            Self::Http { url } => f.write_str(url),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("tapis://t1/sysA/dir/file.txt", "t1", "sysA", "/dir/file.txt")]
    #[case("tapis://t1/sysA", "t1", "sysA", "/")]
    #[case("tapis://t1/sysA/", "t1", "sysA", "/")]
    fn test_parse_tapis(
        #[case] input: &str,
        #[case] tenant: &str,
        #[case] system: &str,
        #[case] path: &str,
    ) {
        let uri: TransferUri = input.parse().unwrap();
        assert_eq!(uri.tenant(), Some(tenant));
        assert_eq!(uri.system_id(), Some(system));
        assert_eq!(uri.path(), path);
    }

    #[rstest]
    #[case("ftp://host/file")]
    #[case("tapis://t1")]
    #[case("tapis:///sysA/x")]
    #[case("https://")]
    fn test_parse_rejects(#[case] input: &str) {
        assert!(input.parse::<TransferUri>().is_err());
    }

    #[test]
    fn test_http_uri() {
        let uri: TransferUri = "https://example.com/data/a.bin".parse().unwrap();
        assert!(!uri.is_tapis());
        assert_eq!(uri.path(), "/data/a.bin");
        assert_eq!(uri.file_name(), "a.bin");
    }

    #[test]
    fn test_join_and_display() {
        let uri: TransferUri = "tapis://t1/sysB/dir2/".parse().unwrap();
        assert_eq!(uri.join("sub/a.txt").to_string(), "tapis://t1/sysB/dir2/sub/a.txt");
        assert_eq!(uri.join("").to_string(), "tapis://t1/sysB/dir2/");
    }

    #[test]
    fn test_serde_as_string() {
        let uri = TransferUri::tapis("t1", "sysA", "dir");
        let json = serde_json::to_string(&uri).unwrap();
        assert_eq!(json, "\"tapis://t1/sysA/dir\"");
        let back: TransferUri = serde_json::from_str(&json).unwrap();
        assert_eq!(back, uri);
    }
}
