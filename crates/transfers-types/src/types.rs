//! File metadata returned by remote data clients

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One entry returned by a listing or stat call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileInfo {
    /// Path relative to the system root, without a leading slash
    pub path: String,
    /// Last path segment
    pub name: String,
    /// Size in bytes, zero for directories
    pub size: u64,
    /// Whether the entry is a directory or prefix
    pub is_dir: bool,
    /// Permission string in `ls -l` form, when the backend has one
    pub native_permissions: Option<String>,
    /// Modification time
    pub last_modified: Option<DateTime<Utc>>,
    /// Access URL built by the client
    pub url: String,
}

impl FileInfo {
    /// Whether any execute bit is set in the native permission string
    pub fn is_executable(&self) -> bool {
        self.native_permissions
            .as_deref()
            .is_some_and(|perms| !self.is_dir && perms.chars().skip(1).any(|c| c == 'x'))
    }

    /// Permission bits parsed back from an `ls -l` style string
    pub fn mode(&self) -> Option<u32> {
        let perms = self.native_permissions.as_deref()?;
        let bits: Vec<char> = perms.chars().collect();
        let bits = match bits.len() {
            10 => &bits[1..],
            9 => &bits[..],
            _ => return None,
        };
        let mut mode = 0u32;
        for (index, c) in bits.iter().enumerate() {
            let expected = ['r', 'w', 'x'][index % 3];
            mode <<= 1;
            if *c == expected {
                mode |= 1;
            } else if *c != '-' {
                return None;
            }
        }
        Some(mode)
    }

    /// Render a unix mode as `ls -l` style permissions
    pub fn mode_string(mode: u32, is_dir: bool) -> String {
        let mut out = String::with_capacity(10);
        out.push(if is_dir { 'd' } else { '-' });
        for shift in [6u32, 3, 0] {
            let bits = (mode >> shift) & 0o7;
            out.push(if bits & 0o4 != 0 { 'r' } else { '-' });
            out.push(if bits & 0o2 != 0 { 'w' } else { '-' });
            out.push(if bits & 0o1 != 0 { 'x' } else { '-' });
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(perms: Option<&str>, is_dir: bool) -> FileInfo {
        FileInfo {
            path: "bin/run.sh".into(),
            name: "run.sh".into(),
            size: 10,
            is_dir,
            native_permissions: perms.map(str::to_string),
            last_modified: None,
            url: "tapis://t1/sysA/bin/run.sh".into(),
        }
    }

    #[test]
    fn test_mode_string() {
        assert_eq!(FileInfo::mode_string(0o755, false), "-rwxr-xr-x");
        assert_eq!(FileInfo::mode_string(0o640, true), "drw-r-----");
    }

    #[test]
    fn test_is_executable() {
        assert!(info(Some("-rwxr-xr-x"), false).is_executable());
        assert!(!info(Some("-rw-r--r--"), false).is_executable());
        assert!(!info(Some("drwxr-xr-x"), true).is_executable());
        assert!(!info(None, false).is_executable());
    }

    #[test]
    fn test_mode_parsing() {
        assert_eq!(info(Some("-rwxr-xr-x"), false).mode(), Some(0o755));
        assert_eq!(info(Some("rw-r-----"), false).mode(), Some(0o640));
        assert_eq!(info(Some("-rwsr-xr-x"), false).mode(), None);
        assert_eq!(info(None, false).mode(), None);
        let rendered = FileInfo::mode_string(0o711, false);
        let mode = info(Some(rendered.as_str()), false).mode();
        assert_eq!(mode, Some(0o711));
    }
}
