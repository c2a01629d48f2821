//! External collaborators: the systems registry and the permission service
//!
//! The engine only calls these interfaces. The static implementations back the
//! CLI and the tests.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use tracing::debug;
use transfers_types::{Error, Permission, Result, SystemDescriptor, TransferUri};

/// Resolves system ids into descriptors with credentials
#[async_trait]
pub trait SystemsRegistry: Send + Sync {
    /// Look up a system. `shared_ctx` names the grantor a trusted service acts for.
    async fn get_system(
        &self,
        tenant: &str,
        system_id: &str,
        username: &str,
        shared_ctx: Option<&str>,
    ) -> Result<Option<SystemDescriptor>>;
}

/// Answers whether a user holds a permission on a path
#[async_trait]
pub trait PermissionService: Send + Sync {
    /// Whether `username` holds `permission` on `system_id:path`
    async fn is_permitted(
        &self,
        tenant: &str,
        username: &str,
        system_id: &str,
        path: &str,
        permission: Permission,
    ) -> Result<bool>;
}

/// Resolve the system a tapis URI points at. Missing and disabled systems are
/// both fatal for the task asking.
pub async fn resolve_system(
    registry: &dyn SystemsRegistry,
    uri: &TransferUri,
    username: &str,
    shared_ctx: Option<&str>,
) -> Result<SystemDescriptor> {
    let (Some(tenant), Some(system_id)) = (uri.tenant(), uri.system_id()) else {
        return Err(Error::validation(format!("{uri} does not name a system")));
    };
    let system = registry
        .get_system(tenant, system_id, username, shared_ctx)
        .await?
        .ok_or_else(|| Error::not_found(format!("system {system_id}")))?;
    if !system.enabled {
        return Err(Error::SystemDisabled {
            system_id: system.id,
        });
    }
    Ok(system)
}

/// File format of a systems file
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct SystemsFile {
    /// Registered systems
    #[serde(default)]
    pub systems: Vec<SystemDescriptor>,
}

/// Registry backed by a fixed set of descriptors
#[derive(Debug, Default, Clone)]
pub struct StaticSystems {
    systems: HashMap<(String, String), SystemDescriptor>,
}

impl StaticSystems {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a system
    pub fn insert(&mut self, system: SystemDescriptor) {
        self.systems
            .insert((system.tenant.clone(), system.id.clone()), system);
    }

    /// Builder style [`Self::insert`]
    pub fn with_system(mut self, system: SystemDescriptor) -> Self {
        self.insert(system);
        self
    }

    /// Parse a YAML systems file
    pub fn from_yaml(content: &str) -> Result<Self> {
        let file: SystemsFile = serde_yaml::from_str(content).map_err(|e| Error::Config {
            message: format!("Invalid systems file: {e}"),
        })?;
        Ok(file.systems.into_iter().fold(Self::new(), Self::with_system))
    }

    /// Load a YAML systems file
    pub async fn load(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path).await.map_err(|e| Error::Config {
            message: format!("Cannot read {}: {e}", path.display()),
        })?;
        let systems = Self::from_yaml(&content)?;
        debug!(path = %path.display(), count = systems.systems.len(), "Loaded systems");
        Ok(systems)
    }

    /// Number of registered systems
    pub fn len(&self) -> usize {
        self.systems.len()
    }

    /// Whether no system is registered
    pub fn is_empty(&self) -> bool {
        self.systems.is_empty()
    }
}

#[async_trait]
impl SystemsRegistry for StaticSystems {
    async fn get_system(
        &self,
        tenant: &str,
        system_id: &str,
        _username: &str,
        _shared_ctx: Option<&str>,
    ) -> Result<Option<SystemDescriptor>> {
        Ok(self
            .systems
            .get(&(tenant.to_string(), system_id.to_string()))
            .cloned())
    }
}

/// Permission service with explicit grants, or allowing everything
#[derive(Debug, Default, Clone)]
pub struct StaticPermissions {
    allow_all: bool,
    grants: HashSet<(String, String, String, Permission)>,
}

impl StaticPermissions {
    /// Grant every permission to everyone
    pub fn allow_all() -> Self {
        Self {
            allow_all: true,
            grants: HashSet::new(),
        }
    }

    /// Deny everything not granted explicitly
    pub fn deny_by_default() -> Self {
        Self::default()
    }

    /// Grant `permission` on a whole system. MODIFY implies READ.
    pub fn grant(
        mut self,
        tenant: impl Into<String>,
        username: impl Into<String>,
        system_id: impl Into<String>,
        permission: Permission,
    ) -> Self {
        self.grants
            .insert((tenant.into(), username.into(), system_id.into(), permission));
        self
    }

    fn holds(&self, tenant: &str, username: &str, system_id: &str, permission: Permission) -> bool {
        self.grants.contains(&(
            tenant.to_string(),
            username.to_string(),
            system_id.to_string(),
            permission,
        ))
    }
}

#[async_trait]
impl PermissionService for StaticPermissions {
    async fn is_permitted(
        &self,
        tenant: &str,
        username: &str,
        system_id: &str,
        _path: &str,
        permission: Permission,
    ) -> Result<bool> {
        if self.allow_all {
            return Ok(true);
        }
        Ok(self.holds(tenant, username, system_id, permission)
            || (permission == Permission::Read
                && self.holds(tenant, username, system_id, Permission::Modify)))
    }
}
