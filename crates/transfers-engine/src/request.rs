//! Transfer request service
//!
//! Validates a request as a whole, persists the top task with its parents in
//! one store call, then hands each parent to the parent queue. Also serves the
//! read and cancel operations on existing transfers.

use crate::systems::{PermissionService, SystemsRegistry};
use std::sync::Arc;
use tracing::{debug, info, warn};
use transfers_config::SecurityConfig;
use transfers_queue::{ControlChannel, TaskQueue};
use transfers_store::TaskStore;
use transfers_types::{
    ControlMessage, Error, ParentDetails, Permission, Result, SystemDescriptor, SystemType,
    TransferDetails, TransferRequest, TransferRequestElement, TransferTask, TransferTaskParent,
    TransferUri,
};
use uuid::Uuid;

/// Entry point for submitting, reading and cancelling transfers
#[derive(Clone)]
pub struct TransferRequestService {
    store: Arc<dyn TaskStore>,
    parent_queue: TaskQueue<TransferTaskParent>,
    control: ControlChannel,
    systems: Arc<dyn SystemsRegistry>,
    permissions: Arc<dyn PermissionService>,
    security: SecurityConfig,
}

impl TransferRequestService {
    /// Create the service over its collaborators
    pub fn new(
        store: Arc<dyn TaskStore>,
        parent_queue: TaskQueue<TransferTaskParent>,
        control: ControlChannel,
        systems: Arc<dyn SystemsRegistry>,
        permissions: Arc<dyn PermissionService>,
        security: SecurityConfig,
    ) -> Self {
        Self {
            store,
            parent_queue,
            control,
            systems,
            permissions,
            security,
        }
    }

    /// Validate and persist a request, then queue its parent tasks.
    ///
    /// Every element is checked before anything is written; a rejected request
    /// reports all of its problems at once and leaves nothing behind.
    pub async fn create_transfer(&self, request: TransferRequest) -> Result<TransferTask> {
        if request.elements.is_empty() {
            return Err(Error::validation("A transfer request needs at least one element"));
        }
        if request.elements.iter().any(TransferRequestElement::uses_shared_ctx)
            && !self.security.is_trusted(&request.username)
        {
            return Err(Error::forbidden(format!(
                "User {} may not request a shared context",
                request.username
            )));
        }

        let mut errors = Vec::new();
        for (index, element) in request.elements.iter().enumerate() {
            if let Err(e) = self.validate_element(&request, element).await {
                errors.extend(e.into_iter().map(|message| format!("element {index}: {message}")));
            }
        }
        if !errors.is_empty() {
            debug!(
                tenant = %request.tenant_id,
                user = %request.username,
                errors = errors.len(),
                "Rejected transfer request"
            );
            return Err(Error::validation(errors.join("; ")));
        }

        let mut task = TransferTask::new(&request.tenant_id, &request.username, request.tag);
        let parents: Vec<_> = request
            .elements
            .iter()
            .map(|element| TransferTaskParent::new(&task, element))
            .collect();
        task.parent_tasks = parents;
        self.store.create_transfer(&task).await?;
        info!(
            task_id = %task.id,
            tenant = %task.tenant_id,
            user = %task.username,
            parents = task.parent_tasks.len(),
            "Transfer accepted"
        );

        // A parent whose message is lost is picked up by the scheduler once it
        // has been ACCEPTED for longer than the grace period.
        for parent in &task.parent_tasks {
            if let Err(e) = self.parent_queue.publish(parent).await {
                warn!(parent_id = %parent.id, "Failed to queue parent task: {}", e);
            }
        }
        Ok(task)
    }

    /// A transfer with its parent tasks. Transfers of other users are reported
    /// as missing.
    pub async fn get_transfer(&self, tenant: &str, username: &str, id: Uuid) -> Result<TransferTask> {
        match self.store.get_transfer(id).await? {
            Some(task) if task.tenant_id == tenant && task.username == username => Ok(task),
            _ => Err(Error::not_found(format!("transfer {id}"))),
        }
    }

    /// A transfer with every parent and child task
    pub async fn get_transfer_details(
        &self,
        tenant: &str,
        username: &str,
        id: Uuid,
    ) -> Result<TransferDetails> {
        let mut task = self.get_transfer(tenant, username, id).await?;
        let mut parents = Vec::with_capacity(task.parent_tasks.len());
        for parent in std::mem::take(&mut task.parent_tasks) {
            let children = self.store.get_parent_children(parent.id).await?;
            parents.push(ParentDetails { parent, children });
        }
        Ok(TransferDetails { task, parents })
    }

    /// Transfers of one user, newest first
    pub async fn list_transfers(
        &self,
        tenant: &str,
        username: &str,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<TransferTask>> {
        self.store.list_transfers(tenant, username, offset, limit).await
    }

    /// Cancel every unfinished task of a transfer and signal the workers running
    /// its children. Cancelling a finished transfer changes nothing.
    pub async fn cancel_transfer(&self, tenant: &str, username: &str, id: Uuid) -> Result<TransferTask> {
        let task = self.get_transfer(tenant, username, id).await?;
        if task.is_terminal() {
            debug!(task_id = %id, status = %task.status, "Transfer already finished");
            return Ok(task);
        }
        if self.store.cancel_transfer(id).await? {
            let receivers = self.control.publish(ControlMessage::cancel(id, tenant));
            info!(task_id = %id, receivers, "Transfer cancelled");
        }
        self.get_transfer(tenant, username, id).await
    }

    async fn validate_element(
        &self,
        request: &TransferRequest,
        element: &TransferRequestElement,
    ) -> std::result::Result<(), Vec<String>> {
        let mut errors = Vec::new();

        let source = match &element.source_uri {
            TransferUri::Http { .. } => None,
            uri => self
                .check_system(request, uri, element.src_shared_ctx.as_deref(), Permission::Read)
                .await
                .map_err(|e| errors.push(e))
                .ok(),
        };

        let destination = match &element.destination_uri {
            TransferUri::Http { url } => {
                errors.push(format!("destination {url} must be a tapis URI"));
                None
            }
            uri => self
                .check_system(request, uri, element.dest_shared_ctx.as_deref(), Permission::Modify)
                .await
                .map_err(|e| errors.push(e))
                .ok(),
        };

        let source_type = match &element.source_uri {
            TransferUri::Http { .. } => Some(SystemType::Http),
            TransferUri::Tapis { .. } => source.as_ref().map(|s| s.system_type),
        };
        let destination_type = destination.as_ref().map(|s| s.system_type);
        if let (Some(src), Some(dst)) = (source_type, destination_type) {
            if (src == SystemType::Globus) != (dst == SystemType::Globus) {
                errors.push(format!("cannot transfer between {src} and {dst} systems"));
            }
        }

        if element.transfer_type.is_service_move()
            && (element.source_uri.tenant() != element.destination_uri.tenant()
                || element.source_uri.system_id() != element.destination_uri.system_id()
                || !element.source_uri.is_tapis())
        {
            errors.push("a service move needs source and destination on the same system".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Resolve the system behind `uri` and check the acting identity's access.
    async fn check_system(
        &self,
        request: &TransferRequest,
        uri: &TransferUri,
        shared_ctx: Option<&str>,
        permission: Permission,
    ) -> std::result::Result<SystemDescriptor, String> {
        let (Some(tenant), Some(system_id)) = (uri.tenant(), uri.system_id()) else {
            return Err(format!("{uri} is not a tapis URI"));
        };
        if tenant != request.tenant_id {
            return Err(format!("{uri} is outside tenant {}", request.tenant_id));
        }
        let system = self
            .systems
            .get_system(tenant, system_id, &request.username, shared_ctx)
            .await
            .map_err(|e| format!("cannot resolve system {system_id}: {e}"))?
            .ok_or_else(|| format!("system {system_id} not found"))?;
        if !system.enabled {
            return Err(format!("system {system_id} is disabled"));
        }

        let acting = shared_ctx.unwrap_or(&request.username);
        let permitted = self
            .permissions
            .is_permitted(tenant, acting, system_id, uri.path(), permission)
            .await
            .map_err(|e| format!("permission check on {uri} failed: {e}"))?;
        if !permitted {
            return Err(format!("{acting} lacks {permission:?} permission on {uri}"));
        }
        Ok(system)
    }
}
