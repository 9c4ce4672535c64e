//! Service reconciler
//!
//! Drives one logical key towards `has_marker(service) == ingress exists`.
//! Reads go to the API server, never to the informer caches.

use crate::apis::ingress::ingress::{has_marker, service_to_ingress};
use crate::config::IngressTemplate;
use crate::controller::client::ClusterClient;
use crate::error::ControllerError;
use common::ObjectKey;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

/// What a successful reconcile did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileAction {
    /// Ingress was missing and has been created
    Created,
    /// Ingress was no longer wanted and has been deleted
    Deleted,
    /// Already converged (or the Service is gone)
    NoOp,
}

impl ReconcileAction {
    /// Metrics label
    pub fn as_str(&self) -> &'static str {
        match self {
            ReconcileAction::Created => "created",
            ReconcileAction::Deleted => "deleted",
            ReconcileAction::NoOp => "noop",
        }
    }
}

impl fmt::Display for ReconcileAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Service to Ingress reconciler
pub struct Reconciler<C: ClusterClient> {
    client: Arc<C>,
    marker_annotation: String,
    template: IngressTemplate,
}

impl<C: ClusterClient> Reconciler<C> {
    pub fn new(
        client: Arc<C>,
        marker_annotation: impl Into<String>,
        template: IngressTemplate,
    ) -> Self {
        Self {
            client,
            marker_annotation: marker_annotation.into(),
            template,
        }
    }

    /// Reconcile the Service (and its Ingress) named by `key`
    pub async fn reconcile(&self, key: &str) -> Result<ReconcileAction, ControllerError> {
        let object_key = ObjectKey::parse(key).map_err(|source| ControllerError::MalformedKey {
            key: key.to_string(),
            source,
        })?;
        let namespace = object_key
            .require_namespace()
            .map_err(|source| ControllerError::MalformedKey {
                key: key.to_string(),
                source,
            })?;
        let name = object_key.name.as_str();

        let service = match self.client.get_service(namespace, name).await {
            Ok(service) => service,
            Err(e) if e.is_not_found() => {
                // Any Ingress it owned is left to the garbage collector
                debug!("Service {} no longer exists, nothing to do", object_key);
                return Ok(ReconcileAction::NoOp);
            }
            Err(e) => return Err(e.into()),
        };

        let wants_ingress = has_marker(&service, &self.marker_annotation);

        // Existence is decided by the read error alone
        let existing = match self.client.get_ingress(namespace, name).await {
            Ok(_) => true,
            Err(e) if e.is_not_found() => false,
            Err(e) => return Err(e.into()),
        };

        match (wants_ingress, existing) {
            (true, false) => {
                let ingress = service_to_ingress(&service, &self.template);
                match self.client.create_ingress(&ingress).await {
                    Ok(_) => {
                        info!("Created Ingress {} for Service", object_key);
                        Ok(ReconcileAction::Created)
                    }
                    Err(e) if e.is_already_exists() => {
                        debug!("Ingress {} appeared concurrently", object_key);
                        Ok(ReconcileAction::NoOp)
                    }
                    Err(e) => Err(e.into()),
                }
            }
            (false, true) => match self.client.delete_ingress(namespace, name).await {
                Ok(()) => {
                    info!(
                        "Deleted Ingress {}: Service no longer has annotation {}",
                        object_key, self.marker_annotation
                    );
                    Ok(ReconcileAction::Deleted)
                }
                Err(e) if e.is_not_found() => {
                    debug!("Ingress {} already gone", object_key);
                    Ok(ReconcileAction::NoOp)
                }
                Err(e) => Err(e.into()),
            },
            _ => {
                debug!(
                    "Service {} converged (marker={}, ingress={})",
                    object_key, wants_ingress, existing
                );
                Ok(ReconcileAction::NoOp)
            }
        }
    }
}
