//! Cluster client
//!
//! Authoritative reads and writes against the API server. The reconciler goes
//! through this trait instead of the informer caches so that every mutating
//! decision is made on fresh state.

use async_trait::async_trait;
use common::ObjectKey;
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::networking::v1::Ingress;
use kube::api::{Api, DeleteParams, PostParams};
use kube::{Client, ResourceExt};
use thiserror::Error;
use tracing::debug;

/// Errors returned by a [`ClusterClient`]
///
/// `NotFound` is kept apart from every other failure so callers can tell
/// "the object is gone" from "we could not find out".
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("{kind} {key} not found")]
    NotFound { kind: &'static str, key: ObjectKey },

    #[error("{kind} {key} already exists")]
    AlreadyExists { kind: &'static str, key: ObjectKey },

    #[error("{kind} {name} has no namespace")]
    MissingNamespace { kind: &'static str, name: String },

    #[error("Kubernetes API error: {0}")]
    Api(#[from] kube::Error),
}

impl ClientError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ClientError::NotFound { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, ClientError::AlreadyExists { .. })
    }

    /// A malformed request fails the same way every time
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ClientError::MissingNamespace { .. })
    }

    /// Classify a kube error for the object addressed by `key`
    fn from_kube(err: kube::Error, kind: &'static str, key: ObjectKey) -> Self {
        match &err {
            kube::Error::Api(resp) if resp.code == 404 => ClientError::NotFound { kind, key },
            kube::Error::Api(resp) if resp.code == 409 && resp.reason == "AlreadyExists" => {
                ClientError::AlreadyExists { kind, key }
            }
            _ => ClientError::Api(err),
        }
    }
}

/// Typed CRUD access to Services and Ingresses
#[async_trait]
pub trait ClusterClient: Send + Sync + 'static {
    async fn get_service(&self, namespace: &str, name: &str) -> Result<Service, ClientError>;

    async fn get_ingress(&self, namespace: &str, name: &str) -> Result<Ingress, ClientError>;

    async fn create_ingress(&self, ingress: &Ingress) -> Result<Ingress, ClientError>;

    async fn delete_ingress(&self, namespace: &str, name: &str) -> Result<(), ClientError>;
}

/// [`ClusterClient`] backed by the Kubernetes API
#[derive(Clone)]
pub struct KubeClusterClient {
    client: Client,
}

impl KubeClusterClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    async fn get_service(&self, namespace: &str, name: &str) -> Result<Service, ClientError> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        api.get(name)
            .await
            .map_err(|e| ClientError::from_kube(e, "Service", ObjectKey::new(namespace, name)))
    }

    async fn get_ingress(&self, namespace: &str, name: &str) -> Result<Ingress, ClientError> {
        let api: Api<Ingress> = Api::namespaced(self.client.clone(), namespace);
        api.get(name)
            .await
            .map_err(|e| ClientError::from_kube(e, "Ingress", ObjectKey::new(namespace, name)))
    }

    async fn create_ingress(&self, ingress: &Ingress) -> Result<Ingress, ClientError> {
        let namespace = ingress_namespace(ingress)?;
        let name = ingress.name_any();
        let api: Api<Ingress> = Api::namespaced(self.client.clone(), &namespace);

        let created = api
            .create(&PostParams::default(), ingress)
            .await
            .map_err(|e| ClientError::from_kube(e, "Ingress", ObjectKey::new(&namespace, &name)))?;

        debug!("Created Ingress {}/{}", namespace, name);
        Ok(created)
    }

    async fn delete_ingress(&self, namespace: &str, name: &str) -> Result<(), ClientError> {
        let api: Api<Ingress> = Api::namespaced(self.client.clone(), namespace);
        api.delete(name, &DeleteParams::default())
            .await
            .map_err(|e| ClientError::from_kube(e, "Ingress", ObjectKey::new(namespace, name)))?;

        debug!("Deleted Ingress {}/{}", namespace, name);
        Ok(())
    }
}

/// Namespace an Ingress is created in; never defaulted
fn ingress_namespace(ingress: &Ingress) -> Result<String, ClientError> {
    ingress
        .namespace()
        .filter(|ns| !ns.is_empty())
        .ok_or_else(|| ClientError::MissingNamespace {
            kind: "Ingress",
            name: ingress.name_any(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use kube::error::ErrorResponse;

    fn api_error(code: u16, reason: &str) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: format!("{} from api server", reason),
            reason: reason.to_string(),
            code,
        })
    }

    #[test]
    fn test_404_is_not_found() {
        let err = ClientError::from_kube(
            api_error(404, "NotFound"),
            "Ingress",
            ObjectKey::new("default", "foo"),
        );
        assert!(err.is_not_found());
        assert_eq!(err.to_string(), "Ingress default/foo not found");
    }

    #[test]
    fn test_409_already_exists() {
        let err = ClientError::from_kube(
            api_error(409, "AlreadyExists"),
            "Ingress",
            ObjectKey::new("default", "foo"),
        );
        assert!(err.is_already_exists());
        assert!(!err.is_not_found());
    }

    #[test]
    fn test_409_conflict_is_not_already_exists() {
        // Optimistic-concurrency conflicts must be retried, not treated as success
        let err = ClientError::from_kube(
            api_error(409, "Conflict"),
            "Ingress",
            ObjectKey::new("default", "foo"),
        );
        assert!(matches!(err, ClientError::Api(_)));
    }

    #[test]
    fn test_server_errors_stay_api_errors() {
        let err = ClientError::from_kube(
            api_error(503, "ServiceUnavailable"),
            "Service",
            ObjectKey::new("default", "foo"),
        );
        assert!(matches!(err, ClientError::Api(_)));
        assert!(!err.is_not_found());
    }

    fn ingress(namespace: Option<&str>) -> Ingress {
        Ingress {
            metadata: ObjectMeta {
                name: Some("foo".to_string()),
                namespace: namespace.map(str::to_string),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_ingress_namespace_is_taken_from_metadata() {
        assert_eq!(ingress_namespace(&ingress(Some("team-a"))).unwrap(), "team-a");
    }

    #[test]
    fn test_ingress_without_namespace_is_rejected() {
        for namespace in [None, Some("")] {
            let err = ingress_namespace(&ingress(namespace)).unwrap_err();
            assert!(matches!(err, ClientError::MissingNamespace { .. }));
            assert!(!err.is_retryable());
            assert_eq!(err.to_string(), "Ingress foo has no namespace");
        }
    }
}
