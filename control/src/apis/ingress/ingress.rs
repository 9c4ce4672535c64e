//! Ingress builder
//!
//! Maps an observed Service to the Ingress that should exist for it. No I/O,
//! no clock, no randomness: the same Service and template always produce the
//! same Ingress.

use crate::config::IngressTemplate;
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::networking::v1::{
    HTTPIngressPath, HTTPIngressRuleValue, Ingress, IngressBackend, IngressRule,
    IngressServiceBackend, IngressSpec, ServiceBackendPort,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::ResourceExt;

/// Kind of the generated object
pub const INGRESS_KIND: &str = "Ingress";

/// API version of the generated object
pub const INGRESS_API_VERSION: &str = "networking.k8s.io/v1";

/// Kind of the owning object
pub const SERVICE_KIND: &str = "Service";

/// API version of the owning object
pub const SERVICE_API_VERSION: &str = "v1";

/// Path match type of the single path rule
pub const PATH_TYPE_PREFIX: &str = "Prefix";

/// Whether the Service carries the marker annotation (value is ignored)
pub fn has_marker(service: &Service, marker_annotation: &str) -> bool {
    service.annotations().contains_key(marker_annotation)
}

/// Controller owner reference pointing at `service`
///
/// Marks the Service as the managing controller and blocks its foreground
/// deletion until the Ingress is gone, so the garbage collector cascades.
pub fn controller_owner_ref(service: &Service) -> OwnerReference {
    OwnerReference {
        api_version: SERVICE_API_VERSION.to_string(),
        kind: SERVICE_KIND.to_string(),
        name: service.name_any(),
        uid: service.uid().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

/// The controlling owner reference of an object, if any
pub fn controller_of(owner_references: &[OwnerReference]) -> Option<&OwnerReference> {
    owner_references
        .iter()
        .find(|owner| owner.controller == Some(true))
}

/// Build the desired Ingress for `service`
///
/// One rule for `template.host`, one `Prefix` path for `template.path`,
/// backed by the Service's own name on `template.port`.
pub fn service_to_ingress(service: &Service, template: &IngressTemplate) -> Ingress {
    let name = service.name_any();

    let backend = IngressBackend {
        service: Some(IngressServiceBackend {
            name: name.clone(),
            port: Some(ServiceBackendPort {
                number: Some(template.port),
                name: None,
            }),
        }),
        resource: None,
    };

    let rule = IngressRule {
        host: Some(template.host.clone()),
        http: Some(HTTPIngressRuleValue {
            paths: vec![HTTPIngressPath {
                path: Some(template.path.clone()),
                path_type: PATH_TYPE_PREFIX.to_string(),
                backend,
            }],
        }),
    };

    Ingress {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: service.namespace(),
            owner_references: Some(vec![controller_owner_ref(service)]),
            ..Default::default()
        },
        spec: Some(IngressSpec {
            ingress_class_name: template.ingress_class_name.clone(),
            rules: Some(vec![rule]),
            ..Default::default()
        }),
        status: None,
    }
}
