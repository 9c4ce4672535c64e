//! Ingress support (networking.k8s.io/v1)
//!
//! Desired-state construction for the Ingress owned by an annotated Service.

#[allow(clippy::module_inception)]
pub mod ingress;
