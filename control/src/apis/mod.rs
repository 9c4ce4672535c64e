//! Kubernetes API integrations
//!
//! Desired-state builders for the resources this controller owns, plus the
//! controller's Prometheus metrics.

pub mod ingress;
pub mod metrics;
