//! Ingress Manager Control Plane Library
//!
//! Keeps one Ingress per annotated Service. Exposes the controller, its
//! configuration and the metrics server for the binary and for tests.

pub mod apis;
pub mod config;
pub mod controller;
pub mod error;
pub mod server;

pub use config::ControllerConfig;
pub use controller::Controller;
pub use error::ControllerError;
