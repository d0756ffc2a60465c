//! Publishes Azure DNS A records for Kubernetes LoadBalancer Services.

pub mod azure;
pub mod controller;
pub mod dns;
pub mod error;
pub mod ingress;
pub mod kubernetes;
pub mod options;
pub mod reconciler;
pub mod service;
pub mod workqueue;

pub use controller::Controller;
pub use error::{Error, Result};
pub use options::Options;
pub use reconciler::Reconciler;
