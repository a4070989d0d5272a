//! Services: the routable endpoints of an api and their registry.

pub mod group;
mod registry;
mod service;

pub use group::{GroupingFlow, KeepAll};
pub use registry::ServiceRegistry;
pub use service::{Service, ServiceError};
