//! Spaceport server: hosts spaces of apis, routes requests to their
//! services and runs them on per-space worker pools.

pub mod api;
pub mod archive;
pub mod config;
pub mod describe;
pub mod error;
pub mod executor;
pub mod keystore;
pub mod plugins;
pub mod runtime;
pub mod services;
pub mod space;
pub mod spi;
pub mod status;
pub mod worker;

pub use api::ApiHost;
pub use config::{ExecutorConfig, RuntimeConfig, StatusStoreConfig};
pub use describe::{DescribeOption, DescribeOptions};
pub use error::{ExecutionError, ManagementError};
pub use executor::{ExecutionEngine, ExecutionHandle, ExecutionMode};
pub use plugins::{Event, FeatureDescriptor, Plugin, PluginRegistry, PluginSet, Subject};
pub use runtime::Runtime;
pub use services::{Service, ServiceRegistry};
pub use space::{HostServices, SpaceHost};
pub use spi::{ApiSpi, RequestValidator, ServiceSpi, Symbol, SymbolTable, Tracer};
pub use status::{FileStatusStore, StatusStore};
