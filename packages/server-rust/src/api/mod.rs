//! Api hosting: descriptor, module, resources, messages and services of one
//! api.

mod host;
pub mod i18n;
mod module;
mod resources;

use std::sync::Arc;

pub use host::{ApiHost, DESCRIPTOR_FILE};
pub use i18n::Messages;
pub use module::{ApiModule, ModuleError};
pub use resources::{ResourceManager, RESERVED};

use crate::plugins::PluginRegistry;
use crate::spi::{RequestValidator, SymbolTable, Tracer};
use crate::status::StatusStore;

/// Collaborators an api receives from its space.
#[derive(Clone)]
pub struct ApiEnv {
    pub space: String,
    pub status: Arc<dyn StatusStore>,
    pub plugins: Arc<dyn PluginRegistry>,
    pub symbols: Arc<SymbolTable>,
    /// Used when the api descriptor names no validator.
    pub validator: Arc<dyn RequestValidator>,
    /// Used when the api descriptor names no tracer.
    pub tracer: Arc<dyn Tracer>,
    pub default_language: String,
}
