//! Spaceport core: lifecycle status, verbs, endpoint patterns, the request
//! model and per-request contexts.

pub mod context;
pub mod document;
pub mod naming;
pub mod pattern;
pub mod request;
pub mod status;
pub mod verb;

pub use context::{ApiContext, FeatureInstance, Recyclable};
pub use document::DocumentError;
pub use pattern::{Accessor, CompiledEndpoint, PatternError};
pub use request::{ApiRequest, RequestInfo};
pub use status::{Failure, Status};
pub use verb::Verb;
