//! Pipeline definition files: types, YAML parsing, semantic validation.

pub mod parser;
pub mod types;
pub mod validator;

pub use types::{OperatorConfig, PipelineConfig, PipelineSettings, StateBackendKind, StateConfig};
