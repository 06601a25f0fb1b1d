//! TensorServe common library
//!
//! Error taxonomy, settings and metrics shared by every TensorServe crate.

pub mod config;
pub mod error;
pub mod metrics;

// Re-export commonly used types
pub use self::config::{MetadataTensor, ModelParameters, ModelSettings, ServerSettings};
pub use error::{Result, ServeError};
pub use metrics::{MetricsRegistry, METRICS};
