pub mod checkpoint;
pub mod config;
pub mod dead_letter;
pub mod errors;
pub mod event;
pub mod merge;
pub mod pipeline;
pub mod reconciler;
pub mod retry;
pub mod sink;
pub mod source;
pub mod telemetry;
pub mod window;

pub use config::AnalyticsConfig;
pub use errors::{PipelineError, Result};
pub use pipeline::{Pipeline, PipelineServices};
