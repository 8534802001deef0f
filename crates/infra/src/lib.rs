//! Infrastructure layer: config, PostgreSQL adapters, pipeline wiring.

pub mod cleanup;
pub mod config;
pub mod invitations;
pub mod pipeline;
pub mod postgres;


pub use cleanup::{CleanupReport, LogJanitor, RetentionPolicy};
pub use config::{ConfigError, PipelineConfig};
pub use pipeline::{Pipeline, PipelineStores};
