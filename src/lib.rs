//! Gaming telemetry pipeline: pull match activity from public game APIs (or a
//! deterministic mock), normalize it into one canonical model, load it into a
//! relational warehouse and forecast short-term per-game activity.

pub mod cli;
pub mod config;
pub mod database_ops;
pub mod env_boot;
pub mod error;
pub mod forecasting;
pub mod models;
pub mod normalization;
pub mod orchestrator;
pub mod report;
pub mod tracing;

pub mod util {
    pub mod db;
    pub mod env;
}

pub use config::PipelineConfig;
pub use error::{PipelineError, SourceError, StoreError};
pub use orchestrator::{Pipeline, RunState};
pub use report::{RunReport, RunStatus};
