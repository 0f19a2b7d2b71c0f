pub mod model;
pub mod service;

pub use model::{ForecastResult, HistoryPoint, LinearTrendModel, MODEL_VERSION};
pub use service::{ForecastEngine, ForecastOutcome};
