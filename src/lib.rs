pub mod aggregator;
pub mod api;
pub mod checks;
pub mod collector;
pub mod config;
pub mod error;
pub mod handlers;
pub mod logging;
pub mod metrics;
pub mod models;
pub mod normalizer;
pub mod periods;
pub mod store;

pub use error::{MonitoringError, Result};
