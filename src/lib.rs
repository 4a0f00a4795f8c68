pub mod config;
pub mod console;
pub mod constants;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod pipeline;
pub mod types;

// Layered boundaries: ports owned by the application, adapters in infra
pub mod app;
pub mod infra;
