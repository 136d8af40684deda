pub mod errors;
pub mod integration_status;
pub mod metrics;
pub mod status;
pub mod target_status;
pub mod telemetry;
