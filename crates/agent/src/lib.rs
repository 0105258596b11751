pub mod config;
pub mod executor;
pub mod identity;
pub mod session;
pub mod telemetry;
