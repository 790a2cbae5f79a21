pub mod config;
pub mod engine;
pub mod feeds;
pub mod market;
pub mod modes;
pub mod net;
pub mod telemetry;
pub mod types;
