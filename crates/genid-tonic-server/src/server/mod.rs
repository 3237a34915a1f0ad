pub mod config;
pub mod pidfile;
pub mod service;
pub mod store;
pub mod telemetry;
