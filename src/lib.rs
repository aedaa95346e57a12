//! Scan orchestration engine: job lifecycle, concurrency governor,
//! pluggable scanner backends, recurring schedules and an HTTP API.
pub mod backend;
pub mod config;
mod dispatcher;
pub mod engine;
pub mod error;
pub mod governor;
pub mod job;
pub mod logging;
pub mod netdetect;
pub mod ports;
pub mod schedule;
pub mod scheduler;
pub mod server;
pub mod sink;
pub mod targets;
pub mod types;
