//! aircast - media processing and broadcast daemon.
//!
//! A long-running service that accepts media processing jobs (transcode,
//! convert, image manipulation) and runs them through per-type worker
//! pools driving external tools, and simulates continuous radio and TV
//! channels whose byte streams fan out to any number of HTTP listeners.

pub mod api;
pub mod broadcast;
pub mod config;
pub mod dbal;
pub mod error;
pub mod jobs;
pub mod logging;
pub mod media;
pub mod metrics;
pub mod plugin;
pub mod radio;
pub mod services;
pub mod tv;

pub use error::{Error, Result};
