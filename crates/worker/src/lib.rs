//! CDN abuse detection worker
//!
//! Loads configuration, wires the detection pipeline over an HTTP metrics
//! gateway and a Telegram sink, and serves health and metrics endpoints.

pub mod api;
pub mod config;
pub mod gateway;
pub mod pipeline;
