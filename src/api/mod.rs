//! HTTP API Module
//!
//! Provides a REST API for local clients: key reads and writes, replication
//! state and manual anti-entropy.

mod http;

pub use http::{ClockResponse, HttpServer, RecordView, StatusResponse};
