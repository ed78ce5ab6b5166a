//! Integration tests for Spindrift
//!
//! These tests verify the integration between different components of the
//! system: the full pipeline from session creation through segment
//! delivery, and the HTTP surface mapped over it.

#[path = "integration/streaming_pipeline.rs"]
mod streaming_pipeline;

#[path = "integration/http_api.rs"]
mod http_api;
