//! Integration test suite for Wuild
//!
//! End-to-end scenarios over loopback TCP: transport behavior,
//! coordinator pub/sub, and the full remote compile pipeline with a fake
//! compiler.

pub mod coordinator_tests;
pub mod pipeline_tests;
pub mod proxy_tests;
pub mod transport_tests;
