//! Core engine for leader-only Service routing.
//!
//! Resolves the current leader of an annotated Service from a leadership
//! source, decides whether to keep or switch the routed endpoint, and
//! publishes the result as a single-endpoint EndpointSlice. Controllers
//! compose these pieces; the crate itself owns no watch loop.

pub mod backoff;
pub mod budget;
pub mod cache;
pub mod config;
pub mod decision;
pub mod endpoints;
pub mod error;
pub mod leadership;
pub mod metrics;
pub mod ports;
pub mod retry;
pub mod status;

pub use error::Error;
