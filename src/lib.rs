//! This crate provides the dataset access layer of an acoustic monitoring dashboard. It serves
//! large, immutable, pre-computed analysis datasets (acoustic index distributions, correlation
//! matrices, detection heatmaps) from an in-memory cache, answers filtered views of them, and
//! serves the largest row-oriented datasets page by page from pre-materialised artifacts.
//!
//! The server side is made of:
//!
//! * an [origin] fetcher retrieving whole JSON documents from a remote content origin, or from a
//!   local directory when no origin is configured;
//! * a [dataset_cache] with per-dataset time-to-live and single-flight refresh, so that many
//!   concurrent requests for an expired dataset cause one origin fetch;
//! * a pure [filters] engine (index, category, station/bandwidth, and correlation threshold with
//!   induced submatrix extraction);
//! * the [query] service and [pagination] store exposed over HTTP by [app].
//!
//! The [client] module is the consuming side: source fallback from the origin to the local
//! service, a request lifecycle with last-request-wins semantics, and a client page cache.
//!
//! The server is built on top of a number of open source components.
//!
//! * [Tokio](tokio), the most popular asynchronous Rust runtime.
//! * [Axum](axum) web framework, built by the Tokio team, on top of the [hyper] HTTP library.
//! * [Serde](serde) performs (de)serialisation of JSON datasets and responses.
//! * [reqwest] fetches datasets from the origin.
//! * [ndarray] provides the n-dimensional arrays used for submatrix extraction.

pub mod app;
pub mod app_state;
pub mod cli;
pub mod client;
pub mod dataset_cache;
pub mod error;
pub mod filters;
pub mod metrics;
pub mod models;
pub mod origin;
pub mod pagination;
pub mod query;
pub mod resource_manager;
pub mod server;
#[cfg(test)]
pub mod test_utils;
pub mod tracing;
pub mod validated_path;
