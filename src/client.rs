//! Client data-access layer.
//!
//! The consuming side of the query and pagination services. A [SourceChain] resolves each request
//! against an ordered list of data sources (the remote origin first, when configured, then the
//! local service). A [DatasetLoader] drives the `Idle -> Loading -> Success | Error` lifecycle of
//! one consumer with last-request-wins semantics, and a [PaginatedLoader] adds a client page
//! cache for paginated datasets.

pub mod loader;
pub mod pages;
pub mod source;

pub use loader::{DatasetLoader, LoadOutcome, LoadState, RequestTicket, RequestTracker};
pub use pages::{ClientPageCache, PaginatedLoader};
pub use source::{DataSource, DatasetRequest, HttpSource, Resolved, SourceChain};

use url::Url;

/// Where the client looks for data.
#[derive(Clone, Debug, PartialEq)]
pub struct ClientConfig {
    /// Remote content origin, tried first. Local-only mode when absent.
    pub origin_url: Option<Url>,
    /// Base URL of the local query and pagination service.
    pub local_url: Url,
}

impl ClientConfig {
    /// Configuration for local-only mode.
    pub fn local(local_url: Url) -> Self {
        Self {
            origin_url: None,
            local_url,
        }
    }

    pub fn with_origin(mut self, origin_url: Url) -> Self {
        self.origin_url = Some(origin_url);
        self
    }
}
