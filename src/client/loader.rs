//! Request lifecycle of a data consumer.

use crate::client::source::{DatasetRequest, SourceChain};
use crate::error::ErrorBody;

use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// State of a consumer's current request.
#[derive(Clone, Debug, Default, PartialEq)]
pub enum LoadState {
    /// No request issued yet
    #[default]
    Idle,
    /// A request is in flight
    Loading,
    /// The current request succeeded
    Success {
        data: Value,
        /// Name of the data source that answered
        source: String,
    },
    /// The current request failed on every data source
    Error(ErrorBody),
}

impl LoadState {
    pub fn is_loading(&self) -> bool {
        matches!(self, Self::Loading)
    }

    pub fn data(&self) -> Option<&Value> {
        match self {
            Self::Success { data, .. } => Some(data),
            _ => None,
        }
    }
}

/// Whether a completed request was allowed to publish its result.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LoadOutcome {
    Applied,
    /// A newer request was issued, or the consumer went away, while this one was in flight.
    Superseded,
}

/// Identifies one issued request.
#[derive(Debug, Eq, PartialEq)]
pub struct RequestTicket(u64);

/// Generation counter implementing last-request-wins.
///
/// Every request takes a ticket. Only the holder of the latest ticket may publish.
#[derive(Debug, Default)]
pub struct RequestTracker {
    generation: AtomicU64,
}

impl RequestTracker {
    pub fn begin(&self) -> RequestTicket {
        RequestTicket(self.generation.fetch_add(1, Ordering::SeqCst) + 1)
    }

    pub fn is_current(&self, ticket: &RequestTicket) -> bool {
        self.generation.load(Ordering::SeqCst) == ticket.0
    }

    /// Invalidate every outstanding ticket.
    pub fn supersede(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }
}

struct Shared {
    chain: Arc<SourceChain>,
    tracker: RequestTracker,
    state: watch::Sender<LoadState>,
}

impl Shared {
    /// Take a ticket, then enter `Loading`. Earlier tickets can no longer publish.
    fn begin(&self) -> RequestTicket {
        let ticket = self.tracker.begin();
        self.state.send_replace(LoadState::Loading);
        ticket
    }

    async fn complete(&self, ticket: RequestTicket, request: DatasetRequest) -> LoadOutcome {
        let result = self.chain.resolve(&request).await;
        let next = match result {
            Ok(resolved) => LoadState::Success {
                data: resolved.data,
                source: resolved.source,
            },
            Err(err) => {
                if self.tracker.is_current(&ticket) {
                    tracing::warn!(?request, error = %err, "request failed on every data source");
                }
                LoadState::Error(ErrorBody::from(&err))
            }
        };
        let mut next = Some(next);
        let applied = self.state.send_if_modified(|state| {
            if !self.tracker.is_current(&ticket) {
                return false;
            }
            if let Some(next) = next.take() {
                *state = next;
            }
            true
        });
        if applied {
            LoadOutcome::Applied
        } else {
            tracing::debug!(?request, "discarding superseded response");
            LoadOutcome::Superseded
        }
    }
}

/// Loads datasets for one consumer.
///
/// The consumer observes [LoadState] changes through [DatasetLoader::subscribe]. Issuing a new
/// request makes any in-flight one stale: its response is discarded when it arrives. Dropping the
/// loader discards every in-flight response.
pub struct DatasetLoader {
    shared: Arc<Shared>,
    request: Mutex<Option<DatasetRequest>>,
}

impl DatasetLoader {
    pub fn new(chain: Arc<SourceChain>) -> Self {
        let (state, _) = watch::channel(LoadState::Idle);
        Self {
            shared: Arc::new(Shared {
                chain,
                tracker: RequestTracker::default(),
                state,
            }),
            request: Mutex::new(None),
        }
    }

    /// Issue `request` and wait for its completion.
    pub async fn load(&self, request: DatasetRequest) -> LoadOutcome {
        self.remember(request.clone());
        let ticket = self.shared.begin();
        self.shared.complete(ticket, request).await
    }

    /// Issue `request` in the background.
    ///
    /// The request supersedes earlier ones as soon as this returns.
    pub fn spawn_load(&self, request: DatasetRequest) -> JoinHandle<LoadOutcome> {
        self.remember(request.clone());
        let ticket = self.shared.begin();
        let shared = self.shared.clone();
        tokio::spawn(async move { shared.complete(ticket, request).await })
    }

    /// Update the request key, reloading only when it changed.
    pub fn set_request(&self, request: DatasetRequest) -> Option<JoinHandle<LoadOutcome>> {
        if self.current_request().as_ref() == Some(&request) {
            return None;
        }
        Some(self.spawn_load(request))
    }

    /// Issue the current request again.
    pub fn reload(&self) -> Option<JoinHandle<LoadOutcome>> {
        self.current_request().map(|request| self.spawn_load(request))
    }

    pub fn current_request(&self) -> Option<DatasetRequest> {
        self.request
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<LoadState> {
        self.shared.state.subscribe()
    }

    pub fn state(&self) -> LoadState {
        self.shared.state.borrow().clone()
    }

    fn remember(&self, request: DatasetRequest) {
        *self.request.lock().unwrap_or_else(PoisonError::into_inner) = Some(request);
    }
}

impl Drop for DatasetLoader {
    fn drop(&mut self) {
        self.shared.tracker.supersede();
    }
}
