//! Client-side pagination with a page cache.

use crate::client::loader::{LoadOutcome, RequestTracker};
use crate::client::source::{DatasetRequest, SourceChain};
use crate::error::{ClientError, ErrorBody};
use crate::models::{DatasetName, Page, PageMetadata};

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Pages of one dataset already fetched by this client.
///
/// Pages are immutable for a dataset version, so entries never expire.
#[derive(Debug, Default)]
pub struct ClientPageCache {
    pages: HashMap<usize, Page>,
    loaded: BTreeSet<usize>,
}

impl ClientPageCache {
    pub fn get(&self, page_index: usize) -> Option<&Page> {
        self.pages.get(&page_index)
    }

    pub fn insert(&mut self, page_index: usize, page: Page) {
        self.pages.insert(page_index, page);
        self.loaded.insert(page_index);
    }

    pub fn contains(&self, page_index: usize) -> bool {
        self.loaded.contains(&page_index)
    }

    /// Indices of the cached pages, in ascending order.
    pub fn loaded_pages(&self) -> Vec<usize> {
        self.loaded.iter().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.loaded.len()
    }

    pub fn is_empty(&self) -> bool {
        self.loaded.is_empty()
    }

    pub fn clear(&mut self) {
        self.pages.clear();
        self.loaded.clear();
    }
}

#[derive(Debug, Default)]
struct Pager {
    cache: ClientPageCache,
    current_page: Option<usize>,
    metadata: Option<PageMetadata>,
    error: Option<ErrorBody>,
}

/// Navigates the pages of one paginated dataset.
///
/// Page loads follow last-request-wins: a response arriving after a newer [PaginatedLoader::load_page]
/// call was issued is discarded, and is not cached.
pub struct PaginatedLoader {
    dataset: DatasetName,
    chain: Arc<SourceChain>,
    tracker: RequestTracker,
    pager: Mutex<Pager>,
}

impl PaginatedLoader {
    pub fn new(dataset: DatasetName, chain: Arc<SourceChain>) -> Self {
        Self {
            dataset,
            chain,
            tracker: RequestTracker::default(),
            pager: Mutex::new(Pager::default()),
        }
    }

    pub fn dataset(&self) -> &DatasetName {
        &self.dataset
    }

    /// Make `page_index` the current page, fetching it unless cached.
    pub async fn load_page(&self, page_index: usize) -> Result<LoadOutcome, ErrorBody> {
        let ticket = self.tracker.begin();
        {
            let mut pager = self.pager();
            if pager.cache.contains(page_index) {
                pager.current_page = Some(page_index);
                pager.error = None;
                return Ok(LoadOutcome::Applied);
            }
        }

        let request = DatasetRequest::Page {
            dataset: self.dataset.clone(),
            page: page_index,
        };
        let result = self.chain.resolve(&request).await.and_then(|resolved| {
            serde_json::from_value::<Page>(resolved.data).map_err(|err| {
                ClientError::MalformedResponse {
                    url: format!("{} page {}", self.dataset, page_index),
                    reason: err.to_string(),
                }
            })
        });

        let mut pager = self.pager();
        if !self.tracker.is_current(&ticket) {
            tracing::debug!(dataset = %self.dataset, page_index, "discarding superseded page");
            return Ok(LoadOutcome::Superseded);
        }
        match result {
            Ok(page) => {
                pager.metadata = Some(page.metadata);
                pager.cache.insert(page_index, page);
                pager.current_page = Some(page_index);
                pager.error = None;
                Ok(LoadOutcome::Applied)
            }
            Err(err) => {
                tracing::warn!(dataset = %self.dataset, page_index, error = %err, "page load failed");
                let body = ErrorBody::from(&err);
                pager.error = Some(body.clone());
                Err(body)
            }
        }
    }

    /// Load the page after the current one, if any.
    pub async fn next_page(&self) -> Option<Result<LoadOutcome, ErrorBody>> {
        if !self.has_next_page() {
            return None;
        }
        let next = self.current_page().map_or(0, |current| current + 1);
        Some(self.load_page(next).await)
    }

    /// Load the page before the current one, if any.
    pub async fn previous_page(&self) -> Option<Result<LoadOutcome, ErrorBody>> {
        let previous = self.current_page()?.checked_sub(1)?;
        Some(self.load_page(previous).await)
    }

    pub fn current_page(&self) -> Option<usize> {
        self.pager().current_page
    }

    /// The current page, if one has been loaded.
    pub fn current(&self) -> Option<Page> {
        let pager = self.pager();
        pager
            .current_page
            .and_then(|index| pager.cache.get(index).cloned())
    }

    /// Total pages, known once any page has been loaded.
    pub fn total_pages(&self) -> Option<usize> {
        self.pager().metadata.map(|metadata| metadata.total_pages)
    }

    pub fn total_records(&self) -> Option<usize> {
        self.pager().metadata.map(|metadata| metadata.total_records)
    }

    pub fn loaded_pages(&self) -> Vec<usize> {
        self.pager().cache.loaded_pages()
    }

    /// Error of the last applied page load, cleared by the next success.
    pub fn error(&self) -> Option<ErrorBody> {
        self.pager().error.clone()
    }

    pub fn has_next_page(&self) -> bool {
        let pager = self.pager();
        match (pager.current_page, pager.metadata) {
            (Some(current), Some(metadata)) => current + 1 < metadata.total_pages,
            // Nothing loaded yet: the first page is next.
            (None, _) => true,
            (Some(_), None) => false,
        }
    }

    pub fn has_previous_page(&self) -> bool {
        matches!(self.current_page(), Some(current) if current > 0)
    }

    fn pager(&self) -> MutexGuard<'_, Pager> {
        self.pager.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
