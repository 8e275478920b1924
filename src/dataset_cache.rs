//! Dataset cache
//!
//! Holds the most recently fetched document of each dataset together with its fetch time, and
//! refreshes it from the origin once its time-to-live has elapsed. Concurrent misses for the same
//! dataset are coalesced into a single origin fetch whose outcome is shared by every waiter.

use crate::cli::CommandLineArgs;
use crate::error::DataServerError;
use crate::metrics;
use crate::models::{DatasetClass, DatasetName};
use crate::origin::OriginFetcher;
use crate::resource_manager::{MemoryReservation, ResourceManager};

use hashbrown::HashMap;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;

/// A parsed dataset document, shared between the cache and every request reading it.
pub type Document = Arc<Value>;

/// The cached document of one dataset.
#[derive(Clone, Debug)]
pub struct CacheEntry {
    pub document: Document,
    pub fetched_at: Instant,
    /// Memory held in the pool for as long as the document is cached
    reservation: Arc<MemoryReservation>,
}

impl CacheEntry {
    fn new(document: Document, reservation: MemoryReservation) -> Self {
        Self {
            document,
            fetched_at: Instant::now(),
            reservation: Arc::new(reservation),
        }
    }

    /// Returns true if the entry is younger than `ttl`.
    pub fn is_fresh(&self, ttl: Duration) -> bool {
        self.fetched_at.elapsed() < ttl
    }

    /// Bytes reserved in the memory pool for this entry.
    pub fn reserved_bytes(&self) -> usize {
        self.reservation.bytes()
    }
}

/// Time-to-live of each dataset.
#[derive(Clone, Debug)]
pub struct TtlPolicy {
    reference: Duration,
    standard: Duration,
    overrides: HashMap<String, Duration>,
}

impl TtlPolicy {
    /// Create a policy from the TTLs of the two dataset classes.
    pub fn new(reference: Duration, standard: Duration) -> Self {
        Self {
            reference,
            standard,
            overrides: HashMap::new(),
        }
    }

    /// Override the TTL of a single dataset.
    pub fn with_override(mut self, dataset: &str, ttl: Duration) -> Self {
        self.overrides.insert(dataset.to_string(), ttl);
        self
    }

    pub fn from_args(args: &CommandLineArgs) -> Self {
        args.dataset_ttls.iter().fold(
            Self::new(
                Duration::from_secs(args.reference_ttl),
                Duration::from_secs(args.standard_ttl),
            ),
            |policy, ttl| policy.with_override(&ttl.dataset, Duration::from_secs(ttl.seconds)),
        )
    }

    /// TTL of `dataset`.
    pub fn ttl(&self, dataset: &DatasetName) -> Duration {
        if let Some(ttl) = self.overrides.get(dataset.as_str()) {
            return *ttl;
        }
        match DatasetClass::of(dataset) {
            DatasetClass::Reference => self.reference,
            DatasetClass::Standard => self.standard,
        }
    }
}

/// Outcome of the last origin fetch of a dataset.
enum Outcome {
    Fetched,
    /// Replayable copy of the failure, if the error kind allows one.
    Failed(Option<DataServerError>),
}

#[derive(Default)]
struct Slot {
    entry: Option<CacheEntry>,
    last: Option<Outcome>,
}

/// Per-dataset cache state.
///
/// The mutex serialises misses for one dataset. `fetches` counts completed origin fetches so that
/// a caller can tell whether a fetch finished while it was waiting for the lock.
#[derive(Default)]
struct SlotCell {
    fetches: AtomicU64,
    state: Mutex<Slot>,
}

/// Process-wide dataset cache, constructed once and shared through the application state.
pub struct DatasetCache {
    fetcher: Arc<dyn OriginFetcher>,
    ttl: TtlPolicy,
    resource_manager: Arc<ResourceManager>,
    /// A [hashbrown::HashMap] of per-dataset slots. The lock is only held to look up, insert or
    /// remove a slot, never across a fetch. Slots of datasets that never resolved are removed.
    slots: RwLock<HashMap<DatasetName, Arc<SlotCell>>>,
}

impl DatasetCache {
    /// Create an empty cache.
    ///
    /// # Arguments
    ///
    /// * `fetcher`: Origin fetcher used on miss or expiry
    /// * `ttl`: Time-to-live policy
    /// * `resource_manager`: Memory pool that cached documents are reserved against
    pub fn new(
        fetcher: Arc<dyn OriginFetcher>,
        ttl: TtlPolicy,
        resource_manager: Arc<ResourceManager>,
    ) -> Self {
        Self {
            fetcher,
            ttl,
            resource_manager,
            slots: RwLock::new(HashMap::new()),
        }
    }

    pub fn ttl_policy(&self) -> &TtlPolicy {
        &self.ttl
    }

    /// Return the current document of `dataset`, fetching it from the origin if there is no fresh
    /// entry.
    ///
    /// Fetch failures are returned to the caller. A stale entry is never served in their place.
    #[tracing::instrument(level = "DEBUG", skip(self, dataset), fields(dataset = %dataset))]
    pub async fn get_or_fetch(&self, dataset: &DatasetName) -> Result<Document, DataServerError> {
        let cell = self.slot(dataset).await;
        let (result, outcome) = self.lookup(dataset, &cell).await;
        match &result {
            Ok(_) => metrics::record_cache_lookup(dataset.as_str(), outcome),
            Err(_) => self.release_if_unused(dataset, cell).await,
        }
        result
    }

    /// Return the current entry of `dataset` without fetching, fresh or not.
    pub async fn entry(&self, dataset: &DatasetName) -> Option<CacheEntry> {
        let cell = {
            let slots = self.slots.read().await;
            slots.get(dataset)?.clone()
        };
        let slot = cell.state.lock().await;
        slot.entry.clone()
    }

    /// Number of datasets the cache currently tracks.
    pub async fn tracked_datasets(&self) -> usize {
        self.slots.read().await.len()
    }

    /// Serve `dataset` from its slot, fetching under the slot lock when there is no fresh entry.
    ///
    /// Returns the lookup outcome (`hit`, `shared` or `miss`) alongside the result.
    async fn lookup(
        &self,
        dataset: &DatasetName,
        cell: &SlotCell,
    ) -> (Result<Document, DataServerError>, &'static str) {
        let ticket = cell.fetches.load(Ordering::Acquire);
        let mut slot = cell.state.lock().await;

        if let Some(entry) = &slot.entry {
            if entry.is_fresh(self.ttl.ttl(dataset)) {
                return (Ok(entry.document.clone()), "hit");
            }
        }

        // A fetch completed while we were queued: share its outcome.
        if cell.fetches.load(Ordering::Acquire) != ticket {
            match &slot.last {
                Some(Outcome::Fetched) => {
                    if let Some(entry) = &slot.entry {
                        return (Ok(entry.document.clone()), "shared");
                    }
                }
                Some(Outcome::Failed(Some(err))) => {
                    if let Some(err) = err.replay() {
                        return (Err(err), "shared");
                    }
                }
                _ => (),
            }
        }

        let result = match self.fetch(dataset).await {
            Ok((document, bytes)) => self
                .reserve(dataset, bytes, &mut slot)
                .await
                .map(|reservation| (document, reservation)),
            Err(err) => Err(err),
        };
        cell.fetches.fetch_add(1, Ordering::Release);
        let result = match result {
            Ok((document, reservation)) => {
                slot.entry = Some(CacheEntry::new(document.clone(), reservation));
                slot.last = Some(Outcome::Fetched);
                Ok(document)
            }
            Err(err) => {
                tracing::warn!(dataset = %dataset, error = %err, "dataset fetch failed");
                slot.last = Some(Outcome::Failed(err.replay()));
                Err(err)
            }
        };
        (result, "miss")
    }

    /// Reserve pool memory for a freshly fetched document of `bytes`.
    ///
    /// When the pool is exhausted, the stale entry of this dataset and the expired entries of
    /// other datasets are evicted before trying again.
    async fn reserve(
        &self,
        dataset: &DatasetName,
        bytes: usize,
        slot: &mut Slot,
    ) -> Result<MemoryReservation, DataServerError> {
        if let Some(reservation) = self.resource_manager.try_reserve(dataset, bytes)? {
            return Ok(reservation);
        }
        slot.entry = None;
        self.evict_expired().await;
        self.resource_manager
            .try_reserve(dataset, bytes)?
            .ok_or_else(|| DataServerError::InsufficientMemory {
                dataset: dataset.to_string(),
                requested: bytes,
                available: self.resource_manager.available_memory().unwrap_or(0),
            })
    }

    /// Drop the expired entries of every dataset whose slot is not busy.
    async fn evict_expired(&self) {
        let slots = self.slots.read().await;
        for (dataset, cell) in slots.iter() {
            // A busy slot is being refreshed, or served, by another request.
            let Ok(mut slot) = cell.state.try_lock() else {
                continue;
            };
            let expired = slot
                .entry
                .as_ref()
                .map_or(false, |entry| !entry.is_fresh(self.ttl.ttl(dataset)));
            if expired {
                tracing::debug!(dataset = %dataset, "evicting expired dataset to free memory");
                slot.entry = None;
            }
        }
    }

    /// Remove the slot of `dataset` if it holds no document and no other request uses it.
    async fn release_if_unused(&self, dataset: &DatasetName, cell: Arc<SlotCell>) {
        let mut slots = self.slots.write().await;
        if !slots
            .get(dataset)
            .map_or(false, |current| Arc::ptr_eq(current, &cell))
        {
            return;
        }
        // One reference is held by the map and one by this caller. New references are only
        // taken under the map lock, which is held here.
        if Arc::strong_count(&cell) > 2 {
            return;
        }
        let empty = cell
            .state
            .try_lock()
            .map_or(false, |slot| slot.entry.is_none());
        if empty {
            slots.remove(dataset);
        }
    }

    /// Get or create the slot of `dataset`.
    async fn slot(&self, dataset: &DatasetName) -> Arc<SlotCell> {
        // Common case: the dataset has been requested before.
        {
            let slots = self.slots.read().await;
            if let Some(cell) = slots.get(dataset) {
                return cell.clone();
            }
        }
        let mut slots = self.slots.write().await;
        // Allow for a possible race here since we dropped the read lock.
        slots
            .entry(dataset.clone())
            .or_insert_with(|| Arc::new(SlotCell::default()))
            .clone()
    }

    /// Fetch and parse a dataset from the origin, returning the document and its size in bytes.
    async fn fetch(&self, dataset: &DatasetName) -> Result<(Document, usize), DataServerError> {
        let started = Instant::now();
        let body = self.fetcher.fetch(dataset).await?;
        let document = parse_document(dataset, &body)?;
        let elapsed = started.elapsed();
        tracing::info!(
            dataset = %dataset,
            bytes = body.len(),
            elapsed_ms = elapsed.as_millis() as u64,
            "fetched dataset from origin"
        );
        metrics::record_origin_fetch(dataset.as_str(), body.len(), elapsed);
        Ok((document, body.len()))
    }
}

/// Parse a dataset body, requiring a top-level object with a `metadata` object.
pub fn parse_document(dataset: &DatasetName, body: &[u8]) -> Result<Document, DataServerError> {
    let malformed = |reason: String| DataServerError::MalformedDataset {
        dataset: dataset.to_string(),
        reason,
    };
    let document: Value = serde_json::from_slice(body).map_err(|err| malformed(err.to_string()))?;
    match document.get("metadata") {
        Some(Value::Object(_)) => Ok(Arc::new(document)),
        Some(_) => Err(malformed("metadata is not an object".to_string())),
        None => Err(malformed("missing metadata envelope".to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CORRELATION_DATASET, HEATMAP_DATASET};
    use crate::test_utils::{heatmap_document, MockFetcher};

    use prometheus::core::Collector;
    use tokio::task::JoinSet;

    fn heatmap() -> DatasetName {
        DatasetName::new(HEATMAP_DATASET).unwrap()
    }

    fn cache(fetcher: Arc<MockFetcher>) -> Arc<DatasetCache> {
        limited_cache(fetcher, Arc::new(ResourceManager::new(None, None, None)))
    }

    fn limited_cache(
        fetcher: Arc<MockFetcher>,
        resource_manager: Arc<ResourceManager>,
    ) -> Arc<DatasetCache> {
        Arc::new(DatasetCache::new(
            fetcher,
            TtlPolicy::new(Duration::from_secs(3600), Duration::from_secs(300)),
            resource_manager,
        ))
    }

    /// Size of the heatmap body served by [MockFetcher].
    fn heatmap_bytes() -> usize {
        serde_json::to_vec(&heatmap_document()).unwrap().len()
    }

    /// Dataset label values recorded in the cache lookup counter.
    fn looked_up_datasets() -> Vec<String> {
        metrics::DATASET_CACHE_LOOKUPS
            .collect()
            .iter()
            .flat_map(|family| family.get_metric())
            .flat_map(|metric| metric.get_label())
            .filter(|label| label.get_name() == "dataset")
            .map(|label| label.get_value().to_string())
            .collect()
    }

    #[test]
    fn ttl_policy() {
        let policy = TtlPolicy::new(Duration::from_secs(3600), Duration::from_secs(300))
            .with_override("special", Duration::from_secs(5));
        let ttl = |name| policy.ttl(&DatasetName::new(name).unwrap());
        assert_eq!(Duration::from_secs(3600), ttl(CORRELATION_DATASET));
        assert_eq!(Duration::from_secs(300), ttl(HEATMAP_DATASET));
        assert_eq!(Duration::from_secs(5), ttl("special"));
    }

    #[test]
    fn parse_document_envelope() {
        let name = heatmap();
        assert!(parse_document(&name, br#"{"metadata": {}, "data": []}"#).is_ok());
        for body in [&b"not json"[..], b"[]", br#"{"data": []}"#, br#"{"metadata": 1}"#] {
            let err = parse_document(&name, body).unwrap_err();
            assert_eq!("MalformedDataset", err.kind());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn hit_within_ttl() {
        let fetcher = Arc::new(MockFetcher::new().with_document(HEATMAP_DATASET, &heatmap_document()));
        let cache = cache(fetcher.clone());
        let first = cache.get_or_fetch(&heatmap()).await.unwrap();
        tokio::time::advance(Duration::from_secs(299)).await;
        let second = cache.get_or_fetch(&heatmap()).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(1, fetcher.fetches());
        assert_eq!(heatmap_document(), *first);
    }

    #[tokio::test(start_paused = true)]
    async fn single_flight_after_expiry() {
        let fetcher = Arc::new(
            MockFetcher::new()
                .with_document(HEATMAP_DATASET, &heatmap_document())
                .with_delay(Duration::from_millis(100)),
        );
        let cache = cache(fetcher.clone());
        let first = cache.get_or_fetch(&heatmap()).await.unwrap();
        assert_eq!(1, fetcher.fetches());

        tokio::time::advance(Duration::from_secs(301)).await;
        let mut tasks = JoinSet::new();
        for _ in 0..10 {
            let cache = cache.clone();
            tasks.spawn(async move { cache.get_or_fetch(&heatmap()).await });
        }
        let mut documents = vec![];
        while let Some(result) = tasks.join_next().await {
            documents.push(result.unwrap().unwrap());
        }
        assert_eq!(2, fetcher.fetches());
        assert_eq!(10, documents.len());
        assert!(!Arc::ptr_eq(&first, &documents[0]));
        assert!(documents.iter().all(|doc| Arc::ptr_eq(doc, &documents[0])));
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_first_fetch_failure_is_shared() {
        let fetcher = Arc::new(MockFetcher::new().with_delay(Duration::from_millis(100)));
        fetcher.set_failing(true);
        let cache = cache(fetcher.clone());
        let mut tasks = JoinSet::new();
        for _ in 0..5 {
            let cache = cache.clone();
            tasks.spawn(async move { cache.get_or_fetch(&heatmap()).await });
        }
        while let Some(result) = tasks.join_next().await {
            assert_eq!("OriginUnavailable", result.unwrap().unwrap_err().kind());
        }
        assert_eq!(1, fetcher.fetches());
        // The last waiter releases the slot.
        assert_eq!(0, cache.tracked_datasets().await);
    }

    #[tokio::test(start_paused = true)]
    async fn failure_does_not_serve_stale() {
        let fetcher = Arc::new(MockFetcher::new().with_document(HEATMAP_DATASET, &heatmap_document()));
        let cache = cache(fetcher.clone());
        cache.get_or_fetch(&heatmap()).await.unwrap();

        tokio::time::advance(Duration::from_secs(301)).await;
        fetcher.set_failing(true);
        let err = cache.get_or_fetch(&heatmap()).await.unwrap_err();
        assert_eq!("OriginUnavailable", err.kind());
        // The next request retries rather than replaying the old failure.
        let err = cache.get_or_fetch(&heatmap()).await.unwrap_err();
        assert_eq!("OriginUnavailable", err.kind());
        assert_eq!(3, fetcher.fetches());

        // The stale entry is still held but is not fresh.
        let entry = cache.entry(&heatmap()).await.unwrap();
        assert!(!entry.is_fresh(Duration::from_secs(300)));

        fetcher.set_failing(false);
        cache.get_or_fetch(&heatmap()).await.unwrap();
        assert_eq!(4, fetcher.fetches());
    }

    #[tokio::test]
    async fn unknown_dataset() {
        let fetcher = Arc::new(MockFetcher::new());
        let cache = cache(fetcher);
        let err = cache
            .get_or_fetch(&DatasetName::new("missing").unwrap())
            .await
            .unwrap_err();
        assert_eq!("DatasetNotFound", err.kind());
        assert!(cache.entry(&DatasetName::new("missing").unwrap()).await.is_none());
        assert_eq!(0, cache.tracked_datasets().await);
    }

    #[tokio::test]
    async fn unknown_datasets_are_not_tracked() {
        let fetcher = Arc::new(MockFetcher::new().with_document(HEATMAP_DATASET, &heatmap_document()));
        let cache = cache(fetcher);
        cache.get_or_fetch(&heatmap()).await.unwrap();
        for i in 0..1000 {
            let name = DatasetName::new(&format!("untracked-{}", i)).unwrap();
            let err = cache.get_or_fetch(&name).await.unwrap_err();
            assert_eq!("DatasetNotFound", err.kind());
        }
        assert_eq!(1, cache.tracked_datasets().await);
        let labels = looked_up_datasets();
        assert!(labels.iter().any(|label| label == HEATMAP_DATASET));
        assert!(!labels.iter().any(|label| label.starts_with("untracked-")));
    }

    #[tokio::test]
    async fn failed_refresh_keeps_stale_slot() {
        let fetcher = Arc::new(MockFetcher::new().with_document(HEATMAP_DATASET, &heatmap_document()));
        let cache = cache(fetcher.clone());
        cache.get_or_fetch(&heatmap()).await.unwrap();
        fetcher.set_failing(true);
        // Served from the fresh entry, so the failing origin is not consulted.
        cache.get_or_fetch(&heatmap()).await.unwrap();
        assert_eq!(1, cache.tracked_datasets().await);
    }

    #[tokio::test(start_paused = true)]
    async fn cached_documents_hold_memory() {
        let bytes = heatmap_bytes();
        let rm = Arc::new(ResourceManager::new(None, Some(bytes * 2), None));
        let fetcher = Arc::new(MockFetcher::new().with_document(HEATMAP_DATASET, &heatmap_document()));
        let cache = limited_cache(fetcher.clone(), rm.clone());
        cache.get_or_fetch(&heatmap()).await.unwrap();
        assert_eq!(Some(bytes), rm.available_memory());
        assert_eq!(bytes, cache.entry(&heatmap()).await.unwrap().reserved_bytes());

        // A refresh replaces the reservation rather than adding to it.
        tokio::time::advance(Duration::from_secs(301)).await;
        cache.get_or_fetch(&heatmap()).await.unwrap();
        assert_eq!(2, fetcher.fetches());
        assert_eq!(Some(bytes), rm.available_memory());
    }

    #[tokio::test(start_paused = true)]
    async fn expired_documents_are_evicted_for_memory() {
        let bytes = heatmap_bytes();
        let rm = Arc::new(ResourceManager::new(None, Some(bytes), None));
        let fetcher = Arc::new(
            MockFetcher::new()
                .with_document(HEATMAP_DATASET, &heatmap_document())
                .with_document("other", &heatmap_document()),
        );
        let cache = limited_cache(fetcher, rm.clone());
        let other = DatasetName::new("other").unwrap();

        cache.get_or_fetch(&heatmap()).await.unwrap();
        // The heatmap entry is fresh and holds the whole pool.
        let err = cache.get_or_fetch(&other).await.unwrap_err();
        assert_eq!("InsufficientMemory", err.kind());
        assert_eq!(0, rm.available_memory().unwrap());

        tokio::time::advance(Duration::from_secs(301)).await;
        cache.get_or_fetch(&other).await.unwrap();
        assert!(cache.entry(&heatmap()).await.is_none());
        assert_eq!(Some(0), rm.available_memory());
    }

    #[tokio::test(start_paused = true)]
    async fn document_larger_than_memory_pool_is_shared() {
        let rm = Arc::new(ResourceManager::new(None, Some(16), None));
        let fetcher = Arc::new(
            MockFetcher::new()
                .with_document(HEATMAP_DATASET, &heatmap_document())
                .with_delay(Duration::from_millis(100)),
        );
        let cache = limited_cache(fetcher.clone(), rm);
        let mut tasks = JoinSet::new();
        for _ in 0..5 {
            let cache = cache.clone();
            tasks.spawn(async move { cache.get_or_fetch(&heatmap()).await });
        }
        while let Some(result) = tasks.join_next().await {
            let err = result.unwrap().unwrap_err();
            assert_eq!("InsufficientMemory", err.kind());
            assert_eq!(axum::http::StatusCode::INTERNAL_SERVER_ERROR, err.status());
        }
        assert_eq!(1, fetcher.fetches());
        assert_eq!(0, cache.tracked_datasets().await);
    }

    #[tokio::test]
    async fn malformed_body() {
        let fetcher = Arc::new(MockFetcher::new().with_body(HEATMAP_DATASET, "{\"data\": []"));
        let cache = cache(fetcher);
        let err = cache.get_or_fetch(&heatmap()).await.unwrap_err();
        assert_eq!("MalformedDataset", err.kind());
    }

    #[tokio::test(start_paused = true)]
    async fn different_datasets_do_not_block() {
        let fetcher = Arc::new(
            MockFetcher::new()
                .with_document("slow", &heatmap_document())
                .with_document(HEATMAP_DATASET, &heatmap_document())
                .with_delay_for("slow", Duration::from_secs(60)),
        );
        let cache = cache(fetcher.clone());
        let slow = {
            let cache = cache.clone();
            tokio::spawn(async move {
                cache
                    .get_or_fetch(&DatasetName::new("slow").unwrap())
                    .await
            })
        };
        // Let the slow fetch take its slot lock.
        tokio::task::yield_now().await;
        while fetcher.fetches() == 0 {
            tokio::task::yield_now().await;
        }
        let started = Instant::now();
        cache.get_or_fetch(&heatmap()).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(!slow.is_finished());
        slow.await.unwrap().unwrap();
    }
}
