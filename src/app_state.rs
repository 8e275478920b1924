use crate::cli::CommandLineArgs;
use crate::dataset_cache::{DatasetCache, TtlPolicy};
use crate::origin::{self, OriginFetcher};
use crate::pagination::PaginationStore;
use crate::query::QueryService;
use crate::resource_manager::ResourceManager;

use std::sync::Arc;

/// Shared application state passed to each request handler.
pub struct AppState {
    /// Command line arguments.
    pub args: CommandLineArgs,

    /// Resource manager.
    pub resource_manager: Arc<ResourceManager>,

    /// Query service, owning the dataset cache.
    pub query_service: QueryService,

    /// Pagination store.
    pub pagination_store: PaginationStore,
}

impl AppState {
    /// Create and return an [AppState] fetching datasets from the configured origin.
    pub fn new(args: &CommandLineArgs) -> Self {
        let resource_manager = Arc::new(resource_manager(args));
        let fetcher = origin::from_args(args, resource_manager.clone());
        Self::build(args, resource_manager, fetcher)
    }

    /// Create and return an [AppState] fetching datasets with `fetcher`.
    pub fn with_fetcher(args: &CommandLineArgs, fetcher: Arc<dyn OriginFetcher>) -> Self {
        Self::build(args, Arc::new(resource_manager(args)), fetcher)
    }

    fn build(
        args: &CommandLineArgs,
        resource_manager: Arc<ResourceManager>,
        fetcher: Arc<dyn OriginFetcher>,
    ) -> Self {
        let cache = Arc::new(DatasetCache::new(
            fetcher,
            TtlPolicy::from_args(args),
            resource_manager.clone(),
        ));
        let query_service = QueryService::new(cache, resource_manager.clone(), args.use_rayon);
        let pagination_store = PaginationStore::from_args(args);

        Self {
            args: args.clone(),
            resource_manager,
            query_service,
            pagination_store,
        }
    }
}

fn resource_manager(args: &CommandLineArgs) -> ResourceManager {
    let task_limit = args
        .thread_limit
        .or_else(|| Some(num_cpus::get().saturating_sub(1).max(1)));
    ResourceManager::new(
        args.connection_limit_origin,
        args.memory_limit,
        task_limit,
    )
}

/// AppState wrapped in an Atomic Reference Count (Arc) to allow multiple references.
pub type SharedAppState = Arc<AppState>;
