//! Resource management
//!
//! Bounds the connections opened to the origin, the number of concurrent filtering tasks, and the
//! memory held by cached dataset documents.

use crate::error::DataServerError;
use crate::models::DatasetName;

use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, SemaphorePermit};

/// Memory pool shared by every cached document.
#[derive(Debug)]
struct MemoryPool {
    permits: Arc<Semaphore>,
    total: usize,
}

/// Memory reserved for one cached document, returned to the pool on drop.
#[derive(Debug)]
pub struct MemoryReservation {
    bytes: usize,
    _permit: Option<OwnedSemaphorePermit>,
}

impl MemoryReservation {
    /// Size of the reservation in bytes.
    pub fn bytes(&self) -> usize {
        self.bytes
    }
}

/// [crate::resource_manager::ResourceManager] allocates resources to requests and cache entries.
///
/// Connections and tasks are transient and waited for. Memory is reserved without waiting, since
/// it is only given back when a cached document is replaced or evicted.
#[derive(Debug)]
pub struct ResourceManager {
    /// Optional semaphore for connections to the origin.
    origin_connections: Option<Semaphore>,

    /// Optional pool for the memory of cached documents (bytes).
    memory: Option<MemoryPool>,

    /// Optional semaphore for CPU-bound filtering tasks.
    tasks: Option<Semaphore>,
}

impl ResourceManager {
    /// Returns a new ResourceManager object.
    pub fn new(
        origin_connection_limit: Option<usize>,
        memory_limit: Option<usize>,
        task_limit: Option<usize>,
    ) -> Self {
        Self {
            origin_connections: origin_connection_limit.map(Semaphore::new),
            memory: memory_limit.map(|total| MemoryPool {
                permits: Arc::new(Semaphore::new(total)),
                total,
            }),
            tasks: task_limit.map(Semaphore::new),
        }
    }

    /// Acquire an origin connection resource.
    pub async fn origin_connection(&self) -> Result<Option<SemaphorePermit>, DataServerError> {
        optional_acquire(&self.origin_connections).await
    }

    /// Acquire a task resource.
    pub async fn task(&self) -> Result<Option<SemaphorePermit>, DataServerError> {
        optional_acquire(&self.tasks).await
    }

    /// Check that a document of `bytes` could fit in the memory pool at all.
    pub fn check_fits(&self, dataset: &DatasetName, bytes: usize) -> Result<(), DataServerError> {
        match &self.memory {
            Some(pool) if bytes > pool.total => Err(DataServerError::InsufficientMemory {
                dataset: dataset.to_string(),
                requested: bytes,
                available: pool.total,
            }),
            _ => Ok(()),
        }
    }

    /// Reserve memory for a document of `bytes`, without waiting.
    ///
    /// Returns `Ok(None)` if the pool does not currently have enough free memory, and an error if
    /// the document is larger than the whole pool.
    pub fn try_reserve(
        &self,
        dataset: &DatasetName,
        bytes: usize,
    ) -> Result<Option<MemoryReservation>, DataServerError> {
        let Some(pool) = &self.memory else {
            return Ok(Some(MemoryReservation {
                bytes,
                _permit: None,
            }));
        };
        self.check_fits(dataset, bytes)?;
        let permit = pool.permits.clone().try_acquire_many_owned(bytes.try_into()?);
        Ok(permit.ok().map(|permit| MemoryReservation {
            bytes,
            _permit: Some(permit),
        }))
    }

    /// Free memory in the pool, if memory is limited.
    pub fn available_memory(&self) -> Option<usize> {
        self.memory
            .as_ref()
            .map(|pool| pool.permits.available_permits())
    }
}

/// Acquire a permit on an optional Semaphore, if present.
async fn optional_acquire(
    sem: &Option<Semaphore>,
) -> Result<Option<SemaphorePermit>, DataServerError> {
    match sem {
        Some(sem) => Ok(Some(sem.acquire().await?)),
        None => Ok(None),
    }
}
