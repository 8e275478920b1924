//! Pagination store.
//!
//! Read-only lookup of pre-materialised pages. Each paginated dataset lives in its own directory:
//!
//! ```text
//! <pages_dir>/<dataset>/metadata.json   {"total_records": N, "page_size": P, "total_pages": T}
//! <pages_dir>/<dataset>/<k>.json        {"metadata": {...}, "data": [...]} or a bare array
//! ```
//!
//! Pages are produced offline by [write_pages] and are never transformed when served.

use crate::cli::CommandLineArgs;
use crate::error::DataServerError;
use crate::models::{DatasetName, Page, PageMetadata};

use hashbrown::HashMap;
use serde_json::Value;
use std::io::ErrorKind;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;

const METADATA_FILE: &str = "metadata.json";

fn page_file(page_index: usize) -> String {
    format!("{}.json", page_index)
}

/// Pagination store rooted at a directory of page artifacts.
pub struct PaginationStore {
    root: PathBuf,
    /// Page metadata per dataset, read once. Only consistent metadata is kept.
    metadata: RwLock<HashMap<DatasetName, PageMetadata>>,
}

impl PaginationStore {
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            metadata: RwLock::new(HashMap::new()),
        }
    }

    pub fn from_args(args: &CommandLineArgs) -> Self {
        Self::new(args.pages_dir.clone())
    }

    /// Load a page of a dataset.
    ///
    /// The name is validated before any filesystem access.
    ///
    /// # Arguments
    ///
    /// * `dataset`: Name of the paginated dataset
    /// * `page_index`: Zero-based page index
    #[tracing::instrument(level = "DEBUG", skip(self))]
    pub async fn load(&self, dataset: &str, page_index: usize) -> Result<Page, DataServerError> {
        let dataset = DatasetName::new(dataset)?;
        let not_found = || DataServerError::PageNotFound {
            dataset: dataset.to_string(),
            page: page_index,
        };
        let metadata = self.metadata(&dataset).await?.ok_or_else(not_found)?;
        let expected_len = metadata.page_len(page_index).ok_or_else(not_found)?;

        let path = self.root.join(dataset.as_str()).join(page_file(page_index));
        let malformed = |reason: String| DataServerError::MalformedDataset {
            dataset: dataset.to_string(),
            reason,
        };
        let body = match tokio::fs::read(&path).await {
            Ok(body) => body,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(malformed(format!(
                    "page {} of {} pages is missing",
                    page_index, metadata.total_pages
                )))
            }
            Err(err) => return Err(err.into()),
        };
        let data = parse_page(&body).map_err(&malformed)?;
        if data.len() != expected_len {
            return Err(malformed(format!(
                "page {} has {} records, expected {}",
                page_index,
                data.len(),
                expected_len
            )));
        }
        Ok(Page { metadata, data })
    }

    /// Metadata of a paginated dataset, or `None` if the dataset is unknown.
    async fn metadata(
        &self,
        dataset: &DatasetName,
    ) -> Result<Option<PageMetadata>, DataServerError> {
        {
            let memo = self.metadata.read().await;
            if let Some(metadata) = memo.get(dataset) {
                return Ok(Some(*metadata));
            }
        }
        let path = self.root.join(dataset.as_str()).join(METADATA_FILE);
        let body = match tokio::fs::read(&path).await {
            Ok(body) => body,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let malformed = |reason: String| DataServerError::MalformedDataset {
            dataset: dataset.to_string(),
            reason,
        };
        let metadata: PageMetadata = serde_json::from_slice(&body)
            .map_err(|err| malformed(format!("invalid page metadata: {}", err)))?;
        if !metadata.is_consistent() {
            return Err(malformed(format!(
                "inconsistent page metadata: {} records in pages of {} do not make {} pages",
                metadata.total_records, metadata.page_size, metadata.total_pages
            )));
        }
        tracing::debug!(dataset = %dataset, ?metadata, "loaded page metadata");
        self.metadata
            .write()
            .await
            .insert(dataset.clone(), metadata);
        Ok(Some(metadata))
    }
}

/// Records of a page artifact: either `{"data": [...]}` or a bare array.
fn parse_page(body: &[u8]) -> Result<Vec<Value>, String> {
    match serde_json::from_slice(body).map_err(|err| format!("invalid page: {}", err))? {
        Value::Array(records) => Ok(records),
        Value::Object(mut page) => match page.remove("data") {
            Some(Value::Array(records)) => Ok(records),
            _ => Err("page has no data array".to_string()),
        },
        _ => Err("page is neither an object nor an array".to_string()),
    }
}

/// Split records into consecutive pages of `page_size`. The last page may be shorter.
pub fn paginate(records: &[Value], page_size: NonZeroUsize) -> Vec<Page> {
    let metadata = PageMetadata::new(records.len(), page_size);
    records
        .chunks(page_size.get())
        .map(|chunk| Page {
            metadata,
            data: chunk.to_vec(),
        })
        .collect()
}

/// Materialise the pages of a dataset below `root`, replacing any existing artifacts.
pub async fn write_pages(
    root: &Path,
    dataset: &DatasetName,
    records: &[Value],
    page_size: NonZeroUsize,
) -> Result<PageMetadata, DataServerError> {
    let dir = root.join(dataset.as_str());
    tokio::fs::create_dir_all(&dir).await?;
    let metadata = PageMetadata::new(records.len(), page_size);
    for (page_index, page) in paginate(records, page_size).iter().enumerate() {
        let body = serde_json::to_vec(page).map_err(std::io::Error::from)?;
        tokio::fs::write(dir.join(page_file(page_index)), body).await?;
    }
    let body = serde_json::to_vec(&metadata).map_err(std::io::Error::from)?;
    tokio::fs::write(dir.join(METADATA_FILE), body).await?;
    tracing::info!(
        dataset = %dataset,
        total_records = metadata.total_records,
        total_pages = metadata.total_pages,
        "wrote pages"
    );
    Ok(metadata)
}
