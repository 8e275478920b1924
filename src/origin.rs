//! Origin fetchers.
//!
//! An origin fetcher retrieves the raw bytes of a named dataset. It holds no state and performs no
//! retries: retry policy belongs to the caller.

use crate::cli::CommandLineArgs;
use crate::error::DataServerError;
use crate::models::DatasetName;
use crate::resource_manager::ResourceManager;

use async_trait::async_trait;
use bytes::Bytes;
use std::path::PathBuf;
use std::sync::Arc;
use url::Url;

/// Origin fetcher trait.
///
/// Defines the interface for retrieving datasets from wherever they are published.
#[async_trait]
pub trait OriginFetcher: Send + Sync {
    /// Fetch the raw document of a dataset.
    ///
    /// # Arguments
    ///
    /// * `dataset`: Name of the dataset
    async fn fetch(&self, dataset: &DatasetName) -> Result<Bytes, DataServerError>;
}

/// Build the fetcher selected by the command line arguments.
///
/// A configured origin URL selects [HttpOriginFetcher], otherwise datasets are read from the local
/// data directory.
pub fn from_args(
    args: &CommandLineArgs,
    resource_manager: Arc<ResourceManager>,
) -> Arc<dyn OriginFetcher> {
    match &args.origin_url {
        Some(url) => {
            tracing::info!("Fetching datasets from origin {}", url);
            Arc::new(HttpOriginFetcher::new(url.clone(), resource_manager))
        }
        None => {
            tracing::info!(
                "No origin configured, reading datasets from {}",
                args.data_dir.display()
            );
            Arc::new(LocalOriginFetcher::new(args.data_dir.clone()))
        }
    }
}

/// Returns the URL of a dataset document below `base_url`.
pub fn dataset_url(base_url: &Url, dataset: &str) -> Result<Url, url::ParseError> {
    with_trailing_slash(base_url).join(&format!("{}.json", dataset))
}

/// Returns `url` with a trailing slash so that joins append to its path.
pub fn with_trailing_slash(url: &Url) -> Url {
    let mut url = url.clone();
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    url
}

/// HTTP origin fetcher.
///
/// Implements [OriginFetcher] for a remote content origin serving `<base>/<dataset>.json`.
#[derive(Debug)]
pub struct HttpOriginFetcher {
    reqwest_client: reqwest::Client,
    base_url: Url,
    resource_manager: Arc<ResourceManager>,
}

impl HttpOriginFetcher {
    /// Create a new HTTP origin fetcher.
    pub fn new(base_url: Url, resource_manager: Arc<ResourceManager>) -> Self {
        Self {
            reqwest_client: reqwest::Client::new(),
            base_url,
            resource_manager,
        }
    }
}

#[async_trait]
impl OriginFetcher for HttpOriginFetcher {
    /// Download a dataset document.
    ///
    /// Holds an origin connection permit for the whole transfer. A body announced as larger than
    /// the memory pool is refused before it is downloaded.
    #[tracing::instrument(level = "DEBUG", skip(self))]
    async fn fetch(&self, dataset: &DatasetName) -> Result<Bytes, DataServerError> {
        let unavailable = |reason: String| DataServerError::OriginUnavailable {
            dataset: dataset.to_string(),
            reason,
        };
        let url = dataset_url(&self.base_url, dataset.as_str())
            .map_err(|err| unavailable(err.to_string()))?;
        // Acquire connection permit to be freed via drop when this function returns
        let _conn_permit = self.resource_manager.origin_connection().await?;
        let response = match self.reqwest_client.get(url).send().await {
            Ok(response) => match response.status() {
                reqwest::StatusCode::OK => response,
                reqwest::StatusCode::NOT_FOUND => {
                    return Err(DataServerError::DatasetNotFound {
                        dataset: dataset.to_string(),
                    })
                }
                status => {
                    return Err(unavailable(format!(
                        "HTTP request failed with status: {}",
                        status
                    )))
                }
            },
            Err(err) => return Err(unavailable(err.to_string())),
        };
        if let Some(content_length) = response.content_length() {
            self.resource_manager
                .check_fits(dataset, content_length.try_into()?)?;
        }
        response
            .bytes()
            .await
            .map_err(|err| unavailable(err.to_string()))
    }
}

/// Local filesystem fetcher used when no origin is configured.
///
/// Reads `<root>/<dataset>.json`.
#[derive(Debug)]
pub struct LocalOriginFetcher {
    root: PathBuf,
}

impl LocalOriginFetcher {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }
}

#[async_trait]
impl OriginFetcher for LocalOriginFetcher {
    #[tracing::instrument(level = "DEBUG", skip(self))]
    async fn fetch(&self, dataset: &DatasetName) -> Result<Bytes, DataServerError> {
        let path = self.root.join(format!("{}.json", dataset));
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(data.into()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(DataServerError::DatasetNotFound {
                    dataset: dataset.to_string(),
                })
            }
            Err(err) => {
                tracing::error!(path = %path.display(), error = %err, "failed to read dataset");
                Err(DataServerError::OriginUnavailable {
                    dataset: dataset.to_string(),
                    reason: format!("failed to read dataset file: {}", err.kind()),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dataset_url_below_base() {
        let base = Url::parse("https://cdn.example.com/views").unwrap();
        assert_eq!(
            "https://cdn.example.com/views/heatmap.json",
            dataset_url(&base, "heatmap").unwrap().as_str()
        );
        let base = Url::parse("https://cdn.example.com/views/").unwrap();
        assert_eq!(
            "https://cdn.example.com/views/heatmap.json",
            dataset_url(&base, "heatmap").unwrap().as_str()
        );
    }

    #[tokio::test]
    async fn local_fetch() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("heatmap.json"), br#"{"metadata": {}}"#).unwrap();
        let fetcher = LocalOriginFetcher::new(dir.path().to_path_buf());
        let name = DatasetName::new("heatmap").unwrap();
        let bytes = fetcher.fetch(&name).await.unwrap();
        assert_eq!(&br#"{"metadata": {}}"#[..], &bytes[..]);
    }

    #[tokio::test]
    async fn local_fetch_missing() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = LocalOriginFetcher::new(dir.path().to_path_buf());
        let name = DatasetName::new("heatmap").unwrap();
        let err = fetcher.fetch(&name).await.unwrap_err();
        assert_eq!("DatasetNotFound", err.kind());
    }

    #[tokio::test]
    async fn local_read_error_hides_path() {
        let dir = tempfile::tempdir().unwrap();
        // A directory where the document should be cannot be read as a file.
        std::fs::create_dir(dir.path().join("heatmap.json")).unwrap();
        let fetcher = LocalOriginFetcher::new(dir.path().to_path_buf());
        let name = DatasetName::new("heatmap").unwrap();
        let err = fetcher.fetch(&name).await.unwrap_err();
        assert_eq!("OriginUnavailable", err.kind());
        let message = err.to_string();
        assert!(message.starts_with("dataset heatmap is unavailable"), "{message}");
        assert!(!message.contains(dir.path().to_str().unwrap()), "{message}");
    }

    #[tokio::test]
    async fn http_body_larger_than_memory_pool() {
        let router = axum::Router::new().route(
            "/views/big.json",
            axum::routing::get(|| async { "x".repeat(4096) }),
        );
        let server = axum::Server::bind(&std::net::SocketAddr::from(([127, 0, 0, 1], 0)))
            .serve(router.into_make_service());
        let base = Url::parse(&format!("http://{}/views/", server.local_addr())).unwrap();
        tokio::spawn(server);

        let fetcher =
            HttpOriginFetcher::new(base, Arc::new(ResourceManager::new(None, Some(1024), None)));
        let err = fetcher
            .fetch(&DatasetName::new("big").unwrap())
            .await
            .unwrap_err();
        assert_eq!("InsufficientMemory", err.kind());
        assert_eq!(
            axum::http::StatusCode::INTERNAL_SERVER_ERROR,
            err.status()
        );
        assert!(err.replay().is_some());
    }

    #[tokio::test]
    async fn http_fetch_unreachable_origin() {
        // Nothing listens on port 9 (discard) of localhost in the test environment.
        let base = Url::parse("http://127.0.0.1:9/views/").unwrap();
        let fetcher = HttpOriginFetcher::new(base, Arc::new(ResourceManager::new(None, None, None)));
        let name = DatasetName::new("heatmap").unwrap();
        let err = fetcher.fetch(&name).await.unwrap_err();
        assert_eq!("OriginUnavailable", err.kind());
    }
}
