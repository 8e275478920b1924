//! Data sources and source resolution.

use crate::client::ClientConfig;
use crate::error::{ClientError, ErrorBody};
use crate::models::{DatasetName, FilterParams};
use crate::origin::{dataset_url, with_trailing_slash};
use crate::query::{self, QueryKind};

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;
use url::Url;

/// A request for data, independent of where it is served from.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub enum DatasetRequest {
    /// The full document of a dataset
    View { dataset: DatasetName },
    /// A filtered view
    Query {
        view: QueryKind,
        params: BTreeMap<String, String>,
    },
    /// One page of a paginated dataset
    Page { dataset: DatasetName, page: usize },
}

impl DatasetRequest {
    /// Path of the request on the local service, relative to its base URL.
    fn local_path(&self) -> String {
        match self {
            Self::View { dataset } => format!("views/{}", dataset),
            Self::Query { view, .. } => format!("query/{}", view.slug()),
            Self::Page { dataset, page } => format!("paginated/{}/{}.json", dataset, page),
        }
    }
}

/// A place data can be fetched from.
#[async_trait]
pub trait DataSource: Send + Sync {
    /// Name of the source, reported with successful results and in logs.
    fn name(&self) -> &str;

    /// Fetch the JSON answer to `request`.
    async fn fetch(&self, request: &DatasetRequest) -> Result<Value, ClientError>;
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Layout {
    /// Static documents: `<base>/<dataset>.json` and `<base>/paginated/<dataset>/<k>.json`
    Origin,
    /// The local query and pagination service
    Local,
}

/// HTTP data source.
#[derive(Debug)]
pub struct HttpSource {
    name: &'static str,
    layout: Layout,
    base_url: Url,
    reqwest_client: reqwest::Client,
}

impl HttpSource {
    /// A remote content origin serving whole documents and page files.
    ///
    /// Queries are answered by fetching the full document and filtering it locally.
    pub fn origin(base_url: Url) -> Self {
        Self::new("origin", Layout::Origin, base_url)
    }

    /// The local query and pagination service.
    pub fn local(base_url: Url) -> Self {
        Self::new("local", Layout::Local, base_url)
    }

    fn new(name: &'static str, layout: Layout, base_url: Url) -> Self {
        Self {
            name,
            layout,
            base_url: with_trailing_slash(&base_url),
            reqwest_client: reqwest::Client::new(),
        }
    }

    fn url(&self, request: &DatasetRequest) -> Result<Url, ClientError> {
        let invalid = |err: url::ParseError| ClientError::MalformedResponse {
            url: self.base_url.to_string(),
            reason: format!("cannot build request URL: {}", err),
        };
        let url = match (self.layout, request) {
            (Layout::Origin, DatasetRequest::View { dataset }) => {
                dataset_url(&self.base_url, dataset.as_str())
            }
            (Layout::Origin, DatasetRequest::Query { view, .. }) => {
                dataset_url(&self.base_url, view.dataset())
            }
            (Layout::Origin, DatasetRequest::Page { .. }) | (Layout::Local, _) => {
                self.base_url.join(&request.local_path())
            }
        };
        let mut url = url.map_err(invalid)?;
        if let (Layout::Local, DatasetRequest::Query { params, .. }) = (self.layout, request) {
            if !params.is_empty() {
                url.query_pairs_mut().extend_pairs(params);
            }
        }
        Ok(url)
    }

    async fn get_json(&self, url: Url) -> Result<Value, ClientError> {
        let response = self
            .reqwest_client
            .get(url.clone())
            .send()
            .await
            .map_err(|source| ClientError::RequestFailed {
                url: url.to_string(),
                source,
            })?;
        let status = response.status();
        if !status.is_success() {
            // Structured errors from the local service are kept for the user-visible error.
            let body = response.json::<ErrorBody>().await.ok();
            return Err(ClientError::ErrorStatus {
                url: url.to_string(),
                status: status.as_u16(),
                body,
            });
        }
        response
            .json::<Value>()
            .await
            .map_err(|err| ClientError::MalformedResponse {
                url: url.to_string(),
                reason: err.to_string(),
            })
    }
}

#[async_trait]
impl DataSource for HttpSource {
    fn name(&self) -> &str {
        self.name
    }

    #[tracing::instrument(level = "DEBUG", skip(self), fields(source = self.name))]
    async fn fetch(&self, request: &DatasetRequest) -> Result<Value, ClientError> {
        let url = self.url(request)?;
        let started = Instant::now();
        let data = self.get_json(url.clone()).await?;
        match (self.layout, request) {
            (Layout::Origin, DatasetRequest::Query { view, params }) => {
                let raw: HashMap<String, String> = params.clone().into_iter().collect();
                let params = FilterParams::parse(&raw, view.dimensions());
                let response = query::build_response(*view, &data, params, started).map_err(
                    |err| ClientError::MalformedResponse {
                        url: url.to_string(),
                        reason: err.to_string(),
                    },
                )?;
                serde_json::to_value(response).map_err(|err| ClientError::MalformedResponse {
                    url: url.to_string(),
                    reason: err.to_string(),
                })
            }
            _ => Ok(data),
        }
    }
}

/// A successful resolution.
#[derive(Clone, Debug, PartialEq)]
pub struct Resolved {
    pub data: Value,
    /// Name of the source that answered
    pub source: String,
}

/// Ordered list of data sources. The first source to succeed answers.
#[derive(Clone, Default)]
pub struct SourceChain {
    sources: Vec<Arc<dyn DataSource>>,
}

impl SourceChain {
    pub fn new(sources: Vec<Arc<dyn DataSource>>) -> Self {
        Self { sources }
    }

    /// The origin, when configured, followed by the local service.
    pub fn from_config(config: &ClientConfig) -> Self {
        let mut sources: Vec<Arc<dyn DataSource>> = vec![];
        if let Some(origin_url) = &config.origin_url {
            sources.push(Arc::new(HttpSource::origin(origin_url.clone())));
        }
        sources.push(Arc::new(HttpSource::local(config.local_url.clone())));
        Self::new(sources)
    }

    /// Names of the sources, in the order they are tried.
    pub fn source_names(&self) -> Vec<&str> {
        self.sources.iter().map(|source| source.name()).collect()
    }

    /// Resolve a request against each source in turn.
    ///
    /// Failures of sources followed by another are only logged. The error of the last source is
    /// returned if none succeeds.
    pub async fn resolve(&self, request: &DatasetRequest) -> Result<Resolved, ClientError> {
        let mut last_error = None;
        for (position, source) in self.sources.iter().enumerate() {
            match source.fetch(request).await {
                Ok(data) => {
                    return Ok(Resolved {
                        data,
                        source: source.name().to_string(),
                    })
                }
                Err(err) => {
                    if position + 1 < self.sources.len() {
                        tracing::debug!(
                            source = source.name(),
                            error = %err,
                            "data source failed, falling back"
                        );
                    }
                    last_error = Some(err);
                }
            }
        }
        Err(last_error.unwrap_or(ClientError::NoDataSource))
    }
}
