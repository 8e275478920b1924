//! Query service.
//!
//! Answers the fixed set of filtered views over the cached datasets. Parameter parsing is
//! permissive, filtering runs on the cached document without holding any cache lock, and every
//! response echoes the filters that were honoured together with the processing time.

use crate::dataset_cache::{DatasetCache, Document};
use crate::error::DataServerError;
use crate::filters::{self, branches, matrix, CategoryLookup};
use crate::models::{
    DatasetName, Dimension, FilterParams, CORRELATION_DATASET, DISTRIBUTIONS_DATASET,
    HEATMAP_DATASET,
};
use crate::resource_manager::ResourceManager;

use axum::{
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

/// Strong correlation threshold used for statistics when the query gives none.
pub const DEFAULT_STRONG_CORRELATION: f64 = 0.7;

/// A view answered by the query service.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum QueryKind {
    AcousticDistributions,
    CorrelationMatrix,
    Heatmap,
}

impl QueryKind {
    /// Look up a view by its URL slug.
    pub fn from_slug(slug: &str) -> Option<Self> {
        match slug {
            "acoustic-distributions" => Some(Self::AcousticDistributions),
            "correlation-matrix" => Some(Self::CorrelationMatrix),
            "heatmap" => Some(Self::Heatmap),
            _ => None,
        }
    }

    pub fn slug(self) -> &'static str {
        match self {
            Self::AcousticDistributions => "acoustic-distributions",
            Self::CorrelationMatrix => "correlation-matrix",
            Self::Heatmap => "heatmap",
        }
    }

    /// Name of the dataset backing this view.
    pub fn dataset(self) -> &'static str {
        match self {
            Self::AcousticDistributions => DISTRIBUTIONS_DATASET,
            Self::CorrelationMatrix => CORRELATION_DATASET,
            Self::Heatmap => HEATMAP_DATASET,
        }
    }

    /// Filter dimensions honoured by this view.
    pub fn dimensions(self) -> &'static [Dimension] {
        match self {
            Self::AcousticDistributions => &[
                Dimension::Index,
                Dimension::Station,
                Dimension::Bandwidth,
                Dimension::Category,
            ],
            Self::CorrelationMatrix => &[
                Dimension::Station,
                Dimension::Bandwidth,
                Dimension::Threshold,
                Dimension::IncludeMetadata,
            ],
            Self::Heatmap => &[
                Dimension::Station,
                Dimension::Year,
                Dimension::Species,
                Dimension::Limit,
                Dimension::Offset,
            ],
        }
    }
}

/// Response of the `acoustic-distributions` view.
#[derive(Debug, Serialize)]
pub struct DistributionsResponse {
    pub metadata: Value,
    pub distributions: Map<String, Value>,
    pub indices_metadata: Map<String, Value>,
    pub filters: FilterParams,
    pub processing_time_ms: f64,
}

/// Matrices of a correlation response.
#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum MatrixPayload {
    /// Exactly one station/bandwidth combination survived the filters.
    Single {
        correlation_matrix: Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        p_values: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        sample_sizes: Option<Value>,
        station: String,
        bandwidth: String,
    },
    /// Any other number of combinations, keyed as in the dataset.
    Multiple { matrix_data: Map<String, Value> },
}

/// Summary of the returned correlation matrices.
#[derive(Debug, PartialEq, Serialize)]
pub struct CorrelationStatistics {
    pub matrix_count: usize,
    pub index_count: usize,
    /// Number of distinct off-diagonal pairs with a numeric correlation
    pub pair_count: usize,
    /// Pairs with `|r| >= strong_threshold`
    pub strong_pair_count: usize,
    pub strong_threshold: f64,
    pub max_abs_correlation: Option<f64>,
    pub mean_abs_correlation: Option<f64>,
}

impl CorrelationStatistics {
    fn of(leaves: &[branches::Leaf], index_count: usize, strong_threshold: f64) -> Self {
        let mut matrix_count = 0;
        let mut correlations = vec![];
        for leaf in leaves {
            let Some(correlation_matrix) = leaf
                .value
                .get("correlation_matrix")
                .and_then(matrix::from_json)
            else {
                continue;
            };
            matrix_count += 1;
            correlations.extend(matrix::upper_triangle_abs(
                matrix::weights(correlation_matrix.view()).view(),
            ));
        }
        let pair_count = correlations.len();
        let max_abs_correlation = correlations.iter().copied().reduce(f64::max);
        let mean_abs_correlation =
            (pair_count > 0).then(|| correlations.iter().sum::<f64>() / pair_count as f64);
        Self {
            matrix_count,
            index_count,
            pair_count,
            strong_pair_count: correlations
                .iter()
                .filter(|correlation| **correlation >= strong_threshold)
                .count(),
            strong_threshold,
            max_abs_correlation,
            mean_abs_correlation,
        }
    }
}

/// Response of the `correlation-matrix` view.
#[derive(Debug, Serialize)]
pub struct CorrelationResponse {
    pub metadata: Value,
    #[serde(flatten)]
    pub matrices: MatrixPayload,
    pub indices: Vec<Value>,
    pub statistics: CorrelationStatistics,
    pub high_correlations: Vec<Value>,
    pub suggested_removals: Vec<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub indices_metadata: Option<Map<String, Value>>,
    pub filters: FilterParams,
    pub processing_time_ms: f64,
}

/// Metadata of a heatmap response: the dataset's own metadata extended with the result counts.
#[derive(Debug, Serialize)]
pub struct HeatmapMetadata {
    #[serde(flatten)]
    pub source: Map<String, Value>,
    pub total_records: usize,
    pub filtered_records: usize,
    pub returned_records: usize,
    pub filters_applied: FilterParams,
    pub processing_time_ms: f64,
}

impl HeatmapMetadata {
    /// Fields computed per response, which replace any dataset metadata of the same name.
    const FIELDS: [&'static str; 5] = [
        "total_records",
        "filtered_records",
        "returned_records",
        "filters_applied",
        "processing_time_ms",
    ];
}

/// Response of the `heatmap` view.
#[derive(Debug, Serialize)]
pub struct HeatmapResponse {
    pub metadata: HeatmapMetadata,
    pub data: Vec<Value>,
}

/// Response of any view.
#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum QueryResponse {
    Distributions(DistributionsResponse),
    Correlation(CorrelationResponse),
    Heatmap(HeatmapResponse),
}

impl IntoResponse for QueryResponse {
    fn into_response(self) -> Response {
        Json(self).into_response()
    }
}

/// Answers queries from the dataset cache.
pub struct QueryService {
    cache: Arc<DatasetCache>,
    resource_manager: Arc<ResourceManager>,
    use_rayon: bool,
}

impl QueryService {
    /// Create a query service.
    ///
    /// # Arguments
    ///
    /// * `cache`: Dataset cache shared by every request
    /// * `resource_manager`: Bounds the number of concurrent filtering tasks
    /// * `use_rayon`: Whether to filter on the rayon thread pool
    pub fn new(
        cache: Arc<DatasetCache>,
        resource_manager: Arc<ResourceManager>,
        use_rayon: bool,
    ) -> Self {
        Self {
            cache,
            resource_manager,
            use_rayon,
        }
    }

    pub fn cache(&self) -> &DatasetCache {
        &self.cache
    }

    /// Return the full, unfiltered document of a dataset.
    pub async fn view(&self, dataset: &str) -> Result<Document, DataServerError> {
        let dataset = DatasetName::new(dataset)?;
        self.cache.get_or_fetch(&dataset).await
    }

    /// Answer a query.
    ///
    /// # Arguments
    ///
    /// * `view`: View slug, e.g. `correlation-matrix`
    /// * `raw_params`: Raw query parameters
    #[tracing::instrument(level = "DEBUG", skip(self, raw_params))]
    pub async fn handle(
        &self,
        view: &str,
        raw_params: &HashMap<String, String>,
    ) -> Result<QueryResponse, DataServerError> {
        let started = Instant::now();
        let kind = QueryKind::from_slug(view).ok_or_else(|| DataServerError::DatasetNotFound {
            dataset: view.to_string(),
        })?;
        let params = FilterParams::parse(raw_params, kind.dimensions());
        let document = self
            .cache
            .get_or_fetch(&DatasetName::new(kind.dataset())?)
            .await?;

        // Acquire a task permit to be freed via drop when filtering completes.
        let _task_permit = self.resource_manager.task().await?;
        if self.use_rayon {
            tokio_rayon::spawn(move || build_response(kind, &document, params, started)).await
        } else {
            build_response(kind, &document, params, started)
        }
    }
}

/// Build the response of a view from a dataset document.
///
/// This is pure computation over the document and is shared with the client, which filters
/// documents fetched straight from the origin.
pub fn build_response(
    kind: QueryKind,
    document: &Value,
    params: FilterParams,
    started: Instant,
) -> Result<QueryResponse, DataServerError> {
    match kind {
        QueryKind::AcousticDistributions => {
            distributions(document, params, started).map(QueryResponse::Distributions)
        }
        QueryKind::CorrelationMatrix => {
            correlation(document, params, started).map(QueryResponse::Correlation)
        }
        QueryKind::Heatmap => heatmap(document, params, started).map(QueryResponse::Heatmap),
    }
}

fn elapsed_ms(started: Instant) -> f64 {
    started.elapsed().as_secs_f64() * 1000.0
}

/// The payload object `key` of a document.
fn payload<'a>(
    document: &'a Value,
    kind: QueryKind,
    key: &str,
) -> Result<&'a Map<String, Value>, DataServerError> {
    document
        .get(key)
        .and_then(Value::as_object)
        .ok_or_else(|| DataServerError::MalformedDataset {
            dataset: kind.dataset().to_string(),
            reason: format!("missing {} object", key),
        })
}

/// The entries of `document[key]` whose names appear in `names`.
fn restrict_to<'a, I>(document: &Value, key: &str, names: I) -> Map<String, Value>
where
    I: IntoIterator<Item = &'a str>,
{
    let Some(all) = document.get(key).and_then(Value::as_object) else {
        return Map::new();
    };
    names
        .into_iter()
        .filter_map(|name| all.get_key_value(name))
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect()
}

fn distributions(
    document: &Value,
    params: FilterParams,
    started: Instant,
) -> Result<DistributionsResponse, DataServerError> {
    let kind = QueryKind::AcousticDistributions;
    let all = payload(document, kind, "distributions")?;
    let lookup = CategoryLookup::from_metadata(&document["metadata"]);
    let distributions = filters::filter_indices(all, &lookup, &params);
    let indices_metadata = restrict_to(
        document,
        "indices_metadata",
        distributions.keys().map(String::as_str),
    );
    Ok(DistributionsResponse {
        metadata: document["metadata"].clone(),
        distributions,
        indices_metadata,
        filters: params,
        processing_time_ms: elapsed_ms(started),
    })
}

fn correlation(
    document: &Value,
    params: FilterParams,
    started: Instant,
) -> Result<CorrelationResponse, DataServerError> {
    let kind = QueryKind::CorrelationMatrix;
    let station = params.station.as_deref();
    let bandwidth = params.bandwidth.as_deref();
    let threshold = params.correlation_threshold;

    let all = payload(document, kind, "correlation_matrices")?;
    let mut selected = branches::retain(all, station, bandwidth);
    if let Some(threshold) = threshold {
        selected = filters::threshold_matrices(&selected, threshold);
    }

    let leaves = branches::leaves(&selected);
    let mut indices: Vec<Value> = vec![];
    for leaf in &leaves {
        if let Some(Value::Array(leaf_indices)) = leaf.value.get("indices") {
            for index in leaf_indices {
                if !indices.contains(index) {
                    indices.push(index.clone());
                }
            }
        }
    }
    let statistics = CorrelationStatistics::of(
        &leaves,
        indices.len(),
        threshold.unwrap_or(DEFAULT_STRONG_CORRELATION),
    );
    let single = match leaves.as_slice() {
        [leaf] => Some(MatrixPayload::Single {
            correlation_matrix: leaf
                .value
                .get("correlation_matrix")
                .cloned()
                .unwrap_or(Value::Null),
            p_values: leaf.value.get("p_values").cloned(),
            sample_sizes: leaf.value.get("sample_sizes").cloned(),
            station: leaf.station.to_string(),
            bandwidth: leaf.bandwidth.to_string(),
        }),
        _ => None,
    };
    let matrices = single.unwrap_or(MatrixPayload::Multiple {
        matrix_data: selected,
    });

    let records = |key: &str| -> Vec<Value> {
        document
            .get(key)
            .and_then(Value::as_array)
            .map(|records| {
                records
                    .iter()
                    .filter(|record| filters::record_matches_branch(record, station, bandwidth))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    };
    let mut high_correlations = records("high_correlations");
    if let Some(threshold) = threshold {
        high_correlations.retain(|record| {
            record
                .get("correlation")
                .and_then(Value::as_f64)
                .map_or(false, |correlation| correlation.abs() >= threshold)
        });
    }
    let suggested_removals = records("suggested_removals");

    let indices_metadata = (params.include_metadata == Some(true)).then(|| {
        restrict_to(
            document,
            "indices_metadata",
            indices.iter().filter_map(Value::as_str),
        )
    });

    Ok(CorrelationResponse {
        metadata: document["metadata"].clone(),
        matrices,
        indices,
        statistics,
        high_correlations,
        suggested_removals,
        indices_metadata,
        filters: params,
        processing_time_ms: elapsed_ms(started),
    })
}

fn heatmap(
    document: &Value,
    params: FilterParams,
    started: Instant,
) -> Result<HeatmapResponse, DataServerError> {
    let rows = document
        .get("data")
        .and_then(Value::as_array)
        .ok_or_else(|| DataServerError::MalformedDataset {
            dataset: QueryKind::Heatmap.dataset().to_string(),
            reason: "missing data array".to_string(),
        })?;
    let matching = filters::rows_matching(rows, &params);
    let data: Vec<Value> = matching
        .iter()
        .skip(params.offset.unwrap_or(0))
        .take(params.limit.unwrap_or(usize::MAX))
        .map(|row| (*row).clone())
        .collect();

    let mut source = document["metadata"].as_object().cloned().unwrap_or_default();
    for field in HeatmapMetadata::FIELDS {
        source.remove(field);
    }
    Ok(HeatmapResponse {
        metadata: HeatmapMetadata {
            source,
            total_records: rows.len(),
            filtered_records: matching.len(),
            returned_records: data.len(),
            filters_applied: params,
            processing_time_ms: elapsed_ms(started),
        },
        data,
    })
}
