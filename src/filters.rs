//! Filter engine.
//!
//! Pure functions reducing a dataset payload to the part selected by a set of filter parameters.
//! Every filter returns a new value, never modifies its input, and is idempotent. Filters commute,
//! so they may be composed in any order.

pub mod branches;
pub mod matrix;

use crate::models::FilterParams;

use hashbrown::HashMap;
use serde_json::{Map, Value};

/// Keep only `index`. An absent index yields an empty mapping.
pub fn by_index(payload: &Map<String, Value>, index: &str) -> Map<String, Value> {
    payload
        .get_key_value(index)
        .map(|(key, value)| (key.clone(), value.clone()))
        .into_iter()
        .collect()
}

/// Index to category lookup shipped in a dataset's metadata as `index_categories`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CategoryLookup(HashMap<String, String>);

impl CategoryLookup {
    /// Build the lookup from a metadata object.
    ///
    /// Both `{index: category}` and `{category: [index, ...]}` are accepted.
    pub fn from_metadata(metadata: &Value) -> Self {
        let mut lookup = HashMap::new();
        let Some(categories) = metadata.get("index_categories").and_then(Value::as_object) else {
            return Self(lookup);
        };
        for (key, value) in categories {
            match value {
                Value::String(category) => {
                    lookup.insert(key.clone(), category.clone());
                }
                Value::Array(indices) => {
                    for index in indices.iter().filter_map(Value::as_str) {
                        lookup.insert(index.to_string(), key.clone());
                    }
                }
                _ => (),
            }
        }
        Self(lookup)
    }

    /// Category of `index`, if known.
    pub fn category(&self, index: &str) -> Option<&str> {
        self.0.get(index).map(String::as_str)
    }
}

/// Keep the indices belonging to `category`. Indices missing from the lookup are dropped.
pub fn by_category(
    payload: &Map<String, Value>,
    lookup: &CategoryLookup,
    category: &str,
) -> Map<String, Value> {
    payload
        .iter()
        .filter(|(index, _)| lookup.category(index) == Some(category))
        .map(|(index, value)| (index.clone(), value.clone()))
        .collect()
}

/// Keep the station/bandwidth branches of every index that match.
///
/// Indices left without any branch are dropped.
pub fn by_station_bandwidth(
    payload: &Map<String, Value>,
    station: Option<&str>,
    bandwidth: Option<&str>,
) -> Map<String, Value> {
    if station.is_none() && bandwidth.is_none() {
        return payload.clone();
    }
    payload
        .iter()
        .filter_map(|(index, value)| {
            let branches = branches::retain(value.as_object()?, station, bandwidth);
            (!branches.is_empty()).then(|| (index.clone(), Value::Object(branches)))
        })
        .collect()
}

/// Apply the distribution filters of `params` to an index-keyed payload.
///
/// Filters are applied by identity, then category, then station/bandwidth.
pub fn filter_indices(
    payload: &Map<String, Value>,
    lookup: &CategoryLookup,
    params: &FilterParams,
) -> Map<String, Value> {
    let mut filtered = match &params.index_name {
        Some(index) => by_index(payload, index),
        None => payload.clone(),
    };
    if let Some(category) = &params.category {
        filtered = by_category(&filtered, lookup, category);
    }
    by_station_bandwidth(
        &filtered,
        params.station.as_deref(),
        params.bandwidth.as_deref(),
    )
}

/// Matrices of a correlation entry that are projected along with `correlation_matrix`.
const PROJECTED_MATRICES: [&str; 2] = ["p_values", "sample_sizes"];

/// Threshold a correlation entry `{indices, correlation_matrix, p_values?, sample_sizes?}`.
///
/// Keeps the indices with at least one other index correlated at `|r| >= threshold` and projects
/// every matrix onto them. Returns `None` if no index survives, the correlation matrix is not
/// square, or `indices` does not name every row of it. Companion matrices whose shape does not
/// match are removed.
pub fn threshold_entry(entry: &Value, threshold: f64) -> Option<Value> {
    let entry = entry.as_object()?;
    let correlations = matrix::from_json(entry.get("correlation_matrix")?)?;
    if let Some(Value::Array(indices)) = entry.get("indices") {
        if indices.len() != correlations.nrows() {
            tracing::debug!(
                indices = indices.len(),
                rows = correlations.nrows(),
                "dropping correlation entry whose indices do not match its matrix"
            );
            return None;
        }
    }
    let nodes = matrix::threshold_nodes(matrix::weights(correlations.view()).view(), threshold);
    if nodes.is_empty() {
        return None;
    }

    let mut thresholded = entry.clone();
    thresholded.insert(
        "correlation_matrix".to_string(),
        matrix::to_json(&matrix::induced_submatrix(correlations.view(), &nodes)),
    );
    for key in PROJECTED_MATRICES {
        let Some(value) = entry.get(key) else {
            continue;
        };
        match matrix::from_json(value) {
            Some(companion) if companion.dim() == correlations.dim() => {
                thresholded.insert(
                    key.to_string(),
                    matrix::to_json(&matrix::induced_submatrix(companion.view(), &nodes)),
                );
            }
            _ => {
                tracing::debug!(matrix = key, "dropping matrix that does not match correlations");
                thresholded.remove(key);
            }
        }
    }
    if let Some(Value::Array(indices)) = entry.get("indices") {
        let indices = nodes
            .iter()
            .filter_map(|&node| indices.get(node).cloned())
            .collect();
        thresholded.insert("indices".to_string(), Value::Array(indices));
    }
    Some(Value::Object(thresholded))
}

/// Threshold every entry of a station/bandwidth keyed mapping, omitting entries with no
/// surviving index.
pub fn threshold_matrices(matrices: &Map<String, Value>, threshold: f64) -> Map<String, Value> {
    branches::filter_map_leaves(matrices, |entry| threshold_entry(entry, threshold))
}

/// Returns true if a record's `station` and `bandwidth` fields match.
///
/// Records without a `station` or `bandwidth` field are not restricted by that dimension.
pub fn record_matches_branch(record: &Value, station: Option<&str>, bandwidth: Option<&str>) -> bool {
    let field_matches = |field: &str, wanted: Option<&str>| match (wanted, record.get(field)) {
        (Some(wanted), Some(Value::String(actual))) => wanted == actual,
        (Some(_), Some(_)) => false,
        _ => true,
    };
    field_matches("station", station) && field_matches("bandwidth", bandwidth)
}

/// Rows whose `station`, `year` and `species` match `params`.
///
/// A year matches both numeric and string row values.
pub fn rows_matching<'a>(rows: &'a [Value], params: &FilterParams) -> Vec<&'a Value> {
    rows.iter()
        .filter(|row| {
            let station = params
                .station
                .as_deref()
                .map_or(true, |station| row.get("station").and_then(Value::as_str) == Some(station));
            let species = params
                .species
                .as_deref()
                .map_or(true, |species| row.get("species").and_then(Value::as_str) == Some(species));
            let year = params.year.map_or(true, |year| match row.get("year") {
                Some(Value::Number(number)) => number.as_i64() == Some(i64::from(year)),
                Some(Value::String(value)) => value.trim().parse::<i32>().ok() == Some(year),
                _ => false,
            });
            station && species && year
        })
        .collect()
}
