//! Data types and associated functions and methods

use crate::error::DataServerError;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;

/// Dataset holding the per-index value distributions.
pub const DISTRIBUTIONS_DATASET: &str = "acoustic_indices_distributions";
/// Dataset holding the per station/bandwidth correlation matrices.
pub const CORRELATION_DATASET: &str = "correlation_matrix";
/// Row-oriented dataset holding the detection heatmap.
pub const HEATMAP_DATASET: &str = "heatmap";

/// Maximum length of a dataset name.
pub const MAX_DATASET_NAME_LEN: usize = 128;

/// Returns whether `name` is made only of allow-listed identifier characters.
///
/// Dataset names map to storage paths and URLs, so anything outside `[A-Za-z0-9_-]` is refused.
pub fn is_valid_dataset_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_DATASET_NAME_LEN
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}

/// A validated dataset name.
#[derive(Clone, Debug, Eq, Hash, PartialEq, Serialize)]
#[serde(transparent)]
pub struct DatasetName(String);

impl DatasetName {
    /// Validate and return a dataset name.
    pub fn new(name: &str) -> Result<Self, DataServerError> {
        if is_valid_dataset_name(name) {
            Ok(Self(name.to_string()))
        } else {
            Err(DataServerError::InvalidDatasetName {
                name: name.to_string(),
            })
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DatasetName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for DatasetName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Freshness class of a dataset, used to pick its time-to-live.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DatasetClass {
    /// Large reference datasets, only replaced by batch regeneration
    Reference,
    /// Everything else
    Standard,
}

impl DatasetClass {
    /// Classify a dataset by name.
    pub fn of(name: &DatasetName) -> Self {
        let name = name.as_str();
        if name == DISTRIBUTIONS_DATASET
            || name == CORRELATION_DATASET
            || name.ends_with("_distributions")
            || name.ends_with("_correlations")
        {
            Self::Reference
        } else {
            Self::Standard
        }
    }
}

/// A filter dimension accepted by a query.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Dimension {
    Index,
    Station,
    Bandwidth,
    Category,
    Threshold,
    Year,
    Species,
    Limit,
    Offset,
    IncludeMetadata,
}

impl Dimension {
    /// Query parameter names for this dimension, preferred name first.
    pub fn params(self) -> &'static [&'static str] {
        match self {
            Self::Index => &["index", "index_name"],
            Self::Station => &["station"],
            Self::Bandwidth => &["bandwidth"],
            Self::Category => &["category"],
            Self::Threshold => &["threshold", "correlation_threshold"],
            Self::Year => &["year"],
            Self::Species => &["species"],
            Self::Limit => &["limit"],
            Self::Offset => &["offset"],
            Self::IncludeMetadata => &["include_metadata"],
        }
    }
}

/// Filter parameters of a query.
///
/// Every dimension is optional and independent; present dimensions combine with AND semantics.
/// Serialises as the echo of the filters that were honoured, using the query parameter names.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct FilterParams {
    #[serde(rename = "index", skip_serializing_if = "Option::is_none")]
    pub index_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub station: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bandwidth: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(rename = "threshold", skip_serializing_if = "Option::is_none")]
    pub correlation_threshold: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub year: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub species: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub include_metadata: Option<bool>,
}

impl FilterParams {
    /// Parse raw query parameters, honouring only `dimensions`.
    ///
    /// Parsing is permissive: empty values, `all`, malformed values and unknown parameters are
    /// treated as absent and never fail the query.
    pub fn parse(raw: &HashMap<String, String>, dimensions: &[Dimension]) -> Self {
        let mut params = Self::default();
        for dimension in dimensions {
            let Some(value) = dimension.params().iter().find_map(|name| raw.get(*name)) else {
                continue;
            };
            if let Err(err) = params.set(*dimension, value) {
                tracing::debug!(error = %err, "ignoring filter value");
            }
        }
        params
    }

    /// Set one dimension from its raw value.
    pub fn set(&mut self, dimension: Dimension, raw: &str) -> Result<(), DataServerError> {
        let value = raw.trim();
        if value.is_empty() || value.eq_ignore_ascii_case("all") {
            return Ok(());
        }
        let invalid = || DataServerError::InvalidFilterValue {
            parameter: dimension.params()[0],
            value: raw.to_string(),
        };
        match dimension {
            Dimension::Index => self.index_name = Some(value.to_string()),
            Dimension::Station => self.station = Some(value.to_string()),
            Dimension::Bandwidth => self.bandwidth = Some(value.to_string()),
            Dimension::Category => self.category = Some(value.to_string()),
            Dimension::Species => self.species = Some(value.to_string()),
            Dimension::Threshold => {
                let threshold: f64 = value.parse().map_err(|_| invalid())?;
                if !(0.0..=1.0).contains(&threshold) {
                    return Err(invalid());
                }
                self.correlation_threshold = Some(threshold);
            }
            Dimension::Year => self.year = Some(value.parse().map_err(|_| invalid())?),
            Dimension::Limit => {
                let limit: usize = value.parse().map_err(|_| invalid())?;
                if limit == 0 {
                    return Err(invalid());
                }
                self.limit = Some(limit);
            }
            Dimension::Offset => self.offset = Some(value.parse().map_err(|_| invalid())?),
            Dimension::IncludeMetadata => {
                let flag = match value.to_ascii_lowercase().as_str() {
                    "true" | "1" | "yes" => true,
                    "false" | "0" | "no" => false,
                    _ => return Err(invalid()),
                };
                self.include_metadata = Some(flag);
            }
        }
        Ok(())
    }

    /// Returns true if no dimension restricts the result.
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Page metadata shared by every page of a paginated dataset.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct PageMetadata {
    /// Number of records across all pages
    pub total_records: usize,
    /// Number of records per page, except possibly the last
    pub page_size: usize,
    /// `ceil(total_records / page_size)`
    pub total_pages: usize,
}

impl PageMetadata {
    /// Return the metadata of `total_records` records split into pages of `page_size`.
    pub fn new(total_records: usize, page_size: std::num::NonZeroUsize) -> Self {
        let page_size = page_size.get();
        Self {
            total_records,
            page_size,
            total_pages: total_records.div_ceil(page_size),
        }
    }

    /// Returns true if the page count agrees with the record count and page size.
    pub fn is_consistent(&self) -> bool {
        self.page_size > 0 && self.total_pages == self.total_records.div_ceil(self.page_size)
    }

    /// Offset of the first record of `page_index`.
    pub fn offset(&self, page_index: usize) -> usize {
        page_index * self.page_size
    }

    /// Number of records expected on `page_index`, or `None` if out of range.
    pub fn page_len(&self, page_index: usize) -> Option<usize> {
        if page_index >= self.total_pages {
            return None;
        }
        Some(
            self.page_size
                .min(self.total_records - self.offset(page_index)),
        )
    }
}

/// A fixed-size slice of a row-oriented dataset.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Page {
    pub metadata: PageMetadata,
    pub data: Vec<Value>,
}
