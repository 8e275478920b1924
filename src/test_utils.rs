use crate::error::DataServerError;
use crate::models::{DatasetName, CORRELATION_DATASET, DISTRIBUTIONS_DATASET, HEATMAP_DATASET};
use crate::origin::OriginFetcher;

use async_trait::async_trait;
use bytes::Bytes;
use hashbrown::HashMap;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

/// Distributions document mixing composite `station_bandwidth` keys (ACI, H) and nested
/// station -> bandwidth keys (BI).
pub(crate) fn distributions_document() -> Value {
    json!({
        "metadata": {
            "generated_at": "2024-05-01T00:00:00Z",
            "sources": ["9M", "14M", "37M"],
            "index_categories": {
                "ACI": "complexity",
                "BI": "amplitude",
                "H": "complexity"
            }
        },
        "distributions": {
            "ACI": {
                "9M_FullBW": {"bins": [0.0, 0.5, 1.0], "counts": [3, 5], "mean": 0.41},
                "9M_HighBW": {"bins": [0.0, 0.5, 1.0], "counts": [2, 1], "mean": 0.38},
                "14M_FullBW": {"bins": [0.0, 0.5, 1.0], "counts": [7, 2], "mean": 0.29}
            },
            "BI": {
                "9M": {
                    "FullBW": {"bins": [0.0, 10.0, 20.0], "counts": [1, 4], "mean": 12.5},
                    "HighBW": {"bins": [0.0, 10.0, 20.0], "counts": [6, 0], "mean": 3.1}
                },
                "14M": {
                    "FullBW": {"bins": [0.0, 10.0, 20.0], "counts": [2, 2], "mean": 9.9}
                }
            },
            "H": {
                "14M_FullBW": {"bins": [0.0, 0.5, 1.0], "counts": [0, 9], "mean": 0.88}
            }
        },
        "indices_metadata": {
            "ACI": {"name": "Acoustic Complexity Index", "category": "complexity"},
            "BI": {"name": "Bioacoustic Index", "category": "amplitude"},
            "H": {"name": "Acoustic Entropy", "category": "complexity"}
        }
    })
}

/// Correlation document. In `9M_FullBW` only the ACI/H pair (M[0][2]) reaches 0.9.
pub(crate) fn correlation_document() -> Value {
    json!({
        "metadata": {
            "generated_at": "2024-05-01T00:00:00Z",
            "stations": ["9M", "14M"]
        },
        "correlation_matrices": {
            "9M_FullBW": {
                "indices": ["ACI", "BI", "H", "NDSI"],
                "correlation_matrix": [
                    [1.0, 0.1, 0.95, 0.2],
                    [0.1, 1.0, 0.3, 0.4],
                    [0.95, 0.3, 1.0, 0.5],
                    [0.2, 0.4, 0.5, 1.0]
                ],
                "p_values": [
                    [0.0, 0.4, 0.001, 0.3],
                    [0.4, 0.0, 0.2, 0.1],
                    [0.001, 0.2, 0.0, 0.05],
                    [0.3, 0.1, 0.05, 0.0]
                ],
                "sample_sizes": [
                    [100, 100, 98, 100],
                    [100, 100, 100, 100],
                    [98, 100, 100, 97],
                    [100, 100, 97, 100]
                ]
            },
            "14M_FullBW": {
                "indices": ["ACI", "BI", "NDSI"],
                "correlation_matrix": [
                    [1.0, -0.8, 0.1],
                    [-0.8, 1.0, null],
                    [0.1, null, 1.0]
                ]
            }
        },
        "high_correlations": [
            {"station": "9M", "bandwidth": "FullBW", "index1": "ACI", "index2": "H", "correlation": 0.95},
            {"station": "14M", "bandwidth": "FullBW", "index1": "ACI", "index2": "BI", "correlation": -0.8}
        ],
        "suggested_removals": [
            {"station": "9M", "bandwidth": "FullBW", "index": "H", "reason": "redundant with ACI"},
            {"station": "14M", "bandwidth": "FullBW", "index": "BI", "reason": "redundant with ACI"}
        ],
        "indices_metadata": {
            "ACI": {"name": "Acoustic Complexity Index"},
            "BI": {"name": "Bioacoustic Index"},
            "H": {"name": "Acoustic Entropy"},
            "NDSI": {"name": "Normalized Difference Soundscape Index"}
        }
    })
}

/// Row-oriented heatmap document with five rows.
pub(crate) fn heatmap_document() -> Value {
    json!({
        "metadata": {
            "generated_at": "2024-05-01T00:00:00Z",
            "total_records": 5,
            "description": "hourly detections"
        },
        "data": [
            {"station": "9M", "year": 2021, "species": "Silver perch", "hour": 1, "detections": 4},
            {"station": "9M", "year": 2021, "species": "Oyster toadfish", "hour": 2, "detections": 1},
            {"station": "9M", "year": 2022, "species": "Silver perch", "hour": 1, "detections": 7},
            {"station": "14M", "year": "2021", "species": "Silver perch", "hour": 5, "detections": 2},
            {"station": "37M", "year": 2021, "species": "Bottlenose dolphin", "hour": 9, "detections": 3}
        ]
    })
}

/// An [OriginFetcher] serving in-memory bodies and counting fetches.
#[derive(Default)]
pub(crate) struct MockFetcher {
    bodies: HashMap<String, Bytes>,
    delays: HashMap<String, Duration>,
    delay: Duration,
    failing: AtomicBool,
    fetches: AtomicUsize,
}

impl MockFetcher {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Fetcher serving the three standard fixture documents.
    pub(crate) fn with_fixtures() -> Self {
        Self::new()
            .with_document(DISTRIBUTIONS_DATASET, &distributions_document())
            .with_document(CORRELATION_DATASET, &correlation_document())
            .with_document(HEATMAP_DATASET, &heatmap_document())
    }

    pub(crate) fn with_document(self, name: &str, document: &Value) -> Self {
        self.with_body(name, serde_json::to_vec(document).unwrap())
    }

    pub(crate) fn with_body(mut self, name: &str, body: impl Into<Bytes>) -> Self {
        self.bodies.insert(name.to_string(), body.into());
        self
    }

    /// Delay applied to every fetch.
    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Delay applied to fetches of one dataset.
    pub(crate) fn with_delay_for(mut self, name: &str, delay: Duration) -> Self {
        self.delays.insert(name.to_string(), delay);
        self
    }

    pub(crate) fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Number of fetches started so far.
    pub(crate) fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl OriginFetcher for MockFetcher {
    async fn fetch(&self, dataset: &DatasetName) -> Result<Bytes, DataServerError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let delay = self
            .delays
            .get(dataset.as_str())
            .copied()
            .unwrap_or(self.delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(DataServerError::OriginUnavailable {
                dataset: dataset.to_string(),
                reason: "HTTP request failed with status: 503 Service Unavailable".to_string(),
            });
        }
        self.bodies
            .get(dataset.as_str())
            .cloned()
            .ok_or_else(|| DataServerError::DatasetNotFound {
                dataset: dataset.to_string(),
            })
    }
}
