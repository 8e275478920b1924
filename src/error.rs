//! Error handling.

use axum::{
    extract::rejection::PathRejection,
    http::header,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use std::error::Error;
use thiserror::Error;
use tokio::sync::AcquireError;
use tracing::{event, Level};

/// Dataset server error type
///
/// This type encapsulates the various errors that may occur.
/// Each variant may result in a different API error response. The variant name is the stable,
/// machine-readable error kind reported to clients.
#[derive(Debug, Error, strum_macros::IntoStaticStr)]
pub enum DataServerError {
    /// The remote origin could not be reached or responded with a non-success status
    #[error("dataset {dataset} is unavailable from the origin: {reason}")]
    OriginUnavailable { dataset: String, reason: String },

    /// The origin does not hold the requested dataset
    #[error("dataset {dataset} not found")]
    DatasetNotFound { dataset: String },

    /// The fetched body is not JSON or lacks the required envelope
    #[error("dataset {dataset} is malformed: {reason}")]
    MalformedDataset { dataset: String, reason: String },

    /// Page index out of range or unknown paginated dataset
    #[error("page {page} of dataset {dataset} not found")]
    PageNotFound { dataset: String, page: usize },

    /// Dataset name outside the allow-listed identifier charset
    #[error("invalid dataset name {name:?}")]
    InvalidDatasetName { name: String },

    /// Filter value that could not be parsed
    #[error("invalid value {value:?} for filter {parameter}")]
    InvalidFilterValue {
        parameter: &'static str,
        value: String,
    },

    /// The dataset does not fit in the memory pool for cached documents
    #[error("dataset {dataset} needs {requested} bytes of memory, more than the {available} bytes available")]
    InsufficientMemory {
        dataset: String,
        requested: usize,
        available: usize,
    },

    /// Error reading a paginated artifact
    #[error("failed to read paginated data")]
    PageIo(#[from] std::io::Error),

    /// Error extracting the request path
    #[error("request path is not valid")]
    RequestPathRejection(#[from] PathRejection),

    /// Error validating the request path
    #[error("request path is not valid")]
    RequestValidation(#[from] validator::ValidationErrors),

    /// Error acquiring a semaphore
    #[error("error acquiring resources")]
    SemaphoreAcquireError(#[from] AcquireError),

    /// Error converting between integer types
    #[error(transparent)]
    TryFromInt(#[from] std::num::TryFromIntError),
}

impl DataServerError {
    /// Return the stable error kind.
    pub fn kind(&self) -> &'static str {
        self.into()
    }

    /// Recreate a dataset fetch failure so that it can be handed to every request waiting on the
    /// same fetch.
    ///
    /// Returns `None` for errors that are not produced by fetching a dataset.
    pub fn replay(&self) -> Option<Self> {
        match self {
            Self::OriginUnavailable { dataset, reason } => Some(Self::OriginUnavailable {
                dataset: dataset.clone(),
                reason: reason.clone(),
            }),
            Self::DatasetNotFound { dataset } => Some(Self::DatasetNotFound {
                dataset: dataset.clone(),
            }),
            Self::MalformedDataset { dataset, reason } => Some(Self::MalformedDataset {
                dataset: dataset.clone(),
                reason: reason.clone(),
            }),
            Self::InsufficientMemory {
                dataset,
                requested,
                available,
            } => Some(Self::InsufficientMemory {
                dataset: dataset.clone(),
                requested: *requested,
                available: *available,
            }),
            _ => None,
        }
    }

    /// HTTP status for this error.
    pub fn status(&self) -> StatusCode {
        match self {
            // Bad request
            Self::InvalidDatasetName { name: _ }
            | Self::InvalidFilterValue {
                parameter: _,
                value: _,
            }
            | Self::RequestPathRejection(_)
            | Self::RequestValidation(_) => StatusCode::BAD_REQUEST,

            // Not found
            Self::DatasetNotFound { dataset: _ }
            | Self::PageNotFound {
                dataset: _,
                page: _,
            } => StatusCode::NOT_FOUND,

            // Internal server error
            Self::OriginUnavailable {
                dataset: _,
                reason: _,
            }
            | Self::MalformedDataset {
                dataset: _,
                reason: _,
            }
            | Self::InsufficientMemory {
                dataset: _,
                requested: _,
                available: _,
            }
            | Self::PageIo(_)
            | Self::SemaphoreAcquireError(_)
            | Self::TryFromInt(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for DataServerError {
    /// Convert from a `DataServerError` into an [axum::response::Response].
    fn into_response(self) -> Response {
        ErrorResponse::from(self).into_response()
    }
}

/// Body of error response
///
/// This is also the user-visible failure shape of the client data-access layer.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct ErrorBody {
    /// Stable error kind
    pub error: String,

    /// Human-readable message, including any causes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ErrorBody {
    /// Return a new ErrorBody
    ///
    /// # Arguments
    ///
    /// * `kind`: Stable error kind
    /// * `error`: The error that occurred
    pub fn new<E>(kind: &str, error: &E) -> Self
    where
        E: std::error::Error + ?Sized,
    {
        let mut details = vec![error.to_string()];
        let mut current = error.source();
        while let Some(source) = current {
            details.push(source.to_string());
            current = source.source();
        }
        // Remove duplicate entries.
        details.dedup();
        ErrorBody {
            error: kind.to_string(),
            details: Some(details.join(": caused by: ")),
        }
    }
}

/// A response to send in error cases
#[derive(Serialize)]
struct ErrorResponse {
    /// HTTP status of the response
    #[serde(skip)]
    status: StatusCode,

    /// Response body
    #[serde(flatten)]
    body: ErrorBody,
}

impl From<DataServerError> for ErrorResponse {
    /// Convert from a `DataServerError` into an `ErrorResponse`.
    fn from(error: DataServerError) -> Self {
        let status = error.status();

        // Log server errors.
        if status.is_server_error() {
            event!(Level::ERROR, "{}", error.to_string());
            let mut current = error.source();
            while let Some(source) = current {
                event!(Level::ERROR, "Caused by: {}", source.to_string());
                current = source.source();
            }
        }

        ErrorResponse {
            status,
            body: ErrorBody::new(error.kind(), &error),
        }
    }
}

impl IntoResponse for ErrorResponse {
    /// Convert from an `ErrorResponse` into an `axum::response::Response`.
    ///
    /// Renders the response as JSON.
    fn into_response(self) -> Response {
        let json_body = serde_json::to_string_pretty(&self);
        match json_body {
            Err(err) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to serialise error response: {}", err),
            )
                .into_response(),
            Ok(json_body) => (
                self.status,
                [(&header::CONTENT_TYPE, mime::APPLICATION_JSON.to_string())],
                json_body,
            )
                .into_response(),
        }
    }
}

/// Client data-access error type
#[derive(Debug, Error, strum_macros::IntoStaticStr)]
pub enum ClientError {
    /// Transport failure talking to a data source
    #[error("request to {url} failed")]
    RequestFailed {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    /// A data source responded with a non-success status
    #[error("{url} responded with status {status}")]
    ErrorStatus {
        url: String,
        status: u16,
        body: Option<ErrorBody>,
    },

    /// A data source responded with something that is not the expected JSON
    #[error("response from {url} is not valid: {reason}")]
    MalformedResponse { url: String, reason: String },

    /// No data source is configured
    #[error("no data source configured")]
    NoDataSource,
}

impl From<&ClientError> for ErrorBody {
    /// The user-visible form of a client error.
    ///
    /// Structured errors returned by the local service are passed through unchanged.
    fn from(error: &ClientError) -> Self {
        match error {
            ClientError::ErrorStatus {
                body: Some(body), ..
            } => body.clone(),
            _ => ErrorBody::new(error.into(), error),
        }
    }
}
