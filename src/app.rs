use crate::app_state::{AppState, SharedAppState};
use crate::cli::CommandLineArgs;
use crate::error::DataServerError;
use crate::metrics;
use crate::models::Page;
use crate::query::QueryResponse;
use crate::validated_path::{PagePath, ValidatedPath};

use axum::{
    extract::{rejection::QueryRejection, Path, Query, State},
    http::header,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use std::collections::HashMap;
use std::sync::Arc;
use tower::Layer;
use tower_http::normalize_path::{NormalizePath, NormalizePathLayer};
use tower_http::trace::TraceLayer;

/// Returns a [axum::Router] for the dataset API
///
/// The router is populated with all routes as well as the following middleware:
///
/// * a [tower_http::trace::TraceLayer] for tracing requests and responses, feeding the request
///   metrics
///
/// # Arguments
///
/// * `state`: Shared application state
pub fn router(state: SharedAppState) -> Router {
    Router::new()
        .route("/views/:dataset_name", get(view))
        .route("/query/:view", get(query))
        .route("/paginated/:dataset_name/:page", get(page))
        .with_state(state)
        .route("/metrics", get(metrics::metrics_handler))
        .layer(
            TraceLayer::new_for_http()
                .on_request(metrics::request_counter)
                .on_response(metrics::record_response_metrics),
        )
}

/// Dataset service type
///
/// The router wrapped by a [tower_http::normalize_path::NormalizePath] that trims trailing
/// slashes. This must be applied outside of the router to take effect before routing.
pub type Service = NormalizePath<Router>;

/// Returns a [crate::app::Service] for the dataset API
///
/// # Arguments
///
/// * `args`: Command line arguments
pub fn service(args: &CommandLineArgs) -> Service {
    service_with_state(Arc::new(AppState::new(args)))
}

/// Returns a [crate::app::Service] over existing application state.
pub fn service_with_state(state: SharedAppState) -> Service {
    NormalizePathLayer::trim_trailing_slash().layer(router(state))
}

/// Full dataset handler, `/views/<dataset>` or `/views/<dataset>.json`.
async fn view(
    State(state): State<SharedAppState>,
    Path(dataset_name): Path<String>,
) -> Result<Response, DataServerError> {
    let dataset_name = dataset_name
        .strip_suffix(".json")
        .unwrap_or(&dataset_name);
    let document = state.query_service.view(dataset_name).await?;
    Ok((
        [(
            header::CACHE_CONTROL,
            format!("public, max-age={}", state.args.views_max_age),
        )],
        Json(document),
    )
        .into_response())
}

/// Filtered view handler, `/query/<view>?<params>`.
///
/// A query string that cannot be parsed is treated as no parameters.
async fn query(
    State(state): State<SharedAppState>,
    Path(view): Path<String>,
    params: Result<Query<HashMap<String, String>>, QueryRejection>,
) -> Result<QueryResponse, DataServerError> {
    let params = match params {
        Ok(Query(params)) => params,
        Err(rejection) => {
            tracing::debug!(%rejection, "ignoring malformed query string");
            HashMap::new()
        }
    };
    state.query_service.handle(&view, &params).await
}

/// Page handler, `/paginated/<dataset>/<k>.json`.
async fn page(
    State(state): State<SharedAppState>,
    ValidatedPath(path): ValidatedPath<PagePath>,
) -> Result<Json<Page>, DataServerError> {
    let page_index = path
        .page_index()
        .ok_or_else(|| DataServerError::PageNotFound {
            dataset: path.dataset_name.clone(),
            page: usize::MAX,
        })?;
    let page = state
        .pagination_store
        .load(&path.dataset_name, page_index)
        .await?;
    Ok(Json(page))
}
