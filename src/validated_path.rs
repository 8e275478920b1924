//! Axum extractor that deserialises and validates path parameters

use crate::error::DataServerError;

use async_trait::async_trait;
use axum::{
    extract::{FromRequestParts, Path},
    http::request::Parts,
};
use serde::{de::DeserializeOwned, Deserialize};
use validator::{Validate, ValidationError};

/// An axum extractor based on the Path extractor that also performs validation using the
/// validator crate.
#[derive(Debug, Clone, Copy, Default)]
pub struct ValidatedPath<T>(pub T);

#[async_trait]
impl<T, S> FromRequestParts<S> for ValidatedPath<T>
where
    T: DeserializeOwned + Validate + Send,
    S: Send + Sync,
{
    type Rejection = DataServerError;

    /// Extract a `ValidatedPath` from request parts.
    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let Path(value) = Path::<T>::from_request_parts(parts, state).await?;
        value.validate()?;
        Ok(ValidatedPath(value))
    }
}

/// Path parameters of a page request, `/paginated/<dataset_name>/<k>.json`.
#[derive(Debug, Deserialize, Validate)]
pub struct PagePath {
    /// Name of the paginated dataset. Its charset is checked by the pagination store.
    #[validate(length(min = 1, max = 128))]
    pub dataset_name: String,
    /// Page file name
    #[validate(custom = "validate_page_file")]
    pub page: String,
}

impl PagePath {
    /// Zero-based page index.
    pub fn page_index(&self) -> Option<usize> {
        parse_page_file(&self.page)
    }
}

/// Parse a page file name, `<digits>.json`.
fn parse_page_file(page: &str) -> Option<usize> {
    let digits = page.strip_suffix(".json")?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Validate a page file name.
fn validate_page_file(page: &str) -> Result<(), ValidationError> {
    match parse_page_file(page) {
        Some(_) => Ok(()),
        None => Err(ValidationError::new("page must be a page index followed by .json")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::Body,
        http::{Request, StatusCode},
        response::Response,
        routing::get,
        Router,
    };
    use regex::Regex;
    use tower::ServiceExt; // for `oneshot` and `ready`

    // Handler function that accepts a ValidatedPath extractor.
    async fn test_handler(ValidatedPath(path): ValidatedPath<PagePath>) -> String {
        format!("dataset: {} page: {:?}", path.dataset_name, path.page_index())
    }

    // Build a router and make a oneshot request.
    async fn request(uri: &str) -> Response {
        Router::new()
            .route("/paginated/:dataset_name/:page", get(test_handler))
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap()
    }

    // Jump through the hoops to get the body as a string.
    async fn body_string(response: Response) -> String {
        String::from_utf8(
            hyper::body::to_bytes(response.into_body())
                .await
                .unwrap()
                .to_vec(),
        )
        .unwrap()
    }

    #[test]
    fn page_file() {
        assert_eq!(Some(0), parse_page_file("0.json"));
        assert_eq!(Some(42), parse_page_file("042.json"));
        for page in ["", ".json", "1", "1.JSON", "-1.json", "+1.json", "a.json", "1.json.json"] {
            assert_eq!(None, parse_page_file(page), "{page}");
        }
        assert_eq!(None, parse_page_file("99999999999999999999999.json"));
    }

    #[tokio::test]
    async fn ok() {
        let response = request("/paginated/detections/3.json").await;

        assert_eq!(response.status(), StatusCode::OK);

        let body = body_string(response).await;
        assert_eq!(&body[..], "dataset: detections page: Some(3)");
    }

    #[tokio::test]
    async fn invalid_page() {
        let response = request("/paginated/detections/three.json").await;

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let body = body_string(response).await;
        let re = Regex::new(r"RequestValidation").unwrap();
        assert!(re.is_match(&body[..]), "body: {body}");
        let re = Regex::new(r".*page: Validation error: page must be a page index followed by .json.*").unwrap();
        assert!(re.is_match(&body[..]), "body: {body}");
    }

    #[tokio::test]
    async fn dataset_name_too_long() {
        let uri = format!("/paginated/{}/0.json", "a".repeat(129));
        let response = request(&uri).await;

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let body = body_string(response).await;
        let re = Regex::new(r".*dataset_name: Validation error: length.*").unwrap();
        assert!(re.is_match(&body[..]), "body: {body}");
    }

    #[tokio::test]
    async fn encoded_traversal_is_decoded_not_validated() {
        // The charset check belongs to the store, so the extractor passes the decoded name on.
        let response = request("/paginated/..%2F..%2Fetc/0.json").await;

        assert_eq!(response.status(), StatusCode::OK);

        let body = body_string(response).await;
        assert_eq!(&body[..], "dataset: ../../etc page: Some(0)");
    }
}
