use std::path::PathBuf;

use axum::extract::rejection::QueryRejection;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Artifact not found: {0}")]
    NotFound(PathBuf),

    #[error("Malformed artifact {path}: {reason}")]
    Malformed { path: PathBuf, reason: String },

    #[error("Shape mismatch in {path}: expected {expected:?}, found {found:?}")]
    ShapeMismatch {
        path: PathBuf,
        expected: (usize, usize),
        found: (usize, usize),
    },

    #[error("I/O error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl StoreError {
    pub fn malformed(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::Malformed {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Unavailable(String),

    #[error("{0}")]
    InvalidData(String),

    #[error("Requested area is too large: ~{estimated} cells exceeds the cap of {cap}")]
    TooLarge { estimated: usize, cap: usize },

    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::InvalidData(_) => StatusCode::BAD_GATEWAY,
            ApiError::TooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ApiError::BadRequest(_) => "bad_request",
            ApiError::Unavailable(_) => "data_unavailable",
            ApiError::InvalidData(_) => "invalid_data",
            ApiError::TooLarge { .. } => "too_large",
            ApiError::Internal(_) => "internal",
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::NotFound(path) => ApiError::Unavailable(format!(
                "Upstream data not available yet ({}).",
                path.display()
            )),
            other @ (StoreError::Malformed { .. } | StoreError::ShapeMismatch { .. }) => {
                warn!("Upstream artifact rejected: {other}");
                ApiError::InvalidData(other.to_string())
            }
            other @ StoreError::Io { .. } => {
                warn!("Upstream artifact unreadable: {other}");
                ApiError::Unavailable(other.to_string())
            }
        }
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut body = serde_json::json!({
            "error": self.to_string(),
            "code": self.code(),
        });
        if let ApiError::TooLarge { estimated, cap } = &self {
            body["estimated_cells"] = serde_json::json!(estimated);
            body["cap"] = serde_json::json!(cap);
        }
        let mut response = (self.status(), Json(body)).into_response();
        response
            .headers_mut()
            .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_artifact_is_a_service_unavailable_condition() {
        let error: ApiError = StoreError::NotFound(PathBuf::from("latest.json")).into();
        assert_eq!(error.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn malformed_artifact_is_distinct_from_missing() {
        let error: ApiError = StoreError::malformed("latest.json", "missing data.value").into();
        assert_eq!(error.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(error.code(), "invalid_data");
    }

    #[test]
    fn query_rejection_becomes_json_bad_request() {
        #[derive(Debug, serde::Deserialize)]
        struct HourOnly {
            #[allow(dead_code)]
            hour: Option<u32>,
        }
        let uri: axum::http::Uri = "/v1/grid/no2?hour=-1".parse().unwrap();
        let rejection = axum::extract::Query::<HourOnly>::try_from_uri(&uri).unwrap_err();
        let error = ApiError::from(rejection);
        assert_eq!(error.code(), "bad_request");
        let response = error.into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            response.headers().get(header::CACHE_CONTROL).unwrap(),
            "no-store"
        );
    }

    #[test]
    fn too_large_reports_estimate() {
        let response = ApiError::TooLarge {
            estimated: 90_000,
            cap: 15_000,
        }
        .into_response();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }
}
