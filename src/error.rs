use std::io;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum_extra::headers::ContentRange;
use axum_extra::TypedHeader;
use thiserror::Error;

use crate::range::{MalformedRange, RangeNotSatisfiable};

/// Request-level failure. Implements [`IntoResponse`], always with a
/// plain-text body.
#[derive(Debug, Error)]
pub enum ServeError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    NotFound(String),
    #[error("invalid range")]
    RangeNotSatisfiable { file_size: u64 },
    #[error("{context}: {source}")]
    Storage {
        context: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("json encode error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ServeError {
    pub fn storage(context: &'static str) -> impl FnOnce(io::Error) -> ServeError {
        move |source| ServeError::Storage { context, source }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ServeError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ServeError::NotFound(_) => StatusCode::NOT_FOUND,
            ServeError::RangeNotSatisfiable { .. } => StatusCode::RANGE_NOT_SATISFIABLE,
            ServeError::Storage { .. } | ServeError::Serialization(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl From<MalformedRange> for ServeError {
    fn from(err: MalformedRange) -> Self {
        ServeError::BadRequest(format!("bad range header: {err}"))
    }
}

impl From<RangeNotSatisfiable> for ServeError {
    fn from(err: RangeNotSatisfiable) -> Self {
        ServeError::RangeNotSatisfiable { file_size: err.file_size }
    }
}

impl IntoResponse for ServeError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = format!("{self}\n");
        match self {
            ServeError::RangeNotSatisfiable { file_size } => {
                let header = TypedHeader(ContentRange::unsatisfied_bytes(file_size));
                (status, header, body).into_response()
            }
            _ => (status, body).into_response(),
        }
    }
}
