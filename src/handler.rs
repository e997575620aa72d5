//! The two HTTP endpoints: `/getfile/<path>` streams a file (or a single byte
//! range of it) and records the delivery, `/getinfo` reports what was
//! recorded for a `convert_id`.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use axum::extract::{self, ConnectInfo, FromRequestParts, State};
use axum::http::request::Parts;
use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum_extra::extract::Query;
use axum_extra::headers::{AcceptRanges, ContentLength, ContentRange, ContentType};
use axum_extra::TypedHeader;
use serde::Deserialize;
use tokio::fs::File;
use tracing::field::Empty;
use tracing::{info, info_span, warn, Instrument, Span};

use crate::error::ServeError;
use crate::file::{seek_start, KnownSize};
use crate::range::{self, MalformedRange};
use crate::stream::{Delivery, RangedStream};
use crate::tracker::{now_ns, TransferTracker};

/// Shared state of the HTTP handlers.
#[derive(Debug, Clone)]
pub struct AppState {
    pub tracker: TransferTracker,
    root: Arc<PathBuf>,
}

impl AppState {
    /// Serve files beneath `root`, recording deliveries into `tracker`.
    pub fn new(root: impl Into<PathBuf>, tracker: TransferTracker) -> Self {
        AppState { tracker, root: Arc::new(root.into()) }
    }
}

/// `convert_id` query parameter. Repeated keys are accepted and the first
/// value wins.
#[derive(Debug, Deserialize)]
pub struct ConvertQuery {
    #[serde(default)]
    convert_id: Vec<String>,
}

impl ConvertQuery {
    fn convert_id(self) -> Option<String> {
        self.convert_id.into_iter().next().filter(|id| !id.is_empty())
    }
}

/// Peer address of the connection, `unknown` when the server was not set up
/// with connect info.
#[derive(Debug, Clone)]
pub struct RemoteAddr(pub String);

impl<S: Send + Sync> FromRequestParts<S> for RemoteAddr {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let addr = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        Ok(RemoteAddr(addr))
    }
}

/// `GET /getfile/<path>?convert_id=<id>`
pub async fn get_file(
    State(state): State<AppState>,
    RemoteAddr(raddr): RemoteAddr,
    extract::Path(path): extract::Path<String>,
    Query(query): Query<ConvertQuery>,
    method: Method,
    headers: HeaderMap,
) -> Response {
    let span = info_span!("getfile", raddr = %raddr, cid = Empty, s = Empty, e = Empty);
    let request = FileRequest { raddr, path: &path, query, method, headers: &headers };
    serve_file(state, request)
        .instrument(span.clone())
        .await
        .unwrap_or_else(|err| {
            span.in_scope(|| warn!(path = %path, status = err.status().as_u16(), "{err}"));
            err.into_response()
        })
}

/// `GET /getfile/` with nothing after the prefix.
pub async fn get_file_without_path(RemoteAddr(raddr): RemoteAddr) -> Response {
    let err = ServeError::BadRequest("missing filepath".to_string());
    info_span!("getfile", raddr = %raddr).in_scope(|| warn!("{err}"));
    err.into_response()
}

struct FileRequest<'a> {
    raddr: String,
    path: &'a str,
    query: ConvertQuery,
    method: Method,
    headers: &'a HeaderMap,
}

async fn serve_file(state: AppState, request: FileRequest<'_>) -> Result<Response, ServeError> {
    info!("[START] accept request");

    let path = resolve_path(&state.root, request.path)?;
    let convert_id = request
        .query
        .convert_id()
        .ok_or_else(|| ServeError::BadRequest("missing convert_id".to_string()))?;
    Span::current().record("cid", convert_id.as_str());

    let file = File::open(&path)
        .await
        .map_err(|e| ServeError::NotFound(format!("cannot open file: {e}")))?;
    let metadata = file.metadata().await.map_err(ServeError::storage("stat error"))?;
    if metadata.is_dir() {
        return Err(ServeError::BadRequest("path is directory".to_string()));
    }
    let file_size = metadata.len();

    let resolved = range::resolve(range_header(request.headers)?, file_size)?;
    let served = resolved.clamp(file_size)?;
    Span::current().record("s", served.start);
    if let Some(last) = served.last() {
        Span::current().record("e", last);
    }

    let mut body = KnownSize::sized(file, file_size);
    seek_start(&mut body, served.start)
        .await
        .map_err(ServeError::storage("seek error"))?;

    let content_range = if resolved.is_partial {
        let header = ContentRange::bytes(served.start..served.end_exclusive, file_size)
            .map_err(|_| ServeError::RangeNotSatisfiable { file_size })?;
        Some(TypedHeader(header))
    } else {
        None
    };

    let slot = state.tracker.begin(
        &convert_id,
        file_size,
        &served,
        resolved.recorded_end(&served, file_size),
        &request.raddr,
        now_ns(),
    );
    let mut delivery =
        Delivery::new(state.tracker.clone(), convert_id, slot, served.len(), Span::current());
    if request.method == Method::HEAD {
        // the transport discards the body without polling it
        delivery = delivery.without_body();
    }
    let stream = RangedStream::new(body, served.len(), delivery);

    let status = if resolved.is_partial {
        StatusCode::PARTIAL_CONTENT
    } else {
        StatusCode::OK
    };
    let content_type = ContentType::from(mime_guess::from_path(&path).first_or_octet_stream());

    Ok((
        status,
        TypedHeader(AcceptRanges::bytes()),
        TypedHeader(ContentLength(served.len())),
        content_range,
        TypedHeader(content_type),
        stream,
    )
        .into_response())
}

/// Value of the `Range` header, if any. Non-ASCII values are malformed.
fn range_header(headers: &HeaderMap) -> Result<Option<&str>, MalformedRange> {
    let Some(value) = headers.get(header::RANGE) else {
        return Ok(None);
    };
    value
        .to_str()
        .map(Some)
        .map_err(|_| {
            let raw = String::from_utf8_lossy(value.as_bytes()).into_owned();
            MalformedRange::InvalidFormat(raw)
        })
}

/// Resolves the request path beneath `root`, refusing anything that would
/// climb out of it.
fn resolve_path(root: &Path, requested: &str) -> Result<PathBuf, ServeError> {
    let requested = requested.trim_start_matches('/');
    if requested.is_empty() {
        return Err(ServeError::BadRequest("missing filepath".to_string()));
    }

    let mut path = root.to_path_buf();
    for component in Path::new(requested).components() {
        match component {
            Component::Normal(part) => path.push(part),
            Component::CurDir | Component::RootDir => {}
            Component::ParentDir | Component::Prefix(_) => {
                return Err(ServeError::BadRequest("invalid filepath".to_string()));
            }
        }
    }
    Ok(path)
}

/// `GET /getinfo?convert_id=<id>`
pub async fn get_info(
    State(state): State<AppState>,
    Query(query): Query<ConvertQuery>,
) -> Response {
    report(&state.tracker, query).unwrap_or_else(|err| {
        warn!(status = err.status().as_u16(), "{err}");
        err.into_response()
    })
}

fn report(tracker: &TransferTracker, query: ConvertQuery) -> Result<Response, ServeError> {
    let convert_id = query
        .convert_id()
        .ok_or_else(|| ServeError::NotFound("missing convert_id".to_string()))?;

    let Some(record) = tracker.snapshot(&convert_id) else {
        return Err(ServeError::NotFound(format!("convert_id not found: {convert_id}")));
    };

    let mut body = serde_json::to_vec_pretty(&record)?;
    body.push(b'\n');
    let content_type = [(header::CONTENT_TYPE, HeaderValue::from_static("application/json"))];
    Ok((content_type, body).into_response())
}

#[cfg(test)]
mod tests {
    use std::path::{Path, PathBuf};

    use assert_matches::assert_matches;
    use axum::http::{header, HeaderMap, HeaderValue, StatusCode};

    use crate::error::ServeError;
    use crate::range::{ByteRange, MalformedRange};
    use crate::tracker::TransferTracker;

    use super::{range_header, report, resolve_path, ConvertQuery};

    #[test]
    fn test_resolve_path() {
        let root = Path::new("/srv");
        assert_eq!(PathBuf::from("/srv/a/b.bin"), resolve_path(root, "a/b.bin").unwrap());
        assert_eq!(PathBuf::from("/srv/a/b.bin"), resolve_path(root, "/a/./b.bin").unwrap());
        assert_eq!(PathBuf::from("/srv/a/b.bin"), resolve_path(root, "a//b.bin").unwrap());
        assert_eq!(PathBuf::from("/srv/a..b"), resolve_path(root, "a..b").unwrap());

        for empty in ["", "/"] {
            assert_matches!(
                resolve_path(root, empty),
                Err(ServeError::BadRequest(msg)) if msg == "missing filepath"
            );
        }
        assert_matches!(
            resolve_path(root, "../etc/passwd"),
            Err(ServeError::BadRequest(msg)) if msg == "invalid filepath"
        );
        assert_matches!(resolve_path(root, "a/../../b"), Err(ServeError::BadRequest(_)));
    }

    fn query(ids: &[&str]) -> ConvertQuery {
        ConvertQuery { convert_id: ids.iter().map(|id| id.to_string()).collect() }
    }

    #[test]
    fn test_convert_id_first_value_wins() {
        assert_eq!(None, query(&[]).convert_id());
        assert_eq!(None, query(&[""]).convert_id());
        assert_eq!(Some("a".to_string()), query(&["a", "b"]).convert_id());
        assert_eq!(None, query(&["", "b"]).convert_id());
    }

    #[test]
    fn test_report() {
        let tracker = TransferTracker::new();
        let missing = report(&tracker, query(&[])).unwrap_err();
        assert_eq!(StatusCode::NOT_FOUND, missing.status());

        let empty = report(&tracker, query(&[""])).unwrap_err();
        assert_eq!(StatusCode::NOT_FOUND, empty.status());

        let unknown = report(&tracker, query(&["nope"])).unwrap_err();
        assert_matches!(unknown, ServeError::NotFound(_));

        tracker.begin("x", 10, &ByteRange::new(0, 10), None, "peer", 1);
        let response = report(&tracker, query(&["x"])).unwrap();
        assert_eq!(StatusCode::OK, response.status());
        assert_eq!("application/json", response.headers()["content-type"]);

        let repeated = report(&tracker, query(&["x", "nope"])).unwrap();
        assert_eq!(StatusCode::OK, repeated.status());
        assert_matches!(report(&tracker, query(&["nope", "x"])), Err(ServeError::NotFound(_)));
    }

    #[test]
    fn test_range_header() {
        let mut headers = HeaderMap::new();
        assert_eq!(None, range_header(&headers).unwrap());

        headers.insert(header::RANGE, HeaderValue::from_static("bytes=0-4"));
        assert_eq!(Some("bytes=0-4"), range_header(&headers).unwrap());

        let raw = HeaderValue::from_bytes(b"bytes=\xff-1").unwrap();
        headers.insert(header::RANGE, raw);
        assert_matches!(range_header(&headers), Err(MalformedRange::InvalidFormat(_)));
    }
}
