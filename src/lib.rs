//! # range-tracker
//!
//! HTTP file server for [`axum`][1] that honours single byte-range requests
//! and keeps delivery telemetry per caller-supplied `convert_id`.
//!
//! `GET /getfile/<path>?convert_id=<id>` serves `<path>` (resolved beneath a
//! configured root) in full, or the interval named by a `Range: bytes=A-B`
//! header. Every request appends a [`RangeRecord`] to the [`TransferRecord`]
//! kept for its `convert_id`, noting how many bytes were asked for, how many
//! actually reached the client, and whether the client went away first.
//!
//! `GET /getinfo?convert_id=<id>` returns that record as JSON.
//!
//! ```no_run
//! use std::net::SocketAddr;
//!
//! use range_tracker::{router, AppState, TransferTracker};
//!
//! #[tokio::main]
//! async fn main() -> std::io::Result<()> {
//!     let app = router(AppState::new("/srv/media", TransferTracker::new()));
//!
//!     let listener = tokio::net::TcpListener::bind("0.0.0.0:7777").await?;
//!     axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>()).await
//! }
//! ```
//!
//! [1]: https://docs.rs/axum

pub mod config;
pub mod error;
mod file;
pub mod handler;
pub mod human;
pub mod range;
mod stream;
pub mod tracker;

use axum::routing::get;
use axum::Router;

pub use error::ServeError;
pub use file::{seek_start, AsyncSeekStart, KnownSize, RangeBody};
pub use handler::AppState;
pub use range::{resolve, ByteRange, MalformedRange, RangeNotSatisfiable, ResolvedRange};
pub use stream::{Delivery, RangedStream};
pub use tracker::{RangeRecord, RangeSlot, TransferRecord, TransferTracker};

/// Builds the router with both endpoints.
///
/// Serve it with `into_make_service_with_connect_info::<SocketAddr>()` so the
/// client address ends up in the telemetry.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/getfile", get(handler::get_file_without_path))
        .route("/getfile/", get(handler::get_file_without_path))
        .route("/getfile/{*path}", get(handler::get_file))
        .route("/getinfo", get(handler::get_info))
        .with_state(state)
}
