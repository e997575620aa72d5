//! Interpretation of the `Range` request header.
//!
//! Only the single-range form `bytes=<start>-<end>` is understood, with an
//! optional (open) end. Suffix ranges, multiple ranges and any other unit are
//! rejected as malformed rather than guessed at.

use thiserror::Error;

/// Represents a single byte range with start and end positions (exclusive end).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end_exclusive: u64,
}

impl ByteRange {
    /// Create a new byte range with inclusive start and exclusive end.
    pub fn new(start: u64, end_exclusive: u64) -> Self {
        ByteRange { start, end_exclusive }
    }

    pub fn len(&self) -> u64 {
        self.end_exclusive - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Inclusive end, as written in `Content-Range`. `None` for an empty range.
    pub fn last(&self) -> Option<u64> {
        self.end_exclusive.checked_sub(1).filter(|&last| last >= self.start)
    }
}

/// Syntax error in a `Range` header value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MalformedRange {
    #[error("range must start with bytes= prefix")]
    MissingUnit,
    #[error("invalid range format: {0:?}")]
    InvalidFormat(String),
    #[error("start missing in range")]
    MissingStart,
    #[error("invalid start: {0:?}")]
    InvalidStart(String),
    #[error("invalid end: {0:?}")]
    InvalidEnd(String),
}

/// The requested interval lies outside the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("range not satisfiable for file of {file_size} bytes")]
pub struct RangeNotSatisfiable {
    pub file_size: u64,
}

/// Result of reading the header against a known file size, before clamping.
///
/// `end` is inclusive and may lie beyond the end of the file when the caller
/// asked for more than exists; see [`ResolvedRange::clamp`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedRange {
    pub start: u64,
    pub end: u64,
    /// A `Range` header was present and parsed.
    pub is_partial: bool,
    /// The caller did not state an end byte (or sent no header at all).
    pub end_unspecified: bool,
}

/// Resolves an optional `Range` header value against `file_size`.
///
/// An absent or empty header selects the whole file and counts as an
/// unspecified end, the same as `bytes=0-`.
pub fn resolve(
    range_header: Option<&str>,
    file_size: u64,
) -> Result<ResolvedRange, MalformedRange> {
    let last_byte = file_size.saturating_sub(1);

    let raw = match range_header.map(str::trim) {
        None | Some("") => {
            return Ok(ResolvedRange {
                start: 0,
                end: last_byte,
                is_partial: false,
                end_unspecified: true,
            });
        }
        Some(raw) => raw,
    };

    let spec = raw.strip_prefix("bytes=").ok_or(MalformedRange::MissingUnit)?;

    let mut parts = spec.split('-');
    let (start_str, end_str) = match (parts.next(), parts.next(), parts.next()) {
        (Some(start), Some(end), None) => (start.trim(), end.trim()),
        _ => return Err(MalformedRange::InvalidFormat(spec.to_string())),
    };

    if start_str.is_empty() {
        return Err(MalformedRange::MissingStart);
    }
    let start = parse_position(start_str)
        .ok_or_else(|| MalformedRange::InvalidStart(start_str.to_string()))?;

    if end_str.is_empty() {
        return Ok(ResolvedRange {
            start,
            end: last_byte,
            is_partial: true,
            end_unspecified: true,
        });
    }
    let end = parse_position(end_str)
        .ok_or_else(|| MalformedRange::InvalidEnd(end_str.to_string()))?;

    Ok(ResolvedRange {
        start,
        end,
        is_partial: true,
        end_unspecified: false,
    })
}

// `u64::from_str` accepts a leading `+`, header positions are digits only
fn parse_position(s: &str) -> Option<u64> {
    if !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}

impl ResolvedRange {
    /// Clamps the end to the last byte of the file and checks that something
    /// remains to be served.
    ///
    /// A whole-file request on an empty file yields an empty range; any
    /// explicit range on an empty file is unsatisfiable.
    pub fn clamp(&self, file_size: u64) -> Result<ByteRange, RangeNotSatisfiable> {
        if file_size == 0 {
            return if self.is_partial {
                Err(RangeNotSatisfiable { file_size })
            } else {
                Ok(ByteRange::new(0, 0))
            };
        }

        let end = self.end.min(file_size - 1);
        if self.start > end {
            return Err(RangeNotSatisfiable { file_size });
        }
        Ok(ByteRange::new(self.start, end + 1))
    }

    /// End byte as recorded in telemetry: `None` when the end was left open or
    /// the served interval runs to the last byte of the file.
    pub fn recorded_end(&self, served: &ByteRange, file_size: u64) -> Option<u64> {
        if self.end_unspecified || served.end_exclusive == file_size {
            None
        } else {
            served.last()
        }
    }
}
