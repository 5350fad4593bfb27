//! Continuation tokens and page sizing
//!
//! A token is the URL-safe base64 encoding of the next 0-based row offset.
//! Offsets index the full result set, so a token stays valid for as long as
//! its job is retained.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use serde::Serialize;

use crate::engine::Row;
use crate::error::{Error, Result};

/// Resolved slice of a result set
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub offset: usize,
    pub limit: usize,
}

impl PageRequest {
    /// Resolve a raw token and requested size against the configured bounds.
    ///
    /// Non-positive or absent sizes fall back to `default_size`; larger ones
    /// are capped at `max_size`.
    pub fn resolve(
        page_token: Option<&str>,
        max_results: Option<i64>,
        default_size: usize,
        max_size: usize,
    ) -> Result<Self> {
        let offset = match page_token {
            Some(token) if !token.is_empty() => decode_token(token)?,
            _ => 0,
        };
        let limit = match max_results {
            Some(n) if n > 0 => usize::try_from(n).unwrap_or(max_size).min(max_size),
            _ => default_size,
        };
        Ok(Self { offset, limit })
    }

    /// Clamp this request to a result set of `total` rows, returning the
    /// number of rows to read and the offset that follows them.
    pub fn window(&self, total: usize) -> (usize, usize) {
        let start = self.offset.min(total);
        let end = start.saturating_add(self.limit).min(total);
        (end - start, end)
    }
}

/// One page of a succeeded job's rows
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResultPage {
    pub query_id: String,
    /// Request id the job was submitted under; the boundary decides how to echo it
    #[serde(skip)]
    pub request_id: String,
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
    /// Total rows in the result set
    pub row_count: usize,
    /// Empty once the page reaches the end
    pub next_page_token: String,
}

pub fn encode_token(offset: usize) -> String {
    URL_SAFE_NO_PAD.encode(offset.to_string())
}

pub fn decode_token(token: &str) -> Result<usize> {
    let invalid = || Error::validation(format!("invalid page_token: {:?}", token));
    let bytes = URL_SAFE_NO_PAD.decode(token).map_err(|_| invalid())?;
    std::str::from_utf8(&bytes)
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .ok_or_else(invalid)
}

/// Token for the page after `next_offset`, or empty at the end
pub fn next_token(next_offset: usize, total: usize) -> String {
    if next_offset < total {
        encode_token(next_offset)
    } else {
        String::new()
    }
}
