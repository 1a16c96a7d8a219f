//! Cursor-based pagination shared by `listWorkflowRuns` and
//! `listStepAttempts`. A cursor is a base64-encoded JSON
//! `{"createdAt": ..., "id": ...}`, ordered `(createdAt, id)` ascending for
//! `after` and descending for `before`.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, thiserror::Error)]
pub enum CursorError {
    #[error("invalid cursor encoding")]
    InvalidEncoding,
    #[error("invalid cursor payload: {0}")]
    InvalidPayload(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Cursor {
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
    pub id: Uuid,
}

impl Cursor {
    pub fn new(created_at: DateTime<Utc>, id: Uuid) -> Self {
        Self { created_at, id }
    }

    pub fn encode(&self) -> String {
        let json = serde_json::to_vec(self).expect("Cursor is always JSON-encodable");
        BASE64.encode(json)
    }

    pub fn decode(raw: &str) -> Result<Self, CursorError> {
        let bytes = BASE64.decode(raw).map_err(|_| CursorError::InvalidEncoding)?;
        serde_json::from_slice(&bytes).map_err(|e| CursorError::InvalidPayload(e.to_string()))
    }
}

#[derive(Debug, Clone, Default)]
pub struct Pagination {
    pub limit: u32,
    pub after: Option<Cursor>,
    pub before: Option<Cursor>,
}

impl Pagination {
    pub fn new(limit: u32) -> Self {
        Self {
            limit,
            after: None,
            before: None,
        }
    }

    pub fn after(mut self, cursor: Cursor) -> Self {
        self.after = Some(cursor);
        self
    }

    pub fn before(mut self, cursor: Cursor) -> Self {
        self.before = Some(cursor);
        self
    }

    pub fn is_backward(&self) -> bool {
        self.before.is_some()
    }
}

#[derive(Debug, Clone)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub has_next: bool,
    pub has_prev: bool,
}

impl<T> Page<T> {
    /// Build a page from `limit+1` rows fetched in the query's natural sort
    /// order, trimming the lookahead row and reversing when paging backward
    /// so items always come back in ascending `(createdAt, id)` order.
    pub fn from_rows(mut rows: Vec<T>, limit: u32, backward: bool, has_prior_page: bool) -> Self {
        let limit = limit as usize;
        let has_more = rows.len() > limit;
        if has_more {
            rows.truncate(limit);
        }

        if backward {
            rows.reverse();
            Page {
                items: rows,
                has_next: has_prior_page,
                has_prev: has_more,
            }
        } else {
            Page {
                items: rows,
                has_next: has_more,
                has_prev: has_prior_page,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_roundtrips_through_base64_json() {
        let cursor = Cursor::new(Utc::now(), Uuid::now_v7());
        let encoded = cursor.encode();
        let decoded = Cursor::decode(&encoded).unwrap();
        assert_eq!(cursor, decoded);
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(Cursor::decode("not valid base64!!").is_err());
    }

    #[test]
    fn forward_page_detects_has_next_from_lookahead_row() {
        let rows: Vec<i32> = (0..6).collect();
        let page = Page::from_rows(rows, 5, false, false);
        assert_eq!(page.items, vec![0, 1, 2, 3, 4]);
        assert!(page.has_next);
        assert!(!page.has_prev);
    }

    #[test]
    fn backward_page_reverses_and_flips_flags() {
        let rows: Vec<i32> = vec![5, 4, 3, 2, 1, 0];
        let page = Page::from_rows(rows, 5, true, true);
        assert_eq!(page.items, vec![1, 2, 3, 4, 5]);
        assert!(page.has_next);
        assert!(page.has_prev);
    }
}
