//! Transactional storage gateway for channels, categories and bouquets.
//!
//! The reconciler only sees [`StorageGateway`] and [`StorageTransaction`]. String-encoded
//! columns (bracketed id lists, JSON url arrays) are decoded here and never leave this crate.

use std::collections::BTreeSet;

use async_trait::async_trait;
use kickoff_core::{Group, Membership, NewChannel};
use serde_json::Value as JsonValue;
use thiserror::Error;

mod memory;
mod mysql;

pub use memory::{MemoryCategory, MemoryState, MemoryStore};
pub use mysql::{MySqlGateway, MySqlSettings};

pub const CRATE_NAME: &str = "kickoff-storage";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database query failed: {0}")]
    Database(#[from] sqlx::Error),
    #[error("encoding {what}: {source}")]
    Encode {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("insert into {table} returned no id")]
    MissingInsertId { table: &'static str },
    #[error("injected failure: {0}")]
    Injected(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("malformed id list {raw:?}: {reason}")]
pub struct MembershipParseError {
    pub raw: String,
    pub reason: String,
}

/// Decode a stored id list such as `[1010, 1515]`. NULL and blank values are empty lists.
/// Numeric strings (`["12"]`) are accepted since some panels write ids that way.
pub fn parse_members(raw: Option<&str>) -> Result<Vec<i64>, MembershipParseError> {
    let Some(raw) = raw else {
        return Ok(Vec::new());
    };
    if raw.trim().is_empty() {
        return Ok(Vec::new());
    }

    let malformed = |reason: String| MembershipParseError {
        raw: raw.to_string(),
        reason,
    };

    let values: Vec<JsonValue> =
        serde_json::from_str(raw).map_err(|err| malformed(err.to_string()))?;

    values
        .iter()
        .map(|value| match value {
            JsonValue::Number(n) => n
                .as_i64()
                .ok_or_else(|| malformed(format!("{n} is not an integer id"))),
            JsonValue::String(s) => s
                .trim()
                .parse::<i64>()
                .map_err(|_| malformed(format!("{s:?} is not an integer id"))),
            other => Err(malformed(format!("unexpected element {other}"))),
        })
        .collect()
}

pub fn decode_membership(raw: Option<&str>) -> Membership {
    if raw.map_or(true, |raw| raw.trim().is_empty()) {
        return Membership::Unset;
    }
    match parse_members(raw) {
        Ok(ids) => Membership::Valid(ids),
        Err(err) => Membership::Malformed { raw: err.raw },
    }
}

pub fn encode_members(ids: &[i64]) -> String {
    let body = ids
        .iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(",");
    format!("[{body}]")
}

/// Channels reference their category as a single-element id list.
pub fn encode_category_ref(category_id: i64) -> String {
    encode_members(&[category_id])
}

pub fn encode_stream_source(url: &str) -> Result<String, StorageError> {
    serde_json::to_string(&[url]).map_err(|source| StorageError::Encode {
        what: "stream source",
        source,
    })
}

#[async_trait]
pub trait StorageGateway: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn StorageTransaction>, StorageError>;

    /// Release pooled connections. Called once per run on every exit path.
    async fn close(&self);
}

/// Open unit of work. Dropping it without `commit` discards every change.
#[async_trait]
pub trait StorageTransaction: Send {
    async fn find_category_id_by_name(&mut self, name: &str) -> Result<Option<i64>, StorageError>;

    async fn create_category(&mut self, name: &str, order: i64) -> Result<i64, StorageError>;

    async fn list_channel_ids_by_category(
        &mut self,
        category_id: i64,
    ) -> Result<BTreeSet<i64>, StorageError>;

    /// Deletes the channels and their server links. Returns the number of channels removed.
    async fn delete_channels(&mut self, ids: &BTreeSet<i64>) -> Result<u64, StorageError>;

    async fn insert_channel(&mut self, channel: &NewChannel) -> Result<i64, StorageError>;

    async fn link_channel_to_server(
        &mut self,
        channel_id: i64,
        server_id: i64,
    ) -> Result<(), StorageError>;

    async fn list_groups(&mut self) -> Result<Vec<Group>, StorageError>;

    async fn update_group_members(
        &mut self,
        group_id: i64,
        members: &[i64],
    ) -> Result<(), StorageError>;

    async fn commit(self: Box<Self>) -> Result<(), StorageError>;

    async fn rollback(self: Box<Self>) -> Result<(), StorageError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bracketed_id_lists() {
        assert_eq!(parse_members(Some("[1010, 1515]")).unwrap(), vec![1010, 1515]);
        assert_eq!(parse_members(Some("[\"7\", 8]")).unwrap(), vec![7, 8]);
        assert_eq!(parse_members(Some("[]")).unwrap(), Vec::<i64>::new());
    }

    #[test]
    fn null_and_blank_columns_are_empty() {
        assert_eq!(parse_members(None).unwrap(), Vec::<i64>::new());
        assert_eq!(parse_members(Some("  ")).unwrap(), Vec::<i64>::new());
    }

    #[test]
    fn malformed_columns_are_errors() {
        let err = parse_members(Some("[1, 2")).unwrap_err();
        assert_eq!(err.raw, "[1, 2");
        assert!(parse_members(Some("{\"a\":1}")).is_err());
        assert!(parse_members(Some("[1.5]")).is_err());
        assert!(parse_members(Some("[\"abc\"]")).is_err());
        assert!(parse_members(Some("[null]")).is_err());
    }

    #[test]
    fn decode_keeps_raw_text_of_malformed_membership() {
        assert_eq!(
            decode_membership(Some("oops")),
            Membership::Malformed {
                raw: "oops".to_string()
            }
        );
        assert_eq!(decode_membership(Some("[3]")), Membership::Valid(vec![3]));
    }

    #[test]
    fn null_and_blank_columns_decode_as_unset() {
        assert_eq!(decode_membership(None), Membership::Unset);
        assert_eq!(decode_membership(Some(" ")), Membership::Unset);
        assert_eq!(decode_membership(Some("[]")), Membership::Valid(Vec::new()));
    }

    #[test]
    fn encodes_ids_and_sources_like_the_panel_schema() {
        assert_eq!(encode_members(&[5, 21, 22]), "[5,21,22]");
        assert_eq!(encode_members(&[]), "[]");
        assert_eq!(encode_category_ref(42), "[42]");
        assert_eq!(
            encode_stream_source("http://host/live/1.m3u8").unwrap(),
            r#"["http://host/live/1.m3u8"]"#
        );
    }
}
