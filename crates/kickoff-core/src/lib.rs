//! Core domain model shared by the kickoff sync crates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "kickoff-core";

/// Logo attached to every generated channel.
pub const CHANNEL_LOGO_URL: &str = "https://cdn-icons-png.flaticon.com/512/1165/1165218.png";

/// Display name of the optional leading aggregate channel.
pub const DAILY_FEED_NAME: &str = "EVENTS OF THE DAY";

pub const CATEGORY_TYPE_LIVE: &str = "live";
pub const CATEGORY_DISPLAY_ORDER: i64 = 1;
pub const DEFAULT_DELIVERY_SERVER_ID: i64 = 1;

/// One candidate stream source for a broadcaster type and quality tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogEntry {
    #[serde(rename = "type")]
    pub kind: String,
    pub quality: String,
    pub url: String,
}

/// A scheduled match with the broadcasters carrying it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub team_home: String,
    pub team_away: String,
    pub kickoff: String,
    pub broadcasters: Vec<String>,
}

/// Resolved channel, ready to be persisted. `display_name` is not a storage key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelEntry {
    pub display_name: String,
    pub url: String,
    pub logo_url: String,
}

/// Row to create in the destination category.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NewChannel {
    pub category_id: i64,
    pub display_name: String,
    pub url: String,
    pub logo_url: String,
    pub order: u32,
    pub created_at: DateTime<Utc>,
}

/// Channel row as stored, identified by the storage-assigned `id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PersistedChannel {
    pub id: i64,
    pub category_id: i64,
    pub display_name: String,
    pub url: String,
    pub logo_url: String,
    pub order: u32,
    pub created_at: DateTime<Utc>,
}

impl PersistedChannel {
    pub fn from_new(id: i64, channel: NewChannel) -> Self {
        Self {
            id,
            category_id: channel.category_id,
            display_name: channel.display_name,
            url: channel.url,
            logo_url: channel.logo_url,
            order: channel.order,
            created_at: channel.created_at,
        }
    }
}

/// Decoded membership column of a bouquet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Membership {
    Valid(Vec<i64>),
    /// The column is NULL or blank. Reads as empty, written back as `[]`.
    Unset,
    /// The stored value could not be decoded; `raw` keeps it for logging.
    Malformed { raw: String },
}

impl Membership {
    pub fn ids(&self) -> Option<&[i64]> {
        match self {
            Membership::Valid(ids) => Some(ids),
            Membership::Unset => Some(&[]),
            Membership::Malformed { .. } => None,
        }
    }
}

/// User-facing bouquet. Only `members` is ever rewritten by a sync run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Group {
    pub id: i64,
    pub name: String,
    pub members: Membership,
}

/// Broadcaster names as published by the schedule feed, mapped to catalog `type` keys.
pub const KNOWN_BROADCASTERS: &[(&str, &str)] = &[
    ("Disney+", "disney"),
    ("ESPN", "espn"),
    ("ESPN 4", "espn4"),
    ("CazéTV", "cazetv"),
    ("RedeTV", "redetv"),
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BroadcasterTable {
    entries: Vec<(String, String)>,
}

impl BroadcasterTable {
    pub fn new<I, K, V>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            entries: entries
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// Exact, case-sensitive lookup.
    pub fn catalog_type(&self, broadcaster: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(name, _)| name == broadcaster)
            .map(|(_, kind)| kind.as_str())
    }
}

impl Default for BroadcasterTable {
    fn default() -> Self {
        Self::new(KNOWN_BROADCASTERS.iter().copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_table_maps_known_broadcasters() {
        let table = BroadcasterTable::default();
        assert_eq!(table.catalog_type("ESPN"), Some("espn"));
        assert_eq!(table.catalog_type("ESPN 4"), Some("espn4"));
        assert_eq!(table.catalog_type("CazéTV"), Some("cazetv"));
        assert_eq!(table.catalog_type("espn"), None);
        assert_eq!(table.catalog_type("Premiere"), None);
    }

    #[test]
    fn catalog_entry_reads_type_key() {
        let entry: CatalogEntry =
            serde_json::from_str(r#"{"type":"espn","quality":"FHD","url":"http://a/1"}"#)
                .expect("parse");
        assert_eq!(entry.kind, "espn");
        assert_eq!(entry.quality, "FHD");
    }
}
