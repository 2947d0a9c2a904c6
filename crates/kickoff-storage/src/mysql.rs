//! MySQL gateway against the Xtream-UI panel schema.

use std::collections::BTreeSet;

use async_trait::async_trait;
use kickoff_core::{Group, NewChannel, CATEGORY_TYPE_LIVE};
use sqlx::mysql::{MySqlConnectOptions, MySqlPool, MySqlPoolOptions};
use sqlx::{MySql, Row, Transaction};
use tracing::{debug, info};

use crate::{
    decode_membership, encode_category_ref, encode_members, encode_stream_source, StorageError,
    StorageGateway, StorageTransaction,
};

/// Stream type for live channels.
const STREAM_TYPE_LIVE: i64 = 1;
const PROBESIZE_ON_DEMAND: i64 = 542_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MySqlSettings {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
    pub max_connections: u32,
}

#[derive(Debug, Clone)]
pub struct MySqlGateway {
    pool: MySqlPool,
}

impl MySqlGateway {
    pub async fn connect(settings: &MySqlSettings) -> Result<Self, StorageError> {
        let options = MySqlConnectOptions::new()
            .host(&settings.host)
            .port(settings.port)
            .username(&settings.user)
            .password(&settings.password)
            .database(&settings.database);
        let pool = MySqlPoolOptions::new()
            .max_connections(settings.max_connections.max(1))
            .connect_with(options)
            .await?;
        info!(
            host = %settings.host,
            database = %settings.database,
            "connected to MySQL"
        );
        Ok(Self { pool })
    }

    pub fn from_pool(pool: MySqlPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl StorageGateway for MySqlGateway {
    async fn begin(&self) -> Result<Box<dyn StorageTransaction>, StorageError> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(MySqlTransaction { tx }))
    }

    async fn close(&self) {
        self.pool.close().await;
        info!("connection pool closed");
    }
}

struct MySqlTransaction {
    tx: Transaction<'static, MySql>,
}

fn placeholders(count: usize) -> String {
    vec!["?"; count].join(", ")
}

/// Server links go first; `streams_servers` rows must not outlive their stream.
fn delete_statements(count: usize) -> [String; 2] {
    let ids = placeholders(count);
    [
        format!("DELETE FROM streams_servers WHERE stream_id IN ({ids})"),
        format!("DELETE FROM streams WHERE id IN ({ids})"),
    ]
}

const INSERT_STREAM: &str = "INSERT INTO streams (type, category_id, stream_display_name, stream_source, stream_icon, read_native, `order`, added, gen_timestamps, direct_source, allow_record, probesize_ondemand) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)";

/// Column values bound by `INSERT_STREAM`, in placeholder order.
#[derive(Debug, Clone, PartialEq, Eq)]
struct StreamRow {
    kind: i64,
    category_id: String,
    display_name: String,
    source: String,
    icon: String,
    read_native: bool,
    order: u32,
    added: i64,
    gen_timestamps: bool,
    direct_source: bool,
    allow_record: bool,
    probesize_ondemand: i64,
}

impl StreamRow {
    fn from_channel(channel: &NewChannel) -> Result<Self, StorageError> {
        Ok(Self {
            kind: STREAM_TYPE_LIVE,
            category_id: encode_category_ref(channel.category_id),
            display_name: channel.display_name.clone(),
            source: encode_stream_source(&channel.url)?,
            icon: channel.logo_url.clone(),
            read_native: false,
            order: channel.order,
            added: channel.created_at.timestamp(),
            gen_timestamps: false,
            direct_source: false,
            allow_record: false,
            probesize_ondemand: PROBESIZE_ON_DEMAND,
        })
    }
}

#[async_trait]
impl StorageTransaction for MySqlTransaction {
    async fn find_category_id_by_name(&mut self, name: &str) -> Result<Option<i64>, StorageError> {
        let row = sqlx::query(
            "SELECT CAST(id AS SIGNED) AS id FROM streams_categories WHERE category_name = ? ORDER BY id LIMIT 1",
        )
        .bind(name)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(match row {
            Some(row) => Some(row.try_get::<i64, _>("id")?),
            None => None,
        })
    }

    async fn create_category(&mut self, name: &str, order: i64) -> Result<i64, StorageError> {
        let result = sqlx::query(
            "INSERT INTO streams_categories (category_type, category_name, cat_order) VALUES (?, ?, ?)",
        )
        .bind(CATEGORY_TYPE_LIVE)
        .bind(name)
        .bind(order)
        .execute(&mut *self.tx)
        .await?;
        let id = i64::try_from(result.last_insert_id())
            .ok()
            .filter(|id| *id > 0)
            .ok_or(StorageError::MissingInsertId {
                table: "streams_categories",
            })?;
        debug!(category_id = id, name, "created category");
        Ok(id)
    }

    async fn list_channel_ids_by_category(
        &mut self,
        category_id: i64,
    ) -> Result<BTreeSet<i64>, StorageError> {
        let rows = sqlx::query("SELECT CAST(id AS SIGNED) AS id FROM streams WHERE category_id = ?")
            .bind(encode_category_ref(category_id))
            .fetch_all(&mut *self.tx)
            .await?;
        rows.iter()
            .map(|row| row.try_get::<i64, _>("id").map_err(StorageError::from))
            .collect()
    }

    async fn delete_channels(&mut self, ids: &BTreeSet<i64>) -> Result<u64, StorageError> {
        if ids.is_empty() {
            return Ok(0);
        }

        let [links_sql, streams_sql] = delete_statements(ids.len());
        let mut links = sqlx::query(&links_sql);
        for id in ids {
            links = links.bind(*id);
        }
        links.execute(&mut *self.tx).await?;

        let mut streams = sqlx::query(&streams_sql);
        for id in ids {
            streams = streams.bind(*id);
        }
        let result = streams.execute(&mut *self.tx).await?;
        Ok(result.rows_affected())
    }

    async fn insert_channel(&mut self, channel: &NewChannel) -> Result<i64, StorageError> {
        let row = StreamRow::from_channel(channel)?;
        let result = sqlx::query(INSERT_STREAM)
            .bind(row.kind)
            .bind(row.category_id)
            .bind(row.display_name)
            .bind(row.source)
            .bind(row.icon)
            .bind(row.read_native)
            .bind(row.order)
            .bind(row.added)
            .bind(row.gen_timestamps)
            .bind(row.direct_source)
            .bind(row.allow_record)
            .bind(row.probesize_ondemand)
            .execute(&mut *self.tx)
        .await?;
        i64::try_from(result.last_insert_id())
            .ok()
            .filter(|id| *id > 0)
            .ok_or(StorageError::MissingInsertId { table: "streams" })
    }

    async fn link_channel_to_server(
        &mut self,
        channel_id: i64,
        server_id: i64,
    ) -> Result<(), StorageError> {
        sqlx::query("INSERT INTO streams_servers (stream_id, server_id, on_demand) VALUES (?, ?, ?)")
            .bind(channel_id)
            .bind(server_id)
            .bind(true)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn list_groups(&mut self) -> Result<Vec<Group>, StorageError> {
        let rows = sqlx::query(
            "SELECT CAST(id AS SIGNED) AS id, bouquet_name, bouquet_channels FROM bouquets ORDER BY id",
        )
        .fetch_all(&mut *self.tx)
        .await?;

        rows.iter()
            .map(|row| -> Result<Group, StorageError> {
                let raw: Option<String> = row.try_get("bouquet_channels")?;
                Ok(Group {
                    id: row.try_get("id")?,
                    name: row.try_get("bouquet_name")?,
                    members: decode_membership(raw.as_deref()),
                })
            })
            .collect()
    }

    async fn update_group_members(
        &mut self,
        group_id: i64,
        members: &[i64],
    ) -> Result<(), StorageError> {
        sqlx::query("UPDATE bouquets SET bouquet_channels = ? WHERE id = ?")
            .bind(encode_members(members))
            .bind(group_id)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StorageError> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StorageError> {
        self.tx.rollback().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use chrono::{TimeZone, Utc};

    #[test]
    fn placeholder_lists_match_bind_count() {
        assert_eq!(placeholders(1), "?");
        assert_eq!(placeholders(3), "?, ?, ?");
    }

    #[test]
    fn server_links_are_deleted_before_streams() {
        let [links, streams] = delete_statements(2);
        assert_eq!(
            links,
            "DELETE FROM streams_servers WHERE stream_id IN (?, ?)"
        );
        assert_eq!(streams, "DELETE FROM streams WHERE id IN (?, ?)");
    }

    #[test]
    fn stream_row_matches_panel_column_encoding() {
        let created_at = Utc.with_ymd_and_hms(2026, 10, 18, 12, 0, 0).single().unwrap();
        let row = StreamRow::from_channel(&NewChannel {
            category_id: 42,
            display_name: "Flamengo x Palmeiras - 16:00 - FHD (ESPN)".to_string(),
            url: "http://host/live/espn.m3u8".to_string(),
            logo_url: kickoff_core::CHANNEL_LOGO_URL.to_string(),
            order: 3,
            created_at,
        })
        .expect("row");

        assert_eq!(
            row,
            StreamRow {
                kind: 1,
                category_id: "[42]".to_string(),
                display_name: "Flamengo x Palmeiras - 16:00 - FHD (ESPN)".to_string(),
                source: r#"["http://host/live/espn.m3u8"]"#.to_string(),
                icon: kickoff_core::CHANNEL_LOGO_URL.to_string(),
                read_native: false,
                order: 3,
                added: created_at.timestamp(),
                gen_timestamps: false,
                direct_source: false,
                allow_record: false,
                probesize_ondemand: 542_000,
            }
        );
        // The category lookup matches on the same encoded value the insert writes.
        assert_eq!(encode_category_ref(42), row.category_id);
        assert_eq!(INSERT_STREAM.matches('?').count(), 12);
    }
}
