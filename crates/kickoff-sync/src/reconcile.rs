//! Whole-category replacement of generated channels, plus bouquet membership patching.
//!
//! Every run deletes the previous generation, inserts the new one in resolution order and
//! rewrites bouquets so they drop the deleted ids and gain the new ones. All of it happens in one
//! storage transaction.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use kickoff_core::{ChannelEntry, Group, Membership, NewChannel, CATEGORY_DISPLAY_ORDER};
use kickoff_storage::{StorageError, StorageGateway, StorageTransaction};
use serde::Serialize;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileSettings {
    pub category_name: String,
    pub server_id: i64,
}

/// Channel-level part of a run: what goes away and what replaces it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WritePlan {
    pub delete_channel_ids: BTreeSet<i64>,
    pub insert_channels: Vec<NewChannel>,
}

impl WritePlan {
    pub fn build(
        new_channels: &[ChannelEntry],
        prior_channel_ids: BTreeSet<i64>,
        category_id: i64,
        created_at: DateTime<Utc>,
    ) -> Self {
        let insert_channels = new_channels
            .iter()
            .enumerate()
            .map(|(index, channel)| NewChannel {
                category_id,
                display_name: channel.display_name.clone(),
                url: channel.url.clone(),
                logo_url: channel.logo_url.clone(),
                order: index as u32 + 1,
                created_at,
            })
            .collect();
        Self {
            delete_channel_ids: prior_channel_ids,
            insert_channels,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupUpdate {
    pub group_id: i64,
    pub members: Vec<i64>,
    /// False when `members` equals what is stored; such groups are not written.
    pub changed: bool,
    /// The stored membership could not be decoded and was rebuilt from scratch.
    pub repaired: bool,
}

/// `(current - removed) ++ added`, keeping the first occurrence of every id.
pub fn patch_members(current: &[i64], removed: &BTreeSet<i64>, added: &[i64]) -> Vec<i64> {
    let mut seen = BTreeSet::new();
    current
        .iter()
        .filter(|id| !removed.contains(*id))
        .chain(added)
        .copied()
        .filter(|id| seen.insert(*id))
        .collect()
}

pub fn plan_group_updates(
    groups: &[Group],
    removed: &BTreeSet<i64>,
    added: &[i64],
) -> Vec<GroupUpdate> {
    groups
        .iter()
        .map(|group| match &group.members {
            Membership::Valid(current) => {
                let members = patch_members(current, removed, added);
                GroupUpdate {
                    group_id: group.id,
                    changed: &members != current,
                    members,
                    repaired: false,
                }
            }
            Membership::Unset => GroupUpdate {
                group_id: group.id,
                members: patch_members(&[], removed, added),
                changed: true,
                repaired: false,
            },
            Membership::Malformed { raw } => {
                warn!(
                    group_id = group.id,
                    group = %group.name,
                    raw = %raw,
                    "bouquet membership is malformed; rebuilding it from this run's channels"
                );
                GroupUpdate {
                    group_id: group.id,
                    members: patch_members(&[], removed, added),
                    changed: true,
                    repaired: true,
                }
            }
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub category_id: i64,
    pub created_category: bool,
    pub deleted_channels: u64,
    pub inserted_channel_ids: Vec<i64>,
    pub groups_rewritten: usize,
    pub groups_unchanged: usize,
    pub groups_repaired: usize,
}

#[derive(Debug, Clone)]
pub struct Reconciler {
    settings: ReconcileSettings,
}

impl Reconciler {
    pub fn new(settings: ReconcileSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &ReconcileSettings {
        &self.settings
    }

    /// Run the replacement in a single transaction: committed on success, rolled back on any
    /// error. `now` stamps the inserted rows.
    pub async fn run(
        &self,
        gateway: &dyn StorageGateway,
        channels: &[ChannelEntry],
        now: DateTime<Utc>,
    ) -> Result<ReconcileReport, StorageError> {
        let mut tx = gateway.begin().await?;
        let outcome = self.apply(tx.as_mut(), channels, now).await;
        match outcome {
            Ok(report) => {
                tx.commit().await?;
                info!(
                    category_id = report.category_id,
                    deleted = report.deleted_channels,
                    inserted = report.inserted_channel_ids.len(),
                    groups_rewritten = report.groups_rewritten,
                    "reconciliation committed"
                );
                Ok(report)
            }
            Err(err) => {
                error!(error = %err, "reconciliation failed; rolling back");
                if let Err(rollback_err) = tx.rollback().await {
                    warn!(error = %rollback_err, "rollback failed");
                }
                Err(err)
            }
        }
    }

    async fn apply(
        &self,
        tx: &mut dyn StorageTransaction,
        channels: &[ChannelEntry],
        now: DateTime<Utc>,
    ) -> Result<ReconcileReport, StorageError> {
        let name = self.settings.category_name.as_str();
        let existing = tx.find_category_id_by_name(name).await?;

        let prior = match existing {
            Some(category_id) => tx.list_channel_ids_by_category(category_id).await?,
            None => BTreeSet::new(),
        };
        let deleted_channels = tx.delete_channels(&prior).await?;
        debug!(deleted = deleted_channels, "previous generation removed");

        let (category_id, created_category) = match existing {
            Some(category_id) => (category_id, false),
            None => {
                let category_id = tx.create_category(name, CATEGORY_DISPLAY_ORDER).await?;
                info!(category_id, category = name, "created destination category");
                (category_id, true)
            }
        };

        let plan = WritePlan::build(channels, prior, category_id, now);

        let mut inserted_channel_ids = Vec::with_capacity(plan.insert_channels.len());
        for channel in &plan.insert_channels {
            let channel_id = tx.insert_channel(channel).await?;
            tx.link_channel_to_server(channel_id, self.settings.server_id)
                .await?;
            debug!(channel_id, order = channel.order, name = %channel.display_name, "inserted channel");
            inserted_channel_ids.push(channel_id);
        }

        let groups = tx.list_groups().await?;
        let updates = plan_group_updates(&groups, &plan.delete_channel_ids, &inserted_channel_ids);

        let mut groups_rewritten = 0;
        let mut groups_repaired = 0;
        for update in updates.iter().filter(|u| u.changed) {
            tx.update_group_members(update.group_id, &update.members)
                .await?;
            groups_rewritten += 1;
            if update.repaired {
                groups_repaired += 1;
            }
        }

        Ok(ReconcileReport {
            category_id,
            created_category,
            deleted_channels,
            inserted_channel_ids,
            groups_rewritten,
            groups_unchanged: updates.len() - groups_rewritten,
            groups_repaired,
        })
    }
}
