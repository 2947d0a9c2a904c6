//! In-process gateway with the same transactional semantics as the MySQL one.
//!
//! A transaction works on a private copy of the state and publishes it on commit, so an
//! aborted run leaves nothing behind. Insert failures can be injected to exercise rollback.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use kickoff_core::{Group, Membership, NewChannel, PersistedChannel, CHANNEL_LOGO_URL};
use tokio::sync::Mutex;

use crate::{decode_membership, encode_members, StorageError, StorageGateway, StorageTransaction};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryCategory {
    pub id: i64,
    pub name: String,
    pub kind: String,
    pub order: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct MemoryGroup {
    name: String,
    raw_members: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryState {
    categories: Vec<MemoryCategory>,
    channels: BTreeMap<i64, PersistedChannel>,
    server_links: BTreeSet<(i64, i64)>,
    groups: BTreeMap<i64, MemoryGroup>,
    last_category_id: i64,
    last_channel_id: i64,
    last_group_id: i64,
}

impl MemoryState {
    pub fn category(&self, name: &str) -> Option<&MemoryCategory> {
        self.categories.iter().find(|c| c.name == name)
    }

    pub fn category_count(&self) -> usize {
        self.categories.len()
    }

    /// Channels of a category in `order`.
    pub fn channels_in_category(&self, category_id: i64) -> Vec<PersistedChannel> {
        let mut channels = self
            .channels
            .values()
            .filter(|c| c.category_id == category_id)
            .cloned()
            .collect::<Vec<_>>();
        channels.sort_by_key(|c| c.order);
        channels
    }

    pub fn channel_ids(&self) -> BTreeSet<i64> {
        self.channels.keys().copied().collect()
    }

    pub fn server_links(&self) -> Vec<(i64, i64)> {
        self.server_links.iter().copied().collect()
    }

    pub fn group_raw_members(&self, group_id: i64) -> Option<&str> {
        self.groups
            .get(&group_id)
            .and_then(|g| g.raw_members.as_deref())
    }

    pub fn group_members(&self, group_id: i64) -> Option<Membership> {
        self.groups
            .get(&group_id)
            .map(|g| decode_membership(g.raw_members.as_deref()))
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
    fail_insert_at: Option<usize>,
    group_writes: Arc<Mutex<Vec<i64>>>,
    closed: Arc<AtomicBool>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the `n`-th channel insert (1-based) of every transaction fail.
    pub fn with_failing_insert(mut self, n: usize) -> Self {
        self.fail_insert_at = Some(n);
        self
    }

    pub async fn seed_category(&self, name: &str) -> i64 {
        let mut state = self.state.lock().await;
        push_category(&mut state, name, "live", 1)
    }

    pub async fn seed_channel(&self, category_id: i64, display_name: &str, server_id: i64) -> i64 {
        let mut state = self.state.lock().await;
        state.last_channel_id += 1;
        let id = state.last_channel_id;
        let order = state
            .channels
            .values()
            .filter(|c| c.category_id == category_id)
            .count() as u32
            + 1;
        state.channels.insert(
            id,
            PersistedChannel {
                id,
                category_id,
                display_name: display_name.to_string(),
                url: format!("http://seed.invalid/{id}.m3u8"),
                logo_url: CHANNEL_LOGO_URL.to_string(),
                order,
                created_at: Utc::now(),
            },
        );
        state.server_links.insert((id, server_id));
        id
    }

    pub async fn seed_group(&self, name: &str, raw_members: Option<&str>) -> i64 {
        let mut state = self.state.lock().await;
        state.last_group_id += 1;
        let id = state.last_group_id;
        state.groups.insert(
            id,
            MemoryGroup {
                name: name.to_string(),
                raw_members: raw_members.map(str::to_string),
            },
        );
        id
    }

    pub async fn snapshot(&self) -> MemoryState {
        self.state.lock().await.clone()
    }

    /// Group ids written by committed transactions, in write order.
    pub async fn group_writes(&self) -> Vec<i64> {
        self.group_writes.lock().await.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

fn push_category(state: &mut MemoryState, name: &str, kind: &str, order: i64) -> i64 {
    state.last_category_id += 1;
    let id = state.last_category_id;
    state.categories.push(MemoryCategory {
        id,
        name: name.to_string(),
        kind: kind.to_string(),
        order,
    });
    id
}

#[async_trait]
impl StorageGateway for MemoryStore {
    async fn begin(&self) -> Result<Box<dyn StorageTransaction>, StorageError> {
        let working = self.state.lock().await.clone();
        Ok(Box::new(MemoryTransaction {
            shared: Arc::clone(&self.state),
            shared_group_writes: Arc::clone(&self.group_writes),
            working,
            group_writes: Vec::new(),
            inserts: 0,
            fail_insert_at: self.fail_insert_at,
        }))
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

struct MemoryTransaction {
    shared: Arc<Mutex<MemoryState>>,
    shared_group_writes: Arc<Mutex<Vec<i64>>>,
    working: MemoryState,
    group_writes: Vec<i64>,
    inserts: usize,
    fail_insert_at: Option<usize>,
}

#[async_trait]
impl StorageTransaction for MemoryTransaction {
    async fn find_category_id_by_name(&mut self, name: &str) -> Result<Option<i64>, StorageError> {
        Ok(self.working.category(name).map(|c| c.id))
    }

    async fn create_category(&mut self, name: &str, order: i64) -> Result<i64, StorageError> {
        Ok(push_category(
            &mut self.working,
            name,
            kickoff_core::CATEGORY_TYPE_LIVE,
            order,
        ))
    }

    async fn list_channel_ids_by_category(
        &mut self,
        category_id: i64,
    ) -> Result<BTreeSet<i64>, StorageError> {
        Ok(self
            .working
            .channels
            .values()
            .filter(|c| c.category_id == category_id)
            .map(|c| c.id)
            .collect())
    }

    async fn delete_channels(&mut self, ids: &BTreeSet<i64>) -> Result<u64, StorageError> {
        self.working
            .server_links
            .retain(|(channel_id, _)| !ids.contains(channel_id));
        let before = self.working.channels.len();
        self.working.channels.retain(|id, _| !ids.contains(id));
        Ok((before - self.working.channels.len()) as u64)
    }

    async fn insert_channel(&mut self, channel: &NewChannel) -> Result<i64, StorageError> {
        self.inserts += 1;
        if self.fail_insert_at == Some(self.inserts) {
            return Err(StorageError::Injected(format!(
                "insert #{} of {:?}",
                self.inserts, channel.display_name
            )));
        }
        self.working.last_channel_id += 1;
        let id = self.working.last_channel_id;
        self.working
            .channels
            .insert(id, PersistedChannel::from_new(id, channel.clone()));
        Ok(id)
    }

    async fn link_channel_to_server(
        &mut self,
        channel_id: i64,
        server_id: i64,
    ) -> Result<(), StorageError> {
        self.working.server_links.insert((channel_id, server_id));
        Ok(())
    }

    async fn list_groups(&mut self) -> Result<Vec<Group>, StorageError> {
        Ok(self
            .working
            .groups
            .iter()
            .map(|(id, g)| Group {
                id: *id,
                name: g.name.clone(),
                members: decode_membership(g.raw_members.as_deref()),
            })
            .collect())
    }

    async fn update_group_members(
        &mut self,
        group_id: i64,
        members: &[i64],
    ) -> Result<(), StorageError> {
        if let Some(group) = self.working.groups.get_mut(&group_id) {
            group.raw_members = Some(encode_members(members));
            self.group_writes.push(group_id);
        }
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StorageError> {
        let this = *self;
        *this.shared.lock().await = this.working;
        this.shared_group_writes
            .lock()
            .await
            .extend(this.group_writes);
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StorageError> {
        Ok(())
    }
}
