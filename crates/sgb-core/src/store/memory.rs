use std::{
    collections::{BTreeMap, HashSet},
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use super::{Enrollment, PacketLedger, PacketTx, Store};
use crate::{
    domain::{
        DeliveryStatus, DistributedMessage, Message, MessageState, Packet, PacketState,
        Participant, PaymentState, Reward, Timestamp, User,
    },
    errors::Error,
    Result,
};

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct Tables {
    users: BTreeMap<String, User>,
    messages: BTreeMap<String, Message>,
    distributed: BTreeMap<String, DistributedMessage>,
    properties: BTreeMap<String, String>,
    packets: BTreeMap<String, Packet>,
    participants: BTreeMap<String, Vec<Participant>>,
    rewards: BTreeMap<String, Reward>,
}

impl Tables {
    /// Commit-time stamping keeps per-shard `updated_at` in commit order.
    fn insert_rows(&mut self, rows: Vec<DistributedMessage>) {
        let now = Utc::now();
        for mut row in rows {
            if self.distributed.contains_key(&row.message_id) {
                continue;
            }
            row.created_at = now;
            row.updated_at = now;
            self.distributed.insert(row.message_id.clone(), row);
        }
    }
}

/// Reference store: every table behind one async mutex, so each trait method
/// is trivially one transaction. Optionally snapshotted to a JSON file after
/// every mutating call and reloaded on open.
pub struct MemoryStore {
    tables: Mutex<Tables>,
    snapshot: Option<PathBuf>,
}

/// What a write transaction hands back, and whether it touched any table.
struct Commit<T> {
    value: T,
    changed: bool,
}

fn changed<T>(value: T) -> Result<Commit<T>> {
    Ok(Commit {
        value,
        changed: true,
    })
}

fn unchanged<T>(value: T) -> Result<Commit<T>> {
    Ok(Commit {
        value,
        changed: false,
    })
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
            snapshot: None,
        }
    }

    /// Open a store backed by `path`, loading the previous snapshot if present.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let tables = load_snapshot(&path)?.unwrap_or_default();
        Ok(Self {
            tables: Mutex::new(tables),
            snapshot: Some(path),
        })
    }

    /// Run `f` as one transaction.
    ///
    /// `f` must validate before it mutates. With a snapshot, `f` works on a
    /// copy that replaces the live tables only once the snapshot is on disk,
    /// so a failed write leaves both unchanged.
    async fn write<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Tables) -> Result<Commit<T>> + Send,
        T: Send,
    {
        let mut live = self.tables.lock().await;
        let Some(path) = &self.snapshot else {
            return f(&mut live).map(|c| c.value);
        };
        let mut next = live.clone();
        let commit = f(&mut next)?;
        if commit.changed {
            save_snapshot(path, &next)?;
            *live = next;
        }
        Ok(commit.value)
    }
}

fn load_snapshot(path: &Path) -> Result<Option<Tables>> {
    if !path.exists() {
        return Ok(None);
    }
    let txt = std::fs::read_to_string(path)?;
    if txt.trim().is_empty() {
        return Ok(None);
    }
    let tables: Tables = serde_json::from_str(&txt)?;
    Ok(Some(tables))
}

fn save_snapshot(path: &Path, tables: &Tables) -> Result<()> {
    let txt = serde_json::to_string(tables)?;
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, txt)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

#[async_trait]
impl Store for MemoryStore {
    async fn find_user(&self, user_id: &str) -> Result<Option<User>> {
        Ok(self.tables.lock().await.users.get(user_id).cloned())
    }

    async fn upsert_user(&self, user: User) -> Result<()> {
        self.write(|t| {
            t.users.insert(user.user_id.clone(), user);
            changed(())
        })
        .await
    }

    async fn ping_user_active(&self, user_id: &str, at: Timestamp) -> Result<()> {
        self.write(|t| match t.users.get_mut(user_id) {
            Some(user) => {
                user.active_at = at;
                changed(())
            }
            None => unchanged(()),
        })
        .await
    }

    async fn find_users(&self, user_ids: &[String]) -> Result<Vec<User>> {
        let t = self.tables.lock().await;
        Ok(user_ids
            .iter()
            .filter_map(|id| t.users.get(id))
            .cloned()
            .collect())
    }

    async fn mark_user_paid(
        &self,
        user_id: &str,
        at: Timestamp,
        enrollment: Enrollment,
    ) -> Result<bool> {
        self.write(|t| {
            let Some(user) = t.users.get_mut(user_id) else {
                return unchanged(false);
            };
            if user.is_paid() {
                return unchanged(false);
            }
            user.state = PaymentState::Paid;
            user.active_at = at;
            user.subscribed_at = Some(at);
            let Enrollment { join, backlog } = enrollment;
            t.messages.entry(join.message_id.clone()).or_insert(join);
            t.insert_rows(backlog);
            changed(true)
        })
        .await
    }

    async fn subscribers_count(&self) -> Result<u64> {
        let t = self.tables.lock().await;
        Ok(t.users.values().filter(|u| u.subscribed_at.is_some()).count() as u64)
    }

    async fn subscribed_users(
        &self,
        after: Timestamp,
        after_user: &str,
        active_since: Timestamp,
        limit: usize,
    ) -> Result<Vec<User>> {
        let t = self.tables.lock().await;
        let mut users = t
            .users
            .values()
            .filter(|u| {
                matches!(u.subscribed_at, Some(s) if (s, u.user_id.as_str()) > (after, after_user))
            })
            .filter(|u| u.active_at > active_since)
            .cloned()
            .collect::<Vec<_>>();
        users.sort_by(|a, b| {
            a.subscribed_at
                .cmp(&b.subscribed_at)
                .then_with(|| a.user_id.cmp(&b.user_id))
        });
        users.truncate(limit);
        Ok(users)
    }

    async fn insert_message(&self, message: Message) -> Result<bool> {
        self.write(|t| {
            if t.messages.contains_key(&message.message_id) {
                return unchanged(false);
            }
            t.messages.insert(message.message_id.clone(), message);
            changed(true)
        })
        .await
    }

    async fn find_message(&self, message_id: &str) -> Result<Option<Message>> {
        Ok(self.tables.lock().await.messages.get(message_id).cloned())
    }

    async fn pending_messages(&self, limit: usize) -> Result<Vec<Message>> {
        let t = self.tables.lock().await;
        let mut pending = t
            .messages
            .values()
            .filter(|m| m.state == MessageState::Pending)
            .cloned()
            .collect::<Vec<_>>();
        pending.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.message_id.cmp(&b.message_id))
        });
        pending.truncate(limit);
        Ok(pending)
    }

    async fn latest_messages(&self, limit: usize) -> Result<Vec<Message>> {
        let t = self.tables.lock().await;
        let mut latest = t.messages.values().cloned().collect::<Vec<_>>();
        latest.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.message_id.cmp(&a.message_id))
        });
        latest.truncate(limit);
        latest.reverse();
        Ok(latest)
    }

    async fn existing_distributed_ids(&self, ids: &[String]) -> Result<HashSet<String>> {
        let t = self.tables.lock().await;
        Ok(ids
            .iter()
            .filter(|id| t.distributed.contains_key(id.as_str()))
            .cloned()
            .collect::<HashSet<_>>())
    }

    async fn commit_fan_out(&self, message: &Message, rows: Vec<DistributedMessage>) -> Result<()> {
        self.write(|t| {
            let Some(stored) = t.messages.get_mut(&message.message_id) else {
                return Err(Error::Store(format!(
                    "message {} does not exist",
                    message.message_id
                )));
            };
            stored.last_distribute_at = message.last_distribute_at;
            stored.last_distribute_user = message.last_distribute_user.clone();
            stored.state = message.state;
            stored.updated_at = Utc::now();
            t.insert_rows(rows);
            changed(())
        })
        .await
    }

    async fn insert_distributed(&self, rows: Vec<DistributedMessage>) -> Result<()> {
        self.write(|t| {
            t.insert_rows(rows);
            changed(())
        })
        .await
    }

    async fn pending_distributed(
        &self,
        shard: &str,
        since: Option<Timestamp>,
        limit: usize,
    ) -> Result<Vec<DistributedMessage>> {
        let t = self.tables.lock().await;
        let mut rows = t
            .distributed
            .values()
            .filter(|m| m.shard == shard && m.status == DeliveryStatus::Sent)
            .filter(|m| since.map_or(true, |s| m.updated_at >= s))
            .cloned()
            .collect::<Vec<_>>();
        rows.sort_by(|a, b| {
            a.updated_at
                .cmp(&b.updated_at)
                .then_with(|| a.message_id.cmp(&b.message_id))
        });
        rows.truncate(limit);
        Ok(rows)
    }

    async fn mark_delivered(&self, message_ids: &[String], at: Timestamp) -> Result<()> {
        self.write(|t| {
            for id in message_ids {
                if let Some(row) = t.distributed.get_mut(id) {
                    row.status = DeliveryStatus::Delivered;
                    row.updated_at = at;
                }
            }
            changed(())
        })
        .await
    }

    async fn purge_distributed(&self, before: Timestamp, limit: usize) -> Result<usize> {
        self.write(|t| {
            let doomed = t
                .distributed
                .values()
                .filter(|m| m.created_at < before)
                .take(limit)
                .map(|m| m.message_id.clone())
                .collect::<Vec<_>>();
            for id in &doomed {
                t.distributed.remove(id);
            }
            if doomed.is_empty() {
                unchanged(0)
            } else {
                changed(doomed.len())
            }
        })
        .await
    }

    async fn find_distributed(&self, message_id: &str) -> Result<Option<DistributedMessage>> {
        Ok(self.tables.lock().await.distributed.get(message_id).cloned())
    }

    async fn read_property(&self, name: &str) -> Result<Option<String>> {
        Ok(self.tables.lock().await.properties.get(name).cloned())
    }

    async fn write_property(&self, name: &str, value: &str) -> Result<()> {
        self.write(|t| {
            t.properties.insert(name.to_string(), value.to_string());
            changed(())
        })
        .await
    }

    async fn insert_packet(&self, packet: Packet) -> Result<()> {
        self.write(|t| {
            if t.packets.contains_key(&packet.packet_id) {
                return Err(Error::Store(format!(
                    "packet {} already exists",
                    packet.packet_id
                )));
            }
            t.packets.insert(packet.packet_id.clone(), packet);
            changed(())
        })
        .await
    }

    async fn packet_tx(&self, packet_id: &str, f: PacketTx<'_>) -> Result<Option<PacketLedger>> {
        self.write(|t| {
            let Some(packet) = t.packets.get(packet_id).cloned() else {
                return unchanged(None);
            };
            let mut ledger = PacketLedger {
                packet,
                participants: t.participants.get(packet_id).cloned().unwrap_or_default(),
                outbox: Vec::new(),
            };

            // Nothing is written back unless the closure succeeds.
            f(&mut ledger)?;

            let mut seen = HashSet::new();
            if !ledger.participants.iter().all(|p| seen.insert(p.user_id.as_str())) {
                return Err(Error::Store(format!(
                    "duplicate participant in packet {packet_id}"
                )));
            }

            t.packets
                .insert(packet_id.to_string(), ledger.packet.clone());
            t.participants
                .insert(packet_id.to_string(), ledger.participants.clone());
            t.insert_rows(ledger.outbox.clone());
            changed(Some(ledger))
        })
        .await
    }

    async fn expired_packet_ids(
        &self,
        created_before: Timestamp,
        limit: usize,
    ) -> Result<Vec<String>> {
        let t = self.tables.lock().await;
        Ok(t.packets
            .values()
            .filter(|p| matches!(p.state, PacketState::Paid | PacketState::Expired))
            .filter(|p| p.created_at < created_before)
            .take(limit)
            .map(|p| p.packet_id.clone())
            .collect())
    }

    async fn pending_participants(&self, limit: usize) -> Result<Vec<Participant>> {
        let t = self.tables.lock().await;
        Ok(t.participants
            .values()
            .flatten()
            .filter(|p| p.paid_at.is_none())
            .take(limit)
            .cloned()
            .collect())
    }

    async fn mark_participant_paid(
        &self,
        packet_id: &str,
        user_id: &str,
        at: Timestamp,
    ) -> Result<()> {
        self.write(|t| {
            let claim = t
                .participants
                .get_mut(packet_id)
                .and_then(|ps| ps.iter_mut().find(|p| p.user_id == user_id));
            match claim {
                Some(p) => {
                    p.paid_at = Some(at);
                    changed(())
                }
                None => unchanged(()),
            }
        })
        .await
    }

    async fn insert_reward(&self, reward: Reward, announcement: Option<Message>) -> Result<bool> {
        self.write(|t| {
            if t.rewards.contains_key(&reward.reward_id) {
                return unchanged(false);
            }
            t.rewards.insert(reward.reward_id.clone(), reward);
            if let Some(m) = announcement {
                t.messages.entry(m.message_id.clone()).or_insert(m);
            }
            changed(true)
        })
        .await
    }

    async fn pending_rewards(&self, limit: usize) -> Result<Vec<Reward>> {
        let t = self.tables.lock().await;
        let mut pending = t
            .rewards
            .values()
            .filter(|r| r.paid_at.is_none())
            .cloned()
            .collect::<Vec<_>>();
        pending.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        pending.truncate(limit);
        Ok(pending)
    }

    async fn mark_reward_paid(&self, reward_id: &str, at: Timestamp) -> Result<()> {
        self.write(|t| match t.rewards.get_mut(reward_id) {
            Some(r) => {
                r.paid_at = Some(at);
                changed(())
            }
            None => unchanged(()),
        })
        .await
    }
}
