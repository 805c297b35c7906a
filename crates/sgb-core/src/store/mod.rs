//! Transactional store port.
//!
//! Each method is one atomic transaction. Implementations stamp `created_at`
//! and `updated_at` of inserted `DistributedMessage` rows at commit time, so
//! per-shard update order follows commit order.

mod memory;

use std::collections::HashSet;

use async_trait::async_trait;

use crate::{
    domain::{DistributedMessage, Message, Packet, Participant, Reward, Timestamp, User},
    Result,
};

pub use memory::MemoryStore;

/// One packet plus its claims, loaded for a single transaction.
///
/// Rows pushed to `outbox` are inserted into the fan-out queue in the same
/// transaction as the packet update.
#[derive(Clone, Debug, PartialEq)]
pub struct PacketLedger {
    pub packet: Packet,
    pub participants: Vec<Participant>,
    pub outbox: Vec<DistributedMessage>,
}

impl PacketLedger {
    pub fn has_participant(&self, user_id: &str) -> bool {
        self.participants.iter().any(|p| p.user_id == user_id)
    }
}

/// Rows written together with a member's first subscription payment.
#[derive(Clone, Debug, PartialEq)]
pub struct Enrollment {
    /// Announcement fanned out to the other members.
    pub join: Message,
    /// Recent messages delivered straight to the new member.
    pub backlog: Vec<DistributedMessage>,
}

/// Closure run inside a packet transaction. Returning `Err` rolls back.
pub type PacketTx<'a> = &'a mut (dyn FnMut(&mut PacketLedger) -> Result<()> + Send);

#[async_trait]
pub trait Store: Send + Sync {
    // === users ===

    async fn find_user(&self, user_id: &str) -> Result<Option<User>>;
    async fn upsert_user(&self, user: User) -> Result<()>;
    async fn ping_user_active(&self, user_id: &str, at: Timestamp) -> Result<()>;
    async fn find_users(&self, user_ids: &[String]) -> Result<Vec<User>>;
    /// Move a pending user to paid and subscribed, writing `enrollment` in
    /// the same transaction. Returns false, writing nothing, when the user
    /// does not exist or was already paid.
    async fn mark_user_paid(&self, user_id: &str, at: Timestamp, enrollment: Enrollment)
        -> Result<bool>;
    async fn subscribers_count(&self) -> Result<u64>;
    /// Subscribers with `(subscribed_at, user_id) > (after, after_user)` and
    /// `active_at > active_since`, ordered by `(subscribed_at, user_id)`.
    async fn subscribed_users(
        &self,
        after: Timestamp,
        after_user: &str,
        active_since: Timestamp,
        limit: usize,
    ) -> Result<Vec<User>>;

    // === messages ===

    /// Returns false when a message with the same id already exists.
    async fn insert_message(&self, message: Message) -> Result<bool>;
    async fn find_message(&self, message_id: &str) -> Result<Option<Message>>;
    /// Pending messages, oldest first.
    async fn pending_messages(&self, limit: usize) -> Result<Vec<Message>>;
    /// The `limit` most recent messages, oldest first.
    async fn latest_messages(&self, limit: usize) -> Result<Vec<Message>>;

    // === fan-out queue ===

    async fn existing_distributed_ids(&self, ids: &[String]) -> Result<HashSet<String>>;
    /// Insert `rows` (skipping ids already present) and persist the message's
    /// watermark and state, atomically.
    async fn commit_fan_out(&self, message: &Message, rows: Vec<DistributedMessage>) -> Result<()>;
    async fn insert_distributed(&self, rows: Vec<DistributedMessage>) -> Result<()>;
    /// Undelivered rows of `shard` with `updated_at >= since`, ordered by
    /// `(updated_at, message_id)`.
    async fn pending_distributed(
        &self,
        shard: &str,
        since: Option<Timestamp>,
        limit: usize,
    ) -> Result<Vec<DistributedMessage>>;
    async fn mark_delivered(&self, message_ids: &[String], at: Timestamp) -> Result<()>;
    /// Delete at most `limit` rows created before `before`. Returns the count.
    async fn purge_distributed(&self, before: Timestamp, limit: usize) -> Result<usize>;
    async fn find_distributed(&self, message_id: &str) -> Result<Option<DistributedMessage>>;

    // === properties ===

    async fn read_property(&self, name: &str) -> Result<Option<String>>;
    async fn write_property(&self, name: &str, value: &str) -> Result<()>;

    // === packets ===

    async fn insert_packet(&self, packet: Packet) -> Result<()>;
    /// Run `f` against the packet's ledger under the store's serialization.
    /// Returns the committed ledger, or `None` if the packet does not exist.
    async fn packet_tx(&self, packet_id: &str, f: PacketTx<'_>) -> Result<Option<PacketLedger>>;
    /// Ids of PAID or EXPIRED packets created before `created_before`.
    async fn expired_packet_ids(&self, created_before: Timestamp, limit: usize)
        -> Result<Vec<String>>;
    async fn pending_participants(&self, limit: usize) -> Result<Vec<Participant>>;
    async fn mark_participant_paid(&self, packet_id: &str, user_id: &str, at: Timestamp)
        -> Result<()>;

    // === rewards ===

    /// Insert `reward` and its `announcement` atomically. Returns false,
    /// writing nothing, when a reward with the same id already exists.
    async fn insert_reward(&self, reward: Reward, announcement: Option<Message>) -> Result<bool>;
    async fn pending_rewards(&self, limit: usize) -> Result<Vec<Reward>>;
    async fn mark_reward_paid(&self, reward_id: &str, at: Timestamp) -> Result<()>;
}
