//! Fan-out of authored messages into per-recipient rows, and the per-shard
//! drains that push those rows to the bus.

use std::{
    collections::{BTreeSet, HashMap},
    sync::Arc,
    time::Duration,
};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, SecondsFormat, Utc};
use tokio_util::sync::CancellationToken;

use crate::{
    blaze::BlazeClient,
    config::Config,
    digest,
    domain::{
        category, DeliveryStatus, DistributedMessage, Message, MessageState, Recall, Timestamp,
    },
    errors::Error,
    store::Store,
    Result,
};

/// Pending messages taken per fan-out pass.
pub const MESSAGE_PAGE: usize = 5;
/// Subscribers read per fan-out step.
pub const SUBSCRIBER_PAGE: usize = 100;
/// Subscribers idle for longer than this are skipped.
pub const ACTIVE_WINDOW_DAYS: i64 = 6;
/// Undelivered rows older than this are purged.
pub const DISTRIBUTED_TTL_HOURS: i64 = 3;
pub const PURGE_LIMIT: usize = 100;
const PURGE_IDLE: Duration = Duration::from_secs(10);
/// Recent messages a new member receives on joining.
pub const BACKLOG_SIZE: usize = 10;

/// One fan-out row addressed from `author_id` to `recipient_id`, placed on the
/// recipient's shard.
pub fn build_row(
    cfg: &Config,
    message_id: &str,
    parent_id: &str,
    author_id: &str,
    recipient_id: &str,
    category: &str,
    data: &str,
) -> DistributedMessage {
    let conversation_id = digest::unique_conversation_id(&cfg.client_id, recipient_id);
    let shard = digest::recipient_shard(
        &cfg.shard_modifier,
        cfg.shard_size,
        &conversation_id,
        recipient_id,
    );
    // Stamped again by the store at commit time.
    let now = Utc::now();
    DistributedMessage {
        message_id: message_id.to_string(),
        conversation_id,
        recipient_id: recipient_id.to_string(),
        user_id: author_id.to_string(),
        parent_id: parent_id.to_string(),
        quote_message_id: String::new(),
        shard,
        category: category.to_string(),
        data: data.to_string(),
        status: DeliveryStatus::Sent,
        created_at: now,
        updated_at: now,
    }
}

pub fn decode_recall(data: &str) -> Result<Recall> {
    let raw = STANDARD
        .decode(data.as_bytes())
        .map_err(|e| Error::BadData(format!("recall payload: {e}")))?;
    Ok(serde_json::from_slice(&raw)?)
}

/// `message` as `recipient_id` receives it. A recall points at the
/// recipient's copy of its target; a quote points at the recipient's copy of
/// the quoted message, or the original when the recipient wrote it.
pub fn recipient_row(
    cfg: &Config,
    message: &Message,
    recall: Option<&Recall>,
    quote: Option<&Message>,
    recipient_id: &str,
) -> Result<DistributedMessage> {
    let data = match recall {
        Some(r) => {
            let target = Recall {
                message_id: digest::distributed_message_id(recipient_id, &r.message_id),
            };
            STANDARD.encode(serde_json::to_vec(&target)?)
        }
        None => message.data.clone(),
    };
    let mut row = build_row(
        cfg,
        &digest::distributed_message_id(recipient_id, &message.message_id),
        &message.message_id,
        &message.user_id,
        recipient_id,
        &message.category,
        &data,
    );
    if let Some(q) = quote {
        row.quote_message_id = if q.user_id == recipient_id {
            q.message_id.clone()
        } else {
            digest::distributed_message_id(recipient_id, &q.message_id)
        };
    }
    Ok(row)
}

/// Rows that catch a new member up on `messages`. Quotes are dropped since
/// the member never received the quoted originals.
pub fn backlog_rows(
    cfg: &Config,
    recipient_id: &str,
    messages: &[Message],
) -> Result<Vec<DistributedMessage>> {
    let mut rows = Vec::with_capacity(messages.len());
    for m in messages.iter().filter(|m| !m.data.is_empty()) {
        let recall = if m.category == category::MESSAGE_RECALL {
            Some(decode_recall(&m.data)?)
        } else {
            None
        };
        rows.push(recipient_row(cfg, m, recall.as_ref(), None, recipient_id)?);
    }
    Ok(rows)
}

/// Tell every operator that `message` was refused for size.
pub async fn notify_operators_too_large(
    cfg: &Config,
    store: &dyn Store,
    message_id: &str,
    author_name: &str,
) -> Result<()> {
    let text = format!(
        "MessageId: {message_id}, {}",
        cfg.templates.message_too_large.replace("{name}", author_name)
    );
    let data = STANDARD.encode(text.as_bytes());
    let rows = cfg
        .operators
        .iter()
        .map(|op| {
            build_row(
                cfg,
                &digest::distributed_message_id(op, message_id),
                message_id,
                &cfg.client_id,
                op,
                category::PLAIN_TEXT,
                &data,
            )
        })
        .collect::<Vec<_>>();
    if rows.is_empty() {
        return Ok(());
    }
    store.insert_distributed(rows).await
}

/// Turns pending messages into fan-out rows, one subscriber page at a time.
#[derive(Clone)]
pub struct FanOut {
    cfg: Arc<Config>,
    store: Arc<dyn Store>,
}

impl FanOut {
    pub fn new(cfg: Arc<Config>, store: Arc<dyn Store>) -> Self {
        Self { cfg, store }
    }

    /// Process one page of subscribers after the message's watermark and
    /// commit the rows with the advanced watermark. Returns true once the
    /// message is fully distributed.
    pub async fn distribute_page(&self, message: &mut Message, now: Timestamp) -> Result<bool> {
        let active_since = now - chrono::Duration::days(ACTIVE_WINDOW_DAYS);
        let users = self
            .store
            .subscribed_users(
                message.last_distribute_at,
                &message.last_distribute_user,
                active_since,
                SUBSCRIBER_PAGE,
            )
            .await?;

        let recall = if message.category == category::MESSAGE_RECALL {
            Some(decode_recall(&message.data)?)
        } else {
            None
        };
        let quote = if message.quote_message_id.is_empty() {
            None
        } else {
            self.store.find_message(&message.quote_message_id).await?
        };

        let ids = users
            .iter()
            .map(|u| digest::distributed_message_id(&u.user_id, &message.message_id))
            .collect::<Vec<_>>();
        let existing = self.store.existing_distributed_ids(&ids).await?;

        let mut rows = Vec::with_capacity(users.len());
        for (user, id) in users.iter().zip(&ids) {
            if let Some(at) = user.subscribed_at {
                message.last_distribute_at = at;
                message.last_distribute_user = user.user_id.clone();
            }
            if user.user_id == message.user_id || existing.contains(id) {
                continue;
            }
            rows.push(recipient_row(
                &self.cfg,
                message,
                recall.as_ref(),
                quote.as_ref(),
                &user.user_id,
            )?);
        }

        let finished = users.len() < SUBSCRIBER_PAGE;
        if finished {
            message.state = MessageState::Success;
            message.last_distribute_at = now;
            message.last_distribute_user.clear();
        }
        let created = rows.len();
        self.store.commit_fan_out(message, rows).await?;
        tracing::debug!(message_id = %message.message_id, created, finished, "fan-out page");
        Ok(finished)
    }

    /// Distribute `message` to every current subscriber.
    pub async fn distribute(&self, mut message: Message) -> Result<()> {
        while !self.distribute_page(&mut message, Utc::now()).await? {}
        tracing::info!(message_id = %message.message_id, "message distributed");
        Ok(())
    }

    /// One pass over the oldest pending messages. Returns how many were taken.
    pub async fn run_once(&self) -> Result<usize> {
        let pending = self.store.pending_messages(MESSAGE_PAGE).await?;
        let taken = pending.len();
        for message in pending {
            self.distribute(message).await?;
        }
        Ok(taken)
    }

    pub async fn run(self, done: CancellationToken) {
        let backoff = self.cfg.worker_backoff;
        loop {
            let pause = match self.run_once().await {
                Ok(n) if n >= MESSAGE_PAGE => Duration::ZERO,
                Ok(_) => backoff,
                Err(e) => {
                    tracing::error!(error = %e, "fan-out pass failed");
                    backoff
                }
            };
            tokio::select! {
              _ = done.cancelled() => break,
              _ = tokio::time::sleep(pause) => {}
            }
        }
    }
}

pub fn checkpoint_key(shard: &str) -> String {
    format!("distribute-checkpoint-{shard}")
}

/// Drains one shard of the fan-out queue over a live connection.
pub struct ShardDrain {
    shard: String,
    store: Arc<dyn Store>,
    client: BlazeClient,
    batch_size: usize,
    idle: Duration,
    backoff: Duration,
}

impl ShardDrain {
    pub fn new(cfg: &Config, shard: String, store: Arc<dyn Store>, client: BlazeClient) -> Self {
        Self {
            shard,
            store,
            client,
            batch_size: cfg.shard_batch_size.max(1),
            idle: cfg.shard_idle,
            backoff: cfg.worker_backoff,
        }
    }

    pub async fn load_checkpoint(&self) -> Result<Option<Timestamp>> {
        let Some(raw) = self.store.read_property(&checkpoint_key(&self.shard)).await? else {
            return Ok(None);
        };
        match DateTime::parse_from_rfc3339(&raw) {
            Ok(at) => Ok(Some(at.with_timezone(&Utc))),
            Err(e) => {
                tracing::warn!(shard = %self.shard, error = %e, "ignoring unreadable checkpoint");
                Ok(None)
            }
        }
    }

    /// Send one batch. Rows are marked delivered only after the bus accepted
    /// them, then the checkpoint moves to the newest row sent.
    pub async fn drain_once(&self, since: &mut Option<Timestamp>) -> Result<usize> {
        let rows = self
            .store
            .pending_distributed(&self.shard, *since, self.batch_size)
            .await?;
        let Some(newest) = rows.iter().map(|r| r.updated_at).max() else {
            return Ok(0);
        };

        let recipients = rows
            .iter()
            .map(|r| r.recipient_id.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect::<Vec<_>>();
        let sessions = self
            .store
            .find_users(&recipients)
            .await?
            .into_iter()
            .filter(|u| !u.sessions.is_empty())
            .map(|u| (u.user_id, u.sessions))
            .collect::<HashMap<_, _>>();

        self.client.create_plain_messages(&rows, &sessions).await?;

        let ids = rows.iter().map(|r| r.message_id.clone()).collect::<Vec<_>>();
        self.store.mark_delivered(&ids, Utc::now()).await?;
        self.store
            .write_property(
                &checkpoint_key(&self.shard),
                &newest.to_rfc3339_opts(SecondsFormat::Nanos, true),
            )
            .await?;
        *since = Some(newest);
        Ok(rows.len())
    }

    /// Runs until `done` fires.
    pub async fn run(self, done: CancellationToken) {
        let mut since = match self.load_checkpoint().await {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(shard = %self.shard, error = %e, "checkpoint unavailable, scanning from start");
                None
            }
        };
        tracing::info!(shard = %self.shard, ?since, "shard drain started");

        loop {
            let pause = match self.drain_once(&mut since).await {
                Ok(n) if n >= self.batch_size => Duration::ZERO,
                Ok(_) => self.idle,
                Err(Error::ChecksumMismatch) => {
                    tracing::warn!(shard = %self.shard, "recipient sessions are stale, batch kept");
                    self.backoff
                }
                Err(e) => {
                    tracing::error!(shard = %self.shard, error = %e, "shard drain failed");
                    self.backoff
                }
            };
            tokio::select! {
              _ = done.cancelled() => break,
              _ = tokio::time::sleep(pause) => {}
            }
        }
        tracing::info!(shard = %self.shard, "shard drain stopped");
    }
}

/// Delete one bounded batch of expired rows.
pub async fn purge_once(store: &dyn Store, now: Timestamp) -> Result<usize> {
    let before = now - chrono::Duration::hours(DISTRIBUTED_TTL_HOURS);
    store.purge_distributed(before, PURGE_LIMIT).await
}

pub async fn run_purge(store: Arc<dyn Store>, backoff: Duration, done: CancellationToken) {
    loop {
        let pause = match purge_once(store.as_ref(), Utc::now()).await {
            Ok(n) if n >= PURGE_LIMIT => Duration::ZERO,
            Ok(_) => PURGE_IDLE,
            Err(e) => {
                tracing::error!(error = %e, "purge failed");
                backoff
            }
        };
        tokio::select! {
          _ = done.cancelled() => break,
          _ = tokio::time::sleep(pause) => {}
        }
    }
}
