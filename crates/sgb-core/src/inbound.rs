//! Handlers for messages the main loop takes off the inbound buffer.

use std::{sync::Arc, time::Duration};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::Utc;
use governor::{Quota, RateLimiter};
use regex::Regex;
use uuid::Uuid;

use crate::{
    announce::join_message,
    blaze::{BlazeClient, MessageView, TransferView},
    config::Config,
    digest,
    dispatcher::USER_ACTIVE_PERIOD,
    distribution::{
        backlog_rows, build_row, decode_recall, notify_operators_too_large, BACKLOG_SIZE,
    },
    domain::{category, genesis, Amount, Message, MessageState, PacketState, Recall, User},
    errors::Error,
    packet::PacketEngine,
    payouts::record_reward,
    store::{Enrollment, Store},
    Result,
};

/// Largest base64 payload accepted for distribution.
pub const MAX_MESSAGE_BYTES: usize = 5 * 1024;
/// Payloads shorter than this are checked for commands.
const COMMAND_MAX_BYTES: usize = 10;
/// Property that, set to "true", mutes every member but the operators.
pub const PROHIBITED_PROPERTY: &str = "prohibited-message-property";
/// Operator replies that recall the quoted message.
const RECALL_COMMANDS: &[&str] = &["DELETE", "REMOVE"];
/// Idle authors are dropped from the limiter once it tracks this many.
const LIMITER_PRUNE_AT: usize = 10_000;

/// One message per `interval` for each author. A zero interval lets
/// everything through.
#[derive(Clone)]
pub struct MessageLimiter {
    // Boxed so governor's generics stay out of `Inbound`.
    check: Option<Arc<dyn Fn(&str) -> bool + Send + Sync>>,
}

impl MessageLimiter {
    pub fn new(interval: Duration) -> Self {
        let check = Quota::with_period(interval).map(|quota| {
            let limiter = RateLimiter::keyed(quota);
            Arc::new(move |user_id: &str| {
                let allowed = limiter.check_key(&user_id.to_string()).is_ok();
                if limiter.len() > LIMITER_PRUNE_AT {
                    limiter.retain_recent();
                }
                allowed
            }) as Arc<dyn Fn(&str) -> bool + Send + Sync>
        });
        Self { check }
    }

    pub fn allows(&self, user_id: &str) -> bool {
        self.check.as_ref().map_or(true, |check| check(user_id))
    }
}

/// `quote` when it is a canonical uuid.
fn valid_quote(quote: &str) -> Option<&str> {
    let id = Uuid::parse_str(quote).ok()?;
    (id.to_string() == quote).then_some(quote)
}

/// Recipient named by a `REWARD:<uuid>` transfer memo.
pub fn reward_recipient(memo: &str) -> Option<String> {
    let re = Regex::new(r"^REWARD:([0-9a-fA-F-]{36})$").ok()?;
    let id = re.captures(memo.trim())?.get(1)?.as_str();
    Uuid::parse_str(id).ok().map(|u| u.to_string())
}

#[derive(Clone)]
pub struct Inbound {
    cfg: Arc<Config>,
    store: Arc<dyn Store>,
    packets: PacketEngine,
    limiter: MessageLimiter,
}

impl Inbound {
    pub fn new(cfg: Arc<Config>, store: Arc<dyn Store>, packets: PacketEngine) -> Self {
        let limiter = MessageLimiter::new(cfg.message_interval);
        Self {
            cfg,
            store,
            packets,
            limiter,
        }
    }

    /// A message in a member's direct conversation with the bot.
    pub async fn handle_message(&self, client: &BlazeClient, view: &MessageView) -> Result<()> {
        let t = &self.cfg.templates;
        let Some(user) = self.store.find_user(&view.user_id).await? else {
            return client.send_text(&view.user_id, &t.tips_guest).await;
        };
        if !user.is_paid() {
            client.send_text(&user.user_id, &t.tips_help).await?;
            return client
                .send_app_button(&user.user_id, &t.tips_help_button, &self.cfg.http_resource_host)
                .await;
        }

        let now = Utc::now();
        let window = chrono::Duration::from_std(USER_ACTIVE_PERIOD)
            .unwrap_or_else(|_| chrono::Duration::minutes(5));
        if user.active_at < now - window {
            if let Err(e) = self.store.ping_user_active(&user.user_id, now).await {
                tracing::warn!(user_id = %user.user_id, error = %e, "activity ping failed");
            }
        }
        if user.subscribed_at.is_none() {
            return client.send_text(&user.user_id, &t.tips_unsubscribe).await;
        }

        let data = STANDARD
            .decode(view.data.as_bytes())
            .map_err(|e| Error::BadData(format!("message {} payload: {e}", view.message_id)))?;
        if data.len() < COMMAND_MAX_BYTES
            && String::from_utf8_lossy(&data).trim().to_uppercase() == t.command_info.to_uppercase()
        {
            let count = self.store.subscribers_count().await?;
            let reply = t.command_info_resp.replace("{count}", &count.to_string());
            return client.send_text(&user.user_id, &reply).await;
        }

        self.create_message(&user, view).await
    }

    /// Persist an authored message for fan-out.
    pub async fn create_message(&self, author: &User, view: &MessageView) -> Result<()> {
        if view.data.len() > MAX_MESSAGE_BYTES {
            tracing::warn!(message_id = %view.message_id, size = view.data.len(), "message too large");
            return notify_operators_too_large(
                &self.cfg,
                self.store.as_ref(),
                &view.message_id,
                &author.full_name,
            )
            .await;
        }
        if !category::is_distributable(&view.category) {
            tracing::debug!(message_id = %view.message_id, category = %view.category, "category not distributed");
            return Ok(());
        }

        if !self.cfg.is_privileged(&author.user_id) {
            if self.is_prohibited().await? {
                tracing::debug!(message_id = %view.message_id, "members are muted");
                return Ok(());
            }
            if !self.cfg.allows_category(&view.category) {
                tracing::debug!(message_id = %view.message_id, category = %view.category, "category blocked");
                return Ok(());
            }
            if view.category != category::MESSAGE_RECALL && !self.limiter.allows(&author.user_id) {
                return self.tell_too_many(author, view).await;
            }
        }

        let operator = self.cfg.is_operator(&author.user_id);
        let quote = valid_quote(&view.quote_message_id);
        let quoted = match quote {
            Some(q) => self.store.find_distributed(q).await?,
            None => None,
        };
        let mut author_id = author.user_id.clone();
        let mut kind = view.category.clone();
        let mut data = view.data.clone();
        let mut quote_message_id = match (&quoted, quote) {
            (Some(row), _) => row.parent_id.clone(),
            (None, Some(q)) => q.to_string(),
            (None, None) => String::new(),
        };

        if operator && quote.is_some() && self.is_recall_command(view) {
            let Some(row) = quoted else {
                tracing::debug!(message_id = %view.message_id, "recall command quotes an unknown message");
                return Ok(());
            };
            kind = category::MESSAGE_RECALL.to_string();
            data = STANDARD.encode(serde_json::to_vec(&Recall {
                message_id: row.parent_id,
            })?);
            quote_message_id.clear();
        }

        if kind == category::MESSAGE_RECALL {
            let recall = match decode_recall(&data) {
                Ok(r) => r,
                Err(e) => {
                    tracing::debug!(message_id = %view.message_id, error = %e, "unreadable recall");
                    return Ok(());
                }
            };
            let Some(target) = self.store.find_message(&recall.message_id).await? else {
                return Ok(());
            };
            if target.user_id != author.user_id && !operator {
                tracing::debug!(message_id = %view.message_id, target = %target.message_id, "recall of another member's message");
                return Ok(());
            }
            // The copy members hold was authored by the original writer.
            author_id = target.user_id;
        }

        let now = Utc::now();
        let inserted = self
            .store
            .insert_message(Message {
                message_id: view.message_id.clone(),
                user_id: author_id,
                category: kind,
                quote_message_id,
                data,
                state: MessageState::Pending,
                last_distribute_at: genesis(),
                last_distribute_user: String::new(),
                created_at: view.created_at.unwrap_or(now),
                updated_at: view.updated_at.unwrap_or(now),
            })
            .await?;
        if inserted {
            tracing::info!(message_id = %view.message_id, user_id = %author.user_id, "message queued");
        }
        Ok(())
    }

    async fn is_prohibited(&self) -> Result<bool> {
        if !self.cfg.prohibited_message_enabled {
            return Ok(false);
        }
        let value = self.store.read_property(PROHIBITED_PROPERTY).await?;
        Ok(value.as_deref() == Some("true"))
    }

    fn is_recall_command(&self, view: &MessageView) -> bool {
        if view.category != category::PLAIN_TEXT {
            return false;
        }
        let Ok(raw) = STANDARD.decode(view.data.as_bytes()) else {
            return false;
        };
        if raw.len() >= COMMAND_MAX_BYTES {
            return false;
        }
        let text = String::from_utf8_lossy(&raw).trim().to_uppercase();
        RECALL_COMMANDS.contains(&text.as_str())
    }

    /// Reply to an author over the message limit instead of distributing.
    async fn tell_too_many(&self, author: &User, view: &MessageView) -> Result<()> {
        tracing::debug!(message_id = %view.message_id, user_id = %author.user_id, "author over the message limit");
        let row = build_row(
            &self.cfg,
            &digest::distributed_message_id(&author.user_id, &view.message_id),
            &view.message_id,
            &self.cfg.client_id,
            &author.user_id,
            category::PLAIN_TEXT,
            &STANDARD.encode(self.cfg.templates.tips_too_many.as_bytes()),
        );
        self.store.insert_distributed(vec![row]).await
    }

    /// An asset snapshot sent to the bot: a reward, a subscription payment,
    /// or a red packet payment.
    pub async fn handle_transfer(&self, view: &MessageView) -> Result<()> {
        let raw = STANDARD
            .decode(view.data.as_bytes())
            .map_err(|e| Error::BadData(format!("snapshot {}: {e}", view.message_id)))?;
        let transfer: TransferView = serde_json::from_slice(&raw)?;
        if transfer.amount <= Amount::ZERO {
            return Ok(());
        }
        let Ok(trace) = Uuid::parse_str(&transfer.trace_id) else {
            tracing::debug!(trace_id = %transfer.trace_id, "transfer without a uuid trace");
            return Ok(());
        };
        let trace = trace.to_string();

        if let Some(recipient) = reward_recipient(&transfer.memo) {
            let created = record_reward(
                &self.cfg,
                self.store.as_ref(),
                &trace,
                &view.user_id,
                &recipient,
                &transfer.asset_id,
                transfer.amount,
            )
            .await?;
            if created {
                tracing::info!(reward_id = %trace, %recipient, "reward recorded");
            }
            return Ok(());
        }

        let Some(user) = self.store.find_user(&view.user_id).await? else {
            return Ok(());
        };

        if user.trace_id == transfer.trace_id {
            if !self.cfg.accepts_subscription(&transfer.asset_id, transfer.amount) || user.is_paid() {
                return Ok(());
            }
            let latest = self.store.latest_messages(BACKLOG_SIZE).await?;
            let enrollment = Enrollment {
                join: join_message(&self.cfg, &user),
                backlog: backlog_rows(&self.cfg, &user.user_id, &latest)?,
            };
            if self.store.mark_user_paid(&user.user_id, Utc::now(), enrollment).await? {
                tracing::info!(user_id = %user.user_id, "subscription paid");
            }
            return Ok(());
        }

        let Some(packet) = self
            .packets
            .pay(&trace, &transfer.asset_id, transfer.amount)
            .await?
        else {
            return Ok(());
        };
        if packet.state != PacketState::Paid {
            return Ok(());
        }

        let creator = self
            .store
            .find_user(&packet.user_id)
            .await?
            .map(|u| u.full_name)
            .unwrap_or_default();
        let card = self.packets.app_card(&packet, &creator)?;
        if self.store.insert_message(card).await? {
            tracing::info!(packet_id = %packet.packet_id, "packet paid, card queued");
        }
        Ok(())
    }
}
