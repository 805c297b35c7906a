//! Inbound frame classification.
//!
//! Replies are routed back to their waiting caller through the correlator,
//! read receipts refresh recipient activity, and new messages are handed to
//! the connection's main loop through a bounded buffer.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use chrono::Utc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{
    blaze::{
        codec,
        envelope::{action, MessageView, STATUS_READ},
        Correlator,
    },
    digest,
    domain::{category, Timestamp},
    errors::Error,
    store::Store,
    Result,
};

/// A recipient is pinged at most once per window.
pub const USER_ACTIVE_PERIOD: Duration = Duration::from_secs(5 * 60);

/// What the main loop should do with an inbound message.
#[derive(Clone, Debug, PartialEq)]
pub enum InboundEvent {
    /// Sent in the sender's direct conversation with the bot.
    Conversation(MessageView),
    /// Asset snapshot pushed by the payments network.
    Snapshot(MessageView),
    /// Anything else; only acknowledged.
    Ignored(MessageView),
}

impl InboundEvent {
    pub fn view(&self) -> &MessageView {
        match self {
            InboundEvent::Conversation(v) | InboundEvent::Snapshot(v) | InboundEvent::Ignored(v) => v,
        }
    }
}

/// Last activity ping per recipient. Lost on restart, which only costs an
/// extra ping.
#[derive(Debug)]
pub struct ActivityTracker {
    window: chrono::Duration,
    pinged: Mutex<HashMap<String, Timestamp>>,
}

impl ActivityTracker {
    pub fn new(window: Duration) -> Self {
        Self {
            window: chrono::Duration::from_std(window).unwrap_or_else(|_| chrono::Duration::minutes(5)),
            pinged: Mutex::new(HashMap::new()),
        }
    }

    /// True (and recorded) when `user_id` has not been pinged within the window.
    ///
    /// Recording a ping drops entries older than the window, so the map only
    /// holds recipients pinged within the last window.
    pub fn should_ping(&self, user_id: &str, now: Timestamp) -> bool {
        let mut pinged = self.pinged.lock().unwrap_or_else(|e| e.into_inner());
        let cutoff = now - self.window;
        match pinged.get(user_id) {
            Some(last) if *last > cutoff => false,
            _ => {
                pinged.retain(|_, last| *last > cutoff);
                pinged.insert(user_id.to_string(), now);
                true
            }
        }
    }

    #[cfg(test)]
    fn tracked(&self) -> usize {
        self.pinged.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

pub struct Dispatcher {
    bot_id: String,
    store: Arc<dyn Store>,
    correlator: Arc<Correlator>,
    activity: Arc<ActivityTracker>,
    inbox: mpsc::Sender<InboundEvent>,
    handoff_timeout: Duration,
}

impl Dispatcher {
    pub fn new(
        bot_id: impl Into<String>,
        store: Arc<dyn Store>,
        correlator: Arc<Correlator>,
        activity: Arc<ActivityTracker>,
        inbox: mpsc::Sender<InboundEvent>,
        handoff_timeout: Duration,
    ) -> Self {
        Self {
            bot_id: bot_id.into(),
            store,
            correlator,
            activity,
            inbox,
            handoff_timeout,
        }
    }

    /// Read loop: runs until `done` fires or the inbound stream ends.
    ///
    /// Undecodable frames are logged and dropped; only a stalled handoff to the
    /// main loop tears the connection down.
    pub async fn run(self, mut inbound: mpsc::Receiver<Vec<u8>>, done: CancellationToken) {
        loop {
            let frame = tokio::select! {
              _ = done.cancelled() => break,
              f = inbound.recv() => match f {
                Some(f) => f,
                None => {
                  done.cancel();
                  break;
                }
              },
            };

            match self.dispatch(&frame).await {
                Ok(()) => {}
                Err(e @ Error::Transport(_)) => {
                    tracing::error!(error = %e, "inbound handoff failed, closing connection");
                    done.cancel();
                    break;
                }
                Err(e) => tracing::warn!(error = %e, "dropping inbound frame"),
            }
        }
    }

    pub async fn dispatch(&self, frame: &[u8]) -> Result<()> {
        let msg = codec::decode(frame)?;

        if self.correlator.complete(msg.clone()) {
            return Ok(());
        }

        match msg.action.as_str() {
            action::ACKNOWLEDGE_MESSAGE_RECEIPT => {
                let Some(view) = msg.data_as::<MessageView>()? else {
                    return Err(Error::Protocol("receipt without data".to_string()));
                };
                self.on_receipt(&view).await
            }
            action::CREATE_MESSAGE => {
                let Some(view) = msg.data_as::<MessageView>()? else {
                    return Err(Error::Protocol("message without data".to_string()));
                };
                let event = self.classify(view);
                self.hand_off(event).await
            }
            _ => Ok(()),
        }
    }

    pub fn classify(&self, view: MessageView) -> InboundEvent {
        if view.category == category::SYSTEM_ACCOUNT_SNAPSHOT && view.user_id != self.bot_id {
            return InboundEvent::Snapshot(view);
        }
        if view.conversation_id == digest::unique_conversation_id(&self.bot_id, &view.user_id) {
            return InboundEvent::Conversation(view);
        }
        InboundEvent::Ignored(view)
    }

    async fn on_receipt(&self, view: &MessageView) -> Result<()> {
        if view.status != STATUS_READ {
            return Ok(());
        }
        let Some(row) = self.store.find_distributed(&view.message_id).await? else {
            return Ok(());
        };
        let recipient = row.recipient_id;
        let now = Utc::now();
        if self.activity.should_ping(&recipient, now) {
            self.store.ping_user_active(&recipient, now).await?;
        }
        Ok(())
    }

    async fn hand_off(&self, event: InboundEvent) -> Result<()> {
        let id = event.view().message_id.clone();
        match tokio::time::timeout(self.handoff_timeout, self.inbox.send(event)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(Error::Transport("inbound buffer closed".to_string())),
            Err(_) => Err(Error::Transport(format!("timeout to handle {id}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        blaze::BlazeMessage,
        domain::{DeliveryStatus, DistributedMessage, PaymentState, User},
        store::MemoryStore,
    };
    use serde_json::json;
    use tokio::sync::oneshot;

    const BOT: &str = "bot-id";

    struct Fixture {
        dispatcher: Dispatcher,
        store: Arc<MemoryStore>,
        correlator: Arc<Correlator>,
        inbox: mpsc::Receiver<InboundEvent>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let correlator = Arc::new(Correlator::new());
        let (tx, rx) = mpsc::channel(4);
        let dispatcher = Dispatcher::new(
            BOT,
            store.clone(),
            correlator.clone(),
            Arc::new(ActivityTracker::new(USER_ACTIVE_PERIOD)),
            tx,
            Duration::from_millis(100),
        );
        Fixture {
            dispatcher,
            store,
            correlator,
            inbox: rx,
        }
    }

    fn frame(action: &str, data: serde_json::Value) -> Vec<u8> {
        codec::encode(&BlazeMessage {
            id: uuid::Uuid::new_v4().to_string(),
            action: action.to_string(),
            data: Some(data),
            ..Default::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn replies_go_to_the_waiting_caller() {
        let f = fixture();
        let (tx, rx) = oneshot::channel();
        f.correlator.register("req-9", tx);
        let reply = codec::encode(&BlazeMessage {
            id: "req-9".to_string(),
            action: action::CREATE_MESSAGE.to_string(),
            ..Default::default()
        })
        .unwrap();

        f.dispatcher.dispatch(&reply).await.unwrap();
        assert_eq!(rx.await.unwrap().id, "req-9");
    }

    #[tokio::test]
    async fn direct_messages_and_snapshots_are_classified() {
        let mut f = fixture();
        let conv = digest::unique_conversation_id(BOT, "user-1");

        let direct = json!({"conversation_id": conv, "user_id": "user-1", "message_id": "m1", "category": "PLAIN_TEXT"});
        f.dispatcher
            .dispatch(&frame(action::CREATE_MESSAGE, direct))
            .await
            .unwrap();
        assert!(matches!(f.inbox.recv().await, Some(InboundEvent::Conversation(v)) if v.message_id == "m1"));

        let snapshot = json!({"conversation_id": "other", "user_id": "payer", "message_id": "m2", "category": "SYSTEM_ACCOUNT_SNAPSHOT"});
        f.dispatcher
            .dispatch(&frame(action::CREATE_MESSAGE, snapshot))
            .await
            .unwrap();
        assert!(matches!(f.inbox.recv().await, Some(InboundEvent::Snapshot(_))));

        let group = json!({"conversation_id": "group", "user_id": "user-1", "message_id": "m3", "category": "PLAIN_TEXT"});
        f.dispatcher
            .dispatch(&frame(action::CREATE_MESSAGE, group))
            .await
            .unwrap();
        assert!(matches!(f.inbox.recv().await, Some(InboundEvent::Ignored(_))));

        let own = json!({"conversation_id": "x", "user_id": BOT, "message_id": "m4", "category": "SYSTEM_ACCOUNT_SNAPSHOT"});
        f.dispatcher
            .dispatch(&frame(action::CREATE_MESSAGE, own))
            .await
            .unwrap();
        assert!(matches!(f.inbox.recv().await, Some(InboundEvent::Ignored(_))));
    }

    #[tokio::test]
    async fn read_receipts_ping_recipient_once_per_window() {
        let f = fixture();
        let stale = Utc::now() - chrono::Duration::days(2);
        f.store
            .upsert_user(User {
                user_id: "rcpt".to_string(),
                full_name: "R".to_string(),
                trace_id: "t".to_string(),
                state: PaymentState::Paid,
                active_at: stale,
                subscribed_at: Some(stale),
                sessions: Vec::new(),
            })
            .await
            .unwrap();
        f.store
            .insert_distributed(vec![DistributedMessage {
                message_id: "dm-1".to_string(),
                conversation_id: "c".to_string(),
                recipient_id: "rcpt".to_string(),
                user_id: "author".to_string(),
                parent_id: "m".to_string(),
                quote_message_id: String::new(),
                shard: "s".to_string(),
                category: category::PLAIN_TEXT.to_string(),
                data: String::new(),
                status: DeliveryStatus::Delivered,
                created_at: stale,
                updated_at: stale,
            }])
            .await
            .unwrap();

        let receipt = json!({"message_id": "dm-1", "status": "READ"});
        f.dispatcher
            .dispatch(&frame(action::ACKNOWLEDGE_MESSAGE_RECEIPT, receipt.clone()))
            .await
            .unwrap();
        let first = f.store.find_user("rcpt").await.unwrap().unwrap().active_at;
        assert!(first > stale);

        f.dispatcher
            .dispatch(&frame(action::ACKNOWLEDGE_MESSAGE_RECEIPT, receipt))
            .await
            .unwrap();
        let second = f.store.find_user("rcpt").await.unwrap().unwrap().active_at;
        assert_eq!(first, second);

        // delivered-only receipts change nothing
        let delivered = json!({"message_id": "dm-1", "status": "DELIVERED"});
        f.dispatcher
            .dispatch(&frame(action::ACKNOWLEDGE_MESSAGE_RECEIPT, delivered))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn malformed_frames_do_not_stop_the_read_loop() {
        let mut f = fixture();
        let (frames_tx, frames_rx) = mpsc::channel(4);
        let done = CancellationToken::new();
        let conv = digest::unique_conversation_id(BOT, "user-1");

        frames_tx.send(b"garbage".to_vec()).await.unwrap();
        frames_tx
            .send(frame(
                action::CREATE_MESSAGE,
                json!({"conversation_id": conv, "user_id": "user-1", "message_id": "ok"}),
            ))
            .await
            .unwrap();
        drop(frames_tx);

        f.dispatcher.run(frames_rx, done.clone()).await;
        assert!(matches!(f.inbox.recv().await, Some(InboundEvent::Conversation(v)) if v.message_id == "ok"));
        // end of stream closes the connection
        assert!(done.is_cancelled());
    }

    #[test]
    fn activity_tracker_respects_window() {
        let tracker = ActivityTracker::new(USER_ACTIVE_PERIOD);
        let now = Utc::now();
        assert!(tracker.should_ping("u", now));
        assert!(!tracker.should_ping("u", now + chrono::Duration::minutes(4)));
        assert!(tracker.should_ping("u", now + chrono::Duration::minutes(6)));
        assert!(tracker.should_ping("v", now));
    }

    #[test]
    fn activity_tracker_forgets_idle_recipients() {
        let tracker = ActivityTracker::new(USER_ACTIVE_PERIOD);
        let now = Utc::now();
        for i in 0..50 {
            assert!(tracker.should_ping(&format!("u{i}"), now));
        }
        assert_eq!(tracker.tracked(), 50);

        assert!(tracker.should_ping("late", now + chrono::Duration::minutes(6)));
        assert_eq!(tracker.tracked(), 1);
    }
}
