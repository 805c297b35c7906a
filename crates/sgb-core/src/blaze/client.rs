use std::{collections::HashMap, sync::Arc, time::Duration};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde_json::{json, Value};
use tokio::{
    sync::{mpsc, oneshot},
    time::timeout,
};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::{
    codec,
    correlator::Correlator,
    envelope::{action, BlazeMessage, STATUS_READ},
};
use crate::{
    digest,
    domain::{category, DistributedMessage},
    errors::Error,
    Result,
};

/// Most receipts the bus accepts in one `ACKNOWLEDGE_MESSAGE_RECEIPTS` call.
pub const ACK_BATCH_LIMIT: usize = 80;

/// Attempts `request` makes before surfacing a retryable peer failure.
const MAX_ATTEMPTS: usize = 3;

/// Request/reply handle over one live bus connection.
///
/// Cheap to clone; every clone writes into the same outbound queue and shares
/// the connection's correlator and `done` signal.
#[derive(Clone)]
pub struct BlazeClient {
    inner: Arc<Inner>,
}

struct Inner {
    bot_id: String,
    outbound: mpsc::Sender<Vec<u8>>,
    correlator: Arc<Correlator>,
    done: CancellationToken,
    write_wait: Duration,
    reply_timeout: Duration,
}

impl BlazeClient {
    pub fn new(
        bot_id: impl Into<String>,
        outbound: mpsc::Sender<Vec<u8>>,
        correlator: Arc<Correlator>,
        done: CancellationToken,
        write_wait: Duration,
        reply_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                bot_id: bot_id.into(),
                outbound,
                correlator,
                done,
                write_wait,
                reply_timeout,
            }),
        }
    }

    pub fn bot_id(&self) -> &str {
        &self.inner.bot_id
    }

    pub fn done(&self) -> &CancellationToken {
        &self.inner.done
    }

    /// One request, one reply. No retries.
    ///
    /// A reply carrying an error envelope comes back through `Error::from_peer`.
    /// No reply inside the reply window is `Error::DeliveryTimeout`; a dead
    /// connection is `Error::Transport`.
    pub async fn call(&self, action: &str, params: Option<Value>) -> Result<BlazeMessage> {
        let inner = &self.inner;
        let id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        inner.correlator.register(id.clone(), tx);

        let frame = match codec::encode(&BlazeMessage::request(id.clone(), action, params)) {
            Ok(f) => f,
            Err(e) => {
                inner.correlator.resolve(&id);
                return Err(e);
            }
        };

        let sent = tokio::select! {
          _ = inner.done.cancelled() => Err(Error::Transport(format!("connection closed before {action}"))),
          r = timeout(inner.write_wait, inner.outbound.send(frame)) => match r {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(Error::Transport(format!("outbound queue closed for {action}"))),
            Err(_) => Err(Error::Transport(format!("timeout to write {action}"))),
          },
        };
        if let Err(e) = sent {
            inner.correlator.resolve(&id);
            return Err(e);
        }

        let reply = tokio::select! {
          _ = inner.done.cancelled() => Err(Error::Transport(format!("connection closed awaiting {action}"))),
          r = timeout(inner.reply_timeout, rx) => match r {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(Error::Transport(format!("reply slot dropped for {action}"))),
            Err(_) => Err(Error::DeliveryTimeout { action: action.to_string() }),
          },
        };
        if reply.is_err() {
            inner.correlator.resolve(&id);
        }

        let reply = reply?;
        match &reply.error {
            Some(err) => Err(Error::from_peer(err.code, err.description.clone())),
            None => Ok(reply),
        }
    }

    /// `call`, repeated while the peer answers with a retryable error.
    ///
    /// A forbidden reply or a dead connection ends the attempts immediately.
    pub async fn request(&self, action: &str, params: Option<Value>) -> Result<BlazeMessage> {
        let mut attempt = 1;
        loop {
            match self.call(action, params.clone()).await {
                Ok(reply) => return Ok(reply),
                Err(e @ (Error::Peer { .. } | Error::DeliveryTimeout { .. }))
                    if e.is_retryable() && attempt < MAX_ATTEMPTS =>
                {
                    tracing::warn!(action, attempt, error = %e, "blaze request failed, retrying");
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub async fn list_pending_messages(&self) -> Result<()> {
        self.request(action::LIST_PENDING_MESSAGES, None).await?;
        Ok(())
    }

    /// Mark up to `ACK_BATCH_LIMIT` received messages as read.
    pub async fn acknowledge(&self, message_ids: &[String]) -> Result<()> {
        if message_ids.is_empty() {
            return Ok(());
        }
        if message_ids.len() > ACK_BATCH_LIMIT {
            return Err(Error::BadData(format!(
                "{} receipts exceed the batch limit of {ACK_BATCH_LIMIT}",
                message_ids.len()
            )));
        }
        let messages = message_ids
            .iter()
            .map(|id| json!({"message_id": id, "status": STATUS_READ}))
            .collect::<Vec<_>>();
        self.request(
            action::ACKNOWLEDGE_MESSAGE_RECEIPTS,
            Some(json!({ "messages": messages })),
        )
        .await?;
        Ok(())
    }

    /// Send one message straight into the bot's conversation with `recipient_id`.
    pub async fn create_message(
        &self,
        recipient_id: &str,
        category: &str,
        data: &[u8],
    ) -> Result<()> {
        let params = json!({
            "conversation_id": digest::unique_conversation_id(self.bot_id(), recipient_id),
            "recipient_id": recipient_id,
            "message_id": Uuid::new_v4().to_string(),
            "category": category,
            "data": STANDARD.encode(data),
        });
        self.request(action::CREATE_MESSAGE, Some(params)).await?;
        Ok(())
    }

    pub async fn send_text(&self, recipient_id: &str, text: &str) -> Result<()> {
        self.create_message(recipient_id, category::PLAIN_TEXT, text.as_bytes())
            .await
    }

    pub async fn send_app_button(
        &self,
        recipient_id: &str,
        label: &str,
        action_url: &str,
    ) -> Result<()> {
        let buttons = json!([{ "label": label, "action": action_url, "color": "#46B8DA" }]);
        let data = serde_json::to_vec(&buttons)?;
        self.create_message(recipient_id, category::APP_BUTTON_GROUP, &data)
            .await
    }

    /// Push a batch of fan-out rows in one `CREATE_PLAIN_MESSAGES` request.
    ///
    /// Recipients found in `sessions` get their session set and its checksum
    /// attached; the bus answers `Error::ChecksumMismatch` when a set is stale.
    pub async fn create_plain_messages(
        &self,
        rows: &[DistributedMessage],
        sessions: &HashMap<String, Vec<String>>,
    ) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let messages = rows
            .iter()
            .map(|m| {
                let recipient_sessions = sessions.get(&m.recipient_id).map(Vec::as_slice);
                plain_message_params(m, self.bot_id(), recipient_sessions)
            })
            .collect::<Vec<_>>();
        self.request(
            action::CREATE_PLAIN_MESSAGES,
            Some(json!({ "messages": messages })),
        )
        .await?;
        Ok(())
    }
}

fn plain_message_params(m: &DistributedMessage, bot_id: &str, sessions: Option<&[String]>) -> Value {
    // Bot-authored rows and recalls are sent as the bot itself, not on behalf
    // of a member.
    let representative = if m.user_id == bot_id || m.category == category::MESSAGE_RECALL {
        ""
    } else {
        m.user_id.as_str()
    };
    let mut params = json!({
        "conversation_id": m.conversation_id,
        "recipient_id": m.recipient_id,
        "message_id": m.message_id,
        "quote_message_id": m.quote_message_id,
        "category": m.category,
        "data": m.data,
        "representative_id": representative,
        "created_at": m.created_at,
        "updated_at": m.updated_at,
    });
    if let Some(sessions) = sessions.filter(|s| !s.is_empty()) {
        params["checksum"] = json!(digest::session_checksum(sessions));
        params["recipient_sessions"] = sessions
            .iter()
            .map(|id| json!({ "session_id": id }))
            .collect::<Value>();
    }
    params
}
