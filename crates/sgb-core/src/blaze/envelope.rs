use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::{Amount, Timestamp};

pub mod action {
    pub const LIST_PENDING_MESSAGES: &str = "LIST_PENDING_MESSAGES";
    pub const ACKNOWLEDGE_MESSAGE_RECEIPT: &str = "ACKNOWLEDGE_MESSAGE_RECEIPT";
    pub const ACKNOWLEDGE_MESSAGE_RECEIPTS: &str = "ACKNOWLEDGE_MESSAGE_RECEIPTS";
    pub const CREATE_MESSAGE: &str = "CREATE_MESSAGE";
    pub const CREATE_PLAIN_MESSAGES: &str = "CREATE_PLAIN_MESSAGES";
}

/// Receipt status that ends a message's delivery lifecycle.
pub const STATUS_READ: &str = "READ";

/// Wire envelope shared by requests, replies and pushes.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BlazeMessage {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<BlazeError>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BlazeError {
    #[serde(default)]
    pub code: i64,
    #[serde(default)]
    pub description: String,
}

impl BlazeMessage {
    pub fn request(id: impl Into<String>, action: &str, params: Option<Value>) -> Self {
        Self {
            id: id.into(),
            action: action.to_string(),
            params,
            ..Default::default()
        }
    }

    /// Decode `data` into `T`; `None` when the field is absent.
    pub fn data_as<T: serde::de::DeserializeOwned>(&self) -> crate::Result<Option<T>> {
        match &self.data {
            Some(v) => Ok(Some(serde_json::from_value(v.clone())?)),
            None => Ok(None),
        }
    }
}

/// Inbound message payload (`CREATE_MESSAGE`, `ACKNOWLEDGE_MESSAGE_RECEIPT`).
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MessageView {
    pub conversation_id: String,
    pub user_id: String,
    pub message_id: String,
    pub quote_message_id: String,
    pub category: String,
    pub data: String,
    pub status: String,
    pub created_at: Option<Timestamp>,
    pub updated_at: Option<Timestamp>,
}

/// Decoded body of a `SYSTEM_ACCOUNT_SNAPSHOT` message. Fields the bot does
/// not act on are skipped.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TransferView {
    pub asset_id: String,
    pub amount: Amount,
    #[serde(default)]
    pub trace_id: String,
    #[serde(default)]
    pub memo: String,
}
