use std::{fmt, ops, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::{errors::Error, Result};

pub type Timestamp = DateTime<Utc>;

/// Watermark a fresh message starts distributing from.
pub fn genesis() -> Timestamp {
    DateTime::<Utc>::UNIX_EPOCH
}

/// Message categories the bus understands.
pub mod category {
    pub const PLAIN_TEXT: &str = "PLAIN_TEXT";
    pub const PLAIN_IMAGE: &str = "PLAIN_IMAGE";
    pub const PLAIN_VIDEO: &str = "PLAIN_VIDEO";
    pub const PLAIN_LIVE: &str = "PLAIN_LIVE";
    pub const PLAIN_DATA: &str = "PLAIN_DATA";
    pub const PLAIN_STICKER: &str = "PLAIN_STICKER";
    pub const PLAIN_CONTACT: &str = "PLAIN_CONTACT";
    pub const PLAIN_AUDIO: &str = "PLAIN_AUDIO";
    pub const PLAIN_POST: &str = "PLAIN_POST";
    pub const APP_CARD: &str = "APP_CARD";
    pub const APP_BUTTON_GROUP: &str = "APP_BUTTON_GROUP";
    pub const MESSAGE_RECALL: &str = "MESSAGE_RECALL";
    pub const SYSTEM_ACCOUNT_SNAPSHOT: &str = "SYSTEM_ACCOUNT_SNAPSHOT";

    /// Categories that may be persisted and fanned out to subscribers.
    pub const DISTRIBUTABLE: &[&str] = &[
        PLAIN_TEXT,
        PLAIN_IMAGE,
        PLAIN_VIDEO,
        PLAIN_LIVE,
        PLAIN_DATA,
        PLAIN_STICKER,
        PLAIN_CONTACT,
        PLAIN_AUDIO,
        PLAIN_POST,
        APP_CARD,
        APP_BUTTON_GROUP,
        MESSAGE_RECALL,
    ];

    pub fn is_distributable(category: &str) -> bool {
        DISTRIBUTABLE.contains(&category)
    }
}

/// Fixed-point asset amount with 8 decimal places.
///
/// Serialized as a decimal string, which is how the bus and the payments API
/// carry amounts.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Amount(i64);

impl Amount {
    pub const DECIMALS: u32 = 8;
    const SCALE: i64 = 100_000_000;

    pub const ZERO: Amount = Amount(0);

    pub const fn from_units(units: i64) -> Self {
        Self(units)
    }

    pub const fn units(self) -> i64 {
        self.0
    }

    /// Nothing left below the smallest representable unit.
    pub fn is_exhausted(self) -> bool {
        self.0 <= 0
    }

    /// Round toward negative infinity keeping `decimals` fractional digits.
    pub fn floor_to(self, decimals: u32) -> Self {
        if decimals >= Self::DECIMALS {
            return self;
        }
        let step = 10_i64.pow(Self::DECIMALS - decimals);
        Self(self.0.div_euclid(step) * step)
    }
}

impl ops::Add for Amount {
    type Output = Amount;
    fn add(self, rhs: Amount) -> Amount {
        Amount(self.0 + rhs.0)
    }
}

impl ops::Sub for Amount {
    type Output = Amount;
    fn sub(self, rhs: Amount) -> Amount {
        Amount(self.0 - rhs.0)
    }
}

impl ops::AddAssign for Amount {
    fn add_assign(&mut self, rhs: Amount) {
        self.0 += rhs.0;
    }
}

impl ops::SubAssign for Amount {
    fn sub_assign(&mut self, rhs: Amount) {
        self.0 -= rhs.0;
    }
}

impl std::iter::Sum for Amount {
    fn sum<I: Iterator<Item = Amount>>(iter: I) -> Amount {
        iter.fold(Amount::ZERO, |acc, a| acc + a)
    }
}

impl FromStr for Amount {
    type Err = Error;

    /// Digits past the eighth decimal are truncated.
    fn from_str(s: &str) -> Result<Self> {
        let bad = || Error::BadData(format!("invalid amount {s:?}"));
        let raw = s.trim();
        let (negative, digits) = match raw.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, raw.strip_prefix('+').unwrap_or(raw)),
        };
        let (int_part, frac_part) = digits.split_once('.').unwrap_or((digits, ""));
        if int_part.is_empty() && frac_part.is_empty() {
            return Err(bad());
        }
        if !int_part.chars().all(|c| c.is_ascii_digit())
            || !frac_part.chars().all(|c| c.is_ascii_digit())
        {
            return Err(bad());
        }

        let whole: i64 = if int_part.is_empty() {
            0
        } else {
            int_part.parse().map_err(|_| bad())?
        };
        let mut frac = frac_part
            .chars()
            .take(Self::DECIMALS as usize)
            .collect::<String>();
        while frac.len() < Self::DECIMALS as usize {
            frac.push('0');
        }
        let frac: i64 = frac.parse().map_err(|_| bad())?;

        let units = whole
            .checked_mul(Self::SCALE)
            .and_then(|w| w.checked_add(frac))
            .ok_or_else(bad)?;
        Ok(Self(if negative { -units } else { units }))
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        let scale = Self::SCALE as u64;
        let whole = abs / scale;
        let frac = abs % scale;
        if frac == 0 {
            return write!(f, "{sign}{whole}");
        }
        let frac = format!("{frac:08}");
        write!(f, "{sign}{whole}.{}", frac.trim_end_matches('0'))
    }
}

impl Serialize for Amount {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Amount {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentState {
    Pending,
    Paid,
}

/// A bot user as far as distribution and payments are concerned.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub user_id: String,
    pub full_name: String,
    /// Trace id the user is expected to pay the subscription with.
    pub trace_id: String,
    pub state: PaymentState,
    pub active_at: Timestamp,
    /// `None` when the user is not subscribed.
    pub subscribed_at: Option<Timestamp>,
    /// Device sessions the bus expects deliveries to be checksummed against.
    #[serde(default)]
    pub sessions: Vec<String>,
}

impl User {
    pub fn is_paid(&self) -> bool {
        self.state == PaymentState::Paid
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageState {
    Pending,
    Success,
}

/// Authored content waiting to be fanned out.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub message_id: String,
    pub user_id: String,
    pub category: String,
    /// Original message quoted by this one, empty when none.
    #[serde(default)]
    pub quote_message_id: String,
    /// Base64 payload as received from the bus.
    pub data: String,
    pub state: MessageState,
    pub last_distribute_at: Timestamp,
    /// Subscriber id breaking ties at `last_distribute_at`.
    #[serde(default)]
    pub last_distribute_user: String,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

/// Body of a `MESSAGE_RECALL` message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Recall {
    pub message_id: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeliveryStatus {
    Sent,
    Delivered,
}

/// One delivery record per (message, recipient).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DistributedMessage {
    pub message_id: String,
    pub conversation_id: String,
    pub recipient_id: String,
    /// Author of the original message.
    pub user_id: String,
    pub parent_id: String,
    /// Quoted message as the recipient knows it.
    #[serde(default)]
    pub quote_message_id: String,
    pub shard: String,
    pub category: String,
    pub data: String,
    pub status: DeliveryStatus,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PacketState {
    Initial,
    Paid,
    Expired,
    Refunded,
}

impl fmt::Display for PacketState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PacketState::Initial => "INITIAL",
            PacketState::Paid => "PAID",
            PacketState::Expired => "EXPIRED",
            PacketState::Refunded => "REFUNDED",
        };
        f.write_str(s)
    }
}

/// Red packet.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Packet {
    pub packet_id: String,
    pub user_id: String,
    pub asset_id: String,
    pub amount: Amount,
    pub greeting: String,
    pub total_count: u32,
    pub remaining_count: u32,
    pub remaining_amount: Amount,
    pub state: PacketState,
    pub created_at: Timestamp,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Participant {
    pub packet_id: String,
    pub user_id: String,
    pub amount: Amount,
    pub created_at: Timestamp,
    pub paid_at: Option<Timestamp>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Reward {
    /// Trace id of the transfer that funded the reward.
    pub reward_id: String,
    pub user_id: String,
    pub recipient_id: String,
    pub asset_id: String,
    pub amount: Amount,
    pub created_at: Timestamp,
    pub paid_at: Option<Timestamp>,
}

/// Bot-side view of an asset balance, used to validate packet creation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AssetBalance {
    pub asset_id: String,
    pub balance: Amount,
}
