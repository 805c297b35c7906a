//! Deterministic identifiers.
//!
//! Every derived id is an MD5 digest re-stamped as a version-3 UUID, so the
//! same inputs always land on the same row and retries stay idempotent.

use uuid::Uuid;

fn stamp_v3(mut sum: [u8; 16]) -> String {
    sum[6] = (sum[6] & 0x0f) | 0x30;
    sum[8] = (sum[8] & 0x3f) | 0x80;
    Uuid::from_bytes(sum).to_string()
}

fn digest_parts(parts: &[&[u8]]) -> [u8; 16] {
    let mut ctx = md5::Context::new();
    for part in parts {
        ctx.consume(part);
    }
    ctx.compute().0
}

fn ordered<'a>(a: &'a str, b: &'a str) -> (&'a str, &'a str) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

/// Id of the direct conversation between two users (order-independent).
pub fn unique_conversation_id(a: &str, b: &str) -> String {
    let (lo, hi) = ordered(a, b);
    stamp_v3(digest_parts(&[lo.as_bytes(), hi.as_bytes()]))
}

/// Id of the copy of `message_id` delivered to `recipient_id`.
pub fn distributed_message_id(recipient_id: &str, message_id: &str) -> String {
    unique_conversation_id(recipient_id, message_id)
}

/// Minimal big-endian encoding; zero encodes to no bytes at all.
fn minimal_be_bytes(index: u64) -> Vec<u8> {
    let bytes = index.to_be_bytes();
    let skip = bytes.iter().take_while(|b| **b == 0).count();
    bytes[skip..].to_vec()
}

/// Shard identifier for `index` under `modifier`.
pub fn shard_id(modifier: &str, index: u64) -> String {
    let index = minimal_be_bytes(index);
    stamp_v3(digest_parts(&[modifier.as_bytes(), index.as_slice()]))
}

/// All shard ids of a deployment, in index order.
pub fn shard_ids(modifier: &str, size: u64) -> Vec<String> {
    (0..size).map(|i| shard_id(modifier, i)).collect()
}

/// Index of the shard a recipient's deliveries land in.
///
/// Keyed hash of the conversation and recipient rather than plain modulo of the
/// recipient id, so a skewed id space does not produce hot shards.
pub fn recipient_shard_index(conversation_id: &str, recipient_id: &str, size: u64) -> u64 {
    let (lo, hi) = ordered(conversation_id, recipient_id);
    let n = u128::from_be_bytes(digest_parts(&[lo.as_bytes(), hi.as_bytes()]));
    (n % u128::from(size.max(1))) as u64
}

pub fn recipient_shard(
    modifier: &str,
    size: u64,
    conversation_id: &str,
    recipient_id: &str,
) -> String {
    shard_id(
        modifier,
        recipient_shard_index(conversation_id, recipient_id, size),
    )
}

pub fn refund_trace_id(packet_id: &str) -> String {
    stamp_v3(digest_parts(&[packet_id.as_bytes(), b"REFUND"]))
}

pub fn participant_trace_id(packet_id: &str, user_id: &str) -> String {
    unique_conversation_id(packet_id, user_id)
}

pub fn reward_trace_id(reward_id: &str) -> String {
    stamp_v3(digest_parts(&[reward_id.as_bytes(), b"REWARD"]))
}

/// Hex digest of a recipient's session set; order of the input does not matter.
/// Empty when the recipient has no sessions.
pub fn session_checksum<S: AsRef<str>>(session_ids: &[S]) -> String {
    if session_ids.is_empty() {
        return String::new();
    }
    let mut ids = session_ids.iter().map(|s| s.as_ref()).collect::<Vec<_>>();
    ids.sort_unstable();
    let mut ctx = md5::Context::new();
    for id in ids {
        ctx.consume(id.as_bytes());
    }
    format!("{:x}", ctx.compute())
}
