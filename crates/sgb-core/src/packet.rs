//! Red packet state machine: `INITIAL -> PAID -> {EXPIRED | REFUNDED}`.
//!
//! Every transition that reads the packet first re-runs the expiry check inside
//! the same store transaction, so a claim can never race an expiry.

use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::Utc;
use rand::Rng;
use serde_json::json;
use uuid::Uuid;

use crate::{
    announce::system_message,
    config::Config,
    digest,
    distribution::build_row,
    domain::{
        category, Amount, AssetBalance, DistributedMessage, Message, Packet, PacketState,
        Participant, Timestamp, User,
    },
    errors::Error,
    ports::{TransferPort, TransferRequest},
    store::{PacketLedger, Store},
    Result,
};

/// Smallest packet that can be created (0.0001).
pub const MIN_AMOUNT: Amount = Amount::from_units(10_000);
pub const GREETING_LIMIT: usize = 36;
/// Upper bound on claim slots regardless of subscriber count.
pub const PACKET_SIZE_LIMIT: u64 = 500;
pub const EXPIRY_HOURS: i64 = 24;

/// Below this the claimant takes everything that is left (0.000001).
const SPLIT_THRESHOLD: Amount = Amount::from_units(100);
/// Random draws before falling back to the smallest unit.
const SPLIT_DRAWS: usize = 16;

const CARD_ICON_URL: &str = "https://images.mixin.one/X44V48LK9oEBT3izRGKqdVSPfiH5DtYTzzF0ch5nP-f7tO4v0BTTqVhFEHqd52qUeuVas-BSkLH1ckxEI51-jXmF=s256";

/// Move a PAID packet to REFUNDED when nothing is left, or to EXPIRED once it
/// is older than the expiry window. Returns whether the state changed.
pub fn check_expiration(packet: &mut Packet, now: Timestamp) -> bool {
    if packet.state != PacketState::Paid {
        return false;
    }
    if packet.remaining_count == 0 || packet.remaining_amount.is_exhausted() {
        packet.state = PacketState::Refunded;
    } else if packet.created_at < now - chrono::Duration::hours(EXPIRY_HOURS) {
        packet.state = PacketState::Expired;
    }
    packet.state != PacketState::Paid
}

/// Amount the next claimant receives.
///
/// The last slot, or a remainder at or below the split threshold, takes
/// everything. Otherwise a uniform fraction of twice the fair share is floored
/// at the coarsest precision that keeps it non-zero. Draws are bounded; if all
/// of them floor to zero the claimant gets one unit.
pub fn split_claim<R: Rng>(packet: &Packet, rng: &mut R) -> Amount {
    let remaining = packet.remaining_amount;
    if remaining.is_exhausted() {
        return Amount::ZERO;
    }
    if packet.remaining_count <= 1 || remaining <= SPLIT_THRESHOLD {
        return remaining;
    }

    let smallest = Amount::from_units(1);
    let fair = Amount::from_units(remaining.units() * 2 / i64::from(packet.remaining_count));
    if fair <= SPLIT_THRESHOLD {
        return fair.max(smallest).min(remaining);
    }

    for _ in 0..SPLIT_DRAWS {
        let scaled = Amount::from_units((fair.units() as f64 * rng.gen::<f64>()) as i64);
        for decimals in 1..=Amount::DECIMALS {
            let floored = scaled.floor_to(decimals);
            if !floored.is_exhausted() {
                return floored.min(remaining);
            }
        }
    }
    smallest
}

/// Claim inside an open packet transaction. Returns the claimed amount, or
/// `None` when the packet is not claimable or the user already claimed.
pub fn apply_claim<R: Rng>(
    ledger: &mut PacketLedger,
    user_id: &str,
    now: Timestamp,
    rng: &mut R,
) -> Option<Amount> {
    check_expiration(&mut ledger.packet, now);
    if ledger.packet.state != PacketState::Paid || ledger.has_participant(user_id) {
        return None;
    }

    let amount = split_claim(&ledger.packet, rng);
    ledger.packet.remaining_count -= 1;
    ledger.packet.remaining_amount -= amount;
    ledger.participants.push(Participant {
        packet_id: ledger.packet.packet_id.clone(),
        user_id: user_id.to_string(),
        amount,
        created_at: now,
        paid_at: None,
    });
    Some(amount)
}

/// `template` with `{name}` filled in, shortening long names so the result
/// stays readable in memos and cards.
pub fn packet_description(cfg: &Config, full_name: &str) -> String {
    let t = &cfg.templates;
    if full_name.trim().is_empty() {
        return t.red_packet_short_desc.clone();
    }
    let desc = t.red_packet_desc.replace("{name}", full_name);
    if desc.chars().count() <= 100 {
        return desc;
    }
    let short = full_name.chars().take(16).collect::<String>();
    t.red_packet_desc.replace("{name}", &short)
}

#[derive(Clone)]
pub struct PacketEngine {
    cfg: Arc<Config>,
    store: Arc<dyn Store>,
    transfers: Arc<dyn TransferPort>,
}

impl PacketEngine {
    pub fn new(cfg: Arc<Config>, store: Arc<dyn Store>, transfers: Arc<dyn TransferPort>) -> Self {
        Self {
            cfg,
            store,
            transfers,
        }
    }

    /// Validate and persist a new INITIAL packet funded from `asset`.
    pub async fn create(
        &self,
        creator: &User,
        asset: &AssetBalance,
        amount: Amount,
        total_count: u32,
        greeting: &str,
    ) -> Result<Packet> {
        if amount < MIN_AMOUNT {
            return Err(Error::BadData(format!(
                "amount {amount} is below the minimum {MIN_AMOUNT}"
            )));
        }
        if greeting.chars().count() > GREETING_LIMIT {
            return Err(Error::BadData(format!(
                "greeting exceeds {GREETING_LIMIT} characters"
            )));
        }
        let amount = amount.floor_to(Amount::DECIMALS);
        if asset.balance < amount {
            return Err(Error::InsufficientBalance);
        }

        let slots = self.store.subscribers_count().await?.min(PACKET_SIZE_LIMIT);
        if total_count == 0 || u64::from(total_count) > slots {
            return Err(Error::BadData(format!(
                "total count must be between 1 and {slots}"
            )));
        }

        let packet = Packet {
            packet_id: Uuid::new_v4().to_string(),
            user_id: creator.user_id.clone(),
            asset_id: asset.asset_id.clone(),
            amount,
            greeting: greeting.to_string(),
            total_count,
            remaining_count: total_count,
            remaining_amount: amount,
            state: PacketState::Initial,
            created_at: Utc::now(),
        };
        self.store.insert_packet(packet.clone()).await?;
        tracing::info!(packet_id = %packet.packet_id, %amount, total_count, "packet created");
        Ok(packet)
    }

    /// INITIAL -> PAID when the payment covers the committed asset and amount.
    /// Anything else is a no-op, so duplicate or partial notifications are safe.
    pub async fn pay(&self, packet_id: &str, asset_id: &str, amount: Amount) -> Result<Option<Packet>> {
        let now = Utc::now();
        let ledger = self
            .store
            .packet_tx(packet_id, &mut |l: &mut PacketLedger| -> Result<()> {
                let p = &mut l.packet;
                if p.state != PacketState::Initial || p.asset_id != asset_id || amount < p.amount {
                    return Ok(());
                }
                p.state = PacketState::Paid;
                check_expiration(p, now);
                Ok(())
            })
            .await?;
        Ok(ledger.map(|l| l.packet))
    }

    /// Read a packet with its claims, applying any due expiry.
    pub async fn show(&self, packet_id: &str) -> Result<Option<PacketLedger>> {
        let now = Utc::now();
        self.store
            .packet_tx(packet_id, &mut |l: &mut PacketLedger| -> Result<()> {
                check_expiration(&mut l.packet, now);
                Ok(())
            })
            .await
    }

    /// Claim a share for `user`. Only paid members may claim; a repeat claim
    /// returns the ledger unchanged.
    pub async fn claim(&self, user: &User, packet_id: &str) -> Result<Option<PacketLedger>> {
        if !user.is_paid() {
            return Err(Error::Forbidden);
        }
        let now = Utc::now();
        let cfg = &self.cfg;
        let mut claimed = None;
        let ledger = self
            .store
            .packet_tx(packet_id, &mut |l: &mut PacketLedger| -> Result<()> {
                let mut rng = rand::thread_rng();
                claimed = apply_claim(l, &user.user_id, now, &mut rng);
                if claimed.is_some() {
                    l.outbox.push(claim_notice(cfg, &l.packet.user_id, &user.full_name));
                }
                Ok(())
            })
            .await?;
        if let Some(amount) = claimed {
            tracing::info!(packet_id, user_id = %user.user_id, %amount, "packet claimed");
        }
        Ok(ledger)
    }

    /// Send what is left of an EXPIRED packet back to its creator, then mark it
    /// REFUNDED. The transfer trace is derived from the packet id, so a retry
    /// after a crash between the two steps does not pay twice.
    pub async fn refund(&self, packet_id: &str) -> Result<Option<Packet>> {
        let Some(ledger) = self.show(packet_id).await? else {
            return Ok(None);
        };
        let packet = ledger.packet;
        if packet.state != PacketState::Expired {
            return Ok(Some(packet));
        }

        if !packet.remaining_amount.is_exhausted() {
            self.transfers
                .transfer(&TransferRequest {
                    asset_id: packet.asset_id.clone(),
                    recipient_id: packet.user_id.clone(),
                    amount: packet.remaining_amount,
                    trace_id: digest::refund_trace_id(&packet.packet_id),
                    memo: String::new(),
                })
                .await?;
        }

        let now = Utc::now();
        let ledger = self
            .store
            .packet_tx(packet_id, &mut |l: &mut PacketLedger| -> Result<()> {
                check_expiration(&mut l.packet, now);
                if l.packet.state == PacketState::Expired {
                    l.packet.state = PacketState::Refunded;
                }
                Ok(())
            })
            .await?;
        Ok(ledger.map(|l| l.packet))
    }

    /// Pay one claimed share and stamp it paid.
    pub async fn pay_participant(&self, participant: &Participant) -> Result<()> {
        let Some(ledger) = self.show(&participant.packet_id).await? else {
            tracing::warn!(packet_id = %participant.packet_id, "participant of a missing packet");
            return self
                .store
                .mark_participant_paid(&participant.packet_id, &participant.user_id, Utc::now())
                .await;
        };

        if !participant.amount.is_exhausted() {
            let creator_name = self
                .store
                .find_user(&ledger.packet.user_id)
                .await?
                .map(|u| u.full_name)
                .unwrap_or_default();
            self.transfers
                .transfer(&TransferRequest {
                    asset_id: ledger.packet.asset_id.clone(),
                    recipient_id: participant.user_id.clone(),
                    amount: participant.amount,
                    trace_id: digest::participant_trace_id(
                        &participant.packet_id,
                        &participant.user_id,
                    ),
                    memo: packet_description(&self.cfg, &creator_name),
                })
                .await?;
        }

        self.store
            .mark_participant_paid(&participant.packet_id, &participant.user_id, Utc::now())
            .await
    }

    /// Bot-authored card announcing a paid packet; its id is the packet id, so
    /// it is created at most once.
    pub fn app_card(&self, packet: &Packet, creator_name: &str) -> Result<Message> {
        let card = json!({
            "icon_url": CARD_ICON_URL,
            "title": self.cfg.templates.red_packet,
            "description": packet_description(&self.cfg, creator_name),
            "action": format!("{}/#/packets/{}", self.cfg.http_resource_host, packet.packet_id),
        });
        Ok(system_message(
            &self.cfg,
            packet.packet_id.clone(),
            category::APP_CARD,
            STANDARD.encode(serde_json::to_vec(&card)?),
        ))
    }
}

fn claim_notice(cfg: &Config, creator_id: &str, claimant_name: &str) -> DistributedMessage {
    let text = cfg.templates.red_packet_opened.replace("{name}", claimant_name);
    build_row(
        cfg,
        &Uuid::new_v4().to_string(),
        &Uuid::new_v4().to_string(),
        &cfg.client_id,
        creator_id,
        category::PLAIN_TEXT,
        &STANDARD.encode(text.as_bytes()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        domain::{DeliveryStatus, PaymentState},
        store::MemoryStore,
        testing::{member, RecordingTransfers},
    };
    use rand::{rngs::StdRng, SeedableRng};

    fn amt(s: &str) -> Amount {
        s.parse().unwrap()
    }

    fn paid_packet(amount: &str, count: u32, created_at: Timestamp) -> Packet {
        Packet {
            packet_id: "packet".to_string(),
            user_id: "creator".to_string(),
            asset_id: "asset".to_string(),
            amount: amt(amount),
            greeting: String::new(),
            total_count: count,
            remaining_count: count,
            remaining_amount: amt(amount),
            state: PacketState::Paid,
            created_at,
        }
    }

    struct Fixture {
        engine: PacketEngine,
        store: Arc<MemoryStore>,
        transfers: Arc<RecordingTransfers>,
    }

    async fn fixture(subscribers: usize) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        store.upsert_user(member("creator")).await.unwrap();
        for i in 0..subscribers {
            store.upsert_user(member(&format!("sub-{i}"))).await.unwrap();
        }
        let transfers = Arc::new(RecordingTransfers::default());
        let engine = PacketEngine::new(
            Arc::new(Config::new("bot-id", "token")),
            store.clone(),
            transfers.clone(),
        );
        Fixture {
            engine,
            store,
            transfers,
        }
    }

    fn balance(amount: &str) -> AssetBalance {
        AssetBalance {
            asset_id: "asset".to_string(),
            balance: amt(amount),
        }
    }

    #[test]
    fn expiry_boundary_is_strict() {
        let now = Utc::now();
        let mut at_boundary = paid_packet("1", 2, now - chrono::Duration::hours(24));
        assert!(!check_expiration(&mut at_boundary, now));
        assert_eq!(at_boundary.state, PacketState::Paid);

        let mut past = paid_packet(
            "1",
            2,
            now - chrono::Duration::hours(24) - chrono::Duration::seconds(1),
        );
        assert!(check_expiration(&mut past, now));
        assert_eq!(past.state, PacketState::Expired);
    }

    #[test]
    fn exhausted_packets_refund_before_expiring() {
        let now = Utc::now();
        let mut p = paid_packet("1", 2, now - chrono::Duration::days(3));
        p.remaining_count = 0;
        check_expiration(&mut p, now);
        assert_eq!(p.state, PacketState::Refunded);

        let mut p = paid_packet("1", 2, now);
        p.remaining_amount = Amount::ZERO;
        check_expiration(&mut p, now);
        assert_eq!(p.state, PacketState::Refunded);

        let mut p = paid_packet("1", 2, now - chrono::Duration::days(3));
        p.state = PacketState::Initial;
        assert!(!check_expiration(&mut p, now));
    }

    #[test]
    fn claims_conserve_the_packet_amount() {
        let mut rng = StdRng::seed_from_u64(7);
        for seed_count in [2u32, 3, 10, 57] {
            let mut ledger = PacketLedger {
                packet: paid_packet("3.21", seed_count, Utc::now()),
                participants: Vec::new(),
                outbox: Vec::new(),
            };
            for i in 0..seed_count {
                let got = apply_claim(&mut ledger, &format!("u{i}"), Utc::now(), &mut rng)
                    .expect("claim should succeed");
                assert!(got > Amount::ZERO);
                assert!(ledger.packet.remaining_amount >= Amount::ZERO);
                let claimed: Amount = ledger.participants.iter().map(|p| p.amount).sum();
                assert_eq!(claimed + ledger.packet.remaining_amount, amt("3.21"));
            }
            assert_eq!(ledger.packet.remaining_count, 0);
            assert_eq!(ledger.packet.remaining_amount, Amount::ZERO);
        }
    }

    #[test]
    fn split_is_positive_for_tiny_remainders() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut p = paid_packet("0.00000101", 500, Utc::now());
        let got = split_claim(&p, &mut rng);
        assert!(got > Amount::ZERO && got <= p.remaining_amount);

        p.remaining_amount = Amount::from_units(1);
        assert_eq!(split_claim(&p, &mut rng), Amount::from_units(1));
    }

    #[test]
    fn repeat_claims_are_ignored() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut ledger = PacketLedger {
            packet: paid_packet("1", 3, Utc::now()),
            participants: Vec::new(),
            outbox: Vec::new(),
        };
        assert!(apply_claim(&mut ledger, "u", Utc::now(), &mut rng).is_some());
        assert!(apply_claim(&mut ledger, "u", Utc::now(), &mut rng).is_none());
        assert_eq!(ledger.participants.len(), 1);
        assert_eq!(ledger.packet.remaining_count, 2);
    }

    #[tokio::test]
    async fn create_validates_parameters() {
        let f = fixture(3).await;
        let creator = member("creator");

        let err = f
            .engine
            .create(&creator, &balance("10"), amt("0.00009"), 1, "hi")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::BadData(_)));

        let long = "x".repeat(GREETING_LIMIT + 1);
        let err = f
            .engine
            .create(&creator, &balance("10"), amt("1"), 1, &long)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::BadData(_)));

        let err = f
            .engine
            .create(&creator, &balance("0.5"), amt("1"), 1, "hi")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InsufficientBalance));

        // creator + 3 subscribers
        let err = f
            .engine
            .create(&creator, &balance("10"), amt("1"), 5, "hi")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::BadData(_)));
        let err = f
            .engine
            .create(&creator, &balance("10"), amt("1"), 0, "hi")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::BadData(_)));

        let greeting = "恭".repeat(GREETING_LIMIT);
        let packet = f
            .engine
            .create(&creator, &balance("10"), amt("1"), 4, &greeting)
            .await
            .unwrap();
        assert_eq!(packet.state, PacketState::Initial);
        assert_eq!(packet.remaining_count, 4);
    }

    #[tokio::test]
    async fn pay_requires_matching_asset_and_amount() {
        let f = fixture(2).await;
        let packet = f
            .engine
            .create(&member("creator"), &balance("10"), amt("1"), 2, "")
            .await
            .unwrap();
        let id = packet.packet_id.as_str();

        let p = f.engine.pay(id, "other", amt("1")).await.unwrap().unwrap();
        assert_eq!(p.state, PacketState::Initial);
        let p = f.engine.pay(id, "asset", amt("0.99")).await.unwrap().unwrap();
        assert_eq!(p.state, PacketState::Initial);
        let p = f.engine.pay(id, "asset", amt("1")).await.unwrap().unwrap();
        assert_eq!(p.state, PacketState::Paid);
        // duplicate notification
        let p = f.engine.pay(id, "asset", amt("1")).await.unwrap().unwrap();
        assert_eq!(p.state, PacketState::Paid);

        assert!(f.engine.pay("missing", "asset", amt("1")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn single_slot_packet_goes_to_first_claimant_then_refunds() {
        let f = fixture(1).await;
        let packet = f
            .engine
            .create(&member("creator"), &balance("10"), amt("1.0"), 1, "")
            .await
            .unwrap();
        f.engine
            .pay(&packet.packet_id, "asset", amt("1"))
            .await
            .unwrap();

        let ledger = f
            .engine
            .claim(&member("sub-0"), &packet.packet_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ledger.participants.len(), 1);
        assert_eq!(ledger.participants[0].amount, amt("1"));
        assert_eq!(ledger.packet.remaining_count, 0);
        // the claim leaves the creator a notice in the fan-out queue
        assert_eq!(ledger.outbox.len(), 1);
        assert_eq!(ledger.outbox[0].recipient_id, "creator");
        assert_eq!(ledger.outbox[0].status, DeliveryStatus::Sent);

        let shown = f.engine.show(&packet.packet_id).await.unwrap().unwrap();
        assert_eq!(shown.packet.state, PacketState::Refunded);
    }

    #[tokio::test]
    async fn unpaid_users_cannot_claim() {
        let f = fixture(1).await;
        let mut guest = member("guest");
        guest.state = PaymentState::Pending;
        let err = f.engine.claim(&guest, "anything").await.unwrap_err();
        assert!(matches!(err, Error::Forbidden));
    }

    #[tokio::test]
    async fn expired_packets_refund_the_remainder_once() {
        let f = fixture(0).await;
        let mut packet = paid_packet("2", 3, Utc::now() - chrono::Duration::hours(30));
        packet.remaining_amount = amt("1.25");
        packet.remaining_count = 2;
        f.store.insert_packet(packet).await.unwrap();

        let refunded = f.engine.refund("packet").await.unwrap().unwrap();
        assert_eq!(refunded.state, PacketState::Refunded);
        let sent = f.transfers.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].recipient_id, "creator");
        assert_eq!(sent[0].amount, amt("1.25"));
        assert_eq!(sent[0].trace_id, digest::refund_trace_id("packet"));

        // already refunded: nothing else goes out
        f.engine.refund("packet").await.unwrap();
        assert_eq!(f.transfers.sent().len(), 1);
    }

    #[tokio::test]
    async fn participant_payout_uses_deterministic_trace() {
        let f = fixture(1).await;
        f.store
            .insert_packet(paid_packet("1", 2, Utc::now()))
            .await
            .unwrap();
        f.engine.claim(&member("sub-0"), "packet").await.unwrap();

        let pending = f.store.pending_participants(10).await.unwrap();
        assert_eq!(pending.len(), 1);
        f.engine.pay_participant(&pending[0]).await.unwrap();

        let sent = f.transfers.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].trace_id, digest::participant_trace_id("packet", "sub-0"));
        assert_eq!(sent[0].memo, "Red packet from Member creator");
        assert!(f.store.pending_participants(10).await.unwrap().is_empty());
    }

    #[test]
    fn long_names_are_shortened_in_descriptions() {
        let cfg = Config::new("bot", "token");
        assert_eq!(packet_description(&cfg, "Ann"), "Red packet from Ann");
        assert_eq!(packet_description(&cfg, "  "), cfg.templates.red_packet_short_desc);
        let long = "n".repeat(120);
        assert_eq!(
            packet_description(&cfg, &long),
            format!("Red packet from {}", "n".repeat(16))
        );
    }
}
