//! Connection-independent payout loops: claimed packet shares, expired packet
//! refunds and rewards.

use std::{future::Future, sync::Arc, time::Duration};

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::{
    announce::reward_message,
    config::Config,
    digest,
    domain::{Amount, Reward, Timestamp},
    packet::{PacketEngine, EXPIRY_HOURS},
    ports::{TransferPort, TransferRequest},
    store::Store,
    Result,
};

/// Rows taken per pass; a full page that went through is followed by an
/// immediate re-poll.
pub const PAYOUT_PAGE: usize = 100;

/// Packets are swept an hour after they could have expired.
const REFUND_GRACE_HOURS: i64 = EXPIRY_HOURS + 1;

/// Record a reward paid in for `recipient_id`, announced to the group in the
/// same transaction. Idempotent on `reward_id`; non-positive amounts and
/// unknown payers or recipients are ignored. Returns whether a row was created.
pub async fn record_reward(
    cfg: &Config,
    store: &dyn Store,
    reward_id: &str,
    payer_id: &str,
    recipient_id: &str,
    asset_id: &str,
    amount: Amount,
) -> Result<bool> {
    if amount <= Amount::ZERO {
        return Ok(false);
    }
    let (Some(payer), Some(recipient)) = (
        store.find_user(payer_id).await?,
        store.find_user(recipient_id).await?,
    ) else {
        tracing::debug!(reward_id, payer_id, recipient_id, "reward between unknown users");
        return Ok(false);
    };
    let announcement = reward_message(cfg, &payer, &recipient, amount)?;
    store
        .insert_reward(
            Reward {
                reward_id: reward_id.to_string(),
                user_id: payer_id.to_string(),
                recipient_id: recipient_id.to_string(),
                asset_id: asset_id.to_string(),
                amount,
                created_at: Utc::now(),
                paid_at: None,
            },
            Some(announcement),
        )
        .await
}

/// Outcome of one payout pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Sweep {
    pub taken: usize,
    pub failed: usize,
}

impl Sweep {
    /// A full page went through, so more rows may be waiting. Failed rows
    /// stay first in line and are only retried after the backoff.
    fn more_waiting(&self) -> bool {
        self.taken >= PAYOUT_PAGE && self.failed == 0
    }
}

#[derive(Clone)]
pub struct Payouts {
    store: Arc<dyn Store>,
    transfers: Arc<dyn TransferPort>,
    packets: PacketEngine,
    backoff: Duration,
}

impl Payouts {
    pub fn new(
        store: Arc<dyn Store>,
        transfers: Arc<dyn TransferPort>,
        packets: PacketEngine,
        backoff: Duration,
    ) -> Self {
        Self {
            store,
            transfers,
            packets,
            backoff,
        }
    }

    pub async fn pay_participants_once(&self) -> Result<Sweep> {
        let participants = self.store.pending_participants(PAYOUT_PAGE).await?;
        let mut sweep = Sweep {
            taken: participants.len(),
            failed: 0,
        };
        for p in &participants {
            if let Err(e) = self.packets.pay_participant(p).await {
                tracing::error!(packet_id = %p.packet_id, user_id = %p.user_id, error = %e, "participant payout failed");
                sweep.failed += 1;
            }
        }
        Ok(sweep)
    }

    pub async fn refund_expired_once(&self, now: Timestamp) -> Result<Sweep> {
        let created_before = now - chrono::Duration::hours(REFUND_GRACE_HOURS);
        let ids = self
            .store
            .expired_packet_ids(created_before, PAYOUT_PAGE)
            .await?;
        let mut sweep = Sweep {
            taken: ids.len(),
            failed: 0,
        };
        for id in &ids {
            match self.packets.refund(id).await {
                Ok(Some(p)) => tracing::info!(packet_id = %id, state = %p.state, "packet swept"),
                Ok(None) => {}
                Err(e) => {
                    tracing::error!(packet_id = %id, error = %e, "packet refund failed");
                    sweep.failed += 1;
                }
            }
        }
        Ok(sweep)
    }

    pub async fn pay_rewards_once(&self) -> Result<Sweep> {
        let rewards = self.store.pending_rewards(PAYOUT_PAGE).await?;
        let mut sweep = Sweep {
            taken: rewards.len(),
            failed: 0,
        };
        for r in &rewards {
            if let Err(e) = self.pay_reward(r).await {
                tracing::error!(reward_id = %r.reward_id, error = %e, "reward payout failed");
                sweep.failed += 1;
            }
        }
        Ok(sweep)
    }

    async fn pay_reward(&self, reward: &Reward) -> Result<()> {
        self.transfers
            .transfer(&TransferRequest {
                asset_id: reward.asset_id.clone(),
                recipient_id: reward.recipient_id.clone(),
                amount: reward.amount,
                trace_id: digest::reward_trace_id(&reward.reward_id),
                memo: String::new(),
            })
            .await?;
        self.store.mark_reward_paid(&reward.reward_id, Utc::now()).await
    }

    /// Spawn the three payout loops; each stops when `done` fires.
    pub fn spawn(self, done: &CancellationToken) -> Vec<tokio::task::JoinHandle<()>> {
        let backoff = self.backoff;
        let participants = self.clone();
        let refunds = self.clone();
        let rewards = self;
        vec![
            tokio::spawn(run_loop("participants", backoff, done.clone(), move || {
                let w = participants.clone();
                async move { w.pay_participants_once().await }
            })),
            tokio::spawn(run_loop("refunds", backoff, done.clone(), move || {
                let w = refunds.clone();
                async move { w.refund_expired_once(Utc::now()).await }
            })),
            tokio::spawn(run_loop("rewards", backoff, done.clone(), move || {
                let w = rewards.clone();
                async move { w.pay_rewards_once().await }
            })),
        ]
    }
}

async fn run_loop<F, Fut>(worker: &'static str, backoff: Duration, done: CancellationToken, mut pass: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Sweep>>,
{
    tracing::info!(worker, "payout worker started");
    loop {
        let pause = match pass().await {
            Ok(sweep) if sweep.more_waiting() => Duration::ZERO,
            Ok(sweep) => {
                if sweep.failed > 0 {
                    tracing::warn!(worker, failed = sweep.failed, taken = sweep.taken, "payout pass incomplete, backing off");
                }
                backoff
            }
            Err(e) => {
                tracing::error!(worker, error = %e, "payout pass failed");
                backoff
            }
        };
        tokio::select! {
          _ = done.cancelled() => break,
          _ = tokio::time::sleep(pause) => {}
        }
    }
    tracing::info!(worker, "payout worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        domain::{Packet, PacketState},
        store::MemoryStore,
        testing::{member, RecordingTransfers, BOT},
    };

    struct Fixture {
        cfg: Config,
        payouts: Payouts,
        packets: PacketEngine,
        store: Arc<MemoryStore>,
        transfers: Arc<RecordingTransfers>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let transfers = Arc::new(RecordingTransfers::default());
        let packets = PacketEngine::new(
            Arc::new(Config::new(BOT, "token")),
            store.clone(),
            transfers.clone(),
        );
        let payouts = Payouts::new(
            store.clone(),
            transfers.clone(),
            packets.clone(),
            Duration::from_millis(10),
        );
        Fixture {
            cfg: Config::new(BOT, "token"),
            payouts,
            packets,
            store,
            transfers,
        }
    }

    fn amt(s: &str) -> Amount {
        s.parse().unwrap()
    }

    fn packet(id: &str, state: PacketState, age_hours: i64) -> Packet {
        Packet {
            packet_id: id.to_string(),
            user_id: "creator".to_string(),
            asset_id: "asset".to_string(),
            amount: amt("2"),
            greeting: String::new(),
            total_count: 4,
            remaining_count: 3,
            remaining_amount: amt("1.5"),
            state,
            created_at: Utc::now() - chrono::Duration::hours(age_hours),
        }
    }

    async fn reward(f: &Fixture, id: &str, amount: Amount) -> bool {
        record_reward(&f.cfg, f.store.as_ref(), id, "payer", "rcpt", "asset", amount)
            .await
            .unwrap()
    }

    async fn with_reward_users(f: &Fixture) {
        f.store.upsert_user(member("payer")).await.unwrap();
        f.store.upsert_user(member("rcpt")).await.unwrap();
    }

    #[tokio::test]
    async fn rewards_are_idempotent_and_positive() {
        let f = fixture();
        with_reward_users(&f).await;
        assert!(reward(&f, "r1", amt("0.5")).await);
        assert!(!reward(&f, "r1", amt("0.5")).await);
        assert!(!reward(&f, "r2", Amount::ZERO).await);

        let sweep = f.payouts.pay_rewards_once().await.unwrap();
        assert_eq!(sweep, Sweep { taken: 1, failed: 0 });
        let sent = f.transfers.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].recipient_id, "rcpt");
        assert_eq!(sent[0].trace_id, digest::reward_trace_id("r1"));
        assert_eq!(f.payouts.pay_rewards_once().await.unwrap().taken, 0);
    }

    #[tokio::test]
    async fn rewards_need_both_users_and_are_announced_once() {
        let f = fixture();
        f.store.upsert_user(member("payer")).await.unwrap();
        assert!(!reward(&f, "r1", amt("1")).await);
        assert!(f.store.pending_rewards(10).await.unwrap().is_empty());
        assert!(f.store.pending_messages(10).await.unwrap().is_empty());

        f.store.upsert_user(member("rcpt")).await.unwrap();
        assert!(reward(&f, "r1", amt("1")).await);
        assert!(!reward(&f, "r1", amt("1")).await);
        let announced = f.store.pending_messages(10).await.unwrap();
        assert_eq!(announced.len(), 1);
        assert_eq!(announced[0].user_id, BOT);
        assert_eq!(announced[0].category, crate::domain::category::APP_BUTTON_GROUP);
    }

    #[tokio::test]
    async fn failed_reward_stays_pending() {
        let f = fixture();
        with_reward_users(&f).await;
        reward(&f, "r1", amt("1")).await;
        f.transfers.set_failing(true);
        let sweep = f.payouts.pay_rewards_once().await.unwrap();
        assert_eq!(sweep, Sweep { taken: 1, failed: 1 });
        assert_eq!(f.store.pending_rewards(10).await.unwrap().len(), 1);

        f.transfers.set_failing(false);
        f.payouts.pay_rewards_once().await.unwrap();
        assert!(f.store.pending_rewards(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn failing_full_page_waits_for_the_backoff() {
        let f = fixture();
        with_reward_users(&f).await;
        for i in 0..PAYOUT_PAGE + 20 {
            reward(&f, &format!("r{i}"), amt("1")).await;
        }
        f.transfers.set_failing(true);
        let payouts = Payouts::new(
            f.store.clone(),
            f.transfers.clone(),
            f.packets.clone(),
            Duration::from_secs(10),
        );

        let done = CancellationToken::new();
        let handles = payouts.spawn(&done);
        tokio::time::sleep(Duration::from_millis(200)).await;
        done.cancel();
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(f.transfers.attempts(), PAYOUT_PAGE);
        assert_eq!(f.store.pending_rewards(PAYOUT_PAGE * 2).await.unwrap().len(), PAYOUT_PAGE + 20);
    }

    #[tokio::test]
    async fn sweep_refunds_only_old_packets() {
        let f = fixture();
        f.store.insert_packet(packet("old", PacketState::Paid, 30)).await.unwrap();
        f.store.insert_packet(packet("young", PacketState::Paid, 2)).await.unwrap();
        f.store.insert_packet(packet("fresh", PacketState::Initial, 30)).await.unwrap();

        assert_eq!(f.payouts.refund_expired_once(Utc::now()).await.unwrap().taken, 1);
        let sent = f.transfers.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].trace_id, digest::refund_trace_id("old"));
        assert_eq!(sent[0].amount, amt("1.5"));

        let old = f.packets.show("old").await.unwrap().unwrap();
        assert_eq!(old.packet.state, PacketState::Refunded);
        let young = f.packets.show("young").await.unwrap().unwrap();
        assert_eq!(young.packet.state, PacketState::Paid);
    }

    #[tokio::test]
    async fn claimed_shares_are_paid_once() {
        let f = fixture();
        f.store.upsert_user(member("creator")).await.unwrap();
        f.store.insert_packet(packet("p", PacketState::Paid, 1)).await.unwrap();
        f.packets.claim(&member("a"), "p").await.unwrap();
        f.packets.claim(&member("b"), "p").await.unwrap();

        assert_eq!(f.payouts.pay_participants_once().await.unwrap(), Sweep { taken: 2, failed: 0 });
        assert_eq!(f.payouts.pay_participants_once().await.unwrap().taken, 0);
        let mut traces = f.transfers.sent().into_iter().map(|t| t.trace_id).collect::<Vec<_>>();
        traces.sort();
        let mut expected = vec![
            digest::participant_trace_id("p", "a"),
            digest::participant_trace_id("p", "b"),
        ];
        expected.sort();
        assert_eq!(traces, expected);
    }

    #[tokio::test]
    async fn spawned_workers_stop_on_cancel() {
        let f = fixture();
        let done = CancellationToken::new();
        let handles = f.payouts.clone().spawn(&done);
        done.cancel();
        for h in handles {
            h.await.unwrap();
        }
    }
}
