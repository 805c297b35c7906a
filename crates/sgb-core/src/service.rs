//! Wires the engines together: connection-independent workers, and the
//! per-connection session (dispatcher, handshake, shard drains, acks, main
//! loop).

use std::{sync::Arc, time::Duration};

use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::{
    blaze::{client::ACK_BATCH_LIMIT, BlazeClient, Correlator},
    config::Config,
    digest,
    dispatcher::{ActivityTracker, Dispatcher, InboundEvent, USER_ACTIVE_PERIOD},
    distribution::{run_purge, FanOut, ShardDrain},
    errors::Error,
    inbound::Inbound,
    packet::PacketEngine,
    payouts::Payouts,
    ports::{BusConnection, BusConnector, TransferPort},
    store::Store,
    transport::Transport,
    Result,
};

/// How long the read loop waits for the main loop to take a message before
/// the connection is considered stuck.
pub const KEEP_ALIVE_PERIOD: Duration = Duration::from_secs(20);
const INBOX_CAPACITY: usize = 1024;
const ACK_QUEUE_CAPACITY: usize = 1024;

pub struct Service {
    cfg: Arc<Config>,
    store: Arc<dyn Store>,
    transfers: Arc<dyn TransferPort>,
    packets: PacketEngine,
    inbound: Inbound,
    activity: Arc<ActivityTracker>,
}

impl Service {
    pub fn new(cfg: Arc<Config>, store: Arc<dyn Store>, transfers: Arc<dyn TransferPort>) -> Self {
        let packets = PacketEngine::new(cfg.clone(), store.clone(), transfers.clone());
        let inbound = Inbound::new(cfg.clone(), store.clone(), packets.clone());
        Self {
            cfg,
            store,
            transfers,
            packets,
            inbound,
            activity: Arc::new(ActivityTracker::new(USER_ACTIVE_PERIOD)),
        }
    }

    /// Fan-out, purge and payout loops. They outlive connections and stop on
    /// `shutdown`.
    pub fn spawn_workers(&self, shutdown: &CancellationToken) -> Vec<JoinHandle<()>> {
        let mut handles = vec![
            tokio::spawn(FanOut::new(self.cfg.clone(), self.store.clone()).run(shutdown.clone())),
            tokio::spawn(run_purge(
                self.store.clone(),
                self.cfg.worker_backoff,
                shutdown.clone(),
            )),
        ];
        handles.extend(
            Payouts::new(
                self.store.clone(),
                self.transfers.clone(),
                self.packets.clone(),
                self.cfg.worker_backoff,
            )
            .spawn(shutdown),
        );
        handles
    }

    /// Keep a bus session alive until `shutdown` fires.
    pub async fn run(&self, connector: Arc<dyn BusConnector>, shutdown: CancellationToken) -> Result<()> {
        let transport = Transport::new(
            self.cfg.blaze_hosts.clone(),
            connector,
            self.cfg.reconnect_delay,
        )?;
        transport
            .run(shutdown.clone(), move |conn| {
                self.run_session(conn, shutdown.clone())
            })
            .await;
        Ok(())
    }

    /// One connection's lifetime. Returns `Ok` only on shutdown; any other end
    /// of the session is an error so the transport rotates hosts.
    pub async fn run_session(&self, conn: BusConnection, shutdown: CancellationToken) -> Result<()> {
        let BusConnection {
            inbound,
            outbound,
            done,
        } = conn;
        // Every loop below is bound to `done`; leaving this function stops them.
        let _stop = done.clone().drop_guard();
        tokio::spawn({
            let done = done.clone();
            let shutdown = shutdown.clone();
            async move {
                tokio::select! {
                  _ = shutdown.cancelled() => done.cancel(),
                  _ = done.cancelled() => {}
                }
            }
        });

        let correlator = Arc::new(Correlator::new());
        let client = BlazeClient::new(
            self.cfg.client_id.clone(),
            outbound,
            correlator.clone(),
            done.clone(),
            self.cfg.write_wait,
            self.cfg.reply_timeout,
        );
        let (inbox_tx, mut inbox) = mpsc::channel(INBOX_CAPACITY);
        let dispatcher = Dispatcher::new(
            self.cfg.client_id.clone(),
            self.store.clone(),
            correlator,
            self.activity.clone(),
            inbox_tx,
            KEEP_ALIVE_PERIOD,
        );
        tokio::spawn(dispatcher.run(inbound, done.clone()));

        // Anything queued bus-side while we were away comes back first.
        client.list_pending_messages().await?;

        for shard in digest::shard_ids(&self.cfg.shard_modifier, self.cfg.shard_size) {
            let drain = ShardDrain::new(&self.cfg, shard, self.store.clone(), client.clone());
            tokio::spawn(drain.run(done.clone()));
        }

        let (ack_tx, ack_rx) = mpsc::channel(ACK_QUEUE_CAPACITY);
        tokio::spawn(run_acks(client.clone(), ack_rx, done.clone()));

        loop {
            let event = tokio::select! {
              _ = done.cancelled() => break,
              ev = inbox.recv() => match ev {
                Some(ev) => ev,
                None => break,
              },
            };

            if let Err(e) = self.handle(&client, &event).await {
                if matches!(e, Error::Transport(_) | Error::DeliveryTimeout { .. }) {
                    return Err(e);
                }
                tracing::warn!(message_id = %event.view().message_id, error = %e, "inbound message failed");
            }

            let id = event.view().message_id.clone();
            tokio::select! {
              _ = done.cancelled() => break,
              sent = ack_tx.send(id) => if sent.is_err() { break },
            }
        }

        if shutdown.is_cancelled() {
            return Ok(());
        }
        Err(Error::Transport("bus connection closed".to_string()))
    }

    async fn handle(&self, client: &BlazeClient, event: &InboundEvent) -> Result<()> {
        match event {
            InboundEvent::Snapshot(view) => self.inbound.handle_transfer(view).await,
            InboundEvent::Conversation(view) => self.inbound.handle_message(client, view).await,
            InboundEvent::Ignored(_) => Ok(()),
        }
    }
}

/// Batch READ receipts, at most `ACK_BATCH_LIMIT` per request. A failed
/// request closes the connection; the bus redelivers unacknowledged messages
/// after the next handshake.
async fn run_acks(client: BlazeClient, mut rx: mpsc::Receiver<String>, done: CancellationToken) {
    loop {
        let first = tokio::select! {
          _ = done.cancelled() => return,
          id = rx.recv() => match id {
            Some(id) => id,
            None => return,
          },
        };
        let mut batch = vec![first];
        while batch.len() < ACK_BATCH_LIMIT {
            match rx.try_recv() {
                Ok(id) => batch.push(id),
                Err(_) => break,
            }
        }
        if let Err(e) = client.acknowledge(&batch).await {
            tracing::error!(count = batch.len(), error = %e, "acknowledge failed, closing connection");
            done.cancel();
            return;
        }
    }
}
