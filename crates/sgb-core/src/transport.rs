//! Reconnect loop over the configured bus hosts.

use std::{
    future::Future,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use tokio_util::sync::CancellationToken;

use crate::{
    errors::Error,
    ports::{BusConnection, BusConnector},
    Result,
};

pub struct Transport {
    hosts: Vec<String>,
    connector: Arc<dyn BusConnector>,
    retries: AtomicU64,
    reconnect_delay: Duration,
}

impl Transport {
    pub fn new(
        hosts: Vec<String>,
        connector: Arc<dyn BusConnector>,
        reconnect_delay: Duration,
    ) -> Result<Self> {
        if hosts.is_empty() {
            return Err(Error::Config("no bus hosts configured".to_string()));
        }
        Ok(Self {
            hosts,
            connector,
            retries: AtomicU64::new(0),
            reconnect_delay,
        })
    }

    /// Host for the next attempt: round-robin on the failure counter.
    pub fn next_host(&self) -> &str {
        let n = self.hosts.len() as u64;
        let i = self.retries.load(Ordering::Relaxed) % n;
        &self.hosts[i as usize]
    }

    pub fn retries(&self) -> u64 {
        self.retries.load(Ordering::Relaxed)
    }

    /// Connect, hand the connection to `session`, and reconnect after it ends,
    /// until `shutdown` fires. A failed connect or a session error moves on to
    /// the next host.
    pub async fn run<F, Fut>(&self, shutdown: CancellationToken, mut session: F)
    where
        F: FnMut(BusConnection) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        while !shutdown.is_cancelled() {
            let host = self.next_host().to_string();
            match self.connector.connect(&host).await {
                Ok(conn) => {
                    tracing::info!(%host, "bus connected");
                    let done = conn.done.clone();
                    let outcome = session(conn).await;
                    done.cancel();
                    match outcome {
                        Ok(()) => tracing::info!(%host, "bus session ended"),
                        Err(e) => {
                            tracing::warn!(%host, error = %e, "bus session failed");
                            self.retries.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }
                Err(e) => {
                    tracing::error!(%host, error = %e, "bus connect failed");
                    self.retries.fetch_add(1, Ordering::Relaxed);
                }
            }

            tokio::select! {
              _ = shutdown.cancelled() => break,
              _ = tokio::time::sleep(self.reconnect_delay) => {}
            }
        }
    }
}
