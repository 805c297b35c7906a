//! Websocket adapter for the Blaze bus.
//!
//! One connection = one read pump + one write pump. Either pump cancels the
//! connection's `done` token when it fails, which stops the other and every
//! core loop bound to the connection.

use std::{fmt::Display, time::Duration};

use async_trait::async_trait;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use sgb_core::{
    config::Config,
    errors::Error,
    ports::{BusConnection, BusConnector},
    Result,
};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{
    self,
    client::IntoClientRequest,
    http::{header, HeaderValue},
    Message,
};
use tokio_util::sync::CancellationToken;

pub const SUBPROTOCOL: &str = "Mixin-Blaze-1";
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(45);
const FRAME_BUFFER: usize = 1024;

#[derive(Clone, Debug)]
pub struct BlazeConnector {
    access_token: String,
    ping_period: Duration,
    pong_wait: Duration,
    write_wait: Duration,
}

impl BlazeConnector {
    pub fn new(cfg: &Config) -> Self {
        Self {
            access_token: cfg.access_token.clone(),
            ping_period: cfg.ping_period(),
            pong_wait: cfg.pong_wait,
            write_wait: cfg.write_wait,
        }
    }

    fn request(&self, host: &str) -> Result<tungstenite::handshake::client::Request> {
        let mut req = host
            .into_client_request()
            .map_err(|e| Error::Config(format!("bad bus host {host}: {e}")))?;
        let auth = HeaderValue::from_str(&format!("Bearer {}", self.access_token))
            .map_err(|e| Error::Config(format!("bad access token: {e}")))?;
        let headers = req.headers_mut();
        headers.insert(header::AUTHORIZATION, auth);
        headers.insert(
            header::SEC_WEBSOCKET_PROTOCOL,
            HeaderValue::from_static(SUBPROTOCOL),
        );
        Ok(req)
    }
}

#[async_trait]
impl BusConnector for BlazeConnector {
    async fn connect(&self, host: &str) -> Result<BusConnection> {
        let req = self.request(host)?;
        let (ws, _resp) = tokio::time::timeout(HANDSHAKE_TIMEOUT, tokio_tungstenite::connect_async(req))
            .await
            .map_err(|_| Error::Transport(format!("handshake with {host} timed out")))?
            .map_err(|e| Error::Transport(format!("handshake with {host}: {e}")))?;

        let (sink, stream) = ws.split();
        let (in_tx, inbound) = mpsc::channel(FRAME_BUFFER);
        let (outbound, out_rx) = mpsc::channel(FRAME_BUFFER);
        let done = CancellationToken::new();

        tokio::spawn(write_pump(
            sink,
            out_rx,
            done.clone(),
            self.ping_period,
            self.write_wait,
        ));
        tokio::spawn(read_pump(stream, in_tx, done.clone(), self.pong_wait));

        Ok(BusConnection {
            inbound,
            outbound,
            done,
        })
    }
}

/// Forward binary frames to `inbound`. A silent socket (no frame, not even a
/// pong, within `pong_wait`) is treated as dead.
pub async fn read_pump<St>(
    mut stream: St,
    inbound: mpsc::Sender<Vec<u8>>,
    done: CancellationToken,
    pong_wait: Duration,
) where
    St: Stream<Item = std::result::Result<Message, tungstenite::Error>> + Unpin,
{
    loop {
        let next = tokio::select! {
          _ = done.cancelled() => break,
          next = tokio::time::timeout(pong_wait, stream.next()) => next,
        };
        match next {
            Err(_) => {
                tracing::warn!("no frame within pong wait, closing");
                break;
            }
            Ok(None) => {
                tracing::info!("bus closed the stream");
                break;
            }
            Ok(Some(Err(e))) => {
                tracing::warn!(error = %e, "bus read failed");
                break;
            }
            Ok(Some(Ok(Message::Binary(data)))) => {
                if inbound.send(data.to_vec()).await.is_err() {
                    break;
                }
            }
            Ok(Some(Ok(Message::Close(_)))) => break,
            Ok(Some(Ok(_))) => {}
        }
    }
    done.cancel();
}

/// Write queued frames and keepalive pings; every write must finish within
/// `write_wait`.
pub async fn write_pump<Si>(
    mut sink: Si,
    mut outbound: mpsc::Receiver<Vec<u8>>,
    done: CancellationToken,
    ping_period: Duration,
    write_wait: Duration,
) where
    Si: Sink<Message> + Unpin,
    Si::Error: Display,
{
    let mut ping = tokio::time::interval(ping_period);
    ping.tick().await;

    loop {
        let msg = tokio::select! {
          _ = done.cancelled() => break,
          frame = outbound.recv() => match frame {
            Some(frame) => Message::binary(frame),
            None => break,
          },
          _ = ping.tick() => Message::Ping(Default::default()),
        };
        match tokio::time::timeout(write_wait, sink.send(msg)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "bus write failed");
                break;
            }
            Err(_) => {
                tracing::warn!("bus write timed out");
                break;
            }
        }
    }
    done.cancel();
    let _ = sink.close().await;
}
