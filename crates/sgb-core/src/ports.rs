use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{domain::Amount, Result};

/// One outgoing asset transfer. The payments API deduplicates on `trace_id`.
#[derive(Clone, Debug, PartialEq)]
pub struct TransferRequest {
    pub asset_id: String,
    pub recipient_id: String,
    pub amount: Amount,
    pub trace_id: String,
    pub memo: String,
}

/// Payments collaborator.
#[async_trait]
pub trait TransferPort: Send + Sync {
    async fn transfer(&self, req: &TransferRequest) -> Result<()>;
}

/// A live, authenticated bus connection.
///
/// `inbound` yields raw binary frames as received; `outbound` takes frames that
/// are already encoded. `done` is cancelled by whichever pump fails first, and
/// every loop bound to the connection stops on it.
pub struct BusConnection {
    pub inbound: mpsc::Receiver<Vec<u8>>,
    pub outbound: mpsc::Sender<Vec<u8>>,
    pub done: CancellationToken,
}

/// Opens bus connections; the websocket adapter is the production implementation.
#[async_trait]
pub trait BusConnector: Send + Sync {
    async fn connect(&self, host: &str) -> Result<BusConnection>;
}
