//! Payments adapter: pushes transfers to the Mixin HTTP API.
//!
//! The API deduplicates on `trace_id`, so a transfer repeated after a timeout
//! or a crash is paid at most once.

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use sgb_core::{
    errors::Error,
    ports::{TransferPort, TransferRequest},
    Result,
};

#[derive(Debug, Deserialize)]
struct ApiError {
    code: i64,
    #[serde(default)]
    description: String,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    #[serde(default)]
    error: Option<ApiError>,
}

#[derive(Debug)]
pub struct TransferClient {
    roots: Vec<String>,
    access_token: String,
    // index of the API root to use next; bumped on network failures
    cursor: AtomicUsize,
    http: reqwest::Client,
}

impl TransferClient {
    pub fn new(roots: Vec<String>, access_token: impl Into<String>) -> Result<Self> {
        if roots.is_empty() {
            return Err(Error::Config("no API roots configured".to_string()));
        }
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .map_err(|e| Error::Config(format!("http client: {e}")))?;
        Ok(Self {
            roots,
            access_token: access_token.into(),
            cursor: AtomicUsize::new(0),
            http,
        })
    }

    fn root(&self) -> &str {
        let i = self.cursor.load(Ordering::Relaxed) % self.roots.len();
        self.roots[i].trim_end_matches('/')
    }

    fn rotate(&self) {
        self.cursor.fetch_add(1, Ordering::Relaxed);
    }
}

fn transfer_body(req: &TransferRequest) -> serde_json::Value {
    json!({
        "asset_id": req.asset_id,
        "opponent_id": req.recipient_id,
        "amount": req.amount.to_string(),
        "trace_id": req.trace_id,
        "memo": req.memo,
    })
}

/// Map an API reply to the core error type. The API reports business errors
/// inside a 200 body.
fn check_response(status: u16, body: &str) -> Result<()> {
    let parsed = serde_json::from_str::<ApiResponse>(body).ok();
    if let Some(ApiError { code, description }) = parsed.and_then(|r| r.error) {
        return Err(Error::Peer { code, description });
    }
    if !(200..300).contains(&status) {
        return Err(Error::External(format!(
            "transfer failed: {status} {}",
            body.chars().take(200).collect::<String>()
        )));
    }
    Ok(())
}

#[async_trait]
impl TransferPort for TransferClient {
    async fn transfer(&self, req: &TransferRequest) -> Result<()> {
        let url = format!("{}/transfers", self.root());
        let resp = match self
            .http
            .post(&url)
            .bearer_auth(&self.access_token)
            .json(&transfer_body(req))
            .send()
            .await
        {
            Ok(resp) => resp,
            Err(e) => {
                self.rotate();
                return Err(Error::Transport(format!("transfer request error: {e}")));
            }
        };

        let status = resp.status().as_u16();
        let body = resp
            .text()
            .await
            .map_err(|e| Error::Transport(format!("transfer response error: {e}")))?;
        check_response(status, &body)?;
        tracing::info!(trace_id = %req.trace_id, recipient_id = %req.recipient_id, amount = %req.amount, "transfer sent");
        Ok(())
    }
}
