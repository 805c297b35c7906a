//! Shared fakes for unit tests.

use std::{
    sync::{
        atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{
    blaze::{codec, BlazeClient, BlazeError, BlazeMessage, Correlator},
    domain::{PaymentState, User},
    ports::{TransferPort, TransferRequest},
    Result,
};

pub const BOT: &str = "bot-id";

/// In-process bus peer: answers every request, optionally with an error.
pub struct FakeBus {
    pub client: BlazeClient,
    pub correlator: Arc<Correlator>,
    requests: Arc<Mutex<Vec<BlazeMessage>>>,
    error_code: Arc<AtomicI64>,
}

impl FakeBus {
    pub fn new() -> Self {
        let (tx, mut rx) = mpsc::channel::<Vec<u8>>(64);
        let correlator = Arc::new(Correlator::new());
        let client = BlazeClient::new(
            BOT,
            tx,
            correlator.clone(),
            CancellationToken::new(),
            Duration::from_millis(500),
            Duration::from_millis(500),
        );
        let requests = Arc::new(Mutex::new(Vec::new()));
        let error_code = Arc::new(AtomicI64::new(0));

        let (seen, code, peer) = (requests.clone(), error_code.clone(), correlator.clone());
        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                let req = codec::decode(&frame).unwrap();
                let error = match code.load(Ordering::SeqCst) {
                    0 => None,
                    code => Some(BlazeError {
                        code,
                        description: "rejected".to_string(),
                    }),
                };
                let reply = BlazeMessage {
                    id: req.id.clone(),
                    action: req.action.clone(),
                    error,
                    ..Default::default()
                };
                seen.lock().unwrap().push(req);
                peer.complete(reply);
            }
        });

        Self {
            client,
            correlator,
            requests,
            error_code,
        }
    }

    /// Requests received so far with the given action.
    pub fn requests(&self, action: &str) -> Vec<BlazeMessage> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.action == action)
            .cloned()
            .collect()
    }

    /// Reject every following request with a non-retryable error.
    pub fn set_failing(&self, failing: bool) {
        self.set_error_code(if failing { 403 } else { 0 });
    }

    /// Answer every following request with `code`; 0 answers normally.
    pub fn set_error_code(&self, code: i64) {
        self.error_code.store(code, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct RecordingTransfers {
    sent: Mutex<Vec<TransferRequest>>,
    attempts: AtomicUsize,
    failing: AtomicBool,
}

impl RecordingTransfers {
    pub fn sent(&self) -> Vec<TransferRequest> {
        self.sent.lock().unwrap().clone()
    }

    /// Transfers requested so far, failed ones included.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl TransferPort for RecordingTransfers {
    async fn transfer(&self, req: &TransferRequest) -> Result<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(crate::Error::External("transfer rejected".to_string()));
        }
        self.sent.lock().unwrap().push(req.clone());
        Ok(())
    }
}

pub fn member(id: &str) -> User {
    User {
        user_id: id.to_string(),
        full_name: format!("Member {id}"),
        trace_id: format!("trace-{id}"),
        state: PaymentState::Paid,
        active_at: Utc::now(),
        subscribed_at: Some(Utc::now()),
        sessions: Vec::new(),
    }
}
