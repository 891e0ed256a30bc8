//! In-process doubles for the remote seams, shared by unit tests.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::api::{ProbeResult, ReachabilityProbe, TransactionApi};
use crate::error::SubmitError;
use crate::models::{ServerTransaction, SubmitOutcome, SubmitRequest};

/// One scripted reaction to the next submission of a receipt.
#[derive(Debug, Clone)]
pub enum Scripted {
    /// Fail without applying anything server-side.
    Fail(SubmitError),
    /// Apply the transaction, then lose the response.
    ApplyThenFail(SubmitError),
}

type SubmitHook = Box<dyn Fn(&SubmitRequest) + Send + Sync>;

#[derive(Default)]
struct FakeState {
    balances: HashMap<String, i64>,
    applied: HashMap<String, ServerTransaction>,
    scripts: HashMap<String, VecDeque<Scripted>>,
    submissions: Vec<String>,
    reject_overdraft: bool,
    latency: Option<Duration>,
    next_id: u64,
}

/// Server stand-in that applies each receipt exactly once and keeps wallet
/// balances, so tests can check what the server ended up with.
#[derive(Default)]
pub struct FakeApi {
    state: Mutex<FakeState>,
    on_submit: Mutex<Option<SubmitHook>>,
}

impl FakeApi {
    pub fn set_wallet_balance(&self, wallet_id: &str, balance: i64) {
        self.state
            .lock()
            .unwrap()
            .balances
            .insert(wallet_id.to_string(), balance);
    }

    pub fn wallet_balance(&self, wallet_id: &str) -> i64 {
        self.state
            .lock()
            .unwrap()
            .balances
            .get(wallet_id)
            .copied()
            .unwrap_or(0)
    }

    pub fn script(&self, receipt_id: &str, reaction: Scripted) {
        self.state
            .lock()
            .unwrap()
            .scripts
            .entry(receipt_id.to_string())
            .or_default()
            .push_back(reaction);
    }

    /// Reject sales that would take a wallet below zero.
    pub fn reject_overdraft(&self) {
        self.state.lock().unwrap().reject_overdraft = true;
    }

    pub fn set_latency(&self, latency: Duration) {
        self.state.lock().unwrap().latency = Some(latency);
    }

    pub fn on_submit(&self, hook: impl Fn(&SubmitRequest) + Send + Sync + 'static) {
        *self.on_submit.lock().unwrap() = Some(Box::new(hook));
    }

    /// Receipt ids in the order they reached the server, retries included.
    pub fn submissions(&self) -> Vec<String> {
        self.state.lock().unwrap().submissions.clone()
    }

    /// How many distinct receipts were applied server-side.
    pub fn applied_count(&self) -> usize {
        self.state.lock().unwrap().applied.len()
    }
}

#[async_trait]
impl TransactionApi for FakeApi {
    async fn submit(&self, request: &SubmitRequest) -> Result<SubmitOutcome, SubmitError> {
        if let Some(hook) = self.on_submit.lock().unwrap().as_ref() {
            hook(request);
        }
        let latency = self.state.lock().unwrap().latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.state.lock().unwrap();
        state.submissions.push(request.receipt_id.clone());
        let scripted = state
            .scripts
            .get_mut(&request.receipt_id)
            .and_then(VecDeque::pop_front);

        if let Some(Scripted::Fail(err)) = scripted {
            return Err(err);
        }
        if let Some(existing) = state.applied.get(&request.receipt_id) {
            return Ok(SubmitOutcome::Duplicate(existing.clone()));
        }

        let current = state
            .balances
            .get(&request.wallet_id)
            .copied()
            .unwrap_or(0);
        let balance = current + request.amount;
        if state.reject_overdraft && request.amount < 0 && balance < 0 {
            return Err(SubmitError::Rejected {
                status: 422,
                code: Some("insufficient_funds".into()),
                message: "Insufficient funds".into(),
            });
        }
        state.balances.insert(request.wallet_id.clone(), balance);
        state.next_id += 1;
        let tx = ServerTransaction {
            id: format!("srv-{}", state.next_id),
            receipt_id: Some(request.receipt_id.clone()),
            balance_after: Some(balance),
        };
        state.applied.insert(request.receipt_id.clone(), tx.clone());

        match scripted {
            Some(Scripted::ApplyThenFail(err)) => Err(err),
            _ => Ok(SubmitOutcome::Applied(tx)),
        }
    }

    async fn fetch_wallet_balance(&self, wallet_id: &str) -> Result<i64, SubmitError> {
        self.state
            .lock()
            .unwrap()
            .balances
            .get(wallet_id)
            .copied()
            .ok_or_else(|| SubmitError::Rejected {
                status: 404,
                code: Some("wallet_not_found".into()),
                message: format!("Wallet {wallet_id} not found"),
            })
    }
}

/// Probe that replays queued results, then repeats the last one.
pub struct ScriptedProbe {
    results: Mutex<VecDeque<ProbeResult>>,
    last: Mutex<ProbeResult>,
}

impl ScriptedProbe {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            results: Mutex::new(VecDeque::new()),
            last: Mutex::new(ProbeResult::unreachable()),
        })
    }

    pub fn push(&self, reachable: bool, latency_ms: u64) {
        self.results.lock().unwrap().push_back(ProbeResult {
            reachable,
            latency: reachable.then(|| Duration::from_millis(latency_ms)),
        });
    }

    pub fn push_online(&self) {
        self.push(true, 20);
    }

    pub fn push_offline(&self) {
        self.push(false, 0);
    }
}

#[async_trait]
impl ReachabilityProbe for ScriptedProbe {
    async fn probe(&self) -> ProbeResult {
        let next = self.results.lock().unwrap().pop_front();
        let mut last = self.last.lock().unwrap();
        if let Some(result) = next {
            *last = result;
        }
        *last
    }
}
