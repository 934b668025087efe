//! Bank Gateway
//!
//! The external legs of a settlement: compliance screening, the interbank
//! handoff and the recipient-bank acknowledgment. [`SimulatedBank`] fakes
//! all three; whether a leg succeeds is decided by an injected
//! [`OutcomeSource`] so tests can script exact failure sequences.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::{LatencyRange, SimulationConfig};
use crate::ledger::Transaction;

/// External leg of the settlement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BankStep {
    Screening,
    InterbankSend,
    RecipientAcknowledge,
}

impl BankStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            BankStep::Screening => "screening",
            BankStep::InterbankSend => "interbank_send",
            BankStep::RecipientAcknowledge => "recipient_acknowledge",
        }
    }
}

/// Decides whether a bank step succeeds
pub trait OutcomeSource: Send + Sync {
    fn decide(&self, step: BankStep) -> bool;
}

/// Bernoulli draws with the configured success rates
pub struct ProbabilisticOutcome {
    rng: Mutex<StdRng>,
    send_success_rate: f64,
    acknowledge_success_rate: f64,
}

impl ProbabilisticOutcome {
    pub fn new(send_success_rate: f64, acknowledge_success_rate: f64, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            rng: Mutex::new(rng),
            send_success_rate: send_success_rate.clamp(0.0, 1.0),
            acknowledge_success_rate: acknowledge_success_rate.clamp(0.0, 1.0),
        }
    }

    pub fn from_config(config: &SimulationConfig) -> Self {
        Self::new(
            config.send_success_rate,
            config.acknowledge_success_rate,
            config.seed,
        )
    }
}

impl OutcomeSource for ProbabilisticOutcome {
    fn decide(&self, step: BankStep) -> bool {
        let p = match step {
            BankStep::Screening => return true,
            BankStep::InterbankSend => self.send_success_rate,
            BankStep::RecipientAcknowledge => self.acknowledge_success_rate,
        };
        self.rng
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .gen_bool(p)
    }
}

/// Same answer for every step
#[derive(Debug, Clone, Copy)]
pub struct FixedOutcome(pub bool);

impl OutcomeSource for FixedOutcome {
    fn decide(&self, _step: BankStep) -> bool {
        self.0
    }
}

/// Per-step scripted answers, falling back to a default once a script runs dry
pub struct ScriptedOutcome {
    scripts: Mutex<HashMap<BankStep, VecDeque<bool>>>,
    fallback: bool,
    calls: Mutex<HashMap<BankStep, usize>>,
}

impl ScriptedOutcome {
    pub fn new(fallback: bool) -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
            fallback,
            calls: Mutex::new(HashMap::new()),
        }
    }

    /// Append answers for `step`
    pub fn script(&self, step: BankStep, outcomes: impl IntoIterator<Item = bool>) -> &Self {
        self.scripts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(step)
            .or_default()
            .extend(outcomes);
        self
    }

    /// How many times `step` was decided
    pub fn calls(&self, step: BankStep) -> usize {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&step)
            .copied()
            .unwrap_or(0)
    }
}

impl OutcomeSource for ScriptedOutcome {
    fn decide(&self, step: BankStep) -> bool {
        *self
            .calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(step)
            .or_default() += 1;
        self.scripts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get_mut(&step)
            .and_then(|q| q.pop_front())
            .unwrap_or(self.fallback)
    }
}

/// Answer from the simulated bank
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BankReply<T> {
    Accepted(T),
    Declined(String),
}

impl<T> BankReply<T> {
    pub fn is_accepted(&self) -> bool {
        matches!(self, BankReply::Accepted(_))
    }
}

/// Recipient-bank acknowledgment payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Acknowledgment {
    pub response_code: String,
    pub bank_reference: String,
}

/// External bank legs
///
/// Implementations may suspend; callers must not hold account locks
/// across these calls.
#[async_trait]
pub trait BankGateway: Send + Sync {
    /// Gateway name for logging
    fn name(&self) -> &'static str;

    /// Compliance screening; only latency, never declines in the simulation
    async fn screen(&self, tx: &Transaction) -> BankReply<()>;

    /// Interbank handoff; returns the session id on acceptance
    async fn send(&self, tx: &Transaction) -> BankReply<String>;

    /// Recipient-bank acknowledgment
    async fn acknowledge(&self, tx: &Transaction) -> BankReply<Acknowledgment>;
}

/// Simulated bank network
pub struct SimulatedBank {
    outcomes: Arc<dyn OutcomeSource>,
    screening_latency: LatencyRange,
    send_latency: LatencyRange,
    acknowledge_latency: LatencyRange,
    clock: Arc<dyn Clock>,
}

impl SimulatedBank {
    pub fn new(
        config: &SimulationConfig,
        outcomes: Arc<dyn OutcomeSource>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            outcomes,
            screening_latency: config.screening_latency,
            send_latency: config.send_latency,
            acknowledge_latency: config.acknowledge_latency,
            clock,
        }
    }

    /// Probabilistic outcomes from the simulation config
    pub fn from_config(config: &SimulationConfig, clock: Arc<dyn Clock>) -> Self {
        Self::new(
            config,
            Arc::new(ProbabilisticOutcome::from_config(config)),
            clock,
        )
    }

    /// No latency; outcomes from `outcomes`
    pub fn instant(outcomes: Arc<dyn OutcomeSource>, clock: Arc<dyn Clock>) -> Self {
        Self::new(&SimulationConfig::instant(), outcomes, clock)
    }

    async fn latency(&self, range: LatencyRange) {
        if range.is_zero() {
            return;
        }
        let ms = if range.max_ms > range.min_ms {
            rand::thread_rng().gen_range(range.min_ms..=range.max_ms)
        } else {
            range.max_ms
        };
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }

    fn bank_reference(&self) -> String {
        let n: u32 = rand::thread_rng().gen_range(10_000..100_000);
        format!("BNK-{}-{}", self.clock.now().format("%Y%m%d"), n)
    }
}

#[async_trait]
impl BankGateway for SimulatedBank {
    fn name(&self) -> &'static str {
        "simulated"
    }

    async fn screen(&self, tx: &Transaction) -> BankReply<()> {
        self.latency(self.screening_latency).await;
        if self.outcomes.decide(BankStep::Screening) {
            BankReply::Accepted(())
        } else {
            debug!(reference = %tx.reference, "Screening declined");
            BankReply::Declined("Screening declined".to_string())
        }
    }

    async fn send(&self, tx: &Transaction) -> BankReply<String> {
        self.latency(self.send_latency).await;
        if self.outcomes.decide(BankStep::InterbankSend) {
            BankReply::Accepted(Uuid::new_v4().to_string())
        } else {
            debug!(reference = %tx.reference, "Interbank handoff declined");
            BankReply::Declined("Failed to send transaction to interbank network".to_string())
        }
    }

    async fn acknowledge(&self, tx: &Transaction) -> BankReply<Acknowledgment> {
        self.latency(self.acknowledge_latency).await;
        if self.outcomes.decide(BankStep::RecipientAcknowledge) {
            BankReply::Accepted(Acknowledgment {
                response_code: "00".to_string(),
                bank_reference: self.bank_reference(),
            })
        } else {
            debug!(reference = %tx.reference, "Recipient bank did not acknowledge");
            BankReply::Declined("Recipient bank rejected the transaction".to_string())
        }
    }
}
