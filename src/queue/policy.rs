//! Scheduling policy: stage delays, retry backoff and lane selection

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;

use super::state::SettlementStatus;
use super::types::QueueType;
use crate::config::{QueueConfig, StageDelays};

/// Backoff exponent cap; keeps `base * 2^n` far from overflow
const MAX_BACKOFF_EXPONENT: u32 = 16;

#[derive(Debug, Clone)]
pub struct SchedulePolicy {
    delays: StageDelays,
    backoff_base_secs: i64,
    max_retries: u32,
}

impl SchedulePolicy {
    pub fn new(config: &QueueConfig) -> Self {
        Self {
            delays: config.stage_delays.clone(),
            backoff_base_secs: config.backoff_base_secs.max(0),
            max_retries: config.max_retries,
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Wait before an item targeting `target` becomes due
    pub fn stage_delay(&self, target: SettlementStatus) -> Duration {
        let secs = match target {
            SettlementStatus::Pending => self.delays.pending_secs,
            SettlementStatus::Sent => self.delays.sent_secs,
            SettlementStatus::Completed => self.delays.completed_secs,
            SettlementStatus::Initiated | SettlementStatus::Failed => self.delays.default_secs,
        };
        Duration::seconds(secs.max(0))
    }

    pub fn scheduled_time(&self, target: SettlementStatus, now: DateTime<Utc>) -> DateTime<Utc> {
        now + self.stage_delay(target)
    }

    /// Earliest time a freshly initiated transaction can reach Completed
    pub fn settlement_eta(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now + self.stage_delay(SettlementStatus::Pending)
            + self.stage_delay(SettlementStatus::Sent)
            + self.stage_delay(SettlementStatus::Completed)
    }

    /// Delay after failed attempt `attempt` (0-indexed): `base * 2^attempt`
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let factor = 1i64 << attempt.min(MAX_BACKOFF_EXPONENT);
        Duration::seconds(self.backoff_base_secs.saturating_mul(factor))
    }

    pub fn queue_type(&self, amount: Decimal) -> QueueType {
        QueueType::from_amount(amount)
    }
}

impl Default for SchedulePolicy {
    fn default() -> Self {
        Self::new(&QueueConfig::default())
    }
}
