//! Settlement FSM State Definitions
//!
//! State IDs are stable and suitable for SMALLINT storage.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Settlement stage of a transaction
///
/// ```text
/// Initiated → Pending → Sent → Completed
///     └──────────┴────────┴──→ Failed
/// ```
///
/// Terminal states: Completed (4), Failed (5)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(i16)]
pub enum SettlementStatus {
    /// Request accepted and funds reserved
    Initiated = 1,

    /// Passed screening, waiting for interbank handoff
    Pending = 2,

    /// Handed to the interbank network, waiting for recipient acknowledgment
    Sent = 3,

    /// Terminal: recipient acknowledged, reservation settled
    Completed = 4,

    /// Terminal: reservation reversed
    Failed = 5,
}

impl SettlementStatus {
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(self, SettlementStatus::Completed | SettlementStatus::Failed)
    }

    #[inline]
    pub fn id(&self) -> i16 {
        *self as i16
    }

    pub fn from_id(id: i16) -> Option<Self> {
        match id {
            1 => Some(SettlementStatus::Initiated),
            2 => Some(SettlementStatus::Pending),
            3 => Some(SettlementStatus::Sent),
            4 => Some(SettlementStatus::Completed),
            5 => Some(SettlementStatus::Failed),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SettlementStatus::Initiated => "Initiated",
            SettlementStatus::Pending => "Pending",
            SettlementStatus::Sent => "Sent",
            SettlementStatus::Completed => "Completed",
            SettlementStatus::Failed => "Failed",
        }
    }

    /// Forward stage on the happy path, `None` once terminal
    pub fn next_stage(&self) -> Option<Self> {
        match self {
            SettlementStatus::Initiated => Some(SettlementStatus::Pending),
            SettlementStatus::Pending => Some(SettlementStatus::Sent),
            SettlementStatus::Sent => Some(SettlementStatus::Completed),
            SettlementStatus::Completed | SettlementStatus::Failed => None,
        }
    }

    /// Whether `target` is a legal forward transition from `self`
    ///
    /// Failed is reachable from every non-terminal state.
    pub fn can_transition_to(&self, target: SettlementStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        target == SettlementStatus::Failed || self.next_stage() == Some(target)
    }
}

impl fmt::Display for SettlementStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<i16> for SettlementStatus {
    type Error = ();

    fn try_from(value: i16) -> Result<Self, Self::Error> {
        SettlementStatus::from_id(value).ok_or(())
    }
}
