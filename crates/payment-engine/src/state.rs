//! Payment lifecycle states

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle state of an outgoing payment
///
/// `Quoting` is the initial state; `Completed` and `Cancelled` are terminal.
/// Workers act on `Quoting`, `Sending` and `Cancelling` unconditionally, and
/// on `Ready`/`Activated` only once the quote's activation deadline passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentState {
    Quoting,
    Ready,
    Activated,
    Sending,
    Cancelling,
    Completed,
    Cancelled,
}

impl PaymentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentState::Quoting => "quoting",
            PaymentState::Ready => "ready",
            PaymentState::Activated => "activated",
            PaymentState::Sending => "sending",
            PaymentState::Cancelling => "cancelling",
            PaymentState::Completed => "completed",
            PaymentState::Cancelled => "cancelled",
        }
    }

    /// Terminal states are retained for audit and never mutated again,
    /// except for the administrative requote of a cancelled payment.
    pub fn is_terminal(&self) -> bool {
        matches!(self, PaymentState::Completed | PaymentState::Cancelled)
    }

    /// States the worker pool acts on regardless of any deadline
    pub fn is_worker_actionable(&self) -> bool {
        matches!(
            self,
            PaymentState::Quoting | PaymentState::Sending | PaymentState::Cancelling
        )
    }

    /// Whether `to` is a legal next state from `self`
    ///
    /// Staying in the same non-terminal state (a bounded retry) is always
    /// legal and not listed here.
    pub fn can_transition_to(&self, to: PaymentState) -> bool {
        use PaymentState::*;
        match self {
            Quoting => matches!(to, Ready | Activated | Cancelling | Completed),
            Ready => matches!(to, Activated | Cancelling),
            Activated => matches!(to, Sending | Cancelling),
            Sending => matches!(to, Completed | Cancelling),
            Cancelling => matches!(to, Cancelled),
            Cancelled => matches!(to, Quoting),
            Completed => false,
        }
    }
}

impl fmt::Display for PaymentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for PaymentState {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "quoting" => Ok(PaymentState::Quoting),
            "ready" => Ok(PaymentState::Ready),
            "activated" => Ok(PaymentState::Activated),
            "sending" => Ok(PaymentState::Sending),
            "cancelling" => Ok(PaymentState::Cancelling),
            "completed" => Ok(PaymentState::Completed),
            "cancelled" => Ok(PaymentState::Cancelled),
            _ => anyhow::bail!("Invalid payment state: {}", s),
        }
    }
}
