//! The outgoing payment aggregate

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::adapters::Account;
use crate::intent::Intent;
use crate::state::PaymentState;

/// How the streaming layer priced the payment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentType {
    /// Spend a fixed source amount
    FixedSend,
    /// Deliver a fixed destination amount (invoice payments)
    FixedDelivery,
}

impl PaymentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentType::FixedSend => "fixed_send",
            PaymentType::FixedDelivery => "fixed_delivery",
        }
    }
}

impl fmt::Display for PaymentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for PaymentType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fixed_send" => Ok(PaymentType::FixedSend),
            "fixed_delivery" => Ok(PaymentType::FixedDelivery),
            _ => anyhow::bail!("Invalid payment type: {}", s),
        }
    }
}

/// A priced plan, valid until its activation deadline
///
/// Bounds the source spend (`max_source_amount`) and guarantees a minimum
/// delivered amount under the slippage budget used for the rate probe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub timestamp: DateTime<Utc>,
    pub activation_deadline: DateTime<Utc>,
    pub target_type: PaymentType,
    pub min_delivery_amount: u64,
    pub max_source_amount: u64,
    pub min_exchange_rate: f64,
    pub low_exchange_rate_estimate: f64,
    pub high_exchange_rate_estimate: f64,
}

impl Quote {
    /// A quote whose deadline equals the current instant is already expired.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.activation_deadline <= now
    }
}

/// Source sub-account snapshot captured at admission
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceAccount {
    pub id: Uuid,
    pub asset_code: String,
    pub asset_scale: u8,
}

/// Destination details captured at quoting
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DestinationAccount {
    pub asset_code: String,
    pub asset_scale: u8,
    pub url: String,
}

/// The single aggregate the engine manages
///
/// Rows are created by `create`, mutated only by the command service and the
/// worker pool under a row lock, and retained forever once terminal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payment {
    pub id: Uuid,
    pub state: PaymentState,
    /// Consecutive retry attempts in the current state; reset on state change
    pub state_attempts: u32,
    pub intent: Intent,
    pub auto_approve: bool,
    /// Source sub-account created by the engine on admission
    pub account_id: Uuid,
    /// Parent account funding the payment
    pub super_account_id: Uuid,
    pub source_account: SourceAccount,
    pub destination_account: Option<DestinationAccount>,
    pub quote: Option<Quote>,
    /// Terminal or last-attempt error code
    pub error: Option<String>,
    /// Caller-supplied create idempotency token
    pub client_token: Option<String>,
    /// Earliest next worker pickup; `None` means immediately eligible
    pub process_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Payment {
    /// Admit a validated intent as a fresh payment in `Quoting`
    pub fn admit(
        intent: Intent,
        auto_approve: bool,
        source_account: Account,
        super_account_id: Uuid,
        client_token: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            state: PaymentState::Quoting,
            state_attempts: 0,
            intent,
            auto_approve,
            account_id: source_account.id,
            super_account_id,
            source_account: SourceAccount {
                id: source_account.id,
                asset_code: source_account.asset_code,
                asset_scale: source_account.asset_scale,
            },
            destination_account: None,
            quote: None,
            error: None,
            client_token,
            process_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// The mutable column set written by one committed transition
///
/// Every field is written on commit; builders start from [`PaymentPatch::keep`]
/// and change only what the transition touches. Immutable columns (intent,
/// accounts, timestamps) are never part of a patch.
#[derive(Debug, Clone, PartialEq)]
pub struct PaymentPatch {
    pub state: PaymentState,
    pub state_attempts: u32,
    pub destination_account: Option<DestinationAccount>,
    pub quote: Option<Quote>,
    pub error: Option<String>,
    pub process_at: Option<DateTime<Utc>>,
}

impl PaymentPatch {
    /// Identity patch: writing it back changes nothing but `updated_at`.
    pub fn keep(payment: &Payment) -> Self {
        Self {
            state: payment.state,
            state_attempts: payment.state_attempts,
            destination_account: payment.destination_account.clone(),
            quote: payment.quote.clone(),
            error: payment.error.clone(),
            process_at: payment.process_at,
        }
    }
}
