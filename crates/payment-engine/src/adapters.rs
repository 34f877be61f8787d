//! Capability adapter contracts
//!
//! The engine depends on these interfaces only; implementations may be
//! in-process or network RPC and are injected through [`Deps`]. Every call
//! is expected to carry its own deadline; a missed deadline surfaces as the
//! adapter's retryable error variant.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::{AccountError, AccountingError, PluginError, RatesError, StreamError};
use crate::intent::Intent;
use crate::payment::{PaymentType, Quote};

/// An account as known to the account service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: Uuid,
    pub asset_code: String,
    pub asset_scale: u8,
}

/// A balance-moving instruction, idempotent per `transfer_id`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRequest {
    pub source_account_id: Uuid,
    pub destination_account_id: Uuid,
    /// Amount in the source asset's minor units
    pub amount: u64,
    /// Stable idempotency key; repeated delivery moves no additional funds
    pub transfer_id: String,
}

/// Balances and transfers
#[async_trait]
pub trait AccountingService: Send + Sync {
    /// Idempotent per `transfer_id`
    async fn create_transfer(&self, transfer: TransferRequest) -> Result<(), AccountingError>;

    /// Net amount debited from `account_id` so far; `None` for unknown accounts
    async fn get_total_sent(&self, account_id: Uuid) -> Result<Option<u64>, AccountingError>;

    /// Available balance of `account_id`; `None` for unknown accounts
    async fn get_balance(&self, account_id: Uuid) -> Result<Option<u64>, AccountingError>;
}

/// Exchange-rate lookup, keyed by destination asset code
#[async_trait]
pub trait RatesService: Send + Sync {
    async fn prices(&self, base_asset_code: &str) -> Result<HashMap<String, f64>, RatesError>;
}

/// Destination details resolved by the streaming layer during setup
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Destination {
    pub asset_code: String,
    pub asset_scale: u8,
    pub url: String,
    /// Remaining amount an invoice destination expects, in destination units
    pub invoice_amount_to_deliver: Option<u64>,
}

/// Result of a rate probe
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamQuote {
    pub target_type: PaymentType,
    pub min_delivery_amount: u64,
    pub max_source_amount: u64,
    pub min_exchange_rate: f64,
    pub low_exchange_rate_estimate: f64,
    pub high_exchange_rate_estimate: f64,
}

/// Result of a (possibly resumed) packetized send
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamOutcome {
    /// Source units spent by this invocation
    pub amount_sent: u64,
    /// Destination units delivered by this invocation
    pub amount_delivered: u64,
}

/// The ILP STREAM capability: destination setup, rate probe, packetized send
#[async_trait]
pub trait StreamingService: Send + Sync {
    async fn setup_payment(
        &self,
        plugin: &Plugin,
        intent: &Intent,
    ) -> Result<Destination, StreamError>;

    async fn start_quote(
        &self,
        plugin: &Plugin,
        destination: &Destination,
        amount_to_send: Option<u64>,
        slippage: f64,
        prices: Option<HashMap<String, f64>>,
    ) -> Result<StreamQuote, StreamError>;

    /// `progress_offset` is the net amount already sent in earlier attempts;
    /// the stream resumes from there so packets are delivered at most once in
    /// net effect.
    async fn pay(
        &self,
        plugin: &Plugin,
        destination: &Destination,
        quote: &Quote,
        progress_offset: u64,
    ) -> Result<StreamOutcome, StreamError>;
}

/// Scoped connection to the network on behalf of one source account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plugin {
    pub id: Uuid,
    pub account_id: Uuid,
}

/// Plugin acquisition; callers must close on every exit path
#[async_trait]
pub trait PluginFactory: Send + Sync {
    async fn open_plugin(&self, source_account_id: Uuid) -> Result<Plugin, PluginError>;

    async fn close_plugin(&self, plugin: Plugin) -> Result<(), PluginError>;
}

/// Account resolution and sub-account creation
#[async_trait]
pub trait SubAccountFactory: Send + Sync {
    async fn get_account(&self, id: Uuid) -> Result<Option<Account>, AccountError>;

    async fn create_sub_account(&self, super_account_id: Uuid) -> Result<Account, AccountError>;
}

/// Explicit dependency record handed to the engine; no process-wide singletons
#[derive(Clone)]
pub struct Deps {
    pub accounting: Arc<dyn AccountingService>,
    pub rates: Arc<dyn RatesService>,
    pub streaming: Arc<dyn StreamingService>,
    pub sub_accounts: Arc<dyn SubAccountFactory>,
    pub plugins: Arc<dyn PluginFactory>,
}
