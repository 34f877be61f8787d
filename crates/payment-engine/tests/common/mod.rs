//! Common test utilities for integration tests
//!
//! Provides database setup plus in-memory stub implementations of the
//! capability contracts, so the engine can be driven end-to-end against a
//! real PostgreSQL database without any external services.

use async_trait::async_trait;
use chrono::Utc;
use payment_engine::adapters::{
    Account, AccountingService, Deps, Destination, Plugin, PluginFactory, RatesService,
    StreamOutcome, StreamQuote, StreamingService, SubAccountFactory, TransferRequest,
};
use payment_engine::error::{AccountError, AccountingError, PluginError, RatesError, StreamError};
use payment_engine::{Intent, Payment, PaymentState, PaymentType, Quote};
use sqlx::PgPool;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// Connect to the test database and apply migrations
#[allow(dead_code)]
pub async fn setup_test_db() -> anyhow::Result<PgPool> {
    let database_url = std::env::var("DATABASE_URL")
        .expect("DATABASE_URL must be set for integration tests");

    let pool = PgPool::connect(&database_url).await?;
    shared::db::run_migrations(&pool)
        .await
        .map_err(|e| anyhow::anyhow!("failed to run migrations: {}", e))?;
    Ok(pool)
}

/// Attach a live quote and move the payment into `state` in memory
#[allow(dead_code)]
pub fn with_quote(payment: &mut Payment, state: PaymentState, deadline_ms: i64) {
    let now = Utc::now();
    let amount = payment.intent.amount_to_send().unwrap_or(1000);
    payment.state = state;
    payment.destination_account = Some(payment_engine::payment::DestinationAccount {
        asset_code: "USD".to_string(),
        asset_scale: 2,
        url: "https://wallet.example/receiver".to_string(),
    });
    payment.quote = Some(Quote {
        timestamp: now,
        activation_deadline: now + chrono::Duration::milliseconds(deadline_ms),
        target_type: PaymentType::FixedSend,
        min_delivery_amount: amount,
        max_source_amount: amount + amount / 20,
        min_exchange_rate: 1.0,
        low_exchange_rate_estimate: 1.0,
        high_exchange_rate_estimate: 1.0,
    });
}

/// In-memory double-entry accounting with idempotent transfers
#[derive(Default)]
pub struct StubAccounting {
    inner: Mutex<AccountingState>,
}

#[derive(Default)]
struct AccountingState {
    balances: HashMap<Uuid, i64>,
    total_sent: HashMap<Uuid, u64>,
    applied_transfers: HashMap<String, TransferRequest>,
}

#[allow(dead_code)]
impl StubAccounting {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn seed(&self, account_id: Uuid, balance: i64) {
        let mut inner = self.inner.lock().unwrap();
        inner.balances.insert(account_id, balance);
        inner.total_sent.entry(account_id).or_insert(0);
    }

    pub fn balance_of(&self, account_id: Uuid) -> Option<i64> {
        self.inner.lock().unwrap().balances.get(&account_id).copied()
    }

    pub fn total_sent_of(&self, account_id: Uuid) -> Option<u64> {
        self.inner
            .lock()
            .unwrap()
            .total_sent
            .get(&account_id)
            .copied()
    }

    pub fn applied_transfer_ids(&self) -> Vec<String> {
        self.inner
            .lock()
            .unwrap()
            .applied_transfers
            .keys()
            .cloned()
            .collect()
    }

    /// Record a packet batch streamed out of `account_id` (what the real
    /// accounting service does out-of-band per delivered packet)
    pub fn record_stream_out(&self, account_id: Uuid, amount: u64) {
        let mut inner = self.inner.lock().unwrap();
        *inner.balances.entry(account_id).or_insert(0) -= amount as i64;
        *inner.total_sent.entry(account_id).or_insert(0) += amount;
    }
}

#[async_trait]
impl AccountingService for StubAccounting {
    async fn create_transfer(&self, transfer: TransferRequest) -> Result<(), AccountingError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.applied_transfers.contains_key(&transfer.transfer_id) {
            // Idempotent replay: no additional balance movement
            return Ok(());
        }
        if !inner.balances.contains_key(&transfer.source_account_id) {
            return Err(AccountingError::UnknownAccount);
        }
        *inner
            .balances
            .entry(transfer.source_account_id)
            .or_insert(0) -= transfer.amount as i64;
        *inner
            .balances
            .entry(transfer.destination_account_id)
            .or_insert(0) += transfer.amount as i64;
        inner
            .applied_transfers
            .insert(transfer.transfer_id.clone(), transfer);
        Ok(())
    }

    async fn get_total_sent(&self, account_id: Uuid) -> Result<Option<u64>, AccountingError> {
        Ok(self.total_sent_of(account_id))
    }

    async fn get_balance(&self, account_id: Uuid) -> Result<Option<u64>, AccountingError> {
        Ok(self
            .balance_of(account_id)
            .map(|balance| balance.max(0) as u64))
    }
}

/// Fixed-price rates stub
pub struct StubRates;

#[async_trait]
impl RatesService for StubRates {
    async fn prices(&self, _base_asset_code: &str) -> Result<HashMap<String, f64>, RatesError> {
        Ok(HashMap::from([("USD".to_string(), 1.0)]))
    }
}

/// Scriptable streaming stub with 1:1 exchange and 5% slippage headroom
///
/// `pay` settles through the shared [`StubAccounting`] the way the real
/// streaming layer settles per-packet: it debits the source sub-account and
/// bumps its total-sent figure.
pub struct StubStreaming {
    accounting: Arc<StubAccounting>,
    setup_error: Mutex<Option<StreamError>>,
    /// Persistent `pay` failure, checked before the transient counter
    pay_error: Mutex<Option<StreamError>>,
    /// Fail this many `pay` calls with `ConnectorError` before succeeding
    pay_failures: AtomicU32,
    pub pay_calls: AtomicU32,
}

#[allow(dead_code)]
impl StubStreaming {
    pub fn new(accounting: Arc<StubAccounting>) -> Arc<Self> {
        Arc::new(Self {
            accounting,
            setup_error: Mutex::new(None),
            pay_error: Mutex::new(None),
            pay_failures: AtomicU32::new(0),
            pay_calls: AtomicU32::new(0),
        })
    }

    pub fn fail_setup_with(&self, error: StreamError) {
        *self.setup_error.lock().unwrap() = Some(error);
    }

    pub fn fail_pay_with(&self, error: StreamError) {
        *self.pay_error.lock().unwrap() = Some(error);
    }

    pub fn fail_next_pays(&self, count: u32) {
        self.pay_failures.store(count, Ordering::SeqCst);
    }
}

#[async_trait]
impl StreamingService for StubStreaming {
    async fn setup_payment(
        &self,
        _plugin: &Plugin,
        intent: &Intent,
    ) -> Result<Destination, StreamError> {
        if let Some(error) = *self.setup_error.lock().unwrap() {
            return Err(error);
        }
        Ok(Destination {
            asset_code: "USD".to_string(),
            asset_scale: 2,
            url: intent
                .payment_pointer()
                .or(intent.invoice_url())
                .unwrap()
                .to_string(),
            invoice_amount_to_deliver: intent.invoice_url().map(|_| 1000),
        })
    }

    async fn start_quote(
        &self,
        _plugin: &Plugin,
        destination: &Destination,
        amount_to_send: Option<u64>,
        _slippage: f64,
        _prices: Option<HashMap<String, f64>>,
    ) -> Result<StreamQuote, StreamError> {
        let (target_type, amount) = match amount_to_send {
            Some(amount) => (PaymentType::FixedSend, amount),
            None => (
                PaymentType::FixedDelivery,
                destination
                    .invoice_amount_to_deliver
                    .ok_or(StreamError::UnknownPaymentTarget)?,
            ),
        };
        Ok(StreamQuote {
            target_type,
            min_delivery_amount: amount,
            max_source_amount: amount + amount / 20,
            min_exchange_rate: 1.0,
            low_exchange_rate_estimate: 1.0,
            high_exchange_rate_estimate: 1.0,
        })
    }

    async fn pay(
        &self,
        plugin: &Plugin,
        _destination: &Destination,
        quote: &Quote,
        progress_offset: u64,
    ) -> Result<StreamOutcome, StreamError> {
        self.pay_calls.fetch_add(1, Ordering::SeqCst);

        if let Some(error) = *self.pay_error.lock().unwrap() {
            return Err(error);
        }

        let failures = self.pay_failures.load(Ordering::SeqCst);
        if failures > 0 {
            self.pay_failures.store(failures - 1, Ordering::SeqCst);
            return Err(StreamError::ConnectorError);
        }

        // 1:1 exchange: deliver the quoted amount, resuming past packets
        let remaining = quote.min_delivery_amount.saturating_sub(progress_offset);
        self.accounting.record_stream_out(plugin.account_id, remaining);
        Ok(StreamOutcome {
            amount_sent: remaining,
            amount_delivered: remaining,
        })
    }
}

/// Plugin factory that counts opens and closes
#[derive(Default)]
pub struct StubPlugins {
    pub opened: AtomicU32,
    pub closed: AtomicU32,
}

#[allow(dead_code)]
impl StubPlugins {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn assert_balanced(&self) {
        assert_eq!(
            self.opened.load(Ordering::SeqCst),
            self.closed.load(Ordering::SeqCst),
            "every opened plugin must be closed"
        );
    }
}

#[async_trait]
impl PluginFactory for StubPlugins {
    async fn open_plugin(&self, source_account_id: Uuid) -> Result<Plugin, PluginError> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Plugin {
            id: Uuid::new_v4(),
            account_id: source_account_id,
        })
    }

    async fn close_plugin(&self, _plugin: Plugin) -> Result<(), PluginError> {
        self.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Account service stub; sub-accounts are registered with the accounting stub
pub struct StubAccounts {
    accounting: Arc<StubAccounting>,
    supers: Mutex<HashSet<Uuid>>,
}

#[allow(dead_code)]
impl StubAccounts {
    pub fn new(accounting: Arc<StubAccounting>) -> Arc<Self> {
        Arc::new(Self {
            accounting,
            supers: Mutex::new(HashSet::new()),
        })
    }

    pub fn register_super(&self, id: Uuid) {
        self.supers.lock().unwrap().insert(id);
    }
}

#[async_trait]
impl SubAccountFactory for StubAccounts {
    async fn get_account(&self, id: Uuid) -> Result<Option<Account>, AccountError> {
        if self.supers.lock().unwrap().contains(&id) {
            Ok(Some(Account {
                id,
                asset_code: "USD".to_string(),
                asset_scale: 2,
            }))
        } else {
            Ok(None)
        }
    }

    async fn create_sub_account(&self, super_account_id: Uuid) -> Result<Account, AccountError> {
        if !self.supers.lock().unwrap().contains(&super_account_id) {
            return Err(AccountError::UnknownAccount);
        }
        let account = Account {
            id: Uuid::new_v4(),
            asset_code: "USD".to_string(),
            asset_scale: 2,
        };
        self.accounting.seed(account.id, 0);
        Ok(account)
    }
}

/// A full stub environment wired through one shared accounting ledger
#[allow(dead_code)]
pub struct StubEnv {
    pub accounting: Arc<StubAccounting>,
    pub streaming: Arc<StubStreaming>,
    pub plugins: Arc<StubPlugins>,
    pub accounts: Arc<StubAccounts>,
    pub deps: Deps,
}

#[allow(dead_code)]
pub fn stub_env() -> StubEnv {
    let accounting = StubAccounting::new();
    let streaming = StubStreaming::new(accounting.clone());
    let plugins = StubPlugins::new();
    let accounts = StubAccounts::new(accounting.clone());

    let deps = Deps {
        accounting: accounting.clone(),
        rates: Arc::new(StubRates),
        streaming: streaming.clone(),
        sub_accounts: accounts.clone(),
        plugins: plugins.clone(),
    };

    StubEnv {
        accounting,
        streaming,
        plugins,
        accounts,
        deps,
    }
}
