//! Network-RPC implementations of the capability contracts
//!
//! Each collaborating service speaks JSON over HTTP: the accounting service
//! for balances and transfers, the rates service for prices, the account
//! service for sub-accounts, and the stream daemon for plugins, rate probes
//! and packetized sends. Connection-level failures map to each contract's
//! retryable variant; the stream daemon reports its closed error set as
//! `{"code": ...}` envelopes.

use async_trait::async_trait;
use payment_engine::adapters::{
    Account, AccountingService, Deps, Destination, Plugin, PluginFactory, RatesService,
    StreamOutcome, StreamQuote, StreamingService, SubAccountFactory, TransferRequest,
};
use payment_engine::error::{AccountError, AccountingError, PluginError, RatesError, StreamError};
use payment_engine::{Intent, Quote};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use shared::config::ServicesConfig;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// Build a dependency record wired to the configured service endpoints
pub fn build_deps(services: &ServicesConfig) -> anyhow::Result<Deps> {
    let mut builder = reqwest::Client::builder().timeout(services.request_timeout());

    if let Some(token) = &services.auth_token {
        let mut headers = reqwest::header::HeaderMap::new();
        let mut value = reqwest::header::HeaderValue::from_str(&format!("Bearer {}", token))?;
        value.set_sensitive(true);
        headers.insert(reqwest::header::AUTHORIZATION, value);
        builder = builder.default_headers(headers);
    }

    let client = builder.build()?;

    Ok(Deps {
        accounting: Arc::new(HttpAccountingService {
            client: client.clone(),
            base_url: services.accounting_url.clone(),
        }),
        rates: Arc::new(HttpRatesService {
            client: client.clone(),
            base_url: services.rates_url.clone(),
        }),
        streaming: Arc::new(HttpStreamService {
            client: client.clone(),
            base_url: services.stream_url.clone(),
        }),
        sub_accounts: Arc::new(HttpAccountService {
            client: client.clone(),
            base_url: services.account_url.clone(),
        }),
        plugins: Arc::new(HttpStreamService {
            client,
            base_url: services.stream_url.clone(),
        }),
    })
}

pub struct HttpAccountingService {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct BalanceResponse {
    balance: u64,
}

#[derive(Debug, Deserialize)]
struct TotalSentResponse {
    total_sent: u64,
}

#[async_trait]
impl AccountingService for HttpAccountingService {
    async fn create_transfer(&self, transfer: TransferRequest) -> Result<(), AccountingError> {
        let response = self
            .client
            .post(format!("{}/transfers", self.base_url))
            .json(&transfer)
            .send()
            .await
            .map_err(|e| AccountingError::Unreachable(e.to_string()))?;

        match response.status() {
            // 409 means this transfer id was already applied
            s if s.is_success() || s == StatusCode::CONFLICT => Ok(()),
            StatusCode::NOT_FOUND => Err(AccountingError::UnknownAccount),
            StatusCode::UNPROCESSABLE_ENTITY => {
                let body = response.text().await.unwrap_or_default();
                Err(AccountingError::Rejected(body))
            }
            s => Err(AccountingError::Unreachable(format!(
                "unexpected status {}",
                s
            ))),
        }
    }

    async fn get_total_sent(&self, account_id: Uuid) -> Result<Option<u64>, AccountingError> {
        let response = self
            .client
            .get(format!("{}/accounts/{}/total-sent", self.base_url, account_id))
            .send()
            .await
            .map_err(|e| AccountingError::Unreachable(e.to_string()))?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            s if s.is_success() => {
                let body: TotalSentResponse = response
                    .json()
                    .await
                    .map_err(|e| AccountingError::Unreachable(e.to_string()))?;
                Ok(Some(body.total_sent))
            }
            s => Err(AccountingError::Unreachable(format!(
                "unexpected status {}",
                s
            ))),
        }
    }

    async fn get_balance(&self, account_id: Uuid) -> Result<Option<u64>, AccountingError> {
        let response = self
            .client
            .get(format!("{}/accounts/{}/balance", self.base_url, account_id))
            .send()
            .await
            .map_err(|e| AccountingError::Unreachable(e.to_string()))?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            s if s.is_success() => {
                let body: BalanceResponse = response
                    .json()
                    .await
                    .map_err(|e| AccountingError::Unreachable(e.to_string()))?;
                Ok(Some(body.balance))
            }
            s => Err(AccountingError::Unreachable(format!(
                "unexpected status {}",
                s
            ))),
        }
    }
}

pub struct HttpRatesService {
    client: reqwest::Client,
    base_url: String,
}

#[async_trait]
impl RatesService for HttpRatesService {
    async fn prices(&self, base_asset_code: &str) -> Result<HashMap<String, f64>, RatesError> {
        let response = self
            .client
            .get(format!("{}/prices", self.base_url))
            .query(&[("base", base_asset_code)])
            .send()
            .await
            .map_err(|e| RatesError::Unavailable(e.to_string()))?;

        if !response.status().is_success() {
            return Err(RatesError::Unavailable(format!(
                "unexpected status {}",
                response.status()
            )));
        }

        response
            .json()
            .await
            .map_err(|e| RatesError::Unavailable(e.to_string()))
    }
}

pub struct HttpAccountService {
    client: reqwest::Client,
    base_url: String,
}

#[async_trait]
impl SubAccountFactory for HttpAccountService {
    async fn get_account(&self, id: Uuid) -> Result<Option<Account>, AccountError> {
        let response = self
            .client
            .get(format!("{}/accounts/{}", self.base_url, id))
            .send()
            .await
            .map_err(|e| AccountError::Unreachable(e.to_string()))?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            s if s.is_success() => {
                let account: Account = response
                    .json()
                    .await
                    .map_err(|e| AccountError::Unreachable(e.to_string()))?;
                Ok(Some(account))
            }
            s => Err(AccountError::Unreachable(format!("unexpected status {}", s))),
        }
    }

    async fn create_sub_account(&self, super_account_id: Uuid) -> Result<Account, AccountError> {
        let response = self
            .client
            .post(format!(
                "{}/accounts/{}/sub-accounts",
                self.base_url, super_account_id
            ))
            .send()
            .await
            .map_err(|e| AccountError::Unreachable(e.to_string()))?;

        match response.status() {
            StatusCode::NOT_FOUND => Err(AccountError::UnknownAccount),
            s if s.is_success() => response
                .json()
                .await
                .map_err(|e| AccountError::Unreachable(e.to_string())),
            s => Err(AccountError::Unreachable(format!("unexpected status {}", s))),
        }
    }
}

/// Client for the stream daemon, covering both plugin scoping and sends
pub struct HttpStreamService {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Debug, Serialize)]
struct OpenPluginRequest {
    account_id: Uuid,
}

#[derive(Debug, Serialize)]
struct SetupRequest<'a> {
    plugin_id: Uuid,
    payment_pointer: Option<&'a str>,
    invoice_url: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct QuoteRequest<'a> {
    plugin_id: Uuid,
    destination: &'a Destination,
    amount_to_send: Option<u64>,
    slippage: f64,
    prices: Option<HashMap<String, f64>>,
}

#[derive(Debug, Serialize)]
struct PayRequest<'a> {
    plugin_id: Uuid,
    destination: &'a Destination,
    quote: &'a Quote,
    progress_offset: u64,
}

/// Error envelope carrying the stream layer's closed error set
#[derive(Debug, Deserialize)]
struct StreamErrorEnvelope {
    code: String,
}

impl HttpStreamService {
    /// Decode an unsuccessful response into the closed error set; anything
    /// undecodable counts as a connector fault (retryable)
    async fn stream_error(response: reqwest::Response) -> StreamError {
        match response.json::<StreamErrorEnvelope>().await {
            Ok(envelope) => {
                StreamError::from_code(&envelope.code).unwrap_or(StreamError::ConnectorError)
            }
            Err(_) => StreamError::ConnectorError,
        }
    }

    async fn post_stream<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        body: &impl Serialize,
    ) -> Result<T, StreamError> {
        let response = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .json(body)
            .send()
            .await
            .map_err(|_| StreamError::ConnectorError)?;

        if !response.status().is_success() {
            return Err(Self::stream_error(response).await);
        }

        response.json().await.map_err(|_| StreamError::ConnectorError)
    }
}

#[async_trait]
impl StreamingService for HttpStreamService {
    async fn setup_payment(
        &self,
        plugin: &Plugin,
        intent: &Intent,
    ) -> Result<Destination, StreamError> {
        self.post_stream(
            "/payments/setup",
            &SetupRequest {
                plugin_id: plugin.id,
                payment_pointer: intent.payment_pointer(),
                invoice_url: intent.invoice_url(),
            },
        )
        .await
    }

    async fn start_quote(
        &self,
        plugin: &Plugin,
        destination: &Destination,
        amount_to_send: Option<u64>,
        slippage: f64,
        prices: Option<HashMap<String, f64>>,
    ) -> Result<StreamQuote, StreamError> {
        self.post_stream(
            "/payments/quote",
            &QuoteRequest {
                plugin_id: plugin.id,
                destination,
                amount_to_send,
                slippage,
                prices,
            },
        )
        .await
    }

    async fn pay(
        &self,
        plugin: &Plugin,
        destination: &Destination,
        quote: &Quote,
        progress_offset: u64,
    ) -> Result<StreamOutcome, StreamError> {
        self.post_stream(
            "/payments/pay",
            &PayRequest {
                plugin_id: plugin.id,
                destination,
                quote,
                progress_offset,
            },
        )
        .await
    }
}

#[async_trait]
impl PluginFactory for HttpStreamService {
    async fn open_plugin(&self, source_account_id: Uuid) -> Result<Plugin, PluginError> {
        let response = self
            .client
            .post(format!("{}/plugins", self.base_url))
            .json(&OpenPluginRequest {
                account_id: source_account_id,
            })
            .send()
            .await
            .map_err(|e| PluginError::Open(e.to_string()))?;

        if !response.status().is_success() {
            return Err(PluginError::Open(format!(
                "unexpected status {}",
                response.status()
            )));
        }

        response
            .json()
            .await
            .map_err(|e| PluginError::Open(e.to_string()))
    }

    async fn close_plugin(&self, plugin: Plugin) -> Result<(), PluginError> {
        let response = self
            .client
            .delete(format!("{}/plugins/{}", self.base_url, plugin.id))
            .send()
            .await
            .map_err(|e| PluginError::Close(e.to_string()))?;

        // Closing an already-closed plugin is fine
        if response.status().is_success() || response.status() == StatusCode::NOT_FOUND {
            Ok(())
        } else {
            Err(PluginError::Close(format!(
                "unexpected status {}",
                response.status()
            )))
        }
    }
}
