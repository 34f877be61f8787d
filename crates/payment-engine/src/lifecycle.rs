//! Lifecycle transitions for outgoing payments
//!
//! Handlers run while the worker holds the row lock. They perform all
//! external effects first and return the patch to commit; they never touch
//! the database themselves. Classified failures become transitions; anything
//! unclassified propagates as an error so the worker rolls back without
//! writing a checkpoint.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rand::Rng;
use shared::config::EngineConfig;
use std::time::Duration;
use uuid::Uuid;

use crate::adapters::{Deps, Destination, Plugin, StreamQuote, TransferRequest};
use crate::error::{ErrorClass, LifecycleError, StreamError};
use crate::payment::{DestinationAccount, Payment, PaymentPatch, Quote};
use crate::state::PaymentState;

/// Refund idempotency key: stable per payment across cancel retries
pub fn refund_transfer_id(payment_id: Uuid) -> String {
    format!("cancel:{}", payment_id)
}

/// Quote the payment over the streaming network
///
/// On success the payment moves to `Ready`, or straight to `Activated` when
/// it was admitted with auto-approval.
pub async fn handle_quoting(
    payment: &Payment,
    deps: &Deps,
    config: &EngineConfig,
) -> Result<PaymentPatch> {
    // Prices are advisory input to the rate probe; a missing rates service
    // must not fail the quote by itself.
    let prices = match deps.rates.prices(&payment.source_account.asset_code).await {
        Ok(prices) => Some(prices),
        Err(e) => {
            tracing::warn!(
                payment_id = %payment.id,
                error = %e,
                "rates lookup failed, probing without prices"
            );
            None
        }
    };

    let plugin = match deps.plugins.open_plugin(payment.account_id).await {
        Ok(plugin) => plugin,
        Err(e) => {
            tracing::warn!(payment_id = %payment.id, error = %e, "plugin open failed");
            return Ok(retry_in_state(
                payment,
                StreamError::EstablishmentFailed.code(),
                config.max_quote_attempts,
                LifecycleError::QuoteFailed,
                config,
            ));
        }
    };

    let result = probe(payment, &plugin, prices, deps, config).await;
    close_plugin(deps, plugin, payment.id).await;

    let (destination, stream_quote) = match result {
        Ok(ok) => ok,
        Err(e) => {
            return Ok(stream_failure(
                payment,
                e,
                config.max_quote_attempts,
                LifecycleError::QuoteFailed,
                config,
            ))
        }
    };

    let now = Utc::now();
    let quote = Quote {
        timestamp: now,
        activation_deadline: now
            + chrono::Duration::milliseconds(config.quote_lifespan.as_millis() as i64),
        target_type: stream_quote.target_type,
        min_delivery_amount: stream_quote.min_delivery_amount,
        max_source_amount: stream_quote.max_source_amount,
        min_exchange_rate: stream_quote.min_exchange_rate,
        low_exchange_rate_estimate: stream_quote.low_exchange_rate_estimate,
        high_exchange_rate_estimate: stream_quote.high_exchange_rate_estimate,
    };

    let mut patch = PaymentPatch::keep(payment);
    patch.state = if payment.auto_approve {
        PaymentState::Activated
    } else {
        PaymentState::Ready
    };
    patch.state_attempts = 0;
    patch.destination_account = Some(DestinationAccount {
        asset_code: destination.asset_code,
        asset_scale: destination.asset_scale,
        url: destination.url,
    });
    patch.quote = Some(quote);
    patch.error = None;
    patch.process_at = None;
    Ok(patch)
}

async fn probe(
    payment: &Payment,
    plugin: &Plugin,
    prices: Option<std::collections::HashMap<String, f64>>,
    deps: &Deps,
    config: &EngineConfig,
) -> std::result::Result<(Destination, StreamQuote), StreamError> {
    let destination = deps.streaming.setup_payment(plugin, &payment.intent).await?;
    let stream_quote = deps
        .streaming
        .start_quote(
            plugin,
            &destination,
            payment.intent.amount_to_send(),
            config.slippage,
            prices,
        )
        .await?;
    Ok((destination, stream_quote))
}

/// Sweep for quoted payments whose activation deadline has passed
///
/// Returns `None` when the quote is still live; `Ready` and `Activated` are
/// otherwise passive states the worker leaves alone.
pub fn handle_deadline(payment: &Payment, now: DateTime<Utc>) -> Option<PaymentPatch> {
    let quote = payment.quote.as_ref()?;
    if !quote.is_expired(now) {
        return None;
    }
    tracing::info!(
        payment_id = %payment.id,
        state = %payment.state,
        "quote expired before funding"
    );
    Some(cancelling(payment, LifecycleError::QuoteExpired.code()))
}

/// Drive (or resume) the packetized send for a funded payment
///
/// The accounting service's total-sent figure for the source sub-account is
/// the resume offset, so a crashed or retried send never re-delivers value
/// already moved.
pub async fn handle_sending(
    payment: &Payment,
    deps: &Deps,
    config: &EngineConfig,
) -> Result<PaymentPatch> {
    let quote = payment
        .quote
        .as_ref()
        .with_context(|| format!("payment {} is sending without a quote", payment.id))?;
    let destination = payment
        .destination_account
        .as_ref()
        .with_context(|| format!("payment {} is sending without a destination", payment.id))?;

    let progress = deps
        .accounting
        .get_total_sent(payment.account_id)
        .await
        .context("total-sent lookup failed")?
        .with_context(|| format!("account {} unknown to accounting", payment.account_id))?;

    let plugin = match deps.plugins.open_plugin(payment.account_id).await {
        Ok(plugin) => plugin,
        Err(e) => {
            tracing::warn!(payment_id = %payment.id, error = %e, "plugin open failed");
            return Ok(retry_in_state(
                payment,
                StreamError::EstablishmentFailed.code(),
                config.max_send_attempts,
                LifecycleError::SendFailed,
                config,
            ));
        }
    };

    let stream_destination = Destination {
        asset_code: destination.asset_code.clone(),
        asset_scale: destination.asset_scale,
        url: destination.url.clone(),
        invoice_amount_to_deliver: None,
    };
    let result = deps
        .streaming
        .pay(&plugin, &stream_destination, quote, progress)
        .await;
    close_plugin(deps, plugin, payment.id).await;

    match result {
        Ok(outcome) => {
            tracing::info!(
                payment_id = %payment.id,
                amount_sent = outcome.amount_sent,
                amount_delivered = outcome.amount_delivered,
                resumed_from = progress,
                "streaming send completed"
            );
            Ok(completed(payment))
        }
        Err(e) => Ok(stream_failure(
            payment,
            e,
            config.max_send_attempts,
            LifecycleError::SendFailed,
            config,
        )),
    }
}

/// Refund unreserved source funds and retire the payment
///
/// The refund key is stable per payment, so a crash between the transfer and
/// the commit moves no additional funds on the retry.
pub async fn handle_cancelling(
    payment: &Payment,
    deps: &Deps,
    config: &EngineConfig,
) -> Result<PaymentPatch> {
    let balance = match deps.accounting.get_balance(payment.account_id).await {
        // An account with no accounting record has nothing to refund
        Ok(balance) => balance.unwrap_or(0),
        Err(e) if e.is_retryable() => {
            tracing::warn!(
                payment_id = %payment.id,
                attempts = payment.state_attempts,
                error = %e,
                "balance lookup failed, cancellation will retry"
            );
            return Ok(cancel_retry(payment, config));
        }
        Err(e) => return Err(e).context("balance lookup rejected"),
    };

    if balance > 0 {
        let transfer = TransferRequest {
            source_account_id: payment.account_id,
            destination_account_id: payment.super_account_id,
            amount: balance,
            transfer_id: refund_transfer_id(payment.id),
        };
        match deps.accounting.create_transfer(transfer).await {
            Ok(()) => {
                tracing::info!(payment_id = %payment.id, refunded = balance, "source funds refunded");
            }
            Err(e) if e.is_retryable() => {
                tracing::warn!(
                    payment_id = %payment.id,
                    attempts = payment.state_attempts,
                    error = %e,
                    "refund transfer failed, cancellation will retry"
                );
                return Ok(cancel_retry(payment, config));
            }
            Err(e) => return Err(e).context("refund transfer rejected"),
        }
    }

    let mut patch = PaymentPatch::keep(payment);
    patch.state = PaymentState::Cancelled;
    patch.state_attempts = 0;
    patch.process_at = None;
    Ok(patch)
}

/// Exponential retry backoff: `base * 2^(attempt-1)` capped at the configured
/// maximum, plus up to one base interval of jitter
pub fn backoff_delay(attempt: u32, config: &EngineConfig) -> Duration {
    let multiplier = 2u32.saturating_pow(attempt.saturating_sub(1));
    let delay = config.backoff_base.saturating_mul(multiplier);
    let capped = std::cmp::min(delay, config.backoff_max);

    let jitter_bound = config.backoff_base.as_millis() as u64;
    if jitter_bound == 0 {
        return capped;
    }
    capped + Duration::from_millis(rand::thread_rng().gen_range(0..jitter_bound))
}

fn next_process_at(attempt: u32, config: &EngineConfig) -> DateTime<Utc> {
    Utc::now() + chrono::Duration::milliseconds(backoff_delay(attempt, config).as_millis() as i64)
}

fn stream_failure(
    payment: &Payment,
    error: StreamError,
    max_attempts: u32,
    exhausted: LifecycleError,
    config: &EngineConfig,
) -> PaymentPatch {
    match error.classify() {
        ErrorClass::Done => {
            tracing::info!(
                payment_id = %payment.id,
                error = %error,
                "nothing left to deliver, completing"
            );
            completed(payment)
        }
        ErrorClass::Terminal => {
            tracing::warn!(
                payment_id = %payment.id,
                state = %payment.state,
                error = %error,
                "terminal streaming failure, cancelling"
            );
            cancelling(payment, error.code())
        }
        ErrorClass::Retryable => {
            tracing::warn!(
                payment_id = %payment.id,
                state = %payment.state,
                attempts = payment.state_attempts,
                error = %error,
                "retryable streaming failure"
            );
            retry_in_state(payment, error.code(), max_attempts, exhausted, config)
        }
    }
}

/// Record one more failed attempt, cancelling once the bound is exceeded
fn retry_in_state(
    payment: &Payment,
    last_error: &str,
    max_attempts: u32,
    exhausted: LifecycleError,
    config: &EngineConfig,
) -> PaymentPatch {
    let attempts = payment.state_attempts + 1;
    if attempts > max_attempts {
        return cancelling(payment, exhausted.code());
    }
    let mut patch = PaymentPatch::keep(payment);
    patch.state_attempts = attempts;
    patch.error = Some(last_error.to_string());
    patch.process_at = Some(next_process_at(attempts, config));
    patch
}

/// Unbounded cancellation retry; keeps the error that caused the cancellation
fn cancel_retry(payment: &Payment, config: &EngineConfig) -> PaymentPatch {
    let attempts = payment.state_attempts + 1;
    let mut patch = PaymentPatch::keep(payment);
    patch.state_attempts = attempts;
    patch.process_at = Some(next_process_at(attempts, config));
    patch
}

fn cancelling(payment: &Payment, code: &str) -> PaymentPatch {
    let mut patch = PaymentPatch::keep(payment);
    patch.state = PaymentState::Cancelling;
    patch.state_attempts = 0;
    patch.error = Some(code.to_string());
    patch.process_at = None;
    patch
}

fn completed(payment: &Payment) -> PaymentPatch {
    let mut patch = PaymentPatch::keep(payment);
    patch.state = PaymentState::Completed;
    patch.state_attempts = 0;
    patch.error = None;
    patch.process_at = None;
    patch
}

async fn close_plugin(deps: &Deps, plugin: Plugin, payment_id: Uuid) {
    if let Err(e) = deps.plugins.close_plugin(plugin).await {
        // Leaked plugins stall the streaming backend; make noise but never
        // fail the transition over a close error.
        tracing::error!(payment_id = %payment_id, error = %e, "failed to close plugin");
    }
}
