//! Payment store: the `outgoing_payments` repository
//!
//! All mutating callers hold a row lock: the command service locks a single
//! row with `FOR UPDATE`, the worker pool claims eligible rows with
//! `FOR UPDATE SKIP LOCKED`. Commits always write the full mutable column set
//! of a [`PaymentPatch`] plus `updated_at`.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use shared::DbPool;
use sqlx::{Executor, FromRow, Postgres};
use uuid::Uuid;

use crate::intent::Intent;
use crate::payment::{DestinationAccount, Payment, PaymentPatch, Quote, SourceAccount};
use crate::state::PaymentState;

/// Column list shared by every SELECT/RETURNING in this module
const COLUMNS: &str = "id, state, state_attempts, \
     payment_pointer, amount_to_send, invoice_url, auto_approve, \
     account_id, super_account_id, source_asset_code, source_asset_scale, \
     destination_asset_code, destination_asset_scale, destination_url, \
     quote_timestamp, quote_activation_deadline, quote_target_type, \
     quote_min_delivery_amount, quote_max_source_amount, quote_min_exchange_rate, \
     quote_low_exchange_rate_estimate, quote_high_exchange_rate_estimate, \
     error, client_token, process_at, created_at, updated_at";

/// Flat database mirror of a payment row
#[derive(Debug, Clone, FromRow)]
struct PaymentRow {
    id: Uuid,
    state: String,
    state_attempts: i32,
    payment_pointer: Option<String>,
    amount_to_send: Option<i64>,
    invoice_url: Option<String>,
    auto_approve: bool,
    account_id: Uuid,
    super_account_id: Uuid,
    source_asset_code: String,
    source_asset_scale: i16,
    destination_asset_code: Option<String>,
    destination_asset_scale: Option<i16>,
    destination_url: Option<String>,
    quote_timestamp: Option<DateTime<Utc>>,
    quote_activation_deadline: Option<DateTime<Utc>>,
    quote_target_type: Option<String>,
    quote_min_delivery_amount: Option<i64>,
    quote_max_source_amount: Option<i64>,
    quote_min_exchange_rate: Option<f64>,
    quote_low_exchange_rate_estimate: Option<f64>,
    quote_high_exchange_rate_estimate: Option<f64>,
    error: Option<String>,
    client_token: Option<String>,
    process_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<PaymentRow> for Payment {
    type Error = anyhow::Error;

    fn try_from(row: PaymentRow) -> Result<Self> {
        let state: PaymentState = row.state.parse()?;

        let intent = match (row.payment_pointer, row.invoice_url) {
            (Some(payment_pointer), None) => Intent::FixedSend {
                payment_pointer,
                amount_to_send: row
                    .amount_to_send
                    .with_context(|| format!("row {} is fixed-send without an amount", row.id))?
                    .try_into()
                    .context("negative amount_to_send")?,
            },
            (None, Some(invoice_url)) => Intent::Invoice { invoice_url },
            _ => bail!("row {} has an ambiguous intent", row.id),
        };

        let destination_account = match (
            row.destination_asset_code,
            row.destination_asset_scale,
            row.destination_url,
        ) {
            (Some(asset_code), Some(asset_scale), Some(url)) => Some(DestinationAccount {
                asset_code,
                asset_scale: u8::try_from(asset_scale).context("destination scale out of range")?,
                url,
            }),
            (None, None, None) => None,
            _ => bail!("row {} has a partial destination", row.id),
        };

        let quote = match row.quote_timestamp {
            None => None,
            Some(timestamp) => Some(Quote {
                timestamp,
                activation_deadline: row
                    .quote_activation_deadline
                    .with_context(|| format!("row {} quote has no deadline", row.id))?,
                target_type: row
                    .quote_target_type
                    .with_context(|| format!("row {} quote has no target type", row.id))?
                    .parse()?,
                min_delivery_amount: row
                    .quote_min_delivery_amount
                    .with_context(|| format!("row {} quote has no delivery amount", row.id))?
                    .try_into()
                    .context("negative min_delivery_amount")?,
                max_source_amount: row
                    .quote_max_source_amount
                    .with_context(|| format!("row {} quote has no source amount", row.id))?
                    .try_into()
                    .context("negative max_source_amount")?,
                min_exchange_rate: row
                    .quote_min_exchange_rate
                    .with_context(|| format!("row {} quote has no minimum rate", row.id))?,
                low_exchange_rate_estimate: row
                    .quote_low_exchange_rate_estimate
                    .with_context(|| format!("row {} quote has no low estimate", row.id))?,
                high_exchange_rate_estimate: row
                    .quote_high_exchange_rate_estimate
                    .with_context(|| format!("row {} quote has no high estimate", row.id))?,
            }),
        };

        // A quoted-but-unfinished payment must carry its quote
        if matches!(
            state,
            PaymentState::Ready | PaymentState::Activated | PaymentState::Sending
        ) && quote.is_none()
        {
            bail!("row {} in state {} has no quote", row.id, state);
        }

        Ok(Payment {
            id: row.id,
            state,
            state_attempts: u32::try_from(row.state_attempts).context("negative attempts")?,
            intent,
            auto_approve: row.auto_approve,
            account_id: row.account_id,
            super_account_id: row.super_account_id,
            source_account: SourceAccount {
                id: row.account_id,
                asset_code: row.source_asset_code,
                asset_scale: u8::try_from(row.source_asset_scale)
                    .context("source scale out of range")?,
            },
            destination_account,
            quote,
            error: row.error,
            client_token: row.client_token,
            process_at: row.process_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn to_bigint(amount: u64) -> Result<i64> {
    i64::try_from(amount).context("amount exceeds signed 64-bit range")
}

/// Paging direction for `list_by_account`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Backward,
}

/// Cursor paging parameters
#[derive(Debug, Clone)]
pub struct Pagination {
    /// Payment id to page from, exclusive; `None` starts at the first
    /// (forward) or last (backward) page
    pub cursor: Option<Uuid>,
    pub limit: i64,
    pub direction: Direction,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            cursor: None,
            limit: 20,
            direction: Direction::Forward,
        }
    }
}

impl Pagination {
    pub fn forward(cursor: Option<Uuid>, limit: i64) -> Self {
        Self {
            cursor,
            limit,
            direction: Direction::Forward,
        }
    }

    pub fn backward(cursor: Option<Uuid>, limit: i64) -> Self {
        Self {
            cursor,
            limit,
            direction: Direction::Backward,
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.limit < 1 || self.limit > 100 {
            return Err("Limit must be between 1 and 100".to_string());
        }
        Ok(())
    }
}

/// One page of payments, always in ascending creation order
#[derive(Debug, Clone)]
pub struct PaymentPage {
    pub payments: Vec<Payment>,
    pub has_next_page: bool,
    pub has_previous_page: bool,
}

pub struct PaymentStore;

impl PaymentStore {
    /// Persist a freshly admitted payment
    pub async fn insert<'e, E>(executor: E, payment: &Payment) -> Result<()>
    where
        E: Executor<'e, Database = Postgres>,
    {
        let sql = format!(
            "INSERT INTO outgoing_payments ({COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, \
                     $15, $16, $17, $18, $19, $20, $21, $22, $23, $24, $25, $26, $27)"
        );

        let quote = payment.quote.as_ref();
        sqlx::query(&sql)
            .bind(payment.id)
            .bind(payment.state.as_str())
            .bind(i32::try_from(payment.state_attempts).context("attempts out of range")?)
            .bind(payment.intent.payment_pointer())
            .bind(
                payment
                    .intent
                    .amount_to_send()
                    .map(to_bigint)
                    .transpose()?,
            )
            .bind(payment.intent.invoice_url())
            .bind(payment.auto_approve)
            .bind(payment.account_id)
            .bind(payment.super_account_id)
            .bind(payment.source_account.asset_code.as_str())
            .bind(i16::from(payment.source_account.asset_scale))
            .bind(
                payment
                    .destination_account
                    .as_ref()
                    .map(|d| d.asset_code.as_str()),
            )
            .bind(
                payment
                    .destination_account
                    .as_ref()
                    .map(|d| i16::from(d.asset_scale)),
            )
            .bind(payment.destination_account.as_ref().map(|d| d.url.as_str()))
            .bind(quote.map(|q| q.timestamp))
            .bind(quote.map(|q| q.activation_deadline))
            .bind(quote.map(|q| q.target_type.as_str()))
            .bind(quote.map(|q| to_bigint(q.min_delivery_amount)).transpose()?)
            .bind(quote.map(|q| to_bigint(q.max_source_amount)).transpose()?)
            .bind(quote.map(|q| q.min_exchange_rate))
            .bind(quote.map(|q| q.low_exchange_rate_estimate))
            .bind(quote.map(|q| q.high_exchange_rate_estimate))
            .bind(payment.error.as_deref())
            .bind(payment.client_token.as_deref())
            .bind(payment.process_at)
            .bind(payment.created_at)
            .bind(payment.updated_at)
            .execute(executor)
            .await
            .context("Failed to insert payment")?;

        Ok(())
    }

    /// Fetch a payment without locking
    pub async fn get_by_id<'e, E>(executor: E, id: Uuid) -> Result<Option<Payment>>
    where
        E: Executor<'e, Database = Postgres>,
    {
        let sql = format!("SELECT {COLUMNS} FROM outgoing_payments WHERE id = $1");
        let row = sqlx::query_as::<_, PaymentRow>(&sql)
            .bind(id)
            .fetch_optional(executor)
            .await
            .context("Failed to fetch payment")?;

        row.map(Payment::try_from).transpose()
    }

    /// Replay lookup for `create` idempotency tokens
    pub async fn get_by_client_token<'e, E>(
        executor: E,
        super_account_id: Uuid,
        client_token: &str,
    ) -> Result<Option<Payment>>
    where
        E: Executor<'e, Database = Postgres>,
    {
        let sql = format!(
            "SELECT {COLUMNS} FROM outgoing_payments \
             WHERE super_account_id = $1 AND client_token = $2"
        );
        let row = sqlx::query_as::<_, PaymentRow>(&sql)
            .bind(super_account_id)
            .bind(client_token)
            .fetch_optional(executor)
            .await
            .context("Failed to fetch payment by client token")?;

        row.map(Payment::try_from).transpose()
    }

    /// Fetch and exclusively lock one payment row
    ///
    /// Must run inside a transaction; the lock is held until commit/rollback.
    pub async fn get_by_id_for_update<'e, E>(executor: E, id: Uuid) -> Result<Option<Payment>>
    where
        E: Executor<'e, Database = Postgres>,
    {
        let sql = format!("SELECT {COLUMNS} FROM outgoing_payments WHERE id = $1 FOR UPDATE");
        let row = sqlx::query_as::<_, PaymentRow>(&sql)
            .bind(id)
            .fetch_optional(executor)
            .await
            .context("Failed to lock payment")?;

        row.map(Payment::try_from).transpose()
    }

    /// Claim the next worker-eligible payment, skipping rows locked elsewhere
    ///
    /// Eligible means: a worker-actionable state whose backoff deadline has
    /// passed, or a quoted payment whose activation deadline has passed.
    /// Ordered by `updated_at` for fairness. Must run inside a transaction.
    pub async fn next_eligible<'e, E>(executor: E, now: DateTime<Utc>) -> Result<Option<Payment>>
    where
        E: Executor<'e, Database = Postgres>,
    {
        let sql = format!(
            "SELECT {COLUMNS} FROM outgoing_payments \
             WHERE (state IN ('quoting', 'sending', 'cancelling') \
                    AND (process_at IS NULL OR process_at <= $1)) \
                OR (state IN ('ready', 'activated') \
                    AND quote_activation_deadline <= $1) \
             ORDER BY updated_at ASC \
             LIMIT 1 \
             FOR UPDATE SKIP LOCKED"
        );
        let row = sqlx::query_as::<_, PaymentRow>(&sql)
            .bind(now)
            .fetch_optional(executor)
            .await
            .context("Failed to claim next eligible payment")?;

        row.map(Payment::try_from).transpose()
    }

    /// Commit one transition: write the full mutable column set and bump
    /// `updated_at`, returning the payment as persisted
    pub async fn patch<'e, E>(executor: E, id: Uuid, patch: &PaymentPatch) -> Result<Payment>
    where
        E: Executor<'e, Database = Postgres>,
    {
        let sql = format!(
            "UPDATE outgoing_payments SET \
                state = $2, \
                state_attempts = $3, \
                destination_asset_code = $4, \
                destination_asset_scale = $5, \
                destination_url = $6, \
                quote_timestamp = $7, \
                quote_activation_deadline = $8, \
                quote_target_type = $9, \
                quote_min_delivery_amount = $10, \
                quote_max_source_amount = $11, \
                quote_min_exchange_rate = $12, \
                quote_low_exchange_rate_estimate = $13, \
                quote_high_exchange_rate_estimate = $14, \
                error = $15, \
                process_at = $16, \
                updated_at = NOW() \
             WHERE id = $1 \
             RETURNING {COLUMNS}"
        );

        let quote = patch.quote.as_ref();
        let row = sqlx::query_as::<_, PaymentRow>(&sql)
            .bind(id)
            .bind(patch.state.as_str())
            .bind(i32::try_from(patch.state_attempts).context("attempts out of range")?)
            .bind(
                patch
                    .destination_account
                    .as_ref()
                    .map(|d| d.asset_code.as_str()),
            )
            .bind(
                patch
                    .destination_account
                    .as_ref()
                    .map(|d| i16::from(d.asset_scale)),
            )
            .bind(patch.destination_account.as_ref().map(|d| d.url.as_str()))
            .bind(quote.map(|q| q.timestamp))
            .bind(quote.map(|q| q.activation_deadline))
            .bind(quote.map(|q| q.target_type.as_str()))
            .bind(quote.map(|q| to_bigint(q.min_delivery_amount)).transpose()?)
            .bind(quote.map(|q| to_bigint(q.max_source_amount)).transpose()?)
            .bind(quote.map(|q| q.min_exchange_rate))
            .bind(quote.map(|q| q.low_exchange_rate_estimate))
            .bind(quote.map(|q| q.high_exchange_rate_estimate))
            .bind(patch.error.as_deref())
            .bind(patch.process_at)
            .fetch_optional(executor)
            .await
            .context("Failed to patch payment")?
            .with_context(|| format!("Payment {} disappeared during patch", id))?;

        row.try_into()
    }

    /// Cursor-paged listing of the payments funded by one super account
    ///
    /// Probes one row beyond the requested page in the paging direction, and
    /// one row on the opposite side of the cursor, so both `has_next_page`
    /// and `has_previous_page` are exact.
    pub async fn list_by_account(
        pool: &DbPool,
        super_account_id: Uuid,
        pagination: &Pagination,
    ) -> Result<PaymentPage> {
        let probe_limit = pagination.limit + 1;

        let cursor = match pagination.cursor {
            None => None,
            Some(cursor_id) => {
                let created_at = sqlx::query_scalar::<_, DateTime<Utc>>(
                    "SELECT created_at FROM outgoing_payments \
                     WHERE id = $1 AND super_account_id = $2",
                )
                .bind(cursor_id)
                .bind(super_account_id)
                .fetch_optional(pool)
                .await
                .context("Failed to resolve page cursor")?
                .with_context(|| format!("Cursor payment {} not found", cursor_id))?;
                Some((created_at, cursor_id))
            }
        };

        let (mut rows, opposite_exists) = match (pagination.direction, cursor) {
            (Direction::Forward, None) => {
                let sql = format!(
                    "SELECT {COLUMNS} FROM outgoing_payments WHERE super_account_id = $1 \
                     ORDER BY created_at ASC, id ASC LIMIT $2"
                );
                let rows = sqlx::query_as::<_, PaymentRow>(&sql)
                    .bind(super_account_id)
                    .bind(probe_limit)
                    .fetch_all(pool)
                    .await
                    .context("Failed to list payments")?;
                (rows, false)
            }
            (Direction::Forward, Some((created_at, id))) => {
                let sql = format!(
                    "SELECT {COLUMNS} FROM outgoing_payments \
                     WHERE super_account_id = $1 AND (created_at, id) > ($2, $3) \
                     ORDER BY created_at ASC, id ASC LIMIT $4"
                );
                let rows = sqlx::query_as::<_, PaymentRow>(&sql)
                    .bind(super_account_id)
                    .bind(created_at)
                    .bind(id)
                    .bind(probe_limit)
                    .fetch_all(pool)
                    .await
                    .context("Failed to list payments")?;
                let before = sqlx::query_scalar::<_, bool>(
                    "SELECT EXISTS (SELECT 1 FROM outgoing_payments \
                     WHERE super_account_id = $1 AND (created_at, id) <= ($2, $3))",
                )
                .bind(super_account_id)
                .bind(created_at)
                .bind(id)
                .fetch_one(pool)
                .await
                .context("Failed to probe previous page")?;
                (rows, before)
            }
            (Direction::Backward, None) => {
                let sql = format!(
                    "SELECT {COLUMNS} FROM outgoing_payments WHERE super_account_id = $1 \
                     ORDER BY created_at DESC, id DESC LIMIT $2"
                );
                let rows = sqlx::query_as::<_, PaymentRow>(&sql)
                    .bind(super_account_id)
                    .bind(probe_limit)
                    .fetch_all(pool)
                    .await
                    .context("Failed to list payments")?;
                (rows, false)
            }
            (Direction::Backward, Some((created_at, id))) => {
                let sql = format!(
                    "SELECT {COLUMNS} FROM outgoing_payments \
                     WHERE super_account_id = $1 AND (created_at, id) < ($2, $3) \
                     ORDER BY created_at DESC, id DESC LIMIT $4"
                );
                let rows = sqlx::query_as::<_, PaymentRow>(&sql)
                    .bind(super_account_id)
                    .bind(created_at)
                    .bind(id)
                    .bind(probe_limit)
                    .fetch_all(pool)
                    .await
                    .context("Failed to list payments")?;
                let after = sqlx::query_scalar::<_, bool>(
                    "SELECT EXISTS (SELECT 1 FROM outgoing_payments \
                     WHERE super_account_id = $1 AND (created_at, id) >= ($2, $3))",
                )
                .bind(super_account_id)
                .bind(created_at)
                .bind(id)
                .fetch_one(pool)
                .await
                .context("Failed to probe next page")?;
                (rows, after)
            }
        };

        let overflowed = rows.len() as i64 > pagination.limit;
        if overflowed {
            rows.truncate(pagination.limit as usize);
        }

        let mut payments = rows
            .into_iter()
            .map(Payment::try_from)
            .collect::<Result<Vec<_>>>()?;

        let (has_next_page, has_previous_page) = match pagination.direction {
            Direction::Forward => (overflowed, opposite_exists),
            Direction::Backward => {
                payments.reverse();
                (opposite_exists, overflowed)
            }
        };

        Ok(PaymentPage {
            payments,
            has_next_page,
            has_previous_page,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payment::PaymentType;

    fn fixed_send_row() -> PaymentRow {
        let now = Utc::now();
        PaymentRow {
            id: Uuid::new_v4(),
            state: "quoting".to_string(),
            state_attempts: 0,
            payment_pointer: Some("$wallet.example/alice".to_string()),
            amount_to_send: Some(1000),
            invoice_url: None,
            auto_approve: true,
            account_id: Uuid::new_v4(),
            super_account_id: Uuid::new_v4(),
            source_asset_code: "USD".to_string(),
            source_asset_scale: 2,
            destination_asset_code: None,
            destination_asset_scale: None,
            destination_url: None,
            quote_timestamp: None,
            quote_activation_deadline: None,
            quote_target_type: None,
            quote_min_delivery_amount: None,
            quote_max_source_amount: None,
            quote_min_exchange_rate: None,
            quote_low_exchange_rate_estimate: None,
            quote_high_exchange_rate_estimate: None,
            error: None,
            client_token: None,
            process_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_row_decodes_fixed_send() {
        let row = fixed_send_row();
        let payment = Payment::try_from(row.clone()).unwrap();

        assert_eq!(payment.state, PaymentState::Quoting);
        assert_eq!(
            payment.intent,
            Intent::FixedSend {
                payment_pointer: "$wallet.example/alice".to_string(),
                amount_to_send: 1000,
            }
        );
        assert_eq!(payment.source_account.id, row.account_id);
        assert!(payment.quote.is_none());
    }

    #[test]
    fn test_row_with_quote_decodes() {
        let now = Utc::now();
        let mut row = fixed_send_row();
        row.state = "ready".to_string();
        row.destination_asset_code = Some("EUR".to_string());
        row.destination_asset_scale = Some(2);
        row.destination_url = Some("https://wallet.example/alice".to_string());
        row.quote_timestamp = Some(now);
        row.quote_activation_deadline = Some(now + chrono::Duration::seconds(5));
        row.quote_target_type = Some("fixed_send".to_string());
        row.quote_min_delivery_amount = Some(920);
        row.quote_max_source_amount = Some(1010);
        row.quote_min_exchange_rate = Some(0.92);
        row.quote_low_exchange_rate_estimate = Some(0.92);
        row.quote_high_exchange_rate_estimate = Some(0.94);

        let payment = Payment::try_from(row).unwrap();
        let quote = payment.quote.unwrap();
        assert_eq!(quote.target_type, PaymentType::FixedSend);
        assert_eq!(quote.max_source_amount, 1010);
        assert_eq!(payment.destination_account.unwrap().asset_code, "EUR");
    }

    #[test]
    fn test_ambiguous_intent_rejected() {
        let mut row = fixed_send_row();
        row.invoice_url = Some("https://receiver.example/invoice/1".to_string());
        assert!(Payment::try_from(row).is_err());

        let mut row = fixed_send_row();
        row.payment_pointer = None;
        row.amount_to_send = None;
        assert!(Payment::try_from(row).is_err());
    }

    #[test]
    fn test_quoted_state_requires_quote() {
        let mut row = fixed_send_row();
        row.state = "sending".to_string();
        let err = Payment::try_from(row).unwrap_err();
        assert!(err.to_string().contains("no quote"));
    }

    #[test]
    fn test_partial_quote_rejected() {
        let mut row = fixed_send_row();
        row.quote_timestamp = Some(Utc::now());
        assert!(Payment::try_from(row).is_err());
    }

    #[test]
    fn test_pagination_validate() {
        assert!(Pagination::forward(None, 20).validate().is_ok());
        assert!(Pagination::forward(None, 1).validate().is_ok());
        assert!(Pagination::forward(None, 100).validate().is_ok());
        assert!(Pagination::forward(None, 0).validate().is_err());
        assert!(Pagination::backward(None, 101).validate().is_err());
    }
}
