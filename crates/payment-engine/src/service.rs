//! Command surface: the only authorized mutator outside the worker pool
//!
//! Every mutating command runs in a single transaction with `FOR UPDATE` on
//! the target row, so commands serialize against the worker holding the same
//! payment.

use anyhow::Context;
use chrono::Utc;
use shared::config::EngineConfig;
use shared::DbPool;
use uuid::Uuid;

use crate::adapters::{Deps, TransferRequest};
use crate::error::{CommandError, CreateError, LifecycleError};
use crate::intent::Intent;
use crate::payment::{Payment, PaymentPatch};
use crate::state::PaymentState;
use crate::store::{Pagination, PaymentPage, PaymentStore};

/// Funding idempotency key, namespaced away from refund keys
pub fn funding_transfer_id(transfer_id: &str) -> String {
    format!("fund:{}", transfer_id)
}

/// Inputs to `create`
#[derive(Debug, Clone)]
pub struct CreateRequest {
    pub intent: Intent,
    pub auto_approve: bool,
    pub super_account_id: Uuid,
    /// Caller-supplied token making retried creates return the same payment
    pub client_token: Option<String>,
}

pub struct PaymentService {
    pool: DbPool,
    deps: Deps,
    config: EngineConfig,
}

impl PaymentService {
    pub fn new(pool: DbPool, deps: Deps, config: EngineConfig) -> Self {
        Self { pool, deps, config }
    }

    /// Admit a new outgoing payment in `Quoting`
    ///
    /// Creates a dedicated source sub-account under the super account. When a
    /// client token is supplied, a retried create returns the payment already
    /// admitted for that token instead of admitting a second one.
    pub async fn create(&self, request: CreateRequest) -> Result<Payment, CreateError> {
        request
            .intent
            .validate()
            .map_err(CreateError::InvalidIntent)?;

        if let Some(token) = request.client_token.as_deref() {
            if let Some(existing) =
                PaymentStore::get_by_client_token(&self.pool, request.super_account_id, token)
                    .await?
            {
                tracing::debug!(
                    payment_id = %existing.id,
                    client_token = token,
                    "create replayed by client token"
                );
                return Ok(existing);
            }
        }

        match self
            .deps
            .sub_accounts
            .get_account(request.super_account_id)
            .await
        {
            Ok(Some(_)) => {}
            Ok(None) => return Err(CreateError::UnknownAccount),
            Err(e) => {
                return Err(CreateError::Internal(
                    anyhow::Error::new(e).context("super account lookup failed"),
                ))
            }
        }

        let source_account = self
            .deps
            .sub_accounts
            .create_sub_account(request.super_account_id)
            .await
            .map_err(|e| {
                CreateError::Internal(anyhow::Error::new(e).context("sub-account creation failed"))
            })?;

        let payment = Payment::admit(
            request.intent,
            request.auto_approve,
            source_account,
            request.super_account_id,
            request.client_token.clone(),
        );

        match PaymentStore::insert(&self.pool, &payment).await {
            Ok(()) => {
                tracing::info!(
                    payment_id = %payment.id,
                    super_account_id = %payment.super_account_id,
                    auto_approve = payment.auto_approve,
                    "outgoing payment created"
                );
                Ok(payment)
            }
            Err(e) => {
                // A concurrent create with the same token may have won the
                // insert race; replay it instead of failing the caller
                if let Some(token) = request.client_token.as_deref() {
                    if is_unique_violation(&e) {
                        let existing = PaymentStore::get_by_client_token(
                            &self.pool,
                            request.super_account_id,
                            token,
                        )
                        .await?
                        .context("payment vanished after client-token conflict")?;
                        return Ok(existing);
                    }
                }
                Err(CreateError::Internal(e))
            }
        }
    }

    /// Activate a quoted payment awaiting approval
    pub async fn approve(&self, id: Uuid) -> Result<Payment, CommandError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("failed to begin transaction")?;
        let payment = PaymentStore::get_by_id_for_update(&mut *tx, id)
            .await?
            .ok_or(CommandError::UnknownPayment(id))?;

        if payment.state != PaymentState::Ready {
            return Err(CommandError::WrongState {
                expected: PaymentState::Ready,
                actual: payment.state,
            });
        }

        let mut patch = PaymentPatch::keep(&payment);
        patch.state = PaymentState::Activated;
        patch.state_attempts = 0;

        let updated = PaymentStore::patch(&mut *tx, id, &patch).await?;
        tx.commit().await.context("failed to commit approval")?;

        tracing::info!(payment_id = %id, "payment approved");
        Ok(updated)
    }

    /// Cancel a quoted payment awaiting approval
    pub async fn cancel(&self, id: Uuid) -> Result<Payment, CommandError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("failed to begin transaction")?;
        let payment = PaymentStore::get_by_id_for_update(&mut *tx, id)
            .await?
            .ok_or(CommandError::UnknownPayment(id))?;

        if payment.state != PaymentState::Ready {
            return Err(CommandError::WrongState {
                expected: PaymentState::Ready,
                actual: payment.state,
            });
        }

        let mut patch = PaymentPatch::keep(&payment);
        patch.state = PaymentState::Cancelling;
        patch.state_attempts = 0;
        patch.error = Some(LifecycleError::CancelledByApi.code().to_string());
        patch.process_at = None;

        let updated = PaymentStore::patch(&mut *tx, id, &patch).await?;
        tx.commit().await.context("failed to commit cancellation")?;

        tracing::info!(payment_id = %id, "payment cancelled by api");
        Ok(updated)
    }

    /// Administratively restart a cancelled payment from scratch
    pub async fn requote(&self, id: Uuid) -> Result<Payment, CommandError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("failed to begin transaction")?;
        let payment = PaymentStore::get_by_id_for_update(&mut *tx, id)
            .await?
            .ok_or(CommandError::UnknownPayment(id))?;

        if payment.state != PaymentState::Cancelled {
            return Err(CommandError::WrongState {
                expected: PaymentState::Cancelled,
                actual: payment.state,
            });
        }

        let patch = PaymentPatch {
            state: PaymentState::Quoting,
            state_attempts: 0,
            destination_account: None,
            quote: None,
            error: None,
            process_at: None,
        };

        let updated = PaymentStore::patch(&mut *tx, id, &patch).await?;
        tx.commit().await.context("failed to commit requote")?;

        tracing::info!(payment_id = %id, "payment requoted");
        Ok(updated)
    }

    /// Reserve funds for an activated payment and start sending
    ///
    /// The transfer from the super account to the source sub-account is
    /// idempotent per `transfer_id`, so a retried fund moves no extra funds.
    pub async fn fund(
        &self,
        id: Uuid,
        amount: u64,
        transfer_id: &str,
    ) -> Result<Payment, CommandError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("failed to begin transaction")?;
        let payment = PaymentStore::get_by_id_for_update(&mut *tx, id)
            .await?
            .ok_or(CommandError::UnknownPayment(id))?;

        if payment.state != PaymentState::Activated {
            return Err(CommandError::WrongState {
                expected: PaymentState::Activated,
                actual: payment.state,
            });
        }

        let quote = payment
            .quote
            .as_ref()
            .with_context(|| format!("activated payment {} has no quote", id))?;
        if quote.is_expired(Utc::now()) {
            return Err(CommandError::QuoteExpired);
        }
        if amount < quote.max_source_amount {
            return Err(CommandError::InsufficientFunds);
        }

        self.deps
            .accounting
            .create_transfer(TransferRequest {
                source_account_id: payment.super_account_id,
                destination_account_id: payment.account_id,
                amount,
                transfer_id: funding_transfer_id(transfer_id),
            })
            .await
            .map_err(CommandError::Funding)?;

        let mut patch = PaymentPatch::keep(&payment);
        patch.state = PaymentState::Sending;
        patch.state_attempts = 0;
        patch.error = None;
        patch.process_at = None;

        let updated = PaymentStore::patch(&mut *tx, id, &patch).await?;
        tx.commit().await.context("failed to commit funding")?;

        tracing::info!(
            payment_id = %id,
            amount = amount,
            transfer_id = transfer_id,
            "payment funded"
        );
        Ok(updated)
    }

    /// Read a single payment
    pub async fn get(&self, id: Uuid) -> Result<Payment, CommandError> {
        PaymentStore::get_by_id(&self.pool, id)
            .await?
            .ok_or(CommandError::UnknownPayment(id))
    }

    /// Cursor-paged listing of payments funded by a super account
    pub async fn list_by_account(
        &self,
        super_account_id: Uuid,
        pagination: Pagination,
    ) -> Result<PaymentPage, CommandError> {
        pagination
            .validate()
            .map_err(|msg| CommandError::Internal(anyhow::anyhow!(msg)))?;
        Ok(PaymentStore::list_by_account(&self.pool, super_account_id, &pagination).await?)
    }

    /// Engine tuning, exposed for ingress glue that reports configuration
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }
}

fn is_unique_violation(err: &anyhow::Error) -> bool {
    err.downcast_ref::<sqlx::Error>()
        .and_then(|e| e.as_database_error())
        .is_some_and(|db| db.is_unique_violation())
}
