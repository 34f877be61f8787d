//! Worker loop: claims eligible payments under row locks and drives transitions
//!
//! A fixed-size pool of tasks polls the store. Each iteration claims at most
//! one row with `FOR UPDATE SKIP LOCKED`, dispatches to the lifecycle handler
//! while the lock is held, and commits the resulting patch in the same
//! transaction. A handler fault rolls the transaction back: no checkpoint is
//! written, attempts are not incremented, and the row becomes eligible again.

use anyhow::{bail, Context, Result};
use chrono::Utc;
use rand::Rng;
use shared::config::EngineConfig;
use shared::DbPool;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::adapters::Deps;
use crate::lifecycle;
use crate::payment::{Payment, PaymentPatch};
use crate::state::PaymentState;
use crate::store::PaymentStore;

pub struct PaymentWorker {
    worker_id: usize,
    pool: DbPool,
    deps: Deps,
    config: EngineConfig,
    shutdown: CancellationToken,
}

impl PaymentWorker {
    pub fn new(
        worker_id: usize,
        pool: DbPool,
        deps: Deps,
        config: EngineConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            worker_id,
            pool,
            deps,
            config,
            shutdown,
        }
    }

    /// Run until the shutdown token fires
    pub async fn run(self) {
        tracing::info!(worker_id = self.worker_id, "payment worker started");

        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            match self.tick().await {
                // Claimed and committed a payment; look for more right away
                Ok(true) => {}
                Ok(false) => self.idle().await,
                Err(e) => {
                    tracing::error!(
                        worker_id = self.worker_id,
                        error = format!("{:#}", e),
                        "worker iteration failed"
                    );
                    self.idle().await;
                }
            }
        }

        tracing::info!(worker_id = self.worker_id, "payment worker stopped");
    }

    /// One poll: claim, dispatch, commit
    ///
    /// Returns `Ok(true)` when a row was claimed (committed or deliberately
    /// rolled back), `Ok(false)` when there was nothing to do.
    async fn tick(&self) -> Result<bool> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("failed to begin transaction")?;

        let now = Utc::now();
        let Some(payment) = PaymentStore::next_eligible(&mut *tx, now).await? else {
            tx.commit().await.context("failed to commit empty poll")?;
            return Ok(false);
        };

        let from = payment.state;

        // Racing the handler against shutdown releases the row promptly: the
        // dropped transaction rolls back and no checkpoint is written.
        let dispatched = tokio::select! {
            _ = self.shutdown.cancelled() => {
                tracing::info!(
                    worker_id = self.worker_id,
                    payment_id = %payment.id,
                    "shutdown requested, releasing row without checkpoint"
                );
                return Ok(false);
            }
            result = self.dispatch(&payment) => result,
        };

        let patch = match dispatched {
            Ok(Some(patch)) => patch,
            // Deadline sweep found the quote still live; leave the row alone
            Ok(None) => {
                tx.commit().await.context("failed to commit no-op poll")?;
                return Ok(true);
            }
            Err(e) => {
                tracing::error!(
                    worker_id = self.worker_id,
                    payment_id = %payment.id,
                    state = %from,
                    attempts = payment.state_attempts,
                    error = format!("{:#}", e),
                    "handler failed, rolling back without checkpoint"
                );
                // tx dropped: rollback. Idle before the next claim so a
                // persistent fault does not spin on the same row.
                return Ok(false);
            }
        };

        let committed = PaymentStore::patch(&mut *tx, payment.id, &patch).await?;
        tx.commit().await.context("failed to commit transition")?;

        tracing::info!(
            worker_id = self.worker_id,
            payment_id = %committed.id,
            from = %from,
            to = %committed.state,
            attempts = committed.state_attempts,
            error = committed.error.as_deref().unwrap_or(""),
            "payment transition committed"
        );
        Ok(true)
    }

    async fn dispatch(&self, payment: &Payment) -> Result<Option<PaymentPatch>> {
        match payment.state {
            PaymentState::Quoting => lifecycle::handle_quoting(payment, &self.deps, &self.config)
                .await
                .map(Some),
            PaymentState::Ready | PaymentState::Activated => {
                Ok(lifecycle::handle_deadline(payment, Utc::now()))
            }
            PaymentState::Sending => lifecycle::handle_sending(payment, &self.deps, &self.config)
                .await
                .map(Some),
            PaymentState::Cancelling => {
                lifecycle::handle_cancelling(payment, &self.deps, &self.config)
                    .await
                    .map(Some)
            }
            PaymentState::Completed | PaymentState::Cancelled => {
                bail!("terminal payment {} claimed as eligible", payment.id)
            }
        }
    }

    /// Sleep the idle interval (with jitter), or until shutdown
    async fn idle(&self) {
        let base = self.config.worker_idle_interval;
        let jitter_bound = (base.as_millis() as u64 / 4).max(1);
        let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..jitter_bound));

        tokio::select! {
            _ = self.shutdown.cancelled() => {}
            _ = tokio::time::sleep(base + jitter) => {}
        }
    }
}

/// Spawn the configured number of workers sharing one dependency record
pub fn spawn_workers(
    pool: DbPool,
    deps: Deps,
    config: EngineConfig,
    shutdown: CancellationToken,
) -> Vec<JoinHandle<()>> {
    (0..config.worker_count)
        .map(|worker_id| {
            let worker = PaymentWorker::new(
                worker_id,
                pool.clone(),
                deps.clone(),
                config.clone(),
                shutdown.clone(),
            );
            tokio::spawn(worker.run())
        })
        .collect()
}
