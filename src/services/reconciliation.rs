//! Background self-healing passes.
//!
//! The pending sweep re-drives finalization for recent orders that may have
//! missed their webhook or redirect. The drift pass looks at older unresolved
//! orders and corrects local payment status from the gateway. Neither is the
//! only path to correctness; both go through the same finalize call.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use metrics::counter;
use rand::Rng;
use sea_orm::{ActiveModelTrait, Set, TransactionTrait};
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::{
    config::ReconciliationConfig,
    db::DbPool,
    entities::order::{ActiveModel as OrderActiveModel, Model as OrderModel, OrderStatus, PaymentStatus},
    errors::ServiceError,
    gateway::CheckoutGateway,
    services::finalization::FinalizationService,
    services::orders::{append_payment_event, lock_order, OrderService},
};

/// Maps the gateway's payment vocabulary onto local payment status.
///
/// Unknown values map to `None`, which callers treat as "leave alone".
pub fn normalize_gateway_status(raw: &str) -> Option<PaymentStatus> {
    match raw.trim().to_ascii_uppercase().as_str() {
        "SUCCESS" | "APPROVED" => Some(PaymentStatus::Paid),
        "FAILURE" | "DECLINED" => Some(PaymentStatus::Failed),
        "INIT_THREEDS" | "CALLBACK_THREEDS" | "PENDING" => Some(PaymentStatus::Pending),
        _ => None,
    }
}

/// Exponential delay before retry `attempt` (1-based), capped at `max`.
pub fn backoff_delay(attempt: u32, base: StdDuration, max: StdDuration) -> StdDuration {
    let exponent = attempt.saturating_sub(1).min(20);
    base.saturating_mul(1u32 << exponent).min(max)
}

/// Spreads `delay` over `[delay/2, delay]`.
fn with_jitter(delay: StdDuration) -> StdDuration {
    let half = delay / 2;
    let spread = half.as_millis() as u64;
    if spread == 0 {
        return delay;
    }
    half + StdDuration::from_millis(rand::thread_rng().gen_range(0..=spread))
}

#[derive(Debug, Clone)]
struct RetryState {
    attempts: u32,
    next_eligible_at: DateTime<Utc>,
    last_attempt_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub scanned: usize,
    pub finalized: usize,
    pub declined: usize,
    pub errors: usize,
    /// Waiting out backoff or past the retry ceiling
    pub skipped: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DriftReport {
    pub scanned: usize,
    pub redriven: usize,
    pub corrected: usize,
    pub unchanged: usize,
    pub errors: usize,
}

#[derive(Clone)]
pub struct ReconciliationService {
    db_pool: Arc<DbPool>,
    orders: OrderService,
    finalizer: FinalizationService,
    gateway: Arc<dyn CheckoutGateway>,
    config: ReconciliationConfig,
    retries: Arc<DashMap<Uuid, RetryState>>,
}

impl ReconciliationService {
    pub fn new(
        db_pool: Arc<DbPool>,
        finalizer: FinalizationService,
        gateway: Arc<dyn CheckoutGateway>,
        config: ReconciliationConfig,
    ) -> Self {
        Self {
            orders: OrderService::new(db_pool.clone(), None),
            db_pool,
            finalizer,
            gateway,
            config,
            retries: Arc::new(DashMap::new()),
        }
    }

    fn pending_window(&self) -> Duration {
        Duration::seconds(self.config.pending_window_secs as i64)
    }

    /// Attempts recorded so far for an order; zero once it resolved.
    pub fn attempts_for(&self, order_id: Uuid) -> u32 {
        self.retries.get(&order_id).map(|s| s.attempts).unwrap_or(0)
    }

    fn eligible(&self, order_id: Uuid, now: DateTime<Utc>) -> bool {
        match self.retries.get(&order_id) {
            None => true,
            Some(state) => {
                state.attempts < self.config.max_attempts && state.next_eligible_at <= now
            }
        }
    }

    fn record_attempt(&self, order_id: Uuid, now: DateTime<Utc>) {
        let mut entry = self.retries.entry(order_id).or_insert(RetryState {
            attempts: 0,
            next_eligible_at: now,
            last_attempt_at: now,
        });
        entry.attempts += 1;
        entry.last_attempt_at = now;
        let delay = with_jitter(backoff_delay(
            entry.attempts,
            StdDuration::from_secs(self.config.backoff_base_secs),
            StdDuration::from_secs(self.config.backoff_max_secs),
        ));
        entry.next_eligible_at = now + Duration::from_std(delay).unwrap_or_else(|_| Duration::seconds(0));
        if entry.attempts >= self.config.max_attempts {
            warn!(order_id = %order_id, attempts = entry.attempts, "Retry ceiling reached; sweeper will leave this order alone");
            counter!("storefront.reconcile.gave_up", 1);
        }
    }

    /// One pass over recent orders still awaiting payment.
    #[instrument(skip(self))]
    pub async fn sweep_pending_once(&self) -> Result<SweepReport, ServiceError> {
        let now = Utc::now();
        let window = self.pending_window();
        self.retries.retain(|_, state| now - state.last_attempt_at < window);

        let candidates = self
            .orders
            .list_pending_orders_with_token(window, self.config.batch_size)
            .await?;
        let mut report = SweepReport {
            scanned: candidates.len(),
            ..SweepReport::default()
        };

        for order in candidates {
            if !self.eligible(order.id, now) {
                report.skipped += 1;
                continue;
            }
            let Some(token) = order.payment_token.clone() else {
                continue;
            };

            match self.finalizer.finalize(&token).await {
                Ok(outcome) if outcome.ok => {
                    self.retries.remove(&order.id);
                    report.finalized += 1;
                }
                Ok(_) => {
                    self.record_attempt(order.id, now);
                    report.declined += 1;
                }
                Err(e) => {
                    self.record_attempt(order.id, now);
                    report.errors += 1;
                    warn!(order_id = %order.id, code = e.code(), error = %e, "Sweep finalize failed");
                }
            }
        }

        counter!("storefront.reconcile.pending_finalized", report.finalized as u64);
        debug!(?report, "Pending sweep finished");
        Ok(report)
    }

    /// One pass over older orders whose local status may have drifted.
    #[instrument(skip(self))]
    pub async fn reconcile_drift_once(&self) -> Result<DriftReport, ServiceError> {
        let candidates = self
            .orders
            .list_orders_for_reconciliation(
                self.pending_window(),
                Duration::seconds(self.config.drift_max_age_secs as i64),
                self.config.batch_size,
            )
            .await?;
        let mut report = DriftReport {
            scanned: candidates.len(),
            ..DriftReport::default()
        };

        for order in candidates {
            match self.reconcile_order(&order).await {
                Ok(DriftAction::Redriven) => report.redriven += 1,
                Ok(DriftAction::Corrected) => report.corrected += 1,
                Ok(DriftAction::Unchanged) => report.unchanged += 1,
                Err(e) => {
                    report.errors += 1;
                    warn!(order_id = %order.id, code = e.code(), error = %e, "Drift check failed");
                }
            }
        }

        counter!("storefront.reconcile.drift_corrected", report.corrected as u64);
        info!(?report, "Drift reconciliation finished");
        Ok(report)
    }

    async fn reconcile_order(&self, order: &OrderModel) -> Result<DriftAction, ServiceError> {
        let Some(token) = order.payment_token.as_deref() else {
            return Ok(DriftAction::Unchanged);
        };
        let retrieval = match order.payment_id.as_deref() {
            Some(payment_id) => self.gateway.retrieve_by_payment_id(payment_id).await?,
            None => self.gateway.retrieve_by_token(token).await?,
        };

        let Some(remote) = retrieval
            .payment_status
            .as_deref()
            .and_then(normalize_gateway_status)
        else {
            return Ok(DriftAction::Unchanged);
        };

        match remote {
            PaymentStatus::Paid => {
                let outcome = self.finalizer.finalize(token).await?;
                if outcome.ok && !outcome.already_paid {
                    info!(order_id = %order.id, "Drift pass finalized a paid order");
                    Ok(DriftAction::Redriven)
                } else {
                    Ok(DriftAction::Unchanged)
                }
            }
            target => self.correct_status(order.id, target).await,
        }
    }

    /// Flips only between `pending` and `failed`.
    async fn correct_status(
        &self,
        order_id: Uuid,
        target: PaymentStatus,
    ) -> Result<DriftAction, ServiceError> {
        let txn = self.db_pool.begin().await.map_err(ServiceError::db_error)?;
        let order = lock_order(&txn, order_id).await?;
        if order.status == OrderStatus::Cancelled
            || !order.payment_status.awaiting_payment()
            || order.payment_status == target
        {
            return Ok(DriftAction::Unchanged);
        }

        let previous = order.payment_status;
        let mut active: OrderActiveModel = order.into();
        active.payment_status = Set(target);
        if target != PaymentStatus::Failed {
            active.payment_error_code = Set(None);
            active.payment_error_message = Set(None);
            active.payment_error_group = Set(None);
            active.payment_error_raw = Set(None);
        }
        active.update(&txn).await.map_err(ServiceError::db_error)?;
        append_payment_event(
            &txn,
            order_id,
            target,
            None,
            Some(format!("reconciled from {}", previous)),
        )
        .await;
        txn.commit().await.map_err(ServiceError::db_error)?;

        info!(order_id = %order_id, from = %previous, to = %target, "Corrected drifted payment status");
        Ok(DriftAction::Corrected)
    }

    /// Runs both loops until `shutdown` flips to true.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) {
        let pending = self.run_loop(
            "pending",
            StdDuration::from_secs(self.config.pending_interval_secs),
            shutdown.clone(),
            |svc| async move { svc.sweep_pending_once().await.map(|_| ()) },
        );
        let drift = self.run_loop(
            "drift",
            StdDuration::from_secs(self.config.drift_interval_secs),
            shutdown,
            |svc| async move { svc.reconcile_drift_once().await.map(|_| ()) },
        );
        tokio::join!(pending, drift);
    }

    async fn run_loop<F, Fut>(
        &self,
        name: &'static str,
        period: StdDuration,
        mut shutdown: watch::Receiver<bool>,
        pass: F,
    ) where
        F: Fn(Self) -> Fut,
        Fut: std::future::Future<Output = Result<(), ServiceError>>,
    {
        info!(loop_name = name, period_secs = period.as_secs(), "Reconciliation loop started");
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = pass(self.clone()).await {
                        error!(loop_name = name, error = %e, "Reconciliation pass failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!(loop_name = name, "Reconciliation loop stopped");
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DriftAction {
    Redriven,
    Corrected,
    Unchanged,
}
