use crate::aggregate::ResultAggregator;
use crate::dispatch::RuleDispatcher;
use crate::error::ValidationError;
use crate::families::{ComplianceGateway, HookTimeouts};
use crate::lifecycle::ValidationLifecycle;
use crate::publisher::{EventBus, OutcomePublisher, PublisherConfig};
use crate::registry::RuleRegistry;
use crate::store::ValidationResultStore;
use crate::types::{PaymentInitiated, ValidationContext, ValidationResult};
use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Bounded persist retries before the error escapes to the ingress.
    pub store_attempts: u32,
    pub store_retry_backoff_ms: u64,
    /// Rows older than this are eligible for retention cleanup.
    pub retention_days: i64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            store_attempts: 3,
            store_retry_backoff_ms: 50,
            retention_days: 90,
        }
    }
}

/// Single entrypoint for one `PaymentInitiated`.
///
/// Drives the received -> dispatched -> aggregated -> persisted -> published
/// lifecycle. The result is always persisted before the outcome event goes
/// out; a publish failure leaves a republish tombstone instead of an error,
/// so the ingress consumer can commit its offset either way.
pub struct ValidationOrchestrator {
    registry: Arc<RuleRegistry>,
    dispatcher: RuleDispatcher,
    store: Arc<ValidationResultStore>,
    publisher: OutcomePublisher,
    config: OrchestratorConfig,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ValidationOrchestrator {
    pub fn new(
        registry: Arc<RuleRegistry>,
        gateway: Arc<dyn ComplianceGateway>,
        hook_timeouts: HookTimeouts,
        store: Arc<ValidationResultStore>,
        bus: Arc<dyn EventBus>,
        publisher_config: PublisherConfig,
        config: OrchestratorConfig,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let dispatcher = RuleDispatcher::new(registry.clone(), gateway, hook_timeouts);
        let publisher = OutcomePublisher::new(bus, publisher_config);
        Self {
            registry,
            dispatcher,
            store,
            publisher,
            config,
            shutdown_tx,
            shutdown_rx,
        }
    }

    pub fn registry(&self) -> &Arc<RuleRegistry> {
        &self.registry
    }

    pub fn store(&self) -> &Arc<ValidationResultStore> {
        &self.store
    }

    /// Signal in-flight dispatches to stop; their partial work is sealed as
    /// system failures before anything escapes.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Validate one payment end to end.
    pub async fn handle(
        &self,
        payment: PaymentInitiated,
        correlation_id: Option<String>,
    ) -> Result<ValidationResult, ValidationError> {
        let correlation_id = correlation_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let scope = ValidationContext::new(&payment, correlation_id);
        let mut lifecycle = ValidationLifecycle::new(scope.validation_id.clone());

        info!(
            validation_id = %scope.validation_id,
            payment_id = %scope.payment_id,
            tenant_id = %scope.tenant.tenant_id,
            business_unit_id = %scope.tenant.business_unit_id,
            correlation_id = %scope.correlation_id,
            stage = lifecycle.stage().name(),
            "payment received for validation"
        );

        let result = match self
            .dispatcher
            .dispatch(&scope, &payment, self.shutdown_rx.clone())
            .await
        {
            Ok(family_results) => {
                lifecycle.mark_dispatched()?;
                let result = ResultAggregator::aggregate(&scope, &payment, &family_results);
                lifecycle.mark_aggregated()?;
                result
            }
            Err(err) => {
                warn!(
                    validation_id = %scope.validation_id,
                    error = %err,
                    "dispatch failed; sealing system failure result"
                );
                lifecycle.mark_dispatched()?;
                let result = ResultAggregator::system_failure(&scope, &payment, &err);
                lifecycle.mark_aggregated()?;
                result
            }
        };

        let stored = self.persist_with_retry(&result).await?;
        lifecycle.mark_persisted()?;
        info!(
            validation_id = %stored.validation_id,
            status = %stored.status,
            risk_level = %stored.risk_level,
            stage = lifecycle.stage().name(),
            "validation result persisted"
        );

        match self.publisher.publish_outcome(&stored).await {
            Ok(event) => {
                lifecycle.mark_published()?;
                info!(
                    validation_id = %stored.validation_id,
                    event_id = %event.event_id,
                    event_type = %event.event_type,
                    stage = lifecycle.stage().name(),
                    "outcome event published"
                );
            }
            Err(err) => {
                error!(
                    validation_id = %stored.validation_id,
                    error = %err,
                    "outcome publication failed; leaving republish tombstone"
                );
                if let Err(tombstone_err) = self
                    .store
                    .record_publish_failure(&stored.validation_id, &err.to_string())
                    .await
                {
                    error!(
                        validation_id = %stored.validation_id,
                        error = %tombstone_err,
                        "republish tombstone write failed"
                    );
                }
            }
        }

        Ok(stored)
    }

    async fn persist_with_retry(
        &self,
        result: &ValidationResult,
    ) -> Result<ValidationResult, ValidationError> {
        let attempts = self.config.store_attempts.max(1);
        let mut last_error = None;

        for attempt in 1..=attempts {
            match self.store.save(result).await {
                Ok(stored) => return Ok(stored),
                Err(err) => {
                    warn!(
                        validation_id = %result.validation_id,
                        attempt,
                        attempts,
                        error = %err,
                        "persist attempt failed"
                    );
                    last_error = Some(err);
                    if attempt < attempts {
                        tokio::time::sleep(Duration::from_millis(
                            self.config.store_retry_backoff_ms * attempt as u64,
                        ))
                        .await;
                    }
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| ValidationError::Store("persist failed".to_string())))
    }

    /// Drain up to `limit` republish tombstones. Returns how many outcomes
    /// made it onto the bus this pass.
    pub async fn republish_pending(&self, limit: usize) -> Result<u32, ValidationError> {
        let tombstones = self.store.list_publish_failures(limit).await?;
        let mut republished = 0u32;

        for tombstone in tombstones {
            let Some(result) = self
                .store
                .find_by_validation_id(&tombstone.validation_id)
                .await?
            else {
                warn!(
                    validation_id = %tombstone.validation_id,
                    "republish tombstone points at a deleted row; dropping it"
                );
                self.store
                    .clear_publish_failure(&tombstone.validation_id)
                    .await?;
                continue;
            };

            match self.publisher.publish_outcome(&result).await {
                Ok(event) => {
                    self.store
                        .clear_publish_failure(&tombstone.validation_id)
                        .await?;
                    republished += 1;
                    info!(
                        validation_id = %result.validation_id,
                        event_id = %event.event_id,
                        "tombstoned outcome republished"
                    );
                }
                Err(err) => {
                    warn!(
                        validation_id = %result.validation_id,
                        attempts = tombstone.attempts,
                        error = %err,
                        "republish attempt failed; tombstone kept"
                    );
                    self.store
                        .record_publish_failure(&result.validation_id, &err.to_string())
                        .await?;
                }
            }
        }

        Ok(republished)
    }

    /// Delete rows older than the configured retention window.
    pub async fn cleanup_expired(&self) -> Result<u64, ValidationError> {
        let cutoff = Utc::now() - ChronoDuration::days(self.config.retention_days.max(0));
        let deleted = self.store.cleanup_before(cutoff).await?;
        if deleted > 0 {
            info!(deleted, retention_days = self.config.retention_days, "retention cleanup ran");
        }
        Ok(deleted)
    }
}
