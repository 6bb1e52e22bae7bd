use crate::error::ValidationError;
use crate::families::{ComplianceGateway, FamilyEngine, HookTimeouts};
use crate::registry::{ExecutionPolicy, RuleRegistry, TenantRuleSet};
use crate::types::{FamilyResult, PaymentInitiated, RuleFamily, ValidationContext};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::warn;

/// Fans one payment out to the four family engines under a shared deadline.
///
/// Results always come back in canonical family order (business, compliance,
/// fraud, risk) regardless of completion order, which keeps aggregation
/// deterministic.
pub struct RuleDispatcher {
    registry: Arc<RuleRegistry>,
    engines: Vec<FamilyEngine>,
}

impl RuleDispatcher {
    pub fn new(
        registry: Arc<RuleRegistry>,
        gateway: Arc<dyn ComplianceGateway>,
        hook_timeouts: HookTimeouts,
    ) -> Self {
        let engines = RuleFamily::CANONICAL_ORDER
            .iter()
            .map(|family| FamilyEngine::new(*family, gateway.clone(), hook_timeouts.clone()))
            .collect();
        Self { registry, engines }
    }

    /// Run all four families for one payment.
    ///
    /// `cancel` is the orchestrator's shutdown signal; once it flips, in-flight
    /// family tasks are aborted, partial results are discarded, and the whole
    /// dispatch reports `DISPATCH_CANCELLED`.
    pub async fn dispatch(
        &self,
        scope: &ValidationContext,
        payment: &PaymentInitiated,
        cancel: watch::Receiver<bool>,
    ) -> Result<Vec<FamilyResult>, ValidationError> {
        let policy = self.registry.policy().clone();
        let rules = self.registry.rules_for(&scope.tenant.tenant_id).await;
        let deadline = Instant::now() + Duration::from_millis(policy.budget_ms);

        if *cancel.borrow() {
            return Err(ValidationError::DispatchCancelled(
                "DISPATCH_CANCELLED: shutdown before dispatch".to_string(),
            ));
        }

        if policy.parallel {
            self.dispatch_parallel(scope, payment, rules, &policy, deadline, cancel)
                .await
        } else {
            self.dispatch_serial(scope, payment, rules, &policy, deadline, cancel)
                .await
        }
    }

    async fn dispatch_parallel(
        &self,
        scope: &ValidationContext,
        payment: &PaymentInitiated,
        rules: Arc<TenantRuleSet>,
        policy: &ExecutionPolicy,
        deadline: Instant,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<Vec<FamilyResult>, ValidationError> {
        let semaphore = Arc::new(Semaphore::new(policy.max_parallel_rules.max(1)));
        let mut handles: Vec<(RuleFamily, JoinHandle<Result<FamilyResult, ValidationError>>)> =
            Vec::with_capacity(self.engines.len());

        for engine in &self.engines {
            let engine = engine.clone();
            let family = engine.family();
            let scope = scope.clone();
            let payment = payment.clone();
            let rules = rules.clone();
            let semaphore = semaphore.clone();

            handles.push((
                family,
                tokio::spawn(async move {
                    let _permit = semaphore.acquire_owned().await.map_err(|_| {
                        ValidationError::DispatchCancelled(
                            "DISPATCH_CANCELLED: dispatcher gone".to_string(),
                        )
                    })?;
                    engine.execute(&scope, &payment, rules.rules(family)).await
                }),
            ));
        }

        // Fan-in in canonical order; completed families still join after the
        // deadline, only non-returned families become synthetic timeouts.
        let mut results = Vec::with_capacity(handles.len());
        let mut cancelled = false;

        for (family, mut handle) in handles {
            if cancelled {
                handle.abort();
                continue;
            }

            let joined = loop {
                tokio::select! {
                    changed = cancel.changed() => {
                        if changed.is_ok() && *cancel.borrow() {
                            handle.abort();
                            cancelled = true;
                            break None;
                        }
                        // Sender gone: nobody can cancel us anymore, just wait
                        // out the deadline.
                        break Some(tokio::time::timeout_at(deadline, &mut handle).await);
                    }
                    joined = tokio::time::timeout_at(deadline, &mut handle) => {
                        break Some(joined);
                    }
                }
            };

            let Some(joined) = joined else { continue };

            let result = match joined {
                Err(_elapsed) => {
                    handle.abort();
                    warn!(
                        validation_id = %scope.validation_id,
                        family = %family,
                        budget_ms = policy.budget_ms,
                        "rule family missed the validation deadline"
                    );
                    FamilyResult::timed_out(family, policy.budget_ms)
                }
                Ok(Err(join_err)) => {
                    warn!(
                        validation_id = %scope.validation_id,
                        family = %family,
                        error = %join_err,
                        "rule family task aborted"
                    );
                    FamilyResult::engine_error(family, join_err.to_string())
                }
                Ok(Ok(Err(engine_err))) => {
                    warn!(
                        validation_id = %scope.validation_id,
                        family = %family,
                        error = %engine_err,
                        "rule family engine failed"
                    );
                    FamilyResult::engine_error(family, engine_err.to_string())
                }
                Ok(Ok(Ok(result))) => result,
            };
            results.push(result);
        }

        if cancelled {
            return Err(ValidationError::DispatchCancelled(
                "DISPATCH_CANCELLED: validation cancelled mid-flight".to_string(),
            ));
        }

        Ok(results)
    }

    /// Fixed-order execution sharing the same cumulative deadline.
    ///
    /// Cancellation is honoured cooperatively at family boundaries.
    async fn dispatch_serial(
        &self,
        scope: &ValidationContext,
        payment: &PaymentInitiated,
        rules: Arc<TenantRuleSet>,
        policy: &ExecutionPolicy,
        deadline: Instant,
        cancel: watch::Receiver<bool>,
    ) -> Result<Vec<FamilyResult>, ValidationError> {
        let mut results = Vec::with_capacity(self.engines.len());

        for engine in &self.engines {
            if *cancel.borrow() {
                return Err(ValidationError::DispatchCancelled(
                    "DISPATCH_CANCELLED: validation cancelled mid-flight".to_string(),
                ));
            }

            let family = engine.family();
            let run = engine.execute(scope, payment, rules.rules(family));
            let result = match tokio::time::timeout_at(deadline, run).await {
                Err(_elapsed) => {
                    warn!(
                        validation_id = %scope.validation_id,
                        family = %family,
                        budget_ms = policy.budget_ms,
                        "rule family missed the validation deadline"
                    );
                    FamilyResult::timed_out(family, policy.budget_ms)
                }
                Ok(Err(engine_err)) => {
                    warn!(
                        validation_id = %scope.validation_id,
                        family = %family,
                        error = %engine_err,
                        "rule family engine failed"
                    );
                    FamilyResult::engine_error(family, engine_err.to_string())
                }
                Ok(Ok(result)) => result,
            };
            results.push(result);
        }

        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ValidationError;
    use crate::families::ScreeningOutcome;
    use crate::registry::{CachePolicy, RuleSource};
    use crate::types::{Money, RuleDefinition, TenantContext};
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};

    struct DelayedGateway {
        aml_delay: Duration,
    }

    #[async_trait]
    impl ComplianceGateway for DelayedGateway {
        async fn screen_aml(
            &self,
            _scope: &ValidationContext,
            _payment: &PaymentInitiated,
        ) -> Result<ScreeningOutcome, ValidationError> {
            tokio::time::sleep(self.aml_delay).await;
            Ok(ScreeningOutcome::clear())
        }

        async fn screen_sanctions(
            &self,
            _scope: &ValidationContext,
            _payment: &PaymentInitiated,
        ) -> Result<ScreeningOutcome, ValidationError> {
            Ok(ScreeningOutcome::clear())
        }

        async fn check_kyc(
            &self,
            _scope: &ValidationContext,
            _payment: &PaymentInitiated,
        ) -> Result<ScreeningOutcome, ValidationError> {
            Ok(ScreeningOutcome::clear())
        }

        async fn regulatory_flag(
            &self,
            _scope: &ValidationContext,
            _payment: &PaymentInitiated,
        ) -> Result<ScreeningOutcome, ValidationError> {
            Ok(ScreeningOutcome::clear())
        }
    }

    struct BogusFraudRuleSource;

    #[async_trait]
    impl RuleSource for BogusFraudRuleSource {
        async fn load(
            &self,
            tenant_id: &str,
        ) -> Result<Option<Vec<RuleDefinition>>, ValidationError> {
            let mut definitions = crate::registry::builtin_rule_set(tenant_id);
            definitions.push(RuleDefinition::new(
                "FRAUD_RULE_999",
                "Unbound",
                RuleFamily::Fraud,
                99,
            ));
            Ok(Some(definitions))
        }
    }

    fn payment() -> PaymentInitiated {
        PaymentInitiated::new(
            "pay-1",
            "acct-src",
            "acct-dst",
            Money::from_major(1_000, "USD"),
            "INV-1",
            TenantContext::new("tenant-a", "bu-1"),
        )
        .with_initiated_at(Utc.with_ymd_and_hms(2025, 3, 14, 10, 0, 0).unwrap())
    }

    fn dispatcher_with(
        policy: ExecutionPolicy,
        gateway: Arc<dyn ComplianceGateway>,
        hook_timeouts: HookTimeouts,
    ) -> RuleDispatcher {
        let registry = Arc::new(RuleRegistry::new(
            Arc::new(crate::registry::DefaultRuleSource),
            policy,
        ));
        RuleDispatcher::new(registry, gateway, hook_timeouts)
    }

    #[tokio::test]
    async fn results_come_back_in_canonical_order_despite_a_slow_family() {
        let gateway = Arc::new(DelayedGateway {
            aml_delay: Duration::from_millis(150),
        });
        let dispatcher = dispatcher_with(
            ExecutionPolicy::default(),
            gateway,
            HookTimeouts::default(),
        );
        let payment = payment();
        let scope = ValidationContext::new(&payment, "corr-1");

        let (_cancel_tx, cancel_rx) = watch::channel(false);
        let results = dispatcher
            .dispatch(&scope, &payment, cancel_rx)
            .await
            .unwrap();

        let families: Vec<_> = results.iter().map(|result| result.family).collect();
        assert_eq!(families, RuleFamily::CANONICAL_ORDER.to_vec());
        assert!(results.iter().all(|result| result.success));
    }

    #[tokio::test]
    async fn slow_family_becomes_exactly_one_timeout_failure() {
        let gateway = Arc::new(DelayedGateway {
            aml_delay: Duration::from_secs(30),
        });
        let policy = ExecutionPolicy {
            budget_ms: 80,
            ..ExecutionPolicy::default()
        };
        // Hook budget above the validation budget so the family, not the
        // hook, is what runs out of time.
        let dispatcher = dispatcher_with(
            policy,
            gateway,
            HookTimeouts {
                aml_ms: 60_000,
                sanctions_ms: 60_000,
                kyc_ms: 60_000,
            },
        );
        let payment = payment();
        let scope = ValidationContext::new(&payment, "corr-1");

        let (_cancel_tx, cancel_rx) = watch::channel(false);
        let results = dispatcher
            .dispatch(&scope, &payment, cancel_rx)
            .await
            .unwrap();

        assert_eq!(results.len(), 4);
        let compliance = &results[1];
        assert_eq!(compliance.family, RuleFamily::Compliance);
        assert_eq!(compliance.failed_rules.len(), 1);
        assert_eq!(compliance.failed_rules[0].rule_id, "COMPLIANCE_TIMEOUT");
        assert_eq!(compliance.risk_delta, 100);

        let other_failures: usize = results
            .iter()
            .filter(|result| result.family != RuleFamily::Compliance)
            .map(|result| result.failed_rules.len())
            .sum();
        assert_eq!(other_failures, 0);
    }

    #[tokio::test]
    async fn unbound_rule_surfaces_as_family_engine_error() {
        let registry = Arc::new(RuleRegistry::new(
            Arc::new(BogusFraudRuleSource),
            ExecutionPolicy::default(),
        ));
        let dispatcher = RuleDispatcher::new(
            registry,
            Arc::new(DelayedGateway {
                aml_delay: Duration::from_millis(0),
            }),
            HookTimeouts::default(),
        );
        let payment = payment();
        let scope = ValidationContext::new(&payment, "corr-1");

        let (_cancel_tx, cancel_rx) = watch::channel(false);
        let results = dispatcher
            .dispatch(&scope, &payment, cancel_rx)
            .await
            .unwrap();

        let fraud = &results[2];
        assert_eq!(fraud.family, RuleFamily::Fraud);
        assert_eq!(fraud.failed_rules.len(), 1);
        assert_eq!(fraud.failed_rules[0].rule_id, "FRAUD_ENGINE_ERROR");
        assert_eq!(fraud.risk_delta, 100);

        // The other families are unaffected by the fraud engine failure.
        assert!(results[0].success);
        assert!(results[1].success);
        assert!(results[3].success);
    }

    #[tokio::test]
    async fn serial_mode_preserves_order_and_outcomes() {
        let gateway = Arc::new(DelayedGateway {
            aml_delay: Duration::from_millis(0),
        });
        let policy = ExecutionPolicy {
            parallel: false,
            ..ExecutionPolicy::default()
        };
        let dispatcher = dispatcher_with(policy, gateway, HookTimeouts::default());
        let payment = payment();
        let scope = ValidationContext::new(&payment, "corr-1");

        let (_cancel_tx, cancel_rx) = watch::channel(false);
        let results = dispatcher
            .dispatch(&scope, &payment, cancel_rx)
            .await
            .unwrap();
        let families: Vec<_> = results.iter().map(|result| result.family).collect();
        assert_eq!(families, RuleFamily::CANONICAL_ORDER.to_vec());
    }

    #[tokio::test]
    async fn bounded_concurrency_still_completes_all_families() {
        let gateway = Arc::new(DelayedGateway {
            aml_delay: Duration::from_millis(20),
        });
        let policy = ExecutionPolicy {
            max_parallel_rules: 1,
            cache: CachePolicy::default(),
            ..ExecutionPolicy::default()
        };
        let dispatcher = dispatcher_with(policy, gateway, HookTimeouts::default());
        let payment = payment();
        let scope = ValidationContext::new(&payment, "corr-1");

        let (_cancel_tx, cancel_rx) = watch::channel(false);
        let results = dispatcher
            .dispatch(&scope, &payment, cancel_rx)
            .await
            .unwrap();
        assert_eq!(results.len(), 4);
        assert!(results.iter().all(|result| result.success));
    }

    #[tokio::test]
    async fn pre_flipped_cancel_rejects_dispatch() {
        let gateway = Arc::new(DelayedGateway {
            aml_delay: Duration::from_millis(0),
        });
        let dispatcher = dispatcher_with(
            ExecutionPolicy::default(),
            gateway,
            HookTimeouts::default(),
        );
        let payment = payment();
        let scope = ValidationContext::new(&payment, "corr-1");

        let (tx, rx) = watch::channel(true);
        let err = dispatcher
            .dispatch(&scope, &payment, rx)
            .await
            .unwrap_err();
        assert!(matches!(err, ValidationError::DispatchCancelled(_)));
        drop(tx);
    }

    #[tokio::test]
    async fn mid_flight_cancel_discards_partial_results() {
        let gateway = Arc::new(DelayedGateway {
            aml_delay: Duration::from_secs(30),
        });
        let policy = ExecutionPolicy {
            budget_ms: 60_000,
            ..ExecutionPolicy::default()
        };
        let dispatcher = dispatcher_with(
            policy,
            gateway,
            HookTimeouts {
                aml_ms: 60_000,
                sanctions_ms: 60_000,
                kyc_ms: 60_000,
            },
        );
        let payment = payment();
        let scope = ValidationContext::new(&payment, "corr-1");

        let (tx, rx) = watch::channel(false);
        let cancel_task = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let _ = tx.send(true);
            tx
        });

        let err = dispatcher
            .dispatch(&scope, &payment, rx)
            .await
            .unwrap_err();
        assert!(matches!(err, ValidationError::DispatchCancelled(_)));
        let _tx = cancel_task.await.unwrap();
    }
}
