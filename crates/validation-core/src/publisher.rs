use crate::error::ValidationError;
use crate::types::{
    FailedRule, RiskLevel, RuleFamily, TenantContext, ValidationResult, ValidationStatus,
    SERVICE_NAME,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

pub const PAYMENT_VALIDATED: &str = "PaymentValidated";
pub const VALIDATION_FAILED: &str = "ValidationFailed";
pub const EVENT_VERSION: &str = "1.0.0";

/// Failed-rule entry as it appears on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedRuleRecord {
    pub rule_id: String,
    pub rule_name: String,
    pub rule_type: RuleFamily,
    pub failure_reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    pub failed_at: DateTime<Utc>,
}

impl From<&FailedRule> for FailedRuleRecord {
    fn from(rule: &FailedRule) -> Self {
        Self {
            rule_id: rule.rule_id.clone(),
            rule_name: rule.rule_name.clone(),
            rule_type: rule.family,
            failure_reason: rule.failure_reason.clone(),
            field: rule.field.clone(),
            failed_at: rule.failed_at,
        }
    }
}

/// Typed outcome envelope: `PaymentValidated` when the payment passed,
/// `ValidationFailed` (with the failed-rule list) otherwise.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutcomeEvent {
    pub event_id: String,
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    pub correlation_id: String,
    pub source: String,
    pub version: String,
    pub tenant_id: String,
    pub business_unit_id: String,
    pub payment_id: String,
    pub tenant_context: TenantContext,
    pub risk_level: RiskLevel,
    pub fraud_score: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_rules: Option<Vec<FailedRuleRecord>>,
}

impl OutcomeEvent {
    pub fn from_result(result: &ValidationResult) -> Self {
        let (event_type, failed_rules) = match result.status {
            ValidationStatus::Passed => (PAYMENT_VALIDATED, None),
            ValidationStatus::Failed => (
                VALIDATION_FAILED,
                Some(result.failed_rules.iter().map(FailedRuleRecord::from).collect()),
            ),
        };

        Self {
            event_id: Uuid::new_v4().to_string(),
            event_type: event_type.to_string(),
            timestamp: Utc::now(),
            correlation_id: result.correlation_id.clone(),
            source: SERVICE_NAME.to_string(),
            version: EVENT_VERSION.to_string(),
            tenant_id: result.tenant.tenant_id.clone(),
            business_unit_id: result.tenant.business_unit_id.clone(),
            payment_id: result.payment_id.clone(),
            tenant_context: result.tenant.clone(),
            risk_level: result.risk_level,
            fraud_score: result.fraud_score,
            failed_rules,
        }
    }

    pub fn headers(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("correlation_id".to_string(), self.correlation_id.clone()),
            ("tenant_id".to_string(), self.tenant_id.clone()),
            (
                "business_unit_id".to_string(),
                self.business_unit_id.clone(),
            ),
            ("event_type".to_string(), self.event_type.clone()),
            ("source".to_string(), self.source.clone()),
            ("version".to_string(), self.version.clone()),
        ])
    }
}

/// Pluggable outbound bus seam.
///
/// `key` is the partitioning key; the publisher always keys on the payment id
/// so per-payment ordering survives on the wire.
#[async_trait]
pub trait EventBus: Send + Sync {
    async fn publish(
        &self,
        topic: &str,
        key: &str,
        payload: serde_json::Value,
        headers: &BTreeMap<String, String>,
    ) -> Result<(), ValidationError>;
}

#[derive(Debug, Clone)]
pub struct PublisherConfig {
    pub topic: String,
    pub max_attempts: u32,
    pub retry_backoff_ms: u64,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            topic: "payment.validation.outcome".to_string(),
            max_attempts: 5,
            retry_backoff_ms: 50,
        }
    }
}

/// At-least-once outcome publication with bounded retries.
///
/// Consumers deduplicate on `event_id`; a redelivered ingress therefore
/// produces a harmless duplicate egress.
pub struct OutcomePublisher {
    bus: Arc<dyn EventBus>,
    config: PublisherConfig,
}

impl OutcomePublisher {
    pub fn new(bus: Arc<dyn EventBus>, config: PublisherConfig) -> Self {
        Self { bus, config }
    }

    pub fn config(&self) -> &PublisherConfig {
        &self.config
    }

    pub async fn publish_outcome(
        &self,
        result: &ValidationResult,
    ) -> Result<OutcomeEvent, ValidationError> {
        let event = OutcomeEvent::from_result(result);
        let payload = serde_json::to_value(&event)
            .map_err(|e| ValidationError::Serialization(e.to_string()))?;
        let headers = event.headers();
        let max_attempts = self.config.max_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            match self
                .bus
                .publish(&self.config.topic, &result.payment_id, payload.clone(), &headers)
                .await
            {
                Ok(()) => {
                    if attempt > 1 {
                        debug!(
                            event_id = %event.event_id,
                            attempt,
                            "outcome published after retry"
                        );
                    }
                    return Ok(event);
                }
                Err(err) => {
                    warn!(
                        event_id = %event.event_id,
                        payment_id = %result.payment_id,
                        attempt,
                        max_attempts,
                        error = %err,
                        "outcome publish attempt failed"
                    );
                    last_error = err.to_string();
                    if attempt < max_attempts {
                        tokio::time::sleep(Duration::from_millis(
                            self.config.retry_backoff_ms * attempt as u64,
                        ))
                        .await;
                    }
                }
            }
        }

        Err(ValidationError::Publish {
            attempts: max_attempts,
            message: last_error,
        })
    }
}
