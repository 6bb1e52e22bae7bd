//! Compliance-hook and event-bus adapters for the validation engine.

#![deny(unsafe_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Mutex;
use tracing::info;
use validation_core::{
    ComplianceGateway, EventBus, PaymentInitiated, ScreeningOutcome, ValidationContext,
    ValidationError,
};

/// Hashed evidence reference for one screening call, suitable for logging and
/// audit without exposing the underlying vendor payload.
fn evidence_ref(scope: &ValidationContext, hook: &str) -> String {
    let pointer = format!("proof://{}/{}", scope.validation_id, hook);
    format!("blake3:{}", blake3::hash(pointer.as_bytes()).to_hex())
}

/// Gateway that clears every screening with a deterministic evidence hash.
///
/// The default wiring for local runs; production deployments register real
/// AML/sanctions/KYC vendor gateways instead.
#[derive(Debug, Clone, Default)]
pub struct ClearComplianceGateway;

#[async_trait]
impl ComplianceGateway for ClearComplianceGateway {
    async fn screen_aml(
        &self,
        scope: &ValidationContext,
        _payment: &PaymentInitiated,
    ) -> Result<ScreeningOutcome, ValidationError> {
        Ok(ScreeningOutcome::clear_with_evidence(evidence_ref(scope, "aml")))
    }

    async fn screen_sanctions(
        &self,
        scope: &ValidationContext,
        _payment: &PaymentInitiated,
    ) -> Result<ScreeningOutcome, ValidationError> {
        Ok(ScreeningOutcome::clear_with_evidence(evidence_ref(
            scope,
            "sanctions",
        )))
    }

    async fn check_kyc(
        &self,
        scope: &ValidationContext,
        _payment: &PaymentInitiated,
    ) -> Result<ScreeningOutcome, ValidationError> {
        Ok(ScreeningOutcome::clear_with_evidence(evidence_ref(scope, "kyc")))
    }

    async fn regulatory_flag(
        &self,
        scope: &ValidationContext,
        _payment: &PaymentInitiated,
    ) -> Result<ScreeningOutcome, ValidationError> {
        Ok(ScreeningOutcome::clear_with_evidence(evidence_ref(
            scope,
            "regulatory",
        )))
    }
}

/// Gateway with one fixed outcome per hook.
#[derive(Debug, Clone)]
pub struct ScriptedComplianceGateway {
    aml: ScreeningOutcome,
    sanctions: ScreeningOutcome,
    kyc: ScreeningOutcome,
    regulatory: ScreeningOutcome,
}

impl ScriptedComplianceGateway {
    pub fn all_clear() -> Self {
        Self {
            aml: ScreeningOutcome::clear(),
            sanctions: ScreeningOutcome::clear(),
            kyc: ScreeningOutcome::clear(),
            regulatory: ScreeningOutcome::clear(),
        }
    }

    pub fn with_aml(mut self, outcome: ScreeningOutcome) -> Self {
        self.aml = outcome;
        self
    }

    pub fn with_sanctions(mut self, outcome: ScreeningOutcome) -> Self {
        self.sanctions = outcome;
        self
    }

    pub fn with_kyc(mut self, outcome: ScreeningOutcome) -> Self {
        self.kyc = outcome;
        self
    }

    pub fn with_regulatory(mut self, outcome: ScreeningOutcome) -> Self {
        self.regulatory = outcome;
        self
    }
}

#[async_trait]
impl ComplianceGateway for ScriptedComplianceGateway {
    async fn screen_aml(
        &self,
        _scope: &ValidationContext,
        _payment: &PaymentInitiated,
    ) -> Result<ScreeningOutcome, ValidationError> {
        Ok(self.aml.clone())
    }

    async fn screen_sanctions(
        &self,
        _scope: &ValidationContext,
        _payment: &PaymentInitiated,
    ) -> Result<ScreeningOutcome, ValidationError> {
        Ok(self.sanctions.clone())
    }

    async fn check_kyc(
        &self,
        _scope: &ValidationContext,
        _payment: &PaymentInitiated,
    ) -> Result<ScreeningOutcome, ValidationError> {
        Ok(self.kyc.clone())
    }

    async fn regulatory_flag(
        &self,
        _scope: &ValidationContext,
        _payment: &PaymentInitiated,
    ) -> Result<ScreeningOutcome, ValidationError> {
        Ok(self.regulatory.clone())
    }
}

/// Gateway whose every hook fails, for chaos testing the synthetic-failure
/// path in the compliance family.
#[derive(Debug, Clone)]
pub struct FailingComplianceGateway {
    reason: String,
}

impl FailingComplianceGateway {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl ComplianceGateway for FailingComplianceGateway {
    async fn screen_aml(
        &self,
        _scope: &ValidationContext,
        _payment: &PaymentInitiated,
    ) -> Result<ScreeningOutcome, ValidationError> {
        Err(ValidationError::hook("aml", self.reason.clone()))
    }

    async fn screen_sanctions(
        &self,
        _scope: &ValidationContext,
        _payment: &PaymentInitiated,
    ) -> Result<ScreeningOutcome, ValidationError> {
        Err(ValidationError::hook("sanctions", self.reason.clone()))
    }

    async fn check_kyc(
        &self,
        _scope: &ValidationContext,
        _payment: &PaymentInitiated,
    ) -> Result<ScreeningOutcome, ValidationError> {
        Err(ValidationError::hook("kyc", self.reason.clone()))
    }

    async fn regulatory_flag(
        &self,
        _scope: &ValidationContext,
        _payment: &PaymentInitiated,
    ) -> Result<ScreeningOutcome, ValidationError> {
        Err(ValidationError::hook("regulatory", self.reason.clone()))
    }
}

/// One event captured by [`InMemoryEventBus`].
#[derive(Debug, Clone)]
pub struct PublishedEvent {
    pub topic: String,
    pub key: String,
    pub payload: serde_json::Value,
    pub headers: BTreeMap<String, String>,
    pub published_at: DateTime<Utc>,
}

/// Recording bus for local runs and tests.
#[derive(Debug, Default)]
pub struct InMemoryEventBus {
    events: Mutex<Vec<PublishedEvent>>,
}

impl InMemoryEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<PublishedEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.events.lock().map(|events| events.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        if let Ok(mut events) = self.events.lock() {
            events.clear();
        }
    }
}

#[async_trait]
impl EventBus for InMemoryEventBus {
    async fn publish(
        &self,
        topic: &str,
        key: &str,
        payload: serde_json::Value,
        headers: &BTreeMap<String, String>,
    ) -> Result<(), ValidationError> {
        let mut events = self
            .events
            .lock()
            .map_err(|_| ValidationError::Store("event bus lock poisoned".to_string()))?;
        events.push(PublishedEvent {
            topic: topic.to_string(),
            key: key.to_string(),
            payload,
            headers: headers.clone(),
            published_at: Utc::now(),
        });
        Ok(())
    }
}

/// Bus that only writes events to the log stream. Useful when no broker is
/// wired but outcome visibility is still wanted.
#[derive(Debug, Clone, Default)]
pub struct TracingEventBus;

#[async_trait]
impl EventBus for TracingEventBus {
    async fn publish(
        &self,
        topic: &str,
        key: &str,
        payload: serde_json::Value,
        _headers: &BTreeMap<String, String>,
    ) -> Result<(), ValidationError> {
        info!(
            topic,
            key,
            event_type = payload
                .get("event_type")
                .and_then(|value| value.as_str())
                .unwrap_or("unknown"),
            "outcome event emitted"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use validation_core::{Money, TenantContext};

    fn payment() -> PaymentInitiated {
        PaymentInitiated::new(
            "pay-1",
            "acct-src",
            "acct-dst",
            Money::from_major(1_000, "USD"),
            "INV-1",
            TenantContext::new("tenant-a", "bu-1"),
        )
    }

    #[tokio::test]
    async fn clear_gateway_hashes_distinct_evidence_per_hook() {
        let gateway = ClearComplianceGateway;
        let payment = payment();
        let scope = ValidationContext::new(&payment, "corr-1");

        let aml = gateway.screen_aml(&scope, &payment).await.unwrap();
        let kyc = gateway.check_kyc(&scope, &payment).await.unwrap();

        assert!(aml.passed);
        assert!(kyc.passed);
        let aml_evidence = aml.detail.unwrap();
        let kyc_evidence = kyc.detail.unwrap();
        assert!(aml_evidence.starts_with("blake3:"));
        assert_ne!(aml_evidence, kyc_evidence);

        // Same validation, same hook: the reference is reproducible.
        let again = gateway.screen_aml(&scope, &payment).await.unwrap();
        assert_eq!(again.detail.unwrap(), aml_evidence);
    }

    #[tokio::test]
    async fn scripted_gateway_returns_configured_outcomes() {
        let gateway = ScriptedComplianceGateway::all_clear()
            .with_sanctions(ScreeningOutcome::flagged("sanctions list match"));
        let payment = payment();
        let scope = ValidationContext::new(&payment, "corr-1");

        assert!(gateway.screen_aml(&scope, &payment).await.unwrap().passed);
        let sanctions = gateway.screen_sanctions(&scope, &payment).await.unwrap();
        assert!(!sanctions.passed);
        assert_eq!(sanctions.detail.as_deref(), Some("sanctions list match"));
    }

    #[tokio::test]
    async fn failing_gateway_errors_on_every_hook() {
        let gateway = FailingComplianceGateway::new("vendor outage");
        let payment = payment();
        let scope = ValidationContext::new(&payment, "corr-1");

        let err = gateway.screen_aml(&scope, &payment).await.unwrap_err();
        assert!(matches!(err, ValidationError::Hook { .. }));
        assert!(err.to_string().contains("vendor outage"));
    }

    #[tokio::test]
    async fn in_memory_bus_records_in_publish_order() {
        let bus = InMemoryEventBus::new();
        let headers = BTreeMap::from([("event_type".to_string(), "PaymentValidated".to_string())]);

        bus.publish("topic-a", "pay-1", serde_json::json!({"n": 1}), &headers)
            .await
            .unwrap();
        bus.publish("topic-a", "pay-1", serde_json::json!({"n": 2}), &headers)
            .await
            .unwrap();

        let events = bus.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].payload["n"], 1);
        assert_eq!(events[1].payload["n"], 2);
        assert_eq!(events[0].key, "pay-1");

        bus.clear();
        assert!(bus.is_empty());
    }

    #[tokio::test]
    async fn tracing_bus_accepts_any_payload() {
        let bus = TracingEventBus;
        bus.publish(
            "topic-a",
            "pay-1",
            serde_json::json!({"event_type": "ValidationFailed"}),
            &BTreeMap::new(),
        )
        .await
        .unwrap();
    }
}
