use crate::error::ValidationError;
use crate::types::{
    FailedRule, FamilyResult, PaymentInitiated, RiskLevel, RuleFamily, ValidationContext,
    ValidationResult, ValidationStatus, SERVICE_NAME,
};
use chrono::Utc;
use serde_json::json;

/// Folds per-family results into one sealed `ValidationResult`.
///
/// Family results arrive in canonical order from the dispatcher, so the
/// concatenated rule lists and the metadata are deterministic for a given
/// input.
pub struct ResultAggregator;

impl ResultAggregator {
    pub fn aggregate(
        scope: &ValidationContext,
        payment: &PaymentInitiated,
        family_results: &[FamilyResult],
    ) -> ValidationResult {
        let mut applied_rules = Vec::new();
        let mut failed_rules: Vec<FailedRule> = Vec::new();
        let mut fraud_total = 0u32;
        let mut risk_total = 0u32;
        let mut per_family_elapsed = serde_json::Map::new();

        for result in family_results {
            applied_rules.extend(result.applied_rules.iter().cloned());
            failed_rules.extend(result.failed_rules.iter().cloned());
            fraud_total += result.fraud_delta;
            risk_total += result.risk_delta;
            per_family_elapsed.insert(
                result.family.name().to_ascii_lowercase(),
                json!(result.elapsed_ms),
            );
        }

        let status = if failed_rules.is_empty() {
            ValidationStatus::Passed
        } else {
            ValidationStatus::Failed
        };
        let risk_level = RiskLevel::derive(&failed_rules);
        let reason = match status {
            ValidationStatus::Passed => None,
            ValidationStatus::Failed => {
                Some(format!("{} rule(s) rejected the payment", failed_rules.len()))
            }
        };

        ValidationResult {
            validation_id: scope.validation_id.clone(),
            payment_id: payment.payment_id.clone(),
            tenant: scope.tenant.clone(),
            correlation_id: scope.correlation_id.clone(),
            status,
            risk_level,
            fraud_score: fraud_total.min(100) as u8,
            risk_score: risk_total.min(100) as u8,
            applied_rules,
            failed_rules,
            validated_at: Utc::now(),
            reason,
            created_by: SERVICE_NAME.to_string(),
            metadata: json!({
                "validation_id": scope.validation_id,
                "payment_id": payment.payment_id,
                "family_count": family_results.len(),
                "per_family_elapsed_ms": per_family_elapsed,
            }),
        }
    }

    /// Sealed result for a dispatcher-level failure (cancellation or an error
    /// not attributable to a single family).
    pub fn system_failure(
        scope: &ValidationContext,
        payment: &PaymentInitiated,
        error: &ValidationError,
    ) -> ValidationResult {
        let message = error.to_string();
        ValidationResult {
            validation_id: scope.validation_id.clone(),
            payment_id: payment.payment_id.clone(),
            tenant: scope.tenant.clone(),
            correlation_id: scope.correlation_id.clone(),
            status: ValidationStatus::Failed,
            risk_level: RiskLevel::Critical,
            fraud_score: 100,
            risk_score: 100,
            applied_rules: Vec::new(),
            failed_rules: vec![FailedRule::new(
                "SYSTEM_ERROR",
                "Validation System Error",
                RuleFamily::Risk,
                message.clone(),
            )],
            validated_at: Utc::now(),
            reason: Some(message.clone()),
            created_by: SERVICE_NAME.to_string(),
            metadata: json!({
                "validation_id": scope.validation_id,
                "payment_id": payment.payment_id,
                "error": message,
            }),
        }
    }
}
