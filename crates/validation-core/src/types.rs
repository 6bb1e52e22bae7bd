use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Logical name this service signs its rows and events with.
pub const SERVICE_NAME: &str = "validation-service";

/// Tenant scope every validation runs under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantContext {
    pub tenant_id: String,
    pub business_unit_id: String,
}

impl TenantContext {
    pub fn new(tenant_id: impl Into<String>, business_unit_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            business_unit_id: business_unit_id.into(),
        }
    }
}

/// Monetary amount in minor units (two decimals for the documented thresholds).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Money {
    pub minor: u64,
    pub currency: String,
}

impl Money {
    pub fn new(minor: u64, currency: impl Into<String>) -> Self {
        Self {
            minor,
            currency: currency.into(),
        }
    }

    pub fn from_major(major: u64, currency: impl Into<String>) -> Self {
        Self::new(major * 100, currency)
    }
}

/// Inbound payment event entering the validation pipeline. Immutable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentInitiated {
    pub payment_id: String,
    pub source_account: String,
    pub destination_account: String,
    pub amount: Money,
    pub reference: String,
    /// Scheme-level payment type; absent when the intake layer does not classify.
    pub payment_type: Option<String>,
    pub tenant: TenantContext,
    pub initiated_at: DateTime<Utc>,
}

impl PaymentInitiated {
    pub fn new(
        payment_id: impl Into<String>,
        source_account: impl Into<String>,
        destination_account: impl Into<String>,
        amount: Money,
        reference: impl Into<String>,
        tenant: TenantContext,
    ) -> Self {
        Self {
            payment_id: payment_id.into(),
            source_account: source_account.into(),
            destination_account: destination_account.into(),
            amount,
            reference: reference.into(),
            payment_type: None,
            tenant,
            initiated_at: Utc::now(),
        }
    }

    pub fn with_payment_type(mut self, payment_type: impl Into<String>) -> Self {
        self.payment_type = Some(payment_type.into());
        self
    }

    pub fn with_initiated_at(mut self, initiated_at: DateTime<Utc>) -> Self {
        self.initiated_at = initiated_at;
        self
    }
}

/// Per-attempt runtime carrier of ids and timestamps.
///
/// Passed explicitly to every rule; nothing here lives in task-local state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationContext {
    pub validation_id: String,
    pub payment_id: String,
    pub tenant: TenantContext,
    pub correlation_id: String,
    pub started_at: DateTime<Utc>,
}

impl ValidationContext {
    pub fn new(payment: &PaymentInitiated, correlation_id: impl Into<String>) -> Self {
        Self {
            validation_id: Uuid::new_v4().to_string(),
            payment_id: payment.payment_id.clone(),
            tenant: payment.tenant.clone(),
            correlation_id: correlation_id.into(),
            started_at: Utc::now(),
        }
    }
}

/// The four rule groupings, in canonical dispatch order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RuleFamily {
    Business,
    Compliance,
    Fraud,
    Risk,
}

impl RuleFamily {
    pub const CANONICAL_ORDER: [RuleFamily; 4] = [
        RuleFamily::Business,
        RuleFamily::Compliance,
        RuleFamily::Fraud,
        RuleFamily::Risk,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::Business => "BUSINESS",
            Self::Compliance => "COMPLIANCE",
            Self::Fraud => "FRAUD",
            Self::Risk => "RISK",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Business => "Business",
            Self::Compliance => "Compliance",
            Self::Fraud => "Fraud",
            Self::Risk => "Risk",
        }
    }
}

impl fmt::Display for RuleFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One configurable rule. The expression is opaque to the registry and
/// dispatcher; the owning family engine resolves it by rule id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleDefinition {
    pub rule_id: String,
    pub rule_name: String,
    pub family: RuleFamily,
    pub expression: String,
    pub priority: i32,
    pub active: bool,
    pub tenant_id: String,
    pub version: u32,
    pub parameters: BTreeMap<String, Value>,
}

impl RuleDefinition {
    pub fn new(
        rule_id: impl Into<String>,
        rule_name: impl Into<String>,
        family: RuleFamily,
        priority: i32,
    ) -> Self {
        Self {
            rule_id: rule_id.into(),
            rule_name: rule_name.into(),
            family,
            expression: String::new(),
            priority,
            active: true,
            tenant_id: "default".to_string(),
            version: 1,
            parameters: BTreeMap::new(),
        }
    }

    pub fn with_expression(mut self, expression: impl Into<String>) -> Self {
        self.expression = expression.into();
        self
    }

    pub fn with_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = tenant_id.into();
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: Value) -> Self {
        self.parameters.insert(key.into(), value);
        self
    }

    pub fn inactive(mut self) -> Self {
        self.active = false;
        self
    }

    pub fn param_u64(&self, key: &str) -> Option<u64> {
        self.parameters.get(key).and_then(Value::as_u64)
    }

    pub fn param_i64(&self, key: &str) -> Option<i64> {
        self.parameters.get(key).and_then(Value::as_i64)
    }

    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.parameters.get(key).and_then(Value::as_str)
    }

    pub fn param_str_list(&self, key: &str) -> Option<Vec<String>> {
        self.parameters.get(key).and_then(Value::as_array).map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
    }
}

/// Per-rule rejection record. Immutable once emitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedRule {
    pub rule_id: String,
    pub rule_name: String,
    pub family: RuleFamily,
    pub failure_reason: String,
    pub field: Option<String>,
    pub failed_at: DateTime<Utc>,
}

impl FailedRule {
    pub fn new(
        rule_id: impl Into<String>,
        rule_name: impl Into<String>,
        family: RuleFamily,
        failure_reason: impl Into<String>,
    ) -> Self {
        Self {
            rule_id: rule_id.into(),
            rule_name: rule_name.into(),
            family,
            failure_reason: failure_reason.into(),
            field: None,
            failed_at: Utc::now(),
        }
    }

    pub fn with_field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }
}

/// Outcome of one family engine run. Deltas are reported unclamped;
/// clamping happens once in aggregation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FamilyResult {
    pub family: RuleFamily,
    pub success: bool,
    pub applied_rules: Vec<String>,
    pub failed_rules: Vec<FailedRule>,
    pub fraud_delta: u32,
    pub risk_delta: u32,
    pub elapsed_ms: u64,
    pub error_message: Option<String>,
}

impl FamilyResult {
    /// Synthetic result for a family engine that raised or panicked.
    pub fn engine_error(family: RuleFamily, message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            family,
            success: false,
            applied_rules: Vec::new(),
            failed_rules: vec![FailedRule::new(
                format!("{}_ENGINE_ERROR", family.name()),
                format!("{} Engine Error", family.label()),
                family,
                message.clone(),
            )],
            fraud_delta: 0,
            risk_delta: 100,
            elapsed_ms: 0,
            error_message: Some(message),
        }
    }

    /// Synthetic result for a family that missed the validation deadline.
    pub fn timed_out(family: RuleFamily, budget_ms: u64) -> Self {
        Self {
            family,
            success: false,
            applied_rules: Vec::new(),
            failed_rules: vec![FailedRule::new(
                format!("{}_TIMEOUT", family.name()),
                format!("{} Family Timeout", family.label()),
                family,
                "rule family did not complete within budget",
            )],
            fraud_delta: 0,
            risk_delta: 100,
            elapsed_ms: budget_ms,
            error_message: Some(format!(
                "rule family did not complete within {budget_ms}ms budget"
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValidationStatus {
    Passed,
    Failed,
}

impl ValidationStatus {
    pub fn name(self) -> &'static str {
        match self {
            Self::Passed => "PASSED",
            Self::Failed => "FAILED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_uppercase().as_str() {
            "PASSED" => Some(Self::Passed),
            "FAILED" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for ValidationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    /// First-match derivation over the failed set: fraud failures dominate,
    /// then risk failures, then any failure, else low.
    pub fn derive(failed_rules: &[FailedRule]) -> Self {
        if failed_rules
            .iter()
            .any(|rule| rule.family == RuleFamily::Fraud)
        {
            return Self::Critical;
        }
        if failed_rules
            .iter()
            .any(|rule| rule.family == RuleFamily::Risk)
        {
            return Self::High;
        }
        if !failed_rules.is_empty() {
            return Self::Medium;
        }
        Self::Low
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Low => "LOW",
            Self::Medium => "MEDIUM",
            Self::High => "HIGH",
            Self::Critical => "CRITICAL",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_uppercase().as_str() {
            "LOW" => Some(Self::Low),
            "MEDIUM" => Some(Self::Medium),
            "HIGH" => Some(Self::High),
            "CRITICAL" => Some(Self::Critical),
            _ => None,
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Sealed per-payment verdict. Born at orchestration start, immutable once
/// aggregated, persisted and published as-is.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationResult {
    pub validation_id: String,
    pub payment_id: String,
    pub tenant: TenantContext,
    pub correlation_id: String,
    pub status: ValidationStatus,
    pub risk_level: RiskLevel,
    pub fraud_score: u8,
    pub risk_score: u8,
    pub applied_rules: Vec<String>,
    pub failed_rules: Vec<FailedRule>,
    pub validated_at: DateTime<Utc>,
    pub reason: Option<String>,
    pub created_by: String,
    pub metadata: Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn risk_level_derivation_first_match_wins() {
        let fraud = FailedRule::new("FRAUD_RULE_001", "Velocity Check", RuleFamily::Fraud, "x");
        let risk = FailedRule::new("RISK_RULE_001", "Credit Exposure", RuleFamily::Risk, "x");
        let business = FailedRule::new(
            "BUSINESS_RULE_002",
            "Same Account Transfer",
            RuleFamily::Business,
            "x",
        );

        assert_eq!(RiskLevel::derive(&[]), RiskLevel::Low);
        assert_eq!(RiskLevel::derive(&[business.clone()]), RiskLevel::Medium);
        assert_eq!(
            RiskLevel::derive(&[business.clone(), risk.clone()]),
            RiskLevel::High
        );
        assert_eq!(
            RiskLevel::derive(&[business, risk, fraud]),
            RiskLevel::Critical
        );
    }

    #[test]
    fn synthetic_timeout_result_carries_single_failed_rule() {
        let result = FamilyResult::timed_out(RuleFamily::Compliance, 2000);
        assert!(!result.success);
        assert_eq!(result.failed_rules.len(), 1);
        assert_eq!(result.failed_rules[0].rule_id, "COMPLIANCE_TIMEOUT");
        assert_eq!(result.risk_delta, 100);
        assert_eq!(result.fraud_delta, 0);
    }

    #[test]
    fn minor_unit_conversion_uses_two_decimals() {
        let amount = Money::from_major(60_000, "USD");
        assert_eq!(amount.minor, 6_000_000);
    }

    #[test]
    fn family_serializes_screaming_snake() {
        let value = serde_json::to_value(RuleFamily::Compliance).unwrap();
        assert_eq!(value, serde_json::json!("COMPLIANCE"));
    }
}
