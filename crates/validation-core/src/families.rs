use crate::error::ValidationError;
use crate::types::{
    FailedRule, FamilyResult, PaymentInitiated, RuleDefinition, RuleFamily, ValidationContext,
};
use async_trait::async_trait;
use chrono::{FixedOffset, Timelike};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::warn;

/// Risk uplift applied for every business-rule rejection.
const BUSINESS_FAILURE_RISK_DELTA: u32 = 10;
/// Risk uplift applied for every compliance-rule rejection.
const COMPLIANCE_FAILURE_RISK_DELTA: u32 = 15;

/// Outcome of one external screening call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScreeningOutcome {
    pub passed: bool,
    pub detail: Option<String>,
}

impl ScreeningOutcome {
    pub fn clear() -> Self {
        Self {
            passed: true,
            detail: None,
        }
    }

    pub fn clear_with_evidence(evidence: impl Into<String>) -> Self {
        Self {
            passed: true,
            detail: Some(evidence.into()),
        }
    }

    pub fn flagged(detail: impl Into<String>) -> Self {
        Self {
            passed: false,
            detail: Some(detail.into()),
        }
    }
}

/// External compliance hooks consulted by the compliance family.
///
/// Implementations must be safe to call concurrently; each call is wrapped in
/// its own timeout strictly below the per-validation budget.
#[async_trait]
pub trait ComplianceGateway: Send + Sync {
    async fn screen_aml(
        &self,
        scope: &ValidationContext,
        payment: &PaymentInitiated,
    ) -> Result<ScreeningOutcome, ValidationError>;

    async fn screen_sanctions(
        &self,
        scope: &ValidationContext,
        payment: &PaymentInitiated,
    ) -> Result<ScreeningOutcome, ValidationError>;

    async fn check_kyc(
        &self,
        scope: &ValidationContext,
        payment: &PaymentInitiated,
    ) -> Result<ScreeningOutcome, ValidationError>;

    async fn regulatory_flag(
        &self,
        scope: &ValidationContext,
        payment: &PaymentInitiated,
    ) -> Result<ScreeningOutcome, ValidationError>;
}

/// Per-hook call budgets in milliseconds.
#[derive(Debug, Clone)]
pub struct HookTimeouts {
    pub aml_ms: u64,
    pub sanctions_ms: u64,
    pub kyc_ms: u64,
}

impl Default for HookTimeouts {
    fn default() -> Self {
        Self {
            aml_ms: 500,
            sanctions_ms: 500,
            kyc_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Hook {
    Aml,
    Sanctions,
    Kyc,
    Regulatory,
}

impl Hook {
    fn name(self) -> &'static str {
        match self {
            Self::Aml => "aml",
            Self::Sanctions => "sanctions",
            Self::Kyc => "kyc",
            Self::Regulatory => "regulatory",
        }
    }
}

enum RuleOutcome {
    Pass,
    Fail {
        reason: String,
        field: Option<String>,
        fraud_delta: u32,
        risk_delta: u32,
    },
}

impl RuleOutcome {
    fn fail(reason: impl Into<String>) -> Self {
        Self::Fail {
            reason: reason.into(),
            field: None,
            fraud_delta: 0,
            risk_delta: 0,
        }
    }

    fn with_field(self, field: impl Into<String>) -> Self {
        match self {
            Self::Pass => Self::Pass,
            Self::Fail {
                reason,
                fraud_delta,
                risk_delta,
                ..
            } => Self::Fail {
                reason,
                field: Some(field.into()),
                fraud_delta,
                risk_delta,
            },
        }
    }

    fn with_fraud_delta(self, delta: u32) -> Self {
        match self {
            Self::Pass => Self::Pass,
            Self::Fail {
                reason,
                field,
                risk_delta,
                ..
            } => Self::Fail {
                reason,
                field,
                fraud_delta: delta,
                risk_delta,
            },
        }
    }

    fn with_risk_delta(self, delta: u32) -> Self {
        match self {
            Self::Pass => Self::Pass,
            Self::Fail {
                reason,
                field,
                fraud_delta,
                ..
            } => Self::Fail {
                reason,
                field,
                fraud_delta,
                risk_delta: delta,
            },
        }
    }
}

/// Tagged family engine: one struct, behavior keyed by `family`.
///
/// Rule bodies are resolved by rule id; an active definition with no binding
/// for its family is an engine error and surfaces at the dispatcher boundary
/// as a synthetic `<FAMILY>_ENGINE_ERROR` failure.
#[derive(Clone)]
pub struct FamilyEngine {
    family: RuleFamily,
    gateway: Arc<dyn ComplianceGateway>,
    hook_timeouts: HookTimeouts,
}

impl FamilyEngine {
    pub fn new(
        family: RuleFamily,
        gateway: Arc<dyn ComplianceGateway>,
        hook_timeouts: HookTimeouts,
    ) -> Self {
        Self {
            family,
            gateway,
            hook_timeouts,
        }
    }

    pub fn family(&self) -> RuleFamily {
        self.family
    }

    /// Apply this family's rules in priority order.
    ///
    /// Every evaluated rule lands in `applied_rules`; rejections accumulate as
    /// `FailedRule` values. Only infrastructure problems return an error.
    pub async fn execute(
        &self,
        scope: &ValidationContext,
        payment: &PaymentInitiated,
        rules: &[RuleDefinition],
    ) -> Result<FamilyResult, ValidationError> {
        let started = Instant::now();
        let mut applied_rules = Vec::with_capacity(rules.len());
        let mut failed_rules = Vec::new();
        let mut fraud_delta = 0u32;
        let mut risk_delta = 0u32;

        for rule in rules {
            applied_rules.push(rule.rule_id.clone());
            match self.evaluate(scope, payment, rule).await? {
                RuleOutcome::Pass => {}
                RuleOutcome::Fail {
                    reason,
                    field,
                    fraud_delta: fraud,
                    risk_delta: risk,
                } => {
                    fraud_delta += fraud;
                    risk_delta += risk;
                    let mut failed = FailedRule::new(
                        rule.rule_id.clone(),
                        rule.rule_name.clone(),
                        self.family,
                        reason,
                    );
                    failed.field = field;
                    failed_rules.push(failed);
                }
            }
        }

        Ok(FamilyResult {
            family: self.family,
            success: failed_rules.is_empty(),
            applied_rules,
            failed_rules,
            fraud_delta,
            risk_delta,
            elapsed_ms: started.elapsed().as_millis() as u64,
            error_message: None,
        })
    }

    async fn evaluate(
        &self,
        scope: &ValidationContext,
        payment: &PaymentInitiated,
        rule: &RuleDefinition,
    ) -> Result<RuleOutcome, ValidationError> {
        let outcome = match (self.family, rule.rule_id.as_str()) {
            (RuleFamily::Business, "BUSINESS_RULE_001") => amount_limit(payment, rule),
            (RuleFamily::Business, "BUSINESS_RULE_002") => same_account(payment),
            (RuleFamily::Business, "BUSINESS_RULE_003") => business_hours(payment, rule),
            (RuleFamily::Business, "BUSINESS_RULE_004") => currency_code(payment),
            (RuleFamily::Business, "BUSINESS_RULE_005") => payment_type_allowed(payment, rule),
            (RuleFamily::Compliance, "COMPLIANCE_RULE_001") => reference_present(payment),
            (RuleFamily::Compliance, "COMPLIANCE_RULE_002") => {
                self.screen(scope, payment, Hook::Aml).await
            }
            (RuleFamily::Compliance, "COMPLIANCE_RULE_003") => {
                self.screen(scope, payment, Hook::Sanctions).await
            }
            (RuleFamily::Compliance, "COMPLIANCE_RULE_004") => {
                self.screen(scope, payment, Hook::Kyc).await
            }
            (RuleFamily::Compliance, "COMPLIANCE_RULE_005") => {
                self.screen(scope, payment, Hook::Regulatory).await
            }
            (RuleFamily::Fraud, "FRAUD_RULE_001") => {
                fraud_amount(payment, rule, 5_000_000, 25, "velocity threshold")
            }
            (RuleFamily::Fraud, "FRAUD_RULE_002") => {
                fraud_amount(payment, rule, 7_500_000, 30, "anomaly threshold")
            }
            (RuleFamily::Fraud, "FRAUD_RULE_003") => account_pattern(payment, rule),
            (RuleFamily::Fraud, "FRAUD_RULE_004") => time_of_day(payment, rule),
            (RuleFamily::Fraud, "FRAUD_RULE_005") => {
                fraud_amount(payment, rule, 10_000_000, 35, "behavioral baseline")
            }
            (RuleFamily::Risk, "RISK_RULE_001") => {
                risk_amount(payment, rule, 20_000_000, 30, "credit exposure limit")
            }
            (RuleFamily::Risk, "RISK_RULE_002") => market_risk(payment, rule),
            (RuleFamily::Risk, "RISK_RULE_003") => {
                risk_amount(payment, rule, 100_000_000, 35, "operational risk limit")
            }
            (RuleFamily::Risk, "RISK_RULE_004") => {
                risk_amount(payment, rule, 50_000_000, 20, "liquidity risk limit")
            }
            (RuleFamily::Risk, "RISK_RULE_005") => counterparty_risk(payment, rule),
            _ => {
                return Err(ValidationError::family_engine(
                    self.family.name(),
                    format!("no binding for rule '{}'", rule.rule_id),
                ))
            }
        };

        Ok(outcome)
    }

    /// Run one external screening hook under its own call budget.
    ///
    /// A hook error or timeout is a compliance rejection, never an engine
    /// error: the payment must not sail through because a screening backend
    /// is down.
    async fn screen(
        &self,
        scope: &ValidationContext,
        payment: &PaymentInitiated,
        hook: Hook,
    ) -> RuleOutcome {
        let budget_ms = match hook {
            Hook::Aml => self.hook_timeouts.aml_ms,
            Hook::Sanctions => self.hook_timeouts.sanctions_ms,
            // Regulatory flag checks ride on the KYC backend and share its budget.
            Hook::Kyc | Hook::Regulatory => self.hook_timeouts.kyc_ms,
        };

        let call = async {
            match hook {
                Hook::Aml => self.gateway.screen_aml(scope, payment).await,
                Hook::Sanctions => self.gateway.screen_sanctions(scope, payment).await,
                Hook::Kyc => self.gateway.check_kyc(scope, payment).await,
                Hook::Regulatory => self.gateway.regulatory_flag(scope, payment).await,
            }
        };

        match tokio::time::timeout(Duration::from_millis(budget_ms.max(1)), call).await {
            Ok(Ok(outcome)) if outcome.passed => RuleOutcome::Pass,
            Ok(Ok(outcome)) => RuleOutcome::fail(
                outcome
                    .detail
                    .unwrap_or_else(|| format!("{} screening flagged the payment", hook.name())),
            )
            .with_risk_delta(COMPLIANCE_FAILURE_RISK_DELTA),
            Ok(Err(err)) => {
                warn!(
                    validation_id = %scope.validation_id,
                    hook = hook.name(),
                    error = %err,
                    "compliance hook failed; rejecting rule"
                );
                RuleOutcome::fail(format!("{} screening unavailable: {err}", hook.name()))
                    .with_risk_delta(COMPLIANCE_FAILURE_RISK_DELTA)
            }
            Err(_) => {
                warn!(
                    validation_id = %scope.validation_id,
                    hook = hook.name(),
                    budget_ms,
                    "compliance hook timed out; rejecting rule"
                );
                RuleOutcome::fail(format!(
                    "{} screening did not answer within {budget_ms}ms",
                    hook.name()
                ))
                .with_risk_delta(COMPLIANCE_FAILURE_RISK_DELTA)
            }
        }
    }
}

fn amount_limit(payment: &PaymentInitiated, rule: &RuleDefinition) -> RuleOutcome {
    let Some(max_minor) = rule.param_u64("max_amount_minor") else {
        return RuleOutcome::Pass;
    };
    if payment.amount.minor > max_minor {
        return RuleOutcome::fail(format!(
            "amount {} exceeds tenant limit {max_minor}",
            payment.amount.minor
        ))
        .with_field("amount")
        .with_risk_delta(BUSINESS_FAILURE_RISK_DELTA);
    }
    RuleOutcome::Pass
}

fn same_account(payment: &PaymentInitiated) -> RuleOutcome {
    if payment.source_account == payment.destination_account {
        return RuleOutcome::fail("source and destination accounts are identical")
            .with_field("destination_account")
            .with_risk_delta(BUSINESS_FAILURE_RISK_DELTA);
    }
    RuleOutcome::Pass
}

fn business_hours(payment: &PaymentInitiated, rule: &RuleDefinition) -> RuleOutcome {
    let (Some(start), Some(end)) = (
        rule.param_u64("window_start_hour"),
        rule.param_u64("window_end_hour"),
    ) else {
        return RuleOutcome::Pass;
    };
    let hour = local_hour(payment, rule) as u64;
    if hour < start || hour >= end {
        return RuleOutcome::fail(format!(
            "initiated at hour {hour}, outside business window [{start}, {end})"
        ))
        .with_field("initiated_at")
        .with_risk_delta(BUSINESS_FAILURE_RISK_DELTA);
    }
    RuleOutcome::Pass
}

fn currency_code(payment: &PaymentInitiated) -> RuleOutcome {
    let currency = payment.amount.currency.as_str();
    if currency.len() != 3 || !currency.chars().all(|c| c.is_ascii_alphabetic()) {
        return RuleOutcome::fail(format!("'{currency}' is not a three-letter currency code"))
            .with_field("amount.currency")
            .with_risk_delta(BUSINESS_FAILURE_RISK_DELTA);
    }
    RuleOutcome::Pass
}

fn payment_type_allowed(payment: &PaymentInitiated, rule: &RuleDefinition) -> RuleOutcome {
    let Some(allowed) = rule.param_str_list("allowed_types") else {
        return RuleOutcome::Pass;
    };
    let Some(payment_type) = payment.payment_type.as_deref() else {
        return RuleOutcome::Pass;
    };
    if !allowed.iter().any(|candidate| candidate == payment_type) {
        return RuleOutcome::fail(format!(
            "payment type '{payment_type}' is not enabled for this tenant"
        ))
        .with_field("payment_type")
        .with_risk_delta(BUSINESS_FAILURE_RISK_DELTA);
    }
    RuleOutcome::Pass
}

fn reference_present(payment: &PaymentInitiated) -> RuleOutcome {
    if payment.reference.trim().is_empty() {
        return RuleOutcome::fail("payment reference is required")
            .with_field("reference")
            .with_risk_delta(COMPLIANCE_FAILURE_RISK_DELTA);
    }
    RuleOutcome::Pass
}

/// Amount-based fraud checks are calibrated in the tenant home currency and
/// skip payments denominated in anything else; cross-currency exposure is the
/// market-risk rule's concern.
fn fraud_amount(
    payment: &PaymentInitiated,
    rule: &RuleDefinition,
    default_threshold_minor: u64,
    default_delta: u32,
    label: &str,
) -> RuleOutcome {
    let home_currency = rule.param_str("home_currency").unwrap_or("USD");
    if payment.amount.currency != home_currency {
        return RuleOutcome::Pass;
    }
    let threshold = rule
        .param_u64("threshold_minor")
        .unwrap_or(default_threshold_minor);
    if payment.amount.minor > threshold {
        let delta = rule.param_u64("fraud_delta").unwrap_or(default_delta as u64) as u32;
        return RuleOutcome::fail(format!(
            "amount {} exceeds {label} {threshold}",
            payment.amount.minor
        ))
        .with_field("amount")
        .with_fraud_delta(delta);
    }
    RuleOutcome::Pass
}

fn account_pattern(payment: &PaymentInitiated, rule: &RuleDefinition) -> RuleOutcome {
    let Some(pattern) = rule.param_str("suspicious_pattern") else {
        return RuleOutcome::Pass;
    };
    if payment.source_account.contains(pattern) {
        let delta = rule.param_u64("fraud_delta").unwrap_or(20) as u32;
        return RuleOutcome::fail(format!(
            "source account matches suspicious pattern '{pattern}'"
        ))
        .with_field("source_account")
        .with_fraud_delta(delta);
    }
    RuleOutcome::Pass
}

fn time_of_day(payment: &PaymentInitiated, rule: &RuleDefinition) -> RuleOutcome {
    let day_start = rule.param_u64("day_start_hour").unwrap_or(6);
    let day_end = rule.param_u64("day_end_hour").unwrap_or(22);
    let hour = local_hour(payment, rule) as u64;
    if hour < day_start || hour > day_end {
        let delta = rule.param_u64("fraud_delta").unwrap_or(15) as u32;
        return RuleOutcome::fail(format!(
            "initiated at hour {hour}, outside daytime window [{day_start}, {day_end}]"
        ))
        .with_field("initiated_at")
        .with_fraud_delta(delta);
    }
    RuleOutcome::Pass
}

fn risk_amount(
    payment: &PaymentInitiated,
    rule: &RuleDefinition,
    default_threshold_minor: u64,
    default_delta: u32,
    label: &str,
) -> RuleOutcome {
    let threshold = rule
        .param_u64("threshold_minor")
        .unwrap_or(default_threshold_minor);
    if payment.amount.minor > threshold {
        let delta = rule.param_u64("risk_delta").unwrap_or(default_delta as u64) as u32;
        return RuleOutcome::fail(format!(
            "amount {} exceeds {label} {threshold}",
            payment.amount.minor
        ))
        .with_field("amount")
        .with_risk_delta(delta);
    }
    RuleOutcome::Pass
}

fn market_risk(payment: &PaymentInitiated, rule: &RuleDefinition) -> RuleOutcome {
    let home_currency = rule.param_str("home_currency").unwrap_or("USD");
    if payment.amount.currency != home_currency {
        let delta = rule.param_u64("risk_delta").unwrap_or(25) as u32;
        return RuleOutcome::fail(format!(
            "currency {} differs from tenant home currency {home_currency}",
            payment.amount.currency
        ))
        .with_field("amount.currency")
        .with_risk_delta(delta);
    }
    RuleOutcome::Pass
}

fn counterparty_risk(payment: &PaymentInitiated, rule: &RuleDefinition) -> RuleOutcome {
    let Some(pattern) = rule.param_str("high_risk_pattern") else {
        return RuleOutcome::Pass;
    };
    if payment.destination_account.contains(pattern) {
        let delta = rule.param_u64("risk_delta").unwrap_or(40) as u32;
        return RuleOutcome::fail(format!(
            "destination account matches high-risk pattern '{pattern}'"
        ))
        .with_field("destination_account")
        .with_risk_delta(delta);
    }
    RuleOutcome::Pass
}

/// Hour of day in the tenant-configured offset, defaulting to UTC.
fn local_hour(payment: &PaymentInitiated, rule: &RuleDefinition) -> u32 {
    let offset_minutes = rule.param_i64("utc_offset_minutes").unwrap_or(0);
    match FixedOffset::east_opt((offset_minutes * 60) as i32) {
        Some(offset) => payment.initiated_at.with_timezone(&offset).hour(),
        None => payment.initiated_at.hour(),
    }
}
