use crate::error::ValidationError;
use crate::types::{RuleDefinition, RuleFamily};
use async_trait::async_trait;
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::warn;

/// Rule cache sizing policy.
#[derive(Debug, Clone)]
pub struct CachePolicy {
    pub enabled: bool,
    pub capacity: usize,
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            capacity: 1024,
        }
    }
}

/// Execution policy applied to every validation attempt.
#[derive(Debug, Clone)]
pub struct ExecutionPolicy {
    /// Run the four families concurrently; serial keeps canonical order.
    pub parallel: bool,
    /// Upper bound on concurrently running family tasks.
    pub max_parallel_rules: usize,
    /// Wall-clock deadline for the whole fan-out, in milliseconds.
    pub budget_ms: u64,
    pub cache: CachePolicy,
}

impl Default for ExecutionPolicy {
    fn default() -> Self {
        Self {
            parallel: true,
            max_parallel_rules: 4,
            budget_ms: 2000,
            cache: CachePolicy::default(),
        }
    }
}

/// Ordered per-family view of one tenant's active rules.
#[derive(Debug, Clone)]
pub struct TenantRuleSet {
    tenant_id: String,
    families: BTreeMap<RuleFamily, Vec<RuleDefinition>>,
}

impl TenantRuleSet {
    /// Drops inactive definitions and orders each family by
    /// `(priority, rule_id)` so evaluation order is deterministic.
    pub fn from_definitions(tenant_id: impl Into<String>, definitions: Vec<RuleDefinition>) -> Self {
        let mut families: BTreeMap<RuleFamily, Vec<RuleDefinition>> = BTreeMap::new();
        for definition in definitions {
            if !definition.active {
                continue;
            }
            families.entry(definition.family).or_default().push(definition);
        }
        for rules in families.values_mut() {
            rules.sort_by(|a, b| {
                (a.priority, a.rule_id.as_str()).cmp(&(b.priority, b.rule_id.as_str()))
            });
        }
        Self {
            tenant_id: tenant_id.into(),
            families,
        }
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    pub fn rules(&self, family: RuleFamily) -> &[RuleDefinition] {
        self.families
            .get(&family)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.families.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Tenant rule definition source.
///
/// `Ok(None)` means the tenant has no override and the built-in set applies.
#[async_trait]
pub trait RuleSource: Send + Sync {
    async fn load(&self, tenant_id: &str)
        -> Result<Option<Vec<RuleDefinition>>, ValidationError>;
}

/// Source with no tenant overrides; every tenant gets the built-in set.
#[derive(Debug, Clone, Default)]
pub struct DefaultRuleSource;

#[async_trait]
impl RuleSource for DefaultRuleSource {
    async fn load(
        &self,
        _tenant_id: &str,
    ) -> Result<Option<Vec<RuleDefinition>>, ValidationError> {
        Ok(None)
    }
}

/// Process-wide registry of per-tenant rule sets.
///
/// Cached entries are `Arc` snapshots: invalidation swaps the map entry and
/// never mutates a set concurrent readers already hold.
pub struct RuleRegistry {
    source: Arc<dyn RuleSource>,
    policy: ExecutionPolicy,
    cache: RwLock<HashMap<String, Arc<TenantRuleSet>>>,
}

impl RuleRegistry {
    pub fn new(source: Arc<dyn RuleSource>, policy: ExecutionPolicy) -> Self {
        Self {
            source,
            policy,
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(Arc::new(DefaultRuleSource), ExecutionPolicy::default())
    }

    pub fn policy(&self) -> &ExecutionPolicy {
        &self.policy
    }

    /// Resolve the ordered rule set for a tenant.
    ///
    /// A failed load falls back to the built-in set and is logged; it never
    /// blocks validation.
    pub async fn rules_for(&self, tenant_id: &str) -> Arc<TenantRuleSet> {
        if self.policy.cache.enabled {
            if let Some(cached) = self.cache.read().await.get(tenant_id) {
                return cached.clone();
            }
        }

        let definitions = match self.source.load(tenant_id).await {
            Ok(Some(definitions)) => definitions,
            Ok(None) => builtin_rule_set(tenant_id),
            Err(err) => {
                warn!(
                    tenant_id,
                    error = %err,
                    "tenant rule load failed; falling back to built-in rule set"
                );
                builtin_rule_set(tenant_id)
            }
        };

        let set = Arc::new(TenantRuleSet::from_definitions(tenant_id, definitions));

        if self.policy.cache.enabled {
            let mut cache = self.cache.write().await;
            if cache.len() >= self.policy.cache.capacity.max(1) {
                // Coarse reset keeps the map bounded without an LRU chain.
                cache.clear();
            }
            cache.insert(tenant_id.to_string(), set.clone());
        }

        set
    }

    /// Drop a tenant's cached snapshot so the next lookup reloads.
    pub async fn invalidate(&self, tenant_id: &str) {
        self.cache.write().await.remove(tenant_id);
    }

    pub async fn cached_tenants(&self) -> usize {
        self.cache.read().await.len()
    }
}

/// Built-in rule set applied when a tenant carries no override.
///
/// Placeholder predicates (business max amount, business hours, allowed
/// payment types, account patterns) ship without thresholds and pass until a
/// tenant configures them.
pub fn builtin_rule_set(tenant_id: &str) -> Vec<RuleDefinition> {
    let rules = vec![
        RuleDefinition::new("BUSINESS_RULE_001", "Amount Limit", RuleFamily::Business, 10)
            .with_expression("amount.minor > max_amount_minor"),
        RuleDefinition::new(
            "BUSINESS_RULE_002",
            "Same Account Transfer",
            RuleFamily::Business,
            20,
        )
        .with_expression("source_account == destination_account"),
        RuleDefinition::new("BUSINESS_RULE_003", "Business Hours", RuleFamily::Business, 30)
            .with_expression("initiated hour outside [window_start_hour, window_end_hour)"),
        RuleDefinition::new("BUSINESS_RULE_004", "Currency Code", RuleFamily::Business, 40)
            .with_expression("currency is a three-letter alphabetic code"),
        RuleDefinition::new(
            "BUSINESS_RULE_005",
            "Payment Type Allowed",
            RuleFamily::Business,
            50,
        )
        .with_expression("payment_type in allowed_types"),
        RuleDefinition::new(
            "COMPLIANCE_RULE_001",
            "Reference Present",
            RuleFamily::Compliance,
            10,
        )
        .with_expression("reference is non-empty"),
        RuleDefinition::new(
            "COMPLIANCE_RULE_002",
            "AML Screening",
            RuleFamily::Compliance,
            20,
        )
        .with_expression("external aml hook"),
        RuleDefinition::new(
            "COMPLIANCE_RULE_003",
            "Sanctions Screening",
            RuleFamily::Compliance,
            30,
        )
        .with_expression("external sanctions hook"),
        RuleDefinition::new("COMPLIANCE_RULE_004", "KYC Status", RuleFamily::Compliance, 40)
            .with_expression("external kyc hook"),
        RuleDefinition::new(
            "COMPLIANCE_RULE_005",
            "Regulatory Reporting Flag",
            RuleFamily::Compliance,
            50,
        )
        .with_expression("external regulatory hook"),
        RuleDefinition::new("FRAUD_RULE_001", "Velocity Check", RuleFamily::Fraud, 10)
            .with_expression("amount.minor > threshold_minor")
            .with_param("threshold_minor", json!(5_000_000))
            .with_param("fraud_delta", json!(25))
            .with_param("home_currency", json!("USD")),
        RuleDefinition::new("FRAUD_RULE_002", "Amount Anomaly", RuleFamily::Fraud, 20)
            .with_expression("amount.minor > threshold_minor")
            .with_param("threshold_minor", json!(7_500_000))
            .with_param("fraud_delta", json!(30))
            .with_param("home_currency", json!("USD")),
        RuleDefinition::new("FRAUD_RULE_003", "Account Pattern", RuleFamily::Fraud, 30)
            .with_expression("source_account matches suspicious_pattern")
            .with_param("fraud_delta", json!(20)),
        RuleDefinition::new("FRAUD_RULE_004", "Time Of Day", RuleFamily::Fraud, 40)
            .with_expression("initiated hour outside [day_start_hour, day_end_hour]")
            .with_param("day_start_hour", json!(6))
            .with_param("day_end_hour", json!(22))
            .with_param("fraud_delta", json!(15)),
        RuleDefinition::new("FRAUD_RULE_005", "Behavioral Profile", RuleFamily::Fraud, 50)
            .with_expression("amount.minor > threshold_minor")
            .with_param("threshold_minor", json!(10_000_000))
            .with_param("fraud_delta", json!(35))
            .with_param("home_currency", json!("USD")),
        RuleDefinition::new("RISK_RULE_001", "Credit Exposure", RuleFamily::Risk, 10)
            .with_expression("amount.minor > threshold_minor")
            .with_param("threshold_minor", json!(20_000_000))
            .with_param("risk_delta", json!(30)),
        RuleDefinition::new("RISK_RULE_002", "Market Risk", RuleFamily::Risk, 20)
            .with_expression("currency != home_currency")
            .with_param("home_currency", json!("USD"))
            .with_param("risk_delta", json!(25)),
        RuleDefinition::new("RISK_RULE_003", "Operational Risk", RuleFamily::Risk, 30)
            .with_expression("amount.minor > threshold_minor")
            .with_param("threshold_minor", json!(100_000_000))
            .with_param("risk_delta", json!(35)),
        RuleDefinition::new("RISK_RULE_004", "Liquidity Risk", RuleFamily::Risk, 40)
            .with_expression("amount.minor > threshold_minor")
            .with_param("threshold_minor", json!(50_000_000))
            .with_param("risk_delta", json!(20)),
        RuleDefinition::new("RISK_RULE_005", "Counterparty Risk", RuleFamily::Risk, 50)
            .with_expression("destination_account matches high_risk_pattern")
            .with_param("risk_delta", json!(40)),
    ];

    rules
        .into_iter()
        .map(|rule| rule.with_tenant(tenant_id))
        .collect()
}
