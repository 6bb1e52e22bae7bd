//! Multi-tenant payment validation engine.
//!
//! Consumes `PaymentInitiated` payments, fans each one out to four rule
//! families (business, compliance, fraud, risk) under a shared deadline,
//! folds the family results into one sealed `ValidationResult`, persists it
//! idempotently, and publishes a `PaymentValidated` / `ValidationFailed`
//! outcome event keyed on the payment id.

#![deny(unsafe_code)]

pub mod aggregate;
pub mod dispatch;
pub mod error;
pub mod families;
pub mod lifecycle;
pub mod orchestrator;
pub mod publisher;
pub mod registry;
pub mod store;
pub mod types;

pub use aggregate::ResultAggregator;
pub use dispatch::RuleDispatcher;
pub use error::ValidationError;
pub use families::{ComplianceGateway, FamilyEngine, HookTimeouts, ScreeningOutcome};
pub use lifecycle::{ValidationLifecycle, ValidationStage};
pub use orchestrator::{OrchestratorConfig, ValidationOrchestrator};
pub use publisher::{
    EventBus, FailedRuleRecord, OutcomeEvent, OutcomePublisher, PublisherConfig,
    EVENT_VERSION, PAYMENT_VALIDATED, VALIDATION_FAILED,
};
pub use registry::{
    builtin_rule_set, CachePolicy, DefaultRuleSource, ExecutionPolicy, RuleRegistry, RuleSource,
    TenantRuleSet,
};
pub use store::{
    Page, PageRequest, PublishTombstone, StoreConfig, TenantStatistics, ValidationResultStore,
};
pub use types::{
    FailedRule, FamilyResult, Money, PaymentInitiated, RiskLevel, RuleDefinition, RuleFamily,
    TenantContext, ValidationContext, ValidationResult, ValidationStatus, SERVICE_NAME,
};
