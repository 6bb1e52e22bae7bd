#![deny(unsafe_code)]

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};
use validation_adapters::{ClearComplianceGateway, InMemoryEventBus};
use validation_core::{
    DefaultRuleSource, ExecutionPolicy, HookTimeouts, Money, OrchestratorConfig, Page,
    PageRequest, PaymentInitiated, PublisherConfig, RiskLevel, RuleRegistry, StoreConfig,
    TenantContext, TenantStatistics, ValidationError, ValidationOrchestrator, ValidationResult,
    ValidationResultStore, ValidationStatus,
};

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub store: StoreConfig,
    pub policy: ExecutionPolicy,
    pub hook_timeouts: HookTimeouts,
    pub publisher: PublisherConfig,
    pub orchestrator: OrchestratorConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            store: StoreConfig::Memory,
            policy: ExecutionPolicy::default(),
            hook_timeouts: HookTimeouts::default(),
            publisher: PublisherConfig::default(),
            orchestrator: OrchestratorConfig::default(),
        }
    }
}

#[derive(Clone)]
pub struct ServiceState {
    pub orchestrator: Arc<ValidationOrchestrator>,
    pub bus: Arc<InMemoryEventBus>,
}

impl ServiceState {
    pub async fn bootstrap(config: ServiceConfig) -> Result<Self, ServiceError> {
        let store = Arc::new(ValidationResultStore::bootstrap(config.store).await?);
        let registry = Arc::new(RuleRegistry::new(
            Arc::new(DefaultRuleSource),
            config.policy,
        ));
        let bus = Arc::new(InMemoryEventBus::new());
        let orchestrator = ValidationOrchestrator::new(
            registry,
            Arc::new(ClearComplianceGateway),
            config.hook_timeouts,
            store,
            bus.clone(),
            config.publisher,
            config.orchestrator,
        );

        Ok(Self {
            orchestrator: Arc::new(orchestrator),
            bus,
        })
    }
}

pub fn build_router(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/payments", post(ingest_payment))
        .route("/v1/validations", get(query_validations))
        .route("/v1/validations/:validation_id", get(get_validation))
        .route("/v1/tenants/:tenant_id/statistics", get(tenant_statistics))
        .route("/v1/retention/cleanup", post(retention_cleanup))
        .route("/v1/republish", post(republish))
        .route("/v1/events", get(list_events))
        .with_state(state)
}

/// Periodic drain of republish tombstones left by failed outcome
/// publications.
pub fn spawn_republish_sweeper(
    state: ServiceState,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match state.orchestrator.republish_pending(50).await {
                Ok(0) => {}
                Ok(count) => info!(count, "republished tombstoned outcomes"),
                Err(err) => warn!(error = %err, "republish sweep failed"),
            }
        }
    })
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("core engine error: {0}")]
    Core(#[from] ValidationError),
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{message}")]
    Http { status: StatusCode, message: String },
    #[error(transparent)]
    Core(#[from] ValidationError),
}

impl ApiError {
    fn not_found(message: impl Into<String>) -> Self {
        Self::Http {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::Http {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Http { status, message } => {
                (status, Json(serde_json::json!({ "error": message }))).into_response()
            }
            ApiError::Core(err) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": err.to_string() })),
            )
                .into_response(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
    store_backend: &'static str,
}

async fn health(State(state): State<ServiceState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        service: "validation-service",
        store_backend: state.orchestrator.store().backend_label(),
    })
}

#[derive(Debug, Clone, Deserialize)]
pub struct IngestPaymentRequest {
    pub payment_id: String,
    pub source_account: String,
    pub destination_account: String,
    pub amount_minor: u64,
    pub currency: String,
    pub reference: String,
    #[serde(default)]
    pub payment_type: Option<String>,
    pub tenant_id: String,
    pub business_unit_id: String,
    #[serde(default)]
    pub initiated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub correlation_id: Option<String>,
}

async fn ingest_payment(
    State(state): State<ServiceState>,
    Json(request): Json<IngestPaymentRequest>,
) -> Result<Json<ValidationResult>, ApiError> {
    if request.payment_id.trim().is_empty() {
        return Err(ApiError::bad_request("payment_id is required"));
    }

    let mut payment = PaymentInitiated::new(
        request.payment_id,
        request.source_account,
        request.destination_account,
        Money::new(request.amount_minor, request.currency),
        request.reference,
        TenantContext::new(request.tenant_id, request.business_unit_id),
    );
    if let Some(payment_type) = request.payment_type {
        payment = payment.with_payment_type(payment_type);
    }
    if let Some(initiated_at) = request.initiated_at {
        payment = payment.with_initiated_at(initiated_at);
    }

    let result = state
        .orchestrator
        .handle(payment, request.correlation_id)
        .await?;
    Ok(Json(result))
}

async fn get_validation(
    State(state): State<ServiceState>,
    Path(validation_id): Path<String>,
) -> Result<Json<ValidationResult>, ApiError> {
    state
        .orchestrator
        .store()
        .find_by_validation_id(&validation_id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("validation '{validation_id}' not found")))
}

#[derive(Debug, Clone, Deserialize)]
struct ValidationsQuery {
    payment_id: Option<String>,
    correlation_id: Option<String>,
    tenant_id: Option<String>,
    business_unit_id: Option<String>,
    status: Option<String>,
    risk_level: Option<String>,
    from: Option<DateTime<Utc>>,
    to: Option<DateTime<Utc>>,
    page: Option<u32>,
    size: Option<u32>,
}

fn list_page(items: Vec<ValidationResult>) -> Page<ValidationResult> {
    let total = items.len() as u64;
    let size = items.len().max(1) as u32;
    Page {
        items,
        page: 0,
        size,
        total,
    }
}

async fn query_validations(
    State(state): State<ServiceState>,
    Query(query): Query<ValidationsQuery>,
) -> Result<Json<Page<ValidationResult>>, ApiError> {
    let store = state.orchestrator.store();
    let page = PageRequest::new(query.page.unwrap_or(0), query.size.unwrap_or(50).min(500));

    if let Some(payment_id) = query.payment_id.as_deref() {
        return Ok(Json(list_page(store.find_by_payment_id(payment_id).await?)));
    }

    if let Some(correlation_id) = query.correlation_id.as_deref() {
        return Ok(Json(list_page(
            store.find_by_correlation_id(correlation_id).await?,
        )));
    }

    if let Some(tenant_id) = query.tenant_id.as_deref() {
        let result = match query.business_unit_id.as_deref() {
            Some(business_unit_id) => {
                store
                    .find_by_tenant_and_business_unit(tenant_id, business_unit_id, page)
                    .await?
            }
            None => store.find_by_tenant(tenant_id, page).await?,
        };
        return Ok(Json(result));
    }

    if let Some(status) = query.status.as_deref() {
        let status = ValidationStatus::parse(status).ok_or_else(|| {
            ApiError::bad_request(format!(
                "invalid status '{status}'; expected PASSED or FAILED"
            ))
        })?;
        return Ok(Json(store.find_by_status(status, page).await?));
    }

    if let Some(risk_level) = query.risk_level.as_deref() {
        let risk_level = RiskLevel::parse(risk_level).ok_or_else(|| {
            ApiError::bad_request(format!(
                "invalid risk_level '{risk_level}'; expected LOW, MEDIUM, HIGH or CRITICAL"
            ))
        })?;
        return Ok(Json(store.find_by_risk_level(risk_level, page).await?));
    }

    if let (Some(from), Some(to)) = (query.from, query.to) {
        return Ok(Json(
            store.find_by_validated_at_between(from, to, page).await?,
        ));
    }

    Err(ApiError::bad_request(
        "provide one of: payment_id, correlation_id, tenant_id, status, risk_level, from+to",
    ))
}

async fn tenant_statistics(
    State(state): State<ServiceState>,
    Path(tenant_id): Path<String>,
) -> Result<Json<TenantStatistics>, ApiError> {
    Ok(Json(
        state.orchestrator.store().statistics(&tenant_id).await?,
    ))
}

#[derive(Debug, Clone, Deserialize, Default)]
struct CleanupRequest {
    #[serde(default)]
    cutoff_days: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
struct CleanupResponse {
    deleted: u64,
}

async fn retention_cleanup(
    State(state): State<ServiceState>,
    Json(request): Json<CleanupRequest>,
) -> Result<Json<CleanupResponse>, ApiError> {
    let deleted = match request.cutoff_days {
        Some(days) if days < 0 => {
            return Err(ApiError::bad_request("cutoff_days must be non-negative"))
        }
        Some(days) => {
            let cutoff = Utc::now() - chrono::Duration::days(days);
            state.orchestrator.store().cleanup_before(cutoff).await?
        }
        None => state.orchestrator.cleanup_expired().await?,
    };
    Ok(Json(CleanupResponse { deleted }))
}

#[derive(Debug, Clone, Serialize)]
struct RepublishResponse {
    republished: u32,
}

async fn republish(
    State(state): State<ServiceState>,
) -> Result<Json<RepublishResponse>, ApiError> {
    let republished = state.orchestrator.republish_pending(50).await?;
    Ok(Json(RepublishResponse { republished }))
}

#[derive(Debug, Clone, Serialize)]
struct EventSummary {
    topic: String,
    key: String,
    event_type: String,
    published_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
struct EventsResponse {
    total: usize,
    items: Vec<EventSummary>,
}

async fn list_events(State(state): State<ServiceState>) -> Json<EventsResponse> {
    let events = state.bus.events();
    let items = events
        .iter()
        .map(|event| EventSummary {
            topic: event.topic.clone(),
            key: event.key.clone(),
            event_type: event
                .payload
                .get("event_type")
                .and_then(|value| value.as_str())
                .unwrap_or("unknown")
                .to_string(),
            published_at: event.published_at,
        })
        .collect();
    Json(EventsResponse {
        total: events.len(),
        items,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;
    use uuid::Uuid;

    async fn state() -> ServiceState {
        ServiceState::bootstrap(ServiceConfig::default())
            .await
            .unwrap()
    }

    fn ingest_body(payment_id: &str, amount_minor: u64, currency: &str) -> serde_json::Value {
        serde_json::json!({
            "payment_id": payment_id,
            "source_account": "acct-src",
            "destination_account": "acct-dst",
            "amount_minor": amount_minor,
            "currency": currency,
            "reference": "INV-1",
            "tenant_id": "tenant-a",
            "business_unit_id": "bu-1",
            "initiated_at": "2025-03-14T10:00:00Z",
            "correlation_id": "corr-1"
        })
    }

    async fn post_json(
        app: &Router,
        uri: &str,
        body: serde_json::Value,
    ) -> (StatusCode, serde_json::Value) {
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(uri)
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    async fn get_json(app: &Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = app
            .clone()
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    #[tokio::test]
    async fn health_reports_store_backend() {
        let app = build_router(state().await);
        let (status, body) = get_json(&app, "/v1/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["service"], "validation-service");
        assert_eq!(body["store_backend"], "memory");
    }

    #[tokio::test]
    async fn ingest_returns_the_sealed_result_and_emits_an_event() {
        let state = state().await;
        let app = build_router(state.clone());

        let (status, body) =
            post_json(&app, "/v1/payments", ingest_body("pay-ok", 100_000, "USD")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "PASSED");
        assert_eq!(body["risk_level"], "LOW");
        assert_eq!(body["fraud_score"], 0);
        assert_eq!(body["correlation_id"], "corr-1");

        assert_eq!(state.bus.len(), 1);
        let events = state.bus.events();
        assert_eq!(events[0].key, "pay-ok");
        assert_eq!(events[0].payload["event_type"], "PaymentValidated");
    }

    #[tokio::test]
    async fn failed_validation_is_queryable_by_payment_id() {
        let app = build_router(state().await);

        let (status, body) =
            post_json(&app, "/v1/payments", ingest_body("pay-hot", 6_000_000, "USD")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "FAILED");
        assert_eq!(body["risk_level"], "CRITICAL");

        let (status, listing) = get_json(&app, "/v1/validations?payment_id=pay-hot").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(listing["total"], 1);
        assert_eq!(
            listing["items"][0]["failed_rules"][0]["rule_id"],
            "FRAUD_RULE_001"
        );

        let validation_id = listing["items"][0]["validation_id"].as_str().unwrap();
        let (status, fetched) = get_json(&app, &format!("/v1/validations/{validation_id}")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(fetched["payment_id"], "pay-hot");
    }

    #[tokio::test]
    async fn query_requires_a_filter_and_validates_enums() {
        let app = build_router(state().await);

        let (status, _) = get_json(&app, "/v1/validations").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = get_json(&app, "/v1/validations?risk_level=EXTREME").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("EXTREME"));

        let (status, _) = get_json(&app, "/v1/validations?status=PASSED").await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn unknown_validation_id_is_not_found() {
        let app = build_router(state().await);
        let missing = Uuid::new_v4();
        let (status, _) = get_json(&app, &format!("/v1/validations/{missing}")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn statistics_aggregate_ingested_outcomes() {
        let app = build_router(state().await);
        post_json(&app, "/v1/payments", ingest_body("pay-1", 100_000, "USD")).await;
        post_json(&app, "/v1/payments", ingest_body("pay-2", 6_000_000, "USD")).await;

        let (status, stats) = get_json(&app, "/v1/tenants/tenant-a/statistics").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(stats["total"], 2);
        assert_eq!(stats["passed"], 1);
        assert_eq!(stats["failed"], 1);
        assert_eq!(stats["avg_fraud_score"], 12.5);
    }

    #[tokio::test]
    async fn retention_cleanup_endpoint_reports_deletions() {
        let app = build_router(state().await);
        post_json(&app, "/v1/payments", ingest_body("pay-1", 100_000, "USD")).await;

        // Everything is fresh; a zero-day cutoff only removes strictly older rows.
        let (status, body) =
            post_json(&app, "/v1/retention/cleanup", serde_json::json!({"cutoff_days": 30})).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["deleted"], 0);

        let (status, _) = post_json(
            &app,
            "/v1/retention/cleanup",
            serde_json::json!({"cutoff_days": -1}),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn events_endpoint_lists_published_outcomes() {
        let state = state().await;
        let app = build_router(state.clone());
        post_json(&app, "/v1/payments", ingest_body("pay-1", 100_000, "USD")).await;
        post_json(&app, "/v1/payments", ingest_body("pay-2", 6_000_000, "USD")).await;

        let (status, body) = get_json(&app, "/v1/events").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["total"], 2);
        assert_eq!(body["items"][0]["event_type"], "PaymentValidated");
        assert_eq!(body["items"][1]["event_type"], "ValidationFailed");
    }

    #[tokio::test]
    async fn republish_endpoint_drains_nothing_when_bus_is_healthy() {
        let app = build_router(state().await);
        post_json(&app, "/v1/payments", ingest_body("pay-1", 100_000, "USD")).await;

        let (status, body) = post_json(&app, "/v1/republish", serde_json::json!({})).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["republished"], 0);
    }
}
