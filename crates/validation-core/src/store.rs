use crate::error::ValidationError;
use crate::types::{RiskLevel, ValidationResult, ValidationStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use std::collections::BTreeMap;
use tokio::sync::RwLock;

/// Result persistence backend configuration.
#[derive(Debug, Clone)]
pub enum StoreConfig {
    /// Keep all rows in process memory only.
    Memory,
    /// Persist rows in PostgreSQL.
    Postgres {
        database_url: String,
        max_connections: u32,
    },
}

impl StoreConfig {
    pub fn memory() -> Self {
        Self::Memory
    }

    pub fn postgres(database_url: impl Into<String>, max_connections: u32) -> Self {
        Self::Postgres {
            database_url: database_url.into(),
            max_connections,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Postgres { .. } => "postgres",
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::Memory
    }
}

/// Zero-based page request. Size is clamped to at least one row.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PageRequest {
    pub page: u32,
    pub size: u32,
}

impl PageRequest {
    pub fn new(page: u32, size: u32) -> Self {
        Self {
            page,
            size: size.max(1),
        }
    }

    pub fn first(size: u32) -> Self {
        Self::new(0, size)
    }

    pub fn offset(&self) -> u64 {
        self.page as u64 * self.size.max(1) as u64
    }
}

impl Default for PageRequest {
    fn default() -> Self {
        Self { page: 0, size: 50 }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub page: u32,
    pub size: u32,
    pub total: u64,
}

/// Aggregate figures for one tenant.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TenantStatistics {
    pub total: u64,
    pub passed: u64,
    pub failed: u64,
    pub avg_fraud_score: f64,
    pub avg_risk_score: f64,
}

/// Retryable marker for a persisted result whose outcome event never made it
/// onto the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishTombstone {
    pub validation_id: String,
    pub attempts: u32,
    pub last_error: String,
    pub failed_at: DateTime<Utc>,
}

#[derive(Default)]
struct MemoryState {
    rows: BTreeMap<String, ValidationResult>,
    tombstones: BTreeMap<String, PublishTombstone>,
}

enum StoreBackend {
    Memory(RwLock<MemoryState>),
    Postgres(PostgresResultStore),
}

/// Idempotent validation result store.
///
/// `validation_id` is the primary key in both backends; a second save of the
/// same id returns the already-stored row unchanged, which makes orchestrator
/// retries safe.
pub struct ValidationResultStore {
    backend: StoreBackend,
}

impl ValidationResultStore {
    pub async fn bootstrap(config: StoreConfig) -> Result<Self, ValidationError> {
        match config {
            StoreConfig::Memory => Ok(Self::in_memory()),
            StoreConfig::Postgres {
                database_url,
                max_connections,
            } => {
                let store = PostgresResultStore::connect(&database_url, max_connections).await?;
                store.ensure_schema().await?;
                Ok(Self {
                    backend: StoreBackend::Postgres(store),
                })
            }
        }
    }

    pub fn in_memory() -> Self {
        Self {
            backend: StoreBackend::Memory(RwLock::new(MemoryState::default())),
        }
    }

    pub fn backend_label(&self) -> &'static str {
        match self.backend {
            StoreBackend::Memory(_) => "memory",
            StoreBackend::Postgres(_) => "postgres",
        }
    }

    /// Idempotent save keyed on `validation_id`.
    pub async fn save(
        &self,
        result: &ValidationResult,
    ) -> Result<ValidationResult, ValidationError> {
        match &self.backend {
            StoreBackend::Memory(state) => {
                let mut state = state.write().await;
                let stored = state
                    .rows
                    .entry(result.validation_id.clone())
                    .or_insert_with(|| result.clone());
                Ok(stored.clone())
            }
            StoreBackend::Postgres(store) => store.save(result).await,
        }
    }

    pub async fn find_by_validation_id(
        &self,
        validation_id: &str,
    ) -> Result<Option<ValidationResult>, ValidationError> {
        match &self.backend {
            StoreBackend::Memory(state) => {
                Ok(state.read().await.rows.get(validation_id).cloned())
            }
            StoreBackend::Postgres(store) => store.find_by_validation_id(validation_id).await,
        }
    }

    pub async fn find_by_payment_id(
        &self,
        payment_id: &str,
    ) -> Result<Vec<ValidationResult>, ValidationError> {
        match &self.backend {
            StoreBackend::Memory(state) => Ok(collect_sorted(
                &state.read().await.rows,
                |row| row.payment_id == payment_id,
            )),
            StoreBackend::Postgres(store) => store.find_by_payment_id(payment_id).await,
        }
    }

    pub async fn find_by_correlation_id(
        &self,
        correlation_id: &str,
    ) -> Result<Vec<ValidationResult>, ValidationError> {
        match &self.backend {
            StoreBackend::Memory(state) => Ok(collect_sorted(
                &state.read().await.rows,
                |row| row.correlation_id == correlation_id,
            )),
            StoreBackend::Postgres(store) => store.find_by_correlation_id(correlation_id).await,
        }
    }

    pub async fn find_by_tenant(
        &self,
        tenant_id: &str,
        page: PageRequest,
    ) -> Result<Page<ValidationResult>, ValidationError> {
        match &self.backend {
            StoreBackend::Memory(state) => Ok(paginate(
                collect_sorted(&state.read().await.rows, |row| {
                    row.tenant.tenant_id == tenant_id
                }),
                page,
            )),
            StoreBackend::Postgres(store) => {
                store
                    .find_paged(
                        "tenant_id = $1",
                        vec![tenant_id.to_string()],
                        page,
                    )
                    .await
            }
        }
    }

    pub async fn find_by_tenant_and_business_unit(
        &self,
        tenant_id: &str,
        business_unit_id: &str,
        page: PageRequest,
    ) -> Result<Page<ValidationResult>, ValidationError> {
        match &self.backend {
            StoreBackend::Memory(state) => Ok(paginate(
                collect_sorted(&state.read().await.rows, |row| {
                    row.tenant.tenant_id == tenant_id
                        && row.tenant.business_unit_id == business_unit_id
                }),
                page,
            )),
            StoreBackend::Postgres(store) => {
                store
                    .find_paged(
                        "tenant_id = $1 AND business_unit_id = $2",
                        vec![tenant_id.to_string(), business_unit_id.to_string()],
                        page,
                    )
                    .await
            }
        }
    }

    pub async fn find_by_status(
        &self,
        status: ValidationStatus,
        page: PageRequest,
    ) -> Result<Page<ValidationResult>, ValidationError> {
        match &self.backend {
            StoreBackend::Memory(state) => Ok(paginate(
                collect_sorted(&state.read().await.rows, |row| row.status == status),
                page,
            )),
            StoreBackend::Postgres(store) => {
                store
                    .find_paged("status = $1", vec![status.name().to_string()], page)
                    .await
            }
        }
    }

    pub async fn find_by_risk_level(
        &self,
        risk_level: RiskLevel,
        page: PageRequest,
    ) -> Result<Page<ValidationResult>, ValidationError> {
        match &self.backend {
            StoreBackend::Memory(state) => Ok(paginate(
                collect_sorted(&state.read().await.rows, |row| {
                    row.risk_level == risk_level
                }),
                page,
            )),
            StoreBackend::Postgres(store) => {
                store
                    .find_paged(
                        "risk_level = $1",
                        vec![risk_level.name().to_string()],
                        page,
                    )
                    .await
            }
        }
    }

    /// Inclusive on both bounds.
    pub async fn find_by_validated_at_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        page: PageRequest,
    ) -> Result<Page<ValidationResult>, ValidationError> {
        match &self.backend {
            StoreBackend::Memory(state) => Ok(paginate(
                collect_sorted(&state.read().await.rows, |row| {
                    row.validated_at >= from && row.validated_at <= to
                }),
                page,
            )),
            StoreBackend::Postgres(store) => store.find_by_validated_at_between(from, to, page).await,
        }
    }

    pub async fn statistics(
        &self,
        tenant_id: &str,
    ) -> Result<TenantStatistics, ValidationError> {
        match &self.backend {
            StoreBackend::Memory(state) => {
                let state = state.read().await;
                let rows: Vec<&ValidationResult> = state
                    .rows
                    .values()
                    .filter(|row| row.tenant.tenant_id == tenant_id)
                    .collect();
                let total = rows.len() as u64;
                let passed = rows
                    .iter()
                    .filter(|row| row.status == ValidationStatus::Passed)
                    .count() as u64;
                let (avg_fraud_score, avg_risk_score) = if rows.is_empty() {
                    (0.0, 0.0)
                } else {
                    let fraud: u64 = rows.iter().map(|row| row.fraud_score as u64).sum();
                    let risk: u64 = rows.iter().map(|row| row.risk_score as u64).sum();
                    (
                        fraud as f64 / rows.len() as f64,
                        risk as f64 / rows.len() as f64,
                    )
                };
                Ok(TenantStatistics {
                    total,
                    passed,
                    failed: total - passed,
                    avg_fraud_score,
                    avg_risk_score,
                })
            }
            StoreBackend::Postgres(store) => store.statistics(tenant_id).await,
        }
    }

    /// Deletes rows with `validated_at` strictly before the cutoff.
    pub async fn cleanup_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, ValidationError> {
        match &self.backend {
            StoreBackend::Memory(state) => {
                let mut state = state.write().await;
                let before = state.rows.len();
                state.rows.retain(|_, row| row.validated_at >= cutoff);
                Ok((before - state.rows.len()) as u64)
            }
            StoreBackend::Postgres(store) => store.cleanup_before(cutoff).await,
        }
    }

    /// Record (or bump) the republish tombstone for a persisted result.
    pub async fn record_publish_failure(
        &self,
        validation_id: &str,
        error: &str,
    ) -> Result<(), ValidationError> {
        match &self.backend {
            StoreBackend::Memory(state) => {
                let mut state = state.write().await;
                let entry = state
                    .tombstones
                    .entry(validation_id.to_string())
                    .or_insert_with(|| PublishTombstone {
                        validation_id: validation_id.to_string(),
                        attempts: 0,
                        last_error: String::new(),
                        failed_at: Utc::now(),
                    });
                entry.attempts += 1;
                entry.last_error = error.to_string();
                entry.failed_at = Utc::now();
                Ok(())
            }
            StoreBackend::Postgres(store) => {
                store.record_publish_failure(validation_id, error).await
            }
        }
    }

    pub async fn list_publish_failures(
        &self,
        limit: usize,
    ) -> Result<Vec<PublishTombstone>, ValidationError> {
        match &self.backend {
            StoreBackend::Memory(state) => {
                let state = state.read().await;
                let mut tombstones: Vec<PublishTombstone> =
                    state.tombstones.values().cloned().collect();
                tombstones.sort_by(|a, b| a.failed_at.cmp(&b.failed_at));
                tombstones.truncate(limit);
                Ok(tombstones)
            }
            StoreBackend::Postgres(store) => store.list_publish_failures(limit).await,
        }
    }

    pub async fn clear_publish_failure(
        &self,
        validation_id: &str,
    ) -> Result<(), ValidationError> {
        match &self.backend {
            StoreBackend::Memory(state) => {
                state.write().await.tombstones.remove(validation_id);
                Ok(())
            }
            StoreBackend::Postgres(store) => store.clear_publish_failure(validation_id).await,
        }
    }
}

fn collect_sorted<F>(
    rows: &BTreeMap<String, ValidationResult>,
    filter: F,
) -> Vec<ValidationResult>
where
    F: Fn(&ValidationResult) -> bool,
{
    let mut matched: Vec<ValidationResult> = rows.values().filter(|row| filter(row)).cloned().collect();
    matched.sort_by(|a, b| {
        (b.validated_at, a.validation_id.as_str()).cmp(&(a.validated_at, b.validation_id.as_str()))
    });
    matched
}

fn paginate(rows: Vec<ValidationResult>, page: PageRequest) -> Page<ValidationResult> {
    let total = rows.len() as u64;
    let items = rows
        .into_iter()
        .skip(page.offset() as usize)
        .take(page.size.max(1) as usize)
        .collect();
    Page {
        items,
        page: page.page,
        size: page.size.max(1),
        total,
    }
}

struct PostgresResultStore {
    pool: PgPool,
}

impl PostgresResultStore {
    async fn connect(database_url: &str, max_connections: u32) -> Result<Self, ValidationError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(database_url)
            .await
            .map_err(|e| ValidationError::Store(format!("postgres connect failed: {e}")))?;
        Ok(Self { pool })
    }

    async fn ensure_schema(&self) -> Result<(), ValidationError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS validation_result (
                validation_id TEXT PRIMARY KEY,
                payment_id TEXT NOT NULL,
                tenant_id TEXT NOT NULL,
                business_unit_id TEXT NOT NULL,
                correlation_id TEXT NOT NULL,
                status TEXT NOT NULL,
                risk_level TEXT NOT NULL,
                fraud_score SMALLINT NOT NULL,
                risk_score SMALLINT NOT NULL,
                applied_rules JSONB NOT NULL,
                failed_rules JSONB NOT NULL,
                validated_at TIMESTAMPTZ NOT NULL,
                reason TEXT NULL,
                created_by TEXT NOT NULL,
                metadata JSONB NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| ValidationError::Store(format!("postgres schema create failed: {e}")))?;

        for statement in [
            "CREATE INDEX IF NOT EXISTS idx_validation_result_payment_id ON validation_result (payment_id)",
            "CREATE INDEX IF NOT EXISTS idx_validation_result_tenant_id ON validation_result (tenant_id)",
            "CREATE INDEX IF NOT EXISTS idx_validation_result_tenant_bu ON validation_result (tenant_id, business_unit_id)",
            "CREATE INDEX IF NOT EXISTS idx_validation_result_correlation_id ON validation_result (correlation_id)",
            "CREATE INDEX IF NOT EXISTS idx_validation_result_status ON validation_result (status)",
            "CREATE INDEX IF NOT EXISTS idx_validation_result_risk_level ON validation_result (risk_level)",
            "CREATE INDEX IF NOT EXISTS idx_validation_result_validated_at ON validation_result (validated_at)",
        ] {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| {
                    ValidationError::Store(format!("postgres index create failed: {e}"))
                })?;
        }

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS validation_publish_tombstone (
                validation_id TEXT PRIMARY KEY,
                attempts INTEGER NOT NULL,
                last_error TEXT NOT NULL,
                failed_at TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| ValidationError::Store(format!("postgres schema create failed: {e}")))?;

        Ok(())
    }

    async fn save(&self, result: &ValidationResult) -> Result<ValidationResult, ValidationError> {
        let applied_rules = serde_json::to_value(&result.applied_rules)
            .map_err(|e| ValidationError::Serialization(e.to_string()))?;
        let failed_rules = serde_json::to_value(&result.failed_rules)
            .map_err(|e| ValidationError::Serialization(e.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO validation_result (
                validation_id, payment_id, tenant_id, business_unit_id,
                correlation_id, status, risk_level, fraud_score, risk_score,
                applied_rules, failed_rules, validated_at, reason, created_by,
                metadata
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            ON CONFLICT (validation_id) DO NOTHING
            "#,
        )
        .bind(&result.validation_id)
        .bind(&result.payment_id)
        .bind(&result.tenant.tenant_id)
        .bind(&result.tenant.business_unit_id)
        .bind(&result.correlation_id)
        .bind(result.status.name())
        .bind(result.risk_level.name())
        .bind(result.fraud_score as i16)
        .bind(result.risk_score as i16)
        .bind(&applied_rules)
        .bind(&failed_rules)
        .bind(result.validated_at)
        .bind(&result.reason)
        .bind(&result.created_by)
        .bind(&result.metadata)
        .execute(&self.pool)
        .await
        .map_err(|e| ValidationError::Store(format!("postgres insert failed: {e}")))?;

        self.find_by_validation_id(&result.validation_id)
            .await?
            .ok_or_else(|| {
                ValidationError::Store(format!(
                    "row '{}' missing immediately after save",
                    result.validation_id
                ))
            })
    }

    async fn find_by_validation_id(
        &self,
        validation_id: &str,
    ) -> Result<Option<ValidationResult>, ValidationError> {
        let row = sqlx::query(&format!("{SELECT_COLUMNS} WHERE validation_id = $1"))
            .bind(validation_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| ValidationError::Store(format!("postgres select failed: {e}")))?;
        row.map(|row| decode_row(&row)).transpose()
    }

    async fn find_by_payment_id(
        &self,
        payment_id: &str,
    ) -> Result<Vec<ValidationResult>, ValidationError> {
        let rows = sqlx::query(&format!(
            "{SELECT_COLUMNS} WHERE payment_id = $1 ORDER BY validated_at DESC, validation_id ASC"
        ))
        .bind(payment_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| ValidationError::Store(format!("postgres select failed: {e}")))?;
        rows.iter().map(decode_row).collect()
    }

    async fn find_by_correlation_id(
        &self,
        correlation_id: &str,
    ) -> Result<Vec<ValidationResult>, ValidationError> {
        let rows = sqlx::query(&format!(
            "{SELECT_COLUMNS} WHERE correlation_id = $1 ORDER BY validated_at DESC, validation_id ASC"
        ))
        .bind(correlation_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| ValidationError::Store(format!("postgres select failed: {e}")))?;
        rows.iter().map(decode_row).collect()
    }

    async fn find_paged(
        &self,
        predicate: &str,
        binds: Vec<String>,
        page: PageRequest,
    ) -> Result<Page<ValidationResult>, ValidationError> {
        let count_sql =
            format!("SELECT COUNT(*) AS total FROM validation_result WHERE {predicate}");
        let mut count_query = sqlx::query(&count_sql);
        for bind in &binds {
            count_query = count_query.bind(bind);
        }
        let total: i64 = count_query
            .fetch_one(&self.pool)
            .await
            .map_err(|e| ValidationError::Store(format!("postgres count failed: {e}")))?
            .try_get("total")
            .map_err(|e| ValidationError::Store(format!("postgres decode total failed: {e}")))?;

        let limit_index = binds.len() + 1;
        let offset_index = binds.len() + 2;
        let select_sql = format!(
            "{SELECT_COLUMNS} WHERE {predicate} ORDER BY validated_at DESC, validation_id ASC LIMIT ${limit_index} OFFSET ${offset_index}"
        );
        let mut select_query = sqlx::query(&select_sql);
        for bind in &binds {
            select_query = select_query.bind(bind);
        }
        let rows = select_query
            .bind(page.size.max(1) as i64)
            .bind(page.offset() as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| ValidationError::Store(format!("postgres select failed: {e}")))?;

        Ok(Page {
            items: rows.iter().map(decode_row).collect::<Result<_, _>>()?,
            page: page.page,
            size: page.size.max(1),
            total: total.max(0) as u64,
        })
    }

    async fn find_by_validated_at_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        page: PageRequest,
    ) -> Result<Page<ValidationResult>, ValidationError> {
        let total: i64 = sqlx::query(
            "SELECT COUNT(*) AS total FROM validation_result WHERE validated_at >= $1 AND validated_at <= $2",
        )
        .bind(from)
        .bind(to)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| ValidationError::Store(format!("postgres count failed: {e}")))?
        .try_get("total")
        .map_err(|e| ValidationError::Store(format!("postgres decode total failed: {e}")))?;

        let rows = sqlx::query(&format!(
            "{SELECT_COLUMNS} WHERE validated_at >= $1 AND validated_at <= $2 ORDER BY validated_at DESC, validation_id ASC LIMIT $3 OFFSET $4"
        ))
        .bind(from)
        .bind(to)
        .bind(page.size.max(1) as i64)
        .bind(page.offset() as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| ValidationError::Store(format!("postgres select failed: {e}")))?;

        Ok(Page {
            items: rows.iter().map(decode_row).collect::<Result<_, _>>()?,
            page: page.page,
            size: page.size.max(1),
            total: total.max(0) as u64,
        })
    }

    async fn statistics(&self, tenant_id: &str) -> Result<TenantStatistics, ValidationError> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) AS total,
                COUNT(*) FILTER (WHERE status = 'PASSED') AS passed,
                COALESCE(AVG(fraud_score::float8), 0) AS avg_fraud_score,
                COALESCE(AVG(risk_score::float8), 0) AS avg_risk_score
            FROM validation_result
            WHERE tenant_id = $1
            "#,
        )
        .bind(tenant_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| ValidationError::Store(format!("postgres statistics failed: {e}")))?;

        let total: i64 = row
            .try_get("total")
            .map_err(|e| ValidationError::Store(format!("postgres decode total failed: {e}")))?;
        let passed: i64 = row
            .try_get("passed")
            .map_err(|e| ValidationError::Store(format!("postgres decode passed failed: {e}")))?;
        let avg_fraud_score: f64 = row.try_get("avg_fraud_score").map_err(|e| {
            ValidationError::Store(format!("postgres decode avg_fraud_score failed: {e}"))
        })?;
        let avg_risk_score: f64 = row.try_get("avg_risk_score").map_err(|e| {
            ValidationError::Store(format!("postgres decode avg_risk_score failed: {e}"))
        })?;

        Ok(TenantStatistics {
            total: total.max(0) as u64,
            passed: passed.max(0) as u64,
            failed: (total - passed).max(0) as u64,
            avg_fraud_score,
            avg_risk_score,
        })
    }

    async fn cleanup_before(&self, cutoff: DateTime<Utc>) -> Result<u64, ValidationError> {
        let outcome = sqlx::query("DELETE FROM validation_result WHERE validated_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .map_err(|e| ValidationError::Store(format!("postgres delete failed: {e}")))?;
        Ok(outcome.rows_affected())
    }

    async fn record_publish_failure(
        &self,
        validation_id: &str,
        error: &str,
    ) -> Result<(), ValidationError> {
        sqlx::query(
            r#"
            INSERT INTO validation_publish_tombstone (validation_id, attempts, last_error, failed_at)
            VALUES ($1, 1, $2, $3)
            ON CONFLICT (validation_id) DO UPDATE SET
                attempts = validation_publish_tombstone.attempts + 1,
                last_error = EXCLUDED.last_error,
                failed_at = EXCLUDED.failed_at
            "#,
        )
        .bind(validation_id)
        .bind(error)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(|e| ValidationError::Store(format!("postgres tombstone upsert failed: {e}")))?;
        Ok(())
    }

    async fn list_publish_failures(
        &self,
        limit: usize,
    ) -> Result<Vec<PublishTombstone>, ValidationError> {
        let rows = sqlx::query(
            r#"
            SELECT validation_id, attempts, last_error, failed_at
            FROM validation_publish_tombstone
            ORDER BY failed_at ASC
            LIMIT $1
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| ValidationError::Store(format!("postgres tombstone select failed: {e}")))?;

        let mut tombstones = Vec::with_capacity(rows.len());
        for row in rows {
            let attempts: i32 = row.try_get("attempts").map_err(|e| {
                ValidationError::Store(format!("postgres decode attempts failed: {e}"))
            })?;
            tombstones.push(PublishTombstone {
                validation_id: row.try_get("validation_id").map_err(|e| {
                    ValidationError::Store(format!("postgres decode validation_id failed: {e}"))
                })?,
                attempts: attempts.max(0) as u32,
                last_error: row.try_get("last_error").map_err(|e| {
                    ValidationError::Store(format!("postgres decode last_error failed: {e}"))
                })?,
                failed_at: row.try_get("failed_at").map_err(|e| {
                    ValidationError::Store(format!("postgres decode failed_at failed: {e}"))
                })?,
            });
        }
        Ok(tombstones)
    }

    async fn clear_publish_failure(&self, validation_id: &str) -> Result<(), ValidationError> {
        sqlx::query("DELETE FROM validation_publish_tombstone WHERE validation_id = $1")
            .bind(validation_id)
            .execute(&self.pool)
            .await
            .map_err(|e| ValidationError::Store(format!("postgres tombstone delete failed: {e}")))?;
        Ok(())
    }
}

const SELECT_COLUMNS: &str = r#"
    SELECT
        validation_id, payment_id, tenant_id, business_unit_id, correlation_id,
        status, risk_level, fraud_score, risk_score, applied_rules,
        failed_rules, validated_at, reason, created_by, metadata
    FROM validation_result
"#;

fn decode_row(row: &sqlx::postgres::PgRow) -> Result<ValidationResult, ValidationError> {
    let status_str: String = row
        .try_get("status")
        .map_err(|e| ValidationError::Store(format!("postgres decode status failed: {e}")))?;
    let status = ValidationStatus::parse(&status_str).ok_or_else(|| {
        ValidationError::Store(format!("unknown status '{status_str}' in storage"))
    })?;

    let risk_level_str: String = row
        .try_get("risk_level")
        .map_err(|e| ValidationError::Store(format!("postgres decode risk_level failed: {e}")))?;
    let risk_level = RiskLevel::parse(&risk_level_str).ok_or_else(|| {
        ValidationError::Store(format!("unknown risk level '{risk_level_str}' in storage"))
    })?;

    let fraud_score: i16 = row
        .try_get("fraud_score")
        .map_err(|e| ValidationError::Store(format!("postgres decode fraud_score failed: {e}")))?;
    let risk_score: i16 = row
        .try_get("risk_score")
        .map_err(|e| ValidationError::Store(format!("postgres decode risk_score failed: {e}")))?;

    let applied_rules: serde_json::Value = row.try_get("applied_rules").map_err(|e| {
        ValidationError::Store(format!("postgres decode applied_rules failed: {e}"))
    })?;
    let failed_rules: serde_json::Value = row.try_get("failed_rules").map_err(|e| {
        ValidationError::Store(format!("postgres decode failed_rules failed: {e}"))
    })?;

    Ok(ValidationResult {
        validation_id: row.try_get("validation_id").map_err(|e| {
            ValidationError::Store(format!("postgres decode validation_id failed: {e}"))
        })?,
        payment_id: row.try_get("payment_id").map_err(|e| {
            ValidationError::Store(format!("postgres decode payment_id failed: {e}"))
        })?,
        tenant: crate::types::TenantContext {
            tenant_id: row.try_get("tenant_id").map_err(|e| {
                ValidationError::Store(format!("postgres decode tenant_id failed: {e}"))
            })?,
            business_unit_id: row.try_get("business_unit_id").map_err(|e| {
                ValidationError::Store(format!("postgres decode business_unit_id failed: {e}"))
            })?,
        },
        correlation_id: row.try_get("correlation_id").map_err(|e| {
            ValidationError::Store(format!("postgres decode correlation_id failed: {e}"))
        })?,
        status,
        risk_level,
        fraud_score: fraud_score.clamp(0, 100) as u8,
        risk_score: risk_score.clamp(0, 100) as u8,
        applied_rules: serde_json::from_value(applied_rules)
            .map_err(|e| ValidationError::Serialization(e.to_string()))?,
        failed_rules: serde_json::from_value(failed_rules)
            .map_err(|e| ValidationError::Serialization(e.to_string()))?,
        validated_at: row.try_get("validated_at").map_err(|e| {
            ValidationError::Store(format!("postgres decode validated_at failed: {e}"))
        })?,
        reason: row
            .try_get("reason")
            .map_err(|e| ValidationError::Store(format!("postgres decode reason failed: {e}")))?,
        created_by: row.try_get("created_by").map_err(|e| {
            ValidationError::Store(format!("postgres decode created_by failed: {e}"))
        })?,
        metadata: row.try_get("metadata").map_err(|e| {
            ValidationError::Store(format!("postgres decode metadata failed: {e}"))
        })?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{RuleFamily, TenantContext};
    use chrono::Duration;
    use serde_json::json;

    fn result(validation_id: &str, validated_at: DateTime<Utc>) -> ValidationResult {
        ValidationResult {
            validation_id: validation_id.to_string(),
            payment_id: "pay-1".to_string(),
            tenant: TenantContext::new("tenant-a", "bu-1"),
            correlation_id: "corr-1".to_string(),
            status: ValidationStatus::Passed,
            risk_level: RiskLevel::Low,
            fraud_score: 0,
            risk_score: 0,
            applied_rules: vec!["BUSINESS_RULE_001".to_string()],
            failed_rules: Vec::new(),
            validated_at,
            reason: None,
            created_by: crate::types::SERVICE_NAME.to_string(),
            metadata: json!({}),
        }
    }

    #[tokio::test]
    async fn save_is_idempotent_on_validation_id() {
        let store = ValidationResultStore::in_memory();
        let original = result("val-1", Utc::now());

        let first = store.save(&original).await.unwrap();
        let mut mutated = original.clone();
        mutated.fraud_score = 99;
        let second = store.save(&mutated).await.unwrap();

        assert_eq!(first.fraud_score, 0);
        assert_eq!(second.fraud_score, 0);

        let fetched = store.find_by_validation_id("val-1").await.unwrap().unwrap();
        assert_eq!(fetched.fraud_score, 0);
        assert_eq!(
            store.find_by_payment_id("pay-1").await.unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn payment_history_is_ordered_newest_first() {
        let store = ValidationResultStore::in_memory();
        let now = Utc::now();
        store
            .save(&result("val-old", now - Duration::hours(2)))
            .await
            .unwrap();
        store
            .save(&result("val-new", now))
            .await
            .unwrap();

        let history = store.find_by_payment_id("pay-1").await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].validation_id, "val-new");
        assert_eq!(history[1].validation_id, "val-old");
    }

    #[tokio::test]
    async fn tenant_queries_are_paged() {
        let store = ValidationResultStore::in_memory();
        let now = Utc::now();
        for i in 0..5 {
            let mut row = result(&format!("val-{i}"), now - Duration::minutes(i));
            row.payment_id = format!("pay-{i}");
            store.save(&row).await.unwrap();
        }

        let page = store
            .find_by_tenant("tenant-a", PageRequest::new(1, 2))
            .await
            .unwrap();
        assert_eq!(page.total, 5);
        assert_eq!(page.items.len(), 2);
        assert_eq!(page.items[0].validation_id, "val-2");
        assert_eq!(page.items[1].validation_id, "val-3");

        let none = store
            .find_by_tenant("tenant-z", PageRequest::default())
            .await
            .unwrap();
        assert_eq!(none.total, 0);
        assert!(none.items.is_empty());
    }

    #[tokio::test]
    async fn status_and_risk_level_filters_match_exactly() {
        let store = ValidationResultStore::in_memory();
        let now = Utc::now();
        let mut failed_row = result("val-failed", now);
        failed_row.status = ValidationStatus::Failed;
        failed_row.risk_level = RiskLevel::Critical;
        failed_row.failed_rules = vec![crate::types::FailedRule::new(
            "FRAUD_RULE_001",
            "Velocity Check",
            RuleFamily::Fraud,
            "over threshold",
        )];
        store.save(&failed_row).await.unwrap();
        store.save(&result("val-passed", now)).await.unwrap();

        let failed = store
            .find_by_status(ValidationStatus::Failed, PageRequest::default())
            .await
            .unwrap();
        assert_eq!(failed.total, 1);
        assert_eq!(failed.items[0].validation_id, "val-failed");

        let critical = store
            .find_by_risk_level(RiskLevel::Critical, PageRequest::default())
            .await
            .unwrap();
        assert_eq!(critical.total, 1);

        let low = store
            .find_by_risk_level(RiskLevel::Low, PageRequest::default())
            .await
            .unwrap();
        assert_eq!(low.total, 1);
        assert_eq!(low.items[0].validation_id, "val-passed");
    }

    #[tokio::test]
    async fn date_range_is_inclusive_on_both_bounds() {
        let store = ValidationResultStore::in_memory();
        let base = Utc::now();
        store.save(&result("val-a", base)).await.unwrap();
        store
            .save(&result("val-b", base + Duration::hours(1)))
            .await
            .unwrap();
        store
            .save(&result("val-c", base + Duration::hours(2)))
            .await
            .unwrap();

        let page = store
            .find_by_validated_at_between(base, base + Duration::hours(1), PageRequest::default())
            .await
            .unwrap();
        assert_eq!(page.total, 2);
        let ids: Vec<_> = page
            .items
            .iter()
            .map(|row| row.validation_id.as_str())
            .collect();
        assert_eq!(ids, vec!["val-b", "val-a"]);
    }

    #[tokio::test]
    async fn statistics_average_over_tenant_rows() {
        let store = ValidationResultStore::in_memory();
        let now = Utc::now();
        let mut first = result("val-1", now);
        first.fraud_score = 20;
        first.risk_score = 40;
        let mut second = result("val-2", now);
        second.status = ValidationStatus::Failed;
        second.fraud_score = 60;
        second.risk_score = 80;
        second.failed_rules = vec![crate::types::FailedRule::new(
            "RISK_RULE_001",
            "Credit Exposure",
            RuleFamily::Risk,
            "over limit",
        )];
        store.save(&first).await.unwrap();
        store.save(&second).await.unwrap();

        let stats = store.statistics("tenant-a").await.unwrap();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.passed, 1);
        assert_eq!(stats.failed, 1);
        assert!((stats.avg_fraud_score - 40.0).abs() < f64::EPSILON);
        assert!((stats.avg_risk_score - 60.0).abs() < f64::EPSILON);

        let empty = store.statistics("tenant-z").await.unwrap();
        assert_eq!(empty.total, 0);
        assert_eq!(empty.avg_fraud_score, 0.0);
    }

    #[tokio::test]
    async fn retention_cleanup_deletes_strictly_older_rows() {
        let store = ValidationResultStore::in_memory();
        let cutoff = Utc::now();
        store
            .save(&result("val-old-1", cutoff - Duration::days(2)))
            .await
            .unwrap();
        store
            .save(&result("val-old-2", cutoff - Duration::days(1)))
            .await
            .unwrap();
        store.save(&result("val-at-cutoff", cutoff)).await.unwrap();
        store
            .save(&result("val-fresh", cutoff + Duration::hours(1)))
            .await
            .unwrap();

        let deleted = store.cleanup_before(cutoff).await.unwrap();
        assert_eq!(deleted, 2);
        assert!(store
            .find_by_validation_id("val-at-cutoff")
            .await
            .unwrap()
            .is_some());
        assert!(store
            .find_by_validation_id("val-old-1")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn publish_tombstones_round_trip() {
        let store = ValidationResultStore::in_memory();
        store
            .record_publish_failure("val-1", "broker unreachable")
            .await
            .unwrap();
        store
            .record_publish_failure("val-1", "still unreachable")
            .await
            .unwrap();

        let tombstones = store.list_publish_failures(10).await.unwrap();
        assert_eq!(tombstones.len(), 1);
        assert_eq!(tombstones[0].attempts, 2);
        assert_eq!(tombstones[0].last_error, "still unreachable");

        store.clear_publish_failure("val-1").await.unwrap();
        assert!(store.list_publish_failures(10).await.unwrap().is_empty());
    }
}
