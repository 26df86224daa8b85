//! Repository traits and their Postgres-backed implementations.
//!
//! Each infrastructure dependency is an abstract capability so that
//! handlers only depend on the narrow slice of the store they actually use
//! (spec §9 "Interface coupling"), the same way job persistence is isolated
//! behind `JobQueue` rather than handing workers a raw connection pool.

use async_trait::async_trait;
use sqlx::PgPool;
use thiserror::Error;
use uuid::Uuid;

use crate::model::{Application, BankingInfo, CountryConfig, DocumentType, Provider};

#[derive(Error, Debug)]
pub enum RepositoryError {
    #[error("{command} query failed with: {error}")]
    QueryError { command: String, error: sqlx::Error },
    #[error("application {0} not found")]
    ApplicationNotFound(Uuid),
    #[error("no country config for country {0}")]
    CountryConfigNotFound(Uuid),
}

pub type RepositoryResult<T> = std::result::Result<T, RepositoryError>;

fn query_err(command: &str) -> impl Fn(sqlx::Error) -> RepositoryError + '_ {
    move |error| RepositoryError::QueryError {
        command: command.to_owned(),
        error,
    }
}

#[async_trait]
pub trait ApplicationRepository: Send + Sync {
    async fn get(&self, id: Uuid) -> RepositoryResult<Application>;
}

#[async_trait]
pub trait BankingInfoRepository: Send + Sync {
    /// Upsert by `application_id` (spec §3 BankingInfo invariant: at most
    /// one row per application).
    async fn upsert(&self, info: &BankingInfo) -> RepositoryResult<()>;
    async fn get(&self, application_id: Uuid) -> RepositoryResult<Option<BankingInfo>>;
}

#[async_trait]
pub trait CountryConfigRepository: Send + Sync {
    async fn get(&self, country_id: Uuid) -> RepositoryResult<CountryConfig>;
}

#[async_trait]
pub trait DocumentTypeRepository: Send + Sync {
    async fn get(&self, country_id: Uuid, code: &str) -> RepositoryResult<Option<DocumentType>>;
}

#[async_trait]
pub trait ProviderRepository: Send + Sync {
    /// The active provider with the highest priority for a country, if any
    /// (spec §4.5 `banking_info_fetch`, step 1).
    async fn highest_priority_active(&self, country_id: Uuid) -> RepositoryResult<Option<Provider>>;
}

pub struct PgApplicationRepository {
    pool: PgPool,
}

impl PgApplicationRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ApplicationRepository for PgApplicationRepository {
    async fn get(&self, id: Uuid) -> RepositoryResult<Application> {
        sqlx::query_as::<_, Application>(r#"SELECT * FROM applications WHERE id = $1"#)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(query_err("SELECT"))?
            .ok_or(RepositoryError::ApplicationNotFound(id))
    }
}

pub struct PgBankingInfoRepository {
    pool: PgPool,
}

impl PgBankingInfoRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl BankingInfoRepository for PgBankingInfoRepository {
    async fn upsert(&self, info: &BankingInfo) -> RepositoryResult<()> {
        sqlx::query(
            r#"
INSERT INTO banking_info
    (application_id, credit_score, total_debt, available_credit, payment_history,
     bank_account_count, active_loan_count, months_employed, provider_id, retrieved_at, expires_at)
VALUES
    ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
ON CONFLICT (application_id) DO UPDATE SET
    credit_score = EXCLUDED.credit_score,
    total_debt = EXCLUDED.total_debt,
    available_credit = EXCLUDED.available_credit,
    payment_history = EXCLUDED.payment_history,
    bank_account_count = EXCLUDED.bank_account_count,
    active_loan_count = EXCLUDED.active_loan_count,
    months_employed = EXCLUDED.months_employed,
    provider_id = EXCLUDED.provider_id,
    retrieved_at = EXCLUDED.retrieved_at,
    expires_at = EXCLUDED.expires_at
            "#,
        )
        .bind(info.application_id)
        .bind(info.credit_score)
        .bind(info.total_debt)
        .bind(info.available_credit)
        .bind(info.payment_history)
        .bind(info.bank_account_count)
        .bind(info.active_loan_count)
        .bind(info.months_employed)
        .bind(&info.provider_id)
        .bind(info.retrieved_at)
        .bind(info.expires_at)
        .execute(&self.pool)
        .await
        .map_err(query_err("INSERT"))?;

        Ok(())
    }

    async fn get(&self, application_id: Uuid) -> RepositoryResult<Option<BankingInfo>> {
        sqlx::query_as::<_, BankingInfo>(
            r#"SELECT * FROM banking_info WHERE application_id = $1"#,
        )
        .bind(application_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(query_err("SELECT"))
    }
}

pub struct PgCountryConfigRepository {
    pool: PgPool,
}

impl PgCountryConfigRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CountryConfigRepository for PgCountryConfigRepository {
    async fn get(&self, country_id: Uuid) -> RepositoryResult<CountryConfig> {
        sqlx::query_as::<_, CountryConfig>(
            r#"SELECT * FROM country_configs WHERE country_id = $1"#,
        )
        .bind(country_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(query_err("SELECT"))?
        .ok_or(RepositoryError::CountryConfigNotFound(country_id))
    }
}

pub struct PgDocumentTypeRepository {
    pool: PgPool,
}

impl PgDocumentTypeRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DocumentTypeRepository for PgDocumentTypeRepository {
    async fn get(&self, country_id: Uuid, code: &str) -> RepositoryResult<Option<DocumentType>> {
        sqlx::query_as::<_, DocumentType>(
            r#"SELECT * FROM document_types WHERE country_id = $1 AND code = $2"#,
        )
        .bind(country_id)
        .bind(code)
        .fetch_optional(&self.pool)
        .await
        .map_err(query_err("SELECT"))
    }
}

pub struct PgProviderRepository {
    pool: PgPool,
}

impl PgProviderRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ProviderRepository for PgProviderRepository {
    async fn highest_priority_active(&self, country_id: Uuid) -> RepositoryResult<Option<Provider>> {
        sqlx::query_as::<_, Provider>(
            r#"
SELECT * FROM providers
WHERE country_id = $1 AND active
ORDER BY priority DESC
LIMIT 1
            "#,
        )
        .bind(country_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(query_err("SELECT"))
    }
}
