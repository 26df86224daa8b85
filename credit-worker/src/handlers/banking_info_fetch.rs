//! `banking_info_fetch`: pulls synthetic banking data for an applicant and
//! pushes the application into `validating` (spec §4.5).

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use credit_common::model::{BankingInfo, PaymentHistory, TriggeredBy};
use credit_common::queue::{Job, JobQueue, JobType, NewJob};
use credit_common::repository::{BankingInfoRepository, ProviderRepository};
use credit_common::state_machine::StateMachine;
use rand::{Rng, SeedableRng};
use rand::rngs::StdRng;
use serde::Deserialize;
use uuid::Uuid;

use crate::error::HandlerError;
use crate::handlers::JobHandler;

#[derive(Debug, Clone, Deserialize)]
pub struct BankingInfoFetchPayload {
    pub application_id: Uuid,
    pub country_id: Uuid,
    pub document_type: String,
    pub document_number: String,
}

/// The reference implementation's networked banking lookup, abstracted as a
/// collaborator so the handler itself stays free of I/O concerns (spec
/// §4.5, point 2).
#[async_trait]
pub trait BankingProvider: Send + Sync {
    async fn fetch(&self, provider_id: &str, document_number: &str) -> BankingSnapshot;
}

#[derive(Debug, Clone, Copy)]
pub struct BankingSnapshot {
    pub credit_score: i32,
    pub total_debt: f64,
    pub available_credit: f64,
    pub payment_history: PaymentHistory,
    pub bank_account_count: i32,
    pub active_loan_count: i32,
    pub months_employed: i32,
}

/// Deterministic pseudo-random generator seeded by the sum of the document
/// number's code units, producing stable synthetic data for the same
/// applicant across repeated calls (spec §4.5, point 2).
pub struct DeterministicBankingProvider;

#[async_trait]
impl BankingProvider for DeterministicBankingProvider {
    async fn fetch(&self, _provider_id: &str, document_number: &str) -> BankingSnapshot {
        let seed: u64 = document_number.chars().map(|c| c as u64).sum();
        let mut rng = StdRng::seed_from_u64(seed);

        let payment_history = match rng.gen_range(0..3) {
            0 => PaymentHistory::Good,
            1 => PaymentHistory::Regular,
            _ => PaymentHistory::Bad,
        };

        BankingSnapshot {
            credit_score: rng.gen_range(300..=850),
            total_debt: rng.gen_range(0..50_000) as f64,
            available_credit: rng.gen_range(0..20_000) as f64,
            payment_history,
            bank_account_count: rng.gen_range(1..=4),
            active_loan_count: rng.gen_range(0..=3),
            months_employed: rng.gen_range(0..120),
        }
    }
}

pub struct BankingInfoFetchHandler {
    providers: Arc<dyn ProviderRepository>,
    banking_info: Arc<dyn BankingInfoRepository>,
    state_machine: Arc<StateMachine>,
    queue: Arc<JobQueue>,
    banking_provider: Arc<dyn BankingProvider>,
}

impl BankingInfoFetchHandler {
    pub fn new(
        providers: Arc<dyn ProviderRepository>,
        banking_info: Arc<dyn BankingInfoRepository>,
        state_machine: Arc<StateMachine>,
        queue: Arc<JobQueue>,
        banking_provider: Arc<dyn BankingProvider>,
    ) -> Self {
        Self {
            providers,
            banking_info,
            state_machine,
            queue,
            banking_provider,
        }
    }
}

#[async_trait]
impl JobHandler for BankingInfoFetchHandler {
    async fn handle(&self, job: &Job) -> Result<Option<serde_json::Value>, HandlerError> {
        let payload: BankingInfoFetchPayload = job
            .parameters()
            .map_err(|_| HandlerError::InvalidPayload("banking_info_fetch".to_owned()))?;

        let provider = self
            .providers
            .highest_priority_active(payload.country_id)
            .await?
            .ok_or(HandlerError::NoActiveProvider)?;

        let snapshot = self
            .banking_provider
            .fetch(&provider.id, &payload.document_number)
            .await;

        let now = Utc::now();
        let info = BankingInfo {
            application_id: payload.application_id,
            credit_score: snapshot.credit_score,
            total_debt: snapshot.total_debt,
            available_credit: snapshot.available_credit,
            payment_history: snapshot.payment_history,
            bank_account_count: snapshot.bank_account_count,
            active_loan_count: snapshot.active_loan_count,
            months_employed: snapshot.months_employed,
            provider_id: provider.id,
            retrieved_at: now,
            expires_at: now + Duration::hours(24),
        };
        self.banking_info.upsert(&info).await?;

        self.state_machine
            .apply_transition(
                payload.application_id,
                credit_common::model::ApplicationStatus::Validating,
                "banking info retrieved",
                TriggeredBy::System,
                None,
            )
            .await?;

        let follow_on = NewJob::new(JobType::RiskEvaluation, job.priority, job.payload.clone());
        self.queue.enqueue(follow_on).await?;

        Ok(Some(serde_json::json!({"provider_id": info.provider_id})))
    }
}
