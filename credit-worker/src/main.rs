//! Dispatch `credit-worker` jobs against a Postgres-backed queue, driving
//! credit applications through the pipeline handlers (spec §4).

mod collaborators;
mod config;
mod error;
mod handlers;
mod worker;

use std::future::ready;
use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use envconfig::Envconfig;
use sqlx::postgres::PgPoolOptions;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::info;

use credit_common::event_hub::EventHub;
use credit_common::health::HealthRegistry;
use credit_common::metrics::{serve, setup_metrics_router};
use credit_common::queue::{JobQueue, JobType};
use credit_common::repository::{
    PgApplicationRepository, PgBankingInfoRepository, PgCountryConfigRepository,
    PgDocumentTypeRepository, PgProviderRepository,
};
use credit_common::state_machine::StateMachine;

use crate::collaborators::{LoggingAuditWriter, LoggingNotificationDriver, LoggingWebhookDelivery};
use crate::config::Config;
use crate::error::WorkerError;
use crate::handlers::audit_log::AuditLogHandler;
use crate::handlers::banking_info_fetch::{BankingInfoFetchHandler, DeterministicBankingProvider};
use crate::handlers::document_validation::DocumentValidationHandler;
use crate::handlers::notification::NotificationHandler;
use crate::handlers::risk_evaluation::RiskEvaluationHandler;
use crate::handlers::webhook_call::WebhookCallHandler;
use crate::handlers::HandlerRegistry;
use crate::worker::WorkerPool;

#[tokio::main]
async fn main() -> Result<(), WorkerError> {
    tracing_subscriber::fmt::init();

    let config = Config::init_from_env().expect("Invalid configuration:");

    let pool = PgPoolOptions::new()
        .max_connections(config.max_pg_connections)
        .connect(&config.database_url)
        .await
        .expect("failed to connect to Postgres");

    let queue = Arc::new(JobQueue::new_from_pool(pool.clone()));
    let state_machine = Arc::new(StateMachine::new(pool.clone()));
    let event_hub = Arc::new(EventHub::new());

    let applications = Arc::new(PgApplicationRepository::new(pool.clone()));
    let banking_info = Arc::new(PgBankingInfoRepository::new(pool.clone()));
    let country_configs = Arc::new(PgCountryConfigRepository::new(pool.clone()));
    let document_types = Arc::new(PgDocumentTypeRepository::new(pool.clone()));
    let providers = Arc::new(PgProviderRepository::new(pool.clone()));

    let mut registry = HandlerRegistry::new();
    registry.register(
        JobType::RiskEvaluation,
        Box::new(RiskEvaluationHandler::new(
            applications,
            country_configs,
            banking_info.clone(),
            state_machine.clone(),
            event_hub.clone(),
        )),
    );
    registry.register(
        JobType::BankingInfoFetch,
        Box::new(BankingInfoFetchHandler::new(
            providers,
            banking_info,
            state_machine,
            queue.clone(),
            Arc::new(DeterministicBankingProvider),
        )),
    );
    registry.register(
        JobType::DocumentValidation,
        Box::new(DocumentValidationHandler::new(document_types)),
    );
    registry.register(
        JobType::Notification,
        Box::new(NotificationHandler::new(Arc::new(LoggingNotificationDriver))),
    );
    registry.register(
        JobType::WebhookCall,
        Box::new(WebhookCallHandler::new(Arc::new(LoggingWebhookDelivery))),
    );
    registry.register(
        JobType::AuditLog,
        Box::new(AuditLogHandler::new(Arc::new(LoggingAuditWriter))),
    );
    let registry = Arc::new(registry);

    let health = HealthRegistry::new("liveness");
    let pool_handle = WorkerPool::new(queue.clone(), registry, health.clone());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker_handles = pool_handle
        .start_workers(
            config.worker_count,
            config.poll_interval.0,
            config.job_timeout.0,
            config.stale_minutes,
            config.orphan_check_interval.0,
            shutdown_rx,
        )
        .await;

    let router = Router::new()
        .route("/", get(index))
        .route("/_readiness", get(index))
        .route("/_liveness", get(move || ready(health.get_status())))
        .merge(setup_metrics_router());
    let bind = config.bind();
    let server = tokio::spawn(async move {
        serve(router, &bind)
            .await
            .expect("failed to start serving health/metrics endpoints");
    });

    wait_for_shutdown_signal().await;
    info!("shutdown signal received, cancelling workers");
    let _ = shutdown_tx.send(true);

    for handle in worker_handles {
        let _unused = handle.await;
    }
    server.abort();

    Ok(())
}

/// Waits for SIGINT or SIGTERM, cancelling the root context cooperatively
/// (spec §6 "Process signals").
async fn wait_for_shutdown_signal() {
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");

    tokio::select! {
        _ = sigterm.recv() => {}
        _ = sigint.recv() => {}
    }
}

pub async fn index() -> &'static str {
    "credit-worker"
}
