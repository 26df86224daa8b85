use std::sync::Arc;
use std::time::Duration;

use credit_common::health::HealthRegistry;
use credit_common::queue::JobQueue;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::handlers::HandlerRegistry;

/// A pool of independent cooperative worker loops plus a background
/// orphan-recovery ticker (spec §4.4).
pub struct WorkerPool {
    queue: Arc<JobQueue>,
    registry: Arc<HandlerRegistry>,
    health: HealthRegistry,
}

impl WorkerPool {
    pub fn new(queue: Arc<JobQueue>, registry: Arc<HandlerRegistry>, health: HealthRegistry) -> Self {
        Self {
            queue,
            registry,
            health,
        }
    }

    /// Spawn `worker_count` workers plus the orphan-recovery ticker. Each
    /// task watches `shutdown` for cooperative cancellation of the root
    /// context (spec §4.4, §5).
    pub async fn start_workers(
        &self,
        worker_count: usize,
        poll_interval: Duration,
        job_timeout: Duration,
        stale_minutes: i64,
        orphan_check_interval: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::with_capacity(worker_count + 1);

        for n in 0..worker_count {
            let name = format!("worker-{n}");
            let liveness = self.health.register_worker(n, poll_interval).await;
            let queue = self.queue.clone();
            let registry = self.registry.clone();
            let mut shutdown = shutdown.clone();

            handles.push(tokio::spawn(async move {
                run_worker(name, queue, registry, poll_interval, job_timeout, liveness, &mut shutdown).await;
            }));
        }

        let liveness = self.health.register_orphan_recovery(orphan_check_interval).await;
        let queue = self.queue.clone();
        let mut orphan_shutdown = shutdown.clone();
        handles.push(tokio::spawn(async move {
            run_orphan_recovery(queue, stale_minutes, orphan_check_interval, liveness, &mut orphan_shutdown).await;
        }));

        handles
    }
}

/// A single worker's loop (spec §4.4): wait for a tick, dequeue, dispatch,
/// settle. Cooperative cancellation is observed only between jobs.
async fn run_worker(
    name: String,
    queue: Arc<JobQueue>,
    registry: Arc<HandlerRegistry>,
    poll_interval: Duration,
    job_timeout: Duration,
    liveness: credit_common::health::HealthHandle,
    shutdown: &mut watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(poll_interval);

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = shutdown.changed() => {
                info!(worker = %name, "worker exiting on shutdown signal");
                return;
            }
        }

        liveness.report_healthy().await;

        match queue.dequeue(&name).await {
            Ok(Some(job)) => process_job(queue.clone(), registry.clone(), job, job_timeout).await,
            Ok(None) => continue,
            Err(error) => {
                error!(worker = %name, %error, "dequeue failed");
            }
        }
    }
}

/// Dispatch one job to its handler, enforcing the timeout and converting
/// any error (including a handler panic) into a `Fail` (spec §4.4 steps
/// 3-6, §7).
async fn process_job(
    queue: Arc<JobQueue>,
    registry: Arc<HandlerRegistry>,
    job: credit_common::queue::Job,
    job_timeout: Duration,
) {
    let job_id = job.id;
    let job_type = job.r#type;
    let job_type_label = job_type.to_string();
    credit_common::metrics::record_job_dispatched(&job_type_label);

    if registry.get(job_type).is_none() {
        if let Err(error) = queue.fail(job_id, &format!("no handler for job type {job_type}")).await {
            error!(%job_id, %error, "failed to settle job with no handler");
        }
        return;
    }

    let task_registry = registry.clone();
    let handle = tokio::spawn(async move {
        let handler = task_registry
            .get(job_type)
            .expect("handler presence checked before spawning");
        handler.handle(&job).await
    });

    let settlement = match tokio::time::timeout(job_timeout, handle).await {
        Ok(Ok(Ok(result))) => {
            credit_common::metrics::record_job_completed(&job_type_label);
            queue.complete(job_id, result).await
        }
        Ok(Ok(Err(handler_error))) => {
            credit_common::metrics::record_job_failed(&job_type_label);
            queue.fail(job_id, &handler_error.to_string()).await
        }
        Ok(Err(join_error)) => {
            warn!(%job_id, %join_error, "handler panicked");
            credit_common::metrics::record_job_failed(&job_type_label);
            queue.fail(job_id, &format!("panic: {join_error}")).await
        }
        Err(_elapsed) => {
            credit_common::metrics::record_job_failed(&job_type_label);
            queue.fail(job_id, "context deadline exceeded").await
        }
    };

    if let Err(error) = settlement {
        error!(%job_id, %error, "failed to settle job");
    }
}

/// Recovers orphaned jobs at startup and on a fixed interval (spec §4.2
/// RecoverOrphans, §4.4).
async fn run_orphan_recovery(
    queue: Arc<JobQueue>,
    stale_minutes: i64,
    check_interval: Duration,
    liveness: credit_common::health::HealthHandle,
    shutdown: &mut watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(check_interval);

    loop {
        liveness.report_healthy().await;

        match queue.recover_orphans(stale_minutes).await {
            Ok(count) if count > 0 => info!(recovered = count, "recovered orphaned jobs"),
            Ok(_) => {}
            Err(error) => error!(%error, "orphan recovery query failed"),
        }

        tokio::select! {
            _ = interval.tick() => {}
            _ = shutdown.changed() => {
                info!("orphan recovery loop exiting on shutdown signal");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use credit_common::queue::{Job, JobStatus, JobType};
    use uuid::Uuid;

    struct AlwaysOkHandler;

    #[async_trait]
    impl crate::handlers::JobHandler for AlwaysOkHandler {
        async fn handle(&self, _job: &Job) -> Result<Option<serde_json::Value>, crate::error::HandlerError> {
            Ok(Some(serde_json::json!({"ok": true})))
        }
    }

    struct PanickingHandler;

    #[async_trait]
    impl crate::handlers::JobHandler for PanickingHandler {
        async fn handle(&self, _job: &Job) -> Result<Option<serde_json::Value>, crate::error::HandlerError> {
            panic!("handler blew up");
        }
    }

    fn sample_job(job_type: JobType) -> Job {
        let now = chrono::Utc::now();
        Job {
            id: Uuid::new_v4(),
            r#type: job_type,
            status: JobStatus::Processing,
            priority: 0,
            payload: serde_json::json!({}),
            result: None,
            error_message: None,
            attempts: 1,
            max_attempts: 3,
            worker_id: Some("worker-0".to_owned()),
            scheduled_at: now,
            started_at: Some(now),
            completed_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn handler_registry_returns_none_for_unregistered_type() {
        let registry = HandlerRegistry::new();
        assert!(registry.get(JobType::AuditLog).is_none());
    }

    #[tokio::test]
    async fn registered_handler_is_found_by_type() {
        let mut registry = HandlerRegistry::new();
        registry.register(JobType::AuditLog, Box::new(AlwaysOkHandler));
        assert!(registry.get(JobType::AuditLog).is_some());
    }

    #[tokio::test]
    async fn a_panicking_handler_surfaces_as_a_join_error_not_a_crash() {
        let mut registry = HandlerRegistry::new();
        registry.register(JobType::AuditLog, Box::new(PanickingHandler));
        let registry = Arc::new(registry);
        let job = sample_job(JobType::AuditLog);
        let job_type = job.r#type;

        let task_registry = registry.clone();
        let handle = tokio::spawn(async move {
            let handler = task_registry.get(job_type).unwrap();
            handler.handle(&job).await
        });

        let outcome = handle.await;
        assert!(outcome.is_err(), "a handler panic must surface as a JoinError");
        assert!(outcome.unwrap_err().is_panic());
    }
}
