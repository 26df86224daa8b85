//! `audit_log`: delegates to an audit writer; does not mutate the
//! application (spec §4.5).

use std::sync::Arc;

use async_trait::async_trait;
use credit_common::queue::Job;

use crate::collaborators::AuditWriter;
use crate::error::HandlerError;
use crate::handlers::JobHandler;

pub struct AuditLogHandler {
    writer: Arc<dyn AuditWriter>,
}

impl AuditLogHandler {
    pub fn new(writer: Arc<dyn AuditWriter>) -> Self {
        Self { writer }
    }
}

#[async_trait]
impl JobHandler for AuditLogHandler {
    async fn handle(&self, job: &Job) -> Result<Option<serde_json::Value>, HandlerError> {
        self.writer
            .write(&job.payload)
            .await
            .map_err(|e| HandlerError::InvalidPayload(e.to_string()))?;
        Ok(None)
    }
}
