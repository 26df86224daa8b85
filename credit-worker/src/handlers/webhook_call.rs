//! `webhook_call`: delegates to an outbound webhook delivery collaborator;
//! does not mutate the application (spec §4.5).

use std::sync::Arc;

use async_trait::async_trait;
use credit_common::queue::Job;

use crate::collaborators::WebhookDelivery;
use crate::error::HandlerError;
use crate::handlers::JobHandler;

pub struct WebhookCallHandler {
    delivery: Arc<dyn WebhookDelivery>,
}

impl WebhookCallHandler {
    pub fn new(delivery: Arc<dyn WebhookDelivery>) -> Self {
        Self { delivery }
    }
}

#[async_trait]
impl JobHandler for WebhookCallHandler {
    async fn handle(&self, job: &Job) -> Result<Option<serde_json::Value>, HandlerError> {
        self.delivery
            .deliver(&job.payload)
            .await
            .map_err(|e| HandlerError::InvalidPayload(e.to_string()))?;
        Ok(None)
    }
}
