//! `notification`: delegates to a notification driver; does not mutate the
//! application (spec §4.5).

use std::sync::Arc;

use async_trait::async_trait;
use credit_common::queue::Job;

use crate::collaborators::NotificationDriver;
use crate::error::HandlerError;
use crate::handlers::JobHandler;

pub struct NotificationHandler {
    driver: Arc<dyn NotificationDriver>,
}

impl NotificationHandler {
    pub fn new(driver: Arc<dyn NotificationDriver>) -> Self {
        Self { driver }
    }
}

#[async_trait]
impl JobHandler for NotificationHandler {
    async fn handle(&self, job: &Job) -> Result<Option<serde_json::Value>, HandlerError> {
        self.driver
            .send(&job.payload)
            .await
            .map_err(|e| HandlerError::InvalidPayload(e.to_string()))?;
        Ok(None)
    }
}
