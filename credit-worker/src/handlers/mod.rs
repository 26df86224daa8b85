//! The closed handler registry (spec §9 "Closed polymorphic job dispatch").
//!
//! A `JobType` only ever maps to one `JobHandler`, populated once at
//! startup and read-only thereafter (spec §5 "Shared-resource policy").

pub mod audit_log;
pub mod banking_info_fetch;
pub mod document_validation;
pub mod notification;
pub mod risk_evaluation;
pub mod webhook_call;

use std::collections::HashMap;

use async_trait::async_trait;
use credit_common::queue::{Job, JobType};

use crate::error::HandlerError;

#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &Job) -> Result<Option<serde_json::Value>, HandlerError>;
}

#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<JobType, Box<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, job_type: JobType, handler: Box<dyn JobHandler>) {
        self.handlers.insert(job_type, handler);
    }

    pub fn get(&self, job_type: JobType) -> Option<&(dyn JobHandler)> {
        self.handlers.get(&job_type).map(|h| h.as_ref())
    }
}
