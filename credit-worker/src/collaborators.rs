//! External collaborators the notification/webhook/audit handlers delegate
//! to. Their concrete integrations are out of scope (spec §1); the logging
//! stubs here are sufficient to exercise each handler's contract.

use async_trait::async_trait;
use serde_json::Value;
use tracing::info;

#[derive(Debug, thiserror::Error)]
#[error("collaborator call failed: {0}")]
pub struct CollaboratorError(pub String);

#[async_trait]
pub trait NotificationDriver: Send + Sync {
    async fn send(&self, payload: &Value) -> Result<(), CollaboratorError>;
}

#[async_trait]
pub trait WebhookDelivery: Send + Sync {
    async fn deliver(&self, payload: &Value) -> Result<(), CollaboratorError>;
}

#[async_trait]
pub trait AuditWriter: Send + Sync {
    async fn write(&self, payload: &Value) -> Result<(), CollaboratorError>;
}

/// Logs and succeeds. Stands in for a real notification channel (email,
/// SMS, push) until one is wired up.
pub struct LoggingNotificationDriver;

#[async_trait]
impl NotificationDriver for LoggingNotificationDriver {
    async fn send(&self, payload: &Value) -> Result<(), CollaboratorError> {
        info!(?payload, "notification");
        Ok(())
    }
}

pub struct LoggingWebhookDelivery;

#[async_trait]
impl WebhookDelivery for LoggingWebhookDelivery {
    async fn deliver(&self, payload: &Value) -> Result<(), CollaboratorError> {
        info!(?payload, "webhook_call");
        Ok(())
    }
}

pub struct LoggingAuditWriter;

#[async_trait]
impl AuditWriter for LoggingAuditWriter {
    async fn write(&self, payload: &Value) -> Result<(), CollaboratorError> {
        info!(?payload, "audit_log");
        Ok(())
    }
}
