use credit_common::{queue, repository, state_machine};
use thiserror::Error;

/// Errors raised while a handler processes a single job. Always terminates
/// in a queue `Fail` call, never propagates out of the worker loop (spec §7).
#[derive(Error, Debug)]
pub enum HandlerError {
    #[error("payload is empty or malformed: {0}")]
    InvalidPayload(String),
    #[error("no active banking provider for country")]
    NoActiveProvider,
    #[error("illegal transition: {0}")]
    IllegalTransition(#[from] state_machine::TransitionError),
    #[error("store error: {0}")]
    Store(#[from] repository::RepositoryError),
    #[error("queue error: {0}")]
    Queue(#[from] queue::QueueError),
    #[error("no handler registered for job type {0}")]
    NoHandler(String),
}

/// Errors that can abort the worker loop itself (as opposed to a single job).
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("queue error: {0}")]
    Queue(#[from] queue::QueueError),
}
