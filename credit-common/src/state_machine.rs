//! # StateMachine
//!
//! The single chokepoint through which every application status change
//! passes (spec §4.3). Loads the current application, checks legality
//! against the fixed transition graph, then atomically updates the status
//! and appends a `StateTransition` row.

use sqlx::PgPool;
use thiserror::Error;
use uuid::Uuid;

use crate::model::{ApplicationStatus, TriggeredBy};

#[derive(Error, Debug)]
pub enum TransitionError {
    #[error("illegal transition from {from} to {to}")]
    IllegalTransition {
        from: ApplicationStatus,
        to: ApplicationStatus,
    },
    #[error("application {0} not found")]
    ApplicationNotFound(Uuid),
    #[error("{command} query failed with: {error}")]
    QueryError { command: String, error: sqlx::Error },
}

/// The fixed transition graph of spec §4.3.
fn legal_targets(from: ApplicationStatus) -> &'static [ApplicationStatus] {
    use ApplicationStatus::*;
    match from {
        Pending => &[Validating, Cancelled],
        Validating => &[PendingBankInfo, UnderReview, Approved, Rejected],
        PendingBankInfo => &[Validating, UnderReview, Rejected, Cancelled],
        UnderReview => &[Approved, Rejected, Cancelled],
        Approved => &[Disbursed, Cancelled, Expired],
        Rejected | Cancelled | Expired | Disbursed => &[],
    }
}

/// Whether `processed_at` is set when entering this status. The source sets
/// it for approved/rejected/disbursed only; this implementation sets it for
/// every terminal status (see `DESIGN.md` open question decisions).
fn sets_processed_at(status: ApplicationStatus) -> bool {
    status.is_terminal()
}

pub fn can_transition(from: ApplicationStatus, to: ApplicationStatus) -> bool {
    legal_targets(from).contains(&to)
}

/// Gate for every application status change in the system.
pub struct StateMachine {
    pool: PgPool,
}

impl StateMachine {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Apply a transition, appending a `StateTransition` row in the same
    /// database transaction as the status update.
    pub async fn apply_transition(
        &self,
        application_id: Uuid,
        to: ApplicationStatus,
        reason: &str,
        triggered_by: TriggeredBy,
        triggered_by_id: Option<Uuid>,
    ) -> Result<(), TransitionError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|error| TransitionError::QueryError {
                command: "BEGIN".to_owned(),
                error,
            })?;

        let current: Option<(String,)> =
            sqlx::query_as(r#"SELECT status::text FROM applications WHERE id = $1 FOR UPDATE"#)
                .bind(application_id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(|error| TransitionError::QueryError {
                    command: "SELECT".to_owned(),
                    error,
                })?;

        let Some((from_str,)) = current else {
            return Err(TransitionError::ApplicationNotFound(application_id));
        };

        let from: ApplicationStatus = from_str
            .parse()
            .expect("status column always holds a valid ApplicationStatus");

        if !can_transition(from, to) {
            return Err(TransitionError::IllegalTransition { from, to });
        }

        let set_processed_at = sets_processed_at(to);

        sqlx::query(
            r#"
UPDATE applications
SET
    status = $2,
    status_reason = $3,
    updated_at = NOW(),
    processed_at = CASE WHEN $4 THEN NOW() ELSE processed_at END
WHERE id = $1
            "#,
        )
        .bind(application_id)
        .bind(to)
        .bind(reason)
        .bind(set_processed_at)
        .execute(&mut *tx)
        .await
        .map_err(|error| TransitionError::QueryError {
            command: "UPDATE".to_owned(),
            error,
        })?;

        sqlx::query(
            r#"
INSERT INTO state_transitions
    (id, application_id, from_status, to_status, reason, triggered_by, triggered_by_id, created_at)
VALUES
    ($1, $2, $3, $4, $5, $6, $7, NOW())
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(application_id)
        .bind(from)
        .bind(to)
        .bind(reason)
        .bind(triggered_by)
        .bind(triggered_by_id)
        .execute(&mut *tx)
        .await
        .map_err(|error| TransitionError::QueryError {
            command: "INSERT".to_owned(),
            error,
        })?;

        tx.commit().await.map_err(|error| TransitionError::QueryError {
            command: "COMMIT".to_owned(),
            error,
        })?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ApplicationStatus::*;

    #[test]
    fn permitted_transitions_match_spec_table() {
        assert!(can_transition(Pending, Validating));
        assert!(can_transition(Pending, Cancelled));
        assert!(!can_transition(Pending, Approved));

        assert!(can_transition(Validating, PendingBankInfo));
        assert!(can_transition(Validating, UnderReview));
        assert!(can_transition(Validating, Approved));
        assert!(can_transition(Validating, Rejected));
        assert!(!can_transition(Validating, Disbursed));

        assert!(can_transition(PendingBankInfo, Validating));
        assert!(can_transition(PendingBankInfo, UnderReview));
        assert!(can_transition(PendingBankInfo, Rejected));
        assert!(can_transition(PendingBankInfo, Cancelled));
        assert!(!can_transition(PendingBankInfo, Approved));

        assert!(can_transition(UnderReview, Approved));
        assert!(can_transition(UnderReview, Rejected));
        assert!(can_transition(UnderReview, Cancelled));
        assert!(!can_transition(UnderReview, Disbursed));

        assert!(can_transition(Approved, Disbursed));
        assert!(can_transition(Approved, Cancelled));
        assert!(can_transition(Approved, Expired));
        assert!(!can_transition(Approved, Rejected));
    }

    #[test]
    fn terminal_statuses_have_no_outgoing_edges() {
        for status in [Rejected, Cancelled, Expired, Disbursed] {
            for target in [
                Pending,
                Validating,
                PendingBankInfo,
                UnderReview,
                Approved,
                Rejected,
                Cancelled,
                Expired,
                Disbursed,
            ] {
                assert!(!can_transition(status, target));
            }
        }
    }

    #[test]
    fn illegal_transition_rejected_rejects_approved() {
        // Mirrors end-to-end scenario E6: rejected -> approved must be illegal.
        assert!(!can_transition(Rejected, Approved));
    }

    async fn seed_application(pool: &sqlx::PgPool, status: ApplicationStatus) -> Uuid {
        let country_id = Uuid::new_v4();
        sqlx::query(
            r#"INSERT INTO country_configs
                (country_id, min_loan_amount, max_loan_amount, min_income_required, currency)
               VALUES ($1, 100, 100000, 500, 'USD')"#,
        )
        .bind(country_id)
        .execute(pool)
        .await
        .unwrap();

        let application_id = Uuid::new_v4();
        sqlx::query(
            r#"INSERT INTO applications
                (id, country_id, applicant_name, document_type, document_number, email, phone,
                 requested_amount, monthly_income, status)
               VALUES ($1, $2, 'Jane Doe', 'dni', '12345678Z', 'jane@example.com', '+1', 5000, 2000, $3)"#,
        )
        .bind(application_id)
        .bind(country_id)
        .bind(status)
        .execute(pool)
        .await
        .unwrap();

        application_id
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn apply_transition_updates_status_and_appends_a_row(pool: sqlx::PgPool) {
        let application_id = seed_application(&pool, Pending).await;
        let state_machine = StateMachine::new(pool.clone());

        state_machine
            .apply_transition(application_id, Validating, "docs received", TriggeredBy::System, None)
            .await
            .expect("legal transition must succeed");

        let (status,): (String,) =
            sqlx::query_as(r#"SELECT status::text FROM applications WHERE id = $1"#)
                .bind(application_id)
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(status, "validating");

        let (count,): (i64,) =
            sqlx::query_as(r#"SELECT COUNT(*) FROM state_transitions WHERE application_id = $1"#)
                .bind(application_id)
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(count, 1);
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn apply_transition_rejects_an_illegal_target_and_leaves_status_unchanged(pool: sqlx::PgPool) {
        let application_id = seed_application(&pool, Rejected).await;
        let state_machine = StateMachine::new(pool.clone());

        let result = state_machine
            .apply_transition(application_id, Approved, "oops", TriggeredBy::System, None)
            .await;

        assert!(matches!(result, Err(TransitionError::IllegalTransition { .. })));

        let (status,): (String,) =
            sqlx::query_as(r#"SELECT status::text FROM applications WHERE id = $1"#)
                .bind(application_id)
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(status, "rejected");
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn apply_transition_sets_processed_at_on_a_terminal_status(pool: sqlx::PgPool) {
        let application_id = seed_application(&pool, UnderReview).await;
        let state_machine = StateMachine::new(pool.clone());

        state_machine
            .apply_transition(application_id, Approved, "auto-approved with score 88", TriggeredBy::System, None)
            .await
            .unwrap();

        let (processed_at,): (Option<chrono::DateTime<chrono::Utc>>,) =
            sqlx::query_as(r#"SELECT processed_at FROM applications WHERE id = $1"#)
                .bind(application_id)
                .fetch_one(&pool)
                .await
                .unwrap();
        assert!(processed_at.is_some());
    }
}
