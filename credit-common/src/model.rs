//! Core data model: applications, transitions, banking info, and country
//! configuration (see spec §3).

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Closed set of legal application statuses (spec §4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, sqlx::Type, Serialize, Deserialize)]
#[sqlx(type_name = "application_status")]
#[sqlx(rename_all = "snake_case")]
pub enum ApplicationStatus {
    Pending,
    Validating,
    PendingBankInfo,
    UnderReview,
    Approved,
    Rejected,
    Cancelled,
    Expired,
    Disbursed,
}

impl ApplicationStatus {
    /// Terminal statuses have no outgoing legal transitions.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ApplicationStatus::Approved
                | ApplicationStatus::Rejected
                | ApplicationStatus::Cancelled
                | ApplicationStatus::Expired
                | ApplicationStatus::Disbursed
        )
    }
}

impl fmt::Display for ApplicationStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            ApplicationStatus::Pending => "pending",
            ApplicationStatus::Validating => "validating",
            ApplicationStatus::PendingBankInfo => "pending_bank_info",
            ApplicationStatus::UnderReview => "under_review",
            ApplicationStatus::Approved => "approved",
            ApplicationStatus::Rejected => "rejected",
            ApplicationStatus::Cancelled => "cancelled",
            ApplicationStatus::Expired => "expired",
            ApplicationStatus::Disbursed => "disbursed",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, thiserror::Error)]
#[error("{0} is not a valid ApplicationStatus")]
pub struct ParseApplicationStatusError(String);

impl FromStr for ApplicationStatus {
    type Err = ParseApplicationStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ApplicationStatus::Pending),
            "validating" => Ok(ApplicationStatus::Validating),
            "pending_bank_info" => Ok(ApplicationStatus::PendingBankInfo),
            "under_review" => Ok(ApplicationStatus::UnderReview),
            "approved" => Ok(ApplicationStatus::Approved),
            "rejected" => Ok(ApplicationStatus::Rejected),
            "cancelled" => Ok(ApplicationStatus::Cancelled),
            "expired" => Ok(ApplicationStatus::Expired),
            "disbursed" => Ok(ApplicationStatus::Disbursed),
            other => Err(ParseApplicationStatusError(other.to_owned())),
        }
    }
}

/// Who triggered a state transition or a user-initiated action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type, Serialize, Deserialize)]
#[sqlx(type_name = "triggered_by")]
#[sqlx(rename_all = "lowercase")]
pub enum TriggeredBy {
    System,
    User,
    Webhook,
}

/// Payment history bucket reported by a banking provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type, Serialize, Deserialize)]
#[sqlx(type_name = "payment_history")]
#[sqlx(rename_all = "lowercase")]
pub enum PaymentHistory {
    Good,
    Regular,
    Bad,
}

/// A credit request from one applicant for one amount in one country.
#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct Application {
    pub id: Uuid,
    pub country_id: Uuid,
    pub applicant_name: String,
    pub document_type: String,
    pub document_number: String,
    pub email: String,
    pub phone: String,
    pub requested_amount: f64,
    pub monthly_income: f64,
    pub status: ApplicationStatus,
    pub status_reason: Option<String>,
    pub requires_review: bool,
    pub risk_score: Option<i32>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    #[sqlx(skip)]
    pub banking_info: Option<BankingInfo>,
}

/// An immutable, append-only record of a status change (spec §3).
#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct StateTransition {
    pub id: Uuid,
    pub application_id: Uuid,
    pub from_status: Option<ApplicationStatus>,
    pub to_status: ApplicationStatus,
    pub reason: String,
    pub triggered_by: TriggeredBy,
    pub triggered_by_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

/// A one-per-application snapshot of banking-provider data.
#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize, PartialEq)]
pub struct BankingInfo {
    pub application_id: Uuid,
    pub credit_score: i32,
    pub total_debt: f64,
    pub available_credit: f64,
    pub payment_history: PaymentHistory,
    pub bank_account_count: i32,
    pub active_loan_count: i32,
    pub months_employed: i32,
    pub provider_id: String,
    pub retrieved_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Country-scoped parameters of the risk pipeline (spec §3, §4.5).
#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct CountryConfig {
    pub country_id: Uuid,
    pub min_loan_amount: f64,
    pub max_loan_amount: f64,
    pub min_income_required: f64,
    pub max_debt_to_income_ratio: f64,
    pub review_threshold: f64,
    pub min_credit_score: i32,
    pub currency: String,
}

impl CountryConfig {
    /// The defaults the scoring function falls back to when a config value
    /// is zero or missing (spec §4.5 "Defaults when config is zero/missing").
    pub fn max_debt_to_income_ratio_or_default(&self) -> f64 {
        if self.max_debt_to_income_ratio > 0.0 {
            self.max_debt_to_income_ratio
        } else {
            0.4
        }
    }

    pub fn min_credit_score_or_default(&self) -> i32 {
        if self.min_credit_score > 0 {
            self.min_credit_score
        } else {
            600
        }
    }

    pub fn review_threshold_or_default(&self) -> f64 {
        if self.review_threshold > 0.0 {
            self.review_threshold
        } else {
            50_000.0
        }
    }
}

/// A `(country, document code)` pair used to validate applicant documents.
#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct DocumentType {
    pub country_id: Uuid,
    pub code: String,
    pub pattern: Option<String>,
    pub required: bool,
}

/// A provider of banking data for a given country (spec §4.5 `banking_info_fetch`).
#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct Provider {
    pub id: String,
    pub country_id: Uuid,
    pub active: bool,
    pub priority: i32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses_match_spec_table() {
        assert!(ApplicationStatus::Approved.is_terminal());
        assert!(ApplicationStatus::Rejected.is_terminal());
        assert!(ApplicationStatus::Cancelled.is_terminal());
        assert!(ApplicationStatus::Expired.is_terminal());
        assert!(ApplicationStatus::Disbursed.is_terminal());
        assert!(!ApplicationStatus::Pending.is_terminal());
        assert!(!ApplicationStatus::Validating.is_terminal());
        assert!(!ApplicationStatus::PendingBankInfo.is_terminal());
        assert!(!ApplicationStatus::UnderReview.is_terminal());
    }

    #[test]
    fn status_round_trips_through_str() {
        for s in [
            ApplicationStatus::Pending,
            ApplicationStatus::Validating,
            ApplicationStatus::PendingBankInfo,
            ApplicationStatus::UnderReview,
            ApplicationStatus::Approved,
            ApplicationStatus::Rejected,
            ApplicationStatus::Cancelled,
            ApplicationStatus::Expired,
            ApplicationStatus::Disbursed,
        ] {
            let parsed: ApplicationStatus = s.to_string().parse().unwrap();
            assert_eq!(parsed, s);
        }
    }

    #[test]
    fn rejects_unknown_status() {
        assert!("not_a_status".parse::<ApplicationStatus>().is_err());
    }
}
