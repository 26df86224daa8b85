//! `document_validation`: regex plus type-specific structural checks on an
//! applicant's document number (spec §4.5). Pure beyond a single
//! `DocumentTypeRepository` lookup; does not transition the application.

use std::sync::Arc;

use async_trait::async_trait;
use credit_common::queue::Job;
use credit_common::repository::DocumentTypeRepository;
use regex::Regex;
use serde::Deserialize;
use uuid::Uuid;

use crate::error::HandlerError;
use crate::handlers::JobHandler;

#[derive(Debug, Deserialize)]
struct DocumentValidationPayload {
    #[allow(dead_code)]
    application_id: Uuid,
    country_id: Uuid,
    document_type: String,
    document_number: String,
}

/// Normalise to upper-case with surrounding/internal whitespace stripped,
/// as every structural check operates on this form (spec §4.5).
fn normalise(document_number: &str) -> String {
    document_number.chars().filter(|c| !c.is_whitespace()).collect::<String>().to_uppercase()
}

const DNI_LETTERS: &str = "TRWAGMYFPDXBNJZSQVHLCKE";

fn check_dni(number: &str) -> bool {
    let re = Regex::new(r"^\d{8}[A-Z]$").unwrap();
    if !re.is_match(number) {
        return false;
    }
    let digits: u32 = number[..8].parse().unwrap_or(u32::MAX);
    let expected = DNI_LETTERS.chars().nth((digits % 23) as usize);
    expected == number.chars().last()
}

fn check_nie(number: &str) -> bool {
    Regex::new(r"^[XYZ]\d{7}[A-Z]$").unwrap().is_match(number)
}

fn check_nif(number: &str) -> bool {
    Regex::new(r"^\d{9}$").unwrap().is_match(number)
}

fn check_curp(number: &str) -> bool {
    Regex::new(r"^[A-Z]{4}\d{6}[HM][A-Z]{5}[0-9A-Z]\d$")
        .unwrap()
        .is_match(number)
}

/// Classic modulo-11 CPF check-digit algorithm (spec §4.5).
fn check_cpf(number: &str) -> bool {
    if !Regex::new(r"^\d{11}$").unwrap().is_match(number) {
        return false;
    }
    let digits: Vec<u32> = number.chars().map(|c| c.to_digit(10).unwrap()).collect();
    if digits.iter().all(|d| *d == digits[0]) {
        return false;
    }

    let check_digit = |weights_from: usize, upto: usize| -> u32 {
        let sum: u32 = (0..upto)
            .map(|i| digits[i] * (weights_from - i) as u32)
            .sum();
        let remainder = sum % 11;
        if remainder < 2 {
            0
        } else {
            11 - remainder
        }
    };

    let first = check_digit(10, 9);
    let second = check_digit(11, 10);
    digits[9] == first && digits[10] == second
}

fn check_cc(number: &str) -> bool {
    Regex::new(r"^\d{6,10}$").unwrap().is_match(number)
}

fn check_cf(number: &str) -> bool {
    Regex::new(r"^[A-Z]{6}\d{2}[A-Z]\d{2}[A-Z]\d{3}[A-Z]$")
        .unwrap()
        .is_match(number)
}

/// Structural check dispatch by document-type code (spec §4.5). Unknown
/// codes fall back to a bare length check.
fn structurally_valid(document_type: &str, normalised: &str) -> bool {
    match document_type.to_uppercase().as_str() {
        "DNI" => check_dni(normalised),
        "NIE" => check_nie(normalised),
        "NIF" => check_nif(normalised),
        "CURP" => check_curp(normalised),
        "CPF" => check_cpf(normalised),
        "CC" => check_cc(normalised),
        "CF" => check_cf(normalised),
        _ => normalised.len() >= 5,
    }
}

pub struct DocumentValidationHandler {
    document_types: Arc<dyn DocumentTypeRepository>,
}

impl DocumentValidationHandler {
    pub fn new(document_types: Arc<dyn DocumentTypeRepository>) -> Self {
        Self { document_types }
    }
}

#[async_trait]
impl JobHandler for DocumentValidationHandler {
    async fn handle(&self, job: &Job) -> Result<Option<serde_json::Value>, HandlerError> {
        let payload: DocumentValidationPayload = job
            .parameters()
            .map_err(|_| HandlerError::InvalidPayload("document_validation".to_owned()))?;

        let normalised = normalise(&payload.document_number);

        let regex_ok = match self
            .document_types
            .get(payload.country_id, &payload.document_type)
            .await?
        {
            Some(document_type) => match document_type.pattern {
                Some(pattern) => Regex::new(&pattern)
                    .map(|re| re.is_match(&normalised))
                    .unwrap_or(false),
                None => true,
            },
            None => true,
        };

        let structural_ok = structurally_valid(&payload.document_type, &normalised);
        let valid = regex_ok && structural_ok;

        Ok(Some(serde_json::json!({
            "document_invalid": !valid,
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dni_check_letter_follows_modulo_23_table() {
        // 12345678 % 23 = 14 -> 'Z'
        assert!(check_dni("12345678Z"));
        assert!(!check_dni("12345678A"));
    }

    #[test]
    fn nie_requires_leading_xyz() {
        assert!(check_nie("X1234567L"));
        assert!(!check_nie("A1234567L"));
    }

    #[test]
    fn nif_is_nine_digits() {
        assert!(check_nif("123456789"));
        assert!(!check_nif("12345678"));
    }

    #[test]
    fn curp_matches_full_pattern() {
        assert!(check_curp("ABCD123456HDFRNS09"));
        assert!(!check_curp("short"));
    }

    #[test]
    fn cpf_rejects_all_identical_digits() {
        assert!(!check_cpf("11111111111"));
    }

    #[test]
    fn cpf_accepts_a_valid_check_digit_pair() {
        // 111.444.777-35 is a commonly used valid CPF test fixture.
        assert!(check_cpf("11144477735"));
    }

    #[test]
    fn cpf_rejects_a_tampered_check_digit() {
        assert!(!check_cpf("11144477736"));
    }

    #[test]
    fn cc_accepts_six_to_ten_digits() {
        assert!(check_cc("123456"));
        assert!(check_cc("1234567890"));
        assert!(!check_cc("12345"));
        assert!(!check_cc("12345678901"));
    }

    #[test]
    fn unknown_document_type_requires_length_at_least_five() {
        assert!(structurally_valid("PASSPORT", "AB1234"));
        assert!(!structurally_valid("PASSPORT", "AB12"));
    }

    #[test]
    fn normalise_strips_whitespace_and_upper_cases() {
        assert_eq!(normalise(" 1234 5678 z "), "12345678Z");
    }
}
