//! Business-rule validation of the merged document record.
//!
//! The validator never raises: every outcome is encoded in the returned
//! structure. Errors come out in a fixed order with duplicates collapsed,
//! and the verdict is the conjunction of all checks.

use chrono::NaiveDate;

use crate::{
    doc_types,
    errors::{CheckError, ErrorCode},
    fio,
    prelude::*,
    validity,
};

/// Output of the document-type classification call.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct DocTypeCheck {
    pub doc_type: Option<String>,
    #[serde(default)]
    pub single_doc_type_valid: bool,
}

/// Output of the field-extraction call.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct Extraction {
    #[serde(default)]
    pub fio: Option<String>,
    #[serde(default)]
    pub doc_date: Option<String>,
    #[serde(default)]
    pub organization: Option<String>,
}

/// The two LLM outputs merged, plus the optional stamp flag. In-memory
/// only; never persisted as-is.
#[derive(Clone, Debug)]
pub struct MergedDocument {
    pub doc_type: Option<String>,
    pub single_doc_type_valid: bool,
    pub fio: Option<String>,
    pub doc_date: Option<String>,
    pub organization: Option<String>,
    pub stamp_detected: Option<bool>,
}

impl MergedDocument {
    pub fn merge(
        doc_type_check: DocTypeCheck,
        extraction: Extraction,
        stamp_detected: Option<bool>,
    ) -> Self {
        Self {
            doc_type: doc_type_check.doc_type,
            single_doc_type_valid: doc_type_check.single_doc_type_valid,
            fio: extraction.fio,
            doc_date: extraction.doc_date,
            organization: extraction.organization,
            stamp_detected,
        }
    }
}

/// Per-check booleans, persisted with the run.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize)]
pub struct Checks {
    pub fio_match: bool,
    pub doc_type_known: bool,
    pub single_doc_type: bool,
    pub doc_date_present: bool,
    pub doc_date_valid: bool,
}

/// The validator's result: verdict, per-check booleans, ordered errors.
#[derive(Clone, Debug)]
pub struct ValidationOutcome {
    pub verdict: bool,
    pub checks: Checks,
    pub errors: Vec<CheckError>,
    /// The parsed document date, when one was recognized.
    pub doc_date: Option<NaiveDate>,
}

/// Run all business checks against the merged record.
pub fn validate(declared_fio: &str, merged: &MergedDocument, today: NaiveDate) -> ValidationOutcome {
    let mut errors: Vec<CheckError> = Vec::new();
    let push = |errors: &mut Vec<CheckError>, code: ErrorCode| {
        if !errors.iter().any(|err| err.code == code) {
            errors.push(CheckError::new(code));
        }
    };

    // 1. FIO present and matching.
    let declared_empty = declared_fio.trim().is_empty();
    let fio_match = match (&merged.fio, declared_empty) {
        (_, true) => false,
        (None, false) => false,
        (Some(extracted), false) => fio::fio_matches(declared_fio, extracted),
    };
    if !fio_match {
        if declared_empty {
            push(&mut errors, ErrorCode::FioMissing);
        } else {
            push(&mut errors, ErrorCode::FioMismatch);
        }
    }

    // 2. Doc type known.
    let doc_type_known = merged
        .doc_type
        .as_deref()
        .is_some_and(|name| doc_types::lookup(name).is_some());
    if !doc_type_known {
        push(&mut errors, ErrorCode::DocTypeUnknown);
    }

    // 3. Single doc type. The classifier stage normally short-circuits this
    // case before validation; the assertion stays as a safety net.
    if !merged.single_doc_type_valid {
        push(&mut errors, ErrorCode::MultipleDocTypes);
    }

    // 4-5. Document date present and within the validity window.
    let parsed_date = merged
        .doc_date
        .as_deref()
        .and_then(validity::parse_doc_date);
    let doc_date_present = parsed_date.is_some();
    let rule = doc_types::validity_for(merged.doc_type.as_deref());
    let doc_date_valid = match parsed_date {
        Some(doc_date) => validity::is_within_validity(doc_date, rule, today),
        None => false,
    };
    if !doc_date_present {
        push(&mut errors, ErrorCode::DocDateMissing);
    } else if !doc_date_valid {
        push(&mut errors, ErrorCode::DocDateTooOld);
    }

    let checks = Checks {
        fio_match,
        doc_type_known,
        single_doc_type: merged.single_doc_type_valid,
        doc_date_present,
        doc_date_valid,
    };
    ValidationOutcome {
        verdict: errors.is_empty(),
        checks,
        errors,
        doc_date: parsed_date,
    }
}
