//! Heuristic classification of free-text instructions into known task
//! shapes.
//!
//! The benchmark phrases its tasks in a handful of recognizable forms;
//! matching them up front lets the agent pre-fetch authoritative data
//! before the model is ever consulted. Rules are applied in order and the
//! first match wins, so rule order is the tie-break if two ever overlap.

use once_cell::sync::Lazy;
use regex::Regex;

/// Structured form of a recognized instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskDescriptor {
    /// Look up a patient by name and date of birth.
    SearchPatient { name: String, dob: String },
    /// Compute the age of the patient with the given MRN.
    GetPatientAge { mrn: String },
    /// Record a blood-pressure measurement for the given MRN.
    RecordVitals { mrn: String, blood_pressure: String },
}

static NAME_AND_DOB: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)name\s+([\w\s]+?)\s+and\s+DOB\s+of\s+(\d{4}-\d{2}-\d{2})")
        .expect("name/DOB pattern compiles")
});

static FIND_MRN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)find\s+MRN\s+for\s+([^(]+?)\s*\(\s*DOB:\s*(\d{4}-\d{2}-\d{2})\s*\)")
        .expect("find-MRN pattern compiles")
});

static PATIENT_AGE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)age\s+of\s+the\s+patient\s+with\s+MRN\s+of\s+([A-Za-z]\d+)")
        .expect("age pattern compiles")
});

static RECORD_VITALS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?i)measured\s+the\s+blood\s+pressure\s+for\s+patient\s+with\s+MRN\s+of\s+([A-Za-z]\d+).*?is\s+"([^"]+)""#,
    )
    .expect("vitals pattern compiles")
});

/// Maps an instruction to a task descriptor, or `None` when no rule
/// matches. Pure and deterministic; no validation of date plausibility is
/// attempted.
pub fn classify(text: &str) -> Option<TaskDescriptor> {
    if let Some(captures) = NAME_AND_DOB.captures(text) {
        return Some(TaskDescriptor::SearchPatient {
            name: normalize_name(&captures[1]),
            dob: captures[2].to_string(),
        });
    }

    if let Some(captures) = FIND_MRN.captures(text) {
        return Some(TaskDescriptor::SearchPatient {
            name: normalize_name(&captures[1]),
            dob: captures[2].to_string(),
        });
    }

    if let Some(captures) = PATIENT_AGE.captures(text) {
        return Some(TaskDescriptor::GetPatientAge {
            mrn: captures[1].to_string(),
        });
    }

    if let Some(captures) = RECORD_VITALS.captures(text) {
        return Some(TaskDescriptor::RecordVitals {
            mrn: captures[1].to_string(),
            blood_pressure: captures[2].to_string(),
        });
    }

    None
}

/// Trims the captured name and collapses internal whitespace runs to
/// single spaces, preserving multi-word names.
fn normalize_name(raw: &str) -> String {
    raw.split_whitespace().collect::<Vec<_>>().join(" ")
}
