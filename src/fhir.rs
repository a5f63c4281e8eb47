//! FHIR data access: live server queries and the local snapshot fallback.
//!
//! Fetch failures are ordinary outcomes, not errors: a transport or HTTP
//! problem is carried back to the caller as text so the pipeline can fall
//! back to the cache or proceed with no context at all.

use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, instrument, trace, warn};

use crate::classifier::TaskDescriptor;

/// Per-request timeout for live FHIR queries. One failed attempt falls
/// through to the cache; there is no retry.
const FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// Value of one search parameter: single or repeated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParamValue {
    One(String),
    Many(Vec<String>),
}

/// Flat key → value (or key → list) search-parameter mapping.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchParams(BTreeMap<String, ParamValue>);

impl SearchParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn one(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), ParamValue::One(value.into()));
        self
    }

    pub fn many(mut self, key: impl Into<String>, values: Vec<String>) -> Self {
        self.0.insert(key.into(), ParamValue::Many(values));
        self
    }

    /// Flattens the mapping into repeated query pairs, e.g.
    /// `name=Brian&name=Buchanan&birthdate=1954-08-10`.
    pub fn to_query_pairs(&self) -> Vec<(String, String)> {
        let mut pairs = Vec::new();
        for (key, value) in &self.0 {
            match value {
                ParamValue::One(v) => pairs.push((key.clone(), v.clone())),
                ParamValue::Many(vs) => {
                    pairs.extend(vs.iter().map(|v| (key.clone(), v.clone())))
                }
            }
        }
        pairs
    }

    /// Builds a parameter mapping from the JSON object form used in tool
    /// calls. Scalars become single values, arrays become repeated ones;
    /// anything else is skipped.
    pub fn from_json(value: &Value) -> Self {
        let mut params = BTreeMap::new();
        if let Some(object) = value.as_object() {
            for (key, entry) in object {
                match entry {
                    Value::Array(items) => {
                        let values = items.iter().filter_map(scalar_to_string).collect();
                        params.insert(key.clone(), ParamValue::Many(values));
                    }
                    other => {
                        if let Some(v) = scalar_to_string(other) {
                            params.insert(key.clone(), ParamValue::One(v));
                        }
                    }
                }
            }
        }
        SearchParams(params)
    }
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Internal failure taxonomy for live fetches.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("no data-server URL configured")]
    NoBaseUrl,

    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        source: reqwest::Error,
    },

    #[error("FHIR server returned {status} for {url}: {body}")]
    Status {
        url: String,
        status: reqwest::StatusCode,
        body: String,
    },

    #[error("failed to decode FHIR response from {url}: {source}")]
    Body {
        url: String,
        source: reqwest::Error,
    },
}

/// Result of one fetch attempt. Failures carry the error text and are
/// handled by falling back, never by aborting the invocation.
#[derive(Debug, Clone)]
pub enum FetchOutcome {
    Fetched(Value),
    Failed(String),
}

impl FetchOutcome {
    pub fn is_fetched(&self) -> bool {
        matches!(self, FetchOutcome::Fetched(_))
    }
}

/// Issues `GET {base_url}/{resource_type}` with the flattened search
/// parameters and a bounded timeout. Any failure, including a missing
/// base URL, is returned as a `Failed` outcome.
#[instrument(skip(params))]
pub async fn search_fhir(
    base_url: Option<&str>,
    resource_type: &str,
    params: &SearchParams,
) -> FetchOutcome {
    match try_search(base_url, resource_type, params).await {
        Ok(payload) => {
            debug!("FHIR query succeeded.");
            FetchOutcome::Fetched(payload)
        }
        Err(e) => {
            warn!(error = %e, "FHIR query failed.");
            FetchOutcome::Failed(e.to_string())
        }
    }
}

async fn try_search(
    base_url: Option<&str>,
    resource_type: &str,
    params: &SearchParams,
) -> Result<Value, FetchError> {
    let base = base_url.ok_or(FetchError::NoBaseUrl)?;
    let url = format!("{}/{}", base.trim_end_matches('/'), resource_type);
    trace!(%url, "Issuing FHIR query.");

    let client = reqwest::Client::new();
    let response = client
        .get(&url)
        .query(&params.to_query_pairs())
        .timeout(FETCH_TIMEOUT)
        .send()
        .await
        .map_err(|source| FetchError::Transport {
            url: url.clone(),
            source,
        })?;

    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());
        return Err(FetchError::Status { url, status, body });
    }

    response.json().await.map_err(|source| FetchError::Body {
        url: url.clone(),
        source,
    })
}

/// Derives the pre-fetch query for a recognized task shape: patient
/// search by repeated name tokens plus birth date, or record lookup by
/// `_id` for the MRN-keyed tasks.
pub fn prefetch_query(descriptor: &TaskDescriptor) -> (&'static str, SearchParams) {
    let params = match descriptor {
        TaskDescriptor::SearchPatient { name, dob } => SearchParams::new()
            .many(
                "name",
                name.split_whitespace().map(String::from).collect(),
            )
            .one("birthdate", dob.clone()),
        TaskDescriptor::GetPatientAge { mrn }
        | TaskDescriptor::RecordVitals { mrn, .. } => {
            SearchParams::new().one("_id", mrn.clone())
        }
    };
    ("Patient", params)
}

/// Looks up the snapshot fallback for a descriptor. Only the
/// name-and-DOB search has a snapshot to consult; the MRN-keyed shapes
/// always come back absent.
pub fn cached_fallback(snapshot_path: &Path, descriptor: &TaskDescriptor) -> Option<Value> {
    match descriptor {
        TaskDescriptor::SearchPatient { name, dob } => {
            search_local_cache(snapshot_path, name, dob)
        }
        TaskDescriptor::GetPatientAge { .. } | TaskDescriptor::RecordVitals { .. } => None,
    }
}

/// Scans the pre-fetched snapshot for a patient search bundle matching
/// the requested name and birth date. The file is re-read on every
/// lookup so snapshot updates take effect without a restart. A missing
/// or unreadable snapshot is an absent result, not an error.
#[instrument(skip(snapshot_path), fields(path = %snapshot_path.display()))]
pub fn search_local_cache(snapshot_path: &Path, name: &str, dob: &str) -> Option<Value> {
    let raw = match fs::read_to_string(snapshot_path) {
        Ok(raw) => raw,
        Err(e) => {
            debug!(error = %e, "Snapshot file not readable.");
            return None;
        }
    };
    let snapshot: Value = match serde_json::from_str(&raw) {
        Ok(snapshot) => snapshot,
        Err(e) => {
            warn!(error = %e, "Snapshot file is not valid JSON.");
            return None;
        }
    };

    let wanted: BTreeSet<String> = name
        .split_whitespace()
        .map(|token| token.to_lowercase())
        .collect();

    for bundle in snapshot.as_object()?.values() {
        let entries = match bundle.get("entry").and_then(Value::as_array) {
            Some(entries) => entries,
            None => continue,
        };
        for entry in entries {
            let resource = match entry.get("resource") {
                Some(resource) => resource,
                None => continue,
            };
            if resource.get("resourceType").and_then(Value::as_str) != Some("Patient") {
                continue;
            }
            if resource.get("birthDate").and_then(Value::as_str) != Some(dob) {
                continue;
            }
            if patient_name_matches(resource, &wanted) {
                debug!("Snapshot hit for requested patient.");
                return Some(bundle.clone());
            }
        }
    }

    debug!("No snapshot entry matched.");
    None
}

/// Order-insensitive, case-insensitive comparison of the requested name
/// tokens against family + given names of any name record.
fn patient_name_matches(resource: &Value, wanted: &BTreeSet<String>) -> bool {
    let names = match resource.get("name").and_then(Value::as_array) {
        Some(names) => names,
        None => return false,
    };
    names.iter().any(|record| {
        let mut tokens = BTreeSet::new();
        if let Some(family) = record.get("family").and_then(Value::as_str) {
            tokens.insert(family.to_lowercase());
        }
        if let Some(given) = record.get("given").and_then(Value::as_array) {
            for part in given.iter().filter_map(Value::as_str) {
                tokens.insert(part.to_lowercase());
            }
        }
        !tokens.is_empty() && tokens == *wanted
    })
}
