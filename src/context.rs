//! Assembles the system prompt and user content for one invocation.
//!
//! The assembler also decides whether the `search_fhir` tool is advertised
//! at all. Known read-only lookups are answered from the pre-fetched
//! context without spending a tool round-trip; the vitals task still needs
//! the tool because recording is an action the model must perform itself,
//! and an unrecognized instruction gets the tool because nothing was
//! pre-fetched on its behalf.

use serde_json::Value;

use crate::classifier::TaskDescriptor;

/// Marker labeling context retrieved from the live server.
pub const LIVE_CONTEXT_MARKER: &str = "CONTEXT FROM FHIR (Pre-fetched)";
/// Marker labeling context served from the local snapshot.
pub const CACHE_CONTEXT_MARKER: &str = "CONTEXT FROM CACHE (Fallback)";

const BASE_SYSTEM_PROMPT: &str = "\
You are a medical-records assistant agent taking part in an automated \
benchmark. You answer questions about patient records held in a FHIR \
server. Be accurate and concise: answer exactly what was asked, without \
extra commentary. Never invent patient data.";

/// Context payload injected into the user content, tagged by where it
/// came from.
#[derive(Debug, Clone)]
pub enum PrefetchedContext {
    Live(Value),
    Cache(Value),
}

/// The message set handed to the resolver.
#[derive(Debug, Clone)]
pub struct AssembledPrompt {
    pub system: String,
    pub user: String,
    pub expose_tool: bool,
}

/// Builds the prompt for one invocation from the classifier output, the
/// fetch outcome, and the optional ambient context string.
pub fn assemble(
    descriptor: Option<&TaskDescriptor>,
    prefetched: Option<&PrefetchedContext>,
    ambient_context: Option<&str>,
    instruction: &str,
    fhir_url_known: bool,
) -> AssembledPrompt {
    let mut system = BASE_SYSTEM_PROMPT.to_string();

    if let Some(context) = ambient_context {
        system.push_str("\n\nAdditional context provided with the task:\n");
        system.push_str(context);
    }

    if fhir_url_known {
        if descriptor.is_some() {
            system.push_str(
                "\n\nThe relevant FHIR data has already been retrieved and is \
                 included with the task below. Base your answer on that data.",
            );
        } else {
            system.push_str(
                "\n\nYou have access to the FHIR server through the search_fhir \
                 tool. Use the tool to retrieve any data you need; do not \
                 fabricate it.",
            );
        }
    }

    let mut user = instruction.to_string();
    if let Some(context) = prefetched {
        let (marker, payload) = match context {
            PrefetchedContext::Live(payload) => (LIVE_CONTEXT_MARKER, payload),
            PrefetchedContext::Cache(payload) => (CACHE_CONTEXT_MARKER, payload),
        };
        let serialized = serde_json::to_string_pretty(payload)
            .unwrap_or_else(|_| payload.to_string());
        user.push_str(&format!(
            "\n\n=== {} ===\n{}\n=== END CONTEXT ===",
            marker, serialized
        ));
    }

    AssembledPrompt {
        system,
        user,
        expose_tool: expose_tool(descriptor, fhir_url_known),
    }
}

/// Per-task tool-exposure policy. The tool is only ever advertised when a
/// live endpoint is known; beyond that, read-only lookups with pre-fetched
/// data suppress it while the vitals task and unrecognized instructions
/// keep it.
fn expose_tool(descriptor: Option<&TaskDescriptor>, fhir_url_known: bool) -> bool {
    if !fhir_url_known {
        return false;
    }
    match descriptor {
        Some(TaskDescriptor::SearchPatient { .. })
        | Some(TaskDescriptor::GetPatientAge { .. }) => false,
        Some(TaskDescriptor::RecordVitals { .. }) | None => true,
    }
}
