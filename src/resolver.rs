//! Drives the LLM request/response cycle with a bounded tool-call round.
//!
//! The loop is deliberately not recursive: after the initial completion,
//! at most one round of tool execution is serviced, then one final
//! completion is requested with no tools advertised. A tool call appearing
//! in that second response is not serviced; its text is still the answer.
//! This guarantees termination and bounded latency at the cost of
//! multi-step tool chains.

use anyhow::Result;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, error, instrument, warn};

use crate::context::AssembledPrompt;
use crate::fhir::{search_fhir, FetchOutcome, SearchParams};
use crate::llm::{ChatMessage, LlmClient, ToolDefinition};

/// Name of the single tool advertised to the model.
pub const SEARCH_FHIR_TOOL: &str = "search_fhir";

/// The `search_fhir(resource_type, params)` contract advertised to the
/// model.
pub fn search_tool_definition() -> ToolDefinition {
    ToolDefinition {
        name: SEARCH_FHIR_TOOL.to_string(),
        description: "Query the FHIR server. Issues a GET request for the given \
                      resource type with the given search parameters and returns \
                      the JSON payload."
            .to_string(),
        parameters: json!({
            "type": "object",
            "properties": {
                "resource_type": {
                    "type": "string",
                    "description": "FHIR resource type, e.g. \"Patient\""
                },
                "params": {
                    "type": "object",
                    "description": "Search parameters as a flat key/value mapping; \
                                    a value may be a list for repeated parameters"
                }
            },
            "required": ["resource_type", "params"]
        }),
    }
}

/// Obtains the final answer for an assembled prompt. Never fails: any
/// error during LLM invocation or tool execution is reported in the
/// returned text so the invocation still completes.
#[instrument(skip(llm, prompt), fields(expose_tool = prompt.expose_tool))]
pub async fn resolve(
    llm: &dyn LlmClient,
    fhir_base_url: Option<&str>,
    prompt: &AssembledPrompt,
) -> String {
    match run_rounds(llm, fhir_base_url, prompt).await {
        Ok(text) => text,
        Err(e) => {
            error!(error = %e, "LLM resolution failed.");
            format!("Error while producing a response: {:#}", e)
        }
    }
}

async fn run_rounds(
    llm: &dyn LlmClient,
    fhir_base_url: Option<&str>,
    prompt: &AssembledPrompt,
) -> Result<String> {
    let mut messages = vec![
        ChatMessage::system(prompt.system.clone()),
        ChatMessage::user(prompt.user.clone()),
    ];
    let tools = prompt
        .expose_tool
        .then(|| vec![search_tool_definition()]);

    let first = llm.chat(&messages, tools.as_deref()).await?;
    if first.tool_calls.is_empty() {
        return Ok(first.content.unwrap_or_default());
    }

    debug!(
        call_count = first.tool_calls.len(),
        "Model requested tool calls; executing one round."
    );
    messages.push(ChatMessage::assistant_tool_calls(
        first.content.clone(),
        &first.tool_calls,
    ));
    for call in &first.tool_calls {
        let result = execute_search_call(fhir_base_url, &call.name, &call.arguments).await;
        messages.push(ChatMessage::tool_result(call.id.clone(), result));
    }

    // Final round, tool no longer advertised.
    let second = llm.chat(&messages, None).await?;
    if !second.tool_calls.is_empty() {
        warn!("Model requested further tool calls after the service round; not serviced.");
    }
    Ok(second.content.unwrap_or_default())
}

#[derive(Debug, Deserialize)]
struct SearchCallArgs {
    resource_type: String,
    #[serde(default)]
    params: Value,
}

/// Executes one requested tool call against the originally configured
/// data-server URL. Failures, including unparseable arguments and unknown
/// tool names, become the tool-result text.
async fn execute_search_call(fhir_base_url: Option<&str>, name: &str, arguments: &str) -> String {
    if name != SEARCH_FHIR_TOOL {
        warn!(tool = name, "Model requested an unknown tool.");
        return format!("Error: unknown tool \"{}\"", name);
    }
    match serde_json::from_str::<SearchCallArgs>(arguments) {
        Ok(args) => {
            let params = SearchParams::from_json(&args.params);
            match search_fhir(fhir_base_url, &args.resource_type, &params).await {
                FetchOutcome::Fetched(payload) => payload.to_string(),
                FetchOutcome::Failed(message) => format!("Error: {}", message),
            }
        }
        Err(e) => format!("Error: could not parse tool arguments: {}", e),
    }
}
