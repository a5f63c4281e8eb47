//! The agent itself: sequences classification, pre-fetch, prompt
//! assembly and resolution for each incoming message, emitting progress
//! along the way.

use async_trait::async_trait;
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, instrument, warn};

use crate::classifier::{classify, TaskDescriptor};
use crate::config::AgentConfig;
use crate::context::{assemble, PrefetchedContext};
use crate::fhir::{cached_fallback, prefetch_query, search_fhir, FetchOutcome};
use crate::llm::{LlmClient, OpenAiCompatClient};
use crate::resolver::resolve;
use crate::types::{message_text, Artifact, Message, Part, TaskState};

/// Name of the artifact carrying the final answer.
pub const RESPONSE_ARTIFACT: &str = "Response";

/// Fixed response when no LLM backend is configured. No network calls are
/// attempted in that case.
pub const NO_CREDENTIALS_MESSAGE: &str =
    "Error: no LLM API key is configured. Set NEBIUS_API_KEY or OPENAI_API_KEY.";

/// Inbound payload carried as message text. Anything that does not parse
/// as a JSON object with an `instruction` string is treated as a bare
/// instruction with no data-server URL and no ambient context.
#[derive(Debug, Clone, Deserialize)]
pub struct InstructionPayload {
    pub instruction: String,
    #[serde(default)]
    pub fhir_base_url: Option<String>,
    #[serde(default)]
    pub system_context: Option<String>,
    #[serde(default)]
    pub interaction_limit: Option<u32>,
}

impl InstructionPayload {
    pub fn parse(text: &str) -> Self {
        match serde_json::from_str::<InstructionPayload>(text) {
            Ok(payload) => payload,
            Err(_) => InstructionPayload {
                instruction: text.to_string(),
                fhir_base_url: None,
                system_context: None,
                interaction_limit: None,
            },
        }
    }
}

/// Progress and result channel for one task. The transport side decides
/// how updates are framed on the wire.
#[async_trait]
pub trait StatusSink: Send + Sync {
    async fn update_status(&self, state: TaskState, message: Message);
    async fn add_artifact(&self, parts: Vec<Part>, name: &str);
}

/// Sink that collects updates in memory, used by the non-streaming
/// transport and by tests.
#[derive(Default)]
pub struct CollectingSink {
    statuses: Mutex<Vec<(TaskState, Message)>>,
    artifacts: Mutex<Vec<Artifact>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn statuses(&self) -> Vec<(TaskState, Message)> {
        self.statuses.lock().expect("status lock").clone()
    }

    pub fn artifacts(&self) -> Vec<Artifact> {
        self.artifacts.lock().expect("artifact lock").clone()
    }
}

#[async_trait]
impl StatusSink for CollectingSink {
    async fn update_status(&self, state: TaskState, message: Message) {
        self.statuses.lock().expect("status lock").push((state, message));
    }

    async fn add_artifact(&self, parts: Vec<Part>, name: &str) {
        let mut artifacts = self.artifacts.lock().expect("artifact lock");
        let index = artifacts.len() as u32;
        artifacts.push(Artifact {
            name: Some(name.to_string()),
            parts,
            index,
        });
    }
}

/// The benchmark agent. Credential selection happens once at
/// construction; per-invocation state lives on the stack, so concurrent
/// invocations share nothing mutable.
pub struct Agent {
    llm: Option<Arc<dyn LlmClient>>,
    cache_snapshot: PathBuf,
}

impl Agent {
    pub fn new(config: &AgentConfig) -> Self {
        let llm = match OpenAiCompatClient::from_config(&config.llm) {
            Some(client) => {
                info!(backend = client.backend(), "LLM backend selected.");
                Some(Arc::new(client) as Arc<dyn LlmClient>)
            }
            None => {
                warn!("No LLM API key configured; agent will refuse tasks.");
                None
            }
        };
        Self {
            llm,
            cache_snapshot: PathBuf::from(&config.cache.snapshot_path),
        }
    }

    /// Builds an agent around an existing client, keeping the LLM seam
    /// injectable.
    pub fn with_client(llm: Arc<dyn LlmClient>, cache_snapshot: PathBuf) -> Self {
        Self {
            llm: Some(llm),
            cache_snapshot,
        }
    }

    /// Processes one incoming message. Never fails: every outcome,
    /// including configuration and downstream errors, ends with exactly
    /// one `"Response"` artifact.
    #[instrument(skip(self, message, sink), fields(message_id = %message.message_id))]
    pub async fn handle(&self, message: &Message, sink: &dyn StatusSink) {
        let raw = message_text(message);
        let payload = InstructionPayload::parse(&raw);
        if let Some(limit) = payload.interaction_limit {
            // Accepted for compatibility; no enforcement is defined.
            debug!(limit, "interaction_limit received.");
        }

        sink.update_status(TaskState::Working, Message::agent_text("Thinking..."))
            .await;

        let Some(llm) = &self.llm else {
            sink.add_artifact(vec![Part::text(NO_CREDENTIALS_MESSAGE)], RESPONSE_ARTIFACT)
                .await;
            return;
        };

        let descriptor = classify(&payload.instruction);
        let base_url = payload.fhir_base_url.as_deref();

        let mut prefetched = None;
        if let (Some(descriptor), Some(_)) = (&descriptor, base_url) {
            sink.update_status(
                TaskState::Working,
                Message::agent_text(progress_text(descriptor)),
            )
            .await;

            let (resource_type, params) = prefetch_query(descriptor);
            match search_fhir(base_url, resource_type, &params).await {
                FetchOutcome::Fetched(body) => {
                    prefetched = Some(PrefetchedContext::Live(body));
                }
                FetchOutcome::Failed(reason) => {
                    warn!(%reason, "Live pre-fetch failed; consulting local snapshot.");
                    if let Some(body) = cached_fallback(&self.cache_snapshot, descriptor) {
                        info!("Serving pre-fetch context from local snapshot.");
                        prefetched = Some(PrefetchedContext::Cache(body));
                    }
                }
            }
        }

        let prompt = assemble(
            descriptor.as_ref(),
            prefetched.as_ref(),
            payload.system_context.as_deref(),
            &payload.instruction,
            base_url.is_some(),
        );
        let answer = resolve(llm.as_ref(), base_url, &prompt).await;

        sink.add_artifact(vec![Part::text(answer)], RESPONSE_ARTIFACT)
            .await;
    }
}

fn progress_text(descriptor: &TaskDescriptor) -> &'static str {
    match descriptor {
        TaskDescriptor::SearchPatient { .. } => "Searching patient records...",
        TaskDescriptor::GetPatientAge { .. } => "Retrieving patient record...",
        TaskDescriptor::RecordVitals { .. } => {
            "Retrieving patient record before recording vitals..."
        }
    }
}
