//! A2A benchmark agent for medical-record tasks.
//!
//! The pipeline for each incoming instruction is:
//! classify → pre-fetch (with cache fallback) → assemble prompt →
//! resolve with at most one tool round → emit the `"Response"` artifact.

pub mod agent;
pub mod classifier;
pub mod config;
pub mod context;
pub mod fhir;
pub mod llm;
pub mod resolver;
pub mod server;
pub mod types;

#[cfg(test)]
mod tests;

// Re-export key components
pub use agent::{Agent, InstructionPayload, StatusSink};
pub use classifier::{classify, TaskDescriptor};
pub use config::AgentConfig;
pub use llm::{LlmClient, OpenAiCompatClient};
