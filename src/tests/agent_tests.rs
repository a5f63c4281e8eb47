use serde_json::json;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::NamedTempFile;
use uuid::Uuid;

use crate::agent::{Agent, CollectingSink, InstructionPayload, NO_CREDENTIALS_MESSAGE, RESPONSE_ARTIFACT};
use crate::config::AgentConfig;
use crate::context::{CACHE_CONTEXT_MARKER, LIVE_CONTEXT_MARKER};
use crate::resolver::SEARCH_FHIR_TOOL;
use crate::tests::mocks::MockLlmClient;
use crate::types::{Message, Part, Role, TaskState};

fn user_message(text: &str) -> Message {
    Message {
        role: Role::User,
        parts: vec![Part::text(text)],
        message_id: Uuid::new_v4().to_string(),
        context_id: None,
    }
}

fn payload_message(instruction: &str, fhir_base_url: &str) -> Message {
    user_message(
        &json!({
            "instruction": instruction,
            "fhir_base_url": fhir_base_url,
        })
        .to_string(),
    )
}

fn artifact_text(sink: &CollectingSink) -> String {
    let artifacts = sink.artifacts();
    assert_eq!(artifacts.len(), 1, "expected exactly one artifact");
    assert_eq!(artifacts[0].name.as_deref(), Some(RESPONSE_ARTIFACT));
    match &artifacts[0].parts[0] {
        Part::Text { text } => text.clone(),
        Part::Data { .. } => panic!("expected a text part"),
    }
}

#[test]
fn payload_parsing_extracts_fields() {
    let payload = InstructionPayload::parse(
        &json!({
            "instruction": "Find MRN for Brian Buchanan (DOB: 1954-08-10)",
            "fhir_base_url": "http://fhir.example/fhir",
            "system_context": "Current time is 2026-01-15T12:00:00+00:00",
            "interaction_limit": 5
        })
        .to_string(),
    );
    assert_eq!(
        payload.instruction,
        "Find MRN for Brian Buchanan (DOB: 1954-08-10)"
    );
    assert_eq!(
        payload.fhir_base_url.as_deref(),
        Some("http://fhir.example/fhir")
    );
    assert_eq!(payload.interaction_limit, Some(5));
}

#[test]
fn malformed_payloads_fall_back_to_raw_text() {
    let not_json = InstructionPayload::parse("Just a plain instruction");
    assert_eq!(not_json.instruction, "Just a plain instruction");
    assert!(not_json.fhir_base_url.is_none());

    // Valid JSON without an instruction key is treated the same way.
    let wrong_shape = InstructionPayload::parse(r#"{"question": "hi"}"#);
    assert_eq!(wrong_shape.instruction, r#"{"question": "hi"}"#);
}

#[tokio::test]
async fn search_task_prefetches_and_suppresses_the_tool() {
    let mut server = mockito::Server::new_async().await;
    let fhir_mock = server
        .mock("GET", "/Patient")
        .match_query(mockito::Matcher::AllOf(vec![
            mockito::Matcher::UrlEncoded("name".into(), "Brian".into()),
            mockito::Matcher::UrlEncoded("name".into(), "Buchanan".into()),
            mockito::Matcher::UrlEncoded("birthdate".into(), "1954-08-10".into()),
        ]))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(
            r#"{"resourceType": "Bundle", "total": 1,
                "entry": [{"resource": {"resourceType": "Patient", "id": "S6530532"}}]}"#,
        )
        .create_async()
        .await;

    let llm = Arc::new(MockLlmClient::new().with_text("The MRN is S6530532."));
    let agent = Agent::with_client(llm.clone(), PathBuf::from("/nonexistent/snapshot.json"));
    let sink = CollectingSink::new();

    agent
        .handle(
            &payload_message(
                "Find MRN for Brian Buchanan (DOB: 1954-08-10)",
                &server.url(),
            ),
            &sink,
        )
        .await;

    fhir_mock.assert_async().await;
    assert!(artifact_text(&sink).contains("S6530532"));

    let calls = llm.recorded_calls();
    assert_eq!(calls.len(), 1);
    assert!(calls[0].tools.is_empty(), "tool must be suppressed");
    assert!(calls[0].user_content().contains(LIVE_CONTEXT_MARKER));

    let states: Vec<TaskState> = sink.statuses().iter().map(|(s, _)| *s).collect();
    assert!(states.iter().all(|s| *s == TaskState::Working));
    assert_eq!(states.len(), 2);
}

#[tokio::test]
async fn age_task_prefetches_by_id_and_suppresses_the_tool() {
    let mut server = mockito::Server::new_async().await;
    let fhir_mock = server
        .mock("GET", "/Patient")
        .match_query(mockito::Matcher::UrlEncoded("_id".into(), "S2874099".into()))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"resourceType": "Patient", "id": "S2874099", "birthDate": "1970-01-01"}"#)
        .create_async()
        .await;

    let llm = Arc::new(MockLlmClient::new().with_text("The patient is 56 years old."));
    let agent = Agent::with_client(llm.clone(), PathBuf::from("/nonexistent/snapshot.json"));
    let sink = CollectingSink::new();

    agent
        .handle(
            &payload_message(
                "What's the age of the patient with MRN of S2874099?",
                &server.url(),
            ),
            &sink,
        )
        .await;

    fhir_mock.assert_async().await;
    let calls = llm.recorded_calls();
    assert!(calls[0].tools.is_empty());
    assert!(calls[0].user_content().contains(LIVE_CONTEXT_MARKER));
}

#[tokio::test]
async fn vitals_task_keeps_the_tool_despite_prefetch() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", "/Patient")
        .match_query(mockito::Matcher::UrlEncoded("_id".into(), "S12345".into()))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"resourceType": "Patient", "id": "S12345"}"#)
        .create_async()
        .await;

    let llm = Arc::new(MockLlmClient::new().with_text("Recorded."));
    let agent = Agent::with_client(llm.clone(), PathBuf::from("/nonexistent/snapshot.json"));
    let sink = CollectingSink::new();

    agent
        .handle(
            &payload_message(
                "I just measured the blood pressure for patient with MRN of S12345, and it is \"118/77 mmHg\". Help me record it.",
                &server.url(),
            ),
            &sink,
        )
        .await;

    let calls = llm.recorded_calls();
    assert_eq!(calls[0].tools, vec![SEARCH_FHIR_TOOL.to_string()]);
}

#[tokio::test]
async fn unrecognized_instruction_skips_prefetch_and_keeps_the_tool() {
    let mut server = mockito::Server::new_async().await;
    let fhir_mock = server
        .mock("GET", "/Patient")
        .expect(0)
        .create_async()
        .await;

    let llm = Arc::new(MockLlmClient::new().with_text("Response"));
    let agent = Agent::with_client(llm.clone(), PathBuf::from("/nonexistent/snapshot.json"));
    let sink = CollectingSink::new();

    agent
        .handle(
            &payload_message("Summarize patient condition", &server.url()),
            &sink,
        )
        .await;

    fhir_mock.assert_async().await;
    let calls = llm.recorded_calls();
    assert_eq!(calls[0].tools, vec![SEARCH_FHIR_TOOL.to_string()]);
    assert!(!calls[0].user_content().contains(LIVE_CONTEXT_MARKER));
}

#[tokio::test]
async fn live_failure_falls_back_to_the_snapshot() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", "/Patient")
        .with_status(500)
        .with_body("connection refused")
        .create_async()
        .await;

    let mut snapshot = NamedTempFile::new().expect("temp file");
    snapshot
        .write_all(
            json!({
                "task1_8": {
                    "resourceType": "Bundle",
                    "entry": [{
                        "resource": {
                            "resourceType": "Patient",
                            "id": "S6530532",
                            "birthDate": "1954-08-10",
                            "name": [{"family": "Buchanan", "given": ["Brian"]}]
                        }
                    }]
                }
            })
            .to_string()
            .as_bytes(),
        )
        .expect("write snapshot");

    let llm = Arc::new(MockLlmClient::new().with_text("The MRN is S6530532."));
    let agent = Agent::with_client(llm.clone(), snapshot.path().to_path_buf());
    let sink = CollectingSink::new();

    agent
        .handle(
            &payload_message(
                "Find MRN for Brian Buchanan (DOB: 1954-08-10)",
                &server.url(),
            ),
            &sink,
        )
        .await;

    let calls = llm.recorded_calls();
    let user_content = calls[0].user_content();
    assert!(user_content.contains(CACHE_CONTEXT_MARKER));
    assert!(user_content.contains("S6530532"));
    assert!(!user_content.contains(LIVE_CONTEXT_MARKER));
}

#[tokio::test]
async fn live_and_cache_failure_proceeds_without_context() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", "/Patient")
        .with_status(500)
        .create_async()
        .await;

    let llm = Arc::new(MockLlmClient::new().with_text("Patient not found"));
    let agent = Agent::with_client(llm.clone(), PathBuf::from("/nonexistent/snapshot.json"));
    let sink = CollectingSink::new();

    agent
        .handle(
            &payload_message(
                "Find MRN for Brian Buchanan (DOB: 1954-08-10)",
                &server.url(),
            ),
            &sink,
        )
        .await;

    let user_content = llm.recorded_calls()[0].user_content();
    assert!(!user_content.contains(LIVE_CONTEXT_MARKER));
    assert!(!user_content.contains(CACHE_CONTEXT_MARKER));
    assert_eq!(artifact_text(&sink), "Patient not found");
}

#[tokio::test]
async fn missing_credentials_short_circuit() {
    let agent = Agent::new(&AgentConfig::default());
    let sink = CollectingSink::new();

    agent
        .handle(&user_message("Find MRN for Brian Buchanan (DOB: 1954-08-10)"), &sink)
        .await;

    assert_eq!(artifact_text(&sink), NO_CREDENTIALS_MESSAGE);
}

#[tokio::test]
async fn bare_text_without_a_data_server_gets_no_tool() {
    let llm = Arc::new(MockLlmClient::new().with_text("Hello!"));
    let agent = Agent::with_client(llm.clone(), PathBuf::from("/nonexistent/snapshot.json"));
    let sink = CollectingSink::new();

    agent.handle(&user_message("Hello, are you ready?"), &sink).await;

    let calls = llm.recorded_calls();
    assert_eq!(calls.len(), 1);
    assert!(calls[0].tools.is_empty());
    assert_eq!(artifact_text(&sink), "Hello!");
}
