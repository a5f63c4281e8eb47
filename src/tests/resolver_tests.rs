use serde_json::json;

use crate::context::AssembledPrompt;
use crate::resolver::{resolve, SEARCH_FHIR_TOOL};
use crate::tests::mocks::{FailingLlmClient, MockLlmClient};

fn prompt(expose_tool: bool) -> AssembledPrompt {
    AssembledPrompt {
        system: "system".to_string(),
        user: "user".to_string(),
        expose_tool,
    }
}

#[tokio::test]
async fn direct_answer_needs_no_second_round() {
    let llm = MockLlmClient::new().with_text("The MRN is S6530532.");

    let answer = resolve(&llm, Some("http://unused"), &prompt(false)).await;

    assert_eq!(answer, "The MRN is S6530532.");
    let calls = llm.recorded_calls();
    assert_eq!(calls.len(), 1);
    assert!(calls[0].tools.is_empty());
}

#[tokio::test]
async fn tool_list_carries_search_fhir_when_exposed() {
    let llm = MockLlmClient::new().with_text("ok");

    resolve(&llm, Some("http://unused"), &prompt(true)).await;

    let calls = llm.recorded_calls();
    assert_eq!(calls[0].tools, vec![SEARCH_FHIR_TOOL.to_string()]);
}

#[tokio::test]
async fn tool_call_is_serviced_exactly_once() {
    let mut server = mockito::Server::new_async().await;
    let fhir_mock = server
        .mock("GET", "/Patient")
        .match_query(mockito::Matcher::AllOf(vec![
            mockito::Matcher::UrlEncoded("given".into(), "Brian".into()),
            mockito::Matcher::UrlEncoded("family".into(), "Buchanan".into()),
        ]))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"resourceType": "Bundle", "entry": [{"resource": {"id": "123"}}]}"#)
        .create_async()
        .await;

    let arguments = json!({
        "resource_type": "Patient",
        "params": {"given": "Brian", "family": "Buchanan"}
    })
    .to_string();
    let llm = MockLlmClient::new()
        .with_tool_call("call_123", SEARCH_FHIR_TOOL, &arguments)
        .with_text("found patient Brian Buchanan");

    let answer = resolve(&llm, Some(&server.url()), &prompt(true)).await;

    assert_eq!(answer, "found patient Brian Buchanan");
    fhir_mock.assert_async().await;

    let calls = llm.recorded_calls();
    assert_eq!(calls.len(), 2);
    // The second request extends the conversation with the assistant's
    // tool-call turn and the keyed tool result, and re-advertises nothing.
    assert!(calls[1].tools.is_empty());
    let roles: Vec<&str> = calls[1].messages.iter().map(|m| m.role).collect();
    assert_eq!(roles, vec!["system", "user", "assistant", "tool"]);
    let tool_message = &calls[1].messages[3];
    assert_eq!(tool_message.tool_call_id.as_deref(), Some("call_123"));
    assert!(tool_message
        .content
        .as_deref()
        .unwrap_or_default()
        .contains("\"id\":\"123\""));
}

#[tokio::test]
async fn second_round_tool_calls_are_not_serviced() {
    let arguments = json!({"resource_type": "Patient", "params": {}}).to_string();
    let llm = MockLlmClient::new()
        .with_tool_call("call_1", SEARCH_FHIR_TOOL, &arguments)
        .with_tool_call("call_2", SEARCH_FHIR_TOOL, &arguments);

    // The second turn requests another call and carries no text; the
    // answer is its (empty) text and no third round happens.
    let answer = resolve(&llm, None, &prompt(true)).await;

    assert_eq!(answer, "");
    assert_eq!(llm.recorded_calls().len(), 2);
}

#[tokio::test]
async fn fetch_failure_feeds_error_text_to_the_model() {
    let arguments = json!({"resource_type": "Patient", "params": {}}).to_string();
    let llm = MockLlmClient::new()
        .with_tool_call("call_1", SEARCH_FHIR_TOOL, &arguments)
        .with_text("could not reach the server");

    // No base URL configured: the tool round still completes, with the
    // failure text as the tool result.
    let answer = resolve(&llm, None, &prompt(true)).await;

    assert_eq!(answer, "could not reach the server");
    let calls = llm.recorded_calls();
    let tool_message = &calls[1].messages[3];
    assert!(tool_message
        .content
        .as_deref()
        .unwrap_or_default()
        .contains("no data-server URL configured"));
}

#[tokio::test]
async fn unparseable_tool_arguments_become_the_tool_result() {
    let llm = MockLlmClient::new()
        .with_tool_call("call_1", SEARCH_FHIR_TOOL, "not json at all")
        .with_text("done");

    let answer = resolve(&llm, None, &prompt(true)).await;

    assert_eq!(answer, "done");
    let calls = llm.recorded_calls();
    let tool_message = &calls[1].messages[3];
    assert!(tool_message
        .content
        .as_deref()
        .unwrap_or_default()
        .contains("could not parse tool arguments"));
}

#[tokio::test]
async fn llm_failure_is_reported_not_raised() {
    let answer = resolve(&FailingLlmClient, None, &prompt(false)).await;
    assert!(answer.contains("simulated LLM outage"));
}
