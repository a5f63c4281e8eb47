//! Thin HTTP transport: agent card plus non-streaming JSON-RPC
//! `message/send`. All agent logic lives behind `Agent::handle`; this
//! module only frames requests and responses.

use anyhow::{Context, Result};
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::agent::{Agent, CollectingSink};
use crate::config::AgentConfig;
use crate::types::{Message, Task, TaskState, TaskStatus};

#[derive(Debug, Deserialize)]
struct RpcRequest {
    #[serde(default)]
    id: Value,
    method: String,
    #[serde(default)]
    params: Value,
}

#[derive(Debug, Deserialize)]
struct SendParams {
    message: Message,
}

/// Runs the HTTP server until the process is stopped.
pub async fn run_server(agent: Arc<Agent>, config: &AgentConfig) -> Result<()> {
    let addr: SocketAddr = format!("{}:{}", config.server.bind_address, config.server.port)
        .parse()
        .context("Invalid bind address")?;
    let card = Arc::new(agent_card(config));

    let make_svc = make_service_fn(move |_conn| {
        let agent = agent.clone();
        let card = card.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req| {
                handle_request(agent.clone(), card.clone(), req)
            }))
        }
    });

    info!(%addr, "Agent listening.");
    Server::bind(&addr)
        .serve(make_svc)
        .await
        .context("Server error")
}

async fn handle_request(
    agent: Arc<Agent>,
    card: Arc<Value>,
    req: Request<Body>,
) -> Result<Response<Body>, Infallible> {
    let response = match (req.method(), req.uri().path()) {
        (&Method::GET, "/.well-known/agent-card.json") => json_response(StatusCode::OK, &card),
        (&Method::POST, "/") => handle_rpc(agent, req).await,
        _ => {
            debug!(path = req.uri().path(), "No route matched.");
            plain_response(StatusCode::NOT_FOUND, "Not found")
        }
    };
    Ok(response)
}

async fn handle_rpc(agent: Arc<Agent>, req: Request<Body>) -> Response<Body> {
    let body = match hyper::body::to_bytes(req.into_body()).await {
        Ok(body) => body,
        Err(e) => {
            warn!(error = %e, "Failed to read request body.");
            return rpc_error(Value::Null, -32700, "Could not read request body");
        }
    };

    let rpc: RpcRequest = match serde_json::from_slice(&body) {
        Ok(rpc) => rpc,
        Err(e) => {
            warn!(error = %e, "Request body is not a JSON-RPC request.");
            return rpc_error(Value::Null, -32700, "Parse error");
        }
    };

    match rpc.method.as_str() {
        "message/send" => {
            let params: SendParams = match serde_json::from_value(rpc.params) {
                Ok(params) => params,
                Err(e) => {
                    warn!(error = %e, "message/send params did not validate.");
                    return rpc_error(rpc.id, -32602, "Invalid params: expected a message");
                }
            };
            let task = run_task(&agent, params.message).await;
            match serde_json::to_value(&task) {
                Ok(result) => rpc_result(rpc.id, result),
                Err(e) => {
                    error!(error = %e, "Failed to serialize task.");
                    rpc_error(rpc.id, -32603, "Internal error")
                }
            }
        }
        other => {
            debug!(method = other, "Unknown JSON-RPC method.");
            rpc_error(rpc.id, -32601, "Method not found")
        }
    }
}

/// Runs one message through the agent and wraps the collected updates
/// into a completed task.
async fn run_task(agent: &Agent, message: Message) -> Task {
    let sink = CollectingSink::new();
    agent.handle(&message, &sink).await;

    let last_status_message = sink.statuses().into_iter().last().map(|(_, m)| m);
    Task {
        id: Uuid::new_v4().to_string(),
        context_id: message.context_id.clone(),
        status: TaskStatus::now(TaskState::Completed, last_status_message),
        artifacts: Some(sink.artifacts()),
    }
}

fn agent_card(config: &AgentConfig) -> Value {
    json!({
        "name": config.display_name(),
        "description": "Benchmark agent answering medical-record instructions against a FHIR server",
        "url": format!("http://{}:{}/", config.server.bind_address, config.server.port),
        "version": env!("CARGO_PKG_VERSION"),
        "capabilities": {
            "streaming": false,
            "pushNotifications": false,
            "stateTransitionHistory": false
        },
        "defaultInputModes": ["text"],
        "defaultOutputModes": ["text"]
    })
}

fn rpc_result(id: Value, result: Value) -> Response<Body> {
    json_response(
        StatusCode::OK,
        &json!({"jsonrpc": "2.0", "id": id, "result": result}),
    )
}

fn rpc_error(id: Value, code: i32, message: &str) -> Response<Body> {
    json_response(
        StatusCode::OK,
        &json!({"jsonrpc": "2.0", "id": id, "error": {"code": code, "message": message}}),
    )
}

fn json_response(status: StatusCode, body: &Value) -> Response<Body> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap_or_else(|_| Response::new(Body::from("{}")))
}

fn plain_response(status: StatusCode, body: &'static str) -> Response<Body> {
    Response::builder()
        .status(status)
        .body(Body::from(body))
        .unwrap_or_else(|_| Response::new(Body::from(body)))
}
