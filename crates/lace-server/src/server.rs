use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, HeaderName, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use lace_core::events::{AgentState, LaceEvent, StreamEvent};
use lace_core::ids::{ProjectId, SessionId, ThreadId};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::agents::AgentRuns;
use crate::config::ServerConfig;
use crate::error::StreamError;
use crate::manager::{EventStreamManager, Subscription};
use crate::sink::ChannelSink;
use crate::stream::ConnectionStream;

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    pub manager: Arc<EventStreamManager>,
    pub agents: Arc<AgentRuns>,
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/events/stream", get(stream_events))
        .route("/api/agents/{agent_id}/stop", post(stop_agent))
        .route("/health", get(health_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Bind and serve. Returns a handle that keeps the server running.
pub async fn start(
    config: ServerConfig,
    manager: Arc<EventStreamManager>,
    agents: Arc<AgentRuns>,
) -> Result<ServerHandle, std::io::Error> {
    let listener = tokio::net::TcpListener::bind(config.bind_addr()).await?;
    let local_addr = listener.local_addr()?;

    let state = AppState {
        config: Arc::new(config),
        manager: Arc::clone(&manager),
        agents,
    };
    let router = build_router(state);

    let shutdown = CancellationToken::new();
    let server_shutdown = shutdown.clone();
    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router)
            .with_graceful_shutdown(server_shutdown.cancelled_owned())
            .await
        {
            tracing::error!(error = %e, "Lace server exited with error");
        }
    });

    tracing::info!(addr = %local_addr, "Lace server started");

    Ok(ServerHandle {
        local_addr,
        manager,
        shutdown,
        server,
    })
}

/// Handle returned by `start()`.
pub struct ServerHandle {
    pub local_addr: SocketAddr,
    manager: Arc<EventStreamManager>,
    shutdown: CancellationToken,
    server: tokio::task::JoinHandle<()>,
}

impl ServerHandle {
    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Stop accepting requests, end every open event stream and wait for the
    /// server task.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        // Open SSE bodies never finish on their own.
        self.manager.cleanup();
        if let Err(e) = self.server.await {
            tracing::warn!(error = %e, "Server task did not shut down cleanly");
        }
        tracing::info!("Lace server stopped");
    }
}

/// Comma-separated subscription lists, e.g. `?sessions=a,b&threads=a.1`.
#[derive(Debug, Default, Deserialize)]
struct StreamQuery {
    sessions: Option<String>,
    projects: Option<String>,
    threads: Option<String>,
}

impl StreamQuery {
    fn subscription(&self) -> Option<Subscription> {
        let subscription = Subscription {
            sessions: split_list(self.sessions.as_deref(), |s| SessionId::from_raw(s)),
            projects: split_list(self.projects.as_deref(), |s| ProjectId::from_raw(s)),
            threads: split_list(self.threads.as_deref(), |s| ThreadId::from_raw(s)),
        };
        (!subscription.is_empty()).then_some(subscription)
    }
}

fn split_list<T>(raw: Option<&str>, make: impl Fn(&str) -> T) -> Vec<T> {
    raw.map(|s| {
        s.split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(&make)
            .collect()
    })
    .unwrap_or_default()
}

async fn stream_events(
    State(state): State<AppState>,
    Query(query): Query<StreamQuery>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let last_event_id = headers
        .get("last-event-id")
        .and_then(|v| v.to_str().ok());

    let (sink, rx) = ChannelSink::channel(state.config.connection_queue());
    let connection_id =
        state
            .manager
            .resume_connection(Box::new(sink), query.subscription(), last_event_id)?;

    let body = ConnectionStream::new(
        rx,
        state.config.heartbeat,
        Arc::clone(&state.manager),
        connection_id,
    );

    Ok((
        [
            (header::CONTENT_TYPE, "text/event-stream"),
            (header::CACHE_CONTROL, "no-cache"),
            (header::CONNECTION, "keep-alive"),
            (HeaderName::from_static("x-accel-buffering"), "no"),
        ],
        Body::from_stream(body),
    )
        .into_response())
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StopResponse {
    success: bool,
    stopped: bool,
    agent_id: String,
    message: String,
}

async fn stop_agent(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
) -> Result<Json<StopResponse>, ApiError> {
    let agent_id = ThreadId::from_raw(agent_id.trim());
    if agent_id.session_id().is_none() {
        return Err(ApiError::bad_request(format!(
            "invalid agent id '{agent_id}', expected <sessionId>.<n>"
        )));
    }

    let stopped = state.agents.stop(&agent_id);
    if stopped {
        state.manager.broadcast(&StreamEvent::for_thread(LaceEvent::agent_state_change(
            agent_id.clone(),
            AgentState::Streaming,
            AgentState::Idle,
        )));
    }

    let message = if stopped {
        "Agent response stopped"
    } else {
        "No response in progress"
    };
    Ok(Json(StopResponse {
        success: true,
        stopped,
        agent_id: agent_id.to_string(),
        message: message.into(),
    }))
}

/// Health check HTTP endpoint.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "connections": state.manager.connection_count(),
        "runningAgents": state.agents.running_count(),
        "metrics": state.manager.metrics().snapshot(),
    }))
}

#[derive(Debug, Clone)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

impl From<StreamError> for ApiError {
    fn from(e: StreamError) -> Self {
        let status = match e {
            StreamError::CapacityExceeded { .. } => StatusCode::SERVICE_UNAVAILABLE,
            StreamError::Sink(_) | StreamError::Serialization(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        Self {
            status,
            message: e.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::ManagerConfig;
    use futures::StreamExt;
    use lace_core::events::MessageContent;
    use lace_telemetry::MetricsRecorder;
    use std::time::Duration;

    async fn spawn_server(config: ServerConfig) -> (ServerHandle, Arc<EventStreamManager>, Arc<AgentRuns>) {
        let manager = Arc::new(EventStreamManager::new(
            config.manager_config(),
            Arc::new(MetricsRecorder::new()),
        ));
        let agents = Arc::new(AgentRuns::new());
        let config = ServerConfig {
            host: "127.0.0.1".into(),
            port: 0,
            ..config
        };
        let handle = start(config, Arc::clone(&manager), Arc::clone(&agents))
            .await
            .unwrap();
        (handle, manager, agents)
    }

    /// Read until one complete `\n\n`-terminated frame is buffered.
    async fn next_frame<S>(stream: &mut S, buf: &mut String) -> String
    where
        S: futures::Stream<Item = reqwest::Result<bytes::Bytes>> + Unpin,
    {
        loop {
            if let Some(idx) = buf.find("\n\n") {
                let frame = buf[..idx + 2].to_string();
                buf.drain(..idx + 2);
                return frame;
            }
            let chunk = tokio::time::timeout(Duration::from_secs(2), stream.next())
                .await
                .expect("timed out waiting for SSE frame")
                .expect("SSE stream ended unexpectedly")
                .unwrap();
            buf.push_str(std::str::from_utf8(&chunk).unwrap());
        }
    }

    async fn wait_for_connections(manager: &EventStreamManager, n: usize) {
        for _ in 0..300 {
            if manager.connection_count() == n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("expected {n} connections, have {}", manager.connection_count());
    }

    fn agent_message(session: &str, content: &str) -> StreamEvent {
        StreamEvent::session(
            SessionId::from_raw(session),
            LaceEvent::AgentMessage {
                thread_id: ThreadId::from_raw(format!("{session}.1")),
                timestamp: chrono::Utc::now(),
                data: MessageContent {
                    content: content.into(),
                },
            },
        )
    }

    #[tokio::test]
    async fn stream_endpoint_sends_confirmation_then_events() {
        // Short heartbeat so the server notices the client hanging up.
        let (handle, manager, _) = spawn_server(ServerConfig {
            heartbeat: Duration::from_millis(50),
            ..Default::default()
        })
        .await;
        let url = format!("http://{}/api/events/stream?sessions=s1", handle.local_addr);

        let resp = reqwest::get(&url).await.unwrap();
        assert_eq!(resp.status(), 200);
        assert_eq!(
            resp.headers()["content-type"].to_str().unwrap(),
            "text/event-stream"
        );

        let mut stream = resp.bytes_stream();
        let mut buf = String::new();
        let confirmation = next_frame(&mut stream, &mut buf).await;
        assert!(confirmation.contains("\"type\":\"connection\""));

        let ids = manager.connection_ids();
        assert_eq!(ids.len(), 1);
        assert!(confirmation.contains(ids[0].as_str()));
        assert_eq!(
            manager.subscription(&ids[0]).unwrap().sessions,
            vec![SessionId::from_raw("s1")]
        );

        manager.broadcast(&agent_message("s1", "hello over http"));
        let event = next_frame(&mut stream, &mut buf).await;
        assert!(event.starts_with("id: "));
        assert!(event.contains("hello over http"));
        assert!(event.contains("\"sessionId\":\"s1\""));

        drop(stream);
        wait_for_connections(&manager, 0).await;
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn stream_endpoint_replays_after_last_event_id() {
        let (handle, manager, _) = spawn_server(ServerConfig::default()).await;
        let first = manager.broadcast(&agent_message("s1", "missed-1")).event_id.unwrap();
        manager.broadcast(&agent_message("s1", "missed-2"));

        let client = reqwest::Client::new();
        let resp = client
            .get(format!("http://{}/api/events/stream", handle.local_addr))
            .header("Last-Event-ID", first.to_string())
            .send()
            .await
            .unwrap();

        let mut stream = resp.bytes_stream();
        let mut buf = String::new();
        next_frame(&mut stream, &mut buf).await;
        let replayed = next_frame(&mut stream, &mut buf).await;
        assert!(replayed.contains("missed-2"));
        assert!(!replayed.contains("missed-1"));

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn stream_endpoint_replays_more_than_send_queue() {
        let (handle, manager, _) = spawn_server(ServerConfig {
            send_queue: 4,
            replay_buffer: 20,
            ..Default::default()
        })
        .await;
        for i in 0..20 {
            manager.broadcast(&agent_message("s1", &format!("backlog-{i}")));
        }

        let client = reqwest::Client::new();
        let resp = client
            .get(format!("http://{}/api/events/stream", handle.local_addr))
            .header("Last-Event-ID", "0-0")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);

        let mut stream = resp.bytes_stream();
        let mut buf = String::new();
        next_frame(&mut stream, &mut buf).await;
        for i in 0..20 {
            let frame = next_frame(&mut stream, &mut buf).await;
            assert!(frame.contains(&format!("\"backlog-{i}\"")), "frame {i}: {frame}");
        }

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn stream_endpoint_rejects_over_capacity() {
        let (handle, manager, _) = spawn_server(ServerConfig {
            max_connections: 1,
            ..Default::default()
        })
        .await;
        let url = format!("http://{}/api/events/stream", handle.local_addr);

        let first = reqwest::get(&url).await.unwrap();
        assert_eq!(first.status(), 200);
        wait_for_connections(&manager, 1).await;

        let second = reqwest::get(&url).await.unwrap();
        assert_eq!(second.status(), 503);
        let body: serde_json::Value = second.json().await.unwrap();
        assert!(body["error"].as_str().unwrap().contains("limit"));

        drop(first);
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn stop_running_agent_broadcasts_state_change() {
        let (handle, manager, agents) = spawn_server(ServerConfig::default()).await;
        let agent = ThreadId::from_raw("s1.2");
        let token = agents.begin(agent.clone());

        let resp = reqwest::Client::new()
            .post(format!("http://{}/api/agents/s1.2/stop", handle.local_addr))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["success"], true);
        assert_eq!(body["stopped"], true);
        assert_eq!(body["agentId"], "s1.2");
        assert!(token.is_cancelled());
        assert_eq!(manager.metrics().counter_get("sse.broadcasts"), 1);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn stop_idle_agent_reports_not_stopped() {
        let (handle, _, _) = spawn_server(ServerConfig::default()).await;
        let resp = reqwest::Client::new()
            .post(format!("http://{}/api/agents/s1.1/stop", handle.local_addr))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["stopped"], false);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn stop_with_malformed_agent_id_is_bad_request() {
        let (handle, _, _) = spawn_server(ServerConfig::default()).await;
        let resp = reqwest::Client::new()
            .post(format!("http://{}/api/agents/not-an-agent/stop", handle.local_addr))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);
        let body: serde_json::Value = resp.json().await.unwrap();
        assert!(body["error"].is_string());

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn health_reports_connections_and_metrics() {
        let (handle, manager, _) = spawn_server(ServerConfig::default()).await;
        manager.broadcast(&agent_message("s1", "counted"));

        let body: serde_json::Value = reqwest::get(format!("http://{}/health", handle.local_addr))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["status"], "ok");
        assert_eq!(body["connections"], 0);
        assert_eq!(body["metrics"]["counters"]["sse.broadcasts"], 1);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_ends_open_streams() {
        let (handle, manager, _) = spawn_server(ServerConfig::default()).await;
        let resp = reqwest::get(format!("http://{}/api/events/stream", handle.local_addr))
            .await
            .unwrap();
        let mut stream = resp.bytes_stream();
        let mut buf = String::new();
        next_frame(&mut stream, &mut buf).await;

        handle.shutdown().await;
        assert_eq!(manager.connection_count(), 0);

        let rest = tokio::time::timeout(Duration::from_secs(2), async {
            while let Some(Ok(_)) = stream.next().await {}
        })
        .await;
        assert!(rest.is_ok(), "stream should end after shutdown");
    }

    #[test]
    fn query_parses_comma_lists() {
        let query = StreamQuery {
            sessions: Some("a, b,,".into()),
            projects: None,
            threads: Some("a.1".into()),
        };
        let subscription = query.subscription().unwrap();
        assert_eq!(
            subscription.sessions,
            vec![SessionId::from_raw("a"), SessionId::from_raw("b")]
        );
        assert!(subscription.projects.is_empty());
        assert_eq!(subscription.threads, vec![ThreadId::from_raw("a.1")]);

        assert!(StreamQuery::default().subscription().is_none());
    }

    #[test]
    fn build_router_creates_routes() {
        let state = AppState {
            config: Arc::new(ServerConfig::default()),
            manager: Arc::new(EventStreamManager::new(
                ManagerConfig::default(),
                Arc::new(MetricsRecorder::new()),
            )),
            agents: Arc::new(AgentRuns::new()),
        };
        let _router = build_router(state);
    }
}
