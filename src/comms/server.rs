//! HTTP layer of the comms service.
//!
//! Binds a loopback listener on an ephemeral port and serves a JSON
//! request/response envelope on `POST /mcp`. The handshake URL carries the
//! agent id and identity token; `initialize` mints a sticky session id that
//! subsequent requests echo in the `Mcp-Session-Id` header.

use crate::adapter::IdentityTokens;
use crate::bus::MessageBus;
use crate::comms::service::{
    AgentSession, DmReadParams, DmSendParams, ShareParams, TextParams, WaitParams,
};
use crate::error::{CommsError, Error, Result};
use crate::state::TeamStore;
use crate::AgentId;

use axum::Router;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use serde::Deserialize;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Header echoing the session id after the handshake.
pub const SESSION_HEADER: &str = "mcp-session-id";

/// Shared state behind the comms router.
pub struct CommsState {
    store: Arc<TeamStore>,
    bus: Arc<MessageBus>,
    tokens: Arc<IdentityTokens>,
    sessions: Mutex<HashMap<String, AgentId>>,
}

impl CommsState {
    pub fn new(store: Arc<TeamStore>, bus: Arc<MessageBus>, tokens: Arc<IdentityTokens>) -> Self {
        Self {
            store,
            bus,
            tokens,
            sessions: Mutex::new(HashMap::new()),
        }
    }
}

/// Handshake credentials from the session initialization URL.
#[derive(Debug, Default, Deserialize)]
pub struct AuthQuery {
    #[serde(default)]
    pub agent: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
}

/// One request in the comms envelope.
#[derive(Debug, Deserialize)]
pub struct RpcRequest {
    #[serde(default)]
    pub id: Value,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

/// A running comms listener.
pub struct CommsServer {
    pub url: String,
    shutdown_tx: tokio::sync::watch::Sender<bool>,
    handle: tokio::task::JoinHandle<()>,
}

impl CommsServer {
    /// Stop accepting sessions and drain in-flight requests.
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(error) = self.handle.await {
            tracing::warn!(%error, "comms server task ended abnormally");
        }
    }
}

/// Bind `127.0.0.1:0` and start serving the comms envelope.
pub async fn start_comms_server(state: Arc<CommsState>) -> Result<CommsServer> {
    let router = Router::new()
        .route("/mcp", post(mcp_endpoint))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let url = format!("http://{addr}/mcp");

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let handle = tokio::spawn(async move {
        let mut shutdown = shutdown_rx;
        if let Err(error) = axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                let _ = shutdown.wait_for(|stop| *stop).await;
            })
            .await
        {
            tracing::error!(%error, "comms server exited with error");
        }
    });

    tracing::info!(%url, "comms service listening");
    Ok(CommsServer {
        url,
        shutdown_tx,
        handle,
    })
}

pub async fn mcp_endpoint(
    State(state): State<Arc<CommsState>>,
    Query(auth): Query<AuthQuery>,
    headers: HeaderMap,
    axum::Json(request): axum::Json<RpcRequest>,
) -> Response {
    let (Some(agent_id), Some(token)) = (auth.agent, auth.token) else {
        return handshake_failure(StatusCode::UNAUTHORIZED, CommsError::Unauthenticated, &request.id);
    };
    if !state.tokens.verify(&agent_id, &token) {
        return handshake_failure(
            StatusCode::FORBIDDEN,
            CommsError::Forbidden(agent_id),
            &request.id,
        );
    }

    if request.method == "initialize" {
        let session_id = uuid::Uuid::new_v4().to_string();
        {
            let mut sessions = state.sessions.lock().expect("session lock poisoned");
            sessions.insert(session_id.clone(), agent_id.clone());
        }
        tracing::debug!(agent_id, session_id, "comms session initialized");
        return (
            StatusCode::OK,
            [(SESSION_HEADER, session_id.clone())],
            axum::Json(json!({
                "id": request.id,
                "result": { "session": session_id, "agent": agent_id },
            })),
        )
            .into_response();
    }

    // Non-handshake requests must echo a known session bound to the same
    // identity the URL authenticated.
    let session_id = headers
        .get(SESSION_HEADER)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string();
    let bound_agent = {
        let sessions = state.sessions.lock().expect("session lock poisoned");
        sessions.get(&session_id).cloned()
    };
    let Some(bound_agent) = bound_agent else {
        return handshake_failure(
            StatusCode::UNAUTHORIZED,
            CommsError::UnknownSession(session_id),
            &request.id,
        );
    };
    if bound_agent != agent_id {
        return handshake_failure(
            StatusCode::FORBIDDEN,
            CommsError::Forbidden(agent_id),
            &request.id,
        );
    }

    let session = AgentSession {
        agent_id: bound_agent,
        store: state.store.clone(),
        bus: state.bus.clone(),
    };
    match dispatch(&session, &request.method, request.params).await {
        Ok(result) => (
            StatusCode::OK,
            axum::Json(json!({ "id": request.id, "result": result })),
        )
            .into_response(),
        Err(error) => (
            StatusCode::OK,
            axum::Json(json!({
                "id": request.id,
                "error": { "kind": error.kind(), "message": error.to_string() },
            })),
        )
            .into_response(),
    }
}

async fn dispatch(session: &AgentSession, method: &str, params: Value) -> Result<Value> {
    let params = if params.is_null() { json!({}) } else { params };
    match method {
        "group_post" => session.group_post(parse::<TextParams>(params)?),
        "group_read" => session.group_read(),
        "group_peek" => session.group_peek(),
        "dm_send" => session.dm_send(parse::<DmSendParams>(params)?),
        "dm_read" => session.dm_read(parse::<DmReadParams>(params)?),
        "dm_peek" => session.dm_peek(),
        "lead_post" => session.lead_post(parse::<TextParams>(params)?),
        "lead_read" => session.lead_read(),
        "lead_peek" => session.lead_peek(),
        "share" => session.share(parse::<ShareParams>(params)?),
        "get_shared" => session.get_shared(),
        "get_team_context" => session.get_team_context(),
        "wait" => session.wait(parse::<WaitParams>(params)?).await,
        other => Err(CommsError::UnknownMethod(other.to_string()).into()),
    }
}

fn parse<T: serde::de::DeserializeOwned>(params: Value) -> Result<T> {
    serde_json::from_value(params)
        .map_err(|error| CommsError::InvalidParams(error.to_string()).into())
}

fn handshake_failure(status: StatusCode, error: CommsError, id: &Value) -> Response {
    let error: Error = error.into();
    (
        status,
        axum::Json(json!({
            "id": id,
            "error": { "kind": error.kind(), "message": error.to_string() },
        })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::AgentSpec;

    async fn body_json(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body bytes");
        serde_json::from_slice(&bytes).expect("body is JSON")
    }

    fn request(method: &str, params: Value) -> axum::Json<RpcRequest> {
        axum::Json(RpcRequest {
            id: json!(1),
            method: method.to_string(),
            params,
        })
    }

    struct Fixture {
        state: Arc<CommsState>,
        agent_id: String,
        token: String,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(TeamStore::new());
        let bus = Arc::new(MessageBus::new());
        let tokens = Arc::new(IdentityTokens::default());
        let team = store
            .create_team(
                "alpha",
                vec![AgentSpec {
                    role: "dev".to_string(),
                    ..Default::default()
                }],
            )
            .expect("team created");
        let agent_id = team.roster()[0].id.clone();
        let token = tokens.mint(&agent_id);
        Fixture {
            state: Arc::new(CommsState::new(store, bus, tokens)),
            agent_id,
            token,
        }
    }

    fn auth(fixture: &Fixture) -> Query<AuthQuery> {
        Query(AuthQuery {
            agent: Some(fixture.agent_id.clone()),
            token: Some(fixture.token.clone()),
        })
    }

    async fn handshake(fixture: &Fixture) -> String {
        let response = mcp_endpoint(
            State(fixture.state.clone()),
            auth(fixture),
            HeaderMap::new(),
            request("initialize", Value::Null),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        let header = response
            .headers()
            .get(SESSION_HEADER)
            .expect("session header")
            .to_str()
            .expect("header is ascii")
            .to_string();
        let body = body_json(response).await;
        assert_eq!(body["result"]["session"].as_str(), Some(header.as_str()));
        header
    }

    #[tokio::test]
    async fn missing_credentials_are_unauthenticated() {
        let fixture = fixture();
        let response = mcp_endpoint(
            State(fixture.state.clone()),
            Query(AuthQuery::default()),
            HeaderMap::new(),
            request("initialize", Value::Null),
        )
        .await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let body = body_json(response).await;
        assert_eq!(body["error"]["kind"], "unauthenticated");
    }

    #[tokio::test]
    async fn wrong_token_is_forbidden() {
        let fixture = fixture();
        let response = mcp_endpoint(
            State(fixture.state.clone()),
            Query(AuthQuery {
                agent: Some(fixture.agent_id.clone()),
                token: Some("bogus".to_string()),
            }),
            HeaderMap::new(),
            request("initialize", Value::Null),
        )
        .await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        let body = body_json(response).await;
        assert_eq!(body["error"]["kind"], "forbidden");
    }

    #[tokio::test]
    async fn handshake_then_operations_round_trip() {
        let fixture = fixture();
        let session_id = handshake(&fixture).await;

        let mut headers = HeaderMap::new();
        headers.insert(SESSION_HEADER, session_id.parse().expect("header value"));

        let response = mcp_endpoint(
            State(fixture.state.clone()),
            auth(&fixture),
            headers.clone(),
            request("group_post", json!({ "text": "hello team" })),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["result"]["posted"], true);

        let response = mcp_endpoint(
            State(fixture.state.clone()),
            auth(&fixture),
            headers,
            request("group_peek", Value::Null),
        )
        .await;
        let body = body_json(response).await;
        // Own posts are never counted.
        assert_eq!(body["result"]["count"], 0);
    }

    #[tokio::test]
    async fn operations_without_a_session_are_rejected() {
        let fixture = fixture();
        let response = mcp_endpoint(
            State(fixture.state.clone()),
            auth(&fixture),
            HeaderMap::new(),
            request("group_read", Value::Null),
        )
        .await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn unknown_method_is_an_envelope_error() {
        let fixture = fixture();
        let session_id = handshake(&fixture).await;
        let mut headers = HeaderMap::new();
        headers.insert(SESSION_HEADER, session_id.parse().expect("header value"));

        let response = mcp_endpoint(
            State(fixture.state.clone()),
            auth(&fixture),
            headers,
            request("group_shout", Value::Null),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["error"]["kind"], "invalid_argument");
        assert!(
            body["error"]["message"]
                .as_str()
                .expect("message")
                .contains("group_shout")
        );
    }

    #[tokio::test]
    async fn listener_binds_ephemeral_loopback_port() {
        let fixture = fixture();
        let server = start_comms_server(fixture.state.clone())
            .await
            .expect("server starts");
        assert!(server.url.starts_with("http://127.0.0.1:"));
        assert!(server.url.ends_with("/mcp"));
        server.stop().await;
    }
}
