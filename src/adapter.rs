//! Downstream agent-call adapter.
//!
//! One long-lived child-process session is multiplexed across every agent in
//! the process. Calls targeting the same agent are strictly serialized by a
//! per-agent lock; calls for different agents run concurrently. The adapter
//! owns continuation handles, identity tokens, cancellation, the call
//! deadline, and the single coalesced reconnect.

pub mod mock;
pub mod session;

pub use mock::MockBackend;
pub use session::{CodexBackend, DownstreamConfig};

use crate::error::{AdapterError, Result};
use crate::instructions;
use crate::state::TeamStore;
use crate::{AgentId, AgentStatus, ApprovalPolicy, ReasoningEffort, SandboxMode};

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Upper bound on a single downstream call.
pub const CALL_DEADLINE: Duration = Duration::from_secs(3 * 60 * 60);

/// First call for an agent: opens a new downstream conversation thread.
#[derive(Debug, Clone)]
pub struct StartTurn {
    pub prompt: String,
    pub instructions: String,
    pub model: String,
    pub sandbox: SandboxMode,
    pub approval: ApprovalPolicy,
    pub reasoning_effort: ReasoningEffort,
    pub cwd: PathBuf,
    /// Comms service URL with the agent id and identity token in the query,
    /// handed to the downstream as an MCP server entry.
    pub comms_url: Option<String>,
}

/// Follow-up call against an existing conversation thread.
#[derive(Debug, Clone)]
pub struct ReplyTurn {
    pub prompt: String,
    pub continuation: String,
}

/// One request to the downstream session.
#[derive(Debug, Clone)]
pub enum TurnRequest {
    Start(StartTurn),
    Reply(ReplyTurn),
}

impl TurnRequest {
    pub fn prompt(&self) -> &str {
        match self {
            TurnRequest::Start(turn) => &turn.prompt,
            TurnRequest::Reply(turn) => &turn.prompt,
        }
    }
}

/// What the downstream produced for one turn.
#[derive(Debug, Clone)]
pub struct TurnOutput {
    /// Continuation handle for follow-up turns. `None` on replies that keep
    /// the existing thread.
    pub continuation: Option<String>,
    pub text: String,
}

/// The downstream session contract. Implemented by [`CodexBackend`] over the
/// child process and by [`MockBackend`] in tests.
#[async_trait::async_trait]
pub trait DownstreamBackend: Send + Sync {
    async fn call(&self, request: TurnRequest) -> std::result::Result<TurnOutput, AdapterError>;

    /// Tear down any existing session and establish a fresh one.
    async fn reconnect(&self) -> std::result::Result<(), AdapterError>;

    async fn is_connected(&self) -> bool;

    async fn close(&self);
}

/// Per-agent secrets gating comms service sessions. Minted on the agent's
/// first downstream call and stable for its lifetime.
#[derive(Default)]
pub struct IdentityTokens {
    tokens: Mutex<HashMap<AgentId, String>>,
}

impl IdentityTokens {
    pub fn mint(&self, agent_id: &str) -> String {
        use rand::Rng as _;
        let mut tokens = self.tokens.lock().expect("token lock poisoned");
        tokens
            .entry(agent_id.to_string())
            .or_insert_with(|| {
                let mut rng = rand::rng();
                (0..32)
                    .map(|_| char::from_digit(rng.random_range(0..16), 16).unwrap_or('0'))
                    .collect()
            })
            .clone()
    }

    /// True iff a token has been minted for the agent and matches.
    pub fn verify(&self, agent_id: &str, token: &str) -> bool {
        let tokens = self.tokens.lock().expect("token lock poisoned");
        tokens.get(agent_id).is_some_and(|minted| minted == token)
    }
}

/// The multiplexing adapter in front of the downstream session.
pub struct AgentAdapter {
    backend: Arc<dyn DownstreamBackend>,
    store: Arc<TeamStore>,
    tokens: Arc<IdentityTokens>,
    locks: Mutex<HashMap<AgentId, Arc<tokio::sync::Mutex<()>>>>,
    inflight: Mutex<HashMap<AgentId, CancellationToken>>,
    tracker: TaskTracker,
    reconnect_gate: tokio::sync::Mutex<()>,
    comms_url: RwLock<Option<String>>,
    deadline: Duration,
}

impl AgentAdapter {
    pub fn new(backend: Arc<dyn DownstreamBackend>, store: Arc<TeamStore>) -> Self {
        Self {
            backend,
            store,
            tokens: Arc::new(IdentityTokens::default()),
            locks: Mutex::new(HashMap::new()),
            inflight: Mutex::new(HashMap::new()),
            tracker: TaskTracker::new(),
            reconnect_gate: tokio::sync::Mutex::new(()),
            comms_url: RwLock::new(None),
            deadline: CALL_DEADLINE,
        }
    }

    /// Override the per-call deadline. Test hook.
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn identity_tokens(&self) -> Arc<IdentityTokens> {
        self.tokens.clone()
    }

    /// Record the comms service base URL once the HTTP listener is up.
    pub fn set_comms_endpoint(&self, base_url: &str) {
        let mut url = self.comms_url.write().expect("comms url lock poisoned");
        *url = Some(base_url.to_string());
    }

    /// Send one prompt to an agent's conversation, starting a new thread if
    /// the agent has no continuation yet. Serialized per agent.
    pub async fn send(
        &self,
        agent_id: &str,
        prompt: &str,
        cancel: Option<CancellationToken>,
    ) -> Result<String> {
        let lock = self.agent_lock(agent_id);
        let _serial = lock.lock().await;

        let (team_id, agent) = self.store.find_agent(agent_id)?;
        self.store.set_status(agent_id, AgentStatus::Working);

        let token = match cancel {
            Some(external) => external.child_token(),
            None => CancellationToken::new(),
        };
        {
            let mut inflight = self.inflight.lock().expect("inflight lock poisoned");
            inflight.insert(agent_id.to_string(), token.clone());
        }

        let request = match &agent.continuation {
            Some(continuation) => TurnRequest::Reply(ReplyTurn {
                prompt: prompt.to_string(),
                continuation: continuation.clone(),
            }),
            None => {
                let team = self.store.team(&team_id).ok();
                let others = self.store.teams();
                TurnRequest::Start(StartTurn {
                    prompt: prompt.to_string(),
                    instructions: instructions::compose(&agent, team.as_ref(), &others),
                    model: agent.model.clone(),
                    sandbox: agent.sandbox,
                    approval: agent.approval,
                    reasoning_effort: agent.reasoning_effort,
                    cwd: agent.working_dir.clone(),
                    comms_url: self.agent_comms_url(agent_id),
                })
            }
        };

        let result = self.call_with_deadline(request, &token).await;
        {
            let mut inflight = self.inflight.lock().expect("inflight lock poisoned");
            inflight.remove(agent_id);
        }

        match result {
            Ok(output) => {
                if let Some(continuation) = &output.continuation {
                    self.store
                        .set_continuation(agent_id, Some(continuation.clone()));
                }
                self.store.set_status(agent_id, AgentStatus::Idle);
                self.store.set_last_output(agent_id, &output.text);
                Ok(output.text)
            }
            Err(error) => {
                if continuation_was_invalidated(&error) {
                    tracing::debug!(agent_id, "continuation invalidated, forgetting handle");
                    self.store.set_continuation(agent_id, None);
                }
                self.store.set_status(agent_id, AgentStatus::Error);
                self.store.set_last_output(agent_id, &error.to_string());
                Err(error.into())
            }
        }
    }

    /// Abort the agent's in-flight call, if any.
    pub fn cancel(&self, agent_id: &str) -> bool {
        let inflight = self.inflight.lock().expect("inflight lock poisoned");
        match inflight.get(agent_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel every listed agent's in-flight call; returns the ids that
    /// actually had one.
    pub fn cancel_team(&self, agent_ids: &[AgentId]) -> Vec<AgentId> {
        agent_ids
            .iter()
            .filter(|id| self.cancel(id))
            .cloned()
            .collect()
    }

    /// Register a fire-and-forget operation so shutdown can await it.
    pub fn track<F>(&self, operation: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        self.tracker.spawn(operation);
    }

    /// Re-establish the downstream session. Coalesced: concurrent callers
    /// queue on the gate and find the session already healthy.
    pub async fn reconnect(&self) -> std::result::Result<(), AdapterError> {
        let _gate = self.reconnect_gate.lock().await;
        if self.backend.is_connected().await {
            return Ok(());
        }
        tracing::info!("reconnecting downstream session");
        self.backend.reconnect().await
    }

    /// Await tracked operations, then close the downstream session.
    pub async fn shutdown(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.backend.close().await;
    }

    fn agent_lock(&self, agent_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().expect("agent lock map poisoned");
        locks
            .entry(agent_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    fn agent_comms_url(&self, agent_id: &str) -> Option<String> {
        let base = self.comms_url.read().expect("comms url lock poisoned").clone()?;
        let token = self.tokens.mint(agent_id);
        Some(format!(
            "{base}?agent={}&token={}",
            urlencoding::encode(agent_id),
            urlencoding::encode(&token)
        ))
    }

    async fn call_with_deadline(
        &self,
        request: TurnRequest,
        token: &CancellationToken,
    ) -> std::result::Result<TurnOutput, AdapterError> {
        tokio::select! {
            _ = token.cancelled() => Err(AdapterError::Canceled("call aborted".to_string())),
            _ = tokio::time::sleep(self.deadline) => Err(AdapterError::Timeout(self.deadline)),
            result = self.call_once(request) => result,
        }
    }

    /// One backend call, with a single reconnect-and-retry on transport
    /// failure. A second transport failure propagates.
    async fn call_once(
        &self,
        request: TurnRequest,
    ) -> std::result::Result<TurnOutput, AdapterError> {
        if !self.backend.is_connected().await {
            self.reconnect().await?;
        }
        match self.backend.call(request.clone()).await {
            Err(AdapterError::Transport(reason)) => {
                tracing::warn!(%reason, "downstream transport fault, retrying once");
                self.reconnect().await?;
                self.backend.call(request).await
            }
            other => other,
        }
    }
}

/// Heuristic from the downstream contract: a remote error mentioning a
/// missing thread means the continuation is gone and the next call must
/// start fresh.
fn continuation_was_invalidated(error: &AdapterError) -> bool {
    match error {
        AdapterError::Remote(message) => {
            let message = message.to_ascii_lowercase();
            message.contains("thread") || message.contains("not found")
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::AgentSpec;

    fn team_of(store: &TeamStore, roles: &[&str]) -> Vec<AgentId> {
        let specs = roles
            .iter()
            .map(|role| AgentSpec {
                role: role.to_string(),
                ..Default::default()
            })
            .collect();
        let team = store.create_team("adapter-test", specs).expect("team created");
        team.roster().into_iter().map(|agent| agent.id).collect()
    }

    #[tokio::test]
    async fn start_then_reply_carries_continuation() {
        let store = Arc::new(TeamStore::new());
        let ids = team_of(&store, &["dev"]);
        let backend = Arc::new(MockBackend::echo());
        let adapter = AgentAdapter::new(backend.clone(), store.clone());

        let first = adapter.send(&ids[0], "hello", None).await.expect("first turn");
        assert!(first.contains("hello"));
        let second = adapter.send(&ids[0], "again", None).await.expect("second turn");
        assert!(second.contains("again"));

        let calls = backend.recorded();
        assert_eq!(calls.len(), 2);
        assert!(matches!(calls[0], TurnRequest::Start(_)));
        match &calls[1] {
            TurnRequest::Reply(reply) => assert!(!reply.continuation.is_empty()),
            other => panic!("expected reply turn, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn same_agent_calls_are_fifo() {
        let store = Arc::new(TeamStore::new());
        let ids = team_of(&store, &["dev"]);
        let backend = Arc::new(MockBackend::echo().with_delay(Duration::from_millis(30)));
        let adapter = Arc::new(AgentAdapter::new(backend.clone(), store.clone()));

        let mut handles = Vec::new();
        for n in 0..4 {
            let adapter = adapter.clone();
            let id = ids[0].clone();
            handles.push(tokio::spawn(async move {
                adapter.send(&id, &format!("turn-{n}"), None).await
            }));
            // Give each spawned call time to reach the agent lock in order.
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        for handle in handles {
            handle.await.expect("task").expect("send");
        }

        let order = backend
            .recorded()
            .iter()
            .map(|request| request.prompt().to_string())
            .collect::<Vec<_>>();
        assert_eq!(order, vec!["turn-0", "turn-1", "turn-2", "turn-3"]);
    }

    #[tokio::test]
    async fn different_agents_run_concurrently() {
        let store = Arc::new(TeamStore::new());
        let ids = team_of(&store, &["dev", "ops"]);
        let backend = Arc::new(MockBackend::echo().with_delay(Duration::from_millis(150)));
        let adapter = Arc::new(AgentAdapter::new(backend, store));

        let started = std::time::Instant::now();
        let (a, b) = tokio::join!(
            adapter.send(&ids[0], "one", None),
            adapter.send(&ids[1], "two", None),
        );
        a.expect("first agent");
        b.expect("second agent");
        assert!(
            started.elapsed() < Duration::from_millis(290),
            "calls for different agents must overlap, took {:?}",
            started.elapsed()
        );
    }

    #[tokio::test]
    async fn cancel_aborts_inflight_call() {
        let store = Arc::new(TeamStore::new());
        let ids = team_of(&store, &["dev"]);
        let backend = Arc::new(MockBackend::echo().with_delay(Duration::from_secs(60)));
        let adapter = Arc::new(AgentAdapter::new(backend, store.clone()));

        let send = {
            let adapter = adapter.clone();
            let id = ids[0].clone();
            tokio::spawn(async move { adapter.send(&id, "long haul", None).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(adapter.cancel(&ids[0]), "expected an in-flight call");
        let error = send
            .await
            .expect("task")
            .expect_err("canceled call must fail");
        assert_eq!(error.kind(), crate::error::ErrorKind::Canceled);

        let (_, agent) = store.find_agent(&ids[0]).expect("agent exists");
        assert_eq!(agent.status, AgentStatus::Error);
        assert!(agent.last_output.expect("error recorded").contains("aborted"));
        assert!(!adapter.cancel(&ids[0]), "nothing left to cancel");
    }

    #[tokio::test]
    async fn deadline_expiry_returns_timeout() {
        let store = Arc::new(TeamStore::new());
        let ids = team_of(&store, &["dev"]);
        let backend = Arc::new(MockBackend::echo().with_delay(Duration::from_secs(60)));
        let adapter =
            AgentAdapter::new(backend, store).with_deadline(Duration::from_millis(50));

        let error = adapter
            .send(&ids[0], "slow", None)
            .await
            .expect_err("deadline must fire");
        assert_eq!(error.kind(), crate::error::ErrorKind::Timeout);
    }

    #[tokio::test]
    async fn transport_fault_reconnects_once_and_retries() {
        let store = Arc::new(TeamStore::new());
        let ids = team_of(&store, &["dev"]);
        let backend = Arc::new(MockBackend::echo().fail_transport_times(1));
        let adapter = AgentAdapter::new(backend.clone(), store);

        let output = adapter
            .send(&ids[0], "flaky", None)
            .await
            .expect("retry should succeed");
        assert!(output.contains("flaky"));
        assert_eq!(backend.reconnects(), 1);
    }

    #[tokio::test]
    async fn missing_thread_error_forgets_continuation() {
        let store = Arc::new(TeamStore::new());
        let ids = team_of(&store, &["dev"]);
        let backend = Arc::new(MockBackend::echo());
        let adapter = AgentAdapter::new(backend.clone(), store.clone());

        adapter.send(&ids[0], "start", None).await.expect("first turn");
        backend.fail_remote_once("thread abc-123 not found");
        let error = adapter
            .send(&ids[0], "reply", None)
            .await
            .expect_err("remote error propagates");
        assert_eq!(error.kind(), crate::error::ErrorKind::RemoteError);

        adapter.send(&ids[0], "after", None).await.expect("restart");
        let calls = backend.recorded();
        assert!(
            matches!(calls.last(), Some(TurnRequest::Start(_))),
            "call after invalidation must start a fresh thread"
        );
    }

    #[tokio::test]
    async fn start_turn_embeds_identity_in_comms_url() {
        let store = Arc::new(TeamStore::new());
        let ids = team_of(&store, &["dev"]);
        let backend = Arc::new(MockBackend::echo());
        let adapter = AgentAdapter::new(backend.clone(), store);
        adapter.set_comms_endpoint("http://127.0.0.1:9999/mcp");

        adapter.send(&ids[0], "hello", None).await.expect("turn");
        let calls = backend.recorded();
        let TurnRequest::Start(start) = &calls[0] else {
            panic!("expected start turn");
        };
        let url = start.comms_url.as_deref().expect("comms url present");
        assert!(url.starts_with("http://127.0.0.1:9999/mcp?agent="));
        let token = adapter.identity_tokens().mint(&ids[0]);
        assert!(url.ends_with(&format!("&token={token}")));
    }

    #[tokio::test]
    async fn shutdown_waits_for_tracked_operations() {
        let store = Arc::new(TeamStore::new());
        let backend = Arc::new(MockBackend::echo());
        let adapter = AgentAdapter::new(backend, store);

        let flag = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let tracked = flag.clone();
        adapter.track(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            tracked.store(true, std::sync::atomic::Ordering::SeqCst);
        });

        adapter.shutdown().await;
        assert!(flag.load(std::sync::atomic::Ordering::SeqCst));
    }
}
