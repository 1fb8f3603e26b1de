//! Parallel fan-out dispatch: ephemeral team in, per-agent outcomes out.
//!
//! The team exists only for the duration of the run and is torn down
//! unconditionally, even when every call fails.

use crate::adapter::AgentAdapter;
use crate::bus::MessageBus;
use crate::error::Result;
use crate::state::{AgentSpec, TeamStore};

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Per-call timeout inside a dispatch run.
pub const DISPATCH_CALL_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// One agent of a dispatch run and the task it executes.
#[derive(Debug, Clone, Deserialize, schemars::JsonSchema)]
pub struct DispatchSpec {
    #[serde(flatten)]
    pub agent: AgentSpec,
    pub task: String,
}

/// Outcome of one dispatched agent.
#[derive(Debug, Clone, Serialize)]
pub struct DispatchOutcome {
    pub agent_id: String,
    pub role: String,
    pub success: bool,
    /// The agent's output on success, the error message otherwise.
    pub output: String,
}

/// Run every spec to completion in parallel, then destroy the team.
pub async fn dispatch(
    store: &Arc<TeamStore>,
    bus: &Arc<MessageBus>,
    adapter: &Arc<AgentAdapter>,
    team_name: &str,
    work_dir: &PathBuf,
    specs: Vec<DispatchSpec>,
) -> Result<Vec<DispatchOutcome>> {
    let team = store.create_team(team_name, Vec::new())?;

    // Add agents one by one so each task stays paired with the agent built
    // from its own spec, even when roles repeat. Bad specs become failed
    // outcomes without aborting the rest of the run.
    let mut rejected = Vec::new();
    let mut assignments = Vec::with_capacity(specs.len());
    for mut spec in specs {
        if spec.agent.working_dir.is_none() {
            spec.agent.working_dir = Some(work_dir.clone());
        }
        let role = spec.agent.role.clone();
        match store.add_agent(&team.id, spec.agent) {
            Ok(agent) => assignments.push((agent.id, agent.role, spec.task)),
            Err(error) => rejected.push(DispatchOutcome {
                agent_id: String::new(),
                role,
                success: false,
                output: error.to_string(),
            }),
        }
    }

    let calls = assignments.into_iter().map(|(agent_id, role, task)| {
        let adapter = adapter.clone();
        async move {
            let cancel = CancellationToken::new();
            let timer = {
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(DISPATCH_CALL_TIMEOUT).await;
                    cancel.cancel();
                })
            };
            let result = adapter.send(&agent_id, &task, Some(cancel)).await;
            timer.abort();

            match result {
                Ok(output) => DispatchOutcome {
                    agent_id,
                    role,
                    success: true,
                    output,
                },
                Err(error) => DispatchOutcome {
                    agent_id,
                    role,
                    success: false,
                    output: error.to_string(),
                },
            }
        }
    });

    let mut outcomes = join_all(calls).await;
    outcomes.extend(rejected);

    // Unconditional teardown, even on total failure.
    match store.dissolve_team(&team.id) {
        Ok(members) => bus.dissolve_team(&team.id, &members),
        Err(error) => tracing::warn!(%error, team_id = %team.id, "dispatch team already gone"),
    }

    Ok(outcomes)
}
