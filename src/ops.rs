//! Operator-facing operations.
//!
//! Thin, typed wrappers over the state store, message bus, adapter, and the
//! mission/dispatch/steer engines. The external tool layer stringifies these
//! results and maps errors through [`crate::error::ErrorKind`].

use crate::adapter::{AgentAdapter, DownstreamBackend};
use crate::bus::{MessageBus, TeamComms};
use crate::comms::{CommsServer, CommsState, start_comms_server};
use crate::dispatch::{DispatchOutcome, DispatchSpec, dispatch};
use crate::error::{Result, StateError};
use crate::mission::engine::{EngineDeps, await_mission, launch};
use crate::mission::{MissionRecord, MissionRegistry, MissionResult};
use crate::prompts;
use crate::state::{Agent, AgentSpec, Task, Team, TeamStore};
use crate::steer::{SteerOutcome, steer};
use crate::{AgentId, AgentStatus, MissionId, TaskId, TaskStatus};

use futures::future::join_all;
use minijinja::{Value, context};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Per-agent result of a broadcast or relay.
#[derive(Debug, Clone, Serialize)]
pub struct AgentCallOutcome {
    pub agent_id: AgentId,
    pub status: CallStatus,
    /// Output on success, error message on failure, reason when skipped.
    pub detail: String,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    Success,
    Error,
    Skipped,
}

/// Result of completing a task.
#[derive(Debug, Clone, Serialize)]
pub struct CompletionOutcome {
    pub task: Task,
    /// Tasks whose prerequisites are now all satisfied.
    pub unblocked: Vec<TaskId>,
    /// The subset of `unblocked` that auto-started.
    pub started: Vec<TaskId>,
}

/// The orchestrator: every operator operation hangs off this.
pub struct Orchestrator {
    store: Arc<TeamStore>,
    bus: Arc<MessageBus>,
    adapter: Arc<AgentAdapter>,
    missions: Arc<MissionRegistry>,
    comms: Mutex<Option<CommsServer>>,
}

impl Orchestrator {
    pub fn new(backend: Arc<dyn DownstreamBackend>) -> Self {
        let store = Arc::new(TeamStore::new());
        let adapter = Arc::new(AgentAdapter::new(backend, store.clone()));
        Self {
            store,
            bus: Arc::new(MessageBus::new()),
            adapter,
            missions: Arc::new(MissionRegistry::new()),
            comms: Mutex::new(None),
        }
    }

    pub fn store(&self) -> &Arc<TeamStore> {
        &self.store
    }

    pub fn bus(&self) -> &Arc<MessageBus> {
        &self.bus
    }

    pub fn adapter(&self) -> &Arc<AgentAdapter> {
        &self.adapter
    }

    pub fn missions(&self) -> &Arc<MissionRegistry> {
        &self.missions
    }

    /// Start the agent-facing comms service and point the adapter at it.
    /// Returns the base URL.
    pub async fn start_comms(&self) -> Result<String> {
        let state = Arc::new(CommsState::new(
            self.store.clone(),
            self.bus.clone(),
            self.adapter.identity_tokens(),
        ));
        let server = start_comms_server(state).await?;
        let url = server.url.clone();
        self.adapter.set_comms_endpoint(&url);
        let mut comms = self.comms.lock().expect("comms handle lock poisoned");
        *comms = Some(server);
        Ok(url)
    }

    /// Drain tracked background work, close the downstream session, and stop
    /// the comms listener.
    pub async fn shutdown(&self) {
        self.adapter.shutdown().await;
        let server = {
            let mut comms = self.comms.lock().expect("comms handle lock poisoned");
            comms.take()
        };
        if let Some(server) = server {
            server.stop().await;
        }
    }

    // ── Team lifecycle ──────────────────────────────────────────────────

    pub fn create_team(&self, name: &str, specs: Vec<AgentSpec>) -> Result<Team> {
        self.store.create_team(name, specs)
    }

    /// Destroy a team: cancel in-flight calls, drop state, purge channels.
    pub fn dissolve_team(&self, team_id: &str) -> Result<()> {
        let members = self.store.dissolve_team(team_id)?;
        self.adapter.cancel_team(&members);
        self.bus.dissolve_team(team_id, &members);
        Ok(())
    }

    pub fn add_agent(&self, team_id: &str, spec: AgentSpec) -> Result<Agent> {
        self.store.add_agent(team_id, spec)
    }

    pub fn remove_agent(&self, team_id: &str, agent_id: &str) -> Result<()> {
        self.store.remove_agent(team_id, agent_id)
    }

    /// Roster snapshots: one team, or all of them.
    pub fn list_agents(&self, team_id: Option<&str>) -> Result<Vec<Team>> {
        match team_id {
            Some(team_id) => Ok(vec![self.store.team(team_id)?]),
            None => Ok(self.store.teams()),
        }
    }

    // ── Messaging ───────────────────────────────────────────────────────

    /// One synchronous turn with one agent. Refuses while the agent is
    /// working — wait for the in-flight call instead of queueing behind it.
    pub async fn send_message(&self, team_id: &str, agent_id: &str, text: &str) -> Result<String> {
        let agent = self.store.agent(team_id, agent_id)?;
        if agent.status == AgentStatus::Working {
            return Err(StateError::AgentBusy {
                id: agent_id.to_string(),
                reason: "currently working; wait for the in-flight call to finish".to_string(),
            }
            .into());
        }
        self.adapter.send(agent_id, text, None).await
    }

    /// Send the same text to several agents concurrently, skipping any that
    /// are currently working.
    pub async fn broadcast(
        &self,
        team_id: &str,
        text: &str,
        subset: Option<Vec<AgentId>>,
    ) -> Result<Vec<AgentCallOutcome>> {
        let targets = self.resolve_targets(team_id, subset, None)?;
        Ok(self.fan_out(targets, text).await)
    }

    /// Forward one agent's last output to a teammate or to the whole team.
    pub async fn relay(
        &self,
        team_id: &str,
        from: &str,
        to: Option<AgentId>,
        to_all: bool,
        prefix: Option<&str>,
    ) -> Result<Vec<AgentCallOutcome>> {
        if to.is_none() && !to_all {
            return Err(StateError::InvalidArgument(
                "relay needs a destination: `to` or `to_all`".to_string(),
            )
            .into());
        }

        let source = self.store.agent(team_id, from)?;
        let Some(output) = source.last_output.filter(|output| !output.is_empty()) else {
            return Err(StateError::InvalidArgument(format!(
                "agent '{from}' has no output to relay"
            ))
            .into());
        };

        let text = match prefix {
            Some(prefix) => format!("{prefix}\n\n{output}"),
            None => output,
        };

        let subset = to.map(|target| vec![target]);
        let targets = self.resolve_targets(team_id, subset, Some(from))?;
        if targets.is_empty() {
            return Err(StateError::InvalidArgument(
                "no relay destination besides the source".to_string(),
            )
            .into());
        }
        Ok(self.fan_out(targets, &text).await)
    }

    fn resolve_targets(
        &self,
        team_id: &str,
        subset: Option<Vec<AgentId>>,
        exclude: Option<&str>,
    ) -> Result<Vec<Agent>> {
        let team = self.store.team(team_id)?;
        let targets = match subset {
            Some(ids) => {
                let mut targets = Vec::with_capacity(ids.len());
                for id in ids {
                    let agent = team
                        .agents
                        .get(&id)
                        .cloned()
                        .ok_or_else(|| StateError::AgentNotFound(id.clone()))?;
                    targets.push(agent);
                }
                targets
            }
            None => team.roster(),
        };
        Ok(targets
            .into_iter()
            .filter(|agent| exclude != Some(agent.id.as_str()))
            .collect())
    }

    async fn fan_out(&self, targets: Vec<Agent>, text: &str) -> Vec<AgentCallOutcome> {
        let calls = targets.into_iter().map(|agent| {
            let adapter = self.adapter.clone();
            let text = text.to_string();
            async move {
                if agent.status == AgentStatus::Working {
                    return AgentCallOutcome {
                        agent_id: agent.id,
                        status: CallStatus::Skipped,
                        detail: "currently working".to_string(),
                    };
                }
                match adapter.send(&agent.id, &text, None).await {
                    Ok(output) => AgentCallOutcome {
                        agent_id: agent.id,
                        status: CallStatus::Success,
                        detail: output,
                    },
                    Err(error) => AgentCallOutcome {
                        agent_id: agent.id,
                        status: CallStatus::Error,
                        detail: error.to_string(),
                    },
                }
            }
        });
        join_all(calls).await
    }

    // ── Tasks ───────────────────────────────────────────────────────────

    /// Create a task; auto-start it when its prerequisites are already
    /// satisfied and the assignee is idle. The kick-off adapter call runs in
    /// the background and reverts the task to pending if it fails.
    pub fn assign_task(
        &self,
        team_id: &str,
        assignee: &str,
        description: &str,
        prerequisites: Vec<TaskId>,
    ) -> Result<Task> {
        let task = self
            .store
            .create_task(team_id, assignee, description, prerequisites)?;

        let prereqs_done = task.prerequisites.iter().all(|id| {
            self.store
                .task(team_id, id)
                .map(|prereq| prereq.status == TaskStatus::Completed)
                .unwrap_or(false)
        });
        let assignee_idle = self
            .store
            .agent(team_id, assignee)
            .map(|agent| agent.status == AgentStatus::Idle)
            .unwrap_or(false);

        if prereqs_done && assignee_idle {
            self.kick_task(team_id, &task.id)?;
        }
        self.store.task(team_id, &task.id)
    }

    pub fn task_status(&self, team_id: &str, task_id: Option<&str>) -> Result<Vec<Task>> {
        match task_id {
            Some(task_id) => Ok(vec![self.store.task(team_id, task_id)?]),
            None => {
                let team = self.store.team(team_id)?;
                let mut tasks = team.tasks.into_values().collect::<Vec<_>>();
                tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
                Ok(tasks)
            }
        }
    }

    /// Complete a task with the given result (or the assignee's last
    /// output), then auto-start every unblocked task with an idle assignee.
    pub fn complete_task(
        &self,
        team_id: &str,
        task_id: &str,
        result: Option<String>,
    ) -> Result<CompletionOutcome> {
        let task = self.store.task(team_id, task_id)?;
        let result = result.or_else(|| {
            self.store
                .agent(team_id, &task.assignee)
                .ok()
                .and_then(|agent| agent.last_output)
        });

        let unblocked = self.store.complete_task(team_id, task_id, result)?;
        let mut started = Vec::new();
        for unblocked_id in &unblocked {
            let assignee_idle = self
                .store
                .task(team_id, unblocked_id)
                .and_then(|task| self.store.agent(team_id, &task.assignee))
                .map(|agent| agent.status == AgentStatus::Idle)
                .unwrap_or(false);
            if assignee_idle && self.kick_task(team_id, unblocked_id).is_ok() {
                started.push(unblocked_id.clone());
            }
        }

        Ok(CompletionOutcome {
            task: self.store.task(team_id, task_id)?,
            unblocked,
            started,
        })
    }

    /// Transition a task to in-progress and fire the assignee's kick-off
    /// call in the background, registered with the adapter tracker.
    fn kick_task(&self, team_id: &str, task_id: &str) -> Result<()> {
        self.store.start_task(team_id, task_id)?;
        let task = self.store.task(team_id, task_id)?;

        let prereq_views = task
            .prerequisites
            .iter()
            .filter_map(|id| self.store.task(team_id, id).ok())
            .map(|prereq| {
                context! {
                    description => prereq.description,
                    result => prereq.result,
                }
            })
            .collect::<Vec<Value>>();
        let prompt = prompts::render(
            "task_kick",
            context! {
                description => task.description,
                prerequisites => prereq_views,
            },
        );

        let adapter = self.adapter.clone();
        let store = self.store.clone();
        let team_id = team_id.to_string();
        let task_id = task_id.to_string();
        let assignee = task.assignee.clone();
        self.adapter.track(async move {
            if let Err(error) = adapter.send(&assignee, &prompt, None).await {
                tracing::warn!(%error, task_id, assignee, "task kick-off failed, reverting");
                if let Err(revert_error) = store.revert_task(&team_id, &task_id) {
                    tracing::debug!(%revert_error, task_id, "task not revertible");
                }
            }
        });
        Ok(())
    }

    // ── Outputs and reports ─────────────────────────────────────────────

    pub fn get_output(&self, team_id: &str, agent_id: &str) -> Result<Option<String>> {
        Ok(self.store.agent(team_id, agent_id)?.last_output)
    }

    /// Compact human-readable status block for one team.
    pub fn get_team_report(&self, team_id: &str) -> Result<String> {
        let team = self.store.team(team_id)?;
        let mut report = format!(
            "Team \"{}\" ({}) — {} agent(s), {} task(s)\n",
            team.name,
            team.id,
            team.agents.len(),
            team.tasks.len()
        );

        report.push_str("Agents:\n");
        for agent in team.roster() {
            let last = agent
                .last_output
                .as_deref()
                .map(|output| preview(output, 96))
                .unwrap_or_else(|| "(no output yet)".to_string());
            report.push_str(&format!(
                "  {} [{}{}] {} — {}\n",
                agent.id,
                agent.role,
                if agent.lead { ", lead" } else { "" },
                agent.status,
                last
            ));
        }

        if !team.tasks.is_empty() {
            report.push_str("Tasks:\n");
            for task in self.task_status(team_id, None)? {
                report.push_str(&format!(
                    "  {} [{}] {} — {}\n",
                    task.id,
                    task.status,
                    task.assignee,
                    preview(&task.description, 96)
                ));
            }
        }
        Ok(report)
    }

    /// Live view of a still-existing team's channels and artifacts.
    pub fn get_team_comms(&self, team_id: &str) -> Result<TeamComms> {
        let team = self.store.team(team_id)?;
        let members = team.agents.keys().cloned().collect::<Vec<_>>();
        Ok(self.bus.team_comms(team_id, &members))
    }

    // ── Execution modes ─────────────────────────────────────────────────

    pub async fn dispatch_team(
        &self,
        team_name: &str,
        work_dir: PathBuf,
        specs: Vec<DispatchSpec>,
    ) -> Result<Vec<DispatchOutcome>> {
        dispatch(&self.store, &self.bus, &self.adapter, team_name, &work_dir, specs).await
    }

    pub fn launch_mission(
        &self,
        objective: &str,
        work_dir: PathBuf,
        specs: Vec<AgentSpec>,
        verify_command: Option<String>,
        max_retries: Option<u32>,
    ) -> Result<MissionId> {
        launch(
            &self.engine_deps(),
            objective,
            &work_dir,
            specs,
            verify_command,
            max_retries,
        )
    }

    pub fn mission_status(&self, mission_id: &str) -> Result<MissionRecord> {
        self.missions.status(mission_id)
    }

    pub async fn await_mission(
        &self,
        mission_id: &str,
        poll_ms: Option<u64>,
        timeout_ms: Option<u64>,
    ) -> Result<MissionResult> {
        await_mission(
            &self.missions,
            mission_id,
            poll_ms.map(Duration::from_millis),
            timeout_ms.map(Duration::from_millis),
        )
        .await
    }

    pub fn get_mission_comms(&self, mission_id: &str) -> Result<TeamComms> {
        self.missions.terminal_comms(mission_id)
    }

    pub async fn steer_team(
        &self,
        team_id: &str,
        directive: &str,
        subset: Option<Vec<AgentId>>,
    ) -> Result<SteerOutcome> {
        steer(&self.store, &self.bus, &self.adapter, team_id, directive, subset).await
    }

    fn engine_deps(&self) -> EngineDeps {
        EngineDeps {
            store: self.store.clone(),
            bus: self.bus.clone(),
            adapter: self.adapter.clone(),
            missions: self.missions.clone(),
        }
    }
}

fn preview(text: &str, max_chars: usize) -> String {
    let trimmed = text.trim().replace('\n', " ");
    if trimmed.chars().count() <= max_chars {
        return trimmed;
    }
    let mut clipped = trimmed.chars().take(max_chars).collect::<String>();
    clipped.push('…');
    clipped
}
