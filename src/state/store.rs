//! In-memory store for teams and everything they own.
//!
//! Teams own their agents and tasks exclusively; dissolving a team drops
//! both. The store is a plain map behind a coarse lock — no operation holds
//! the lock across an await point.

use crate::error::{Result, StateError};
use crate::{AgentId, AgentStatus, ApprovalPolicy, ReasoningEffort, SandboxMode, TaskId, TaskStatus, TeamId};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::RwLock;

/// Default downstream model when a spec doesn't name one.
pub const DEFAULT_MODEL: &str = "gpt-5.3-codex";

/// Length of the random hex tail on generated agent ids.
const AGENT_ID_TAIL_HEX: usize = 12;

/// Operator-supplied agent configuration. Optional fields fall back to the
/// team defaults when the agent is constructed.
#[derive(Debug, Clone, Default, Serialize, Deserialize, schemars::JsonSchema)]
pub struct AgentSpec {
    /// Short role name, e.g. "researcher" or "dev". Becomes the id prefix.
    pub role: String,
    /// Free-text specialization shown to teammates.
    #[serde(default)]
    pub specialization: Option<String>,
    /// Downstream model name.
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub sandbox: Option<SandboxMode>,
    #[serde(default)]
    pub approval: Option<ApprovalPolicy>,
    #[serde(default)]
    pub reasoning_effort: Option<ReasoningEffort>,
    /// Marks the team lead. Leads get cross-team channel access.
    #[serde(default)]
    pub lead: bool,
    /// Working directory for the downstream process.
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    /// Extra base instructions appended to the composed prompt.
    #[serde(default)]
    pub instructions: Option<String>,
}

/// A single downstream agent and its runtime state.
#[derive(Debug, Clone, Serialize)]
pub struct Agent {
    pub id: AgentId,
    pub role: String,
    pub specialization: String,
    pub model: String,
    pub sandbox: SandboxMode,
    pub approval: ApprovalPolicy,
    pub reasoning_effort: ReasoningEffort,
    pub lead: bool,
    pub working_dir: PathBuf,
    pub instructions: String,
    /// Continuation handle from the downstream session; absent until the
    /// first successful turn.
    #[serde(skip)]
    pub continuation: Option<String>,
    pub status: AgentStatus,
    pub last_output: Option<String>,
    pub task_ids: Vec<TaskId>,
}

impl Agent {
    fn from_spec(id: AgentId, spec: AgentSpec) -> Self {
        let lead = spec.lead;
        Self {
            id,
            role: spec.role,
            specialization: spec.specialization.unwrap_or_default(),
            model: spec.model.unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            sandbox: spec.sandbox.unwrap_or_default(),
            approval: spec.approval.unwrap_or_default(),
            reasoning_effort: spec.reasoning_effort.unwrap_or(if lead {
                ReasoningEffort::Xhigh
            } else {
                ReasoningEffort::High
            }),
            lead,
            working_dir: spec
                .working_dir
                .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))),
            instructions: spec.instructions.unwrap_or_default(),
            continuation: None,
            status: AgentStatus::Idle,
            last_output: None,
            task_ids: Vec::new(),
        }
    }
}

/// A unit of work assigned to one agent, possibly gated on other tasks.
#[derive(Debug, Clone, Serialize)]
pub struct Task {
    pub id: TaskId,
    pub description: String,
    pub status: TaskStatus,
    pub assignee: AgentId,
    pub prerequisites: Vec<TaskId>,
    pub result: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// A named group of agents sharing channels and artifact storage.
#[derive(Debug, Clone, Serialize)]
pub struct Team {
    pub id: TeamId,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub agents: HashMap<AgentId, Agent>,
    pub tasks: HashMap<TaskId, Task>,
}

impl Team {
    /// Agents sorted by id, for deterministic rendering.
    pub fn roster(&self) -> Vec<Agent> {
        let mut agents = self.agents.values().cloned().collect::<Vec<_>>();
        agents.sort_by(|a, b| a.id.cmp(&b.id));
        agents
    }

    /// The lead agent, if the team has one.
    pub fn lead(&self) -> Option<&Agent> {
        self.agents.values().find(|agent| agent.lead)
    }
}

/// In-memory store of all live teams.
#[derive(Default)]
pub struct TeamStore {
    teams: RwLock<HashMap<TeamId, Team>>,
}

impl TeamStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a team and construct each agent with defaults applied.
    pub fn create_team(&self, name: &str, specs: Vec<AgentSpec>) -> Result<Team> {
        if name.trim().is_empty() {
            return Err(StateError::InvalidArgument("team name is empty".to_string()).into());
        }

        let mut agents = HashMap::new();
        for spec in specs {
            let agent = build_agent(spec, &agents)?;
            agents.insert(agent.id.clone(), agent);
        }

        let team = Team {
            id: format!("team-{}", random_hex(AGENT_ID_TAIL_HEX)),
            name: name.to_string(),
            created_at: Utc::now(),
            agents,
            tasks: HashMap::new(),
        };

        let mut teams = self.teams.write().expect("team map lock poisoned");
        teams.insert(team.id.clone(), team.clone());
        tracing::info!(team_id = %team.id, name = %team.name, agents = team.agents.len(), "team created");
        Ok(team)
    }

    pub fn add_agent(&self, team_id: &str, spec: AgentSpec) -> Result<Agent> {
        let mut teams = self.teams.write().expect("team map lock poisoned");
        let team = teams
            .get_mut(team_id)
            .ok_or_else(|| StateError::TeamNotFound(team_id.to_string()))?;

        let agent = build_agent(spec, &team.agents)?;
        team.agents.insert(agent.id.clone(), agent.clone());
        Ok(agent)
    }

    /// Remove an agent. Fails with `busy` while the agent is working or still
    /// owns tasks.
    pub fn remove_agent(&self, team_id: &str, agent_id: &str) -> Result<()> {
        let mut teams = self.teams.write().expect("team map lock poisoned");
        let team = teams
            .get_mut(team_id)
            .ok_or_else(|| StateError::TeamNotFound(team_id.to_string()))?;
        let agent = team
            .agents
            .get(agent_id)
            .ok_or_else(|| StateError::AgentNotFound(agent_id.to_string()))?;

        if agent.status == AgentStatus::Working {
            return Err(StateError::AgentBusy {
                id: agent_id.to_string(),
                reason: "currently working".to_string(),
            }
            .into());
        }
        if !agent.task_ids.is_empty() {
            return Err(StateError::AgentBusy {
                id: agent_id.to_string(),
                reason: format!("owns {} task(s)", agent.task_ids.len()),
            }
            .into());
        }

        team.agents.remove(agent_id);
        Ok(())
    }

    /// Create a task for an assignee on the team. Every prerequisite must be
    /// an existing task of the same team.
    pub fn create_task(
        &self,
        team_id: &str,
        assignee: &str,
        description: &str,
        prerequisites: Vec<TaskId>,
    ) -> Result<Task> {
        let mut teams = self.teams.write().expect("team map lock poisoned");
        let team = teams
            .get_mut(team_id)
            .ok_or_else(|| StateError::TeamNotFound(team_id.to_string()))?;
        if !team.agents.contains_key(assignee) {
            return Err(StateError::AgentNotFound(assignee.to_string()).into());
        }
        for prereq in &prerequisites {
            if !team.tasks.contains_key(prereq) {
                return Err(StateError::TaskNotFound(prereq.clone()).into());
            }
        }

        let task = Task {
            id: format!("task-{}", random_hex(AGENT_ID_TAIL_HEX)),
            description: description.to_string(),
            status: TaskStatus::Pending,
            assignee: assignee.to_string(),
            prerequisites,
            result: None,
            created_at: Utc::now(),
            completed_at: None,
        };

        team.tasks.insert(task.id.clone(), task.clone());
        if let Some(agent) = team.agents.get_mut(assignee) {
            agent.task_ids.push(task.id.clone());
        }
        Ok(task)
    }

    /// Move a pending task to in-progress.
    pub fn start_task(&self, team_id: &str, task_id: &str) -> Result<()> {
        self.transition_task(team_id, task_id, TaskStatus::Pending, TaskStatus::InProgress)
    }

    /// Revert an in-progress task to pending. Used only when the auto-start
    /// adapter call fails before the assignee ever saw the task.
    pub fn revert_task(&self, team_id: &str, task_id: &str) -> Result<()> {
        self.transition_task(team_id, task_id, TaskStatus::InProgress, TaskStatus::Pending)
    }

    fn transition_task(
        &self,
        team_id: &str,
        task_id: &str,
        from: TaskStatus,
        to: TaskStatus,
    ) -> Result<()> {
        let mut teams = self.teams.write().expect("team map lock poisoned");
        let team = teams
            .get_mut(team_id)
            .ok_or_else(|| StateError::TeamNotFound(team_id.to_string()))?;
        let task = team
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| StateError::TaskNotFound(task_id.to_string()))?;
        if task.status != from {
            return Err(StateError::InvalidTransition {
                task: task_id.to_string(),
                from: task.status,
                to,
            }
            .into());
        }
        task.status = to;
        Ok(())
    }

    /// Mark a task completed and record its result. Returns the ids of tasks
    /// that are still pending and whose prerequisites are now all completed.
    pub fn complete_task(
        &self,
        team_id: &str,
        task_id: &str,
        result: Option<String>,
    ) -> Result<Vec<TaskId>> {
        let mut teams = self.teams.write().expect("team map lock poisoned");
        let team = teams
            .get_mut(team_id)
            .ok_or_else(|| StateError::TeamNotFound(team_id.to_string()))?;
        let task = team
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| StateError::TaskNotFound(task_id.to_string()))?;
        if task.status == TaskStatus::Completed {
            return Err(StateError::InvalidTransition {
                task: task_id.to_string(),
                from: TaskStatus::Completed,
                to: TaskStatus::Completed,
            }
            .into());
        }

        task.status = TaskStatus::Completed;
        task.result = result;
        task.completed_at = Some(Utc::now());
        let assignee = task.assignee.clone();
        if let Some(agent) = team.agents.get_mut(&assignee) {
            agent.task_ids.retain(|id| id != task_id);
        }

        let completed: std::collections::HashSet<&str> = team
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Completed)
            .map(|t| t.id.as_str())
            .collect();

        let mut unblocked = team
            .tasks
            .values()
            .filter(|t| {
                t.status == TaskStatus::Pending
                    && t.prerequisites.iter().any(|p| p == task_id)
                    && t.prerequisites.iter().all(|p| completed.contains(p.as_str()))
            })
            .map(|t| t.id.clone())
            .collect::<Vec<_>>();
        unblocked.sort();
        Ok(unblocked)
    }

    /// Destroy the team. Returns the member agent ids so the caller can purge
    /// the message bus.
    pub fn dissolve_team(&self, team_id: &str) -> Result<Vec<AgentId>> {
        let mut teams = self.teams.write().expect("team map lock poisoned");
        let team = teams
            .remove(team_id)
            .ok_or_else(|| StateError::TeamNotFound(team_id.to_string()))?;
        tracing::info!(team_id = %team.id, name = %team.name, "team dissolved");
        Ok(team.agents.into_keys().collect())
    }

    pub fn team(&self, team_id: &str) -> Result<Team> {
        let teams = self.teams.read().expect("team map lock poisoned");
        teams
            .get(team_id)
            .cloned()
            .ok_or_else(|| StateError::TeamNotFound(team_id.to_string()).into())
    }

    /// Snapshot of every live team, sorted by creation time.
    pub fn teams(&self) -> Vec<Team> {
        let teams = self.teams.read().expect("team map lock poisoned");
        let mut all = teams.values().cloned().collect::<Vec<_>>();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        all
    }

    pub fn agent(&self, team_id: &str, agent_id: &str) -> Result<Agent> {
        let teams = self.teams.read().expect("team map lock poisoned");
        let team = teams
            .get(team_id)
            .ok_or_else(|| StateError::TeamNotFound(team_id.to_string()))?;
        team.agents
            .get(agent_id)
            .cloned()
            .ok_or_else(|| StateError::AgentNotFound(agent_id.to_string()).into())
    }

    pub fn task(&self, team_id: &str, task_id: &str) -> Result<Task> {
        let teams = self.teams.read().expect("team map lock poisoned");
        let team = teams
            .get(team_id)
            .ok_or_else(|| StateError::TeamNotFound(team_id.to_string()))?;
        team.tasks
            .get(task_id)
            .cloned()
            .ok_or_else(|| StateError::TaskNotFound(task_id.to_string()).into())
    }

    /// The team an agent belongs to, if any.
    pub fn team_of_agent(&self, agent_id: &str) -> Option<TeamId> {
        let teams = self.teams.read().expect("team map lock poisoned");
        teams
            .values()
            .find(|team| team.agents.contains_key(agent_id))
            .map(|team| team.id.clone())
    }

    /// Look up an agent without knowing its team.
    pub fn find_agent(&self, agent_id: &str) -> Result<(TeamId, Agent)> {
        let teams = self.teams.read().expect("team map lock poisoned");
        for team in teams.values() {
            if let Some(agent) = team.agents.get(agent_id) {
                return Ok((team.id.clone(), agent.clone()));
            }
        }
        Err(StateError::AgentNotFound(agent_id.to_string()).into())
    }

    pub fn set_status(&self, agent_id: &str, status: AgentStatus) {
        self.with_agent_mut(agent_id, |agent| agent.status = status);
    }

    pub fn set_last_output(&self, agent_id: &str, output: &str) {
        self.with_agent_mut(agent_id, |agent| agent.last_output = Some(output.to_string()));
    }

    pub fn set_continuation(&self, agent_id: &str, continuation: Option<String>) {
        self.with_agent_mut(agent_id, |agent| agent.continuation = continuation);
    }

    /// Mutate an agent in place. Silently a no-op when the agent is gone
    /// (its team may have been dissolved while a call was in flight).
    fn with_agent_mut(&self, agent_id: &str, mutate: impl FnOnce(&mut Agent)) {
        let mut teams = self.teams.write().expect("team map lock poisoned");
        for team in teams.values_mut() {
            if let Some(agent) = team.agents.get_mut(agent_id) {
                mutate(agent);
                return;
            }
        }
    }
}

fn build_agent(spec: AgentSpec, existing: &HashMap<AgentId, Agent>) -> Result<Agent> {
    let role = slugify(&spec.role);
    if role.is_empty() {
        return Err(StateError::InvalidArgument("agent role is empty".to_string()).into());
    }

    let mut id = format!("{role}-{}", random_hex(AGENT_ID_TAIL_HEX));
    while existing.contains_key(&id) {
        id = format!("{role}-{}", random_hex(AGENT_ID_TAIL_HEX));
    }

    let mut spec = spec;
    spec.role = role;
    Ok(Agent::from_spec(id, spec))
}

/// Lowercase the role and collapse anything non-alphanumeric into dashes so
/// ids stay URL- and log-friendly.
fn slugify(raw: &str) -> String {
    let mut slug = String::with_capacity(raw.len());
    let mut last_dash = true;
    for character in raw.chars() {
        if character.is_ascii_alphanumeric() {
            slug.push(character.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            slug.push('-');
            last_dash = true;
        }
    }
    while slug.ends_with('-') {
        slug.pop();
    }
    slug
}

fn random_hex(len: usize) -> String {
    use rand::Rng as _;
    let mut rng = rand::rng();
    (0..len)
        .map(|_| char::from_digit(rng.random_range(0..16), 16).unwrap_or('0'))
        .collect()
}
