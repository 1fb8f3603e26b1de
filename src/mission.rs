//! Missions: an asynchronous lead-plus-workers run over one team, with
//! optional verification and bounded fix retries.

pub mod engine;
pub mod verify;

use crate::bus::TeamComms;
use crate::error::{MissionError, Result};
use crate::{AgentId, MissionId, TeamId};

use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// How long a terminal mission's snapshot stays retrievable.
pub const RETENTION: Duration = Duration::from_secs(30 * 60);

/// Default fix-retry cap.
pub const DEFAULT_MAX_RETRIES: u32 = 2;

/// Default polling interval for `await_mission`.
pub const AWAIT_POLL_DEFAULT: Duration = Duration::from_secs(3);

/// Default overall timeout for `await_mission`.
pub const AWAIT_TIMEOUT_DEFAULT: Duration = Duration::from_secs(60 * 60);

/// Mission lifecycle phase.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MissionPhase {
    Executing,
    Verifying,
    Fixing,
    Reviewing,
    Completed,
    Error,
}

impl MissionPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, MissionPhase::Completed | MissionPhase::Error)
    }
}

impl std::fmt::Display for MissionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let phase = match self {
            MissionPhase::Executing => "executing",
            MissionPhase::Verifying => "verifying",
            MissionPhase::Fixing => "fixing",
            MissionPhase::Reviewing => "reviewing",
            MissionPhase::Completed => "completed",
            MissionPhase::Error => "error",
        };
        write!(f, "{phase}")
    }
}

/// Terminal status of one participant's work.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Success,
    Error,
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerStatus::Success => write!(f, "success"),
            WorkerStatus::Error => write!(f, "error"),
        }
    }
}

/// One participant's recorded outcome. Overwritten by fix rounds.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerOutcome {
    pub status: WorkerStatus,
    pub output: String,
}

/// One verification attempt.
#[derive(Debug, Clone, Serialize)]
pub struct VerifyAttempt {
    pub attempt: u32,
    pub passed: bool,
    pub output: String,
}

/// Full mission record. Cheap to clone for status snapshots.
#[derive(Debug, Clone, Serialize)]
pub struct MissionRecord {
    pub id: MissionId,
    pub objective: String,
    pub team_id: TeamId,
    pub team_name: String,
    pub phase: MissionPhase,
    pub lead_id: AgentId,
    pub worker_ids: Vec<AgentId>,
    pub worker_results: BTreeMap<AgentId, WorkerOutcome>,
    pub verify_command: Option<String>,
    pub max_retries: u32,
    pub verification: Vec<VerifyAttempt>,
    pub report: Option<String>,
    pub error: Option<String>,
    /// Comms snapshot captured at terminal entry.
    pub comms: Option<TeamComms>,
}

/// Terminal result handed back by `await_mission`.
#[derive(Debug, Clone, Serialize)]
pub struct MissionResult {
    pub id: MissionId,
    pub phase: MissionPhase,
    pub report: Option<String>,
    pub error: Option<String>,
}

/// Process-wide registry of live and recently-terminal missions.
#[derive(Default)]
pub struct MissionRegistry {
    missions: Mutex<HashMap<MissionId, Arc<Mutex<MissionRecord>>>>,
}

impl MissionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, record: MissionRecord) -> Arc<Mutex<MissionRecord>> {
        let id = record.id.clone();
        let shared = Arc::new(Mutex::new(record));
        let mut missions = self.missions.lock().expect("mission map lock poisoned");
        missions.insert(id, shared.clone());
        shared
    }

    pub fn get(&self, id: &str) -> Result<Arc<Mutex<MissionRecord>>> {
        let missions = self.missions.lock().expect("mission map lock poisoned");
        missions
            .get(id)
            .cloned()
            .ok_or_else(|| MissionError::NotFound(id.to_string()).into())
    }

    /// Snapshot of a mission's current state.
    pub fn status(&self, id: &str) -> Result<MissionRecord> {
        let record = self.get(id)?;
        let snapshot = record.lock().expect("mission record lock poisoned").clone();
        Ok(snapshot)
    }

    pub fn remove(&self, id: &str) -> bool {
        let mut missions = self.missions.lock().expect("mission map lock poisoned");
        missions.remove(id).is_some()
    }

    /// The retained snapshot of a terminal mission. Fails with `not_ready`
    /// while the mission is still running.
    pub fn terminal_comms(&self, id: &str) -> Result<TeamComms> {
        let record = self.get(id)?;
        let record = record.lock().expect("mission record lock poisoned");
        if !record.phase.is_terminal() {
            return Err(MissionError::NotReady(id.to_string()).into());
        }
        Ok(record.comms.clone().unwrap_or_default())
    }
}
