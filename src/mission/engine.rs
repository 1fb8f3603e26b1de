//! The mission phase machine.
//!
//! One lead plus workers execute an objective concurrently; an optional
//! verify command gates completion with a bounded fix-retry loop; the lead
//! compiles the final report. Worker failures never abort the mission —
//! they are recorded and carried into review.

use crate::adapter::AgentAdapter;
use crate::bus::MessageBus;
use crate::error::{MissionError, Result};
use crate::mission::verify::run_verify;
use crate::mission::{
    AWAIT_POLL_DEFAULT, AWAIT_TIMEOUT_DEFAULT, DEFAULT_MAX_RETRIES, MissionPhase, MissionRecord,
    MissionRegistry, MissionResult, RETENTION, VerifyAttempt, WorkerOutcome, WorkerStatus,
};
use crate::prompts;
use crate::state::{AgentSpec, TeamStore};
use crate::{AgentId, MissionId};

use futures::future::join_all;
use minijinja::{Value, context};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Shared handles the engine operates on.
#[derive(Clone)]
pub struct EngineDeps {
    pub store: Arc<TeamStore>,
    pub bus: Arc<MessageBus>,
    pub adapter: Arc<AgentAdapter>,
    pub missions: Arc<MissionRegistry>,
}

/// Create the mission team and kick off the phase machine in the background.
/// Exactly one spec must be marked lead.
pub fn launch(
    deps: &EngineDeps,
    objective: &str,
    work_dir: &PathBuf,
    mut specs: Vec<AgentSpec>,
    verify_command: Option<String>,
    max_retries: Option<u32>,
) -> Result<MissionId> {
    if specs.is_empty() {
        return Err(MissionError::InvalidArgument("no agent specs given".to_string()).into());
    }
    let leads = specs.iter().filter(|spec| spec.lead).count();
    if leads != 1 {
        return Err(MissionError::InvalidArgument(format!(
            "exactly one spec must be marked lead, got {leads}"
        ))
        .into());
    }

    for spec in &mut specs {
        if spec.working_dir.is_none() {
            spec.working_dir = Some(work_dir.clone());
        }
    }

    let mission_id = format!(
        "mission-{}",
        &uuid::Uuid::new_v4().simple().to_string()[..12]
    );
    let team = deps
        .store
        .create_team(&format!("mission {mission_id}"), specs)?;

    let roster = team.roster();
    let lead_id = roster
        .iter()
        .find(|agent| agent.lead)
        .map(|agent| agent.id.clone())
        .unwrap_or_default();
    let worker_ids = roster
        .iter()
        .filter(|agent| !agent.lead)
        .map(|agent| agent.id.clone())
        .collect::<Vec<_>>();

    let record = deps.missions.insert(MissionRecord {
        id: mission_id.clone(),
        objective: objective.to_string(),
        team_id: team.id.clone(),
        team_name: team.name.clone(),
        phase: MissionPhase::Executing,
        lead_id,
        worker_ids,
        worker_results: BTreeMap::new(),
        verify_command,
        max_retries: max_retries.unwrap_or(DEFAULT_MAX_RETRIES),
        verification: Vec::new(),
        report: None,
        error: None,
        comms: None,
    });

    let run_deps = deps.clone();
    deps.adapter.track(async move {
        run(run_deps, record).await;
    });

    tracing::info!(mission_id = %mission_id, team_id = %team.id, "mission launched");
    Ok(mission_id)
}

async fn run(deps: EngineDeps, record: Arc<Mutex<MissionRecord>>) {
    let (mission_id, objective, team_id, team_name, lead_id, worker_ids, verify_command, max_retries) = {
        let record = record.lock().expect("mission record lock poisoned");
        (
            record.id.clone(),
            record.objective.clone(),
            record.team_id.clone(),
            record.team_name.clone(),
            record.lead_id.clone(),
            record.worker_ids.clone(),
            record.verify_command.clone(),
            record.max_retries,
        )
    };

    execute_phase(&deps, &record, &objective, &team_name, &lead_id, &worker_ids).await;

    if let Some(command) = &verify_command {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            set_phase(&record, MissionPhase::Verifying);

            let cwd = lead_working_dir(&deps, &team_id, &lead_id);
            let outcome = run_verify(command, &cwd).await;
            let failure_output = outcome.output.clone();
            let passed = outcome.passed;
            {
                let mut record = record.lock().expect("mission record lock poisoned");
                record.verification.push(VerifyAttempt {
                    attempt,
                    passed,
                    output: outcome.output,
                });
            }
            tracing::info!(mission_id = %mission_id, attempt, passed, "verification attempt");

            if passed {
                break;
            }
            if attempt <= max_retries {
                set_phase(&record, MissionPhase::Fixing);
                fix_phase(&deps, &record, &lead_id, &worker_ids, &failure_output).await;
            } else {
                break;
            }
        }
    }

    set_phase(&record, MissionPhase::Reviewing);
    let terminal = review_phase(&deps, &record, &objective, &lead_id, &worker_ids).await;

    finish(&deps, &record, &mission_id, &team_id, terminal).await;
}

/// Fire the lead without awaiting, run every worker concurrently, then join
/// the lead. Each participant's terminal output lands in its result slot.
async fn execute_phase(
    deps: &EngineDeps,
    record: &Arc<Mutex<MissionRecord>>,
    objective: &str,
    team_name: &str,
    lead_id: &str,
    worker_ids: &[AgentId],
) {
    let workers_view = worker_views(deps, record, worker_ids);
    let lead_prompt = prompts::render(
        "mission_lead",
        context! {
            team_name => team_name,
            objective => objective,
            workers => workers_view,
        },
    );

    let lead_call = {
        let adapter = deps.adapter.clone();
        let lead_id = lead_id.to_string();
        tokio::spawn(async move { adapter.send(&lead_id, &lead_prompt, None).await })
    };

    let worker_calls = worker_ids.iter().map(|worker_id| {
        let adapter = deps.adapter.clone();
        let worker_id = worker_id.clone();
        let prompt = worker_prompt(deps, record, objective, team_name, &worker_id);
        async move {
            let result = adapter.send(&worker_id, &prompt, None).await;
            (worker_id, result)
        }
    });

    for (worker_id, result) in join_all(worker_calls).await {
        record_outcome(record, &worker_id, result);
    }

    let lead_result = match lead_call.await {
        Ok(result) => result,
        Err(join_error) => Err(crate::error::Error::Other(anyhow::anyhow!(
            "lead call panicked: {join_error}"
        ))),
    };
    record_outcome(record, lead_id, lead_result);
}

/// Ask the lead for fix assignments and run the recognized ones.
async fn fix_phase(
    deps: &EngineDeps,
    record: &Arc<Mutex<MissionRecord>>,
    lead_id: &str,
    worker_ids: &[AgentId],
    failure_output: &str,
) {
    let prompt = prompts::render(
        "mission_fix",
        context! {
            failure_output => failure_output,
            worker_ids => worker_ids,
        },
    );

    let reply = match deps.adapter.send(lead_id, &prompt, None).await {
        Ok(reply) => reply,
        Err(error) => {
            tracing::warn!(%error, "lead unavailable for fix round, skipping");
            return;
        }
    };

    let assignments = parse_fix_assignments(&reply)
        .unwrap_or_default()
        .into_iter()
        .filter(|assignment| worker_ids.contains(&assignment.agent_id))
        .collect::<Vec<_>>();
    if assignments.is_empty() {
        tracing::debug!("fix round produced no recognizable assignments");
        return;
    }

    let fixes = assignments.into_iter().map(|assignment| {
        let adapter = deps.adapter.clone();
        async move {
            let result = adapter.send(&assignment.agent_id, &assignment.task, None).await;
            (assignment.agent_id, result)
        }
    });
    for (worker_id, result) in join_all(fixes).await {
        record_outcome(record, &worker_id, result);
    }
}

/// One lead call compiling the final report. A lead failure here is the one
/// failure that escalates to the mission itself. Returns the terminal phase
/// to enter; the caller flips it only after the comms snapshot is stored.
async fn review_phase(
    deps: &EngineDeps,
    record: &Arc<Mutex<MissionRecord>>,
    objective: &str,
    lead_id: &str,
    worker_ids: &[AgentId],
) -> MissionPhase {
    let (outcomes, verification) = {
        let record = record.lock().expect("mission record lock poisoned");
        let outcomes = worker_ids
            .iter()
            .filter_map(|id| {
                record.worker_results.get(id).map(|outcome| {
                    context! {
                        agent_id => id,
                        status => outcome.status.to_string(),
                        output => outcome.output,
                    }
                })
            })
            .collect::<Vec<Value>>();
        let verification = record.verification.last().map(|last| {
            if last.passed {
                format!("passed on attempt {}", last.attempt)
            } else {
                format!("failed after {} attempt(s)", last.attempt)
            }
        });
        (outcomes, verification)
    };

    let prompt = prompts::render(
        "mission_review",
        context! {
            objective => objective,
            outcomes => outcomes,
            verification => verification,
        },
    );

    match deps.adapter.send(lead_id, &prompt, None).await {
        Ok(report) => {
            let mut record = record.lock().expect("mission record lock poisoned");
            record.report = Some(report);
            MissionPhase::Completed
        }
        Err(error) => {
            // Keep whatever partial output the lead produced before failing.
            let partial = deps
                .store
                .find_agent(lead_id)
                .ok()
                .and_then(|(_, agent)| agent.last_output)
                .filter(|output| !output.is_empty() && *output != error.to_string());
            let mut record = record.lock().expect("mission record lock poisoned");
            record.error = Some(error.to_string());
            record.report = partial;
            MissionPhase::Error
        }
    }
}

/// Terminal entry: snapshot comms, flip to the terminal phase, dissolve the
/// team, start the eviction timer. The snapshot and the phase flip share one
/// lock so a terminal phase always has its snapshot. The timer is
/// deliberately untracked — missions are forgotten on shutdown.
async fn finish(
    deps: &EngineDeps,
    record: &Arc<Mutex<MissionRecord>>,
    mission_id: &str,
    team_id: &str,
    terminal: MissionPhase,
) {
    let members = deps
        .store
        .team(team_id)
        .map(|team| team.agents.keys().cloned().collect::<Vec<_>>())
        .unwrap_or_default();

    let snapshot = deps.bus.team_comms(team_id, &members);
    {
        let mut record = record.lock().expect("mission record lock poisoned");
        record.comms = Some(snapshot);
        record.phase = terminal;
    }

    if let Err(error) = deps.store.dissolve_team(team_id) {
        tracing::warn!(%error, team_id, "mission team already gone at terminal entry");
    }
    deps.bus.dissolve_team(team_id, &members);

    let missions = deps.missions.clone();
    let mission_id = mission_id.to_string();
    tokio::spawn(async move {
        tokio::time::sleep(RETENTION).await;
        if missions.remove(&mission_id) {
            tracing::debug!(mission_id = %mission_id, "mission record evicted");
        }
    });
}

/// Block until the mission is terminal, then hand back the report and delete
/// the record.
pub async fn await_mission(
    missions: &MissionRegistry,
    mission_id: &str,
    poll: Option<Duration>,
    timeout: Option<Duration>,
) -> Result<MissionResult> {
    let poll = poll.unwrap_or(AWAIT_POLL_DEFAULT);
    let timeout = timeout.unwrap_or(AWAIT_TIMEOUT_DEFAULT);
    let deadline = tokio::time::Instant::now() + timeout;

    loop {
        let snapshot = missions.status(mission_id)?;
        if snapshot.phase.is_terminal() {
            missions.remove(mission_id);
            return Ok(MissionResult {
                id: snapshot.id,
                phase: snapshot.phase,
                report: snapshot.report,
                error: snapshot.error,
            });
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(MissionError::AwaitTimeout(timeout).into());
        }
        tokio::time::sleep_until(std::cmp::min(deadline, tokio::time::Instant::now() + poll)).await;
    }
}

/// One fix assignment from the lead's JSON reply.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct FixAssignment {
    #[serde(rename = "agentId", alias = "agent_id")]
    pub agent_id: AgentId,
    pub task: String,
}

/// Extract the first `[…]` block from arbitrary lead prose and parse it.
/// Returns `None` when nothing parseable is found; the caller degrades to
/// "no fix".
pub fn parse_fix_assignments(reply: &str) -> Option<Vec<FixAssignment>> {
    let block = extract_json_array(reply)?;
    serde_json::from_str(block).ok()
}

fn extract_json_array(text: &str) -> Option<&str> {
    let start = text.find('[')?;
    let bytes = text.as_bytes();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, &byte) in bytes[start..].iter().enumerate() {
        if escaped {
            escaped = false;
            continue;
        }
        match byte {
            b'\\' if in_string => escaped = true,
            b'"' => in_string = !in_string,
            b'[' if !in_string => depth += 1,
            b']' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..=start + offset]);
                }
            }
            _ => {}
        }
    }
    None
}

fn record_outcome(record: &Arc<Mutex<MissionRecord>>, agent_id: &str, result: Result<String>) {
    let outcome = match result {
        Ok(output) => WorkerOutcome {
            status: WorkerStatus::Success,
            output,
        },
        Err(error) => WorkerOutcome {
            status: WorkerStatus::Error,
            output: error.to_string(),
        },
    };
    let mut record = record.lock().expect("mission record lock poisoned");
    record.worker_results.insert(agent_id.to_string(), outcome);
}

fn set_phase(record: &Arc<Mutex<MissionRecord>>, phase: MissionPhase) {
    let mut record = record.lock().expect("mission record lock poisoned");
    record.phase = phase;
}

fn lead_working_dir(deps: &EngineDeps, team_id: &str, lead_id: &str) -> PathBuf {
    deps.store
        .agent(team_id, lead_id)
        .map(|agent| agent.working_dir)
        .unwrap_or_else(|_| PathBuf::from("."))
}

fn worker_views(
    deps: &EngineDeps,
    record: &Arc<Mutex<MissionRecord>>,
    worker_ids: &[AgentId],
) -> Vec<Value> {
    let team_id = {
        let record = record.lock().expect("mission record lock poisoned");
        record.team_id.clone()
    };
    worker_ids
        .iter()
        .map(|id| match deps.store.agent(&team_id, id) {
            Ok(agent) => context! {
                id => agent.id,
                role => agent.role,
                specialization => agent.specialization,
            },
            Err(_) => context! { id => id, role => "worker", specialization => "" },
        })
        .collect()
}

fn worker_prompt(
    deps: &EngineDeps,
    record: &Arc<Mutex<MissionRecord>>,
    objective: &str,
    team_name: &str,
    worker_id: &str,
) -> String {
    let team_id = {
        let record = record.lock().expect("mission record lock poisoned");
        record.team_id.clone()
    };
    let (role, teammates) = match deps.store.team(&team_id) {
        Ok(team) => {
            let role = team
                .agents
                .get(worker_id)
                .map(|agent| agent.role.clone())
                .unwrap_or_else(|| "worker".to_string());
            let teammates = team
                .roster()
                .iter()
                .map(|mate| context! { id => mate.id, role => mate.role, lead => mate.lead })
                .collect::<Vec<Value>>();
            (role, teammates)
        }
        Err(_) => ("worker".to_string(), Vec::new()),
    };

    prompts::render(
        "mission_worker",
        context! {
            agent_id => worker_id,
            role => role,
            team_name => team_name,
            objective => objective,
            teammates => teammates,
        },
    )
}
