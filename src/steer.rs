//! Steering: abort an in-flight team and redirect it.
//!
//! Cancels each target's current downstream call, posts one group-chat
//! announcement under the synthetic orchestrator identity, then sends every
//! target a structured redirect prompt concurrently.

use crate::adapter::AgentAdapter;
use crate::bus::MessageBus;
use crate::error::{Result, StateError};
use crate::state::TeamStore;
use crate::{AgentId, ORCHESTRATOR_ID, ORCHESTRATOR_ROLE, prompts};

use futures::future::join_all;
use minijinja::context;
use serde::Serialize;
use std::sync::Arc;

/// Per-target classification after a steer.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SteerOutcome {
    /// Targets whose in-flight call was aborted.
    pub aborted: Vec<AgentId>,
    /// Targets that acknowledged the redirect.
    pub steered: Vec<AgentId>,
    /// Targets whose redirect call failed.
    pub failed: Vec<AgentId>,
}

/// Redirect a team (or a subset of it) onto a new directive.
pub async fn steer(
    store: &Arc<TeamStore>,
    bus: &Arc<MessageBus>,
    adapter: &Arc<AgentAdapter>,
    team_id: &str,
    directive: &str,
    subset: Option<Vec<AgentId>>,
) -> Result<SteerOutcome> {
    let team = store.team(team_id)?;

    let targets = match subset {
        Some(ids) => {
            if ids.is_empty() {
                return Err(
                    StateError::InvalidArgument("steer subset is empty".to_string()).into(),
                );
            }
            for id in &ids {
                if !team.agents.contains_key(id) {
                    return Err(StateError::AgentNotFound(id.clone()).into());
                }
            }
            ids
        }
        None => team.roster().into_iter().map(|agent| agent.id).collect(),
    };

    let aborted = adapter.cancel_team(&targets);
    tracing::info!(
        team_id,
        targets = targets.len(),
        aborted = aborted.len(),
        "steering team"
    );

    bus.group_post(
        team_id,
        ORCHESTRATOR_ID,
        ORCHESTRATOR_ROLE,
        &format!("Direction change: {directive}"),
    )?;

    let redirect = prompts::render("steer_redirect", context! { directive => directive });
    let calls = targets.iter().map(|agent_id| {
        let adapter = adapter.clone();
        let agent_id = agent_id.clone();
        let redirect = redirect.clone();
        async move {
            let result = adapter.send(&agent_id, &redirect, None).await;
            (agent_id, result.is_ok())
        }
    });

    let mut outcome = SteerOutcome {
        aborted,
        ..SteerOutcome::default()
    };
    for (agent_id, ok) in join_all(calls).await {
        if ok {
            outcome.steered.push(agent_id);
        } else {
            outcome.failed.push(agent_id);
        }
    }
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::MockBackend;
    use crate::error::AdapterError;
    use crate::state::AgentSpec;
    use std::time::Duration;

    fn team_with(store: &Arc<TeamStore>, roles: &[&str]) -> (String, Vec<AgentId>) {
        let specs = roles
            .iter()
            .map(|role| AgentSpec {
                role: role.to_string(),
                ..Default::default()
            })
            .collect();
        let team = store.create_team("steer-test", specs).expect("team created");
        let ids = team.roster().into_iter().map(|agent| agent.id).collect();
        (team.id, ids)
    }

    #[tokio::test]
    async fn targets_partition_into_steered_and_failed() {
        let store = Arc::new(TeamStore::new());
        let bus = Arc::new(MessageBus::new());
        let backend = Arc::new(MockBackend::with_handler(|request| {
            // The stubborn agent rejects its redirect.
            if request.prompt().contains("Direction change")
                || request.prompt().contains("New directive")
            {
                match request {
                    crate::adapter::TurnRequest::Start(turn)
                        if turn.instructions.starts_with("You are stubborn-") =>
                    {
                        return Err(AdapterError::Remote("will not comply".to_string()));
                    }
                    _ => {}
                }
            }
            Ok(crate::adapter::TurnOutput {
                continuation: None,
                text: "acknowledged".to_string(),
            })
        }));
        let adapter = Arc::new(AgentAdapter::new(backend, store.clone()));

        let (team_id, ids) = team_with(&store, &["steady", "stubborn"]);
        let outcome = steer(&store, &bus, &adapter, &team_id, "pivot to plan B", None)
            .await
            .expect("steer should classify outcomes");

        let mut reported = outcome.steered.clone();
        reported.extend(outcome.failed.clone());
        reported.sort();
        let mut expected = ids.clone();
        expected.sort();
        assert_eq!(reported, expected, "steered ∪ failed must equal the target set");
        assert_eq!(outcome.failed.len(), 1);
        assert!(outcome.failed[0].starts_with("stubborn-"));
    }

    #[tokio::test]
    async fn steer_aborts_inflight_calls_and_posts_announcement() {
        let store = Arc::new(TeamStore::new());
        let bus = Arc::new(MessageBus::new());
        let backend = Arc::new(MockBackend::echo().with_delay(Duration::from_millis(80)));
        let adapter = Arc::new(AgentAdapter::new(backend, store.clone()));

        let (team_id, ids) = team_with(&store, &["dev"]);
        let busy = {
            let adapter = adapter.clone();
            let id = ids[0].clone();
            tokio::spawn(async move { adapter.send(&id, "long running work", None).await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;

        let outcome = steer(&store, &bus, &adapter, &team_id, "stop and regroup", None)
            .await
            .expect("steer succeeds");
        assert_eq!(outcome.aborted, ids);
        assert_eq!(outcome.steered, ids);

        let aborted = busy.await.expect("task completes");
        assert!(aborted.is_err(), "original call must observe cancellation");

        let chat = bus.group_read(&team_id, &ids[0]);
        assert!(
            chat.iter()
                .any(|m| m.sender == ORCHESTRATOR_ID && m.text.contains("stop and regroup")),
            "announcement must be in group chat"
        );
    }

    #[tokio::test]
    async fn unknown_subset_member_fails_with_not_found() {
        let store = Arc::new(TeamStore::new());
        let bus = Arc::new(MessageBus::new());
        let backend = Arc::new(MockBackend::echo());
        let adapter = Arc::new(AgentAdapter::new(backend, store.clone()));

        let (team_id, _) = team_with(&store, &["dev"]);
        let error = steer(
            &store,
            &bus,
            &adapter,
            &team_id,
            "go",
            Some(vec!["ghost-000000000000".to_string()]),
        )
        .await
        .expect_err("unknown target must fail");
        assert_eq!(error.kind(), crate::error::ErrorKind::NotFound);
    }
}
