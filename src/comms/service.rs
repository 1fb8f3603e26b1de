//! Identity-bound session operations.
//!
//! Every operation is pinned to the session's agent id — request parameters
//! can never act as someone else. Authorization is enforced here: same-team
//! DMs (or lead-to-lead across teams), leads-only lead channel.

use crate::bus::MessageBus;
use crate::error::{BusError, Result};
use crate::prompts::CROSS_TEAM_HINT;
use crate::state::{Agent, Team, TeamStore};
use crate::{AgentId, TeamId};

use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;

/// One authenticated comms session.
#[derive(Clone)]
pub struct AgentSession {
    pub agent_id: AgentId,
    pub store: Arc<TeamStore>,
    pub bus: Arc<MessageBus>,
}

#[derive(Debug, Deserialize)]
pub struct TextParams {
    pub text: String,
}

#[derive(Debug, Deserialize)]
pub struct DmSendParams {
    pub to: AgentId,
    pub text: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct DmReadParams {
    #[serde(default)]
    pub from: Option<AgentId>,
}

#[derive(Debug, Deserialize)]
pub struct ShareParams {
    pub data: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct WaitParams {
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl AgentSession {
    fn caller(&self) -> Result<(TeamId, Agent)> {
        self.store.find_agent(&self.agent_id)
    }

    pub fn group_post(&self, params: TextParams) -> Result<Value> {
        let (team_id, agent) = self.caller()?;
        self.bus
            .group_post(&team_id, &agent.id, &agent.role, &params.text)?;
        Ok(json!({ "posted": true }))
    }

    pub fn group_read(&self) -> Result<Value> {
        let (team_id, agent) = self.caller()?;
        let messages = self.bus.group_read(&team_id, &agent.id);
        Ok(serde_json::to_value(messages)?)
    }

    pub fn group_peek(&self) -> Result<Value> {
        let (team_id, agent) = self.caller()?;
        Ok(json!({ "count": self.bus.group_peek(&team_id, &agent.id) }))
    }

    pub fn dm_send(&self, params: DmSendParams) -> Result<Value> {
        let (team_id, agent) = self.caller()?;
        let (target_team, target) = self
            .store
            .find_agent(&params.to)
            .map_err(|_| BusError::AgentNotFound(params.to.clone()))?;

        let same_team = target_team == team_id;
        let both_leads = agent.lead && target.lead;
        if !same_team && !both_leads {
            return Err(BusError::Unauthorized(format!(
                "DMs to '{}' require the same team or lead-to-lead",
                target.id
            ))
            .into());
        }

        self.bus
            .dm_send(&agent.id, &target.id, &agent.role, &params.text)?;
        Ok(json!({ "sent": true }))
    }

    pub fn dm_read(&self, params: DmReadParams) -> Result<Value> {
        let (_, agent) = self.caller()?;
        let messages = self.bus.dm_read(&agent.id, params.from.as_deref());
        Ok(serde_json::to_value(messages)?)
    }

    pub fn dm_peek(&self) -> Result<Value> {
        let (_, agent) = self.caller()?;
        Ok(json!({ "count": self.bus.dm_peek(&agent.id) }))
    }

    pub fn lead_post(&self, params: TextParams) -> Result<Value> {
        let (team_id, agent) = self.require_lead()?;
        let team = self.store.team(&team_id)?;
        self.bus
            .lead_post(&agent.id, &agent.role, &team.name, &params.text)?;
        Ok(json!({ "posted": true }))
    }

    pub fn lead_read(&self) -> Result<Value> {
        let (_, agent) = self.require_lead()?;
        Ok(serde_json::to_value(self.bus.lead_read(&agent.id))?)
    }

    pub fn lead_peek(&self) -> Result<Value> {
        let (_, agent) = self.require_lead()?;
        Ok(json!({ "count": self.bus.lead_peek(&agent.id) }))
    }

    pub fn share(&self, params: ShareParams) -> Result<Value> {
        let (team_id, agent) = self.caller()?;
        self.bus.share(&team_id, &agent.id, &params.data)?;
        Ok(json!({ "shared": true }))
    }

    pub fn get_shared(&self) -> Result<Value> {
        let (team_id, _) = self.caller()?;
        Ok(serde_json::to_value(self.bus.get_shared(&team_id))?)
    }

    /// The caller's team plus every other team's public roster.
    pub fn get_team_context(&self) -> Result<Value> {
        let (team_id, agent) = self.caller()?;
        let team = self.store.team(&team_id)?;

        let other_teams = self
            .store
            .teams()
            .into_iter()
            .filter(|other| other.id != team_id)
            .map(|other| {
                json!({
                    "name": other.name,
                    "members": roster_view(&other),
                })
            })
            .collect::<Vec<_>>();

        Ok(json!({
            "team": {
                "name": team.name,
                "you": {
                    "id": agent.id,
                    "role": agent.role,
                    "lead": agent.lead,
                },
                "teammates": roster_view(&team),
            },
            "other_teams": other_teams,
            "hint": CROSS_TEAM_HINT,
        }))
    }

    pub async fn wait(&self, params: WaitParams) -> Result<Value> {
        let (team_id, agent) = self.caller()?;
        let outcome = self
            .bus
            .wait(&team_id, &agent.id, agent.lead, params.timeout_ms)
            .await;
        Ok(serde_json::to_value(outcome)?)
    }

    fn require_lead(&self) -> Result<(TeamId, Agent)> {
        let (team_id, agent) = self.caller()?;
        if !agent.lead {
            return Err(BusError::Unauthorized(
                "the lead channel requires the lead flag".to_string(),
            )
            .into());
        }
        Ok((team_id, agent))
    }
}

fn roster_view(team: &Team) -> Vec<Value> {
    team.roster()
        .iter()
        .map(|member| {
            json!({
                "id": member.id,
                "role": member.role,
                "specialization": member.specialization,
                "lead": member.lead,
                "status": member.status,
                "tasks": member.task_ids,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::AgentSpec;

    struct Fixture {
        store: Arc<TeamStore>,
        bus: Arc<MessageBus>,
        t1_lead: AgentId,
        t1_worker: AgentId,
        t2_lead: AgentId,
        t2_worker: AgentId,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(TeamStore::new());
        let bus = Arc::new(MessageBus::new());
        let mut ids = Vec::new();
        for name in ["t1", "t2"] {
            let team = store
                .create_team(
                    name,
                    vec![
                        AgentSpec {
                            role: "lead".to_string(),
                            lead: true,
                            ..Default::default()
                        },
                        AgentSpec {
                            role: "worker".to_string(),
                            ..Default::default()
                        },
                    ],
                )
                .expect("team created");
            let lead = team.lead().expect("lead").id.clone();
            let worker = team
                .roster()
                .into_iter()
                .find(|a| !a.lead)
                .expect("worker")
                .id;
            ids.push((lead, worker));
        }
        Fixture {
            store,
            bus,
            t1_lead: ids[0].0.clone(),
            t1_worker: ids[0].1.clone(),
            t2_lead: ids[1].0.clone(),
            t2_worker: ids[1].1.clone(),
        }
    }

    fn session(fixture: &Fixture, agent_id: &str) -> AgentSession {
        AgentSession {
            agent_id: agent_id.to_string(),
            store: fixture.store.clone(),
            bus: fixture.bus.clone(),
        }
    }

    #[test]
    fn cross_team_dms_require_both_leads() {
        let fixture = fixture();

        session(&fixture, &fixture.t1_lead)
            .dm_send(DmSendParams {
                to: fixture.t2_lead.clone(),
                text: "hi".to_string(),
            })
            .expect("lead-to-lead crosses teams");

        let error = session(&fixture, &fixture.t1_worker)
            .dm_send(DmSendParams {
                to: fixture.t2_worker.clone(),
                text: "hi".to_string(),
            })
            .expect_err("worker-to-worker across teams must fail");
        assert_eq!(error.kind(), crate::error::ErrorKind::Unauthorized);

        let error = session(&fixture, &fixture.t1_lead)
            .dm_send(DmSendParams {
                to: fixture.t2_worker.clone(),
                text: "hi".to_string(),
            })
            .expect_err("lead-to-worker across teams must fail");
        assert_eq!(error.kind(), crate::error::ErrorKind::Unauthorized);

        session(&fixture, &fixture.t1_worker)
            .dm_send(DmSendParams {
                to: fixture.t1_lead.clone(),
                text: "hi".to_string(),
            })
            .expect("same-team DM is allowed");
    }

    #[test]
    fn dm_to_unknown_agent_is_not_found() {
        let fixture = fixture();
        let error = session(&fixture, &fixture.t1_lead)
            .dm_send(DmSendParams {
                to: "ghost-000000000000".to_string(),
                text: "hi".to_string(),
            })
            .expect_err("unknown DM target");
        assert_eq!(error.kind(), crate::error::ErrorKind::NotFound);
    }

    #[test]
    fn lead_channel_is_leads_only() {
        let fixture = fixture();
        let error = session(&fixture, &fixture.t1_worker)
            .lead_post(TextParams {
                text: "status".to_string(),
            })
            .expect_err("worker on the lead channel must fail");
        assert_eq!(error.kind(), crate::error::ErrorKind::Unauthorized);

        session(&fixture, &fixture.t1_lead)
            .lead_post(TextParams {
                text: "status".to_string(),
            })
            .expect("lead may post");
        let read = session(&fixture, &fixture.t2_lead)
            .lead_read()
            .expect("other lead may read");
        let text = read[0]["text"].as_str().expect("text field");
        assert!(text.starts_with("[t1] "));
    }

    #[test]
    fn team_context_lists_self_teammates_and_other_teams() {
        let fixture = fixture();
        let context = session(&fixture, &fixture.t1_worker)
            .get_team_context()
            .expect("context renders");

        assert_eq!(context["team"]["name"], "t1");
        assert_eq!(context["team"]["you"]["id"], fixture.t1_worker.as_str());
        assert_eq!(
            context["team"]["teammates"]
                .as_array()
                .expect("teammates")
                .len(),
            2
        );
        assert_eq!(context["other_teams"].as_array().expect("others").len(), 1);
        assert_eq!(context["other_teams"][0]["name"], "t2");
        assert!(
            context["hint"]
                .as_str()
                .expect("hint string")
                .contains("lead")
        );
    }

    #[test]
    fn ops_are_pinned_to_the_session_identity() {
        let fixture = fixture();
        session(&fixture, &fixture.t1_worker)
            .group_post(TextParams {
                text: "from worker".to_string(),
            })
            .expect("post");

        // The lead reads the worker's post; the worker reads nothing back.
        let lead_read = session(&fixture, &fixture.t1_lead)
            .group_read()
            .expect("read");
        assert_eq!(lead_read.as_array().expect("messages").len(), 1);
        let own_read = session(&fixture, &fixture.t1_worker)
            .group_read()
            .expect("read");
        assert!(own_read.as_array().expect("messages").is_empty());
    }
}
