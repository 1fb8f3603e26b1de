//! Per-agent instruction composition.
//!
//! A pure function of the agent, its team roster, and (for leads) a snapshot
//! of the other teams. Equal inputs always render the same prompt; the
//! property is load-bearing because the adapter re-composes instructions on
//! every session restart.

use crate::prompts;
use crate::state::{Agent, Team};

use minijinja::{Value, context};

/// Compose the system prompt handed to the downstream process on `start`.
///
/// When the agent's team is not in state (racing a dissolution), only the
/// agent's own instruction addendum is returned.
pub fn compose(agent: &Agent, team: Option<&Team>, other_teams: &[Team]) -> String {
    let Some(team) = team else {
        return agent.instructions.clone();
    };

    let teammates = team
        .roster()
        .iter()
        .map(|mate| {
            context! {
                id => mate.id,
                role => mate.role,
                specialization => mate.specialization,
                lead => mate.lead,
            }
        })
        .collect::<Vec<Value>>();

    let other_teams = if agent.lead {
        let mut snapshot = other_teams
            .iter()
            .filter(|other| other.id != team.id)
            .collect::<Vec<_>>();
        snapshot.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        snapshot
            .into_iter()
            .map(|other| {
                context! {
                    name => other.name,
                    members => other
                        .roster()
                        .iter()
                        .map(|member| context! { id => member.id, role => member.role })
                        .collect::<Vec<Value>>(),
                }
            })
            .collect::<Vec<Value>>()
    } else {
        Vec::new()
    };

    prompts::render(
        "agent_instructions",
        context! {
            agent_id => agent.id,
            role => agent.role,
            specialization => agent.specialization,
            lead => agent.lead,
            team_name => team.name,
            teammates => teammates,
            other_teams => other_teams,
            cross_team_hint => prompts::CROSS_TEAM_HINT,
            addendum => agent.instructions,
        },
    )
}
