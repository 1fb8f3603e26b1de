//! Prompt templates, rendered with minijinja.
//!
//! All templates are embedded at compile time and registered once in a
//! process-wide environment. Rendering is deterministic: equal context in,
//! identical string out.

use minijinja::Environment;
use std::sync::OnceLock;

/// Static hint appended to team context so agents know how to reach peers on
/// other teams.
pub const CROSS_TEAM_HINT: &str = "Leads can post on the cross-team lead channel and DM other leads; \
workers coordinate through their own lead.";

const AGENT_INSTRUCTIONS: &str = r#"You are {{ agent_id }}, the {{ role }}{% if specialization %} ({{ specialization }}){% endif %} on team "{{ team_name }}".
{%- if lead %}
You are the team lead: break work down, delegate, and keep the team unblocked.
{%- endif %}

## Your team
{% for mate in teammates -%}
- {{ mate.id }} — {{ mate.role }}{% if mate.specialization %}, {{ mate.specialization }}{% endif %}{% if mate.lead %} [lead]{% endif %}{% if mate.id == agent_id %} (you){% endif %}
{% endfor %}
{%- if other_teams %}
## Other teams
{% for team in other_teams -%}
- {{ team.name }}: {% for member in team.members %}{{ member.id }} ({{ member.role }}){% if not loop.last %}, {% endif %}{% endfor %}
{% endfor %}
{{ cross_team_hint }}
{%- endif %}

## Coordination tools
Your crewbot MCP server exposes the team message bus:
- group_post / group_read / group_peek — the team channel. Reads never echo your own posts.
- dm_send / dm_read / dm_peek — direct messages. Same team only{% if lead %}, or lead-to-lead across teams{% endif %}.
{%- if lead %}
- lead_post / lead_read / lead_peek — the cross-team lead channel.
{%- endif %}
- share / get_shared — publish deliverables (file paths, summaries) to the team artifact log.
- get_team_context — current rosters and statuses.
- wait — block until a teammate posts something for you; use it instead of polling.

## Working agreement
- Check group chat and DMs before starting and after finishing a work item.
- Post progress that teammates depend on; share artifacts instead of pasting large content into chat.
- Stay within your role; hand off work that belongs to a teammate.
{%- if addendum %}

{{ addendum }}
{%- endif %}"#;

const TASK_KICK: &str = r#"You have been assigned a task.

Task: {{ description }}
{%- if prerequisites %}
Completed prerequisite work:
{% for prereq in prerequisites -%}
- {{ prereq.description }}{% if prereq.result %}: {{ prereq.result }}{% endif %}
{% endfor -%}
{%- endif %}

Work the task to completion and reply with your result."#;

const MISSION_LEAD: &str = r#"You are the lead of team "{{ team_name }}" on the following mission.

Mission objective: {{ objective }}

Your workers:
{% for worker in workers -%}
- {{ worker.id }} — {{ worker.role }}{% if worker.specialization %}, {{ worker.specialization }}{% endif %}
{% endfor %}
Each worker has already received their marching orders and is starting now.
Plan the approach, post guidance to group chat, answer DMs, and keep workers
coordinated while they execute. Do not do the workers' jobs for them."#;

const MISSION_WORKER: &str = r#"You are {{ agent_id }}, the {{ role }} on team "{{ team_name }}".

Mission objective: {{ objective }}

Your teammates:
{% for mate in teammates -%}
- {{ mate.id }} — {{ mate.role }}{% if mate.lead %} [lead]{% endif %}
{% endfor %}
Execute your part of the objective with autonomy. Coordinate through group
chat and DMs when your work overlaps a teammate's, share deliverables through
the artifact log, and reply with a concise summary of what you completed."#;

const MISSION_FIX: &str = r#"Verification failed. Output:

{{ failure_output }}

Assign fix-up tasks to your workers. Reply with ONLY a JSON array, no prose:
[{"agentId": "<worker id>", "task": "<what to fix>"}]
Valid worker ids: {% for id in worker_ids %}{{ id }}{% if not loop.last %}, {% endif %}{% endfor %}.
Reply with [] if no fixes are needed."#;

const MISSION_REVIEW: &str = r#"The mission is wrapping up. Compile the final report.

Mission objective: {{ objective }}

Worker outcomes:
{% for outcome in outcomes -%}
- {{ outcome.agent_id }} ({{ outcome.status }}): {{ outcome.output }}
{% endfor %}
{%- if verification %}
Final verification: {{ verification }}
{%- endif %}

Write the final mission report: what was accomplished, what failed, and
anything the operator must follow up on."#;

const STEER_REDIRECT: &str = r#"Direction change from the operator. Stop your current approach.

New directive: {{ directive }}

Check group chat for the coordination message, adjust your plan to the new
directive, and confirm what you will do next."#;

/// Render a registered template. Template names are compile-time constants,
/// so a failure here is a programming error surfaced as an error string.
pub fn render(name: &str, ctx: minijinja::Value) -> String {
    match environment().get_template(name) {
        Ok(template) => template.render(ctx).unwrap_or_else(|error| {
            tracing::error!(template = name, %error, "prompt render failed");
            String::new()
        }),
        Err(error) => {
            tracing::error!(template = name, %error, "unknown prompt template");
            String::new()
        }
    }
}

fn environment() -> &'static Environment<'static> {
    static ENVIRONMENT: OnceLock<Environment<'static>> = OnceLock::new();
    ENVIRONMENT.get_or_init(|| {
        let mut environment = Environment::new();
        for (name, source) in [
            ("agent_instructions", AGENT_INSTRUCTIONS),
            ("task_kick", TASK_KICK),
            ("mission_lead", MISSION_LEAD),
            ("mission_worker", MISSION_WORKER),
            ("mission_fix", MISSION_FIX),
            ("mission_review", MISSION_REVIEW),
            ("steer_redirect", STEER_REDIRECT),
        ] {
            environment
                .add_template(name, source)
                .expect("embedded template must parse");
        }
        environment
    })
}
