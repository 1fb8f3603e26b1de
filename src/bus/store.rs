//! Channel storage and delivery semantics.
//!
//! Every channel is an append-only message vector plus per-reader cursors.
//! Group and lead reads suppress the reader's own posts; DM channels are
//! keyed by the canonicalized unordered pair of participants so both ends
//! always reach the same channel.

use crate::bus::wait::{self, BusEvent, ObserverRegistry, Wake, WaitOutcome};
use crate::error::{BusError, Result};
use crate::{AgentId, TeamId};

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

/// Upper bound on chat and DM payloads, in characters.
pub const MAX_CHAT_CHARS: usize = 50_000;
/// Upper bound on shared-artifact payloads, in characters.
pub const MAX_SHARE_CHARS: usize = 100_000;

/// A single chat message on any channel.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ChatMessage {
    pub id: String,
    pub sender: AgentId,
    /// Role label of the sender at post time.
    pub role: String,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

/// An append-only shared deliverable attached to a team.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Artifact {
    pub sender: AgentId,
    pub data: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Default, Clone)]
struct Channel {
    messages: Vec<ChatMessage>,
    cursors: HashMap<AgentId, usize>,
}

impl Channel {
    fn append(&mut self, sender: &str, role: &str, text: String) {
        self.messages.push(ChatMessage {
            id: uuid::Uuid::new_v4().to_string(),
            sender: sender.to_string(),
            role: role.to_string(),
            text,
            timestamp: Utc::now(),
        });
    }

    /// Unread messages for `reader`, own posts excluded. Advances the cursor
    /// past everything seen, own posts included.
    fn read_for(&mut self, reader: &str) -> Vec<ChatMessage> {
        let cursor = self.cursors.get(reader).copied().unwrap_or(0);
        let unread = self.messages[cursor..]
            .iter()
            .filter(|message| message.sender != reader)
            .cloned()
            .collect();
        self.cursors.insert(reader.to_string(), self.messages.len());
        unread
    }

    fn peek_for(&self, reader: &str) -> usize {
        let cursor = self.cursors.get(reader).copied().unwrap_or(0);
        self.messages[cursor..]
            .iter()
            .filter(|message| message.sender != reader)
            .count()
    }
}

/// Canonical key for the unordered DM pair `{a, b}`.
fn dm_key(a: &str, b: &str) -> (AgentId, AgentId) {
    if a <= b {
        (a.to_string(), b.to_string())
    } else {
        (b.to_string(), a.to_string())
    }
}

/// Live or snapshotted view of everything a team has said and shared.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct TeamComms {
    pub group_chat: Vec<ChatMessage>,
    /// DM logs keyed by `"<a> <-> <b>"`.
    pub dms: BTreeMap<String, Vec<ChatMessage>>,
    /// Lead-channel messages authored by team members.
    pub lead_chat: Vec<ChatMessage>,
    pub artifacts: Vec<Artifact>,
}

/// The process-wide message bus.
#[derive(Default)]
pub struct MessageBus {
    groups: Mutex<HashMap<TeamId, Channel>>,
    dms: Mutex<HashMap<(AgentId, AgentId), Channel>>,
    lead: Mutex<Channel>,
    artifacts: Mutex<HashMap<TeamId, Vec<Artifact>>>,
    observers: ObserverRegistry,
}

impl MessageBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn group_post(&self, team: &str, from: &str, role: &str, text: &str) -> Result<()> {
        check_len(text, MAX_CHAT_CHARS)?;
        {
            let mut groups = self.groups.lock().expect("group lock poisoned");
            groups
                .entry(team.to_string())
                .or_default()
                .append(from, role, text.to_string());
        }
        self.observers.publish(&BusEvent::Group {
            team: team.to_string(),
            from: from.to_string(),
        });
        Ok(())
    }

    pub fn group_read(&self, team: &str, from: &str) -> Vec<ChatMessage> {
        let mut groups = self.groups.lock().expect("group lock poisoned");
        groups
            .get_mut(team)
            .map(|channel| channel.read_for(from))
            .unwrap_or_default()
    }

    pub fn group_peek(&self, team: &str, from: &str) -> usize {
        let groups = self.groups.lock().expect("group lock poisoned");
        groups
            .get(team)
            .map(|channel| channel.peek_for(from))
            .unwrap_or(0)
    }

    pub fn dm_send(&self, from: &str, to: &str, role: &str, text: &str) -> Result<()> {
        check_len(text, MAX_CHAT_CHARS)?;
        {
            let mut dms = self.dms.lock().expect("dm lock poisoned");
            dms.entry(dm_key(from, to))
                .or_default()
                .append(from, role, text.to_string());
        }
        self.observers.publish(&BusEvent::Dm {
            to: to.to_string(),
        });
        Ok(())
    }

    /// Read unread DMs. With a sender filter, only that pair's channel is
    /// read (and only its cursor advances); otherwise unread messages across
    /// every channel the receiver participates in are merged by timestamp.
    pub fn dm_read(&self, receiver: &str, from: Option<&str>) -> Vec<ChatMessage> {
        let mut dms = self.dms.lock().expect("dm lock poisoned");
        match from {
            Some(sender) => dms
                .get_mut(&dm_key(receiver, sender))
                .map(|channel| channel.read_for(receiver))
                .unwrap_or_default(),
            None => {
                let mut merged = Vec::new();
                for ((a, b), channel) in dms.iter_mut() {
                    if a == receiver || b == receiver {
                        merged.extend(channel.read_for(receiver));
                    }
                }
                merged.sort_by(|x, y| x.timestamp.cmp(&y.timestamp));
                merged
            }
        }
    }

    pub fn dm_peek(&self, receiver: &str) -> usize {
        let dms = self.dms.lock().expect("dm lock poisoned");
        dms.iter()
            .filter(|((a, b), _)| a == receiver || b == receiver)
            .map(|(_, channel)| channel.peek_for(receiver))
            .sum()
    }

    /// Post to the singleton cross-team lead channel. The payload is prefixed
    /// with the sender's team name so leads can attribute it.
    pub fn lead_post(&self, from: &str, role: &str, team_name: &str, text: &str) -> Result<()> {
        check_len(text, MAX_CHAT_CHARS)?;
        {
            let mut lead = self.lead.lock().expect("lead lock poisoned");
            lead.append(from, role, format!("[{team_name}] {text}"));
        }
        self.observers.publish(&BusEvent::Lead {
            from: from.to_string(),
        });
        Ok(())
    }

    pub fn lead_read(&self, from: &str) -> Vec<ChatMessage> {
        let mut lead = self.lead.lock().expect("lead lock poisoned");
        lead.read_for(from)
    }

    pub fn lead_peek(&self, from: &str) -> usize {
        let lead = self.lead.lock().expect("lead lock poisoned");
        lead.peek_for(from)
    }

    pub fn share(&self, team: &str, from: &str, data: &str) -> Result<()> {
        check_share_len(data)?;
        let mut artifacts = self.artifacts.lock().expect("artifact lock poisoned");
        artifacts.entry(team.to_string()).or_default().push(Artifact {
            sender: from.to_string(),
            data: data.to_string(),
            timestamp: Utc::now(),
        });
        Ok(())
    }

    pub fn get_shared(&self, team: &str) -> Vec<Artifact> {
        let artifacts = self.artifacts.lock().expect("artifact lock poisoned");
        artifacts.get(team).cloned().unwrap_or_default()
    }

    /// Current unread counts for an agent, without blocking.
    pub fn unread_counts(&self, team: &str, agent: &str, is_lead: bool) -> WaitOutcome {
        WaitOutcome {
            timed_out: false,
            dissolved: false,
            group_chat: self.group_peek(team, agent),
            dms: self.dm_peek(agent),
            lead_chat: if is_lead { self.lead_peek(agent) } else { 0 },
        }
    }

    /// Block until the agent has something to read, its team dissolves, or
    /// the (clamped) timeout elapses. Returns immediately when any unread
    /// count is already positive.
    pub async fn wait(
        &self,
        team: &str,
        agent: &str,
        is_lead: bool,
        timeout_ms: Option<u64>,
    ) -> WaitOutcome {
        let timeout = std::time::Duration::from_millis(wait::clamp_timeout_ms(timeout_ms));
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let counts = self.unread_counts(team, agent, is_lead);
            if counts.has_unread() {
                return counts;
            }

            let mut rx = self.observers.register(team, agent, is_lead);

            // An append may have slipped in between the count check and the
            // registration; re-check before parking.
            let counts = self.unread_counts(team, agent, is_lead);
            if counts.has_unread() {
                rx.close();
                return counts;
            }

            match tokio::time::timeout_at(deadline, rx).await {
                Ok(Ok(Wake::Dissolved)) => return WaitOutcome::dissolved(),
                Ok(Ok(Wake::Delivery)) | Ok(Err(_)) => continue,
                Err(_) => return WaitOutcome::timed_out(),
            }
        }
    }

    /// Drop every channel the team owned. DM channels are removed whenever
    /// either endpoint was a member; member cursors on the lead channel are
    /// cleared; parked waiters belonging to the members are woken with
    /// `dissolved`.
    pub fn dissolve_team(&self, team: &str, member_ids: &[AgentId]) {
        {
            let mut groups = self.groups.lock().expect("group lock poisoned");
            groups.remove(team);
        }
        {
            let mut artifacts = self.artifacts.lock().expect("artifact lock poisoned");
            artifacts.remove(team);
        }
        {
            let mut dms = self.dms.lock().expect("dm lock poisoned");
            dms.retain(|(a, b), _| {
                !member_ids.iter().any(|id| id == a) && !member_ids.iter().any(|id| id == b)
            });
        }
        {
            let mut lead = self.lead.lock().expect("lead lock poisoned");
            for id in member_ids {
                lead.cursors.remove(id);
            }
        }
        for id in member_ids {
            self.observers.publish(&BusEvent::Dissolved { agent: id.clone() });
        }
        tracing::debug!(team_id = %team, members = member_ids.len(), "bus channels dissolved");
    }

    /// Full view of a team's channels and artifacts: group chat, DM channels
    /// touching any member, members' lead-channel posts, and the artifact log.
    pub fn team_comms(&self, team: &str, member_ids: &[AgentId]) -> TeamComms {
        let group_chat = {
            let groups = self.groups.lock().expect("group lock poisoned");
            groups
                .get(team)
                .map(|channel| channel.messages.clone())
                .unwrap_or_default()
        };

        let dms = {
            let dms = self.dms.lock().expect("dm lock poisoned");
            dms.iter()
                .filter(|((a, b), _)| {
                    member_ids.iter().any(|id| id == a) || member_ids.iter().any(|id| id == b)
                })
                .map(|((a, b), channel)| (format!("{a} <-> {b}"), channel.messages.clone()))
                .collect()
        };

        let lead_chat = {
            let lead = self.lead.lock().expect("lead lock poisoned");
            lead.messages
                .iter()
                .filter(|message| member_ids.iter().any(|id| *id == message.sender))
                .cloned()
                .collect()
        };

        TeamComms {
            group_chat,
            dms,
            lead_chat,
            artifacts: self.get_shared(team),
        }
    }
}

fn check_len(text: &str, max: usize) -> Result<()> {
    let len = text.chars().count();
    if len > max {
        return Err(BusError::PayloadTooLarge { len, max }.into());
    }
    Ok(())
}

fn check_share_len(data: &str) -> Result<()> {
    check_len(data, MAX_SHARE_CHARS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_read_suppresses_own_posts_and_advances_cursor() {
        let bus = MessageBus::new();
        bus.group_post("team-1", "dev-a", "dev", "one").expect("post");
        bus.group_post("team-1", "dev-b", "dev", "two").expect("post");
        bus.group_post("team-1", "dev-a", "dev", "three").expect("post");

        assert_eq!(bus.group_peek("team-1", "dev-a"), 1);
        let read = bus.group_read("team-1", "dev-a");
        assert_eq!(
            read.iter().map(|m| m.text.as_str()).collect::<Vec<_>>(),
            vec!["two"]
        );

        // Cursor is past everything, own posts included.
        assert_eq!(bus.group_peek("team-1", "dev-a"), 0);
        assert!(bus.group_read("team-1", "dev-a").is_empty());

        // The other reader still sees the full stream minus their own post.
        let read = bus.group_read("team-1", "dev-b");
        assert_eq!(
            read.iter().map(|m| m.text.as_str()).collect::<Vec<_>>(),
            vec!["one", "three"]
        );
    }

    #[test]
    fn dm_channels_are_symmetric() {
        let bus = MessageBus::new();
        bus.dm_send("dev-b", "dev-a", "dev", "hello a").expect("send");
        bus.dm_send("dev-a", "dev-b", "dev", "hello b").expect("send");

        let for_a = bus.dm_read("dev-a", None);
        assert_eq!(
            for_a.iter().map(|m| m.text.as_str()).collect::<Vec<_>>(),
            vec!["hello a"]
        );
        let for_b = bus.dm_read("dev-b", None);
        assert_eq!(
            for_b.iter().map(|m| m.text.as_str()).collect::<Vec<_>>(),
            vec!["hello b"]
        );
        assert_eq!(bus.dm_peek("dev-a"), 0);
        assert_eq!(bus.dm_peek("dev-b"), 0);
    }

    #[test]
    fn filtered_dm_read_leaves_other_cursors_alone() {
        let bus = MessageBus::new();
        bus.dm_send("dev-b", "dev-a", "dev", "from b").expect("send");
        bus.dm_send("dev-c", "dev-a", "dev", "from c").expect("send");

        let from_b = bus.dm_read("dev-a", Some("dev-b"));
        assert_eq!(from_b.len(), 1);
        assert_eq!(from_b[0].text, "from b");

        // The c channel is untouched by the filtered read.
        assert_eq!(bus.dm_peek("dev-a"), 1);
        let rest = bus.dm_read("dev-a", None);
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].text, "from c");
    }

    #[test]
    fn unfiltered_dm_read_merges_by_timestamp() {
        let bus = MessageBus::new();
        bus.dm_send("dev-b", "dev-a", "dev", "first").expect("send");
        bus.dm_send("dev-c", "dev-a", "dev", "second").expect("send");
        bus.dm_send("dev-b", "dev-a", "dev", "third").expect("send");

        let merged = bus.dm_read("dev-a", None);
        assert_eq!(
            merged.iter().map(|m| m.text.as_str()).collect::<Vec<_>>(),
            vec!["first", "second", "third"]
        );
    }

    #[test]
    fn lead_channel_prefixes_team_name() {
        let bus = MessageBus::new();
        bus.lead_post("lead-a", "lead", "alpha", "status ok").expect("post");

        let read = bus.lead_read("lead-b");
        assert_eq!(read.len(), 1);
        assert_eq!(read[0].text, "[alpha] status ok");
        assert_eq!(bus.lead_peek("lead-a"), 0, "own posts never counted");
    }

    #[test]
    fn payload_bounds_are_enforced() {
        let bus = MessageBus::new();
        let oversized = "x".repeat(MAX_CHAT_CHARS + 1);
        let error = bus
            .group_post("team-1", "dev-a", "dev", &oversized)
            .expect_err("oversized chat payload must fail");
        assert_eq!(error.kind(), crate::error::ErrorKind::InvalidArgument);

        let big_share = "x".repeat(MAX_SHARE_CHARS);
        bus.share("team-1", "dev-a", &big_share)
            .expect("share at the limit should pass");
    }

    #[tokio::test]
    async fn wait_returns_immediately_when_unread_exists() {
        let bus = MessageBus::new();
        bus.group_post("team-1", "dev-b", "dev", "ping").expect("post");

        let outcome = bus.wait("team-1", "dev-a", false, Some(1_000)).await;
        assert!(!outcome.timed_out);
        assert_eq!(outcome.group_chat, 1);
    }

    #[tokio::test]
    async fn wait_wakes_on_relevant_post() {
        let bus = std::sync::Arc::new(MessageBus::new());
        let waiter = {
            let bus = bus.clone();
            tokio::spawn(async move { bus.wait("team-1", "dev-a", false, Some(30_000)).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        bus.dm_send("dev-b", "dev-a", "dev", "wake up").expect("send");
        let outcome = tokio::time::timeout(std::time::Duration::from_secs(2), waiter)
            .await
            .expect("wait should wake promptly")
            .expect("wait task should not panic");
        assert!(!outcome.timed_out);
        assert_eq!(outcome.dms, 1);
    }

    #[tokio::test]
    async fn wait_ignores_own_posts() {
        let bus = std::sync::Arc::new(MessageBus::new());
        let waiter = {
            let bus = bus.clone();
            tokio::spawn(async move { bus.wait("team-1", "dev-a", false, Some(1_000)).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        bus.group_post("team-1", "dev-a", "dev", "to self").expect("post");
        let outcome = waiter.await.expect("wait task should not panic");
        assert!(outcome.timed_out, "own post must not satisfy a wait");
    }

    #[tokio::test]
    async fn wait_observes_dissolution() {
        let bus = std::sync::Arc::new(MessageBus::new());
        let waiter = {
            let bus = bus.clone();
            tokio::spawn(async move { bus.wait("team-1", "dev-a", false, Some(30_000)).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        bus.dissolve_team("team-1", &["dev-a".to_string()]);
        let outcome = tokio::time::timeout(std::time::Duration::from_secs(2), waiter)
            .await
            .expect("wait should wake on dissolution")
            .expect("wait task should not panic");
        assert!(outcome.dissolved);
        assert!(!outcome.timed_out);
    }

    #[test]
    fn dissolution_removes_half_member_dm_channels() {
        let bus = MessageBus::new();
        bus.dm_send("dev-a", "out-x", "dev", "cross").expect("send");
        bus.dm_send("dev-a", "dev-b", "dev", "inner").expect("send");
        bus.group_post("team-1", "dev-a", "dev", "hi").expect("post");
        bus.share("team-1", "dev-a", "artifact").expect("share");

        bus.dissolve_team("team-1", &["dev-a".to_string(), "dev-b".to_string()]);

        assert_eq!(bus.dm_peek("out-x"), 0, "half-member channel removed");
        assert!(bus.group_read("team-1", "dev-b").is_empty());
        assert!(bus.get_shared("team-1").is_empty());
    }

    #[test]
    fn team_comms_filters_lead_posts_to_members() {
        let bus = MessageBus::new();
        bus.group_post("team-1", "dev-a", "dev", "hi").expect("post");
        bus.lead_post("lead-a", "lead", "alpha", "ours").expect("post");
        bus.lead_post("lead-z", "lead", "zeta", "theirs").expect("post");
        bus.dm_send("dev-a", "dev-b", "dev", "dm").expect("send");
        bus.share("team-1", "dev-a", "thing").expect("share");

        let comms = bus.team_comms(
            "team-1",
            &["dev-a".to_string(), "dev-b".to_string(), "lead-a".to_string()],
        );
        assert_eq!(comms.group_chat.len(), 1);
        assert_eq!(comms.lead_chat.len(), 1);
        assert_eq!(comms.lead_chat[0].sender, "lead-a");
        assert_eq!(comms.dms.len(), 1);
        assert_eq!(comms.artifacts.len(), 1);
    }
}
