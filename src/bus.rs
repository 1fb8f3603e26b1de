//! Inter-agent message bus: team channels, DMs, the cross-team lead channel,
//! shared artifacts, and the blocking wait primitive.

pub mod store;
pub mod wait;

pub use store::{Artifact, ChatMessage, MessageBus, TeamComms};
pub use wait::WaitOutcome;
