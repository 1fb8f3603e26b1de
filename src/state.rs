//! Team, agent, and task state.

pub mod store;

pub use store::{Agent, AgentSpec, Task, Team, TeamStore};
