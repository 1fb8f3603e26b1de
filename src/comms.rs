//! Agent-facing comms service: a loopback HTTP endpoint handing each
//! downstream agent an identity-bound session onto the message bus.

pub mod server;
pub mod service;

pub use server::{CommsServer, CommsState, start_comms_server};
pub use service::AgentSession;
