//! Top-level error types for Crewbot.

/// Crate-wide result type alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Stable machine-readable tags for every failure the orchestrator surfaces.
///
/// The operator tool layer stringifies errors; downstream code matches on
/// these tags instead of error message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    InvalidArgument,
    Busy,
    Unauthorized,
    Unauthenticated,
    Forbidden,
    Timeout,
    Canceled,
    Transport,
    RemoteError,
    ParseError,
    NotReady,
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tag = match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::InvalidArgument => "invalid_argument",
            ErrorKind::Busy => "busy",
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::Unauthenticated => "unauthenticated",
            ErrorKind::Forbidden => "forbidden",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Canceled => "canceled",
            ErrorKind::Transport => "transport",
            ErrorKind::RemoteError => "remote_error",
            ErrorKind::ParseError => "parse_error",
            ErrorKind::NotReady => "not_ready",
            ErrorKind::Internal => "internal",
        };
        write!(f, "{tag}")
    }
}

/// Top-level error enum wrapping domain-specific errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Bus(#[from] BusError),

    #[error(transparent)]
    Adapter(#[from] AdapterError),

    #[error(transparent)]
    Comms(#[from] CommsError),

    #[error(transparent)]
    Mission(#[from] MissionError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::State(error) => error.kind(),
            Error::Bus(error) => error.kind(),
            Error::Adapter(error) => error.kind(),
            Error::Comms(error) => error.kind(),
            Error::Mission(error) => error.kind(),
            Error::Io(_) | Error::Json(_) | Error::Other(_) => ErrorKind::Internal,
        }
    }
}

/// Team, agent, and task lifecycle errors.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("team '{0}' not found")]
    TeamNotFound(String),

    #[error("agent '{0}' not found")]
    AgentNotFound(String),

    #[error("task '{0}' not found")]
    TaskNotFound(String),

    #[error("agent '{id}' is busy: {reason}")]
    AgentBusy { id: String, reason: String },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("task '{task}' cannot move from {from} to {to}")]
    InvalidTransition {
        task: String,
        from: crate::TaskStatus,
        to: crate::TaskStatus,
    },
}

impl StateError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StateError::TeamNotFound(_)
            | StateError::AgentNotFound(_)
            | StateError::TaskNotFound(_) => ErrorKind::NotFound,
            StateError::AgentBusy { .. } => ErrorKind::Busy,
            StateError::InvalidArgument(_) | StateError::InvalidTransition { .. } => {
                ErrorKind::InvalidArgument
            }
        }
    }
}

/// Message bus errors.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("no channel for team '{0}'")]
    TeamNotFound(String),

    #[error("agent '{0}' not found")]
    AgentNotFound(String),

    #[error("{0}")]
    Unauthorized(String),

    #[error("payload of {len} chars exceeds the {max} char limit")]
    PayloadTooLarge { len: usize, max: usize },
}

impl BusError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BusError::TeamNotFound(_) | BusError::AgentNotFound(_) => ErrorKind::NotFound,
            BusError::Unauthorized(_) => ErrorKind::Unauthorized,
            BusError::PayloadTooLarge { .. } => ErrorKind::InvalidArgument,
        }
    }
}

/// Downstream session errors, one variant per adapter failure mode.
#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    #[error("downstream transport failed: {0}")]
    Transport(String),

    #[error("downstream call exceeded {0:?}")]
    Timeout(std::time::Duration),

    #[error("call canceled: {0}")]
    Canceled(String),

    #[error("downstream returned an error: {0}")]
    Remote(String),
}

impl AdapterError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AdapterError::Transport(_) => ErrorKind::Transport,
            AdapterError::Timeout(_) => ErrorKind::Timeout,
            AdapterError::Canceled(_) => ErrorKind::Canceled,
            AdapterError::Remote(_) => ErrorKind::RemoteError,
        }
    }
}

/// Comms service handshake and envelope errors.
#[derive(Debug, thiserror::Error)]
pub enum CommsError {
    #[error("missing agent id or identity token in handshake")]
    Unauthenticated,

    #[error("identity token does not match agent '{0}'")]
    Forbidden(String),

    #[error("unknown session '{0}'")]
    UnknownSession(String),

    #[error("unknown method '{0}'")]
    UnknownMethod(String),

    #[error("invalid params: {0}")]
    InvalidParams(String),
}

impl CommsError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CommsError::Unauthenticated => ErrorKind::Unauthenticated,
            CommsError::Forbidden(_) => ErrorKind::Forbidden,
            CommsError::UnknownSession(_) => ErrorKind::Unauthenticated,
            CommsError::UnknownMethod(_) | CommsError::InvalidParams(_) => {
                ErrorKind::InvalidArgument
            }
        }
    }
}

/// Mission engine errors.
#[derive(Debug, thiserror::Error)]
pub enum MissionError {
    #[error("mission '{0}' not found")]
    NotFound(String),

    #[error("invalid mission spec: {0}")]
    InvalidArgument(String),

    #[error("mission '{0}' has not reached a terminal phase")]
    NotReady(String),

    #[error("mission await exceeded {0:?}")]
    AwaitTimeout(std::time::Duration),

    #[error("fix assignments were not recognizable as JSON")]
    FixParse,
}

impl MissionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            MissionError::NotFound(_) => ErrorKind::NotFound,
            MissionError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            MissionError::NotReady(_) => ErrorKind::NotReady,
            MissionError::AwaitTimeout(_) => ErrorKind::Timeout,
            MissionError::FixParse => ErrorKind::ParseError,
        }
    }
}
