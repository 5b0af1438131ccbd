//! Error types of the session server.
//!
//! None of these escape a session as a panic. Command errors become `error`
//! replies to the sender; the rest are logged or broadcast.

use tandem_wire::ParticipantId;
use thiserror::Error;

pub use crate::state::IllegalTransition;
pub use tandem_history::{HistoryError, SizeLimitReached};

/// Reasons a user cannot join a session.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JoinError {
    #[error("this session is full")]
    SessionFull,

    #[error("you have been banned from this session")]
    Banned,

    #[error("this session is closed")]
    Closed,

    #[error("this session does not allow guest logins")]
    AuthOnly,

    #[error("no free user ids left")]
    IdsExhausted,

    #[error("session is not waiting for a host")]
    NotInitializing,

    #[error("session is shutting down")]
    ShuttingDown,
}

/// Failure of a client command. Reported back to the sender.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("you are not a session operator")]
    NotOperator,

    #[error("command not allowed in {0} state")]
    WrongState(&'static str),

    #[error("bad arguments: {0}")]
    BadArguments(String),

    #[error("unknown command: {0}")]
    UnknownCommand(String),

    #[error("no such user: #{0}")]
    UnknownUser(ParticipantId),

    #[error("cannot kick moderators")]
    CannotKickModerator,

    #[error("cannot kick yourself")]
    CannotKickSelf,

    #[error("incorrect password")]
    IncorrectOpword,
}

/// Listing server call failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ListingError {
    #[error("announcement API URL not allowed: {0}")]
    NotAllowed(String),

    #[error("listing request failed: {0}")]
    Http(String),

    #[error("listing server refused: {0}")]
    Rejected(String),
}

/// Abuse report delivery failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReportError {
    #[error("abuse report URL not configured")]
    NotConfigured,

    #[error("unable to send abuse report: {0}")]
    Delivery(String),
}

/// Failure of a call through a session handle.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ActorError {
    #[error("session has ended")]
    Closed,

    #[error(transparent)]
    Join(#[from] JoinError),
}
