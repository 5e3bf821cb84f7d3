use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::participant::ParticipantId;
use crate::room::RoomStatus;

/// Wire-level classification of a rejected command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    InvalidState,
    Forbidden,
    NotFound,
    InvalidArgument,
    /// Informational: the room was already settled by someone else.
    Conflict,
}

/// Errors returned by room operations. A rejected operation never has a
/// partial effect on the room.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("room {0} not found")]
    RoomNotFound(String),

    #[error("participant {0} is not in this room")]
    ParticipantNotFound(ParticipantId),

    #[error("operation not allowed while room is {status}")]
    InvalidState { status: RoomStatus },

    #[error("participant {0} left the session early")]
    LeftEarly(ParticipantId),

    #[error("room is full ({capacity} participants)")]
    RoomFull { capacity: usize },

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    InvalidArgument(String),
}

impl SessionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::RoomNotFound(_) | Self::ParticipantNotFound(_) => ErrorKind::NotFound,
            Self::InvalidState { .. } | Self::LeftEarly(_) | Self::RoomFull { .. } => {
                ErrorKind::InvalidState
            },
            Self::Forbidden(_) => ErrorKind::Forbidden,
            Self::InvalidArgument(_) => ErrorKind::InvalidArgument,
        }
    }

    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self::Forbidden(msg.into())
    }

    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }
}
