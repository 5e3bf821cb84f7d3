use std::fmt;

use serde::{Deserialize, Serialize};

/// Maximum length of an external participant id.
pub const MAX_PARTICIPANT_ID_LEN: usize = 128;

/// Maximum length of a display name, after trimming.
pub const MAX_DISPLAY_NAME_LEN: usize = 32;

/// Opaque identity issued by the external identity provider.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(String);

impl ParticipantId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Ids are trusted as given, but must still be printable and bounded.
    pub fn is_valid(&self) -> bool {
        !self.0.is_empty()
            && self.0.len() <= MAX_PARTICIPANT_ID_LEN
            && !self.0.chars().any(char::is_control)
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ParticipantId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for ParticipantId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Trim a display name and check it is usable. Returns `None` when the
/// name is empty, too long, or contains control characters.
pub fn normalize_display_name(name: &str) -> Option<String> {
    let trimmed = name.trim();
    if trimmed.is_empty()
        || trimmed.chars().count() > MAX_DISPLAY_NAME_LEN
        || trimmed.chars().any(char::is_control)
    {
        return None;
    }
    Some(trimmed.to_string())
}

/// One user's membership and progress within a single room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub id: ParticipantId,
    /// Snapshot of the name at join time. Never updated mid-room.
    pub display_name: String,
    pub elapsed_seconds: u64,
    pub is_winner: bool,
    /// Set when the participant leaves a session that is already running.
    pub left_early: bool,
}

impl Participant {
    pub fn new(id: ParticipantId, display_name: String) -> Self {
        Self {
            id,
            display_name,
            elapsed_seconds: 0,
            is_winner: false,
            left_early: false,
        }
    }
}
