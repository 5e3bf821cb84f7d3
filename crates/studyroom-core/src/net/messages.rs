use serde::{Deserialize, Serialize};

use crate::error::ErrorKind;
use crate::match_record::MatchRecord;
use crate::participant::ParticipantId;
use crate::room::{EndReason, RoomSnapshot};
use crate::time::Timestamp;

/// Network message type discriminator (first byte of every frame).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    // Client -> Server
    Hello = 0x01,
    CreateRoom = 0x02,
    JoinRoom = 0x03,
    StartSession = 0x04,
    ReportProgress = 0x05,
    EndSession = 0x06,
    Invite = 0x07,
    LeaveRoom = 0x08,

    // Server -> Client
    Welcome = 0x10,
    CommandResult = 0x11,
    RoomUpdate = 0x12,
    SessionStarted = 0x13,
    SessionEnded = 0x14,

    // Server -> Client (side channel)
    Invitation = 0x20,
    Presence = 0x21,
}

impl MessageType {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0x01 => Some(Self::Hello),
            0x02 => Some(Self::CreateRoom),
            0x03 => Some(Self::JoinRoom),
            0x04 => Some(Self::StartSession),
            0x05 => Some(Self::ReportProgress),
            0x06 => Some(Self::EndSession),
            0x07 => Some(Self::Invite),
            0x08 => Some(Self::LeaveRoom),
            0x10 => Some(Self::Welcome),
            0x11 => Some(Self::CommandResult),
            0x12 => Some(Self::RoomUpdate),
            0x13 => Some(Self::SessionStarted),
            0x14 => Some(Self::SessionEnded),
            0x20 => Some(Self::Invitation),
            0x21 => Some(Self::Presence),
            _ => None,
        }
    }

    /// Whether clients are allowed to send this type.
    pub fn is_client_command(self) -> bool {
        (self as u8) < 0x10
    }
}

/// The command a `CommandResult` answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Op {
    Create,
    Join,
    Start,
    ReportProgress,
    End,
    Invite,
    Leave,
}

// ---------------------------------------------------------------------------
// Client -> Server
// ---------------------------------------------------------------------------

/// First frame on every connection. Identity is supplied by the external
/// identity provider and trusted as given.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelloMsg {
    pub participant_id: ParticipantId,
    pub display_name: String,
    pub protocol_version: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateRoomMsg {
    /// Optional per-room roster cap, never above the server limit.
    pub max_participants: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinRoomMsg {
    pub room_code: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartSessionMsg {
    pub room_code: String,
    /// Signed so that non-positive values reach validation instead of
    /// failing to decode.
    pub target_duration_secs: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportProgressMsg {
    pub room_code: String,
    pub elapsed_seconds: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndSessionMsg {
    pub room_code: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InviteMsg {
    pub room_code: String,
    pub invitee_id: ParticipantId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaveRoomMsg {
    pub room_code: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    Hello(HelloMsg),
    CreateRoom(CreateRoomMsg),
    JoinRoom(JoinRoomMsg),
    StartSession(StartSessionMsg),
    ReportProgress(ReportProgressMsg),
    EndSession(EndSessionMsg),
    Invite(InviteMsg),
    LeaveRoom(LeaveRoomMsg),
}

// ---------------------------------------------------------------------------
// Server -> Client
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WelcomeMsg {
    pub participant_id: ParticipantId,
    pub protocol_version: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: ErrorKind,
    pub message: String,
}

/// Reply to every command after `Hello`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResultMsg {
    pub op: Op,
    pub room_code: Option<String>,
    pub ok: bool,
    /// The room had already been settled; the command was a no-op.
    pub already_settled: bool,
    pub error: Option<ErrorBody>,
}

impl CommandResultMsg {
    pub fn accepted(op: Op, room_code: impl Into<String>) -> Self {
        Self {
            op,
            room_code: Some(room_code.into()),
            ok: true,
            already_settled: false,
            error: None,
        }
    }

    pub fn settled(op: Op, room_code: impl Into<String>) -> Self {
        Self {
            already_settled: true,
            ..Self::accepted(op, room_code)
        }
    }

    pub fn rejected(op: Op, room_code: Option<String>, kind: ErrorKind, message: String) -> Self {
        Self {
            op,
            room_code,
            ok: false,
            already_settled: false,
            error: Some(ErrorBody { kind, message }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStartedMsg {
    pub room_code: String,
    pub target_duration_secs: u64,
    pub started_at: Timestamp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionEndedMsg {
    pub room_code: String,
    pub winner_id: Option<ParticipantId>,
    pub winner_name: Option<String>,
    pub reason: EndReason,
    pub record: MatchRecord,
}

impl SessionEndedMsg {
    pub fn from_record(record: &MatchRecord) -> Self {
        Self {
            room_code: record.room_code.clone(),
            winner_id: record.winner_id.clone(),
            winner_name: record.winner_name().map(str::to_string),
            reason: record.reason,
            record: record.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvitationMsg {
    pub room_code: String,
    pub inviter_id: ParticipantId,
    pub inviter_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceMsg {
    pub online: Vec<ParticipantId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerMessage {
    Welcome(WelcomeMsg),
    CommandResult(CommandResultMsg),
    RoomUpdate(Box<RoomSnapshot>),
    SessionStarted(SessionStartedMsg),
    SessionEnded(Box<SessionEndedMsg>),
    Invitation(InvitationMsg),
    Presence(PresenceMsg),
}
