use std::fmt;

use rand::Rng;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::SessionError;
use crate::match_record::MatchRecord;
use crate::participant::{Participant, ParticipantId};
use crate::time::Timestamp;

/// Length of a room code.
pub const ROOM_CODE_LEN: usize = 6;

const ROOM_CODE_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Generate a random room code such as `K7Q2ZD`.
pub fn generate_room_code() -> String {
    let mut rng = rand::rng();
    (0..ROOM_CODE_LEN)
        .map(|_| ROOM_CODE_ALPHABET[rng.random_range(0..ROOM_CODE_ALPHABET.len())] as char)
        .collect()
}

/// Check that a string has the room code shape: six uppercase ASCII
/// letters or digits.
pub fn is_valid_room_code(code: &str) -> bool {
    code.len() == ROOM_CODE_LEN
        && code
            .bytes()
            .all(|b| b.is_ascii_uppercase() || b.is_ascii_digit())
}

/// Lifecycle of a room. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RoomStatus {
    Waiting,
    InProgress,
    Ended,
}

impl fmt::Display for RoomStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Waiting => "waiting",
            Self::InProgress => "in-progress",
            Self::Ended => "ended",
        })
    }
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EndReason {
    /// A participant reached the target duration first.
    TargetReached,
    /// A participant ended the session explicitly.
    Requested,
    /// No activity for the configured idle period.
    IdleTimeout,
    /// Every participant left before anyone finished.
    Abandoned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    Joined,
    /// The id was already on the roster. Nothing changed.
    AlreadyMember,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaveOutcome {
    /// Removed from a waiting room. `new_host` is set when the host left.
    Removed { new_host: Option<ParticipantId> },
    /// The last participant left a waiting room; the room can be discarded.
    Emptied,
    /// Left a running session; elapsed time is kept for the record.
    ExitedEarly,
    /// The last active participant left a running session, ending it.
    Abandoned(MatchRecord),
    AlreadyEnded,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressOutcome {
    Recorded,
    /// This report crossed the target first and ended the room.
    Won(MatchRecord),
    /// Accepted after the room ended; winner and record are unchanged.
    LateReport,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndOutcome {
    Ended(MatchRecord),
    /// Someone else settled the room first. Carries that result.
    AlreadySettled(MatchRecord),
}

/// A single competitive study session and its roster.
///
/// All mutation goes through methods that validate the current status
/// first, so a rejected call leaves the room untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Room {
    code: String,
    host_id: ParticipantId,
    status: RoomStatus,
    target_duration_secs: Option<u64>,
    created_at: Timestamp,
    started_at: Option<Timestamp>,
    ended_at: Option<Timestamp>,
    participants: Vec<Participant>,
    winner_id: Option<ParticipantId>,
    end_reason: Option<EndReason>,
    capacity: Option<usize>,
    record: Option<MatchRecord>,
}

impl Room {
    /// Create a waiting room with the host as its first participant.
    pub fn new(
        code: String,
        host_id: ParticipantId,
        host_name: String,
        created_at: Timestamp,
    ) -> Self {
        Self {
            code,
            host_id: host_id.clone(),
            status: RoomStatus::Waiting,
            target_duration_secs: None,
            created_at,
            started_at: None,
            ended_at: None,
            participants: vec![Participant::new(host_id, host_name)],
            winner_id: None,
            end_reason: None,
            capacity: None,
            record: None,
        }
    }

    /// Cap the roster size. `None` leaves it unbounded.
    pub fn with_capacity(mut self, capacity: Option<usize>) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn host_id(&self) -> &ParticipantId {
        &self.host_id
    }

    pub fn status(&self) -> RoomStatus {
        self.status
    }

    pub fn target_duration_secs(&self) -> Option<u64> {
        self.target_duration_secs
    }

    pub fn created_at(&self) -> Timestamp {
        self.created_at
    }

    pub fn started_at(&self) -> Option<Timestamp> {
        self.started_at
    }

    pub fn ended_at(&self) -> Option<Timestamp> {
        self.ended_at
    }

    pub fn participants(&self) -> &[Participant] {
        &self.participants
    }

    pub fn participant(&self, id: &ParticipantId) -> Option<&Participant> {
        self.participants.iter().find(|p| &p.id == id)
    }

    pub fn is_member(&self, id: &ParticipantId) -> bool {
        self.participant(id).is_some()
    }

    pub fn winner_id(&self) -> Option<&ParticipantId> {
        self.winner_id.as_ref()
    }

    pub fn end_reason(&self) -> Option<EndReason> {
        self.end_reason
    }

    /// The record produced when the room ended.
    pub fn record(&self) -> Option<&MatchRecord> {
        self.record.as_ref()
    }

    fn index_of(&self, id: &ParticipantId) -> Result<usize, SessionError> {
        self.participants
            .iter()
            .position(|p| &p.id == id)
            .ok_or_else(|| SessionError::ParticipantNotFound(id.clone()))
    }

    fn invalid_state(&self) -> SessionError {
        SessionError::InvalidState {
            status: self.status,
        }
    }

    /// Add a participant. Re-joining with a known id is a no-op in any
    /// status; new ids are only admitted while the room is waiting.
    pub fn join(
        &mut self,
        id: ParticipantId,
        display_name: String,
    ) -> Result<JoinOutcome, SessionError> {
        if self.is_member(&id) {
            return Ok(JoinOutcome::AlreadyMember);
        }
        if self.status != RoomStatus::Waiting {
            return Err(self.invalid_state());
        }
        if let Some(capacity) = self.capacity
            && self.participants.len() >= capacity
        {
            return Err(SessionError::RoomFull { capacity });
        }
        self.participants.push(Participant::new(id, display_name));
        Ok(JoinOutcome::Joined)
    }

    pub fn leave(
        &mut self,
        id: &ParticipantId,
        now: Timestamp,
    ) -> Result<LeaveOutcome, SessionError> {
        let index = self.index_of(id)?;
        match self.status {
            RoomStatus::Waiting => {
                self.participants.remove(index);
                let Some(next) = self.participants.first() else {
                    return Ok(LeaveOutcome::Emptied);
                };
                if &self.host_id == id {
                    self.host_id = next.id.clone();
                    return Ok(LeaveOutcome::Removed {
                        new_host: Some(self.host_id.clone()),
                    });
                }
                Ok(LeaveOutcome::Removed { new_host: None })
            },
            RoomStatus::InProgress => {
                self.participants[index].left_early = true;
                if self.participants.iter().all(|p| p.left_early) {
                    let record = self.settle(EndReason::Abandoned, None, now);
                    return Ok(LeaveOutcome::Abandoned(record));
                }
                Ok(LeaveOutcome::ExitedEarly)
            },
            RoomStatus::Ended => Ok(LeaveOutcome::AlreadyEnded),
        }
    }

    /// Start the session. Host only, waiting rooms only, positive target.
    pub fn start(
        &mut self,
        requester: &ParticipantId,
        target_duration_secs: i64,
        now: Timestamp,
    ) -> Result<(), SessionError> {
        if self.status != RoomStatus::Waiting {
            return Err(self.invalid_state());
        }
        if requester != &self.host_id {
            return Err(SessionError::forbidden("only the host can start the session"));
        }
        let target = u64::try_from(target_duration_secs)
            .ok()
            .filter(|t| *t > 0)
            .ok_or_else(|| {
                SessionError::invalid_argument(format!(
                    "target duration must be positive, got {target_duration_secs}"
                ))
            })?;

        self.target_duration_secs = Some(target);
        self.started_at = Some(now);
        self.status = RoomStatus::InProgress;
        Ok(())
    }

    /// Record a participant's accumulated focus time.
    ///
    /// The first report at or past the target wins and ends the room.
    /// Reports after the end are kept as late data points.
    pub fn report_progress(
        &mut self,
        id: &ParticipantId,
        elapsed_seconds: u64,
        now: Timestamp,
    ) -> Result<ProgressOutcome, SessionError> {
        let index = self.index_of(id)?;
        if self.status == RoomStatus::Waiting {
            return Err(self.invalid_state());
        }
        let participant = &self.participants[index];
        if participant.left_early {
            return Err(SessionError::LeftEarly(id.clone()));
        }
        if elapsed_seconds < participant.elapsed_seconds {
            return Err(SessionError::invalid_argument(format!(
                "elapsed seconds cannot decrease ({} -> {elapsed_seconds})",
                participant.elapsed_seconds
            )));
        }

        self.participants[index].elapsed_seconds = elapsed_seconds;
        if self.status == RoomStatus::Ended {
            return Ok(ProgressOutcome::LateReport);
        }

        if self.winner_id.is_none()
            && let Some(target) = self.target_duration_secs
            && elapsed_seconds >= target
        {
            let record = self.settle(EndReason::TargetReached, Some(index), now);
            return Ok(ProgressOutcome::Won(record));
        }
        Ok(ProgressOutcome::Recorded)
    }

    /// End a running session. Any participant may do this. Without a
    /// winner yet, the participant furthest ahead wins.
    pub fn end(
        &mut self,
        requester: &ParticipantId,
        now: Timestamp,
    ) -> Result<EndOutcome, SessionError> {
        if !self.is_member(requester) {
            return Err(SessionError::forbidden(
                "only participants can end the session",
            ));
        }
        match self.status {
            RoomStatus::Waiting => Err(self.invalid_state()),
            RoomStatus::InProgress => {
                let leader = self.leading_index();
                Ok(EndOutcome::Ended(self.settle(
                    EndReason::Requested,
                    leader,
                    now,
                )))
            },
            RoomStatus::Ended => match &self.record {
                Some(record) => Ok(EndOutcome::AlreadySettled(record.clone())),
                None => Err(self.invalid_state()),
            },
        }
    }

    /// End a running session without a winner because it went idle.
    /// Returns `None` when the room was not running.
    pub fn expire(&mut self, now: Timestamp) -> Option<MatchRecord> {
        (self.status == RoomStatus::InProgress)
            .then(|| self.settle(EndReason::IdleTimeout, None, now))
    }

    /// Highest elapsed time among participants still in the session.
    /// Ties go to the earliest joiner; all-zero means no leader.
    fn leading_index(&self) -> Option<usize> {
        let mut best: Option<usize> = None;
        for (i, p) in self.participants.iter().enumerate() {
            if p.left_early || p.elapsed_seconds == 0 {
                continue;
            }
            if best.is_none_or(|b| p.elapsed_seconds > self.participants[b].elapsed_seconds) {
                best = Some(i);
            }
        }
        best
    }

    fn settle(&mut self, reason: EndReason, winner: Option<usize>, now: Timestamp) -> MatchRecord {
        self.status = RoomStatus::Ended;
        self.ended_at = Some(now);
        self.end_reason = Some(reason);
        if let Some(index) = winner {
            let participant = &mut self.participants[index];
            participant.is_winner = true;
            self.winner_id = Some(participant.id.clone());
        }
        let record = MatchRecord::capture(self, Uuid::new_v4(), now, reason);
        self.record = Some(record.clone());
        record
    }

    pub fn snapshot(&self) -> RoomSnapshot {
        RoomSnapshot {
            room_code: self.code.clone(),
            status: self.status,
            host_id: self.host_id.clone(),
            target_duration_secs: self.target_duration_secs,
            created_at: self.created_at,
            started_at: self.started_at,
            ended_at: self.ended_at,
            participants: self.participants.clone(),
            winner_id: self.winner_id.clone(),
            end_reason: self.end_reason,
        }
    }
}

/// Point-in-time view of a room, pushed to subscribers and served by the
/// read API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomSnapshot {
    pub room_code: String,
    pub status: RoomStatus,
    pub host_id: ParticipantId,
    pub target_duration_secs: Option<u64>,
    pub created_at: Timestamp,
    pub started_at: Option<Timestamp>,
    pub ended_at: Option<Timestamp>,
    pub participants: Vec<Participant>,
    pub winner_id: Option<ParticipantId>,
    pub end_reason: Option<EndReason>,
}

impl RoomSnapshot {
    pub fn participant(&self, id: &ParticipantId) -> Option<&Participant> {
        self.participants.iter().find(|p| &p.id == id)
    }
}
