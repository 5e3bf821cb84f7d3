use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::participant::ParticipantId;
use crate::room::{EndReason, Room};
use crate::time::Timestamp;

/// Immutable record of a finished room. Produced exactly once, at the
/// transition into `ended`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchRecord {
    pub id: Uuid,
    pub room_code: String,
    pub host_id: ParticipantId,
    /// Join order.
    pub participant_ids: Vec<ParticipantId>,
    pub display_names: BTreeMap<ParticipantId, String>,
    pub durations_by_participant: BTreeMap<ParticipantId, u64>,
    pub winner_id: Option<ParticipantId>,
    pub target_duration_secs: Option<u64>,
    pub started_at: Option<Timestamp>,
    pub ended_at: Timestamp,
    pub reason: EndReason,
    pub early_exits: Vec<ParticipantId>,
}

impl MatchRecord {
    pub(crate) fn capture(room: &Room, id: Uuid, ended_at: Timestamp, reason: EndReason) -> Self {
        let participants = room.participants();
        Self {
            id,
            room_code: room.code().to_string(),
            host_id: room.host_id().clone(),
            participant_ids: participants.iter().map(|p| p.id.clone()).collect(),
            display_names: participants
                .iter()
                .map(|p| (p.id.clone(), p.display_name.clone()))
                .collect(),
            durations_by_participant: participants
                .iter()
                .map(|p| (p.id.clone(), p.elapsed_seconds))
                .collect(),
            winner_id: room.winner_id().cloned(),
            target_duration_secs: room.target_duration_secs(),
            started_at: room.started_at(),
            ended_at,
            reason,
            early_exits: participants
                .iter()
                .filter(|p| p.left_early)
                .map(|p| p.id.clone())
                .collect(),
        }
    }

    pub fn includes(&self, id: &ParticipantId) -> bool {
        self.participant_ids.contains(id)
    }

    pub fn winner_name(&self) -> Option<&str> {
        let winner = self.winner_id.as_ref()?;
        self.display_names.get(winner).map(String::as_str)
    }
}

/// Aggregated standing of one participant across match records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaderboardEntry {
    pub participant_id: ParticipantId,
    /// Name from the most recent match the participant played.
    pub display_name: String,
    pub matches: u32,
    pub wins: u32,
    pub total_seconds: u64,
}

/// Rank participants by total focused seconds, then wins, then id.
/// Records are expected oldest first.
pub fn leaderboard<'a>(records: impl IntoIterator<Item = &'a MatchRecord>) -> Vec<LeaderboardEntry> {
    let mut entries: HashMap<&ParticipantId, LeaderboardEntry> = HashMap::new();
    for record in records {
        for id in &record.participant_ids {
            let entry = entries.entry(id).or_insert_with(|| LeaderboardEntry {
                participant_id: id.clone(),
                display_name: String::new(),
                matches: 0,
                wins: 0,
                total_seconds: 0,
            });
            let seconds = record.durations_by_participant.get(id).copied().unwrap_or(0);
            entry.matches = entry.matches.saturating_add(1);
            entry.total_seconds = entry.total_seconds.saturating_add(seconds);
            if record.winner_id.as_ref() == Some(id) {
                entry.wins = entry.wins.saturating_add(1);
            }
            if let Some(name) = record.display_names.get(id) {
                entry.display_name.clone_from(name);
            }
        }
    }

    let mut ranked: Vec<LeaderboardEntry> = entries.into_values().collect();
    ranked.sort_by(|a, b| {
        b.total_seconds
            .cmp(&a.total_seconds)
            .then(b.wins.cmp(&a.wins))
            .then_with(|| a.participant_id.cmp(&b.participant_id))
    });
    ranked
}
