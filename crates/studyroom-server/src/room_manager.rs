use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{Mutex, RwLock};

use studyroom_core::error::SessionError;
use studyroom_core::match_record::MatchRecord;
use studyroom_core::net::messages::{
    InvitationMsg, ServerMessage, SessionEndedMsg, SessionStartedMsg,
};
use studyroom_core::participant::ParticipantId;
use studyroom_core::room::{
    EndOutcome, JoinOutcome, LeaveOutcome, ProgressOutcome, Room, RoomSnapshot, RoomStatus,
    generate_room_code,
};
use studyroom_core::time::timestamp_now;

use crate::broadcast::{ConnectionSender, RoomTopic, encode};
use crate::config::RoomsConfig;
use crate::history::HistoryRecorder;
use crate::presence::PresenceRegistry;

type SharedRoom = Arc<Mutex<RoomEntry>>;

/// Who is issuing a command, as established by the connection handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    pub id: ParticipantId,
    pub display_name: String,
}

impl Member {
    pub fn new(id: impl Into<ParticipantId>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
        }
    }
}

struct RoomEntry {
    room: Room,
    topic: RoomTopic,
    last_activity: Instant,
    /// When the room reached `ended`, for eviction.
    ended_instant: Option<Instant>,
    /// Last snapshot pushed because of a progress report, per participant.
    last_progress_push: HashMap<ParticipantId, Instant>,
    /// Set once the entry has been removed from the store. Commands that
    /// raced the removal see the room as gone.
    closed: bool,
}

impl RoomEntry {
    fn new(room: Room) -> Self {
        Self {
            room,
            topic: RoomTopic::new(),
            last_activity: Instant::now(),
            ended_instant: None,
            last_progress_push: HashMap::new(),
            closed: false,
        }
    }

    fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    fn publish_snapshot(&self) {
        let msg = ServerMessage::RoomUpdate(Box::new(self.room.snapshot()));
        self.topic.publish_message(self.room.code(), &msg);
    }

    /// Mark the room ended and tell every subscriber.
    fn publish_end(&mut self, record: &MatchRecord) {
        self.ended_instant = Some(Instant::now());
        let ended = ServerMessage::SessionEnded(Box::new(SessionEndedMsg::from_record(record)));
        self.topic.publish_message(self.room.code(), &ended);
        self.publish_snapshot();
    }
}

/// Counts reported by one reaper pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReapStats {
    /// Running sessions ended for inactivity.
    pub expired: usize,
    /// Waiting rooms dropped for inactivity.
    pub discarded: usize,
    /// Ended rooms removed after their retention period.
    pub evicted: usize,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RoomStats {
    pub total: usize,
    pub waiting: usize,
    pub in_progress: usize,
    pub ended: usize,
    pub participants: usize,
    /// Live room subscriptions across all rooms.
    pub subscribers: usize,
}

/// The room store. Each room sits behind its own mutex so commands on one
/// room are serialized while different rooms proceed in parallel. The map
/// lock is held only to look up, insert, or remove entries.
pub struct RoomManager {
    rooms: RwLock<HashMap<String, SharedRoom>>,
    history: Arc<HistoryRecorder>,
    presence: Arc<PresenceRegistry>,
    config: RoomsConfig,
}

impl RoomManager {
    pub fn new(
        config: RoomsConfig,
        history: Arc<HistoryRecorder>,
        presence: Arc<PresenceRegistry>,
    ) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            history,
            presence,
            config,
        }
    }

    pub fn history(&self) -> &Arc<HistoryRecorder> {
        &self.history
    }

    async fn lookup(&self, room_code: &str) -> Result<SharedRoom, SessionError> {
        self.rooms
            .read()
            .await
            .get(room_code)
            .cloned()
            .ok_or_else(|| SessionError::RoomNotFound(room_code.to_string()))
    }

    /// Lock a live room. Entries closed after lookup count as missing.
    async fn with_room<T>(
        &self,
        room_code: &str,
        f: impl FnOnce(&mut RoomEntry) -> Result<T, SessionError>,
    ) -> Result<T, SessionError> {
        let shared = self.lookup(room_code).await?;
        let mut entry = shared.lock().await;
        if entry.closed {
            return Err(SessionError::RoomNotFound(room_code.to_string()));
        }
        f(&mut *entry)
    }

    /// Remove `shared` from the store if it is still the entry under
    /// `room_code`. The caller must hold the room's lock and mark it closed.
    async fn remove_entry(&self, room_code: &str, shared: &SharedRoom) {
        let mut rooms = self.rooms.write().await;
        if rooms
            .get(room_code)
            .is_some_and(|current| Arc::ptr_eq(current, shared))
        {
            rooms.remove(room_code);
        }
    }

    /// Create a waiting room with `host` as its first participant.
    ///
    /// `requested_capacity` can only tighten the server-wide cap.
    pub async fn create_room(
        &self,
        host: &Member,
        requested_capacity: Option<usize>,
        sender: Option<ConnectionSender>,
    ) -> Result<RoomSnapshot, SessionError> {
        if requested_capacity == Some(0) {
            return Err(SessionError::invalid_argument(
                "max participants must be at least 1",
            ));
        }
        let capacity = match (self.config.capacity(), requested_capacity) {
            (Some(limit), Some(requested)) => Some(limit.min(requested)),
            (limit, requested) => limit.or(requested),
        };

        let mut rooms = self.rooms.write().await;
        let mut code = generate_room_code();
        while rooms.contains_key(&code) {
            code = generate_room_code();
        }

        let room = Room::new(
            code.clone(),
            host.id.clone(),
            host.display_name.clone(),
            timestamp_now(),
        )
        .with_capacity(capacity);
        let mut entry = RoomEntry::new(room);
        if let Some(sender) = sender {
            entry.topic.subscribe(host.id.clone(), sender);
        }
        let snapshot = entry.room.snapshot();
        entry.publish_snapshot();
        rooms.insert(code.clone(), Arc::new(Mutex::new(entry)));
        drop(rooms);

        tracing::info!(room = %code, host = %host.id, ?capacity, "Room created");
        Ok(snapshot)
    }

    /// Join a room, or re-subscribe if already a member.
    pub async fn join_room(
        &self,
        room_code: &str,
        member: &Member,
        sender: Option<ConnectionSender>,
    ) -> Result<(JoinOutcome, RoomSnapshot), SessionError> {
        self.with_room(room_code, |entry| {
            let outcome = entry
                .room
                .join(member.id.clone(), member.display_name.clone())?;
            if let Some(sender) = sender {
                entry.topic.subscribe(member.id.clone(), sender);
            }
            let snapshot = entry.room.snapshot();
            match outcome {
                JoinOutcome::Joined => {
                    entry.touch();
                    entry.publish_snapshot();
                    tracing::info!(
                        room = room_code,
                        participant = %member.id,
                        "Participant joined"
                    );
                },
                JoinOutcome::AlreadyMember => {
                    let update = ServerMessage::RoomUpdate(Box::new(snapshot.clone()));
                    if let Some(data) = encode(&update) {
                        entry.topic.send_to(&member.id, data);
                    }
                    tracing::debug!(
                        room = room_code,
                        participant = %member.id,
                        "Participant re-subscribed"
                    );
                },
            }
            Ok((outcome, snapshot))
        })
        .await
    }

    /// Host starts the session with a target focus duration.
    pub async fn start_session(
        &self,
        room_code: &str,
        requester: &ParticipantId,
        target_duration_secs: i64,
    ) -> Result<SessionStartedMsg, SessionError> {
        self.with_room(room_code, |entry| {
            entry
                .room
                .start(requester, target_duration_secs, timestamp_now())?;
            entry.touch();

            let started = SessionStartedMsg {
                room_code: room_code.to_string(),
                target_duration_secs: entry.room.target_duration_secs().unwrap_or_default(),
                started_at: entry.room.started_at().unwrap_or_else(timestamp_now),
            };
            entry
                .topic
                .publish_message(room_code, &ServerMessage::SessionStarted(started.clone()));
            entry.publish_snapshot();
            tracing::info!(
                room = room_code,
                target_secs = started.target_duration_secs,
                participants = entry.room.participants().len(),
                "Session started"
            );
            Ok(started)
        })
        .await
    }

    /// Apply a progress report. A report that crosses the target ends the
    /// room and records the match.
    pub async fn report_progress(
        &self,
        room_code: &str,
        participant: &ParticipantId,
        elapsed_seconds: u64,
    ) -> Result<ProgressOutcome, SessionError> {
        let interval = self.config.progress_broadcast_interval();
        let outcome = self
            .with_room(room_code, |entry| {
                let outcome =
                    entry
                        .room
                        .report_progress(participant, elapsed_seconds, timestamp_now())?;
                match &outcome {
                    ProgressOutcome::Won(record) => {
                        entry.touch();
                        entry.publish_end(record);
                        tracing::info!(
                            room = room_code,
                            winner = %participant,
                            elapsed_seconds,
                            "Target reached"
                        );
                    },
                    ProgressOutcome::Recorded | ProgressOutcome::LateReport => {
                        if matches!(outcome, ProgressOutcome::Recorded) {
                            entry.touch();
                        }
                        let now = Instant::now();
                        let due = entry
                            .last_progress_push
                            .get(participant)
                            .is_none_or(|last| now.duration_since(*last) >= interval);
                        if due {
                            entry.last_progress_push.insert(participant.clone(), now);
                            entry.publish_snapshot();
                        }
                    },
                }
                Ok(outcome)
            })
            .await?;

        if let ProgressOutcome::Won(record) = &outcome {
            self.history.record(record.clone()).await;
        }
        Ok(outcome)
    }

    /// End a running session on request. Ending an ended room is a no-op
    /// that returns the settled record.
    pub async fn end_session(
        &self,
        room_code: &str,
        requester: &ParticipantId,
    ) -> Result<EndOutcome, SessionError> {
        let outcome = self
            .with_room(room_code, |entry| {
                let outcome = entry.room.end(requester, timestamp_now())?;
                if let EndOutcome::Ended(record) = &outcome {
                    entry.touch();
                    entry.publish_end(record);
                    tracing::info!(
                        room = room_code,
                        requester = %requester,
                        winner = ?record.winner_id.as_ref().map(ParticipantId::as_str),
                        "Session ended on request"
                    );
                }
                Ok(outcome)
            })
            .await?;

        if let EndOutcome::Ended(record) = &outcome {
            self.history.record(record.clone()).await;
        }
        Ok(outcome)
    }

    /// Leave a room. Leaving a running session keeps the participant's
    /// progress; leaving a waiting room removes them.
    pub async fn leave_room(
        &self,
        room_code: &str,
        participant: &ParticipantId,
    ) -> Result<LeaveOutcome, SessionError> {
        let shared = self.lookup(room_code).await?;
        let mut entry = shared.lock().await;
        if entry.closed {
            return Err(SessionError::RoomNotFound(room_code.to_string()));
        }

        let outcome = entry.room.leave(participant, timestamp_now())?;
        entry.topic.remove(participant);
        entry.last_progress_push.remove(participant);
        match &outcome {
            LeaveOutcome::Removed { new_host } => {
                entry.touch();
                entry.publish_snapshot();
                tracing::info!(
                    room = room_code,
                    participant = %participant,
                    new_host = ?new_host.as_ref().map(ParticipantId::as_str),
                    "Participant left"
                );
            },
            LeaveOutcome::Emptied => {
                entry.closed = true;
                self.remove_entry(room_code, &shared).await;
                tracing::info!(room = room_code, "Last participant left, room discarded");
            },
            LeaveOutcome::ExitedEarly => {
                entry.touch();
                entry.publish_snapshot();
                tracing::info!(
                    room = room_code,
                    participant = %participant,
                    "Participant left session early"
                );
            },
            LeaveOutcome::Abandoned(record) => {
                entry.publish_end(record);
                tracing::info!(room = room_code, "Every participant left, session abandoned");
            },
            LeaveOutcome::AlreadyEnded => {},
        }
        drop(entry);

        if let LeaveOutcome::Abandoned(record) = &outcome {
            self.history.record(record.clone()).await;
        }
        Ok(outcome)
    }

    /// Invite someone to a waiting room. Delivery is best effort; returns
    /// whether the invitee was reachable.
    pub async fn invite(
        &self,
        room_code: &str,
        inviter: &ParticipantId,
        invitee: &ParticipantId,
    ) -> Result<bool, SessionError> {
        let invitation = self
            .with_room(room_code, |entry| {
                let Some(member) = entry.room.participant(inviter) else {
                    return Err(SessionError::forbidden(
                        "only participants can invite to this room",
                    ));
                };
                if entry.room.status() != RoomStatus::Waiting {
                    return Err(SessionError::InvalidState {
                        status: entry.room.status(),
                    });
                }
                Ok(InvitationMsg {
                    room_code: room_code.to_string(),
                    inviter_id: inviter.clone(),
                    inviter_name: member.display_name.clone(),
                })
            })
            .await?;

        let delivered = match encode(&ServerMessage::Invitation(invitation)) {
            Some(data) => self.presence.send_to(invitee, data).await,
            None => false,
        };
        if delivered {
            tracing::info!(
                room = room_code, inviter = %inviter, invitee = %invitee,
                "Invitation delivered"
            );
        } else {
            tracing::info!(
                room = room_code, inviter = %inviter, invitee = %invitee,
                "Invitee unreachable, invitation dropped"
            );
        }
        Ok(delivered)
    }

    /// Drop a closed connection's subscriptions. Room state is untouched.
    pub async fn disconnect<'a>(
        &self,
        participant: &ParticipantId,
        sender: &ConnectionSender,
        room_codes: impl IntoIterator<Item = &'a String>,
    ) {
        for code in room_codes {
            let Ok(shared) = self.lookup(code).await else {
                continue;
            };
            let mut entry = shared.lock().await;
            if entry.topic.unsubscribe(participant, sender) {
                tracing::debug!(room = %code, participant = %participant, "Unsubscribed on disconnect");
            }
        }
    }

    pub async fn snapshot(&self, room_code: &str) -> Result<RoomSnapshot, SessionError> {
        self.with_room(room_code, |entry| Ok(entry.room.snapshot()))
            .await
    }

    pub async fn stats(&self) -> RoomStats {
        let entries: Vec<SharedRoom> = self.rooms.read().await.values().cloned().collect();
        let mut stats = RoomStats::default();
        for shared in entries {
            let entry = shared.lock().await;
            if entry.closed {
                continue;
            }
            stats.total += 1;
            stats.participants += entry.room.participants().len();
            stats.subscribers += entry.topic.len();
            match entry.room.status() {
                RoomStatus::Waiting => stats.waiting += 1,
                RoomStatus::InProgress => stats.in_progress += 1,
                RoomStatus::Ended => stats.ended += 1,
            }
        }
        stats
    }

    pub async fn reap_idle(&self) -> ReapStats {
        self.reap_idle_at(Instant::now()).await
    }

    /// One reaper pass, judged as of `now`.
    pub async fn reap_idle_at(&self, now: Instant) -> ReapStats {
        let idle_timeout = self.config.idle_timeout();
        let ended_ttl = self.config.ended_room_ttl();
        let entries: Vec<(String, SharedRoom)> = self
            .rooms
            .read()
            .await
            .iter()
            .map(|(code, shared)| (code.clone(), Arc::clone(shared)))
            .collect();

        let mut stats = ReapStats::default();
        let mut expired_records = Vec::new();
        for (code, shared) in entries {
            let mut entry = shared.lock().await;
            if entry.closed {
                continue;
            }
            let idle = now.saturating_duration_since(entry.last_activity);
            match entry.room.status() {
                RoomStatus::InProgress if idle >= idle_timeout => {
                    if let Some(record) = entry.room.expire(timestamp_now()) {
                        entry.publish_end(&record);
                        tracing::info!(room = %code, idle_secs = idle.as_secs(), "Session ended for inactivity");
                        expired_records.push(record);
                        stats.expired += 1;
                    }
                },
                RoomStatus::Waiting if idle >= idle_timeout => {
                    entry.closed = true;
                    self.remove_entry(&code, &shared).await;
                    tracing::info!(room = %code, idle_secs = idle.as_secs(), "Idle waiting room discarded");
                    stats.discarded += 1;
                },
                RoomStatus::Ended
                    if entry
                        .ended_instant
                        .is_some_and(|at| now.saturating_duration_since(at) >= ended_ttl) =>
                {
                    entry.closed = true;
                    self.remove_entry(&code, &shared).await;
                    tracing::debug!(room = %code, "Ended room evicted");
                    stats.evicted += 1;
                },
                _ => {},
            }
        }

        for record in expired_records {
            self.history.record(record).await;
        }
        stats
    }
}

/// Run the reaper until `cancel` fires.
pub fn spawn_idle_reaper(
    rooms: Arc<RoomManager>,
    interval: Duration,
    cancel: tokio_util::sync::CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    tracing::info!("Idle reaper stopped");
                    break;
                },
                _ = ticker.tick() => {
                    let stats = rooms.reap_idle().await;
                    if stats != ReapStats::default() {
                        tracing::info!(
                            expired = stats.expired,
                            discarded = stats.discarded,
                            evicted = stats.evicted,
                            "Reaped idle rooms"
                        );
                    }
                },
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use studyroom_core::error::ErrorKind;
    use studyroom_core::net::protocol::decode_server_message;
    use studyroom_core::room::EndReason;
    use tokio::sync::mpsc;

    use crate::config::HistoryConfig;
    use crate::history::MemoryMatchStore;

    async fn manager_with(config: RoomsConfig) -> RoomManager {
        let history = HistoryRecorder::with_store(
            Arc::new(MemoryMatchStore::new()),
            &HistoryConfig {
                retry_base_delay_ms: 1,
                ..HistoryConfig::default()
            },
        )
        .await
        .unwrap();
        RoomManager::new(
            config,
            Arc::new(history),
            Arc::new(PresenceRegistry::new()),
        )
    }

    async fn manager() -> RoomManager {
        manager_with(RoomsConfig {
            progress_broadcast_interval_ms: 0,
            ..RoomsConfig::default()
        })
        .await
    }

    fn member(id: &str) -> Member {
        Member::new(id, id.to_uppercase())
    }

    fn pid(id: &str) -> ParticipantId {
        ParticipantId::from(id)
    }

    /// Decode every frame currently queued on a receiver.
    fn drain(rx: &mut mpsc::Receiver<Bytes>) -> Vec<ServerMessage> {
        let mut out = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            out.push(decode_server_message(&frame).unwrap());
        }
        out
    }

    /// Room hosted by `h` with `a` and `b` joined.
    async fn room_hab(rooms: &RoomManager) -> String {
        let code = rooms.create_room(&member("h"), None, None).await.unwrap().room_code;
        rooms.join_room(&code, &member("a"), None).await.unwrap();
        rooms.join_room(&code, &member("b"), None).await.unwrap();
        code
    }

    #[tokio::test]
    async fn create_and_join() {
        let rooms = manager().await;
        let snap = rooms.create_room(&member("h"), None, None).await.unwrap();
        assert_eq!(snap.status, RoomStatus::Waiting);
        assert_eq!(snap.host_id, pid("h"));
        assert_eq!(rooms.stats().await.total, 1);

        let (outcome, snap) = rooms
            .join_room(&snap.room_code, &member("a"), None)
            .await
            .unwrap();
        assert_eq!(outcome, JoinOutcome::Joined);
        assert_eq!(snap.participants.len(), 2);
    }

    #[tokio::test]
    async fn unknown_room_is_not_found() {
        let rooms = manager().await;
        let err = rooms
            .join_room("ZZZZZZ", &member("a"), None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn requested_capacity_tightens_server_cap() {
        let rooms = manager_with(RoomsConfig {
            max_participants: 3,
            ..RoomsConfig::default()
        })
        .await;
        let code = rooms
            .create_room(&member("h"), Some(2), None)
            .await
            .unwrap()
            .room_code;
        rooms.join_room(&code, &member("a"), None).await.unwrap();
        let err = rooms
            .join_room(&code, &member("b"), None)
            .await
            .unwrap_err();
        assert_eq!(err, SessionError::RoomFull { capacity: 2 });

        let err = rooms
            .create_room(&member("h"), Some(0), None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[tokio::test]
    async fn subscribers_see_join_start_and_end() {
        let rooms = manager().await;
        let (tx_h, mut rx_h) = mpsc::channel(64);
        let (tx_a, mut rx_a) = mpsc::channel(64);
        let code = rooms
            .create_room(&member("h"), None, Some(tx_h))
            .await
            .unwrap()
            .room_code;
        rooms
            .join_room(&code, &member("a"), Some(tx_a))
            .await
            .unwrap();
        drain(&mut rx_h);
        drain(&mut rx_a);

        rooms.start_session(&code, &pid("h"), 60).await.unwrap();
        drain(&mut rx_h);
        let msgs = drain(&mut rx_a);
        assert!(matches!(&msgs[0], ServerMessage::SessionStarted(s) if s.target_duration_secs == 60));
        assert!(matches!(&msgs[1], ServerMessage::RoomUpdate(s) if s.status == RoomStatus::InProgress));

        rooms.report_progress(&code, &pid("a"), 60).await.unwrap();
        let msgs = drain(&mut rx_h);
        let ServerMessage::SessionEnded(ended) = &msgs[0] else {
            panic!("Expected SessionEnded, got: {msgs:?}");
        };
        assert_eq!(ended.winner_id, Some(pid("a")));
        assert_eq!(ended.winner_name.as_deref(), Some("A"));
        assert_eq!(ended.reason, EndReason::TargetReached);
    }

    #[tokio::test]
    async fn scenario_first_to_cross_wins_and_is_recorded_once() {
        let rooms = manager().await;
        let code = room_hab(&rooms).await;
        rooms.start_session(&code, &pid("h"), 60).await.unwrap();

        rooms.report_progress(&code, &pid("a"), 30).await.unwrap();
        rooms.report_progress(&code, &pid("b"), 45).await.unwrap();
        let outcome = rooms.report_progress(&code, &pid("a"), 65).await.unwrap();
        assert!(matches!(outcome, ProgressOutcome::Won(_)));
        let late = rooms.report_progress(&code, &pid("b"), 70).await.unwrap();
        assert_eq!(late, ProgressOutcome::LateReport);

        let snap = rooms.snapshot(&code).await.unwrap();
        assert_eq!(snap.status, RoomStatus::Ended);
        assert_eq!(snap.winner_id, Some(pid("a")));
        assert_eq!(snap.participant(&pid("b")).unwrap().elapsed_seconds, 70);

        let records = rooms.history().by_room(&code).await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].durations_by_participant[&pid("b")], 45);

        let again = rooms.end_session(&code, &pid("h")).await.unwrap();
        assert!(matches!(again, EndOutcome::AlreadySettled(r) if r.id == records[0].id));
        assert_eq!(rooms.history().by_room(&code).await.len(), 1);
    }

    #[tokio::test]
    async fn concurrent_crossings_produce_one_winner() {
        let rooms = Arc::new(manager().await);
        let code = rooms.create_room(&member("h"), None, None).await.unwrap().room_code;
        // Host plus 15 fills the default roster cap of 16.
        let ids: Vec<String> = (0..15).map(|i| format!("p{i}")).collect();
        for id in &ids {
            rooms.join_room(&code, &member(id), None).await.unwrap();
        }
        assert_eq!(rooms.snapshot(&code).await.unwrap().participants.len(), 16);
        rooms.start_session(&code, &pid("h"), 60).await.unwrap();

        let mut tasks = Vec::new();
        for id in ids {
            let rooms = Arc::clone(&rooms);
            let code = code.clone();
            tasks.push(tokio::spawn(async move {
                let me = pid(&id);
                let ender = rooms.end_session(&code, &me);
                let report = rooms.report_progress(&code, &me, 61);
                let (end, report) = tokio::join!(ender, report);
                (end.unwrap(), report.unwrap())
            }));
        }

        let mut ended = 0;
        let mut won = 0;
        for task in tasks {
            let (end, report) = task.await.unwrap();
            if matches!(end, EndOutcome::Ended(_)) {
                ended += 1;
            }
            if matches!(report, ProgressOutcome::Won(_)) {
                won += 1;
            }
        }
        assert_eq!(ended + won, 1);

        let snap = rooms.snapshot(&code).await.unwrap();
        assert_eq!(snap.participants.iter().filter(|p| p.is_winner).count(), won);
        assert_eq!(rooms.history().by_room(&code).await.len(), 1);
    }

    #[tokio::test]
    async fn command_order_is_enforced() {
        let rooms = manager().await;
        let code = room_hab(&rooms).await;

        let err = rooms.start_session(&code, &pid("a"), 60).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Forbidden);
        let err = rooms.start_session(&code, &pid("h"), 0).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        let err = rooms.report_progress(&code, &pid("a"), 5).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
        let err = rooms.end_session(&code, &pid("a")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
        let err = rooms.end_session(&code, &pid("zed")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Forbidden);

        rooms.start_session(&code, &pid("h"), 60).await.unwrap();
        let err = rooms.start_session(&code, &pid("h"), 60).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
        let err = rooms.join_room(&code, &member("late"), None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
        let err = rooms.report_progress(&code, &pid("zed"), 5).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn rejoin_resubscribes_in_any_status() {
        let rooms = manager().await;
        let code = room_hab(&rooms).await;
        rooms.start_session(&code, &pid("h"), 60).await.unwrap();

        let (tx, mut rx) = mpsc::channel(8);
        let (outcome, _) = rooms
            .join_room(&code, &member("a"), Some(tx))
            .await
            .unwrap();
        assert_eq!(outcome, JoinOutcome::AlreadyMember);
        // The rejoiner alone gets the current snapshot.
        let msgs = drain(&mut rx);
        assert_eq!(msgs.len(), 1);
        assert!(matches!(&msgs[0], ServerMessage::RoomUpdate(s) if s.status == RoomStatus::InProgress));
    }

    #[tokio::test]
    async fn progress_broadcasts_are_throttled() {
        let rooms = manager_with(RoomsConfig {
            progress_broadcast_interval_ms: 60_000,
            ..RoomsConfig::default()
        })
        .await;
        let (tx, mut rx) = mpsc::channel(64);
        let code = rooms
            .create_room(&member("h"), None, Some(tx))
            .await
            .unwrap()
            .room_code;
        rooms.join_room(&code, &member("a"), None).await.unwrap();
        rooms.start_session(&code, &pid("h"), 100).await.unwrap();
        drain(&mut rx);

        for secs in [10, 20, 30] {
            rooms.report_progress(&code, &pid("a"), secs).await.unwrap();
        }
        assert_eq!(drain(&mut rx).len(), 1);

        // The winning report is never throttled.
        rooms.report_progress(&code, &pid("a"), 100).await.unwrap();
        let msgs = drain(&mut rx);
        assert!(matches!(msgs[0], ServerMessage::SessionEnded(_)));
        // The stored value is always current even when not broadcast.
        let record = &rooms.history().by_room(&code).await[0];
        assert_eq!(record.durations_by_participant[&pid("a")], 100);
    }

    #[tokio::test]
    async fn leaving_waiting_room_migrates_host_then_discards() {
        let rooms = manager().await;
        let code = rooms.create_room(&member("h"), None, None).await.unwrap().room_code;
        rooms.join_room(&code, &member("a"), None).await.unwrap();

        let outcome = rooms.leave_room(&code, &pid("h")).await.unwrap();
        assert_eq!(
            outcome,
            LeaveOutcome::Removed {
                new_host: Some(pid("a"))
            }
        );
        assert_eq!(rooms.snapshot(&code).await.unwrap().host_id, pid("a"));

        assert_eq!(
            rooms.leave_room(&code, &pid("a")).await.unwrap(),
            LeaveOutcome::Emptied
        );
        assert_eq!(rooms.stats().await.total, 0);
        let err = rooms.snapshot(&code).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn everyone_leaving_abandons_and_records() {
        let rooms = manager().await;
        let code = room_hab(&rooms).await;
        rooms.start_session(&code, &pid("h"), 60).await.unwrap();
        rooms.report_progress(&code, &pid("a"), 20).await.unwrap();

        for id in ["h", "a"] {
            assert_eq!(
                rooms.leave_room(&code, &pid(id)).await.unwrap(),
                LeaveOutcome::ExitedEarly
            );
        }
        let err = rooms.report_progress(&code, &pid("a"), 30).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);

        let outcome = rooms.leave_room(&code, &pid("b")).await.unwrap();
        let LeaveOutcome::Abandoned(record) = outcome else {
            panic!("Expected Abandoned, got: {outcome:?}");
        };
        assert_eq!(record.winner_id, None);
        assert_eq!(record.reason, EndReason::Abandoned);
        assert_eq!(record.durations_by_participant[&pid("a")], 20);
        assert_eq!(rooms.history().by_room(&code).await.len(), 1);
    }

    #[tokio::test]
    async fn invite_rules_and_delivery() {
        let history = HistoryRecorder::with_store(
            Arc::new(MemoryMatchStore::new()),
            &HistoryConfig::default(),
        )
        .await
        .unwrap();
        let presence = Arc::new(PresenceRegistry::new());
        let rooms = RoomManager::new(
            RoomsConfig::default(),
            Arc::new(history),
            Arc::clone(&presence),
        );
        let (tx, mut rx) = mpsc::channel(8);
        presence.register(pid("friend"), tx).await;

        let code = rooms.create_room(&member("h"), None, None).await.unwrap().room_code;
        assert!(rooms.invite(&code, &pid("h"), &pid("friend")).await.unwrap());
        match decode_server_message(&rx.recv().await.unwrap()).unwrap() {
            ServerMessage::Invitation(inv) => {
                assert_eq!(inv.room_code, code);
                assert_eq!(inv.inviter_name, "H");
            },
            other => panic!("Expected Invitation, got: {other:?}"),
        }

        // Offline invitees are not an error.
        assert!(!rooms.invite(&code, &pid("h"), &pid("offline")).await.unwrap());

        let err = rooms
            .invite(&code, &pid("stranger"), &pid("friend"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Forbidden);

        rooms.start_session(&code, &pid("h"), 10).await.unwrap();
        let err = rooms
            .invite(&code, &pid("h"), &pid("friend"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
    }

    #[tokio::test]
    async fn disconnect_keeps_room_state() {
        let rooms = manager().await;
        let (tx, _rx) = mpsc::channel(8);
        let code = rooms
            .create_room(&member("h"), None, Some(tx.clone()))
            .await
            .unwrap()
            .room_code;
        rooms.disconnect(&pid("h"), &tx, [&code]).await;

        let snap = rooms.snapshot(&code).await.unwrap();
        assert_eq!(snap.participants.len(), 1);
        assert_eq!(snap.host_id, pid("h"));
    }

    #[tokio::test]
    async fn reaper_expires_discards_and_evicts() {
        let rooms = manager_with(RoomsConfig {
            idle_timeout_secs: 60,
            ended_room_ttl_secs: 30,
            ..RoomsConfig::default()
        })
        .await;
        let running = room_hab(&rooms).await;
        rooms.start_session(&running, &pid("h"), 600).await.unwrap();
        rooms.report_progress(&running, &pid("a"), 90).await.unwrap();
        let waiting = rooms.create_room(&member("w"), None, None).await.unwrap().room_code;

        // Nothing is idle yet.
        assert_eq!(rooms.reap_idle().await, ReapStats::default());

        let later = Instant::now() + Duration::from_secs(61);
        let stats = rooms.reap_idle_at(later).await;
        assert_eq!(stats.expired, 1);
        assert_eq!(stats.discarded, 1);
        assert!(rooms.snapshot(&waiting).await.is_err());

        let snap = rooms.snapshot(&running).await.unwrap();
        assert_eq!(snap.status, RoomStatus::Ended);
        assert_eq!(snap.winner_id, None);
        assert_eq!(snap.end_reason, Some(EndReason::IdleTimeout));
        let records = rooms.history().by_room(&running).await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].reason, EndReason::IdleTimeout);

        let much_later = Instant::now() + Duration::from_secs(31);
        let stats = rooms.reap_idle_at(much_later).await;
        assert_eq!(stats.evicted, 1);
        assert_eq!(rooms.stats().await.total, 0);
    }

    #[tokio::test]
    async fn stats_count_rooms_by_status() {
        let rooms = manager().await;
        let a = room_hab(&rooms).await;
        room_hab(&rooms).await;
        rooms.start_session(&a, &pid("h"), 60).await.unwrap();
        let (tx, _rx) = mpsc::channel(4);
        rooms.join_room(&a, &member("a"), Some(tx)).await.unwrap();
        let stats = rooms.stats().await;
        assert_eq!(stats.total, 2);
        assert_eq!(stats.waiting, 1);
        assert_eq!(stats.in_progress, 1);
        assert_eq!(stats.participants, 6);
        assert_eq!(stats.subscribers, 1);
    }
}
