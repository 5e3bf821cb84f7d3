pub mod error;
pub mod match_record;
pub mod net;
pub mod participant;
pub mod room;
pub mod time;

#[cfg(any(test, feature = "test-helpers"))]
pub mod test_helpers {
    use crate::match_record::MatchRecord;
    use crate::participant::ParticipantId;
    use crate::room::{EndOutcome, Room};
    use crate::time::timestamp_now;

    /// Create `n` participant ids `p1..pn`.
    pub fn make_ids(n: usize) -> Vec<ParticipantId> {
        (1..=n).map(|i| ParticipantId::new(format!("p{i}"))).collect()
    }

    /// A waiting room hosted by the first id with the rest joined.
    pub fn make_room(code: &str, ids: &[ParticipantId]) -> Room {
        let (host, rest) = ids.split_first().expect("at least one participant");
        let mut room = Room::new(
            code.to_string(),
            host.clone(),
            host.to_string(),
            timestamp_now(),
        );
        for id in rest {
            room.join(id.clone(), id.to_string())
                .expect("join waiting room");
        }
        room
    }

    /// Play a full session: start with `target`, report `elapsed[i]` for
    /// `ids[i]`, then end it as the host. Returns the settled record.
    pub fn make_finished_record(
        code: &str,
        ids: &[ParticipantId],
        elapsed: &[u64],
        target: i64,
    ) -> MatchRecord {
        let mut room = make_room(code, ids);
        let now = timestamp_now();
        room.start(&ids[0], target, now).expect("start");
        for (id, secs) in ids.iter().zip(elapsed) {
            let _ = room.report_progress(id, *secs, now);
        }
        match room.end(&ids[0], now).expect("end") {
            EndOutcome::Ended(record) | EndOutcome::AlreadySettled(record) => record,
        }
    }
}
