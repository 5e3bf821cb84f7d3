use chrono::{DateTime, Utc};

/// UTC wall-clock instant used for every room and record timestamp.
pub type Timestamp = DateTime<Utc>;

/// Current UTC time.
pub fn timestamp_now() -> Timestamp {
    Utc::now()
}
