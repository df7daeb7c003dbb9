use casefeed_core::{AgentRef, EventKind, TimelineEvent};
use chrono::{TimeZone, Utc};

pub(crate) fn event(n: u64, kind: EventKind, case_id: Option<&str>) -> TimelineEvent {
    TimelineEvent {
        id: format!("evt-{n}"),
        kind,
        timestamp: Utc
            .timestamp_millis_opt(1_770_000_000_000 + n as i64)
            .single()
            .expect("valid timestamp"),
        message: format!("event {n}"),
        case_id: case_id.map(str::to_string),
        run_id: None,
        agent: Some(AgentRef::new("observer")),
        data: None,
    }
}
