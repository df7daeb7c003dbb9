use crate::event::{AgentRef, EventKind, TimelineEvent};
use crate::wire::{WireEvent, WireKind};
use chrono::{DateTime, NaiveDateTime, Utc};
use sha2::{Digest, Sha256};
use thiserror::Error;

const CONTENT_ID_PREFIX: &str = "h:";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Rejected {
    #[error("message body missing")]
    MissingMessage,
    #[error("invalid timestamp '{0}'")]
    InvalidTimestamp(String),
}

/// Map one wire message onto the canonical timeline shape.
///
/// `received_at` stands in for the origin time when the server omitted it.
/// Unknown kinds become [`EventKind::FALLBACK`]; a missing or blank message
/// body rejects the whole message.
pub fn normalize(raw: WireEvent, received_at: DateTime<Utc>) -> Result<TimelineEvent, Rejected> {
    let message = match raw.message.as_deref().map(str::trim) {
        Some(body) if !body.is_empty() => body.to_string(),
        _ => return Err(Rejected::MissingMessage),
    };

    let wire_timestamp = non_blank(raw.timestamp.as_deref());
    let timestamp = match wire_timestamp {
        Some(value) => {
            parse_timestamp(value).ok_or_else(|| Rejected::InvalidTimestamp(value.to_string()))?
        }
        None => received_at,
    };

    let kind = match &raw.kind {
        Some(WireKind::Known(kind)) => *kind,
        Some(WireKind::Unrecognized(_)) | None => EventKind::FALLBACK,
    };
    let case_id = non_blank(raw.case_id.as_deref()).map(str::to_string);
    let run_id = non_blank(raw.run_id.as_deref()).map(str::to_string);
    let agent = non_blank(raw.agent.as_deref()).map(AgentRef::new);

    let id = match raw.server_id() {
        Some(server_id) => server_id.to_string(),
        None => content_id(
            raw.kind.as_ref().map(WireKind::as_str),
            wire_timestamp,
            &message,
            case_id.as_deref(),
            run_id.as_deref(),
            agent.as_ref().map(AgentRef::id),
        ),
    };

    let data = match raw.data {
        Some(value) if !value.is_null() => Some(value),
        _ => None,
    };

    Ok(TimelineEvent {
        id,
        kind,
        timestamp,
        message,
        case_id,
        run_id,
        agent,
        data,
    })
}

/// Accepts RFC 3339 and naive ISO-8601 timestamps; naive values are UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let value = raw.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return Some(parsed.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(value, format).ok())
        .map(|naive| naive.and_utc())
}

// The raw wire kind and timestamp feed the hash, not their normalized forms,
// so a redelivered message hashes identically whatever the receipt time.
fn content_id(
    kind: Option<&str>,
    timestamp: Option<&str>,
    message: &str,
    case_id: Option<&str>,
    run_id: Option<&str>,
    agent: Option<&str>,
) -> String {
    let mut hasher = Sha256::new();
    for field in [kind, timestamp, Some(message), case_id, run_id, agent] {
        match field {
            Some(value) => {
                hasher.update([1u8]);
                hasher.update((value.len() as u64).to_be_bytes());
                hasher.update(value.as_bytes());
            }
            None => hasher.update([0u8]),
        }
    }
    let digest = hasher.finalize();
    let hex: String = digest[..16].iter().map(|byte| format!("{byte:02x}")).collect();
    format!("{CONTENT_ID_PREFIX}{hex}")
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn received() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 7, 21, 0, 0)
            .single()
            .expect("valid timestamp")
    }

    fn wire(kind: &str, message: Option<&str>) -> WireEvent {
        WireEvent {
            kind: Some(WireKind::parse(kind)),
            message: message.map(str::to_string),
            timestamp: Some("2026-02-07T20:59:58.250000".to_string()),
            case_id: Some("TW-1042".to_string()),
            run_id: Some("run-3".to_string()),
            agent: Some("observer".to_string()),
            ..WireEvent::default()
        }
    }

    #[test]
    fn missing_or_blank_message_is_rejected() {
        assert_eq!(
            normalize(wire("case_created", None), received()),
            Err(Rejected::MissingMessage)
        );
        assert_eq!(
            normalize(wire("case_created", Some("   ")), received()),
            Err(Rejected::MissingMessage)
        );
    }

    #[test]
    fn unknown_kind_falls_back_to_system_message() {
        let event = normalize(wire("run_paused", Some("paused")), received()).expect("normalize");
        assert_eq!(event.kind, EventKind::SystemMessage);
        assert_eq!(event.message, "paused");
    }

    #[test]
    fn missing_kind_falls_back_too() {
        let raw = WireEvent {
            message: Some("hello".to_string()),
            ..WireEvent::default()
        };
        let event = normalize(raw, received()).expect("normalize");
        assert_eq!(event.kind, EventKind::SystemMessage);
        assert_eq!(event.timestamp, received());
    }

    #[test]
    fn naive_timestamps_are_utc() {
        let event = normalize(wire("case_updated", Some("m")), received()).expect("normalize");
        assert_eq!(
            event.timestamp,
            Utc.with_ymd_and_hms(2026, 2, 7, 20, 59, 58).single().expect("ts")
                + chrono::Duration::milliseconds(250)
        );
        assert_eq!(
            parse_timestamp("2026-02-07T21:00:00+02:00"),
            Utc.with_ymd_and_hms(2026, 2, 7, 19, 0, 0).single()
        );
    }

    #[test]
    fn garbage_timestamp_is_rejected() {
        let mut raw = wire("case_updated", Some("m"));
        raw.timestamp = Some("yesterday".to_string());
        assert_eq!(
            normalize(raw, received()),
            Err(Rejected::InvalidTimestamp("yesterday".to_string()))
        );
    }

    #[test]
    fn server_id_wins_over_content_hash() {
        let mut raw = wire("case_updated", Some("m"));
        raw.event_id = Some("evt-1".to_string());
        assert_eq!(normalize(raw, received()).expect("normalize").id, "evt-1");
    }

    #[test]
    fn content_id_is_stable_across_redelivery() {
        let first = normalize(wire("tool_called", Some("lookup")), received()).expect("first");
        let later = received() + chrono::Duration::seconds(40);
        let second = normalize(wire("tool_called", Some("lookup")), later).expect("second");
        assert_eq!(first.id, second.id);
        assert!(first.id.starts_with(CONTENT_ID_PREFIX));

        let other = normalize(wire("tool_called", Some("lookup v2")), received()).expect("other");
        assert_ne!(first.id, other.id);
    }

    #[test]
    fn field_boundaries_do_not_collide() {
        let mut left = wire("tool_called", Some("ab"));
        left.case_id = Some("c".to_string());
        let mut right = wire("tool_called", Some("a"));
        right.case_id = Some("bc".to_string());
        let left = normalize(left, received()).expect("left");
        let right = normalize(right, received()).expect("right");
        assert_ne!(left.id, right.id);
    }

    #[test]
    fn null_data_is_dropped_and_objects_kept() {
        let mut raw = wire("pattern_matched", Some("match"));
        raw.data = Some(serde_json::Value::Null);
        assert!(normalize(raw.clone(), received()).expect("null").data.is_none());

        raw.data = Some(serde_json::json!({"similarity": 0.93}));
        let event = normalize(raw, received()).expect("object");
        assert_eq!(event.data, Some(serde_json::json!({"similarity": 0.93})));
    }
}
