use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};

use crate::error::ClientError;
use crate::feed::{truncate_car_identifier, EntryOrigin, FeedEntryDraft};

pub fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}

/// Display string submitted with an identifier action and used for the
/// local echo, so the request body and the rendered entry cannot drift.
pub fn identifier_message(identifier: &str) -> String {
    format!("Car number: {identifier}")
}

fn non_blank(value: Option<&Value>) -> Option<String> {
    value
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|raw| !raw.is_empty())
        .map(str::to_string)
}

/// Decodes one inbound push-channel payload into a feed entry draft.
///
/// Frames are JSON objects with optional `message`, `image_path` and
/// `car_number` fields, a `timestamp`, and the sending `client_id`. Blank
/// strings count as absent. A frame carrying none of the three content
/// fields is a protocol error; a missing timestamp falls back to the
/// client clock since ordering never depends on it.
pub fn decode_push_frame(raw: &str, device_id: &str) -> Result<FeedEntryDraft, ClientError> {
    let parsed: Value = serde_json::from_str(raw)
        .map_err(|err| ClientError::protocol(format!("push frame is not valid JSON: {err}")))?;
    let Some(frame) = parsed.as_object() else {
        return Err(ClientError::protocol("push frame is not a JSON object"));
    };

    let text = non_blank(frame.get("message"));
    let image_ref = non_blank(frame.get("image_path"));
    let car_identifier = non_blank(frame.get("car_number"))
        .map(|raw| truncate_car_identifier(&raw))
        .filter(|value| !value.is_empty());
    if text.is_none() && image_ref.is_none() && car_identifier.is_none() {
        return Err(ClientError::protocol("push frame carries no content"));
    }

    let origin = match non_blank(frame.get("client_id")) {
        Some(id) if id == device_id => EntryOrigin::Own,
        _ => EntryOrigin::Remote,
    };

    Ok(FeedEntryDraft {
        origin,
        text,
        image_ref,
        car_identifier,
        timestamp: non_blank(frame.get("timestamp")).unwrap_or_else(now_utc_iso),
    })
}

/// A successful, decoded acknowledgment of a write action.
#[derive(Clone, Debug, PartialEq)]
pub struct Ack {
    pub image_path: Option<String>,
    pub message: Option<String>,
    pub raw: Map<String, Value>,
}

impl Ack {
    /// Any 2xx body must still decode as a JSON object to count as an
    /// acknowledgment; an empty or non-object body is a protocol error.
    pub fn from_body(body: &str) -> Result<Self, ClientError> {
        let parsed: Value = serde_json::from_str(body.trim()).map_err(|err| {
            ClientError::protocol(format!("acknowledgment is not valid JSON: {err}"))
        })?;
        let Some(fields) = parsed.as_object() else {
            return Err(ClientError::protocol("acknowledgment is not a JSON object"));
        };
        Ok(Self {
            image_path: non_blank(fields.get("image_path")),
            message: non_blank(fields.get("message")),
            raw: fields.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use chrono::DateTime;
    use serde_json::json;

    use super::{decode_push_frame, identifier_message, now_utc_iso, Ack};
    use crate::feed::EntryOrigin;

    const DEVICE: &str = "device-1";

    #[test]
    fn decode_full_frame() -> anyhow::Result<()> {
        let raw = json!({
            "message": "hello",
            "image_path": "2024/car.jpg",
            "car_number": "CAR12345",
            "timestamp": "2024-01-01T00:00:00Z",
            "client_id": "device-2",
        })
        .to_string();
        let draft = decode_push_frame(&raw, DEVICE)?;
        assert_eq!(draft.origin, EntryOrigin::Remote);
        assert_eq!(draft.text.as_deref(), Some("hello"));
        assert_eq!(draft.image_ref.as_deref(), Some("2024/car.jpg"));
        assert_eq!(draft.car_identifier.as_deref(), Some("CAR12345"));
        assert_eq!(draft.timestamp, "2024-01-01T00:00:00Z");
        Ok(())
    }

    #[test]
    fn decode_marks_own_client_id() -> anyhow::Result<()> {
        let raw = json!({"message": "mine", "client_id": DEVICE}).to_string();
        let draft = decode_push_frame(&raw, DEVICE)?;
        assert_eq!(draft.origin, EntryOrigin::Own);
        Ok(())
    }

    #[test]
    fn decode_rejects_non_json_and_non_object() {
        assert!(decode_push_frame("not json", DEVICE)
            .err()
            .map(|err| err.is_protocol())
            .unwrap_or(false));
        assert!(decode_push_frame("[1, 2]", DEVICE)
            .err()
            .map(|err| err.is_protocol())
            .unwrap_or(false));
    }

    #[test]
    fn decode_rejects_contentless_frame() {
        let raw = json!({"timestamp": "2024-01-01T00:00:00Z", "client_id": "x"}).to_string();
        let err = decode_push_frame(&raw, DEVICE).err();
        assert!(err.map(|e| e.is_protocol()).unwrap_or(false));
    }

    #[test]
    fn decode_treats_blank_fields_as_absent() {
        let raw = json!({"message": "  ", "image_path": "", "car_number": "  "}).to_string();
        assert!(decode_push_frame(&raw, DEVICE).is_err());
    }

    #[test]
    fn decode_defaults_missing_timestamp_to_client_clock() -> anyhow::Result<()> {
        let raw = json!({"message": "hello"}).to_string();
        let draft = decode_push_frame(&raw, DEVICE)?;
        DateTime::parse_from_rfc3339(&draft.timestamp)?;
        Ok(())
    }

    #[test]
    fn decode_truncates_car_number() -> anyhow::Result<()> {
        let raw = json!({"car_number": "ABCDEFGHIJ"}).to_string();
        let draft = decode_push_frame(&raw, DEVICE)?;
        assert_eq!(draft.car_identifier.as_deref(), Some("ABCDEFGH"));
        Ok(())
    }

    #[test]
    fn ack_from_body_extracts_fields_and_keeps_raw() -> anyhow::Result<()> {
        let ack = Ack::from_body(r#"{"status": "ok", "image_path": "2024/car.jpg"}"#)?;
        assert_eq!(ack.image_path.as_deref(), Some("2024/car.jpg"));
        assert_eq!(ack.message, None);
        assert_eq!(ack.raw.get("status"), Some(&json!("ok")));
        Ok(())
    }

    #[test]
    fn ack_from_body_rejects_empty_and_non_object() {
        assert!(Ack::from_body("").is_err());
        assert!(Ack::from_body("\"ok\"").is_err());
        assert!(Ack::from_body("[]")
            .err()
            .map(|err| err.is_protocol())
            .unwrap_or(false));
    }

    #[test]
    fn identifier_message_embeds_plate() {
        assert_eq!(identifier_message("XYZ1"), "Car number: XYZ1");
    }

    #[test]
    fn now_utc_iso_is_rfc3339() -> anyhow::Result<()> {
        DateTime::parse_from_rfc3339(&now_utc_iso())?;
        Ok(())
    }
}
