//! Event feed frames.
//!
//! Every frame is a JSON object with an integer `op` code, an optional
//! payload `d` and an optional event type `t`:
//!
//! ```json
//! { "op": 0, "d": { "message": "Welcome!", "heartbeat": 35000 } }
//! { "op": 1, "t": "TRACK_UPDATE", "d": { "song": { ... }, "startTime": "...", "listeners": 120 } }
//! { "op": 10 }
//! ```
//!
//! The only frame the client sends is the heartbeat, `{"op":9}`.

use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;

use crate::{error::Result, song::Song};

pub const OP_HELLO: u64 = 0;
pub const OP_TRACK: u64 = 1;
pub const OP_HEARTBEAT: u64 = 9;
pub const OP_HEARTBEAT_ACK: u64 = 10;

/// Heartbeat frame sent by the client.
pub const HEARTBEAT: &str = r#"{"op":9}"#;

/// Event types of op 1 frames that announce a new track.
pub const TRACK_EVENTS: [&str; 2] = ["TRACK_UPDATE", "TRACK_UPDATE_REQUEST"];

#[derive(Clone, Debug, Deserialize)]
struct RawFrame {
    op: u64,
    #[serde(default)]
    d: Value,
    #[serde(default)]
    t: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Frame {
    /// First frame of a session.
    Hello { heartbeat: Duration },

    /// A new track started playing.
    TrackUpdate(Box<TrackUpdate>),

    HeartbeatAck,

    /// Any frame this client does not know about.
    Unknown { op: u64, event: Option<String> },
}

impl Frame {
    /// Parses a text frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame is not JSON, has no op code, or if a
    /// known frame carries a malformed payload.
    pub fn parse(text: &str) -> Result<Self> {
        let frame: RawFrame = super::json(text, "feed")?;
        let frame = match frame.op {
            OP_HELLO => {
                let hello: Hello = serde_json::from_value(frame.d)?;
                Self::Hello {
                    heartbeat: Duration::from_millis(hello.heartbeat),
                }
            }
            OP_TRACK if frame.t.as_deref().is_none_or(|t| TRACK_EVENTS.contains(&t)) => {
                Self::TrackUpdate(Box::new(serde_json::from_value(frame.d)?))
            }
            OP_HEARTBEAT_ACK => Self::HeartbeatAck,
            op => Self::Unknown { op, event: frame.t },
        };

        Ok(frame)
    }
}

#[derive(Clone, Debug, Deserialize)]
struct Hello {
    /// Interval in milliseconds.
    heartbeat: u64,
}

/// Payload of a track update.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackUpdate {
    pub song: Song,

    /// When the track started, as an RFC 3339 timestamp.
    #[serde(default)]
    pub start_time: Option<String>,

    #[serde(default)]
    pub listeners: u64,

    /// Listener who requested the track, if any.
    #[serde(default)]
    pub requester: Option<Requester>,

    /// Special programme currently on air, if any.
    #[serde(default)]
    pub event: Option<RadioEvent>,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Requester {
    #[serde(default)]
    pub uuid: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub display_name: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Deserialize)]
pub struct RadioEvent {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub image: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_hello() {
        let frame =
            Frame::parse(r#"{"op":0,"d":{"message":"Welcome!","heartbeat":35000}}"#).unwrap();
        assert_eq!(
            frame,
            Frame::Hello {
                heartbeat: Duration::from_secs(35)
            }
        );
    }

    #[test]
    fn parses_track_update() {
        let frame = Frame::parse(
            r#"{
                "op": 1,
                "t": "TRACK_UPDATE",
                "d": {
                    "song": { "id": 5, "title": "A", "artists": [{ "id": 1, "name": "B" }], "duration": 200 },
                    "startTime": "2024-01-01T00:00:00.000Z",
                    "lastPlayed": [],
                    "listeners": 321,
                    "requester": { "uuid": "u", "username": "user", "displayName": "User" },
                    "event": null
                }
            }"#,
        )
        .unwrap();

        let Frame::TrackUpdate(update) = frame else {
            panic!("expected a track update, got {frame:?}");
        };
        assert_eq!(update.song.title(), "A");
        assert_eq!(update.listeners, 321);
        assert_eq!(update.requester.unwrap().display_name, "User");
        assert_eq!(update.event, None);
    }

    #[test]
    fn track_update_without_event_type() {
        let frame = Frame::parse(r#"{"op":1,"d":{"song":{"id":1,"title":"A"}}}"#).unwrap();
        assert!(matches!(frame, Frame::TrackUpdate(_)));
    }

    #[test]
    fn other_op_one_events_are_unknown() {
        let frame = Frame::parse(r#"{"op":1,"t":"QUEUE_UPDATE","d":{"amount":3}}"#).unwrap();
        assert_eq!(
            frame,
            Frame::Unknown {
                op: 1,
                event: Some("QUEUE_UPDATE".to_owned())
            }
        );
    }

    #[test]
    fn unknown_ops_are_kept_apart() {
        assert_eq!(Frame::parse(r#"{"op":10}"#).unwrap(), Frame::HeartbeatAck);
        assert_eq!(
            Frame::parse(r#"{"op":42,"d":{}}"#).unwrap(),
            Frame::Unknown { op: 42, event: None }
        );
        assert!(Frame::parse("not json").is_err());
        assert!(Frame::parse(r#"{"op":0,"d":{}}"#).is_err());
    }

    #[test]
    fn heartbeat_frame() {
        let value: Value = serde_json::from_str(HEARTBEAT).unwrap();
        assert_eq!(value["op"], OP_HEARTBEAT);
    }
}
