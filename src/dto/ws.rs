//! Frames exchanged with the backend over the push connection.
//!
//! Every frame is a JSON text message of the form `{ "event": <name>, "data": <payload> }`.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

use crate::dto::{
    analytics::AnalyticsEvent,
    catalog::{AbTestRecord, PromotionRecord},
    format_timestamp,
    game::GameRecord,
};

#[derive(Debug, Clone, PartialEq, Serialize)]
/// Messages the runtime sends to the backend.
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum OutboundMessage {
    /// Subscribe to push updates of these games.
    JoinGameRooms {
        /// Games to follow.
        #[serde(rename = "gameIds")]
        game_ids: Vec<String>,
        /// RFC 3339 send time.
        timestamp: String,
    },
    /// Stop following these games.
    LeaveGameRooms {
        /// Games to drop.
        #[serde(rename = "gameIds")]
        game_ids: Vec<String>,
        /// RFC 3339 send time.
        timestamp: String,
    },
    /// Data request.
    SdkEvent(SdkEvent),
    /// Asset analytics batch.
    AnalyticsEventBatch {
        /// Buffered events, oldest first.
        events: Vec<AnalyticsEvent>,
    },
    /// Experiment analytics batch.
    AbtestAnalyticsBatch {
        /// Buffered events, oldest first.
        events: Vec<AnalyticsEvent>,
    },
    /// Diagnostic query for room membership.
    GetRoomCounts {
        /// Games to count.
        #[serde(rename = "gameIds")]
        game_ids: Vec<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
/// Payload of an `sdk-event` frame.
pub struct SdkEvent {
    /// Request carried by the frame.
    #[serde(flatten)]
    pub request: SdkRequest,
    /// RFC 3339 send time.
    pub timestamp: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
/// Data requests tunnelled through `sdk-event`.
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum SdkRequest {
    /// Current data of these games.
    GetGames {
        /// Games to fetch.
        #[serde(rename = "gameIds")]
        game_ids: Vec<String>,
    },
    /// Promotion catalog.
    GetPromotions {},
    /// Experiment catalog.
    GetAbTests {},
}

impl OutboundMessage {
    /// Room subscription for `game_ids`.
    pub fn join_rooms(game_ids: Vec<String>, now: OffsetDateTime) -> Self {
        Self::JoinGameRooms {
            game_ids,
            timestamp: format_timestamp(now),
        }
    }

    /// Room unsubscription for `game_ids`.
    pub fn leave_rooms(game_ids: Vec<String>, now: OffsetDateTime) -> Self {
        Self::LeaveGameRooms {
            game_ids,
            timestamp: format_timestamp(now),
        }
    }

    /// Data request wrapped in `sdk-event`.
    pub fn sdk(request: SdkRequest, now: OffsetDateTime) -> Self {
        Self::SdkEvent(SdkEvent {
            request,
            timestamp: format_timestamp(now),
        })
    }

    /// Event name used on the wire, for logging.
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::JoinGameRooms { .. } => "join-game-rooms",
            Self::LeaveGameRooms { .. } => "leave-game-rooms",
            Self::SdkEvent(_) => "sdk-event",
            Self::AnalyticsEventBatch { .. } => "analytics-event-batch",
            Self::AbtestAnalyticsBatch { .. } => "abtest-analytics-batch",
            Self::GetRoomCounts { .. } => "get-room-counts",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
/// Raw frame as received, before the payload is interpreted.
pub struct Frame {
    /// Event name.
    pub event: String,
    /// Payload, `null` when absent.
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Clone, PartialEq)]
/// Messages pushed by the backend.
pub enum InboundMessage {
    /// Answer to `get-games`.
    GamesResponse(GamesPayload),
    /// Games changed on the backend.
    GamesUpdated(GamesPayload),
    /// Answer to `get-promotions`.
    PromotionsResponse(PromotionsPayload),
    /// Promotion catalog changed.
    PromotionsUpdated(PromotionsPayload),
    /// Answer to `get-ab-tests`.
    AbTestsResponse(AbTestsPayload),
    /// Experiment catalog changed.
    AbTestsUpdated(AbTestsPayload),
    /// Room membership counts.
    RoomCounts(RoomCountsPayload),
    /// Any event this runtime does not handle.
    Unknown(String),
}

impl InboundMessage {
    /// Decode a text frame. Unknown event names are not an error.
    pub fn decode(text: &str) -> Result<Self, serde_json::Error> {
        let frame: Frame = serde_json::from_str(text)?;
        Self::from_frame(frame)
    }

    /// Interpret an already parsed frame.
    pub fn from_frame(frame: Frame) -> Result<Self, serde_json::Error> {
        let Frame { event, data } = frame;
        let message = match event.as_str() {
            "games-response" => Self::GamesResponse(serde_json::from_value(data)?),
            "games-updated" => Self::GamesUpdated(serde_json::from_value(data)?),
            "promotions-response" => Self::PromotionsResponse(serde_json::from_value(data)?),
            "promotions-updated" => Self::PromotionsUpdated(serde_json::from_value(data)?),
            "abtests-response" => Self::AbTestsResponse(serde_json::from_value(data)?),
            "abtests-updated" => Self::AbTestsUpdated(serde_json::from_value(data)?),
            "room-counts" => Self::RoomCounts(serde_json::from_value(data)?),
            _ => Self::Unknown(event),
        };
        Ok(message)
    }

    /// Wire event name, used as the bus topic.
    pub fn event_name(&self) -> &str {
        match self {
            Self::GamesResponse(_) => "games-response",
            Self::GamesUpdated(_) => "games-updated",
            Self::PromotionsResponse(_) => "promotions-response",
            Self::PromotionsUpdated(_) => "promotions-updated",
            Self::AbTestsResponse(_) => "abtests-response",
            Self::AbTestsUpdated(_) => "abtests-updated",
            Self::RoomCounts(_) => "room-counts",
            Self::Unknown(event) => event.as_str(),
        }
    }
}

/// Payload of `games-response` and `games-updated`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct GamesPayload {
    /// `false` when the backend rejected the request.
    #[serde(default = "default_success")]
    pub success: bool,
    /// Game records.
    #[serde(default)]
    pub games: Vec<GameRecord>,
    /// Backend error message on failure.
    #[serde(default)]
    pub error: Option<String>,
}

/// Payload of `promotions-response` and `promotions-updated`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PromotionsPayload {
    /// `false` when the backend rejected the request.
    #[serde(default = "default_success")]
    pub success: bool,
    /// `None` when the push only signals that promotions changed.
    #[serde(default)]
    pub promotions: Option<Vec<PromotionRecord>>,
}

/// Payload of `abtests-response` and `abtests-updated`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AbTestsPayload {
    /// `false` when the backend rejected the request.
    #[serde(default = "default_success")]
    pub success: bool,
    /// `None` when the push only signals that experiments changed.
    #[serde(default)]
    pub abtests: Option<Vec<AbTestRecord>>,
}

/// Payload of `room-counts`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomCountsPayload {
    /// Member count per room.
    #[serde(default)]
    pub room_counts: HashMap<String, u64>,
}

fn default_success() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use time::macros::datetime;

    use super::*;

    #[test]
    fn sdk_requests_use_nested_event_envelope() {
        let message = OutboundMessage::sdk(
            SdkRequest::GetGames {
                game_ids: vec!["game-1".into()],
            },
            datetime!(2024-01-05 10:00 UTC),
        );

        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(
            json,
            json!({
                "event": "sdk-event",
                "data": {
                    "event": "get-games",
                    "data": { "gameIds": ["game-1"] },
                    "timestamp": "2024-01-05T10:00:00Z"
                }
            })
        );
    }

    #[test]
    fn catalog_requests_carry_empty_data() {
        let message = OutboundMessage::sdk(SdkRequest::GetAbTests {}, datetime!(2024-01-05 10:00 UTC));
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["data"]["event"], "get-ab-tests");
        assert_eq!(json["data"]["data"], json!({}));
    }

    #[test]
    fn join_rooms_frame_shape() {
        let message = OutboundMessage::join_rooms(vec!["a".into(), "b".into()], datetime!(2024-01-05 10:00 UTC));
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["event"], "join-game-rooms");
        assert_eq!(json["data"]["gameIds"], json!(["a", "b"]));
        assert_eq!(message.event_name(), "join-game-rooms");
    }

    #[test]
    fn decodes_games_and_unknown_frames() {
        let text = r#"{"event":"games-updated","data":{"games":[{"id":"game-1","version":"3","published":true}]}}"#;
        match InboundMessage::decode(text).unwrap() {
            InboundMessage::GamesUpdated(payload) => {
                assert!(payload.success);
                assert_eq!(payload.games[0].version, "3");
            }
            other => panic!("unexpected message {other:?}"),
        }

        let unknown = InboundMessage::decode(r#"{"event":"debug-ping"}"#).unwrap();
        assert_eq!(unknown, InboundMessage::Unknown("debug-ping".into()));
    }

    #[test]
    fn failed_games_response_keeps_error() {
        let text = r#"{"event":"games-response","data":{"success":false,"error":"invalid key"}}"#;
        let InboundMessage::GamesResponse(payload) = InboundMessage::decode(text).unwrap() else {
            panic!("expected games-response");
        };
        assert!(!payload.success);
        assert!(payload.games.is_empty());
        assert_eq!(payload.error.as_deref(), Some("invalid key"));
    }

    #[test]
    fn promotions_update_without_catalog_is_a_signal() {
        let text = r#"{"event":"promotions-updated","data":{"success":true,"count":0}}"#;
        let InboundMessage::PromotionsUpdated(payload) = InboundMessage::decode(text).unwrap() else {
            panic!("expected promotions-updated");
        };
        assert!(payload.promotions.is_none());
    }
}
