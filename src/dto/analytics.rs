use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::services::overrides::variant::Variant;

/// Kind of engagement recorded for a game card.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// Card became visible.
    Impression,
    /// Pointer or touch engagement started.
    HoverStart,
    /// Engagement ended; carries its duration.
    HoverEnd,
    /// Click or tap on the media surface.
    VideoClick,
    /// Activation of a control inside the card.
    ButtonClick,
    /// Video started.
    VideoPlay,
    /// Video paused; carries the playback position.
    VideoPause,
    /// Video played to the end.
    VideoComplete,
}

/// Which asset the event refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetType {
    /// Poster image.
    Image,
    /// Video.
    Video,
    /// Control inside the card.
    Button,
}

/// Coarse device class derived from the user agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceClass {
    /// Desktop or unknown device.
    Desktop,
    /// Phone.
    Mobile,
    /// Tablet.
    Tablet,
}

impl DeviceClass {
    /// Classify a user agent string the way the embed snippet does.
    pub fn from_user_agent(user_agent: &str) -> Self {
        let ua = user_agent.to_lowercase();
        if ["mobile", "android", "iphone", "phone"]
            .iter()
            .any(|needle| ua.contains(needle))
        {
            DeviceClass::Mobile
        } else if ua.contains("tablet") || ua.contains("ipad") {
            DeviceClass::Tablet
        } else {
            DeviceClass::Desktop
        }
    }
}

/// Structured engagement event as buffered, persisted and sent in batches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyticsEvent {
    /// Client generated identifier, used by the backend to drop duplicates.
    pub id: String,
    /// Game the event refers to.
    pub game_id: String,
    /// What happened.
    pub event_type: EventType,
    /// Asset the event refers to.
    pub asset_type: AssetType,
    /// URL of that asset; empty when unknown.
    #[serde(default)]
    pub asset_url: String,
    /// Session that produced the event.
    pub session_id: String,
    /// Device class of that session.
    pub device: DeviceClass,
    /// Experiment arm, present only on experiment analytics.
    #[serde(default, skip_serializing_if = "Option::is_none", with = "variant_label")]
    pub variant: Option<Variant>,
    /// RFC 3339 creation time.
    pub timestamp: String,
    /// Viewport, touch capability and event specific fields.
    #[serde(default)]
    pub data: Map<String, Value>,
}

/// Experiment events carry `variantA`/`variantB` on the wire.
mod variant_label {
    use serde::{Deserialize, Deserializer, Serializer};

    use crate::services::overrides::variant::Variant;

    pub fn serialize<S: Serializer>(value: &Option<Variant>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(variant) => serializer.serialize_str(variant.wire_label()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Variant>, D::Error> {
        let raw = Option::<String>::deserialize(deserializer)?;
        Ok(raw.as_deref().and_then(Variant::from_wire_label))
    }
}
