use serde::{Deserialize, Deserializer, Serialize};
use serde_with::{NoneAsEmptyString, serde_as};

/// Which asset family a published game shows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PublishedType {
    /// Base assets.
    #[default]
    Default,
    /// Current campaign assets.
    Current,
    /// Seasonal theme assets.
    Theme,
    /// Promotion assets carried on the game itself.
    Promo,
    /// Unknown publish types fall back to the default pair.
    #[serde(other)]
    Unknown,
}

/// Game record as pushed by the backend in `games-response` / `games-updated`.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameRecord {
    /// Internal game identifier, matching the card's tag.
    pub id: String,
    /// Content-management identifier promotions refer to.
    #[serde_as(as = "NoneAsEmptyString")]
    #[serde(default)]
    pub cms_id: Option<String>,
    /// Monotonic content version; numbers are accepted and kept as text.
    #[serde(default = "default_version", deserialize_with = "version_from_any")]
    pub version: String,
    /// Whether the game is live.
    #[serde(default)]
    pub published: bool,
    /// Asset family to show.
    #[serde(default)]
    pub published_type: PublishedType,
    /// Base poster.
    #[serde_as(as = "NoneAsEmptyString")]
    #[serde(default)]
    pub default_image: Option<String>,
    /// Base video.
    #[serde_as(as = "NoneAsEmptyString")]
    #[serde(default)]
    pub default_video: Option<String>,
    /// Current campaign poster.
    #[serde_as(as = "NoneAsEmptyString")]
    #[serde(default)]
    pub current_image: Option<String>,
    /// Current campaign video.
    #[serde_as(as = "NoneAsEmptyString")]
    #[serde(default)]
    pub current_video: Option<String>,
    /// Theme poster.
    #[serde_as(as = "NoneAsEmptyString")]
    #[serde(default)]
    pub theme_image: Option<String>,
    /// Theme video.
    #[serde_as(as = "NoneAsEmptyString")]
    #[serde(default)]
    pub theme_video: Option<String>,
    /// Promotion poster.
    #[serde_as(as = "NoneAsEmptyString")]
    #[serde(default)]
    pub promo_image: Option<String>,
    /// Promotion video.
    #[serde_as(as = "NoneAsEmptyString")]
    #[serde(default)]
    pub promo_video: Option<String>,
    /// Whether the card may play video at all.
    #[serde(default = "default_true")]
    pub animate: bool,
    /// Whether hovering the card starts playback.
    #[serde(default = "default_true")]
    pub hover: bool,
    /// Per-game analytics switch reported by the backend.
    #[serde(default = "default_true")]
    pub analytics: bool,
}

/// Image and video URL pair for one asset family.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetPair {
    /// Poster URL.
    pub image: Option<String>,
    /// Video URL.
    pub video: Option<String>,
}

impl AssetPair {
    /// Pair from its two URLs.
    pub fn new(image: Option<String>, video: Option<String>) -> Self {
        Self { image, video }
    }

    /// True when neither URL is set.
    pub fn is_empty(&self) -> bool {
        self.image.is_none() && self.video.is_none()
    }

    /// Fill each missing field from `fallback`.
    pub fn or(self, fallback: &AssetPair) -> AssetPair {
        AssetPair {
            image: self.image.or_else(|| fallback.image.clone()),
            video: self.video.or_else(|| fallback.video.clone()),
        }
    }
}

impl GameRecord {
    /// Base asset pair.
    pub fn default_pair(&self) -> AssetPair {
        AssetPair::new(self.default_image.clone(), self.default_video.clone())
    }

    /// Current campaign pair.
    pub fn current_pair(&self) -> AssetPair {
        AssetPair::new(self.current_image.clone(), self.current_video.clone())
    }

    /// Theme pair.
    pub fn theme_pair(&self) -> AssetPair {
        AssetPair::new(self.theme_image.clone(), self.theme_video.clone())
    }

    /// Promotion pair.
    pub fn promo_pair(&self) -> AssetPair {
        AssetPair::new(self.promo_image.clone(), self.promo_video.clone())
    }

    /// Minimal record used by tests and by hosts that synthesise data.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            cms_id: None,
            version: default_version(),
            published: false,
            published_type: PublishedType::Default,
            default_image: None,
            default_video: None,
            current_image: None,
            current_video: None,
            theme_image: None,
            theme_video: None,
            promo_image: None,
            promo_video: None,
            animate: true,
            hover: true,
            analytics: true,
        }
    }
}

fn default_version() -> String {
    "0".into()
}

fn default_true() -> bool {
    true
}

/// Versions arrive either as strings or as bare numbers depending on the backend build.
fn version_from_any<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawVersion {
        Text(String),
        Number(serde_json::Number),
        Missing(()),
    }

    Ok(match RawVersion::deserialize(deserializer)? {
        RawVersion::Text(text) if !text.is_empty() => text,
        RawVersion::Number(number) => number.to_string(),
        _ => default_version(),
    })
}
