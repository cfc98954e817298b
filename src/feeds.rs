use crate::storage::{self, KEY_CAMERA_CONFIG, KEY_FEEDS, SharedStore};
use crate::stream::SourceKind;
use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use tracing::{info, warn};
use url::form_urlencoded;

pub const DEFAULT_BASE_URL: &str = "http://192.168.183.250:5000";
pub const DEFAULT_DETECTION_SERVER: &str = "http://localhost:5002";
pub const DEFAULT_CONFIDENCE: u8 = 50;
pub const DETECTION_CLASSES: [&str; 7] = [
    "person",
    "car",
    "truck",
    "bicycle",
    "motorcycle",
    "dog",
    "cat",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FeedId {
    ObjectDetection,
    Thermal,
    Lidar,
    Custom,
    AiDetection,
}

impl FeedId {
    pub const ALL: [FeedId; 5] = [
        FeedId::ObjectDetection,
        FeedId::Thermal,
        FeedId::Lidar,
        FeedId::Custom,
        FeedId::AiDetection,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::ObjectDetection => "object-detection",
            Self::Thermal => "thermal",
            Self::Lidar => "lidar",
            Self::Custom => "custom",
            Self::AiDetection => "ai-detection",
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            Self::ObjectDetection => "Object Detection",
            Self::Thermal => "Thermal",
            Self::Lidar => "LIDAR",
            Self::Custom => "Custom",
            Self::AiDetection => "AI Detection",
        }
    }

    fn active_by_default(self) -> bool {
        matches!(self, Self::ObjectDetection | Self::Thermal | Self::Lidar)
    }
}

impl fmt::Display for FeedId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FeedId {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> Result<Self> {
        let wanted = raw.trim().to_ascii_lowercase().replace('_', "-");
        Self::ALL
            .into_iter()
            .find(|id| id.as_str() == wanted)
            .ok_or_else(|| {
                anyhow!(
                    "unknown feed '{raw}' (expected one of: {})",
                    Self::ALL.map(FeedId::as_str).join(", ")
                )
            })
    }
}

/// How a feed's URL is presented.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DisplayMode {
    /// Direct multipart image stream.
    #[default]
    Mjpeg,
    /// Direct video resource.
    Video,
    /// Web page meant to be embedded; opened externally.
    Iframe,
    /// HLS playlist.
    Hls,
}

impl DisplayMode {
    pub const ALL: [DisplayMode; 4] = [
        DisplayMode::Mjpeg,
        DisplayMode::Video,
        DisplayMode::Iframe,
        DisplayMode::Hls,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Mjpeg => "mjpeg",
            Self::Video => "video",
            Self::Iframe => "iframe",
            Self::Hls => "hls",
        }
    }

    pub fn source_kind(self) -> SourceKind {
        match self {
            Self::Mjpeg => SourceKind::ImageStream,
            Self::Video | Self::Iframe | Self::Hls => SourceKind::Video,
        }
    }

    #[must_use]
    pub fn next(self) -> Self {
        let idx = Self::ALL.iter().position(|mode| *mode == self).unwrap_or(0);
        Self::ALL[(idx + 1) % Self::ALL.len()]
    }
}

impl fmt::Display for DisplayMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DisplayMode {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> Result<Self> {
        let wanted = raw.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|mode| mode.as_str() == wanted)
            .ok_or_else(|| anyhow!("unknown display mode '{raw}' (expected mjpeg, video, iframe or hls)"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedConfig {
    pub url: String,
    pub active: bool,
    pub mode: DisplayMode,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CameraConfig {
    pub base_url: String,
    pub thermal_endpoint: String,
    pub object_detection_endpoint: String,
    pub lidar_endpoint: String,
    pub custom_endpoint: String,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_owned(),
            thermal_endpoint: "/thermal_feed".to_owned(),
            object_detection_endpoint: "/object_detection_feed".to_owned(),
            lidar_endpoint: "/lidar_feed".to_owned(),
            custom_endpoint: "/custom_feed".to_owned(),
        }
    }
}

impl CameraConfig {
    /// Default URL for a camera-server feed. The AI detection feed lives on
    /// its own server and has none here.
    pub fn feed_url(&self, id: FeedId) -> Option<String> {
        let endpoint = match id {
            FeedId::ObjectDetection => &self.object_detection_endpoint,
            FeedId::Thermal => &self.thermal_endpoint,
            FeedId::Lidar => &self.lidar_endpoint,
            FeedId::Custom => &self.custom_endpoint,
            FeedId::AiDetection => return None,
        };
        Some(format!("{}{}", self.base_url.trim_end_matches('/'), endpoint))
    }

    fn from_value(value: Option<&Value>) -> Self {
        let defaults = Self::default();
        let Some(obj) = value.and_then(Value::as_object) else {
            return defaults;
        };
        Self {
            base_url: str_field(obj, &["base_url", "baseUrl"]).unwrap_or(defaults.base_url),
            thermal_endpoint: str_field(obj, &["thermal_endpoint", "thermalEndpoint"])
                .unwrap_or(defaults.thermal_endpoint),
            object_detection_endpoint: str_field(
                obj,
                &["object_detection_endpoint", "objectDetectionEndpoint"],
            )
            .unwrap_or(defaults.object_detection_endpoint),
            lidar_endpoint: str_field(obj, &["lidar_endpoint", "lidarEndpoint"])
                .unwrap_or(defaults.lidar_endpoint),
            custom_endpoint: str_field(obj, &["custom_endpoint", "customEndpoint"])
                .unwrap_or(defaults.custom_endpoint),
        }
    }
}

/// Parameters of the AI detection server's annotated stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectionQuery {
    pub server_url: String,
    /// Percent, 0..=100.
    pub confidence: u8,
    pub classes: Vec<String>,
}

impl Default for DetectionQuery {
    fn default() -> Self {
        Self {
            server_url: DEFAULT_DETECTION_SERVER.to_owned(),
            confidence: DEFAULT_CONFIDENCE,
            classes: vec!["person".to_owned()],
        }
    }
}

impl DetectionQuery {
    /// Class names are form-encoded one by one so the commas between them
    /// stay list separators.
    pub fn feed_url(&self) -> String {
        let confidence = f64::from(self.confidence.min(100)) / 100.0;
        let classes = self
            .classes
            .iter()
            .map(|class| form_urlencoded::byte_serialize(class.as_bytes()).collect::<String>())
            .collect::<Vec<_>>()
            .join(",");
        format!(
            "{}/video_feed?confidence={confidence}&classes={classes}",
            self.server_url.trim_end_matches('/'),
        )
    }

    pub fn toggle_class(&mut self, class: &str) {
        if let Some(pos) = self.classes.iter().position(|c| c == class) {
            self.classes.remove(pos);
        } else {
            self.classes.push(class.to_owned());
        }
    }

    fn from_value(value: Option<&Value>) -> Self {
        let defaults = Self::default();
        let Some(obj) = value.and_then(Value::as_object) else {
            return defaults;
        };
        let confidence = obj
            .get("confidence")
            .and_then(Value::as_u64)
            .and_then(|c| u8::try_from(c).ok())
            .filter(|c| *c <= 100)
            .unwrap_or(defaults.confidence);
        let classes = obj
            .get("classes")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_owned)
                    .collect()
            })
            .unwrap_or(defaults.classes);
        Self {
            server_url: str_field(obj, &["server_url", "serverUrl"]).unwrap_or(defaults.server_url),
            confidence,
            classes,
        }
    }
}

/// Fields to change on one feed; `None` keeps the current value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeedUpdate {
    pub url: Option<String>,
    pub active: Option<bool>,
    pub mode: Option<DisplayMode>,
}

impl FeedUpdate {
    pub fn url(url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            ..Self::default()
        }
    }

    pub fn active(active: bool) -> Self {
        Self {
            active: Some(active),
            ..Self::default()
        }
    }

    pub fn mode(mode: DisplayMode) -> Self {
        Self {
            mode: Some(mode),
            ..Self::default()
        }
    }
}

#[derive(Serialize)]
struct FeedsDocument<'a> {
    feeds: &'a BTreeMap<FeedId, FeedConfig>,
    detection: &'a DetectionQuery,
}

/// Per-feed configuration, mirrored to the store on every change.
pub struct FeedRegistry {
    store: SharedStore,
    camera: CameraConfig,
    detection: DetectionQuery,
    feeds: BTreeMap<FeedId, FeedConfig>,
}

impl FeedRegistry {
    /// Never fails: unreadable entries and fields fall back to defaults.
    pub fn load(store: SharedStore) -> Self {
        let camera_value = read_value(&store, KEY_CAMERA_CONFIG);
        let feeds_value = read_value(&store, KEY_FEEDS);

        let camera = CameraConfig::from_value(camera_value.as_ref());
        let detection =
            DetectionQuery::from_value(feeds_value.as_ref().and_then(|v| v.get("detection")));
        let saved_feeds = feeds_value
            .as_ref()
            .and_then(|v| v.get("feeds"))
            .and_then(Value::as_object);

        let feeds = FeedId::ALL
            .into_iter()
            .map(|id| {
                let defaults = default_feed(id, &camera, &detection);
                let config = match saved_feeds.and_then(|feeds| feeds.get(id.as_str())) {
                    Some(Value::Object(saved)) => merge_saved(saved, defaults),
                    _ => defaults,
                };
                (id, config)
            })
            .collect();

        Self {
            store,
            camera,
            detection,
            feeds,
        }
    }

    pub fn get(&self, id: FeedId) -> &FeedConfig {
        // Every id is populated by `load`.
        &self.feeds[&id]
    }

    pub fn iter(&self) -> impl Iterator<Item = (FeedId, &FeedConfig)> {
        self.feeds.iter().map(|(id, config)| (*id, config))
    }

    pub fn active_feeds(&self) -> impl Iterator<Item = (FeedId, &FeedConfig)> {
        self.iter().filter(|(_, config)| config.active)
    }

    pub fn camera_config(&self) -> &CameraConfig {
        &self.camera
    }

    pub fn detection(&self) -> &DetectionQuery {
        &self.detection
    }

    /// Merges `update` into one feed and persists the whole registry.
    pub fn save(&mut self, id: FeedId, update: FeedUpdate) -> Result<FeedConfig> {
        let defaults = default_feed(id, &self.camera, &self.detection);
        let entry = self.feeds.entry(id).or_insert(defaults);
        if let Some(url) = update.url {
            entry.url = url.trim().to_owned();
        }
        if let Some(active) = update.active {
            entry.active = active;
        }
        if let Some(mode) = update.mode {
            entry.mode = mode;
        }
        let updated = entry.clone();
        self.persist_feeds()?;
        info!(feed = %id, url = %updated.url, active = updated.active, mode = %updated.mode, "feed configuration saved");
        Ok(updated)
    }

    /// Replaces the camera server layout. Feeds still pointing at the old
    /// derived URL follow the new one; hand-edited URLs are kept.
    pub fn set_camera_config(&mut self, camera: CameraConfig) -> Result<()> {
        for id in FeedId::ALL {
            let (Some(old), Some(new)) = (self.camera.feed_url(id), camera.feed_url(id)) else {
                continue;
            };
            if let Some(feed) = self.feeds.get_mut(&id)
                && feed.url == old
            {
                feed.url = new;
            }
        }
        self.camera = camera;
        storage::save(&*self.store, KEY_CAMERA_CONFIG, &self.camera)?;
        self.persist_feeds()?;
        info!(base_url = %self.camera.base_url, "camera feed configuration updated");
        Ok(())
    }

    /// Replaces the detection parameters and points the AI detection feed at
    /// the rebuilt query URL.
    pub fn set_detection(&mut self, detection: DetectionQuery) -> Result<()> {
        let url = detection.feed_url();
        self.detection = detection;
        if let Some(feed) = self.feeds.get_mut(&FeedId::AiDetection) {
            feed.url = url;
        }
        self.persist_feeds()
    }

    pub fn reset(&mut self) -> Result<()> {
        self.camera = CameraConfig::default();
        self.detection = DetectionQuery::default();
        self.feeds = FeedId::ALL
            .into_iter()
            .map(|id| (id, default_feed(id, &self.camera, &self.detection)))
            .collect();
        storage::save(&*self.store, KEY_CAMERA_CONFIG, &self.camera)?;
        self.persist_feeds()
    }

    fn persist_feeds(&self) -> Result<()> {
        let document = FeedsDocument {
            feeds: &self.feeds,
            detection: &self.detection,
        };
        storage::save(&*self.store, KEY_FEEDS, &document)
    }
}

fn default_feed(id: FeedId, camera: &CameraConfig, detection: &DetectionQuery) -> FeedConfig {
    FeedConfig {
        url: camera
            .feed_url(id)
            .unwrap_or_else(|| detection.feed_url()),
        active: id.active_by_default(),
        mode: DisplayMode::Mjpeg,
    }
}

fn merge_saved(saved: &Map<String, Value>, defaults: FeedConfig) -> FeedConfig {
    FeedConfig {
        url: saved
            .get("url")
            .and_then(Value::as_str)
            .map(str::to_owned)
            .unwrap_or(defaults.url),
        active: saved
            .get("active")
            .and_then(Value::as_bool)
            .unwrap_or(defaults.active),
        mode: saved
            .get("mode")
            .and_then(Value::as_str)
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(defaults.mode),
    }
}

fn read_value(store: &SharedStore, key: &str) -> Option<Value> {
    match storage::load_value(&**store, key) {
        Ok(value) => value,
        Err(err) => {
            warn!(key, "ignoring unreadable store entry: {err:#}");
            None
        }
    }
}

fn str_field(obj: &Map<String, Value>, names: &[&str]) -> Option<String> {
    names
        .iter()
        .find_map(|name| obj.get(*name).and_then(Value::as_str))
        .map(str::to_owned)
}

#[cfg(test)]
mod tests {
    use super::{
        CameraConfig, DetectionQuery, DisplayMode, FeedId, FeedRegistry, FeedUpdate,
    };
    use crate::storage::{KEY_CAMERA_CONFIG, KEY_FEEDS, MemoryStore, SharedStore, Store};
    use std::sync::Arc;

    fn store() -> SharedStore {
        Arc::new(MemoryStore::new())
    }

    #[test]
    fn defaults_derive_from_camera_server() {
        let registry = FeedRegistry::load(store());
        assert_eq!(
            registry.get(FeedId::Thermal).url,
            "http://192.168.183.250:5000/thermal_feed"
        );
        assert!(registry.get(FeedId::Lidar).active);
        assert!(!registry.get(FeedId::AiDetection).active);
        assert_eq!(
            registry.get(FeedId::AiDetection).url,
            "http://localhost:5002/video_feed?confidence=0.5&classes=person"
        );
        assert_eq!(registry.active_feeds().count(), 3);
    }

    #[test]
    fn partial_updates_merge_and_persist() {
        let store = store();
        let mut registry = FeedRegistry::load(store.clone());
        registry
            .save(FeedId::Custom, FeedUpdate::url(" http://cam.local/custom "))
            .unwrap();
        registry
            .save(FeedId::Custom, FeedUpdate::mode(DisplayMode::Video))
            .unwrap();

        let reloaded = FeedRegistry::load(store);
        let custom = reloaded.get(FeedId::Custom);
        assert_eq!(custom.url, "http://cam.local/custom");
        assert_eq!(custom.mode, DisplayMode::Video);
        assert!(!custom.active);
    }

    #[test]
    fn malformed_fields_fall_back_per_field() {
        let store = store();
        store
            .write(
                KEY_FEEDS,
                r#"{"feeds":{"thermal":{"url":42,"active":false,"mode":"betamax"},"lidar":"nope"}}"#,
            )
            .unwrap();
        store
            .write(KEY_CAMERA_CONFIG, r#"{"baseUrl":"http://10.0.0.2:5000","lidarEndpoint":7}"#)
            .unwrap();

        let registry = FeedRegistry::load(store);
        let thermal = registry.get(FeedId::Thermal);
        assert_eq!(thermal.url, "http://10.0.0.2:5000/thermal_feed");
        assert!(!thermal.active);
        assert_eq!(thermal.mode, DisplayMode::Mjpeg);
        assert_eq!(
            registry.get(FeedId::Lidar).url,
            "http://10.0.0.2:5000/lidar_feed"
        );
    }

    #[test]
    fn unparseable_entries_load_defaults() {
        let store = store();
        store.write(KEY_FEEDS, "{{{{").unwrap();
        let registry = FeedRegistry::load(store);
        assert_eq!(registry.get(FeedId::ObjectDetection).mode, DisplayMode::Mjpeg);
    }

    #[test]
    fn camera_config_change_moves_derived_urls_only() {
        let store = store();
        let mut registry = FeedRegistry::load(store.clone());
        registry
            .save(FeedId::Lidar, FeedUpdate::url("http://other/lidar"))
            .unwrap();
        registry
            .set_camera_config(CameraConfig {
                base_url: "http://10.1.1.1:8000/".to_owned(),
                ..CameraConfig::default()
            })
            .unwrap();

        let reloaded = FeedRegistry::load(store);
        assert_eq!(
            reloaded.get(FeedId::Thermal).url,
            "http://10.1.1.1:8000/thermal_feed"
        );
        assert_eq!(reloaded.get(FeedId::Lidar).url, "http://other/lidar");
        assert_eq!(reloaded.camera_config().base_url, "http://10.1.1.1:8000/");
    }

    #[test]
    fn detection_query_builds_server_url() {
        let mut query = DetectionQuery {
            server_url: "http://ai.local:5002/".to_owned(),
            confidence: 75,
            classes: vec!["person".to_owned()],
        };
        query.toggle_class("dog");
        assert_eq!(
            query.feed_url(),
            "http://ai.local:5002/video_feed?confidence=0.75&classes=person,dog"
        );
        query.toggle_class("person");
        query.confidence = 100;
        assert_eq!(
            query.feed_url(),
            "http://ai.local:5002/video_feed?confidence=1&classes=dog"
        );
    }

    #[test]
    fn detection_classes_are_escaped_in_the_query() {
        let query = DetectionQuery {
            server_url: "http://ai.local:5002".to_owned(),
            confidence: 50,
            classes: vec!["fire hydrant".to_owned(), "cats&dogs".to_owned()],
        };
        let url = query.feed_url();
        assert_eq!(
            url,
            "http://ai.local:5002/video_feed?confidence=0.5&classes=fire+hydrant,cats%26dogs"
        );
        let parsed = url::Url::parse(&url).unwrap();
        let pairs: Vec<(String, String)> = parsed.query_pairs().into_owned().collect();
        assert_eq!(
            pairs,
            vec![
                ("confidence".to_owned(), "0.5".to_owned()),
                ("classes".to_owned(), "fire hydrant,cats&dogs".to_owned()),
            ]
        );
    }

    #[test]
    fn reset_restores_defaults() {
        let store = store();
        let mut registry = FeedRegistry::load(store.clone());
        registry
            .save(FeedId::Thermal, FeedUpdate::active(false))
            .unwrap();
        registry.reset().unwrap();
        assert!(FeedRegistry::load(store).get(FeedId::Thermal).active);
    }

    #[test]
    fn ids_and_modes_parse_from_cli_text() {
        assert_eq!("AI_Detection".parse::<FeedId>().unwrap(), FeedId::AiDetection);
        assert!("sonar".parse::<FeedId>().is_err());
        assert_eq!("HLS".parse::<DisplayMode>().unwrap(), DisplayMode::Hls);
        assert_eq!(DisplayMode::Hls.next(), DisplayMode::Mjpeg);
    }
}
