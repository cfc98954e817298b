//! Connection lifecycle for a single live feed.
//!
//! [`StreamConnection`] is a synchronous state machine. It never performs
//! I/O: the owner feeds it load/error/timeout events and acts on the
//! [`Attempt`]s it hands out. Every attempt carries a generation number and
//! events for any other generation are dropped, so a timer armed for an old
//! source can never fail a newer one.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use url::Url;

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

const PLACEHOLDER_PREFIX: &str = "/placeholder";
const CACHE_BUST_PARAM: &str = "t";

pub const RTSP_GUIDANCE: &str = "RTSP cannot be consumed directly. Run a bridge next to the camera that reads the RTSP stream and re-serves it as MJPEG over HTTP (multipart/x-mixed-replace), then point this feed at the bridge's /video_feed URL.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourceKind {
    ImageStream,
    Video,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedSource {
    pub url: String,
    pub kind: SourceKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Error)]
pub enum FailureReason {
    #[error("Stream connection timed out. Please check the URL and try again.")]
    Timeout,
    #[error("Invalid feed URL: {0}")]
    InvalidUrl(String),
    #[error("RTSP stream detected. {}", RTSP_GUIDANCE)]
    RtspUnsupported,
    #[error(
        "Failed to connect to the stream ({0}). Please check the URL and ensure the stream server is running."
    )]
    LoadFailed(String),
    #[error("The stream ended unexpectedly.")]
    StreamEnded,
    #[error("{0} feeds cannot be played in the console. Switch the display mode to mjpeg or video.")]
    UnsupportedMode(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    Failed(FailureReason),
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    pub fn is_timed_out(&self) -> bool {
        matches!(self, Self::Failed(FailureReason::Timeout))
    }

    pub fn failure(&self) -> Option<&FailureReason> {
        match self {
            Self::Failed(reason) => Some(reason),
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Failed(FailureReason::Timeout) => "timed out",
            Self::Failed(FailureReason::RtspUnsupported) => "rtsp unsupported",
            Self::Failed(_) => "failed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Failed(reason) => write!(f, "failed: {reason}"),
            other => f.write_str(other.label()),
        }
    }
}

/// Outcome of checking a raw URL before it is handed to a loader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceCheck {
    Placeholder,
    Loadable(Url),
    Rtsp,
    Invalid(String),
}

pub fn classify_source(raw: &str) -> SourceCheck {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.starts_with(PLACEHOLDER_PREFIX) {
        return SourceCheck::Placeholder;
    }

    let lower = trimmed.to_ascii_lowercase();
    if lower.starts_with("rtsp://") || lower.starts_with("rtsps://") {
        return SourceCheck::Rtsp;
    }

    match Url::parse(trimmed) {
        Ok(url) if matches!(url.scheme(), "http" | "https") => SourceCheck::Loadable(url),
        Ok(url) => SourceCheck::Invalid(format!("unsupported scheme '{}'", url.scheme())),
        Err(err) => SourceCheck::Invalid(err.to_string()),
    }
}

/// Appends (or replaces) the `t=<stamp>` query parameter so intermediaries
/// cannot hand back a cached response.
pub fn cache_busted_url(url: &Url, stamp: u64) -> String {
    let retained = url
        .query_pairs()
        .filter(|(key, _)| key != CACHE_BUST_PARAM)
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect::<Vec<_>>();

    let mut busted = url.clone();
    {
        let mut pairs = busted.query_pairs_mut();
        pairs.clear();
        for (key, value) in &retained {
            pairs.append_pair(key, value);
        }
        pairs.append_pair(CACHE_BUST_PARAM, &stamp.to_string());
    }
    busted.to_string()
}

/// A single connect attempt handed to the loader. `timeout` is the window
/// after which the owner must report [`StreamConnection::on_timeout_elapsed`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attempt {
    pub generation: u64,
    pub source: FeedSource,
    pub load_url: String,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct StreamConnection {
    source: Option<FeedSource>,
    state: ConnectionState,
    generation: u64,
    timeout: Duration,
    timer_armed: bool,
    attempt: Option<Attempt>,
}

impl Default for StreamConnection {
    fn default() -> Self {
        Self::new(DEFAULT_CONNECT_TIMEOUT)
    }
}

impl StreamConnection {
    pub fn new(timeout: Duration) -> Self {
        Self {
            source: None,
            state: ConnectionState::Idle,
            generation: 0,
            timeout,
            timer_armed: false,
            attempt: None,
        }
    }

    /// Builds a connection the way a freshly mounted feed starts: connecting
    /// when a real URL is present, idle for an empty or placeholder one.
    pub fn mount(url: &str, kind: SourceKind, timeout: Duration) -> (Self, Option<Attempt>) {
        let mut connection = Self::new(timeout);
        let attempt = connection.set_source(url, kind);
        (connection, attempt)
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    pub fn source(&self) -> Option<&FeedSource> {
        self.source.as_ref()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_timer_armed(&self) -> bool {
        self.timer_armed
    }

    pub fn current_attempt(&self) -> Option<&Attempt> {
        self.attempt.as_ref()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn set_source(&mut self, url: &str, kind: SourceKind) -> Option<Attempt> {
        self.source = Some(FeedSource {
            url: url.trim().to_owned(),
            kind,
        });

        match classify_source(url) {
            SourceCheck::Placeholder => {
                self.reset(ConnectionState::Idle);
                None
            }
            SourceCheck::Rtsp => {
                self.reset(ConnectionState::Failed(FailureReason::RtspUnsupported));
                None
            }
            SourceCheck::Invalid(detail) => {
                self.reset(ConnectionState::Failed(FailureReason::InvalidUrl(detail)));
                None
            }
            SourceCheck::Loadable(parsed) => Some(self.begin_attempt(parsed.to_string())),
        }
    }

    /// Records a source that will not be loaded, e.g. one shown in an
    /// external viewer. Any in-flight attempt is invalidated.
    pub fn detach_source(&mut self, url: &str, kind: SourceKind) {
        self.source = Some(FeedSource {
            url: url.trim().to_owned(),
            kind,
        });
        self.reset(ConnectionState::Idle);
    }

    /// Like [`Self::detach_source`] but lands in `Failed(reason)` so the user
    /// sees why the feed cannot play.
    pub fn reject_source(&mut self, url: &str, kind: SourceKind, reason: FailureReason) {
        self.source = Some(FeedSource {
            url: url.trim().to_owned(),
            kind,
        });
        self.reset(ConnectionState::Failed(reason));
    }

    pub fn on_load_success(&mut self, generation: u64) -> bool {
        if generation != self.generation || self.state != ConnectionState::Connecting {
            return false;
        }
        self.timer_armed = false;
        self.state = ConnectionState::Connected;
        true
    }

    pub fn on_load_error(&mut self, generation: u64, reason: FailureReason) -> bool {
        if generation != self.generation
            || !matches!(
                self.state,
                ConnectionState::Connecting | ConnectionState::Connected
            )
        {
            return false;
        }
        self.timer_armed = false;
        self.attempt = None;
        self.state = ConnectionState::Failed(reason);
        true
    }

    pub fn on_timeout_elapsed(&mut self, generation: u64) -> bool {
        if generation != self.generation
            || !self.timer_armed
            || self.state != ConnectionState::Connecting
        {
            return false;
        }
        self.timer_armed = false;
        self.attempt = None;
        self.state = ConnectionState::Failed(FailureReason::Timeout);
        true
    }

    pub fn refresh(&mut self) -> Option<Attempt> {
        self.refresh_at(now_millis())
    }

    /// Re-enters `Connecting` with a cache-busted load URL. Sources that are
    /// not loadable are re-classified and land in the same state as before.
    pub fn refresh_at(&mut self, stamp: u64) -> Option<Attempt> {
        let source = self.source.clone()?;
        match classify_source(&source.url) {
            SourceCheck::Loadable(parsed) => {
                Some(self.begin_attempt(cache_busted_url(&parsed, stamp)))
            }
            _ => self.set_source(&source.url, source.kind),
        }
    }

    pub fn dismiss_error(&mut self) -> bool {
        if !matches!(self.state, ConnectionState::Failed(_)) {
            return false;
        }
        self.reset(ConnectionState::Idle);
        true
    }

    /// Invalidates everything in flight. Called when the owning view goes away.
    pub fn unmount(&mut self) {
        self.reset(ConnectionState::Idle);
    }

    fn begin_attempt(&mut self, load_url: String) -> Attempt {
        self.generation = self.generation.wrapping_add(1);
        self.timer_armed = true;
        self.state = ConnectionState::Connecting;

        let attempt = Attempt {
            generation: self.generation,
            source: self
                .source
                .clone()
                .unwrap_or_else(|| FeedSource {
                    url: load_url.clone(),
                    kind: SourceKind::ImageStream,
                }),
            load_url,
            timeout: self.timeout,
        };
        self.attempt = Some(attempt.clone());
        attempt
    }

    fn reset(&mut self, state: ConnectionState) {
        self.generation = self.generation.wrapping_add(1);
        self.timer_armed = false;
        self.attempt = None;
        self.state = state;
    }
}

pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::{
        ConnectionState, FailureReason, SourceCheck, SourceKind, StreamConnection,
        cache_busted_url, classify_source,
    };
    use std::time::Duration;
    use url::Url;

    fn connection() -> StreamConnection {
        StreamConnection::new(Duration::from_secs(10))
    }

    #[test]
    fn malformed_urls_fail_with_a_reason() {
        for raw in ["not a url", "http://", "://missing-scheme", "http://exa mple.com/feed"] {
            let mut conn = connection();
            assert!(conn.set_source(raw, SourceKind::ImageStream).is_none());
            let reason = conn
                .state()
                .failure()
                .unwrap_or_else(|| panic!("{raw} should fail"));
            assert!(!reason.to_string().is_empty());
            assert!(!conn.state().is_connected());
        }
    }

    #[test]
    fn stays_connecting_without_events() {
        let mut conn = connection();
        let attempt = conn
            .set_source("http://192.168.183.250:5000/thermal_feed", SourceKind::ImageStream)
            .unwrap();
        assert_eq!(conn.state(), &ConnectionState::Connecting);
        assert!(conn.is_timer_armed());
        assert_eq!(attempt.timeout, Duration::from_secs(10));
        assert_eq!(conn.state(), &ConnectionState::Connecting);
    }

    #[test]
    fn load_success_connects_and_disarms_timer() {
        let mut conn = connection();
        let attempt = conn
            .set_source("http://cam.local/feed", SourceKind::ImageStream)
            .unwrap();
        assert!(conn.on_load_success(attempt.generation));
        assert!(conn.state().is_connected());
        assert!(!conn.is_timer_armed());
        assert!(!conn.on_timeout_elapsed(attempt.generation));
        assert!(conn.state().is_connected());
    }

    #[test]
    fn unmount_discards_every_pending_event() {
        let mut conn = connection();
        let attempt = conn
            .set_source("http://cam.local/feed", SourceKind::ImageStream)
            .unwrap();
        conn.unmount();
        assert_eq!(conn.state(), &ConnectionState::Idle);
        assert!(!conn.is_timer_armed());
        assert!(conn.current_attempt().is_none());

        assert!(!conn.on_timeout_elapsed(attempt.generation));
        assert!(!conn.on_load_success(attempt.generation));
        assert!(!conn.on_load_error(attempt.generation, FailureReason::StreamEnded));
        assert_eq!(conn.state(), &ConnectionState::Idle);
    }

    #[test]
    fn timeout_while_connecting_fails_with_timeout() {
        let mut conn = connection();
        let attempt = conn
            .set_source("http://cam.local/feed", SourceKind::ImageStream)
            .unwrap();
        assert!(conn.on_timeout_elapsed(attempt.generation));
        assert!(conn.state().is_timed_out());
        assert_eq!(
            conn.state(),
            &ConnectionState::Failed(FailureReason::Timeout)
        );
    }

    #[test]
    fn source_change_invalidates_previous_timer() {
        let mut conn = connection();
        let first = conn
            .set_source("http://cam.local/a", SourceKind::ImageStream)
            .unwrap();
        let second = conn
            .set_source("http://cam.local/b", SourceKind::ImageStream)
            .unwrap();
        assert_ne!(first.generation, second.generation);

        assert!(conn.on_load_success(second.generation));
        assert!(!conn.on_timeout_elapsed(first.generation));
        assert!(!conn.on_load_error(first.generation, FailureReason::StreamEnded));
        assert!(conn.state().is_connected());
    }

    #[test]
    fn stale_timer_cannot_fail_a_pending_newer_attempt() {
        let mut conn = connection();
        let first = conn
            .set_source("http://cam.local/a", SourceKind::ImageStream)
            .unwrap();
        let _second = conn
            .set_source("http://cam.local/b", SourceKind::ImageStream)
            .unwrap();
        assert!(!conn.on_timeout_elapsed(first.generation));
        assert_eq!(conn.state(), &ConnectionState::Connecting);
    }

    #[test]
    fn connected_feed_fails_when_stream_drops() {
        let mut conn = connection();
        let attempt = conn
            .set_source("http://cam.local/feed", SourceKind::ImageStream)
            .unwrap();
        conn.on_load_success(attempt.generation);
        assert!(conn.on_load_error(attempt.generation, FailureReason::StreamEnded));
        assert_eq!(
            conn.state(),
            &ConnectionState::Failed(FailureReason::StreamEnded)
        );
    }

    #[test]
    fn refresh_reconnects_with_cache_buster() {
        let mut conn = connection();
        let first = conn
            .set_source("http://cam.local/feed?classes=person", SourceKind::ImageStream)
            .unwrap();
        conn.on_load_error(first.generation, FailureReason::LoadFailed("404".to_owned()));

        let retry = conn.refresh_at(1_700_000_000_000).unwrap();
        assert_eq!(conn.state(), &ConnectionState::Connecting);
        assert!(conn.is_timer_armed());
        assert!(retry.generation > first.generation);
        assert_eq!(
            retry.load_url,
            "http://cam.local/feed?classes=person&t=1700000000000"
        );
        assert_eq!(retry.source.url, "http://cam.local/feed?classes=person");
    }

    #[test]
    fn dismiss_clears_failure_without_reconnecting() {
        let mut conn = connection();
        let attempt = conn
            .set_source("http://cam.local/feed", SourceKind::ImageStream)
            .unwrap();
        assert!(!conn.dismiss_error());
        conn.on_timeout_elapsed(attempt.generation);
        assert!(conn.dismiss_error());
        assert_eq!(conn.state(), &ConnectionState::Idle);
        assert!(conn.current_attempt().is_none());
        assert!(!conn.on_load_success(attempt.generation));
    }

    #[test]
    fn mount_is_idle_for_placeholder_urls() {
        let (conn, attempt) =
            StreamConnection::mount("", SourceKind::ImageStream, Duration::from_secs(10));
        assert!(attempt.is_none());
        assert_eq!(conn.state(), &ConnectionState::Idle);

        let (conn, attempt) = StreamConnection::mount(
            "/placeholder.svg?height=480&width=640",
            SourceKind::ImageStream,
            Duration::from_secs(10),
        );
        assert!(attempt.is_none());
        assert_eq!(conn.state(), &ConnectionState::Idle);

        let (conn, attempt) = StreamConnection::mount(
            "http://localhost:5002/video_feed",
            SourceKind::ImageStream,
            Duration::from_secs(10),
        );
        assert!(attempt.is_some());
        assert_eq!(conn.state(), &ConnectionState::Connecting);
    }

    #[test]
    fn rtsp_source_is_never_loaded() {
        let mut conn = connection();
        let attempt = conn.set_source("rtsp://10.8.0.249:8080/h264.sdp", SourceKind::ImageStream);
        assert!(attempt.is_none());
        assert!(conn.current_attempt().is_none());
        assert_eq!(
            conn.state(),
            &ConnectionState::Failed(FailureReason::RtspUnsupported)
        );
        assert!(conn.state().to_string().contains("MJPEG"));

        assert!(conn.refresh_at(1).is_none());
        assert!(conn.current_attempt().is_none());
    }

    #[test]
    fn classify_recognizes_each_source_shape() {
        assert_eq!(classify_source("  "), SourceCheck::Placeholder);
        assert_eq!(classify_source("RTSP://cam/stream1"), SourceCheck::Rtsp);
        assert!(matches!(
            classify_source("ftp://cam/stream"),
            SourceCheck::Invalid(_)
        ));
        assert!(matches!(
            classify_source("https://cam/stream"),
            SourceCheck::Loadable(_)
        ));
    }

    #[test]
    fn cache_buster_replaces_previous_stamp() {
        let url = Url::parse("http://cam.local/feed?t=1&x=2").unwrap();
        assert_eq!(cache_busted_url(&url, 9), "http://cam.local/feed?x=2&t=9");
    }
}
