//! One tokio task per feed. The task owns the feed's [`StreamConnection`];
//! loaders and the connect timer report back over a channel with the
//! generation they were started for, and renderers only read [`FeedTile`].

use crate::activity::SharedActivityLog;
use crate::capture::{self, DecodedFrame, EncodedImage, MediaElement, UndecodedVideo};
use crate::feeds::DisplayMode;
use crate::mjpeg::{BodyFormat, MjpegParser, body_format};
use crate::stream::{Attempt, ConnectionState, FailureReason, StreamConnection};
use crate::viewer::{CellGeometry, ascii_art};
use futures_util::StreamExt;
use image::imageops;
use parking_lot::RwLock;
use reqwest::header::CONTENT_TYPE;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

const COMMAND_QUEUE: usize = 32;
const EVENT_QUEUE: usize = 8;

#[derive(Debug, Clone)]
pub struct FeedTileSnapshot {
    pub label: String,
    pub url: String,
    pub mode: DisplayMode,
    pub state: ConnectionState,
    pub frame_ascii: String,
    pub frame_size: Option<(u32, u32)>,
    pub frames_received: u64,
    pub decode_errors: u64,
}

impl FeedTileSnapshot {
    fn new(label: String, url: String, mode: DisplayMode) -> Self {
        Self {
            label,
            url,
            mode,
            state: ConnectionState::Idle,
            frame_ascii: String::new(),
            frame_size: None,
            frames_received: 0,
            decode_errors: 0,
        }
    }
}

#[derive(Debug)]
pub struct FeedTile {
    inner: RwLock<FeedTileSnapshot>,
}

impl FeedTile {
    fn new(label: String, url: String, mode: DisplayMode) -> Self {
        Self {
            inner: RwLock::new(FeedTileSnapshot::new(label, url, mode)),
        }
    }

    fn set_connection(&self, url: &str, mode: DisplayMode, state: &ConnectionState) {
        let mut snapshot = self.inner.write();
        if snapshot.url != url || snapshot.mode != mode {
            url.clone_into(&mut snapshot.url);
            snapshot.mode = mode;
        }
        if !state.is_connected() {
            snapshot.frame_ascii.clear();
            snapshot.frame_size = None;
        }
        snapshot.state = state.clone();
    }

    fn set_frame(&self, frame_ascii: String, size: (u32, u32)) {
        let mut snapshot = self.inner.write();
        snapshot.frame_ascii = frame_ascii;
        snapshot.frame_size = Some(size);
        snapshot.frames_received = snapshot.frames_received.saturating_add(1);
    }

    fn inc_decode_error(&self) {
        let mut snapshot = self.inner.write();
        snapshot.decode_errors = snapshot.decode_errors.saturating_add(1);
    }

    pub fn snapshot(&self) -> FeedTileSnapshot {
        self.inner.read().clone()
    }
}

#[derive(Debug)]
pub enum FeedCommand {
    SetSource { url: String, mode: DisplayMode },
    Refresh,
    DismissError,
    Capture(oneshot::Sender<EncodedImage>),
}

#[derive(Debug)]
enum LoadEvent {
    Loaded { generation: u64 },
    Frame { generation: u64, frame: DecodedFrame },
    BadFrame { generation: u64 },
    Failed { generation: u64, reason: FailureReason },
    TimedOut { generation: u64 },
}

impl LoadEvent {
    fn generation(&self) -> u64 {
        match self {
            Self::Loaded { generation }
            | Self::Frame { generation, .. }
            | Self::BadFrame { generation }
            | Self::Failed { generation, .. }
            | Self::TimedOut { generation } => *generation,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FeedSpec {
    pub label: String,
    pub url: String,
    pub mode: DisplayMode,
    pub timeout: Duration,
}

/// Owner-side handle. Dropping it stops the driver together with its loader
/// and timer.
#[derive(Debug)]
pub struct FeedHandle {
    commands: mpsc::Sender<FeedCommand>,
    tile: Arc<FeedTile>,
    task: JoinHandle<()>,
}

impl FeedHandle {
    pub fn tile(&self) -> &Arc<FeedTile> {
        &self.tile
    }

    pub fn snapshot(&self) -> FeedTileSnapshot {
        self.tile.snapshot()
    }

    pub fn set_source(&self, url: impl Into<String>, mode: DisplayMode) {
        self.send(FeedCommand::SetSource {
            url: url.into(),
            mode,
        });
    }

    pub fn refresh(&self) {
        self.send(FeedCommand::Refresh);
    }

    pub fn dismiss_error(&self) {
        self.send(FeedCommand::DismissError);
    }

    /// Snapshot of the frame shown right now; empty when nothing is shown.
    pub async fn capture(&self) -> EncodedImage {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .commands
            .send(FeedCommand::Capture(reply_tx))
            .await
            .is_err()
        {
            return EncodedImage::empty();
        }
        reply_rx.await.unwrap_or_default()
    }

    fn send(&self, command: FeedCommand) {
        if let Err(err) = self.commands.try_send(command) {
            warn!("feed command dropped: {err}");
        }
    }
}

impl Drop for FeedHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

pub fn http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(30))
        .build()
        .unwrap_or_default()
}

pub fn spawn_feed(
    spec: FeedSpec,
    http: reqwest::Client,
    log: SharedActivityLog,
    geometry: watch::Receiver<CellGeometry>,
) -> FeedHandle {
    let tile = Arc::new(FeedTile::new(
        spec.label.clone(),
        spec.url.clone(),
        spec.mode,
    ));
    let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE);
    let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE);

    let driver = FeedDriver {
        label: spec.label,
        mode: spec.mode,
        connection: StreamConnection::new(spec.timeout),
        tile: Arc::clone(&tile),
        http,
        log,
        geometry,
        events: event_tx,
        latest_frame: None,
        loader: None,
        timer: None,
    };
    let task = tokio::spawn(run_driver(driver, spec.url, command_rx, event_rx));

    FeedHandle {
        commands: command_tx,
        tile,
        task,
    }
}

async fn run_driver(
    mut driver: FeedDriver,
    initial_url: String,
    mut commands: mpsc::Receiver<FeedCommand>,
    mut events: mpsc::Receiver<LoadEvent>,
) {
    let mode = driver.mode;
    driver.apply_source(initial_url, mode);

    loop {
        tokio::select! {
            command = commands.recv() => {
                let Some(command) = command else {
                    break;
                };
                driver.handle_command(command);
            }
            Some(event) = events.recv() => driver.handle_event(event),
        }
    }
}

struct FeedDriver {
    label: String,
    mode: DisplayMode,
    connection: StreamConnection,
    tile: Arc<FeedTile>,
    http: reqwest::Client,
    log: SharedActivityLog,
    geometry: watch::Receiver<CellGeometry>,
    events: mpsc::Sender<LoadEvent>,
    latest_frame: Option<DecodedFrame>,
    loader: Option<JoinHandle<()>>,
    timer: Option<JoinHandle<()>>,
}

impl FeedDriver {
    fn handle_command(&mut self, command: FeedCommand) {
        match command {
            FeedCommand::SetSource { url, mode } => self.apply_source(url, mode),
            FeedCommand::Refresh => self.refresh(),
            FeedCommand::DismissError => {
                if self.connection.dismiss_error() {
                    self.stop_tasks();
                    self.publish();
                }
            }
            FeedCommand::Capture(reply) => {
                let _ = reply.send(self.capture());
            }
        }
    }

    /// Picks the connection strategy for `mode`. Only the direct modes ever
    /// start a load.
    fn apply_source(&mut self, url: String, mode: DisplayMode) {
        self.stop_tasks();
        self.mode = mode;
        match mode {
            DisplayMode::Mjpeg | DisplayMode::Video => {
                let attempt = self.connection.set_source(&url, mode.source_kind());
                self.after_reset(attempt);
            }
            DisplayMode::Iframe => {
                self.connection.detach_source(&url, mode.source_kind());
                self.log
                    .info(format!("{} feed is an embed; open {url} in a browser", self.label));
                self.publish();
            }
            DisplayMode::Hls => {
                self.connection.reject_source(
                    &url,
                    mode.source_kind(),
                    FailureReason::UnsupportedMode(mode.as_str().to_owned()),
                );
                self.report_failure();
                self.publish();
            }
        }
    }

    fn refresh(&mut self) {
        match self.mode {
            DisplayMode::Mjpeg | DisplayMode::Video => {
                self.stop_tasks();
                let attempt = self.connection.refresh();
                self.after_reset(attempt);
            }
            DisplayMode::Iframe | DisplayMode::Hls => {
                let url = self
                    .connection
                    .source()
                    .map(|source| source.url.clone())
                    .unwrap_or_default();
                self.apply_source(url, self.mode);
            }
        }
    }

    fn after_reset(&mut self, attempt: Option<Attempt>) {
        match attempt {
            Some(attempt) => {
                debug!(feed = %self.label, url = %attempt.load_url, generation = attempt.generation, "connecting");
                self.start(attempt);
            }
            None => self.report_failure(),
        }
        self.publish();
    }

    fn start(&mut self, attempt: Attempt) {
        let generation = attempt.generation;
        let timeout = attempt.timeout;

        let timer_events = self.events.clone();
        self.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = timer_events.send(LoadEvent::TimedOut { generation }).await;
        }));

        let loader_events = self.events.clone();
        let http = self.http.clone();
        let mode = self.mode;
        self.loader = Some(tokio::spawn(async move {
            let result = match mode {
                DisplayMode::Video => probe_video(&http, &attempt, &loader_events).await,
                _ => stream_mjpeg(&http, &attempt, &loader_events).await,
            };
            if let Err(reason) = result {
                let _ = loader_events
                    .send(LoadEvent::Failed { generation, reason })
                    .await;
            }
        }));
    }

    fn handle_event(&mut self, event: LoadEvent) {
        if event.generation() != self.connection.generation() {
            return;
        }
        match event {
            LoadEvent::Loaded { generation } => {
                if self.connection.on_load_success(generation) {
                    abort(&mut self.timer);
                    self.log.success(format!("Connected to {} feed", self.label));
                    self.publish();
                }
            }
            LoadEvent::Frame { frame, .. } => {
                if !self.connection.state().is_connected() {
                    return;
                }
                let geometry = *self.geometry.borrow();
                let gray = imageops::grayscale(frame.image());
                let (width, height) = gray.dimensions();
                let ascii = ascii_art(&gray, geometry);
                self.tile.set_frame(ascii, (width, height));
                self.latest_frame = Some(frame);
            }
            LoadEvent::BadFrame { .. } => self.tile.inc_decode_error(),
            LoadEvent::Failed { generation, reason } => {
                if self.connection.on_load_error(generation, reason) {
                    self.stop_tasks();
                    self.report_failure();
                    self.publish();
                }
            }
            LoadEvent::TimedOut { generation } => {
                if self.connection.on_timeout_elapsed(generation) {
                    self.stop_tasks();
                    self.report_failure();
                    self.publish();
                }
            }
        }
    }

    fn capture(&self) -> EncodedImage {
        let video = UndecodedVideo;
        let element: Option<&dyn MediaElement> = match (&self.latest_frame, self.mode) {
            (Some(frame), _) => Some(frame),
            (None, DisplayMode::Video) => Some(&video),
            (None, _) => None,
        };
        let encoded = capture::capture(self.connection.state(), element);
        if encoded.is_empty() {
            self.log.warning(format!(
                "Could not capture {} frame: feed is {}",
                self.label,
                self.connection.state().label()
            ));
        }
        encoded
    }

    fn report_failure(&self) {
        if let Some(reason) = self.connection.state().failure() {
            self.log
                .error(format!("{} feed error: {reason}", self.label));
        }
    }

    fn publish(&mut self) {
        if !self.connection.state().is_connected() {
            self.latest_frame = None;
        }
        let url = self
            .connection
            .source()
            .map(|source| source.url.as_str())
            .unwrap_or_default();
        self.tile
            .set_connection(url, self.mode, self.connection.state());
    }

    fn stop_tasks(&mut self) {
        abort(&mut self.loader);
        abort(&mut self.timer);
    }
}

impl Drop for FeedDriver {
    fn drop(&mut self) {
        self.connection.unmount();
        self.stop_tasks();
    }
}

fn abort(task: &mut Option<JoinHandle<()>>) {
    if let Some(handle) = task.take() {
        handle.abort();
    }
}

async fn open(http: &reqwest::Client, attempt: &Attempt) -> Result<reqwest::Response, FailureReason> {
    let response = http
        .get(&attempt.load_url)
        .send()
        .await
        .map_err(|err| FailureReason::LoadFailed(err.to_string()))?;
    let status = response.status();
    if !status.is_success() {
        return Err(FailureReason::LoadFailed(format!("HTTP {status}")));
    }
    Ok(response)
}

fn content_type(response: &reqwest::Response) -> String {
    response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_owned()
}

/// Video sources are never decoded; a 2xx answer with a video or playlist
/// body is what counts as loaded. Captures of such a feed are blank stills.
async fn probe_video(
    http: &reqwest::Client,
    attempt: &Attempt,
    events: &mpsc::Sender<LoadEvent>,
) -> Result<(), FailureReason> {
    let generation = attempt.generation;
    let response = open(http, attempt).await?;
    let content_type = content_type(&response);
    match body_format(&content_type) {
        Ok(BodyFormat::Video) => {
            let _ = events.send(LoadEvent::Loaded { generation }).await;
            Ok(())
        }
        Ok(other) => Err(FailureReason::LoadFailed(format!(
            "expected a video stream, server sent {}",
            describe_format(&other, &content_type)
        ))),
        Err(err) => Err(FailureReason::LoadFailed(err.to_string())),
    }
}

async fn stream_mjpeg(
    http: &reqwest::Client,
    attempt: &Attempt,
    events: &mpsc::Sender<LoadEvent>,
) -> Result<(), FailureReason> {
    let generation = attempt.generation;
    let response = open(http, attempt).await?;
    let content_type = content_type(&response);

    let boundary = match body_format(&content_type) {
        Ok(BodyFormat::Multipart { boundary }) => boundary,
        Ok(BodyFormat::SingleJpeg) => {
            // A plain still renders like an image element would: loaded once.
            let bytes = response
                .bytes()
                .await
                .map_err(|err| FailureReason::LoadFailed(err.to_string()))?;
            let frame = DecodedFrame::decode(&bytes, 1)
                .map_err(|err| FailureReason::LoadFailed(format!("undecodable image: {err}")))?;
            let _ = events.send(LoadEvent::Loaded { generation }).await;
            let _ = events.send(LoadEvent::Frame { generation, frame }).await;
            return Ok(());
        }
        Ok(other) => {
            return Err(FailureReason::LoadFailed(format!(
                "expected an MJPEG stream, server sent {}",
                describe_format(&other, &content_type)
            )));
        }
        Err(err) => return Err(FailureReason::LoadFailed(err.to_string())),
    };

    let mut parser = MjpegParser::new(&boundary);
    let mut body = response.bytes_stream();
    let mut seq = 0_u64;
    let mut loaded = false;

    while let Some(chunk) = body.next().await {
        let chunk = chunk.map_err(|err| FailureReason::LoadFailed(err.to_string()))?;
        let parts = parser
            .push(&chunk)
            .map_err(|err| FailureReason::LoadFailed(err.to_string()))?;

        for part in parts {
            match DecodedFrame::decode(&part, seq) {
                Ok(frame) => {
                    seq = seq.wrapping_add(1);
                    if !loaded {
                        loaded = true;
                        let _ = events.send(LoadEvent::Loaded { generation }).await;
                    }
                    if events
                        .send(LoadEvent::Frame { generation, frame })
                        .await
                        .is_err()
                    {
                        return Ok(());
                    }
                }
                Err(err) => {
                    debug!(generation, "dropping undecodable MJPEG part: {err}");
                    let _ = events.send(LoadEvent::BadFrame { generation }).await;
                }
            }
        }
        if parser.is_closed() {
            break;
        }
    }

    Err(FailureReason::StreamEnded)
}

fn describe_format(format: &BodyFormat, content_type: &str) -> String {
    match format {
        BodyFormat::Multipart { .. } => "a multipart image stream".to_owned(),
        BodyFormat::SingleJpeg => "a single JPEG".to_owned(),
        BodyFormat::Video => "a video stream".to_owned(),
        BodyFormat::Other(_) if content_type.is_empty() => "no content type".to_owned(),
        BodyFormat::Other(mime) => format!("'{mime}'"),
    }
}
