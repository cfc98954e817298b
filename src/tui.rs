#![allow(clippy::too_many_lines, clippy::uninlined_format_args)]

#[path = "tui_helpers.rs"]
mod helpers;

use self::helpers::{
    Form, FormField, FormOutcome, format_age, frame_preview, gauge_bar, truncate_middle,
    weather_glyph,
};
use crate::activity::SharedActivityLog;
use crate::app::AppContext;
use crate::contacts::{ContactBook, ContactPatch, NewContact};
use crate::feeds::{DETECTION_CLASSES, DisplayMode, FeedId, FeedRegistry, FeedUpdate};
use crate::gallery::{Gallery, write_frame};
use crate::live::{FeedHandle, FeedSpec, http_client, spawn_feed};
use crate::notify::{DEFAULT_SOS_MESSAGE, Notifier, SmsError, SosReport};
use crate::settings::{RobotSettings, SettingKey};
use crate::storage::SharedStore;
use crate::theme::{self, ThemePalette};
use crate::viewer::{
    CellGeometry, FullscreenTerminal, build_grid_rects, compute_grid_dimensions, enter_fullscreen,
    leave_fullscreen, publish_geometry, tile_body,
};
use crate::weather::{PRESET_LOCATIONS, WeatherClient, WeatherReport, WeatherSource};
use anyhow::{Context, Result, anyhow, bail};
use chrono::Utc;
use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use ratatui::layout::{Constraint, Direction, Layout, Rect};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span};
use ratatui::widgets::{Block, Borders, Clear, Paragraph, Wrap};
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::warn;

const UI_IDLE_SLEEP: Duration = Duration::from_millis(33);
const PREVIEW_WIDTH: u16 = 56;
const PREVIEW_HEIGHT: u16 = 20;
const CONFIDENCE_STEP: u8 = 5;

const GLYPH_ACTIVE: &str = "▸";
const GLYPH_CHECKED: &str = "◉";
const GLYPH_UNCHECKED: &str = "○";
const GLYPH_BULLET: &str = "•";

static THEME: OnceLock<ThemePalette> = OnceLock::new();

pub async fn run_tui(ctx: &AppContext) -> Result<()> {
    let loaded_theme = match theme::load_or_create_theme(&*ctx.store) {
        Ok(palette) => palette,
        Err(err) => {
            warn!("failed to load theme ({err:#}), using defaults");
            ThemePalette::default()
        }
    };
    let _ = THEME.set(loaded_theme);

    let mut terminal = enter_fullscreen()?;
    let mut app = App::load(ctx);
    app.sync_live_feeds();
    app.log.info("Rescue console started");

    let run_result = run_loop(&mut terminal, &mut app).await;
    app.live.clear();
    let restore_result = leave_fullscreen(&mut terminal);

    run_result?;
    restore_result?;
    Ok(())
}

async fn run_loop(terminal: &mut FullscreenTerminal, app: &mut App) -> Result<()> {
    let mut running = true;

    while running {
        app.poll_background().await;

        terminal
            .draw(|frame| app.draw(frame))
            .context("failed drawing TUI frame")?;

        while event::poll(Duration::ZERO).context("failed to poll input")? {
            match event::read().context("failed reading input")? {
                Event::Key(key) => {
                    if key.kind != KeyEventKind::Press {
                        continue;
                    }
                    match app.handle_key(key) {
                        AppCommand::None => {}
                        AppCommand::Capture => app.capture_selected().await,
                        AppCommand::Quit => {
                            running = false;
                            break;
                        }
                    }
                }
                Event::Resize(_, _) => {
                    terminal.autoresize().context("failed resizing terminal")?;
                }
                _ => {}
            }
        }

        if running {
            tokio::time::sleep(UI_IDLE_SLEEP).await;
        }
    }

    Ok(())
}

fn active_theme() -> &'static ThemePalette {
    THEME.get_or_init(ThemePalette::default)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Screen {
    Live,
    Feeds,
    Gallery,
    Emergency,
    Weather,
    Logs,
    Settings,
}

impl Screen {
    const ALL: [Screen; 7] = [
        Screen::Live,
        Screen::Feeds,
        Screen::Gallery,
        Screen::Emergency,
        Screen::Weather,
        Screen::Logs,
        Screen::Settings,
    ];

    fn title(self) -> &'static str {
        match self {
            Self::Live => "Live",
            Self::Feeds => "Feeds",
            Self::Gallery => "Gallery",
            Self::Emergency => "Emergency",
            Self::Weather => "Weather",
            Self::Logs => "Logs",
            Self::Settings => "Settings",
        }
    }

    fn step(self, delta: isize) -> Self {
        let len = Self::ALL.len() as isize;
        let idx = Self::ALL.iter().position(|s| *s == self).unwrap_or(0) as isize;
        Self::ALL[(idx + delta).rem_euclid(len) as usize]
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum FormPurpose {
    FeedUrl(FeedId),
    CameraServer,
    DetectionServer,
    AddContact,
    EditContact(String),
    Sms,
    SettingText(SettingKey),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Confirm {
    Sos,
    DeleteContact(String),
    ClearGallery,
    ClearLogs,
    ResetFeeds,
    ResetSettings,
}

impl Confirm {
    fn prompt(&self) -> String {
        match self {
            Self::Sos => "Send EMERGENCY SOS to every contact?".to_owned(),
            Self::DeleteContact(name) => format!("Delete emergency contact {name}?"),
            Self::ClearGallery => "Delete every captured frame?".to_owned(),
            Self::ClearLogs => "Clear the activity log?".to_owned(),
            Self::ResetFeeds => "Restore default feed and camera configuration?".to_owned(),
            Self::ResetSettings => "Restore default robot settings?".to_owned(),
        }
    }
}

#[derive(Debug)]
enum AppCommand {
    None,
    Capture,
    Quit,
}

/// Rows of the feeds screen after the five feeds.
const ROW_CAMERA_SERVER: usize = FeedId::ALL.len();
const ROW_DETECTION_SERVER: usize = FeedId::ALL.len() + 1;
const FEED_ROWS: usize = FeedId::ALL.len() + 2;

struct LiveFeed {
    id: FeedId,
    url: String,
    mode: DisplayMode,
    handle: FeedHandle,
}

struct App {
    screen: Screen,
    status: String,
    store: SharedStore,
    log: SharedActivityLog,
    downloads_dir: PathBuf,
    connect_timeout: Duration,
    registry: FeedRegistry,
    gallery: Gallery,
    contacts: ContactBook,
    settings: RobotSettings,
    notifier: Notifier,
    weather_client: WeatherClient,
    http: reqwest::Client,
    live: Vec<LiveFeed>,
    geometry_tx: watch::Sender<CellGeometry>,
    selected_tile: usize,
    feeds_cursor: usize,
    gallery_cursor: usize,
    gallery_preview: Option<(String, String)>,
    contact_cursor: usize,
    weather_cursor: usize,
    settings_cursor: usize,
    log_scroll: usize,
    weather: Option<WeatherReport>,
    pending_weather: Option<JoinHandle<WeatherReport>>,
    pending_sos: Option<JoinHandle<Result<SosReport, SmsError>>>,
    pending_sms: Option<JoinHandle<Result<(), SmsError>>>,
    last_sos: Option<SosReport>,
    form: Option<Form<FormPurpose>>,
    confirm: Option<Confirm>,
}

impl App {
    fn load(ctx: &AppContext) -> Self {
        let (geometry_tx, _) = watch::channel(CellGeometry::default());
        Self {
            screen: Screen::Live,
            status: String::new(),
            store: Arc::clone(&ctx.store),
            log: Arc::clone(&ctx.log),
            downloads_dir: ctx.downloads_dir(),
            connect_timeout: ctx.config.connect_timeout(),
            registry: FeedRegistry::load(Arc::clone(&ctx.store)),
            gallery: Gallery::load(Arc::clone(&ctx.store)),
            contacts: ContactBook::load(Arc::clone(&ctx.store)),
            settings: RobotSettings::load(&*ctx.store),
            notifier: ctx.notifier(),
            weather_client: ctx.weather_client(),
            http: http_client(),
            live: Vec::new(),
            geometry_tx,
            selected_tile: 0,
            feeds_cursor: 0,
            gallery_cursor: 0,
            gallery_preview: None,
            contact_cursor: 0,
            weather_cursor: 0,
            settings_cursor: 0,
            log_scroll: 0,
            weather: None,
            pending_weather: None,
            pending_sos: None,
            pending_sms: None,
            last_sos: None,
            form: None,
            confirm: None,
        }
    }

    /// Brings running feed drivers in line with the registry: new active
    /// feeds are spawned, edited ones get the new source, inactive ones stop.
    fn sync_live_feeds(&mut self) {
        let desired: Vec<(FeedId, String, DisplayMode)> = self
            .registry
            .active_feeds()
            .map(|(id, feed)| (id, feed.url.clone(), feed.mode))
            .collect();

        let mut previous = std::mem::take(&mut self.live);
        for (id, url, mode) in desired {
            if let Some(pos) = previous.iter().position(|live| live.id == id) {
                let mut live = previous.swap_remove(pos);
                if live.url != url || live.mode != mode {
                    live.handle.set_source(url.clone(), mode);
                    live.url = url;
                    live.mode = mode;
                }
                self.live.push(live);
            } else {
                let handle = spawn_feed(
                    FeedSpec {
                        label: id.display_name().to_owned(),
                        url: url.clone(),
                        mode,
                        timeout: self.connect_timeout,
                    },
                    self.http.clone(),
                    Arc::clone(&self.log),
                    self.geometry_tx.subscribe(),
                );
                self.live.push(LiveFeed {
                    id,
                    url,
                    mode,
                    handle,
                });
            }
        }
        self.selected_tile = self.selected_tile.min(self.live.len().saturating_sub(1));
    }

    async fn poll_background(&mut self) {
        if self
            .pending_weather
            .as_ref()
            .is_some_and(JoinHandle::is_finished)
            && let Some(handle) = self.pending_weather.take()
        {
            match handle.await {
                Ok(report) => {
                    self.status = match report.source {
                        WeatherSource::Live => "Weather updated.".to_owned(),
                        WeatherSource::Fallback => format!("Weather: {}", report.description),
                    };
                    self.weather = Some(report);
                }
                Err(err) => self.status = format!("weather task failed: {err}"),
            }
        }

        if self
            .pending_sos
            .as_ref()
            .is_some_and(JoinHandle::is_finished)
            && let Some(handle) = self.pending_sos.take()
        {
            match handle.await {
                Ok(Ok(report)) => {
                    self.status = report.summary();
                    self.last_sos = Some(report);
                }
                Ok(Err(err)) => self.status = format!("SOS failed: {err}"),
                Err(err) => self.status = format!("SOS task failed: {err}"),
            }
        }

        if self
            .pending_sms
            .as_ref()
            .is_some_and(JoinHandle::is_finished)
            && let Some(handle) = self.pending_sms.take()
        {
            self.status = match handle.await {
                Ok(Ok(())) => "SMS sent.".to_owned(),
                Ok(Err(err)) => format!("SMS failed: {err}"),
                Err(err) => format!("SMS task failed: {err}"),
            };
        }
    }

    fn draw(&self, frame: &mut ratatui::Frame<'_>) {
        let layout = Layout::default()
            .direction(Direction::Vertical)
            .constraints([
                Constraint::Length(3),
                Constraint::Min(8),
                Constraint::Length(3),
            ])
            .split(frame.area());

        self.draw_tabs(frame, layout[0]);
        match self.screen {
            Screen::Live => self.draw_live(frame, layout[1]),
            Screen::Feeds => self.draw_feeds(frame, layout[1]),
            Screen::Gallery => self.draw_gallery(frame, layout[1]),
            Screen::Emergency => self.draw_emergency(frame, layout[1]),
            Screen::Weather => self.draw_weather(frame, layout[1]),
            Screen::Logs => self.draw_logs(frame, layout[1]),
            Screen::Settings => self.draw_settings(frame, layout[1]),
        }
        self.draw_footer(frame, layout[2]);

        if let Some(form) = &self.form {
            draw_form(frame, form);
        } else if let Some(confirm) = &self.confirm {
            draw_confirm(frame, confirm);
        }
    }

    fn draw_tabs(&self, frame: &mut ratatui::Frame<'_>, area: Rect) {
        let mut spans = Vec::new();
        for (idx, screen) in Screen::ALL.into_iter().enumerate() {
            if idx > 0 {
                spans.push(Span::styled(" │ ", Style::default().fg(color_border())));
            }
            let style = if screen == self.screen {
                Style::default()
                    .fg(color_accent())
                    .add_modifier(Modifier::BOLD | Modifier::UNDERLINED)
            } else {
                Style::default().fg(color_muted())
            };
            spans.push(Span::styled(screen.title(), style));
        }
        spans.push(Span::styled("    ", Style::default()));
        spans.push(Span::styled(
            " SOS: Ctrl+E ",
            Style::default()
                .fg(Color::White)
                .bg(color_emergency())
                .add_modifier(Modifier::BOLD),
        ));
        let tabs = Paragraph::new(Line::from(spans)).block(panel_block("◆", "Rescue Console", false));
        frame.render_widget(tabs, area);
    }

    fn draw_footer(&self, frame: &mut ratatui::Frame<'_>, area: Rect) {
        let hints: &[(&'static str, &'static str)] = match self.screen {
            Screen::Live => &[
                ("←/→", "Select"),
                ("r", "Refresh"),
                ("c", "Capture"),
                ("d", "Dismiss"),
                ("Tab", "Screens"),
                ("q", "Quit"),
            ],
            Screen::Feeds => &[
                ("↑/↓", "Select"),
                ("Enter", "Edit URL"),
                ("Space", "Active"),
                ("m", "Mode"),
                ("+/-", "Confidence"),
                ("1-7", "Classes"),
                ("R", "Reset"),
            ],
            Screen::Gallery => &[
                ("↑/↓", "Select"),
                ("s", "Save to disk"),
                ("x", "Delete"),
                ("C", "Clear all"),
            ],
            Screen::Emergency => &[
                ("a", "Add"),
                ("e", "Edit"),
                ("x", "Delete"),
                ("m", "SMS"),
                ("s", "Send SOS"),
            ],
            Screen::Weather => &[("↑/↓", "Location"), ("Enter", "Fetch")],
            Screen::Logs => &[("↑/↓", "Scroll"), ("e", "Export"), ("C", "Clear")],
            Screen::Settings => &[
                ("↑/↓", "Select"),
                ("←/→", "Adjust"),
                ("Enter", "Edit/Toggle"),
                ("R", "Reset"),
            ],
        };
        let mut spans = action_hint_spans(hints);
        if !self.status.is_empty() {
            spans.push(Span::styled("   ", Style::default()));
            spans.push(Span::styled(
                self.status.clone(),
                status_message_style(&self.status).add_modifier(Modifier::BOLD),
            ));
        }
        let footer = Paragraph::new(Line::from(spans))
            .style(Style::default().fg(color_text()))
            .block(panel_block("⌘", "Actions", false));
        frame.render_widget(footer, area);
    }

    fn draw_live(&self, frame: &mut ratatui::Frame<'_>, area: Rect) {
        if self.live.is_empty() {
            let body = vec![
                Line::from(vec![
                    Span::styled(
                        format!("{GLYPH_ACTIVE} "),
                        Style::default()
                            .fg(color_accent())
                            .add_modifier(Modifier::BOLD),
                    ),
                    Span::styled(
                        "No active feeds.",
                        Style::default()
                            .fg(color_text())
                            .add_modifier(Modifier::BOLD),
                    ),
                ]),
                Line::from(Span::styled(
                    "Activate feeds on the Feeds screen; they appear here automatically.",
                    Style::default().fg(color_muted()),
                )),
            ];
            let panel = Paragraph::new(body)
                .block(panel_block("◉", "Live Feeds", false))
                .wrap(Wrap { trim: false });
            frame.render_widget(panel, area);
            return;
        }

        let (rows, cols) = compute_grid_dimensions(self.live.len(), 0, 0);
        let grid_rects = build_grid_rects(area, rows, cols);
        if let Some(first) = grid_rects.first() {
            publish_geometry(&self.geometry_tx, CellGeometry::of_tile(*first));
        }

        for (idx, (live, rect)) in self.live.iter().zip(grid_rects).enumerate() {
            let snapshot = live.handle.snapshot();
            let state_color = active_theme().for_state(&snapshot.state);
            let selected = idx == self.selected_tile;
            let title = Line::from(vec![
                Span::styled(
                    format!(" {GLYPH_BULLET}{} ", idx + 1),
                    Style::default()
                        .fg(color_accent())
                        .add_modifier(Modifier::BOLD),
                ),
                Span::styled(
                    snapshot.label.clone(),
                    Style::default()
                        .fg(color_text())
                        .add_modifier(Modifier::BOLD),
                ),
                Span::styled(
                    format!("  {} ", snapshot.state.label()),
                    Style::default().fg(state_color),
                ),
                Span::styled(
                    format!("[{}] ", snapshot.mode),
                    Style::default().fg(color_muted()),
                ),
            ]);
            let border = if selected {
                color_border_active()
            } else {
                state_color
            };
            let body_style = if snapshot.frame_ascii.is_empty() {
                Style::default().fg(state_color)
            } else {
                Style::default().fg(color_text())
            };
            let tile = Paragraph::new(tile_body(&snapshot))
                .style(body_style)
                .wrap(Wrap { trim: false })
                .block(
                    Block::default()
                        .title(title)
                        .borders(Borders::ALL)
                        .border_style(Style::default().fg(border)),
                );
            frame.render_widget(tile, rect);
        }
    }

    fn draw_feeds(&self, frame: &mut ratatui::Frame<'_>, area: Rect) {
        let columns = Layout::default()
            .direction(Direction::Horizontal)
            .constraints([Constraint::Percentage(62), Constraint::Percentage(38)])
            .split(area);

        let url_width = usize::from(columns[0].width.saturating_sub(40)).max(16);
        let mut lines = Vec::new();
        for (row, (id, feed)) in self.registry.iter().enumerate() {
            let focused = row == self.feeds_cursor;
            let live_state = self
                .live
                .iter()
                .find(|live| live.id == id)
                .map(|live| live.handle.snapshot().state);
            let (state_label, state_color) = match &live_state {
                Some(state) => (state.label(), active_theme().for_state(state)),
                None => ("off", color_muted()),
            };
            lines.push(Line::from(vec![
                Span::styled(
                    format!("{} ", focus_marker(focused)),
                    Style::default().fg(color_accent()),
                ),
                Span::styled(
                    format!("{} ", checkbox(feed.active)),
                    Style::default().fg(if feed.active {
                        color_success()
                    } else {
                        color_muted()
                    }),
                ),
                Span::styled(
                    format!("{:<17}", id.display_name()),
                    Style::default()
                        .fg(color_text())
                        .add_modifier(if focused { Modifier::BOLD } else { Modifier::empty() }),
                ),
                Span::styled(format!("{:<7}", feed.mode.as_str()), Style::default().fg(color_accent())),
                Span::styled(format!("{:<11}", state_label), Style::default().fg(state_color)),
                Span::styled(
                    truncate_middle(&feed.url, url_width),
                    Style::default().fg(color_muted()),
                ),
            ]));
        }
        lines.push(Line::default());
        let camera = self.registry.camera_config();
        let detection = self.registry.detection();
        for (row, label, value) in [
            (ROW_CAMERA_SERVER, "Camera server", camera.base_url.as_str()),
            (
                ROW_DETECTION_SERVER,
                "Detection server",
                detection.server_url.as_str(),
            ),
        ] {
            let focused = row == self.feeds_cursor;
            lines.push(Line::from(vec![
                Span::styled(
                    format!("{}   ", focus_marker(focused)),
                    Style::default().fg(color_accent()),
                ),
                Span::styled(format!("{label:<17}"), Style::default().fg(color_text())),
                Span::styled(value.to_owned(), Style::default().fg(color_muted())),
            ]));
        }

        let list = Paragraph::new(lines)
            .block(panel_block("◎", "Feed Configuration", true))
            .wrap(Wrap { trim: false });
        frame.render_widget(list, columns[0]);

        let mut side = vec![
            Line::from(vec![
                Span::styled("Confidence ", Style::default().fg(color_muted())),
                Span::styled(
                    format!("{:>3}% ", detection.confidence),
                    Style::default()
                        .fg(color_text())
                        .add_modifier(Modifier::BOLD),
                ),
                Span::styled(
                    gauge_bar(detection.confidence, 100, 20),
                    Style::default().fg(color_accent()),
                ),
            ]),
            Line::default(),
        ];
        for (idx, class) in DETECTION_CLASSES.iter().enumerate() {
            let enabled = detection.classes.iter().any(|c| c == class);
            side.push(Line::from(vec![
                Span::styled(format!("{} ", idx + 1), Style::default().fg(color_accent())),
                Span::styled(
                    format!("{} ", checkbox(enabled)),
                    Style::default().fg(if enabled {
                        color_success()
                    } else {
                        color_muted()
                    }),
                ),
                Span::styled((*class).to_owned(), Style::default().fg(color_text())),
            ]));
        }
        side.push(Line::default());
        side.push(Line::from(Span::styled(
            detection.feed_url(),
            Style::default().fg(color_muted()),
        )));
        if let Some(id) = FeedId::ALL.get(self.feeds_cursor)
            && self.registry.get(*id).url.starts_with("rtsp")
        {
            side.push(Line::default());
            side.push(Line::from(Span::styled(
                crate::stream::RTSP_GUIDANCE,
                Style::default().fg(color_warning()),
            )));
        }
        let panel = Paragraph::new(side)
            .block(panel_block("◌", "AI Detection", false))
            .wrap(Wrap { trim: false });
        frame.render_widget(panel, columns[1]);
    }

    fn draw_gallery(&self, frame: &mut ratatui::Frame<'_>, area: Rect) {
        let columns = Layout::default()
            .direction(Direction::Horizontal)
            .constraints([Constraint::Percentage(40), Constraint::Percentage(60)])
            .split(area);

        let now = Utc::now();
        let mut lines = Vec::new();
        if self.gallery.is_empty() {
            lines.push(Line::from(Span::styled(
                "No captured frames yet. Press c on the Live screen.",
                Style::default().fg(color_muted()),
            )));
        }
        for (idx, shot) in self.gallery.frames().iter().enumerate().rev() {
            let focused = idx == self.gallery_cursor;
            lines.push(Line::from(vec![
                Span::styled(
                    format!("{} ", focus_marker(focused)),
                    Style::default().fg(color_accent()),
                ),
                Span::styled(
                    format!("{:<18}", shot.source_name),
                    Style::default().fg(color_text()),
                ),
                Span::styled(
                    format_age(shot.captured_at, now),
                    Style::default().fg(color_muted()),
                ),
            ]));
        }
        let title = format!("Captured Frames ({})", self.gallery.len());
        let list = Paragraph::new(lines).block(panel_block("▣", &title, true));
        frame.render_widget(list, columns[0]);

        let selected = self.gallery.frames().get(self.gallery_cursor);
        let preview = match (selected, &self.gallery_preview) {
            (Some(shot), Some((id, ascii))) if *id == shot.id => ascii.clone(),
            (Some(_), _) => "decoding…".to_owned(),
            (None, _) => String::new(),
        };
        let preview_title = selected
            .map(|shot| shot.download_file_name())
            .unwrap_or_else(|| "Preview".to_owned());
        let panel = Paragraph::new(preview)
            .style(Style::default().fg(color_text()))
            .block(panel_block("◫", &preview_title, false));
        frame.render_widget(panel, columns[1]);
    }

    fn draw_emergency(&self, frame: &mut ratatui::Frame<'_>, area: Rect) {
        let columns = Layout::default()
            .direction(Direction::Horizontal)
            .constraints([Constraint::Percentage(55), Constraint::Percentage(45)])
            .split(area);

        let mut lines = Vec::new();
        if self.contacts.is_empty() {
            lines.push(Line::from(Span::styled(
                "No emergency contacts. Press a to add one.",
                Style::default().fg(color_warning()),
            )));
        }
        for (idx, contact) in self.contacts.contacts().iter().enumerate() {
            let focused = idx == self.contact_cursor;
            lines.push(Line::from(vec![
                Span::styled(
                    format!("{} ", focus_marker(focused)),
                    Style::default().fg(color_accent()),
                ),
                Span::styled(
                    format!("{:<20}", contact.name),
                    Style::default()
                        .fg(color_text())
                        .add_modifier(Modifier::BOLD),
                ),
                Span::styled(format!("{:<18}", contact.phone), Style::default().fg(color_accent())),
                Span::styled(
                    contact.relationship.clone().unwrap_or_default(),
                    Style::default().fg(color_muted()),
                ),
            ]));
        }
        let list = Paragraph::new(lines).block(panel_block("☎", "Emergency Contacts", true));
        frame.render_widget(list, columns[0]);

        let mut side = vec![
            Line::from(Span::styled(
                if self.pending_sos.is_some() {
                    "Sending SOS…"
                } else {
                    "Press s (or Ctrl+E anywhere) to broadcast:"
                },
                Style::default()
                    .fg(color_emergency())
                    .add_modifier(Modifier::BOLD),
            )),
            Line::from(Span::styled(
                DEFAULT_SOS_MESSAGE,
                Style::default().fg(color_text()),
            )),
            Line::default(),
            Line::from(vec![
                Span::styled("gateway ", Style::default().fg(color_muted())),
                Span::styled(self.notifier.gateway_name(), Style::default().fg(color_accent())),
            ]),
        ];
        if self.pending_sms.is_some() {
            side.push(Line::from(Span::styled(
                "Sending SMS…",
                Style::default().fg(color_warning()),
            )));
        }
        if let Some(report) = &self.last_sos {
            side.push(Line::default());
            side.push(Line::from(Span::styled(
                report.summary(),
                Style::default().fg(color_success()),
            )));
            for delivery in &report.deliveries {
                let (mark, color, detail) = match &delivery.outcome {
                    Ok(()) => ("✓", color_success(), String::new()),
                    Err(err) => ("✗", color_error(), format!(" ({err})")),
                };
                side.push(Line::from(vec![
                    Span::styled(format!("{mark} "), Style::default().fg(color)),
                    Span::styled(
                        format!("{} {}{detail}", delivery.contact_name, delivery.phone),
                        Style::default().fg(color_text()),
                    ),
                ]));
            }
        }
        let panel = Paragraph::new(side)
            .block(panel_block("!", "Emergency SOS", false))
            .wrap(Wrap { trim: false });
        frame.render_widget(panel, columns[1]);
    }

    fn draw_weather(&self, frame: &mut ratatui::Frame<'_>, area: Rect) {
        let columns = Layout::default()
            .direction(Direction::Horizontal)
            .constraints([Constraint::Length(28), Constraint::Min(20)])
            .split(area);

        let lines: Vec<Line<'_>> = PRESET_LOCATIONS
            .iter()
            .enumerate()
            .map(|(idx, location)| {
                let focused = idx == self.weather_cursor;
                Line::from(vec![
                    Span::styled(
                        format!("{} ", focus_marker(focused)),
                        Style::default().fg(color_accent()),
                    ),
                    Span::styled(location.name, Style::default().fg(color_text())),
                ])
            })
            .collect();
        frame.render_widget(
            Paragraph::new(lines).block(panel_block("⌖", "Location", true)),
            columns[0],
        );

        let location = PRESET_LOCATIONS[self.weather_cursor.min(PRESET_LOCATIONS.len() - 1)];
        let mut body = vec![Line::from(Span::styled(
            format!("{}  ({:.4}, {:.4})", location.name, location.lat, location.lon),
            Style::default().fg(color_muted()),
        ))];
        match (&self.weather, self.pending_weather.is_some()) {
            (_, true) => body.push(Line::from(Span::styled(
                "Fetching weather…",
                Style::default().fg(color_accent()),
            ))),
            (Some(report), false) => {
                body.push(Line::default());
                body.push(Line::from(vec![
                    Span::styled(
                        format!("{}  ", weather_glyph(&report.icon)),
                        Style::default().fg(color_accent()),
                    ),
                    Span::styled(
                        format!("{:.1} °C", report.temperature),
                        Style::default()
                            .fg(color_text())
                            .add_modifier(Modifier::BOLD),
                    ),
                    Span::styled(
                        format!("  {}", report.description),
                        Style::default().fg(color_text()),
                    ),
                ]));
                body.push(Line::from(vec![
                    Span::styled("humidity ", Style::default().fg(color_muted())),
                    Span::styled(
                        format!("{:>3}% {}", report.humidity, gauge_bar(report.humidity, 100, 20)),
                        Style::default().fg(color_accent()),
                    ),
                ]));
                body.push(Line::from(vec![
                    Span::styled("wind     ", Style::default().fg(color_muted())),
                    Span::styled(
                        format!("{:.1} m/s", report.wind_speed),
                        Style::default().fg(color_text()),
                    ),
                ]));
                if report.source == WeatherSource::Fallback {
                    body.push(Line::default());
                    body.push(Line::from(Span::styled(
                        "Simulated values. Configure weather_api_key in config.json or set OPENWEATHER_API_KEY.",
                        Style::default().fg(color_warning()),
                    )));
                }
            }
            (None, false) => body.push(Line::from(Span::styled(
                "Press Enter to fetch current conditions.",
                Style::default().fg(color_muted()),
            ))),
        }
        frame.render_widget(
            Paragraph::new(body)
                .block(panel_block("☁", "Weather Conditions", false))
                .wrap(Wrap { trim: false }),
            columns[1],
        );
    }

    fn draw_logs(&self, frame: &mut ratatui::Frame<'_>, area: Rect) {
        let entries = self.log.entries();
        let lines: Vec<Line<'_>> = entries
            .iter()
            .rev()
            .skip(self.log_scroll)
            .map(|entry| {
                Line::from(vec![
                    Span::styled(
                        entry.timestamp.format("%H:%M:%S ").to_string(),
                        Style::default().fg(color_muted()),
                    ),
                    Span::styled(
                        format!("{:<8}", entry.level.as_str().to_uppercase()),
                        Style::default()
                            .fg(active_theme().for_level(entry.level))
                            .add_modifier(Modifier::BOLD),
                    ),
                    Span::styled(entry.message.clone(), Style::default().fg(color_text())),
                ])
            })
            .collect();
        let title = format!("Activity Log ({})", entries.len());
        frame.render_widget(
            Paragraph::new(lines)
                .block(panel_block("≡", &title, true))
                .wrap(Wrap { trim: false }),
            area,
        );
    }

    fn draw_settings(&self, frame: &mut ratatui::Frame<'_>, area: Rect) {
        let lines: Vec<Line<'_>> = SettingKey::ALL
            .into_iter()
            .enumerate()
            .map(|(idx, key)| {
                let focused = idx == self.settings_cursor;
                let value = self.settings.value(key);
                let value_span = match key {
                    SettingKey::MovementSpeed => format!(
                        "{value:>5} {}",
                        gauge_bar(self.settings.movement_speed, 100, 20)
                    ),
                    SettingKey::SensorSensitivity => format!(
                        "{value:>5} {}",
                        gauge_bar(self.settings.sensor_sensitivity, 100, 20)
                    ),
                    SettingKey::LowBatteryThreshold => format!(
                        "{value:>5} {}",
                        gauge_bar(self.settings.low_battery_threshold, 50, 20)
                    ),
                    _ => value,
                };
                Line::from(vec![
                    Span::styled(
                        format!("{} ", focus_marker(focused)),
                        Style::default().fg(color_accent()),
                    ),
                    Span::styled(
                        format!("{:<28}", key.label()),
                        Style::default()
                            .fg(color_text())
                            .add_modifier(if focused { Modifier::BOLD } else { Modifier::empty() }),
                    ),
                    Span::styled(value_span, Style::default().fg(color_accent())),
                ])
            })
            .collect();
        frame.render_widget(
            Paragraph::new(lines).block(panel_block("⚙", "Robot Settings", true)),
            area,
        );
    }

    fn handle_key(&mut self, key: KeyEvent) -> AppCommand {
        if key.modifiers.contains(KeyModifiers::CONTROL) && matches!(key.code, KeyCode::Char('q')) {
            return AppCommand::Quit;
        }

        if let Some(mut form) = self.form.take() {
            match form.handle_key(key) {
                FormOutcome::Editing => self.form = Some(form),
                FormOutcome::Cancelled => {}
                FormOutcome::Submitted => match self.submit_form(&form) {
                    Ok(message) => self.status = message,
                    Err(err) => {
                        form.error = Some(format!("{err:#}"));
                        self.form = Some(form);
                    }
                },
            }
            return AppCommand::None;
        }

        if let Some(confirm) = self.confirm.take() {
            if matches!(key.code, KeyCode::Char('y' | 'Y') | KeyCode::Enter) {
                self.apply_confirm(confirm);
            } else {
                self.status = "Cancelled.".to_owned();
            }
            return AppCommand::None;
        }

        if key.modifiers.contains(KeyModifiers::CONTROL) && matches!(key.code, KeyCode::Char('e')) {
            self.confirm = Some(Confirm::Sos);
            return AppCommand::None;
        }

        match key.code {
            KeyCode::Char('q') | KeyCode::Esc => return AppCommand::Quit,
            KeyCode::Tab => {
                self.switch_screen(self.screen.step(1));
                return AppCommand::None;
            }
            KeyCode::BackTab => {
                self.switch_screen(self.screen.step(-1));
                return AppCommand::None;
            }
            _ => {}
        }

        let result = match self.screen {
            Screen::Live => return self.handle_live_key(key),
            Screen::Feeds => self.handle_feeds_key(key),
            Screen::Gallery => self.handle_gallery_key(key),
            Screen::Emergency => {
                self.handle_emergency_key(key);
                Ok(())
            }
            Screen::Weather => {
                self.handle_weather_key(key);
                Ok(())
            }
            Screen::Logs => self.handle_logs_key(key),
            Screen::Settings => self.handle_settings_key(key),
        };
        if let Err(err) = result {
            self.status = format!("{err:#}");
            self.log.error(format!("{err:#}"));
        }
        AppCommand::None
    }

    fn switch_screen(&mut self, screen: Screen) {
        self.screen = screen;
        match screen {
            Screen::Gallery => self.update_gallery_preview(),
            Screen::Weather if self.weather.is_none() && self.pending_weather.is_none() => {
                self.fetch_weather();
            }
            _ => {}
        }
    }

    fn handle_live_key(&mut self, key: KeyEvent) -> AppCommand {
        let count = self.live.len();
        match key.code {
            KeyCode::Right | KeyCode::Down if count > 0 => {
                self.selected_tile = (self.selected_tile + 1) % count;
            }
            KeyCode::Left | KeyCode::Up if count > 0 => {
                self.selected_tile = (self.selected_tile + count - 1) % count;
            }
            KeyCode::Char(digit @ '1'..='9') => {
                let idx = usize::from(digit as u8 - b'1');
                if idx < count {
                    self.selected_tile = idx;
                }
            }
            KeyCode::Char('r') => {
                if let Some(live) = self.live.get(self.selected_tile) {
                    live.handle.refresh();
                    self.status = format!("Refreshing {}…", live.id.display_name());
                }
            }
            KeyCode::Char('d') => {
                if let Some(live) = self.live.get(self.selected_tile) {
                    live.handle.dismiss_error();
                }
            }
            KeyCode::Char('c') => return AppCommand::Capture,
            _ => {}
        }
        AppCommand::None
    }

    async fn capture_selected(&mut self) {
        let Some(live) = self.live.get(self.selected_tile) else {
            return;
        };
        let name = live.id.display_name();
        let image = live.handle.capture().await;
        if image.is_empty() {
            self.status = format!("{name} has no frame to capture.");
            return;
        }
        match self.gallery.add(name, &image) {
            Ok(Some(frame)) => {
                self.gallery_cursor = self.gallery.len().saturating_sub(1);
                match write_frame(&frame, &self.downloads_dir) {
                    Ok(path) => {
                        self.log
                            .success(format!("Saved {name} camera frame to {}", path.display()));
                        self.status = format!("Captured {name} frame.");
                    }
                    Err(err) => {
                        self.log.error(format!("Frame kept in gallery, download failed: {err:#}"));
                        self.status = "Captured to gallery; download failed.".to_owned();
                    }
                }
            }
            Ok(None) => {}
            Err(err) => {
                self.log.error(format!("Failed to save {name} frame: {err:#}"));
                self.status = "Failed to save frame.".to_owned();
            }
        }
    }

    fn handle_feeds_key(&mut self, key: KeyEvent) -> Result<()> {
        let current = FeedId::ALL.get(self.feeds_cursor).copied();
        match key.code {
            KeyCode::Up => self.feeds_cursor = self.feeds_cursor.saturating_sub(1),
            KeyCode::Down => self.feeds_cursor = (self.feeds_cursor + 1).min(FEED_ROWS - 1),
            KeyCode::Enter => {
                self.form = Some(match (current, self.feeds_cursor) {
                    (Some(id), _) => Form::new(
                        format!("{} feed URL", id.display_name()),
                        FormPurpose::FeedUrl(id),
                        vec![FormField::new("URL", self.registry.get(id).url.clone()).required()],
                    ),
                    (None, ROW_CAMERA_SERVER) => Form::new(
                        "Camera server",
                        FormPurpose::CameraServer,
                        vec![
                            FormField::new(
                                "Base URL",
                                self.registry.camera_config().base_url.clone(),
                            )
                            .required(),
                        ],
                    ),
                    (None, _) => Form::new(
                        "AI detection server",
                        FormPurpose::DetectionServer,
                        vec![
                            FormField::new(
                                "Server URL",
                                self.registry.detection().server_url.clone(),
                            )
                            .required(),
                        ],
                    ),
                });
            }
            KeyCode::Char(' ') => {
                if let Some(id) = current {
                    let active = !self.registry.get(id).active;
                    self.registry.save(id, FeedUpdate::active(active))?;
                    self.sync_live_feeds();
                    self.status = format!(
                        "{} feed {}.",
                        id.display_name(),
                        if active { "activated" } else { "deactivated" }
                    );
                }
            }
            KeyCode::Char('m') => {
                if let Some(id) = current {
                    let mode = self.registry.get(id).mode.next();
                    self.registry.save(id, FeedUpdate::mode(mode))?;
                    self.sync_live_feeds();
                    self.status = format!("{} feed displays as {mode}.", id.display_name());
                }
            }
            KeyCode::Char('+' | '=') => self.step_confidence(true)?,
            KeyCode::Char('-') => self.step_confidence(false)?,
            KeyCode::Char(digit @ '1'..='7') => {
                let idx = usize::from(digit as u8 - b'1');
                if let Some(class) = DETECTION_CLASSES.get(idx) {
                    let mut detection = self.registry.detection().clone();
                    detection.toggle_class(class);
                    self.registry.set_detection(detection)?;
                    self.sync_live_feeds();
                }
            }
            KeyCode::Char('R') => self.confirm = Some(Confirm::ResetFeeds),
            _ => {}
        }
        Ok(())
    }

    fn step_confidence(&mut self, up: bool) -> Result<()> {
        let mut detection = self.registry.detection().clone();
        detection.confidence = if up {
            detection.confidence.saturating_add(CONFIDENCE_STEP).min(100)
        } else {
            detection.confidence.saturating_sub(CONFIDENCE_STEP)
        };
        self.registry.set_detection(detection)?;
        self.sync_live_feeds();
        Ok(())
    }

    fn handle_gallery_key(&mut self, key: KeyEvent) -> Result<()> {
        // The list is drawn newest first.
        match key.code {
            KeyCode::Up => {
                if self.gallery_cursor + 1 < self.gallery.len() {
                    self.gallery_cursor += 1;
                }
            }
            KeyCode::Down => self.gallery_cursor = self.gallery_cursor.saturating_sub(1),
            KeyCode::Char('s') | KeyCode::Enter => {
                if let Some(shot) = self.gallery.frames().get(self.gallery_cursor) {
                    let path = write_frame(shot, &self.downloads_dir)?;
                    self.status = format!("Saved {}", path.display());
                }
            }
            KeyCode::Char('x') | KeyCode::Delete => {
                if let Some(id) = self
                    .gallery
                    .frames()
                    .get(self.gallery_cursor)
                    .map(|shot| shot.id.clone())
                    && self.gallery.delete(&id)?
                {
                    self.gallery_cursor = self
                        .gallery_cursor
                        .min(self.gallery.len().saturating_sub(1));
                    self.status = "Frame deleted.".to_owned();
                }
            }
            KeyCode::Char('C') if !self.gallery.is_empty() => {
                self.confirm = Some(Confirm::ClearGallery);
            }
            _ => {}
        }
        self.update_gallery_preview();
        Ok(())
    }

    fn update_gallery_preview(&mut self) {
        let Some(shot) = self.gallery.frames().get(self.gallery_cursor) else {
            self.gallery_preview = None;
            return;
        };
        if self
            .gallery_preview
            .as_ref()
            .is_some_and(|(id, _)| *id == shot.id)
        {
            return;
        }
        let ascii = frame_preview(shot, PREVIEW_WIDTH, PREVIEW_HEIGHT)
            .unwrap_or_else(|| "unreadable image data".to_owned());
        self.gallery_preview = Some((shot.id.clone(), ascii));
    }

    fn handle_emergency_key(&mut self, key: KeyEvent) {
        let selected = self.contacts.contacts().get(self.contact_cursor).cloned();
        match key.code {
            KeyCode::Up => self.contact_cursor = self.contact_cursor.saturating_sub(1),
            KeyCode::Down => {
                if self.contact_cursor + 1 < self.contacts.contacts().len() {
                    self.contact_cursor += 1;
                }
            }
            KeyCode::Char('a') => {
                self.form = Some(Form::new(
                    "New emergency contact",
                    FormPurpose::AddContact,
                    vec![
                        FormField::new("Name", "").required(),
                        FormField::new("Phone", "").required(),
                        FormField::new("Relationship", ""),
                    ],
                ));
            }
            KeyCode::Char('e') | KeyCode::Enter => {
                if let Some(contact) = selected {
                    self.form = Some(Form::new(
                        format!("Edit {}", contact.name),
                        FormPurpose::EditContact(contact.id),
                        vec![
                            FormField::new("Name", contact.name).required(),
                            FormField::new("Phone", contact.phone).required(),
                            FormField::new("Relationship", contact.relationship.unwrap_or_default()),
                        ],
                    ));
                }
            }
            KeyCode::Char('x') | KeyCode::Delete => {
                if let Some(contact) = selected {
                    self.confirm = Some(Confirm::DeleteContact(contact.id));
                }
            }
            KeyCode::Char('m') => {
                let phone = selected.map(|contact| contact.phone).unwrap_or_default();
                self.form = Some(Form::new(
                    "Send SMS",
                    FormPurpose::Sms,
                    vec![
                        FormField::new("Phone", phone).required(),
                        FormField::new("Message", "").required(),
                    ],
                ));
            }
            KeyCode::Char('s') => self.confirm = Some(Confirm::Sos),
            _ => {}
        }
    }

    fn handle_weather_key(&mut self, key: KeyEvent) {
        match key.code {
            KeyCode::Up => self.weather_cursor = self.weather_cursor.saturating_sub(1),
            KeyCode::Down => {
                self.weather_cursor = (self.weather_cursor + 1).min(PRESET_LOCATIONS.len() - 1);
            }
            KeyCode::Enter | KeyCode::Char('r') => self.fetch_weather(),
            _ => {}
        }
    }

    fn fetch_weather(&mut self) {
        if let Some(previous) = self.pending_weather.take() {
            previous.abort();
        }
        let client = self.weather_client.clone();
        let location = PRESET_LOCATIONS[self.weather_cursor.min(PRESET_LOCATIONS.len() - 1)];
        self.weather = None;
        self.pending_weather = Some(tokio::spawn(async move {
            client.fetch(location.lat, location.lon).await
        }));
    }

    fn handle_logs_key(&mut self, key: KeyEvent) -> Result<()> {
        match key.code {
            KeyCode::Up => self.log_scroll = self.log_scroll.saturating_sub(1),
            KeyCode::Down => {
                if self.log_scroll + 1 < self.log.len() {
                    self.log_scroll += 1;
                }
            }
            KeyCode::Char('e') => {
                let path = self.log.export_to(&self.downloads_dir)?;
                self.status = format!("Exported log to {}", path.display());
            }
            KeyCode::Char('C') => self.confirm = Some(Confirm::ClearLogs),
            _ => {}
        }
        Ok(())
    }

    fn handle_settings_key(&mut self, key: KeyEvent) -> Result<()> {
        let Some(setting) = SettingKey::ALL.get(self.settings_cursor).copied() else {
            return Ok(());
        };
        match key.code {
            KeyCode::Up => {
                self.settings_cursor = self.settings_cursor.saturating_sub(1);
                return Ok(());
            }
            KeyCode::Down => {
                self.settings_cursor = (self.settings_cursor + 1).min(SettingKey::ALL.len() - 1);
                return Ok(());
            }
            KeyCode::Char('R') => {
                self.confirm = Some(Confirm::ResetSettings);
                return Ok(());
            }
            KeyCode::Enter if setting.is_text() => {
                self.form = Some(Form::new(
                    setting.label(),
                    FormPurpose::SettingText(setting),
                    vec![FormField::new("Value", self.settings.value(setting)).required()],
                ));
                return Ok(());
            }
            KeyCode::Right | KeyCode::Enter | KeyCode::Char(' ') => {
                self.settings.adjust(setting, 5);
            }
            KeyCode::Left => self.settings.adjust(setting, -5),
            _ => return Ok(()),
        }
        self.settings.save(&*self.store)?;
        self.status = format!("{} = {}", setting.label(), self.settings.value(setting));
        Ok(())
    }

    fn submit_form(&mut self, form: &Form<FormPurpose>) -> Result<String> {
        match &form.purpose {
            FormPurpose::FeedUrl(id) => {
                let saved = self.registry.save(*id, FeedUpdate::url(form.value(0)))?;
                self.sync_live_feeds();
                self.log
                    .info(format!("{} feed URL set to {}", id.display_name(), saved.url));
                Ok(format!("{} feed updated.", id.display_name()))
            }
            FormPurpose::CameraServer => {
                let mut camera = self.registry.camera_config().clone();
                camera.base_url = form.value(0).trim_end_matches('/').to_owned();
                self.registry.set_camera_config(camera)?;
                self.sync_live_feeds();
                Ok("Camera server updated.".to_owned())
            }
            FormPurpose::DetectionServer => {
                let mut detection = self.registry.detection().clone();
                detection.server_url = form.value(0).trim_end_matches('/').to_owned();
                self.registry.set_detection(detection)?;
                self.sync_live_feeds();
                Ok("Detection server updated.".to_owned())
            }
            FormPurpose::AddContact => {
                let contact = self.contacts.add(NewContact {
                    name: form.value(0).to_owned(),
                    phone: form.value(1).to_owned(),
                    relationship: Some(form.value(2).to_owned()),
                })?;
                self.contact_cursor = self.contacts.contacts().len().saturating_sub(1);
                self.log.success(format!("Added emergency contact {}", contact.name));
                Ok(format!("Added {}.", contact.name))
            }
            FormPurpose::EditContact(id) => {
                let contact = self.contacts.update(
                    id,
                    ContactPatch {
                        name: Some(form.value(0).to_owned()),
                        phone: Some(form.value(1).to_owned()),
                        relationship: Some(form.value(2).to_owned()),
                    },
                )?;
                Ok(format!("Updated {}.", contact.name))
            }
            FormPurpose::Sms => {
                if self.pending_sms.is_some() {
                    bail!("an SMS is already being sent");
                }
                let notifier = self.notifier.clone();
                let phone = form.value(0).to_owned();
                let message = form.value(1).to_owned();
                self.pending_sms = Some(tokio::spawn(async move {
                    notifier.send_sms(&phone, &message).await
                }));
                Ok("Sending SMS…".to_owned())
            }
            FormPurpose::SettingText(key) => {
                self.settings.apply(*key, form.value(0))?;
                self.settings.save(&*self.store)?;
                Ok(format!("{} = {}", key.label(), self.settings.value(*key)))
            }
        }
    }

    fn apply_confirm(&mut self, confirm: Confirm) {
        let result = match confirm {
            Confirm::Sos => self.send_sos(),
            Confirm::DeleteContact(id) => self.contacts.remove(&id).map(|removed| {
                self.contact_cursor = self
                    .contact_cursor
                    .min(self.contacts.contacts().len().saturating_sub(1));
                format!("Removed {}.", removed.name)
            }),
            Confirm::ClearGallery => self.gallery.clear().map(|removed| {
                self.gallery_cursor = 0;
                self.gallery_preview = None;
                format!("Deleted {removed} frame(s).")
            }),
            Confirm::ClearLogs => {
                self.log.clear();
                self.log_scroll = 0;
                Ok("Activity log cleared.".to_owned())
            }
            Confirm::ResetFeeds => self.registry.reset().map(|()| {
                self.sync_live_feeds();
                "Feed configuration restored.".to_owned()
            }),
            Confirm::ResetSettings => {
                self.settings.reset();
                self.settings
                    .save(&*self.store)
                    .map(|()| "Settings restored to defaults.".to_owned())
            }
        };
        match result {
            Ok(message) => self.status = message,
            Err(err) => {
                self.status = format!("{err:#}");
                self.log.error(format!("{err:#}"));
            }
        }
    }

    fn send_sos(&mut self) -> Result<String> {
        if self.pending_sos.is_some() {
            return Err(anyhow!("SOS already in progress"));
        }
        let notifier = self.notifier.clone();
        let contacts = self.contacts.contacts().to_vec();
        self.log.warning("Emergency SOS triggered");
        self.pending_sos = Some(tokio::spawn(async move {
            notifier.send_sos(&contacts, None).await
        }));
        self.screen = Screen::Emergency;
        Ok("Sending SOS…".to_owned())
    }
}

fn centered_rect(width: u16, height: u16, area: Rect) -> Rect {
    let width = width.min(area.width);
    let height = height.min(area.height);
    Rect {
        x: area.x + (area.width - width) / 2,
        y: area.y + (area.height - height) / 2,
        width,
        height,
    }
}

fn draw_form(frame: &mut ratatui::Frame<'_>, form: &Form<FormPurpose>) {
    let height = u16::try_from(form.fields.len() * 2 + 5).unwrap_or(u16::MAX);
    let area = centered_rect(64, height, frame.area());
    let mut lines = Vec::new();
    for (idx, field) in form.fields.iter().enumerate() {
        let focused = idx == form.focus;
        lines.push(Line::from(vec![
            Span::styled(
                format!("{} ", focus_marker(focused)),
                Style::default().fg(color_accent()),
            ),
            Span::styled(
                format!("{}{}: ", field.label, if field.required { "*" } else { "" }),
                Style::default().fg(color_muted()),
            ),
            Span::styled(
                format!("{}{}", field.value, if focused { "▏" } else { "" }),
                Style::default().fg(color_text()),
            ),
        ]));
        lines.push(Line::default());
    }
    if let Some(error) = &form.error {
        lines.push(Line::from(Span::styled(
            error.clone(),
            Style::default().fg(color_error()),
        )));
    }
    lines.push(Line::from(action_hint_spans(&[
        ("Enter", "Save"),
        ("Tab", "Next field"),
        ("Esc", "Cancel"),
    ])));

    frame.render_widget(Clear, area);
    frame.render_widget(
        Paragraph::new(lines)
            .block(panel_block("✎", &form.title, true))
            .wrap(Wrap { trim: false }),
        area,
    );
}

fn draw_confirm(frame: &mut ratatui::Frame<'_>, confirm: &Confirm) {
    let area = centered_rect(56, 6, frame.area());
    let color = if *confirm == Confirm::Sos {
        color_emergency()
    } else {
        color_warning()
    };
    let lines = vec![
        Line::from(Span::styled(
            confirm.prompt(),
            Style::default().fg(color).add_modifier(Modifier::BOLD),
        )),
        Line::default(),
        Line::from(action_hint_spans(&[("y", "Confirm"), ("any key", "Cancel")])),
    ];
    frame.render_widget(Clear, area);
    frame.render_widget(
        Paragraph::new(lines)
            .block(panel_block("?", "Confirm", true))
            .wrap(Wrap { trim: false }),
        area,
    );
}

fn color_text() -> Color {
    active_theme().text
}

fn color_muted() -> Color {
    active_theme().muted
}

fn color_border() -> Color {
    active_theme().border
}

fn color_border_active() -> Color {
    active_theme().border_active
}

fn color_accent() -> Color {
    active_theme().accent
}

fn color_success() -> Color {
    active_theme().success
}

fn color_warning() -> Color {
    active_theme().warning
}

fn color_error() -> Color {
    active_theme().error
}

fn color_emergency() -> Color {
    active_theme().emergency
}

fn panel_block<'a>(glyph: &'a str, title: &'a str, focused: bool) -> Block<'a> {
    let border_color = if focused {
        color_border_active()
    } else {
        color_border()
    };
    Block::default()
        .borders(Borders::ALL)
        .border_style(Style::default().fg(border_color))
        .title(Line::from(vec![
            Span::styled(
                format!(" {glyph} "),
                Style::default()
                    .fg(color_accent())
                    .add_modifier(Modifier::BOLD),
            ),
            Span::styled(
                title,
                Style::default()
                    .fg(color_text())
                    .add_modifier(Modifier::BOLD),
            ),
        ]))
}

fn action_hint_spans(hints: &[(&'static str, &'static str)]) -> Vec<Span<'static>> {
    let mut spans = Vec::new();
    for (idx, (key, label)) in hints.iter().enumerate() {
        if idx > 0 {
            spans.push(Span::styled("  |  ", Style::default().fg(color_border())));
        }
        spans.push(Span::styled(
            format!("[{key}]"),
            Style::default()
                .fg(color_accent())
                .add_modifier(Modifier::BOLD),
        ));
        spans.push(Span::styled(
            format!(" {label}"),
            Style::default().fg(color_muted()),
        ));
    }
    spans
}

fn status_message_style(status: &str) -> Style {
    let lower = status.to_ascii_lowercase();
    if lower.contains("fail") || lower.contains("error") || lower.contains("no frame") {
        Style::default().fg(color_error())
    } else if lower.contains("sending") || lower.contains("refreshing") {
        Style::default().fg(color_accent())
    } else if lower.contains("saved")
        || lower.contains("added")
        || lower.contains("updated")
        || lower.contains("captured")
        || lower.contains("sent")
    {
        Style::default().fg(color_success())
    } else {
        Style::default().fg(color_muted())
    }
}

fn checkbox(checked: bool) -> &'static str {
    if checked {
        GLYPH_CHECKED
    } else {
        GLYPH_UNCHECKED
    }
}

fn focus_marker(focused: bool) -> &'static str {
    if focused { GLYPH_ACTIVE } else { " " }
}

#[cfg(test)]
mod tests {
    use super::{App, Confirm, FormPurpose, Screen, centered_rect};
    use crate::activity::ActivityLog;
    use crate::app::AppContext;
    use crate::config::AppConfig;
    use crate::feeds::{DisplayMode, FeedId};
    use crate::storage::MemoryStore;
    use crossterm::event::{KeyCode, KeyEvent, KeyModifiers};
    use ratatui::layout::Rect;
    use std::sync::Arc;

    fn context() -> AppContext {
        AppContext {
            data_root: std::env::temp_dir(),
            store: Arc::new(MemoryStore::new()),
            config: AppConfig::default(),
            log: ActivityLog::shared(),
        }
    }

    fn press(app: &mut App, code: KeyCode) {
        let _ = app.handle_key(KeyEvent::new(code, KeyModifiers::NONE));
    }

    fn type_text(app: &mut App, text: &str) {
        for c in text.chars() {
            press(app, KeyCode::Char(c));
        }
    }

    #[test]
    fn screens_cycle_both_ways() {
        assert_eq!(Screen::Live.step(1), Screen::Feeds);
        assert_eq!(Screen::Live.step(-1), Screen::Settings);
        assert_eq!(Screen::Settings.step(1), Screen::Live);
    }

    #[test]
    fn centered_rect_fits_inside() {
        let area = Rect::new(0, 0, 40, 10);
        let rect = centered_rect(64, 6, area);
        assert_eq!(rect.width, 40);
        assert_eq!(rect.y, 2);
    }

    #[tokio::test]
    async fn default_active_feeds_get_drivers() {
        let ctx = context();
        let mut app = App::load(&ctx);
        app.sync_live_feeds();
        let ids: Vec<FeedId> = app.live.iter().map(|live| live.id).collect();
        assert_eq!(
            ids,
            vec![FeedId::ObjectDetection, FeedId::Thermal, FeedId::Lidar]
        );

        app.screen = Screen::Feeds;
        app.feeds_cursor = 1;
        press(&mut app, KeyCode::Char(' '));
        assert!(app.live.iter().all(|live| live.id != FeedId::Thermal));
        press(&mut app, KeyCode::Char('m'));
        assert_eq!(app.registry.get(FeedId::Thermal).mode, DisplayMode::Video);
    }

    #[tokio::test]
    async fn feed_url_form_updates_registry_and_driver() {
        let ctx = context();
        let mut app = App::load(&ctx);
        app.sync_live_feeds();
        app.screen = Screen::Feeds;
        app.feeds_cursor = 2;

        press(&mut app, KeyCode::Enter);
        assert!(matches!(
            app.form.as_ref().map(|form| &form.purpose),
            Some(FormPurpose::FeedUrl(FeedId::Lidar))
        ));
        let _ = app.handle_key(KeyEvent::new(KeyCode::Char('u'), KeyModifiers::CONTROL));
        type_text(&mut app, "rtsp://10.8.0.249:8080/h264.sdp");
        press(&mut app, KeyCode::Enter);

        assert!(app.form.is_none());
        assert_eq!(
            app.registry.get(FeedId::Lidar).url,
            "rtsp://10.8.0.249:8080/h264.sdp"
        );
        let live = app.live.iter().find(|live| live.id == FeedId::Lidar).unwrap();
        assert_eq!(live.url, "rtsp://10.8.0.249:8080/h264.sdp");
    }

    #[tokio::test]
    async fn contact_form_validates_and_sos_requires_confirmation() {
        let ctx = context();
        let mut app = App::load(&ctx);
        app.screen = Screen::Emergency;

        press(&mut app, KeyCode::Char('a'));
        type_text(&mut app, "Base camp");
        press(&mut app, KeyCode::Enter);
        assert!(app.form.as_ref().unwrap().error.is_some());
        type_text(&mut app, "+1 555 0100");
        press(&mut app, KeyCode::Enter);
        assert!(app.form.is_none());
        assert_eq!(app.contacts.contacts().len(), 1);
        assert_eq!(app.contacts.contacts()[0].relationship, None);

        press(&mut app, KeyCode::Char('s'));
        assert_eq!(app.confirm, Some(Confirm::Sos));
        press(&mut app, KeyCode::Char('n'));
        assert!(app.confirm.is_none());
        assert!(app.pending_sos.is_none());

        press(&mut app, KeyCode::Char('s'));
        press(&mut app, KeyCode::Char('y'));
        assert!(app.pending_sos.is_some());
    }

    #[tokio::test]
    async fn settings_adjust_and_persist() {
        let ctx = context();
        let mut app = App::load(&ctx);
        app.screen = Screen::Settings;
        press(&mut app, KeyCode::Right);
        assert_eq!(app.settings.movement_speed, 55);

        let reloaded = crate::settings::RobotSettings::load(&*ctx.store);
        assert_eq!(reloaded.movement_speed, 55);
    }
}
