use crate::app::AppContext;
use crate::cli::ViewArgs;
use crate::feeds::DisplayMode;
use crate::gallery::{Gallery, write_frame};
use crate::live::{FeedHandle, FeedSpec, FeedTileSnapshot, http_client, spawn_feed};
use crate::theme::{ThemePalette, load_or_create_theme};
use anyhow::{Context, Result};
use crossterm::event::{self, Event, KeyCode, KeyEventKind};
use crossterm::execute;
use crossterm::terminal::{
    EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode,
};
use image::GrayImage;
use ratatui::Terminal;
use ratatui::backend::CrosstermBackend;
use ratatui::layout::{Constraint, Layout, Margin, Rect};
use ratatui::style::Style;
use ratatui::widgets::{Block, Borders, Paragraph};
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::warn;

const BRIGHTNESS_RAMP: &[u8] = b" .,:;ox%#@";

/// Character cells available inside one feed tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CellGeometry {
    pub width: usize,
    pub height: usize,
}

impl Default for CellGeometry {
    fn default() -> Self {
        Self {
            width: 48,
            height: 18,
        }
    }
}

impl CellGeometry {
    pub fn of_tile(tile: Rect) -> Self {
        let inner = inner_cell(tile);
        Self {
            width: usize::from(inner.width.max(2)),
            height: usize::from(inner.height.max(2)),
        }
    }
}

pub async fn run_view(args: &ViewArgs, ctx: &AppContext) -> Result<()> {
    let stream_count = args.streams.len();
    let (rows, cols) = compute_grid_dimensions(stream_count, args.rows, args.cols);
    let theme = load_or_create_theme(&*ctx.store).unwrap_or_else(|err| {
        warn!("falling back to default theme: {err:#}");
        ThemePalette::default()
    });

    let (geometry_tx, geometry_rx) = watch::channel(CellGeometry::default());

    let http = http_client();
    let feeds: Vec<FeedHandle> = args
        .streams
        .iter()
        .enumerate()
        .map(|(idx, url)| {
            spawn_feed(
                FeedSpec {
                    label: format!("Stream {}", idx + 1),
                    url: url.clone(),
                    mode: args.mode,
                    timeout: ctx.config.connect_timeout(),
                },
                http.clone(),
                Arc::clone(&ctx.log),
                geometry_rx.clone(),
            )
        })
        .collect();

    let mut terminal = enter_fullscreen()?;

    let mut grid = ViewGrid {
        feeds: &feeds,
        gallery: Gallery::load(Arc::clone(&ctx.store)),
        ctx,
        theme,
        selected: 0,
    };
    let render_result = render_loop(
        &mut terminal,
        &mut grid,
        &geometry_tx,
        rows,
        cols,
        args.refresh_fps.max(1),
    )
    .await;

    drop(feeds);
    let restored = leave_fullscreen(&mut terminal);
    render_result.and(restored)
}

pub type FullscreenTerminal = Terminal<CrosstermBackend<io::Stdout>>;

/// Raw mode plus the alternate screen; pair with [`leave_fullscreen`].
pub fn enter_fullscreen() -> Result<FullscreenTerminal> {
    enable_raw_mode().context("could not switch terminal to raw mode")?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen).context("could not open alternate screen")?;
    Terminal::new(CrosstermBackend::new(stdout)).context("could not attach terminal backend")
}

pub fn leave_fullscreen(terminal: &mut FullscreenTerminal) -> Result<()> {
    disable_raw_mode().context("could not leave raw mode")?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)
        .context("could not close alternate screen")?;
    terminal.show_cursor().context("could not show cursor")
}

struct ViewGrid<'a> {
    feeds: &'a [FeedHandle],
    gallery: Gallery,
    ctx: &'a AppContext,
    theme: ThemePalette,
    selected: usize,
}

impl ViewGrid<'_> {
    fn selected_feed(&self) -> Option<&FeedHandle> {
        self.feeds.get(self.selected)
    }

    async fn capture_selected(&mut self) {
        let Some(feed) = self.feeds.get(self.selected) else {
            return;
        };
        let label = feed.snapshot().label;
        let image = feed.capture().await;
        match self.gallery.add(&label, &image) {
            Ok(Some(frame)) => match write_frame(&frame, &self.ctx.downloads_dir()) {
                Ok(path) => self
                    .ctx
                    .log
                    .success(format!("Saved {label} frame to {}", path.display())),
                Err(err) => self
                    .ctx
                    .log
                    .error(format!("Saved {label} frame to gallery but not to disk: {err:#}")),
            },
            Ok(None) => {}
            Err(err) => self.ctx.log.error(format!("Failed to save {label} frame: {err:#}")),
        }
    }
}

async fn render_loop(
    terminal: &mut FullscreenTerminal,
    grid: &mut ViewGrid<'_>,
    geometry_tx: &watch::Sender<CellGeometry>,
    rows: usize,
    cols: usize,
    refresh_fps: u16,
) -> Result<()> {
    let frame_delay = Duration::from_secs(1) / u32::from(refresh_fps.max(1));
    let mut running = true;

    while running {
        let status = grid
            .ctx
            .log
            .entries()
            .last()
            .map(|entry| entry.message.clone())
            .unwrap_or_default();

        terminal
            .draw(|frame| {
                let [grid_area, footer_area] = Layout::vertical([
                    Constraint::Min(1),
                    Constraint::Length(1),
                ])
                .areas(frame.area());

                let grid_rects = build_grid_rects(grid_area, rows, cols);
                if let Some(first) = grid_rects.first() {
                    publish_geometry(geometry_tx, CellGeometry::of_tile(*first));
                }

                for (idx, (feed, area)) in grid.feeds.iter().zip(grid_rects).enumerate() {
                    let snapshot = feed.snapshot();
                    let border = if idx == grid.selected {
                        grid.theme.border_active
                    } else {
                        grid.theme.border
                    };
                    let block = Block::default()
                        .title(tile_title(idx, &snapshot))
                        .borders(Borders::ALL)
                        .border_style(Style::default().fg(border));
                    let body = Paragraph::new(tile_body(&snapshot))
                        .style(Style::default().fg(grid.theme.for_state(&snapshot.state)))
                        .block(block);
                    frame.render_widget(body, area);
                }

                let footer = Paragraph::new(format!(
                    "tab: next | r: refresh | c: capture | d: dismiss | q/esc: quit | {status}"
                ))
                .style(Style::default().fg(grid.theme.muted));
                frame.render_widget(footer, footer_area);
            })
            .context("terminal draw failed")?;

        if event::poll(Duration::from_millis(5)).context("failed to poll input")?
            && let Event::Key(key) = event::read().context("failed reading input")?
            && key.kind == KeyEventKind::Press
        {
            match key.code {
                KeyCode::Char('q') | KeyCode::Esc => running = false,
                KeyCode::Tab | KeyCode::Right => {
                    grid.selected = (grid.selected + 1) % grid.feeds.len().max(1);
                }
                KeyCode::BackTab | KeyCode::Left => {
                    let count = grid.feeds.len().max(1);
                    grid.selected = (grid.selected + count - 1) % count;
                }
                KeyCode::Char(digit @ '1'..='9') => {
                    let idx = usize::from(digit as u8 - b'1');
                    if idx < grid.feeds.len() {
                        grid.selected = idx;
                    }
                }
                KeyCode::Char('r') => {
                    if let Some(feed) = grid.selected_feed() {
                        feed.refresh();
                    }
                }
                KeyCode::Char('d') => {
                    if let Some(feed) = grid.selected_feed() {
                        feed.dismiss_error();
                    }
                }
                KeyCode::Char('c') => grid.capture_selected().await,
                _ => {}
            }
        }

        tokio::time::sleep(frame_delay).await;
    }

    Ok(())
}

/// Only wakes feed drivers when the tile size actually changed.
pub fn publish_geometry(tx: &watch::Sender<CellGeometry>, geometry: CellGeometry) {
    tx.send_if_modified(|current| {
        let changed = *current != geometry;
        *current = geometry;
        changed
    });
}

fn tile_title(idx: usize, snapshot: &FeedTileSnapshot) -> String {
    let mut title = format!(
        "{} | {} | {}",
        idx + 1,
        snapshot.label,
        snapshot.state.label()
    );
    if snapshot.state.is_connected() && snapshot.mode == DisplayMode::Mjpeg {
        title.push_str(&format!(
            " | frames={} decode_errs={}",
            snapshot.frames_received, snapshot.decode_errors
        ));
    }
    title
}

/// Connected MJPEG tiles show the picture; everything else shows why not.
pub fn tile_body(snapshot: &FeedTileSnapshot) -> String {
    if !snapshot.frame_ascii.is_empty() {
        return snapshot.frame_ascii.clone();
    }
    match (&snapshot.state, snapshot.mode) {
        (state, _) if state.failure().is_some() => {
            format!("{state}\n\n{}\n\nr: retry  d: dismiss", snapshot.url)
        }
        (_, DisplayMode::Iframe) => format!("embedded page, open in a browser:\n{}", snapshot.url),
        (state, DisplayMode::Video) if state.is_connected() => {
            format!("video stream reachable:\n{}", snapshot.url)
        }
        (state, _) => format!("status: {state}\n{}", snapshot.url),
    }
}

/// Box-filters a grayscale frame down to one character per terminal cell.
pub fn ascii_art(gray: &GrayImage, geometry: CellGeometry) -> String {
    let (src_w, src_h) = (gray.width() as usize, gray.height() as usize);
    let (cols, rows) = (geometry.width, geometry.height);
    if src_w == 0 || src_h == 0 || cols == 0 || rows == 0 {
        return "no frame".to_owned();
    }

    let span = |cell: usize, cells: usize, len: usize| {
        let from = cell * len / cells;
        let to = ((cell + 1) * len / cells).max(from + 1).min(len);
        (from.min(len - 1), to)
    };

    let mut out = String::with_capacity((cols + 1) * rows);
    for row in 0..rows {
        if row > 0 {
            out.push('\n');
        }
        let (y0, y1) = span(row, rows, src_h);
        for col in 0..cols {
            let (x0, x1) = span(col, cols, src_w);
            let mut sum = 0_u64;
            for y in y0..y1 {
                for x in x0..x1 {
                    sum += u64::from(gray.get_pixel(x as u32, y as u32).0[0]);
                }
            }
            let area = ((y1 - y0) * (x1 - x0)).max(1) as u64;
            out.push(shade(sum / area));
        }
    }
    out
}

fn shade(luma: u64) -> char {
    let last = BRIGHTNESS_RAMP.len() - 1;
    let idx = (luma.min(255) as usize * last) / 255;
    char::from(BRIGHTNESS_RAMP[idx])
}

/// Rows and columns for `count` tiles. Zero means "pick for me"; a fixed
/// grid too small for every tile grows extra rows.
pub fn compute_grid_dimensions(count: usize, rows: u16, cols: u16) -> (usize, usize) {
    let count = count.max(1);
    let (rows, cols) = (usize::from(rows), usize::from(cols));
    let cols = match (rows, cols) {
        (0, 0) => (1..=count).find(|c| c * c >= count).unwrap_or(count),
        (r, 0) => count.div_ceil(r),
        (_, c) => c,
    };
    let rows = rows.max(count.div_ceil(cols));
    (rows, cols)
}

pub fn build_grid_rects(area: Rect, rows: usize, cols: usize) -> Vec<Rect> {
    Layout::vertical(vec![Constraint::Fill(1); rows.max(1)])
        .split(area)
        .iter()
        .flat_map(|row| {
            Layout::horizontal(vec![Constraint::Fill(1); cols.max(1)])
                .split(*row)
                .to_vec()
        })
        .collect()
}

/// Area inside a bordered block.
pub fn inner_cell(cell: Rect) -> Rect {
    cell.inner(Margin::new(1, 1))
}

#[cfg(test)]
mod tests {
    use super::{CellGeometry, ascii_art, build_grid_rects, compute_grid_dimensions, tile_body};
    use crate::feeds::DisplayMode;
    use crate::live::FeedTileSnapshot;
    use crate::stream::{ConnectionState, FailureReason};
    use image::GrayImage;
    use ratatui::layout::Rect;

    fn snapshot(state: ConnectionState, mode: DisplayMode) -> FeedTileSnapshot {
        FeedTileSnapshot {
            label: "Lidar".to_owned(),
            url: "http://robot.local:5000/lidar_feed".to_owned(),
            mode,
            state,
            frame_ascii: String::new(),
            frame_size: None,
            frames_received: 0,
            decode_errors: 0,
        }
    }

    #[test]
    fn grid_dimensions_cover_every_stream() {
        assert_eq!(compute_grid_dimensions(1, 0, 0), (1, 1));
        assert_eq!(compute_grid_dimensions(5, 0, 0), (2, 3));
        assert_eq!(compute_grid_dimensions(5, 0, 2), (3, 2));
        assert_eq!(compute_grid_dimensions(5, 1, 0), (1, 5));
        assert_eq!(compute_grid_dimensions(7, 2, 2), (4, 2));
    }

    #[test]
    fn grid_rects_fill_area() {
        let rects = build_grid_rects(Rect::new(0, 0, 80, 24), 2, 2);
        assert_eq!(rects.len(), 4);
        assert_eq!(rects[0].width + rects[1].width, 80);
    }

    #[test]
    fn ascii_averages_each_cell() {
        let halves = GrayImage::from_fn(8, 8, |x, _| image::Luma([if x < 4 { 0 } else { 255 }]));
        let two_cells = CellGeometry {
            width: 2,
            height: 1,
        };
        assert_eq!(ascii_art(&halves, two_cells), " @");

        let stripes = GrayImage::from_fn(4, 4, |_, y| image::Luma([if y % 2 == 0 { 0 } else { 255 }]));
        let one_cell = CellGeometry {
            width: 1,
            height: 1,
        };
        assert_eq!(ascii_art(&stripes, one_cell), ";");

        assert_eq!(ascii_art(&GrayImage::new(0, 0), one_cell), "no frame");
    }

    #[test]
    fn failed_tile_explains_and_offers_retry() {
        let body = tile_body(&snapshot(
            ConnectionState::Failed(FailureReason::Timeout),
            DisplayMode::Mjpeg,
        ));
        assert!(body.starts_with("failed: Stream connection timed out"));
        assert!(body.contains("r: retry"));
    }

    #[test]
    fn embed_tile_points_to_browser() {
        let body = tile_body(&snapshot(ConnectionState::Idle, DisplayMode::Iframe));
        assert!(body.contains("browser"));
        assert!(body.contains("lidar_feed"));
    }
}
