use std::fs;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use crossterm::cursor;
use crossterm::event::{self, DisableMouseCapture, EnableMouseCapture};
use crossterm::style::{Attribute, Print, SetAttribute};
use crossterm::terminal;
use directories::ProjectDirs;
use epubnav_core::config::CONFIG_FILE;
use epubnav_core::{
    Cfi, DocumentSource, FileStore, InputOutcome, KeyValueStore, MemoryStore, NavTarget, Navigate,
    ProgressMode, ReaderConfig, ReaderEvent, ReaderSession, ResultEntry, Viewport,
};
use epubnav_render::TextSpineProvider;
use epubnav_tty::{
    combine_status, format_progress, progress_bar, CellGeometry, DrawParams, EventMapper,
    InputMode, TextScreen, UiEvent,
};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{prelude::*, EnvFilter};

const PROGRESS_BAR_WIDTH: usize = 22;

#[derive(Debug, Parser)]
#[command(
    name = "epubnav",
    version,
    about = "Terminal reader for reflowable text documents"
)]
struct Args {
    /// Location to open the document at, instead of the saved position
    #[arg(short = 'l', long = "location")]
    location: Option<usize>,

    /// Configuration file (defaults to config.toml in the platform config directory)
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,

    /// Print the search results for QUERY as JSON and exit
    #[arg(short = 's', long = "search", value_name = "QUERY")]
    search: Option<String>,

    /// Print the results of every configured panel as JSON and exit
    #[arg(long = "panels", conflicts_with = "search")]
    panels: bool,

    /// Document to open: a text file or a directory of section files
    file: PathBuf,
}

struct RawModeGuard;

impl RawModeGuard {
    fn new() -> anyhow::Result<Self> {
        terminal::enable_raw_mode()?;
        crossterm::execute!(io::stdout(), EnableMouseCapture)?;
        Ok(Self)
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let mut stdout = io::stdout();
        let _ = crossterm::execute!(stdout, DisableMouseCapture);
        let _ = terminal::disable_raw_mode();
        let _ = crossterm::execute!(stdout, cursor::Show);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let interactive = args.search.is_none() && !args.panels;

    let project_dirs = ProjectDirs::from("net", "epubnav", "epubnav")
        .ok_or_else(|| anyhow!("unable to resolve platform data directories"))?;
    let _log_guard = init_logging(&project_dirs, !interactive)?;

    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| project_dirs.config_dir().join(CONFIG_FILE));
    let config = ReaderConfig::load(&config_path)?;
    let store = open_store(&project_dirs);

    let geometry = if interactive {
        terminal_geometry()
    } else {
        CellGeometry::default()
    };
    let provider = TextSpineProvider::new()
        .with_excerpt_window(config.search.excerpt_window)
        .with_viewport(page_viewport(geometry));
    let session = ReaderSession::open(
        &provider,
        DocumentSource::Path(args.file.clone()),
        store,
        config,
    )
    .await
    .with_context(|| format!("failed to open {:?}", args.file))?;
    let session = Arc::new(session);
    info!(document = %session.identity(), "document opened");

    if let Some(query) = &args.search {
        prepare_locations(&session).await;
        let results = session.search_sidebar(query).await?;
        print_json(&results)?;
        session.close();
        return Ok(());
    }
    if args.panels {
        prepare_locations(&session).await;
        let panels = session.search_panels().await?;
        print_json(&panels)?;
        session.close();
        return Ok(());
    }

    if let Some(location) = args.location {
        session
            .ensure_locations()
            .await
            .context("failed to build the location index")?;
        session
            .navigate(Navigate::To(NavTarget::Location(location)))
            .await
            .with_context(|| format!("cannot open location {}", location))?;
    } else {
        let background = Arc::clone(&session);
        tokio::spawn(async move {
            if let Err(err) = background.ensure_locations().await {
                warn!(%err, "location index unavailable");
            }
        });
    }

    let outcome = run_interactive(&session, geometry).await;
    session.close();
    outcome
}

/// Search percentages need the location index; without it results are
/// still printed, just without progress.
async fn prepare_locations(session: &ReaderSession) {
    if let Err(err) = session.ensure_locations().await {
        warn!(%err, "location index unavailable, results carry no progress");
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let rendered = serde_json::to_string_pretty(value)?;
    let mut stdout = io::stdout().lock();
    writeln!(stdout, "{}", rendered)?;
    Ok(())
}

fn open_store(project_dirs: &ProjectDirs) -> Arc<dyn KeyValueStore> {
    let state_dir = project_dirs.data_local_dir().join("state");
    match FileStore::open(&state_dir) {
        Ok(store) => Arc::new(store),
        Err(err) => {
            warn!(%err, "positions and locations will not be kept after exit");
            Arc::new(MemoryStore::new())
        }
    }
}

fn terminal_geometry() -> CellGeometry {
    match terminal::window_size() {
        Ok(size) => CellGeometry::new(size.columns, size.rows, size.width, size.height),
        Err(err) => {
            warn!(%err, "unable to query the terminal size");
            CellGeometry::default()
        }
    }
}

/// The page area: everything above the status line.
fn page_viewport(geometry: CellGeometry) -> Viewport {
    Viewport {
        width: u32::from(geometry.columns),
        height: u32::from(geometry.rows.saturating_sub(1).max(1)),
    }
}

async fn run_interactive(session: &ReaderSession, geometry: CellGeometry) -> Result<()> {
    let (sender, mut receiver) = mpsc::unbounded_channel();
    let _subscription = session.subscribe(move |event| {
        let _ = sender.send(event.clone());
    });

    let _raw = RawModeGuard::new()?;
    let mut screen = TextScreen::new(io::stdout());
    crossterm::execute!(screen.writer(), cursor::Hide)?;
    let mut mapper = EventMapper::with_geometry(geometry);
    let mut view = ViewState::default();
    let mut dirty = true;

    loop {
        while let Ok(event) = receiver.try_recv() {
            if let ReaderEvent::DisplayError(message) = event {
                view.notice = Some(message);
            }
            dirty = true;
        }

        if view.overlay.is_some() {
            if mapper.mode() != InputMode::Results {
                mapper.set_mode(InputMode::Results);
            }
        } else if mapper.mode() == InputMode::Results {
            mapper.set_mode(InputMode::Normal);
        }

        if dirty {
            redraw(&mut screen, session, &mut view, &mapper)?;
            dirty = false;
        }

        if event::poll(Duration::from_millis(100))? {
            let ui_event = mapper.map_event(event::read()?);
            match handle_event(ui_event, session, &mut view, &mut mapper).await {
                Ok(LoopAction::ContinueRedraw) => dirty = true,
                Ok(LoopAction::Continue) => {}
                Ok(LoopAction::Quit) => break,
                Err(err) => {
                    warn!(%err, "command failed");
                    view.notice = Some(format!("{:#}", err));
                    dirty = true;
                }
            }
        }
    }

    screen.clear_all()?;
    Ok(())
}

enum LoopAction {
    Continue,
    ContinueRedraw,
    Quit,
}

#[derive(Default)]
struct ViewState {
    overlay: Option<ResultsWindow>,
    /// Last error or hint, shown on the status line until the next move.
    notice: Option<String>,
}

/// One selectable line of the results overlay.
#[derive(Debug, Clone, PartialEq)]
struct ResultRow {
    label: String,
    cfi: Cfi,
}

impl ResultRow {
    fn from_entry(panel_id: Option<&str>, entry: &ResultEntry) -> Self {
        let excerpt = entry
            .result
            .excerpt
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ");
        let mut label = match panel_id {
            Some(id) => format!("[{}] {}", id, excerpt),
            None => excerpt,
        };
        if let Some(percentage) = entry.percentage {
            label.push_str(&format!(" ({:.1}%)", percentage * 100.0));
        }
        Self {
            label,
            cfi: entry.result.cfi.clone(),
        }
    }
}

struct ResultsWindow {
    title: String,
    rows: Vec<ResultRow>,
    selected: usize,
    scroll_offset: usize,
}

impl ResultsWindow {
    fn new(title: String, rows: Vec<ResultRow>) -> Self {
        Self {
            title,
            rows,
            selected: 0,
            scroll_offset: 0,
        }
    }

    fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    fn selected_row(&self) -> Option<&ResultRow> {
        self.rows.get(self.selected)
    }

    fn move_selection(&mut self, delta: isize) -> bool {
        if self.rows.is_empty() {
            return false;
        }
        let len = self.rows.len() as isize;
        let next = (self.selected as isize + delta).clamp(0, len - 1) as usize;
        if next != self.selected {
            self.selected = next;
            true
        } else {
            false
        }
    }

    fn ensure_visible(&mut self, viewport_height: usize) {
        if viewport_height == 0 || self.rows.is_empty() {
            self.scroll_offset = 0;
            return;
        }
        let max_offset = self.rows.len().saturating_sub(viewport_height);
        if self.scroll_offset > max_offset {
            self.scroll_offset = max_offset;
        }
        if self.selected < self.scroll_offset {
            self.scroll_offset = self.selected;
            return;
        }
        let bottom = self.scroll_offset + viewport_height;
        if self.selected >= bottom {
            self.scroll_offset = self.selected + 1 - viewport_height;
        }
    }
}

async fn handle_event(
    event: UiEvent,
    session: &ReaderSession,
    view: &mut ViewState,
    mapper: &mut EventMapper,
) -> Result<LoopAction> {
    match event {
        UiEvent::Page { direction, count } => {
            view.notice = None;
            for _ in 0..count {
                session.step(direction).await?;
            }
            Ok(LoopAction::ContinueRedraw)
        }
        UiEvent::Input(input) => {
            view.notice = None;
            if let InputOutcome::OpenPanel = session.handle_input(input).await? {
                open_panels(session, view, mapper).await?;
            }
            Ok(LoopAction::ContinueRedraw)
        }
        UiEvent::GotoLocation { input } => {
            view.notice = None;
            session.go_to_location_input(&input).await?;
            Ok(LoopAction::ContinueRedraw)
        }
        UiEvent::GotoStart => {
            session
                .navigate(Navigate::To(NavTarget::Cfi(Cfi::section_start(0))))
                .await?;
            Ok(LoopAction::ContinueRedraw)
        }
        UiEvent::GotoEnd => {
            session
                .navigate(Navigate::To(NavTarget::Percentage(1.0)))
                .await?;
            Ok(LoopAction::ContinueRedraw)
        }
        UiEvent::BeginLocationPrompt
        | UiEvent::BeginSearch
        | UiEvent::PromptChanged { .. }
        | UiEvent::PromptCancel => Ok(LoopAction::ContinueRedraw),
        UiEvent::SearchSubmit { query } => {
            let query = query.trim();
            if query.is_empty() {
                return Ok(LoopAction::ContinueRedraw);
            }
            let entries = session.search_sidebar(query).await?;
            if entries.is_empty() {
                view.notice = Some(format!("no matches for {:?}", query));
                return Ok(LoopAction::ContinueRedraw);
            }
            let rows = entries
                .iter()
                .map(|entry| ResultRow::from_entry(None, entry))
                .collect();
            view.overlay = Some(ResultsWindow::new(format!("Search: {}", query), rows));
            mapper.set_mode(InputMode::Results);
            Ok(LoopAction::ContinueRedraw)
        }
        UiEvent::OpenPanels => {
            open_panels(session, view, mapper).await?;
            Ok(LoopAction::ContinueRedraw)
        }
        UiEvent::ResultsMoveSelection { delta } => {
            if let Some(window) = view.overlay.as_mut() {
                if window.move_selection(delta) {
                    return Ok(LoopAction::ContinueRedraw);
                }
            }
            Ok(LoopAction::Continue)
        }
        UiEvent::ResultsActivateSelection => {
            let target = view
                .overlay
                .as_ref()
                .and_then(ResultsWindow::selected_row)
                .map(|row| row.cfi.clone());
            match target {
                Some(cfi) => {
                    view.overlay = None;
                    mapper.set_mode(InputMode::Normal);
                    session.navigate(Navigate::To(NavTarget::Cfi(cfi))).await?;
                    Ok(LoopAction::ContinueRedraw)
                }
                None => Ok(LoopAction::Continue),
            }
        }
        UiEvent::CloseOverlay => {
            if view.overlay.take().is_some() {
                mapper.set_mode(InputMode::Normal);
                Ok(LoopAction::ContinueRedraw)
            } else {
                Ok(LoopAction::Continue)
            }
        }
        UiEvent::Resize { .. } => {
            session.resize(page_viewport(mapper.geometry())).await?;
            Ok(LoopAction::ContinueRedraw)
        }
        UiEvent::Quit => Ok(LoopAction::Quit),
        UiEvent::None => Ok(LoopAction::Continue),
    }
}

async fn open_panels(
    session: &ReaderSession,
    view: &mut ViewState,
    mapper: &mut EventMapper,
) -> Result<()> {
    let panels = session.search_panels().await?;
    let rows = panels
        .iter()
        .flat_map(|panel| {
            panel
                .entries
                .iter()
                .map(move |entry| ResultRow::from_entry(Some(&panel.panel_id), entry))
        })
        .collect();
    view.overlay = Some(ResultsWindow::new("Panels".to_owned(), rows));
    mapper.set_mode(InputMode::Results);
    Ok(())
}

fn redraw(
    screen: &mut TextScreen<io::Stdout>,
    session: &ReaderSession,
    view: &mut ViewState,
    mapper: &EventMapper,
) -> Result<()> {
    let geometry = mapper.geometry();
    let total_cols = u32::from(geometry.columns);
    let page_rows = u32::from(geometry.rows.saturating_sub(1).max(1));

    screen.begin_sync_update()?;
    screen.clear_all()?;
    let text = session.visible_text().unwrap_or_default();
    screen.draw_page(&text, DrawParams::clamped(total_cols, page_rows))?;
    if let Some(window) = view.overlay.as_mut() {
        draw_results_overlay(screen.writer(), window, total_cols, page_rows)?;
    }

    let pending = mapper.pending_input();
    let status = combine_status(
        Some(document_status(session, view.notice.as_deref())),
        pending.as_deref(),
    )
    .unwrap_or_default();
    let status_row = geometry.rows.saturating_sub(1);
    screen.draw_status(status_row, &truncate_to_width(&status, total_cols as usize))?;
    screen.end_sync_update()
}

fn document_status(session: &ReaderSession, notice: Option<&str>) -> String {
    let mut parts = Vec::new();
    if let Some(title) = &session.info().metadata.title {
        parts.push(title.clone());
    }
    if let Some(position) = session.current_position() {
        let mode = session.config().display.progress;
        let index = session.location_index();
        if index.is_some() && mode != ProgressMode::None {
            let ticks: Vec<f32> = session
                .section_markers()
                .iter()
                .map(|marker| marker.percentage)
                .collect();
            parts.push(progress_bar(PROGRESS_BAR_WIDTH, position.percentage, &ticks));
        }
        let length = index.map_or(0, |index| index.len());
        let progress = format_progress(mode, &position, length);
        if !progress.is_empty() {
            parts.push(progress);
        }
    }
    if let Some(notice) = notice {
        parts.push(notice.to_owned());
    }
    parts.join("  ")
}

fn draw_results_overlay(
    writer: &mut impl Write,
    window: &mut ResultsWindow,
    total_cols: u32,
    rows_available: u32,
) -> Result<()> {
    const EMPTY_MESSAGE: &str = "No results";

    if total_cols < 20 || rows_available < 6 {
        return Ok(());
    }
    let inner_width = total_cols.saturating_sub(6) as usize;
    let max_content_height = rows_available.saturating_sub(6) as usize;
    if max_content_height == 0 {
        return Ok(());
    }

    let total_entries = window.rows.len().max(1);
    let content_height = total_entries.min(max_content_height);
    window.ensure_visible(content_height);

    let window_height = (content_height + 4) as u32;
    let window_width = (inner_width + 2) as u32;
    let start_col = (total_cols.saturating_sub(window_width) / 2) as u16;
    let mut row = (rows_available.saturating_sub(window_height) / 2) as u16;

    let horizontal_border = format!("+{}+", "-".repeat(inner_width));
    print_inverted(writer, start_col, row, &horizontal_border)?;
    row = row.saturating_add(1);
    let title = truncate_to_width(&window.title, inner_width);
    print_inverted(
        writer,
        start_col,
        row,
        &format!("|{: ^inner_width$}|", title, inner_width = inner_width),
    )?;
    row = row.saturating_add(1);
    print_inverted(writer, start_col, row, &format!("|{}|", "-".repeat(inner_width)))?;
    row = row.saturating_add(1);

    if window.is_empty() {
        let content = pad_to_width(&format!("  {}", EMPTY_MESSAGE), inner_width);
        print_inverted(writer, start_col, row, &format!("|{}|", content))?;
        row = row.saturating_add(1);
    } else {
        let end = (window.scroll_offset + content_height).min(window.rows.len());
        for idx in window.scroll_offset..end {
            let marker = if idx == window.selected { '>' } else { ' ' };
            let line = format!("{} {}", marker, window.rows[idx].label);
            let content = pad_to_width(&line, inner_width);
            print_inverted(writer, start_col, row, &format!("|{}|", content))?;
            row = row.saturating_add(1);
        }
    }

    print_inverted(writer, start_col, row, &horizontal_border)?;
    Ok(())
}

fn print_inverted(writer: &mut impl Write, col: u16, row: u16, content: &str) -> Result<()> {
    crossterm::execute!(
        writer,
        cursor::MoveTo(col, row),
        SetAttribute(Attribute::Reverse),
        Print(content),
        SetAttribute(Attribute::Reset)
    )?;
    Ok(())
}

fn truncate_to_width(text: &str, width: usize) -> String {
    if text.chars().count() <= width {
        return text.to_owned();
    }
    if width <= 3 {
        return text.chars().take(width).collect();
    }
    let mut truncated: String = text.chars().take(width - 3).collect();
    truncated.push_str("...");
    truncated
}

fn pad_to_width(text: &str, width: usize) -> String {
    let mut padded = truncate_to_width(text, width);
    let len = padded.chars().count();
    if len < width {
        padded.push_str(&" ".repeat(width - len));
    }
    padded
}

fn init_logging(project_dirs: &ProjectDirs, console: bool) -> Result<WorkerGuard> {
    let log_dir = project_dirs.data_local_dir().join("logs");
    fs::create_dir_all(&log_dir)
        .with_context(|| format!("failed to create log directory {:?}", log_dir))?;
    let file_appender = tracing_appender::rolling::never(log_dir, "epubnav.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let file_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(file_writer);
    // The interactive screen owns the terminal, so only batch runs log there.
    let console_layer = console.then(|| tracing_subscriber::fmt::layer().with_writer(io::stderr));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(console_layer)
        .try_init()
        .map_err(|err| anyhow!(err))?;

    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;
    use epubnav_core::SearchResult;

    fn entry(excerpt: &str, percentage: Option<f32>) -> ResultEntry {
        ResultEntry {
            result: SearchResult {
                cfi: Cfi::section_start(1),
                excerpt: excerpt.to_owned(),
                section: 1,
            },
            percentage,
        }
    }

    fn window(len: usize) -> ResultsWindow {
        let rows = (0..len)
            .map(|k| ResultRow::from_entry(None, &entry(&format!("hit {}", k), None)))
            .collect();
        ResultsWindow::new("Search: hit".to_owned(), rows)
    }

    #[test]
    fn result_rows_flatten_excerpts_and_show_progress() {
        let row = ResultRow::from_entry(Some("notes"), &entry("a\n  wide\texcerpt", Some(0.4567)));
        assert_eq!(row.label, "[notes] a wide excerpt (45.7%)");
        assert_eq!(row.cfi, Cfi::section_start(1));

        let row = ResultRow::from_entry(None, &entry("plain", None));
        assert_eq!(row.label, "plain");
    }

    #[test]
    fn selection_stays_in_bounds() {
        let mut results = window(3);
        assert!(!results.move_selection(-1));
        assert!(results.move_selection(5));
        assert_eq!(results.selected, 2);
        assert!(!results.move_selection(1));

        let mut empty = window(0);
        assert!(!empty.move_selection(1));
        assert!(empty.selected_row().is_none());
    }

    #[test]
    fn scrolling_follows_the_selection() {
        let mut results = window(10);
        results.move_selection(6);
        results.ensure_visible(4);
        assert_eq!(results.scroll_offset, 3);
        results.move_selection(-5);
        results.ensure_visible(4);
        assert_eq!(results.scroll_offset, 1);
        assert_eq!(results.selected_row().map(|row| row.label.as_str()), Some("hit 1"));
    }

    #[test]
    fn overlay_lists_rows_with_a_marker() {
        let mut results = window(2);
        results.move_selection(1);
        let mut output = Vec::new();
        draw_results_overlay(&mut output, &mut results, 40, 12).unwrap();
        let output = String::from_utf8(output).unwrap();
        assert!(output.contains("Search: hit"));
        assert!(output.contains("|  hit 0"));
        assert!(output.contains("|> hit 1"));
    }

    #[test]
    fn text_fits_the_requested_width() {
        assert_eq!(truncate_to_width("short", 10), "short");
        assert_eq!(truncate_to_width("much too long", 8), "much ...");
        assert_eq!(truncate_to_width("abcdef", 2), "ab");
        assert_eq!(pad_to_width("ab", 4), "ab  ");
    }

    #[test]
    fn viewport_leaves_room_for_the_status_line() {
        let viewport = page_viewport(CellGeometry::new(100, 30, 0, 0));
        assert_eq!(
            viewport,
            Viewport {
                width: 100,
                height: 29
            }
        );
        assert_eq!(page_viewport(CellGeometry::new(10, 1, 0, 0)).height, 1);
    }
}
