use std::io::{self, Write};

use anyhow::Result;
use crossterm::{
    cursor,
    event::{Event, KeyCode, KeyEvent, KeyModifiers, MouseButton, MouseEvent, MouseEventKind},
    style::Print,
    terminal::{Clear, ClearType},
};
use epubnav_core::{Direction, InputEvent, NavKey, PositionUpdate, ProgressMode};
use tracing::trace;

/// Draws pages of plain text onto a terminal.
pub struct TextScreen<W: Write> {
    writer: W,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrawParams {
    pub columns: u32,
    pub rows: u32,
}

impl DrawParams {
    pub fn clamped(columns: u32, rows: u32) -> Self {
        Self {
            columns: columns.max(1),
            rows: rows.max(1),
        }
    }
}

impl<W: Write> TextScreen<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn writer(&mut self) -> &mut W {
        &mut self.writer
    }

    /// Writes `text` from the top left corner. Every row up to
    /// `params.rows` is cleared first, so a short page leaves no leftovers
    /// from the previous one.
    pub fn draw_page(&mut self, text: &str, params: DrawParams) -> Result<()> {
        let mut lines = text.lines();
        for row in 0..params.rows {
            crossterm::queue!(
                self.writer,
                cursor::MoveTo(0, row as u16),
                Clear(ClearType::CurrentLine)
            )?;
            if let Some(line) = lines.next() {
                let visible: String = line.chars().take(params.columns as usize).collect();
                crossterm::queue!(self.writer, Print(visible))?;
            }
        }
        self.writer.flush()?;
        Ok(())
    }

    pub fn draw_status(&mut self, row: u16, label: &str) -> Result<()> {
        crossterm::queue!(
            self.writer,
            cursor::MoveTo(0, row),
            Clear(ClearType::CurrentLine)
        )?;
        write_status_line(&mut self.writer, label)?;
        Ok(())
    }

    pub fn begin_sync_update(&mut self) -> Result<()> {
        write!(self.writer, "\u{1b}[?2026h")?;
        Ok(())
    }

    /// Disables synchronized updates.
    /// The terminal will render all buffered changes at once.
    pub fn end_sync_update(&mut self) -> Result<()> {
        write!(self.writer, "\u{1b}[?2026l")?;
        self.writer.flush()?;
        Ok(())
    }

    /// Clears the entire screen.
    pub fn clear_all(&mut self) -> Result<()> {
        crossterm::execute!(
            &mut self.writer,
            Clear(ClearType::All),
            cursor::MoveTo(0, 0)
        )?;
        Ok(())
    }
}

pub fn write_status_line<W: Write>(writer: &mut W, label: &str) -> io::Result<()> {
    write!(writer, "{}", label)?;
    writer.flush()
}

/// The progress indicator for the status line. Empty when the mode is off
/// or the position has no meaningful progress yet.
pub fn format_progress(mode: ProgressMode, position: &PositionUpdate, length: usize) -> String {
    match mode {
        ProgressMode::None => String::new(),
        ProgressMode::Location => match position.location {
            Some(location) if location > 0 => format!("Loc {}/{}", location, length),
            _ => String::new(),
        },
        ProgressMode::Percentage => match position.percentage {
            Some(fraction) if fraction > 0.0 && fraction < 1.0 => {
                format!("{:.1}%", fraction * 100.0)
            }
            _ => String::new(),
        },
    }
}

/// A one-line progress bar: `#` marks the current position, `|` marks where
/// sections start.
pub fn progress_bar(width: usize, fraction: Option<f32>, ticks: &[f32]) -> String {
    if width < 3 {
        return String::new();
    }
    let inner = width - 2;
    let cell = |fraction: f32| {
        let fraction = if fraction.is_nan() { 0.0 } else { fraction.clamp(0.0, 1.0) };
        (fraction * (inner - 1) as f32).round() as usize
    };
    let mut cells = vec!['-'; inner];
    for &tick in ticks {
        cells[cell(tick)] = '|';
    }
    if let Some(fraction) = fraction {
        cells[cell(fraction)] = '#';
    }
    format!("[{}]", cells.into_iter().collect::<String>())
}

/// Joins the document status with whatever the user is typing.
pub fn combine_status(base: Option<String>, pending_input: Option<&str>) -> Option<String> {
    let base = base.filter(|s| !s.is_empty());
    match (base, pending_input.filter(|s| !s.is_empty())) {
        (Some(mut base), Some(pending)) => {
            base.push_str(" | ");
            base.push_str(pending);
            Some(base)
        }
        (Some(base), None) => Some(base),
        (None, Some(pending)) => Some(pending.to_string()),
        (None, None) => None,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum UiEvent {
    /// Counted paging from the letter keys.
    Page { direction: Direction, count: usize },
    /// Raw reader input: arrow keys, clicks and drags.
    Input(InputEvent),
    GotoLocation { input: String },
    GotoStart,
    GotoEnd,
    BeginLocationPrompt,
    BeginSearch,
    PromptChanged { input: String },
    SearchSubmit { query: String },
    PromptCancel,
    OpenPanels,
    ResultsMoveSelection { delta: isize },
    ResultsActivateSelection,
    CloseOverlay,
    Resize { columns: u16, rows: u16 },
    Quit,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InputMode {
    #[default]
    Normal,
    Results,
    Search,
    Location,
}

/// Terminal size in cells plus the size of one cell in pixels, used to
/// report mouse positions in the pixel space the navigation thresholds
/// are expressed in.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CellGeometry {
    pub columns: u16,
    pub rows: u16,
    pub cell_width: f32,
    pub cell_height: f32,
}

impl CellGeometry {
    const FALLBACK_CELL_WIDTH: f32 = 8.0;
    const FALLBACK_CELL_HEIGHT: f32 = 16.0;

    /// `pixel_width`/`pixel_height` may be zero when the terminal does not
    /// report them.
    pub fn new(columns: u16, rows: u16, pixel_width: u16, pixel_height: u16) -> Self {
        let columns = columns.max(1);
        let rows = rows.max(1);
        let cell_width = if pixel_width > 0 {
            f32::from(pixel_width) / f32::from(columns)
        } else {
            Self::FALLBACK_CELL_WIDTH
        };
        let cell_height = if pixel_height > 0 {
            f32::from(pixel_height) / f32::from(rows)
        } else {
            Self::FALLBACK_CELL_HEIGHT
        };
        Self {
            columns,
            rows,
            cell_width,
            cell_height,
        }
    }

    pub fn width(&self) -> f32 {
        f32::from(self.columns) * self.cell_width
    }

    pub fn height(&self) -> f32 {
        f32::from(self.rows) * self.cell_height
    }
}

impl Default for CellGeometry {
    fn default() -> Self {
        Self::new(80, 24, 0, 0)
    }
}

#[derive(Debug, Default)]
pub struct EventMapper {
    pending_count: Option<usize>,
    pending_digits: String,
    mode: InputMode,
    prompt: String,
    geometry: CellGeometry,
    press: Option<(u16, u16)>,
}

impl EventMapper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_geometry(geometry: CellGeometry) -> Self {
        Self {
            geometry,
            ..Self::default()
        }
    }

    pub fn geometry(&self) -> CellGeometry {
        self.geometry
    }

    pub fn set_mode(&mut self, mode: InputMode) {
        if self.mode != mode {
            self.reset_count();
            self.prompt.clear();
            self.press = None;
            self.mode = mode;
        }
    }

    pub fn mode(&self) -> InputMode {
        self.mode
    }

    pub fn map_event(&mut self, event: Event) -> UiEvent {
        if let Event::Resize(columns, rows) = event {
            self.geometry.columns = columns.max(1);
            self.geometry.rows = rows.max(1);
            return UiEvent::Resize { columns, rows };
        }
        match self.mode {
            InputMode::Normal => self.map_event_normal(event),
            InputMode::Results => self.map_event_results(event),
            InputMode::Search | InputMode::Location => self.map_event_prompt(event),
        }
    }

    fn map_event_normal(&mut self, event: Event) -> UiEvent {
        match event {
            Event::Key(KeyEvent {
                code, modifiers, ..
            }) => match (code, modifiers) {
                (KeyCode::Char(c), KeyModifiers::NONE) if c.is_ascii_digit() => {
                    if let Some(digit) = c.to_digit(10) {
                        self.push_digit(digit as usize);
                    }
                    UiEvent::None
                }
                (KeyCode::Right, KeyModifiers::NONE) => {
                    self.reset_count();
                    UiEvent::Input(InputEvent::Key(NavKey::Right))
                }
                (KeyCode::Left, KeyModifiers::NONE) => {
                    self.reset_count();
                    UiEvent::Input(InputEvent::Key(NavKey::Left))
                }
                (KeyCode::Char('j'), KeyModifiers::NONE)
                | (KeyCode::Char('l'), KeyModifiers::NONE)
                | (KeyCode::Char(' '), KeyModifiers::NONE)
                | (KeyCode::Down, KeyModifiers::NONE)
                | (KeyCode::PageDown, _) => {
                    let count = self.take_count();
                    UiEvent::Page {
                        direction: Direction::Next,
                        count,
                    }
                }
                (KeyCode::Char('k'), KeyModifiers::NONE)
                | (KeyCode::Char('h'), KeyModifiers::NONE)
                | (KeyCode::Up, KeyModifiers::NONE)
                | (KeyCode::PageUp, _) => {
                    let count = self.take_count();
                    UiEvent::Page {
                        direction: Direction::Prev,
                        count,
                    }
                }
                (KeyCode::Char('g'), KeyModifiers::NONE) | (KeyCode::Home, _) => {
                    if self.pending_digits.is_empty() {
                        UiEvent::GotoStart
                    } else {
                        let input = std::mem::take(&mut self.pending_digits);
                        self.pending_count = None;
                        UiEvent::GotoLocation { input }
                    }
                }
                (KeyCode::Char('G'), _) | (KeyCode::End, _) => {
                    self.reset_count();
                    UiEvent::GotoEnd
                }
                (KeyCode::Char(':'), _) => {
                    self.set_mode(InputMode::Location);
                    UiEvent::BeginLocationPrompt
                }
                (KeyCode::Char('/'), KeyModifiers::NONE) => {
                    self.set_mode(InputMode::Search);
                    UiEvent::BeginSearch
                }
                (KeyCode::Char('p'), KeyModifiers::NONE) => {
                    self.reset_count();
                    UiEvent::OpenPanels
                }
                (KeyCode::Char('q'), _) => {
                    self.reset_count();
                    UiEvent::Quit
                }
                _ => {
                    self.reset_count();
                    UiEvent::None
                }
            },
            Event::Mouse(mouse) => self.map_mouse(mouse),
            _ => UiEvent::None,
        }
    }

    /// A press and release on the same cell is a click; anything else is a
    /// drag reported as a swipe.
    fn map_mouse(&mut self, mouse: MouseEvent) -> UiEvent {
        let MouseEvent {
            kind, column, row, ..
        } = mouse;
        match kind {
            MouseEventKind::Down(MouseButton::Left) => {
                self.press = Some((column, row));
                UiEvent::None
            }
            MouseEventKind::Up(MouseButton::Left) => {
                let Some((start_column, start_row)) = self.press.take() else {
                    return UiEvent::None;
                };
                self.reset_count();
                let geometry = self.geometry;
                if (start_column, start_row) == (column, row) {
                    UiEvent::Input(InputEvent::Click {
                        x: (f32::from(column) + 0.5) * geometry.cell_width,
                        width: geometry.width(),
                        on_link: false,
                        has_selection: false,
                    })
                } else {
                    let dx = (f32::from(column) - f32::from(start_column)) * geometry.cell_width;
                    let dy = (f32::from(row) - f32::from(start_row)) * geometry.cell_height;
                    trace!(dx, dy, "mouse drag");
                    UiEvent::Input(InputEvent::Swipe {
                        dx,
                        dy,
                        width: geometry.width(),
                        height: geometry.height(),
                    })
                }
            }
            MouseEventKind::ScrollDown => UiEvent::Page {
                direction: Direction::Next,
                count: 1,
            },
            MouseEventKind::ScrollUp => UiEvent::Page {
                direction: Direction::Prev,
                count: 1,
            },
            _ => UiEvent::None,
        }
    }

    fn map_event_results(&mut self, event: Event) -> UiEvent {
        match event {
            Event::Key(KeyEvent {
                code, modifiers, ..
            }) => match (code, modifiers) {
                (KeyCode::Esc, _) | (KeyCode::Char('p'), _) => UiEvent::CloseOverlay,
                (KeyCode::Enter, _) => UiEvent::ResultsActivateSelection,
                (KeyCode::Char('j'), KeyModifiers::NONE) | (KeyCode::Down, KeyModifiers::NONE) => {
                    UiEvent::ResultsMoveSelection { delta: 1 }
                }
                (KeyCode::Char('k'), KeyModifiers::NONE) | (KeyCode::Up, KeyModifiers::NONE) => {
                    UiEvent::ResultsMoveSelection { delta: -1 }
                }
                (KeyCode::Char('q'), _) => UiEvent::Quit,
                _ => UiEvent::None,
            },
            _ => UiEvent::None,
        }
    }

    fn map_event_prompt(&mut self, event: Event) -> UiEvent {
        let searching = self.mode == InputMode::Search;
        match event {
            Event::Key(KeyEvent {
                code, modifiers, ..
            }) => match (code, modifiers) {
                (KeyCode::Esc, _) => {
                    self.set_mode(InputMode::Normal);
                    UiEvent::PromptCancel
                }
                (KeyCode::Enter, _) => {
                    let input = std::mem::take(&mut self.prompt);
                    self.set_mode(InputMode::Normal);
                    if searching {
                        UiEvent::SearchSubmit { query: input }
                    } else {
                        UiEvent::GotoLocation { input }
                    }
                }
                (KeyCode::Backspace, _) => {
                    self.prompt.pop();
                    UiEvent::PromptChanged {
                        input: self.prompt.clone(),
                    }
                }
                (KeyCode::Char(c), mods) if mods.is_empty() || mods == KeyModifiers::SHIFT => {
                    self.prompt.push(c);
                    UiEvent::PromptChanged {
                        input: self.prompt.clone(),
                    }
                }
                _ => UiEvent::None,
            },
            _ => UiEvent::None,
        }
    }

    fn push_digit(&mut self, digit: usize) {
        let current = self.pending_count.unwrap_or(0);
        let next = current.saturating_mul(10).saturating_add(digit);
        self.pending_count = Some(next);
        if let Some(c) = char::from_digit(digit as u32, 10) {
            self.pending_digits.push(c);
        }
    }

    fn take_count(&mut self) -> usize {
        let count = self
            .pending_count
            .take()
            .filter(|&count| count > 0)
            .unwrap_or(1);
        self.pending_digits.clear();
        count
    }

    fn reset_count(&mut self) {
        self.pending_count = None;
        self.pending_digits.clear();
    }

    pub fn pending_input(&self) -> Option<String> {
        match self.mode {
            InputMode::Search => Some(format!("/{}", self.prompt)),
            InputMode::Location => Some(format!(":{}", self.prompt)),
            _ if !self.pending_digits.is_empty() => Some(self.pending_digits.clone()),
            _ => None,
        }
    }
}
