//! Turning user input into renderer moves.

use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, instrument, warn};

use crate::cfi::{address_from_href, Cfi};
use crate::config::NavigationConfig;
use crate::engine::{DisplayTarget, Relocation, Renderer, Viewport};
use crate::error::{ReaderError, Result};
use crate::locations::LocationIndex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Next,
    Prev,
}

/// Where a jump should land.
#[derive(Debug, Clone, PartialEq)]
pub enum NavTarget {
    Cfi(Cfi),
    Location(usize),
    Percentage(f32),
    Href(String),
}

#[derive(Debug, Clone, PartialEq)]
enum NavRequest {
    Step(Direction),
    Display(DisplayTarget),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NavKey {
    Left,
    Right,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum InputEvent {
    Key(NavKey),
    /// A click at `x` pixels from the left edge of content `width` pixels
    /// wide.
    Click {
        x: f32,
        width: f32,
        on_link: bool,
        has_selection: bool,
    },
    /// A drag of `dx`/`dy` pixels over a `width` by `height` viewport.
    Swipe {
        dx: f32,
        dy: f32,
        width: f32,
        height: f32,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClickAction {
    Page(Direction),
    OpenPanel,
    Ignore,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputOutcome {
    Paged(Direction),
    OpenPanel,
    Ignored,
}

/// Classifies a drag by its travel relative to the viewport. Dragging right
/// goes back, dragging left goes forward.
pub fn classify_swipe(hr: f32, vr: f32, threshold: f32) -> Option<Direction> {
    if hr > vr && hr > threshold {
        Some(Direction::Prev)
    } else if hr < vr && hr < -threshold {
        Some(Direction::Next)
    } else {
        None
    }
}

/// Left third goes back, right third goes forward and the `margin` pixels
/// along the right edge open the side panel. Clicks on links or while text
/// is selected never page.
pub fn classify_click(
    x: f32,
    width: f32,
    margin: f32,
    on_link: bool,
    has_selection: bool,
) -> ClickAction {
    if on_link || has_selection || width <= 0.0 {
        return ClickAction::Ignore;
    }
    let third = width / 3.0;
    if x > width - margin {
        ClickAction::OpenPanel
    } else if x < third {
        ClickAction::Page(Direction::Prev)
    } else if x > third * 2.0 {
        ClickAction::Page(Direction::Next)
    } else {
        ClickAction::Ignore
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LocationInputError {
    #[error("invalid location: not a positive integer")]
    NotAnInteger,
    #[error("invalid location")]
    OutOfRange,
}

/// Parses a typed location. Blank input means "do nothing".
pub fn parse_location_input(
    input: &str,
    length: usize,
) -> std::result::Result<Option<usize>, LocationInputError> {
    let input = input.trim();
    if input.is_empty() {
        return Ok(None);
    }
    let location: usize = input.parse().map_err(|_| LocationInputError::NotAnInteger)?;
    if location >= length {
        return Err(LocationInputError::OutOfRange);
    }
    Ok(Some(location))
}

#[derive(Debug, Default)]
struct NavState {
    current_cfi: Option<Cfi>,
    last_seq: Option<u64>,
    pending: bool,
    queued: Option<(NavRequest, oneshot::Sender<Result<()>>)>,
}

/// Issues moves against the renderer one at a time.
///
/// While a move is in flight further requests are coalesced: only the most
/// recent one is kept and runs once the current move settles, and its caller
/// gets that move's outcome. Superseded callers return `Ok(())`. The current
/// position only ever changes from relocation reports.
pub struct NavigationController {
    renderer: Arc<dyn Renderer>,
    config: NavigationConfig,
    state: Mutex<NavState>,
}

/// Releases the controller when the driving future is dropped mid-move.
/// Dropping the queued sender wakes its caller, which then drives the move
/// itself.
struct PendingGuard<'a> {
    state: &'a Mutex<NavState>,
    armed: bool,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut state = self.state.lock();
        state.pending = false;
        state.queued = None;
    }
}

impl NavigationController {
    pub fn new(renderer: Arc<dyn Renderer>, config: NavigationConfig) -> Self {
        Self {
            renderer,
            config,
            state: Mutex::new(NavState::default()),
        }
    }

    pub fn current_cfi(&self) -> Option<Cfi> {
        self.state.lock().current_cfi.clone()
    }

    pub fn is_pending(&self) -> bool {
        self.state.lock().pending
    }

    /// Adopts the position the renderer reports, ignoring stale reports.
    pub fn on_relocated(&self, relocation: &Relocation) {
        let mut state = self.state.lock();
        if matches!(state.last_seq, Some(seen) if relocation.seq < seen) {
            return;
        }
        state.last_seq = Some(relocation.seq);
        state.current_cfi = Some(relocation.start.clone());
    }

    pub async fn next(&self) -> Result<()> {
        self.submit(NavRequest::Step(Direction::Next)).await
    }

    pub async fn prev(&self) -> Result<()> {
        self.submit(NavRequest::Step(Direction::Prev)).await
    }

    pub async fn step(&self, direction: Direction) -> Result<()> {
        self.submit(NavRequest::Step(direction)).await
    }

    /// Jumps to `target`. Location and percentage targets need the location
    /// index.
    #[instrument(skip(self, index))]
    pub async fn display_at(&self, target: NavTarget, index: Option<&LocationIndex>) -> Result<()> {
        let display = match target {
            NavTarget::Cfi(cfi) => DisplayTarget::Cfi(cfi),
            NavTarget::Href(href) => DisplayTarget::Href(href),
            NavTarget::Location(location) => {
                let index = index.ok_or(ReaderError::IndexUnavailable)?;
                DisplayTarget::Cfi(index.cfi_from_location(location)?.clone())
            }
            NavTarget::Percentage(percentage) => {
                let index = index.ok_or(ReaderError::IndexUnavailable)?;
                DisplayTarget::Cfi(index.cfi_from_percentage(percentage)?.clone())
            }
        };
        self.submit(NavRequest::Display(display)).await
    }

    /// Displays the address embedded in an external `epubcfi(...)` link.
    pub async fn open_address(&self, href: &str) -> Result<()> {
        let address = address_from_href(href)?;
        let cfi = Cfi::parse(address)?;
        debug!(%cfi, "opening external address");
        self.submit(NavRequest::Display(DisplayTarget::Cfi(cfi))).await
    }

    /// Resizes the viewport. The renderer keeps the current address and
    /// reports it again once the content is re-laid out.
    pub async fn resize(&self, viewport: Viewport) -> Result<()> {
        self.renderer.resize(viewport).await.map_err(ReaderError::Navigation)
    }

    pub async fn handle_input(&self, event: InputEvent) -> Result<InputOutcome> {
        let direction = match event {
            InputEvent::Key(NavKey::Left) => Some(Direction::Prev),
            InputEvent::Key(NavKey::Right) => Some(Direction::Next),
            InputEvent::Click {
                x,
                width,
                on_link,
                has_selection,
            } => {
                let margin = self.config.panel_margin as f32;
                match classify_click(x, width, margin, on_link, has_selection) {
                    ClickAction::Page(direction) => Some(direction),
                    ClickAction::OpenPanel => return Ok(InputOutcome::OpenPanel),
                    ClickAction::Ignore => None,
                }
            }
            InputEvent::Swipe { dx, dy, width, height } => {
                if width <= 0.0 || height <= 0.0 {
                    None
                } else {
                    classify_swipe(dx / width, dy / height, self.config.swipe_threshold)
                }
            }
        };
        match direction {
            Some(direction) => {
                self.step(direction).await?;
                Ok(InputOutcome::Paged(direction))
            }
            None => Ok(InputOutcome::Ignored),
        }
    }

    async fn submit(&self, request: NavRequest) -> Result<()> {
        loop {
            let waiting = {
                let mut state = self.state.lock();
                if state.pending {
                    debug!(?request, "navigation in flight, queueing");
                    let (tx, rx) = oneshot::channel();
                    if let Some((superseded, waiter)) = state.queued.replace((request.clone(), tx))
                    {
                        debug!(request = ?superseded, "superseded by a newer move");
                        let _ = waiter.send(Ok(()));
                    }
                    Some(rx)
                } else {
                    state.pending = true;
                    None
                }
            };
            let Some(rx) = waiting else {
                break;
            };
            match rx.await {
                Ok(outcome) => return outcome,
                Err(_) => debug!(?request, "navigation driver went away, resubmitting"),
            }
        }
        self.drive(request).await
    }

    /// Runs `request`, then every move queued behind it, until the queue is
    /// empty. The in-flight flag is cleared under the same lock as the last
    /// empty check.
    async fn drive(&self, request: NavRequest) -> Result<()> {
        let mut guard = PendingGuard {
            state: &self.state,
            armed: true,
        };

        let outcome = self.run(&request).await;
        loop {
            let next = {
                let mut state = self.state.lock();
                let next = state.queued.take();
                if next.is_none() {
                    state.pending = false;
                }
                next
            };
            let Some((queued, waiter)) = next else {
                break;
            };
            let result = self.run(&queued).await;
            if let Err(err) = &result {
                warn!(request = ?queued, %err, "queued navigation failed");
            }
            let _ = waiter.send(result);
        }
        guard.armed = false;
        outcome
    }

    async fn run(&self, request: &NavRequest) -> Result<()> {
        let outcome = match request {
            NavRequest::Step(Direction::Next) => self.renderer.next().await,
            NavRequest::Step(Direction::Prev) => self.renderer.prev().await,
            NavRequest::Display(target) => self.renderer.display(target).await,
        };
        outcome.map_err(ReaderError::Navigation)
    }
}
