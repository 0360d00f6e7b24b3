//! One open document and everything the reader does with it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, error, info, instrument, warn};

use crate::cfi::Cfi;
use crate::config::{PanelConfig, ReaderConfig};
use crate::engine::{
    DocumentHandle, DocumentInfo, DocumentProvider, DocumentSource, Renderer, RendererEvent,
    Viewport,
};
use crate::error::{ReaderError, Result};
use crate::events::{EventBus, Subscription};
use crate::identity::DocumentIdentity;
use crate::locations::{LocationIndex, Locations, SectionMarker};
use crate::navigation::{
    parse_location_input, Direction, InputEvent, InputOutcome, NavTarget, NavigationController,
};
use crate::position::PositionTracker;
use crate::search::{present, ResultEntry, SearchAggregator, SearchResult};
use crate::store::KeyValueStore;

/// Where the reader is, with the progress derived from the location index
/// when it is available.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PositionUpdate {
    pub cfi: Cfi,
    pub percentage: Option<f32>,
    pub location: Option<usize>,
}

impl PositionUpdate {
    fn derive(cfi: Cfi, index: Option<&LocationIndex>) -> Self {
        let (percentage, location) = match index {
            Some(index) => (
                index.percentage_from_cfi(&cfi).ok(),
                index.location_from_cfi(&cfi).ok(),
            ),
            None => (None, None),
        };
        Self {
            cfi,
            percentage,
            location,
        }
    }
}

#[derive(Debug, Clone)]
pub enum ReaderEvent {
    Relocated(PositionUpdate),
    LocationsReady { length: usize },
    DisplayError(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Navigate {
    Next,
    Prev,
    To(NavTarget),
    /// An external link carrying an `epubcfi(...)` address.
    Address(String),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PanelResults {
    pub panel_id: String,
    pub entries: Vec<ResultEntry>,
}

/// The state of one open document.
///
/// Opening restores the stored position before anything else can navigate.
/// Closing releases every event handler the session installed.
pub struct ReaderSession {
    document: Arc<dyn DocumentHandle>,
    renderer: Arc<dyn Renderer>,
    config: ReaderConfig,
    locations: Arc<Locations>,
    position: Arc<PositionTracker>,
    navigation: Arc<NavigationController>,
    search: SearchAggregator,
    events: EventBus<ReaderEvent>,
    subscriptions: Mutex<Vec<Subscription>>,
    closed: AtomicBool,
}

impl ReaderSession {
    #[instrument(skip_all)]
    pub async fn open(
        provider: &dyn DocumentProvider,
        source: DocumentSource,
        store: Arc<dyn KeyValueStore>,
        config: ReaderConfig,
    ) -> Result<Self> {
        let kind = source.sniff()?;
        debug!(?kind, "classified document source");
        let document = provider.open(&source).await.map_err(|err| {
            error!(%err, "failed to open document");
            ReaderError::FatalDocument(format!("{err:#}"))
        })?;
        let identity = document.info().id;
        let renderer = document.renderer();

        let locations = Arc::new(Locations::new(
            identity,
            config.locations.chunk_size,
            Arc::clone(&store),
        ));
        if let Some(index) = locations.restore_cached() {
            info!(locations = index.len(), "using cached locations");
        }
        let position = Arc::new(PositionTracker::new(identity, store));
        let navigation = Arc::new(NavigationController::new(
            Arc::clone(&renderer),
            config.navigation.clone(),
        ));
        let events = EventBus::new();

        let subscription = {
            let position = Arc::clone(&position);
            let navigation = Arc::clone(&navigation);
            let locations = Arc::clone(&locations);
            let events = events.clone();
            renderer.events().subscribe(move |event| match event {
                RendererEvent::Relocated(relocation) => {
                    position.record(relocation);
                    navigation.on_relocated(relocation);
                    let index = locations.current();
                    events.emit(&ReaderEvent::Relocated(PositionUpdate::derive(
                        relocation.start.clone(),
                        index.as_deref(),
                    )));
                }
                RendererEvent::DisplayError(message) => {
                    warn!(%message, "renderer reported a display error");
                    events.emit(&ReaderEvent::DisplayError(message.clone()));
                }
            })
        };

        let session = Self {
            document,
            renderer,
            search: SearchAggregator::from_config(&config.search),
            config,
            locations,
            position,
            navigation,
            events,
            subscriptions: Mutex::new(vec![subscription]),
            closed: AtomicBool::new(false),
        };

        if let Err(err) = session.position.restore(session.renderer.as_ref()).await {
            error!(%err, "document start could not be displayed");
            return Err(ReaderError::FatalDocument(format!("{err:#}")));
        }
        info!(document = %identity, "document opened");
        Ok(session)
    }

    pub fn identity(&self) -> DocumentIdentity {
        self.document.info().id
    }

    pub fn info(&self) -> &DocumentInfo {
        self.document.info()
    }

    pub fn config(&self) -> &ReaderConfig {
        &self.config
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(ReaderError::DocumentClosed)
        } else {
            Ok(())
        }
    }

    pub fn subscribe<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&ReaderEvent) + Send + Sync + 'static,
    {
        self.events.subscribe(handler)
    }

    /// The location index if it is ready. Callers that need it wait on
    /// [`ReaderSession::ensure_locations`].
    pub fn location_index(&self) -> Option<Arc<LocationIndex>> {
        self.locations.current()
    }

    pub fn locations(&self) -> &Locations {
        &self.locations
    }

    /// Generates the location index if needed and refreshes the reported
    /// progress once it is ready.
    pub async fn ensure_locations(&self) -> Result<Arc<LocationIndex>> {
        self.ensure_open()?;
        let index = self.locations.ensure(&self.document.spine()).await?;
        self.events.emit(&ReaderEvent::LocationsReady { length: index.len() });
        if let Some(update) = self.current_position() {
            self.events.emit(&ReaderEvent::Relocated(update));
        }
        Ok(index)
    }

    pub fn current_position(&self) -> Option<PositionUpdate> {
        let cfi = self.navigation.current_cfi()?;
        let index = self.locations.current();
        Some(PositionUpdate::derive(cfi, index.as_deref()))
    }

    pub fn section_markers(&self) -> Vec<SectionMarker> {
        self.locations
            .current()
            .map(|index| index.section_markers())
            .unwrap_or_default()
    }

    pub async fn navigate(&self, request: Navigate) -> Result<()> {
        self.ensure_open()?;
        match request {
            Navigate::Next => self.navigation.next().await,
            Navigate::Prev => self.navigation.prev().await,
            Navigate::To(target) => {
                let index = self.locations.current();
                self.navigation.display_at(target, index.as_deref()).await
            }
            Navigate::Address(href) => {
                let outcome = self.navigation.open_address(&href).await;
                if let Err(err) = &outcome {
                    warn!(%href, %err, "could not open address");
                }
                outcome
            }
        }
    }

    pub async fn step(&self, direction: Direction) -> Result<()> {
        self.ensure_open()?;
        self.navigation.step(direction).await
    }

    /// Jumps to a location typed by the user. Blank input does nothing.
    pub async fn go_to_location_input(&self, input: &str) -> Result<()> {
        self.ensure_open()?;
        let index = self.locations.current().ok_or(ReaderError::IndexUnavailable)?;
        let location = parse_location_input(input, index.len())
            .map_err(|err| ReaderError::Navigation(err.into()))?;
        match location {
            Some(location) => {
                self.navigation
                    .display_at(NavTarget::Location(location), Some(&index))
                    .await
            }
            None => Ok(()),
        }
    }

    pub async fn handle_input(&self, event: InputEvent) -> Result<InputOutcome> {
        self.ensure_open()?;
        self.navigation.handle_input(event).await
    }

    pub async fn resize(&self, viewport: Viewport) -> Result<()> {
        self.ensure_open()?;
        self.navigation.resize(viewport).await
    }

    pub fn visible_text(&self) -> Option<String> {
        self.renderer.visible_text()
    }

    /// Every hit for `query`, in reading order.
    pub async fn search(&self, query: &str) -> Result<Vec<SearchResult>> {
        self.ensure_open()?;
        self.search.search(&self.document.spine(), query).await
    }

    /// The first results for the sidebar, with their progress.
    pub async fn search_sidebar(&self, query: &str) -> Result<Vec<ResultEntry>> {
        let results = self.search(query).await?;
        let index = self.locations.current();
        Ok(present(results, index.as_deref(), self.config.search.result_limit))
    }

    /// Runs a panel's fixed query and keeps its first few results.
    pub async fn search_panel(&self, panel_id: &str, query: &str) -> Result<PanelResults> {
        let results = self.search(query).await?;
        let index = self.locations.current();
        Ok(PanelResults {
            panel_id: panel_id.to_owned(),
            entries: present(results, index.as_deref(), self.config.search.panel_limit),
        })
    }

    /// Runs every configured panel, in configuration order.
    pub async fn search_panels(&self) -> Result<Vec<PanelResults>> {
        let panels: Vec<PanelConfig> = self.config.panels.clone();
        let mut all = Vec::with_capacity(panels.len());
        for panel in panels {
            all.push(self.search_panel(&panel.id, &panel.query).await?);
        }
        Ok(all)
    }

    /// Releases the renderer subscriptions. Further operations fail with
    /// [`ReaderError::DocumentClosed`].
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let subscriptions: Vec<Subscription> = self.subscriptions.lock().drain(..).collect();
        for subscription in subscriptions {
            subscription.unsubscribe();
        }
        info!(document = %self.identity(), "document closed");
    }
}

impl Drop for ReaderSession {
    fn drop(&mut self) {
        self.close();
    }
}
