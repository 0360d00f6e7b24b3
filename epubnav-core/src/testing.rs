//! Scripted engine doubles shared by the unit tests.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::cfi::{Cfi, Step};
use crate::engine::{
    find_in_content, DisplayTarget, DocumentHandle, DocumentInfo, DocumentMetadata,
    DocumentProvider, DocumentSource, Relocation, Renderer, RendererEvent, Section,
    SectionContent, SectionMatch, TextNode, Viewport,
};
use crate::events::EventBus;
use crate::identity::DocumentIdentity;

/// One paragraph per entry, laid out as `/4/{2k+2}/1` like an XHTML body.
pub(crate) fn paragraphs(texts: &[&str]) -> SectionContent {
    SectionContent {
        nodes: texts
            .iter()
            .enumerate()
            .map(|(k, text)| TextNode {
                parent: vec![Step::new(4), Step::new(2 * (k as u32 + 1))],
                step: Step::new(1),
                text: (*text).to_owned(),
            })
            .collect(),
    }
}

enum Behaviour {
    Text(Arc<SectionContent>),
    Empty,
    Fail,
}

pub(crate) struct FakeSection {
    index: usize,
    href: String,
    behaviour: Behaviour,
    loaded: Mutex<Option<Arc<SectionContent>>>,
    loads: AtomicUsize,
    unloads: AtomicUsize,
    wait_for: Option<Arc<Notify>>,
    notify_after: Option<Arc<Notify>>,
    completions: Option<Arc<Mutex<Vec<usize>>>>,
}

impl FakeSection {
    fn new(index: usize, behaviour: Behaviour) -> Self {
        Self {
            index,
            href: format!("section{index}.xhtml"),
            behaviour,
            loaded: Mutex::new(None),
            loads: AtomicUsize::new(0),
            unloads: AtomicUsize::new(0),
            wait_for: None,
            notify_after: None,
            completions: None,
        }
    }

    pub fn text(index: usize, texts: &[&str]) -> Self {
        Self::new(index, Behaviour::Text(Arc::new(paragraphs(texts))))
    }

    pub fn with_text(index: usize, texts: &[&str]) -> Arc<Self> {
        Arc::new(Self::text(index, texts))
    }

    pub fn empty(index: usize) -> Arc<Self> {
        Arc::new(Self::new(index, Behaviour::Empty))
    }

    pub fn failing(index: usize) -> Arc<Self> {
        Arc::new(Self::new(index, Behaviour::Fail))
    }

    /// Load does not complete until `gate` is notified.
    pub fn waiting_for(mut self, gate: Arc<Notify>) -> Self {
        self.wait_for = Some(gate);
        self
    }

    /// Notifies `signal` once the load completed.
    pub fn notifying(mut self, signal: Arc<Notify>) -> Self {
        self.notify_after = Some(signal);
        self
    }

    /// Appends the section index to `log` when its load completes.
    pub fn logging_to(mut self, log: Arc<Mutex<Vec<usize>>>) -> Self {
        self.completions = Some(log);
        self
    }

    pub fn load_calls(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn unload_calls(&self) -> usize {
        self.unloads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Section for FakeSection {
    fn index(&self) -> usize {
        self.index
    }

    fn href(&self) -> &str {
        &self.href
    }

    fn is_loaded(&self) -> bool {
        self.loaded.lock().is_some()
    }

    async fn load(&self) -> Result<Option<Arc<SectionContent>>> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.wait_for {
            gate.notified().await;
        }
        let outcome = match &self.behaviour {
            Behaviour::Text(content) => {
                *self.loaded.lock() = Some(Arc::clone(content));
                Ok(Some(Arc::clone(content)))
            }
            Behaviour::Empty => Ok(None),
            Behaviour::Fail => Err(anyhow!("corrupt section {}", self.index)),
        };
        if let Some(log) = &self.completions {
            log.lock().push(self.index);
        }
        if let Some(signal) = &self.notify_after {
            signal.notify_one();
        }
        outcome
    }

    fn unload(&self) {
        self.unloads.fetch_add(1, Ordering::SeqCst);
        *self.loaded.lock() = None;
    }

    fn find(&self, query: &str) -> Result<Vec<SectionMatch>> {
        let loaded = self.loaded.lock();
        let Some(content) = loaded.as_ref() else {
            bail!("section {} is not loaded", self.index);
        };
        Ok(find_in_content(self.index, content, query, 150))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum RendererCall {
    Display(DisplayTarget),
    Next,
    Prev,
    Resize(Viewport),
}

pub(crate) struct RecordingRenderer {
    events: EventBus<RendererEvent>,
    calls: Mutex<Vec<RendererCall>>,
    seq: AtomicU64,
    position: Mutex<Option<Cfi>>,
    unresolvable: Mutex<Vec<Cfi>>,
    gate: Mutex<Option<Arc<Notify>>>,
}

impl RecordingRenderer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            events: EventBus::new(),
            calls: Mutex::new(Vec::new()),
            seq: AtomicU64::new(0),
            position: Mutex::new(None),
            unresolvable: Mutex::new(Vec::new()),
            gate: Mutex::new(None),
        })
    }

    pub fn calls(&self) -> Vec<RendererCall> {
        self.calls.lock().clone()
    }

    pub fn reject(&self, cfi: Cfi) {
        self.unresolvable.lock().push(cfi);
    }

    /// Every following request waits for `gate` before completing.
    pub fn hold(&self, gate: Arc<Notify>) {
        *self.gate.lock() = Some(gate);
    }

    pub fn release(&self) {
        *self.gate.lock() = None;
    }

    pub fn position(&self) -> Option<Cfi> {
        self.position.lock().clone()
    }

    async fn wait_gate(&self) {
        let gate = self.gate.lock().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
    }

    fn relocate(&self, start: Cfi) {
        *self.position.lock() = Some(start.clone());
        let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        self.events.emit(&RendererEvent::Relocated(Relocation {
            seq,
            start,
            end: None,
        }));
    }

    fn step(&self, delta: i64) -> Cfi {
        let current = self.position().unwrap_or_else(|| Cfi::section_start(0));
        let offset = i64::from(current.offset().unwrap_or(0)) + delta;
        Cfi::point(
            current.spine_index(),
            vec![Step::new(4), Step::new(2), Step::new(1)],
            Some(offset.max(0) as u32),
        )
    }
}

#[async_trait]
impl Renderer for RecordingRenderer {
    async fn display(&self, target: &DisplayTarget) -> Result<()> {
        self.calls.lock().push(RendererCall::Display(target.clone()));
        self.wait_gate().await;
        let start = match target {
            DisplayTarget::Start | DisplayTarget::Href(_) => Cfi::section_start(0),
            DisplayTarget::Cfi(cfi) => {
                if self.unresolvable.lock().iter().any(|bad| bad == cfi) {
                    bail!("cannot resolve {cfi}");
                }
                cfi.clone()
            }
        };
        self.relocate(start);
        Ok(())
    }

    async fn next(&self) -> Result<()> {
        self.calls.lock().push(RendererCall::Next);
        self.wait_gate().await;
        let next = self.step(100);
        self.relocate(next);
        Ok(())
    }

    async fn prev(&self) -> Result<()> {
        self.calls.lock().push(RendererCall::Prev);
        self.wait_gate().await;
        let prev = self.step(-100);
        self.relocate(prev);
        Ok(())
    }

    async fn resize(&self, viewport: Viewport) -> Result<()> {
        self.calls.lock().push(RendererCall::Resize(viewport));
        if let Some(current) = self.position() {
            self.relocate(current);
        }
        Ok(())
    }

    fn events(&self) -> &EventBus<RendererEvent> {
        &self.events
    }

    fn visible_text(&self) -> Option<String> {
        self.position().map(|cfi| cfi.to_string())
    }
}

pub(crate) struct FakeDocument {
    info: DocumentInfo,
    sections: Vec<Arc<FakeSection>>,
    renderer: Arc<RecordingRenderer>,
}

impl FakeDocument {
    pub fn new(id: DocumentIdentity, sections: Vec<Arc<FakeSection>>) -> Arc<Self> {
        Arc::new(Self {
            info: DocumentInfo {
                id,
                metadata: DocumentMetadata::default(),
            },
            sections,
            renderer: RecordingRenderer::new(),
        })
    }

    pub fn sections(&self) -> &[Arc<FakeSection>] {
        &self.sections
    }

    pub fn recording_renderer(&self) -> Arc<RecordingRenderer> {
        Arc::clone(&self.renderer)
    }
}

impl DocumentHandle for FakeDocument {
    fn info(&self) -> &DocumentInfo {
        &self.info
    }

    fn spine(&self) -> Vec<Arc<dyn Section>> {
        self.sections
            .iter()
            .map(|section| Arc::clone(section) as Arc<dyn Section>)
            .collect()
    }

    fn renderer(&self) -> Arc<dyn Renderer> {
        Arc::clone(&self.renderer) as Arc<dyn Renderer>
    }
}

/// Hands out one prepared document, whatever the source.
pub(crate) struct FakeProvider {
    document: Arc<FakeDocument>,
}

impl FakeProvider {
    pub fn new(document: Arc<FakeDocument>) -> Self {
        Self { document }
    }
}

#[async_trait]
impl DocumentProvider for FakeProvider {
    async fn open(&self, _source: &DocumentSource) -> Result<Arc<dyn DocumentHandle>> {
        Ok(Arc::clone(&self.document) as Arc<dyn DocumentHandle>)
    }
}

/// Provider whose documents never open.
pub(crate) struct BrokenProvider;

#[async_trait]
impl DocumentProvider for BrokenProvider {
    async fn open(&self, source: &DocumentSource) -> Result<Arc<dyn DocumentHandle>> {
        bail!("cannot decode {:?}", source)
    }
}

/// A sequence of `count` strictly increasing addresses in section 0.
pub(crate) fn ascending_cfis(count: usize) -> Vec<Cfi> {
    (0..count)
        .map(|i| {
            Cfi::point(
                0,
                vec![Step::new(4), Step::new(2), Step::new(1)],
                Some(i as u32 * 10),
            )
        })
        .collect()
}
