//! Seams to the document rendering engine.
//!
//! The engine owns container decoding, text layout and pagination. The core
//! only sees documents as an ordered spine of sections that can be loaded,
//! searched and unloaded, plus a renderer that can be asked to show a
//! position and that reports where it ended up.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::cfi::{Cfi, Step};
use crate::error::ReaderError;
use crate::events::EventBus;
use crate::identity::DocumentIdentity;

const ZIP_SIGNATURE: &[u8] = b"PK";

#[derive(Debug, Clone)]
pub enum DocumentSource {
    Path(PathBuf),
    Bytes { name: Option<String>, bytes: Vec<u8> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Directory,
    File,
    Container,
    PlainText,
}

impl DocumentSource {
    pub fn identity(&self) -> DocumentIdentity {
        match self {
            DocumentSource::Path(path) => DocumentIdentity::for_path(path),
            DocumentSource::Bytes { bytes, .. } => DocumentIdentity::for_bytes(bytes),
        }
    }

    /// Classifies the source before handing it to an engine.
    pub fn sniff(&self) -> Result<SourceKind, ReaderError> {
        match self {
            DocumentSource::Path(path) if path.is_dir() => Ok(SourceKind::Directory),
            DocumentSource::Path(path) if path.is_file() => Ok(SourceKind::File),
            DocumentSource::Path(path) => Err(ReaderError::FatalDocument(format!(
                "{} does not exist",
                path.display()
            ))),
            DocumentSource::Bytes { bytes, .. } if bytes.starts_with(ZIP_SIGNATURE) => {
                Ok(SourceKind::Container)
            }
            DocumentSource::Bytes { bytes, .. } if std::str::from_utf8(bytes).is_ok() => {
                Ok(SourceKind::PlainText)
            }
            DocumentSource::Bytes { .. } => Err(ReaderError::FatalDocument(
                "not a supported document".to_owned(),
            )),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub title: Option<String>,
    pub creator: Option<String>,
    pub description: Option<String>,
    pub series: Option<String>,
    pub series_index: Option<String>,
}

#[derive(Debug, Clone)]
pub struct DocumentInfo {
    pub id: DocumentIdentity,
    pub metadata: DocumentMetadata,
}

/// One text node of a loaded section. Its address is `parent` followed by
/// `step`; offsets into `text` count characters.
#[derive(Debug, Clone)]
pub struct TextNode {
    pub parent: Vec<Step>,
    pub step: Step,
    pub text: String,
}

impl TextNode {
    pub fn cfi_at(&self, spine_index: usize, offset: u32) -> Cfi {
        let mut steps = self.parent.clone();
        steps.push(self.step.clone());
        Cfi::point(spine_index, steps, Some(offset))
    }
}

#[derive(Debug, Clone, Default)]
pub struct SectionContent {
    pub nodes: Vec<TextNode>,
}

impl SectionContent {
    pub fn char_count(&self) -> usize {
        self.nodes.iter().map(|node| node.text.chars().count()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.iter().all(|node| node.text.trim().is_empty())
    }
}

#[derive(Debug, Clone)]
pub struct SectionMatch {
    pub cfi: Cfi,
    pub excerpt: String,
}

#[async_trait]
pub trait DocumentProvider: Send + Sync {
    async fn open(&self, source: &DocumentSource) -> Result<Arc<dyn DocumentHandle>>;
}

pub trait DocumentHandle: Send + Sync {
    fn info(&self) -> &DocumentInfo;
    /// Sections in reading order.
    fn spine(&self) -> Vec<Arc<dyn Section>>;
    fn renderer(&self) -> Arc<dyn Renderer>;
}

#[async_trait]
pub trait Section: Send + Sync {
    fn index(&self) -> usize;
    fn href(&self) -> &str;
    fn is_loaded(&self) -> bool;
    /// Loads the section. `Ok(None)` means the section has no content.
    async fn load(&self) -> Result<Option<Arc<SectionContent>>>;
    fn unload(&self);
    /// Matches `query` against the loaded content.
    fn find(&self, query: &str) -> Result<Vec<SectionMatch>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisplayTarget {
    Start,
    Cfi(Cfi),
    Href(String),
}

#[derive(Debug, Clone)]
pub struct Relocation {
    /// Monotonically increasing per renderer.
    pub seq: u64,
    pub start: Cfi,
    pub end: Option<Cfi>,
}

#[derive(Debug, Clone)]
pub enum RendererEvent {
    Relocated(Relocation),
    DisplayError(String),
}

#[async_trait]
pub trait Renderer: Send + Sync {
    async fn display(&self, target: &DisplayTarget) -> Result<()>;
    async fn next(&self) -> Result<()>;
    async fn prev(&self) -> Result<()>;
    /// Re-lays the content out for a new viewport, keeping the position.
    async fn resize(&self, viewport: Viewport) -> Result<()>;
    fn events(&self) -> &EventBus<RendererEvent>;
    fn visible_text(&self) -> Option<String>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectionState {
    Unloaded,
    Loading,
    Loaded,
    Unloading,
}

/// Exclusive use of a section for one pass. The section is unloaded when the
/// lease is dropped, whichever way the pass ended.
pub struct SectionLease {
    section: Arc<dyn Section>,
    state: SectionState,
}

impl SectionLease {
    pub fn acquire(section: Arc<dyn Section>) -> Self {
        if section.is_loaded() {
            debug!(
                section = section.index(),
                href = section.href(),
                "unloading stale section before reuse"
            );
            section.unload();
        }
        Self {
            section,
            state: SectionState::Unloaded,
        }
    }

    pub fn state(&self) -> SectionState {
        self.state
    }

    pub fn section(&self) -> &dyn Section {
        self.section.as_ref()
    }

    pub async fn load(&mut self) -> Result<Option<Arc<SectionContent>>, ReaderError> {
        self.transition(SectionState::Loading);
        let loaded = self
            .section
            .load()
            .await
            .map_err(|source| ReaderError::Load {
                section: self.section.index(),
                source,
            })?;
        self.transition(SectionState::Loaded);
        Ok(loaded)
    }

    fn transition(&mut self, next: SectionState) {
        trace!(section = self.section.index(), from = ?self.state, to = ?next, "section state");
        self.state = next;
    }
}

impl Drop for SectionLease {
    fn drop(&mut self) {
        if self.state == SectionState::Unloaded {
            return;
        }
        self.transition(SectionState::Unloading);
        self.section.unload();
        self.transition(SectionState::Unloaded);
    }
}

/// Case-insensitive substring search over loaded content.
///
/// Each hit becomes a range address over the matched characters and an
/// excerpt of at most `window` characters centred on the hit, prefixed with
/// `...` when it does not start at the beginning of the text node.
pub fn find_in_content(
    spine_index: usize,
    content: &SectionContent,
    query: &str,
    window: usize,
) -> Vec<SectionMatch> {
    let needle: Vec<char> = query.chars().map(fold_char).collect();
    if needle.is_empty() {
        return Vec::new();
    }
    let mut matches = Vec::new();
    for node in &content.nodes {
        let chars: Vec<char> = node.text.chars().collect();
        let folded: Vec<char> = chars.iter().copied().map(fold_char).collect();
        let mut pos = 0;
        while pos + needle.len() <= folded.len() {
            if folded[pos..pos + needle.len()] != needle[..] {
                pos += 1;
                continue;
            }
            let end = pos + needle.len();
            let cfi = Cfi::text_range(
                spine_index,
                node.parent.clone(),
                node.step.clone(),
                pos as u32,
                end as u32,
            );
            matches.push(SectionMatch {
                cfi,
                excerpt: excerpt_around(&chars, pos, end, window),
            });
            pos = end;
        }
    }
    matches
}

fn fold_char(c: char) -> char {
    c.to_lowercase().next().unwrap_or(c)
}

fn excerpt_around(chars: &[char], start: usize, end: usize, window: usize) -> String {
    let hit = end - start;
    let context = window.saturating_sub(hit) / 2;
    let from = start.saturating_sub(context);
    let to = (end + context).min(chars.len());
    let mut excerpt = String::new();
    if from > 0 {
        excerpt.push_str("...");
    }
    excerpt.extend(&chars[from..to]);
    if to < chars.len() {
        excerpt.push_str("...");
    }
    excerpt
}
