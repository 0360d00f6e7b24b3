//! Plain-text document engine.
//!
//! A document is a directory of `.txt`/`.md` files, one section each in file
//! name order, or a single text blob whose sections are separated by form
//! feeds. Paragraphs are separated by blank lines and are addressed like the
//! paragraphs of an XHTML body: the k-th paragraph of a section is the text
//! node `/4/{2k+2}/1`.

mod layout;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use epubnav_core::cfi::address_from_href;
use epubnav_core::engine::find_in_content;
use epubnav_core::{
    Cfi, DisplayTarget, DocumentHandle, DocumentInfo, DocumentMetadata,
    DocumentProvider, DocumentSource, EventBus, Relocation, Renderer, RendererEvent, Section,
    SectionContent, SectionMatch, SourceKind, Step, TextNode, Viewport,
};
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, instrument, trace, warn};

use layout::{paginate, paragraphs, Page};

const SECTION_SEPARATOR: char = '\x0c';
const SECTION_EXTENSIONS: &[&str] = &["txt", "text", "md", "markdown"];

pub const DEFAULT_VIEWPORT: Viewport = Viewport {
    width: 80,
    height: 24,
};

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("packaged containers are not supported by the text engine")]
    UnsupportedContainer,
    #[error("{0:?} contains no text sections")]
    NoSections(PathBuf),
    #[error("section {0} does not exist")]
    NoSuchSection(usize),
    #[error("no section matches {0:?}")]
    UnknownHref(String),
}

pub struct TextSpineProvider {
    excerpt_window: usize,
    viewport: Viewport,
}

impl Default for TextSpineProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl TextSpineProvider {
    pub fn new() -> Self {
        Self {
            excerpt_window: 150,
            viewport: DEFAULT_VIEWPORT,
        }
    }

    pub fn with_excerpt_window(mut self, excerpt_window: usize) -> Self {
        self.excerpt_window = excerpt_window;
        self
    }

    pub fn with_viewport(mut self, viewport: Viewport) -> Self {
        self.viewport = viewport;
        self
    }

    fn section(&self, index: usize, href: String, source: SectionSource) -> Arc<TextSection> {
        Arc::new(TextSection {
            index,
            href,
            source,
            loaded: Mutex::new(None),
            excerpt_window: self.excerpt_window,
        })
    }

    fn inline_sections(&self, text: &str) -> Vec<Arc<TextSection>> {
        text.split(SECTION_SEPARATOR)
            .enumerate()
            .map(|(index, part)| {
                self.section(
                    index,
                    format!("section-{}", index + 1),
                    SectionSource::Inline(Arc::from(part)),
                )
            })
            .collect()
    }

    async fn directory_sections(&self, root: &Path) -> Result<Vec<Arc<TextSection>>> {
        let mut entries = tokio::fs::read_dir(root)
            .await
            .with_context(|| format!("failed to list {:?}", root))?;
        let mut files = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .with_context(|| format!("failed to list {:?}", root))?
        {
            let path = entry.path();
            let is_text = path
                .extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| SECTION_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()));
            if is_text && path.is_file() {
                files.push(path);
            } else {
                trace!(path = %path.display(), "skipping non-section entry");
            }
        }
        if files.is_empty() {
            return Err(RenderError::NoSections(root.to_path_buf()).into());
        }
        files.sort();
        Ok(files
            .into_iter()
            .enumerate()
            .map(|(index, path)| {
                let href = path
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned())
                    .unwrap_or_else(|| format!("section-{}", index + 1));
                self.section(index, href, SectionSource::File(path))
            })
            .collect())
    }
}

#[async_trait]
impl DocumentProvider for TextSpineProvider {
    #[instrument(skip(self, source))]
    async fn open(&self, source: &DocumentSource) -> Result<Arc<dyn DocumentHandle>> {
        let kind = source.sniff()?;
        let (title, sections) = match (kind, source) {
            (SourceKind::Container, _) => return Err(RenderError::UnsupportedContainer.into()),
            (SourceKind::Directory, DocumentSource::Path(path)) => {
                (title_of(path), self.directory_sections(path).await?)
            }
            (SourceKind::File, DocumentSource::Path(path)) => {
                let bytes = tokio::fs::read(path)
                    .await
                    .with_context(|| format!("failed to read {:?}", path))?;
                if bytes.starts_with(b"PK") {
                    return Err(RenderError::UnsupportedContainer.into());
                }
                let text = String::from_utf8(bytes)
                    .with_context(|| format!("{:?} is not UTF-8 text", path))?;
                (title_of(path), self.inline_sections(&text))
            }
            (SourceKind::PlainText, DocumentSource::Bytes { name, bytes }) => {
                let text = std::str::from_utf8(bytes).context("document is not UTF-8 text")?;
                (name.clone(), self.inline_sections(text))
            }
            (kind, _) => bail!("cannot open a {:?} source", kind),
        };

        debug!(sections = sections.len(), ?title, "opened text document");
        let renderer = Arc::new(PagedRenderer::new(sections.clone(), self.viewport));
        Ok(Arc::new(TextDocument {
            info: DocumentInfo {
                id: source.identity(),
                metadata: DocumentMetadata {
                    title,
                    ..DocumentMetadata::default()
                },
            },
            sections,
            renderer,
        }))
    }
}

fn title_of(path: &Path) -> Option<String> {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
}

struct TextDocument {
    info: DocumentInfo,
    sections: Vec<Arc<TextSection>>,
    renderer: Arc<PagedRenderer>,
}

impl DocumentHandle for TextDocument {
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

#[derive(Debug)]
enum SectionSource {
    File(PathBuf),
    Inline(Arc<str>),
}

pub struct TextSection {
    index: usize,
    href: String,
    source: SectionSource,
    loaded: Mutex<Option<Arc<SectionContent>>>,
    excerpt_window: usize,
}

impl TextSection {
    /// Reads and parses the section without touching its load state.
    async fn read_content(&self) -> Result<Option<Arc<SectionContent>>> {
        let text = match &self.source {
            SectionSource::File(path) => tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("failed to read section {:?}", path))?,
            SectionSource::Inline(text) => text.to_string(),
        };
        let content = SectionContent {
            nodes: paragraphs(&text)
                .into_iter()
                .enumerate()
                .map(|(k, text)| TextNode {
                    parent: vec![Step::new(4), Step::new(2 * (k as u32 + 1))],
                    step: Step::new(1),
                    text,
                })
                .collect(),
        };
        if content.is_empty() {
            return Ok(None);
        }
        Ok(Some(Arc::new(content)))
    }
}

#[async_trait]
impl Section for TextSection {
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
        let content = self.read_content().await?;
        *self.loaded.lock() = content.clone();
        Ok(content)
    }

    fn unload(&self) {
        *self.loaded.lock() = None;
    }

    fn find(&self, query: &str) -> Result<Vec<SectionMatch>> {
        let loaded = self.loaded.lock();
        let content = loaded
            .as_ref()
            .ok_or_else(|| anyhow!("section {} is not loaded", self.index))?;
        Ok(find_in_content(self.index, content, query, self.excerpt_window))
    }
}

struct Laid {
    section: usize,
    content: Arc<SectionContent>,
    pages: Vec<Page>,
    page: usize,
}

struct ViewState {
    viewport: Viewport,
    /// Address the view is pinned to across re-layouts.
    anchor: Option<Cfi>,
    current: Option<Laid>,
}

/// Paginates sections into fixed-size character pages and reports every move
/// as a relocation.
pub struct PagedRenderer {
    sections: Vec<Arc<TextSection>>,
    events: EventBus<RendererEvent>,
    seq: AtomicU64,
    state: Mutex<ViewState>,
}

impl PagedRenderer {
    fn new(sections: Vec<Arc<TextSection>>, viewport: Viewport) -> Self {
        Self {
            sections,
            events: EventBus::new(),
            seq: AtomicU64::new(0),
            state: Mutex::new(ViewState {
                viewport,
                anchor: None,
                current: None,
            }),
        }
    }

    fn viewport(&self) -> Viewport {
        self.state.lock().viewport
    }

    async fn content_of(&self, section: usize) -> Result<Arc<SectionContent>> {
        let source = self
            .sections
            .get(section)
            .ok_or(RenderError::NoSuchSection(section))?;
        Ok(source.read_content().await?.unwrap_or_default())
    }

    fn resolve(&self, target: &DisplayTarget) -> Result<(usize, Option<Cfi>)> {
        match target {
            DisplayTarget::Start => Ok((0, None)),
            DisplayTarget::Cfi(cfi) => Ok((cfi.spine_index(), Some(cfi.clone()))),
            DisplayTarget::Href(href) => {
                if let Ok(address) = address_from_href(href) {
                    let cfi = Cfi::parse(address)?;
                    return Ok((cfi.spine_index(), Some(cfi)));
                }
                let file = href.split('#').next().unwrap_or(href);
                self.sections
                    .iter()
                    .position(|section| section.href == file)
                    .map(|section| (section, None))
                    .ok_or_else(|| RenderError::UnknownHref(href.clone()).into())
            }
        }
    }

    async fn show(&self, target: &DisplayTarget) -> Result<()> {
        let (section, cfi) = self.resolve(target)?;
        let content = self.content_of(section).await?;
        let pages = paginate(&content, self.viewport());
        let page = match &cfi {
            Some(cfi) => layout::page_of(&pages, section, &content.nodes, cfi),
            None => 0,
        };
        self.commit(
            Laid {
                section,
                content,
                pages,
                page,
            },
            cfi,
        );
        Ok(())
    }

    /// Installs a new view and reports it. The lock is released before the
    /// relocation is emitted so handlers can query the renderer.
    fn commit(&self, laid: Laid, anchor: Option<Cfi>) {
        let relocation = {
            let mut state = self.state.lock();
            let page = &laid.pages[laid.page];
            let start = page.start_cfi(laid.section, &laid.content.nodes);
            let end = page.end_cfi(laid.section, &laid.content.nodes);
            state.anchor = Some(anchor.unwrap_or_else(|| start.clone()));
            state.current = Some(laid);
            Relocation {
                seq: self.seq.fetch_add(1, Ordering::SeqCst) + 1,
                start,
                end,
            }
        };
        trace!(seq = relocation.seq, start = %relocation.start, "relocated");
        self.events.emit(&RendererEvent::Relocated(relocation));
    }

    fn turn_within_section(&self, forward: bool) -> Option<bool> {
        let mut state = self.state.lock();
        let laid = state.current.as_mut()?;
        let moved = if forward && laid.page + 1 < laid.pages.len() {
            laid.page += 1;
            true
        } else if !forward && laid.page > 0 {
            laid.page -= 1;
            true
        } else {
            false
        };
        Some(moved)
    }

    fn recommit_current(&self) {
        let laid = {
            let mut state = self.state.lock();
            state.current.take()
        };
        if let Some(laid) = laid {
            self.commit(laid, None);
        }
    }

    async fn turn(&self, forward: bool) -> Result<()> {
        match self.turn_within_section(forward) {
            None => return self.show(&DisplayTarget::Start).await,
            Some(true) => {
                self.recommit_current();
                return Ok(());
            }
            Some(false) => {}
        }

        let Some(current) = self.state.lock().current.as_ref().map(|laid| laid.section) else {
            return Ok(());
        };
        let candidates: Vec<usize> = if forward {
            (current + 1..self.sections.len()).collect()
        } else {
            (0..current).rev().collect()
        };
        for section in candidates {
            let content = self.content_of(section).await?;
            if content.is_empty() {
                continue;
            }
            let pages = paginate(&content, self.viewport());
            let page = if forward { 0 } else { pages.len() - 1 };
            self.commit(
                Laid {
                    section,
                    content,
                    pages,
                    page,
                },
                None,
            );
            return Ok(());
        }
        debug!(forward, "no further page");
        Ok(())
    }
}

#[async_trait]
impl Renderer for PagedRenderer {
    async fn display(&self, target: &DisplayTarget) -> Result<()> {
        if let Err(err) = self.show(target).await {
            warn!(?target, %err, "display failed");
            self.events
                .emit(&RendererEvent::DisplayError(format!("{err:#}")));
            return Err(err);
        }
        Ok(())
    }

    async fn next(&self) -> Result<()> {
        self.turn(true).await
    }

    async fn prev(&self) -> Result<()> {
        self.turn(false).await
    }

    async fn resize(&self, viewport: Viewport) -> Result<()> {
        let anchor = {
            let mut state = self.state.lock();
            state.viewport = viewport;
            state.anchor.clone()
        };
        debug!(width = viewport.width, height = viewport.height, "relayout");
        match anchor {
            Some(anchor) => self.show(&DisplayTarget::Cfi(anchor)).await,
            None => Ok(()),
        }
    }

    fn events(&self) -> &EventBus<RendererEvent> {
        &self.events
    }

    fn visible_text(&self) -> Option<String> {
        let state = self.state.lock();
        let laid = state.current.as_ref()?;
        Some(laid.pages[laid.page].text())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use epubnav_core::{MemoryStore, Navigate, ReaderConfig, ReaderError, ReaderSession};
    use tempfile::tempdir;

    fn bytes(text: &str) -> DocumentSource {
        DocumentSource::Bytes {
            name: Some("inline".to_owned()),
            bytes: text.as_bytes().to_vec(),
        }
    }

    fn collect_relocations(
        renderer: &Arc<dyn Renderer>,
    ) -> (Arc<Mutex<Vec<Relocation>>>, epubnav_core::Subscription) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let subscription = renderer.events().subscribe(move |event| {
            if let RendererEvent::Relocated(relocation) = event {
                sink.lock().push(relocation.clone());
            }
        });
        (seen, subscription)
    }

    #[tokio::test]
    async fn directory_sections_follow_file_names() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("02-body.md"), "Body text.\n\nMore body.").unwrap();
        std::fs::write(dir.path().join("01-intro.txt"), "Intro.").unwrap();
        std::fs::write(dir.path().join("cover.png"), [0u8, 1, 2]).unwrap();

        let document = TextSpineProvider::new()
            .open(&DocumentSource::Path(dir.path().to_path_buf()))
            .await
            .unwrap();
        let spine = document.spine();
        let hrefs: Vec<&str> = spine.iter().map(|section| section.href()).collect();
        assert_eq!(hrefs, vec!["01-intro.txt", "02-body.md"]);

        let content = spine[1].load().await.unwrap().unwrap();
        assert_eq!(content.nodes.len(), 2);
        assert_eq!(content.nodes[1].cfi_at(1, 0).to_string(), "epubcfi(/6/4!/4/4/1:0)");
        assert!(spine[1].is_loaded());
        spine[1].unload();
        assert!(!spine[1].is_loaded());
    }

    #[tokio::test]
    async fn empty_directory_is_rejected() {
        let dir = tempdir().unwrap();
        let err = TextSpineProvider::new()
            .open(&DocumentSource::Path(dir.path().to_path_buf()))
            .await
            .err()
            .unwrap();
        assert!(err.to_string().contains("no text sections"));
    }

    #[tokio::test]
    async fn form_feeds_separate_sections() {
        let document = TextSpineProvider::new()
            .open(&bytes("One.\x0c\n\n\x0cThree."))
            .await
            .unwrap();
        let spine = document.spine();
        assert_eq!(spine.len(), 3);
        assert!(spine[1].load().await.unwrap().is_none());
        assert_eq!(document.info().metadata.title.as_deref(), Some("inline"));
    }

    #[tokio::test]
    async fn containers_are_fatal_for_the_session() {
        let container = DocumentSource::Bytes {
            name: None,
            bytes: b"PK\x03\x04....".to_vec(),
        };
        assert!(TextSpineProvider::new().open(&container).await.is_err());
        let err = ReaderSession::open(
            &TextSpineProvider::new(),
            container,
            Arc::new(MemoryStore::new()),
            ReaderConfig::default(),
        )
        .await
        .err()
        .unwrap();
        assert!(matches!(err, ReaderError::FatalDocument(_)));
    }

    #[tokio::test]
    async fn paging_crosses_sections_and_stops_at_the_ends() {
        let provider = TextSpineProvider::new().with_viewport(Viewport {
            width: 10,
            height: 1,
        });
        let document = provider
            .open(&bytes("alpha beta\x0c\x0cgamma"))
            .await
            .unwrap();
        let renderer = document.renderer();
        let (seen, _subscription) = collect_relocations(&renderer);

        renderer.display(&DisplayTarget::Start).await.unwrap();
        renderer.next().await.unwrap();
        renderer.next().await.unwrap();
        assert_eq!(renderer.visible_text().as_deref(), Some("gamma"));
        renderer.prev().await.unwrap();
        assert_eq!(renderer.visible_text().as_deref(), Some("alpha beta"));

        let starts: Vec<String> = seen.lock().iter().map(|r| r.start.to_string()).collect();
        assert_eq!(
            starts,
            vec![
                "epubcfi(/6/2!/4/2/1:0)",
                "epubcfi(/6/6!/4/2/1:0)",
                "epubcfi(/6/2!/4/2/1:0)",
            ]
        );
        let seqs: Vec<u64> = seen.lock().iter().map(|r| r.seq).collect();
        assert!(seqs.windows(2).all(|pair| pair[0] < pair[1]));
    }

    #[tokio::test]
    async fn resize_keeps_the_anchor() {
        let provider = TextSpineProvider::new().with_viewport(Viewport {
            width: 12,
            height: 2,
        });
        let text = "one two three four five six seven eight nine ten eleven twelve";
        let document = provider.open(&bytes(text)).await.unwrap();
        let renderer = document.renderer();
        let (seen, _subscription) = collect_relocations(&renderer);

        let target = Cfi::parse("/6/2!/4/2/1:34").unwrap();
        renderer.display(&DisplayTarget::Cfi(target.clone())).await.unwrap();
        assert!(renderer.visible_text().unwrap().contains("eight"));

        for (width, height) in [(20, 1), (7, 3), (12, 2)] {
            renderer.resize(Viewport { width, height }).await.unwrap();
            let last = seen.lock().last().cloned().unwrap();
            assert!(last.start <= target);
            assert!(last.end.unwrap() > target);
            assert!(renderer.visible_text().unwrap().contains("eight"));
        }
        assert_eq!(seen.lock().len(), 4);
    }

    #[tokio::test]
    async fn unknown_targets_report_display_errors() {
        let document = TextSpineProvider::new().open(&bytes("text")).await.unwrap();
        let renderer = document.renderer();
        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&errors);
        let _subscription = renderer.events().subscribe(move |event| {
            if let RendererEvent::DisplayError(message) = event {
                sink.lock().push(message.clone());
            }
        });

        assert!(renderer.display(&DisplayTarget::Cfi(Cfi::section_start(5))).await.is_err());
        assert!(renderer
            .display(&DisplayTarget::Href("missing.txt".to_owned()))
            .await
            .is_err());
        renderer
            .display(&DisplayTarget::Href("section-1#intro".to_owned()))
            .await
            .unwrap();
        assert_eq!(errors.lock().len(), 2);
        assert!(errors.lock()[0].contains("section 5 does not exist"));
    }

    #[tokio::test]
    async fn session_searches_and_indexes_a_directory() {
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join("01.txt"),
            "Call me Ishmael.\n\nSome years ago I went to sea.",
        )
        .unwrap();
        std::fs::write(dir.path().join("02.txt"), "The sea, the sea.").unwrap();

        let mut config = ReaderConfig::default();
        config.locations.chunk_size = 16;
        let store = Arc::new(MemoryStore::new());
        let session = ReaderSession::open(
            &TextSpineProvider::new(),
            DocumentSource::Path(dir.path().to_path_buf()),
            store.clone(),
            config.clone(),
        )
        .await
        .unwrap();

        let results = session.search("SEA").await.unwrap();
        let sections: Vec<usize> = results.iter().map(|result| result.section).collect();
        assert_eq!(sections, vec![0, 1, 1]);

        let index = session.ensure_locations().await.unwrap();
        assert_eq!(index.len(), 5);
        session.navigate(Navigate::Next).await.unwrap();
        let position = session.current_position().unwrap();
        session.close();
        drop(session);

        let reopened = ReaderSession::open(
            &TextSpineProvider::new(),
            DocumentSource::Path(dir.path().to_path_buf()),
            store,
            config,
        )
        .await
        .unwrap();
        assert_eq!(reopened.location_index().unwrap().len(), 5);
        assert_eq!(reopened.current_position().unwrap().cfi, position.cfi);
    }
}
