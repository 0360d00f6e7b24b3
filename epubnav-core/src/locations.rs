//! Layout-independent locations.
//!
//! The document text is cut into chunks of a fixed number of characters and
//! the address of every chunk start is recorded. Those addresses give the
//! reader page-like progress numbers that do not move when the layout does.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::OnceCell;
use tracing::{debug, info, instrument, warn};

use crate::cfi::Cfi;
use crate::engine::{Section, SectionLease};
use crate::error::{ReaderError, Result};
use crate::identity::DocumentIdentity;
use crate::store::{KeyValueStore, StoreError};

pub const DEFAULT_CHUNK_SIZE: usize = 1650;

#[derive(Debug, Clone, PartialEq)]
pub struct SectionMarker {
    pub spine_index: usize,
    pub location: usize,
    pub percentage: f32,
    pub cfi: Cfi,
}

#[derive(Debug, Clone)]
pub struct LocationIndex {
    chunk_size: usize,
    cfis: Vec<Cfi>,
}

impl LocationIndex {
    pub fn empty(chunk_size: usize) -> Self {
        Self {
            chunk_size,
            cfis: Vec::new(),
        }
    }

    /// Builds an index from already ordered addresses.
    pub fn from_cfis(chunk_size: usize, cfis: Vec<Cfi>) -> std::result::Result<Self, StoreError> {
        if let Some(position) = cfis.windows(2).position(|pair| pair[0] >= pair[1]) {
            return Err(StoreError::Corrupt(format!(
                "location {} is not after location {}",
                position + 1,
                position
            )));
        }
        Ok(Self { chunk_size, cfis })
    }

    /// Walks every section once, recording the address of each chunk start.
    ///
    /// Every non-empty section starts a new location at its first text, and
    /// a trailing partial chunk still counts as a location. Whitespace-only
    /// text nodes do not count. A section that fails to load fails the whole
    /// generation so that a partial index is never cached.
    #[instrument(skip(spine), fields(sections = spine.len()))]
    pub async fn generate(spine: &[Arc<dyn Section>], chunk_size: usize) -> Result<Self> {
        let chunk_size = chunk_size.max(1);
        let mut cfis = Vec::new();

        for section in spine {
            let spine_index = section.index();
            let mut counter = 0usize;
            let mut lease = SectionLease::acquire(Arc::clone(section));
            let Some(content) = lease.load().await? else {
                debug!(section = spine_index, "section has no content");
                continue;
            };
            for node in &content.nodes {
                if node.text.trim().is_empty() {
                    continue;
                }
                let len = node.text.chars().count();
                let mut pos = 0;
                while pos < len {
                    if counter == 0 {
                        cfis.push(node.cfi_at(spine_index, pos as u32));
                    }
                    let take = (chunk_size - counter).min(len - pos);
                    pos += take;
                    counter += take;
                    if counter == chunk_size {
                        counter = 0;
                    }
                }
            }
            drop(lease);
            tokio::task::yield_now().await;
        }

        info!(locations = cfis.len(), chunk_size, "generated locations");
        Ok(Self { chunk_size, cfis })
    }

    pub fn save(&self) -> std::result::Result<String, StoreError> {
        serde_json::to_string(&self.cfis).map_err(StoreError::Encode)
    }

    pub fn load(chunk_size: usize, data: &str) -> std::result::Result<Self, StoreError> {
        let cfis: Vec<Cfi> =
            serde_json::from_str(data).map_err(|err| StoreError::Corrupt(err.to_string()))?;
        Self::from_cfis(chunk_size, cfis)
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn len(&self) -> usize {
        self.cfis.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cfis.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Cfi> {
        self.cfis.iter()
    }

    fn ensure_available(&self) -> Result<()> {
        if self.cfis.is_empty() {
            Err(ReaderError::IndexUnavailable)
        } else {
            Ok(())
        }
    }

    pub fn document_start(&self) -> Result<&Cfi> {
        self.cfi_from_location(0)
    }

    pub fn cfi_from_location(&self, location: usize) -> Result<&Cfi> {
        self.ensure_available()?;
        self.cfis
            .get(location)
            .ok_or(ReaderError::LocationOutOfRange {
                location,
                length: self.cfis.len(),
            })
    }

    /// Index of the greatest entry not after `cfi`. Addresses before the
    /// first entry map to location 0.
    pub fn location_from_cfi(&self, cfi: &Cfi) -> Result<usize> {
        self.ensure_available()?;
        let after = self.cfis.partition_point(|entry| entry <= cfi);
        Ok(after.saturating_sub(1))
    }

    pub fn percentage_from_location(&self, location: usize) -> Result<f32> {
        self.ensure_available()?;
        let last = self.cfis.len() - 1;
        if last == 0 {
            return Ok(0.0);
        }
        if location >= last {
            return Ok(1.0);
        }
        Ok((location as f32 / last as f32).clamp(0.0, 1.0))
    }

    pub fn percentage_from_cfi(&self, cfi: &Cfi) -> Result<f32> {
        let location = self.location_from_cfi(cfi)?;
        self.percentage_from_location(location)
    }

    pub fn location_from_percentage(&self, percentage: f32) -> Result<usize> {
        self.ensure_available()?;
        let last = self.cfis.len() - 1;
        let clamped = if percentage.is_nan() {
            0.0
        } else {
            percentage.clamp(0.0, 1.0)
        };
        Ok(((clamped * last as f32).round() as usize).min(last))
    }

    pub fn cfi_from_percentage(&self, percentage: f32) -> Result<&Cfi> {
        let location = self.location_from_percentage(percentage)?;
        self.cfi_from_location(location)
    }

    /// First location of every spine section, for progress-bar ticks.
    pub fn section_markers(&self) -> Vec<SectionMarker> {
        let mut markers = Vec::new();
        let mut last_spine = None;
        for (location, cfi) in self.cfis.iter().enumerate() {
            if last_spine == Some(cfi.spine_index()) {
                continue;
            }
            last_spine = Some(cfi.spine_index());
            match self.percentage_from_location(location) {
                Ok(percentage) => markers.push(SectionMarker {
                    spine_index: cfi.spine_index(),
                    location,
                    percentage,
                    cfi: cfi.clone(),
                }),
                Err(err) => warn!(location, ?err, "skipping section marker"),
            }
        }
        markers
    }
}

/// Per-document access to the location index: served from the store when a
/// valid copy exists, generated at most once otherwise.
pub struct Locations {
    key: String,
    chunk_size: usize,
    store: Arc<dyn KeyValueStore>,
    index: OnceCell<Arc<LocationIndex>>,
    generations: AtomicUsize,
}

impl Locations {
    pub fn new(
        identity: DocumentIdentity,
        chunk_size: usize,
        store: Arc<dyn KeyValueStore>,
    ) -> Self {
        let chunk_size = chunk_size.max(1);
        Self {
            key: identity.locations_key(chunk_size),
            chunk_size,
            store,
            index: OnceCell::new(),
            generations: AtomicUsize::new(0),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// The index, if it has been restored or generated already.
    pub fn current(&self) -> Option<Arc<LocationIndex>> {
        self.index.get().cloned()
    }

    /// How many generation passes ran.
    pub fn generation_count(&self) -> usize {
        self.generations.load(Ordering::SeqCst)
    }

    /// Adopts the persisted index when present and valid. A corrupt copy is
    /// dropped from the store so the next [`Locations::ensure`] regenerates.
    pub fn restore_cached(&self) -> Option<Arc<LocationIndex>> {
        let stored = match self.store.get(&self.key) {
            Ok(Some(stored)) => stored,
            Ok(None) => return None,
            Err(err) => {
                warn!(key = %self.key, %err, "failed to read cached locations");
                return None;
            }
        };
        match LocationIndex::load(self.chunk_size, &stored) {
            Ok(index) => {
                debug!(key = %self.key, locations = index.len(), "restored cached locations");
                let index = Arc::new(index);
                if self.index.set(Arc::clone(&index)).is_err() {
                    return self.current();
                }
                Some(index)
            }
            Err(err) => {
                warn!(key = %self.key, %err, "discarding corrupt cached locations");
                if let Err(err) = self.store.remove(&self.key) {
                    warn!(key = %self.key, %err, "failed to drop corrupt locations");
                }
                None
            }
        }
    }

    /// Returns the index, generating and persisting it on first use.
    /// Concurrent callers share one in-flight generation.
    pub async fn ensure(&self, spine: &[Arc<dyn Section>]) -> Result<Arc<LocationIndex>> {
        let index = self
            .index
            .get_or_try_init(|| async {
                self.generations.fetch_add(1, Ordering::SeqCst);
                let index = LocationIndex::generate(spine, self.chunk_size).await?;
                self.persist(&index);
                Ok::<_, ReaderError>(Arc::new(index))
            })
            .await?;
        Ok(Arc::clone(index))
    }

    fn persist(&self, index: &LocationIndex) {
        let saved = match index.save() {
            Ok(saved) => saved,
            Err(err) => {
                warn!(%err, "failed to encode locations");
                return;
            }
        };
        if let Err(err) = self.store.set(&self.key, &saved) {
            warn!(key = %self.key, %err, "failed to persist locations");
        }
    }
}
