use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::cfi::Cfi;
use crate::engine::{DisplayTarget, Relocation, Renderer};
use crate::identity::DocumentIdentity;
use crate::store::KeyValueStore;

/// Remembers the reading position of one document across sessions.
///
/// Every relocation overwrites the stored address. Relocations can be
/// delivered out of order, so older sequence numbers are ignored.
pub struct PositionTracker {
    key: String,
    store: Arc<dyn KeyValueStore>,
    last_seq: Mutex<Option<u64>>,
}

impl PositionTracker {
    pub fn new(identity: DocumentIdentity, store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            key: identity.position_key(),
            store,
            last_seq: Mutex::new(None),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Stores the start of `relocation`. Storage failures are logged and
    /// swallowed; reading continues.
    pub fn record(&self, relocation: &Relocation) {
        let mut last_seq = self.last_seq.lock();
        if matches!(*last_seq, Some(seen) if relocation.seq < seen) {
            debug!(seq = relocation.seq, "ignoring stale relocation");
            return;
        }
        *last_seq = Some(relocation.seq);
        let value = relocation.start.to_string();
        if let Err(err) = self.store.set(&self.key, &value) {
            warn!(key = %self.key, %err, "failed to persist reading position");
        }
    }

    /// The last stored address, if any. Unreadable values are treated as
    /// absent.
    pub fn stored(&self) -> Option<Cfi> {
        let raw = match self.store.get(&self.key) {
            Ok(raw) => raw?,
            Err(err) => {
                warn!(key = %self.key, %err, "failed to read reading position");
                return None;
            }
        };
        match Cfi::parse(&raw) {
            Ok(cfi) => Some(cfi),
            Err(err) => {
                warn!(key = %self.key, %err, value = %raw, "ignoring unreadable reading position");
                None
            }
        }
    }

    /// Displays the stored position, or the start of the first section when
    /// nothing is stored. A stored address the renderer cannot resolve falls
    /// back to the first section as well.
    pub async fn restore(&self, renderer: &dyn Renderer) -> anyhow::Result<()> {
        let Some(stored) = self.stored() else {
            debug!("no stored position, opening at the start");
            return renderer.display(&DisplayTarget::Cfi(Cfi::section_start(0))).await;
        };
        debug!(cfi = %stored, "restoring reading position");
        if let Err(err) = renderer.display(&DisplayTarget::Cfi(stored.clone())).await {
            warn!(cfi = %stored, %err, "stored position could not be displayed");
            return renderer.display(&DisplayTarget::Cfi(Cfi::section_start(0))).await;
        }
        Ok(())
    }
}
