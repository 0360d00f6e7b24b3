//! Reading navigation and search over reflowable documents.
//!
//! Positions are [`Cfi`] addresses into document structure, so they survive
//! re-pagination. On top of them sit the layout-independent location index,
//! the persisted reading position, the cross-section search and the
//! navigation controller, all tied together by a [`ReaderSession`].

pub mod cfi;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod identity;
pub mod locations;
pub mod navigation;
pub mod position;
pub mod search;
pub mod session;
pub mod store;

#[cfg(test)]
mod testing;

pub use cfi::{Cfi, CfiParseError, Step};
pub use config::{PanelConfig, ProgressMode, ReaderConfig};
pub use engine::{
    DisplayTarget, DocumentHandle, DocumentInfo, DocumentMetadata, DocumentProvider,
    DocumentSource, Relocation, Renderer, RendererEvent, Section, SectionContent, SectionMatch,
    SourceKind, TextNode, Viewport,
};
pub use error::{ReaderError, Result};
pub use events::{EventBus, Subscription};
pub use identity::DocumentIdentity;
pub use locations::{LocationIndex, Locations, SectionMarker};
pub use navigation::{Direction, InputEvent, InputOutcome, NavKey, NavTarget};
pub use search::{ResultEntry, SearchResult};
pub use session::{Navigate, PanelResults, PositionUpdate, ReaderEvent, ReaderSession};
pub use store::{FileStore, KeyValueStore, MemoryStore, StoreError};
