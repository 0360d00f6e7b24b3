use std::fmt;
use std::path::Path;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

static DOCUMENT_NAMESPACE: Lazy<Uuid> = Lazy::new(|| {
    Uuid::parse_str("3f0c9a52-6d1e-5b8a-9c4f-2e7a1d0b8c61").expect("valid namespace UUID")
});

/// Stable identity of an opened document, used to namespace persisted state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DocumentIdentity(Uuid);

impl DocumentIdentity {
    pub fn for_path(path: &Path) -> Self {
        let resolved = path
            .canonicalize()
            .or_else(|_| {
                if path.is_absolute() {
                    Ok(path.to_path_buf())
                } else {
                    std::env::current_dir().map(|cwd| cwd.join(path))
                }
            })
            .unwrap_or_else(|_| path.to_path_buf());
        let rendered = resolved.to_string_lossy();
        Self(Uuid::new_v5(&DOCUMENT_NAMESPACE, rendered.as_bytes()))
    }

    /// Identity derived from the content itself, for sources without a path.
    pub fn for_bytes(bytes: &[u8]) -> Self {
        Self(Uuid::new_v5(&DOCUMENT_NAMESPACE, bytes))
    }

    pub fn position_key(&self) -> String {
        format!("{}:pos", self.0)
    }

    pub fn locations_key(&self, chunk_size: usize) -> String {
        format!("{}:locations-{}", self.0, chunk_size)
    }
}

impl fmt::Display for DocumentIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tempfile::tempdir;

    #[test]
    fn identity_is_stable_for_same_path() {
        let dir = tempdir().unwrap();
        let file_path = dir.path().join("book");
        std::fs::create_dir(&file_path).unwrap();

        let first = DocumentIdentity::for_path(&file_path);
        let second = DocumentIdentity::for_path(&file_path);
        assert_eq!(first, second);
        assert_ne!(first, DocumentIdentity::for_path(&dir.path().join("other")));
    }

    #[test]
    fn keys_are_namespaced_by_identity() {
        let id = DocumentIdentity::for_bytes(b"chapter one");
        assert_eq!(id, DocumentIdentity::for_bytes(b"chapter one"));
        assert_eq!(id.position_key(), format!("{id}:pos"));
        assert_eq!(id.locations_key(1650), format!("{id}:locations-1650"));
        assert_ne!(
            id.position_key(),
            DocumentIdentity::for_bytes(b"chapter two").position_key()
        );
    }

    #[test]
    fn identity_serializes_as_its_uuid_string() {
        let id = DocumentIdentity::for_bytes(b"chapter one");
        let encoded = serde_json::to_string(&id).unwrap();
        assert_eq!(encoded, format!("\"{id}\""));
        let decoded: DocumentIdentity = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, id);
    }
}
