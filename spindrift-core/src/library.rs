//! Stand-in for the external library subsystem.
//!
//! Library scanning and metadata live outside this system; the pipeline
//! only needs to resolve a source id to its immutable descriptor. The
//! in-memory implementation backs the server wiring and tests.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::media::{MediaSource, SourceId};

/// Resolver from source ids to media source descriptors.
#[async_trait]
pub trait MediaLibrary: Send + Sync {
    /// Look up a source descriptor, `None` if the library does not know it.
    async fn source(&self, id: SourceId) -> Option<MediaSource>;
}

/// Simple in-memory library for the server wiring and tests.
#[derive(Default)]
pub struct InMemoryMediaLibrary {
    sources: RwLock<HashMap<SourceId, MediaSource>>,
}

impl InMemoryMediaLibrary {
    /// Create new empty library.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a source, returning its id.
    pub fn insert(&self, source: MediaSource) -> SourceId {
        let id = source.id;
        self.sources.write().insert(id, source);
        id
    }

    /// Number of registered sources.
    pub fn len(&self) -> usize {
        self.sources.read().len()
    }

    /// Check whether the library holds no sources.
    pub fn is_empty(&self) -> bool {
        self.sources.read().is_empty()
    }
}

#[async_trait]
impl MediaLibrary for InMemoryMediaLibrary {
    async fn source(&self, id: SourceId) -> Option<MediaSource> {
        self.sources.read().get(&id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::time::Duration;

    use super::*;
    use crate::media::ContainerFormat;

    #[tokio::test]
    async fn test_insert_and_lookup() {
        let library = InMemoryMediaLibrary::new();
        let source = MediaSource {
            id: SourceId::new(),
            path: PathBuf::from("/media/movie.mp4"),
            duration: Duration::from_secs(5400),
            container: ContainerFormat::Mp4,
            video: None,
            audio: None,
        };

        let id = library.insert(source.clone());
        assert_eq!(library.source(id).await, Some(source));
        assert_eq!(library.source(SourceId::new()).await, None);
    }
}
