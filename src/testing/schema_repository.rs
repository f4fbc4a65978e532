//! Fixed-content schema source repository.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::device::MissingSource;
use crate::device::SchemaSourceProvider;
use crate::types::SourceIdentifier;

#[derive(Debug, Default)]
pub struct InMemorySchemaRepository {
    sources: RwLock<HashMap<SourceIdentifier, String>>,
}

impl InMemorySchemaRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_source(self, id: SourceIdentifier, text: impl Into<String>) -> Self {
        self.insert(id, text);
        self
    }

    pub fn insert(&self, id: SourceIdentifier, text: impl Into<String>) {
        self.sources.write().insert(id, text.into());
    }

    /// Identifiers of every stored source, sorted.
    pub fn identifiers(&self) -> Vec<SourceIdentifier> {
        let mut ids: Vec<_> = self.sources.read().keys().cloned().collect();
        ids.sort();
        ids
    }
}

#[async_trait]
impl SchemaSourceProvider for InMemorySchemaRepository {
    async fn resolve_source(&self, id: &SourceIdentifier) -> Result<String, MissingSource> {
        self.sources
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| MissingSource { source_id: id.clone() })
    }
}
