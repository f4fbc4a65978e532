use async_trait::async_trait;
use tracing::warn;

use super::SlaveProxy;
use crate::device::MissingSource;
use crate::device::SchemaSourceProvider;
use crate::mount::MountPointService;
use crate::types::SourceIdentifier;

/// Resolves schema sources by asking the master, so a slave can build its
/// schema context from what the master holds.
#[derive(Clone)]
pub struct RemoteSchemaProvider {
    proxy: SlaveProxy,
}

impl RemoteSchemaProvider {
    pub fn new(proxy: SlaveProxy) -> Self {
        Self { proxy }
    }
}

#[async_trait]
impl SchemaSourceProvider for RemoteSchemaProvider {
    async fn resolve_source(&self, id: &SourceIdentifier) -> Result<String, MissingSource> {
        self.proxy.schema_source(id.clone()).await.map_err(|err| {
            warn!(device = %self.proxy.device(), source = %id, error = %err, "remote schema source unavailable");
            MissingSource { source_id: id.clone() }
        })
    }
}
