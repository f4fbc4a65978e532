use tracing::debug;

use super::unexpected_reply;
use super::MountPointService;
use crate::envelope::Envelope;
use crate::envelope::WriteOp;
use crate::error::MountError;
use crate::types::DataNode;
use crate::types::InstancePath;
use crate::types::LogicalDatastore;
use crate::types::PathTree;
use crate::types::TxId;

/// Write transaction against a mounted device.
///
/// Holds nothing but its id; every call is forwarded to the master, which
/// opens the device transaction on the first request carrying the id.
#[derive(Clone)]
pub struct MountTransaction<S> {
    id: TxId,
    service: S,
}

impl<S: MountPointService> MountTransaction<S> {
    pub fn new(service: S) -> Self {
        Self {
            id: TxId::new(),
            service,
        }
    }

    pub fn id(&self) -> TxId {
        self.id
    }

    pub async fn put(&self, datastore: LogicalDatastore, path: InstancePath, data: DataNode) -> Result<(), MountError> {
        self.write(datastore, WriteOp::Put(PathTree::new(path, data))).await
    }

    pub async fn merge(&self, datastore: LogicalDatastore, path: InstancePath, data: DataNode) -> Result<(), MountError> {
        self.write(datastore, WriteOp::Merge(PathTree::new(path, data))).await
    }

    pub async fn delete(&self, datastore: LogicalDatastore, path: InstancePath) -> Result<(), MountError> {
        self.write(datastore, WriteOp::Delete(path)).await
    }

    /// Commits every write issued so far. Resolves once the device has
    /// committed and released its locks, or with the failure that ended the
    /// transaction.
    pub async fn commit(&self) -> Result<(), MountError> {
        debug!(device = %self.service.device(), tx = %self.id, "committing");
        self.expect_ack(Envelope::TxCommit { tx: self.id }).await
    }

    /// Cancels the transaction. Returns `false` when it had already finished
    /// or never started.
    pub async fn cancel(&self) -> Result<bool, MountError> {
        match self.service.request(Envelope::TxCancel { tx: self.id }).await? {
            Envelope::TxCancelled { cancelled } => Ok(cancelled),
            other => Err(unexpected_reply(self.service.device(), &other)),
        }
    }

    async fn write(&self, datastore: LogicalDatastore, op: WriteOp) -> Result<(), MountError> {
        self.expect_ack(Envelope::TreeWrite {
            tx: self.id,
            datastore,
            op,
        })
        .await
    }

    async fn expect_ack(&self, envelope: Envelope) -> Result<(), MountError> {
        match self.service.request(envelope).await? {
            Envelope::Ack => Ok(()),
            other => Err(unexpected_reply(self.service.device(), &other)),
        }
    }
}
