//! Error types for write transactions.

use std::fmt;

use serde::Deserialize;
use serde::Serialize;
use snafu::Snafu;

use crate::types::Datastore;
use crate::types::DeviceId;
use crate::types::LogicalDatastore;
use crate::types::TxId;

/// Phase of a transaction, recorded on protocol failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxPhase {
    Lock,
    Edit,
    Commit,
}

impl fmt::Display for TxPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TxPhase::Lock => f.write_str("lock"),
            TxPhase::Edit => f.write_str("edit"),
            TxPhase::Commit => f.write_str("commit"),
        }
    }
}

/// Errors surfaced by a write transaction.
///
/// Every variant names the device and, where one exists, the transaction.
/// The first four are fatal to the transaction: cleanup (discard, unlock) has
/// already been attempted by the time a caller observes them.
#[derive(Debug, Clone, Snafu, PartialEq, Eq, Serialize, Deserialize)]
#[snafu(visibility(pub))]
pub enum TxError {
    /// Datastore lock could not be acquired; the transaction is unusable.
    #[snafu(display("{device}: {tx}: failed to lock {datastore} datastore: {reason}"))]
    LockFailure {
        device: DeviceId,
        tx: TxId,
        datastore: Datastore,
        reason: String,
    },

    /// An edit-config was rejected; changes were discarded and locks released.
    #[snafu(display("{device}: {tx}: error while {operation} ({datastore}){path}: {reason}"))]
    EditFailure {
        device: DeviceId,
        tx: TxId,
        datastore: Datastore,
        operation: String,
        path: String,
        reason: String,
    },

    /// Commit was rejected; changes were discarded and locks released.
    #[snafu(display("{device}: commit of transaction {tx} failed: {reason}"))]
    CommitFailure {
        device: DeviceId,
        tx: TxId,
        reason: String,
    },

    /// Device returned a malformed or unexpected reply.
    #[snafu(display("{device}: {tx}: malformed device reply during {phase}: {reason}"))]
    ProtocolFailure {
        device: DeviceId,
        tx: TxId,
        phase: TxPhase,
        reason: String,
    },

    /// Transaction already committed or cancelled.
    #[snafu(display("{device}: transaction {tx} already finished"))]
    AlreadyFinished { device: DeviceId, tx: TxId },

    /// Only the configuration datastore can be edited.
    #[snafu(display("{device}: {tx}: can edit only configuration data, not {datastore}"))]
    NotConfigurationDatastore {
        device: DeviceId,
        tx: TxId,
        datastore: LogicalDatastore,
    },

    /// Device supports neither candidate nor writable-running.
    #[snafu(display("{device}: device supports neither candidate nor writable-running datastore"))]
    UnsupportedDevice { device: DeviceId },
}

impl TxError {
    /// Programming errors are caller misuse rather than device failures.
    pub fn is_programming_error(&self) -> bool {
        matches!(
            self,
            TxError::AlreadyFinished { .. } | TxError::NotConfigurationDatastore { .. }
        )
    }

    pub fn device(&self) -> &DeviceId {
        match self {
            TxError::LockFailure { device, .. }
            | TxError::EditFailure { device, .. }
            | TxError::CommitFailure { device, .. }
            | TxError::ProtocolFailure { device, .. }
            | TxError::AlreadyFinished { device, .. }
            | TxError::NotConfigurationDatastore { device, .. }
            | TxError::UnsupportedDevice { device } => device,
        }
    }
}
