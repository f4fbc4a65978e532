//! Errors of the mount-point layer.
//!
//! [`MountError`] crosses the wire inside [`Envelope::Failure`], so it is
//! `Clone + Serialize` and carries its causes as strings, except for
//! [`TxError`] which is itself serializable.
//!
//! [`Envelope::Failure`]: crate::envelope::Envelope::Failure

use serde::Deserialize;
use serde::Serialize;
use snafu::Snafu;

use crate::tx::TxError;
use crate::types::ActorAddress;
use crate::types::DeviceId;
use crate::types::SourceIdentifier;

/// Failures surfaced by [`MountPointService`](crate::mount::MountPointService) calls.
#[derive(Debug, Clone, Snafu, PartialEq, Eq, Serialize, Deserialize)]
#[snafu(visibility(pub))]
pub enum MountError {
    /// The addressed actor is not the current master for the device.
    #[snafu(display("{device}: {address} is not the current master"))]
    NotMaster {
        device: DeviceId,
        /// Address that rejected the request.
        address: ActorAddress,
    },

    /// The master has not processed its initial device data yet.
    #[snafu(display("{device}: master data not initialized yet"))]
    MasterNotReady { device: DeviceId },

    /// No master answered within the response-wait budget.
    #[snafu(display("{device}: no master found within {waited_ms} ms"))]
    DiscoveryTimeout {
        device: DeviceId,
        /// Budget that was exhausted.
        waited_ms: u64,
    },

    /// The master does not hold the requested schema source.
    #[snafu(display("{device}: schema source {source_id} not available"))]
    MissingSchemaSource {
        device: DeviceId,
        source_id: SourceIdentifier,
    },

    /// The write transaction failed on the master.
    #[snafu(display("{source}"))]
    Transaction { device: DeviceId, source: TxError },

    /// The device rejected a read, RPC or action, or could not be reached.
    #[snafu(display("{device}: {operation} failed: {reason}"))]
    Rpc {
        device: DeviceId,
        operation: String,
        reason: String,
    },

    /// Too many writers queued behind the current transaction.
    #[snafu(display("{device}: write queue full ({limit} requests pending)"))]
    Busy { device: DeviceId, limit: usize },

    /// An envelope could not be encoded or decoded.
    #[snafu(display("{device}: envelope codec error: {reason}"))]
    Codec { device: DeviceId, reason: String },

    /// A reply of the wrong kind arrived.
    #[snafu(display("{device}: unexpected {kind} message"))]
    UnexpectedMessage { device: DeviceId, kind: String },

    /// The target actor could not be resolved or did not answer.
    #[snafu(display("{device}: {address} unreachable: {reason}"))]
    Unreachable {
        device: DeviceId,
        address: ActorAddress,
        reason: String,
    },
}

impl MountError {
    pub fn device(&self) -> &DeviceId {
        match self {
            MountError::NotMaster { device, .. }
            | MountError::MasterNotReady { device }
            | MountError::DiscoveryTimeout { device, .. }
            | MountError::MissingSchemaSource { device, .. }
            | MountError::Transaction { device, .. }
            | MountError::Rpc { device, .. }
            | MountError::Busy { device, .. }
            | MountError::Codec { device, .. }
            | MountError::UnexpectedMessage { device, .. }
            | MountError::Unreachable { device, .. } => device,
        }
    }

    /// Failures after which a slave should look for a different master.
    pub fn is_stale_master(&self) -> bool {
        matches!(self, MountError::NotMaster { .. } | MountError::Unreachable { .. })
    }
}

impl From<TxError> for MountError {
    fn from(source: TxError) -> Self {
        MountError::Transaction {
            device: source.device().clone(),
            source,
        }
    }
}
