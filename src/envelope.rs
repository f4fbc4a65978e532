//! Messages exchanged between cluster nodes.
//!
//! Every frame that crosses nodes is one postcard-encoded [`Envelope`]. Local
//! control messages that carry in-process references (device sessions,
//! schema providers) never appear here; they are typed
//! [`MasterMessage`](crate::master::MasterMessage) variants instead.
//!
//! Tree-bearing variants always carry a [`PathTree`], never a bare node.

use std::time::SystemTime;

use serde::Deserialize;
use serde::Serialize;
use snafu::ensure;
use snafu::ResultExt;
use snafu::Snafu;

use crate::constants::MAX_ENVELOPE_SIZE;
use crate::error::MountError;
use crate::types::ActorAddress;
use crate::types::InstancePath;
use crate::types::LogicalDatastore;
use crate::types::PathTree;
use crate::types::RpcError;
use crate::types::SchemaPath;
use crate::types::SourceIdentifier;
use crate::types::TxId;

/// Tree edit carried by [`Envelope::TreeWrite`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WriteOp {
    Put(PathTree),
    Merge(PathTree),
    Delete(InstancePath),
}

impl WriteOp {
    pub fn path(&self) -> &InstancePath {
        match self {
            WriteOp::Put(tree) | WriteOp::Merge(tree) => &tree.path,
            WriteOp::Delete(path) => path,
        }
    }
}

/// Cross-node message kinds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Envelope {
    /// Slave asks whoever it believes is master to identify itself.
    AskForMaster { requester: ActorAddress },
    /// Master answers discovery with the sources it serves and its address.
    RegisterMountPoint {
        sources: Vec<SourceIdentifier>,
        master: ActorAddress,
    },
    /// Master finished processing its initial device data.
    MasterDataInitialized,

    SchemaSourceRequest { source: SourceIdentifier },
    /// `text` is `None` when the master does not hold the source.
    SchemaSourceReply {
        source: SourceIdentifier,
        text: Option<String>,
    },

    InvokeRpc {
        path: SchemaPath,
        input: Option<PathTree>,
    },
    InvokeRpcReply {
        output: Option<PathTree>,
        errors: Vec<RpcError>,
    },
    InvokeAction {
        path: SchemaPath,
        target: InstancePath,
        input: Option<PathTree>,
    },
    InvokeActionReply {
        output: Option<PathTree>,
        errors: Vec<RpcError>,
    },
    /// RPC or action completed with neither output nor errors.
    EmptyResult,

    TreeRead {
        datastore: LogicalDatastore,
        path: InstancePath,
    },
    TreeReadReply { tree: Option<PathTree> },
    TreeWrite {
        tx: TxId,
        datastore: LogicalDatastore,
        op: WriteOp,
    },
    TxCommit { tx: TxId },
    TxCancel { tx: TxId },
    /// `cancelled` is false when the transaction had already finished.
    TxCancelled { cancelled: bool },

    SubscribeNotifications {
        path: SchemaPath,
        subscriber: ActorAddress,
    },
    UnsubscribeNotifications {
        path: SchemaPath,
        subscriber: ActorAddress,
    },
    NotificationDelivery {
        path: SchemaPath,
        body: PathTree,
        event_time: SystemTime,
    },

    /// Generic success reply.
    Ack,
    Failure(MountError),
}

/// Envelope encode/decode failures.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum CodecError {
    #[snafu(display("failed to encode {kind}: {source}"))]
    Encode {
        kind: &'static str,
        source: postcard::Error,
    },

    #[snafu(display("failed to decode envelope: {source}"))]
    Decode { source: postcard::Error },

    #[snafu(display("frame of {size} bytes exceeds limit of {limit} bytes"))]
    FrameTooLarge { size: usize, limit: usize },
}

impl Envelope {
    /// Fails with [`CodecError::FrameTooLarge`] rather than produce a frame
    /// the receiving node would refuse.
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        let bytes = postcard::to_stdvec(self).context(EncodeSnafu { kind: self.kind() })?;
        ensure!(
            bytes.len() <= MAX_ENVELOPE_SIZE,
            FrameTooLargeSnafu {
                size: bytes.len(),
                limit: MAX_ENVELOPE_SIZE,
            }
        );
        Ok(bytes)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        ensure!(
            bytes.len() <= MAX_ENVELOPE_SIZE,
            FrameTooLargeSnafu {
                size: bytes.len(),
                limit: MAX_ENVELOPE_SIZE,
            }
        );
        postcard::from_bytes(bytes).context(DecodeSnafu)
    }

    /// Variant name, for logs and unexpected-reply errors.
    pub fn kind(&self) -> &'static str {
        match self {
            Envelope::AskForMaster { .. } => "AskForMaster",
            Envelope::RegisterMountPoint { .. } => "RegisterMountPoint",
            Envelope::MasterDataInitialized => "MasterDataInitialized",
            Envelope::SchemaSourceRequest { .. } => "SchemaSourceRequest",
            Envelope::SchemaSourceReply { .. } => "SchemaSourceReply",
            Envelope::InvokeRpc { .. } => "InvokeRpc",
            Envelope::InvokeRpcReply { .. } => "InvokeRpcReply",
            Envelope::InvokeAction { .. } => "InvokeAction",
            Envelope::InvokeActionReply { .. } => "InvokeActionReply",
            Envelope::EmptyResult => "EmptyResult",
            Envelope::TreeRead { .. } => "TreeRead",
            Envelope::TreeReadReply { .. } => "TreeReadReply",
            Envelope::TreeWrite { .. } => "TreeWrite",
            Envelope::TxCommit { .. } => "TxCommit",
            Envelope::TxCancel { .. } => "TxCancel",
            Envelope::TxCancelled { .. } => "TxCancelled",
            Envelope::SubscribeNotifications { .. } => "SubscribeNotifications",
            Envelope::UnsubscribeNotifications { .. } => "UnsubscribeNotifications",
            Envelope::NotificationDelivery { .. } => "NotificationDelivery",
            Envelope::Ack => "Ack",
            Envelope::Failure(_) => "Failure",
        }
    }

    /// Requests that touch the device or its transaction; these need an
    /// initialized master.
    pub fn requires_ready_master(&self) -> bool {
        matches!(
            self,
            Envelope::AskForMaster { .. }
                | Envelope::SchemaSourceRequest { .. }
                | Envelope::InvokeRpc { .. }
                | Envelope::InvokeAction { .. }
                | Envelope::TreeRead { .. }
                | Envelope::TreeWrite { .. }
                | Envelope::TxCommit { .. }
                | Envelope::TxCancel { .. }
                | Envelope::SubscribeNotifications { .. }
                | Envelope::UnsubscribeNotifications { .. }
        )
    }
}
