//! North-bound mount-point API.
//!
//! [`MountPointService`] is implemented by the local [`MountPoint`] handle on
//! the master's node and by [`SlaveProxy`](crate::slave::SlaveProxy) on every
//! other node. Both reduce each call to one [`Envelope`] request; the typed
//! helpers in this trait map the reply envelopes back to results.

mod listener;
mod local;
mod transaction;

use std::sync::Arc;

use async_trait::async_trait;
use ractor::Actor;
use tracing::debug;
use tracing::warn;
use uuid::Uuid;

pub use self::listener::ListenerArguments;
pub use self::listener::ListenerMessage;
pub use self::listener::NotificationListenerActor;
pub use self::listener::NotificationRegistration;
pub use self::local::MountPoint;
pub use self::transaction::MountTransaction;
use crate::device::NotificationListener;
use crate::device::RpcOutcome;
use crate::envelope::Envelope;
use crate::error::MountError;
use crate::types::ActorAddress;
use crate::types::DeviceId;
use crate::types::InstancePath;
use crate::types::LogicalDatastore;
use crate::types::PathTree;
use crate::types::SchemaPath;
use crate::types::SourceIdentifier;

/// Operations a mounted device offers to applications on any node.
#[async_trait]
pub trait MountPointService: Send + Sync {
    fn device(&self) -> &DeviceId;

    /// Name of the node this handle lives on.
    fn node(&self) -> &str;

    /// Sends one request to the master. `Envelope::Failure` replies come back
    /// as `Err`.
    async fn request(&self, envelope: Envelope) -> Result<Envelope, MountError>;

    /// Reads the subtree at `path`; `None` when the device has no data there.
    async fn read(&self, datastore: LogicalDatastore, path: InstancePath) -> Result<Option<PathTree>, MountError> {
        match self.request(Envelope::TreeRead { datastore, path }).await? {
            Envelope::TreeReadReply { tree } => Ok(tree),
            other => Err(unexpected_reply(self.device(), &other)),
        }
    }

    /// Invokes an RPC. Device-reported errors are part of the outcome, not an
    /// `Err`.
    async fn invoke_rpc(&self, path: SchemaPath, input: Option<PathTree>) -> Result<RpcOutcome, MountError> {
        match self.request(Envelope::InvokeRpc { path, input }).await? {
            Envelope::InvokeRpcReply { output, errors } => Ok(RpcOutcome {
                output: output.map(|tree| tree.node),
                errors,
            }),
            Envelope::EmptyResult => Ok(RpcOutcome::ok()),
            other => Err(unexpected_reply(self.device(), &other)),
        }
    }

    async fn invoke_action(
        &self,
        path: SchemaPath,
        target: InstancePath,
        input: Option<PathTree>,
    ) -> Result<RpcOutcome, MountError> {
        match self.request(Envelope::InvokeAction { path, target, input }).await? {
            Envelope::InvokeActionReply { output, errors } => Ok(RpcOutcome {
                output: output.map(|tree| tree.node),
                errors,
            }),
            Envelope::EmptyResult => Ok(RpcOutcome::ok()),
            other => Err(unexpected_reply(self.device(), &other)),
        }
    }

    /// Fetches the text of a schema source held by the master.
    async fn schema_source(&self, source: SourceIdentifier) -> Result<String, MountError> {
        match self.request(Envelope::SchemaSourceRequest { source }).await? {
            Envelope::SchemaSourceReply { text: Some(text), .. } => Ok(text),
            Envelope::SchemaSourceReply { source, text: None } => Err(MountError::MissingSchemaSource {
                device: self.device().clone(),
                source_id: source,
            }),
            other => Err(unexpected_reply(self.device(), &other)),
        }
    }

    /// Registers `listener` for notifications under `path`.
    ///
    /// Spawns a listener actor on this node and hands its address to the
    /// master; the registration keeps the actor alive until
    /// [`unsubscribe_notifications`](Self::unsubscribe_notifications).
    async fn subscribe_notifications(
        &self,
        path: SchemaPath,
        listener: Arc<dyn NotificationListener>,
    ) -> Result<NotificationRegistration, MountError> {
        let address = ActorAddress::new(format!(
            "{}/notify/{}/{}",
            self.node(),
            self.device().name(),
            Uuid::new_v4().simple()
        ));
        let (actor, _handle) = Actor::spawn(
            Some(address.as_str().to_string()),
            NotificationListenerActor,
            ListenerArguments {
                device: self.device().clone(),
                listener,
            },
        )
        .await
        .map_err(|err| MountError::Unreachable {
            device: self.device().clone(),
            address: address.clone(),
            reason: err.to_string(),
        })?;

        let subscribe = Envelope::SubscribeNotifications {
            path: path.clone(),
            subscriber: address.clone(),
        };
        match self.request(subscribe).await {
            Ok(Envelope::Ack) => {
                debug!(device = %self.device(), %path, %address, "subscribed to notifications");
                Ok(NotificationRegistration { path, address, actor })
            }
            Ok(other) => {
                actor.stop(None);
                Err(unexpected_reply(self.device(), &other))
            }
            Err(err) => {
                actor.stop(None);
                Err(err)
            }
        }
    }

    async fn unsubscribe_notifications(&self, registration: NotificationRegistration) -> Result<(), MountError> {
        let NotificationRegistration { path, address, actor } = registration;
        let result = self
            .request(Envelope::UnsubscribeNotifications {
                path: path.clone(),
                subscriber: address.clone(),
            })
            .await;
        actor.stop(None);
        match result? {
            Envelope::Ack => Ok(()),
            other => {
                warn!(device = %self.device(), %path, %address, kind = other.kind(), "unexpected unsubscribe reply");
                Err(unexpected_reply(self.device(), &other))
            }
        }
    }

    /// Opens a write transaction. Nothing is sent until the first write.
    fn begin_transaction(&self) -> MountTransaction<Self>
    where
        Self: Clone + Sized,
    {
        MountTransaction::new(self.clone())
    }
}

pub(crate) fn unexpected_reply(device: &DeviceId, envelope: &Envelope) -> MountError {
    MountError::UnexpectedMessage {
        device: device.clone(),
        kind: envelope.kind().to_string(),
    }
}

/// Maps a `Failure` reply to `Err`.
pub(crate) fn into_result(envelope: Envelope) -> Result<Envelope, MountError> {
    match envelope {
        Envelope::Failure(err) => Err(err),
        other => Ok(other),
    }
}
