use std::sync::Arc;

use async_trait::async_trait;
use ractor::Actor;
use ractor::ActorProcessingErr;
use ractor::ActorRef;
use tracing::debug;
use tracing::warn;

use crate::device::DeviceNotification;
use crate::device::NotificationListener;
use crate::envelope::Envelope;
use crate::types::ActorAddress;
use crate::types::DeviceId;
use crate::types::SchemaPath;

/// Receives `NotificationDelivery` frames from a master and hands them to an
/// application listener.
pub struct NotificationListenerActor;

pub struct ListenerArguments {
    pub device: DeviceId,
    pub listener: Arc<dyn NotificationListener>,
}

pub enum ListenerMessage {
    /// Encoded `NotificationDelivery` envelope.
    Frame(Vec<u8>),
}

pub struct ListenerState {
    device: DeviceId,
    listener: Arc<dyn NotificationListener>,
}

#[async_trait]
impl Actor for NotificationListenerActor {
    type Msg = ListenerMessage;
    type State = ListenerState;
    type Arguments = ListenerArguments;

    async fn pre_start(
        &self,
        _myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        Ok(ListenerState {
            device: args.device,
            listener: args.listener,
        })
    }

    async fn handle(
        &self,
        _myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        let ListenerMessage::Frame(bytes) = message;
        match Envelope::decode(&bytes) {
            Ok(Envelope::NotificationDelivery { path, body, event_time }) => {
                let notification = DeviceNotification {
                    path,
                    body: body.node,
                    event_time,
                };
                debug!(device = %state.device, %notification, "notification received");
                state.listener.on_notification(&notification);
            }
            Ok(other) => {
                warn!(device = %state.device, kind = other.kind(), "ignoring non-notification frame");
            }
            Err(err) => {
                warn!(device = %state.device, error = %err, "dropping undecodable notification");
            }
        }
        Ok(())
    }
}

/// Handle for an active notification subscription.
///
/// Dropping it leaves the listener actor running; pass it to
/// `unsubscribe_notifications` to stop delivery.
pub struct NotificationRegistration {
    pub path: SchemaPath,
    pub address: ActorAddress,
    pub actor: ActorRef<ListenerMessage>,
}
