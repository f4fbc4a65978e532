//! Notification subscribers of a master, keyed by schema path.

use std::collections::BTreeMap;

use ractor::ActorRef;
use tracing::debug;
use tracing::error;
use tracing::warn;

use crate::constants::MAX_SUBSCRIBERS_PER_PATH;
use crate::device::DeviceNotification;
use crate::envelope::Envelope;
use crate::mount::ListenerMessage;
use crate::types::ActorAddress;
use crate::types::DeviceId;
use crate::types::InstancePath;
use crate::types::PathTree;
use crate::types::SchemaPath;

#[derive(Debug, Default)]
pub(super) struct SubscriberRegistry {
    subscribers: BTreeMap<SchemaPath, Vec<ActorAddress>>,
}

impl SubscriberRegistry {
    /// Adds `subscriber`; subscribing twice is a no-op. Fails with the limit
    /// when the path is full.
    pub(super) fn subscribe(&mut self, path: SchemaPath, subscriber: ActorAddress) -> Result<(), usize> {
        let entry = self.subscribers.entry(path).or_default();
        if entry.contains(&subscriber) {
            return Ok(());
        }
        if entry.len() >= MAX_SUBSCRIBERS_PER_PATH {
            return Err(MAX_SUBSCRIBERS_PER_PATH);
        }
        entry.push(subscriber);
        Ok(())
    }

    pub(super) fn unsubscribe(&mut self, path: &SchemaPath, subscriber: &ActorAddress) {
        if let Some(entry) = self.subscribers.get_mut(path) {
            entry.retain(|s| s != subscriber);
            if entry.is_empty() {
                self.subscribers.remove(path);
            }
        }
    }

    pub(super) fn clear(&mut self) {
        self.subscribers.clear();
    }

    #[cfg(test)]
    fn subscribers(&self, path: &SchemaPath) -> &[ActorAddress] {
        self.subscribers.get(path).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Sends `notification` to every subscriber of its path and returns how
    /// many received it. Subscribers that no longer resolve are dropped.
    pub(super) fn deliver(&mut self, device: &DeviceId, notification: &DeviceNotification) -> usize {
        let Some(subscribers) = self.subscribers.get_mut(&notification.path) else {
            debug!(device = %device, %notification, "no subscribers");
            return 0;
        };

        let envelope = Envelope::NotificationDelivery {
            path: notification.path.clone(),
            body: PathTree::new(InstancePath::root(), notification.body.clone()),
            event_time: notification.event_time,
        };
        let frame = match envelope.encode() {
            Ok(frame) => frame,
            Err(err) => {
                error!(device = %device, %notification, error = %err, "failed to encode notification");
                return 0;
            }
        };

        let mut delivered = 0;
        subscribers.retain(|subscriber| {
            let Some(cell) = ractor::registry::where_is(subscriber.as_str().to_string()) else {
                warn!(device = %device, %subscriber, "dropping unreachable notification subscriber");
                return false;
            };
            let listener: ActorRef<ListenerMessage> = cell.into();
            match listener.cast(ListenerMessage::Frame(frame.clone())) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(err) => {
                    warn!(device = %device, %subscriber, error = %err, "dropping notification subscriber");
                    false
                }
            }
        });
        if subscribers.is_empty() {
            self.subscribers.remove(&notification.path);
        }
        debug!(device = %device, %notification, delivered, "notification fanned out");
        delivered
    }
}
