//! Ports to the external collaborators: the device-protocol session, the
//! schema source repository and notification listeners.
//!
//! The wire codec (XML framing over SSH/TLS) lives behind [`DeviceSession`];
//! nothing in this crate parses device replies itself. A session reports a
//! well-formed reply as [`RpcOutcome`] (which may still carry `rpc-error`s)
//! and a transport or framing problem as [`DeviceError`].

use std::fmt;
use std::time::SystemTime;

use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;
use snafu::Snafu;

use crate::types::Datastore;
use crate::types::DataNode;
use crate::types::EditOperation;
use crate::types::InstancePath;
use crate::types::LogicalDatastore;
use crate::types::RpcError;
use crate::types::SchemaPath;
use crate::types::SourceIdentifier;

/// Reply to a device operation that reached the device and came back well-formed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcOutcome {
    pub output: Option<DataNode>,
    pub errors: Vec<RpcError>,
}

impl RpcOutcome {
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn with_output(output: DataNode) -> Self {
        Self {
            output: Some(output),
            errors: Vec::new(),
        }
    }

    pub fn failed(errors: Vec<RpcError>) -> Self {
        Self { output: None, errors }
    }

    /// A reply is successful when it carries no error-severity rpc-error.
    pub fn is_success(&self) -> bool {
        !self.errors.iter().any(RpcError::is_error)
    }
}

/// Failure to obtain a usable reply from the device.
#[derive(Debug, Clone, Snafu, PartialEq, Eq, Serialize, Deserialize)]
#[snafu(visibility(pub))]
pub enum DeviceError {
    /// Session is down or the request could not be delivered.
    #[snafu(display("transport failure: {reason}"))]
    Transport { reason: String },

    /// Device answered with something that is not a valid reply.
    #[snafu(display("malformed reply: {reason}"))]
    Malformed { reason: String },
}

/// Edit-config request built by the transaction engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditConfig {
    /// Node the edit is anchored at.
    pub path: InstancePath,
    /// Tree to write; absent for delete/remove.
    pub data: Option<DataNode>,
    /// `operation` attribute placed on the anchored node.
    pub operation: Option<EditOperation>,
    /// `default-operation` of the whole edit-config.
    pub default_operation: Option<EditOperation>,
    /// Request `error-option rollback-on-error`.
    pub rollback_on_error: bool,
}

/// Live NETCONF session to one device.
///
/// Every call is asynchronous; implementations must not block the caller's
/// executor thread while waiting for the device.
#[async_trait]
pub trait DeviceSession: Send + Sync {
    async fn lock(&self, datastore: Datastore) -> Result<RpcOutcome, DeviceError>;

    async fn unlock(&self, datastore: Datastore) -> Result<RpcOutcome, DeviceError>;

    async fn discard_changes(&self) -> Result<RpcOutcome, DeviceError>;

    async fn edit_config(&self, datastore: Datastore, edit: &EditConfig) -> Result<RpcOutcome, DeviceError>;

    async fn commit(&self) -> Result<RpcOutcome, DeviceError>;

    /// `get-config` for configuration reads, `get` for operational ones.
    async fn read(&self, datastore: LogicalDatastore, path: &InstancePath) -> Result<RpcOutcome, DeviceError>;

    async fn invoke_rpc(&self, rpc: &SchemaPath, input: Option<&DataNode>) -> Result<RpcOutcome, DeviceError>;

    async fn invoke_action(
        &self,
        action: &SchemaPath,
        target: &InstancePath,
        input: Option<&DataNode>,
    ) -> Result<RpcOutcome, DeviceError>;

    /// Tears the session down. Called once by the owning actor.
    async fn close(&self);
}

/// Requested schema source is not known to the repository.
#[derive(Debug, Clone, PartialEq, Eq, Snafu)]
#[snafu(display("schema source {source_id} not found"))]
pub struct MissingSource {
    pub source_id: SourceIdentifier,
}

/// Repository of schema source texts.
#[async_trait]
pub trait SchemaSourceProvider: Send + Sync {
    async fn resolve_source(&self, id: &SourceIdentifier) -> Result<String, MissingSource>;
}

/// Notification emitted by a device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceNotification {
    pub path: SchemaPath,
    pub body: DataNode,
    pub event_time: SystemTime,
}

/// Receives notifications for the schema paths it subscribed to.
pub trait NotificationListener: Send + Sync {
    fn on_notification(&self, notification: &DeviceNotification);
}

impl<F> NotificationListener for F
where
    F: Fn(&DeviceNotification) + Send + Sync,
{
    fn on_notification(&self, notification: &DeviceNotification) {
        self(notification)
    }
}

impl fmt::Display for DeviceNotification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "notification {}", self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_source_names_the_source() {
        let err = MissingSource {
            source_id: SourceIdentifier::new("ietf-interfaces", Some("2018-02-20".to_string())),
        };
        let message = err.to_string();
        assert!(message.starts_with("schema source "), "{message}");
        assert!(message.contains("ietf-interfaces"), "{message}");
        assert!(message.ends_with(" not found"), "{message}");
        let _: &dyn std::error::Error = &err;
    }
}
