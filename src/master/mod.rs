//! Master side of a mount point.
//!
//! One [`MasterActor`] per device runs on the node that holds the live device
//! session. It owns the session, the capability set, the current write
//! transaction and the notification subscribers; nothing else touches them.
//!
//! The actor is not ready until [`MasterMessage::InitializeMasterData`] has
//! been processed. Until then, every request that would observe or change
//! device state is answered with `MasterNotReady`, and the mount status stays
//! `Connecting`. The status flips to `Connected` only after the
//! `MasterDataInitialized` reply has been sent.
//!
//! Device calls never run on the mailbox: they are spawned, reply straight to
//! the caller's port, and report transaction progress back to the actor as
//! continuation messages (`TxOpened`, `TxFinished`).

mod notifications;
mod writes;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ractor::Actor;
use ractor::ActorProcessingErr;
use ractor::ActorRef;
use ractor::RpcReplyPort;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::watch;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

pub use self::writes::TxOutcome;

use self::notifications::SubscriberRegistry;
use self::writes::TxRequest;
use self::writes::WriteQueue;
use crate::capabilities::CapabilitySet;
use crate::config::DeviceConfig;
use crate::config::NetmountConfig;
use crate::config::TimingConfig;
use crate::constants::MASTER_SHUTDOWN_CLEANUP_TIMEOUT_MS;
use crate::device::DeviceError;
use crate::device::DeviceNotification;
use crate::device::DeviceSession;
use crate::device::RpcOutcome;
use crate::device::SchemaSourceProvider;
use crate::envelope::Envelope;
use crate::error::MountError;
use crate::tx::TxError;
use crate::tx::TxProfile;
use crate::tx::WriteTx;
use crate::types::format_rpc_errors;
use crate::types::ActorAddress;
use crate::types::DeviceId;
use crate::types::InstancePath;
use crate::types::PathTree;
use crate::types::SourceIdentifier;
use crate::types::TxId;

/// Construction-time parameters of a master, injected by the hosting process.
#[derive(Clone)]
pub struct MasterSetup {
    /// Name of the hosting cluster node.
    pub node: String,
    pub device: DeviceId,
    pub timing: TimingConfig,
    pub lock_datastore: bool,
    pub user_capabilities: Vec<String>,
    pub override_capabilities: bool,
    /// Serves `SchemaSourceRequest`s.
    pub schema: Arc<dyn SchemaSourceProvider>,
}

impl MasterSetup {
    pub fn new(node: impl Into<String>, device: DeviceId, schema: Arc<dyn SchemaSourceProvider>) -> Self {
        Self {
            node: node.into(),
            device,
            timing: TimingConfig::default(),
            lock_datastore: true,
            user_capabilities: Vec::new(),
            override_capabilities: false,
            schema,
        }
    }

    pub fn from_config(
        config: &NetmountConfig,
        device: &DeviceConfig,
        schema: Arc<dyn SchemaSourceProvider>,
    ) -> Self {
        Self {
            node: config.node.name.clone(),
            device: device.device_id(),
            timing: config.timing,
            lock_datastore: device.lock_datastore,
            user_capabilities: device.user_capabilities.clone(),
            override_capabilities: device.override_capabilities,
            schema,
        }
    }

    /// Registry name of the master actor.
    pub fn address(&self) -> ActorAddress {
        ActorAddress::master(&self.node, &self.device)
    }

    fn effective_capabilities(&self, advertised: &CapabilitySet) -> CapabilitySet {
        if self.user_capabilities.is_empty() {
            advertised.clone()
        } else {
            advertised.with_user_capabilities(&self.user_capabilities, self.override_capabilities)
        }
    }
}

/// Device data handed to the master once the session is up.
#[derive(Clone)]
pub struct MasterData {
    /// Live session; also serves RPCs and actions.
    pub session: Arc<dyn DeviceSession>,
    /// Capabilities advertised by the device.
    pub capabilities: CapabilitySet,
    /// Schema sources the mount point exposes.
    pub sources: Vec<SourceIdentifier>,
}

/// Mount status published by the master.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MountStatus {
    /// Waiting for initial device data.
    Connecting,
    /// Master data initialized; device state is visible.
    Connected,
    /// Demoted or stopped.
    Unavailable,
}

/// Counters exposed through [`MasterMessage::GetStats`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MasterStats {
    pub ask_for_master: u64,
    pub requests: u64,
    pub transactions_committed: u64,
    pub transactions_failed: u64,
    pub transactions_cancelled: u64,
    pub notifications_delivered: u64,
    /// Write requests currently waiting behind the current transaction.
    pub queued_writes: usize,
}

/// Messages handled by [`MasterActor`].
pub enum MasterMessage {
    /// Initial (or renegotiated) device data. Replies `MasterDataInitialized`.
    InitializeMasterData(MasterData, RpcReplyPort<Envelope>),
    /// Replaces connection parameters; subscriptions are kept.
    RefreshSetup(MasterSetup),
    /// Typed request from a handle on this node.
    Request(Envelope, RpcReplyPort<Envelope>),
    /// Encoded request from another node.
    Frame(Vec<u8>, RpcReplyPort<Vec<u8>>),
    /// Notification emitted by the device.
    DeviceNotification(DeviceNotification),
    /// Lock sequence of a transaction finished.
    TxOpened { tx: TxId, result: Result<WriteTx, TxError> },
    /// A transaction released the device.
    TxFinished { tx: TxId, outcome: TxOutcome },
    /// Idle-timeout check for the current transaction.
    TxIdleCheck { tx: TxId },
    /// Another node won the election; answer everything with `NotMaster`.
    Demote,
    GetStats(RpcReplyPort<MasterStats>),
    Shutdown,
}

/// Where a reply goes: straight back to a local caller, or encoded for a
/// remote one.
pub(crate) enum ReplyTo {
    Local(RpcReplyPort<Envelope>),
    Remote {
        device: DeviceId,
        port: RpcReplyPort<Vec<u8>>,
    },
}

impl ReplyTo {
    pub(crate) fn send(self, envelope: Envelope) {
        match self {
            ReplyTo::Local(port) => {
                let _ = port.send(envelope);
            }
            ReplyTo::Remote { device, port } => {
                let bytes = envelope.encode().or_else(|err| {
                    error!(device = %device, error = %err, "failed to encode reply");
                    Envelope::Failure(MountError::Codec {
                        device: device.clone(),
                        reason: err.to_string(),
                    })
                    .encode()
                });
                match bytes {
                    Ok(bytes) => {
                        let _ = port.send(bytes);
                    }
                    Err(err) => error!(device = %device, error = %err, "dropping reply"),
                }
            }
        }
    }

    pub(crate) fn fail(self, error: MountError) {
        self.send(Envelope::Failure(error));
    }
}

pub struct MasterActor;

/// Arguments for spawning a [`MasterActor`].
pub struct MasterArguments {
    pub setup: MasterSetup,
    pub status: watch::Sender<MountStatus>,
}

struct Ready {
    session: Arc<dyn DeviceSession>,
    advertised: CapabilitySet,
    capabilities: CapabilitySet,
    profile: Option<TxProfile>,
    sources: Vec<SourceIdentifier>,
}

enum Role {
    Initializing,
    Ready(Ready),
    Demoted,
}

pub struct MasterState {
    setup: MasterSetup,
    address: ActorAddress,
    role: Role,
    writes: WriteQueue,
    subscribers: SubscriberRegistry,
    status: watch::Sender<MountStatus>,
    stats: MasterStats,
}

impl MasterState {
    fn device(&self) -> &DeviceId {
        &self.setup.device
    }

    fn not_master(&self) -> MountError {
        MountError::NotMaster {
            device: self.setup.device.clone(),
            address: self.address.clone(),
        }
    }

    fn ready(&self) -> Option<&Ready> {
        match &self.role {
            Role::Ready(ready) => Some(ready),
            _ => None,
        }
    }
}

#[async_trait]
impl Actor for MasterActor {
    type Msg = MasterMessage;
    type State = MasterState;
    type Arguments = MasterArguments;

    async fn pre_start(
        &self,
        _myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        let address = args.setup.address();
        info!(device = %args.setup.device, %address, "master actor starting");
        args.status.send_replace(MountStatus::Connecting);
        Ok(MasterState {
            writes: WriteQueue::new(args.setup.timing.max_queued_writes),
            address,
            setup: args.setup,
            role: Role::Initializing,
            subscribers: SubscriberRegistry::default(),
            status: args.status,
            stats: MasterStats::default(),
        })
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            MasterMessage::InitializeMasterData(data, reply) => {
                handle_initialize(&myself, state, data, reply);
            }
            MasterMessage::RefreshSetup(setup) => handle_refresh(state, setup),
            MasterMessage::Request(envelope, reply) => {
                dispatch(&myself, state, envelope, ReplyTo::Local(reply));
            }
            MasterMessage::Frame(bytes, port) => {
                let reply = ReplyTo::Remote {
                    device: state.device().clone(),
                    port,
                };
                match Envelope::decode(&bytes) {
                    Ok(envelope) => dispatch(&myself, state, envelope, reply),
                    Err(err) => {
                        warn!(device = %state.device(), error = %err, "dropping undecodable frame");
                        reply.fail(MountError::Codec {
                            device: state.device().clone(),
                            reason: err.to_string(),
                        });
                    }
                }
            }
            MasterMessage::DeviceNotification(notification) => {
                if state.ready().is_some() {
                    let delivered = state.subscribers.deliver(&state.setup.device, &notification);
                    state.stats.notifications_delivered += delivered as u64;
                } else {
                    debug!(device = %state.device(), %notification, "dropping notification, master not ready");
                }
            }
            MasterMessage::TxOpened { tx, result } => state.on_tx_opened(&myself, tx, result),
            MasterMessage::TxFinished { tx, outcome } => state.on_tx_finished(&myself, tx, outcome),
            MasterMessage::TxIdleCheck { tx } => state.on_idle_check(&myself, tx),
            MasterMessage::Demote => handle_demote(state),
            MasterMessage::GetStats(reply) => {
                let mut stats = state.stats.clone();
                stats.queued_writes = state.writes.queued();
                let _ = reply.send(stats);
            }
            MasterMessage::Shutdown => {
                warn!(device = %state.device(), "master actor shutting down");
                myself.stop(Some("master-shutdown".into()));
            }
        }
        Ok(())
    }

    async fn post_stop(
        &self,
        _myself: ActorRef<Self::Msg>,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        let error = state.not_master();
        let open = state.writes.abort_all(error);
        let session = match std::mem::replace(&mut state.role, Role::Demoted) {
            Role::Ready(ready) => Some(ready.session),
            _ => None,
        };
        state.status.send_replace(MountStatus::Unavailable);

        let cleanup = async {
            if let Some(release) = open {
                release.wait().await;
            }
            if let Some(session) = session {
                session.close().await;
            }
        };
        if tokio::time::timeout(Duration::from_millis(MASTER_SHUTDOWN_CLEANUP_TIMEOUT_MS), cleanup)
            .await
            .is_err()
        {
            warn!(device = %state.device(), "device cleanup did not finish before shutdown");
        }
        info!(device = %state.device(), "master actor stopped");
        Ok(())
    }
}

fn handle_initialize(
    myself: &ActorRef<MasterMessage>,
    state: &mut MasterState,
    data: MasterData,
    reply: RpcReplyPort<Envelope>,
) {
    if matches!(state.role, Role::Demoted) {
        let _ = reply.send(Envelope::Failure(state.not_master()));
        return;
    }

    if let Role::Ready(previous) = &state.role {
        info!(device = %state.device(), "device session renegotiated, replacing master data");
        let error = state.not_master();
        let open = state.writes.abort_all(error);
        let session = previous.session.clone();
        if !Arc::ptr_eq(&session, &data.session) {
            tokio::spawn(async move {
                if let Some(release) = open {
                    release.wait().await;
                }
                session.close().await;
            });
        }
    }

    let capabilities = state.setup.effective_capabilities(&data.capabilities);
    let profile = TxProfile::select(&capabilities);
    if profile.is_none() {
        warn!(device = %state.device(), %capabilities, "device supports neither candidate nor writable-running");
    }
    info!(
        device = %state.device(),
        sources = data.sources.len(),
        profile = ?profile,
        "master data initialized"
    );
    state.role = Role::Ready(Ready {
        session: data.session,
        advertised: data.capabilities,
        capabilities,
        profile,
        sources: data.sources,
    });

    let _ = reply.send(Envelope::MasterDataInitialized);
    state.status.send_replace(MountStatus::Connected);
    debug!(device = %state.device(), master = %myself.get_id(), "mount point operational");
}

fn handle_refresh(state: &mut MasterState, setup: MasterSetup) {
    if setup.device != state.setup.device || setup.node != state.setup.node {
        warn!(device = %state.device(), new_device = %setup.device, "ignoring setup for a different mount point");
        return;
    }
    info!(device = %state.device(), "refreshing master setup");
    state.writes.set_limit(setup.timing.max_queued_writes);
    state.setup = setup;
    if let Role::Ready(ready) = &mut state.role {
        ready.capabilities = state.setup.effective_capabilities(&ready.advertised);
        ready.profile = TxProfile::select(&ready.capabilities);
    }
}

fn handle_demote(state: &mut MasterState) {
    if matches!(state.role, Role::Demoted) {
        return;
    }
    warn!(device = %state.device(), "master demoted, releasing device");
    let error = state.not_master();
    let open = state.writes.abort_all(error);
    state.subscribers.clear();
    if let Role::Ready(ready) = std::mem::replace(&mut state.role, Role::Demoted) {
        tokio::spawn(async move {
            if let Some(release) = open {
                release.wait().await;
            }
            ready.session.close().await;
        });
    }
    state.status.send_replace(MountStatus::Unavailable);
}

fn dispatch(myself: &ActorRef<MasterMessage>, state: &mut MasterState, envelope: Envelope, reply: ReplyTo) {
    state.stats.requests += 1;
    debug!(device = %state.device(), kind = envelope.kind(), "master request");

    let ready = match &state.role {
        Role::Demoted => {
            debug!(device = %state.device(), kind = envelope.kind(), "rejecting request, not master");
            return reply.fail(state.not_master());
        }
        Role::Initializing if envelope.requires_ready_master() => {
            debug!(device = %state.device(), kind = envelope.kind(), "rejecting request, master not ready");
            return reply.fail(MountError::MasterNotReady {
                device: state.device().clone(),
            });
        }
        Role::Initializing => None,
        Role::Ready(ready) => Some(ready),
    };
    let Some(ready) = ready else {
        return reply.fail(unexpected(state.device(), &envelope));
    };

    let device = state.device().clone();
    let session = ready.session.clone();
    match envelope {
        Envelope::AskForMaster { requester } => {
            state.stats.ask_for_master += 1;
            debug!(device = %device, %requester, "answering master discovery");
            reply.send(Envelope::RegisterMountPoint {
                sources: ready.sources.clone(),
                master: state.address.clone(),
            });
        }
        Envelope::SchemaSourceRequest { source } => {
            let schema = state.setup.schema.clone();
            tokio::spawn(async move {
                let text = match schema.resolve_source(&source).await {
                    Ok(text) => Some(text),
                    Err(err) => {
                        debug!(device = %device, error = %err, "schema source not found");
                        None
                    }
                };
                reply.send(Envelope::SchemaSourceReply { source, text });
            });
        }
        Envelope::InvokeRpc { path, input } => {
            tokio::spawn(async move {
                let result = session.invoke_rpc(&path, input.as_ref().map(|tree| &tree.node)).await;
                reply.send(operation_reply(&device, &format!("rpc {path}"), result, false));
            });
        }
        Envelope::InvokeAction { path, target, input } => {
            tokio::spawn(async move {
                let result = session
                    .invoke_action(&path, &target, input.as_ref().map(|tree| &tree.node))
                    .await;
                reply.send(operation_reply(&device, &format!("action {path}"), result, true));
            });
        }
        Envelope::TreeRead { datastore, path } => {
            tokio::spawn(async move {
                let envelope = match session.read(datastore, &path).await {
                    Ok(outcome) if outcome.is_success() => Envelope::TreeReadReply {
                        tree: outcome.output.map(|node| PathTree::new(path, node)),
                    },
                    Ok(outcome) => Envelope::Failure(MountError::Rpc {
                        device,
                        operation: format!("read {datastore} {path}"),
                        reason: format_rpc_errors(&outcome.errors),
                    }),
                    Err(err) => Envelope::Failure(MountError::Rpc {
                        device,
                        operation: format!("read {datastore} {path}"),
                        reason: err.to_string(),
                    }),
                };
                reply.send(envelope);
            });
        }
        Envelope::TreeWrite { tx, datastore, op } => {
            state.handle_tx_request(myself, tx, TxRequest::Write { datastore, op }, reply);
        }
        Envelope::TxCommit { tx } => state.handle_tx_request(myself, tx, TxRequest::Commit, reply),
        Envelope::TxCancel { tx } => state.handle_tx_request(myself, tx, TxRequest::Cancel, reply),
        Envelope::SubscribeNotifications { path, subscriber } => {
            match state.subscribers.subscribe(path, subscriber) {
                Ok(()) => reply.send(Envelope::Ack),
                Err(limit) => reply.fail(MountError::Busy { device, limit }),
            }
        }
        Envelope::UnsubscribeNotifications { path, subscriber } => {
            state.subscribers.unsubscribe(&path, &subscriber);
            reply.send(Envelope::Ack);
        }
        other => reply.fail(unexpected(&device, &other)),
    }
}

fn unexpected(device: &DeviceId, envelope: &Envelope) -> MountError {
    MountError::UnexpectedMessage {
        device: device.clone(),
        kind: envelope.kind().to_string(),
    }
}

/// Maps a device reply to the RPC/action reply envelope.
fn operation_reply(
    device: &DeviceId,
    operation: &str,
    result: Result<RpcOutcome, DeviceError>,
    action: bool,
) -> Envelope {
    match result {
        Ok(RpcOutcome { output: None, errors }) if errors.is_empty() => Envelope::EmptyResult,
        Ok(RpcOutcome { output, errors }) => {
            let output = output.map(|node| PathTree::new(InstancePath::root(), node));
            if action {
                Envelope::InvokeActionReply { output, errors }
            } else {
                Envelope::InvokeRpcReply { output, errors }
            }
        }
        Err(err) => Envelope::Failure(MountError::Rpc {
            device: device.clone(),
            operation: operation.to_string(),
            reason: err.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::QName;
    use crate::types::RpcError;
    use crate::types::SchemaPath;

    fn device() -> DeviceId {
        DeviceId::new("r1", "10.0.0.1:830")
    }

    #[test]
    fn test_empty_rpc_result() {
        let reply = operation_reply(&device(), "rpc", Ok(RpcOutcome::ok()), false);
        assert_eq!(reply, Envelope::EmptyResult);
    }

    #[test]
    fn test_rpc_errors_are_returned_not_raised() {
        let errors = vec![RpcError::new("access-denied", "nope")];
        let reply = operation_reply(&device(), "rpc", Ok(RpcOutcome::failed(errors.clone())), false);
        assert_eq!(reply, Envelope::InvokeRpcReply { output: None, errors });
    }

    #[test]
    fn test_action_output_is_anchored_at_root() {
        let node = crate::types::DataNode::container(QName::new("urn:test", "out"), vec![]);
        let reply = operation_reply(&device(), "action", Ok(RpcOutcome::with_output(node.clone())), true);
        assert_eq!(
            reply,
            Envelope::InvokeActionReply {
                output: Some(PathTree::new(InstancePath::root(), node)),
                errors: vec![],
            }
        );
    }

    #[test]
    fn test_oversized_remote_reply_becomes_codec_failure() {
        let (port, mut rx) = tokio::sync::oneshot::channel();
        let reply = ReplyTo::Remote {
            device: device(),
            port: port.into(),
        };
        let huge = crate::types::DataNode::leaf(
            QName::new("urn:test", "blob"),
            crate::types::Value::String("x".repeat(crate::constants::MAX_ENVELOPE_SIZE)),
        );
        reply.send(Envelope::TreeReadReply {
            tree: Some(PathTree::new(InstancePath::root(), huge)),
        });

        let bytes = rx.try_recv().unwrap();
        match Envelope::decode(&bytes).unwrap() {
            Envelope::Failure(MountError::Codec { device: failed, reason }) => {
                assert_eq!(failed, device());
                assert!(reason.contains("exceeds limit"), "{reason}");
            }
            other => panic!("unexpected reply {other:?}"),
        }
    }

    #[test]
    fn test_transport_failure_names_operation() {
        let path = SchemaPath::absolute([QName::new("urn:test", "reboot")]);
        let reply = operation_reply(
            &device(),
            &format!("rpc {path}"),
            Err(DeviceError::Transport { reason: "down".into() }),
            false,
        );
        match reply {
            Envelope::Failure(MountError::Rpc { operation, .. }) => assert!(operation.contains("reboot")),
            other => panic!("unexpected reply {other:?}"),
        }
    }
}
