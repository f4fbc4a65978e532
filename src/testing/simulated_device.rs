//! In-memory device session with call recording and fault injection.
//!
//! # Tiger Style
//!
//! - Every call is recorded before any fault is applied, so tests can assert
//!   on exactly what the engine attempted
//! - Faults are consumed: a fault injected `times(n)` fires at most n times

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::capabilities::CapabilitySet;
use crate::capabilities::NETCONF_CANDIDATE_URI;
use crate::capabilities::NETCONF_ROLLBACK_ON_ERROR_URI;
use crate::capabilities::NETCONF_RUNNING_WRITABLE_URI;
use crate::device::DeviceError;
use crate::device::DeviceSession;
use crate::device::EditConfig;
use crate::device::RpcOutcome;
use crate::types::Datastore;
use crate::types::DataNode;
use crate::types::EditOperation;
use crate::types::InstancePath;
use crate::types::LogicalDatastore;
use crate::types::RpcError;
use crate::types::SchemaPath;

/// One call as seen by the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceCall {
    Lock(Datastore),
    Unlock(Datastore),
    DiscardChanges,
    EditConfig { datastore: Datastore, edit: EditConfig },
    Commit,
    Read { datastore: LogicalDatastore, path: InstancePath },
    InvokeRpc(SchemaPath),
    InvokeAction { action: SchemaPath, target: InstancePath },
    Close,
}

impl DeviceCall {
    pub fn kind(&self) -> CallKind {
        match self {
            DeviceCall::Lock(ds) => CallKind::Lock(*ds),
            DeviceCall::Unlock(ds) => CallKind::Unlock(*ds),
            DeviceCall::DiscardChanges => CallKind::DiscardChanges,
            DeviceCall::EditConfig { .. } => CallKind::EditConfig,
            DeviceCall::Commit => CallKind::Commit,
            DeviceCall::Read { .. } => CallKind::Read,
            DeviceCall::InvokeRpc(_) => CallKind::InvokeRpc,
            DeviceCall::InvokeAction { .. } => CallKind::InvokeAction,
            DeviceCall::Close => CallKind::Close,
        }
    }
}

/// Call shape, used to target faults and to summarize call logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallKind {
    Lock(Datastore),
    Unlock(Datastore),
    DiscardChanges,
    EditConfig,
    Commit,
    Read,
    InvokeRpc,
    InvokeAction,
    Close,
}

/// How an injected fault answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultReply {
    /// Well-formed reply carrying an `rpc-error`.
    Rejected,
    /// Reply that cannot be parsed.
    Malformed,
    /// Session failure.
    Transport,
}

/// A programmable failure for calls of one kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceFault {
    kind: CallKind,
    reply: FaultReply,
    skip: usize,
    remaining: usize,
}

impl DeviceFault {
    pub fn reject(kind: CallKind) -> Self {
        Self::new(kind, FaultReply::Rejected)
    }

    pub fn malformed(kind: CallKind) -> Self {
        Self::new(kind, FaultReply::Malformed)
    }

    pub fn transport(kind: CallKind) -> Self {
        Self::new(kind, FaultReply::Transport)
    }

    fn new(kind: CallKind, reply: FaultReply) -> Self {
        Self {
            kind,
            reply,
            skip: 0,
            remaining: 1,
        }
    }

    /// Fire on `n` consecutive matching calls.
    pub fn times(mut self, n: usize) -> Self {
        self.remaining = n;
        self
    }

    /// Let the first `n` matching calls succeed.
    pub fn after(mut self, n: usize) -> Self {
        self.skip = n;
        self
    }
}

#[derive(Debug, Default)]
struct DeviceState {
    calls: Vec<DeviceCall>,
    faults: Vec<DeviceFault>,
    running: BTreeMap<InstancePath, DataNode>,
    candidate: BTreeMap<InstancePath, DataNode>,
    rpc_replies: HashMap<SchemaPath, RpcOutcome>,
    latency: Option<Duration>,
    closed: bool,
}

impl DeviceState {
    fn take_fault(&mut self, kind: CallKind) -> Option<FaultReply> {
        let index = self.faults.iter().position(|f| f.kind == kind)?;
        let fault = &mut self.faults[index];
        if fault.skip > 0 {
            fault.skip -= 1;
            return None;
        }
        let reply = fault.reply;
        fault.remaining -= 1;
        if fault.remaining == 0 {
            self.faults.remove(index);
        }
        Some(reply)
    }

    fn store(&mut self, datastore: Datastore) -> &mut BTreeMap<InstancePath, DataNode> {
        match datastore {
            Datastore::Running => &mut self.running,
            Datastore::Candidate => &mut self.candidate,
        }
    }
}

/// Simulated NETCONF device.
#[derive(Debug)]
pub struct SimulatedDevice {
    capabilities: Vec<String>,
    state: Mutex<DeviceState>,
}

impl SimulatedDevice {
    /// Device advertising `capabilities`.
    pub fn new<I, S>(capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            capabilities: capabilities.into_iter().map(Into::into).collect(),
            state: Mutex::new(DeviceState::default()),
        }
    }

    /// Candidate-only device with rollback-on-error.
    pub fn candidate() -> Self {
        Self::new([NETCONF_CANDIDATE_URI, NETCONF_ROLLBACK_ON_ERROR_URI])
    }

    /// Device with both candidate and writable-running.
    pub fn candidate_running() -> Self {
        Self::new([NETCONF_CANDIDATE_URI, NETCONF_RUNNING_WRITABLE_URI])
    }

    /// Writable-running device without candidate.
    pub fn running() -> Self {
        Self::new([NETCONF_RUNNING_WRITABLE_URI])
    }

    pub fn advertised(&self) -> &[String] {
        &self.capabilities
    }

    pub fn capabilities(&self) -> CapabilitySet {
        CapabilitySet::from_advertised(&self.capabilities)
    }

    pub fn inject(&self, fault: DeviceFault) {
        self.state.lock().faults.push(fault);
    }

    /// Delay every call by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.state.lock().latency = Some(latency);
    }

    pub fn set_rpc_reply(&self, rpc: SchemaPath, reply: RpcOutcome) {
        self.state.lock().rpc_replies.insert(rpc, reply);
    }

    pub fn calls(&self) -> Vec<DeviceCall> {
        self.state.lock().calls.clone()
    }

    pub fn call_kinds(&self) -> Vec<CallKind> {
        self.state.lock().calls.iter().map(DeviceCall::kind).collect()
    }

    pub fn count(&self, kind: CallKind) -> usize {
        self.state.lock().calls.iter().filter(|c| c.kind() == kind).count()
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    /// Committed configuration at `path`.
    pub fn running_config(&self, path: &InstancePath) -> Option<DataNode> {
        self.state.lock().running.get(path).cloned()
    }

    /// Installs configuration directly, bypassing transactions.
    pub fn seed_running(&self, path: InstancePath, data: DataNode) {
        let mut state = self.state.lock();
        state.running.insert(path.clone(), data.clone());
        state.candidate.insert(path, data);
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    async fn call<F>(&self, call: DeviceCall, apply: F) -> Result<RpcOutcome, DeviceError>
    where
        F: FnOnce(&mut DeviceState) -> RpcOutcome,
    {
        let latency = self.state.lock().latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.state.lock();
        let kind = call.kind();
        state.calls.push(call);
        match state.take_fault(kind) {
            None => Ok(apply(&mut *state)),
            Some(FaultReply::Rejected) => Ok(RpcOutcome::failed(vec![RpcError::new(
                "operation-failed",
                format!("simulated {kind:?} failure"),
            )])),
            Some(FaultReply::Malformed) => Err(DeviceError::Malformed {
                reason: format!("simulated garbage reply to {kind:?}"),
            }),
            Some(FaultReply::Transport) => Err(DeviceError::Transport {
                reason: "simulated session drop".to_string(),
            }),
        }
    }
}

#[async_trait]
impl DeviceSession for SimulatedDevice {
    async fn lock(&self, datastore: Datastore) -> Result<RpcOutcome, DeviceError> {
        self.call(DeviceCall::Lock(datastore), |_| RpcOutcome::ok()).await
    }

    async fn unlock(&self, datastore: Datastore) -> Result<RpcOutcome, DeviceError> {
        self.call(DeviceCall::Unlock(datastore), |_| RpcOutcome::ok()).await
    }

    async fn discard_changes(&self) -> Result<RpcOutcome, DeviceError> {
        self.call(DeviceCall::DiscardChanges, |state| {
            state.candidate = state.running.clone();
            RpcOutcome::ok()
        })
        .await
    }

    async fn edit_config(&self, datastore: Datastore, edit: &EditConfig) -> Result<RpcOutcome, DeviceError> {
        let call = DeviceCall::EditConfig {
            datastore,
            edit: edit.clone(),
        };
        self.call(call, |state| {
            let store = state.store(datastore);
            match (edit.operation, &edit.data) {
                (Some(EditOperation::Delete | EditOperation::Remove), _) | (_, None) => {
                    store.remove(&edit.path);
                }
                (_, Some(data)) => {
                    store.insert(edit.path.clone(), data.clone());
                }
            }
            RpcOutcome::ok()
        })
        .await
    }

    async fn commit(&self) -> Result<RpcOutcome, DeviceError> {
        self.call(DeviceCall::Commit, |state| {
            state.running = state.candidate.clone();
            RpcOutcome::ok()
        })
        .await
    }

    async fn read(&self, datastore: LogicalDatastore, path: &InstancePath) -> Result<RpcOutcome, DeviceError> {
        let call = DeviceCall::Read {
            datastore,
            path: path.clone(),
        };
        self.call(call, |state| match state.running.get(path) {
            Some(node) => RpcOutcome::with_output(node.clone()),
            None => RpcOutcome::ok(),
        })
        .await
    }

    async fn invoke_rpc(&self, rpc: &SchemaPath, _input: Option<&DataNode>) -> Result<RpcOutcome, DeviceError> {
        self.call(DeviceCall::InvokeRpc(rpc.clone()), |state| {
            state.rpc_replies.get(rpc).cloned().unwrap_or_default()
        })
        .await
    }

    async fn invoke_action(
        &self,
        action: &SchemaPath,
        target: &InstancePath,
        _input: Option<&DataNode>,
    ) -> Result<RpcOutcome, DeviceError> {
        let call = DeviceCall::InvokeAction {
            action: action.clone(),
            target: target.clone(),
        };
        self.call(call, |state| state.rpc_replies.get(action).cloned().unwrap_or_default())
            .await
    }

    async fn close(&self) {
        let mut state = self.state.lock();
        state.calls.push(DeviceCall::Close);
        state.closed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fault_fires_after_skip_then_expires() {
        let device = SimulatedDevice::candidate();
        device.inject(DeviceFault::reject(CallKind::Lock(Datastore::Candidate)).after(1));

        assert!(device.lock(Datastore::Candidate).await.unwrap().is_success());
        assert!(!device.lock(Datastore::Candidate).await.unwrap().is_success());
        assert!(device.lock(Datastore::Candidate).await.unwrap().is_success());
        assert_eq!(device.count(CallKind::Lock(Datastore::Candidate)), 3);
    }

    #[tokio::test]
    async fn test_malformed_and_transport_faults() {
        let device = SimulatedDevice::candidate();
        device.inject(DeviceFault::malformed(CallKind::Commit));
        device.inject(DeviceFault::transport(CallKind::DiscardChanges));

        assert!(matches!(device.commit().await, Err(DeviceError::Malformed { .. })));
        assert!(matches!(device.discard_changes().await, Err(DeviceError::Transport { .. })));
    }

    #[tokio::test]
    async fn test_commit_publishes_candidate() {
        let device = SimulatedDevice::candidate();
        let path = InstancePath::root().node(crate::types::QName::new("urn:test", "system"));
        let data = DataNode::container(crate::types::QName::new("urn:test", "system"), vec![]);
        let edit = EditConfig {
            path: path.clone(),
            data: Some(data.clone()),
            operation: None,
            default_operation: None,
            rollback_on_error: false,
        };

        device.edit_config(Datastore::Candidate, &edit).await.unwrap();
        assert_eq!(device.running_config(&path), None);
        device.commit().await.unwrap();
        assert_eq!(device.running_config(&path), Some(data));
    }
}
