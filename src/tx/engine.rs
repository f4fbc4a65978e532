//! Write transaction state machine.
//!
//! ```text
//! New --begin--> Locked --edit*--> Editing --commit--> Committing --> Committed
//!                                     \--cancel/edit error--> Discarding --> Aborted
//! ```
//!
//! [`WriteTx::begin`] returns only once the datastore locks are held. After
//! that, every edit, the commit and the cancel are commands on an ordered
//! channel consumed by a per-transaction worker task, so device calls are
//! issued strictly in the order the caller made them and the caller never
//! waits on the device except through the future returned by
//! [`WriteTx::commit`].
//!
//! Cleanup (discard-changes, unlock) is best effort: a cleanup failure is
//! logged and never replaces the failure that triggered it.

use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tracing::debug;
use tracing::error;
use tracing::trace;
use tracing::warn;

use super::error::TxError;
use super::error::TxPhase;
use super::profile::TxProfile;
use crate::device::DeviceError;
use crate::device::DeviceSession;
use crate::device::EditConfig;
use crate::device::RpcOutcome;
use crate::types::format_rpc_errors;
use crate::types::Datastore;
use crate::types::DataNode;
use crate::types::DeviceId;
use crate::types::EditOperation;
use crate::types::InstancePath;
use crate::types::LogicalDatastore;
use crate::types::TxId;

/// Per-transaction flags derived from capabilities and device configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxSettings {
    /// Request rollback-on-error on every edit-config.
    pub rollback_on_error: bool,
    /// Lock datastores around the transaction.
    pub lock_datastore: bool,
}

impl Default for TxSettings {
    fn default() -> Self {
        Self {
            rollback_on_error: false,
            lock_datastore: true,
        }
    }
}

/// One queued edit. Never mutated once appended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingEdit {
    pub path: InstancePath,
    pub data: Option<DataNode>,
    /// `Merge`, `Replace` or `Delete`.
    pub operation: EditOperation,
    pub default_operation: Option<EditOperation>,
}

impl PendingEdit {
    fn verb(&self) -> &'static str {
        match self.operation {
            EditOperation::Replace => "put",
            EditOperation::Delete | EditOperation::Remove => "delete",
            _ => "merge",
        }
    }

    fn to_edit_config(&self, rollback_on_error: bool) -> EditConfig {
        // Merge is the protocol default and needs no explicit attribute.
        let operation = match self.operation {
            EditOperation::Merge => None,
            other => Some(other),
        };
        EditConfig {
            path: self.path.clone(),
            data: self.data.clone(),
            operation,
            default_operation: self.default_operation,
            rollback_on_error,
        }
    }
}

/// Observer of transaction lifecycle events.
pub trait TxListener: Send + Sync {
    fn on_submitted(&self, _tx: TxId) {}
    fn on_successful(&self, _tx: TxId) {}
    fn on_failed(&self, _tx: TxId, _error: &TxError) {}
    fn on_cancelled(&self, _tx: TxId) {}
}

#[derive(Debug, Clone)]
enum TxStatus {
    Open,
    Finished,
    Failed(TxError),
}

struct TxShared {
    status: Mutex<TxStatus>,
    listeners: Mutex<Vec<Arc<dyn TxListener>>>,
}

impl TxShared {
    fn listeners(&self) -> Vec<Arc<dyn TxListener>> {
        self.listeners.lock().clone()
    }
}

enum TxCommand {
    Edit(PendingEdit),
    Commit(oneshot::Sender<Result<(), TxError>>),
    Cancel,
}

/// Everything needed to talk to the device on behalf of one transaction.
pub struct TxContext {
    pub id: TxId,
    pub device: DeviceId,
    pub session: Arc<dyn DeviceSession>,
    pub profile: TxProfile,
    pub settings: TxSettings,
}

enum Failure {
    Rejected(String),
    Malformed(String),
}

impl Failure {
    fn reason(&self) -> String {
        match self {
            Failure::Rejected(reason) => reason.clone(),
            Failure::Malformed(reason) => format!("malformed reply: {reason}"),
        }
    }
}

fn check(result: Result<RpcOutcome, DeviceError>) -> Result<RpcOutcome, Failure> {
    match result {
        Ok(outcome) if outcome.is_success() => Ok(outcome),
        Ok(outcome) => Err(Failure::Rejected(format_rpc_errors(&outcome.errors))),
        Err(DeviceError::Transport { reason }) => Err(Failure::Rejected(reason)),
        Err(DeviceError::Malformed { reason }) => Err(Failure::Malformed(reason)),
    }
}

impl TxContext {
    async fn lock(&self, datastore: Datastore) -> Result<(), TxError> {
        match check(self.session.lock(datastore).await) {
            Ok(_) => {
                trace!(device = %self.device, tx = %self.id, %datastore, "lock successful");
                Ok(())
            }
            Err(failure) => Err(TxError::LockFailure {
                device: self.device.clone(),
                tx: self.id,
                datastore,
                reason: failure.reason(),
            }),
        }
    }

    async fn unlock(&self, datastore: Datastore) {
        match check(self.session.unlock(datastore).await) {
            Ok(_) => trace!(device = %self.device, tx = %self.id, %datastore, "unlock successful"),
            Err(failure) => warn!(
                device = %self.device,
                tx = %self.id,
                %datastore,
                reason = %failure.reason(),
                "unlock failed"
            ),
        }
    }

    async fn discard_changes(&self) {
        if !self.profile.uses_candidate() {
            return;
        }
        match check(self.session.discard_changes().await) {
            Ok(_) => trace!(device = %self.device, tx = %self.id, "discard changes successful"),
            Err(failure) => warn!(
                device = %self.device,
                tx = %self.id,
                reason = %failure.reason(),
                "discarding candidate failed"
            ),
        }
    }

    async fn unlock_all(&self) {
        if !self.settings.lock_datastore {
            return;
        }
        for datastore in self.profile.unlock_order() {
            self.unlock(*datastore).await;
        }
    }

    /// Discard then unlock, never failing.
    async fn abort(&self) {
        self.discard_changes().await;
        self.unlock_all().await;
    }

    async fn lock_candidate_with_retry(&self) -> Result<(), TxError> {
        let Err(first) = self.lock(Datastore::Candidate).await else {
            return Ok(());
        };
        warn!(device = %self.device, tx = %self.id, error = %first, "failed to lock candidate, attempting discard changes");
        self.discard_changes().await;
        debug!(device = %self.device, tx = %self.id, "retrying candidate lock");
        self.lock(Datastore::Candidate).await.inspect_err(|second| {
            error!(device = %self.device, tx = %self.id, error = %second, "failed to prepare candidate, transaction unusable");
        })
    }

    async fn lock_datastores(&self) -> Result<(), TxError> {
        if !self.settings.lock_datastore {
            debug!(device = %self.device, tx = %self.id, "datastore locking disabled");
            return Ok(());
        }
        match self.profile {
            TxProfile::Running => self.lock(Datastore::Running).await,
            TxProfile::Candidate => self.lock_candidate_with_retry().await,
            TxProfile::CandidateRunning => {
                self.lock(Datastore::Running).await?;
                if let Err(err) = self.lock_candidate_with_retry().await {
                    self.unlock(Datastore::Running).await;
                    return Err(err);
                }
                Ok(())
            }
        }
    }

    async fn edit(&self, edit: &PendingEdit) -> Result<(), TxError> {
        let datastore = self.profile.edit_target();
        let request = edit.to_edit_config(self.settings.rollback_on_error);
        match check(self.session.edit_config(datastore, &request).await) {
            Ok(_) => {
                trace!(device = %self.device, tx = %self.id, path = %edit.path, "edit {} successful", datastore);
                Ok(())
            }
            Err(Failure::Malformed(reason)) => Err(TxError::ProtocolFailure {
                device: self.device.clone(),
                tx: self.id,
                phase: TxPhase::Edit,
                reason,
            }),
            Err(Failure::Rejected(reason)) => Err(TxError::EditFailure {
                device: self.device.clone(),
                tx: self.id,
                datastore,
                operation: edit.verb().to_string(),
                path: edit.path.to_string(),
                reason,
            }),
        }
    }

    async fn commit(&self) -> Result<(), TxError> {
        if !self.profile.uses_candidate() {
            // Edits already landed in running.
            self.unlock_all().await;
            return Ok(());
        }
        match check(self.session.commit().await) {
            Ok(_) => {
                debug!(device = %self.device, tx = %self.id, "write successful, unlocking");
                self.unlock_all().await;
                Ok(())
            }
            Err(failure) => {
                let err = match failure {
                    Failure::Malformed(reason) => TxError::ProtocolFailure {
                        device: self.device.clone(),
                        tx: self.id,
                        phase: TxPhase::Commit,
                        reason,
                    },
                    Failure::Rejected(reason) => TxError::CommitFailure {
                        device: self.device.clone(),
                        tx: self.id,
                        reason,
                    },
                };
                error!(device = %self.device, tx = %self.id, error = %err, "write failed, discarding changes, unlocking");
                self.abort().await;
                Err(err)
            }
        }
    }
}

/// Handle to a locked, open write transaction.
///
/// Dropping the handle without committing or cancelling still releases the
/// device locks: the worker sees its command channel close and aborts.
pub struct WriteTx {
    ctx: Arc<TxContext>,
    shared: Arc<TxShared>,
    commands: mpsc::UnboundedSender<TxCommand>,
    closed: watch::Receiver<bool>,
}

impl WriteTx {
    /// Locks the datastores required by the profile and starts the worker.
    ///
    /// Fails with [`TxError::LockFailure`] if the locks cannot be acquired; the
    /// failed instance is gone and a new transaction must be started.
    pub async fn begin(ctx: TxContext) -> Result<Self, TxError> {
        trace!(device = %ctx.device, tx = %ctx.id, profile = %ctx.profile, "initializing transaction");
        ctx.lock_datastores().await?;

        let ctx = Arc::new(ctx);
        let shared = Arc::new(TxShared {
            status: Mutex::new(TxStatus::Open),
            listeners: Mutex::new(Vec::new()),
        });
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (closed_tx, closed_rx) = watch::channel(false);

        let worker = TxWorker {
            ctx: ctx.clone(),
            shared: shared.clone(),
            commands: commands_rx,
            closed: closed_tx,
            failed: None,
        };
        tokio::spawn(worker.run());

        Ok(Self {
            ctx,
            shared,
            commands: commands_tx,
            closed: closed_rx,
        })
    }

    pub fn id(&self) -> TxId {
        self.ctx.id
    }

    pub fn device(&self) -> &DeviceId {
        &self.ctx.device
    }

    pub fn profile(&self) -> TxProfile {
        self.ctx.profile
    }

    pub fn is_finished(&self) -> bool {
        !matches!(*self.shared.status.lock(), TxStatus::Open)
    }

    pub fn add_listener(&self, listener: Arc<dyn TxListener>) {
        self.shared.listeners.lock().push(listener);
    }

    /// Replaces the subtree at `path`.
    pub fn put(&self, store: LogicalDatastore, path: InstancePath, data: DataNode) -> Result<(), TxError> {
        self.check_editable(store)?;
        if contains_only_non_visible_data(&path, &data) {
            debug!(device = %self.ctx.device, tx = %self.ctx.id, %path, "ignoring put, resulting data structure is empty");
            return Ok(());
        }
        self.enqueue(PendingEdit {
            path,
            data: Some(data),
            operation: EditOperation::Replace,
            default_operation: None,
        })
    }

    /// Merges `data` into the subtree at `path`.
    pub fn merge(&self, store: LogicalDatastore, path: InstancePath, data: DataNode) -> Result<(), TxError> {
        self.check_editable(store)?;
        if contains_only_non_visible_data(&path, &data) {
            debug!(device = %self.ctx.device, tx = %self.ctx.id, %path, "ignoring merge, resulting data structure is empty");
            return Ok(());
        }
        self.enqueue(PendingEdit {
            path,
            data: Some(data),
            operation: EditOperation::Merge,
            default_operation: None,
        })
    }

    /// Deletes the subtree at `path`.
    pub fn delete(&self, store: LogicalDatastore, path: InstancePath) -> Result<(), TxError> {
        self.check_editable(store)?;
        self.enqueue(PendingEdit {
            path,
            data: None,
            operation: EditOperation::Delete,
            default_operation: Some(EditOperation::None),
        })
    }

    /// Submits the transaction.
    ///
    /// The commit command is queued behind all edits immediately; the returned
    /// future resolves once the device has committed and the locks are
    /// released, or with the original failure after cleanup.
    pub fn commit(&self) -> impl Future<Output = Result<(), TxError>> + Send + 'static {
        let submitted = self.submit();
        let device = self.ctx.device.clone();
        let tx = self.ctx.id;
        async move {
            let reply = submitted?;
            reply.await.unwrap_or_else(|_| {
                Err(TxError::CommitFailure {
                    device,
                    tx,
                    reason: "transaction worker stopped before replying".into(),
                })
            })
        }
    }

    /// Cancels the transaction: discard + unlock. Returns `false` if it was
    /// already finished.
    ///
    /// The worker is told to stop either way, so [`closed`](Self::closed)
    /// resolves even for a transaction whose edit already failed.
    pub fn cancel(&self) -> bool {
        let open = {
            let mut status = self.shared.status.lock();
            let open = matches!(*status, TxStatus::Open);
            if open {
                *status = TxStatus::Finished;
            }
            open
        };
        if open {
            debug!(device = %self.ctx.device, tx = %self.ctx.id, "cancelling transaction");
            for listener in self.shared.listeners() {
                listener.on_cancelled(self.ctx.id);
            }
        }
        // Fails only once the worker has exited.
        let _ = self.commands.send(TxCommand::Cancel);
        open
    }

    /// Resolves once the worker has released the device.
    pub async fn closed(&self) {
        self.released().await
    }

    /// Like [`closed`](Self::closed), but does not borrow the handle.
    pub fn released(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut closed = self.closed.clone();
        async move {
            let _ = closed.wait_for(|done| *done).await;
        }
    }

    fn check_editable(&self, store: LogicalDatastore) -> Result<(), TxError> {
        self.check_open()?;
        if store != LogicalDatastore::Configuration {
            return Err(TxError::NotConfigurationDatastore {
                device: self.ctx.device.clone(),
                tx: self.ctx.id,
                datastore: store,
            });
        }
        Ok(())
    }

    fn check_open(&self) -> Result<(), TxError> {
        match &*self.shared.status.lock() {
            TxStatus::Open => Ok(()),
            TxStatus::Finished => Err(TxError::AlreadyFinished {
                device: self.ctx.device.clone(),
                tx: self.ctx.id,
            }),
            TxStatus::Failed(err) => Err(err.clone()),
        }
    }

    fn enqueue(&self, edit: PendingEdit) -> Result<(), TxError> {
        trace!(device = %self.ctx.device, tx = %self.ctx.id, path = %edit.path, "queueing {}", edit.verb());
        self.commands.send(TxCommand::Edit(edit)).map_err(|_| TxError::AlreadyFinished {
            device: self.ctx.device.clone(),
            tx: self.ctx.id,
        })
    }

    fn submit(&self) -> Result<oneshot::Receiver<Result<(), TxError>>, TxError> {
        {
            let mut status = self.shared.status.lock();
            match &*status {
                TxStatus::Open => *status = TxStatus::Finished,
                TxStatus::Finished => {
                    return Err(TxError::AlreadyFinished {
                        device: self.ctx.device.clone(),
                        tx: self.ctx.id,
                    })
                }
                TxStatus::Failed(err) => return Err(err.clone()),
            }
        }
        for listener in self.shared.listeners() {
            listener.on_submitted(self.ctx.id);
        }
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands.send(TxCommand::Commit(reply_tx)).map_err(|_| TxError::AlreadyFinished {
            device: self.ctx.device.clone(),
            tx: self.ctx.id,
        })?;
        Ok(reply_rx)
    }
}

impl std::fmt::Debug for WriteTx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteTx")
            .field("id", &self.ctx.id)
            .field("device", &self.ctx.device)
            .field("profile", &self.ctx.profile)
            .field("finished", &self.is_finished())
            .finish()
    }
}

/// A top-level list written alone serializes to nothing; some devices reject
/// the resulting empty edit-config.
fn contains_only_non_visible_data(path: &InstancePath, data: &DataNode) -> bool {
    path.len() == 1 && data.is_mixin()
}

struct TxWorker {
    ctx: Arc<TxContext>,
    shared: Arc<TxShared>,
    commands: mpsc::UnboundedReceiver<TxCommand>,
    closed: watch::Sender<bool>,
    failed: Option<TxError>,
}

impl TxWorker {
    async fn run(mut self) {
        let mut finished = false;
        while let Some(command) = self.commands.recv().await {
            match command {
                TxCommand::Edit(edit) => {
                    if self.failed.is_some() {
                        trace!(device = %self.ctx.device, tx = %self.ctx.id, path = %edit.path, "skipping edit after failure");
                        continue;
                    }
                    if let Err(err) = self.ctx.edit(&edit).await {
                        warn!(device = %self.ctx.device, tx = %self.ctx.id, error = %err, "edit failed, cancelling");
                        self.fail(err).await;
                    }
                }
                TxCommand::Commit(reply) => {
                    let result = match &self.failed {
                        Some(err) => Err(err.clone()),
                        None => self.ctx.commit().await,
                    };
                    match &result {
                        Ok(()) => {
                            for listener in self.shared.listeners() {
                                listener.on_successful(self.ctx.id);
                            }
                        }
                        Err(err) => {
                            *self.shared.status.lock() = TxStatus::Failed(err.clone());
                            for listener in self.shared.listeners() {
                                listener.on_failed(self.ctx.id, err);
                            }
                        }
                    }
                    let _ = reply.send(result);
                    finished = true;
                    break;
                }
                TxCommand::Cancel => {
                    if self.failed.is_none() {
                        self.ctx.abort().await;
                    }
                    finished = true;
                    break;
                }
            }
        }

        if !finished && self.failed.is_none() {
            warn!(device = %self.ctx.device, tx = %self.ctx.id, "transaction abandoned, releasing device locks");
            self.ctx.abort().await;
        }
        let _ = self.closed.send(true);
    }

    async fn fail(&mut self, err: TxError) {
        self.ctx.abort().await;
        *self.shared.status.lock() = TxStatus::Failed(err.clone());
        self.failed = Some(err);
    }
}
