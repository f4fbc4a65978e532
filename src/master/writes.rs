//! The master's current write transaction and the writers queued behind it.
//!
//! At most one transaction holds the device at a time. Requests for any other
//! transaction id wait in FIFO order, grouped per id, and are replayed once
//! the current transaction has released the device.

use std::collections::VecDeque;
use std::time::Duration;

use ractor::ActorRef;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::MasterMessage;
use super::MasterState;
use super::ReplyTo;
use crate::constants::MAX_FINISHED_TX_HISTORY;
use crate::envelope::Envelope;
use crate::envelope::WriteOp;
use crate::error::MountError;
use crate::tx::TxContext;
use crate::tx::TxError;
use crate::tx::TxSettings;
use crate::tx::WriteTx;
use crate::types::LogicalDatastore;
use crate::types::TxId;

/// How a transaction left the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxOutcome {
    Committed,
    Failed,
    Cancelled,
}

pub(super) enum TxRequest {
    Write { datastore: LogicalDatastore, op: WriteOp },
    Commit,
    Cancel,
}

pub(super) struct QueuedRequest {
    request: TxRequest,
    reply: ReplyTo,
}

impl QueuedRequest {
    /// Answers without touching the device.
    fn reject(self, error: MountError) {
        match self.request {
            TxRequest::Cancel => self.reply.send(Envelope::TxCancelled { cancelled: false }),
            _ => self.reply.fail(error),
        }
    }
}

/// Device release that has to finish before the session may be closed.
pub(super) enum Release {
    Open(WriteTx),
    /// Flips to `true` once the lock sequence ended and whatever it locked
    /// has been released again.
    Opening(watch::Receiver<bool>),
}

impl Release {
    pub(super) async fn wait(self) {
        match self {
            Release::Open(tx) => tx.closed().await,
            Release::Opening(mut released) => {
                let _ = released.wait_for(|done| *done).await;
            }
        }
    }
}

enum Slot {
    /// Lock sequence running; requests wait here in arrival order.
    Opening {
        pending: VecDeque<QueuedRequest>,
        released: watch::Receiver<bool>,
    },
    Open { tx: WriteTx, last_activity: Instant },
    /// Commit or cancel issued; the transaction is owned by its finishing task.
    Closing,
}

struct Current {
    id: TxId,
    slot: Slot,
}

pub(super) struct WriteQueue {
    current: Option<Current>,
    waiting: VecDeque<(TxId, Vec<QueuedRequest>)>,
    queued: usize,
    limit: usize,
    /// Most recent last.
    finished: VecDeque<TxId>,
}

impl WriteQueue {
    pub(super) fn new(limit: usize) -> Self {
        Self {
            current: None,
            waiting: VecDeque::new(),
            queued: 0,
            limit,
            finished: VecDeque::new(),
        }
    }

    pub(super) fn queued(&self) -> usize {
        self.queued
    }

    pub(super) fn set_limit(&mut self, limit: usize) {
        self.limit = limit;
    }

    /// Fails every waiting request with `error` and cancels the current
    /// transaction. Returns what the caller must wait for before closing the
    /// session.
    pub(super) fn abort_all(&mut self, error: MountError) -> Option<Release> {
        for (_, requests) in self.waiting.drain(..) {
            for request in requests {
                request.reject(error.clone());
            }
        }
        self.queued = 0;

        match self.current.take()?.slot {
            Slot::Opening { pending, released } => {
                for request in pending {
                    request.reject(error.clone());
                }
                Some(Release::Opening(released))
            }
            Slot::Open { tx, .. } => {
                tx.cancel();
                Some(Release::Open(tx))
            }
            Slot::Closing => None,
        }
    }

    fn mark_finished(&mut self, id: TxId) {
        if self.finished.len() >= MAX_FINISHED_TX_HISTORY {
            self.finished.pop_front();
        }
        self.finished.push_back(id);
    }

    fn is_finished(&self, id: TxId) -> bool {
        self.finished.contains(&id)
    }

    fn enqueue(&mut self, id: TxId, request: QueuedRequest) -> Result<(), QueuedRequest> {
        if self.queued >= self.limit {
            return Err(request);
        }
        self.queued += 1;
        match self.waiting.iter_mut().find(|(waiting, _)| *waiting == id) {
            Some((_, requests)) => requests.push(request),
            None => self.waiting.push_back((id, vec![request])),
        }
        Ok(())
    }

    fn remove_waiting(&mut self, id: TxId) -> Option<Vec<QueuedRequest>> {
        let index = self.waiting.iter().position(|(waiting, _)| *waiting == id)?;
        let (_, requests) = self.waiting.remove(index)?;
        self.queued -= requests.len();
        Some(requests)
    }

    fn pop_waiting(&mut self) -> Option<(TxId, Vec<QueuedRequest>)> {
        let (id, requests) = self.waiting.pop_front()?;
        self.queued -= requests.len();
        Some((id, requests))
    }
}

impl MasterState {
    pub(super) fn handle_tx_request(
        &mut self,
        myself: &ActorRef<MasterMessage>,
        tx: TxId,
        request: TxRequest,
        reply: ReplyTo,
    ) {
        let request = QueuedRequest { request, reply };
        if self.writes.is_finished(tx) {
            debug!(device = %self.device(), %tx, "request for finished transaction");
            return request.reject(self.already_finished(tx));
        }
        let current = self.writes.current.as_ref().map(|c| c.id);

        match current {
            None if matches!(request.request, TxRequest::Cancel) => {
                debug!(device = %self.device(), %tx, "cancel for unknown transaction");
                request.reply.send(Envelope::TxCancelled { cancelled: false });
            }
            None => self.start_tx(myself, tx, VecDeque::from([request])),
            Some(id) if id == tx => self.route_to_current(myself, request),
            Some(_) if matches!(request.request, TxRequest::Cancel) => {
                let cancelled = match self.writes.remove_waiting(tx) {
                    Some(dropped) => {
                        debug!(device = %self.device(), %tx, dropped = dropped.len(), "cancelled queued transaction");
                        let error = self.already_finished(tx);
                        for request in dropped {
                            request.reject(error.clone());
                        }
                        self.writes.mark_finished(tx);
                        self.stats.transactions_cancelled += 1;
                        true
                    }
                    None => false,
                };
                request.reply.send(Envelope::TxCancelled { cancelled });
            }
            Some(id) => {
                debug!(device = %self.device(), %tx, current = %id, "queueing request behind current transaction");
                if let Err(request) = self.writes.enqueue(tx, request) {
                    warn!(device = %self.device(), %tx, limit = self.writes.limit, "write queue full");
                    request.reply.fail(MountError::Busy {
                        device: self.device().clone(),
                        limit: self.writes.limit,
                    });
                }
            }
        }
    }

    pub(super) fn on_tx_opened(
        &mut self,
        myself: &ActorRef<MasterMessage>,
        tx: TxId,
        result: Result<WriteTx, TxError>,
    ) {
        let device = self.device().clone();
        let Some(current) = self.writes.current.as_mut().filter(|c| c.id == tx) else {
            // Aborted while locking; dropping the handle releases the device.
            debug!(device = %device, %tx, "discarding transaction opened after abort");
            return;
        };
        if !matches!(current.slot, Slot::Opening { .. }) {
            warn!(device = %device, %tx, "transaction opened twice");
            return;
        }
        let Slot::Opening { pending, .. } = std::mem::replace(&mut current.slot, Slot::Closing) else {
            return;
        };

        match result {
            Ok(write_tx) => {
                debug!(device = %device, %tx, profile = %write_tx.profile(), "transaction locked");
                current.slot = Slot::Open {
                    tx: write_tx,
                    last_activity: Instant::now(),
                };
                if let Some(timeout) = self.setup.timing.write_tx_idle_timeout() {
                    schedule_idle_check(myself, tx, timeout);
                }
                for request in pending {
                    self.apply(myself, request);
                }
            }
            Err(err) => {
                warn!(device = %device, %tx, error = %err, "failed to open transaction");
                self.writes.current = None;
                self.writes.mark_finished(tx);
                self.stats.transactions_failed += 1;
                let error = MountError::from(err);
                for request in pending {
                    request.reject(error.clone());
                }
                self.promote_next(myself);
            }
        }
    }

    pub(super) fn on_tx_finished(&mut self, myself: &ActorRef<MasterMessage>, tx: TxId, outcome: TxOutcome) {
        match outcome {
            TxOutcome::Committed => self.stats.transactions_committed += 1,
            TxOutcome::Failed => self.stats.transactions_failed += 1,
            TxOutcome::Cancelled => self.stats.transactions_cancelled += 1,
        }
        self.writes.mark_finished(tx);
        if self.writes.current.as_ref().is_some_and(|c| c.id == tx) {
            debug!(device = %self.device(), %tx, ?outcome, "transaction released device");
            self.writes.current = None;
            self.promote_next(myself);
        }
    }

    pub(super) fn on_idle_check(&mut self, myself: &ActorRef<MasterMessage>, tx: TxId) {
        let Some(timeout) = self.setup.timing.write_tx_idle_timeout() else {
            return;
        };
        let device = self.device().clone();
        let Some(current) = self.writes.current.as_mut().filter(|c| c.id == tx) else {
            return;
        };
        let Slot::Open { last_activity, .. } = &current.slot else {
            return;
        };

        let idle = last_activity.elapsed();
        if idle < timeout {
            schedule_idle_check(myself, tx, timeout - idle);
            return;
        }

        info!(device = %device, %tx, idle_ms = idle.as_millis() as u64, "transaction idle, cancelling");
        if let Slot::Open { tx: write_tx, .. } = std::mem::replace(&mut current.slot, Slot::Closing) {
            let outcome = if write_tx.cancel() {
                TxOutcome::Cancelled
            } else {
                TxOutcome::Failed
            };
            finish_when_closed(myself, tx, write_tx, outcome, None);
        }
    }

    fn already_finished(&self, tx: TxId) -> MountError {
        MountError::from(TxError::AlreadyFinished {
            device: self.device().clone(),
            tx,
        })
    }

    /// Starts the lock sequence for `tx`; the caller guarantees no current
    /// transaction.
    fn start_tx(&mut self, myself: &ActorRef<MasterMessage>, tx: TxId, pending: VecDeque<QueuedRequest>) {
        let Some(ready) = self.ready() else {
            for request in pending {
                request.reject(MountError::MasterNotReady {
                    device: self.device().clone(),
                });
            }
            return;
        };
        let Some(profile) = ready.profile else {
            let error = MountError::from(TxError::UnsupportedDevice {
                device: self.device().clone(),
            });
            for request in pending {
                request.reject(error.clone());
            }
            self.writes.mark_finished(tx);
            self.promote_next(myself);
            return;
        };

        let ctx = TxContext {
            id: tx,
            device: self.device().clone(),
            session: ready.session.clone(),
            profile,
            settings: TxSettings {
                rollback_on_error: ready.capabilities.is_rollback_supported(),
                lock_datastore: self.setup.lock_datastore,
            },
        };
        debug!(device = %self.device(), %tx, %profile, "opening transaction");
        let (released_tx, released) = watch::channel(false);
        self.writes.current = Some(Current {
            id: tx,
            slot: Slot::Opening { pending, released },
        });

        let myself = myself.clone();
        tokio::spawn(async move {
            let result = WriteTx::begin(ctx).await;
            let closed = result.as_ref().ok().map(WriteTx::released);
            // A rejected cast drops the transaction, which releases the device.
            if myself.cast(MasterMessage::TxOpened { tx, result }).is_err() {
                debug!(%tx, "master gone before transaction opened");
            }
            if let Some(closed) = closed {
                closed.await;
            }
            let _ = released_tx.send(true);
        });
    }

    fn promote_next(&mut self, myself: &ActorRef<MasterMessage>) {
        if self.writes.current.is_some() {
            return;
        }
        if let Some((tx, requests)) = self.writes.pop_waiting() {
            debug!(device = %self.device(), %tx, "promoting queued transaction");
            self.start_tx(myself, tx, requests.into());
        }
    }

    fn route_to_current(&mut self, myself: &ActorRef<MasterMessage>, request: QueuedRequest) {
        let error = match self.writes.current.as_mut() {
            None => return,
            Some(current) => match &mut current.slot {
                Slot::Opening { pending, .. } => {
                    pending.push_back(request);
                    return;
                }
                Slot::Open { .. } => None,
                Slot::Closing => Some(current.id),
            },
        };
        match error {
            None => self.apply(myself, request),
            Some(id) => {
                let error = self.already_finished(id);
                request.reject(error);
            }
        }
    }

    /// Applies one request to the open current transaction.
    fn apply(&mut self, myself: &ActorRef<MasterMessage>, request: QueuedRequest) {
        let device = self.device().clone();
        let Some(current) = self.writes.current.as_mut() else {
            return;
        };
        let id = current.id;
        let Slot::Open { tx, last_activity } = &mut current.slot else {
            request.reject(MountError::from(TxError::AlreadyFinished { device, tx: id }));
            return;
        };
        *last_activity = Instant::now();

        let QueuedRequest { request, reply } = request;
        match request {
            TxRequest::Write { datastore, op } => {
                let result = match op {
                    WriteOp::Put(tree) => tx.put(datastore, tree.path, tree.node),
                    WriteOp::Merge(tree) => tx.merge(datastore, tree.path, tree.node),
                    WriteOp::Delete(path) => tx.delete(datastore, path),
                };
                match result {
                    Ok(()) => reply.send(Envelope::Ack),
                    Err(err) => reply.fail(MountError::from(err)),
                }
            }
            TxRequest::Commit => {
                let Slot::Open { tx, .. } = std::mem::replace(&mut current.slot, Slot::Closing) else {
                    return;
                };
                let commit = tx.commit();
                let myself = myself.clone();
                tokio::spawn(async move {
                    let result = commit.await;
                    let outcome = match &result {
                        Ok(()) => {
                            info!(device = %device, tx = %id, "transaction committed");
                            TxOutcome::Committed
                        }
                        Err(err) => {
                            warn!(device = %device, tx = %id, error = %err, "transaction failed");
                            TxOutcome::Failed
                        }
                    };
                    match result {
                        Ok(()) => reply.send(Envelope::Ack),
                        Err(err) => reply.fail(MountError::from(err)),
                    }
                    drop(tx);
                    let _ = myself.cast(MasterMessage::TxFinished { tx: id, outcome });
                });
            }
            TxRequest::Cancel => {
                let Slot::Open { tx, .. } = std::mem::replace(&mut current.slot, Slot::Closing) else {
                    return;
                };
                let cancelled = tx.cancel();
                let outcome = if cancelled {
                    TxOutcome::Cancelled
                } else {
                    TxOutcome::Failed
                };
                finish_when_closed(myself, id, tx, outcome, Some((reply, cancelled)));
            }
        }
    }
}

/// Waits for the transaction worker to release the device, then reports back.
fn finish_when_closed(
    myself: &ActorRef<MasterMessage>,
    id: TxId,
    tx: WriteTx,
    outcome: TxOutcome,
    reply: Option<(ReplyTo, bool)>,
) {
    let myself = myself.clone();
    tokio::spawn(async move {
        tx.closed().await;
        if let Some((reply, cancelled)) = reply {
            reply.send(Envelope::TxCancelled { cancelled });
        }
        let _ = myself.cast(MasterMessage::TxFinished { tx: id, outcome });
    });
}

fn schedule_idle_check(myself: &ActorRef<MasterMessage>, tx: TxId, delay: Duration) {
    let myself = myself.clone();
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        let _ = myself.cast(MasterMessage::TxIdleCheck { tx });
    });
}
