use std::time::Duration;

use async_trait::async_trait;
use ractor::call_t;
use ractor::Actor;
use ractor::ActorRef;
use ractor::RactorErr;
use ractor::SpawnErr;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

use super::into_result;
use super::unexpected_reply;
use super::MountPointService;
use crate::device::DeviceNotification;
use crate::envelope::Envelope;
use crate::error::MountError;
use crate::master::MasterActor;
use crate::master::MasterArguments;
use crate::master::MasterData;
use crate::master::MasterMessage;
use crate::master::MasterSetup;
use crate::master::MasterStats;
use crate::master::MountStatus;
use crate::types::ActorAddress;
use crate::types::DeviceId;

/// Handle to the master actor on its own node.
///
/// Owns nothing but the actor reference; the actor keeps all device state.
#[derive(Clone)]
pub struct MountPoint {
    device: DeviceId,
    node: String,
    address: ActorAddress,
    actor: ActorRef<MasterMessage>,
    response_wait_ms: u64,
    status: watch::Receiver<MountStatus>,
}

impl MountPoint {
    /// Spawns the master actor, registered under `setup.address()`.
    pub async fn spawn(setup: MasterSetup) -> Result<(Self, JoinHandle<()>), SpawnErr> {
        let address = setup.address();
        let device = setup.device.clone();
        let node = setup.node.clone();
        let response_wait_ms = setup.timing.actor_response_wait_ms;
        let (status_tx, status) = watch::channel(MountStatus::Connecting);

        let (actor, handle) = Actor::spawn(
            Some(address.as_str().to_string()),
            MasterActor,
            MasterArguments {
                setup,
                status: status_tx,
            },
        )
        .await?;
        info!(device = %device, %address, "mount point spawned");

        Ok((
            Self {
                device,
                node,
                address,
                actor,
                response_wait_ms,
                status,
            },
            handle,
        ))
    }

    pub fn address(&self) -> &ActorAddress {
        &self.address
    }

    pub fn actor(&self) -> &ActorRef<MasterMessage> {
        &self.actor
    }

    /// Hands the live device session to the master. Returns once the master
    /// has answered `MasterDataInitialized`.
    pub async fn initialize(&self, data: MasterData) -> Result<(), MountError> {
        let reply = call_t!(self.actor, MasterMessage::InitializeMasterData, self.response_wait_ms, data)
            .map_err(|err| self.call_failed(err))?;
        match into_result(reply)? {
            Envelope::MasterDataInitialized => Ok(()),
            other => Err(unexpected_reply(&self.device, &other)),
        }
    }

    pub fn refresh_setup(&self, setup: MasterSetup) -> Result<(), MountError> {
        self.cast(MasterMessage::RefreshSetup(setup))
    }

    /// Feeds a device notification into the master for fan-out.
    pub fn publish_notification(&self, notification: DeviceNotification) -> Result<(), MountError> {
        self.cast(MasterMessage::DeviceNotification(notification))
    }

    /// Tells the master another node won the election.
    pub fn demote(&self) -> Result<(), MountError> {
        self.cast(MasterMessage::Demote)
    }

    pub async fn stats(&self) -> Result<MasterStats, MountError> {
        call_t!(self.actor, MasterMessage::GetStats, self.response_wait_ms).map_err(|err| self.call_failed(err))
    }

    pub fn status(&self) -> MountStatus {
        *self.status.borrow()
    }

    /// Waits until the mount point reports `Connected`, up to `timeout`.
    pub async fn wait_connected(&self, timeout: Duration) -> bool {
        let mut status = self.status.clone();
        let result = tokio::time::timeout(timeout, status.wait_for(|s| *s == MountStatus::Connected)).await;
        matches!(result, Ok(Ok(_)))
    }

    /// Stops the master, cancelling its transaction and closing the session.
    pub fn shutdown(&self) -> Result<(), MountError> {
        self.cast(MasterMessage::Shutdown)
    }

    fn cast(&self, message: MasterMessage) -> Result<(), MountError> {
        self.actor.cast(message).map_err(|err| MountError::Unreachable {
            device: self.device.clone(),
            address: self.address.clone(),
            reason: err.to_string(),
        })
    }

    fn call_failed<T>(&self, err: RactorErr<T>) -> MountError {
        MountError::Unreachable {
            device: self.device.clone(),
            address: self.address.clone(),
            reason: err.to_string(),
        }
    }
}

#[async_trait]
impl MountPointService for MountPoint {
    fn device(&self) -> &DeviceId {
        &self.device
    }

    fn node(&self) -> &str {
        &self.node
    }

    async fn request(&self, envelope: Envelope) -> Result<Envelope, MountError> {
        let reply = call_t!(self.actor, MasterMessage::Request, self.response_wait_ms, envelope)
            .map_err(|err| self.call_failed(err))?;
        into_result(reply)
    }
}
