//! Slave side of a mount point.
//!
//! A [`SlaveProxy`] lives on every node that is not the master for a device.
//! It finds the master with a single `AskForMaster`, caches the registration,
//! and forwards every request as an encoded [`Envelope`] frame. It keeps no
//! transaction state of its own.

mod schema;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use ractor::call_t;
use ractor::ActorRef;
use ractor::RactorErr;
use tokio::time::Instant;
use tracing::debug;
use tracing::info;
use tracing::warn;

pub use self::schema::RemoteSchemaProvider;
use crate::config::TimingConfig;
use crate::envelope::Envelope;
use crate::error::MountError;
use crate::locator::MasterLocator;
use crate::master::MasterMessage;
use crate::mount::unexpected_reply;
use crate::mount::MountPointService;
use crate::mount::MountTransaction;
use crate::types::ActorAddress;
use crate::types::DeviceId;
use crate::types::SourceIdentifier;

/// Write transaction issued through a [`SlaveProxy`].
pub type ProxyTransaction = MountTransaction<SlaveProxy>;

/// Cached answer to `AskForMaster`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MasterRegistration {
    pub master: ActorAddress,
    pub sources: Vec<SourceIdentifier>,
}

#[derive(Clone)]
pub struct SlaveProxy {
    device: DeviceId,
    node: String,
    requester: ActorAddress,
    locator: Arc<dyn MasterLocator>,
    timing: TimingConfig,
    registration: Arc<Mutex<Option<MasterRegistration>>>,
}

impl SlaveProxy {
    pub fn new(node: impl Into<String>, device: DeviceId, locator: Arc<dyn MasterLocator>, timing: TimingConfig) -> Self {
        let node = node.into();
        let requester = ActorAddress::new(format!("{node}/slave/{}", device.name()));
        Self {
            device,
            node,
            requester,
            locator,
            timing,
            registration: Arc::new(Mutex::new(None)),
        }
    }

    /// Master registration currently cached, if discovery has succeeded.
    pub fn registration(&self) -> Option<MasterRegistration> {
        self.registration.lock().clone()
    }

    /// Forgets the cached master; the next request rediscovers it.
    pub fn invalidate(&self) {
        if let Some(previous) = self.registration.lock().take() {
            info!(device = %self.device, master = %previous.master, "invalidating cached master");
        }
    }

    /// Runs master discovery within the response-wait budget.
    pub async fn discover(&self) -> Result<MasterRegistration, MountError> {
        let deadline = Instant::now() + self.timing.actor_response_wait();
        self.discover_until(deadline).await
    }

    async fn discover_until(&self, deadline: Instant) -> Result<MasterRegistration, MountError> {
        loop {
            match self.ask_for_master(deadline).await {
                Ok(registration) => {
                    info!(
                        device = %self.device,
                        master = %registration.master,
                        sources = registration.sources.len(),
                        "master registered"
                    );
                    *self.registration.lock() = Some(registration.clone());
                    return Ok(registration);
                }
                Err(err) if is_retryable(&err) => {
                    debug!(device = %self.device, error = %err, "master not available yet");
                }
                Err(err) => return Err(err),
            }
            if !self.back_off(deadline).await {
                return Err(self.discovery_timeout());
            }
        }
    }

    async fn ask_for_master(&self, deadline: Instant) -> Result<MasterRegistration, MountError> {
        let Some(master) = self.locator.locate(&self.device) else {
            return Err(MountError::MasterNotReady {
                device: self.device.clone(),
            });
        };
        debug!(device = %self.device, %master, requester = %self.requester, "asking for master");
        let ask = Envelope::AskForMaster {
            requester: self.requester.clone(),
        };
        match self.send_frame(&master, ask, deadline).await? {
            Envelope::RegisterMountPoint { sources, master } => Ok(MasterRegistration { master, sources }),
            other => Err(unexpected_reply(&self.device, &other)),
        }
    }

    /// Sleeps one backoff step; `false` when the deadline leaves no room.
    async fn back_off(&self, deadline: Instant) -> bool {
        let wake = Instant::now() + self.timing.discovery_backoff();
        if wake >= deadline {
            return false;
        }
        tokio::time::sleep_until(wake).await;
        true
    }

    fn discovery_timeout(&self) -> MountError {
        MountError::DiscoveryTimeout {
            device: self.device.clone(),
            waited_ms: self.timing.actor_response_wait_ms,
        }
    }

    /// Encodes `envelope`, sends it to the actor registered as `target` and
    /// decodes the reply. Failure replies come back as `Err`.
    async fn send_frame(&self, target: &ActorAddress, envelope: Envelope, deadline: Instant) -> Result<Envelope, MountError> {
        let unreachable = |reason: String| MountError::Unreachable {
            device: self.device.clone(),
            address: target.clone(),
            reason,
        };

        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(self.discovery_timeout());
        }
        let Some(cell) = ractor::registry::where_is(target.as_str().to_string()) else {
            return Err(unreachable("no actor registered".to_string()));
        };
        let actor: ActorRef<MasterMessage> = cell.into();
        let bytes = envelope.encode().map_err(|err| MountError::Codec {
            device: self.device.clone(),
            reason: err.to_string(),
        })?;

        let reply = call_t!(actor, MasterMessage::Frame, duration_ms(remaining), bytes).map_err(|err| match err {
            RactorErr::Timeout => unreachable(format!("no reply within {} ms", duration_ms(remaining))),
            other => unreachable(other.to_string()),
        })?;
        match Envelope::decode(&reply) {
            Ok(Envelope::Failure(err)) => Err(err),
            Ok(envelope) => Ok(envelope),
            Err(err) => Err(MountError::Codec {
                device: self.device.clone(),
                reason: err.to_string(),
            }),
        }
    }

    async fn master(&self, deadline: Instant) -> Result<MasterRegistration, MountError> {
        match self.registration() {
            Some(registration) => Ok(registration),
            None => self.discover_until(deadline).await,
        }
    }
}

#[async_trait]
impl MountPointService for SlaveProxy {
    fn device(&self) -> &DeviceId {
        &self.device
    }

    fn node(&self) -> &str {
        &self.node
    }

    async fn request(&self, envelope: Envelope) -> Result<Envelope, MountError> {
        let deadline = Instant::now() + self.timing.actor_response_wait();
        let mut rediscovered = false;
        loop {
            let registration = self.master(deadline).await?;
            match self.send_frame(&registration.master, envelope.clone(), deadline).await {
                Ok(reply) => return Ok(reply),
                Err(err @ MountError::MasterNotReady { .. }) => {
                    debug!(device = %self.device, kind = envelope.kind(), "master not ready, backing off");
                    if !self.back_off(deadline).await {
                        return Err(err);
                    }
                }
                Err(err) if err.is_stale_master() => {
                    warn!(
                        device = %self.device,
                        master = %registration.master,
                        kind = envelope.kind(),
                        error = %err,
                        "cached master is stale"
                    );
                    self.invalidate();
                    if rediscovered {
                        return Err(self.discovery_timeout());
                    }
                    rediscovered = true;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

fn is_retryable(err: &MountError) -> bool {
    matches!(err, MountError::MasterNotReady { .. }) || err.is_stale_master()
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::locator::MasterDirectory;

    fn proxy(directory: Arc<MasterDirectory>, device: &str) -> SlaveProxy {
        let timing = TimingConfig {
            actor_response_wait_ms: 200,
            discovery_backoff_ms: 20,
            ..TimingConfig::default()
        };
        SlaveProxy::new("node-b", DeviceId::new(device, "10.0.0.9:830"), directory, timing)
    }

    #[tokio::test]
    async fn test_discovery_without_election_times_out() {
        let directory = Arc::new(MasterDirectory::new());
        let proxy = proxy(directory, "slave-unit-none");
        let err = proxy.discover().await.unwrap_err();
        assert!(matches!(err, MountError::DiscoveryTimeout { waited_ms: 200, .. }));
        assert!(proxy.registration().is_none());
    }

    #[tokio::test]
    async fn test_unregistered_master_address_times_out() {
        let directory = Arc::new(MasterDirectory::new());
        let device = DeviceId::new("slave-unit-ghost", "10.0.0.9:830");
        directory.elect(device.clone(), ActorAddress::master("node-a", &device));
        let proxy = proxy(directory, "slave-unit-ghost");
        let err = proxy.request(Envelope::TxCommit { tx: crate::types::TxId::new() }).await.unwrap_err();
        assert!(matches!(err, MountError::DiscoveryTimeout { .. }), "{err}");
    }

    #[test]
    fn test_requester_address_is_per_node() {
        let proxy = proxy(Arc::new(MasterDirectory::new()), "r7");
        assert_eq!(proxy.requester.as_str(), "node-b/slave/r7");
        assert_eq!(duration_ms(Duration::from_micros(10)), 1);
    }
}
