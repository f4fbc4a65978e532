//! Where a slave sends its first `AskForMaster`.
//!
//! Leader election itself is external; whatever elects the master for a
//! device publishes the winner's address through a [`MasterLocator`].

use std::collections::HashMap;

use parking_lot::RwLock;
use tracing::debug;

use crate::types::ActorAddress;
use crate::types::DeviceId;

/// Source of the currently elected master address per device.
pub trait MasterLocator: Send + Sync {
    /// `None` while no master is elected.
    fn locate(&self, device: &DeviceId) -> Option<ActorAddress>;
}

/// In-memory election results, updated by whoever runs the election.
#[derive(Debug, Default)]
pub struct MasterDirectory {
    masters: RwLock<HashMap<DeviceId, ActorAddress>>,
}

impl MasterDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `master` as elected for `device`, replacing any previous winner.
    pub fn elect(&self, device: DeviceId, master: ActorAddress) {
        debug!(device = %device, %master, "master elected");
        self.masters.write().insert(device, master);
    }

    pub fn clear(&self, device: &DeviceId) {
        debug!(device = %device, "master cleared");
        self.masters.write().remove(device);
    }
}

impl MasterLocator for MasterDirectory {
    fn locate(&self, device: &DeviceId) -> Option<ActorAddress> {
        self.masters.read().get(device).cloned()
    }
}
