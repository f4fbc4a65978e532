//! Device capability profiles for write transactions.

use std::fmt;

use serde::Deserialize;
use serde::Serialize;

use crate::capabilities::CapabilitySet;
use crate::types::Datastore;

/// How a transaction drives the device, chosen from its capabilities.
///
/// | profile            | locks                | edits     | commit        |
/// |--------------------|----------------------|-----------|---------------|
/// | `Candidate`        | candidate            | candidate | `commit`      |
/// | `CandidateRunning` | running, candidate   | candidate | `commit`      |
/// | `Running`          | running              | running   | unlock only   |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TxProfile {
    Candidate,
    CandidateRunning,
    Running,
}

impl TxProfile {
    /// Candidate wins over writable-running; `None` if the device supports neither.
    pub fn select(capabilities: &CapabilitySet) -> Option<Self> {
        match (capabilities.is_candidate_supported(), capabilities.is_running_writable()) {
            (true, true) => Some(TxProfile::CandidateRunning),
            (true, false) => Some(TxProfile::Candidate),
            (false, true) => Some(TxProfile::Running),
            (false, false) => None,
        }
    }

    pub fn edit_target(self) -> Datastore {
        match self {
            TxProfile::Candidate | TxProfile::CandidateRunning => Datastore::Candidate,
            TxProfile::Running => Datastore::Running,
        }
    }

    pub fn uses_candidate(self) -> bool {
        !matches!(self, TxProfile::Running)
    }

    pub fn locks_running(self) -> bool {
        !matches!(self, TxProfile::Candidate)
    }

    /// Datastores to unlock during cleanup, in order.
    pub fn unlock_order(self) -> &'static [Datastore] {
        match self {
            TxProfile::Candidate => &[Datastore::Candidate],
            TxProfile::CandidateRunning => &[Datastore::Candidate, Datastore::Running],
            TxProfile::Running => &[Datastore::Running],
        }
    }
}

impl fmt::Display for TxProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TxProfile::Candidate => f.write_str("WriteCandidateTx"),
            TxProfile::CandidateRunning => f.write_str("WriteCandidateRunningTx"),
            TxProfile::Running => f.write_str("WriteRunningTx"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::NETCONF_CANDIDATE_URI;
    use crate::capabilities::NETCONF_RUNNING_WRITABLE_URI;

    #[test]
    fn test_profile_selection() {
        let both = CapabilitySet::from_advertised([NETCONF_CANDIDATE_URI, NETCONF_RUNNING_WRITABLE_URI]);
        let candidate = CapabilitySet::from_advertised([NETCONF_CANDIDATE_URI]);
        let running = CapabilitySet::from_advertised([NETCONF_RUNNING_WRITABLE_URI]);
        let neither = CapabilitySet::from_advertised(["urn:ietf:params:netconf:base:1.1"]);

        assert_eq!(TxProfile::select(&both), Some(TxProfile::CandidateRunning));
        assert_eq!(TxProfile::select(&candidate), Some(TxProfile::Candidate));
        assert_eq!(TxProfile::select(&running), Some(TxProfile::Running));
        assert_eq!(TxProfile::select(&neither), None);
    }

    #[test]
    fn test_unlock_order_candidate_before_running() {
        assert_eq!(
            TxProfile::CandidateRunning.unlock_order(),
            &[Datastore::Candidate, Datastore::Running]
        );
        assert_eq!(TxProfile::Running.edit_target(), Datastore::Running);
        assert!(!TxProfile::Running.uses_candidate());
        assert!(!TxProfile::Candidate.locks_running());
    }
}
