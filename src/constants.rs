//! Centralized constants for mount-point coordination.
//!
//! Tiger Style: every wait and every queue has an explicit bound. Configuration
//! defaults live here so the config layer and the actors agree on them.

// ============================================================================
// Timing Constants
// ============================================================================

/// Default budget for a slave request to reach the master and come back (5 seconds).
///
/// Covers discovery, `MasterNotReady` backoff and the request itself.
///
/// Used in:
/// - `config`: default of `timing.actor_response_wait_ms`
/// - `slave`: deadline of every forwarded call
pub const DEFAULT_ACTOR_RESPONSE_WAIT_MS: u64 = 5_000;

/// Default pause between discovery attempts while the master is not ready (100 ms).
///
/// Used in:
/// - `slave`: backoff after `MasterNotReady` or an unknown master
pub const DEFAULT_DISCOVERY_BACKOFF_MS: u64 = 100;

/// Write-transaction idle timeout; 0 disables it.
///
/// Used in:
/// - `master`: cancels a current transaction that saw no request for this long
pub const DEFAULT_WRITE_TX_IDLE_TIMEOUT_MS: u64 = 0;

/// Upper bound on cleanup work during master shutdown (2 seconds).
///
/// Tiger Style: `post_stop` must not hang on a dead device.
pub const MASTER_SHUTDOWN_CLEANUP_TIMEOUT_MS: u64 = 2_000;

// ============================================================================
// Resource Bounds
// ============================================================================

/// Default bound on write requests queued behind the current transaction.
///
/// Requests beyond this are rejected with `Busy`.
pub const DEFAULT_MAX_QUEUED_WRITES: usize = 64;

/// Maximum encoded envelope size accepted from the wire (16 MB).
///
/// Tiger Style: bounds allocation when decoding frames from other nodes.
///
/// Used in:
/// - `envelope`: `Envelope::decode` rejects larger frames
pub const MAX_ENVELOPE_SIZE: usize = 16 * 1024 * 1024;

/// Maximum notification subscribers per schema path.
pub const MAX_SUBSCRIBERS_PER_PATH: usize = 256;

/// Finished transaction ids a master remembers.
///
/// Late requests for one of these get `AlreadyFinished` instead of opening a
/// fresh transaction under the old id.
pub const MAX_FINISHED_TX_HISTORY: usize = 256;
