//! Clustered NETCONF mount points.
//!
//! Two cooperating pieces:
//!
//! - [`tx`]: the write-transaction engine. Turns a batch of edits into the
//!   lock / edit-config / commit / unlock sequence the device supports, and
//!   guarantees the device is released on every path.
//! - [`master`], [`slave`] and [`mount`]: per-device actors. Exactly one
//!   node runs the [`master::MasterActor`] holding the device session; every
//!   other node reaches it through a [`slave::SlaveProxy`] that discovers the
//!   master once and forwards requests as [`envelope::Envelope`] frames.
//!
//! # Tiger Style
//!
//! - Bounded queues: waiting writers per master are capped by
//!   `max_queued_writes`, subscribers per path by
//!   [`constants::MAX_SUBSCRIBERS_PER_PATH`]
//! - Every cross-actor call carries a timeout
//! - Errors are closed snafu enums that display the device they concern

pub mod capabilities;
pub mod config;
pub mod constants;
pub mod device;
pub mod envelope;
pub mod error;
pub mod locator;
pub mod master;
pub mod mount;
pub mod slave;
pub mod testing;
pub mod tx;
pub mod types;

pub use capabilities::CapabilitySet;
pub use config::NetmountConfig;
pub use device::DeviceSession;
pub use device::SchemaSourceProvider;
pub use envelope::Envelope;
pub use error::MountError;
pub use locator::MasterDirectory;
pub use locator::MasterLocator;
pub use master::MasterSetup;
pub use mount::MountPoint;
pub use mount::MountPointService;
pub use slave::ProxyTransaction;
pub use slave::SlaveProxy;
pub use tx::TxError;
pub use tx::WriteTx;
pub use types::DeviceId;
