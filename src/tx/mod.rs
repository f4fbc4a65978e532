//! Write-transaction engine.
//!
//! Turns a batch of tree edits into a lock, edit-config, commit (or discard),
//! unlock exchange against one device. The exchange is chosen by
//! [`TxProfile`] from the device's capabilities.

pub mod engine;
pub mod error;
pub mod profile;

pub use engine::PendingEdit;
pub use engine::TxContext;
pub use engine::TxListener;
pub use engine::TxSettings;
pub use engine::WriteTx;
pub use error::TxError;
pub use error::TxPhase;
pub use profile::TxProfile;
