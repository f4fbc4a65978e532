//! Testing infrastructure for netmount.
//!
//! Deterministic stand-ins for the external collaborators, so transaction and
//! mount-point tests run without a real device or network.
//!
//! ## Key Components
//!
//! - `SimulatedDevice`: in-memory `DeviceSession` that records every call and
//!   fails on demand
//! - `InMemorySchemaRepository`: `SchemaSourceProvider` over a fixed map
//!
//! ## Usage Pattern
//!
//! ```ignore
//! let device = Arc::new(SimulatedDevice::candidate());
//! device.inject(DeviceFault::reject(CallKind::Lock(Datastore::Candidate)).times(2));
//!
//! let err = WriteTx::begin(ctx).await.unwrap_err();
//! assert_eq!(
//!     device.calls(),
//!     vec![lock(Candidate), discard_changes(), lock(Candidate)]
//! );
//! ```
pub mod schema_repository;
pub mod simulated_device;

pub use schema_repository::InMemorySchemaRepository;
pub use simulated_device::CallKind;
pub use simulated_device::DeviceCall;
pub use simulated_device::DeviceFault;
pub use simulated_device::FaultReply;
pub use simulated_device::SimulatedDevice;
