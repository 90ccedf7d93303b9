//! Hardware partition manager for a multi-instance GPU.
//!
//! This crate divides one physical device into isolated GPU instances and
//! each GPU instance into compute instances:
//!
//! - [`PartitionManager`]: slot tables, in-use masks and instance lifecycle
//! - [`ChipConfig`]: injectable chip-generation tables (profiles, skyline,
//!   compatibility rules), loaded from YAML
//! - [`PlacementAllocator`]: placement ids and span arithmetic for compute
//!   instances, plus the fixed slot geometry of GPU instances
//! - Subscriptions with shared-ownership refcounts and address-space
//!   isolation checks, a privilege-checked [`Control`] surface, and topology
//!   persistence through [`SnapshotStore`]
//!
//! External services (memory sub-heaps, internal handles, UUIDs) are
//! reached through the traits in [`services`].

mod arena;
mod share;

pub mod compute_instance;
pub mod config;
pub mod control;
pub mod engine;
pub mod error;
pub mod gpu_instance;
pub mod ids;
pub mod manager;
#[cfg(any(test, feature = "test-util"))]
pub mod mock;
pub mod persistence;
pub mod placement;
pub mod reference;
pub mod services;
pub mod subscription;
pub mod validity;

pub use compute_instance::{
    ComputeInstanceCreate, ComputePlacement, ComputeRequest, ComputeShape,
};
pub use config::{load_chip_config, ChipConfig};
pub use control::{CallerContext, Control};
pub use engine::{EngineKind, EngineMask, EngineType, SharedEngineFlags};
pub use error::{PartitionError, Result};
pub use gpu_instance::{GpuInstanceCreate, GpuInstanceRequest, GpuPlacement, ResourceAllocation};
pub use ids::{ClientId, ComputeInstanceId, CtsId, GpuInstanceId, SubscriptionHandle, SwizzId};
pub use manager::{PartitionManager, SharedPartitionManager};
pub use persistence::{SnapshotStore, StoreError, StoreResult};
pub use placement::PlacementAllocator;
pub use reference::InstanceRef;
pub use services::Services;
pub use subscription::{ClientInfo, PrivilegeLevel, SubscriptionTarget, VaSpaceSharing};
