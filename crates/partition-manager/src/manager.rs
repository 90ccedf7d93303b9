//! The partitioned device: owner of every GPU instance slot and of the
//! device-global in-use masks.

use std::sync::Arc;
use std::sync::RwLock;
use std::sync::RwLockReadGuard;
use std::sync::RwLockWriteGuard;

use api_types::ComputeSize;
use tracing::info;
use tracing::warn;
use uuid::Uuid;

use crate::arena::Arena;
use crate::config::ChipConfig;
use crate::config::ComputeProfile;
use crate::engine::EngineMask;
use crate::engine::EnginePool;
use crate::error::PartitionError;
use crate::error::Result;
use crate::gpu_instance::GpuInstance;
use crate::ids::CtsId;
use crate::ids::GpuInstanceId;
use crate::ids::SwizzId;
use crate::ids::SwizzIdMask;
use crate::placement;
use crate::placement::PlacementAllocator;
use crate::services::Services;
use crate::services::UuidSeed;
use crate::subscription::SubscriptionRegistry;
use crate::validity::ValidityRules;

/// GPU instance slots per device.
pub const MAX_GPU_INSTANCES: usize = 8;
/// Compute instance slots per GPU instance.
pub const MAX_COMPUTE_INSTANCES: usize = 8;

/// Partition manager of one physical device.
///
/// Exists while partitioning mode is enabled. Mutating calls take
/// `&mut self`; wrap it in [`SharedPartitionManager`] to share it between
/// threads.
pub struct PartitionManager {
    pub(crate) chip: ChipConfig,
    pub(crate) device_uuid: Uuid,
    pub(crate) placement: PlacementAllocator,
    pub(crate) services: Services,
    pub(crate) gpu_instances: Arena<GpuInstance, MAX_GPU_INSTANCES>,
    pub(crate) swizz_in_use: SwizzIdMask,
    pub(crate) engines: EnginePool,
    pub(crate) subscriptions: SubscriptionRegistry,
    uuid_serial: u64,
    enabled: bool,
}

impl PartitionManager {
    /// Enables partitioning mode on a device described by `chip`.
    pub fn new(chip: ChipConfig, device_uuid: Uuid, services: Services) -> Result<Self> {
        chip.validate()?;
        let placement = PlacementAllocator::for_chip(&chip)?;
        let engines = EnginePool::new(|kind| chip.device.engines.count(kind));

        info!(
            chip = %chip.name,
            device = %device_uuid,
            gpcs = chip.device.gpc_count,
            smallest_compute_size = %placement.smallest(),
            "partitioning mode enabled"
        );

        Ok(Self {
            chip,
            device_uuid,
            placement,
            services,
            gpu_instances: Arena::new(),
            swizz_in_use: SwizzIdMask::new(),
            engines,
            subscriptions: SubscriptionRegistry::default(),
            uuid_serial: 0,
            enabled: true,
        })
    }

    pub fn chip(&self) -> &ChipConfig {
        &self.chip
    }

    pub fn device_uuid(&self) -> Uuid {
        self.device_uuid
    }

    pub fn validity(&self) -> ValidityRules<'_> {
        ValidityRules::new(&self.chip)
    }

    pub fn placement(&self) -> &PlacementAllocator {
        &self.placement
    }

    /// Engines claimed by any GPU instance
    pub fn engines_in_use(&self) -> EngineMask {
        self.engines.in_use()
    }

    pub fn swizz_ids_in_use(&self) -> SwizzIdMask {
        self.swizz_in_use
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub(crate) fn ensure_enabled(&self) -> Result<()> {
        if self.enabled {
            Ok(())
        } else {
            Err(PartitionError::invalid_state("partitioning mode is disabled"))
        }
    }

    /// Leaves partitioning mode. Every instance must already be destroyed.
    pub fn shutdown(&mut self) -> Result<()> {
        if !self.gpu_instances.is_empty() {
            return Err(PartitionError::invalid_state(format!(
                "{} GPU instances are still valid",
                self.gpu_instances.len()
            )));
        }
        self.enabled = false;
        info!(device = %self.device_uuid, "partitioning mode disabled");
        Ok(())
    }

    /// Device-wide teardown: force-unloads every compute and GPU instance
    /// regardless of outstanding subscriptions.
    pub fn teardown(&mut self) -> Result<()> {
        let ids = self.gpu_instance_ids();
        for id in &ids {
            self.invalidate_gpu_instance(*id, true)?;
        }
        if !self.engines.in_use().is_empty() || !self.swizz_in_use.is_empty() {
            warn!(
                engines = ?self.engines.in_use(),
                swizz_ids = ?self.swizz_in_use,
                "in-use masks not empty after teardown"
            );
            return Err(PartitionError::invalid_state(
                "in-use masks are corrupted after teardown",
            ));
        }
        info!(count = ids.len(), "device partitions torn down");
        Ok(())
    }

    pub(crate) fn gpu_instance(&self, id: GpuInstanceId) -> Result<&GpuInstance> {
        self.gpu_instances
            .get(id.slot, id.generation)
            .ok_or_else(|| PartitionError::not_found(format!("GPU instance {id}")))
    }

    pub(crate) fn gpu_instance_mut(&mut self, id: GpuInstanceId) -> Result<&mut GpuInstance> {
        self.gpu_instances
            .get_mut(id.slot, id.generation)
            .ok_or_else(|| PartitionError::not_found(format!("GPU instance {id}")))
    }

    /// Ids of every valid GPU instance, in slot order.
    pub fn gpu_instance_ids(&self) -> Vec<GpuInstanceId> {
        self.gpu_instances
            .iter()
            .map(|(slot, generation, _)| GpuInstanceId { slot, generation })
            .collect()
    }

    pub fn gpu_instance_by_swizz_id(&self, swizz_id: SwizzId) -> Option<GpuInstanceId> {
        self.gpu_instances
            .iter()
            .find(|(_, _, gi)| gi.swizz_id == swizz_id)
            .map(|(slot, generation, _)| GpuInstanceId { slot, generation })
    }

    pub(crate) fn next_uuid(&mut self, swizz_id: SwizzId, compute_id: Option<u32>) -> Uuid {
        self.uuid_serial += 1;
        self.services.uuids.generate_uuid(&UuidSeed {
            device: self.device_uuid,
            swizz_id,
            compute_id,
            serial: self.uuid_serial,
        })
    }

    /// Skyline entry for a compute size class.
    pub fn compute_profile_for_size(&self, size: ComputeSize) -> Result<&ComputeProfile> {
        self.chip.compute_profile(size).ok_or_else(|| {
            PartitionError::not_supported(format!("compute size {size} is not supported"))
        })
    }

    /// Smallest-footprint profile with exactly `gpc_count` clusters.
    pub fn compute_profile_for_gpc_count(&self, gpc_count: u32) -> Result<&ComputeProfile> {
        self.chip
            .compute_profiles
            .iter()
            .filter(|p| p.gpc_count == gpc_count)
            .max_by_key(|p| p.compute_size)
            .ok_or_else(|| {
                PartitionError::not_supported(format!("no compute profile with {gpc_count} GPCs"))
            })
    }

    pub fn compute_profile_for_placement_id(&self, id: CtsId) -> Result<&ComputeProfile> {
        let size = placement::compute_size_for_placement_id(id)
            .ok_or_else(|| PartitionError::invalid_argument(format!("{id} is not a placement id")))?;
        self.compute_profile_for_size(size)
    }

    pub fn compute_profile_for_sm_count(&self, sm_count: u32) -> Result<&ComputeProfile> {
        self.chip
            .compute_profiles
            .iter()
            .filter(|p| self.chip.sm_count(p.gpc_count) == sm_count)
            .max_by_key(|p| p.compute_size)
            .ok_or_else(|| {
                PartitionError::not_supported(format!("no compute profile with {sm_count} SMs"))
            })
    }
}

/// [`PartitionManager`] behind a reader/writer lock: queries share the
/// read side, every mutation takes the write side.
#[derive(Clone)]
pub struct SharedPartitionManager {
    inner: Arc<RwLock<PartitionManager>>,
}

impl SharedPartitionManager {
    pub fn new(manager: PartitionManager) -> Self {
        Self {
            inner: Arc::new(RwLock::new(manager)),
        }
    }

    pub fn read(&self) -> Result<RwLockReadGuard<'_, PartitionManager>> {
        self.inner
            .read()
            .map_err(|_| PartitionError::invalid_state("partition manager lock poisoned"))
    }

    pub fn write(&self) -> Result<RwLockWriteGuard<'_, PartitionManager>> {
        self.inner
            .write()
            .map_err(|_| PartitionError::invalid_state("partition manager lock poisoned"))
    }
}
