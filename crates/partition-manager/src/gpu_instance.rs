//! GPU instance lifecycle.
//!
//! A slot goes `Free → Valid → Free`. Creation either installs a complete
//! instance or leaves every mask, heap and handle as it found them.

use api_types::GpuInstanceInfo;
use api_types::GpuInstanceSnapshot;
use api_types::MemorySize;
use tracing::debug;
use tracing::info;
use tracing::warn;
use utils::bitset::BitSet;
use uuid::Uuid;

use crate::arena::Arena;
use crate::compute_instance::ComputeInstance;
use crate::engine::local_engine_mask;
use crate::engine::EngineKind;
use crate::engine::EngineMask;
use crate::engine::EngineType;
use crate::error::PartitionError;
use crate::error::Result;
use crate::ids::ComputeInstanceId;
use crate::ids::CtsIdMask;
use crate::ids::GpcId;
use crate::ids::GpcMask;
use crate::ids::GpuInstanceId;
use crate::ids::HeapHandle;
use crate::ids::SwizzId;
use crate::manager::PartitionManager;
use crate::manager::MAX_COMPUTE_INSTANCES;
use crate::placement;
use crate::placement::DEVICE_SLICES;
use crate::services::InstanceHandles;
use crate::share::Share;

/// Resources owned by a GPU or compute instance
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceAllocation {
    pub gpcs: GpcMask,
    pub gfx_gpc_count: u32,
    pub virtual_gpc_count: u32,
    pub veid_offset: u32,
    pub veid_count: u32,
    /// Engine mask; global for GPU instances, parent-local for compute
    /// instances
    pub engines: EngineMask,
    /// `engines` re-indexed from zero per kind
    pub local_engines: EngineMask,
    pub sm_count: u32,
}

impl ResourceAllocation {
    pub fn gpc_count(&self) -> u32 {
        self.gpcs.count()
    }
}

pub(crate) struct GpuInstance {
    pub(crate) swizz_id: SwizzId,
    pub(crate) flag: u32,
    pub(crate) memory_size: MemorySize,
    pub(crate) uuid: Uuid,
    pub(crate) allocation: ResourceAllocation,
    pub(crate) exclusive_engines: EngineMask,
    pub(crate) shared_engines: EngineMask,
    pub(crate) compute_instances: Arena<ComputeInstance, MAX_COMPUTE_INSTANCES>,
    pub(crate) placement_ids_in_use: CtsIdMask,
    pub(crate) spans_in_use: BitSet<u32, 1>,
    pub(crate) heap: Option<HeapHandle>,
    pub(crate) handles: InstanceHandles,
    pub(crate) share: Share,
}

impl GpuInstance {
    pub(crate) fn compute_instance(&self, id: ComputeInstanceId) -> Result<&ComputeInstance> {
        self.compute_instances
            .get(id.slot, id.generation)
            .ok_or_else(|| PartitionError::not_found(format!("compute instance {id}")))
    }

    pub(crate) fn compute_instance_ids(&self) -> Vec<ComputeInstanceId> {
        self.compute_instances
            .iter()
            .map(|(slot, generation, _)| ComputeInstanceId { slot, generation })
            .collect()
    }
}

/// Explicit placement in device slices
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GpuPlacement {
    pub start: u32,
    pub size: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GpuInstanceRequest {
    pub partition_flag: u32,
    pub placement: Option<GpuPlacement>,
}

impl GpuInstanceRequest {
    pub fn new(partition_flag: u32) -> Self {
        Self {
            partition_flag,
            placement: None,
        }
    }

    pub fn at(partition_flag: u32, start: u32, size: u32) -> Self {
        Self {
            partition_flag,
            placement: Some(GpuPlacement { start, size }),
        }
    }
}

/// How a GPU instance is created
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GpuInstanceCreate {
    /// Search for a free slot and shape for a profile
    Request(GpuInstanceRequest),
    /// Install a previously saved instance verbatim; its compute instances
    /// are restored separately
    Restore(Box<GpuInstanceSnapshot>),
}

struct GpuInstancePlan {
    slot: u32,
    swizz_id: SwizzId,
    flag: u32,
    memory_size: MemorySize,
    uuid: Option<Uuid>,
    allocation: ResourceAllocation,
}

impl PartitionManager {
    pub fn create_gpu_instance(&mut self, params: GpuInstanceCreate) -> Result<GpuInstanceId> {
        self.ensure_enabled()?;
        let plan = match &params {
            GpuInstanceCreate::Request(request) => self.plan_gpu_instance_request(request),
            GpuInstanceCreate::Restore(snapshot) => self.plan_gpu_instance_restore(snapshot),
        };
        let plan = plan.inspect_err(|err| {
            warn!(error = %err, "GPU instance request rejected");
        })?;
        self.install_gpu_instance(plan)
    }

    fn existing_flags(&self) -> Vec<u32> {
        self.gpu_instances.iter().map(|(_, _, gi)| gi.flag).collect()
    }

    fn plan_gpu_instance_request(&self, request: &GpuInstanceRequest) -> Result<GpuInstancePlan> {
        let flag = request.partition_flag;
        let rules = self.validity();
        let profile = self
            .chip
            .gpu_instance_profile(flag)
            .filter(|_| rules.is_profile_flag_valid(flag))
            .ok_or_else(|| PartitionError::invalid_argument(format!("unknown partition flag {flag}")))?;

        let slot = self.gpu_instances.vacant_slot().ok_or_else(|| {
            PartitionError::insufficient_resources("every GPU instance slot is in use")
        })?;

        let swizz_id = match request.placement {
            Some(placement) => {
                let swizz_id =
                    placement::swizz_id_for_slices(profile.memory_size, placement.start, placement.size)?;
                if !placement::overlapping_swizz_ids(swizz_id).is_disjoint(&self.swizz_in_use) {
                    return Err(PartitionError::in_use(format!(
                        "slices {}..{} overlap a valid GPU instance",
                        placement.start,
                        placement.start + placement.size
                    )));
                }
                swizz_id
            }
            None => placement::find_free_swizz_id(self.swizz_in_use, profile.memory_size)
                .ok_or_else(|| {
                    PartitionError::insufficient_resources(format!(
                        "no free {} slot for profile {}",
                        profile.memory_size, profile.name
                    ))
                })?,
        };

        if !rules.is_combination_valid(flag, &self.existing_flags()) {
            return Err(PartitionError::not_supported(format!(
                "profile {} cannot coexist with the current instances",
                profile.name
            )));
        }

        let allocation = self.derive_allocation(profile.flag, swizz_id)?;
        debug!(
            flag,
            swizz_id = %swizz_id,
            gpcs = ?allocation.gpcs,
            engines = ?allocation.engines,
            "planned GPU instance"
        );
        Ok(GpuInstancePlan {
            slot,
            swizz_id,
            flag,
            memory_size: profile.memory_size,
            uuid: None,
            allocation,
        })
    }

    /// Resource shape of profile `flag` placed at `swizz_id`, drawn from
    /// what is currently free.
    fn derive_allocation(&self, flag: u32, swizz_id: SwizzId) -> Result<ResourceAllocation> {
        let device = &self.chip.device;
        let profile = self
            .chip
            .gpu_instance_profile(flag)
            .ok_or_else(|| PartitionError::invalid_argument(format!("unknown partition flag {flag}")))?;
        let slices = placement::swizz_slices(swizz_id)
            .ok_or_else(|| PartitionError::invalid_argument(format!("{swizz_id} is not a slot id")))?;

        let available_gpcs: Vec<GpcId> = (0..device.gpc_count)
            .filter(|gpc| slices.contains(&device.slice_of_gpc(*gpc)))
            .map(GpcId)
            .collect();
        if available_gpcs.len() < profile.gpc_count as usize {
            return Err(PartitionError::insufficient_resources(format!(
                "{swizz_id} carries {} GPCs, profile {} needs {}",
                available_gpcs.len(),
                profile.name,
                profile.gpc_count
            )));
        }
        let gpcs: GpcMask = available_gpcs
            .into_iter()
            .take(profile.gpc_count as usize)
            .collect();

        let mut engines = EngineMask::new();
        for kind in EngineKind::ALL {
            let allowed = if kind == EngineKind::Graphics {
                let gr_count = device.engines.gr;
                (0..gr_count)
                    .filter(|gr| slices.contains(&(gr * DEVICE_SLICES / gr_count)))
                    .map(|gr| EngineType::new(kind, gr))
                    .collect()
            } else {
                self.engines.present()
            };
            engines |= self
                .engines
                .take_lowest(kind, profile.engines.count(kind), allowed)?;
        }

        Ok(ResourceAllocation {
            gpcs,
            gfx_gpc_count: profile.gfx_gpc_count,
            virtual_gpc_count: profile.virtual_gpc_count,
            veid_offset: slices.start * device.veids_per_slice(),
            veid_count: profile.veid_count,
            engines,
            local_engines: local_engine_mask(engines),
            sm_count: self.chip.sm_count(profile.gpc_count),
        })
    }

    fn plan_gpu_instance_restore(&self, snapshot: &GpuInstanceSnapshot) -> Result<GpuInstancePlan> {
        let flag = snapshot.partition_flag;
        let profile = self
            .chip
            .gpu_instance_profile(flag)
            .ok_or_else(|| PartitionError::invalid_argument(format!("unknown partition flag {flag}")))?;

        let swizz_id = SwizzId(snapshot.swizz_id);
        if placement::memory_size_for_swizz_id(swizz_id) != Some(profile.memory_size) {
            return Err(PartitionError::invalid_argument(format!(
                "{swizz_id} does not hold a {} instance",
                profile.memory_size
            )));
        }
        if !placement::overlapping_swizz_ids(swizz_id).is_disjoint(&self.swizz_in_use) {
            return Err(PartitionError::invalid_state(format!(
                "{swizz_id} overlaps a valid GPU instance"
            )));
        }
        let slot = self.gpu_instances.vacant_slot().ok_or_else(|| {
            PartitionError::insufficient_resources("every GPU instance slot is in use")
        })?;

        let engines = EngineMask::from_bits(snapshot.engine_mask);
        let clash = engines & self.engines.in_use();
        if !clash.is_empty() {
            return Err(PartitionError::in_use(format!(
                "saved engines {clash:?} are assigned elsewhere"
            )));
        }
        let gpcs = GpcMask::from_bits(snapshot.gpc_mask);
        let device_gpcs = GpcMask::from_range(GpcId(0)..GpcId(self.chip.device.gpc_count));
        if gpcs.is_empty() || !gpcs.is_subset_of(&device_gpcs) {
            return Err(PartitionError::invalid_argument(format!(
                "saved GPC mask {:#x} does not fit the device",
                snapshot.gpc_mask
            )));
        }
        let veids = snapshot.veid_offset..snapshot
            .veid_offset
            .checked_add(snapshot.veid_count)
            .ok_or_else(|| {
                PartitionError::invalid_argument(format!(
                    "saved VEID window {}+{} overflows",
                    snapshot.veid_offset, snapshot.veid_count
                ))
            })?;

        for (_, _, gi) in self.gpu_instances.iter() {
            let live = &gi.allocation;
            if !gpcs.is_disjoint(&live.gpcs) {
                return Err(PartitionError::in_use(format!(
                    "saved GPCs {:?} are owned by {}",
                    gpcs & live.gpcs,
                    gi.swizz_id
                )));
            }
            let live_end = live.veid_offset + live.veid_count;
            if veids.start < live_end && live.veid_offset < veids.end {
                return Err(PartitionError::in_use(format!(
                    "saved VEIDs {veids:?} overlap {} at {}..{live_end}",
                    gi.swizz_id, live.veid_offset
                )));
            }
        }

        let device = &self.chip.device;
        let slices = placement::swizz_slices(swizz_id)
            .ok_or_else(|| PartitionError::invalid_argument(format!("{swizz_id} is not a slot id")))?;
        if let Some(stray) = gpcs.iter().find(|gpc| !slices.contains(&device.slice_of_gpc(gpc.0))) {
            return Err(PartitionError::invalid_argument(format!(
                "saved GPC {} lies outside the slices of {swizz_id}",
                stray.0
            )));
        }
        let window = slices.start * device.veids_per_slice()..slices.end * device.veids_per_slice();
        if veids.is_empty() || veids.start < window.start || veids.end > window.end {
            return Err(PartitionError::invalid_argument(format!(
                "saved VEIDs {veids:?} lie outside {window:?} of {swizz_id}"
            )));
        }

        if !self.validity().is_combination_valid(flag, &self.existing_flags()) {
            return Err(PartitionError::not_supported(format!(
                "profile {} cannot coexist with the current instances",
                profile.name
            )));
        }

        Ok(GpuInstancePlan {
            slot,
            swizz_id,
            flag,
            memory_size: profile.memory_size,
            uuid: Some(snapshot.uuid),
            allocation: ResourceAllocation {
                gpcs,
                gfx_gpc_count: snapshot.gfx_gpc_count,
                virtual_gpc_count: snapshot.virtual_gpc_count,
                veid_offset: snapshot.veid_offset,
                veid_count: snapshot.veid_count,
                engines,
                local_engines: local_engine_mask(engines),
                sm_count: snapshot.sm_count,
            },
        })
    }

    fn install_gpu_instance(&mut self, plan: GpuInstancePlan) -> Result<GpuInstanceId> {
        self.engines.set_engines_in_use(plan.allocation.engines)?;

        let rules = self.validity();
        let heap = if rules.memory_partitioning_required(plan.flag)
            && rules.memory_partitioning_needed(plan.swizz_id)
        {
            let size = self.chip.device.memory_bytes / u64::from(DEVICE_SLICES)
                * u64::from(plan.memory_size.slices());
            match self.services.heaps.create_isolated_heap(size) {
                Ok(heap) => Some(heap),
                Err(err) => {
                    self.engines.clear_engines_in_use(plan.allocation.engines);
                    warn!(swizz_id = %plan.swizz_id, error = %err, "memory partition creation failed");
                    return Err(err);
                }
            }
        } else {
            None
        };

        let handles = match InstanceHandles::allocate(self.services.handles.as_ref()) {
            Ok(handles) => handles,
            Err(err) => {
                self.release_heap(heap);
                self.engines.clear_engines_in_use(plan.allocation.engines);
                warn!(swizz_id = %plan.swizz_id, error = %err, "internal handle allocation failed");
                return Err(err);
            }
        };

        let uuid = match plan.uuid {
            Some(uuid) => uuid,
            None => self.next_uuid(plan.swizz_id, None),
        };

        let instance = GpuInstance {
            swizz_id: plan.swizz_id,
            flag: plan.flag,
            memory_size: plan.memory_size,
            uuid,
            allocation: plan.allocation,
            exclusive_engines: EngineMask::new(),
            shared_engines: EngineMask::new(),
            compute_instances: Arena::new(),
            placement_ids_in_use: CtsIdMask::new(),
            spans_in_use: BitSet::new(),
            heap,
            handles,
            share: Share::new(),
        };
        let engines = instance.allocation.engines;
        let Some(generation) = self.gpu_instances.insert_at(plan.slot, instance) else {
            handles.free(self.services.handles.as_ref());
            self.release_heap(heap);
            self.engines.clear_engines_in_use(engines);
            return Err(PartitionError::invalid_state(format!(
                "GPU instance slot {} was taken during creation",
                plan.slot
            )));
        };
        self.swizz_in_use.insert(plan.swizz_id);

        let id = GpuInstanceId {
            slot: plan.slot,
            generation,
        };
        info!(
            id = %id,
            swizz_id = %plan.swizz_id,
            flag = plan.flag,
            uuid = %uuid,
            "GPU instance created"
        );
        Ok(id)
    }

    fn release_heap(&self, heap: Option<HeapHandle>) {
        if let Some(heap) = heap {
            if let Err(err) = self.services.heaps.destroy_heap(heap) {
                warn!(heap = heap.0, error = %err, "failed to destroy memory partition");
            }
        }
    }

    /// Destroys a GPU instance.
    ///
    /// Without `force_unload` the instance must have no subscribers and no
    /// valid compute instance. With it, compute instances and subscriptions
    /// are torn down first.
    pub fn invalidate_gpu_instance(&mut self, id: GpuInstanceId, force_unload: bool) -> Result<()> {
        let gi = self.gpu_instance(id)?;
        if force_unload {
            for ci in gi.compute_instance_ids() {
                self.delete_compute_instance(id, ci, true)?;
            }
            let handles = self.services.handles.clone();
            self.subscriptions
                .purge(handles.as_ref(), |target| target.gpu_instance() == Some(id));
        } else {
            if !gi.share.is_sole_owner() {
                return Err(PartitionError::in_use(format!(
                    "GPU instance {id} has {} subscribers",
                    gi.share.subscriber_count()
                )));
            }
            if !gi.compute_instances.is_empty() {
                return Err(PartitionError::invalid_state(format!(
                    "GPU instance {id} still has {} compute instances",
                    gi.compute_instances.len()
                )));
            }
        }

        let gi = self
            .gpu_instances
            .remove(id.slot, id.generation)
            .ok_or_else(|| PartitionError::not_found(format!("GPU instance {id}")))?;
        gi.handles.free(self.services.handles.as_ref());
        self.engines.clear_engines_in_use(gi.allocation.engines);
        self.swizz_in_use.remove(gi.swizz_id);
        self.release_heap(gi.heap);

        info!(id = %id, swizz_id = %gi.swizz_id, force_unload, "GPU instance destroyed");
        Ok(())
    }

    /// True when nothing subscribes to the instance and it has no valid
    /// compute instance.
    pub fn ready_to_destroy(&self, id: GpuInstanceId) -> Result<bool> {
        let gi = self.gpu_instance(id)?;
        Ok(gi.share.is_sole_owner() && gi.compute_instances.is_empty())
    }

    pub fn describe_gpu_instance(&self, id: GpuInstanceId) -> Result<GpuInstanceInfo> {
        let gi = self.gpu_instance(id)?;
        Ok(self.project_gpu_instance(gi))
    }

    /// Every valid GPU instance, ordered by swizz id.
    pub fn describe_all_gpu_instances(&self) -> Vec<GpuInstanceInfo> {
        let mut infos: Vec<GpuInstanceInfo> = self
            .gpu_instances
            .iter()
            .map(|(_, _, gi)| self.project_gpu_instance(gi))
            .collect();
        infos.sort_by_key(|info| info.swizz_id);
        infos
    }

    fn project_gpu_instance(&self, gi: &GpuInstance) -> GpuInstanceInfo {
        let profile_name = self
            .chip
            .gpu_instance_profile(gi.flag)
            .map(|p| p.name.clone())
            .unwrap_or_default();
        GpuInstanceInfo {
            swizz_id: gi.swizz_id.0,
            partition_flag: gi.flag,
            profile_name,
            uuid: gi.uuid,
            memory_size: gi.memory_size,
            memory_partitioned: gi.heap.is_some(),
            gpc_ids: gi.allocation.gpcs.iter().map(|g| g.0).collect(),
            gfx_gpc_count: gi.allocation.gfx_gpc_count,
            virtual_gpc_count: gi.allocation.virtual_gpc_count,
            veid_offset: gi.allocation.veid_offset,
            veid_count: gi.allocation.veid_count,
            sm_count: gi.allocation.sm_count,
            engine_mask: gi.allocation.engines.bits(),
            local_engine_mask: gi.allocation.local_engines.bits(),
            exclusive_engine_mask: gi.exclusive_engines.bits(),
            shared_engine_mask: gi.shared_engines.bits(),
            compute_instance_ids: gi.compute_instances.iter().map(|(slot, _, _)| slot).collect(),
            subscriber_count: gi.share.subscriber_count(),
        }
    }
}
