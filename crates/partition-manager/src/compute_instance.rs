//! Compute instance lifecycle inside a GPU instance.
//!
//! Placement ids come from the GPU instance profile's legal set. Engines
//! are drawn from the GPU instance's local engine space, so every engine
//! mask stored here is GI-local; [`ResourceAllocation::local_engines`] holds
//! the compute instance's own zero-based view.

use std::ops::Range;

use api_types::ComputeInstanceInfo;
use api_types::ComputeSize;
use api_types::ExportedComputeInstance;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;
use utils::bitset::BitSet;
use uuid::Uuid;

use crate::config::ComputeProfile;
use crate::config::GpuInstanceProfile;
use crate::engine::allocate_instance_engines;
use crate::engine::local_engine_mask;
use crate::engine::EngineKind;
use crate::engine::EngineMask;
use crate::engine::SharedEngineFlags;
use crate::error::PartitionError;
use crate::error::Result;
use crate::gpu_instance::GpuInstance;
use crate::gpu_instance::ResourceAllocation;
use crate::ids::ComputeInstanceId;
use crate::ids::CtsId;
use crate::ids::CtsIdMask;
use crate::ids::GpcMask;
use crate::ids::GpuInstanceId;
use crate::manager::PartitionManager;
use crate::manager::MAX_COMPUTE_INSTANCES;
use crate::placement;
use crate::services::InstanceHandles;
use crate::share::Share;

pub(crate) struct ComputeInstance {
    pub(crate) uuid: Uuid,
    pub(crate) compute_size: ComputeSize,
    pub(crate) placement_id: CtsId,
    pub(crate) span_start: u32,
    pub(crate) allocation: ResourceAllocation,
    pub(crate) shared_flags: SharedEngineFlags,
    pub(crate) handles: InstanceHandles,
    pub(crate) share: Share,
}

/// Requested size of a compute instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComputeShape {
    Size(ComputeSize),
    /// Smallest-footprint size with exactly this many GPCs
    GpcCount(u32),
    SmCount(u32),
}

/// Where a compute instance goes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ComputePlacement {
    /// Lowest free placement id
    #[default]
    Any,
    Id(CtsId),
    SpanStart(u32),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComputeRequest {
    pub shape: ComputeShape,
    pub ce_count: u32,
    pub nvdec_count: u32,
    pub nvenc_count: u32,
    pub nvjpg_count: u32,
    pub ofa_count: u32,
    /// Engine kinds drawn from the shared pool instead of exclusively
    pub shared_engine_flags: SharedEngineFlags,
    pub placement: ComputePlacement,
    /// Explicit local id
    pub id: Option<u32>,
    /// Requires a graphics-capable placement
    pub graphics: bool,
}

impl ComputeRequest {
    pub fn new(shape: ComputeShape) -> Self {
        Self {
            shape,
            ce_count: 0,
            nvdec_count: 0,
            nvenc_count: 0,
            nvjpg_count: 0,
            ofa_count: 0,
            shared_engine_flags: SharedEngineFlags::NONE,
            placement: ComputePlacement::Any,
            id: None,
            graphics: false,
        }
    }

    pub fn with_engines(mut self, kind: EngineKind, count: u32) -> Self {
        match kind {
            EngineKind::Graphics => {}
            EngineKind::Copy => self.ce_count = count,
            EngineKind::Nvdec => self.nvdec_count = count,
            EngineKind::Nvenc => self.nvenc_count = count,
            EngineKind::Nvjpg => self.nvjpg_count = count,
            EngineKind::Ofa => self.ofa_count = count,
        }
        self
    }

    pub fn shared(mut self, flags: SharedEngineFlags) -> Self {
        self.shared_engine_flags = flags;
        self
    }

    pub fn at(mut self, placement: ComputePlacement) -> Self {
        self.placement = placement;
        self
    }

    /// Engines of `kind` the request asks for. Every compute instance
    /// owns exactly one graphics engine.
    pub fn engine_count(&self, kind: EngineKind) -> u32 {
        match kind {
            EngineKind::Graphics => 1,
            EngineKind::Copy => self.ce_count,
            EngineKind::Nvdec => self.nvdec_count,
            EngineKind::Nvenc => self.nvenc_count,
            EngineKind::Nvjpg => self.nvjpg_count,
            EngineKind::Ofa => self.ofa_count,
        }
    }
}

/// How a batch of compute instances is created
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ComputeInstanceCreate {
    Request(Vec<ComputeRequest>),
    /// Install exported shapes verbatim
    Restore(Vec<ExportedComputeInstance>),
}

impl ComputeInstanceCreate {
    fn len(&self) -> usize {
        match self {
            Self::Request(requests) => requests.len(),
            Self::Restore(exported) => exported.len(),
        }
    }
}

/// GPU instance bookkeeping as it will look after the planned batch.
struct Shadow {
    exclusive: EngineMask,
    shared: EngineMask,
    placement_ids_in_use: CtsIdMask,
    spans_in_use: BitSet<u32, 1>,
    slots_taken: BitSet<u32, 1>,
    gpcs_in_use: GpcMask,
    veids_in_use: Vec<Range<u32>>,
}

impl Shadow {
    fn claim(&mut self, allocation: &ResourceAllocation) {
        self.gpcs_in_use |= allocation.gpcs;
        self.veids_in_use
            .push(allocation.veid_offset..allocation.veid_offset + allocation.veid_count);
    }
}

struct ComputePlan {
    slot: u32,
    uuid: Option<Uuid>,
    compute_size: ComputeSize,
    placement_id: CtsId,
    span_start: u32,
    span_slots: u32,
    allocation: ResourceAllocation,
    shared_flags: SharedEngineFlags,
    exclusive_delta: EngineMask,
    shared_delta: EngineMask,
}

impl PartitionManager {
    /// Creates every compute instance of `params` inside `gpu_instance` or
    /// none of them.
    ///
    /// With `query_only` the batch is only planned: the result tells whether
    /// it fits right now and nothing is created.
    pub fn create_compute_instances(
        &mut self,
        gpu_instance: GpuInstanceId,
        params: ComputeInstanceCreate,
        query_only: bool,
    ) -> Result<Vec<ComputeInstanceId>> {
        self.ensure_enabled()?;
        let plans = self
            .plan_compute_instances(gpu_instance, &params)
            .inspect_err(|err| {
                warn!(gpu_instance = %gpu_instance, error = %err, "compute instance request rejected");
            })?;
        if query_only {
            debug!(gpu_instance = %gpu_instance, count = plans.len(), "compute instance request fits");
            return Ok(Vec::new());
        }

        let mut created = Vec::with_capacity(plans.len());
        for plan in plans {
            match self.install_compute_instance(gpu_instance, plan) {
                Ok(id) => created.push(id),
                Err(err) => {
                    warn!(
                        gpu_instance = %gpu_instance,
                        rolled_back = created.len(),
                        error = %err,
                        "compute instance creation failed"
                    );
                    for id in created.iter().rev() {
                        if let Err(rollback) = self.delete_compute_instance(gpu_instance, *id, true) {
                            error!(compute_instance = %id, error = %rollback, "rollback failed");
                        }
                    }
                    return Err(err);
                }
            }
        }
        Ok(created)
    }

    fn plan_compute_instances(
        &self,
        gpu_instance: GpuInstanceId,
        params: &ComputeInstanceCreate,
    ) -> Result<Vec<ComputePlan>> {
        let gi = self.gpu_instance(gpu_instance)?;
        let profile = self.chip.gpu_instance_profile(gi.flag).ok_or_else(|| {
            PartitionError::invalid_state(format!("GPU instance {gpu_instance} has no profile"))
        })?;

        let count = params.len();
        if count == 0 {
            return Err(PartitionError::invalid_argument("no compute instances requested"));
        }
        if count > gi.compute_instances.vacant_count() {
            return Err(PartitionError::insufficient_resources(format!(
                "{count} compute instances requested, {} slots free",
                gi.compute_instances.vacant_count()
            )));
        }

        let mut shadow = Shadow {
            exclusive: gi.exclusive_engines,
            shared: gi.shared_engines,
            placement_ids_in_use: gi.placement_ids_in_use,
            spans_in_use: gi.spans_in_use,
            slots_taken: BitSet::new(),
            gpcs_in_use: GpcMask::new(),
            veids_in_use: Vec::new(),
        };
        for (_, _, ci) in gi.compute_instances.iter() {
            shadow.claim(&ci.allocation);
        }
        match params {
            ComputeInstanceCreate::Request(requests) => requests
                .iter()
                .map(|request| self.plan_compute_request(gi, profile, request, &mut shadow))
                .collect(),
            ComputeInstanceCreate::Restore(exported) => exported
                .iter()
                .map(|exported| self.plan_compute_restore(gi, profile, exported, &mut shadow))
                .collect(),
        }
    }

    fn resolve_compute_size(&self, shape: ComputeShape) -> Result<&ComputeProfile> {
        match shape {
            ComputeShape::Size(size) => self.compute_profile_for_size(size),
            ComputeShape::GpcCount(count) => self.compute_profile_for_gpc_count(count),
            ComputeShape::SmCount(count) => self.compute_profile_for_sm_count(count),
        }
    }

    fn plan_compute_request(
        &self,
        gi: &GpuInstance,
        profile: &GpuInstanceProfile,
        request: &ComputeRequest,
        shadow: &mut Shadow,
    ) -> Result<ComputePlan> {
        let compute = self.resolve_compute_size(request.shape)?;
        let size = compute.compute_size;
        let span_slots = self.placement.slots_per_placement(size)?;

        let placement_id = match request.placement {
            ComputePlacement::Any => self.placement.find_free_placement_id(
                profile.placement_mask(),
                profile.gfx_placement_mask(),
                shadow.placement_ids_in_use,
                size,
                request.graphics,
                true,
            )?,
            ComputePlacement::Id(id) => id,
            ComputePlacement::SpanStart(span) => {
                self.placement.placement_id_from_span_start(size, span)?
            }
        };
        if placement::compute_size_for_placement_id(placement_id) != Some(size) {
            return Err(PartitionError::invalid_argument(format!(
                "{placement_id} does not hold a {size} compute instance"
            )));
        }
        check_placement(profile, shadow, placement_id)?;
        if request.graphics && !profile.gfx_placement_mask().test(placement_id) {
            return Err(PartitionError::invalid_argument(format!(
                "{placement_id} is not graphics capable"
            )));
        }
        let span_start = self.placement.span_start_from_placement_id(placement_id)?;
        let slot = pick_slot(gi, shadow, request.id)?;

        let mut engines = EngineMask::new();
        let mut exclusive_delta = EngineMask::new();
        let mut shared_delta = EngineMask::new();
        for kind in EngineKind::ALL {
            let want_shared = request.shared_engine_flags.shares(kind);
            let drawn = allocate_instance_engines(
                gi.allocation.local_engines,
                want_shared,
                kind,
                request.engine_count(kind),
                shadow.exclusive,
                shadow.shared,
            )?;
            engines |= drawn.engines;
            exclusive_delta |= drawn.exclusive_delta;
            shared_delta |= drawn.shared_delta;
            shadow.exclusive |= drawn.exclusive_delta;
            shadow.shared |= drawn.shared_delta;
        }

        let allocation =
            self.derive_compute_allocation(gi, profile, compute, placement_id, span_start, engines)?;
        shadow.claim(&allocation);
        shadow.placement_ids_in_use.insert(placement_id);
        shadow.spans_in_use.insert_range(span_start..span_start + span_slots);
        shadow.slots_taken.insert(slot);

        debug!(
            slot,
            cts_id = %placement_id,
            span_start,
            engines = ?engines,
            "planned compute instance"
        );
        Ok(ComputePlan {
            slot,
            uuid: None,
            compute_size: size,
            placement_id,
            span_start,
            span_slots,
            allocation,
            shared_flags: request.shared_engine_flags,
            exclusive_delta,
            shared_delta,
        })
    }

    /// GPCs and VEIDs implied by a placement, measured in units of the
    /// smallest compute profile.
    fn derive_compute_allocation(
        &self,
        gi: &GpuInstance,
        profile: &GpuInstanceProfile,
        compute: &ComputeProfile,
        placement_id: CtsId,
        span_start: u32,
        engines: EngineMask,
    ) -> Result<ResourceAllocation> {
        let basis = self.compute_profile_for_size(self.placement.smallest())?;

        let first = span_start * basis.gpc_count;
        let gpcs = (first..first + compute.gpc_count)
            .map(|position| gi.allocation.gpcs.nth(position))
            .collect::<Option<GpcMask>>()
            .ok_or_else(|| {
                PartitionError::insufficient_resources(format!(
                    "{placement_id} reaches past the {} GPCs of the GPU instance",
                    gi.allocation.gpc_count()
                ))
            })?;

        let veid_offset = span_start * basis.veid_count;
        if veid_offset + compute.veid_count > gi.allocation.veid_count {
            return Err(PartitionError::insufficient_resources(format!(
                "{placement_id} reaches past the {} VEIDs of the GPU instance",
                gi.allocation.veid_count
            )));
        }

        let gfx_gpc_count = if profile.gfx_placement_mask().test(placement_id) {
            compute.gpc_count
        } else {
            0
        };
        Ok(ResourceAllocation {
            gpcs,
            gfx_gpc_count,
            virtual_gpc_count: compute.gpc_count,
            veid_offset,
            veid_count: compute.veid_count,
            engines,
            local_engines: local_engine_mask(engines),
            sm_count: self.chip.sm_count(compute.gpc_count),
        })
    }

    fn plan_compute_restore(
        &self,
        gi: &GpuInstance,
        profile: &GpuInstanceProfile,
        exported: &ExportedComputeInstance,
        shadow: &mut Shadow,
    ) -> Result<ComputePlan> {
        let compute = self.compute_profile_for_size(exported.compute_size)?;
        let size = compute.compute_size;
        let placement_id = CtsId(exported.placement_id);
        if placement::compute_size_for_placement_id(placement_id) != Some(size) {
            return Err(PartitionError::invalid_argument(format!(
                "{placement_id} does not hold a {size} compute instance"
            )));
        }
        let span_start = self.placement.span_start_from_placement_id(placement_id)?;
        if span_start != exported.span_start {
            return Err(PartitionError::invalid_argument(format!(
                "span start {} does not match {placement_id}",
                exported.span_start
            )));
        }
        check_placement(profile, shadow, placement_id)?;
        let span_slots = self.placement.slots_per_placement(size)?;

        let engines = EngineMask::from_bits(exported.engine_mask);
        if !engines.is_subset_of(&gi.allocation.local_engines) {
            return Err(PartitionError::invalid_argument(format!(
                "engines {:?} are not part of the GPU instance",
                engines - gi.allocation.local_engines
            )));
        }
        let shared_flags = SharedEngineFlags::from_bits(exported.shared_engine_flags)
            .ok_or_else(|| {
                PartitionError::invalid_argument(format!(
                    "unknown shared engine flags {:#x}",
                    exported.shared_engine_flags
                ))
            })?;
        let mut exclusive_delta = EngineMask::new();
        let mut shared_delta = EngineMask::new();
        for engine in engines.iter() {
            let shares = engine.kind().is_some_and(|kind| shared_flags.shares(kind));
            let taken = if shares {
                shadow.exclusive.test(engine)
            } else {
                shadow.exclusive.test(engine) || shadow.shared.test(engine)
            };
            if taken {
                return Err(PartitionError::in_use(format!(
                    "engine {engine} is already assigned in the GPU instance"
                )));
            }
            if shares {
                if !shadow.shared.test(engine) {
                    shared_delta.insert(engine);
                }
            } else {
                exclusive_delta.insert(engine);
            }
        }

        let gpcs = GpcMask::from_bits(exported.gpc_mask);
        if gpcs.is_empty() || !gpcs.is_subset_of(&gi.allocation.gpcs) {
            return Err(PartitionError::invalid_argument(format!(
                "GPC mask {:#x} is not part of the GPU instance",
                exported.gpc_mask
            )));
        }
        let veids = exported.veid_offset
            ..exported
                .veid_offset
                .checked_add(exported.veid_count)
                .filter(|end| *end <= gi.allocation.veid_count)
                .ok_or_else(|| {
                    PartitionError::invalid_argument(format!(
                        "VEIDs {}+{} exceed the GPU instance",
                        exported.veid_offset, exported.veid_count
                    ))
                })?;
        if !gpcs.is_disjoint(&shadow.gpcs_in_use) {
            return Err(PartitionError::in_use(format!(
                "GPCs {:?} belong to another compute instance",
                gpcs & shadow.gpcs_in_use
            )));
        }
        if let Some(live) = shadow
            .veids_in_use
            .iter()
            .find(|live| live.start < veids.end && veids.start < live.end)
        {
            return Err(PartitionError::in_use(format!(
                "VEIDs {veids:?} overlap another compute instance at {live:?}"
            )));
        }

        let derived =
            self.derive_compute_allocation(gi, profile, compute, placement_id, span_start, engines)?;
        if gpcs != derived.gpcs
            || exported.veid_offset != derived.veid_offset
            || exported.veid_count != derived.veid_count
        {
            return Err(PartitionError::invalid_argument(format!(
                "saved GPCs {gpcs:?} and VEIDs {veids:?} do not match {placement_id}, \
                 which holds {:?} and VEIDs {}+{}",
                derived.gpcs, derived.veid_offset, derived.veid_count
            )));
        }
        let slot = pick_slot(gi, shadow, Some(exported.id))?;

        shadow.exclusive |= exclusive_delta;
        shadow.shared |= shared_delta;
        shadow.claim(&derived);
        shadow.placement_ids_in_use.insert(placement_id);
        shadow.spans_in_use.insert_range(span_start..span_start + span_slots);
        shadow.slots_taken.insert(slot);

        let gfx_gpc_count = if profile.gfx_placement_mask().test(placement_id) {
            gpcs.count()
        } else {
            0
        };
        Ok(ComputePlan {
            slot,
            uuid: Some(exported.uuid),
            compute_size: size,
            placement_id,
            span_start,
            span_slots,
            allocation: ResourceAllocation {
                gpcs,
                gfx_gpc_count,
                virtual_gpc_count: gpcs.count(),
                veid_offset: exported.veid_offset,
                veid_count: exported.veid_count,
                engines,
                local_engines: local_engine_mask(engines),
                sm_count: exported.sm_count,
            },
            shared_flags,
            exclusive_delta,
            shared_delta,
        })
    }

    fn install_compute_instance(
        &mut self,
        gpu_instance: GpuInstanceId,
        plan: ComputePlan,
    ) -> Result<ComputeInstanceId> {
        let swizz_id = self.gpu_instance(gpu_instance)?.swizz_id;
        let handle_service = self.services.handles.clone();
        let handles = InstanceHandles::allocate(handle_service.as_ref())?;
        let uuid = match plan.uuid {
            Some(uuid) => uuid,
            None => self.next_uuid(swizz_id, Some(plan.slot)),
        };

        let instance = ComputeInstance {
            uuid,
            compute_size: plan.compute_size,
            placement_id: plan.placement_id,
            span_start: plan.span_start,
            allocation: plan.allocation,
            shared_flags: plan.shared_flags,
            handles,
            share: Share::new(),
        };
        let gi = self.gpu_instance_mut(gpu_instance)?;
        let Some(generation) = gi.compute_instances.insert_at(plan.slot, instance) else {
            handles.free(handle_service.as_ref());
            return Err(PartitionError::in_use(format!(
                "compute instance slot {} is occupied",
                plan.slot
            )));
        };
        gi.exclusive_engines |= plan.exclusive_delta;
        gi.shared_engines |= plan.shared_delta;
        gi.placement_ids_in_use.insert(plan.placement_id);
        gi.spans_in_use
            .insert_range(plan.span_start..plan.span_start + plan.span_slots);

        let id = ComputeInstanceId {
            slot: plan.slot,
            generation,
        };
        info!(
            gpu_instance = %gpu_instance,
            compute_instance = %id,
            cts_id = %plan.placement_id,
            size = %plan.compute_size,
            uuid = %uuid,
            "compute instance created"
        );
        Ok(id)
    }

    /// Destroys a compute instance. Subscribers block the delete unless
    /// `unload` is set, in which case their subscriptions are dropped.
    pub fn delete_compute_instance(
        &mut self,
        gpu_instance: GpuInstanceId,
        compute_instance: ComputeInstanceId,
        unload: bool,
    ) -> Result<()> {
        let ci = self
            .gpu_instance(gpu_instance)?
            .compute_instance(compute_instance)?;
        if !unload && !ci.share.is_sole_owner() {
            return Err(PartitionError::in_use(format!(
                "compute instance {compute_instance} has {} subscribers",
                ci.share.subscriber_count()
            )));
        }
        let span_slots = self.placement.slots_per_placement(ci.compute_size)?;

        let handle_service = self.services.handles.clone();
        if unload {
            self.subscriptions.purge(handle_service.as_ref(), |target| {
                target.compute_instance() == Some((gpu_instance, compute_instance))
            });
        }

        let gi = self.gpu_instance_mut(gpu_instance)?;
        let ci = gi
            .compute_instances
            .remove(compute_instance.slot, compute_instance.generation)
            .ok_or_else(|| PartitionError::not_found(format!("compute instance {compute_instance}")))?;

        let still_used = gi
            .compute_instances
            .iter()
            .fold(EngineMask::new(), |acc, (_, _, other)| acc | other.allocation.engines);
        gi.exclusive_engines = gi.exclusive_engines - ci.allocation.engines;
        gi.shared_engines = gi.shared_engines - (ci.allocation.engines - still_used);
        gi.placement_ids_in_use.remove(ci.placement_id);
        for span in ci.span_start..ci.span_start + span_slots {
            gi.spans_in_use.remove(span);
        }
        ci.handles.free(handle_service.as_ref());

        info!(
            gpu_instance = %gpu_instance,
            compute_instance = %compute_instance,
            cts_id = %ci.placement_id,
            unload,
            "compute instance destroyed"
        );
        Ok(())
    }

    /// Snapshot that recreates the compute instance through
    /// [`ComputeInstanceCreate::Restore`].
    pub fn export_compute_instance(
        &self,
        gpu_instance: GpuInstanceId,
        compute_instance: ComputeInstanceId,
    ) -> Result<ExportedComputeInstance> {
        let ci = self
            .gpu_instance(gpu_instance)?
            .compute_instance(compute_instance)?;
        Ok(export(compute_instance.slot, ci))
    }

    pub(crate) fn export_all_compute_instances(&self, gi: &GpuInstance) -> Vec<ExportedComputeInstance> {
        gi.compute_instances
            .iter()
            .map(|(slot, _, ci)| export(slot, ci))
            .collect()
    }

    pub fn describe_compute_instance(
        &self,
        gpu_instance: GpuInstanceId,
        compute_instance: ComputeInstanceId,
    ) -> Result<ComputeInstanceInfo> {
        let ci = self
            .gpu_instance(gpu_instance)?
            .compute_instance(compute_instance)?;
        Ok(describe(compute_instance.slot, ci))
    }

    /// Every valid compute instance of the GPU instance, by local id.
    pub fn describe_active_compute_instances(
        &self,
        gpu_instance: GpuInstanceId,
    ) -> Result<Vec<ComputeInstanceInfo>> {
        let gi = self.gpu_instance(gpu_instance)?;
        Ok(gi
            .compute_instances
            .iter()
            .map(|(slot, _, ci)| describe(slot, ci))
            .collect())
    }

    pub fn compute_instance_ids(&self, gpu_instance: GpuInstanceId) -> Result<Vec<ComputeInstanceId>> {
        Ok(self.gpu_instance(gpu_instance)?.compute_instance_ids())
    }

    pub fn compute_instance_by_local_id(
        &self,
        gpu_instance: GpuInstanceId,
        local_id: u32,
    ) -> Result<ComputeInstanceId> {
        self.gpu_instance(gpu_instance)?
            .compute_instance_ids()
            .into_iter()
            .find(|id| id.local_id() == local_id)
            .ok_or_else(|| {
                PartitionError::not_found(format!(
                    "compute instance {local_id} of GPU instance {gpu_instance}"
                ))
            })
    }
}

/// The placement id must be legal for the profile and clear of every
/// placement already taken.
fn check_placement(profile: &GpuInstanceProfile, shadow: &Shadow, id: CtsId) -> Result<()> {
    let legal = profile.placement_mask();
    if !legal.test(id) {
        return Err(PartitionError::invalid_argument(format!(
            "{id} is not a legal placement for profile {}",
            profile.name
        )));
    }
    if !placement::is_placement_available(legal, shadow.placement_ids_in_use, id) {
        return Err(PartitionError::in_use(format!(
            "{id} overlaps a valid compute instance"
        )));
    }
    Ok(())
}

fn pick_slot(gi: &GpuInstance, shadow: &Shadow, requested: Option<u32>) -> Result<u32> {
    let free = |slot: u32| gi.compute_instances.is_vacant(slot) && !shadow.slots_taken.test(slot);
    match requested {
        Some(slot) if slot as usize >= MAX_COMPUTE_INSTANCES => Err(
            PartitionError::invalid_argument(format!("compute instance id {slot} is out of range")),
        ),
        Some(slot) if free(slot) => Ok(slot),
        Some(slot) => Err(PartitionError::in_use(format!(
            "compute instance id {slot} is taken"
        ))),
        None => (0..MAX_COMPUTE_INSTANCES as u32)
            .find(|slot| free(*slot))
            .ok_or_else(|| PartitionError::insufficient_resources("every compute instance slot is in use")),
    }
}

fn export(slot: u32, ci: &ComputeInstance) -> ExportedComputeInstance {
    ExportedComputeInstance {
        id: slot,
        uuid: ci.uuid,
        compute_size: ci.compute_size,
        placement_id: ci.placement_id.0,
        span_start: ci.span_start,
        gpc_mask: ci.allocation.gpcs.bits(),
        veid_offset: ci.allocation.veid_offset,
        veid_count: ci.allocation.veid_count,
        sm_count: ci.allocation.sm_count,
        engine_mask: ci.allocation.engines.bits(),
        shared_engine_flags: ci.shared_flags.bits(),
    }
}

fn describe(slot: u32, ci: &ComputeInstance) -> ComputeInstanceInfo {
    ComputeInstanceInfo {
        id: slot,
        uuid: ci.uuid,
        compute_size: ci.compute_size,
        placement_id: ci.placement_id.0,
        span_start: ci.span_start,
        gpc_ids: ci.allocation.gpcs.iter().map(|g| g.0).collect(),
        veid_offset: ci.allocation.veid_offset,
        veid_count: ci.allocation.veid_count,
        sm_count: ci.allocation.sm_count,
        engine_mask: ci.allocation.engines.bits(),
        local_engine_mask: ci.allocation.local_engines.bits(),
        shared_engine_flags: ci.shared_flags.bits(),
        subscriber_count: ci.share.subscriber_count(),
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;
    use test_log::test;

    use super::*;
    use crate::engine::EngineType;
    use crate::gpu_instance::GpuInstanceCreate;
    use crate::gpu_instance::GpuInstanceRequest;
    use crate::mock::mock_services;
    use crate::mock::reference_chip;
    use crate::mock::MockHandleService;
    use std::sync::Arc;

    const HALF: u32 = 1;
    const QUARTER: u32 = 2;

    fn setup(flag: u32) -> (PartitionManager, GpuInstanceId, Arc<MockHandleService>) {
        let (services, _, handles) = mock_services();
        let mut manager = PartitionManager::new(reference_chip(), Uuid::nil(), services).unwrap();
        let gi = manager
            .create_gpu_instance(GpuInstanceCreate::Request(GpuInstanceRequest::new(flag)))
            .unwrap();
        (manager, gi, handles)
    }

    fn request(size: ComputeSize) -> ComputeRequest {
        ComputeRequest::new(ComputeShape::Size(size))
    }

    fn create(
        manager: &mut PartitionManager,
        gi: GpuInstanceId,
        requests: Vec<ComputeRequest>,
    ) -> Result<Vec<ComputeInstanceId>> {
        manager.create_compute_instances(gi, ComputeInstanceCreate::Request(requests), false)
    }

    fn copy_engines(instances: impl IntoIterator<Item = u32>) -> u64 {
        instances
            .into_iter()
            .map(|n| EngineType::new(EngineKind::Copy, n))
            .collect::<EngineMask>()
            .bits()
    }

    #[test]
    fn test_eighths_fill_a_quarter() {
        let (mut manager, gi, _) = setup(QUARTER);
        let ids = create(
            &mut manager,
            gi,
            vec![request(ComputeSize::Eighth), request(ComputeSize::Eighth)],
        )
        .unwrap();
        let infos = manager.describe_active_compute_instances(gi).unwrap();
        assert_eq!(ids.len(), 2);
        assert_eq!(
            infos.iter().map(|i| i.placement_id).collect::<Vec<_>>(),
            vec![13, 14]
        );
        assert_eq!(infos[0].gpc_ids, vec![0]);
        assert_eq!(infos[1].gpc_ids, vec![1]);
        assert_eq!((infos[0].veid_offset, infos[1].veid_offset), (0, 8));
        assert_eq!(infos[0].engine_mask & infos[1].engine_mask, 0);

        assert!(matches!(
            create(&mut manager, gi, vec![request(ComputeSize::Eighth)]),
            Err(PartitionError::NoFreeSlot {
                size: ComputeSize::Eighth
            })
        ));
    }

    #[test]
    fn test_overlapping_sizes_block_each_other() {
        let (mut manager, gi, _) = setup(QUARTER);
        create(&mut manager, gi, vec![request(ComputeSize::MiniQuarter)]).unwrap();
        let info = &manager.describe_active_compute_instances(gi).unwrap()[0];
        assert_eq!((info.placement_id, info.veid_count), (9, 16));
        assert!(matches!(
            create(&mut manager, gi, vec![request(ComputeSize::Eighth)]),
            Err(PartitionError::NoFreeSlot { .. })
        ));
        assert!(matches!(
            create(
                &mut manager,
                gi,
                vec![request(ComputeSize::Eighth).at(ComputePlacement::Id(CtsId(14)))]
            ),
            Err(PartitionError::StateInUse { .. })
        ));
    }

    #[test]
    fn test_explicit_placements() {
        let (mut manager, gi, _) = setup(HALF);
        let ids = create(
            &mut manager,
            gi,
            vec![
                request(ComputeSize::Quarter).at(ComputePlacement::SpanStart(2)),
                request(ComputeSize::Eighth).at(ComputePlacement::Id(CtsId(14))),
            ],
        )
        .unwrap();
        let quarter = manager.describe_compute_instance(gi, ids[0]).unwrap();
        assert_eq!(quarter.placement_id, 6);
        assert_eq!(quarter.gpc_ids, vec![2, 3]);
        assert_eq!(quarter.veid_offset, 16);
        let eighth = manager.describe_compute_instance(gi, ids[1]).unwrap();
        assert_eq!(eighth.span_start, 1);

        assert!(matches!(
            create(
                &mut manager,
                gi,
                vec![request(ComputeSize::Quarter).at(ComputePlacement::Id(CtsId(13)))]
            ),
            Err(PartitionError::InvalidArgument { .. })
        ));
        assert!(matches!(
            create(
                &mut manager,
                gi,
                vec![request(ComputeSize::Quarter).at(ComputePlacement::SpanStart(1))]
            ),
            Err(PartitionError::InvalidArgument { .. })
        ));
    }

    #[test]
    fn test_graphics_placement() {
        let (mut manager, gi, _) = setup(HALF);
        let mut graphics = request(ComputeSize::Quarter);
        graphics.graphics = true;
        let ids = create(&mut manager, gi, vec![graphics.clone()]).unwrap();
        let info = manager.describe_compute_instance(gi, ids[0]).unwrap();
        assert_eq!(info.placement_id, 5);
        assert!(matches!(
            create(&mut manager, gi, vec![graphics]),
            Err(PartitionError::NoFreeSlot { .. })
        ));
        create(&mut manager, gi, vec![request(ComputeSize::Quarter)]).unwrap();
    }

    #[test]
    fn test_shared_and_exclusive_engines() {
        let (mut manager, gi, _) = setup(HALF);
        let shared = |count| {
            request(ComputeSize::Eighth)
                .with_engines(EngineKind::Copy, count)
                .shared(SharedEngineFlags::COPY)
        };
        let exclusive = |count| request(ComputeSize::Eighth).with_engines(EngineKind::Copy, count);

        let first = create(&mut manager, gi, vec![shared(2)]).unwrap()[0];
        assert_eq!(
            create(&mut manager, gi, vec![exclusive(3)]),
            Err(PartitionError::InsufficientEngines {
                kind: EngineKind::Copy,
                requested: 3,
                available: 2,
            })
        );
        let second = create(&mut manager, gi, vec![exclusive(2)]).unwrap()[0];
        let third = create(&mut manager, gi, vec![shared(1)]).unwrap()[0];

        let info = manager.describe_compute_instance(gi, second).unwrap();
        assert_eq!(info.engine_mask & copy_engines(0..10), copy_engines([2, 3]));
        assert_eq!(info.local_engine_mask & copy_engines(0..10), copy_engines([0, 1]));
        let info = manager.describe_compute_instance(gi, third).unwrap();
        assert_eq!(info.engine_mask & copy_engines(0..10), copy_engines([0]));

        let gi_info = manager.describe_gpu_instance(gi).unwrap();
        assert_eq!(gi_info.shared_engine_mask, copy_engines([0, 1]));
        assert_eq!(
            gi_info.exclusive_engine_mask & copy_engines(0..10),
            copy_engines([2, 3])
        );

        manager.delete_compute_instance(gi, first, false).unwrap();
        let gi_info = manager.describe_gpu_instance(gi).unwrap();
        assert_eq!(gi_info.shared_engine_mask, copy_engines([0]));

        manager.delete_compute_instance(gi, third, false).unwrap();
        manager.delete_compute_instance(gi, second, false).unwrap();
        let gi_info = manager.describe_gpu_instance(gi).unwrap();
        assert_eq!(gi_info.shared_engine_mask, 0);
        assert_eq!(gi_info.exclusive_engine_mask, 0);
    }

    #[test]
    fn test_failed_batch_rolls_back() {
        let (mut manager, gi, handles) = setup(QUARTER);
        let before = manager.describe_gpu_instance(gi).unwrap();
        let live = handles.live_handles();

        // planning failure on the third element
        assert!(create(
            &mut manager,
            gi,
            vec![
                request(ComputeSize::Eighth),
                request(ComputeSize::Eighth),
                request(ComputeSize::Quarter),
            ]
        )
        .is_err());

        // install failure on the second element
        handles.fail_after(4);
        assert!(create(
            &mut manager,
            gi,
            vec![request(ComputeSize::Eighth), request(ComputeSize::Eighth)]
        )
        .is_err());
        handles.stop_failing();

        assert_eq!(manager.describe_gpu_instance(gi).unwrap(), before);
        assert_eq!(handles.live_handles(), live);
        assert_eq!(create(&mut manager, gi, vec![request(ComputeSize::Quarter)]).unwrap().len(), 1);
    }

    #[test]
    fn test_query_only_leaves_state() {
        let (mut manager, gi, _) = setup(QUARTER);
        let ids = manager
            .create_compute_instances(
                gi,
                ComputeInstanceCreate::Request(vec![request(ComputeSize::Quarter)]),
                true,
            )
            .unwrap();
        assert!(ids.is_empty());
        assert!(manager.compute_instance_ids(gi).unwrap().is_empty());
        assert!(manager
            .create_compute_instances(
                gi,
                ComputeInstanceCreate::Request(vec![request(ComputeSize::Full)]),
                true,
            )
            .is_err());
    }

    #[test]
    fn test_shape_lookups() {
        let (mut manager, gi, _) = setup(HALF);
        let ids = create(
            &mut manager,
            gi,
            vec![
                ComputeRequest::new(ComputeShape::GpcCount(2)),
                ComputeRequest::new(ComputeShape::SmCount(8)),
            ],
        )
        .unwrap();
        let infos: Vec<_> = ids
            .iter()
            .map(|id| manager.describe_compute_instance(gi, *id).unwrap().compute_size)
            .collect();
        assert_eq!(infos, vec![ComputeSize::Quarter, ComputeSize::Eighth]);
    }

    #[test]
    fn test_export_restore_round_trip() {
        let (mut manager, gi, _) = setup(HALF);
        let ids = create(
            &mut manager,
            gi,
            vec![
                request(ComputeSize::Eighth)
                    .with_engines(EngineKind::Copy, 1)
                    .with_engines(EngineKind::Nvdec, 1),
                request(ComputeSize::Quarter)
                    .with_engines(EngineKind::Copy, 2)
                    .shared(SharedEngineFlags::COPY),
            ],
        )
        .unwrap();
        let before = manager.describe_active_compute_instances(gi).unwrap();
        let exported: Vec<_> = ids
            .iter()
            .map(|id| manager.export_compute_instance(gi, *id).unwrap())
            .collect();
        let gi_before = manager.describe_gpu_instance(gi).unwrap();

        for id in ids.iter().rev() {
            manager.delete_compute_instance(gi, *id, false).unwrap();
        }
        manager
            .create_compute_instances(gi, ComputeInstanceCreate::Restore(exported.clone()), false)
            .unwrap();
        assert_eq!(manager.describe_active_compute_instances(gi).unwrap(), before);
        assert_eq!(manager.describe_gpu_instance(gi).unwrap(), gi_before);

        // restoring again collides with the live instances
        assert!(matches!(
            manager.create_compute_instances(gi, ComputeInstanceCreate::Restore(exported), false),
            Err(PartitionError::InsufficientResources { .. } | PartitionError::StateInUse { .. })
        ));
    }

    #[test]
    fn test_restore_validation() {
        let (mut manager, gi, _) = setup(QUARTER);
        let id = create(&mut manager, gi, vec![request(ComputeSize::Eighth)]).unwrap()[0];
        let exported = manager.export_compute_instance(gi, id).unwrap();
        manager.delete_compute_instance(gi, id, false).unwrap();

        let restore = |manager: &mut PartitionManager, exported: ExportedComputeInstance| {
            manager.create_compute_instances(gi, ComputeInstanceCreate::Restore(vec![exported]), false)
        };

        let mut bad_span = exported.clone();
        bad_span.span_start = 1;
        assert!(matches!(
            restore(&mut manager, bad_span),
            Err(PartitionError::InvalidArgument { .. })
        ));

        let mut foreign_engine = exported.clone();
        foreign_engine.engine_mask |= copy_engines([5]);
        assert!(matches!(
            restore(&mut manager, foreign_engine),
            Err(PartitionError::InvalidArgument { .. })
        ));

        let mut foreign_gpc = exported.clone();
        foreign_gpc.gpc_mask = 1 << 6;
        assert!(matches!(
            restore(&mut manager, foreign_gpc),
            Err(PartitionError::InvalidArgument { .. })
        ));

        create(&mut manager, gi, vec![request(ComputeSize::Eighth)]).unwrap();
        assert!(matches!(
            restore(&mut manager, exported),
            Err(PartitionError::StateInUse { .. })
        ));
    }

    #[test]
    fn test_restore_rejects_sibling_resources() {
        let (mut manager, gi, _) = setup(QUARTER);
        let ids = create(
            &mut manager,
            gi,
            vec![request(ComputeSize::Eighth), request(ComputeSize::Eighth)],
        )
        .unwrap();
        let first = manager.export_compute_instance(gi, ids[0]).unwrap();
        let second = manager.export_compute_instance(gi, ids[1]).unwrap();
        assert_eq!((first.placement_id, second.placement_id), (13, 14));
        manager.delete_compute_instance(gi, ids[0], false).unwrap();

        let gi_before = manager.describe_gpu_instance(gi).unwrap();
        let cis_before = manager.describe_active_compute_instances(gi).unwrap();
        let restore = |manager: &mut PartitionManager, exported: Vec<ExportedComputeInstance>| {
            manager.create_compute_instances(gi, ComputeInstanceCreate::Restore(exported), false)
        };

        // the GPC and VEIDs of the neighbour at 14
        let mut stolen = first.clone();
        stolen.gpc_mask = second.gpc_mask;
        stolen.veid_offset = second.veid_offset;
        assert!(matches!(
            restore(&mut manager, vec![stolen]),
            Err(PartitionError::StateInUse { .. })
        ));

        let mut stolen_veids = first.clone();
        stolen_veids.veid_offset = second.veid_offset;
        assert!(matches!(
            restore(&mut manager, vec![stolen_veids]),
            Err(PartitionError::StateInUse { .. })
        ));

        let mut short = first.clone();
        short.veid_count = 4;
        assert!(matches!(
            restore(&mut manager, vec![short]),
            Err(PartitionError::InvalidArgument { .. })
        ));

        let mut overflowing = first.clone();
        overflowing.veid_offset = u32::MAX;
        assert!(matches!(
            restore(&mut manager, vec![overflowing]),
            Err(PartitionError::InvalidArgument { .. })
        ));

        assert_eq!(manager.describe_gpu_instance(gi).unwrap(), gi_before);
        assert_eq!(manager.describe_active_compute_instances(gi).unwrap(), cis_before);

        // two entries of one batch may not claim the same GPC either
        manager.delete_compute_instance(gi, ids[1], false).unwrap();
        let mut twin = second.clone();
        twin.gpc_mask = first.gpc_mask;
        assert!(matches!(
            restore(&mut manager, vec![first.clone(), twin]),
            Err(PartitionError::StateInUse { .. })
        ));
        assert!(manager.describe_active_compute_instances(gi).unwrap().is_empty());

        let restored = restore(&mut manager, vec![first, second]).unwrap();
        assert_eq!(restored.len(), 2);
    }

    #[test]
    fn test_explicit_local_id() {
        let (mut manager, gi, _) = setup(HALF);
        let mut pinned = request(ComputeSize::Eighth);
        pinned.id = Some(5);
        let id = create(&mut manager, gi, vec![pinned.clone()]).unwrap()[0];
        assert_eq!(id.local_id(), 5);
        assert_eq!(manager.compute_instance_by_local_id(gi, 5).unwrap(), id);
        assert!(matches!(
            create(&mut manager, gi, vec![pinned]),
            Err(PartitionError::StateInUse { .. })
        ));
    }
}
