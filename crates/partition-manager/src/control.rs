//! Client-facing control surface.
//!
//! Every call runs on behalf of a registered client and is checked against
//! its privilege: mutations need [`PrivilegeLevel::Admin`], queries by
//! plain users are confined to the partition they subscribe to.

use api_types::ComputeInstanceInfo;
use api_types::ExportedComputeInstance;
use api_types::PartitionDescriptor;
use tracing::debug;
use uuid::Uuid;

use crate::compute_instance::ComputeInstanceCreate;
use crate::compute_instance::ComputeRequest;
use crate::engine::EngineKind;
use crate::error::PartitionError;
use crate::error::Result;
use crate::gpu_instance::GpuInstanceCreate;
use crate::gpu_instance::GpuInstanceRequest;
use crate::ids::ClientId;
use crate::ids::ComputeInstanceId;
use crate::ids::GpuInstanceId;
use crate::manager::PartitionManager;
use crate::placement;
use crate::placement::DEVICE_SLICES;
use crate::reference::InstanceRef;
use crate::subscription::PrivilegeLevel;
use crate::subscription::SubscriptionTarget;

/// Who is calling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallerContext {
    pub client: ClientId,
    pub privilege: PrivilegeLevel,
}

pub struct Control<'a> {
    manager: &'a mut PartitionManager,
    caller: CallerContext,
}

impl PartitionManager {
    /// Control surface bound to a registered client.
    pub fn control(&mut self, client: ClientId) -> Result<Control<'_>> {
        let privilege = self.client_info(client)?.privilege;
        Ok(Control {
            manager: self,
            caller: CallerContext { client, privilege },
        })
    }

    /// Shape of every GPU instance profile the chip offers.
    pub fn describe_partitions(&self) -> Vec<PartitionDescriptor> {
        let device = &self.chip.device;
        self.chip
            .gpu_instance_profiles
            .iter()
            .map(|profile| {
                let slots = placement::swizz_id_range_for_memory_size(profile.memory_size);
                PartitionDescriptor {
                    partition_flag: profile.flag,
                    name: profile.name.clone(),
                    memory_size: profile.memory_size,
                    memory_bytes: device.memory_bytes / u64::from(DEVICE_SLICES)
                        * u64::from(profile.memory_size.slices()),
                    gpc_count: profile.gpc_count,
                    virtual_gpc_count: profile.virtual_gpc_count,
                    gfx_gpc_count: profile.gfx_gpc_count,
                    veid_count: profile.veid_count,
                    sm_count: self.chip.sm_count(profile.gpc_count),
                    gr_count: profile.engines.count(EngineKind::Graphics),
                    ce_count: profile.engines.count(EngineKind::Copy),
                    nvdec_count: profile.engines.count(EngineKind::Nvdec),
                    nvenc_count: profile.engines.count(EngineKind::Nvenc),
                    nvjpg_count: profile.engines.count(EngineKind::Nvjpg),
                    ofa_count: profile.engines.count(EngineKind::Ofa),
                    max_instances: slots.end.0 - slots.start.0,
                }
            })
            .collect()
    }

    /// Swizz ids of the valid GPU instances, ascending.
    pub fn active_partition_ids(&self) -> Vec<u32> {
        self.swizz_in_use.iter().map(|id| id.0).collect()
    }
}

impl Control<'_> {
    pub fn caller(&self) -> CallerContext {
        self.caller
    }

    fn require(&self, level: PrivilegeLevel) -> Result<()> {
        if self.caller.privilege >= level {
            Ok(())
        } else {
            debug!(
                client = %self.caller.client,
                privilege = %self.caller.privilege,
                required = %level,
                "control call refused"
            );
            Err(PartitionError::InsufficientPermissions { required: level })
        }
    }

    pub fn describe_partitions(&self) -> Vec<PartitionDescriptor> {
        self.manager.describe_partitions()
    }

    pub fn active_partition_ids(&self) -> Vec<u32> {
        self.manager.active_partition_ids()
    }

    pub fn create_gpu_instance(&mut self, request: GpuInstanceRequest) -> Result<GpuInstanceId> {
        self.require(PrivilegeLevel::Admin)?;
        self.manager
            .create_gpu_instance(GpuInstanceCreate::Request(request))
    }

    pub fn delete_gpu_instance(&mut self, gpu_instance: GpuInstanceId) -> Result<()> {
        self.require(PrivilegeLevel::Admin)?;
        self.manager.invalidate_gpu_instance(gpu_instance, false)
    }

    pub fn create_compute_instances(
        &mut self,
        gpu_instance: GpuInstanceId,
        requests: Vec<ComputeRequest>,
        query_only: bool,
    ) -> Result<Vec<ComputeInstanceId>> {
        self.require(PrivilegeLevel::Admin)?;
        self.manager.create_compute_instances(
            gpu_instance,
            ComputeInstanceCreate::Request(requests),
            query_only,
        )
    }

    pub fn delete_compute_instance(
        &mut self,
        gpu_instance: GpuInstanceId,
        compute_instance: ComputeInstanceId,
    ) -> Result<()> {
        self.require(PrivilegeLevel::Admin)?;
        self.manager
            .delete_compute_instance(gpu_instance, compute_instance, false)
    }

    /// Compute instances of `gpu_instance` the caller may see. Users only
    /// see their own subscription, down to the compute instance when they
    /// subscribe to one.
    pub fn get_compute_instances(&self, gpu_instance: GpuInstanceId) -> Result<Vec<ComputeInstanceInfo>> {
        let all = self.manager.describe_active_compute_instances(gpu_instance)?;
        if self.caller.privilege >= PrivilegeLevel::Admin {
            return Ok(all);
        }
        match self.manager.subscription_target(self.caller.client)? {
            Some(SubscriptionTarget::Partition(InstanceRef::Gpu(gi))) if gi == gpu_instance => Ok(all),
            Some(SubscriptionTarget::Partition(InstanceRef::Compute(gi, ci))) if gi == gpu_instance => {
                Ok(all.into_iter().filter(|info| info.id == ci.local_id()).collect())
            }
            _ => Err(PartitionError::InsufficientPermissions {
                required: PrivilegeLevel::Admin,
            }),
        }
    }

    pub fn export_compute_instance(
        &self,
        gpu_instance: GpuInstanceId,
        compute_instance: ComputeInstanceId,
    ) -> Result<ExportedComputeInstance> {
        self.require(PrivilegeLevel::Admin)?;
        self.manager
            .export_compute_instance(gpu_instance, compute_instance)
    }

    /// Recreates an exported compute instance, possibly from another
    /// process, with its original id, UUID and engines.
    pub fn import_compute_instance(
        &mut self,
        gpu_instance: GpuInstanceId,
        exported: ExportedComputeInstance,
    ) -> Result<ComputeInstanceId> {
        self.require(PrivilegeLevel::Admin)?;
        let ids = self.manager.create_compute_instances(
            gpu_instance,
            ComputeInstanceCreate::Restore(vec![exported]),
            false,
        )?;
        ids.into_iter()
            .next()
            .ok_or_else(|| PartitionError::invalid_state("import created no compute instance"))
    }

    /// UUID of the partition the caller subscribes to: the compute
    /// instance's when subscribed to one, the GPU instance's otherwise.
    pub fn subscribed_uuid(&self) -> Result<Uuid> {
        let target = self
            .manager
            .subscription_target(self.caller.client)?
            .and_then(|target| match target {
                SubscriptionTarget::Partition(reference) => Some(reference),
                SubscriptionTarget::DeviceProfiling => None,
            })
            .ok_or_else(|| {
                PartitionError::not_found(format!("partition subscription of {}", self.caller.client))
            })?;
        self.manager.require_reference(target)?;
        match target {
            InstanceRef::Compute(gi, ci) => Ok(self.manager.describe_compute_instance(gi, ci)?.uuid),
            InstanceRef::Gpu(gi) => Ok(self.manager.describe_gpu_instance(gi)?.uuid),
            InstanceRef::Unpartitioned => Err(PartitionError::not_found("unpartitioned device has no UUID")),
        }
    }
}
