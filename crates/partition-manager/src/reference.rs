//! References to a partition and the helpers that resolve them.

use crate::engine;
use crate::engine::EngineKind;
use crate::engine::EngineMask;
use crate::engine::EngineType;
use crate::error::PartitionError;
use crate::error::Result;
use crate::ids::ComputeInstanceId;
use crate::ids::GpuInstanceId;
use crate::manager::PartitionManager;
use crate::placement::MAX_SWIZZ_ID;

/// Compute-instance part of an attribution id for a reference that stops at
/// the GPU instance.
const GPU_INSTANCE_ONLY: u32 = 8;

/// What a subscription or a query points at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InstanceRef {
    /// The whole device, outside of any partition
    Unpartitioned,
    Gpu(GpuInstanceId),
    Compute(GpuInstanceId, ComputeInstanceId),
}

impl InstanceRef {
    pub fn gpu_instance(&self) -> Option<GpuInstanceId> {
        match self {
            InstanceRef::Unpartitioned => None,
            InstanceRef::Gpu(gi) | InstanceRef::Compute(gi, _) => Some(*gi),
        }
    }

    pub fn compute_instance(&self) -> Option<ComputeInstanceId> {
        match self {
            InstanceRef::Compute(_, ci) => Some(*ci),
            _ => None,
        }
    }
}

impl PartitionManager {
    /// Whether every instance the reference names is still valid.
    pub fn is_reference_valid(&self, reference: InstanceRef) -> bool {
        match reference {
            InstanceRef::Unpartitioned => true,
            InstanceRef::Gpu(gi) => self.gpu_instance(gi).is_ok(),
            InstanceRef::Compute(gi, ci) => self
                .gpu_instance(gi)
                .and_then(|gi| gi.compute_instance(ci))
                .is_ok(),
        }
    }

    /// Whether two references name the same partition. Compute instances
    /// are only compared when both references carry one.
    pub fn references_same(&self, a: InstanceRef, b: InstanceRef) -> bool {
        if a.gpu_instance() != b.gpu_instance() {
            return false;
        }
        match (a.compute_instance(), b.compute_instance()) {
            (Some(x), Some(y)) => x == y,
            _ => true,
        }
    }

    /// Device-unique number for accounting, `swizz × 15 + compute id`.
    /// References without a GPU instance map past every real id.
    pub fn attribution_id(&self, reference: InstanceRef) -> Result<u32> {
        let Some(gi) = reference.gpu_instance() else {
            return Ok(MAX_SWIZZ_ID * MAX_SWIZZ_ID);
        };
        let swizz_id = self.gpu_instance(gi)?.swizz_id;
        let compute = match reference.compute_instance() {
            Some(ci) => {
                self.gpu_instance(gi)?.compute_instance(ci)?;
                ci.local_id()
            }
            None => GPU_INSTANCE_ONLY,
        };
        Ok(swizz_id.0 * MAX_SWIZZ_ID + compute)
    }

    /// (local, global) engine masks of the referenced partition. A compute
    /// instance mask is lifted into the device space through its parent.
    fn engine_spaces(&self, reference: InstanceRef) -> Result<Option<(EngineMask, EngineMask)>> {
        let Some(gi_id) = reference.gpu_instance() else {
            return Ok(None);
        };
        let gi = self.gpu_instance(gi_id)?;
        let Some(ci_id) = reference.compute_instance() else {
            return Ok(Some((gi.allocation.local_engines, gi.allocation.engines)));
        };
        let ci = gi.compute_instance(ci_id)?;
        let mut global = EngineMask::new();
        for engine in ci.allocation.engines.iter() {
            global.insert(engine::translate_local_to_global(
                gi.allocation.local_engines,
                gi.allocation.engines,
                engine,
            )?);
        }
        Ok(Some((ci.allocation.local_engines, global)))
    }

    /// Global engine a partition-local engine stands for. Unpartitioned
    /// references pass the engine through.
    pub fn translate_local_to_global_engine(
        &self,
        reference: InstanceRef,
        local: EngineType,
    ) -> Result<EngineType> {
        match self.engine_spaces(reference)? {
            None => Ok(local),
            Some((local_mask, global_mask)) => {
                engine::translate_local_to_global(local_mask, global_mask, local)
            }
        }
    }

    pub fn translate_global_to_local_engine(
        &self,
        reference: InstanceRef,
        global: EngineType,
    ) -> Result<EngineType> {
        match self.engine_spaces(reference)? {
            None => Ok(global),
            Some((local_mask, global_mask)) => {
                engine::translate_global_to_local(local_mask, global_mask, global)
            }
        }
    }

    pub fn count_engines_of_kind(&self, reference: InstanceRef, kind: EngineKind) -> Result<u32> {
        match self.engine_spaces(reference)? {
            None => Ok(self.engines.present().within(kind.range()).count()),
            Some((local, _)) => Ok(engine::count_engines_of_kind(local, kind)),
        }
    }

    /// Whether the global engine belongs to the referenced partition.
    pub fn is_engine_in_instance(&self, reference: InstanceRef, global: EngineType) -> Result<bool> {
        match self.engine_spaces(reference)? {
            None => Ok(self.engines.present().test(global)),
            Some((_, global_mask)) => Ok(global_mask.test(global)),
        }
    }

    pub(crate) fn require_reference(&self, reference: InstanceRef) -> Result<()> {
        if self.is_reference_valid(reference) {
            Ok(())
        } else {
            Err(PartitionError::not_found(format!("{reference:?}")))
        }
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;
    use uuid::Uuid;

    use super::*;
    use crate::compute_instance::ComputeInstanceCreate;
    use crate::compute_instance::ComputeRequest;
    use crate::compute_instance::ComputeShape;
    use crate::gpu_instance::GpuInstanceCreate;
    use crate::gpu_instance::GpuInstanceRequest;
    use crate::mock::mock_services;
    use crate::mock::reference_chip;
    use api_types::ComputeSize;

    fn setup() -> (PartitionManager, GpuInstanceId, GpuInstanceId, ComputeInstanceId) {
        let (services, _, _) = mock_services();
        let mut manager = PartitionManager::new(reference_chip(), Uuid::nil(), services).unwrap();
        let first = manager
            .create_gpu_instance(GpuInstanceCreate::Request(GpuInstanceRequest::new(1)))
            .unwrap();
        let second = manager
            .create_gpu_instance(GpuInstanceCreate::Request(GpuInstanceRequest::new(1)))
            .unwrap();
        let ci = manager
            .create_compute_instances(
                second,
                ComputeInstanceCreate::Request(vec![
                    ComputeRequest::new(ComputeShape::Size(ComputeSize::Eighth)),
                    ComputeRequest::new(ComputeShape::Size(ComputeSize::Eighth))
                        .with_engines(EngineKind::Copy, 2),
                ]),
                false,
            )
            .unwrap()[1];
        (manager, first, second, ci)
    }

    #[test]
    fn test_engine_translation_through_compute_instance() {
        let (manager, _, gi, ci) = setup();
        let reference = InstanceRef::Compute(gi, ci);

        // second half owns CE4..CE7, the compute instance holds GI-local CE0, CE1
        let global = manager
            .translate_local_to_global_engine(reference, EngineType::new(EngineKind::Copy, 1))
            .unwrap();
        assert_eq!(global, EngineType::new(EngineKind::Copy, 5));
        assert_eq!(
            manager.translate_global_to_local_engine(reference, global).unwrap(),
            EngineType::new(EngineKind::Copy, 1)
        );
        // the compute instance's only GR is its local GR0, the parent's GR5
        assert_eq!(
            manager
                .translate_local_to_global_engine(reference, EngineType::new(EngineKind::Graphics, 0))
                .unwrap(),
            EngineType::new(EngineKind::Graphics, 5)
        );
        assert_eq!(
            manager.translate_local_to_global_engine(reference, EngineType::new(EngineKind::Copy, 2)),
            Err(PartitionError::EngineNotInInstance {
                engine: EngineType::new(EngineKind::Copy, 2)
            })
        );

        assert_eq!(manager.count_engines_of_kind(reference, EngineKind::Copy).unwrap(), 2);
        assert_eq!(
            manager
                .count_engines_of_kind(InstanceRef::Gpu(gi), EngineKind::Copy)
                .unwrap(),
            4
        );
        assert!(manager
            .is_engine_in_instance(InstanceRef::Gpu(gi), EngineType::new(EngineKind::Copy, 7))
            .unwrap());
        assert!(!manager
            .is_engine_in_instance(reference, EngineType::new(EngineKind::Copy, 7))
            .unwrap());
        assert_eq!(
            manager
                .translate_local_to_global_engine(
                    InstanceRef::Unpartitioned,
                    EngineType::new(EngineKind::Nvdec, 3)
                )
                .unwrap(),
            EngineType::new(EngineKind::Nvdec, 3)
        );
    }

    #[test]
    fn test_reference_identity() {
        let (mut manager, first, second, ci) = setup();
        assert!(manager.references_same(InstanceRef::Gpu(second), InstanceRef::Compute(second, ci)));
        assert!(!manager.references_same(InstanceRef::Gpu(first), InstanceRef::Gpu(second)));

        assert_eq!(manager.attribution_id(InstanceRef::Compute(second, ci)).unwrap(), 2 * 15 + 1);
        assert_eq!(manager.attribution_id(InstanceRef::Gpu(first)).unwrap(), 15 + 8);
        assert_eq!(manager.attribution_id(InstanceRef::Unpartitioned).unwrap(), 225);

        assert!(manager.is_reference_valid(InstanceRef::Compute(second, ci)));
        manager.delete_compute_instance(second, ci, false).unwrap();
        assert!(!manager.is_reference_valid(InstanceRef::Compute(second, ci)));
        assert!(manager.attribution_id(InstanceRef::Compute(second, ci)).is_err());
        assert!(manager.is_reference_valid(InstanceRef::Gpu(second)));
    }
}
