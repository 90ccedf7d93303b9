//! Partition plans: the instances an operator wants on a device, in YAML.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::Context;
use anyhow::Result;
use api_types::ComputeSize;
use partition_manager::ids::CtsId;
use partition_manager::ChipConfig;
use partition_manager::ComputeInstanceCreate;
use partition_manager::ComputePlacement;
use partition_manager::ComputeRequest;
use partition_manager::ComputeShape;
use partition_manager::EngineKind;
use partition_manager::GpuInstanceCreate;
use partition_manager::GpuInstanceId;
use partition_manager::GpuInstanceRequest;
use partition_manager::PartitionManager;
use partition_manager::SharedEngineFlags;
use serde::Deserialize;
use serde::Serialize;
use tracing::info;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartitionPlan {
    #[serde(default)]
    pub gpu_instances: Vec<PlannedGpuInstance>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlannedGpuInstance {
    /// Profile name from the chip table, e.g. "4g.40gb"
    pub profile: String,
    /// Explicit slice range, otherwise the lowest free one is used
    #[serde(default)]
    pub placement: Option<PlannedPlacement>,
    #[serde(default)]
    pub compute_instances: Vec<PlannedComputeInstance>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedPlacement {
    pub start: u32,
    pub size: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlannedComputeInstance {
    pub size: ComputeSize,
    /// Engines per kind besides the graphics engine
    #[serde(default)]
    pub engines: BTreeMap<EngineKind, u32>,
    /// Kinds time-shared with sibling compute instances
    #[serde(default)]
    pub shared: Vec<EngineKind>,
    #[serde(default)]
    pub placement_id: Option<u32>,
    #[serde(default)]
    pub graphics: bool,
}

impl PartitionPlan {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read plan file: {}", path.display()))?;
        serde_yaml::from_str(&content)
            .with_context(|| format!("failed to parse plan file: {}", path.display()))
    }

    /// Creates every planned instance in order.
    pub fn apply(&self, manager: &mut PartitionManager) -> Result<Vec<GpuInstanceId>> {
        let mut created = Vec::with_capacity(self.gpu_instances.len());
        for planned in &self.gpu_instances {
            let request = planned.request(manager.chip())?;
            let gi = manager
                .create_gpu_instance(GpuInstanceCreate::Request(request))
                .with_context(|| format!("failed to create GPU instance {}", planned.profile))?;

            if !planned.compute_instances.is_empty() {
                let requests = planned
                    .compute_instances
                    .iter()
                    .map(PlannedComputeInstance::request)
                    .collect::<Result<Vec<_>>>()?;
                let cis = manager
                    .create_compute_instances(gi, ComputeInstanceCreate::Request(requests), false)
                    .with_context(|| {
                        format!("failed to create compute instances in {}", planned.profile)
                    })?;
                info!(gpu_instance = %gi, count = cis.len(), "compute instances created");
            }
            created.push(gi);
        }
        Ok(created)
    }
}

impl PlannedGpuInstance {
    pub fn request(&self, chip: &ChipConfig) -> Result<GpuInstanceRequest> {
        let profile = chip
            .gpu_instance_profiles
            .iter()
            .find(|p| p.name == self.profile)
            .with_context(|| format!("chip {} has no profile named {}", chip.name, self.profile))?;
        Ok(match self.placement {
            Some(PlannedPlacement { start, size }) => GpuInstanceRequest::at(profile.flag, start, size),
            None => GpuInstanceRequest::new(profile.flag),
        })
    }
}

impl PlannedComputeInstance {
    pub fn request(&self) -> Result<ComputeRequest> {
        let mut request = ComputeRequest::new(ComputeShape::Size(self.size));
        for (kind, count) in &self.engines {
            if *kind == EngineKind::Graphics {
                anyhow::bail!("graphics engines are not configurable per compute instance");
            }
            request = request.with_engines(*kind, *count);
        }
        let shared = self
            .shared
            .iter()
            .fold(SharedEngineFlags::NONE, |flags, kind| flags.union(kind.shared_flag()));
        request = request.shared(shared);
        if let Some(id) = self.placement_id {
            request = request.at(ComputePlacement::Id(CtsId(id)));
        }
        request.graphics = self.graphics;
        Ok(request)
    }
}

#[cfg(test)]
mod tests {
    use partition_manager::mock::reference_chip;
    use partition_manager::Services;
    use similar_asserts::assert_eq;
    use uuid::Uuid;

    use super::*;

    const PLAN: &str = r#"
gpuInstances:
  - profile: 4g.40gb
    computeInstances:
      - size: quarter
        engines:
          copy: 1
      - size: eighth
        engines:
          copy: 2
        shared: [copy]
  - profile: 2g.20gb
    placement:
      start: 6
      size: 2
"#;

    #[test]
    fn test_parse_plan() {
        let plan: PartitionPlan = serde_yaml::from_str(PLAN).unwrap();
        assert_eq!(plan.gpu_instances.len(), 2);
        let half = &plan.gpu_instances[0];
        assert_eq!(half.compute_instances[1].shared, vec![EngineKind::Copy]);
        assert_eq!(
            plan.gpu_instances[1].placement,
            Some(PlannedPlacement { start: 6, size: 2 })
        );

        let request = half.compute_instances[1].request().unwrap();
        assert_eq!(request.engine_count(EngineKind::Copy), 2);
        assert_eq!(request.shared_engine_flags, SharedEngineFlags::COPY);
    }

    #[test]
    fn test_apply_plan() {
        let plan: PartitionPlan = serde_yaml::from_str(PLAN).unwrap();
        let mut manager =
            PartitionManager::new(reference_chip(), Uuid::nil(), Services::in_memory()).unwrap();
        let created = plan.apply(&mut manager).unwrap();
        assert_eq!(created.len(), 2);

        let infos = manager.describe_all_gpu_instances();
        // half at slices 0-3, quarter pinned to slices 6-7
        assert_eq!(infos.iter().map(|gi| gi.swizz_id).collect::<Vec<_>>(), vec![1, 6]);
        assert_eq!(infos[0].compute_instance_ids, vec![0, 1]);
    }

    #[test]
    fn test_unknown_profile() {
        let plan = PartitionPlan {
            gpu_instances: vec![PlannedGpuInstance {
                profile: "9g.90gb".to_string(),
                placement: None,
                compute_instances: Vec::new(),
            }],
        };
        let mut manager =
            PartitionManager::new(reference_chip(), Uuid::nil(), Services::in_memory()).unwrap();
        let err = plan.apply(&mut manager).unwrap_err();
        assert!(err.to_string().contains("9g.90gb"));
    }

    #[test]
    fn test_load_plan_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plan.yaml");
        fs::write(&path, PLAN).unwrap();
        assert_eq!(PartitionPlan::load(&path).unwrap().gpu_instances.len(), 2);
        assert!(PartitionPlan::load(dir.path().join("missing.yaml")).is_err());
    }
}
