//! Chip-generation tables: device resources, GPU instance profiles,
//! compute profiles and the compatibility budgets.
//!
//! All of it is data loaded from YAML so a new chip needs no code change.

use std::collections::BTreeMap;
use std::collections::HashSet;
use std::path::Path;

use anyhow::Context;
use api_types::ComputeSize;
use api_types::MemorySize;
use serde::Deserialize;
use serde::Serialize;

use crate::engine::EngineKind;
use crate::error::PartitionError;
use crate::error::Result;
use crate::ids::CtsId;
use crate::ids::CtsIdMask;
use crate::placement;
use crate::placement::DEVICE_SLICES;

/// Per-kind engine counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineCounts {
    pub gr: u32,
    pub copy: u32,
    pub nvdec: u32,
    pub nvenc: u32,
    pub nvjpg: u32,
    pub ofa: u32,
}

impl EngineCounts {
    pub fn count(&self, kind: EngineKind) -> u32 {
        match kind {
            EngineKind::Graphics => self.gr,
            EngineKind::Copy => self.copy,
            EngineKind::Nvdec => self.nvdec,
            EngineKind::Nvenc => self.nvenc,
            EngineKind::Nvjpg => self.nvjpg,
            EngineKind::Ofa => self.ofa,
        }
    }
}

fn default_true() -> bool {
    true
}

/// Physical resources of the whole device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceConfig {
    /// Processing clusters present (after floorsweeping)
    pub gpc_count: u32,
    pub sms_per_gpc: u32,
    /// Total virtual engine ids, split evenly over the device slices
    pub veid_count: u32,
    pub memory_bytes: u64,
    pub engines: EngineCounts,
    #[serde(default = "default_true")]
    pub memory_partitioning_enabled: bool,
    #[serde(default)]
    pub allow_unprivileged_device_profiling: bool,
}

impl DeviceConfig {
    pub fn veids_per_slice(&self) -> u32 {
        self.veid_count / DEVICE_SLICES
    }

    /// Device slice a processing cluster belongs to.
    pub fn slice_of_gpc(&self, gpc: u32) -> u32 {
        gpc * DEVICE_SLICES / self.gpc_count
    }
}

/// Shape of a GPU instance profile
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GpuInstanceProfile {
    /// Partition flag clients request the profile by
    pub flag: u32,
    pub name: String,
    pub memory_size: MemorySize,
    pub gpc_count: u32,
    pub virtual_gpc_count: u32,
    #[serde(default)]
    pub gfx_gpc_count: u32,
    pub veid_count: u32,
    pub engines: EngineCounts,
    /// Compute placement ids legal inside an instance of this profile
    pub placement_ids: Vec<u32>,
    /// Placement ids whose compute instances are graphics capable
    #[serde(default)]
    pub gfx_placement_ids: Vec<u32>,
}

impl GpuInstanceProfile {
    pub fn placement_mask(&self) -> CtsIdMask {
        self.placement_ids.iter().map(|id| CtsId(*id)).collect()
    }

    pub fn gfx_placement_mask(&self) -> CtsIdMask {
        self.gfx_placement_ids.iter().map(|id| CtsId(*id)).collect()
    }
}

/// Shape of a compute instance of one size class
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComputeProfile {
    pub compute_size: ComputeSize,
    pub gpc_count: u32,
    pub veid_count: u32,
}

/// Budgets deciding which GPU instance profiles may coexist
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CompatibilityRules {
    /// Graphics-capable clusters available to all instances together
    pub gfx_gpc_budget: Option<u32>,
    /// Maximum concurrent instances per partition flag
    pub max_instances: BTreeMap<u32, u32>,
    /// Partition flags that cannot be valid at the same time
    pub exclusive_pairs: Vec<[u32; 2]>,
}

/// Complete table for one chip generation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChipConfig {
    pub name: String,
    pub device: DeviceConfig,
    pub gpu_instance_profiles: Vec<GpuInstanceProfile>,
    pub compute_profiles: Vec<ComputeProfile>,
    #[serde(default)]
    pub compatibility: CompatibilityRules,
}

impl ChipConfig {
    pub fn from_yaml_str(yaml: &str) -> anyhow::Result<Self> {
        let chip: ChipConfig = serde_yaml::from_str(yaml).context("malformed chip table")?;
        chip.validate()?;
        Ok(chip)
    }

    pub fn gpu_instance_profile(&self, flag: u32) -> Option<&GpuInstanceProfile> {
        self.gpu_instance_profiles.iter().find(|p| p.flag == flag)
    }

    pub fn compute_profile(&self, size: ComputeSize) -> Option<&ComputeProfile> {
        self.compute_profiles.iter().find(|p| p.compute_size == size)
    }

    /// Smallest compute size class the chip supports.
    pub fn smallest_compute_size(&self) -> Option<ComputeSize> {
        self.compute_profiles.iter().map(|p| p.compute_size).max()
    }

    pub fn sm_count(&self, gpc_count: u32) -> u32 {
        gpc_count * self.device.sms_per_gpc
    }

    /// Rejects tables that cannot describe real hardware.
    pub fn validate(&self) -> Result<()> {
        let bad = |message: String| Err(PartitionError::invalid_argument(message));
        let device = &self.device;

        if device.gpc_count == 0 || device.gpc_count > 64 {
            return bad(format!("gpcCount {} out of range", device.gpc_count));
        }
        if device.veid_count % DEVICE_SLICES != 0 {
            return bad(format!(
                "veidCount {} does not split over {DEVICE_SLICES} slices",
                device.veid_count
            ));
        }
        for kind in EngineKind::ALL {
            if device.engines.count(kind) > kind.capacity() {
                return bad(format!(
                    "device lists {} {kind} engines, at most {} exist",
                    device.engines.count(kind),
                    kind.capacity()
                ));
            }
        }

        let mut flags = HashSet::new();
        for profile in &self.gpu_instance_profiles {
            if !flags.insert(profile.flag) {
                return bad(format!("duplicate partition flag {}", profile.flag));
            }
            let slices = profile.memory_size.slices();
            if profile.gpc_count == 0 || profile.gpc_count > device.gpc_count {
                return bad(format!("profile {} gpcCount out of range", profile.name));
            }
            if profile.veid_count > slices * device.veids_per_slice() {
                return bad(format!(
                    "profile {} needs {} VEIDs, its slices hold {}",
                    profile.name,
                    profile.veid_count,
                    slices * device.veids_per_slice()
                ));
            }
            for kind in EngineKind::ALL {
                if profile.engines.count(kind) > device.engines.count(kind) {
                    return bad(format!(
                        "profile {} needs more {kind} engines than the device has",
                        profile.name
                    ));
                }
            }
            if profile.engines.gr > 0 && profile.engines.gr > slices * device.engines.gr / DEVICE_SLICES
            {
                return bad(format!(
                    "profile {} needs more GR engines than its slices carry",
                    profile.name
                ));
            }
            let out_of_range = profile
                .placement_ids
                .iter()
                .chain(profile.gfx_placement_ids.iter())
                .find(|id| **id >= placement::MAX_CTS_ID);
            if let Some(id) = out_of_range {
                return bad(format!(
                    "profile {} lists invalid placement id {id}",
                    profile.name
                ));
            }
            if !profile
                .gfx_placement_mask()
                .is_subset_of(&profile.placement_mask())
            {
                return bad(format!(
                    "profile {} has graphics placement ids that are not legal placements",
                    profile.name
                ));
            }
        }

        let mut sizes = HashSet::new();
        for profile in &self.compute_profiles {
            if !sizes.insert(profile.compute_size) {
                return bad(format!(
                    "duplicate compute profile {}",
                    profile.compute_size
                ));
            }
            if profile.gpc_count == 0 || profile.gpc_count > device.gpc_count {
                return bad(format!(
                    "compute profile {} gpcCount out of range",
                    profile.compute_size
                ));
            }
        }
        if self.compute_profiles.is_empty() {
            return bad("chip table has no compute profiles".to_string());
        }
        Ok(())
    }
}

/// load a chip table from a YAML file
pub fn load_chip_config<P: AsRef<Path>>(path: P) -> anyhow::Result<ChipConfig> {
    let path = path.as_ref();
    tracing::info!("Loading chip table from {:?}", path);

    let yaml = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read chip table {}", path.display()))?;
    let chip = ChipConfig::from_yaml_str(&yaml)?;

    tracing::info!(
        chip = %chip.name,
        gpu_instance_profiles = chip.gpu_instance_profiles.len(),
        compute_profiles = chip.compute_profiles.len(),
        "Loaded chip table"
    );
    Ok(chip)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use similar_asserts::assert_eq;
    use tempfile::NamedTempFile;

    use super::*;
    use crate::mock::reference_chip;

    #[test]
    fn test_load_chip_config() {
        let yaml = serde_yaml::to_string(&reference_chip()).unwrap();
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(yaml.as_bytes()).unwrap();

        let chip = load_chip_config(file.path()).unwrap();
        assert_eq!(chip, reference_chip());
        assert_eq!(chip.smallest_compute_size(), Some(ComputeSize::Eighth));
        assert_eq!(chip.gpu_instance_profile(1).unwrap().name, "4g.40gb");
    }

    #[test]
    fn test_camel_case_keys_and_defaults() {
        let yaml = r#"
name: tiny
device:
  gpcCount: 8
  smsPerGpc: 2
  veidCount: 64
  memoryBytes: 8589934592
  engines:
    gr: 8
    copy: 2
gpuInstanceProfiles:
  - flag: 0
    name: full
    memorySize: full
    gpcCount: 8
    virtualGpcCount: 8
    veidCount: 64
    engines:
      gr: 8
      copy: 2
    placementIds: [0, 1, 2]
computeProfiles:
  - computeSize: full
    gpcCount: 8
    veidCount: 64
  - computeSize: half
    gpcCount: 4
    veidCount: 32
"#;
        let chip = ChipConfig::from_yaml_str(yaml).unwrap();
        assert!(chip.device.memory_partitioning_enabled);
        assert!(!chip.device.allow_unprivileged_device_profiling);
        assert_eq!(chip.device.engines.nvdec, 0);
        assert_eq!(chip.compatibility, CompatibilityRules::default());
        assert_eq!(chip.smallest_compute_size(), Some(ComputeSize::Half));
    }

    #[test]
    fn test_validate_rejects_impossible_tables() {
        let mut chip = reference_chip();
        chip.gpu_instance_profiles[1].flag = 0;
        assert!(matches!(
            chip.validate(),
            Err(PartitionError::InvalidArgument { .. })
        ));

        let mut chip = reference_chip();
        chip.device.engines.ofa = 2;
        assert!(chip.validate().is_err());

        let mut chip = reference_chip();
        chip.gpu_instance_profiles[3].placement_ids.push(21);
        assert!(chip.validate().is_err());

        let mut chip = reference_chip();
        chip.gpu_instance_profiles[1].veid_count = 40;
        assert!(chip.validate().is_err());
    }
}
