//! Profile validity rules, read from the chip table.

use tracing::debug;

use crate::config::ChipConfig;
use crate::ids::SwizzId;
use crate::placement::DEVICE_SLICES;

/// Pure predicates over the chip table, consulted before any mutation.
#[derive(Debug, Clone, Copy)]
pub struct ValidityRules<'a> {
    chip: &'a ChipConfig,
}

impl<'a> ValidityRules<'a> {
    pub fn new(chip: &'a ChipConfig) -> Self {
        Self { chip }
    }

    /// Whether the chip generation knows the profile at all.
    pub fn is_profile_flag_valid(&self, flag: u32) -> bool {
        self.chip.gpu_instance_profile(flag).is_some()
    }

    /// Whether an instance of `flag` can coexist with instances of
    /// `existing` flags under the memory-slice and graphics budgets and the
    /// configured exclusions.
    pub fn is_combination_valid(&self, flag: u32, existing: &[u32]) -> bool {
        let Some(profile) = self.chip.gpu_instance_profile(flag) else {
            return false;
        };
        let rules = &self.chip.compatibility;

        let mut slices = profile.memory_size.slices();
        let mut gfx_gpcs = profile.gfx_gpc_count;
        for other in existing {
            let Some(other_profile) = self.chip.gpu_instance_profile(*other) else {
                return false;
            };
            slices += other_profile.memory_size.slices();
            gfx_gpcs += other_profile.gfx_gpc_count;
        }
        if slices > DEVICE_SLICES {
            debug!(flag, slices, "memory slice budget exceeded");
            return false;
        }
        if rules.gfx_gpc_budget.is_some_and(|budget| gfx_gpcs > budget) {
            debug!(flag, gfx_gpcs, "graphics cluster budget exceeded");
            return false;
        }
        if let Some(max) = rules.max_instances.get(&flag) {
            let same = existing.iter().filter(|f| **f == flag).count() as u32;
            if same + 1 > *max {
                debug!(flag, max, "instance count limit reached");
                return false;
            }
        }
        let excluded = rules.exclusive_pairs.iter().any(|[a, b]| {
            (*a == flag && existing.contains(b)) || (*b == flag && existing.contains(a))
        });
        if excluded {
            debug!(flag, "profile excluded by an existing instance");
        }
        !excluded
    }

    /// Whether instances of the profile come with dedicated memory.
    pub fn memory_partitioning_required(&self, flag: u32) -> bool {
        self.chip.device.memory_partitioning_enabled
            && self
                .chip
                .gpu_instance_profile(flag)
                .is_some_and(|p| p.memory_size.slices() < DEVICE_SLICES)
    }

    /// Whether an instance placed at `swizz_id` needs an isolated heap. The
    /// whole-device slot shares the device heap.
    pub fn memory_partitioning_needed(&self, swizz_id: SwizzId) -> bool {
        self.chip.device.memory_partitioning_enabled && swizz_id.0 != 0
    }
}
