//! Shared API type definitions
//!
//! This crate contains the client-visible projections of GPU partitions and
//! the persisted snapshot layout used to recreate them, shared between the
//! partition manager library and the `partctl` tool.

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use uuid::Uuid;

/// Fraction of device memory (and of the memory/cluster slices) a GPU
/// instance occupies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MemorySize {
    Full,
    Half,
    Quarter,
    Eighth,
}

impl MemorySize {
    /// Number of the eight device slices covered by an instance of this size.
    pub const fn slices(self) -> u32 {
        match self {
            MemorySize::Full => 8,
            MemorySize::Half => 4,
            MemorySize::Quarter => 2,
            MemorySize::Eighth => 1,
        }
    }
}

impl std::fmt::Display for MemorySize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Capacity class of a compute instance, ordered from largest to smallest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ComputeSize {
    Full,
    Half,
    MiniHalf,
    Quarter,
    MiniQuarter,
    Eighth,
}

impl ComputeSize {
    pub const ALL: [ComputeSize; 6] = [
        ComputeSize::Full,
        ComputeSize::Half,
        ComputeSize::MiniHalf,
        ComputeSize::Quarter,
        ComputeSize::MiniQuarter,
        ComputeSize::Eighth,
    ];

    /// The next smaller size class, `None` below [`ComputeSize::Eighth`].
    pub fn next_smaller(self) -> Option<ComputeSize> {
        Self::ALL.get(self as usize + 1).copied()
    }

    /// The next larger size class, `None` above [`ComputeSize::Full`].
    pub fn next_larger(self) -> Option<ComputeSize> {
        (self as usize)
            .checked_sub(1)
            .and_then(|idx| Self::ALL.get(idx).copied())
    }
}

impl std::fmt::Display for ComputeSize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Shape of one GPU instance profile as advertised to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartitionDescriptor {
    /// Profile flag requested on create
    pub partition_flag: u32,
    /// Human readable profile name (e.g., "1g.10gb")
    pub name: String,
    pub memory_size: MemorySize,
    /// Dedicated memory in bytes
    pub memory_bytes: u64,
    pub gpc_count: u32,
    pub virtual_gpc_count: u32,
    pub gfx_gpc_count: u32,
    pub veid_count: u32,
    pub sm_count: u32,
    pub gr_count: u32,
    pub ce_count: u32,
    pub nvdec_count: u32,
    pub nvenc_count: u32,
    pub nvjpg_count: u32,
    pub ofa_count: u32,
    /// How many instances of this profile the slot geometry can place
    pub max_instances: u32,
}

/// Read-only projection of a valid GPU instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GpuInstanceInfo {
    pub swizz_id: u32,
    pub partition_flag: u32,
    pub profile_name: String,
    pub uuid: Uuid,
    pub memory_size: MemorySize,
    /// Whether the instance owns an isolated memory sub-heap
    pub memory_partitioned: bool,
    /// Physical processing-cluster ids
    pub gpc_ids: Vec<u32>,
    pub gfx_gpc_count: u32,
    pub virtual_gpc_count: u32,
    pub veid_offset: u32,
    pub veid_count: u32,
    pub sm_count: u32,
    /// Global engine mask
    pub engine_mask: u64,
    /// Engine mask re-indexed from zero per engine kind
    pub local_engine_mask: u64,
    pub exclusive_engine_mask: u64,
    pub shared_engine_mask: u64,
    pub compute_instance_ids: Vec<u32>,
    /// Outstanding subscriptions on this instance
    pub subscriber_count: u32,
}

/// Read-only projection of a valid compute instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComputeInstanceInfo {
    pub id: u32,
    pub uuid: Uuid,
    pub compute_size: ComputeSize,
    pub placement_id: u32,
    pub span_start: u32,
    pub gpc_ids: Vec<u32>,
    pub veid_offset: u32,
    pub veid_count: u32,
    pub sm_count: u32,
    /// Engine mask in the parent GPU instance's local index space
    pub engine_mask: u64,
    pub local_engine_mask: u64,
    pub shared_engine_flags: u32,
    pub subscriber_count: u32,
}

/// Everything needed to recreate a compute instance with identical
/// capabilities through the restore path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportedComputeInstance {
    pub id: u32,
    pub uuid: Uuid,
    pub compute_size: ComputeSize,
    pub placement_id: u32,
    pub span_start: u32,
    /// Physical processing-cluster mask
    pub gpc_mask: u64,
    pub veid_offset: u32,
    pub veid_count: u32,
    pub sm_count: u32,
    /// Engine mask in the parent GPU instance's local index space
    pub engine_mask: u64,
    pub shared_engine_flags: u32,
}

/// Persisted shape of a GPU instance and its compute instances.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GpuInstanceSnapshot {
    pub swizz_id: u32,
    pub partition_flag: u32,
    pub uuid: Uuid,
    pub gpc_mask: u64,
    pub gfx_gpc_count: u32,
    pub virtual_gpc_count: u32,
    pub veid_offset: u32,
    pub veid_count: u32,
    pub sm_count: u32,
    /// Global engine mask
    pub engine_mask: u64,
    #[serde(default)]
    pub compute_instances: Vec<ExportedComputeInstance>,
}

/// Device-wide partition topology, written on suspend and replayed on resume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopologySnapshot {
    pub saved_at: DateTime<Utc>,
    pub gpu_instances: Vec<GpuInstanceSnapshot>,
}
