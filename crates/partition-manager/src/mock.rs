//! Test adapters implementing the collaborator traits
//!
//! This module provides mock implementations of the service traits and a
//! reference chip table for use in unit and integration tests.

use std::collections::BTreeMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::Mutex;

use api_types::ComputeSize;
use api_types::MemorySize;
use uuid::Uuid;

use crate::config::ChipConfig;
use crate::config::CompatibilityRules;
use crate::config::ComputeProfile;
use crate::config::DeviceConfig;
use crate::config::EngineCounts;
use crate::config::GpuInstanceProfile;
use crate::error::PartitionError;
use crate::error::Result;
use crate::ids::Handle;
use crate::ids::HeapHandle;
use crate::services::HandleClass;
use crate::services::HandleService;
use crate::services::MemoryHeapService;
use crate::services::Services;
use crate::services::UuidGenerator;
use crate::services::UuidSeed;

const GIB: u64 = 1 << 30;

/// An 8-cluster chip table used throughout the tests.
///
/// Profiles: flag 0 whole device, 1 half, 2 quarter, 3 eighth.
pub fn reference_chip() -> ChipConfig {
    let profile = |flag: u32,
                   name: &str,
                   memory_size: MemorySize,
                   gpc_count: u32,
                   gfx_gpc_count: u32,
                   engines: EngineCounts,
                   placement_ids: Vec<u32>,
                   gfx_placement_ids: Vec<u32>| GpuInstanceProfile {
        flag,
        name: name.to_string(),
        memory_size,
        gpc_count,
        virtual_gpc_count: gpc_count,
        gfx_gpc_count,
        veid_count: gpc_count * 8,
        engines,
        placement_ids,
        gfx_placement_ids,
    };
    let compute = |compute_size: ComputeSize, gpc_count: u32, veid_count: u32| ComputeProfile {
        compute_size,
        gpc_count,
        veid_count,
    };

    ChipConfig {
        name: "reference-8gpc".to_string(),
        device: DeviceConfig {
            gpc_count: 8,
            sms_per_gpc: 8,
            veid_count: 64,
            memory_bytes: 80 * GIB,
            engines: EngineCounts {
                gr: 8,
                copy: 8,
                nvdec: 4,
                nvenc: 2,
                nvjpg: 4,
                ofa: 1,
            },
            memory_partitioning_enabled: true,
            allow_unprivileged_device_profiling: false,
        },
        gpu_instance_profiles: vec![
            profile(
                0,
                "8g.80gb",
                MemorySize::Full,
                8,
                0,
                EngineCounts {
                    gr: 8,
                    copy: 8,
                    nvdec: 4,
                    nvenc: 2,
                    nvjpg: 4,
                    ofa: 1,
                },
                (0..21).collect(),
                Vec::new(),
            ),
            profile(
                1,
                "4g.40gb",
                MemorySize::Half,
                4,
                4,
                EngineCounts {
                    gr: 4,
                    copy: 4,
                    nvdec: 2,
                    nvenc: 1,
                    nvjpg: 2,
                    ofa: 0,
                },
                vec![1, 3, 5, 6, 9, 10, 13, 14, 15, 16],
                vec![1, 5],
            ),
            profile(
                2,
                "2g.20gb",
                MemorySize::Quarter,
                2,
                0,
                EngineCounts {
                    gr: 2,
                    copy: 2,
                    nvdec: 1,
                    nvenc: 0,
                    nvjpg: 1,
                    ofa: 0,
                },
                vec![5, 9, 13, 14],
                Vec::new(),
            ),
            profile(
                3,
                "1g.10gb",
                MemorySize::Eighth,
                1,
                0,
                EngineCounts {
                    gr: 1,
                    copy: 1,
                    ..EngineCounts::default()
                },
                vec![13],
                Vec::new(),
            ),
        ],
        compute_profiles: vec![
            compute(ComputeSize::Full, 8, 64),
            compute(ComputeSize::Half, 4, 32),
            compute(ComputeSize::MiniHalf, 3, 24),
            compute(ComputeSize::Quarter, 2, 16),
            compute(ComputeSize::MiniQuarter, 1, 16),
            compute(ComputeSize::Eighth, 1, 8),
        ],
        compatibility: CompatibilityRules {
            gfx_gpc_budget: Some(8),
            max_instances: BTreeMap::new(),
            exclusive_pairs: Vec::new(),
        },
    }
}

/// Mock heap service for testing
pub struct MockHeapService {
    live: Arc<Mutex<HashSet<HeapHandle>>>,
    created: Arc<Mutex<Vec<u64>>>,
    error_mode: Arc<Mutex<bool>>,
}

impl MockHeapService {
    pub fn new() -> Self {
        Self {
            live: Arc::new(Mutex::new(HashSet::new())),
            created: Arc::new(Mutex::new(Vec::new())),
            error_mode: Arc::new(Mutex::new(false)),
        }
    }

    /// Enable or disable error mode for testing error handling
    pub fn set_error_mode(&self, enabled: bool) {
        *self.error_mode.lock().unwrap() = enabled;
    }

    pub fn live_heaps(&self) -> usize {
        self.live.lock().unwrap().len()
    }

    /// Sizes of every heap ever created
    pub fn created_sizes(&self) -> Vec<u64> {
        self.created.lock().unwrap().clone()
    }
}

impl Default for MockHeapService {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryHeapService for MockHeapService {
    fn create_isolated_heap(&self, size_bytes: u64) -> Result<HeapHandle> {
        if *self.error_mode.lock().unwrap() {
            return Err(PartitionError::Collaborator {
                service: "heap",
                message: "mock heap failure".to_string(),
            });
        }
        let mut created = self.created.lock().unwrap();
        created.push(size_bytes);
        let heap = HeapHandle(created.len() as u64);
        self.live.lock().unwrap().insert(heap);
        Ok(heap)
    }

    fn destroy_heap(&self, heap: HeapHandle) -> Result<()> {
        self.live.lock().unwrap().remove(&heap);
        Ok(())
    }
}

/// Mock handle service that can be told to start failing
pub struct MockHandleService {
    live: Arc<Mutex<HashSet<Handle>>>,
    next: Arc<Mutex<u64>>,
    remaining_successes: Arc<Mutex<Option<usize>>>,
}

impl MockHandleService {
    pub fn new() -> Self {
        Self {
            live: Arc::new(Mutex::new(HashSet::new())),
            next: Arc::new(Mutex::new(0)),
            remaining_successes: Arc::new(Mutex::new(None)),
        }
    }

    /// Let `count` more allocations succeed, fail every one after that
    pub fn fail_after(&self, count: usize) {
        *self.remaining_successes.lock().unwrap() = Some(count);
    }

    pub fn stop_failing(&self) {
        *self.remaining_successes.lock().unwrap() = None;
    }

    pub fn live_handles(&self) -> usize {
        self.live.lock().unwrap().len()
    }
}

impl Default for MockHandleService {
    fn default() -> Self {
        Self::new()
    }
}

impl HandleService for MockHandleService {
    fn alloc_internal_handle(&self, _parent: Option<Handle>, _class: HandleClass) -> Result<Handle> {
        let mut remaining = self.remaining_successes.lock().unwrap();
        if let Some(count) = remaining.as_mut() {
            if *count == 0 {
                return Err(PartitionError::Collaborator {
                    service: "handle",
                    message: "mock handle failure".to_string(),
                });
            }
            *count -= 1;
        }
        let mut next = self.next.lock().unwrap();
        *next += 1;
        let handle = Handle(*next);
        self.live.lock().unwrap().insert(handle);
        Ok(handle)
    }

    fn free_handle(&self, handle: Handle) -> Result<()> {
        self.live.lock().unwrap().remove(&handle);
        Ok(())
    }
}

/// Deterministic UUIDs numbered in creation order
#[derive(Default)]
pub struct SequentialUuidGenerator {
    next: Mutex<u128>,
}

impl UuidGenerator for SequentialUuidGenerator {
    fn generate_uuid(&self, _seed: &UuidSeed) -> Uuid {
        let mut next = self.next.lock().unwrap();
        *next += 1;
        Uuid::from_u128(*next)
    }
}

/// Services backed by the mocks, with the mocks handed back for inspection
pub fn mock_services() -> (Services, Arc<MockHeapService>, Arc<MockHandleService>) {
    let heaps = Arc::new(MockHeapService::new());
    let handles = Arc::new(MockHandleService::new());
    let services = Services {
        heaps: heaps.clone(),
        handles: handles.clone(),
        uuids: Arc::new(SequentialUuidGenerator::default()),
    };
    (services, heaps, handles)
}
