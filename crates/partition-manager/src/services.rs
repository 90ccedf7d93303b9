//! Contracts of the collaborators the partition manager calls into, with
//! in-process implementations.

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;

use tracing::warn;
use uuid::Uuid;

use crate::error::PartitionError;
use crate::error::Result;
use crate::ids::Handle;
use crate::ids::HeapHandle;
use crate::ids::SwizzId;

/// Memory sub-heap service
pub trait MemoryHeapService: Send + Sync {
    fn create_isolated_heap(&self, size_bytes: u64) -> Result<HeapHandle>;
    fn destroy_heap(&self, heap: HeapHandle) -> Result<()>;
}

/// Class of an internal object handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandleClass {
    Client,
    Device,
    Subdevice,
    Subscription,
}

/// Handle/RPC service
pub trait HandleService: Send + Sync {
    fn alloc_internal_handle(&self, parent: Option<Handle>, class: HandleClass) -> Result<Handle>;
    fn free_handle(&self, handle: Handle) -> Result<()>;
}

/// What an instance UUID is derived from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UuidSeed {
    pub device: Uuid,
    pub swizz_id: SwizzId,
    /// Local id of the compute instance, `None` for a GPU instance
    pub compute_id: Option<u32>,
    /// Per-device creation counter
    pub serial: u64,
}

/// UUID generator
pub trait UuidGenerator: Send + Sync {
    fn generate_uuid(&self, seed: &UuidSeed) -> Uuid;
}

/// Collaborators handed to the partition manager.
#[derive(Clone)]
pub struct Services {
    pub heaps: Arc<dyn MemoryHeapService>,
    pub handles: Arc<dyn HandleService>,
    pub uuids: Arc<dyn UuidGenerator>,
}

impl Services {
    /// Self-contained services for tools and tests.
    pub fn in_memory() -> Self {
        Self {
            heaps: Arc::new(InMemoryHeapService::default()),
            handles: Arc::new(InMemoryHandleService::default()),
            uuids: Arc::new(NameBasedUuidGenerator),
        }
    }
}

/// Derives UUIDs from the seed with a name-based (v5) hash under the device
/// UUID namespace.
#[derive(Debug, Clone, Copy, Default)]
pub struct NameBasedUuidGenerator;

impl UuidGenerator for NameBasedUuidGenerator {
    fn generate_uuid(&self, seed: &UuidSeed) -> Uuid {
        let name = format!(
            "{}/{}/{}",
            seed.swizz_id.0,
            seed.compute_id.map_or_else(|| "gi".to_string(), |id| id.to_string()),
            seed.serial
        );
        Uuid::new_v5(&seed.device, name.as_bytes())
    }
}

/// Heap service that only does the bookkeeping.
#[derive(Debug, Default)]
pub struct InMemoryHeapService {
    next: AtomicU64,
    live: Mutex<HashMap<HeapHandle, u64>>,
}

impl InMemoryHeapService {
    pub fn live_heaps(&self) -> usize {
        self.live.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

impl MemoryHeapService for InMemoryHeapService {
    fn create_isolated_heap(&self, size_bytes: u64) -> Result<HeapHandle> {
        if size_bytes == 0 {
            return Err(PartitionError::invalid_argument("empty heap requested"));
        }
        let heap = HeapHandle(self.next.fetch_add(1, Ordering::Relaxed) + 1);
        self.live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(heap, size_bytes);
        Ok(heap)
    }

    fn destroy_heap(&self, heap: HeapHandle) -> Result<()> {
        self.live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&heap)
            .map(|_| ())
            .ok_or_else(|| PartitionError::not_found(format!("heap {}", heap.0)))
    }
}

/// Handle service minting sequential handles.
#[derive(Debug, Default)]
pub struct InMemoryHandleService {
    next: AtomicU64,
    live: Mutex<HashSet<Handle>>,
}

impl InMemoryHandleService {
    pub fn live_handles(&self) -> usize {
        self.live.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

impl HandleService for InMemoryHandleService {
    fn alloc_internal_handle(&self, parent: Option<Handle>, _class: HandleClass) -> Result<Handle> {
        let mut live = self.live.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(parent) = parent {
            if !live.contains(&parent) {
                return Err(PartitionError::not_found(format!("parent handle {}", parent.0)));
            }
        }
        let handle = Handle(self.next.fetch_add(1, Ordering::Relaxed) + 1);
        live.insert(handle);
        Ok(handle)
    }

    fn free_handle(&self, handle: Handle) -> Result<()> {
        let removed = self
            .live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&handle);
        if removed {
            Ok(())
        } else {
            Err(PartitionError::not_found(format!("handle {}", handle.0)))
        }
    }
}

/// Internal handles an instance uses to issue further calls into itself
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct InstanceHandles {
    pub(crate) client: Handle,
    pub(crate) device: Handle,
    pub(crate) subdevice: Handle,
    pub(crate) subscription: Handle,
}

impl InstanceHandles {
    /// Allocates the client → device → subdevice → subscription chain,
    /// freeing whatever was allocated if a later step fails.
    pub(crate) fn allocate(service: &dyn HandleService) -> Result<Self> {
        let mut chain: Vec<Handle> = Vec::with_capacity(4);
        let classes = [
            HandleClass::Client,
            HandleClass::Device,
            HandleClass::Subdevice,
            HandleClass::Subscription,
        ];
        for class in classes {
            match service.alloc_internal_handle(chain.last().copied(), class) {
                Ok(handle) => chain.push(handle),
                Err(err) => {
                    free_chain(service, &chain);
                    return Err(err);
                }
            }
        }
        Ok(Self {
            client: chain[0],
            device: chain[1],
            subdevice: chain[2],
            subscription: chain[3],
        })
    }

    pub(crate) fn free(&self, service: &dyn HandleService) {
        free_chain(
            service,
            &[self.client, self.device, self.subdevice, self.subscription],
        );
    }
}

fn free_chain(service: &dyn HandleService, chain: &[Handle]) {
    for handle in chain.iter().rev() {
        if let Err(err) = service.free_handle(*handle) {
            warn!(handle = handle.0, error = %err, "failed to free internal handle");
        }
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;
    use crate::mock::MockHandleService;

    #[test]
    fn test_name_based_uuid_is_stable() {
        let seed = UuidSeed {
            device: Uuid::nil(),
            swizz_id: SwizzId(3),
            compute_id: Some(1),
            serial: 7,
        };
        let generator = NameBasedUuidGenerator;
        assert_eq!(generator.generate_uuid(&seed), generator.generate_uuid(&seed));
        let other = UuidSeed { serial: 8, ..seed };
        assert_ne!(generator.generate_uuid(&seed), generator.generate_uuid(&other));
    }

    #[test]
    fn test_handle_chain_rolls_back() {
        let service = MockHandleService::new();
        service.fail_after(2);
        assert!(InstanceHandles::allocate(&service).is_err());
        assert_eq!(service.live_handles(), 0);

        let service = InMemoryHandleService::default();
        let handles = InstanceHandles::allocate(&service).unwrap();
        assert_eq!(service.live_handles(), 4);
        handles.free(&service);
        assert_eq!(service.live_handles(), 0);
    }

    #[test]
    fn test_heap_bookkeeping() {
        let heaps = InMemoryHeapService::default();
        let heap = heaps.create_isolated_heap(1 << 20).unwrap();
        assert_eq!(heaps.live_heaps(), 1);
        heaps.destroy_heap(heap).unwrap();
        assert!(heaps.destroy_heap(heap).is_err());
    }
}
