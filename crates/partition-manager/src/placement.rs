//! Placement allocator.
//!
//! Two fixed geometries live here. GPU instances are placed by swizz id,
//! each naming an aligned run of the eight device slices. Compute instances
//! are placed by CTS id inside their GPU instance, each naming an aligned run
//! of the eight GPC slots; the span start is the offset of that run measured
//! in slots of the smallest supported compute size.

use std::ops::Range;

use api_types::ComputeSize;
use api_types::MemorySize;
use tracing::debug;

use crate::config::ChipConfig;
use crate::error::PartitionError;
use crate::error::Result;
use crate::ids::CtsId;
use crate::ids::CtsIdMask;
use crate::ids::SwizzId;
use crate::ids::SwizzIdMask;

/// Memory/cluster slices a device is divided into.
pub const DEVICE_SLICES: u32 = 8;
/// Exclusive upper bound of CTS ids.
pub const MAX_CTS_ID: u32 = 21;
/// Exclusive upper bound of swizz ids.
pub const MAX_SWIZZ_ID: u32 = 15;

/// CTS ids occupying each GPC slot, one per compute size.
const GPC_SLOT_PLACEMENTS: [[u32; 6]; DEVICE_SLICES as usize] = [
    [0, 1, 3, 5, 9, 13],
    [0, 1, 3, 5, 9, 14],
    [0, 1, 3, 6, 10, 15],
    [0, 1, 3, 6, 10, 16],
    [0, 2, 4, 7, 11, 17],
    [0, 2, 4, 7, 11, 18],
    [0, 2, 4, 8, 12, 19],
    [0, 2, 4, 8, 12, 20],
];

/// CTS ids owned by each compute size.
pub fn placement_id_range_for_size(size: ComputeSize) -> Range<CtsId> {
    let (lo, hi) = match size {
        ComputeSize::Full => (0, 1),
        ComputeSize::Half => (1, 3),
        ComputeSize::MiniHalf => (3, 5),
        ComputeSize::Quarter => (5, 9),
        ComputeSize::MiniQuarter => (9, 13),
        ComputeSize::Eighth => (13, 21),
    };
    CtsId(lo)..CtsId(hi)
}

pub fn compute_size_for_placement_id(id: CtsId) -> Option<ComputeSize> {
    ComputeSize::ALL
        .into_iter()
        .find(|size| placement_id_range_for_size(*size).contains(&id))
}

fn gpc_slot_mask(slot: usize) -> CtsIdMask {
    GPC_SLOT_PLACEMENTS[slot].iter().map(|id| CtsId(*id)).collect()
}

/// Every CTS id sharing at least one GPC slot with `id`, `id` included.
pub fn overlapping_placement_ids(id: CtsId) -> CtsIdMask {
    let mut overlap = CtsIdMask::new();
    for slot in 0..GPC_SLOT_PLACEMENTS.len() {
        let slot_mask = gpc_slot_mask(slot);
        if slot_mask.test(id) {
            overlap |= slot_mask;
        }
    }
    overlap
}

/// Ids made unavailable by the ids already in use.
pub fn blocked_placement_ids(in_use: CtsIdMask) -> CtsIdMask {
    in_use
        .iter()
        .fold(CtsIdMask::new(), |acc, id| acc | overlapping_placement_ids(id))
}

pub fn is_placement_available(valid: CtsIdMask, in_use: CtsIdMask, id: CtsId) -> bool {
    valid.test(id) && !blocked_placement_ids(in_use).test(id)
}

/// Span arithmetic derived from the smallest supported compute size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlacementAllocator {
    smallest: ComputeSize,
}

impl PlacementAllocator {
    pub fn new(smallest: ComputeSize) -> Self {
        Self { smallest }
    }

    pub fn for_chip(chip: &ChipConfig) -> Result<Self> {
        chip.smallest_compute_size()
            .map(Self::new)
            .ok_or_else(|| PartitionError::not_supported("chip has no compute profiles"))
    }

    pub fn smallest(&self) -> ComputeSize {
        self.smallest
    }

    /// The ids of the smallest size; every placement is measured in them.
    pub fn slot_basis_mask(&self) -> CtsIdMask {
        CtsIdMask::from_range(placement_id_range_for_size(self.smallest))
    }

    /// Basis slots covered by one placement of `size`.
    pub fn slots_per_placement(&self, size: ComputeSize) -> Result<u32> {
        if size > self.smallest {
            return Err(PartitionError::not_supported(format!(
                "compute size {size} is smaller than the smallest supported size {}",
                self.smallest
            )));
        }
        let lo = placement_id_range_for_size(size).start;
        Ok((overlapping_placement_ids(lo) & self.slot_basis_mask()).count())
    }

    pub fn span_start_from_placement_id(&self, id: CtsId) -> Result<u32> {
        let size = compute_size_for_placement_id(id)
            .ok_or_else(|| PartitionError::invalid_argument(format!("{id} is not a placement id")))?;
        let lo = placement_id_range_for_size(size).start;
        Ok((id.0 - lo.0) * self.slots_per_placement(size)?)
    }

    pub fn placement_id_from_span_start(&self, size: ComputeSize, span_start: u32) -> Result<CtsId> {
        let slots = self.slots_per_placement(size)?;
        let basis_slots = self.slot_basis_mask().count();
        if slots == 0 || span_start >= basis_slots || span_start % slots != 0 {
            return Err(PartitionError::invalid_argument(format!(
                "span start {span_start} is not a valid {size} placement"
            )));
        }
        Ok(CtsId(placement_id_range_for_size(size).start.0 + span_start / slots))
    }

    /// Lowest id of `size` that is legal (`valid`), not overlapped by
    /// `in_use` and, when `restrict_to_graphics` is set, whose graphics
    /// capability (`valid_graphics`) equals `want_graphics`.
    pub fn find_free_placement_id(
        &self,
        valid: CtsIdMask,
        valid_graphics: CtsIdMask,
        in_use: CtsIdMask,
        size: ComputeSize,
        restrict_to_graphics: bool,
        want_graphics: bool,
    ) -> Result<CtsId> {
        let blocked = blocked_placement_ids(in_use);
        let candidates = valid.within(placement_id_range_for_size(size)) - blocked;

        let found = candidates
            .iter()
            .find(|id| !restrict_to_graphics || valid_graphics.test(*id) == want_graphics);

        debug!(
            size = %size,
            in_use = ?in_use,
            candidates = ?candidates,
            found = ?found,
            "placement id search"
        );
        found.ok_or(PartitionError::NoFreeSlot { size })
    }
}

/// Swizz ids owned by each memory size.
pub fn swizz_id_range_for_memory_size(size: MemorySize) -> Range<SwizzId> {
    let (lo, hi) = match size {
        MemorySize::Full => (0, 1),
        MemorySize::Half => (1, 3),
        MemorySize::Quarter => (3, 7),
        MemorySize::Eighth => (7, 15),
    };
    SwizzId(lo)..SwizzId(hi)
}

pub fn memory_size_for_swizz_id(id: SwizzId) -> Option<MemorySize> {
    [
        MemorySize::Full,
        MemorySize::Half,
        MemorySize::Quarter,
        MemorySize::Eighth,
    ]
    .into_iter()
    .find(|size| swizz_id_range_for_memory_size(*size).contains(&id))
}

/// Device slices covered by `id`.
pub fn swizz_slices(id: SwizzId) -> Option<Range<u32>> {
    let size = memory_size_for_swizz_id(id)?;
    let index = id.0 - swizz_id_range_for_memory_size(size).start.0;
    let start = index * size.slices();
    Some(start..start + size.slices())
}

/// Every swizz id sharing a slice with `id`, `id` included.
pub fn overlapping_swizz_ids(id: SwizzId) -> SwizzIdMask {
    let Some(slices) = swizz_slices(id) else {
        return SwizzIdMask::new();
    };
    (0..MAX_SWIZZ_ID)
        .map(SwizzId)
        .filter(|other| {
            swizz_slices(*other)
                .is_some_and(|o| o.start < slices.end && slices.start < o.end)
        })
        .collect()
}

/// Lowest swizz id of `size` that overlaps nothing in `in_use`.
pub fn find_free_swizz_id(in_use: SwizzIdMask, size: MemorySize) -> Option<SwizzId> {
    let range = swizz_id_range_for_memory_size(size);
    (range.start.0..range.end.0)
        .map(SwizzId)
        .find(|id| overlapping_swizz_ids(*id).is_disjoint(&in_use))
}

/// Swizz id naming exactly the `count` slices starting at `start`.
pub fn swizz_id_for_slices(size: MemorySize, start: u32, count: u32) -> Result<SwizzId> {
    let fits = start
        .checked_add(count)
        .is_some_and(|end| end <= DEVICE_SLICES);
    if count != size.slices() || start % size.slices() != 0 || !fits {
        return Err(PartitionError::invalid_argument(format!(
            "placement {start}+{count} is not an aligned {size} placement"
        )));
    }
    Ok(SwizzId(
        swizz_id_range_for_memory_size(size).start.0 + start / size.slices(),
    ))
}
