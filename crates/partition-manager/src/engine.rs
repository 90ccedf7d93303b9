//! Resource pool and engine allocator.
//!
//! Partitionable engines live in one global index space grouped by kind.
//! Every instance also sees its engines through a local mask that is
//! re-indexed from zero per kind; translation walks the local and global
//! masks as a pair.

use std::fmt;
use std::ops::Range;

use serde::Deserialize;
use serde::Serialize;
use tracing::debug;
use utils::bitset::BitIndex;
use utils::bitset::BitSet;

use crate::error::PartitionError;
use crate::error::Result;

/// Global engine index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EngineType(pub u32);

pub type EngineMask = BitSet<EngineType, 1>;

/// Size of the partitionable engine index space.
pub const ENGINE_TYPE_COUNT: u32 = 38;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EngineKind {
    Graphics,
    Copy,
    Nvdec,
    Nvenc,
    Nvjpg,
    Ofa,
}

impl EngineKind {
    pub const ALL: [EngineKind; 6] = [
        EngineKind::Graphics,
        EngineKind::Copy,
        EngineKind::Nvdec,
        EngineKind::Nvenc,
        EngineKind::Nvjpg,
        EngineKind::Ofa,
    ];

    /// Range of global engine indexes belonging to this kind.
    pub const fn range(self) -> Range<EngineType> {
        let (lo, hi) = match self {
            EngineKind::Graphics => (0, 8),
            EngineKind::Copy => (8, 18),
            EngineKind::Nvdec => (18, 26),
            EngineKind::Nvenc => (26, 29),
            EngineKind::Nvjpg => (29, 37),
            EngineKind::Ofa => (37, 38),
        };
        EngineType(lo)..EngineType(hi)
    }

    pub const fn capacity(self) -> u32 {
        let range = self.range();
        range.end.0 - range.start.0
    }

    /// Share flag that lets compute instances time-share engines of this
    /// kind. Graphics engines are never shared.
    pub const fn shared_flag(self) -> SharedEngineFlags {
        match self {
            EngineKind::Graphics => SharedEngineFlags::NONE,
            EngineKind::Copy => SharedEngineFlags::COPY,
            EngineKind::Nvdec => SharedEngineFlags::NVDEC,
            EngineKind::Nvenc => SharedEngineFlags::NVENC,
            EngineKind::Nvjpg => SharedEngineFlags::NVJPG,
            EngineKind::Ofa => SharedEngineFlags::OFA,
        }
    }
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EngineKind::Graphics => "GR",
            EngineKind::Copy => "CE",
            EngineKind::Nvdec => "NVDEC",
            EngineKind::Nvenc => "NVENC",
            EngineKind::Nvjpg => "NVJPG",
            EngineKind::Ofa => "OFA",
        };
        f.write_str(name)
    }
}

impl EngineType {
    /// The `instance`-th engine of `kind`.
    pub const fn new(kind: EngineKind, instance: u32) -> Self {
        EngineType(kind.range().start.0 + instance)
    }

    pub fn kind(self) -> Option<EngineKind> {
        EngineKind::ALL
            .into_iter()
            .find(|kind| kind.range().contains(&self))
    }

    /// Index of this engine within its kind.
    pub fn instance(self) -> Option<u32> {
        self.kind().map(|kind| self.0 - kind.range().start.0)
    }
}

impl BitIndex for EngineType {
    fn to_bit(self) -> u32 {
        self.0
    }

    fn from_bit(bit: u32) -> Self {
        EngineType(bit)
    }
}

impl fmt::Display for EngineType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.kind(), self.instance()) {
            (Some(EngineKind::Ofa), _) => write!(f, "OFA"),
            (Some(kind), Some(instance)) => write!(f, "{kind}{instance}"),
            _ => write!(f, "ENGINE({})", self.0),
        }
    }
}

/// Engine categories a compute instance time-shares with its siblings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SharedEngineFlags(u32);

impl SharedEngineFlags {
    pub const NONE: Self = Self(0);
    pub const COPY: Self = Self(1 << 0);
    pub const NVDEC: Self = Self(1 << 1);
    pub const NVENC: Self = Self(1 << 2);
    pub const NVJPG: Self = Self(1 << 3);
    pub const OFA: Self = Self(1 << 4);
    pub const ALL: Self = Self(0b1_1111);

    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Unknown bits are rejected.
    pub fn from_bits(bits: u32) -> Option<Self> {
        (bits & !Self::ALL.0 == 0).then_some(Self(bits))
    }

    pub const fn contains(self, other: Self) -> bool {
        other.0 != 0 && self.0 & other.0 == other.0
    }

    /// Whether engines of `kind` are time-shared under these flags.
    pub const fn shares(self, kind: EngineKind) -> bool {
        self.contains(kind.shared_flag())
    }

    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

/// Result of drawing engines of one kind for a compute instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineAllocation {
    /// Selected engines, indexed in the source's local space
    pub engines: EngineMask,
    /// Engines to add to the exclusive pool
    pub exclusive_delta: EngineMask,
    /// Engines to add to the shared pool
    pub shared_delta: EngineMask,
    /// Engines of the kind still neither shared nor exclusive afterwards
    pub remaining: u32,
}

/// Draws `requested` engines of `kind` from `source`.
///
/// `source` is the global engine mask of the owning GPU instance and the
/// selection is returned in that instance's local index space. Exclusive
/// requests only take engines that are neither exclusive nor shared;
/// shared requests reuse already-shared engines first. Nothing is marked on
/// failure, the caller applies the deltas.
pub fn allocate_instance_engines(
    source: EngineMask,
    want_shared: bool,
    kind: EngineKind,
    requested: u32,
    exclusive: EngineMask,
    shared: EngineMask,
) -> Result<EngineAllocation> {
    let candidates = source.within(kind.range());
    let free = candidates - exclusive - shared;

    let mut picked = EngineMask::new();
    if want_shared {
        for engine in (candidates & shared).iter() {
            if picked.count() == requested {
                break;
            }
            picked.insert(engine);
        }
    }
    for engine in free.iter() {
        if picked.count() == requested {
            break;
        }
        picked.insert(engine);
    }

    if picked.count() < requested {
        let available = if want_shared {
            (candidates & shared).count() + free.count()
        } else {
            free.count()
        };
        return Err(PartitionError::InsufficientEngines {
            kind,
            requested,
            available,
        });
    }

    let fresh = picked & free;
    let (exclusive_delta, shared_delta) = if want_shared {
        (EngineMask::new(), fresh)
    } else {
        (fresh, EngineMask::new())
    };

    let mut engines = EngineMask::new();
    for engine in picked.iter() {
        let rank = candidates.rank(engine);
        engines.insert(EngineType(kind.range().start.0 + rank));
    }

    debug!(
        kind = %kind,
        requested,
        shared = want_shared,
        picked = ?picked,
        "allocated instance engines"
    );

    Ok(EngineAllocation {
        engines,
        exclusive_delta,
        shared_delta,
        remaining: (free - fresh).count(),
    })
}

/// Device-global record of engines claimed by any GPU instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EnginePool {
    present: EngineMask,
    in_use: EngineMask,
}

impl EnginePool {
    /// Pool holding the first `counts(kind)` engines of every kind.
    pub fn new(counts: impl Fn(EngineKind) -> u32) -> Self {
        let mut present = EngineMask::new();
        for kind in EngineKind::ALL {
            let count = counts(kind).min(kind.capacity());
            present.insert_range(EngineType::new(kind, 0)..EngineType::new(kind, count));
        }
        Self {
            present,
            in_use: EngineMask::new(),
        }
    }

    pub fn present(&self) -> EngineMask {
        self.present
    }

    pub fn in_use(&self) -> EngineMask {
        self.in_use
    }

    pub fn free(&self) -> EngineMask {
        self.present - self.in_use
    }

    /// Marks `mask` as in use. Fails without marking anything if an engine
    /// is absent or already claimed.
    pub fn set_engines_in_use(&mut self, mask: EngineMask) -> Result<()> {
        if !mask.is_subset_of(&self.present) {
            return Err(PartitionError::invalid_argument(format!(
                "engines {:?} are not present on the device",
                mask - self.present
            )));
        }
        let clash = mask & self.in_use;
        if !clash.is_empty() {
            return Err(PartitionError::in_use(format!(
                "engines {clash:?} are already assigned"
            )));
        }
        self.in_use |= mask;
        Ok(())
    }

    pub fn clear_engines_in_use(&mut self, mask: EngineMask) {
        self.in_use = self.in_use - mask;
    }

    /// Lowest `count` free engines of `kind`, restricted to `allowed`.
    pub fn take_lowest(
        &self,
        kind: EngineKind,
        count: u32,
        allowed: EngineMask,
    ) -> Result<EngineMask> {
        let free = self.free().within(kind.range()) & allowed;
        if free.count() < count {
            return Err(PartitionError::InsufficientEngines {
                kind,
                requested: count,
                available: free.count(),
            });
        }
        Ok(free.iter().take(count as usize).collect())
    }
}

/// Local view of `engines`: for each kind, the first `n` local indexes
/// where `n` is the number of engines of that kind.
pub fn local_engine_mask(engines: EngineMask) -> EngineMask {
    let mut local = EngineMask::new();
    for kind in EngineKind::ALL {
        let count = count_engines_of_kind(engines, kind);
        local.insert_range(EngineType::new(kind, 0)..EngineType::new(kind, count));
    }
    local
}

pub fn count_engines_of_kind(engines: EngineMask, kind: EngineKind) -> u32 {
    engines.within(kind.range()).count()
}

/// Maps a local engine index to the global index it stands for.
pub fn translate_local_to_global(
    local_mask: EngineMask,
    global_mask: EngineMask,
    local: EngineType,
) -> Result<EngineType> {
    let not_in_instance = || PartitionError::EngineNotInInstance { engine: local };
    let kind = local.kind().ok_or_else(not_in_instance)?;
    if !local_mask.test(local) {
        return Err(not_in_instance());
    }
    let instance = local.0 - kind.range().start.0;
    global_mask
        .within(kind.range())
        .nth(instance)
        .ok_or_else(not_in_instance)
}

/// Inverse of [`translate_local_to_global`].
pub fn translate_global_to_local(
    local_mask: EngineMask,
    global_mask: EngineMask,
    global: EngineType,
) -> Result<EngineType> {
    let not_in_instance = || PartitionError::EngineNotInInstance { engine: global };
    let kind = global.kind().ok_or_else(not_in_instance)?;
    if !global_mask.test(global) {
        return Err(not_in_instance());
    }
    let rank = global_mask.within(kind.range()).rank(global);
    let local = EngineType(kind.range().start.0 + rank);
    if !local_mask.test(local) {
        return Err(not_in_instance());
    }
    Ok(local)
}
