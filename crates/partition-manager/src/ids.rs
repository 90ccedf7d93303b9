//! Identifier newtypes.
//!
//! Slot-like identifiers implement [`BitIndex`] so their masks are typed;
//! instance ids carry the generation of the arena slot they were issued from.

use std::fmt;

use serde::Deserialize;
use serde::Serialize;
use utils::bitset::BitIndex;
use utils::bitset::BitSet;

macro_rules! bit_index_newtype {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub u32);

        impl BitIndex for $name {
            fn to_bit(self) -> u32 {
                self.0
            }

            fn from_bit(bit: u32) -> Self {
                Self(bit)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "{}"), self.0)
            }
        }
    };
}

bit_index_newtype!(
    /// GPU instance slot identifier ("swizzId"), names a fixed run of device slices
    SwizzId,
    "swizz"
);
bit_index_newtype!(
    /// Compute placement identifier ("CTS id")
    CtsId,
    "cts"
);
bit_index_newtype!(
    /// Physical processing cluster
    GpcId,
    "gpc"
);

pub type SwizzIdMask = BitSet<SwizzId, 1>;
pub type CtsIdMask = BitSet<CtsId, 1>;
pub type GpcMask = BitSet<GpcId, 1>;

/// Opaque handle of a GPU instance, stale once the slot is reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GpuInstanceId {
    pub(crate) slot: u32,
    pub(crate) generation: u32,
}

impl fmt::Display for GpuInstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "gi{}#{}", self.slot, self.generation)
    }
}

/// Opaque handle of a compute instance inside its GPU instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ComputeInstanceId {
    pub(crate) slot: u32,
    pub(crate) generation: u32,
}

impl ComputeInstanceId {
    /// Local identifier, unique within the parent GPU instance
    pub fn local_id(&self) -> u32 {
        self.slot
    }
}

impl fmt::Display for ComputeInstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ci{}#{}", self.slot, self.generation)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClientId(pub u64);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client{}", self.0)
    }
}

/// Internal object handle minted by the handle service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Handle(pub u64);

/// Isolated memory sub-heap minted by the heap service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HeapHandle(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VaSpaceGroupId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionHandle(pub(crate) u64);

impl fmt::Display for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub{}", self.0)
    }
}
