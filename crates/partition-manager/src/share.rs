use std::sync::Arc;

/// Reference-counted ownership token attached to every partition.
///
/// The owning instance keeps the original; each subscription holds a clone
/// and releases it on drop. An instance may only be torn down while it is
/// the sole holder.
#[derive(Debug, Clone, Default)]
pub(crate) struct Share(Arc<()>);

impl Share {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Outstanding holders besides the owning instance.
    pub(crate) fn subscriber_count(&self) -> u32 {
        (Arc::strong_count(&self.0) - 1) as u32
    }

    pub(crate) fn is_sole_owner(&self) -> bool {
        Arc::strong_count(&self.0) == 1
    }
}
