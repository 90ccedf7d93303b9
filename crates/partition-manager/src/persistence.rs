//! Topology save and restore.
//!
//! A [`TopologySnapshot`] captures every GPU instance with its compute
//! instances in exported form. Restoring replays them through the restore
//! paths, so a restored device is indistinguishable from the saved one.

use core::error::Error;
use std::fs;
use std::path::Path;
use std::path::PathBuf;

use api_types::GpuInstanceSnapshot;
use api_types::TopologySnapshot;
use chrono::Utc;
use derive_more::Display;
use error_stack::Report;
use error_stack::ResultExt;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::compute_instance::ComputeInstanceCreate;
use crate::error::Result;
use crate::gpu_instance::GpuInstanceCreate;
use crate::ids::GpuInstanceId;
use crate::manager::PartitionManager;

pub type StoreResult<T> = std::result::Result<T, Report<StoreError>>;

/// Errors of the on-disk snapshot store.
#[derive(Debug, Display)]
pub enum StoreError {
    #[display("I/O error on {path}")]
    Io { path: String },

    #[display("Serialization error: {message}")]
    Serialization { message: String },
}

impl Error for StoreError {}

impl PartitionManager {
    pub fn save_topology(&self) -> TopologySnapshot {
        let mut gpu_instances: Vec<GpuInstanceSnapshot> = self
            .gpu_instances
            .iter()
            .map(|(_, _, gi)| GpuInstanceSnapshot {
                swizz_id: gi.swizz_id.0,
                partition_flag: gi.flag,
                uuid: gi.uuid,
                gpc_mask: gi.allocation.gpcs.bits(),
                gfx_gpc_count: gi.allocation.gfx_gpc_count,
                virtual_gpc_count: gi.allocation.virtual_gpc_count,
                veid_offset: gi.allocation.veid_offset,
                veid_count: gi.allocation.veid_count,
                sm_count: gi.allocation.sm_count,
                engine_mask: gi.allocation.engines.bits(),
                compute_instances: self.export_all_compute_instances(gi),
            })
            .collect();
        gpu_instances.sort_by_key(|gi| gi.swizz_id);
        TopologySnapshot {
            saved_at: Utc::now(),
            gpu_instances,
        }
    }

    /// Recreates every saved instance, or none of them.
    pub fn restore_topology(&mut self, snapshot: &TopologySnapshot) -> Result<Vec<GpuInstanceId>> {
        let mut restored = Vec::with_capacity(snapshot.gpu_instances.len());
        for saved in &snapshot.gpu_instances {
            match self.restore_gpu_instance(saved) {
                Ok(id) => restored.push(id),
                Err(err) => {
                    warn!(
                        swizz_id = saved.swizz_id,
                        error = %err,
                        "topology restore failed, unwinding"
                    );
                    for id in restored.iter().rev() {
                        if let Err(unwind) = self.invalidate_gpu_instance(*id, true) {
                            error!(gpu_instance = %id, error = %unwind, "failed to unwind restored instance");
                        }
                    }
                    return Err(err);
                }
            }
        }
        info!(
            count = restored.len(),
            saved_at = %snapshot.saved_at,
            "topology restored"
        );
        Ok(restored)
    }

    fn restore_gpu_instance(&mut self, saved: &GpuInstanceSnapshot) -> Result<GpuInstanceId> {
        let id = self.create_gpu_instance(GpuInstanceCreate::Restore(Box::new(saved.clone())))?;
        if saved.compute_instances.is_empty() {
            return Ok(id);
        }
        let created = self.create_compute_instances(
            id,
            ComputeInstanceCreate::Restore(saved.compute_instances.clone()),
            false,
        );
        if let Err(err) = created {
            self.invalidate_gpu_instance(id, true)?;
            return Err(err);
        }
        Ok(id)
    }
}

/// JSON file holding the last saved topology.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    path: PathBuf,
}

impl SnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Writes the snapshot next to the target and renames it into place.
    pub fn save(&self, snapshot: &TopologySnapshot) -> StoreResult<()> {
        let json = serde_json::to_vec_pretty(snapshot).map_err(|e| {
            Report::new(StoreError::Serialization {
                message: e.to_string(),
            })
        })?;

        let staging = self.path.with_extension("json.tmp");
        fs::write(&staging, json).change_context(StoreError::Io {
            path: staging.display().to_string(),
        })?;
        fs::rename(&staging, &self.path).change_context(StoreError::Io {
            path: self.path.display().to_string(),
        })?;

        info!(
            path = %self.path.display(),
            gpu_instances = snapshot.gpu_instances.len(),
            "topology saved"
        );
        Ok(())
    }

    pub fn load(&self) -> StoreResult<TopologySnapshot> {
        let bytes = fs::read(&self.path).change_context(StoreError::Io {
            path: self.path.display().to_string(),
        })?;
        serde_json::from_slice(&bytes)
            .change_context(StoreError::Serialization {
                message: "malformed topology snapshot".to_string(),
            })
            .attach_printable_lazy(|| format!("path: {}", self.path.display()))
    }
}
