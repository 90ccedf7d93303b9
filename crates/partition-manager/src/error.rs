use api_types::ComputeSize;

use crate::engine::EngineKind;
use crate::engine::EngineType;
use crate::subscription::PrivilegeLevel;

/// Errors returned by the partition manager
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PartitionError {
    #[error("Invalid argument: {message}")]
    InvalidArgument { message: String },

    #[error("Not supported: {message}")]
    NotSupported { message: String },

    #[error("Insufficient resources: {message}")]
    InsufficientResources { message: String },

    #[error("Insufficient {kind} engines: requested {requested}, available {available}")]
    InsufficientEngines {
        kind: EngineKind,
        requested: u32,
        available: u32,
    },

    #[error("No free placement id for compute size {size}")]
    NoFreeSlot { size: ComputeSize },

    #[error("Object not found: {what}")]
    ObjectNotFound { what: String },

    #[error("State in use: {message}")]
    StateInUse { message: String },

    #[error("Invalid state: {message}")]
    InvalidState { message: String },

    #[error("Insufficient permissions: {required} privilege required")]
    InsufficientPermissions { required: PrivilegeLevel },

    #[error("Engine {engine} is not part of the instance")]
    EngineNotInInstance { engine: EngineType },

    #[error("{service} service failed: {message}")]
    Collaborator {
        service: &'static str,
        message: String,
    },
}

impl PartitionError {
    pub(crate) fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    pub(crate) fn not_supported(message: impl Into<String>) -> Self {
        Self::NotSupported {
            message: message.into(),
        }
    }

    pub(crate) fn insufficient_resources(message: impl Into<String>) -> Self {
        Self::InsufficientResources {
            message: message.into(),
        }
    }

    pub(crate) fn not_found(what: impl Into<String>) -> Self {
        Self::ObjectNotFound { what: what.into() }
    }

    pub(crate) fn in_use(message: impl Into<String>) -> Self {
        Self::StateInUse {
            message: message.into(),
        }
    }

    pub(crate) fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState {
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, PartitionError>;
