//! Instance-to-container lifecycle orchestration.
//!
//! Owns the mapping between persisted instance records and live containers:
//! drives state transitions, reconciles persisted state against runtime
//! truth, and multiplexes interactive exec sessions. The container engine is
//! an injected [`cloudsim_common::ContainerRuntime`] capability; the store is
//! an injected [`store::InstanceStore`].

use thiserror::Error;

pub mod exec_gateway;
pub mod manager;
pub mod reconcile;
pub mod store;

pub use exec_gateway::{ExecGateway, ExecSession};
pub use manager::{LifecycleManager, ManagerConfig};
pub use reconcile::{ReconcileOutcome, ReconcileReport};
pub use store::{InstanceStore, JsonFileStore, StoreError};

use cloudsim_common::RuntimeError;

/// Error surface of the lifecycle manager and exec gateway. Variants map
/// one-to-one onto the facade's wire-level error codes.
#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid parameter value: {0}")]
    Validation(String),
    #[error("resource not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("instance not running: {0}")]
    InstanceNotRunning(String),
    #[error("instance not stopped: {0}")]
    InstanceNotStopped(String),
    #[error("exec session already open for instance {0}")]
    SessionAlreadyOpen(String),
    #[error("container engine unavailable: {0}")]
    RuntimeUnavailable(String),
    #[error("runtime operation failed: {0}")]
    RuntimeFailed(String),
    #[error("store failure: {0}")]
    Store(String),
}

impl Error {
    /// Stable wire-level error code.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Validation(_) => "InvalidParameterValue",
            Error::NotFound(_) => "ResourceNotFound",
            Error::Conflict(_) => "ConflictError",
            Error::InstanceNotRunning(_) => "InstanceNotRunning",
            Error::InstanceNotStopped(_) => "InstanceNotStopped",
            Error::SessionAlreadyOpen(_) => "SessionAlreadyOpen",
            Error::RuntimeUnavailable(_) => "RuntimeUnavailable",
            Error::RuntimeFailed(_) => "RuntimeOperationFailed",
            Error::Store(_) => "InternalError",
        }
    }
}

impl From<StoreError> for Error {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => Error::NotFound(id),
            StoreError::VersionConflict { .. } => Error::Conflict(err.to_string()),
            StoreError::NotTerminal(id) => {
                Error::Conflict(format!("instance {id} is not terminal"))
            }
            other => Error::Store(other.to_string()),
        }
    }
}

impl From<RuntimeError> for Error {
    fn from(err: RuntimeError) -> Self {
        match err {
            RuntimeError::Unavailable(msg) => Error::RuntimeUnavailable(msg),
            RuntimeError::RefNotFound(msg) => {
                Error::RuntimeFailed(format!("backing container missing: {msg}"))
            }
            RuntimeError::OperationFailed(msg) => Error::RuntimeFailed(msg),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
