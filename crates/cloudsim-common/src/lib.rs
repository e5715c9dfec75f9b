// Re-export dependencies used in public interfaces of common types

use std::fmt::Display;
use std::pin::Pin;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
pub use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::AsyncWrite;
pub use uuid;

/// Errors produced by a container engine adapter. No adapter retries on its
/// own; retry and backoff policy live in the lifecycle manager.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RuntimeError {
    /// The engine itself is unreachable (socket gone, transport failure).
    /// The only error class that is safe to retry automatically.
    #[error("container engine unavailable: {0}")]
    Unavailable(String),

    /// The engine is reachable but the referenced container no longer exists.
    #[error("runtime reference not found: {0}")]
    RefNotFound(String),

    /// The engine rejected the call (bad image, invalid state, timeout).
    #[error("runtime operation failed: {0}")]
    OperationFailed(String),
}

pub type RuntimeResult<T> = std::result::Result<T, RuntimeError>;

/// What the user last asked for. The single source of truth for intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DesiredState {
    Requested,
    Running,
    Stopped,
    Terminated,
}

/// Last state confirmed from the engine. Always a cache of runtime truth,
/// refreshed by reconciliation; never drives the next transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObservedState {
    Unknown,
    Creating,
    Running,
    /// Suspended out-of-band. Never in sync with any desired state.
    Paused,
    Stopped,
    Exited,
    Missing,
    Terminated,
}

impl Display for DesiredState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DesiredState::Requested => "requested",
            DesiredState::Running => "running",
            DesiredState::Stopped => "stopped",
            DesiredState::Terminated => "terminated",
        };
        write!(f, "{s}")
    }
}

impl Display for ObservedState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ObservedState::Unknown => "unknown",
            ObservedState::Creating => "creating",
            ObservedState::Running => "running",
            ObservedState::Paused => "paused",
            ObservedState::Stopped => "stopped",
            ObservedState::Exited => "exited",
            ObservedState::Missing => "missing",
            ObservedState::Terminated => "terminated",
        };
        write!(f, "{s}")
    }
}

/// CPU and memory hints attached to an instance. Translated to engine
/// resource limits on creation; purely advisory beyond that.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceHints {
    pub cpu_cores: Option<u32>,
    pub memory_mb: Option<u32>,
}

/// Persisted record for one simulated instance. Mutated only by the
/// lifecycle manager, through the store's versioned `put`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub id: String,
    pub name: Option<String>,
    pub image: String,
    pub resources: ResourceHints,
    pub desired_state: DesiredState,
    pub observed_state: ObservedState,
    /// Engine container id. Populated exactly once at successful creation,
    /// cleared only on successful termination, never reused.
    pub runtime_ref: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_reconciled_at: Option<DateTime<Utc>>,
    /// Cause of the last failed or surprising transition, for the UI.
    pub state_reason: Option<String>,
    /// Bumped by the store on every write; optimistic concurrency token.
    pub version: u64,
}

impl InstanceRecord {
    /// A record is a tombstone once termination has been confirmed against
    /// the engine, not merely requested.
    pub fn is_tombstone(&self) -> bool {
        self.desired_state == DesiredState::Terminated
            && self.observed_state == ObservedState::Terminated
    }
}

/// Engine-level container status as reported by inspect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    Created,
    Running,
    Paused,
    Restarting,
    Removing,
    Exited,
    Dead,
}

/// Everything an engine needs to create the container backing an instance.
#[derive(Debug, Clone, Default)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub env: Vec<String>,
    pub labels: Vec<(String, String)>,
    pub resources: ResourceHints,
}

/// One interactive exec stream into a running container. `input` feeds the
/// process stdin; `output` yields interleaved stdout/stderr chunks and ends
/// when the process exits or the stream is torn down.
pub struct ExecStream {
    pub input: Pin<Box<dyn AsyncWrite + Send>>,
    pub output: BoxStream<'static, std::io::Result<Vec<u8>>>,
}

impl std::fmt::Debug for ExecStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecStream").finish_non_exhaustive()
    }
}

/// Capability set over a container engine. Stateless per call and safe for
/// concurrent use across instances; the sole source of runtime truth.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn create(&self, spec: &ContainerSpec) -> RuntimeResult<String>;
    async fn start(&self, runtime_ref: &str) -> RuntimeResult<()>;
    async fn stop(&self, runtime_ref: &str, timeout_secs: i64) -> RuntimeResult<()>;
    async fn restart(&self, runtime_ref: &str, timeout_secs: i64) -> RuntimeResult<()>;
    async fn remove(&self, runtime_ref: &str, force: bool) -> RuntimeResult<()>;
    async fn inspect(&self, runtime_ref: &str) -> RuntimeResult<ContainerStatus>;
    async fn exec(&self, runtime_ref: &str, command: Vec<String>) -> RuntimeResult<ExecStream>;
    /// Liveness probe against the engine itself.
    async fn ping(&self) -> RuntimeResult<()>;
}

/// Label attached to every container this service creates, so externally
/// created containers are never mistaken for instance backings.
pub const INSTANCE_LABEL: &str = "cloudsim.instance-id";

/// Generate an instance id in the `i-<12 hex>` form.
pub fn generate_instance_id() -> String {
    let raw = uuid::Uuid::new_v4().simple().to_string();
    format!("i-{}", &raw[..12])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instance_id_format() {
        let id = generate_instance_id();
        assert!(id.starts_with("i-"));
        assert_eq!(id.len(), 14);
        assert!(id[2..].chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_record_serialization_round_trip() {
        let record = InstanceRecord {
            id: generate_instance_id(),
            name: Some("web-1".to_string()),
            image: "alpine:latest".to_string(),
            resources: ResourceHints {
                cpu_cores: Some(1),
                memory_mb: Some(512),
            },
            desired_state: DesiredState::Running,
            observed_state: ObservedState::Running,
            runtime_ref: Some("abc123".to_string()),
            created_at: Utc::now(),
            last_reconciled_at: None,
            state_reason: None,
            version: 3,
        };
        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("\"desired_state\":\"running\""));
        let back: InstanceRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn test_tombstone_requires_confirmed_removal() {
        let mut record = InstanceRecord {
            id: "i-000000000000".to_string(),
            name: None,
            image: "alpine:latest".to_string(),
            resources: ResourceHints::default(),
            desired_state: DesiredState::Terminated,
            observed_state: ObservedState::Unknown,
            runtime_ref: Some("abc".to_string()),
            created_at: Utc::now(),
            last_reconciled_at: None,
            state_reason: None,
            version: 1,
        };
        assert!(!record.is_tombstone());
        record.observed_state = ObservedState::Terminated;
        assert!(record.is_tombstone());
    }
}
