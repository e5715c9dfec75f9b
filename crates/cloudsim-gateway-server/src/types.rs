//! Wire types for the HTTP facade.

use serde::{Deserialize, Serialize};

use cloudsim_common::{DesiredState, InstanceRecord, ObservedState, ResourceHints};
use cloudsim_orchestrator::manager::CreateParams;

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateInstanceRequest {
    pub image: String,
    pub name: Option<String>,
    pub cpu_cores: Option<u32>,
    pub memory_mb: Option<u32>,
}

impl From<CreateInstanceRequest> for CreateParams {
    fn from(req: CreateInstanceRequest) -> Self {
        CreateParams {
            image: req.image,
            name: req.name,
            resources: ResourceHints {
                cpu_cores: req.cpu_cores,
                memory_mb: req.memory_mb,
            },
        }
    }
}

/// One instance as presented over the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceView {
    pub id: String,
    pub name: Option<String>,
    pub image: String,
    pub desired_state: DesiredState,
    pub observed_state: ObservedState,
    pub runtime_ref: Option<String>,
    pub created_at: String,
    pub last_reconciled_at: Option<String>,
    pub state_reason: Option<String>,
    pub cpu_cores: Option<u32>,
    pub memory_mb: Option<u32>,
    pub version: u64,
}

impl From<InstanceRecord> for InstanceView {
    fn from(record: InstanceRecord) -> Self {
        Self {
            id: record.id,
            name: record.name,
            image: record.image,
            desired_state: record.desired_state,
            observed_state: record.observed_state,
            runtime_ref: record.runtime_ref,
            created_at: record.created_at.to_rfc3339(),
            last_reconciled_at: record.last_reconciled_at.map(|t| t.to_rfc3339()),
            state_reason: record.state_reason,
            cpu_cores: record.resources.cpu_cores,
            memory_mb: record.resources.memory_mb,
            version: record.version,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ExecRequest {
    pub command: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ExecResponse {
    pub output: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}
