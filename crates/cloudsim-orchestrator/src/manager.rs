//! Lifecycle manager: the per-instance state machine.
//!
//! Every transition follows the same protocol: acquire the per-instance
//! lock, persist the desired state (making user intent durable) before any
//! runtime call, perform the bounded runtime call, then persist the
//! best-known observed state whether the call succeeded or failed. A failed
//! call never rolls back desired state; retrying the same operation after
//! the cause is fixed converges without manual cleanup.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};

use cloudsim_common::{
    generate_instance_id, ContainerRuntime, ContainerSpec, DesiredState, InstanceRecord,
    ObservedState, ResourceHints, RuntimeError, RuntimeResult, INSTANCE_LABEL,
};

use crate::exec_gateway::ExecGateway;
use crate::store::InstanceStore;
use crate::{Error, Result};

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Upper bound on every runtime call. An elapsed timeout is surfaced as
    /// `RuntimeOperationFailed`, never as success; the caller re-queries via
    /// reconciliation to learn the true outcome.
    pub op_timeout: Duration,
    /// Grace period passed to the engine on stop/restart.
    pub stop_timeout_secs: i64,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            op_timeout: Duration::from_secs(30),
            stop_timeout_secs: 10,
        }
    }
}

/// Parameters accepted by `create`.
#[derive(Debug, Clone)]
pub struct CreateParams {
    pub image: String,
    pub name: Option<String>,
    pub resources: ResourceHints,
}

pub struct LifecycleManager {
    pub(crate) runtime: Arc<dyn ContainerRuntime>,
    pub(crate) store: Arc<dyn InstanceStore>,
    gateway: Arc<ExecGateway>,
    locks: DashMap<String, Arc<Mutex<()>>>,
    pub(crate) config: ManagerConfig,
}

impl LifecycleManager {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        store: Arc<dyn InstanceStore>,
        gateway: Arc<ExecGateway>,
        config: ManagerConfig,
    ) -> Self {
        Self {
            runtime,
            store,
            gateway,
            locks: DashMap::new(),
            config,
        }
    }

    /// Per-instance mutual exclusion: one in-flight lifecycle operation per
    /// id, reconciliation included.
    pub(crate) fn lock_for(&self, id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    pub(crate) async fn bounded<T, F>(&self, fut: F) -> RuntimeResult<T>
    where
        F: Future<Output = RuntimeResult<T>>,
    {
        match tokio::time::timeout(self.config.op_timeout, fut).await {
            Ok(res) => res,
            Err(_) => Err(RuntimeError::OperationFailed(format!(
                "runtime call exceeded {}s",
                self.config.op_timeout.as_secs()
            ))),
        }
    }

    /// Persist the best-known observed state after a failed runtime call,
    /// then surface the original error. Desired state is what the user
    /// wants; it is never rolled back here.
    async fn record_failure(
        &self,
        mut record: InstanceRecord,
        observed: ObservedState,
        err: RuntimeError,
    ) -> Error {
        record.observed_state = observed;
        record.state_reason = Some(err.to_string());
        let expected = record.version;
        if let Err(store_err) = self.store.put(record, expected).await {
            // The runtime error is the story the caller needs; the store
            // failure is logged, not substituted.
            warn!(error = %store_err, "failed to persist observed state after runtime error");
        }
        Error::from(err)
    }

    #[instrument(skip(self, params), fields(image = %params.image))]
    pub async fn create(&self, params: CreateParams) -> Result<InstanceRecord> {
        validate_params(&params)?;

        let record = InstanceRecord {
            id: generate_instance_id(),
            name: params.name,
            image: params.image,
            resources: params.resources,
            desired_state: DesiredState::Requested,
            observed_state: ObservedState::Unknown,
            runtime_ref: None,
            created_at: Utc::now(),
            last_reconciled_at: None,
            state_reason: None,
            version: 0,
        };
        // Take the lock before the record becomes visible, so a concurrent
        // reconcile sweep cannot write between the initial put and
        // provisioning.
        let lock = self.lock_for(&record.id);
        let _guard = lock.lock().await;

        // Intent is durable before the engine is ever touched.
        let record = self.store.put(record, 0).await?;
        info!(id = %record.id, "instance record created");
        self.provision(record).await
    }

    /// Create and start the backing container for a record that has none.
    /// Also the retry path after a failed creation.
    async fn provision(&self, mut record: InstanceRecord) -> Result<InstanceRecord> {
        let spec = ContainerSpec {
            name: format!("cloudsim-{}", record.id),
            image: record.image.clone(),
            env: Vec::new(),
            labels: vec![(INSTANCE_LABEL.to_string(), record.id.clone())],
            resources: record.resources,
        };

        let runtime_ref = match self.bounded(self.runtime.create(&spec)).await {
            Ok(r) => r,
            // No container came into being; the creation stays retryable.
            Err(err) => {
                return Err(self
                    .record_failure(record, ObservedState::Missing, err)
                    .await)
            }
        };

        record.runtime_ref = Some(runtime_ref.clone());
        record.observed_state = ObservedState::Creating;
        record.desired_state = DesiredState::Running;
        let expected = record.version;
        record = self.store.put(record, expected).await?;

        match self.bounded(self.runtime.start(&runtime_ref)).await {
            Ok(()) => {
                record.observed_state = ObservedState::Running;
                record.state_reason = None;
                let expected = record.version;
                record = self.store.put(record, expected).await?;
                info!(id = %record.id, runtime_ref = %runtime_ref, "instance running");
                Ok(record)
            }
            Err(err) => Err(self.record_failure(record, failure_observed(&err), err).await),
        }
    }

    #[instrument(skip(self))]
    pub async fn start(&self, id: &str) -> Result<InstanceRecord> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        let mut record = self.store.get(id).await.map_err(Error::from)?;
        ensure_not_terminal(&record)?;

        let Some(runtime_ref) = record.runtime_ref.clone() else {
            // Creation never bound a container; re-run provisioning under
            // the already-recorded intent.
            return self.provision(record).await;
        };

        if record.desired_state == DesiredState::Running
            && record.observed_state == ObservedState::Running
        {
            return Err(Error::InstanceNotStopped(id.to_string()));
        }

        record.desired_state = DesiredState::Running;
        let expected = record.version;
        record = self.store.put(record, expected).await?;

        match self.bounded(self.runtime.start(&runtime_ref)).await {
            Ok(()) => {
                record.observed_state = ObservedState::Running;
                record.state_reason = None;
                let expected = record.version;
                record = self.store.put(record, expected).await?;
                info!(id = %record.id, "instance started");
                Ok(record)
            }
            Err(err) => Err(self.record_failure(record, failure_observed(&err), err).await),
        }
    }

    #[instrument(skip(self))]
    pub async fn stop(&self, id: &str) -> Result<InstanceRecord> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        let mut record = self.store.get(id).await.map_err(Error::from)?;
        ensure_not_terminal(&record)?;

        if record.desired_state != DesiredState::Running {
            return Err(Error::InstanceNotRunning(id.to_string()));
        }
        let Some(runtime_ref) = record.runtime_ref.clone() else {
            return Err(Error::InstanceNotRunning(format!(
                "{id} has no backing container"
            )));
        };

        record.desired_state = DesiredState::Stopped;
        let expected = record.version;
        record = self.store.put(record, expected).await?;

        match self
            .bounded(self.runtime.stop(&runtime_ref, self.config.stop_timeout_secs))
            .await
        {
            Ok(()) => {
                record.observed_state = ObservedState::Stopped;
                record.state_reason = None;
                let expected = record.version;
                record = self.store.put(record, expected).await?;
                // The container is down; any exec stream into it is dead.
                self.gateway.close_for_instance(id);
                info!(id = %record.id, "instance stopped");
                Ok(record)
            }
            Err(err) => Err(self.record_failure(record, failure_observed(&err), err).await),
        }
    }

    #[instrument(skip(self))]
    pub async fn reboot(&self, id: &str) -> Result<InstanceRecord> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        let mut record = self.store.get(id).await.map_err(Error::from)?;
        ensure_not_terminal(&record)?;

        let Some(runtime_ref) = record.runtime_ref.clone() else {
            return Err(Error::InstanceNotRunning(format!(
                "{id} has no backing container"
            )));
        };

        record.desired_state = DesiredState::Running;
        let expected = record.version;
        record = self.store.put(record, expected).await?;

        // An exec stream cannot survive the restart.
        self.gateway.close_for_instance(id);

        match self
            .bounded(
                self.runtime
                    .restart(&runtime_ref, self.config.stop_timeout_secs),
            )
            .await
        {
            Ok(()) => {
                record.observed_state = ObservedState::Running;
                record.state_reason = None;
                let expected = record.version;
                record = self.store.put(record, expected).await?;
                info!(id = %record.id, "instance rebooted");
                Ok(record)
            }
            Err(err) => Err(self.record_failure(record, failure_observed(&err), err).await),
        }
    }

    #[instrument(skip(self))]
    pub async fn terminate(&self, id: &str) -> Result<InstanceRecord> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        let mut record = self.store.get(id).await.map_err(Error::from)?;
        if record.is_tombstone() {
            return Err(Error::NotFound(format!("{id} is already terminated")));
        }

        // Terminal and irreversible the moment it is persisted; only the
        // removal confirmation below can still be retried.
        record.desired_state = DesiredState::Terminated;
        let expected = record.version;
        record = self.store.put(record, expected).await?;

        self.gateway.close_for_instance(id);

        if let Some(runtime_ref) = record.runtime_ref.clone() {
            match self.bounded(self.runtime.remove(&runtime_ref, true)).await {
                // A vanished container counts as removed.
                Ok(()) | Err(RuntimeError::RefNotFound(_)) => {}
                Err(err) => return Err(self.record_failure(record, failure_observed(&err), err).await),
            }
        }

        record.observed_state = ObservedState::Terminated;
        record.runtime_ref = None;
        record.state_reason = None;
        let expected = record.version;
        record = self.store.put(record, expected).await?;
        info!(id = %record.id, "instance terminated");
        Ok(record)
    }

    pub async fn get(&self, id: &str) -> Result<InstanceRecord> {
        Ok(self.store.get(id).await?)
    }

    pub async fn list(&self) -> Result<Vec<InstanceRecord>> {
        Ok(self.store.list().await?)
    }

    /// Remove a tombstone from the store, along with its lock entry; ids are
    /// never reused, so the mutex has no future waiters.
    pub async fn purge(&self, id: &str) -> Result<()> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;
        self.store.purge(id).await?;
        self.locks.remove(id);
        Ok(())
    }
}

/// The best observed state we can claim after a failed call: a missing
/// container is known missing; anything else leaves the truth unknown until
/// the next reconcile.
fn failure_observed(err: &RuntimeError) -> ObservedState {
    match err {
        RuntimeError::RefNotFound(_) => ObservedState::Missing,
        _ => ObservedState::Unknown,
    }
}

fn ensure_not_terminal(record: &InstanceRecord) -> Result<()> {
    if record.desired_state == DesiredState::Terminated {
        return Err(Error::NotFound(format!("{} is terminated", record.id)));
    }
    Ok(())
}

fn validate_params(params: &CreateParams) -> Result<()> {
    if params.image.trim().is_empty() {
        return Err(Error::Validation("image must not be empty".to_string()));
    }
    if params.image.contains(char::is_whitespace) {
        return Err(Error::Validation(format!(
            "image '{}' must not contain whitespace",
            params.image
        )));
    }
    if let Some(name) = &params.name {
        if name.len() > 128 {
            return Err(Error::Validation(
                "name must be at most 128 characters".to_string(),
            ));
        }
    }
    if let Some(cpu) = params.resources.cpu_cores {
        if !(1..=16).contains(&cpu) {
            return Err(Error::Validation(format!(
                "cpu_cores must be between 1 and 16, got {cpu}"
            )));
        }
    }
    if let Some(mem) = params.resources.memory_mb {
        if !(128..=65536).contains(&mem) {
            return Err(Error::Validation(format!(
                "memory_mb must be between 128 and 65536, got {mem}"
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::JsonFileStore;
    use cloudsim_runtime::FakeEngine;

    fn params(image: &str) -> CreateParams {
        CreateParams {
            image: image.to_string(),
            name: None,
            resources: ResourceHints::default(),
        }
    }

    async fn manager_with_fake_engine(dir: &tempfile::TempDir) -> LifecycleManager {
        let store: Arc<dyn InstanceStore> = Arc::new(
            JsonFileStore::open(dir.path().join("instances.json"))
                .await
                .unwrap(),
        );
        let runtime: Arc<dyn ContainerRuntime> = Arc::new(FakeEngine::new());
        let gateway = Arc::new(ExecGateway::new(
            runtime.clone(),
            store.clone(),
            Duration::from_secs(5),
        ));
        LifecycleManager::new(runtime, store, gateway, ManagerConfig::default())
    }

    #[tokio::test]
    async fn test_purge_drops_lock_entry() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_with_fake_engine(&dir).await;

        let record = manager.create(params("alpine:latest")).await.unwrap();
        assert_eq!(manager.locks.len(), 1);

        manager.terminate(&record.id).await.unwrap();
        manager.purge(&record.id).await.unwrap();
        assert!(manager.locks.is_empty());
    }

    #[test]
    fn test_validation_rejects_bad_input() {
        assert!(validate_params(&params("")).is_err());
        assert!(validate_params(&params("alpine latest")).is_err());
        assert!(validate_params(&params("alpine:latest")).is_ok());

        let mut p = params("alpine:latest");
        p.resources.cpu_cores = Some(0);
        assert!(validate_params(&p).is_err());
        p.resources.cpu_cores = Some(4);
        p.resources.memory_mb = Some(64);
        assert!(validate_params(&p).is_err());
        p.resources.memory_mb = Some(512);
        assert!(validate_params(&p).is_ok());
    }
}
