use std::sync::Arc;
use std::time::Duration;

use cloudsim_common::{ContainerRuntime, ResourceHints};
use cloudsim_orchestrator::manager::CreateParams;
use cloudsim_orchestrator::{
    ExecGateway, InstanceStore, JsonFileStore, LifecycleManager, ManagerConfig,
};
use cloudsim_runtime::FakeEngine;

pub struct Harness {
    pub engine: Arc<FakeEngine>,
    pub gateway: Arc<ExecGateway>,
    pub manager: Arc<LifecycleManager>,
    _dir: tempfile::TempDir,
}

pub async fn harness() -> Harness {
    harness_with(ManagerConfig {
        op_timeout: Duration::from_secs(5),
        stop_timeout_secs: 1,
    })
    .await
}

pub async fn harness_with(config: ManagerConfig) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn InstanceStore> = Arc::new(
        JsonFileStore::open(dir.path().join("instances.json"))
            .await
            .unwrap(),
    );
    let engine = Arc::new(FakeEngine::new());
    let runtime: Arc<dyn ContainerRuntime> = engine.clone();
    let gateway = Arc::new(ExecGateway::new(
        runtime.clone(),
        store.clone(),
        config.op_timeout,
    ));
    let manager = Arc::new(LifecycleManager::new(
        runtime,
        store,
        gateway.clone(),
        config,
    ));
    Harness {
        engine,
        gateway,
        manager,
        _dir: dir,
    }
}

pub fn params(image: &str) -> CreateParams {
    CreateParams {
        image: image.to_string(),
        name: None,
        resources: ResourceHints::default(),
    }
}
