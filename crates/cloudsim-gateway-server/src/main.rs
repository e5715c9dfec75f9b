use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use cloudsim_common::ContainerRuntime;
use cloudsim_gateway_server::{create_app, AppState};
use cloudsim_orchestrator::{
    ExecGateway, InstanceStore, JsonFileStore, LifecycleManager, ManagerConfig,
};
use cloudsim_runtime::DockerRuntime;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,cloudsim_gateway_server=debug".into()),
        )
        .init();

    let listen_addr: SocketAddr = env_or("CLOUDSIM_LISTEN_ADDR", "0.0.0.0:8080").parse()?;
    let data_file = PathBuf::from(env_or("CLOUDSIM_DATA_FILE", "cloudsim-instances.json"));
    let config = ManagerConfig {
        op_timeout: Duration::from_secs(env_or("CLOUDSIM_OP_TIMEOUT_SECS", "30").parse()?),
        stop_timeout_secs: env_or("CLOUDSIM_STOP_TIMEOUT_SECS", "10").parse()?,
    };

    let runtime: Arc<dyn ContainerRuntime> = Arc::new(DockerRuntime::from_local_defaults()?);
    let store: Arc<dyn InstanceStore> = Arc::new(JsonFileStore::open(&data_file).await?);
    let gateway = Arc::new(ExecGateway::new(
        runtime.clone(),
        store.clone(),
        config.op_timeout,
    ));
    let manager = Arc::new(LifecycleManager::new(
        runtime.clone(),
        store,
        gateway.clone(),
        config,
    ));

    // Refresh observed state for every surviving record before serving.
    let reports = manager.reconcile_on_startup().await?;
    let drifted = reports
        .iter()
        .filter(|r| !matches!(r.outcome, cloudsim_orchestrator::ReconcileOutcome::InSync))
        .count();
    if drifted > 0 {
        warn!(instances = reports.len(), drifted, "startup reconciliation found divergence");
    } else {
        info!(instances = reports.len(), "startup reconciliation clean");
    }

    let app = create_app(AppState {
        manager,
        gateway,
        runtime,
    });

    info!(%listen_addr, data_file = %data_file.display(), "gateway listening");
    let listener = tokio::net::TcpListener::bind(listen_addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}
