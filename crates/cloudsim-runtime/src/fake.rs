//! In-memory container engine with controllable latency and failure modes.
//!
//! Lifecycle, reconciliation, and gateway tests run against this engine so
//! they can simulate out-of-band container exits, vanished containers, and
//! an unreachable engine without a real Docker daemon.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;

use cloudsim_common::{
    ContainerRuntime, ContainerSpec, ContainerStatus, ExecStream, RuntimeError, RuntimeResult,
};

#[derive(Debug, Clone)]
pub struct FakeContainer {
    pub name: String,
    pub image: String,
    pub status: ContainerStatus,
}

#[derive(Default)]
pub struct FakeEngine {
    containers: Mutex<HashMap<String, FakeContainer>>,
    latency: Mutex<Duration>,
    unavailable: AtomicBool,
    fail_next: Mutex<HashMap<String, VecDeque<RuntimeError>>>,
    calls: Mutex<Vec<String>>,
    counter: AtomicU64,
}

impl FakeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay applied to every engine call, for exercising lock serialization.
    pub async fn set_latency(&self, latency: Duration) {
        *self.latency.lock().await = latency;
    }

    /// Simulate the engine socket going away entirely.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Queue a failure for the next call of the named operation
    /// (`create`, `start`, `stop`, `restart`, `remove`, `inspect`, `exec`).
    pub async fn fail_once(&self, op: &str, err: RuntimeError) {
        self.fail_next
            .lock()
            .await
            .entry(op.to_string())
            .or_default()
            .push_back(err);
    }

    /// Simulate an out-of-band process exit inside the container.
    pub async fn kill(&self, runtime_ref: &str) {
        if let Some(c) = self.containers.lock().await.get_mut(runtime_ref) {
            c.status = ContainerStatus::Exited;
        }
    }

    /// Simulate the container being paused behind the manager's back.
    pub async fn pause(&self, runtime_ref: &str) {
        if let Some(c) = self.containers.lock().await.get_mut(runtime_ref) {
            c.status = ContainerStatus::Paused;
        }
    }

    /// Simulate the container being removed behind the manager's back.
    pub async fn vanish(&self, runtime_ref: &str) {
        self.containers.lock().await.remove(runtime_ref);
    }

    pub async fn status_of(&self, runtime_ref: &str) -> Option<ContainerStatus> {
        self.containers
            .lock()
            .await
            .get(runtime_ref)
            .map(|c| c.status)
    }

    pub async fn container_count(&self) -> usize {
        self.containers.lock().await.len()
    }

    pub async fn calls(&self) -> Vec<String> {
        self.calls.lock().await.clone()
    }

    async fn begin(&self, op: &str, runtime_ref: &str) -> RuntimeResult<()> {
        let latency = *self.latency.lock().await;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        self.calls.lock().await.push(format!("{op}:{runtime_ref}"));
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(RuntimeError::Unavailable(
                "fake engine marked unavailable".to_string(),
            ));
        }
        if let Some(queue) = self.fail_next.lock().await.get_mut(op) {
            if let Some(err) = queue.pop_front() {
                return Err(err);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ContainerRuntime for FakeEngine {
    async fn create(&self, spec: &ContainerSpec) -> RuntimeResult<String> {
        self.begin("create", &spec.name).await?;
        if spec.image.is_empty() {
            return Err(RuntimeError::OperationFailed(
                "no such image: ''".to_string(),
            ));
        }
        let id = format!("ctr-{:08x}", self.counter.fetch_add(1, Ordering::SeqCst));
        self.containers.lock().await.insert(
            id.clone(),
            FakeContainer {
                name: spec.name.clone(),
                image: spec.image.clone(),
                status: ContainerStatus::Created,
            },
        );
        Ok(id)
    }

    async fn start(&self, runtime_ref: &str) -> RuntimeResult<()> {
        self.begin("start", runtime_ref).await?;
        let mut containers = self.containers.lock().await;
        let container = containers
            .get_mut(runtime_ref)
            .ok_or_else(|| RuntimeError::RefNotFound(runtime_ref.to_string()))?;
        container.status = ContainerStatus::Running;
        Ok(())
    }

    async fn stop(&self, runtime_ref: &str, _timeout_secs: i64) -> RuntimeResult<()> {
        self.begin("stop", runtime_ref).await?;
        let mut containers = self.containers.lock().await;
        let container = containers
            .get_mut(runtime_ref)
            .ok_or_else(|| RuntimeError::RefNotFound(runtime_ref.to_string()))?;
        container.status = ContainerStatus::Exited;
        Ok(())
    }

    async fn restart(&self, runtime_ref: &str, _timeout_secs: i64) -> RuntimeResult<()> {
        self.begin("restart", runtime_ref).await?;
        let mut containers = self.containers.lock().await;
        let container = containers
            .get_mut(runtime_ref)
            .ok_or_else(|| RuntimeError::RefNotFound(runtime_ref.to_string()))?;
        container.status = ContainerStatus::Running;
        Ok(())
    }

    async fn remove(&self, runtime_ref: &str, force: bool) -> RuntimeResult<()> {
        self.begin("remove", runtime_ref).await?;
        let mut containers = self.containers.lock().await;
        let container = containers
            .get(runtime_ref)
            .ok_or_else(|| RuntimeError::RefNotFound(runtime_ref.to_string()))?;
        if container.status == ContainerStatus::Running && !force {
            return Err(RuntimeError::OperationFailed(
                "cannot remove a running container without force".to_string(),
            ));
        }
        containers.remove(runtime_ref);
        Ok(())
    }

    async fn inspect(&self, runtime_ref: &str) -> RuntimeResult<ContainerStatus> {
        self.begin("inspect", runtime_ref).await?;
        self.containers
            .lock()
            .await
            .get(runtime_ref)
            .map(|c| c.status)
            .ok_or_else(|| RuntimeError::RefNotFound(runtime_ref.to_string()))
    }

    async fn exec(&self, runtime_ref: &str, command: Vec<String>) -> RuntimeResult<ExecStream> {
        self.begin("exec", runtime_ref).await?;
        {
            let containers = self.containers.lock().await;
            let container = containers
                .get(runtime_ref)
                .ok_or_else(|| RuntimeError::RefNotFound(runtime_ref.to_string()))?;
            if container.status != ContainerStatus::Running {
                return Err(RuntimeError::OperationFailed(
                    "container is not running".to_string(),
                ));
            }
        }

        // Echo session: the command line is written once, then stdin is
        // mirrored back until the caller closes it.
        let (stdin_tx, mut stdin_rx) = tokio::io::duplex(4096);
        let (mut stdout_tx, stdout_rx) = tokio::io::duplex(4096);

        tokio::spawn(async move {
            let banner = format!("{}\n", command.join(" "));
            if stdout_tx.write_all(banner.as_bytes()).await.is_err() {
                return;
            }
            let mut buf = [0u8; 4096];
            loop {
                match stdin_rx.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if stdout_tx.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        let output = futures::stream::unfold(stdout_rx, |mut rx| async move {
            let mut buf = vec![0u8; 4096];
            match rx.read(&mut buf).await {
                Ok(0) => None,
                Ok(n) => {
                    buf.truncate(n);
                    Some((Ok(buf), rx))
                }
                Err(e) => Some((Err(e), rx)),
            }
        })
        .boxed();

        Ok(ExecStream {
            input: Box::pin(stdin_tx),
            output,
        })
    }

    async fn ping(&self) -> RuntimeResult<()> {
        self.begin("ping", "-").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    fn spec(name: &str) -> ContainerSpec {
        ContainerSpec {
            name: name.to_string(),
            image: "alpine:latest".to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_create_start_stop_remove_cycle() {
        let engine = FakeEngine::new();
        let id = engine.create(&spec("c1")).await.unwrap();
        assert_eq!(engine.status_of(&id).await, Some(ContainerStatus::Created));

        engine.start(&id).await.unwrap();
        assert_eq!(engine.inspect(&id).await.unwrap(), ContainerStatus::Running);

        engine.stop(&id, 10).await.unwrap();
        assert_eq!(engine.inspect(&id).await.unwrap(), ContainerStatus::Exited);

        engine.remove(&id, false).await.unwrap();
        assert!(matches!(
            engine.inspect(&id).await,
            Err(RuntimeError::RefNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_queued_failure_applies_once() {
        let engine = FakeEngine::new();
        let id = engine.create(&spec("c1")).await.unwrap();
        engine
            .fail_once("start", RuntimeError::OperationFailed("boom".to_string()))
            .await;

        assert!(engine.start(&id).await.is_err());
        assert!(engine.start(&id).await.is_ok());
    }

    #[tokio::test]
    async fn test_exec_echoes_stdin() {
        let engine = FakeEngine::new();
        let id = engine.create(&spec("c1")).await.unwrap();
        engine.start(&id).await.unwrap();

        let mut stream = engine
            .exec(&id, vec!["/bin/sh".to_string()])
            .await
            .unwrap();
        stream.input.write_all(b"hello\n").await.unwrap();
        stream.input.shutdown().await.unwrap();

        let mut collected = Vec::new();
        while let Some(chunk) = stream.output.next().await {
            collected.extend(chunk.unwrap());
        }
        let text = String::from_utf8(collected).unwrap();
        assert!(text.contains("/bin/sh"));
        assert!(text.contains("hello"));
    }

    #[tokio::test]
    async fn test_exec_requires_running_container() {
        let engine = FakeEngine::new();
        let id = engine.create(&spec("c1")).await.unwrap();
        let result = engine.exec(&id, vec!["sh".to_string()]).await;
        assert!(matches!(result, Err(RuntimeError::OperationFailed(_))));
    }
}
