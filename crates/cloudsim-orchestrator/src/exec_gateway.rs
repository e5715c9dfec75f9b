//! Exec gateway: interactive byte streams into running containers.
//!
//! Policy (explicit, not incidental): at most one active session per
//! instance. A second `open_session` on the same instance is rejected with
//! `SessionAlreadyOpen`; attaching to an existing stream is not supported.
//! Sessions never hold the per-instance lifecycle lock; only transitions
//! take it. The lifecycle manager force-closes the session whenever the
//! backing container stops, so no exec stream outlives its container.

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::stream::BoxStream;
use futures::StreamExt;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use cloudsim_common::{ContainerRuntime, DesiredState, ObservedState};

use crate::store::InstanceStore;
use crate::{Error, Result};

/// Cap on collected one-shot command output.
const MAX_ONESHOT_OUTPUT: usize = 1024 * 1024;

const DEFAULT_SHELL: &str = "/bin/sh";

struct SessionHandle {
    session_id: String,
    close_tx: watch::Sender<bool>,
}

pub struct ExecGateway {
    runtime: Arc<dyn ContainerRuntime>,
    store: Arc<dyn InstanceStore>,
    sessions: Arc<DashMap<String, SessionHandle>>,
    /// Upper bound on the exec setup call, matching the lifecycle manager's
    /// bound on transitions. Established streams are not subject to it.
    op_timeout: Duration,
}

impl ExecGateway {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        store: Arc<dyn InstanceStore>,
        op_timeout: Duration,
    ) -> Self {
        Self {
            runtime,
            store,
            sessions: Arc::new(DashMap::new()),
            op_timeout,
        }
    }

    /// Open an interactive session into a running instance. Fails with
    /// `InstanceNotRunning` unless the last observed state is Running, and
    /// with `SessionAlreadyOpen` if a session is already active.
    #[instrument(skip(self, command))]
    pub async fn open_session(
        &self,
        instance_id: &str,
        command: Option<Vec<String>>,
    ) -> Result<ExecSession> {
        let record = self.store.get(instance_id).await.map_err(Error::from)?;
        if record.desired_state == DesiredState::Terminated {
            return Err(Error::NotFound(format!("{instance_id} is terminated")));
        }
        if record.observed_state != ObservedState::Running {
            return Err(Error::InstanceNotRunning(format!(
                "{instance_id} is {}",
                record.observed_state
            )));
        }
        let Some(runtime_ref) = record.runtime_ref else {
            return Err(Error::InstanceNotRunning(format!(
                "{instance_id} has no backing container"
            )));
        };

        // Reserve the slot before touching the engine so two concurrent
        // opens cannot both attach.
        let session_id = Uuid::new_v4().to_string();
        let (close_tx, close_rx) = watch::channel(false);
        match self.sessions.entry(instance_id.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(Error::SessionAlreadyOpen(instance_id.to_string()));
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(SessionHandle {
                    session_id: session_id.clone(),
                    close_tx,
                });
            }
        }

        let command = command.unwrap_or_else(|| vec![DEFAULT_SHELL.to_string()]);
        let stream = match tokio::time::timeout(
            self.op_timeout,
            self.runtime.exec(&runtime_ref, command),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) => {
                self.sessions
                    .remove_if(instance_id, |_, h| h.session_id == session_id);
                return Err(Error::from(err));
            }
            Err(_) => {
                self.sessions
                    .remove_if(instance_id, |_, h| h.session_id == session_id);
                return Err(Error::RuntimeFailed(format!(
                    "runtime call exceeded {}s",
                    self.op_timeout.as_secs()
                )));
            }
        };

        info!(%instance_id, %session_id, "exec session opened");
        Ok(ExecSession {
            instance_id: instance_id.to_string(),
            session_id,
            input: stream.input,
            output: stream.output,
            closed: close_rx,
            sessions: self.sessions.clone(),
        })
    }

    /// Run a single command, collect its output, release the session. Goes
    /// through the same single-session policy as interactive opens.
    #[instrument(skip(self, command))]
    pub async fn run_command(&self, instance_id: &str, command: Vec<String>) -> Result<Vec<u8>> {
        let mut session = self.open_session(instance_id, Some(command)).await?;
        // One-shot: no stdin.
        session.close_stdin().await;

        let mut collected = Vec::new();
        while let Some(chunk) = session.recv().await {
            let chunk = chunk.map_err(|e| Error::RuntimeFailed(e.to_string()))?;
            collected.extend(chunk);
            if collected.len() >= MAX_ONESHOT_OUTPUT {
                collected.truncate(MAX_ONESHOT_OUTPUT);
                break;
            }
        }
        session.close().await;
        Ok(collected)
    }

    /// Force-close the active session for an instance, releasing the
    /// underlying runtime stream. Called by the lifecycle manager on
    /// stop/reboot/terminate and on caller disconnect.
    pub fn close_for_instance(&self, instance_id: &str) {
        if let Some((_, handle)) = self.sessions.remove(instance_id) {
            let _ = handle.close_tx.send(true);
            debug!(%instance_id, "exec session force-closed");
        }
    }

    pub fn has_session(&self, instance_id: &str) -> bool {
        self.sessions.contains_key(instance_id)
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.len()
    }
}

/// One caller-held interactive session. Dropping it releases the registry
/// slot; the runtime stream is dropped with it.
pub struct ExecSession {
    instance_id: String,
    session_id: String,
    input: Pin<Box<dyn AsyncWrite + Send>>,
    output: BoxStream<'static, std::io::Result<Vec<u8>>>,
    closed: watch::Receiver<bool>,
    sessions: Arc<DashMap<String, SessionHandle>>,
}

impl std::fmt::Debug for ExecSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecSession")
            .field("instance_id", &self.instance_id)
            .field("session_id", &self.session_id)
            .finish_non_exhaustive()
    }
}

impl ExecSession {
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Write bytes to the container's stdin.
    pub async fn send(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        if *self.closed.borrow() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "session was closed",
            ));
        }
        self.input.write_all(bytes).await?;
        self.input.flush().await
    }

    /// Next output chunk, or `None` once the process exits or the session
    /// is torn down (either side).
    pub async fn recv(&mut self) -> Option<std::io::Result<Vec<u8>>> {
        loop {
            tokio::select! {
                changed = self.closed.changed() => {
                    if changed.is_err() || *self.closed.borrow() {
                        return None;
                    }
                }
                chunk = self.output.next() => return chunk,
            }
        }
    }

    async fn close_stdin(&mut self) {
        let _ = self.input.shutdown().await;
    }

    /// Caller-initiated teardown: closes stdin and releases the slot.
    pub async fn close(mut self) {
        self.close_stdin().await;
        // Drop releases the registry entry.
    }
}

impl Drop for ExecSession {
    fn drop(&mut self) {
        // Release the slot only if it is still ours; a force-close may have
        // already handed it to a newer session.
        self.sessions
            .remove_if(&self.instance_id, |_, h| h.session_id == self.session_id);
        debug!(instance_id = %self.instance_id, "exec session dropped");
    }
}
