//! Reconciliation: refresh observed state from the engine and report
//! divergence from desired state. Observe, never silently act: a drifted
//! instance is surfaced, not restarted, so crash loops and resource
//! exhaustion stay visible to the learner.

use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tracing::{info, instrument, warn};

use cloudsim_common::{
    ContainerStatus, DesiredState, InstanceRecord, ObservedState, RuntimeError,
};

use crate::manager::LifecycleManager;
use crate::{Error, Result};

/// Outcome of reconciling one instance.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReconcileOutcome {
    /// Runtime truth matches what the desired state implies.
    InSync,
    /// Observed state diverges from desired state. Reported, never
    /// auto-corrected; re-asserting intent is a separate explicit call.
    Drift {
        expected: ObservedState,
        actual: ObservedState,
    },
    /// The engine was unreachable; the record (including
    /// `last_reconciled_at`) was left untouched. Safe to retry with backoff.
    EngineUnreachable,
    /// The engine answered but the inspect failed; nothing was learned.
    Failed { message: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct ReconcileReport {
    pub record: InstanceRecord,
    pub outcome: ReconcileOutcome,
}

/// The observed state a desired state implies when everything is healthy.
fn expected_observed(desired: DesiredState) -> ObservedState {
    match desired {
        DesiredState::Requested => ObservedState::Creating,
        DesiredState::Running => ObservedState::Running,
        DesiredState::Stopped => ObservedState::Stopped,
        DesiredState::Terminated => ObservedState::Terminated,
    }
}

/// Map an engine status to an observed state, in the light of intent: an
/// exited container we asked to stop is Stopped; one we wanted running has
/// Exited out-of-band.
fn observed_from_status(status: ContainerStatus, desired: DesiredState) -> ObservedState {
    match status {
        ContainerStatus::Created => ObservedState::Creating,
        ContainerStatus::Running | ContainerStatus::Restarting => ObservedState::Running,
        // A paused container satisfies no intent; always drift.
        ContainerStatus::Paused => ObservedState::Paused,
        ContainerStatus::Removing => ObservedState::Missing,
        ContainerStatus::Exited | ContainerStatus::Dead => {
            if desired == DesiredState::Stopped {
                ObservedState::Stopped
            } else {
                ObservedState::Exited
            }
        }
    }
}

impl LifecycleManager {
    /// Reconcile one instance under its lifecycle lock, so a record is never
    /// observed mid-transition.
    #[instrument(skip(self))]
    pub async fn reconcile(&self, id: &str) -> Result<ReconcileReport> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        let mut record = self.store.get(id).await.map_err(Error::from)?;

        // Terminal records are read-only; there is nothing to reconcile.
        if record.desired_state == DesiredState::Terminated {
            return Ok(ReconcileReport {
                record,
                outcome: ReconcileOutcome::InSync,
            });
        }

        let expected = expected_observed(record.desired_state);

        let Some(runtime_ref) = record.runtime_ref.clone() else {
            // No container was ever bound. For a half-created record that is
            // simply where creation left off; for Running/Stopped intent it
            // is drift requiring explicit user action.
            record.last_reconciled_at = Some(Utc::now());
            let stored_version = record.version;
            let record = self.store.put(record, stored_version).await?;
            let outcome = match record.desired_state {
                DesiredState::Requested => ReconcileOutcome::InSync,
                _ => ReconcileOutcome::Drift {
                    expected,
                    actual: record.observed_state,
                },
            };
            return Ok(ReconcileReport { record, outcome });
        };

        match self.bounded(self.runtime.inspect(&runtime_ref)).await {
            Ok(status) => {
                let actual = observed_from_status(status, record.desired_state);
                let drifted = actual != expected;
                record.observed_state = actual;
                record.last_reconciled_at = Some(Utc::now());
                if drifted {
                    record.state_reason =
                        Some(format!("drift: expected {expected}, observed {actual}"));
                    warn!(id = %record.id, %expected, %actual, "drift detected");
                } else {
                    record.state_reason = None;
                }
                let stored_version = record.version;
                let record = self.store.put(record, stored_version).await?;
                let outcome = if drifted {
                    ReconcileOutcome::Drift { expected, actual }
                } else {
                    ReconcileOutcome::InSync
                };
                Ok(ReconcileReport { record, outcome })
            }
            Err(RuntimeError::RefNotFound(_)) => {
                // The container vanished behind our back. Never auto-delete
                // the record; recreate or terminate is the user's call.
                record.observed_state = ObservedState::Missing;
                record.last_reconciled_at = Some(Utc::now());
                record.state_reason = Some("backing container no longer exists".to_string());
                warn!(id = %record.id, "backing container missing");
                let stored_version = record.version;
                let record = self.store.put(record, stored_version).await?;
                Ok(ReconcileReport {
                    record,
                    outcome: ReconcileOutcome::Drift {
                        expected,
                        actual: ObservedState::Missing,
                    },
                })
            }
            Err(RuntimeError::Unavailable(msg)) => {
                // Nothing was learned; leave the record byte-for-byte alone.
                warn!(id = %record.id, error = %msg, "engine unreachable during reconcile");
                Ok(ReconcileReport {
                    record,
                    outcome: ReconcileOutcome::EngineUnreachable,
                })
            }
            Err(RuntimeError::OperationFailed(msg)) => Ok(ReconcileReport {
                record,
                outcome: ReconcileOutcome::Failed { message: msg },
            }),
        }
    }

    /// Reconcile every non-terminal instance. Individual failures become
    /// per-instance outcomes; the call as a whole never fails the caller.
    #[instrument(skip(self))]
    pub async fn reconcile_all(&self) -> Result<Vec<ReconcileReport>> {
        let records = self.store.list().await?;
        let mut reports = Vec::new();
        for record in records {
            if record.desired_state == DesiredState::Terminated {
                continue;
            }
            match self.reconcile(&record.id).await {
                Ok(report) => reports.push(report),
                Err(err) => reports.push(ReconcileReport {
                    record,
                    outcome: ReconcileOutcome::Failed {
                        message: err.to_string(),
                    },
                }),
            }
        }
        Ok(reports)
    }

    /// Startup reconciliation. Only an unreachable engine is retried, with
    /// bounded exponential backoff; every other outcome stands as reported.
    pub async fn reconcile_on_startup(&self) -> Result<Vec<ReconcileReport>> {
        const MAX_ATTEMPTS: u32 = 5;
        let mut delay = Duration::from_millis(500);

        for attempt in 1..=MAX_ATTEMPTS {
            let reports = self.reconcile_all().await?;
            let all_unreachable = !reports.is_empty()
                && reports
                    .iter()
                    .all(|r| r.outcome == ReconcileOutcome::EngineUnreachable);
            if !all_unreachable || attempt == MAX_ATTEMPTS {
                info!(
                    instances = reports.len(),
                    attempt, "startup reconciliation finished"
                );
                return Ok(reports);
            }
            warn!(attempt, delay_ms = delay.as_millis() as u64, "engine unreachable, backing off");
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(Duration::from_secs(8));
        }
        unreachable!("loop returns on the final attempt")
    }
}
