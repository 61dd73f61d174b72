//! Process manager: owns running trees and surfaces their outcome.

use super::{ProcessComponent, ProcessFailure, ProcessId, ProcessState, RunControl, RunSignal};
use crate::error::{Result, SyncError};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::Instrument;

/// Everything a finished tree hands back to its starter.
pub struct ProcessReport<C> {
    pub id: ProcessId,
    pub tree: Box<dyn ProcessComponent<C>>,
    pub context: C,
    pub outcome: Result<(), ProcessFailure>,
}

impl<C> ProcessReport<C> {
    pub fn state(&self) -> ProcessState {
        self.tree.state()
    }

    pub fn into_context(self) -> Result<C, ProcessFailure> {
        self.outcome.map(|()| self.context)
    }
}

impl<C> fmt::Debug for ProcessReport<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessReport")
            .field("id", &self.id)
            .field("tree", &self.tree.name())
            .field("state", &self.state())
            .field("outcome", &self.outcome)
            .finish()
    }
}

#[derive(Clone, Default)]
pub struct ProcessManager {
    next_id: Arc<AtomicU64>,
    running: Arc<Mutex<HashMap<ProcessId, Arc<RunControl>>>>,
}

impl ProcessManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start `tree` on the runtime with exclusive ownership of `ctx`.
    ///
    /// Fails with a precondition violation if the tree already ran.
    pub fn start<C>(&self, mut tree: Box<dyn ProcessComponent<C>>, mut ctx: C) -> Result<ProcessHandle<C>>
    where
        C: Send + 'static,
    {
        let state = tree.state();
        if state != ProcessState::Unstarted {
            return Err(SyncError::precondition(format!(
                "cannot start {}: already {state}",
                tree.name()
            )));
        }

        let id = ProcessId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let control = Arc::new(RunControl::new(id, tree.name()));
        self.running.lock().insert(id, control.clone());

        let running = self.running.clone();
        let task_control = control.clone();
        let span = control.span().clone();
        let join = tokio::spawn(
            async move {
                task_control.set_state(ProcessState::Running);
                tracing::info!("started");

                let mut outcome = tree.execute(&mut ctx, &task_control).await;
                if outcome.is_ok() && task_control.signal() == RunSignal::Cancel {
                    // Cancelled after the last step boundary: nothing may commit.
                    tracing::info!("cancelled after the last step, compensating");
                    let mut failure = ProcessFailure::new(SyncError::Cancelled, tree.name());
                    tree.rollback(&mut ctx, &task_control, &mut failure.rollback_failures)
                        .await;
                    outcome = Err(failure);
                }
                match &outcome {
                    Ok(()) => {
                        task_control.set_state(ProcessState::Succeeded);
                        tracing::info!("succeeded");
                    }
                    Err(failure) => {
                        task_control.set_state(ProcessState::Failed);
                        tracing::warn!(
                            step = %failure.step,
                            kind = failure.kind(),
                            rollback_failures = failure.rollback_failures.len(),
                            "failed: {}",
                            failure.error
                        );
                    }
                }

                running.lock().remove(&id);
                ProcessReport {
                    id,
                    tree,
                    context: ctx,
                    outcome,
                }
            }
            .instrument(span),
        );

        Ok(ProcessHandle {
            id,
            control,
            join,
        })
    }

    fn control(&self, id: ProcessId) -> Result<Arc<RunControl>> {
        self.running
            .lock()
            .get(&id)
            .cloned()
            .ok_or_else(|| SyncError::precondition(format!("process {id} is not running")))
    }

    pub fn pause(&self, id: ProcessId) -> Result<()> {
        self.control(id)?.pause()
    }

    pub fn resume(&self, id: ProcessId) -> Result<()> {
        self.control(id)?.resume()
    }

    pub fn cancel(&self, id: ProcessId) -> Result<()> {
        self.control(id)?.cancel()
    }

    pub fn state(&self, id: ProcessId) -> Option<ProcessState> {
        self.running.lock().get(&id).map(|c| c.state())
    }

    pub fn running(&self) -> Vec<ProcessId> {
        let mut ids: Vec<_> = self.running.lock().keys().copied().collect();
        ids.sort();
        ids
    }
}

/// Opaque handle on a started tree.
pub struct ProcessHandle<C> {
    id: ProcessId,
    control: Arc<RunControl>,
    join: JoinHandle<ProcessReport<C>>,
}

impl<C> ProcessHandle<C> {
    pub fn id(&self) -> ProcessId {
        self.id
    }

    pub fn state(&self) -> ProcessState {
        self.control.state()
    }

    pub fn state_changes(&self) -> watch::Receiver<ProcessState> {
        self.control.subscribe_state()
    }

    pub fn pause(&self) -> Result<()> {
        self.control.pause()
    }

    pub fn resume(&self) -> Result<()> {
        self.control.resume()
    }

    pub fn cancel(&self) -> Result<()> {
        self.control.cancel()
    }

    pub async fn join(self) -> Result<ProcessReport<C>> {
        self.join
            .await
            .map_err(|e| SyncError::step(format!("process {} aborted: {e}", self.id)))
    }

    /// Bounded wait for the outermost driver.
    ///
    /// On expiry the tree is cancelled and this keeps waiting until its
    /// compensation has finished, so the returned report describes a tree at
    /// rest. A cancellation caused by the expiry is reported as a network
    /// failure. A tree that completed before it saw the cancel keeps its
    /// outcome.
    pub async fn wait(mut self, timeout: Duration) -> Result<ProcessReport<C>> {
        if let Ok(report) = tokio::time::timeout(timeout, &mut self.join).await {
            return report
                .map_err(|e| SyncError::step(format!("process {} aborted: {e}", self.id)));
        }

        let id = self.id;
        if self.control.cancel().is_ok() {
            tracing::warn!(parent: self.control.span(), ?timeout, "wait expired, cancelling");
        }
        let mut report = self.join().await?;
        if let Err(failure) = &mut report.outcome {
            if failure.is_cancelled() {
                failure.error =
                    SyncError::network(format!("process {id} did not finish within {timeout:?}"));
            }
        }
        Ok(report)
    }
}
