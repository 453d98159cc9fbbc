//! # Task Module
//!
//! The controller binding one crawl entry invocation to its completion
//! tracking.
//!
//! ## Overview
//!
//! A [`Task`] owns a request counter and an item counter combined into a
//! [`MultiState`](crate::state::MultiState), one scheduler instance, and the
//! job metadata naming the registered entry point. Its status machine is
//! `Pending → Running → Success | Failure`; terminal states are absorbing.
//!
//! Completion is detected, never signalled: when the entry handler returns,
//! both counters are closed, and the instant every counter is closed with a
//! combined count of zero the task finalizes as `Success`. An explicit stop
//! or an upstream cancellation before natural drain finalizes it as
//! `Failure` with a recorded stop reason.

use crate::context::Context;
use crate::error::CrawlError;
use crate::scheduler::{Scheduler, panic_message};
use crate::state::MultiState;
use parking_lot::Mutex;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use futures_util::FutureExt;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Lifecycle states of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    /// Created, not yet started.
    Pending,
    /// Scheduler started, work in flight.
    Running,
    /// Both counters closed and drained with no outstanding error.
    Success,
    /// Explicit stop or upstream cancellation before natural drain.
    Failure,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Success | TaskStatus::Failure)
    }
}

/// Metadata naming the crawl entry point and its arguments.
#[derive(Debug, Clone)]
pub struct Job {
    pub entry: String,
    pub args: serde_json::Value,
}

impl Job {
    pub fn new(entry: impl Into<String>) -> Self {
        Job {
            entry: entry.into(),
            args: serde_json::Value::Null,
        }
    }

    pub fn with_args(mut self, args: serde_json::Value) -> Self {
        self.args = args;
        self
    }
}

/// One execution of a crawl entry point.
pub struct Task {
    id: String,
    job: Job,
    scheduler: Arc<Scheduler>,
    cancel: CancellationToken,
    status_tx: watch::Sender<TaskStatus>,
    stop_reason: Mutex<Option<String>>,
    start_time: Mutex<Option<Instant>>,
}

impl Task {
    pub(crate) fn create(
        id: String,
        job: Job,
        scheduler: Arc<Scheduler>,
        cancel: CancellationToken,
        multi: MultiState,
    ) -> Arc<Self> {
        let (status_tx, _) = watch::channel(TaskStatus::Pending);
        let task = Arc::new(Task {
            id,
            job,
            scheduler,
            cancel,
            status_tx,
            stop_reason: Mutex::new(None),
            start_time: Mutex::new(None),
        });

        let weak = Arc::downgrade(&task);
        multi.on_drained(move || {
            if let Some(task) = weak.upgrade() {
                tokio::spawn(async move { task.stop(None).await });
            }
        });

        task
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn job(&self) -> &Job {
        &self.job
    }

    pub fn status(&self) -> TaskStatus {
        *self.status_tx.borrow()
    }

    /// The recorded reason a task finalized as `Failure`.
    pub fn stop_reason(&self) -> Option<String> {
        self.stop_reason.lock().clone()
    }

    pub fn started_at(&self) -> Option<Instant> {
        *self.start_time.lock()
    }

    /// Signals upstream cancellation: pending limiter waits unblock, the
    /// task transitions to `Failure`. Work already started is not
    /// terminated.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Starts the scheduler and invokes the registered entry point.
    ///
    /// Fails when the task already left `Pending`, or when the entry name
    /// has no registration; setup failures abort the task before any unit
    /// runs.
    pub fn start(self: &Arc<Self>) -> Result<(), CrawlError> {
        if self.status() != TaskStatus::Pending {
            return Err(CrawlError::TaskStopped(format!(
                "task {} already started",
                self.id
            )));
        }

        let entry = match self.scheduler.handlers().entry(&self.job.entry) {
            Ok(entry) => entry,
            Err(e) => {
                let reason = e.to_string();
                self.try_terminalize(TaskStatus::Failure, Some(reason));
                return Err(e);
            }
        };

        self.status_tx.send_replace(TaskStatus::Running);
        *self.start_time.lock() = Some(Instant::now());
        info!(task = %self.id, entry = %self.job.entry, "task started");

        self.scheduler.start();

        let watcher = Arc::clone(self);
        tokio::spawn(async move {
            watcher.cancel.cancelled().await;
            watcher.stop(Some("task cancelled".to_string())).await;
        });

        let task = Arc::clone(self);
        let ctx = Context::new(
            self.id.clone(),
            Arc::clone(&self.scheduler),
            self.cancel.clone(),
        );
        let args = self.job.args.clone();
        tokio::spawn(async move {
            match AssertUnwindSafe(entry(ctx, args)).catch_unwind().await {
                Ok(Ok(())) => {
                    // Seeding is done; from here zero combined count means
                    // the crawl has drained.
                    task.scheduler.request_state().close();
                    task.scheduler.item_state().close();
                }
                Ok(Err(e)) => task.stop(Some(format!("entry failed: {e}"))).await,
                Err(panic) => {
                    let message = panic_message(panic.as_ref());
                    task.stop(Some(format!("entry panicked: {message}"))).await;
                }
            }
        });

        Ok(())
    }

    /// Resolves once the task reaches a terminal state.
    pub async fn wait(&self) -> TaskStatus {
        let mut rx = self.status_tx.subscribe();
        loop {
            let status = *rx.borrow_and_update();
            if status.is_terminal() {
                return status;
            }
            if rx.changed().await.is_err() {
                return self.status();
            }
        }
    }

    /// Finalizes the task. `None` records a natural drain (`Success`); any
    /// reason records `Failure`. The first terminal transition wins; later
    /// calls are no-ops.
    pub(crate) async fn stop(&self, reason: Option<String>) {
        let status = if reason.is_some() {
            TaskStatus::Failure
        } else {
            TaskStatus::Success
        };
        if !self.try_terminalize(status, reason) {
            return;
        }

        match status {
            TaskStatus::Failure => warn!(
                task = %self.id,
                reason = self.stop_reason().as_deref().unwrap_or(""),
                "task failed"
            ),
            _ => info!(task = %self.id, "task succeeded"),
        }

        self.scheduler.shutdown().await;
    }

    fn try_terminalize(&self, status: TaskStatus, reason: Option<String>) -> bool {
        // The reason lock serializes racing terminal writers, so the
        // recorded reason always belongs to the winning transition.
        let mut reason_slot = self.stop_reason.lock();
        let changed = self.status_tx.send_if_modified(|current| {
            if current.is_terminal() {
                return false;
            }
            *current = status;
            true
        });
        if changed {
            *reason_slot = reason;
        }
        changed
    }
}
