//! Keeps the category snapshots embedded in tasks in step with the
//! authoritative category records.
//!
//! A category change fans out to every task holding a snapshot of it. The
//! fan-out either runs inside the caller's storage transaction
//! ([`Synchronizer::propagate_atomic`]), or write by write with bounded retries
//! under a deadline ([`Synchronizer::propagate`]). In the latter case nothing is
//! dropped silently: every failure ends up in the returned
//! [`PropagationReport`] and in the dead-letter list.

use crate::config::{Config, ConfigError};
use crate::models::{
    Category, CategorySnapshot, DeadLetter, SyncAction, Task, TaskId,
};
use crate::storage::{Repository, Storage, StorageError};
use chrono::Utc;
use serde::Serialize;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    /// Category write and task writes commit as one storage transaction.
    Transaction,
    /// Category write commits first; task writes are retried independently.
    Retry,
}

impl SyncMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "transaction" => Some(SyncMode::Transaction),
            "retry" => Some(SyncMode::Retry),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncSettings {
    pub mode: SyncMode,
    pub max_attempts: u32,
    pub backoff: Duration,
    pub timeout: Duration,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            mode: SyncMode::Transaction,
            max_attempts: 3,
            backoff: Duration::from_millis(50),
            timeout: Duration::from_secs(5),
        }
    }
}

impl SyncSettings {
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        let config = config.resolved();
        let defaults = Self::default();

        let mode = match config.sync_mode.as_deref() {
            None => defaults.mode,
            Some(raw) => SyncMode::parse(raw).ok_or_else(|| {
                ConfigError::InvalidConfig(format!("Unknown sync.mode: {}", raw))
            })?,
        };

        Ok(Self {
            mode,
            max_attempts: config
                .sync_max_attempts
                .unwrap_or(defaults.max_attempts)
                .max(1),
            backoff: config
                .sync_backoff_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.backoff),
            timeout: config
                .sync_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.timeout),
        })
    }
}

/// One committed category change to push into tasks.
#[derive(Debug, Clone, Copy)]
pub enum Propagation<'a> {
    /// Rename and/or recolor: snapshots take the category's current fields.
    Refresh(&'a Category),
    /// Deletion: snapshots of this category id are dropped.
    Remove(&'a str),
}

impl Propagation<'_> {
    pub fn category_id(&self) -> &str {
        match self {
            Propagation::Refresh(category) => &category.id,
            Propagation::Remove(id) => id,
        }
    }

    pub fn action(&self) -> SyncAction {
        match self {
            Propagation::Refresh(_) => SyncAction::Refresh,
            Propagation::Remove(_) => SyncAction::Remove,
        }
    }

    /// New snapshot list for one task. Order of the other snapshots is kept.
    pub fn rewrite(&self, snapshots: &[CategorySnapshot]) -> Vec<CategorySnapshot> {
        match self {
            Propagation::Refresh(category) => snapshots
                .iter()
                .map(|s| {
                    if s.id == category.id {
                        category.snapshot()
                    } else {
                        s.clone()
                    }
                })
                .collect(),
            Propagation::Remove(id) => snapshots.iter().filter(|s| s.id != *id).cloned().collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedTask {
    pub task_id: TaskId,
    pub attempts: u32,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PropagationReport {
    /// Tasks whose snapshots were rewritten.
    pub updated: Vec<TaskId>,
    /// Tasks deleted between lookup and write; nothing left to fix.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub skipped: Vec<TaskId>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub failed: Vec<FailedTask>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub timed_out: bool,
    /// Set when the fan-out could not start, e.g. the task lookup failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aborted: Option<String>,
}

impl PropagationReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty() && !self.timed_out && self.aborted.is_none()
    }

    pub fn failed_task_ids(&self) -> Vec<&str> {
        self.failed.iter().map(|f| f.task_id.as_str()).collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub tasks_scanned: usize,
    pub tasks_repaired: usize,
    pub snapshots_refreshed: usize,
    pub snapshots_removed: usize,
    pub dead_letters_cleared: usize,
}

enum WriteOutcome {
    Written,
    Missing,
    Failed { attempts: u32, error: String },
    OutOfTime { attempts: u32, error: String },
}

#[derive(Debug, Clone, Default)]
pub struct Synchronizer {
    settings: SyncSettings,
}

impl Synchronizer {
    pub fn new(settings: SyncSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    /// Fan-out for use inside a storage transaction: the first failing write
    /// aborts, so the caller's transaction rolls everything back.
    pub fn propagate_atomic<R: Repository + ?Sized>(
        &self,
        repo: &R,
        change: &Propagation<'_>,
    ) -> Result<PropagationReport, StorageError> {
        let tasks = repo.find_by_category_id(change.category_id())?;
        let mut report = PropagationReport::default();
        for task in &tasks {
            repo.replace_categories(&task.id, &change.rewrite(&task.categories))?;
            report.updated.push(task.id.clone());
        }
        debug!(
            category_id = change.category_id(),
            tasks = report.updated.len(),
            "propagated category change in transaction"
        );
        Ok(report)
    }

    /// Fan-out after the category write has committed. Each task is re-read and
    /// rewritten in its own transaction, retried with exponential backoff. Once
    /// the deadline passes no further write starts and the remaining tasks are
    /// reported as failed. Failures are also recorded as dead letters.
    pub fn propagate<S: Storage + ?Sized>(
        &self,
        storage: &S,
        change: &Propagation<'_>,
    ) -> PropagationReport {
        let deadline = Instant::now() + self.settings.timeout;
        let mut report = PropagationReport::default();

        let tasks = match self.find_with_retry(storage, change.category_id(), deadline) {
            Ok(tasks) => tasks,
            Err(error) => {
                warn!(category_id = change.category_id(), %error, "could not look up tasks to sync");
                report.aborted = Some(error.to_string());
                return report;
            }
        };

        for task in &tasks {
            if !report.timed_out && Instant::now() >= deadline {
                warn!(category_id = change.category_id(), "sync deadline passed");
                report.timed_out = true;
            }
            if report.timed_out {
                report.failed.push(FailedTask {
                    task_id: task.id.clone(),
                    attempts: 0,
                    error: "deadline exceeded before attempt".to_string(),
                });
                continue;
            }
            match self.write_with_retry(storage, &task.id, change, deadline) {
                WriteOutcome::Written => report.updated.push(task.id.clone()),
                WriteOutcome::Missing => report.skipped.push(task.id.clone()),
                WriteOutcome::Failed { attempts, error } => report.failed.push(FailedTask {
                    task_id: task.id.clone(),
                    attempts,
                    error,
                }),
                WriteOutcome::OutOfTime { attempts, error } => {
                    report.timed_out = true;
                    report.failed.push(FailedTask {
                        task_id: task.id.clone(),
                        attempts,
                        error,
                    });
                }
            }
        }

        if !report.failed.is_empty() {
            self.record_dead_letters(storage, change, &report.failed);
        }
        info!(
            category_id = change.category_id(),
            updated = report.updated.len(),
            failed = report.failed.len(),
            timed_out = report.timed_out,
            "propagated category change"
        );
        report
    }

    fn find_with_retry<R: Repository + ?Sized>(
        &self,
        repo: &R,
        category_id: &str,
        deadline: Instant,
    ) -> Result<Vec<Task>, StorageError> {
        let mut delay = self.settings.backoff;
        let mut attempt = 1;
        loop {
            match repo.find_by_category_id(category_id) {
                Ok(tasks) => return Ok(tasks),
                Err(error) => {
                    if attempt >= self.settings.max_attempts || Instant::now() + delay > deadline {
                        return Err(error);
                    }
                    warn!(category_id, attempt, %error, "task lookup failed, retrying");
                    std::thread::sleep(delay);
                    delay = delay.saturating_mul(2);
                    attempt += 1;
                }
            }
        }
    }

    fn write_with_retry<S: Storage + ?Sized>(
        &self,
        storage: &S,
        task_id: &str,
        change: &Propagation<'_>,
        deadline: Instant,
    ) -> WriteOutcome {
        let mut delay = self.settings.backoff;
        let mut attempt = 1;
        loop {
            // Rewrite from the stored list so concurrent attaches are kept.
            let result = storage.transaction(&mut |repo: &dyn Repository| {
                let task = repo.get_task(task_id)?;
                repo.replace_categories(task_id, &change.rewrite(&task.categories))
            });
            match result {
                Ok(()) => return WriteOutcome::Written,
                Err(StorageError::NotFound(_)) => {
                    debug!(task_id, "task disappeared before sync");
                    return WriteOutcome::Missing;
                }
                Err(error) => {
                    warn!(task_id, attempt, %error, "task sync write failed");
                    if attempt >= self.settings.max_attempts {
                        return WriteOutcome::Failed {
                            attempts: attempt,
                            error: error.to_string(),
                        };
                    }
                    if Instant::now() + delay >= deadline {
                        return WriteOutcome::OutOfTime {
                            attempts: attempt,
                            error: error.to_string(),
                        };
                    }
                    std::thread::sleep(delay);
                    delay = delay.saturating_mul(2);
                    attempt += 1;
                }
            }
        }
    }

    fn record_dead_letters<R: Repository + ?Sized>(
        &self,
        repo: &R,
        change: &Propagation<'_>,
        failed: &[FailedTask],
    ) {
        let now = Utc::now();
        let letters: Vec<DeadLetter> = failed
            .iter()
            .map(|f| DeadLetter {
                task_id: f.task_id.clone(),
                category_id: change.category_id().to_string(),
                action: change.action(),
                error: f.error.clone(),
                recorded_at: now,
            })
            .collect();
        // The report already carries these failures back to the caller.
        if let Err(error) = repo.push_dead_letters(&letters) {
            warn!(%error, count = letters.len(), "could not record dead letters");
        }
    }

    /// Full scan repairing drift: snapshots of live categories are refreshed,
    /// snapshots of deleted categories are dropped. Runs in one transaction and
    /// clears the dead-letter list, which the scan supersedes.
    pub fn reconcile<S: Storage + ?Sized>(
        &self,
        storage: &S,
    ) -> Result<ReconcileReport, StorageError> {
        let mut outcome = ReconcileReport::default();
        storage.transaction(&mut |repo: &dyn Repository| {
            let mut report = ReconcileReport::default();
            let categories: HashMap<String, Category> = repo
                .all_categories()?
                .into_iter()
                .map(|c| (c.id.clone(), c))
                .collect();

            for task in repo.list_tasks(None)? {
                report.tasks_scanned += 1;
                let mut refreshed = 0;
                let mut removed = 0;
                let repaired: Vec<CategorySnapshot> = task
                    .categories
                    .iter()
                    .filter_map(|s| match categories.get(&s.id) {
                        Some(category) if s.is_current(category) => Some(s.clone()),
                        Some(category) => {
                            refreshed += 1;
                            Some(category.snapshot())
                        }
                        None => {
                            removed += 1;
                            None
                        }
                    })
                    .collect();

                if refreshed + removed > 0 {
                    repo.replace_categories(&task.id, &repaired)?;
                    report.tasks_repaired += 1;
                    report.snapshots_refreshed += refreshed;
                    report.snapshots_removed += removed;
                }
            }

            report.dead_letters_cleared = repo.clear_dead_letters()?;
            outcome = report;
            Ok(())
        })?;

        info!(
            scanned = outcome.tasks_scanned,
            repaired = outcome.tasks_repaired,
            "reconciled category snapshots"
        );
        Ok(outcome)
    }
}
