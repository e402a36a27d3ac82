use super::{require_id, ControllerError};
use crate::models::{CategorySnapshot, DeadLetter, Task};
use crate::storage::{Repository, Storage, StorageError};
use crate::synchronizer::{ReconcileReport, Synchronizer};
use crate::users::UserStore;
use crate::validation::{Input, Validator};
use std::collections::HashSet;
use tracing::info;

/// Must run in the same transaction as the task write that stores the snapshot.
fn snapshot_of<R: Repository + ?Sized>(
    repo: &R,
    category_id: &str,
    owner: &str,
) -> Result<CategorySnapshot, StorageError> {
    let category = repo.get_category(category_id)?;
    if category.owner != owner {
        return Err(StorageError::category_not_found(category_id));
    }
    Ok(category.snapshot())
}

fn committed<T>(outcome: Option<T>) -> Result<T, ControllerError> {
    outcome.ok_or_else(|| {
        ControllerError::StorageFailure(StorageError::Storage(
            "transaction committed without a result".to_string(),
        ))
    })
}

/// Task entry points. Snapshots are only ever created here, by copying the
/// current state of a category the user owns.
pub struct TaskController<'a> {
    storage: &'a dyn Storage,
    users: &'a dyn UserStore,
    validator: &'a dyn Validator,
}

impl<'a> TaskController<'a> {
    pub fn new(
        storage: &'a dyn Storage,
        users: &'a dyn UserStore,
        validator: &'a dyn Validator,
    ) -> Self {
        Self {
            storage,
            users,
            validator,
        }
    }

    pub fn create_task(&self, title: &str, category_ids: &[String]) -> Result<Task, ControllerError> {
        self.validator
            .check(&Input::NewTask { title })
            .into_result()
            .map_err(ControllerError::ValidationFailed)?;
        let owner = self.users.current_user_id()?;

        let mut created = None;
        self.storage.transaction(&mut |repo: &dyn Repository| {
            let mut snapshots: Vec<CategorySnapshot> = Vec::new();
            for id in category_ids {
                if snapshots.iter().any(|s| s.id == *id) {
                    continue;
                }
                snapshots.push(snapshot_of(repo, id, &owner)?);
            }
            created = Some(repo.create_task(&owner, title, snapshots)?);
            Ok(())
        })?;

        let task = committed(created)?;
        info!(task_id = %task.id, categories = task.categories.len(), "created task");
        Ok(task)
    }

    pub fn get_task(&self, id: Option<&str>) -> Result<Task, ControllerError> {
        let id = require_id(id)?;
        let owner = self.users.current_user_id()?;
        let task = self.storage.get_task(id)?;
        if task.owner != owner {
            return Err(StorageError::task_not_found(id).into());
        }
        Ok(task)
    }

    pub fn list_tasks(&self) -> Result<Vec<Task>, ControllerError> {
        let owner = self.users.current_user_id()?;
        Ok(self.storage.list_tasks(Some(&owner))?)
    }

    /// Adds a snapshot of the category to the task; already attached is a no-op.
    pub fn attach_category(
        &self,
        task_id: Option<&str>,
        category_id: Option<&str>,
    ) -> Result<Task, ControllerError> {
        let task_id = require_id(task_id)?;
        let category_id = require_id(category_id)?;
        let owner = self.users.current_user_id()?;

        let mut attached = None;
        self.storage.transaction(&mut |repo: &dyn Repository| {
            let mut task = repo.get_task(task_id)?;
            if task.owner != owner {
                return Err(StorageError::task_not_found(task_id));
            }
            if !task.has_category(category_id) {
                let mut categories = task.categories.clone();
                categories.push(snapshot_of(repo, category_id, &owner)?);
                repo.replace_categories(&task.id, &categories)?;
                task.set_categories(categories);
            }
            attached = Some(task);
            Ok(())
        })?;
        committed(attached)
    }

    /// Store-wide repair pass. Requires a current user but covers every task.
    pub fn reconcile(&self, synchronizer: &Synchronizer) -> Result<ReconcileReport, ControllerError> {
        let user = self.users.current_user_id()?;
        info!(%user, "reconciling all tasks");
        Ok(synchronizer.reconcile(self.storage)?)
    }

    /// Dead letters for tasks owned by the current user.
    pub fn dead_letters(&self) -> Result<Vec<DeadLetter>, ControllerError> {
        let owner = self.users.current_user_id()?;
        let owned: HashSet<String> = self
            .storage
            .list_tasks(Some(&owner))?
            .into_iter()
            .map(|t| t.id)
            .collect();
        Ok(self
            .storage
            .dead_letters()?
            .into_iter()
            .filter(|letter| owned.contains(&letter.task_id))
            .collect())
    }

    /// Store-wide, like [`TaskController::reconcile`].
    pub fn clear_dead_letters(&self) -> Result<usize, ControllerError> {
        let user = self.users.current_user_id()?;
        info!(%user, "clearing dead letters");
        Ok(self.storage.clear_dead_letters()?)
    }
}
