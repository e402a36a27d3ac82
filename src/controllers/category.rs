use super::{require_id, CategoryChange, ControllerError};
use crate::models::{Category, CategoryFilter, CategoryPatch, Page, PageRequest};
use crate::storage::{Repository, Storage, StorageError};
use crate::synchronizer::{Propagation, PropagationReport, SyncMode, Synchronizer};
use crate::users::UserStore;
use crate::validation::{Input, Validator};
use tracing::{info, warn};

/// Category entry points. Mutations keep the snapshots embedded in tasks in
/// step, either in the same transaction or through the retrying fan-out,
/// depending on the synchronizer's mode.
pub struct CategoryController<'a> {
    storage: &'a dyn Storage,
    users: &'a dyn UserStore,
    validator: &'a dyn Validator,
    synchronizer: Synchronizer,
}

/// Categories of other users are reported as missing.
fn owned_by<R: Repository + ?Sized>(
    repo: &R,
    id: &str,
    owner: &str,
) -> Result<Category, StorageError> {
    let category = repo.get_category(id)?;
    if category.owner != owner {
        return Err(StorageError::category_not_found(id));
    }
    Ok(category)
}

impl<'a> CategoryController<'a> {
    pub fn new(
        storage: &'a dyn Storage,
        users: &'a dyn UserStore,
        validator: &'a dyn Validator,
        synchronizer: Synchronizer,
    ) -> Self {
        Self {
            storage,
            users,
            validator,
            synchronizer,
        }
    }

    pub fn get_category(&self, id: Option<&str>) -> Result<Category, ControllerError> {
        let id = require_id(id)?;
        let owner = self.users.current_user_id()?;
        Ok(owned_by(self.storage, id, &owner)?)
    }

    pub fn list_categories(
        &self,
        filter: &CategoryFilter,
        page: PageRequest,
    ) -> Result<Page<Category>, ControllerError> {
        let owner = self.users.current_user_id()?;
        Ok(self.storage.list_categories(&owner, filter, page)?)
    }

    pub fn create_category(&self, title: &str, color: &str) -> Result<Category, ControllerError> {
        self.validator
            .check(&Input::NewCategory { title, color })
            .into_result()
            .map_err(ControllerError::ValidationFailed)?;
        let owner = self.users.current_user_id()?;

        let category = self.storage.create_category(&owner, title, color)?;
        info!(category_id = %category.id, owner = %owner, "created category");
        Ok(category)
    }

    /// Applies `patch` and refreshes every task snapshot of the category.
    /// Returns the post-update category.
    pub fn update_category(
        &self,
        id: Option<&str>,
        patch: &CategoryPatch,
    ) -> Result<CategoryChange, ControllerError> {
        let id = require_id(id)?;
        self.validator
            .check(&Input::CategoryPatch(patch))
            .into_result()
            .map_err(ControllerError::ValidationFailed)?;
        let owner = self.users.current_user_id()?;

        match self.synchronizer.settings().mode {
            SyncMode::Transaction => {
                let change = self.in_transaction(|repo| {
                    owned_by(repo, id, &owner)?;
                    let category = repo.update_category(id, patch)?;
                    let propagation = self
                        .synchronizer
                        .propagate_atomic(repo, &Propagation::Refresh(&category))?;
                    Ok(CategoryChange {
                        category,
                        propagation,
                    })
                })?;
                info!(category_id = %id, tasks = change.propagation.updated.len(), "updated category");
                Ok(change)
            }
            SyncMode::Retry => {
                owned_by(self.storage, id, &owner)?;
                let category = self.storage.update_category(id, patch)?;
                let propagation = self
                    .synchronizer
                    .propagate(self.storage, &Propagation::Refresh(&category));
                Self::finish(category, propagation)
            }
        }
    }

    /// Removes the category and drops its snapshot from every task.
    /// Returns the deleted category.
    pub fn delete_category(&self, id: Option<&str>) -> Result<CategoryChange, ControllerError> {
        let id = require_id(id)?;
        let owner = self.users.current_user_id()?;

        match self.synchronizer.settings().mode {
            SyncMode::Transaction => {
                let change = self.in_transaction(|repo| {
                    owned_by(repo, id, &owner)?;
                    let category = repo.delete_category(id)?;
                    let propagation = self
                        .synchronizer
                        .propagate_atomic(repo, &Propagation::Remove(&category.id))?;
                    Ok(CategoryChange {
                        category,
                        propagation,
                    })
                })?;
                info!(category_id = %id, tasks = change.propagation.updated.len(), "deleted category");
                Ok(change)
            }
            SyncMode::Retry => {
                owned_by(self.storage, id, &owner)?;
                let category = self.storage.delete_category(id)?;
                let propagation = self
                    .synchronizer
                    .propagate(self.storage, &Propagation::Remove(&category.id));
                Self::finish(category, propagation)
            }
        }
    }

    fn in_transaction(
        &self,
        mut work: impl FnMut(&dyn Repository) -> Result<CategoryChange, StorageError>,
    ) -> Result<CategoryChange, ControllerError> {
        let mut outcome = None;
        self.storage.transaction(&mut |repo: &dyn Repository| {
            outcome = Some(work(repo)?);
            Ok(())
        })?;
        outcome.ok_or_else(|| {
            ControllerError::StorageFailure(StorageError::Storage(
                "transaction committed without a result".to_string(),
            ))
        })
    }

    fn finish(
        category: Category,
        propagation: PropagationReport,
    ) -> Result<CategoryChange, ControllerError> {
        if propagation.is_complete() {
            info!(category_id = %category.id, tasks = propagation.updated.len(), "category change propagated");
            return Ok(CategoryChange {
                category,
                propagation,
            });
        }
        warn!(
            category_id = %category.id,
            failed = propagation.failed.len(),
            "category change only partially propagated"
        );
        Err(ControllerError::PartialPropagationFailure {
            category: Box::new(category),
            report: propagation,
        })
    }
}
