//! In-memory engine over a [`StorageData`] document.
//!
//! The JSON engine loads a `Document`, runs operations on it and writes it back,
//! so the store semantics (uniqueness, paging, snapshot lookup) live here once.

use super::{CategoryStore, DeadLetterStore, Repository, Storage, StorageError, TaskStore};
use crate::models::{
    Category, CategoryFilter, CategoryPatch, CategorySnapshot, DeadLetter, Page, PageRequest,
    StorageData, Task,
};
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Default)]
pub struct Document {
    data: Mutex<StorageData>,
}

impl Document {
    pub fn new() -> Self {
        Self::from_data(StorageData::new())
    }

    pub fn from_data(data: StorageData) -> Self {
        Self {
            data: Mutex::new(data),
        }
    }

    pub fn into_data(self) -> Result<StorageData, StorageError> {
        self.data
            .into_inner()
            .map_err(|e| StorageError::Storage(format!("Failed to lock document: {}", e)))
    }

    fn lock(&self) -> Result<MutexGuard<'_, StorageData>, StorageError> {
        self.data
            .lock()
            .map_err(|e| StorageError::Storage(format!("Failed to lock document: {}", e)))
    }
}

fn title_taken(data: &StorageData, owner: &str, title: &str, except: Option<&str>) -> bool {
    data.categories
        .iter()
        .any(|c| c.owner == owner && c.title == title && Some(c.id.as_str()) != except)
}

impl CategoryStore for Document {
    fn get_category(&self, id: &str) -> Result<Category, StorageError> {
        self.lock()?
            .categories
            .iter()
            .find(|c| c.id == id)
            .cloned()
            .ok_or_else(|| StorageError::category_not_found(id))
    }

    fn find_category_by_title(
        &self,
        owner: &str,
        title: &str,
    ) -> Result<Option<Category>, StorageError> {
        Ok(self
            .lock()?
            .categories
            .iter()
            .find(|c| c.owner == owner && c.title == title)
            .cloned())
    }

    fn list_categories(
        &self,
        owner: &str,
        filter: &CategoryFilter,
        page: PageRequest,
    ) -> Result<Page<Category>, StorageError> {
        let matching: Vec<Category> = self
            .lock()?
            .categories
            .iter()
            .filter(|c| c.owner == owner && filter.matches(c))
            .cloned()
            .collect();
        page.slice(matching)
    }

    fn all_categories(&self) -> Result<Vec<Category>, StorageError> {
        Ok(self.lock()?.categories.clone())
    }

    fn create_category(
        &self,
        owner: &str,
        title: &str,
        color: &str,
    ) -> Result<Category, StorageError> {
        let mut data = self.lock()?;
        if title_taken(&data, owner, title, None) {
            return Err(StorageError::Conflict(title.to_string()));
        }
        let category = Category::new(owner, title, color);
        data.categories.push(category.clone());
        Ok(category)
    }

    fn update_category(&self, id: &str, patch: &CategoryPatch) -> Result<Category, StorageError> {
        let mut data = self.lock()?;
        let owner = data
            .categories
            .iter()
            .find(|c| c.id == id)
            .map(|c| c.owner.clone())
            .ok_or_else(|| StorageError::category_not_found(id))?;
        if let Some(title) = &patch.title {
            if title_taken(&data, &owner, title, Some(id)) {
                return Err(StorageError::Conflict(title.clone()));
            }
        }
        let category = data
            .categories
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or_else(|| StorageError::category_not_found(id))?;
        category.apply(patch);
        Ok(category.clone())
    }

    fn delete_category(&self, id: &str) -> Result<Category, StorageError> {
        let mut data = self.lock()?;
        let index = data
            .categories
            .iter()
            .position(|c| c.id == id)
            .ok_or_else(|| StorageError::category_not_found(id))?;
        Ok(data.categories.remove(index))
    }
}

impl TaskStore for Document {
    fn get_task(&self, id: &str) -> Result<Task, StorageError> {
        self.lock()?
            .tasks
            .iter()
            .find(|t| t.id == id)
            .cloned()
            .ok_or_else(|| StorageError::task_not_found(id))
    }

    fn create_task(
        &self,
        owner: &str,
        title: &str,
        categories: Vec<CategorySnapshot>,
    ) -> Result<Task, StorageError> {
        let task = Task::new(owner, title, categories);
        self.lock()?.tasks.push(task.clone());
        Ok(task)
    }

    fn list_tasks(&self, owner: Option<&str>) -> Result<Vec<Task>, StorageError> {
        Ok(self
            .lock()?
            .tasks
            .iter()
            .filter(|t| owner.map_or(true, |o| t.owner == o))
            .cloned()
            .collect())
    }

    fn find_by_category_id(&self, category_id: &str) -> Result<Vec<Task>, StorageError> {
        Ok(self
            .lock()?
            .tasks
            .iter()
            .filter(|t| t.has_category(category_id))
            .cloned()
            .collect())
    }

    fn replace_categories(
        &self,
        task_id: &str,
        categories: &[CategorySnapshot],
    ) -> Result<(), StorageError> {
        let mut data = self.lock()?;
        let task = data
            .tasks
            .iter_mut()
            .find(|t| t.id == task_id)
            .ok_or_else(|| StorageError::task_not_found(task_id))?;
        task.set_categories(categories.to_vec());
        Ok(())
    }
}

impl DeadLetterStore for Document {
    fn push_dead_letters(&self, letters: &[DeadLetter]) -> Result<(), StorageError> {
        self.lock()?.dead_letters.extend_from_slice(letters);
        Ok(())
    }

    fn dead_letters(&self) -> Result<Vec<DeadLetter>, StorageError> {
        Ok(self.lock()?.dead_letters.clone())
    }

    fn clear_dead_letters(&self) -> Result<usize, StorageError> {
        let mut data = self.lock()?;
        let count = data.dead_letters.len();
        data.dead_letters.clear();
        Ok(count)
    }
}

impl Storage for Document {
    fn transaction(
        &self,
        work: &mut dyn FnMut(&dyn Repository) -> Result<(), StorageError>,
    ) -> Result<(), StorageError> {
        // Held until commit; other writers wait for it.
        let mut data = self.lock()?;
        let scratch = Document::from_data(data.clone());
        work(&scratch)?;
        *data = scratch.into_data()?;
        Ok(())
    }
}
