use super::{
    CategoryStore, DeadLetterStore, JsonStorage, Repository, SqliteStorage, Storage, StorageError,
    TaskStore,
};
use crate::models::{
    Category, CategoryFilter, CategoryPatch, CategorySnapshot, DeadLetter, Page, PageRequest,
    Task,
};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tempfile::TempDir;

pub fn create_test_json_storage() -> (JsonStorage, TempDir) {
    let temp_dir = tempfile::Builder::new()
        .prefix("trtasks_test")
        .tempdir()
        .expect("Failed to create temporary directory");
    let storage = JsonStorage::new(temp_dir.path().join("test.json"))
        .expect("Failed to create test storage");
    (storage, temp_dir)
}

pub fn create_test_sqlite_storage() -> SqliteStorage {
    SqliteStorage::open_in_memory().expect("Failed to create test storage")
}

/// Remaining injected failures, keyed by task id, plus an optional delay
/// applied to every task write.
#[derive(Default)]
pub struct Faults {
    task_writes: Mutex<HashMap<String, u32>>,
    lookups: Mutex<u32>,
    write_delay: Mutex<Duration>,
}

impl Faults {
    fn take(counter: &mut u32) -> bool {
        if *counter == 0 {
            return false;
        }
        *counter = counter.saturating_sub(1);
        true
    }

    fn task_write(&self, task_id: &str) -> Result<(), StorageError> {
        let delay = *self.write_delay.lock().unwrap();
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        let hit = self
            .task_writes
            .lock()
            .unwrap()
            .get_mut(task_id)
            .map_or(false, Self::take);
        if hit {
            return Err(StorageError::Storage(format!(
                "injected write failure for task {}",
                task_id
            )));
        }
        Ok(())
    }

    fn lookup(&self) -> Result<(), StorageError> {
        if Self::take(&mut self.lookups.lock().unwrap()) {
            return Err(StorageError::Storage("injected lookup failure".to_string()));
        }
        Ok(())
    }
}

/// A repository view that fails selected task writes before delegating.
pub struct Flaky<'a> {
    inner: &'a dyn Repository,
    faults: &'a Faults,
}

impl CategoryStore for Flaky<'_> {
    fn get_category(&self, id: &str) -> Result<Category, StorageError> {
        self.inner.get_category(id)
    }

    fn find_category_by_title(
        &self,
        owner: &str,
        title: &str,
    ) -> Result<Option<Category>, StorageError> {
        self.inner.find_category_by_title(owner, title)
    }

    fn list_categories(
        &self,
        owner: &str,
        filter: &CategoryFilter,
        page: PageRequest,
    ) -> Result<Page<Category>, StorageError> {
        self.inner.list_categories(owner, filter, page)
    }

    fn all_categories(&self) -> Result<Vec<Category>, StorageError> {
        self.inner.all_categories()
    }

    fn create_category(
        &self,
        owner: &str,
        title: &str,
        color: &str,
    ) -> Result<Category, StorageError> {
        self.inner.create_category(owner, title, color)
    }

    fn update_category(&self, id: &str, patch: &CategoryPatch) -> Result<Category, StorageError> {
        self.inner.update_category(id, patch)
    }

    fn delete_category(&self, id: &str) -> Result<Category, StorageError> {
        self.inner.delete_category(id)
    }
}

impl TaskStore for Flaky<'_> {
    fn get_task(&self, id: &str) -> Result<Task, StorageError> {
        self.inner.get_task(id)
    }

    fn create_task(
        &self,
        owner: &str,
        title: &str,
        categories: Vec<CategorySnapshot>,
    ) -> Result<Task, StorageError> {
        self.inner.create_task(owner, title, categories)
    }

    fn list_tasks(&self, owner: Option<&str>) -> Result<Vec<Task>, StorageError> {
        self.inner.list_tasks(owner)
    }

    fn find_by_category_id(&self, category_id: &str) -> Result<Vec<Task>, StorageError> {
        self.faults.lookup()?;
        self.inner.find_by_category_id(category_id)
    }

    fn replace_categories(
        &self,
        task_id: &str,
        categories: &[CategorySnapshot],
    ) -> Result<(), StorageError> {
        self.faults.task_write(task_id)?;
        self.inner.replace_categories(task_id, categories)
    }
}

impl DeadLetterStore for Flaky<'_> {
    fn push_dead_letters(&self, letters: &[DeadLetter]) -> Result<(), StorageError> {
        self.inner.push_dead_letters(letters)
    }

    fn dead_letters(&self) -> Result<Vec<DeadLetter>, StorageError> {
        self.inner.dead_letters()
    }

    fn clear_dead_letters(&self) -> Result<usize, StorageError> {
        self.inner.clear_dead_letters()
    }
}

/// Wraps an engine and injects failures into task writes and task lookups,
/// both outside and inside transactions.
pub struct FlakyStorage<S> {
    inner: S,
    faults: Faults,
}

impl<S: Storage> FlakyStorage<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            faults: Faults::default(),
        }
    }

    /// The next `times` writes to `task_id` fail.
    pub fn fail_task_writes(&self, task_id: &str, times: u32) {
        self.faults
            .task_writes
            .lock()
            .unwrap()
            .insert(task_id.to_string(), times);
    }

    pub fn fail_lookups(&self, times: u32) {
        *self.faults.lookups.lock().unwrap() = times;
    }

    /// Every task write sleeps for `delay` before it runs.
    pub fn slow_task_writes(&self, delay: Duration) {
        *self.faults.write_delay.lock().unwrap() = delay;
    }

    fn view(&self) -> Flaky<'_> {
        Flaky {
            inner: &self.inner,
            faults: &self.faults,
        }
    }
}

impl<S: Storage> CategoryStore for FlakyStorage<S> {
    fn get_category(&self, id: &str) -> Result<Category, StorageError> {
        self.view().get_category(id)
    }

    fn find_category_by_title(
        &self,
        owner: &str,
        title: &str,
    ) -> Result<Option<Category>, StorageError> {
        self.view().find_category_by_title(owner, title)
    }

    fn list_categories(
        &self,
        owner: &str,
        filter: &CategoryFilter,
        page: PageRequest,
    ) -> Result<Page<Category>, StorageError> {
        self.view().list_categories(owner, filter, page)
    }

    fn all_categories(&self) -> Result<Vec<Category>, StorageError> {
        self.view().all_categories()
    }

    fn create_category(
        &self,
        owner: &str,
        title: &str,
        color: &str,
    ) -> Result<Category, StorageError> {
        self.view().create_category(owner, title, color)
    }

    fn update_category(&self, id: &str, patch: &CategoryPatch) -> Result<Category, StorageError> {
        self.view().update_category(id, patch)
    }

    fn delete_category(&self, id: &str) -> Result<Category, StorageError> {
        self.view().delete_category(id)
    }
}

impl<S: Storage> TaskStore for FlakyStorage<S> {
    fn get_task(&self, id: &str) -> Result<Task, StorageError> {
        self.view().get_task(id)
    }

    fn create_task(
        &self,
        owner: &str,
        title: &str,
        categories: Vec<CategorySnapshot>,
    ) -> Result<Task, StorageError> {
        self.view().create_task(owner, title, categories)
    }

    fn list_tasks(&self, owner: Option<&str>) -> Result<Vec<Task>, StorageError> {
        self.view().list_tasks(owner)
    }

    fn find_by_category_id(&self, category_id: &str) -> Result<Vec<Task>, StorageError> {
        self.view().find_by_category_id(category_id)
    }

    fn replace_categories(
        &self,
        task_id: &str,
        categories: &[CategorySnapshot],
    ) -> Result<(), StorageError> {
        self.view().replace_categories(task_id, categories)
    }
}

impl<S: Storage> DeadLetterStore for FlakyStorage<S> {
    fn push_dead_letters(&self, letters: &[DeadLetter]) -> Result<(), StorageError> {
        self.view().push_dead_letters(letters)
    }

    fn dead_letters(&self) -> Result<Vec<DeadLetter>, StorageError> {
        self.view().dead_letters()
    }

    fn clear_dead_letters(&self) -> Result<usize, StorageError> {
        self.view().clear_dead_letters()
    }
}

impl<S: Storage> Storage for FlakyStorage<S> {
    fn transaction(
        &self,
        work: &mut dyn FnMut(&dyn Repository) -> Result<(), StorageError>,
    ) -> Result<(), StorageError> {
        let faults = &self.faults;
        self.inner.transaction(&mut |repo: &dyn Repository| {
            work(&Flaky {
                inner: repo,
                faults,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Document;
    use std::time::Instant;

    #[test]
    fn test_flaky_storage_fails_then_recovers() {
        let storage = FlakyStorage::new(Document::new());
        let task = storage.create_task("u1", "t", Vec::new()).unwrap();
        storage.fail_task_writes(&task.id, 1);

        assert!(storage.replace_categories(&task.id, &[]).is_err());
        assert!(storage.replace_categories(&task.id, &[]).is_ok());
    }

    #[test]
    fn test_flaky_storage_injects_inside_transactions() {
        let storage = FlakyStorage::new(Document::new());
        let task = storage.create_task("u1", "t", Vec::new()).unwrap();
        storage.fail_task_writes(&task.id, 1);

        let result = storage.transaction(&mut |repo: &dyn Repository| {
            repo.replace_categories(&task.id, &[])
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_flaky_storage_slows_task_writes() {
        let storage = FlakyStorage::new(Document::new());
        let task = storage.create_task("u1", "t", Vec::new()).unwrap();
        storage.slow_task_writes(Duration::from_millis(20));

        let started = Instant::now();
        storage.replace_categories(&task.id, &[]).unwrap();
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_json_test_storage_starts_empty() {
        let (storage, _temp_dir) = create_test_json_storage();
        assert!(storage.all_categories().unwrap().is_empty());
        let sqlite = create_test_sqlite_storage();
        assert!(sqlite.list_tasks(None).unwrap().is_empty());
    }
}
