use super::document::Document;
use super::{CategoryStore, DeadLetterStore, Repository, Storage, StorageError, TaskStore};
use crate::models::{
    Category, CategoryFilter, CategoryPatch, CategorySnapshot, DeadLetter, Page, PageRequest,
    StorageData, Task,
};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

/// Whole-file JSON engine. Every write loads the document, applies the
/// operation and replaces the file atomically.
pub struct JsonStorage {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonStorage {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let raw = path.as_ref().to_string_lossy();
        if raw.trim().is_empty() {
            return Err(StorageError::Storage("Storage path not configured".to_string()));
        }
        let path = PathBuf::from(shellexpand::tilde(raw.as_ref()).to_string());
        Ok(Self {
            path,
            write_lock: Mutex::new(()),
        })
    }

    fn load(&self) -> Result<StorageData, StorageError> {
        if !self.path.exists() {
            return Ok(StorageData::new());
        }

        let contents = std::fs::read_to_string(&self.path)?;
        if contents.trim().is_empty() {
            return Ok(StorageData::new());
        }

        let data: StorageData = serde_json::from_str(&contents)?;
        data.validate()?;
        Ok(data)
    }

    fn save(&self, data: &StorageData) -> Result<(), StorageError> {
        data.validate()?;

        let parent = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&parent)?;

        let json = serde_json::to_string_pretty(data)?;
        let mut file = tempfile::NamedTempFile::new_in(&parent)?;
        file.write_all(json.as_bytes())?;
        file.as_file().sync_all()?;
        file.persist(&self.path).map_err(|e| StorageError::Io(e.error))?;
        debug!(path = %self.path.display(), "saved json document");
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, ()>, StorageError> {
        self.write_lock
            .lock()
            .map_err(|e| StorageError::Storage(format!("Failed to lock storage: {}", e)))
    }

    fn read<R>(
        &self,
        op: impl FnOnce(&Document) -> Result<R, StorageError>,
    ) -> Result<R, StorageError> {
        let document = Document::from_data(self.load()?);
        op(&document)
    }

    fn write<R>(
        &self,
        op: impl FnOnce(&Document) -> Result<R, StorageError>,
    ) -> Result<R, StorageError> {
        let _guard = self.lock()?;
        let document = Document::from_data(self.load()?);
        let result = op(&document)?;
        self.save(&document.into_data()?)?;
        Ok(result)
    }
}

impl CategoryStore for JsonStorage {
    fn get_category(&self, id: &str) -> Result<Category, StorageError> {
        self.read(|doc| doc.get_category(id))
    }

    fn find_category_by_title(
        &self,
        owner: &str,
        title: &str,
    ) -> Result<Option<Category>, StorageError> {
        self.read(|doc| doc.find_category_by_title(owner, title))
    }

    fn list_categories(
        &self,
        owner: &str,
        filter: &CategoryFilter,
        page: PageRequest,
    ) -> Result<Page<Category>, StorageError> {
        self.read(|doc| doc.list_categories(owner, filter, page))
    }

    fn all_categories(&self) -> Result<Vec<Category>, StorageError> {
        self.read(|doc| doc.all_categories())
    }

    fn create_category(
        &self,
        owner: &str,
        title: &str,
        color: &str,
    ) -> Result<Category, StorageError> {
        self.write(|doc| doc.create_category(owner, title, color))
    }

    fn update_category(&self, id: &str, patch: &CategoryPatch) -> Result<Category, StorageError> {
        self.write(|doc| doc.update_category(id, patch))
    }

    fn delete_category(&self, id: &str) -> Result<Category, StorageError> {
        self.write(|doc| doc.delete_category(id))
    }
}

impl TaskStore for JsonStorage {
    fn get_task(&self, id: &str) -> Result<Task, StorageError> {
        self.read(|doc| doc.get_task(id))
    }

    fn create_task(
        &self,
        owner: &str,
        title: &str,
        categories: Vec<CategorySnapshot>,
    ) -> Result<Task, StorageError> {
        self.write(|doc| doc.create_task(owner, title, categories))
    }

    fn list_tasks(&self, owner: Option<&str>) -> Result<Vec<Task>, StorageError> {
        self.read(|doc| doc.list_tasks(owner))
    }

    fn find_by_category_id(&self, category_id: &str) -> Result<Vec<Task>, StorageError> {
        self.read(|doc| doc.find_by_category_id(category_id))
    }

    fn replace_categories(
        &self,
        task_id: &str,
        categories: &[CategorySnapshot],
    ) -> Result<(), StorageError> {
        self.write(|doc| doc.replace_categories(task_id, categories))
    }
}

impl DeadLetterStore for JsonStorage {
    fn push_dead_letters(&self, letters: &[DeadLetter]) -> Result<(), StorageError> {
        self.write(|doc| doc.push_dead_letters(letters))
    }

    fn dead_letters(&self) -> Result<Vec<DeadLetter>, StorageError> {
        self.read(|doc| doc.dead_letters())
    }

    fn clear_dead_letters(&self) -> Result<usize, StorageError> {
        self.write(|doc| doc.clear_dead_letters())
    }
}

impl Storage for JsonStorage {
    fn transaction(
        &self,
        work: &mut dyn FnMut(&dyn Repository) -> Result<(), StorageError>,
    ) -> Result<(), StorageError> {
        self.write(|doc| work(doc))
    }
}
