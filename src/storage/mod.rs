use crate::models::{
    Category, CategoryFilter, CategoryPatch, CategorySnapshot, DeadLetter, Page, PageRequest,
    Task,
};
use std::path::Path;

pub use crate::models::StorageError;

pub mod config;
pub mod document;
pub mod json;
mod migrations;
pub mod sqlite;

#[cfg(test)]
pub(crate) mod test_utils;

pub use document::Document;
pub use json::JsonStorage;
pub use sqlite::SqliteStorage;

/// Authoritative category records.
pub trait CategoryStore {
    fn get_category(&self, id: &str) -> Result<Category, StorageError>;
    fn find_category_by_title(
        &self,
        owner: &str,
        title: &str,
    ) -> Result<Option<Category>, StorageError>;
    /// Owner-scoped, filtered, paged listing in creation order.
    fn list_categories(
        &self,
        owner: &str,
        filter: &CategoryFilter,
        page: PageRequest,
    ) -> Result<Page<Category>, StorageError>;
    fn all_categories(&self) -> Result<Vec<Category>, StorageError>;
    /// Fails with `Conflict` if `owner` already has a category titled `title`.
    fn create_category(
        &self,
        owner: &str,
        title: &str,
        color: &str,
    ) -> Result<Category, StorageError>;
    /// Partial update returning the post-update record.
    fn update_category(&self, id: &str, patch: &CategoryPatch) -> Result<Category, StorageError>;
    /// Removes the category and returns the removed record.
    fn delete_category(&self, id: &str) -> Result<Category, StorageError>;
}

/// Task records with their embedded category snapshots.
pub trait TaskStore {
    fn get_task(&self, id: &str) -> Result<Task, StorageError>;
    fn create_task(
        &self,
        owner: &str,
        title: &str,
        categories: Vec<CategorySnapshot>,
    ) -> Result<Task, StorageError>;
    /// Tasks of `owner`, or every task when `owner` is `None`.
    fn list_tasks(&self, owner: Option<&str>) -> Result<Vec<Task>, StorageError>;
    /// Every task holding a snapshot with `category_id`.
    fn find_by_category_id(&self, category_id: &str) -> Result<Vec<Task>, StorageError>;
    fn replace_categories(
        &self,
        task_id: &str,
        categories: &[CategorySnapshot],
    ) -> Result<(), StorageError>;
}

pub trait DeadLetterStore {
    fn push_dead_letters(&self, letters: &[DeadLetter]) -> Result<(), StorageError>;
    fn dead_letters(&self) -> Result<Vec<DeadLetter>, StorageError>;
    /// Returns how many letters were dropped.
    fn clear_dead_letters(&self) -> Result<usize, StorageError>;
}

/// Everything a unit of work may touch.
pub trait Repository: CategoryStore + TaskStore + DeadLetterStore {}

impl<T: CategoryStore + TaskStore + DeadLetterStore + ?Sized> Repository for T {}

pub trait Storage: Repository + Send + Sync {
    /// Runs `work` against a view whose writes commit together when it returns
    /// `Ok`, and are discarded when it returns `Err`.
    fn transaction(
        &self,
        work: &mut dyn FnMut(&dyn Repository) -> Result<(), StorageError>,
    ) -> Result<(), StorageError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageType {
    Json,
    Sqlite,
}

impl StorageType {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "json" => Some(StorageType::Json),
            "sqlite" => Some(StorageType::Sqlite),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StorageType::Json => "json",
            StorageType::Sqlite => "sqlite",
        }
    }
}

pub fn create_storage(
    storage_type: StorageType,
    path: &Path,
) -> Result<Box<dyn Storage>, StorageError> {
    match storage_type {
        StorageType::Json => Ok(Box::new(JsonStorage::new(path)?)),
        StorageType::Sqlite => Ok(Box::new(SqliteStorage::open(path)?)),
    }
}
