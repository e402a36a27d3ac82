use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub type CategoryId = String;
pub type TaskId = String;
pub type UserId = String;

/// Authoritative category record. Tasks only ever hold [`CategorySnapshot`]s of it.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Category {
    pub id: CategoryId,
    pub title: String,
    pub color: String,
    pub owner: UserId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Category {
    pub fn new(owner: &str, title: &str, color: &str) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            title: title.to_string(),
            color: color.to_string(),
            owner: owner.to_string(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn snapshot(&self) -> CategorySnapshot {
        CategorySnapshot {
            id: self.id.clone(),
            title: self.title.clone(),
            color: self.color.clone(),
        }
    }

    /// Applies the set fields of `patch`; unset fields keep their value.
    pub fn apply(&mut self, patch: &CategoryPatch) {
        if let Some(title) = &patch.title {
            self.title = title.clone();
        }
        if let Some(color) = &patch.color {
            self.color = color.clone();
        }
        self.updated_at = Utc::now();
    }
}

/// Copy of a category's display fields embedded in a task.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct CategorySnapshot {
    pub id: CategoryId,
    pub title: String,
    pub color: String,
}

impl CategorySnapshot {
    pub fn is_current(&self, category: &Category) -> bool {
        self.id == category.id && self.title == category.title && self.color == category.color
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, Eq)]
pub struct CategoryPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
}

impl CategoryPatch {
    pub fn is_empty(&self) -> bool {
        self.title.is_none() && self.color.is_none()
    }
}

/// Equality predicates applied on top of the owner scope when listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CategoryFilter {
    pub title: Option<String>,
    pub color: Option<String>,
}

impl CategoryFilter {
    pub fn matches(&self, category: &Category) -> bool {
        self.title.as_ref().map_or(true, |t| *t == category.title)
            && self.color.as_ref().map_or(true, |c| *c == category.color)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Task {
    pub id: TaskId,
    pub owner: UserId,
    pub title: String,
    pub completed: bool,
    pub categories: Vec<CategorySnapshot>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn new(owner: &str, title: &str, categories: Vec<CategorySnapshot>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            owner: owner.to_string(),
            title: title.to_string(),
            completed: false,
            categories,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn has_category(&self, category_id: &str) -> bool {
        self.categories.iter().any(|s| s.id == category_id)
    }

    pub fn set_categories(&mut self, categories: Vec<CategorySnapshot>) {
        self.categories = categories;
        self.updated_at = Utc::now();
    }
}

/// One-based page request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub page: u32,
    pub limit: u32,
}

impl PageRequest {
    pub fn new(page: u32, limit: u32) -> Self {
        Self {
            page: page.max(1),
            limit: limit.max(1),
        }
    }

    pub fn total_pages(&self, count: u64) -> u32 {
        count.div_ceil(u64::from(self.limit)) as u32
    }

    pub fn offset(&self) -> u64 {
        u64::from(self.page - 1) * u64::from(self.limit)
    }

    /// Checks the request against a result count. An empty result is always a
    /// valid first page; otherwise asking past the last page fails.
    pub fn check(&self, count: u64) -> Result<u32, StorageError> {
        let total_pages = self.total_pages(count);
        if count > 0 && self.page > total_pages {
            return Err(StorageError::PageNotFound {
                page: self.page,
                total_pages,
            });
        }
        Ok(total_pages)
    }

    /// Pages over an already filtered, ordered list.
    pub fn slice<T>(&self, items: Vec<T>) -> Result<Page<T>, StorageError> {
        let total_pages = self.check(items.len() as u64)?;
        if items.is_empty() {
            return Ok(Page::empty());
        }
        let items = items
            .into_iter()
            .skip(self.offset() as usize)
            .take(self.limit as usize)
            .collect();
        Ok(Page {
            items,
            total_pages,
            current_page: self.page,
        })
    }
}

impl Default for PageRequest {
    fn default() -> Self {
        Self::new(1, 10)
    }
}

#[derive(Debug, Serialize, Clone, PartialEq, Eq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total_pages: u32,
    pub current_page: u32,
}

impl<T> Page<T> {
    pub fn empty() -> Self {
        Self {
            items: Vec::new(),
            total_pages: 0,
            current_page: 1,
        }
    }
}

/// What a task write was supposed to do to a snapshot.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SyncAction {
    Refresh,
    Remove,
}

impl SyncAction {
    pub fn as_str(self) -> &'static str {
        match self {
            SyncAction::Refresh => "refresh",
            SyncAction::Remove => "remove",
        }
    }

    pub fn parse(s: &str) -> Result<Self, StorageError> {
        match s {
            "refresh" => Ok(SyncAction::Refresh),
            "remove" => Ok(SyncAction::Remove),
            _ => Err(StorageError::InvalidData(format!("Invalid sync action: {}", s))),
        }
    }
}

/// A task write that exhausted its retries, kept for inspection and reconciliation.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct DeadLetter {
    pub task_id: TaskId,
    pub category_id: CategoryId,
    pub action: SyncAction,
    pub error: String,
    pub recorded_at: DateTime<Utc>,
}

/// Whole-document layout used by the JSON engine.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct StorageData {
    pub version: u32, // Schema version for future migrations
    #[serde(default)]
    pub categories: Vec<Category>,
    #[serde(default)]
    pub tasks: Vec<Task>,
    #[serde(default)]
    pub dead_letters: Vec<DeadLetter>,
}

impl StorageData {
    pub fn new() -> Self {
        Self {
            version: 1,
            categories: Vec::new(),
            tasks: Vec::new(),
            dead_letters: Vec::new(),
        }
    }

    pub fn validate(&self) -> Result<(), StorageError> {
        let mut titles = std::collections::HashSet::new();
        for category in &self.categories {
            if !titles.insert((category.owner.as_str(), category.title.as_str())) {
                return Err(StorageError::Conflict(category.title.clone()));
            }
        }
        Ok(())
    }
}

impl Default for StorageData {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Could not find {0}")]
    NotFound(String),
    #[error("Title already in use: {0}")]
    Conflict(String),
    #[error("Page {page} not found ({total_pages} page(s) available)")]
    PageNotFound { page: u32, total_pages: u32 },
    #[error("Invalid data: {0}")]
    InvalidData(String),
    #[error("Storage error: {0}")]
    Storage(String),
}

impl StorageError {
    pub fn category_not_found(id: &str) -> Self {
        StorageError::NotFound(format!("category {}", id))
    }

    pub fn task_not_found(id: &str) -> Self {
        StorageError::NotFound(format!("task {}", id))
    }
}
