use crate::models::{Category, StorageError};
use crate::synchronizer::PropagationReport;
use crate::validation::FieldError;
use serde::Serialize;
use thiserror::Error;

mod category;
mod task;

pub use category::CategoryController;
pub use task::TaskController;

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("Id required")]
    MissingIdentifier,
    #[error("No current user")]
    Unauthenticated,
    #[error("Incorrect data: {}", describe(.0))]
    ValidationFailed(Vec<FieldError>),
    #[error("Title already in use: {0}")]
    Conflict(String),
    #[error("Could not find {0}")]
    NotFound(String),
    #[error("Page {page} not found ({total_pages} page(s) available)")]
    PageNotFound { page: u32, total_pages: u32 },
    #[error("Storage failure: {0}")]
    StorageFailure(StorageError),
    /// The category change committed but some tasks still hold stale snapshots.
    #[error(
        "Category {} saved but {} task(s) could not be synchronized: {}",
        .category.id,
        .report.failed.len(),
        .report.failed_task_ids().join(", ")
    )]
    PartialPropagationFailure {
        category: Box<Category>,
        report: PropagationReport,
    },
}

fn describe(errors: &[FieldError]) -> String {
    errors
        .iter()
        .map(|e| format!("{}: {}", e.field, e.message))
        .collect::<Vec<_>>()
        .join("; ")
}

impl From<StorageError> for ControllerError {
    fn from(error: StorageError) -> Self {
        match error {
            StorageError::NotFound(what) => ControllerError::NotFound(what),
            StorageError::Conflict(title) => ControllerError::Conflict(title),
            StorageError::PageNotFound { page, total_pages } => {
                ControllerError::PageNotFound { page, total_pages }
            }
            other => ControllerError::StorageFailure(other),
        }
    }
}

/// A committed category mutation and what its fan-out did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CategoryChange {
    pub category: Category,
    pub propagation: PropagationReport,
}

pub(crate) fn require_id(id: Option<&str>) -> Result<&str, ControllerError> {
    match id.map(str::trim) {
        Some(id) if !id.is_empty() => Ok(id),
        _ => Err(ControllerError::MissingIdentifier),
    }
}
