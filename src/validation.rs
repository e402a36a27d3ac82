//! Input checks run before anything reaches a store.

use crate::models::CategoryPatch;
use serde::Serialize;

pub const MAX_TITLE_LEN: usize = 64;
pub const MAX_COLOR_LEN: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldError {
    pub field: &'static str,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationResult {
    errors: Vec<FieldError>,
}

impl ValidationResult {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn errors(&self) -> &[FieldError] {
        &self.errors
    }

    pub fn into_result(self) -> Result<(), Vec<FieldError>> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(self.errors)
        }
    }

    fn push(&mut self, field: &'static str, message: impl Into<String>) {
        self.errors.push(FieldError {
            field,
            message: message.into(),
        });
    }
}

/// Requests the validation layer knows how to check.
#[derive(Debug, Clone, Copy)]
pub enum Input<'a> {
    NewCategory { title: &'a str, color: &'a str },
    CategoryPatch(&'a CategoryPatch),
    NewTask { title: &'a str },
}

pub trait Validator: Send + Sync {
    fn check(&self, input: &Input<'_>) -> ValidationResult;
}

/// Non-blank titles of bounded length and non-blank colors.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultValidator;

impl DefaultValidator {
    fn check_title(result: &mut ValidationResult, title: &str) {
        if title.trim().is_empty() {
            result.push("title", "Title cannot be empty");
        } else if title.chars().count() > MAX_TITLE_LEN {
            result.push(
                "title",
                format!("Title must be at most {} characters", MAX_TITLE_LEN),
            );
        }
    }

    fn check_color(result: &mut ValidationResult, color: &str) {
        if color.trim().is_empty() {
            result.push("color", "Color cannot be empty");
        } else if color.chars().count() > MAX_COLOR_LEN {
            result.push(
                "color",
                format!("Color must be at most {} characters", MAX_COLOR_LEN),
            );
        }
    }
}

impl Validator for DefaultValidator {
    fn check(&self, input: &Input<'_>) -> ValidationResult {
        let mut result = ValidationResult::default();
        match input {
            Input::NewCategory { title, color } => {
                Self::check_title(&mut result, title);
                Self::check_color(&mut result, color);
            }
            Input::CategoryPatch(patch) => {
                if let Some(title) = &patch.title {
                    Self::check_title(&mut result, title);
                }
                if let Some(color) = &patch.color {
                    Self::check_color(&mut result, color);
                }
            }
            Input::NewTask { title } => Self::check_title(&mut result, title),
        }
        result
    }
}
