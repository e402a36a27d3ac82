use super::migrations;
use super::{CategoryStore, DeadLetterStore, Repository, Storage, StorageError, TaskStore};
use crate::models::{
    Category, CategoryFilter, CategoryPatch, CategorySnapshot, DeadLetter, Page, PageRequest,
    SyncAction, Task,
};
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::debug;

const INIT_SCHEMA: &str = r#"
-- Create schema version table first
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER NOT NULL
);

INSERT INTO schema_version (version)
SELECT 1 WHERE NOT EXISTS (SELECT 1 FROM schema_version);

CREATE TABLE IF NOT EXISTS categories (
    id TEXT PRIMARY KEY,
    title TEXT NOT NULL,
    color TEXT NOT NULL,
    owner TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    UNIQUE (owner, title)
);

-- Snapshots are embedded as a JSON array, not referenced.
CREATE TABLE IF NOT EXISTS tasks (
    id TEXT PRIMARY KEY,
    owner TEXT NOT NULL,
    title TEXT NOT NULL,
    completed BOOLEAN NOT NULL DEFAULT 0,
    categories TEXT NOT NULL DEFAULT '[]',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
"#;

const CATEGORY_COLUMNS: &str = "id, title, color, owner, created_at, updated_at";
const TASK_COLUMNS: &str = "id, owner, title, completed, categories, created_at, updated_at";

pub struct SqliteStorage {
    conn: Mutex<Connection>,
}

impl SqliteStorage {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let path = PathBuf::from(shellexpand::tilde(&path.as_ref().to_string_lossy()).to_string());
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(&path)
            .map_err(|e| StorageError::Storage(format!("Failed to open database: {}", e)))?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(mut conn: Connection) -> Result<Self, StorageError> {
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(INIT_SCHEMA)
            .map_err(|e| StorageError::Storage(format!("Failed to create tables: {}", e)))?;
        migrations::apply_migrations(&mut conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn get_connection(&self) -> Result<MutexGuard<'_, Connection>, StorageError> {
        self.conn
            .lock()
            .map_err(|e| StorageError::Storage(format!("Failed to lock connection: {}", e)))
    }

    fn read<R>(
        &self,
        op: impl FnOnce(&SqliteRepo<'_>) -> Result<R, StorageError>,
    ) -> Result<R, StorageError> {
        let conn = self.get_connection()?;
        op(&SqliteRepo { conn: &conn })
    }

    fn write<R>(
        &self,
        op: impl FnOnce(&SqliteRepo<'_>) -> Result<R, StorageError>,
    ) -> Result<R, StorageError> {
        let mut conn = self.get_connection()?;
        let tx = conn.transaction()?;
        let result = op(&SqliteRepo { conn: &tx })?;
        tx.commit()?;
        Ok(result)
    }
}

/// Store operations over a borrowed connection, which may be an open transaction.
pub struct SqliteRepo<'c> {
    conn: &'c Connection,
}

fn parse_timestamp(idx: usize, value: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn category_from_row(row: &Row<'_>) -> rusqlite::Result<Category> {
    Ok(Category {
        id: row.get(0)?,
        title: row.get(1)?,
        color: row.get(2)?,
        owner: row.get(3)?,
        created_at: parse_timestamp(4, row.get(4)?)?,
        updated_at: parse_timestamp(5, row.get(5)?)?,
    })
}

fn task_from_row(row: &Row<'_>) -> rusqlite::Result<Task> {
    let categories: String = row.get(4)?;
    Ok(Task {
        id: row.get(0)?,
        owner: row.get(1)?,
        title: row.get(2)?,
        completed: row.get(3)?,
        categories: serde_json::from_str(&categories).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(4, Type::Text, Box::new(e))
        })?,
        created_at: parse_timestamp(5, row.get(5)?)?,
        updated_at: parse_timestamp(6, row.get(6)?)?,
    })
}

impl SqliteRepo<'_> {
    fn query_tasks(
        &self,
        sql: &str,
        args: impl rusqlite::Params,
    ) -> Result<Vec<Task>, StorageError> {
        let mut stmt = self.conn.prepare(sql)?;
        let tasks = stmt
            .query_map(args, task_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(tasks)
    }

    fn save_category(&self, category: &Category) -> Result<(), StorageError> {
        self.conn.execute(
            "UPDATE categories SET title = ?2, color = ?3, updated_at = ?4 WHERE id = ?1",
            params![
                category.id,
                category.title,
                category.color,
                category.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }
}

impl CategoryStore for SqliteRepo<'_> {
    fn get_category(&self, id: &str) -> Result<Category, StorageError> {
        self.conn
            .query_row(
                &format!("SELECT {} FROM categories WHERE id = ?1", CATEGORY_COLUMNS),
                [id],
                category_from_row,
            )
            .optional()?
            .ok_or_else(|| StorageError::category_not_found(id))
    }

    fn find_category_by_title(
        &self,
        owner: &str,
        title: &str,
    ) -> Result<Option<Category>, StorageError> {
        Ok(self
            .conn
            .query_row(
                &format!(
                    "SELECT {} FROM categories WHERE owner = ?1 AND title = ?2",
                    CATEGORY_COLUMNS
                ),
                [owner, title],
                category_from_row,
            )
            .optional()?)
    }

    fn list_categories(
        &self,
        owner: &str,
        filter: &CategoryFilter,
        page: PageRequest,
    ) -> Result<Page<Category>, StorageError> {
        let mut clause = String::from("owner = ?");
        let mut args: Vec<String> = vec![owner.to_string()];
        if let Some(title) = &filter.title {
            clause.push_str(" AND title = ?");
            args.push(title.clone());
        }
        if let Some(color) = &filter.color {
            clause.push_str(" AND color = ?");
            args.push(color.clone());
        }

        let count: i64 = self.conn.query_row(
            &format!("SELECT COUNT(*) FROM categories WHERE {}", clause),
            params_from_iter(args.iter()),
            |row| row.get(0),
        )?;
        let count = count.max(0) as u64;
        let total_pages = page.check(count)?;
        if count == 0 {
            return Ok(Page::empty());
        }

        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM categories WHERE {} ORDER BY rowid LIMIT {} OFFSET {}",
            CATEGORY_COLUMNS,
            clause,
            page.limit,
            page.offset()
        ))?;
        let items = stmt
            .query_map(params_from_iter(args.iter()), category_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(Page {
            items,
            total_pages,
            current_page: page.page,
        })
    }

    fn all_categories(&self) -> Result<Vec<Category>, StorageError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM categories ORDER BY rowid",
            CATEGORY_COLUMNS
        ))?;
        let categories = stmt
            .query_map([], category_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(categories)
    }

    fn create_category(
        &self,
        owner: &str,
        title: &str,
        color: &str,
    ) -> Result<Category, StorageError> {
        if self.find_category_by_title(owner, title)?.is_some() {
            return Err(StorageError::Conflict(title.to_string()));
        }
        let category = Category::new(owner, title, color);
        self.conn.execute(
            &format!(
                "INSERT INTO categories ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                CATEGORY_COLUMNS
            ),
            params![
                category.id,
                category.title,
                category.color,
                category.owner,
                category.created_at.to_rfc3339(),
                category.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(category)
    }

    fn update_category(&self, id: &str, patch: &CategoryPatch) -> Result<Category, StorageError> {
        let mut category = self.get_category(id)?;
        if let Some(title) = &patch.title {
            if let Some(existing) = self.find_category_by_title(&category.owner, title)? {
                if existing.id != category.id {
                    return Err(StorageError::Conflict(title.clone()));
                }
            }
        }
        category.apply(patch);
        self.save_category(&category)?;
        Ok(category)
    }

    fn delete_category(&self, id: &str) -> Result<Category, StorageError> {
        let category = self.get_category(id)?;
        self.conn
            .execute("DELETE FROM categories WHERE id = ?1", [id])?;
        Ok(category)
    }
}

impl TaskStore for SqliteRepo<'_> {
    fn get_task(&self, id: &str) -> Result<Task, StorageError> {
        self.conn
            .query_row(
                &format!("SELECT {} FROM tasks WHERE id = ?1", TASK_COLUMNS),
                [id],
                task_from_row,
            )
            .optional()?
            .ok_or_else(|| StorageError::task_not_found(id))
    }

    fn create_task(
        &self,
        owner: &str,
        title: &str,
        categories: Vec<CategorySnapshot>,
    ) -> Result<Task, StorageError> {
        let task = Task::new(owner, title, categories);
        self.conn.execute(
            &format!(
                "INSERT INTO tasks ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                TASK_COLUMNS
            ),
            params![
                task.id,
                task.owner,
                task.title,
                task.completed,
                serde_json::to_string(&task.categories)?,
                task.created_at.to_rfc3339(),
                task.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(task)
    }

    fn list_tasks(&self, owner: Option<&str>) -> Result<Vec<Task>, StorageError> {
        match owner {
            Some(owner) => self.query_tasks(
                &format!("SELECT {} FROM tasks WHERE owner = ?1 ORDER BY rowid", TASK_COLUMNS),
                [owner],
            ),
            None => self.query_tasks(
                &format!("SELECT {} FROM tasks ORDER BY rowid", TASK_COLUMNS),
                [],
            ),
        }
    }

    fn find_by_category_id(&self, category_id: &str) -> Result<Vec<Task>, StorageError> {
        self.query_tasks(
            &format!(
                "SELECT {} FROM tasks WHERE EXISTS (
                    SELECT 1 FROM json_each(tasks.categories)
                    WHERE json_extract(json_each.value, '$.id') = ?1
                ) ORDER BY rowid",
                TASK_COLUMNS
            ),
            [category_id],
        )
    }

    fn replace_categories(
        &self,
        task_id: &str,
        categories: &[CategorySnapshot],
    ) -> Result<(), StorageError> {
        let changed = self.conn.execute(
            "UPDATE tasks SET categories = ?2, updated_at = ?3 WHERE id = ?1",
            params![
                task_id,
                serde_json::to_string(categories)?,
                Utc::now().to_rfc3339(),
            ],
        )?;
        if changed == 0 {
            return Err(StorageError::task_not_found(task_id));
        }
        debug!(task_id, snapshots = categories.len(), "replaced task categories");
        Ok(())
    }
}

impl DeadLetterStore for SqliteRepo<'_> {
    fn push_dead_letters(&self, letters: &[DeadLetter]) -> Result<(), StorageError> {
        let mut stmt = self.conn.prepare(
            "INSERT INTO sync_dead_letters (task_id, category_id, action, error, recorded_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )?;
        for letter in letters {
            stmt.execute(params![
                letter.task_id,
                letter.category_id,
                letter.action.as_str(),
                letter.error,
                letter.recorded_at.to_rfc3339(),
            ])?;
        }
        Ok(())
    }

    fn dead_letters(&self) -> Result<Vec<DeadLetter>, StorageError> {
        let mut stmt = self.conn.prepare(
            "SELECT task_id, category_id, action, error, recorded_at
             FROM sync_dead_letters ORDER BY id",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    parse_timestamp(4, row.get(4)?)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter()
            .map(|(task_id, category_id, action, error, recorded_at)| {
                Ok(DeadLetter {
                    task_id,
                    category_id,
                    action: SyncAction::parse(&action)?,
                    error,
                    recorded_at,
                })
            })
            .collect()
    }

    fn clear_dead_letters(&self) -> Result<usize, StorageError> {
        Ok(self.conn.execute("DELETE FROM sync_dead_letters", [])?)
    }
}

impl CategoryStore for SqliteStorage {
    fn get_category(&self, id: &str) -> Result<Category, StorageError> {
        self.read(|repo| repo.get_category(id))
    }

    fn find_category_by_title(
        &self,
        owner: &str,
        title: &str,
    ) -> Result<Option<Category>, StorageError> {
        self.read(|repo| repo.find_category_by_title(owner, title))
    }

    fn list_categories(
        &self,
        owner: &str,
        filter: &CategoryFilter,
        page: PageRequest,
    ) -> Result<Page<Category>, StorageError> {
        self.read(|repo| repo.list_categories(owner, filter, page))
    }

    fn all_categories(&self) -> Result<Vec<Category>, StorageError> {
        self.read(|repo| repo.all_categories())
    }

    fn create_category(
        &self,
        owner: &str,
        title: &str,
        color: &str,
    ) -> Result<Category, StorageError> {
        self.write(|repo| repo.create_category(owner, title, color))
    }

    fn update_category(&self, id: &str, patch: &CategoryPatch) -> Result<Category, StorageError> {
        self.write(|repo| repo.update_category(id, patch))
    }

    fn delete_category(&self, id: &str) -> Result<Category, StorageError> {
        self.write(|repo| repo.delete_category(id))
    }
}

impl TaskStore for SqliteStorage {
    fn get_task(&self, id: &str) -> Result<Task, StorageError> {
        self.read(|repo| repo.get_task(id))
    }

    fn create_task(
        &self,
        owner: &str,
        title: &str,
        categories: Vec<CategorySnapshot>,
    ) -> Result<Task, StorageError> {
        self.write(|repo| repo.create_task(owner, title, categories))
    }

    fn list_tasks(&self, owner: Option<&str>) -> Result<Vec<Task>, StorageError> {
        self.read(|repo| repo.list_tasks(owner))
    }

    fn find_by_category_id(&self, category_id: &str) -> Result<Vec<Task>, StorageError> {
        self.read(|repo| repo.find_by_category_id(category_id))
    }

    fn replace_categories(
        &self,
        task_id: &str,
        categories: &[CategorySnapshot],
    ) -> Result<(), StorageError> {
        self.write(|repo| repo.replace_categories(task_id, categories))
    }
}

impl DeadLetterStore for SqliteStorage {
    fn push_dead_letters(&self, letters: &[DeadLetter]) -> Result<(), StorageError> {
        self.write(|repo| repo.push_dead_letters(letters))
    }

    fn dead_letters(&self) -> Result<Vec<DeadLetter>, StorageError> {
        self.read(|repo| repo.dead_letters())
    }

    fn clear_dead_letters(&self) -> Result<usize, StorageError> {
        self.write(|repo| repo.clear_dead_letters())
    }
}

impl Storage for SqliteStorage {
    fn transaction(
        &self,
        work: &mut dyn FnMut(&dyn Repository) -> Result<(), StorageError>,
    ) -> Result<(), StorageError> {
        self.write(|repo| work(repo))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sqlite_storage_open() {
        let temp_dir = tempfile::tempdir().unwrap();
        let storage_path = temp_dir.path().join("tasks.db");
        let storage = SqliteStorage::open(&storage_path);
        assert!(storage.is_ok());
        // Reopening an initialized database is a no-op.
        drop(storage);
        assert!(SqliteStorage::open(&storage_path).is_ok());
    }

    #[test]
    fn test_find_by_category_id_matches_embedded_snapshot() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let work = storage.create_category("u1", "Work", "#fff").unwrap();
        let home = storage.create_category("u1", "Home", "#000").unwrap();
        let both = storage
            .create_task("u1", "Both", vec![work.snapshot(), home.snapshot()])
            .unwrap();
        storage
            .create_task("u1", "Home only", vec![home.snapshot()])
            .unwrap();

        let found = storage.find_by_category_id(&work.id).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, both.id);
        assert_eq!(found[0].categories, vec![work.snapshot(), home.snapshot()]);
        assert_eq!(storage.find_by_category_id(&home.id).unwrap().len(), 2);
    }

    #[test]
    fn test_list_categories_pages_in_creation_order() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        for title in ["a", "b", "c"] {
            storage.create_category("u1", title, "#fff").unwrap();
        }
        storage.create_category("u2", "d", "#fff").unwrap();

        let page = storage
            .list_categories("u1", &CategoryFilter::default(), PageRequest::new(2, 2))
            .unwrap();
        assert_eq!(page.total_pages, 2);
        assert_eq!(page.current_page, 2);
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.items[0].title, "c");

        let filtered = storage
            .list_categories(
                "u1",
                &CategoryFilter {
                    title: Some("b".to_string()),
                    color: Some("#fff".to_string()),
                },
                PageRequest::new(1, 10),
            )
            .unwrap();
        assert_eq!(filtered.items.len(), 1);

        let past_end = storage.list_categories("u1", &CategoryFilter::default(), PageRequest::new(3, 2));
        assert!(matches!(
            past_end,
            Err(StorageError::PageNotFound { total_pages: 2, .. })
        ));
    }

    #[test]
    fn test_transaction_rolls_back() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let category = storage.create_category("u1", "Work", "#fff").unwrap();

        let result = storage.transaction(&mut |repo: &dyn Repository| {
            repo.update_category(
                &category.id,
                &CategoryPatch {
                    title: Some("Office".to_string()),
                    color: None,
                },
            )?;
            repo.replace_categories("missing-task", &[])
        });
        assert!(result.is_err());
        assert_eq!(storage.get_category(&category.id).unwrap().title, "Work");
    }

    #[test]
    fn test_dead_letters_round_trip() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let letter = DeadLetter {
            task_id: "t1".to_string(),
            category_id: "c1".to_string(),
            action: SyncAction::Remove,
            error: "disk full".to_string(),
            recorded_at: Utc::now(),
        };
        storage.push_dead_letters(&[letter.clone()]).unwrap();
        let letters = storage.dead_letters().unwrap();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].action, SyncAction::Remove);
        assert_eq!(letters[0].task_id, "t1");
        assert_eq!(storage.clear_dead_letters().unwrap(), 1);
        assert!(storage.dead_letters().unwrap().is_empty());
    }
}
