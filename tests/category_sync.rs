use std::time::Duration;
use tempfile::TempDir;
use trusty_rusty_tasks::controllers::{CategoryController, ControllerError, TaskController};
use trusty_rusty_tasks::models::{CategoryPatch, CategorySnapshot};
use trusty_rusty_tasks::storage::{JsonStorage, SqliteStorage, Storage, TaskStore};
use trusty_rusty_tasks::synchronizer::{SyncMode, SyncSettings, Synchronizer};
use trusty_rusty_tasks::users::StaticUser;
use trusty_rusty_tasks::validation::DefaultValidator;

fn setup_test_env() -> (Vec<Box<dyn Storage>>, TempDir) {
    let temp_dir = tempfile::Builder::new()
        .prefix("trtasks_test")
        .tempdir()
        .expect("Failed to create temporary directory");
    let json = JsonStorage::new(temp_dir.path().join("data.json"))
        .expect("Failed to create json storage");
    let sqlite = SqliteStorage::open(temp_dir.path().join("data.db"))
        .expect("Failed to create sqlite storage");
    (vec![Box::new(json), Box::new(sqlite)], temp_dir)
}

fn synchronizer(mode: SyncMode) -> Synchronizer {
    Synchronizer::new(SyncSettings {
        mode,
        max_attempts: 3,
        backoff: Duration::from_millis(1),
        timeout: Duration::from_secs(2),
    })
}

const MODES: [SyncMode; 2] = [SyncMode::Transaction, SyncMode::Retry];

#[test]
fn test_rename_reaches_every_task() {
    for mode in MODES {
        let (engines, _temp_dir) = setup_test_env();
        for storage in &engines {
            let users = StaticUser::new(Some("u1".to_string()));
            let categories =
                CategoryController::new(storage.as_ref(), &users, &DefaultValidator, synchronizer(mode));
            let tasks = TaskController::new(storage.as_ref(), &users, &DefaultValidator);

            let work = categories.create_category("Work", "#ff0000").unwrap();
            let first = tasks.create_task("Report", &[work.id.clone()]).unwrap();
            let second = tasks.create_task("Slides", &[work.id.clone()]).unwrap();
            let loose = tasks.create_task("Groceries", &[]).unwrap();

            let patch = CategoryPatch {
                title: Some("Office".to_string()),
                color: None,
            };
            let change = categories.update_category(Some(&work.id), &patch).unwrap();
            assert_eq!(change.category.title, "Office");
            assert_eq!(change.category.color, "#ff0000");
            assert_eq!(change.propagation.updated.len(), 2);

            let expected = vec![CategorySnapshot {
                id: work.id.clone(),
                title: "Office".to_string(),
                color: "#ff0000".to_string(),
            }];
            for id in [&first.id, &second.id] {
                assert_eq!(storage.get_task(id).unwrap().categories, expected);
            }
            assert!(storage.get_task(&loose.id).unwrap().categories.is_empty());
        }
    }
}

#[test]
fn test_delete_removes_snapshots_and_keeps_other_categories() {
    for mode in MODES {
        let (engines, _temp_dir) = setup_test_env();
        for storage in &engines {
            let users = StaticUser::new(Some("u1".to_string()));
            let categories =
                CategoryController::new(storage.as_ref(), &users, &DefaultValidator, synchronizer(mode));
            let tasks = TaskController::new(storage.as_ref(), &users, &DefaultValidator);

            let work = categories.create_category("Work", "#ff0000").unwrap();
            let home = categories.create_category("Home", "#00ff00").unwrap();
            let task = tasks
                .create_task("Report", &[work.id.clone(), home.id.clone()])
                .unwrap();

            let change = categories.delete_category(Some(&work.id)).unwrap();
            assert_eq!(change.category.id, work.id);
            assert_eq!(change.propagation.updated, vec![task.id.clone()]);

            let stored = storage.get_task(&task.id).unwrap();
            assert_eq!(stored.categories, vec![home.snapshot()]);
            assert!(storage.find_by_category_id(&work.id).unwrap().is_empty());

            assert!(matches!(
                categories.delete_category(Some(&work.id)),
                Err(ControllerError::NotFound(_))
            ));
            assert_eq!(storage.get_task(&task.id).unwrap().categories, vec![home.snapshot()]);
        }
    }
}

#[test]
fn test_rejected_updates_leave_tasks_untouched() {
    let (engines, _temp_dir) = setup_test_env();
    for storage in &engines {
        let users = StaticUser::new(Some("u1".to_string()));
        let categories = CategoryController::new(
            storage.as_ref(),
            &users,
            &DefaultValidator,
            synchronizer(SyncMode::Transaction),
        );
        let tasks = TaskController::new(storage.as_ref(), &users, &DefaultValidator);

        let work = categories.create_category("Work", "#ff0000").unwrap();
        categories.create_category("Home", "#00ff00").unwrap();
        let task = tasks.create_task("Report", &[work.id.clone()]).unwrap();

        let rename_to_home = CategoryPatch {
            title: Some("Home".to_string()),
            color: None,
        };
        assert!(matches!(
            categories.update_category(Some(&work.id), &rename_to_home),
            Err(ControllerError::Conflict(_))
        ));
        assert!(matches!(
            categories.update_category(Some("no-such-id"), &rename_to_home),
            Err(ControllerError::NotFound(_))
        ));
        assert!(matches!(
            categories.update_category(None, &rename_to_home),
            Err(ControllerError::MissingIdentifier)
        ));
        assert!(matches!(
            categories.create_category("Work", "#000000"),
            Err(ControllerError::Conflict(_))
        ));

        assert_eq!(storage.get_category(&work.id).unwrap().title, "Work");
        assert_eq!(storage.get_task(&task.id).unwrap().categories, vec![work.snapshot()]);
    }
}

#[test]
fn test_same_title_allowed_for_different_users() {
    let (engines, _temp_dir) = setup_test_env();
    for storage in &engines {
        let alice = StaticUser::new(Some("alice".to_string()));
        let bob = StaticUser::new(Some("bob".to_string()));
        let sync = || synchronizer(SyncMode::Transaction);

        let theirs = CategoryController::new(storage.as_ref(), &alice, &DefaultValidator, sync())
            .create_category("Work", "#ff0000")
            .unwrap();
        let bobs = CategoryController::new(storage.as_ref(), &bob, &DefaultValidator, sync());
        let mine = bobs.create_category("Work", "#0000ff").unwrap();

        assert_ne!(theirs.id, mine.id);
        assert!(matches!(
            bobs.delete_category(Some(&theirs.id)),
            Err(ControllerError::NotFound(_))
        ));
        assert!(storage.get_category(&theirs.id).is_ok());
    }
}

#[test]
fn test_reconcile_repairs_drifted_snapshots() {
    let (engines, _temp_dir) = setup_test_env();
    for storage in &engines {
        let users = StaticUser::new(Some("u1".to_string()));
        let tasks = TaskController::new(storage.as_ref(), &users, &DefaultValidator);

        let work = storage.create_category("u1", "Work", "#ff0000").unwrap();
        let stale = CategorySnapshot {
            id: work.id.clone(),
            title: "Old".to_string(),
            color: "#ff0000".to_string(),
        };
        let orphan = CategorySnapshot {
            id: "gone".to_string(),
            title: "Gone".to_string(),
            color: "#000000".to_string(),
        };
        let task = storage
            .create_task("u1", "Report", vec![stale, orphan])
            .unwrap();

        let report = tasks.reconcile(&synchronizer(SyncMode::Retry)).unwrap();
        assert_eq!(report.tasks_repaired, 1);
        assert_eq!(report.snapshots_refreshed, 1);
        assert_eq!(report.snapshots_removed, 1);
        assert_eq!(storage.get_task(&task.id).unwrap().categories, vec![work.snapshot()]);

        let again = tasks.reconcile(&synchronizer(SyncMode::Retry)).unwrap();
        assert_eq!(again.tasks_repaired, 0);
    }
}

#[test]
fn test_json_storage_persists_across_reopen() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("data.json");
    let users = StaticUser::new(Some("u1".to_string()));

    let (work_id, task_id) = {
        let storage = JsonStorage::new(&path).unwrap();
        let categories = CategoryController::new(
            &storage,
            &users,
            &DefaultValidator,
            synchronizer(SyncMode::Transaction),
        );
        let work = categories.create_category("Work", "#ff0000").unwrap();
        let task = TaskController::new(&storage, &users, &DefaultValidator)
            .create_task("Report", &[work.id.clone()])
            .unwrap();
        categories
            .update_category(
                Some(&work.id),
                &CategoryPatch {
                    title: None,
                    color: Some("#123456".to_string()),
                },
            )
            .unwrap();
        (work.id, task.id)
    };

    let storage = JsonStorage::new(&path).unwrap();
    let task = storage.get_task(&task_id).unwrap();
    assert_eq!(task.categories[0].id, work_id);
    assert_eq!(task.categories[0].color, "#123456");
}
