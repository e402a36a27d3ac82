use crate::config::{ConfigError, ConfigManager};
use crate::controllers::{CategoryChange, CategoryController, ControllerError, TaskController};
use crate::models::{CategoryFilter, CategoryPatch, PageRequest, StorageError};
use crate::storage::config::StorageConfig;
use crate::synchronizer::{SyncSettings, Synchronizer};
use crate::users::StaticUser;
use crate::validation::DefaultValidator;
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum CliError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("{0}")]
    Storage(#[from] StorageError),
    #[error("{0}")]
    Controller(#[from] ControllerError),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Parser, Debug)]
#[command(
    name = "trtasks",
    version,
    about = "Tasks and categories, with category copies in tasks kept in sync"
)]
pub struct Cli {
    /// Config file to use instead of ~/.config/trtasks/config.json
    #[arg(long, global = true, env = "TRTASKS_CONFIG")]
    pub config: Option<PathBuf>,

    /// Acting user; falls back to the default-user setting
    #[arg(long, global = true, env = "TRTASKS_USER")]
    pub user: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Manage categories
    Category {
        #[command(subcommand)]
        action: CategoryCommand,
    },
    /// Manage tasks
    Task {
        #[command(subcommand)]
        action: TaskCommand,
    },
    /// Inspect and repair category copies held by tasks
    Sync {
        #[command(subcommand)]
        action: SyncCommand,
    },
    /// Read and change settings
    Config {
        #[command(subcommand)]
        action: ConfigCommand,
    },
}

#[derive(Subcommand, Debug)]
pub enum CategoryCommand {
    Add {
        title: String,
        #[arg(long)]
        color: String,
    },
    Get {
        id: String,
    },
    List(ListArgs),
    Update {
        id: String,
        #[arg(long)]
        title: Option<String>,
        #[arg(long)]
        color: Option<String>,
    },
    Delete {
        id: String,
    },
}

#[derive(Args, Debug)]
pub struct ListArgs {
    #[arg(long, default_value_t = 1)]
    pub page: u32,
    /// Page size; defaults to the page-size setting
    #[arg(long)]
    pub limit: Option<u32>,
    #[arg(long)]
    pub title: Option<String>,
    #[arg(long)]
    pub color: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum TaskCommand {
    Add {
        title: String,
        /// Category id to attach; repeatable
        #[arg(long = "category")]
        categories: Vec<String>,
    },
    List,
    Show {
        id: String,
    },
    Attach {
        task_id: String,
        category_id: String,
    },
}

#[derive(Subcommand, Debug)]
pub enum SyncCommand {
    /// Rewrite every stale or orphaned category copy
    Reconcile,
    /// Show task writes that exhausted their retries
    DeadLetters,
    ClearDeadLetters,
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    Get { key: String },
    Set { key: String, value: String },
    Unset { key: String },
    List,
}

fn print_json<T: Serialize>(value: &T) -> Result<(), CliError> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Prints `err` to stderr. A partially propagated change was still committed,
/// so its category and report also go to stdout.
pub fn report_error(err: &CliError) {
    if let CliError::Controller(ControllerError::PartialPropagationFailure { category, report }) =
        err
    {
        let change = CategoryChange {
            category: category.as_ref().clone(),
            propagation: report.clone(),
        };
        if let Ok(json) = serde_json::to_string_pretty(&change) {
            println!("{}", json);
        }
    }
    eprintln!("Error: {}", err);
}

impl Cli {
    pub fn run(self) -> Result<(), CliError> {
        let mut manager = ConfigManager::load(self.config.as_deref())?;
        debug!(path = %manager.path().display(), "loaded config");

        if let Command::Config { action } = &self.command {
            return run_config(&mut manager, action);
        }

        let config = manager.effective();
        let storage = StorageConfig::from_config(&config)?.open()?;
        let synchronizer = Synchronizer::new(SyncSettings::from_config(&config)?);
        let users = StaticUser::new(self.user.or(config.default_user.clone()));
        let validator = DefaultValidator;
        let page_size = config.page_size.unwrap_or(10);

        match self.command {
            Command::Category { action } => {
                let controller =
                    CategoryController::new(storage.as_ref(), &users, &validator, synchronizer);
                match action {
                    CategoryCommand::Add { title, color } => {
                        print_json(&controller.create_category(&title, &color)?)
                    }
                    CategoryCommand::Get { id } => print_json(&controller.get_category(Some(&id))?),
                    CategoryCommand::List(args) => {
                        let filter = CategoryFilter {
                            title: args.title,
                            color: args.color,
                        };
                        let page = PageRequest::new(args.page, args.limit.unwrap_or(page_size));
                        print_json(&controller.list_categories(&filter, page)?)
                    }
                    CategoryCommand::Update { id, title, color } => {
                        let patch = CategoryPatch { title, color };
                        print_json(&controller.update_category(Some(&id), &patch)?)
                    }
                    CategoryCommand::Delete { id } => {
                        print_json(&controller.delete_category(Some(&id))?)
                    }
                }
            }
            Command::Task { action } => {
                let controller = TaskController::new(storage.as_ref(), &users, &validator);
                match action {
                    TaskCommand::Add { title, categories } => {
                        print_json(&controller.create_task(&title, &categories)?)
                    }
                    TaskCommand::List => print_json(&controller.list_tasks()?),
                    TaskCommand::Show { id } => print_json(&controller.get_task(Some(&id))?),
                    TaskCommand::Attach {
                        task_id,
                        category_id,
                    } => print_json(&controller.attach_category(Some(&task_id), Some(&category_id))?),
                }
            }
            Command::Sync { action } => {
                let controller = TaskController::new(storage.as_ref(), &users, &validator);
                match action {
                    SyncCommand::Reconcile => print_json(&controller.reconcile(&synchronizer)?),
                    SyncCommand::DeadLetters => print_json(&controller.dead_letters()?),
                    SyncCommand::ClearDeadLetters => {
                        let cleared = controller.clear_dead_letters()?;
                        println!("Cleared {} dead letter(s)", cleared);
                        Ok(())
                    }
                }
            }
            Command::Config { .. } => Ok(()),
        }
    }
}

fn run_config(manager: &mut ConfigManager, action: &ConfigCommand) -> Result<(), CliError> {
    match action {
        ConfigCommand::Get { key } => match manager.get(key) {
            Some(value) => println!("{}", value),
            None if crate::config::KEYS.contains(&key.as_str()) => println!("null"),
            None => return Err(ConfigError::InvalidKey(key.clone()).into()),
        },
        ConfigCommand::Set { key, value } => {
            manager.set(key, value)?;
            println!("{} = {}", key, value);
        }
        ConfigCommand::Unset { key } => {
            manager.unset(key)?;
            println!("Unset {}", key);
        }
        ConfigCommand::List => {
            for (key, value, is_default) in manager.list() {
                if is_default {
                    println!("{} = {} (default)", key, value);
                } else {
                    println!("{} = {}", key, value);
                }
            }
        }
    }
    Ok(())
}
