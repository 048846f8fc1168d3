use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Task {task} depends on unknown task {dependency}")]
    UnknownDependency { task: String, dependency: String },

    #[error("Duplicate task id: {0}")]
    DuplicateTask(String),

    #[error("Cyclic dependency between tasks: {}", .members.join(" -> "))]
    CyclicDependency { members: Vec<String> },

    #[error("Failed to prepare workspace {}: {source}", .path.display())]
    Workspace {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Session limit reached (max: {max})")]
    ConcurrencyLimit { max: usize },

    #[error("Task {task} needs {required} MB but the memory budget is {budget} MB")]
    ResourceBudget {
        task: String,
        required: u64,
        budget: u64,
    },

    #[error("Failed to spawn session for task {task}: {source}")]
    Spawn {
        task: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Environment error: {0}")]
    Environment(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Task already has an active session: {0}")]
    SessionExists(String),

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Invalid transition for task {task} from {from} to {to}")]
    InvalidTransition {
        task: String,
        from: String,
        to: String,
    },

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Task join error: {0}")]
    TaskJoin(String),
}

impl Error {
    /// True for errors that reject a submission before anything runs.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Error::Validation(_)
                | Error::UnknownDependency { .. }
                | Error::DuplicateTask(_)
                | Error::CyclicDependency { .. }
        )
    }

    /// Process exit code for the command surface.
    pub fn exit_code(&self) -> u8 {
        match self {
            Error::SessionNotFound(_) | Error::TaskNotFound(_) => 1,
            Error::Config(_) | Error::TomlParse(_) => 2,
            e if e.is_validation() => 2,
            _ => 3,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
