//! Loading task submissions from disk.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::dag::DependencyGraph;
use crate::core::task::TaskSpec;
use crate::{Error, Result};

/// A batch of tasks submitted as one graph.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Submission {
    #[serde(default)]
    pub tasks: Vec<TaskSpec>,
}

impl Submission {
    /// Parse a submission file. `.toml` files are read as TOML, anything
    /// else as JSON.
    pub fn from_path(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => {
                Error::Validation(format!("submission not found: {}", path.display()))
            }
            _ => Error::Io(e),
        })?;
        let is_toml = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
        let submission = if is_toml {
            Self::from_toml(&content)?
        } else {
            Self::from_json(&content)?
        };
        debug!(
            path = %path.display(),
            tasks = submission.tasks.len(),
            "loaded submission"
        );
        Ok(submission)
    }

    pub fn from_json(content: &str) -> Result<Self> {
        serde_json::from_str(content)
            .map_err(|e| Error::Validation(format!("invalid submission: {e}")))
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::Validation(format!("invalid submission: {e}")))
    }

    /// Validate and build the dependency graph.
    pub fn into_graph(self) -> Result<DependencyGraph> {
        DependencyGraph::from_tasks(self.tasks)
    }
}
