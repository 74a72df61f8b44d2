//! Typed model of the Serverless Workflow DSL subset the engine executes.
//!
//! Parsing is plain serde: a YAML or JSON document deserializes directly into
//! [`WorkflowDefinition`]. Task kinds are discriminated by key presence, so a
//! task carrying no known kind key fails to parse.

use serde::{Deserialize, Serialize};
use snafu::prelude::*;

mod duration;
mod task;

pub use duration::{parse_iso8601_duration, DurationInline, DurationSpec, Error as DurationError};
pub use task::*;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Failed to parse workflow definition: {source}"))]
    Yaml { source: serde_yaml::Error },

    #[snafu(display("Failed to parse workflow definition: {source}"))]
    Json { source: serde_json::Error },
}

pub type Result<T> = std::result::Result<T, Error>;

/// A complete workflow document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub document: DocumentMetadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<InputDefinition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<OutputDefinition>,
    #[serde(default, rename = "use", skip_serializing_if = "Option::is_none")]
    pub use_: Option<UseDefinition>,
    #[serde(rename = "do")]
    pub do_: TaskList,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub dsl: String,
    pub namespace: String,
    pub name: String,
    pub version: String,
}

/// Reusable resources referenced elsewhere in the document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UseDefinition {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub secrets: Vec<String>,
    #[serde(default, skip_serializing_if = "indexmap::IndexMap::is_empty")]
    pub retries: indexmap::IndexMap<String, RetryPolicyDefinition>,
}

impl WorkflowDefinition {
    pub fn from_yaml(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).context(YamlSnafu)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).context(JsonSnafu)
    }

    /// Look up a reusable retry policy declared under `use.retries`.
    #[must_use]
    pub fn retry_policy(&self, name: &str) -> Option<&RetryPolicyDefinition> {
        self.use_.as_ref().and_then(|u| u.retries.get(name))
    }
}
