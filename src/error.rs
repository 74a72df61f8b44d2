use serde::{Deserialize, Serialize};

use crate::position::NodePosition;

/// Semantic category of a workflow error.
///
/// These map onto the error type URIs the DSL carries in error payloads and
/// are the categories catch filters match against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorKind {
    Communication,
    Runtime,
    Configuration,
    Expression,
    Schema,
    Authentication,
    Timeout,
}

impl ErrorKind {
    /// Stable identifier carried in error payloads.
    #[must_use]
    pub fn identifier(&self) -> &'static str {
        match self {
            ErrorKind::Communication => "communication",
            ErrorKind::Runtime => "runtime",
            ErrorKind::Configuration => "configuration",
            ErrorKind::Expression => "expression",
            ErrorKind::Schema => "schema",
            ErrorKind::Authentication => "authentication",
            ErrorKind::Timeout => "timeout",
        }
    }

    /// URI form of the identifier, as carried in the `type` field.
    #[must_use]
    pub fn uri(&self) -> String {
        format!(
            "https://serverlessworkflow.io/spec/1.0.0/errors/{}",
            self.identifier()
        )
    }

    /// Default HTTP-style status for this category.
    #[must_use]
    pub fn default_status(&self) -> u16 {
        match self {
            ErrorKind::Configuration | ErrorKind::Expression | ErrorKind::Schema => 400,
            ErrorKind::Authentication => 401,
            ErrorKind::Timeout => 408,
            ErrorKind::Communication | ErrorKind::Runtime => 500,
        }
    }

    /// Parse an identifier or type URI back into a kind.
    #[must_use]
    pub fn from_type(value: &str) -> Option<Self> {
        let tail = value.rsplit('/').next().unwrap_or(value);
        match tail.to_ascii_lowercase().as_str() {
            "communication" => Some(ErrorKind::Communication),
            "runtime" => Some(ErrorKind::Runtime),
            "configuration" => Some(ErrorKind::Configuration),
            "expression" => Some(ErrorKind::Expression),
            "schema" | "validation" => Some(ErrorKind::Schema),
            "authentication" => Some(ErrorKind::Authentication),
            "timeout" => Some(ErrorKind::Timeout),
            _ => None,
        }
    }
}

/// A raised workflow error, in the problem-details shape the DSL prescribes.
///
/// This is the value that travels the error raise protocol: any failure inside
/// a node's execute/complete becomes one of these, ancestors are walked for a
/// catching `try`, and an uncaught error faults the instance with the error
/// recorded in its final snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowError {
    #[serde(rename = "type")]
    pub error_type: String,
    pub status: u16,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
}

impl WorkflowError {
    #[must_use]
    pub fn new(kind: ErrorKind, title: impl Into<String>) -> Self {
        Self {
            error_type: kind.uri(),
            status: kind.default_status(),
            title: title.into(),
            detail: None,
            instance: None,
        }
    }

    #[must_use]
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    #[must_use]
    pub fn with_status(mut self, status: u16) -> Self {
        self.status = status;
        self
    }

    #[must_use]
    pub fn at(mut self, position: &NodePosition) -> Self {
        self.instance = Some(position.to_string());
        self
    }

    /// The semantic category, derived from the `type` field.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::from_type(&self.error_type).unwrap_or(ErrorKind::Runtime)
    }

    pub fn communication(title: impl Into<String>) -> Self {
        Self::new(ErrorKind::Communication, title)
    }

    pub fn runtime(title: impl Into<String>) -> Self {
        Self::new(ErrorKind::Runtime, title)
    }

    pub fn configuration(title: impl Into<String>) -> Self {
        Self::new(ErrorKind::Configuration, title)
    }

    pub fn expression(title: impl Into<String>) -> Self {
        Self::new(ErrorKind::Expression, title)
    }

    pub fn schema(title: impl Into<String>) -> Self {
        Self::new(ErrorKind::Schema, title)
    }

    pub fn authentication(title: impl Into<String>) -> Self {
        Self::new(ErrorKind::Authentication, title)
    }

    pub fn timeout(title: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, title)
    }
}

impl std::fmt::Display for WorkflowError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {} ({})", self.status, self.title, self.error_type)?;
        if let Some(detail) = &self.detail {
            write!(f, ": {detail}")?;
        }
        Ok(())
    }
}

impl std::error::Error for WorkflowError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_round_trips_through_type_uri() {
        for kind in [
            ErrorKind::Communication,
            ErrorKind::Runtime,
            ErrorKind::Configuration,
            ErrorKind::Expression,
            ErrorKind::Schema,
            ErrorKind::Authentication,
            ErrorKind::Timeout,
        ] {
            assert_eq!(ErrorKind::from_type(&kind.uri()), Some(kind));
            assert_eq!(ErrorKind::from_type(kind.identifier()), Some(kind));
        }
    }

    #[test]
    fn serializes_as_problem_details() {
        let err = WorkflowError::timeout("Request timed out").with_detail("after 30s");
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(
            json["type"],
            "https://serverlessworkflow.io/spec/1.0.0/errors/timeout"
        );
        assert_eq!(json["status"], 408);
        assert_eq!(json["title"], "Request timed out");
        assert_eq!(json["detail"], "after 30s");
        assert!(json.get("instance").is_none());
    }

    #[test]
    fn default_statuses() {
        assert_eq!(WorkflowError::expression("x").status, 400);
        assert_eq!(WorkflowError::authentication("x").status, 401);
        assert_eq!(WorkflowError::communication("x").status, 500);
    }
}
