//! Read-only secret material surfaced to expressions as `$secrets` and to
//! HTTP authentication policies.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::error::WorkflowError;

/// An immutable bag of named secrets, cheap to clone and share.
#[derive(Debug, Clone, Default)]
pub struct SecretStore {
    entries: Arc<HashMap<String, Value>>,
}

impl SecretStore {
    #[must_use]
    pub fn new(entries: HashMap<String, Value>) -> Self {
        Self {
            entries: Arc::new(entries),
        }
    }

    /// Build a store from the process environment: `ROOK_SECRET_FOO=bar`
    /// becomes the secret `foo`.
    #[must_use]
    pub fn from_env() -> Self {
        let entries = std::env::vars()
            .filter_map(|(key, value)| {
                key.strip_prefix("ROOK_SECRET_")
                    .map(|name| (name.to_lowercase(), Value::String(value)))
            })
            .collect();
        Self::new(entries)
    }

    pub fn get(&self, name: &str) -> Result<&Value, WorkflowError> {
        self.entries.get(name).ok_or_else(|| {
            WorkflowError::authentication("Unknown secret")
                .with_detail(format!("no secret named '{name}' is configured"))
        })
    }

    /// The secrets as one object, for binding into an expression scope.
    #[must_use]
    pub fn as_object(&self) -> Map<String, Value> {
        self.entries
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn get_known_secret() {
        let store = SecretStore::new(HashMap::from([(
            "api_token".to_string(),
            json!("s3cret"),
        )]));
        assert_eq!(store.get("api_token").unwrap(), &json!("s3cret"));
    }

    #[test]
    fn missing_secret_is_authentication_error() {
        let store = SecretStore::default();
        let err = store.get("nope").unwrap_err();
        assert_eq!(err.status, 401);
    }
}
