//! JSON-schema validation gateway.
//!
//! Thin wrapper over the `jsonschema` crate: compile the schema document,
//! validate, and fold any failure into a schema-kind [`WorkflowError`].
//! Deterministic and side-effect-free, like the expression gateway.

use serde_json::Value;

use crate::dsl::SchemaDefinition;
use crate::error::WorkflowError;

/// Validate `value` against a DSL schema definition.
///
/// Only the `json` format (the default) is supported; anything else is a
/// configuration error.
pub fn validate(value: &Value, schema: &SchemaDefinition) -> Result<(), WorkflowError> {
    if let Some(format) = &schema.format
        && format != "json"
    {
        return Err(
            WorkflowError::configuration("Unsupported schema format")
                .with_detail(format!("format '{format}' is not supported")),
        );
    }

    let validator = jsonschema::validator_for(&schema.document).map_err(|e| {
        WorkflowError::configuration("Invalid schema document").with_detail(e.to_string())
    })?;

    let failures: Vec<String> = validator
        .iter_errors(value)
        .map(|error| format!("{} at {}", error, error.instance_path))
        .collect();

    if failures.is_empty() {
        Ok(())
    } else {
        Err(WorkflowError::schema("Schema validation failed").with_detail(failures.join("; ")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema(document: Value) -> SchemaDefinition {
        SchemaDefinition {
            format: None,
            document,
        }
    }

    #[test]
    fn valid_value_passes() {
        let schema = schema(json!({
            "type": "object",
            "required": ["name"],
            "properties": {"name": {"type": "string"}}
        }));
        assert!(validate(&json!({"name": "ada"}), &schema).is_ok());
    }

    #[test]
    fn invalid_value_reports_schema_error() {
        let schema = schema(json!({"type": "object", "required": ["name"]}));
        let err = validate(&json!({}), &schema).unwrap_err();
        assert_eq!(err.status, 400);
        assert!(err.error_type.ends_with("/schema"));
    }

    #[test]
    fn unknown_format_is_a_configuration_error() {
        let schema = SchemaDefinition {
            format: Some("avro".to_string()),
            document: json!({}),
        };
        let err = validate(&json!({}), &schema).unwrap_err();
        assert!(err.error_type.ends_with("/configuration"));
    }
}
