//! Transport-neutral operation results.

use serde::Serialize;
use serde_json::{Map, Value};
use tracing::error;

use crate::error::LifecycleError;

/// `{ok, code?, message?, ...details}` as handed to a transport layer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OperationResult {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(flatten)]
    pub details: Map<String, Value>,
}

impl OperationResult {
    pub fn success<T: Serialize>(details: &T) -> Self {
        let details = match serde_json::to_value(details) {
            Ok(Value::Object(map)) => map,
            Ok(Value::Null) => Map::new(),
            Ok(other) => {
                let mut map = Map::new();
                map.insert("result".into(), other);
                map
            }
            Err(e) => return Self::failure(&LifecycleError::Internal(e.to_string())),
        };
        Self {
            ok: true,
            code: None,
            message: None,
            details,
        }
    }

    /// Internal errors are logged with context and surfaced generically.
    pub fn failure(err: &LifecycleError) -> Self {
        let mut details = Map::new();
        let message = match err {
            LifecycleError::Internal(detail) => {
                error!(error = %detail, "Internal error in lifecycle operation");
                "internal error".to_string()
            }
            LifecycleError::DependenciesNotSatisfied { task, missing } => {
                details.insert("task".into(), Value::String(task.clone()));
                details.insert(
                    "missing".into(),
                    Value::Array(missing.iter().cloned().map(Value::String).collect()),
                );
                err.to_string()
            }
            other => other.to_string(),
        };
        Self {
            ok: false,
            code: Some(err.code().to_string()),
            message: Some(message),
            details,
        }
    }

    pub fn from_result<T: Serialize>(result: &Result<T, LifecycleError>) -> Self {
        match result {
            Ok(value) => Self::success(value),
            Err(e) => Self::failure(e),
        }
    }
}
