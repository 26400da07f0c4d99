//! Error and trace types surfaced by the engine.
//!
//! Only three error kinds ever cross the public boundary: `Parse` (a query
//! or dependency path could not be read), `Validation` (schema build or
//! presence checks failed), and `Abort` (a calc requested an unrecoverable
//! stop). Everything else a rule does wrong is recovered per rule into a
//! tagged missing value and, when tracing is on, a [`TraceEntry`].

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use thiserror::Error;

/// Standard result alias for fallible engine operations.
pub type Result<T> = std::result::Result<T, Error>;

/// User-surfaced engine error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// A query or dependency path could not be parsed.
    #[error("parse error: {0}")]
    Parse(String),

    /// Schema build failure, unbindable rule input, or presence violation.
    #[error("validation error: {0}")]
    Validation(String),

    /// Unrecoverable stop requested by a calc.
    #[error("aborted: {0}")]
    Abort(String),
}

/// Response envelope returned by [`Context::resolve`](crate::Context::resolve).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Outcome {
    pub output: Json,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub debug_trace: Option<Vec<TraceEntry>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub err: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

impl Outcome {
    pub(crate) fn ok(output: Json, debug_trace: Option<Vec<TraceEntry>>) -> Self {
        Self {
            output,
            debug_trace,
            err: None,
            status: None,
        }
    }

    pub(crate) fn failed(error: Error, debug_trace: Option<Vec<TraceEntry>>) -> Self {
        let status = match &error {
            Error::Abort(_) => Some("abort".to_string()),
            _ => None,
        };
        Self {
            output: Json::Null,
            debug_trace,
            err: Some(error.to_string()),
            status,
        }
    }
}

/// One derivation recorded while debug tracing is enabled.
///
/// `output` and `location` carry concrete indices (`$.crew[1].position`),
/// not the schema's abstract `[]` form.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceEntry {
    /// Absolute path of the derived value.
    pub output: String,
    /// The derived value, JSON-rendered.
    pub result: Json,
    /// Resolved input slots, by name.
    pub inputs: serde_json::Map<String, Json>,
    /// Rule source text, when the rule has any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub calc: Option<String>,
    /// Absolute path of the container the rule ran in.
    pub location: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Json>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exception: Option<String>,
    /// Opaque `[file, line]` carried through from the schema document.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rule_location: Option<(String, u64)>,
}
