//! # lazygraph-core
//!
//! Stateless, JSON-schema-driven rules engine: declare a typed schema
//! whose nodes carry derivation rules, feed a partial JSON document, and
//! query paths — derivation is lazy, memoized per query, resolved in
//! dependency order, and bounded against cycles.
//!
//! ## Module Roles
//!
//! | Module | Responsibility | Public Entry Points |
//! |---|---|---|
//! | `schema` | Typed node graph built from a schema document | [`Graph`], [`GraphBuilder`] |
//! | `path` | Query/dependency path AST + parser | [`Path`], [`parse_query`] |
//! | `value` | Runtime values, `Missing` sentinel, coercions | [`Value`], [`NodeType`] |
//! | `rule` | Rule descriptor compilation, host calcs | [`CalcInputs`], [`CalcRegistry`] |
//! | `expr` | Bundled calc expression subset | `expr::compile`, `expr::eval` |
//! | `resolver` | Lazy memoized evaluation engine | (internal) |
//! | `context` | Per-document façade | [`Context`], [`Options`] |
//! | `error` | Errors, envelope, trace entries | [`Error`], [`Outcome`], [`TraceEntry`] |
//!
//! ## Evaluation Contract
//!
//! 1. Build a [`Graph`] once; it is immutable and freely shareable.
//! 2. Create a [`Context`] per input document.
//! 3. Query. Each query gets a fresh input copy and fresh per-query
//!    state; concrete input values dominate rules, defaults bind next,
//!    rules run last. Calc failures recover to missing values; only
//!    validation and abort errors surface.
//!
//! ## Hello World
//!
//! ```no_run
//! use lazygraph_core::Graph;
//! use serde_json::json;
//!
//! let graph = Graph::build(&json!({
//!     "type": "object",
//!     "properties": {
//!         "price": {"type": "number"},
//!         "qty": {"type": "number", "default": 1},
//!         "total": {"type": "number", "rule": "${price} * ${qty}"}
//!     }
//! })).expect("schema");
//!
//! let ctx = graph.context(json!({"price": 5, "qty": 2}));
//! assert_eq!(ctx.get("total").expect("total"), json!(10));
//! ```
//!
//! ## Host Calcs
//!
//! ```no_run
//! use lazygraph_core::{CalcInputs, Graph, Value};
//! use serde_json::json;
//!
//! let graph = Graph::builder()
//!     .register_calc("shout", |inputs: &CalcInputs| {
//!         let name = inputs.get("name").display_string();
//!         Ok(Value::Str(name.to_uppercase().as_str().into()))
//!     })
//!     .build(&json!({
//!         "type": "object",
//!         "properties": {
//!             "name": {"type": "string"},
//!             "loud": {"type": "string",
//!                      "rule": {"inputs": {"name": "name"}, "calc": {"fn": "shout"}}}
//!         }
//!     }))
//!     .expect("schema");
//! let out = graph.context(json!({"name": "ada"})).get("loud").expect("loud");
//! assert_eq!(out, json!("ADA"));
//! ```

use serde_json::Value as Json;

pub mod context;
pub mod error;
pub mod expr;
pub mod path;
pub mod rule;
pub mod schema;
pub mod value;

mod resolver;
mod stack;

pub use context::{Context, InputValidator, Options};
pub use error::{Error, Outcome, Result, TraceEntry};
pub use path::{parse_query, Path};
pub use rule::{CalcError, CalcInputs, CalcRegistry};
pub use schema::{Graph, GraphBuilder, NodeId};
pub use value::{NodeType, Value};

/// One-shot evaluation: build the schema, wrap the input, resolve the
/// query, and return the raw output.
pub fn eval(schema: &Json, input: Json, query: &str) -> Result<Json> {
    let graph = Graph::build(schema)?;
    graph.context(input).get(query)
}

/// One-shot evaluation returning the full response envelope.
pub fn eval_with_trace(schema: &Json, input: Json, query: &str) -> Result<Outcome> {
    let graph = Graph::build(schema)?;
    let ctx = graph.context(input).with_debug(true);
    Ok(ctx.resolve(query))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn one_shot_eval() {
        let out = eval(
            &json!({
                "type": "object",
                "properties": {
                    "a": {"type": "number"},
                    "b": {"type": "number", "rule": "${a} + 1"}
                }
            }),
            json!({"a": 41}),
            "b",
        )
        .unwrap();
        assert_eq!(out, json!(42));
    }

    #[test]
    fn one_shot_trace() {
        let outcome = eval_with_trace(
            &json!({
                "type": "object",
                "properties": {
                    "a": {"type": "number"},
                    "b": {"type": "number", "rule": "${a} + 1"}
                }
            }),
            json!({"a": 41}),
            "b",
        )
        .unwrap();
        assert_eq!(outcome.output, json!(42));
        let trace = outcome.debug_trace.expect("trace enabled");
        assert_eq!(trace.len(), 1);
        assert_eq!(trace[0].output, "$.b");
    }
}
