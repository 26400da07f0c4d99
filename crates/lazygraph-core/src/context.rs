//! Per-input-document façade.
//!
//! A [`Context`] pairs a shared [`Graph`] with one JSON input. Every call
//! deep-copies the input into a fresh mutable tree, runs the optional
//! input validator seam, resolves, and drops all per-query state — so
//! serial queries on one context are always isolated, and the graph can
//! be shared freely.

use crate::error::{Error, Outcome, Result, TraceEntry};
use crate::path::{self, Path, Segment};
use crate::resolver::Evaluation;
use crate::schema::{Graph, NodeId, NodeKind};
use crate::value::Value;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as Json};
use std::collections::HashSet;

/// Per-context evaluation options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Options {
    /// Record a [`TraceEntry`] per derivation and tag missing values with
    /// reasons.
    pub debug: bool,
    /// Cycle-guard depth bound.
    pub recursion_limit: u32,
    /// Run the registered input validator before resolving.
    pub validate_input: bool,
}

impl Default for Options {
    fn default() -> Options {
        Options {
            debug: false,
            recursion_limit: 8,
            validate_input: true,
        }
    }
}

/// Structural input validation seam. JSON-Schema validation itself is an
/// external collaborator; the engine only honors the verdict.
pub trait InputValidator {
    fn validate(&self, input: &Json) -> std::result::Result<(), String>;
}

/// Evaluation handle for one input document.
pub struct Context<'g> {
    graph: &'g Graph,
    input: Json,
    options: Options,
    validator: Option<Box<dyn InputValidator + Send + Sync>>,
}

impl<'g> Context<'g> {
    pub(crate) fn new(graph: &'g Graph, input: Json) -> Context<'g> {
        Context {
            graph,
            input,
            options: Options::default(),
            validator: None,
        }
    }

    pub fn with_options(mut self, options: Options) -> Self {
        self.options = options;
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.options.debug = debug;
        self
    }

    pub fn with_validator(mut self, validator: Box<dyn InputValidator + Send + Sync>) -> Self {
        self.validator = Some(validator);
        self
    }

    /// Resolve a query into the response envelope. Errors are recovered
    /// into the envelope, never raised.
    pub fn resolve(&self, query: &str) -> Outcome {
        let path = match path::parse_query(query) {
            Ok(p) => p,
            Err(e) => return Outcome::failed(e, None),
        };
        let (result, trace) = self.run(&path, self.options.debug);
        match result {
            Ok(v) => Outcome::ok(v.to_json(), trace),
            Err(e) => Outcome::failed(e, trace),
        }
    }

    /// Resolve several queries; the output is their structural union,
    /// each slice nested under its own path.
    pub fn resolve_paths(&self, queries: &[&str]) -> Outcome {
        let mut output = Json::Object(Map::new());
        let mut traces: Vec<TraceEntry> = Vec::new();
        for query in queries {
            let path = match path::parse_query(query) {
                Ok(p) => p,
                Err(e) => return Outcome::failed(e, None),
            };
            let (result, trace) = self.run(&path, self.options.debug);
            match result {
                Ok(v) => merge_json(&mut output, nest_under(&path, v.to_json())),
                Err(e) => return Outcome::failed(e, trace),
            }
            traces.extend(trace.unwrap_or_default());
        }
        let trace = if self.options.debug { Some(traces) } else { None };
        Outcome::ok(output, trace)
    }

    /// Resolve and return the raw output, raising on error.
    pub fn get(&self, query: &str) -> Result<Json> {
        let path = path::parse_query(query)?;
        let (result, _) = self.run(&path, false);
        Ok(result?.to_json())
    }

    /// Missing- and invisible-stripped view of the resolved slice.
    pub fn get_json(&self, query: &str) -> Result<Json> {
        let path = path::parse_query(query)?;
        let (result, _) = self.run(&path, false);
        let value = result?;
        Ok(self.strip(&value, self.graph.node_at(&path), &mut HashSet::new()))
    }

    /// Debug trace for a query, independent of the context's options.
    pub fn debug(&self, query: &str) -> Vec<TraceEntry> {
        let Ok(path) = path::parse_query(query) else {
            return Vec::new();
        };
        let (_, trace) = self.run(&path, true);
        trace.unwrap_or_default()
    }

    fn run(&self, path: &Path, debug: bool) -> (Result<Value>, Option<Vec<TraceEntry>>) {
        if self.options.validate_input {
            if let Some(validator) = &self.validator {
                if let Err(msg) = validator.validate(&self.input) {
                    return (Err(Error::Validation(msg)), None);
                }
            }
        }
        let input = Value::from_json(&self.input);
        let mut evaluation = Evaluation::new(self.graph, debug, self.options.recursion_limit);
        let result = evaluation.run(path, input);
        (result, evaluation.into_trace())
    }

    fn strip(&self, value: &Value, node: Option<NodeId>, seen: &mut HashSet<usize>) -> Json {
        match value {
            Value::Array(items) => {
                let addr = value.address();
                if !seen.insert(addr) {
                    return circular_sentinel();
                }
                let elem_node = node.map(|n| match self.graph.node(n).kind {
                    NodeKind::Array { items } => items,
                    _ => n,
                });
                let out = items
                    .borrow()
                    .iter()
                    .map(|v| self.strip(v, elem_node, seen))
                    .collect();
                seen.remove(&addr);
                Json::Array(out)
            }
            Value::Object(map) => {
                let addr = value.address();
                if !seen.insert(addr) {
                    return circular_sentinel();
                }
                let mut out = Map::new();
                for (k, v) in map.borrow().iter() {
                    if v.is_missing() {
                        continue;
                    }
                    let child = node.and_then(|n| self.graph.child_of(n, k));
                    if let Some(c) = child {
                        if self.graph.node(c).invisible {
                            continue;
                        }
                    }
                    out.insert(k.to_string(), self.strip(v, child, seen));
                }
                seen.remove(&addr);
                Json::Object(out)
            }
            scalar => scalar.to_json(),
        }
    }
}

fn circular_sentinel() -> Json {
    let mut map = Map::new();
    map.insert("^ref".to_string(), Json::String("circular".to_string()));
    Json::Object(map)
}

/// Wrap a resolved slice under the leading named segments of its query.
fn nest_under(path: &Path, inner: Json) -> Json {
    let mut names = Vec::new();
    let mut p = path.clone();
    while let Some(Segment::Part(part)) = p.segment() {
        names.push(part.name.to_string());
        p = p.next();
    }
    let mut out = inner;
    for name in names.into_iter().rev() {
        let mut map = Map::new();
        map.insert(name, out);
        out = Json::Object(map);
    }
    out
}

fn merge_json(dst: &mut Json, src: Json) {
    match (dst, src) {
        (Json::Object(a), Json::Object(b)) => {
            for (k, v) in b {
                match a.get_mut(&k) {
                    Some(slot) => merge_json(slot, v),
                    None => {
                        a.insert(k, v);
                    }
                }
            }
        }
        (slot, v) => *slot = v,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rule::{CalcError, CalcInputs};
    use crate::schema::Graph;
    use crate::value::Value;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn cart_graph() -> Graph {
        Graph::build(&json!({
            "type": "object",
            "properties": {
                "cart": {
                    "type": "object",
                    "properties": {
                        "items": {
                            "type": "array",
                            "items": {
                                "type": "object",
                                "properties": {
                                    "name": {"type": "string"},
                                    "price": {"type": "number", "default": 1},
                                    "qty": {"type": "number", "default": 1},
                                    "total": {"type": "decimal", "rule": "${price} * ${qty}"}
                                }
                            }
                        },
                        "cart_total": {"type": "decimal", "rule": "sum(${items.total})"}
                    }
                }
            }
        }))
        .expect("cart schema builds")
    }

    fn cart_input() -> Json {
        json!({"cart": {"items": [{"name": "a", "price": 5, "qty": 2}, {"name": "b"}]}})
    }

    #[test]
    fn cart_totals() {
        let graph = cart_graph();
        let ctx = graph.context(cart_input());
        assert_eq!(ctx.get("cart.cart_total").unwrap(), json!(11.0));
        assert_eq!(ctx.get("cart.items.total").unwrap(), json!([10.0, 1.0]));
    }

    #[test]
    fn projection_group_preserves_keys_in_option_order() {
        let graph = Graph::build(&json!({
            "type": "object",
            "properties": {
                "books": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "name": {"type": "string"},
                            "pages": {"type": "number"},
                            "is_long": {"type": "boolean", "rule": "${pages} > 200"}
                        }
                    }
                }
            }
        }))
        .unwrap();
        let ctx = graph.context(json!({"books": [
            {"name": "book1", "pages": 100},
            {"name": "book2", "pages": 200},
            {"name": "book3", "pages": 300}
        ]}));
        assert_eq!(
            ctx.get("books[name,is_long]").unwrap(),
            json!([
                {"name": "book1", "is_long": false},
                {"name": "book2", "is_long": false},
                {"name": "book3", "is_long": true}
            ])
        );
    }

    #[test]
    fn cycles_resolve_to_missing_with_a_trace() {
        let graph = Graph::build(&json!({
            "type": "object",
            "properties": {
                "a": {"type": "number", "rule": "${b}"},
                "b": {"type": "number", "rule": "${c}"},
                "c": {"type": "number", "rule": "${a}"}
            }
        }))
        .unwrap();
        let ctx = graph.context(json!({}));
        let outcome = ctx.resolve("a");
        assert_eq!(outcome.output, Json::Null);
        assert!(outcome.err.is_none());

        let trace = ctx.debug("a");
        assert!(
            trace.iter().any(|e| e
                .exception
                .as_deref()
                .is_some_and(|x| x.contains("Infinite Recursion"))),
            "trace should record the cycle: {:?}",
            trace
        );
    }

    fn color_graph() -> Graph {
        Graph::builder()
            .register_calc("hsl_to_rgb", |inputs: &CalcInputs| {
                let h = inputs.get("h").to_f();
                let s = inputs.get("s").to_f();
                let l = inputs.get("l").to_f();
                let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
                let p = 2.0 * l - q;
                let hk = h / 400.0;
                let channel = |t: f64| -> f64 {
                    let t = if t < 0.0 {
                        t + 1.0
                    } else if t > 1.0 {
                        t - 1.0
                    } else {
                        t
                    };
                    let v = if t < 1.0 / 6.0 {
                        p + (q - p) * 6.0 * t
                    } else if t < 0.5 {
                        q
                    } else if t < 2.0 / 3.0 {
                        p + (q - p) * (2.0 / 3.0 - t) * 6.0
                    } else {
                        p
                    };
                    (v * 255.0 * 10_000.0).round() / 10_000.0
                };
                Ok(Value::new_array(vec![
                    Value::Float(channel(hk + 1.0 / 3.0)),
                    Value::Float(channel(hk)),
                    Value::Float(channel(hk - 1.0 / 3.0)),
                ]))
            })
            .register_calc("cmyk_to_rgb", |inputs: &CalcInputs| {
                let k = inputs.get("k").to_f();
                let f = |x: f64| 255.0 * (1.0 - x) * (1.0 - k);
                Ok(Value::new_array(vec![
                    Value::Float(f(inputs.get("c").to_f())),
                    Value::Float(f(inputs.get("m").to_f())),
                    Value::Float(f(inputs.get("y").to_f())),
                ]))
            })
            .build(&json!({
                "type": "object",
                "properties": {
                    "color": {
                        "type": "object",
                        "properties": {
                            "mode": {"type": "string"},
                            "h": {"type": "number"},
                            "s": {"type": "number"},
                            "l": {"type": "number"},
                            "c": {"type": "number"},
                            "m": {"type": "number"},
                            "y": {"type": "number"},
                            "k": {"type": "number"},
                            "rgb": {
                                "type": "array",
                                "rule": {
                                    "inputs": {"h": "h", "s": "s", "l": "l"},
                                    "calc": {"fn": "hsl_to_rgb"},
                                    "conditions": {"mode": "hsl"}
                                }
                            },
                            "rgb_from_cmyk": {
                                "type": "array",
                                "rule": {
                                    "inputs": {"c": "c", "m": "m", "y": "y", "k": "k"},
                                    "calc": {"fn": "cmyk_to_rgb"},
                                    "conditions": {"mode": "cmyk"}
                                }
                            }
                        }
                    }
                }
            }))
            .expect("color schema builds")
    }

    #[test]
    fn conditions_gate_the_inactive_branches() {
        let graph = color_graph();
        let ctx = graph.context(json!({"color": {"mode": "hsl", "h": 100, "s": 0.2, "l": 0.5}}));
        assert_eq!(
            ctx.get("color.rgb").unwrap(),
            json!([127.5, 153.0, 102.0])
        );
        // the cmyk branch stays missing
        assert_eq!(ctx.get("color.rgb_from_cmyk").unwrap(), Json::Null);
        assert_eq!(
            ctx.get_json("color").unwrap(),
            json!({"color": {"mode": "hsl", "h": 100, "s": 0.2, "l": 0.5,
                             "rgb": [127.5, 153.0, 102.0]}})["color"]
        );
    }

    #[test]
    fn presence_violation_names_the_missing_dependency() {
        let graph = Graph::build(&json!({
            "type": "object",
            "properties": {
                "a": {"type": "number"},
                "b": {"type": "number"},
                "sum": {
                    "type": "number",
                    "validate_presence": true,
                    "rule": "${a} + ${b}"
                }
            }
        }))
        .unwrap();
        let ctx = graph.context(json!({"a": 1}));
        let err = ctx.get("sum").unwrap_err();
        match err {
            Error::Validation(msg) => assert!(msg.contains("\"b\""), "got: {}", msg),
            other => panic!("expected validation error, got {:?}", other),
        }
        let outcome = ctx.resolve("sum");
        assert!(outcome.err.is_some());
        assert!(outcome.status.is_none());
    }

    #[test]
    fn dynamic_index_inputs_materialize_per_element() {
        let graph = Graph::build(&json!({
            "type": "object",
            "properties": {
                "positions": {
                    "type": "object",
                    "patternProperties": {"^\\d+$": {
                        "type": "object",
                        "properties": {"title": {"type": "string"}}
                    }}
                },
                "crew": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "position_id": {"type": "integer"},
                            "position": {"type": "object", "rule": "positions[position_id]"}
                        }
                    }
                }
            }
        }))
        .unwrap();
        let ctx = graph.context(json!({
            "positions": {"1": {"title": "captain"}, "2": {"title": "bosun"}},
            "crew": [{"position_id": 1}, {"position_id": 2}]
        }));
        assert_eq!(
            ctx.get("crew.0.position").unwrap(),
            json!({"title": "captain"})
        );
        assert_eq!(
            ctx.get("crew.position").unwrap(),
            json!([{"title": "captain"}, {"title": "bosun"}])
        );
    }

    #[test]
    fn resolution_is_deterministic() {
        let graph = cart_graph();
        let ctx = graph.context(cart_input());
        let a = serde_json::to_string(&ctx.resolve("")).unwrap();
        let b = serde_json::to_string(&ctx.resolve("")).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn calcs_run_once_per_query() {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        let graph = Graph::builder()
            .register_calc("counted", move |inputs: &CalcInputs| {
                seen.fetch_add(1, Ordering::SeqCst);
                Ok(Value::Int(inputs.get("x").to_i() + 1))
            })
            .build(&json!({
                "type": "object",
                "properties": {
                    "x": {"type": "number"},
                    "derived": {
                        "type": "number",
                        "rule": {"inputs": {"x": "x"}, "calc": {"fn": "counted"}}
                    },
                    "twice": {"type": "number", "rule": "${derived} + ${derived}"},
                    "thrice": {"type": "number", "rule": "${derived} * 3"}
                }
            }))
            .unwrap();
        let ctx = graph.context(json!({"x": 1}));
        // one query touching the derived node three times over
        assert_eq!(ctx.get("[twice,thrice]").unwrap(), json!({"twice": 4, "thrice": 6}));
        assert_eq!(count.load(Ordering::SeqCst), 1);

        // a second query recomputes: contexts memoize per query only
        assert_eq!(ctx.get("twice").unwrap(), json!(4));
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn union_queries_merge_structurally() {
        let graph = cart_graph();
        let ctx = graph.context(cart_input());
        let outcome = ctx.resolve_paths(&["cart.cart_total", "cart.items.total"]);
        assert!(outcome.err.is_none());
        assert_eq!(
            outcome.output,
            json!({"cart": {"cart_total": 11.0, "items": {"total": [10.0, 1.0]}}})
        );
    }

    #[test]
    fn empty_query_forces_the_whole_graph() {
        let graph = cart_graph();
        let ctx = graph.context(cart_input());
        let outcome = ctx.resolve("");
        assert!(outcome.err.is_none());
        assert_eq!(outcome.output["cart"]["cart_total"], json!(11.0));
        assert_eq!(outcome.output["cart"]["items"][1]["total"], json!(1.0));
    }

    #[test]
    fn get_json_strips_invisible_fields() {
        let graph = Graph::build(&json!({
            "type": "object",
            "properties": {
                "public": {"type": "string"},
                "secret": {"type": "string", "invisible": true}
            }
        }))
        .unwrap();
        let ctx = graph.context(json!({"public": "yes", "secret": "no"}));
        assert_eq!(ctx.get_json("").unwrap(), json!({"public": "yes"}));
        // the raw view keeps it
        assert_eq!(ctx.get("").unwrap(), json!({"public": "yes", "secret": "no"}));
    }

    #[test]
    fn aborting_calcs_surface_in_the_envelope() {
        let graph = Graph::builder()
            .register_calc("explode", |_: &CalcInputs| {
                Err(CalcError::Abort("stop everything".to_string()))
            })
            .build(&json!({
                "type": "object",
                "properties": {
                    "x": {"type": "number"},
                    "boom": {"type": "number", "rule": {"inputs": {"x": "x"}, "calc": {"fn": "explode"}}}
                }
            }))
            .unwrap();
        let ctx = graph.context(json!({"x": 1}));
        let outcome = ctx.resolve("boom");
        assert_eq!(outcome.status.as_deref(), Some("abort"));
        assert!(outcome.err.as_deref().is_some_and(|e| e.contains("stop everything")));
    }

    #[test]
    fn failing_calcs_recover_to_missing() {
        let graph = Graph::build(&json!({
            "type": "object",
            "properties": {
                "x": {"type": "number"},
                "bad": {"type": "number", "rule": "${x} / 0"}
            }
        }))
        .unwrap();
        let ctx = graph.context(json!({"x": 1}));
        let outcome = ctx.resolve("bad");
        assert_eq!(outcome.output, Json::Null);
        assert!(outcome.err.is_none());
        let trace = ctx.debug("bad");
        assert!(trace
            .iter()
            .any(|e| e.exception.as_deref().is_some_and(|x| x.contains("division by zero"))));
    }

    #[test]
    fn malformed_queries_return_a_valueless_err() {
        let graph = cart_graph();
        let ctx = graph.context(cart_input());
        let outcome = ctx.resolve("cart[items");
        assert_eq!(outcome.output, Json::Null);
        assert!(outcome.err.as_deref().is_some_and(|e| e.contains("parse error")));
    }

    #[test]
    fn debug_traces_carry_concrete_paths_and_sources() {
        let graph = cart_graph();
        let ctx = graph.context(cart_input());
        let trace = ctx.debug("cart.items.total");
        let first = trace
            .iter()
            .find(|e| e.output == "$.cart.items[0].total")
            .expect("total derivation is traced");
        assert_eq!(first.location, "$.cart.items[0]");
        assert_eq!(first.calc.as_deref(), Some("${price} * ${qty}"));
        assert_eq!(first.result, json!(10.0));
        assert_eq!(first.inputs.get("price"), Some(&json!(5)));
    }
}
