//! Rule descriptor compilation.
//!
//! A derivation rule arrives in one of several shapes — a plain path, a
//! string with `${path}` placeholders, an `{inputs, calc, conditions}`
//! object, a bare literal, or a registered host closure — and is
//! canonicalized here into a [`Rule`]: bound inputs, an optional compiled
//! calc, gating conditions, and the source text carried into traces.
//!
//! Input paths are bound against the schema at build time: starting from
//! the node enclosing the derived key, ancestors are walked upward until
//! one resolves the path's first segment (absolute `$` paths anchor at the
//! root). Failure to bind is a deterministic build error.

use crate::error::{Error, Result};
use crate::expr;
use crate::path::{self, Path, Segment};
use crate::schema::{Node, NodeId, NodeKind};
use crate::value::Value;
use indexmap::IndexMap;
use serde_json::Value as Json;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Error returned by a host calc.
#[derive(Debug, Clone)]
pub enum CalcError {
    /// Recovered per rule: the node becomes missing with this diagnostic.
    Failed(String),
    /// Propagated to the top of the query as `Error::Abort`.
    Abort(String),
}

/// Named-slot binding handed to a host calc.
#[derive(Debug, Clone)]
pub struct CalcInputs {
    pub slots: IndexMap<Arc<str>, Value>,
    /// The container the derived value is being computed into.
    pub itself: Value,
}

impl CalcInputs {
    /// Resolved input by slot name; missing when not bound.
    pub fn get(&self, name: &str) -> Value {
        self.slots
            .get(name)
            .cloned()
            .unwrap_or_else(Value::missing)
    }
}

/// Host closure signature.
pub type NativeCalc =
    dyn Fn(&CalcInputs) -> std::result::Result<Value, CalcError> + Send + Sync;

/// Named host-closure table, consulted for `{"calc": {"fn": "name"}}`.
#[derive(Clone, Default)]
pub struct CalcRegistry {
    fns: HashMap<String, Arc<NativeCalc>>,
}

impl CalcRegistry {
    pub fn new() -> CalcRegistry {
        CalcRegistry::default()
    }

    /// Register or replace a host calc.
    pub fn register<F>(&mut self, name: impl Into<String>, calc: F)
    where
        F: Fn(&CalcInputs) -> std::result::Result<Value, CalcError> + Send + Sync + 'static,
    {
        self.fns.insert(name.into(), Arc::new(calc));
    }

    pub fn get(&self, name: &str) -> Option<Arc<NativeCalc>> {
        self.fns.get(name).cloned()
    }
}

impl fmt::Debug for CalcRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CalcRegistry")
            .field("fns", &self.fns.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Compiled, invocable calc.
#[derive(Clone)]
pub enum Calc {
    Expr(expr::Program),
    Native { name: Arc<str>, f: Arc<NativeCalc> },
}

impl Calc {
    /// Source text for debug traces.
    pub fn src(&self) -> String {
        match self {
            Calc::Expr(p) => p.src.to_string(),
            Calc::Native { name, .. } => format!("fn {}", name),
        }
    }
}

impl fmt::Debug for Calc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Calc::Expr(p) => write!(f, "Expr({:?})", p.src),
            Calc::Native { name, .. } => write!(f, "Native({:?})", name),
        }
    }
}

/// Gating condition on one input slot. Expected values stay as JSON so
/// the compiled graph remains `Send + Sync`.
#[derive(Debug, Clone)]
pub enum Condition {
    Literal(Json),
    OneOf(Vec<Json>),
}

impl Condition {
    pub fn matches(&self, value: &Value) -> bool {
        match self {
            Condition::Literal(expected) => *value == Value::from_json(expected),
            Condition::OneOf(allowed) => allowed.iter().any(|e| *value == Value::from_json(e)),
        }
    }

    fn to_json(&self) -> Json {
        match self {
            Condition::Literal(v) => v.clone(),
            Condition::OneOf(vs) => Json::Array(vs.clone()),
        }
    }
}

/// A bound dependency path: where resolution anchors and how far up the
/// runtime stack that anchor sits.
#[derive(Debug, Clone)]
pub struct Binding {
    pub path: Path,
    pub anchor: NodeId,
    pub up: u32,
    pub absolute: bool,
}

/// One declared rule input.
#[derive(Debug, Clone)]
pub struct InputSpec {
    pub name: Arc<str>,
    pub binding: Binding,
    /// `(segment offset, binding)` pairs for dynamic index segments,
    /// re-materialized on every evaluation.
    pub dynamic: Vec<(usize, Binding)>,
}

/// Canonical compiled rule.
#[derive(Debug, Clone)]
pub struct Rule {
    pub inputs: Vec<InputSpec>,
    /// `(input slot index, condition)` gates; all must match or the node
    /// is missing without invoking the calc.
    pub conditions: Vec<(usize, Condition)>,
    pub calc: Option<Calc>,
    /// Literal descriptor: the node always takes this value.
    pub fixed: Option<Json>,
    /// True iff the rule is a single unmapped path reference.
    pub copy_input: bool,
    pub src: Option<Arc<str>>,
    pub location: Option<(String, u64)>,
}

impl Rule {
    pub fn conditions_json(&self) -> Option<Json> {
        if self.conditions.is_empty() {
            return None;
        }
        let mut out = serde_json::Map::new();
        for (slot, cond) in &self.conditions {
            out.insert(self.inputs[*slot].name.to_string(), cond.to_json());
        }
        Some(Json::Object(out))
    }
}

/// Compile a rule descriptor for the node `owner`.
pub fn compile(
    nodes: &[Node],
    owner: NodeId,
    descriptor: &Json,
    location: Option<(String, u64)>,
    calcs: &CalcRegistry,
) -> Result<Rule> {
    let compiler = Compiler {
        nodes,
        owner,
        location,
    };
    compiler.compile(descriptor, calcs)
}

struct Compiler<'g> {
    nodes: &'g [Node],
    owner: NodeId,
    location: Option<(String, u64)>,
}

impl Compiler<'_> {
    fn compile(&self, descriptor: &Json, calcs: &CalcRegistry) -> Result<Rule> {
        match descriptor {
            Json::String(text) => {
                if text.contains("${") {
                    self.compile_placeholders(text)
                } else {
                    self.compile_copy(text)
                }
            }
            Json::Object(doc) => self.compile_descriptor(doc, calcs),
            literal => Ok(Rule {
                inputs: Vec::new(),
                conditions: Vec::new(),
                calc: None,
                fixed: Some(literal.clone()),
                copy_input: false,
                src: Some(Arc::from(literal.to_string().as_str())),
                location: self.location.clone(),
            }),
        }
    }

    fn compile_copy(&self, text: &str) -> Result<Rule> {
        let input = self.bind_input(slot_name_for(text), text)?;
        Ok(Rule {
            inputs: vec![input],
            conditions: Vec::new(),
            calc: None,
            fixed: None,
            copy_input: true,
            src: Some(Arc::from(text)),
            location: self.location.clone(),
        })
    }

    fn compile_placeholders(&self, text: &str) -> Result<Rule> {
        let (paths, rewritten) = scan_placeholders(text)
            .map_err(|e| self.validation(format!("{} in rule {:?}", e, text)))?;
        let mut inputs = Vec::new();
        for (name, input_path) in &paths {
            inputs.push(self.bind_input(name.clone(), input_path)?);
        }
        let program = expr::compile(&rewritten)
            .map_err(|e| self.validation(format!("{} (from rule {:?})", e, text)))?;
        self.check_free_idents(&program, &inputs)?;
        Ok(Rule {
            inputs,
            conditions: Vec::new(),
            calc: Some(Calc::Expr(program)),
            fixed: None,
            copy_input: false,
            src: Some(Arc::from(text)),
            location: self.location.clone(),
        })
    }

    fn compile_descriptor(
        &self,
        doc: &serde_json::Map<String, Json>,
        calcs: &CalcRegistry,
    ) -> Result<Rule> {
        let mut inputs = Vec::new();
        match doc.get("inputs") {
            None => {}
            Some(Json::Array(list)) => {
                for raw in list {
                    let text = raw.as_str().ok_or_else(|| {
                        self.validation("rule inputs list must contain path strings".to_string())
                    })?;
                    let mut name = slot_name_for(text);
                    let mut n = 2;
                    while inputs.iter().any(|i: &InputSpec| i.name.as_ref() == name) {
                        name = format!("{}_{}", slot_name_for(text), n);
                        n += 1;
                    }
                    inputs.push(self.bind_input(name, text)?);
                }
            }
            Some(Json::Object(map)) => {
                for (name, raw) in map {
                    let text = raw.as_str().ok_or_else(|| {
                        self.validation(format!("rule input {:?} must be a path string", name))
                    })?;
                    inputs.push(self.bind_input(name.clone(), text)?);
                }
            }
            Some(other) => {
                return Err(self.validation(format!(
                    "rule inputs must be a list or map, got {}",
                    other
                )))
            }
        }

        let declared_inputs = inputs.len();

        let mut conditions = Vec::new();
        if let Some(raw) = doc.get("conditions") {
            let map = raw.as_object().ok_or_else(|| {
                self.validation("rule conditions must be an object".to_string())
            })?;
            for (name, expected) in map {
                let slot = match inputs.iter().position(|i| i.name.as_ref() == name.as_str()) {
                    Some(slot) => slot,
                    None => {
                        // a condition slot doubles as its own input path
                        inputs.push(self.bind_input(name.clone(), name)?);
                        inputs.len() - 1
                    }
                };
                let condition = match expected {
                    Json::Array(list) => Condition::OneOf(list.clone()),
                    lit => Condition::Literal(lit.clone()),
                };
                conditions.push((slot, condition));
            }
        }

        let calc = match doc.get("calc") {
            Some(Json::String(src)) => {
                let program = expr::compile(src)
                    .map_err(|e| self.validation(format!("{} (from calc {:?})", e, src)))?;
                self.check_free_idents(&program, &inputs)?;
                Some(Calc::Expr(program))
            }
            Some(Json::Object(call)) => {
                let name = call.get("fn").and_then(Json::as_str).ok_or_else(|| {
                    self.validation("object calc must carry a \"fn\" name".to_string())
                })?;
                let f = calcs.get(name).ok_or_else(|| {
                    self.validation(format!("unregistered calc fn {:?}", name))
                })?;
                Some(Calc::Native {
                    name: Arc::from(name),
                    f,
                })
            }
            Some(other) => {
                return Err(self.validation(format!("unsupported calc form: {}", other)))
            }
            None => None,
        };

        let fixed = doc.get("value").cloned();
        let copy_input = calc.is_none() && fixed.is_none() && declared_inputs == 1;
        if calc.is_none() && fixed.is_none() && !copy_input {
            return Err(self.validation("rule has neither calc, value, nor single input".into()));
        }

        let src = doc
            .get("calc")
            .and_then(Json::as_str)
            .map(Arc::from)
            .or_else(|| calc.as_ref().map(|c| Arc::from(c.src().as_str())));
        Ok(Rule {
            inputs,
            conditions,
            calc,
            fixed,
            copy_input,
            src,
            location: self.location.clone(),
        })
    }

    fn check_free_idents(&self, program: &expr::Program, inputs: &[InputSpec]) -> Result<()> {
        for ident in program.free_idents() {
            let declared = ident.as_ref() == "itself"
                || inputs.iter().any(|i| i.name == ident);
            if !declared {
                return Err(self.validation(format!(
                    "calc {:?} reads {:?}, which is not a declared input",
                    program.src, ident
                )));
            }
        }
        Ok(())
    }

    fn bind_input(&self, name: impl Into<String>, text: &str) -> Result<InputSpec> {
        let parsed = path::parse(text)
            .map_err(|e| self.validation(format!("bad input path {:?}: {}", text, e)))?;
        let absolute = parsed.is_absolute();
        let parsed = parsed.strip_absolute();
        if parsed.is_empty() {
            return Err(self.validation(format!("empty input path {:?}", text)));
        }

        let binding = if absolute {
            let root = self.root_id();
            self.require_first(root, &parsed, text)?;
            Binding {
                path: parsed.clone(),
                anchor: root,
                up: u32::MAX,
                absolute: true,
            }
        } else {
            self.climb_to_anchor(&parsed, text)?
        };
        self.validate_walk(binding.anchor, &parsed, text)?;

        let mut dynamic = Vec::new();
        let mut p = parsed.clone();
        let mut offset = 0usize;
        while let Some(seg) = p.segment() {
            if let Segment::Group(g) = seg {
                if g.options.len() == 1 && !g.options[0].is_index_path() {
                    let inner = &g.options[0];
                    let inner_binding = self
                        .climb_to_anchor(inner, &inner.render())
                        .map_err(|_| {
                            self.validation(format!(
                                "dynamic segment {:?} of input {:?} does not bind to a schema node",
                                inner.render(),
                                text
                            ))
                        })?;
                    dynamic.push((offset, inner_binding));
                }
            }
            p = p.next();
            offset += 1;
        }

        Ok(InputSpec {
            name: Arc::from(name.into().as_str()),
            binding,
            dynamic,
        })
    }

    fn climb_to_anchor(&self, parsed: &Path, text: &str) -> Result<Binding> {
        let Some(Segment::Part(first)) = parsed.segment() else {
            return Err(self.validation(format!(
                "input path {:?} must start with a named segment",
                text
            )));
        };
        let mut cur = self.nodes[self.owner].parent.ok_or_else(|| {
            self.validation("the root node cannot carry a rule".to_string())
        })?;
        let mut up = 0u32;
        loop {
            if self.resolves_first(cur, first) {
                return Ok(Binding {
                    path: parsed.clone(),
                    anchor: cur,
                    up,
                    absolute: false,
                });
            }
            match self.nodes[cur].parent {
                Some(p) => {
                    cur = p;
                    up += 1;
                }
                None => {
                    return Err(self.validation(format!(
                        "input {:?} of rule at {} does not bind to any schema node",
                        text, self.nodes[self.owner].path
                    )))
                }
            }
        }
    }

    fn require_first(&self, anchor: NodeId, parsed: &Path, text: &str) -> Result<()> {
        let Some(Segment::Part(first)) = parsed.segment() else {
            return Err(self.validation(format!(
                "input path {:?} must start with a named segment",
                text
            )));
        };
        if self.resolves_first(anchor, first) {
            Ok(())
        } else {
            Err(self.validation(format!(
                "input {:?} of rule at {} does not bind to any schema node",
                text, self.nodes[self.owner].path
            )))
        }
    }

    fn resolves_first(&self, id: NodeId, part: &crate::path::Part) -> bool {
        match &self.nodes[id].kind {
            NodeKind::Object {
                properties,
                pattern_properties,
            } => {
                properties.contains_key(part.name.as_ref())
                    || pattern_properties.iter().any(|(re, _)| re.is_match(&part.name))
            }
            NodeKind::Array { items } => part.is_index() || self.resolves_first(*items, part),
            NodeKind::Scalar => false,
        }
    }

    /// Best-effort static walk of the whole input path. Stops at groups,
    /// ranges, pattern-matched positions, and untyped nodes; a named part
    /// that an object node demonstrably lacks is a build error.
    fn validate_walk(&self, anchor: NodeId, parsed: &Path, text: &str) -> Result<()> {
        let mut cur = anchor;
        let mut p = parsed.clone();
        while let Some(seg) = p.segment() {
            let Segment::Part(part) = seg else {
                return Ok(());
            };
            match &self.nodes[cur].kind {
                NodeKind::Object {
                    properties,
                    pattern_properties,
                } => {
                    if let Some(child) = properties.get(part.name.as_ref()) {
                        cur = *child;
                    } else if pattern_properties.iter().any(|(re, _)| re.is_match(&part.name)) {
                        return Ok(());
                    } else {
                        return Err(self.validation(format!(
                            "input {:?} of rule at {}: {} has no property {:?}",
                            text, self.nodes[self.owner].path, self.nodes[cur].path, part.name
                        )));
                    }
                }
                NodeKind::Array { items } => {
                    cur = *items;
                    if part.is_index() {
                        p = p.next();
                        continue;
                    }
                    // symbol over an array projects each element; retry the
                    // same part against the items node
                    continue;
                }
                NodeKind::Scalar => return Ok(()),
            }
            p = p.next();
        }
        Ok(())
    }

    fn root_id(&self) -> NodeId {
        let mut cur = self.owner;
        while let Some(p) = self.nodes[cur].parent {
            cur = p;
        }
        cur
    }

    fn validation(&self, msg: String) -> Error {
        match &self.location {
            Some((file, line)) => Error::Validation(format!("{} (rule at {}:{})", msg, file, line)),
            None => Error::Validation(msg),
        }
    }
}

fn slot_name_for(text: &str) -> String {
    let terminal = path::parse(text)
        .ok()
        .and_then(|p| p.terminal_name())
        .map(|n| n.to_string())
        .unwrap_or_else(|| text.to_string());
    mangle(&terminal)
}

fn mangle(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        if c.is_ascii_alphanumeric() || c == '_' {
            out.push(c);
        } else {
            out.push('_');
        }
    }
    if out.is_empty() || out.chars().next().is_some_and(|c| c.is_ascii_digit()) {
        out.insert(0, '_');
    }
    out
}

/// Extract `${path}` placeholders: returns `(name, path)` pairs in first-
/// appearance order and the source with each placeholder replaced by its
/// slot name.
fn scan_placeholders(src: &str) -> std::result::Result<(Vec<(String, String)>, String), String> {
    let mut out: Vec<(String, String)> = Vec::new();
    let mut rewritten = String::with_capacity(src.len());
    let mut rest = src;
    while let Some(start) = rest.find("${") {
        rewritten.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after
            .find('}')
            .ok_or_else(|| "unterminated placeholder".to_string())?;
        let path_text = after[..end].trim().to_string();
        if path_text.is_empty() {
            return Err("empty placeholder".to_string());
        }
        let name = match out.iter().find(|(_, p)| *p == path_text) {
            Some((name, _)) => name.clone(),
            None => {
                let mut name = mangle(&slot_name_for(&path_text));
                let mut n = 2;
                while out.iter().any(|(existing, p)| *existing == name && *p != path_text) {
                    name = format!("{}_{}", mangle(&slot_name_for(&path_text)), n);
                    n += 1;
                }
                out.push((name.clone(), path_text));
                name
            }
        };
        rewritten.push_str(&name);
        rest = &after[end + 1..];
    }
    rewritten.push_str(rest);
    Ok((out, rewritten))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Graph;
    use serde_json::json;

    fn graph_for(schema: Json) -> Graph {
        Graph::build(&schema).expect("schema should build")
    }

    #[test]
    fn placeholder_scan_rewrites_and_dedupes() {
        let (paths, rewritten) =
            scan_placeholders("${price} * ${quantity} + ${price}").unwrap();
        assert_eq!(
            paths,
            vec![
                ("price".to_string(), "price".to_string()),
                ("quantity".to_string(), "quantity".to_string())
            ]
        );
        assert_eq!(rewritten, "price * quantity + price");
    }

    #[test]
    fn placeholder_names_are_identifier_safe() {
        let (paths, rewritten) = scan_placeholders("sum(${items.total})").unwrap();
        assert_eq!(paths, vec![("total".to_string(), "items.total".to_string())]);
        assert_eq!(rewritten, "sum(total)");
    }

    #[test]
    fn unterminated_placeholder_is_rejected() {
        assert!(scan_placeholders("${price").is_err());
    }

    #[test]
    fn mangle_makes_identifiers() {
        assert_eq!(mangle("position-id"), "position_id");
        assert_eq!(mangle("3rd"), "_3rd");
        assert_eq!(mangle(""), "_");
    }

    #[test]
    fn copy_rules_are_marked() {
        let graph = graph_for(json!({
            "type": "object",
            "properties": {
                "a": {"type": "number"},
                "b": {"type": "number", "rule": "a"}
            }
        }));
        let b = graph.child_of(0, "b").unwrap();
        let rule = graph.node_rule(b).expect("b has a rule");
        assert!(rule.copy_input);
        assert_eq!(rule.inputs.len(), 1);
        assert_eq!(rule.inputs[0].name.as_ref(), "a");
        assert!(rule.calc.is_none());
    }

    #[test]
    fn map_inputs_keep_given_names() {
        let graph = graph_for(json!({
            "type": "object",
            "properties": {
                "width": {"type": "number"},
                "area": {
                    "type": "number",
                    "rule": {"inputs": {"w": "width"}, "calc": "w * w"}
                }
            }
        }));
        let area = graph.child_of(0, "area").unwrap();
        let rule = graph.node_rule(area).expect("area has a rule");
        assert_eq!(rule.inputs[0].name.as_ref(), "w");
        assert!(!rule.copy_input);
    }

    #[test]
    fn condition_slots_become_implicit_inputs() {
        let graph = graph_for(json!({
            "type": "object",
            "properties": {
                "mode": {"type": "string"},
                "h": {"type": "number"},
                "rgb": {
                    "type": "number",
                    "rule": {"inputs": {"h": "h"}, "calc": "h * 2", "conditions": {"mode": "hsl"}}
                }
            }
        }));
        let rgb = graph.child_of(0, "rgb").unwrap();
        let rule = graph.node_rule(rgb).expect("rgb has a rule");
        assert_eq!(rule.inputs.len(), 2);
        assert_eq!(rule.inputs[1].name.as_ref(), "mode");
        assert_eq!(rule.conditions.len(), 1);
        assert_eq!(rule.conditions[0].0, 1);
    }

    #[test]
    fn undeclared_reads_fail_the_build() {
        let err = Graph::build(&json!({
            "type": "object",
            "properties": {
                "a": {"type": "number"},
                "b": {"type": "number", "rule": {"inputs": {"a": "a"}, "calc": "a + sneaky"}}
            }
        }))
        .unwrap_err();
        match err {
            Error::Validation(msg) => assert!(msg.contains("sneaky"), "got: {}", msg),
            other => panic!("expected validation error, got {:?}", other),
        }
    }

    #[test]
    fn inputs_bind_upward_through_ancestors() {
        let graph = graph_for(json!({
            "type": "object",
            "properties": {
                "rate": {"type": "number"},
                "order": {
                    "type": "object",
                    "properties": {
                        "net": {"type": "number"},
                        "gross": {"type": "number", "rule": "${net} * ${rate}"}
                    }
                }
            }
        }));
        let order = graph.child_of(0, "order").unwrap();
        let gross = graph.child_of(order, "gross").unwrap();
        let rule = graph.node_rule(gross).expect("gross has a rule");
        let net = &rule.inputs[0];
        let rate = &rule.inputs[1];
        assert_eq!(net.binding.up, 0);
        assert_eq!(rate.binding.up, 1);
    }

    #[test]
    fn absolute_inputs_anchor_at_root() {
        let graph = graph_for(json!({
            "type": "object",
            "properties": {
                "base": {"type": "number"},
                "nested": {
                    "type": "object",
                    "properties": {
                        "x": {"type": "number", "rule": "${$.base} + 1"}
                    }
                }
            }
        }));
        let nested = graph.child_of(0, "nested").unwrap();
        let x = graph.child_of(nested, "x").unwrap();
        let rule = graph.node_rule(x).expect("x has a rule");
        assert!(rule.inputs[0].binding.absolute);
    }

    #[test]
    fn dynamic_segments_are_recorded_with_bindings() {
        let graph = graph_for(json!({
            "type": "object",
            "properties": {
                "positions": {
                    "type": "object",
                    "patternProperties": {"^\\d+$": {"type": "object"}}
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
        }));
        let crew = graph.child_of(0, "crew").unwrap();
        let crate::schema::NodeKind::Array { items } = graph.node_kind(crew) else {
            panic!("crew is an array");
        };
        let position = graph.child_of(*items, "position").unwrap();
        let rule = graph.node_rule(position).expect("position has a rule");
        assert!(rule.copy_input);
        let input = &rule.inputs[0];
        assert_eq!(input.dynamic.len(), 1);
        assert_eq!(input.dynamic[0].0, 1);
        // positions binds two frames up (item -> crew -> root)
        assert_eq!(input.binding.up, 2);
        // position_id binds in the enclosing item frame
        assert_eq!(input.dynamic[0].1.up, 0);
    }

    #[test]
    fn literal_descriptors_become_fixed_results() {
        let graph = graph_for(json!({
            "type": "object",
            "properties": {"answer": {"type": "number", "rule": 42}}
        }));
        let answer = graph.child_of(0, "answer").unwrap();
        let rule = graph.node_rule(answer).expect("answer has a rule");
        assert_eq!(rule.fixed, Some(json!(42)));
    }
}
