//! The resolver: lazy, memoized evaluation of a query path against a
//! schema graph and one input document.
//!
//! One `resolve(node, path, stack)` walks the node tree in lock-step with
//! the path. Every leaf is reached through `fetch_and_resolve`, which
//! applies the uniform contract: present values win (coerced and interned
//! in place), defaults bind next, and only then does a derivation rule
//! run — inputs resolved relative to ancestor frames, conditions gated,
//! the calc invoked with per-rule error recovery, the result interned.
//!
//! All mutable state for one query lives here: the frame pool, per-node
//! memo tables keyed `frame address ^ path identity`, per-node resolution
//! stacks for the cycle guard, and the optional trace buffer. Dropping the
//! evaluation is what "clears the visited tables" — the shared graph is
//! never written.

use crate::error::{Error, Result, TraceEntry};
use crate::expr;
use crate::path::{Part, Path, Segment};
use crate::rule::{Binding, Calc, CalcError, CalcInputs, InputSpec, Rule};
use crate::schema::{Graph, NodeId, NodeKind};
use crate::stack::{FrameKey, StackId, StackPool};
use crate::value::Value;
use indexmap::IndexMap;
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;
use std::sync::Arc;
use tracing::{debug, warn};

pub(crate) struct Evaluation<'g> {
    graph: &'g Graph,
    pool: StackPool,
    /// Per-node memo: `frame address ^ path identity` → resolved value.
    visited: Vec<HashMap<u64, Value>>,
    /// Per-node in-flight derivations: `(container address, key id)`.
    resolution: Vec<HashSet<(usize, u64)>>,
    trace: Option<Vec<TraceEntry>>,
    recursion_limit: u32,
}

impl<'g> Evaluation<'g> {
    pub(crate) fn new(graph: &'g Graph, debug: bool, recursion_limit: u32) -> Evaluation<'g> {
        Evaluation {
            graph,
            pool: StackPool::new(),
            visited: vec![HashMap::new(); graph.node_count()],
            resolution: vec![HashSet::new(); graph.node_count()],
            trace: if debug { Some(Vec::new()) } else { None },
            recursion_limit,
        }
    }

    /// Resolve one query against a fresh input copy.
    pub(crate) fn run(&mut self, path: &Path, input: Value) -> Result<Value> {
        let root = self.pool.acquire(None, input, FrameKey::Root);
        let out = self.resolve(self.graph.root(), path, root);
        self.pool.release(root);
        out
    }

    pub(crate) fn into_trace(self) -> Option<Vec<TraceEntry>> {
        self.trace
    }

    fn resolve(&mut self, node: NodeId, path: &Path, sp: StackId) -> Result<Value> {
        let graph = self.graph;
        match graph.node(node).kind {
            NodeKind::Scalar => {
                let v = self.pool.frame(sp).value.clone();
                Ok(if path.is_empty() { v } else { Value::missing() })
            }
            NodeKind::Object { .. } => self.resolve_object(node, path, sp),
            NodeKind::Array { .. } => self.resolve_array(node, path, sp),
        }
    }

    fn resolve_object(&mut self, node: NodeId, path: &Path, sp: StackId) -> Result<Value> {
        let graph = self.graph;
        let frame = self.pool.frame(sp).value.clone();
        let memo = frame.address() as u64 ^ path.identity();
        if let Some(hit) = self.visited[node].get(&memo) {
            return Ok(hit.clone());
        }
        let NodeKind::Object {
            properties,
            pattern_properties,
        } = &graph.node(node).kind
        else {
            unreachable!("resolve_object on non-object node");
        };

        let result = match path.segment().cloned() {
            None => {
                for (name, child) in properties {
                    if !graph.node(*child).simple() {
                        let key = FrameKey::Name(Rc::from(name.as_ref()));
                        self.fetch_and_resolve(*child, &Path::blank(), sp, &key)?;
                    }
                }
                if !pattern_properties.is_empty() {
                    if let Value::Object(map) = &frame {
                        let keys: Vec<Rc<str>> = map.borrow().keys().cloned().collect();
                        for key in keys {
                            if properties.contains_key(key.as_ref()) {
                                continue;
                            }
                            let child = pattern_properties
                                .iter()
                                .find(|(re, _)| re.is_match(&key))
                                .map(|(_, c)| *c);
                            if let Some(child) = child {
                                self.fetch_and_resolve(
                                    child,
                                    &Path::blank(),
                                    sp,
                                    &FrameKey::Name(key),
                                )?;
                            }
                        }
                    }
                }
                Ok(frame.clone())
            }
            Some(Segment::Part(part)) => {
                let rest = path.next();
                let key = FrameKey::Name(Rc::from(part.name.as_ref()));
                if let Some(child) = graph.child_of(node, &part.name) {
                    self.fetch_and_resolve(child, &rest, sp, &key)
                } else if let Some(existing) = frame_get(&frame, &key) {
                    // key present in the input but unknown to the schema
                    self.resolve_raw(existing, &rest)
                } else {
                    Ok(Value::missing())
                }
            }
            Some(Segment::Group(group)) => {
                self.resolve_options(node, &group.options, &path.next(), sp)
            }
            Some(Segment::Range(range)) => {
                let options: Vec<Path> = range
                    .expand()
                    .into_iter()
                    .map(|p| Path::from_segments(vec![Segment::Part(p)]))
                    .collect();
                self.resolve_options(node, &options, &path.next(), sp)
            }
        }?;

        self.visited[node].insert(memo, result.clone());
        Ok(result)
    }

    /// Preserve-keys projection: every option resolves under the same
    /// continuation and the results merge by terminal name, in option
    /// order. A single option collapses to identity mode.
    fn resolve_options(
        &mut self,
        node: NodeId,
        options: &[Path],
        cont: &Path,
        sp: StackId,
    ) -> Result<Value> {
        if options.len() == 1 {
            return self.resolve(node, &options[0].merge(cont), sp);
        }
        let mut out: IndexMap<Rc<str>, Value> = IndexMap::new();
        for opt in options {
            let key: Rc<str> = match opt.terminal_name() {
                Some(name) => Rc::from(name.as_ref()),
                None => Rc::from(opt.render().as_str()),
            };
            let v = self.resolve(node, &opt.merge(cont), sp)?;
            out.insert(key, v);
        }
        Ok(Value::Object(Rc::new(RefCell::new(out))))
    }

    fn resolve_array(&mut self, node: NodeId, path: &Path, sp: StackId) -> Result<Value> {
        let graph = self.graph;
        let frame = self.pool.frame(sp).value.clone();
        let memo = frame.address() as u64 ^ path.identity();
        if let Some(hit) = self.visited[node].get(&memo) {
            return Ok(hit.clone());
        }
        let NodeKind::Array { items } = graph.node(node).kind else {
            unreachable!("resolve_array on non-array node");
        };
        let len = match &frame {
            Value::Array(a) => a.borrow().len(),
            _ => 0,
        };

        let result = match path.segment().cloned() {
            None => {
                if !graph.node(items).simple() {
                    for i in 0..len {
                        self.fetch_and_resolve(items, &Path::blank(), sp, &FrameKey::Index(i))?;
                    }
                }
                Ok(frame.clone())
            }
            Some(Segment::Part(part)) => {
                if let Some(idx) = part.index {
                    match usize::try_from(idx).ok().filter(|i| *i < len) {
                        Some(i) => {
                            self.fetch_and_resolve(items, &path.next(), sp, &FrameKey::Index(i))
                        }
                        None => Ok(Value::missing()),
                    }
                } else if self.items_expose(items, &frame, &part.name) {
                    let mut out = Vec::with_capacity(len);
                    for i in 0..len {
                        out.push(self.fetch_and_resolve(items, path, sp, &FrameKey::Index(i))?);
                    }
                    Ok(Value::new_array(out))
                } else {
                    Ok(Value::missing())
                }
            }
            Some(Segment::Group(group)) => {
                if group.options.len() == 1 {
                    self.resolve(node, &group.options[0].merge(&path.next()), sp)
                } else if group.is_index() {
                    let cont = path.next();
                    let mut out = Vec::with_capacity(group.options.len());
                    for opt in &group.options {
                        out.push(self.resolve(node, &opt.merge(&cont), sp)?);
                    }
                    Ok(Value::new_array(out))
                } else {
                    // non-index group projects over every element
                    let mut out = Vec::with_capacity(len);
                    for i in 0..len {
                        out.push(self.fetch_and_resolve(items, path, sp, &FrameKey::Index(i))?);
                    }
                    Ok(Value::new_array(out))
                }
            }
            Some(Segment::Range(range)) => {
                let cont = path.next();
                let mut out = Vec::new();
                for part in range.expand() {
                    let merged = Path::from_segments(vec![Segment::Part(part)]).merge(&cont);
                    out.push(self.resolve(node, &merged, sp)?);
                }
                Ok(Value::new_array(out))
            }
        }?;

        self.visited[node].insert(memo, result.clone());
        Ok(result)
    }

    /// Does the items node expose `name`, by schema or by the first
    /// element's keys?
    fn items_expose(&self, items: NodeId, frame: &Value, name: &str) -> bool {
        if self.graph.child_of(items, name).is_some() {
            return true;
        }
        if let Value::Array(elems) = frame {
            if let Some(Value::Object(first)) = elems.borrow().first() {
                return first.borrow().contains_key(name);
            }
        }
        false
    }

    /// The hot path: produce the value for `container[key]` under `node`,
    /// then continue along `path`.
    fn fetch_and_resolve(
        &mut self,
        node: NodeId,
        path: &Path,
        sp: StackId,
        key: &FrameKey,
    ) -> Result<Value> {
        let graph = self.graph;
        let container = self.pool.frame(sp).value.clone();

        if let Some(existing) = frame_get(&container, key) {
            if !existing.is_missing() {
                let coerced = self.coerce_intern(node, &container, key, existing);
                return self.descend(node, path, sp, key, coerced);
            }
        }

        let Some(rule) = graph.node_rule(node) else {
            let bound = match &graph.node(node).default {
                Some(d) => Value::from_json(d),
                None => Value::missing(),
            };
            let bound = self.coerce_intern(node, &container, key, bound);
            return self.descend(node, path, sp, key, bound);
        };

        // cycle guard: re-entry past the depth bound resolves to missing
        let rkey = (container.address(), key.id());
        let depth = self.pool.frame(sp).recursion_depth;
        if depth >= self.recursion_limit && self.resolution[node].contains(&rkey) {
            let reason = "Infinite Recursion Detected";
            debug!(node = %graph.node(node).path, depth, "cycle guard tripped");
            self.push_cycle_trace(sp, key, &rule, reason);
            return Ok(self.tagged_missing(reason));
        }
        self.resolution[node].insert(rkey);
        let out = self.run_rule(node, &rule, path, sp, key, &container);
        self.resolution[node].remove(&rkey);
        out
    }

    fn run_rule(
        &mut self,
        node: NodeId,
        rule: &Rule,
        path: &Path,
        sp: StackId,
        key: &FrameKey,
        container: &Value,
    ) -> Result<Value> {
        let graph = self.graph;

        if let Some(fixed) = &rule.fixed {
            let value = self.coerce_intern(node, container, key, Value::from_json(fixed));
            return self.descend(node, path, sp, key, value);
        }

        let mut slots: IndexMap<Arc<str>, Value> = IndexMap::new();
        for spec in &rule.inputs {
            let v = self.resolve_input(spec, sp)?;
            slots.insert(Arc::clone(&spec.name), v);
        }

        if graph.node(node).validate_presence {
            for (spec, (_, v)) in rule.inputs.iter().zip(slots.iter()) {
                if v.is_missing() {
                    return Err(Error::Validation(format!(
                        "presence validation failed at {}: dependency {:?} is missing",
                        graph.node(node).path,
                        spec.binding.path.render()
                    )));
                }
            }
        }

        for (slot, condition) in &rule.conditions {
            let bound = slots
                .get_index(*slot)
                .map(|(_, v)| v.clone())
                .unwrap_or_else(Value::missing);
            if !condition.matches(&bound) {
                let value = self.tagged_missing("condition not met");
                self.push_trace(sp, key, rule, &slots, &value, None);
                return self.descend(node, path, sp, key, value);
            }
        }

        if rule.copy_input {
            let value = slots
                .get_index(0)
                .map(|(_, v)| v.clone())
                .unwrap_or_else(Value::missing);
            let value = self.coerce_intern(node, container, key, value);
            self.push_trace(sp, key, rule, &slots, &value, None);
            return self.descend(node, path, sp, key, value);
        }

        let invoked = match &rule.calc {
            Some(Calc::Expr(program)) => {
                let scope = expr::Scope {
                    slots: &slots,
                    itself: container,
                    debug: self.trace.is_some(),
                };
                expr::eval(&program.expr, &scope).map_err(CalcError::Failed)
            }
            Some(Calc::Native { f, .. }) => f(&CalcInputs {
                slots: slots.clone(),
                itself: container.clone(),
            }),
            None => Ok(Value::missing()),
        };

        let (value, exception) = match invoked {
            Ok(v) => (v, None),
            Err(CalcError::Abort(msg)) => return Err(Error::Abort(msg)),
            Err(CalcError::Failed(msg)) => {
                warn!(node = %graph.node(node).path, error = %msg, "calc failed");
                (self.tagged_missing(&msg), Some(msg))
            }
        };
        let value = self.coerce_intern(node, container, key, value);
        self.push_trace(sp, key, rule, &slots, &value, exception);
        self.descend(node, path, sp, key, value)
    }

    /// Resolve one declared input, materializing dynamic segments first.
    fn resolve_input(&mut self, spec: &InputSpec, sp: StackId) -> Result<Value> {
        let mut path = spec.binding.path.clone();
        for (offset, binding) in &spec.dynamic {
            let index = self.resolve_from(binding, &binding.path.clone(), sp)?;
            if index.is_missing() {
                return Ok(self.tagged_missing(format!(
                    "dynamic segment {} is missing",
                    binding.path.render()
                )));
            }
            path = path.with_segment(*offset, Segment::Part(Part::from_value(&index)));
        }
        self.resolve_from(&spec.binding, &path, sp)
    }

    /// Resolve a bound path from its anchor frame, bumping the anchor's
    /// recursion depth around the dependency resolve.
    fn resolve_from(&mut self, binding: &Binding, path: &Path, sp: StackId) -> Result<Value> {
        let base = if binding.absolute {
            self.pool.root_of(sp)
        } else {
            self.pool.ancestor(sp, binding.up)
        };
        self.pool.frame_mut(base).recursion_depth += 1;
        let out = self.resolve(binding.anchor, path, base);
        self.pool.frame_mut(base).recursion_depth -= 1;
        out
    }

    /// Continue the walk below a freshly produced value.
    fn descend(
        &mut self,
        node: NodeId,
        path: &Path,
        sp: StackId,
        key: &FrameKey,
        value: Value,
    ) -> Result<Value> {
        let graph = self.graph;
        let container_node = !matches!(graph.node(node).kind, NodeKind::Scalar);
        if value.is_container() && container_node {
            let child = self.pool.acquire(Some(sp), value, key.clone());
            let out = self.resolve(node, path, child);
            self.pool.release(child);
            return out;
        }
        if path.is_empty() {
            Ok(value)
        } else if value.is_container() {
            // untyped node holding a container: schema-less descent
            self.resolve_raw(value, path)
        } else {
            Ok(Value::missing())
        }
    }

    /// Schema-less descent for input keys with no schema node.
    fn resolve_raw(&mut self, value: Value, path: &Path) -> Result<Value> {
        let Some(seg) = path.segment().cloned() else {
            return Ok(value);
        };
        match seg {
            Segment::Part(part) => {
                let next = match (&value, part.index) {
                    (Value::Object(map), _) => map.borrow().get(part.name.as_ref()).cloned(),
                    (Value::Array(items), Some(i)) => usize::try_from(i)
                        .ok()
                        .and_then(|i| items.borrow().get(i).cloned()),
                    _ => None,
                };
                match next {
                    Some(v) => self.resolve_raw(v, &path.next()),
                    None => Ok(Value::missing()),
                }
            }
            Segment::Group(group) => {
                if group.options.len() == 1 {
                    return self.resolve_raw(value, &group.options[0].merge(&path.next()));
                }
                let cont = path.next();
                let mut out: IndexMap<Rc<str>, Value> = IndexMap::new();
                for opt in &group.options {
                    let key: Rc<str> = match opt.terminal_name() {
                        Some(name) => Rc::from(name.as_ref()),
                        None => Rc::from(opt.render().as_str()),
                    };
                    let v = self.resolve_raw(value.clone(), &opt.merge(&cont))?;
                    out.insert(key, v);
                }
                Ok(Value::Object(Rc::new(RefCell::new(out))))
            }
            Segment::Range(range) => {
                let cont = path.next();
                let mut out = Vec::new();
                for part in range.expand() {
                    let merged = Path::from_segments(vec![Segment::Part(part)]).merge(&cont);
                    out.push(self.resolve_raw(value.clone(), &merged)?);
                }
                Ok(Value::new_array(out))
            }
        }
    }

    fn coerce_intern(
        &mut self,
        node: NodeId,
        container: &Value,
        key: &FrameKey,
        value: Value,
    ) -> Value {
        let node_ref = self.graph.node(node);
        match node_ref.ty.coerce(value) {
            Ok(v) => {
                frame_set(container, key, v.clone());
                v
            }
            Err(reason) => {
                warn!(node = %node_ref.path, %reason, "coercion rejected value");
                let v = self.tagged_missing(&reason);
                frame_set(container, key, v.clone());
                v
            }
        }
    }

    fn tagged_missing(&self, reason: impl Into<String>) -> Value {
        if self.trace.is_some() {
            Value::missing_because(reason)
        } else {
            Value::missing()
        }
    }

    fn push_trace(
        &mut self,
        sp: StackId,
        key: &FrameKey,
        rule: &Rule,
        slots: &IndexMap<Arc<str>, Value>,
        value: &Value,
        exception: Option<String>,
    ) {
        if self.trace.is_none() {
            return;
        }
        let output = self.pool.path_of_key(sp, key);
        let location = self.pool.path_of(sp);
        let mut inputs = serde_json::Map::new();
        for (name, v) in slots {
            inputs.insert(name.to_string(), v.to_json());
        }
        let entry = TraceEntry {
            output,
            result: value.to_json(),
            inputs,
            calc: rule.src.as_ref().map(|s| s.to_string()),
            location,
            conditions: rule.conditions_json(),
            exception: exception.or_else(|| value.missing_reason().map(str::to_string)),
            rule_location: rule.location.clone(),
        };
        if let Some(trace) = self.trace.as_mut() {
            trace.push(entry);
        }
    }

    fn push_cycle_trace(&mut self, sp: StackId, key: &FrameKey, rule: &Rule, reason: &str) {
        if self.trace.is_none() {
            return;
        }
        let output = self.pool.path_of_key(sp, key);
        let location = self.pool.path_of(sp);
        let entry = TraceEntry {
            output,
            result: serde_json::Value::Null,
            inputs: serde_json::Map::new(),
            calc: rule.src.as_ref().map(|s| s.to_string()),
            location,
            conditions: rule.conditions_json(),
            exception: Some(reason.to_string()),
            rule_location: rule.location.clone(),
        };
        if let Some(trace) = self.trace.as_mut() {
            trace.push(entry);
        }
    }
}

fn frame_get(container: &Value, key: &FrameKey) -> Option<Value> {
    match (container, key) {
        (Value::Object(map), FrameKey::Name(name)) => map.borrow().get(name.as_ref()).cloned(),
        (Value::Array(items), FrameKey::Index(i)) => items.borrow().get(*i).cloned(),
        _ => None,
    }
}

/// Intern a coerced value back into the input copy. Out-of-range array
/// writes are dropped; the computed value still flows to the caller.
fn frame_set(container: &Value, key: &FrameKey, value: Value) {
    match (container, key) {
        (Value::Object(map), FrameKey::Name(name)) => {
            map.borrow_mut().insert(Rc::clone(name), value);
        }
        (Value::Array(items), FrameKey::Index(i)) => {
            let mut items = items.borrow_mut();
            if *i < items.len() {
                items[*i] = value;
            }
        }
        _ => {}
    }
}
