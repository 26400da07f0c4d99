//! Schema node graph.
//!
//! A [`Graph`] is built once from a JSON schema document and immutable
//! afterwards; it owns an arena of typed nodes (`Vec<Node>` indexed by
//! [`NodeId`]) so parent backrefs are plain indices and the whole graph is
//! freely shareable across threads. Per-query mutable state (memo tables,
//! resolution stacks) lives in the evaluation, never here.
//!
//! Build is two passes: one recursive descent over the schema document,
//! then rule compilation, which reads but never mutates structure.

use crate::context::Context;
use crate::error::{Error, Result};
use crate::path::{Part, Path, Segment};
use crate::rule::{self, CalcInputs, CalcError, CalcRegistry, Rule};
use crate::value::NodeType;
use indexmap::IndexMap;
use regex::Regex;
use serde_json::Value as Json;
use std::sync::Arc;

/// Index into the graph's node arena.
pub type NodeId = usize;

/// One schema position.
#[derive(Debug)]
pub struct Node {
    pub id: NodeId,
    pub name: Arc<str>,
    /// Absolute dotted path from the root, e.g. `$.cart.items[]`.
    pub path: String,
    pub depth: u32,
    pub parent: Option<NodeId>,
    pub ty: NodeType,
    /// Default value, bound when the input has no value at this key.
    pub default: Option<Json>,
    /// Omitted from `get_json` output.
    pub invisible: bool,
    /// A missing dependency raises `Error::Validation` instead of
    /// propagating.
    pub validate_presence: bool,
    pub rule: Option<Arc<Rule>>,
    pub kind: NodeKind,
}

#[derive(Debug)]
pub enum NodeKind {
    Object {
        properties: IndexMap<Arc<str>, NodeId>,
        pattern_properties: Vec<(Regex, NodeId)>,
    },
    Array {
        items: NodeId,
    },
    Scalar,
}

impl Node {
    /// A simple node short-circuits resolution to a cast: scalar leaf, no
    /// rule, no default, pass-through type.
    pub fn simple(&self) -> bool {
        matches!(self.kind, NodeKind::Scalar)
            && self.rule.is_none()
            && self.default.is_none()
            && self.ty.passthrough()
    }
}

/// Immutable schema graph plus compiled rules.
#[derive(Debug)]
pub struct Graph {
    nodes: Vec<Node>,
    root: NodeId,
}

impl Graph {
    /// Build a graph from a schema document with no registered calcs.
    pub fn build(schema: &Json) -> Result<Graph> {
        Graph::builder().build(schema)
    }

    pub fn builder() -> GraphBuilder {
        GraphBuilder::new()
    }

    /// Per-input-document evaluation handle.
    pub fn context(&self, input: Json) -> Context<'_> {
        Context::new(self, input)
    }

    #[inline]
    pub(crate) fn root(&self) -> NodeId {
        self.root
    }

    #[inline]
    pub(crate) fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id]
    }

    #[inline]
    pub(crate) fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub(crate) fn node_rule(&self, id: NodeId) -> Option<Arc<Rule>> {
        self.node(id).rule.clone()
    }

    pub(crate) fn node_kind(&self, id: NodeId) -> &NodeKind {
        &self.node(id).kind
    }

    /// Child node for a property name, checking declared properties first
    /// and pattern properties in declaration order.
    pub(crate) fn child_of(&self, id: NodeId, name: &str) -> Option<NodeId> {
        match &self.node(id).kind {
            NodeKind::Object {
                properties,
                pattern_properties,
            } => properties.get(name).copied().or_else(|| {
                pattern_properties
                    .iter()
                    .find(|(re, _)| re.is_match(name))
                    .map(|(_, child)| *child)
            }),
            _ => None,
        }
    }

    /// Schema node a query path lands on, used to honor `invisible` during
    /// `get_json`. Groups and ranges project under the current node.
    pub(crate) fn node_at(&self, query: &Path) -> Option<NodeId> {
        let mut cur = self.root;
        let mut p = query.clone();
        while let Some(seg) = p.segment() {
            match seg {
                Segment::Part(part) => cur = self.step(cur, part)?,
                _ => return Some(cur),
            }
            p = p.next();
        }
        Some(cur)
    }

    fn step(&self, id: NodeId, part: &Part) -> Option<NodeId> {
        match &self.node(id).kind {
            NodeKind::Object { .. } => self.child_of(id, &part.name),
            NodeKind::Array { items } => {
                if part.is_index() {
                    Some(*items)
                } else {
                    self.step(*items, part)
                }
            }
            NodeKind::Scalar => None,
        }
    }
}

/// Builder carrying the host-closure registry used while compiling rules.
#[derive(Default)]
pub struct GraphBuilder {
    calcs: CalcRegistry,
}

impl GraphBuilder {
    pub fn new() -> GraphBuilder {
        GraphBuilder::default()
    }

    /// Register a named host closure. A schema rule refers to it as
    /// `{"calc": {"fn": "<name>"}}`.
    pub fn register_calc<F>(mut self, name: impl Into<String>, calc: F) -> GraphBuilder
    where
        F: Fn(&CalcInputs) -> std::result::Result<crate::value::Value, CalcError>
            + Send
            + Sync
            + 'static,
    {
        self.calcs.register(name, calc);
        self
    }

    pub fn build(self, schema: &Json) -> Result<Graph> {
        let mut nodes = Vec::new();
        let mut pending = Vec::new();
        let root = build_node(
            &mut nodes,
            &mut pending,
            schema,
            Arc::from("$"),
            "$".to_string(),
            None,
            0,
        )?;
        for (id, descriptor, location) in pending {
            let rule = rule::compile(&nodes, id, &descriptor, location, &self.calcs)?;
            nodes[id].rule = Some(Arc::new(rule));
        }
        Ok(Graph { nodes, root })
    }
}

type PendingRule = (NodeId, Json, Option<(String, u64)>);

fn build_node(
    nodes: &mut Vec<Node>,
    pending: &mut Vec<PendingRule>,
    schema: &Json,
    name: Arc<str>,
    path: String,
    parent: Option<NodeId>,
    depth: u32,
) -> Result<NodeId> {
    let doc = schema
        .as_object()
        .ok_or_else(|| Error::Validation(format!("schema node at {} must be an object", path)))?;

    let ty = normalize_type(doc, &path)?;
    let id = nodes.len();
    nodes.push(Node {
        id,
        name,
        path: path.clone(),
        depth,
        parent,
        ty,
        default: doc
            .get("default")
            .or_else(|| doc.get("const"))
            .cloned(),
        invisible: doc
            .get("invisible")
            .and_then(Json::as_bool)
            .unwrap_or(false),
        validate_presence: doc
            .get("validate_presence")
            .and_then(Json::as_bool)
            .unwrap_or(false),
        rule: None,
        kind: NodeKind::Scalar,
    });

    if let Some(rule) = doc.get("rule") {
        let location = doc.get("rule_location").and_then(parse_location);
        pending.push((id, rule.clone(), location));
    }

    let kind = match ty {
        NodeType::Object => {
            let mut properties = IndexMap::new();
            if let Some(props) = doc.get("properties") {
                let props = props.as_object().ok_or_else(|| {
                    Error::Validation(format!("properties of {} must be an object", path))
                })?;
                for (key, child_schema) in props {
                    let child_name: Arc<str> = Arc::from(key.as_str());
                    let child = build_node(
                        nodes,
                        pending,
                        child_schema,
                        Arc::clone(&child_name),
                        format!("{}.{}", path, key),
                        Some(id),
                        depth + 1,
                    )?;
                    properties.insert(child_name, child);
                }
            }
            let mut pattern_properties = Vec::new();
            if let Some(patterns) = doc.get("patternProperties") {
                let patterns = patterns.as_object().ok_or_else(|| {
                    Error::Validation(format!("patternProperties of {} must be an object", path))
                })?;
                for (pattern, child_schema) in patterns {
                    let re = Regex::new(pattern).map_err(|e| {
                        Error::Validation(format!(
                            "invalid patternProperties regex {:?} at {}: {}",
                            pattern, path, e
                        ))
                    })?;
                    let child = build_node(
                        nodes,
                        pending,
                        child_schema,
                        Arc::from(pattern.as_str()),
                        format!("{}.{}", path, pattern),
                        Some(id),
                        depth + 1,
                    )?;
                    pattern_properties.push((re, child));
                }
            }
            NodeKind::Object {
                properties,
                pattern_properties,
            }
        }
        NodeType::Array => {
            let empty = Json::Object(serde_json::Map::new());
            let items_schema = doc.get("items").unwrap_or(&empty);
            let items = build_node(
                nodes,
                pending,
                items_schema,
                Arc::from("[]"),
                format!("{}[]", path),
                Some(id),
                depth + 1,
            )?;
            NodeKind::Array { items }
        }
        _ => NodeKind::Scalar,
    };
    nodes[id].kind = kind;
    Ok(id)
}

fn normalize_type(doc: &serde_json::Map<String, Json>, path: &str) -> Result<NodeType> {
    if let Some(ty) = doc.get("type") {
        let name = ty.as_str().ok_or_else(|| {
            Error::Validation(format!("type of {} must be a string", path))
        })?;
        return NodeType::parse(name)
            .ok_or_else(|| Error::Validation(format!("unknown type {:?} at {}", name, path)));
    }
    if doc.contains_key("properties") || doc.contains_key("patternProperties") {
        return Ok(NodeType::Object);
    }
    if doc.contains_key("items") {
        return Ok(NodeType::Array);
    }
    if doc.contains_key("const") {
        return Ok(NodeType::Const);
    }
    Ok(NodeType::Any)
}

fn parse_location(raw: &Json) -> Option<(String, u64)> {
    let arr = raw.as_array()?;
    let file = arr.first()?.as_str()?.to_string();
    let line = arr.get(1)?.as_u64()?;
    Some((file, line))
}
