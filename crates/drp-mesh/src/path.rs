//! Path traversal over a node's object graph.
//!
//! Nodes expose their state as a tree that peers browse by segment list
//! (`["Providers", "prov-1", "Streams"]`). Branches can be plain JSON,
//! in-process maps and lists, or resolvers: async functions that receive
//! the rest of the path and produce the answer themselves, typically by
//! relaying it to another node.

use async_trait::async_trait;
use drp_types::DrpResult;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

/// Parameters of `cliGetPath` / `pathCmd`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PathRequest {
    #[serde(default)]
    pub method: String,
    #[serde(rename = "pathList", default)]
    pub path_list: Vec<String>,
    #[serde(rename = "listOnly", default)]
    pub list_only: bool,
}

impl PathRequest {
    pub fn new(path: &[&str], list_only: bool) -> Self {
        Self {
            method: "cliGetPath".to_string(),
            path_list: path.iter().map(|s| s.to_string()).collect(),
            list_only,
        }
    }

    /// Split a `/`-separated path, ignoring empty segments.
    pub fn parse(path: &str, list_only: bool) -> Self {
        Self {
            method: "cliGetPath".to_string(),
            path_list: path
                .split('/')
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
            list_only,
        }
    }

    /// The same request with the first `n` segments consumed.
    fn skip(&self, n: usize) -> Self {
        Self {
            method: self.method.clone(),
            path_list: self.path_list.iter().skip(n).cloned().collect(),
            list_only: self.list_only,
        }
    }
}

/// A branch computed on demand from the remaining path.
#[async_trait]
pub trait PathResolver: Send + Sync + 'static {
    async fn resolve(&self, request: PathRequest) -> DrpResult<Value>;
}

#[async_trait]
impl<F, Fut> PathResolver for F
where
    F: Fn(PathRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = DrpResult<Value>> + Send + 'static,
{
    async fn resolve(&self, request: PathRequest) -> DrpResult<Value> {
        (self)(request).await
    }
}

/// One node of a browsable tree.
#[derive(Clone)]
pub enum PathNode {
    Map(BTreeMap<String, PathNode>),
    List(Vec<PathNode>),
    Value(Value),
    Resolver(Arc<dyn PathResolver>),
}

impl PathNode {
    pub fn map() -> Self {
        PathNode::Map(BTreeMap::new())
    }

    pub fn resolver(resolver: impl PathResolver) -> Self {
        PathNode::Resolver(Arc::new(resolver))
    }

    /// Builder: add a child to a `Map` node. Other variants are returned unchanged.
    pub fn with(mut self, key: impl Into<String>, child: impl Into<PathNode>) -> Self {
        if let PathNode::Map(ref mut children) = self {
            children.insert(key.into(), child.into());
        }
        self
    }

    /// Render as JSON. Resolvers have no static value and are left out.
    pub fn to_json(&self) -> Value {
        match self {
            PathNode::Map(children) => Value::Object(
                children
                    .iter()
                    .filter(|(_, child)| !matches!(child, PathNode::Resolver(_)))
                    .map(|(k, child)| (k.clone(), child.to_json()))
                    .collect(),
            ),
            PathNode::List(items) => Value::Array(items.iter().map(PathNode::to_json).collect()),
            PathNode::Value(v) => v.clone(),
            PathNode::Resolver(_) => Value::Null,
        }
    }
}

impl From<Value> for PathNode {
    fn from(value: Value) -> Self {
        PathNode::Value(value)
    }
}

impl std::fmt::Debug for PathNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PathNode::Map(children) => f.debug_map().entries(children.iter()).finish(),
            PathNode::List(items) => f.debug_list().entries(items.iter()).finish(),
            PathNode::Value(v) => write!(f, "{v}"),
            PathNode::Resolver(_) => f.write_str("<resolver>"),
        }
    }
}

#[derive(Clone, Copy)]
enum Cursor<'a> {
    Node(&'a PathNode),
    Json(&'a Value),
}

impl<'a> Cursor<'a> {
    fn child(self, segment: &str) -> Option<Cursor<'a>> {
        match self {
            Cursor::Node(PathNode::Map(children)) => children.get(segment).map(Cursor::Node),
            Cursor::Node(PathNode::List(items)) => {
                segment.parse::<usize>().ok().and_then(|i| items.get(i)).map(Cursor::Node)
            }
            Cursor::Node(PathNode::Value(v)) => Cursor::Json(v).child(segment),
            Cursor::Node(PathNode::Resolver(_)) => None,
            Cursor::Json(Value::Object(map)) => map.get(segment).map(Cursor::Json),
            Cursor::Json(Value::Array(items)) => {
                segment.parse::<usize>().ok().and_then(|i| items.get(i)).map(Cursor::Json)
            }
            Cursor::Json(_) => None,
        }
    }
}

/// Resolve `request` against `base`.
///
/// Returns `Value::Null` when the path leads nowhere. Otherwise the result
/// is `{"pathItem": value}`, or `{"pathItemList": [...]}` when `list_only`
/// is set. Resolver results that are already in one of these shapes are
/// passed through.
pub async fn resolve(base: &PathNode, request: &PathRequest) -> DrpResult<Value> {
    let mut cursor = Cursor::Node(base);
    let mut depth = 0;
    loop {
        if let Cursor::Node(PathNode::Resolver(resolver)) = cursor {
            let result = resolver.resolve(request.skip(depth)).await?;
            return Ok(finish_value(result, request.list_only));
        }
        let Some(segment) = request.path_list.get(depth) else {
            break;
        };
        cursor = match cursor.child(segment) {
            Some(next) => next,
            None => return Ok(Value::Null),
        };
        depth += 1;
    }

    if request.list_only {
        return Ok(match cursor {
            Cursor::Node(PathNode::Map(_) | PathNode::List(_)) => {
                json!({ "pathItemList": list_node_children(cursor) })
            }
            Cursor::Node(PathNode::Value(v)) | Cursor::Json(v) => list_json(v),
            Cursor::Node(PathNode::Resolver(_)) => Value::Null,
        });
    }

    let value = match cursor {
        Cursor::Node(node) => node.to_json(),
        Cursor::Json(v) => v.clone(),
    };
    Ok(finish_value(value, false))
}

fn finish_value(value: Value, list_only: bool) -> Value {
    if list_only {
        if value.get("pathItemList").is_some() {
            return value;
        }
        return list_json(&value);
    }
    match value {
        Value::Null => Value::Null,
        Value::Object(ref map) if map.contains_key("pathItem") => value,
        other => json!({ "pathItem": other }),
    }
}

fn list_json(value: &Value) -> Value {
    let items: Vec<Value> = match value {
        Value::Object(map) => map.iter().map(|(k, v)| manifest_entry(k, v)).collect(),
        Value::Array(items) => items
            .iter()
            .enumerate()
            .map(|(i, v)| manifest_entry(&i.to_string(), v))
            .collect(),
        _ => return Value::Null,
    };
    json!({ "pathItemList": items })
}

fn list_node_children(cursor: Cursor<'_>) -> Vec<Value> {
    match cursor {
        Cursor::Node(PathNode::Map(children)) => children
            .iter()
            .map(|(k, child)| node_entry(k, child))
            .collect(),
        Cursor::Node(PathNode::List(items)) => items
            .iter()
            .enumerate()
            .map(|(i, child)| node_entry(&i.to_string(), child))
            .collect(),
        _ => Vec::new(),
    }
}

fn node_entry(name: &str, node: &PathNode) -> Value {
    match node {
        PathNode::Map(children) => entry(name, "Object", json!(children.len())),
        PathNode::List(items) => entry(name, "Array", json!(items.len())),
        PathNode::Resolver(_) => entry(name, "Function", Value::Null),
        PathNode::Value(v) => manifest_entry(name, v),
    }
}

fn manifest_entry(name: &str, value: &Value) -> Value {
    match value {
        Value::Object(map) => entry(name, "Object", json!(map.len())),
        Value::Array(items) => entry(name, "Array", json!(items.len())),
        Value::String(_) => entry(name, "String", value.clone()),
        Value::Number(_) => entry(name, "Number", value.clone()),
        Value::Bool(_) => entry(name, "Boolean", value.clone()),
        Value::Null => entry(name, "Null", Value::Null),
    }
}

fn entry(name: &str, kind: &str, value: Value) -> Value {
    let mut map = Map::new();
    map.insert("Name".to_string(), Value::String(name.to_string()));
    map.insert("Type".to_string(), Value::String(kind.to_string()));
    map.insert("Value".to_string(), value);
    Value::Object(map)
}
