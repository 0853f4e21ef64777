//! Hierarchical parameter storage shared by the backbone, proposal stage and head.
//!
//! A tree is made of [`Composite`] nodes whose named children are either further
//! composites or leaves. Leaves are trainable arrays (updated by the optimizer),
//! persistent arrays (running statistics) or persistent integer scalars.
//! Hierarchical names join the path components with `/`.

use std::collections::BTreeMap;

use ndarray::ArrayD;
use serde::{Deserialize, Serialize};

pub const PATH_SEPARATOR: char = '/';

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LeafRole {
    Trainable,
    Persistent,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ArrayLeaf {
    pub data: ArrayD<f32>,
    pub role: LeafRole,
}

/// A link holds parameters directly (convolution, batch-norm, linear). A chain
/// groups links and other chains.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompositeKind {
    Link,
    Chain,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Array(ArrayLeaf),
    /// Integer persistent state, e.g. the number of batches a batch-norm has seen.
    Scalar(i64),
    Composite(Composite),
}

impl Node {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Node::Array(_) => "array",
            Node::Scalar(_) => "scalar",
            Node::Composite(c) => match c.kind {
                CompositeKind::Link => "link",
                CompositeKind::Chain => "chain",
            },
        }
    }

    pub fn is_persistent(&self) -> bool {
        match self {
            Node::Array(leaf) => leaf.role == LeafRole::Persistent,
            Node::Scalar(_) => true,
            Node::Composite(_) => false,
        }
    }

    pub fn as_composite(&self) -> Option<&Composite> {
        match self {
            Node::Composite(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_composite_mut(&mut self) -> Option<&mut Composite> {
        match self {
            Node::Composite(c) => Some(c),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Composite {
    kind: CompositeKind,
    children: BTreeMap<String, Node>,
}

impl Composite {
    pub fn link() -> Self {
        Self {
            kind: CompositeKind::Link,
            children: BTreeMap::new(),
        }
    }

    pub fn chain() -> Self {
        Self {
            kind: CompositeKind::Chain,
            children: BTreeMap::new(),
        }
    }

    pub fn with_param(mut self, name: &str, data: ArrayD<f32>) -> Self {
        self.insert(name, Node::Array(ArrayLeaf { data, role: LeafRole::Trainable }));
        self
    }

    pub fn with_persistent(mut self, name: &str, data: ArrayD<f32>) -> Self {
        self.insert(name, Node::Array(ArrayLeaf { data, role: LeafRole::Persistent }));
        self
    }

    pub fn with_scalar(mut self, name: &str, value: i64) -> Self {
        self.insert(name, Node::Scalar(value));
        self
    }

    pub fn with_child(mut self, name: &str, child: Composite) -> Self {
        self.insert(name, Node::Composite(child));
        self
    }

    pub fn insert(&mut self, name: &str, node: Node) -> Option<Node> {
        self.children.insert(name.to_string(), node)
    }

    pub fn remove(&mut self, name: &str) -> Option<Node> {
        self.children.remove(name)
    }

    pub fn kind(&self) -> CompositeKind {
        self.kind
    }

    pub fn is_chain(&self) -> bool {
        self.kind == CompositeKind::Chain
    }

    pub fn get(&self, name: &str) -> Option<&Node> {
        self.children.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Node> {
        self.children.get_mut(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.children.contains_key(name)
    }

    pub fn child(&self, name: &str) -> Option<&Composite> {
        self.get(name).and_then(Node::as_composite)
    }

    pub fn child_mut(&mut self, name: &str) -> Option<&mut Composite> {
        self.get_mut(name).and_then(Node::as_composite_mut)
    }

    pub fn array(&self, name: &str) -> Option<&ArrayD<f32>> {
        match self.get(name) {
            Some(Node::Array(leaf)) => Some(&leaf.data),
            _ => None,
        }
    }

    pub fn array_mut(&mut self, name: &str) -> Option<&mut ArrayD<f32>> {
        match self.get_mut(name) {
            Some(Node::Array(leaf)) => Some(&mut leaf.data),
            _ => None,
        }
    }

    pub fn scalar(&self, name: &str) -> Option<i64> {
        match self.get(name) {
            Some(Node::Scalar(v)) => Some(*v),
            _ => None,
        }
    }

    /// All direct entries, in name order.
    pub fn entries(&self) -> impl Iterator<Item = (&str, &Node)> {
        self.children.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn entries_mut(&mut self) -> impl Iterator<Item = (&str, &mut Node)> {
        self.children.iter_mut().map(|(k, v)| (k.as_str(), v))
    }

    /// Direct composite children, in name order.
    pub fn children(&self) -> impl Iterator<Item = (&str, &Composite)> {
        self.children
            .iter()
            .filter_map(|(k, v)| v.as_composite().map(|c| (k.as_str(), c)))
    }

    pub fn child_names(&self) -> Vec<&str> {
        self.children().map(|(name, _)| name).collect()
    }

    /// Resolves a `/`-separated path relative to this node.
    pub fn at(&self, path: &str) -> Option<&Node> {
        let mut parts = path.split(PATH_SEPARATOR).filter(|p| !p.is_empty());
        let first = parts.next()?;
        let mut node = self.get(first)?;
        for part in parts {
            node = node.as_composite()?.get(part)?;
        }
        Some(node)
    }

    pub fn at_mut(&mut self, path: &str) -> Option<&mut Node> {
        let mut parts = path.split(PATH_SEPARATOR).filter(|p| !p.is_empty());
        let first = parts.next()?;
        let mut node = self.get_mut(first)?;
        for part in parts {
            node = node.as_composite_mut()?.get_mut(part)?;
        }
        Some(node)
    }

    /// Flattens every leaf below this node into `(path, leaf)` pairs.
    pub fn named_leaves(&self) -> Vec<(String, &Node)> {
        let mut out = Vec::new();
        self.collect_leaves("", &mut out);
        out
    }

    fn collect_leaves<'a>(&'a self, prefix: &str, out: &mut Vec<(String, &'a Node)>) {
        for (name, node) in self.children.iter() {
            let path = join_path(prefix, name);
            match node {
                Node::Composite(c) => c.collect_leaves(&path, out),
                leaf => out.push((path, leaf)),
            }
        }
    }

    /// Visits every trainable array with its hierarchical name.
    pub fn visit_params_mut<F>(&mut self, prefix: &str, f: &mut F)
    where
        F: FnMut(&str, &mut ArrayD<f32>),
    {
        for (name, node) in self.children.iter_mut() {
            let path = join_path(prefix, name);
            match node {
                Node::Composite(c) => c.visit_params_mut(&path, f),
                Node::Array(leaf) if leaf.role == LeafRole::Trainable => f(&path, &mut leaf.data),
                _ => {}
            }
        }
    }

    pub fn param_count(&self) -> usize {
        self.named_leaves()
            .iter()
            .map(|(_, node)| match node {
                Node::Array(leaf) if leaf.role == LeafRole::Trainable => leaf.data.len(),
                _ => 0,
            })
            .sum()
    }
}

pub fn join_path(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}{PATH_SEPARATOR}{name}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{ArrayD, IxDyn};

    fn bn(channels: usize) -> Composite {
        Composite::link()
            .with_param("gamma", ArrayD::ones(IxDyn(&[channels])))
            .with_param("beta", ArrayD::zeros(IxDyn(&[channels])))
            .with_persistent("avg_mean", ArrayD::zeros(IxDyn(&[channels])))
            .with_persistent("avg_var", ArrayD::ones(IxDyn(&[channels])))
            .with_scalar("N", 0)
    }

    #[test]
    fn resolves_nested_paths() {
        let tree = Composite::chain().with_child("block", Composite::chain().with_child("bn1", bn(3)));
        assert!(matches!(tree.at("block/bn1/N"), Some(Node::Scalar(0))));
        assert_eq!(tree.at("block/bn1/gamma").map(Node::kind_name), Some("array"));
        assert!(tree.at("block/missing").is_none());
        assert!(tree.at("block/bn1/gamma/deeper").is_none());
    }

    #[test]
    fn flattens_leaves_in_name_order() {
        let tree = Composite::chain().with_child("bn1", bn(2));
        let names: Vec<String> = tree.named_leaves().into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["bn1/N", "bn1/avg_mean", "bn1/avg_var", "bn1/beta", "bn1/gamma"]);
    }

    #[test]
    fn counts_only_trainable_values() {
        let tree = Composite::chain().with_child("bn1", bn(4));
        assert_eq!(tree.param_count(), 8);
    }
}
