//! Named-array container used for detector checkpoints and pretrained weights.
//!
//! Entries are keyed by the `/`-joined hierarchical name of each leaf. Loading
//! into a live tree is all-or-nothing: names, kinds and shapes are checked for
//! every entry before the first value is written.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use ndarray::{ArrayD, IxDyn};
use serde::{Deserialize, Serialize};

use crate::common::{
    ArrayLeaf, Composite, DetectorError, DetectorResult, LeafRole, Node, PATH_SEPARATOR,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotValue {
    Array {
        shape: Vec<usize>,
        data: Vec<f32>,
        #[serde(default)]
        persistent: bool,
    },
    Scalar(i64),
}

impl SnapshotValue {
    fn kind_name(&self) -> &'static str {
        match self {
            SnapshotValue::Array { .. } => "array",
            SnapshotValue::Scalar(_) => "scalar",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub entries: BTreeMap<String, SnapshotValue>,
}

impl Snapshot {
    pub fn from_tree(tree: &Composite) -> Self {
        let entries = tree
            .named_leaves()
            .into_iter()
            .filter_map(|(name, node)| {
                let value = match node {
                    Node::Array(leaf) => SnapshotValue::Array {
                        shape: leaf.data.shape().to_vec(),
                        data: leaf.data.iter().copied().collect(),
                        persistent: leaf.role == LeafRole::Persistent,
                    },
                    Node::Scalar(v) => SnapshotValue::Scalar(*v),
                    Node::Composite(_) => return None,
                };
                Some((name, value))
            })
            .collect();
        Self { entries }
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> DetectorResult<()> {
        let path = path.as_ref();
        let io_err = |source| DetectorError::Io { path: path.to_path_buf(), source };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        let file = fs::File::create(path).map_err(io_err)?;
        serde_json::to_writer(BufWriter::new(file), self).map_err(|source| DetectorError::Json {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn load<P: AsRef<Path>>(path: P) -> DetectorResult<Self> {
        let path = path.as_ref();
        let file = fs::File::open(path).map_err(|source| DetectorError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_reader(BufReader::new(file)).map_err(|source| DetectorError::Json {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Writes every entry into `tree`. `origin` only labels errors.
    ///
    /// Fails with `IncompatibleSnapshot` without touching `tree` when the two
    /// do not have exactly the same leaves with the same kinds and shapes.
    pub fn apply_to(&self, tree: &mut Composite, origin: &Path) -> DetectorResult<()> {
        let incompatible = |reason: String| DetectorError::IncompatibleSnapshot {
            path: origin.to_path_buf(),
            reason,
        };

        let live = tree.named_leaves();
        let live_names: BTreeSet<&str> = live.iter().map(|(n, _)| n.as_str()).collect();
        let snap_names: BTreeSet<&str> = self.entries.keys().map(String::as_str).collect();
        if let Some(missing) = live_names.difference(&snap_names).next() {
            return Err(incompatible(format!("`{missing}` is missing from the snapshot")));
        }
        if let Some(extra) = snap_names.difference(&live_names).next() {
            return Err(incompatible(format!("`{extra}` does not exist in the model")));
        }
        for (name, node) in live.iter() {
            let value = &self.entries[name];
            match (node, value) {
                (Node::Array(leaf), SnapshotValue::Array { shape, data, .. }) => {
                    if leaf.data.shape() != shape.as_slice() {
                        return Err(incompatible(format!(
                            "`{name}` has shape {:?} in the model but {:?} in the snapshot",
                            leaf.data.shape(),
                            shape
                        )));
                    }
                    if data.len() != leaf.data.len() {
                        return Err(incompatible(format!("`{name}` holds {} values, expected {}", data.len(), leaf.data.len())));
                    }
                }
                (Node::Scalar(_), SnapshotValue::Scalar(_)) => {}
                (node, value) => {
                    return Err(incompatible(format!(
                        "`{name}` is a {} in the model but a {} in the snapshot",
                        node.kind_name(),
                        value.kind_name()
                    )))
                }
            }
        }

        for (name, value) in self.entries.iter() {
            match (tree.at_mut(name), value) {
                (Some(Node::Array(leaf)), SnapshotValue::Array { data, .. }) => {
                    leaf.data
                        .iter_mut()
                        .zip(data.iter())
                        .for_each(|(d, s)| *d = *s);
                }
                (Some(Node::Scalar(v)), SnapshotValue::Scalar(s)) => *v = *s,
                _ => unreachable!("validated above"),
            }
        }
        Ok(())
    }

    /// Rebuilds a free-standing tree from the flat names. A composite whose
    /// children are all leaves becomes a link, anything else a chain.
    pub fn to_tree(&self) -> DetectorResult<Composite> {
        let mut root = Composite::chain();
        for (name, value) in self.entries.iter() {
            let parts: Vec<&str> = name.split(PATH_SEPARATOR).collect();
            let (leaf_name, parents) = parts
                .split_last()
                .ok_or_else(|| DetectorError::mismatch(name.clone(), "empty entry name"))?;
            let mut node = &mut root;
            for part in parents {
                if !node.contains(part) {
                    node.insert(part, Node::Composite(Composite::link()));
                }
                node = node
                    .child_mut(part)
                    .ok_or_else(|| DetectorError::mismatch(name.clone(), format!("`{part}` is a leaf")))?;
            }
            let leaf = match value {
                SnapshotValue::Array { shape, data, persistent } => Node::Array(ArrayLeaf {
                    data: ArrayD::from_shape_vec(IxDyn(shape), data.clone())?,
                    role: if *persistent { LeafRole::Persistent } else { LeafRole::Trainable },
                }),
                SnapshotValue::Scalar(v) => Node::Scalar(*v),
            };
            node.insert(leaf_name, leaf);
        }
        Ok(promote_chains(root))
    }
}

fn promote_chains(node: Composite) -> Composite {
    let has_composites = node.children().next().is_some();
    let mut out = if has_composites || node.is_chain() {
        Composite::chain()
    } else {
        Composite::link()
    };
    let entries: Vec<(String, Node)> = node
        .entries()
        .map(|(name, child)| (name.to_string(), child.clone()))
        .collect();
    for (name, child) in entries {
        let child = match child {
            Node::Composite(c) => Node::Composite(promote_chains(c)),
            leaf => leaf,
        };
        out.insert(&name, child);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::ArrayD;

    fn sample() -> Composite {
        Composite::chain().with_child(
            "bn1",
            Composite::link()
                .with_param("gamma", ArrayD::from_elem(IxDyn(&[2]), 0.5))
                .with_persistent("avg_var", ArrayD::from_elem(IxDyn(&[2]), 2.))
                .with_scalar("N", 7),
        )
    }

    #[test]
    fn rejects_shape_mismatch_without_mutation() {
        let mut snap = Snapshot::from_tree(&sample());
        if let Some(SnapshotValue::Array { data, .. }) = snap.entries.get_mut("bn1/avg_var") {
            data.iter_mut().for_each(|v| *v = 9.);
        }
        snap.entries.insert(
            "bn1/gamma".to_string(),
            SnapshotValue::Array { shape: vec![3], data: vec![1.; 3], persistent: false },
        );
        let mut live = sample();
        let err = snap.apply_to(&mut live, Path::new("bad.json")).unwrap_err();
        assert!(matches!(err, DetectorError::IncompatibleSnapshot { .. }));
        assert_eq!(live, sample());
    }

    #[test]
    fn rebuilds_links_and_chains() {
        let tree = Snapshot::from_tree(&sample()).to_tree().unwrap();
        assert!(tree.is_chain());
        let bn1 = tree.child("bn1").unwrap();
        assert!(!bn1.is_chain());
        assert_eq!(bn1.scalar("N"), Some(7));
        assert!(bn1.get("avg_var").unwrap().is_persistent());
    }
}
