//! Copies pretrained values between parameter trees addressed by name.
//!
//! The source and destination need not be identical networks, but every level
//! taking part in a copy must agree on child names and node kinds. Copies that
//! already happened to sibling subtrees are kept when a later subtree fails.

use std::collections::BTreeSet;

use ndarray::{ArrayD, Axis, Slice};

use crate::common::{join_path, ArrayLeaf, Composite, DetectorError, DetectorResult, LeafRole, Node};

/// Copies every persistent leaf (running statistics, counters) of one
/// composite from `src` into `dst`. Nested composites are not visited.
pub fn copy_persistent(dst: &mut Composite, src: &Composite) -> DetectorResult<()> {
    copy_persistent_at("", dst, src)
}

/// `copy_persistent` on the root, then on every composite below it.
pub fn copy_tree(dst: &mut Composite, src: &Composite) -> DetectorResult<()> {
    copy_tree_at("", dst, src)
}

/// Copies every trainable array below `dst` from the same-named array of `src`.
pub fn copy_params(dst: &mut Composite, src: &Composite) -> DetectorResult<()> {
    copy_params_at("", dst, src)
}

/// Reverses the input-channel axis of a convolution weight, turning a filter
/// trained on BGR input into one that consumes RGB.
pub fn reverse_input_channels(conv: &mut Composite) -> DetectorResult<()> {
    let w = conv
        .array_mut("W")
        .ok_or_else(|| DetectorError::mismatch("W", "convolution has no weight"))?;
    if w.ndim() != 4 {
        return Err(DetectorError::mismatch("W", format!("expected 4 axes, got {}", w.ndim())));
    }
    let reversed = w
        .slice_axis(Axis(1), Slice::new(0, None, -1))
        .as_standard_layout()
        .into_owned();
    *w = reversed;
    Ok(())
}

/// Copies trainable values and persistent state of the child `name` when the
/// source has one. Returns whether anything was copied.
pub fn transplant_child(dst: &mut Composite, src: &Composite, name: &str) -> DetectorResult<bool> {
    let Some(src_child) = src.child(name) else {
        log::info!("Source has no `{name}`, keeping its initial values");
        return Ok(false);
    };
    let dst_child = dst
        .child_mut(name)
        .ok_or_else(|| DetectorError::mismatch(name, "missing in the destination"))?;
    if dst_child.kind() != src_child.kind() {
        return Err(DetectorError::mismatch(
            name,
            format!("{:?} <- {:?}", dst_child.kind(), src_child.kind()),
        ));
    }
    copy_params_at(name, dst_child, src_child)?;
    copy_tree_at(name, dst_child, src_child)?;
    Ok(true)
}

fn persistent_names(node: &Composite) -> BTreeSet<&str> {
    node.entries()
        .filter(|(_, n)| n.is_persistent())
        .map(|(name, _)| name)
        .collect()
}

fn trainable_names(node: &Composite) -> BTreeSet<&str> {
    node.entries()
        .filter(|(_, n)| matches!(n, Node::Array(leaf) if leaf.role == LeafRole::Trainable))
        .map(|(name, _)| name)
        .collect()
}

fn leaf_kind(node: &Node) -> &'static str {
    match node {
        Node::Array(ArrayLeaf { role: LeafRole::Trainable, .. }) => "trainable array",
        Node::Array(ArrayLeaf { role: LeafRole::Persistent, .. }) => "persistent array",
        other => other.kind_name(),
    }
}

/// Same-named entries must agree on being a trainable array, a persistent
/// array, a scalar or a sub-module.
fn ensure_same_kinds(prefix: &str, dst: &Composite, src: &Composite) -> DetectorResult<()> {
    for (name, d) in dst.entries() {
        let Some(s) = src.get(name) else {
            continue;
        };
        let (dst_kind, src_kind) = (leaf_kind(d), leaf_kind(s));
        let both_composite = matches!((d, s), (Node::Composite(_), Node::Composite(_)));
        if !both_composite && dst_kind != src_kind {
            return Err(DetectorError::TypeTransplant {
                path: join_path(prefix, name),
                dst_kind,
                src_kind,
            });
        }
    }
    Ok(())
}

fn composite_names(node: &Composite) -> BTreeSet<&str> {
    node.children().map(|(name, _)| name).collect()
}

fn ensure_same_names(prefix: &str, dst: BTreeSet<&str>, src: BTreeSet<&str>) -> DetectorResult<()> {
    if let Some(name) = dst.difference(&src).next() {
        return Err(DetectorError::mismatch(join_path(prefix, name), "missing in the source"));
    }
    if let Some(name) = src.difference(&dst).next() {
        return Err(DetectorError::mismatch(join_path(prefix, name), "missing in the destination"));
    }
    Ok(())
}

fn copy_array(path: &str, dst: &mut ArrayD<f32>, src: &ArrayD<f32>) -> DetectorResult<()> {
    if dst.shape() != src.shape() {
        return Err(DetectorError::mismatch(
            path,
            format!("shape {:?} <- {:?}", dst.shape(), src.shape()),
        ));
    }
    dst.assign(src);
    Ok(())
}

fn copy_persistent_at(prefix: &str, dst: &mut Composite, src: &Composite) -> DetectorResult<()> {
    ensure_same_kinds(prefix, dst, src)?;
    ensure_same_names(prefix, persistent_names(dst), persistent_names(src))?;
    for (name, node) in dst.entries_mut() {
        if !node.is_persistent() {
            continue;
        }
        let path = join_path(prefix, name);
        let Some(src_node) = src.get(name) else {
            return Err(DetectorError::mismatch(path, "missing in the source"));
        };
        match (node, src_node) {
            (Node::Array(d), Node::Array(s)) => copy_array(&path, &mut d.data, &s.data)?,
            (Node::Scalar(d), Node::Scalar(s)) => *d = *s,
            (d, s) => {
                return Err(DetectorError::TypeTransplant {
                    path,
                    dst_kind: d.kind_name(),
                    src_kind: s.kind_name(),
                })
            }
        }
    }
    Ok(())
}

fn copy_tree_at(prefix: &str, dst: &mut Composite, src: &Composite) -> DetectorResult<()> {
    copy_persistent_at(prefix, dst, src)?;
    ensure_same_names(prefix, composite_names(dst), composite_names(src))?;
    for (name, node) in dst.entries_mut() {
        let Node::Composite(dst_child) = node else {
            continue;
        };
        let path = join_path(prefix, name);
        let src_child = src
            .child(name)
            .ok_or_else(|| DetectorError::mismatch(path.clone(), "missing in the source"))?;
        match (dst_child.is_chain(), src_child.is_chain()) {
            (true, true) => copy_tree_at(&path, dst_child, src_child)?,
            (false, false) => copy_persistent_at(&path, dst_child, src_child)?,
            (dst_chain, _) => {
                let (d, s) = if dst_chain { ("chain", "link") } else { ("link", "chain") };
                return Err(DetectorError::mismatch(path, format!("{d} <- {s}")));
            }
        }
    }
    Ok(())
}

fn copy_params_at(prefix: &str, dst: &mut Composite, src: &Composite) -> DetectorResult<()> {
    ensure_same_kinds(prefix, dst, src)?;
    ensure_same_names(prefix, trainable_names(dst), trainable_names(src))?;
    ensure_same_names(prefix, composite_names(dst), composite_names(src))?;
    for (name, node) in dst.entries_mut() {
        let path = join_path(prefix, name);
        match node {
            Node::Array(ArrayLeaf { data, role: LeafRole::Trainable }) => match src.get(name) {
                Some(Node::Array(s)) => copy_array(&path, data, &s.data)?,
                _ => return Err(DetectorError::mismatch(path, "missing in the source")),
            },
            Node::Composite(dst_child) => {
                let src_child = src
                    .child(name)
                    .ok_or_else(|| DetectorError::mismatch(path.clone(), "missing in the source"))?;
                copy_params_at(&path, dst_child, src_child)?;
            }
            _ => {}
        }
    }
    Ok(())
}
