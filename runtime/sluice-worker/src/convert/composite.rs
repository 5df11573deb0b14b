//! Nested values (structs, lists, maps).
//!
//! Nodes live in an arena and refer to each other by [`NodeId`], which is
//! the identity used for cycle detection. Both building a tree out of Arrow
//! arrays and normalizing it use explicit work stacks, so nesting depth in
//! a result never turns into call depth.

use std::collections::HashSet;

use arrow::array::{Array, ArrayRef, AsArray};
use arrow::datatypes::DataType;

use super::column::{dictionary_entry, is_null_at, scalar_value};
use super::{DecodeError, NormalizedValue, RawColumnValue, normalize_scalar};

pub const CIRCULAR_MARKER: &str = "[Circular]";
pub const MAX_DEPTH_MARKER: &str = "[MaxDepth]";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NodeId(usize);

#[derive(Clone, Debug, PartialEq)]
pub enum RawNode {
    Scalar(RawColumnValue),
    Struct(Vec<(String, NodeId)>),
    List(Vec<NodeId>),
    Map(Vec<(NodeId, NodeId)>),
}

#[derive(Debug, Default)]
pub struct CompositeArena {
    nodes: Vec<RawNode>,
}

impl CompositeArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, node: RawNode) -> NodeId {
        self.nodes.push(node);
        NodeId(self.nodes.len() - 1)
    }

    /// Replaces a node, which lets callers link a node to one allocated
    /// after it.
    pub fn set(&mut self, id: NodeId, node: RawNode) -> Result<(), DecodeError> {
        let slot = self.nodes.get_mut(id.0).ok_or(DecodeError::DanglingNode(id.0))?;
        *slot = node;
        Ok(())
    }

    pub fn get(&self, id: NodeId) -> Option<&RawNode> {
        self.nodes.get(id.0)
    }

    pub fn clear(&mut self) {
        self.nodes.clear();
    }

    /// Builds the tree for `row` of a nested column and returns its root.
    pub fn extract(&mut self, array: &ArrayRef, row: usize) -> Result<NodeId, DecodeError> {
        let root = self.push(RawNode::Scalar(RawColumnValue::Null));
        let mut pending: Vec<(ArrayRef, usize, NodeId)> = vec![(array.clone(), row, root)];
        while let Some((array, row, target)) = pending.pop() {
            if is_null_at(array.as_ref(), row) {
                continue;
            }
            let node = match array.data_type() {
                DataType::Struct(fields) => {
                    let parent = array.as_struct();
                    let mut entries = Vec::with_capacity(fields.len());
                    for (idx, field) in fields.iter().enumerate() {
                        let child = self.push(RawNode::Scalar(RawColumnValue::Null));
                        entries.push((field.name().clone(), child));
                        pending.push((parent.column(idx).clone(), row, child));
                    }
                    RawNode::Struct(entries)
                }
                DataType::List(_) => self.list_node(array.as_list::<i32>().value(row), &mut pending),
                DataType::LargeList(_) => {
                    self.list_node(array.as_list::<i64>().value(row), &mut pending)
                }
                DataType::FixedSizeList(_, _) => {
                    self.list_node(array.as_fixed_size_list().value(row), &mut pending)
                }
                DataType::Map(_, _) => {
                    let entries = array.as_map().value(row);
                    let keys = entries.column(0);
                    let values = entries.column(1);
                    let mut pairs = Vec::with_capacity(entries.len());
                    for idx in 0..entries.len() {
                        let key = self.push(RawNode::Scalar(RawColumnValue::Null));
                        let value = self.push(RawNode::Scalar(RawColumnValue::Null));
                        pairs.push((key, value));
                        pending.push((keys.clone(), idx, key));
                        pending.push((values.clone(), idx, value));
                    }
                    RawNode::Map(pairs)
                }
                DataType::Dictionary(_, _) => {
                    RawNode::Scalar(dictionary_entry(array.as_ref(), row)?)
                }
                _ => RawNode::Scalar(scalar_value(array.as_ref(), row)?),
            };
            self.set(target, node)?;
        }
        Ok(root)
    }

    fn list_node(
        &mut self,
        items: ArrayRef,
        pending: &mut Vec<(ArrayRef, usize, NodeId)>,
    ) -> RawNode {
        let mut ids = Vec::with_capacity(items.len());
        for idx in 0..items.len() {
            let id = self.push(RawNode::Scalar(RawColumnValue::Null));
            ids.push(id);
            pending.push((items.clone(), idx, id));
        }
        RawNode::List(ids)
    }

    /// Normalizes the tree under `root`. Containers nested deeper than
    /// `max_depth` become [`MAX_DEPTH_MARKER`]; a node that is its own
    /// ancestor becomes [`CIRCULAR_MARKER`].
    pub fn normalize(&self, root: NodeId, max_depth: usize) -> Result<NormalizedValue, DecodeError> {
        let mut on_path = HashSet::new();
        let mut stack: Vec<Frame> = Vec::new();
        match self.enter(root, 0, max_depth, &on_path)? {
            Entered::Value(value) => return Ok(value),
            Entered::Frame(frame) => {
                on_path.insert(root);
                stack.push(frame);
            }
        }

        loop {
            let next = stack.last_mut().and_then(|frame| {
                let child = frame.children.get(frame.next).copied()?;
                frame.next += 1;
                Some((child, frame.depth + 1))
            });
            if let Some((child, depth)) = next {
                match self.enter(child, depth, max_depth, &on_path)? {
                    Entered::Value(value) => {
                        if let Some(frame) = stack.last_mut() {
                            frame.values.push(value);
                        }
                    }
                    Entered::Frame(frame) => {
                        on_path.insert(child);
                        stack.push(frame);
                    }
                }
                continue;
            }

            let Some(done) = stack.pop() else {
                return Ok(NormalizedValue::Null);
            };
            on_path.remove(&done.id);
            let value = done.finish();
            match stack.last_mut() {
                Some(parent) => parent.values.push(value),
                None => return Ok(value),
            }
        }
    }

    fn enter(
        &self,
        id: NodeId,
        depth: usize,
        max_depth: usize,
        on_path: &HashSet<NodeId>,
    ) -> Result<Entered, DecodeError> {
        let node = self.get(id).ok_or(DecodeError::DanglingNode(id.0))?;
        let (shape, children) = match node {
            RawNode::Scalar(raw) => return Ok(Entered::Value(normalize_scalar(raw))),
            RawNode::Struct(entries) => (
                Shape::Struct(entries.iter().map(|(name, _)| name.clone()).collect()),
                entries.iter().map(|(_, child)| *child).collect(),
            ),
            RawNode::List(items) => (Shape::List, items.clone()),
            RawNode::Map(pairs) => (
                Shape::Map,
                pairs.iter().flat_map(|(key, value)| [*key, *value]).collect(),
            ),
        };
        if on_path.contains(&id) {
            return Ok(Entered::Value(NormalizedValue::Text(CIRCULAR_MARKER.into())));
        }
        if depth >= max_depth {
            return Ok(Entered::Value(NormalizedValue::Text(MAX_DEPTH_MARKER.into())));
        }
        let frame = Frame::new(id, depth, shape, children);
        Ok(Entered::Frame(frame))
    }
}

enum Entered {
    Value(NormalizedValue),
    Frame(Frame),
}

enum Shape {
    Struct(Vec<String>),
    List,
    /// Children alternate key, value.
    Map,
}

struct Frame {
    id: NodeId,
    depth: usize,
    shape: Shape,
    children: Vec<NodeId>,
    next: usize,
    values: Vec<NormalizedValue>,
}

impl Frame {
    fn new(id: NodeId, depth: usize, shape: Shape, children: Vec<NodeId>) -> Self {
        let values = Vec::with_capacity(children.len());
        Self {
            id,
            depth,
            shape,
            children,
            next: 0,
            values,
        }
    }

    fn finish(self) -> NormalizedValue {
        match self.shape {
            Shape::Struct(names) => NormalizedValue::Object(names.into_iter().zip(self.values).collect()),
            Shape::List => NormalizedValue::Array(self.values),
            Shape::Map => {
                let mut entries = Vec::with_capacity(self.values.len() / 2);
                let mut values = self.values.into_iter();
                while let (Some(key), Some(value)) = (values.next(), values.next()) {
                    entries.push((key.to_key(), value));
                }
                NormalizedValue::Object(entries)
            }
        }
    }
}
