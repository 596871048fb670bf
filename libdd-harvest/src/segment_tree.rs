// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Rebuilds the parent/child hierarchy of the segments of one trace.

use tracing::debug;

/// A segment that can be placed into a [`SegmentTree`].
pub trait TreeSegment {
    fn id(&self) -> &str;
    fn parent_id(&self) -> Option<&str>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct Node<T> {
    pub segment: T,
    pub children: Vec<Node<T>>,
}

impl<T> Node<T> {
    fn new(segment: T) -> Self {
        Self {
            segment,
            children: Vec::new(),
        }
    }
}

/// Tree of segments rooted at the transaction's root segment.
///
/// A segment is attached under the node whose id equals its parent id. Segments whose parent is
/// not in the tree yet are dropped, not buffered.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentTree<T> {
    pub root: Node<T>,
}

impl<T: TreeSegment> SegmentTree<T> {
    pub fn new(root: T) -> Self {
        Self {
            root: Node::new(root),
        }
    }

    /// Depth-first, pre-order lookup of the node holding segment `id`.
    pub fn find(&self, id: &str) -> Option<&Node<T>> {
        let mut stack = vec![&self.root];
        while let Some(node) = stack.pop() {
            if node.segment.id() == id {
                return Some(node);
            }
            stack.extend(node.children.iter().rev());
        }
        None
    }

    fn find_mut(&mut self, id: &str) -> Option<&mut Node<T>> {
        let mut stack = vec![&mut self.root];
        while let Some(node) = stack.pop() {
            if node.segment.id() == id {
                return Some(node);
            }
            stack.extend(node.children.iter_mut().rev());
        }
        None
    }

    /// Attach `segment` under its parent. Returns false when the parent is unknown.
    pub fn add(&mut self, segment: T) -> bool {
        let Some(parent_id) = segment.parent_id() else {
            debug!(id = segment.id(), "Segment without parent id, dropping it");
            return false;
        };
        let parent_id = parent_id.to_owned();
        match self.find_mut(&parent_id) {
            Some(parent) => {
                parent.children.push(Node::new(segment));
                true
            }
            None => {
                debug!(
                    id = segment.id(),
                    parent_id = %parent_id,
                    "Parent segment not found, dropping segment"
                );
                false
            }
        }
    }

    pub fn node_count(&self) -> usize {
        let mut count = 0;
        let mut stack = vec![&self.root];
        while let Some(node) = stack.pop() {
            count += 1;
            stack.extend(node.children.iter());
        }
        count
    }
}
