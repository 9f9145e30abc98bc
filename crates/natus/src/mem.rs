//! The memory-graph allocator: a parent/child reference-counted arena with
//! typed destructors, used wherever ownership is a genuine DAG rather than a
//! simple tree — today, only the native loader's retained dynamic-library
//! handle, held as a child node of the context that loaded it.
//!
//! This is not a hand-rolled allocator: nodes are plain `Box<dyn Any>`
//! payloads keyed by a monotonically-increasing id, edges are explicit (so
//! `incref`/`decref` can be called more than once between the same two
//! nodes, mirroring edge-counted reference semantics rather than a simple
//! boolean reachability flag), and the graph itself lives behind a
//! `RefCell` since it is only ever touched from the one thread that owns
//! the enclosing `Context`.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct NodeId(usize);

struct Node {
    name: Option<String>,
    payload: Option<Box<dyn Any>>,
    destructor: Option<Box<dyn FnOnce(Box<dyn Any>)>>,
    parents: Vec<NodeId>,
    children: Vec<NodeId>,
    group: Option<usize>,
}

/// A parent/child reference-counted arena. One instance is typically owned
/// by a `Context`; nodes never outlive it.
#[derive(Default)]
pub struct Graph {
    nodes: RefCell<HashMap<NodeId, Node>>,
    next_id: Cell<usize>,
    next_group: Cell<usize>,
}

impl Graph {
    pub fn new() -> Graph {
        Graph {
            nodes: RefCell::new(HashMap::new()),
            next_id: Cell::new(0),
            next_group: Cell::new(0),
        }
    }

    /// Allocates a node with zero parents, optionally wired to `parent` with
    /// one `incref` edge. Returns `None` only if `parent` does not exist
    /// (mirrors "partial-link failures are rolled back before returning").
    pub fn new_node<T: Any>(&self, parent: Option<NodeId>, payload: T) -> Option<NodeId> {
        if let Some(p) = parent {
            if !self.nodes.borrow().contains_key(&p) {
                return None;
            }
        }
        let id = NodeId(self.next_id.get());
        self.next_id.set(id.0 + 1);
        self.nodes.borrow_mut().insert(
            id,
            Node {
                name: None,
                payload: Some(Box::new(payload)),
                destructor: None,
                parents: Vec::new(),
                children: Vec::new(),
                group: None,
            },
        );
        if let Some(p) = parent {
            self.incref(p, id);
        }
        Some(id)
    }

    /// Adds one parent→child edge.
    pub fn incref(&self, parent: NodeId, child: NodeId) {
        let mut nodes = self.nodes.borrow_mut();
        if !nodes.contains_key(&parent) || !nodes.contains_key(&child) {
            return;
        }
        nodes.get_mut(&parent).unwrap().children.push(child);
        nodes.get_mut(&child).unwrap().parents.push(parent);
    }

    /// Removes one parent→child edge. When `child`'s parent count reaches
    /// zero (and, if grouped, every group member's does too), it is freed:
    /// its destructor runs, then each of its own child edges is released in
    /// turn.
    pub fn decref(&self, parent: NodeId, child: NodeId) {
        {
            let mut nodes = self.nodes.borrow_mut();
            let Some(child_node) = nodes.get_mut(&child) else {
                return;
            };
            if let Some(pos) = child_node.parents.iter().position(|p| *p == parent) {
                child_node.parents.remove(pos);
            }
            if let Some(parent_node) = nodes.get_mut(&parent) {
                if let Some(pos) = parent_node.children.iter().position(|c| *c == child) {
                    parent_node.children.remove(pos);
                }
            }
        }
        self.maybe_free(child);
    }

    fn parent_count(&self, id: NodeId) -> usize {
        self.nodes.borrow().get(&id).map(|n| n.parents.len()).unwrap_or(0)
    }

    fn group_members(&self, id: NodeId) -> Vec<NodeId> {
        let nodes = self.nodes.borrow();
        let Some(group) = nodes.get(&id).and_then(|n| n.group) else {
            return vec![id];
        };
        nodes
            .iter()
            .filter(|(_, n)| n.group == Some(group))
            .map(|(id, _)| *id)
            .collect()
    }

    fn maybe_free(&self, id: NodeId) {
        if !self.nodes.borrow().contains_key(&id) || self.parent_count(id) != 0 {
            return;
        }
        let members = self.group_members(id);
        if members.iter().any(|m| self.parent_count(*m) != 0) {
            return;
        }
        for member in members {
            self.free_node(member);
        }
    }

    fn free_node(&self, id: NodeId) {
        let node = self.nodes.borrow_mut().remove(&id);
        let Some(node) = node else { return };
        if let (Some(dtor), Some(payload)) = (node.destructor, node.payload) {
            dtor(payload);
        }
        for child in node.children {
            self.decref_after_parent_removed(id, child);
        }
    }

    /// Like [`Graph::decref`] but the parent edge is already gone from the
    /// parent side (the parent node itself was just freed); only the
    /// child's bookkeeping needs updating.
    fn decref_after_parent_removed(&self, parent: NodeId, child: NodeId) {
        {
            let mut nodes = self.nodes.borrow_mut();
            if let Some(child_node) = nodes.get_mut(&child) {
                if let Some(pos) = child_node.parents.iter().position(|p| *p == parent) {
                    child_node.parents.remove(pos);
                }
            }
        }
        self.maybe_free(child);
    }

    pub fn destructor_set<T: Any>(&self, id: NodeId, dtor: impl FnOnce(T) + 'static) {
        if let Some(node) = self.nodes.borrow_mut().get_mut(&id) {
            node.destructor = Some(Box::new(move |payload: Box<dyn Any>| {
                if let Ok(typed) = payload.downcast::<T>() {
                    dtor(*typed);
                }
            }));
        }
    }

    pub fn name_set(&self, id: NodeId, name: impl Into<String>) {
        if let Some(node) = self.nodes.borrow_mut().get_mut(&id) {
            node.name = Some(name.into());
        }
    }

    pub fn name_get(&self, id: NodeId) -> Option<String> {
        self.nodes.borrow().get(&id).and_then(|n| n.name.clone())
    }

    pub fn payload_ref<T: Any>(&self, id: NodeId) -> Option<std::cell::Ref<'_, T>> {
        let nodes = self.nodes.borrow();
        if nodes.get(&id)?.payload.as_ref()?.downcast_ref::<T>().is_none() {
            return None;
        }
        Some(std::cell::Ref::map(nodes, |n| {
            n.get(&id).unwrap().payload.as_ref().unwrap().downcast_ref::<T>().unwrap()
        }))
    }

    /// Visits every direct child of `parent`, optionally restricted to
    /// children whose name equals `name_filter` — used by the require
    /// subsystem to find the "dll" child of a context.
    pub fn children_foreach(&self, parent: NodeId, name_filter: Option<&str>, mut cb: impl FnMut(NodeId)) {
        let children: Vec<NodeId> = {
            let nodes = self.nodes.borrow();
            let Some(node) = nodes.get(&parent) else {
                return;
            };
            node.children
                .iter()
                .copied()
                .filter(|c| match name_filter {
                    None => true,
                    Some(filter) => nodes.get(c).and_then(|n| n.name.as_deref()) == Some(filter),
                })
                .collect()
        };
        for child in children {
            cb(child);
        }
    }

    /// Merges the free-when-unreachable decision of `a` and `b`: neither is
    /// freed by a `decref` reaching zero parents until both have.
    pub fn group(&self, a: NodeId, b: NodeId) {
        let mut nodes = self.nodes.borrow_mut();
        let group_id = match (nodes.get(&a).and_then(|n| n.group), nodes.get(&b).and_then(|n| n.group)) {
            (Some(g), _) => g,
            (None, Some(g)) => g,
            (None, None) => {
                let g = self.next_group.get();
                self.next_group.set(g + 1);
                g
            }
        };
        if let Some(node) = nodes.get_mut(&a) {
            node.group = Some(group_id);
        }
        if let Some(node) = nodes.get_mut(&b) {
            node.group = Some(group_id);
        }
    }

    /// Debug-only leak report: walks every node reachable from `root` and
    /// emits one `tracing::trace!` line per node. A no-op unless the
    /// `trace` level is enabled — there is no separate CLI flag for it.
    pub fn debug_dump(&self, root: NodeId) {
        if !tracing::enabled!(tracing::Level::TRACE) {
            return;
        }
        let mut seen = std::collections::HashSet::new();
        self.debug_dump_inner(root, 0, &mut seen);
    }

    fn debug_dump_inner(&self, id: NodeId, depth: usize, seen: &mut std::collections::HashSet<NodeId>) {
        if !seen.insert(id) {
            tracing::trace!(depth, node = id.0, "... (already visited)");
            return;
        }
        let (name, children) = {
            let nodes = self.nodes.borrow();
            let Some(node) = nodes.get(&id) else {
                return;
            };
            (node.name.clone(), node.children.clone())
        };
        tracing::trace!(depth, node = id.0, name = ?name, "live node");
        for child in children {
            self.debug_dump_inner(child, depth + 1, seen);
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn destructor_runs_once_when_last_parent_released() {
        let graph = Graph::new();
        let parent = graph.new_node(None, ()).unwrap();
        let child = graph.new_node(Some(parent), 7u32).unwrap();

        let ran = std::rc::Rc::new(Cell::new(0));
        let ran_clone = ran.clone();
        graph.destructor_set::<u32>(child, move |_| ran_clone.set(ran_clone.get() + 1));

        graph.decref(parent, child);
        assert_eq!(ran.get(), 1);
        assert!(graph.is_empty() || graph.len() == 1); // parent itself still alive
    }

    #[test]
    fn grouped_nodes_free_together() {
        let graph = Graph::new();
        let root = graph.new_node(None, ()).unwrap();
        let a = graph.new_node(Some(root), "a").unwrap();
        let b = graph.new_node(Some(root), "b").unwrap();
        graph.group(a, b);

        let freed = std::rc::Rc::new(RefCell::new(Vec::new()));
        let freed_a = freed.clone();
        graph.destructor_set::<&str>(a, move |v| freed_a.borrow_mut().push(v));
        let freed_b = freed.clone();
        graph.destructor_set::<&str>(b, move |v| freed_b.borrow_mut().push(v));

        graph.decref(root, a);
        assert!(freed.borrow().is_empty(), "a must wait for b's last parent to go too");

        graph.decref(root, b);
        assert_eq!(freed.borrow().len(), 2);
    }

    #[test]
    fn children_foreach_filters_by_name() {
        let graph = Graph::new();
        let parent = graph.new_node(None, ()).unwrap();
        let dll = graph.new_node(Some(parent), ()).unwrap();
        graph.name_set(dll, "dll");
        let other = graph.new_node(Some(parent), ()).unwrap();
        graph.name_set(other, "module");

        let mut found = Vec::new();
        graph.children_foreach(parent, Some("dll"), |id| found.push(id));
        assert_eq!(found, vec![dll]);
    }
}
