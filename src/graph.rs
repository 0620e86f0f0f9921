//! Versioned dependency graph with lazy, memoized recomputation.
//!
//! Nodes live in an arena. Atoms hold values set from outside; derived nodes
//! hold a pure reducer over nodes that already exist, so the arena order is
//! always a topological order and cycles cannot be expressed.
//!
//! # Versions
//!
//! Every node carries a version that moves only when its value changes. A
//! derived node remembers the versions of its dependencies at the time it was
//! computed and is recomputed on read only when one of them has moved. If a
//! recomputation yields an equal value its own version stays put, so
//! downstream nodes are not recomputed either.

use std::collections::{BTreeSet, HashMap};

use thiserror::Error;

/// Handle to a node in a [`Graph`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

#[derive(Debug, Clone, PartialEq, Error)]
pub enum GraphError {
    #[error("unknown node `{0}`")]
    UnknownNode(String),
    #[error("node `{0}` is already defined")]
    DuplicateNode(String),
    #[error("node `{0}` is derived and cannot be set")]
    NotAnAtom(String),
    #[error("expected a {expected} value, found {found}")]
    TypeMismatch {
        expected: &'static str,
        found: &'static str,
    },
    #[error("while computing `{node}`: {source}")]
    Reducer {
        node: String,
        #[source]
        source: Box<GraphError>,
    },
}

/// Pure function from dependency values to a node value.
pub type Reducer<V> = Box<dyn Fn(&[V]) -> Result<V, GraphError>>;

struct Node<V> {
    name: String,
    deps: Vec<NodeId>,
    /// `None` for atoms.
    reducer: Option<Reducer<V>>,
    value: Option<V>,
    version: u64,
    /// Dependency versions the memoized value was computed from.
    seen: Vec<u64>,
}

/// Arena of atoms and derived nodes.
pub struct Graph<V> {
    nodes: Vec<Node<V>>,
    index: HashMap<String, NodeId>,
    dependents: Vec<Vec<NodeId>>,
    recomputations: u64,
}

impl<V: Clone + PartialEq> Default for Graph<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: Clone + PartialEq> Graph<V> {
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            index: HashMap::new(),
            dependents: Vec::new(),
            recomputations: 0,
        }
    }

    /// Define an atom with its initial value.
    pub fn atom(&mut self, name: &str, value: V) -> Result<NodeId, GraphError> {
        self.push(name, Vec::new(), None, Some(value))
    }

    /// Define a derived node over existing nodes.
    pub fn derived<F>(&mut self, name: &str, deps: &[NodeId], reducer: F) -> Result<NodeId, GraphError>
    where
        F: Fn(&[V]) -> Result<V, GraphError> + 'static,
    {
        if let Some(bad) = deps.iter().find(|d| d.0 >= self.nodes.len()) {
            return Err(GraphError::UnknownNode(format!("#{}", bad.0)));
        }
        self.push(name, deps.to_vec(), Some(Box::new(reducer)), None)
    }

    fn push(
        &mut self,
        name: &str,
        deps: Vec<NodeId>,
        reducer: Option<Reducer<V>>,
        value: Option<V>,
    ) -> Result<NodeId, GraphError> {
        if self.index.contains_key(name) {
            return Err(GraphError::DuplicateNode(name.to_string()));
        }
        let id = NodeId(self.nodes.len());
        for dep in &deps {
            self.dependents[dep.0].push(id);
        }
        self.nodes.push(Node {
            name: name.to_string(),
            seen: Vec::with_capacity(deps.len()),
            deps,
            reducer,
            version: u64::from(value.is_some()),
            value,
        });
        self.dependents.push(Vec::new());
        self.index.insert(name.to_string(), id);
        Ok(id)
    }

    pub fn id(&self, name: &str) -> Result<NodeId, GraphError> {
        self.index
            .get(name)
            .copied()
            .ok_or_else(|| GraphError::UnknownNode(name.to_string()))
    }

    pub fn name(&self, id: NodeId) -> &str {
        &self.nodes[id.0].name
    }

    pub fn is_atom(&self, id: NodeId) -> bool {
        self.nodes[id.0].reducer.is_none()
    }

    /// Node names in definition (topological) order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.nodes.iter().map(|n| n.name.as_str())
    }

    /// Total reducer invocations since construction.
    pub fn recomputations(&self) -> u64 {
        self.recomputations
    }

    /// Replace an atom's value.
    ///
    /// Returns every derived node that transitively depends on the atom, in
    /// topological order. Setting an equal value invalidates nothing.
    pub fn set(&mut self, id: NodeId, value: V) -> Result<Vec<NodeId>, GraphError> {
        let node = &mut self.nodes[id.0];
        if node.reducer.is_some() {
            return Err(GraphError::NotAnAtom(node.name.clone()));
        }
        if node.value.as_ref() == Some(&value) {
            return Ok(Vec::new());
        }
        node.value = Some(value);
        node.version += 1;
        Ok(self.downstream(id))
    }

    /// Transitive dependents of `id`, ascending.
    pub fn downstream(&self, id: NodeId) -> Vec<NodeId> {
        let mut seen = BTreeSet::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            for &dep in &self.dependents[current.0] {
                if seen.insert(dep) {
                    stack.push(dep);
                }
            }
        }
        seen.into_iter().collect()
    }

    /// Whether reading `id` would run its reducer or that of an upstream node.
    pub fn is_stale(&self, id: NodeId) -> bool {
        let node = &self.nodes[id.0];
        if node.reducer.is_none() {
            return false;
        }
        node.value.is_none()
            || node
                .deps
                .iter()
                .zip(&node.seen)
                .any(|(dep, &seen)| self.nodes[dep.0].version != seen || self.is_stale(*dep))
    }

    /// Read a node, recomputing stale derived values on the way.
    pub fn get(&mut self, id: NodeId) -> Result<V, GraphError> {
        self.refresh(id)?;
        self.value_of(id).cloned()
    }

    /// Read a node by name.
    pub fn get_named(&mut self, name: &str) -> Result<V, GraphError> {
        let id = self.id(name)?;
        self.get(id)
    }

    fn value_of(&self, id: NodeId) -> Result<&V, GraphError> {
        let node = &self.nodes[id.0];
        node.value
            .as_ref()
            .ok_or_else(|| GraphError::UnknownNode(node.name.clone()))
    }

    fn refresh(&mut self, id: NodeId) -> Result<(), GraphError> {
        if self.nodes[id.0].reducer.is_none() {
            return Ok(());
        }

        let deps = self.nodes[id.0].deps.clone();
        for &dep in &deps {
            self.refresh(dep)?;
        }

        let current: Vec<u64> = deps.iter().map(|d| self.nodes[d.0].version).collect();
        if self.nodes[id.0].value.is_some() && self.nodes[id.0].seen == current {
            return Ok(());
        }

        let inputs = deps
            .iter()
            .map(|d| self.value_of(*d).cloned())
            .collect::<Result<Vec<V>, _>>()?;

        let node = &self.nodes[id.0];
        let next = match &node.reducer {
            Some(reducer) => reducer(&inputs).map_err(|e| GraphError::Reducer {
                node: node.name.clone(),
                source: Box::new(e),
            })?,
            None => return Ok(()),
        };
        self.recomputations += 1;
        tracing::trace!(node = %node.name, "recomputed");

        let node = &mut self.nodes[id.0];
        if node.value.as_ref() != Some(&next) {
            node.value = Some(next);
            node.version += 1;
        }
        node.seen = current;
        Ok(())
    }
}
