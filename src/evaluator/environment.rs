//! Environment frames. Each frame is a heap node, so lookups, bindings and frame
//! creation are provided as [`Heap`] methods that keep the dependency edges current.

use std::collections::HashMap;

use crate::Error;
use crate::heap::{EnvId, Heap, NodeId, ValueId};

/// One frame of variable bindings, linked to its parent frame
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Environment {
    bindings: HashMap<String, Option<ValueId>>,
    /// Number of bindings referring to each value node
    referents: HashMap<NodeId, usize>,
    parent: Option<EnvId>,
}

impl Environment {
    pub fn parent(&self) -> Option<EnvId> {
        self.parent
    }

    /// Binding in this frame only; `Some(None)` is a name bound to nil
    pub fn get_local(&self, name: &str) -> Option<Option<ValueId>> {
        self.bindings.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    /// Whether the parent link or some binding refers to `target`
    pub(crate) fn refers_to(&self, target: NodeId) -> bool {
        self.parent.map(NodeId::from) == Some(target) || self.referents.contains_key(&target)
    }

    /// Insert or replace a binding; returns the value it replaced
    fn set(&mut self, name: String, value: Option<ValueId>) -> Option<ValueId> {
        if let Some(id) = value {
            *self.referents.entry(id.into()).or_default() += 1;
        }
        let old = self.bindings.insert(name, value).flatten();
        if let Some(id) = old {
            let node = NodeId::from(id);
            if let Some(count) = self.referents.get_mut(&node) {
                *count -= 1;
                if *count == 0 {
                    self.referents.remove(&node);
                }
            }
        }
        old
    }

    pub(crate) fn children(&self) -> Vec<NodeId> {
        self.bindings
            .values()
            .flatten()
            .map(|id| NodeId::from(*id))
            .chain(self.parent.map(NodeId::from))
            .collect()
    }
}

impl Heap {
    /// Create an empty frame whose lookups fall back to `parent`
    pub fn alloc_env(&mut self, parent: Option<EnvId>) -> EnvId {
        let env = self.insert_env(Environment {
            bindings: HashMap::new(),
            referents: HashMap::new(),
            parent,
        });
        tracing::trace!(?env, ?parent, "new environment");
        env
    }

    /// Resolve `name` through the frame chain
    pub fn lookup(&self, env: EnvId, name: &str) -> Result<Option<ValueId>, Error> {
        let owner = self.resolve_owner(env, name)?;
        Ok(self.env(owner).get_local(name).flatten())
    }

    /// First frame in the chain that binds `name` itself
    pub fn resolve_owner(&self, env: EnvId, name: &str) -> Result<EnvId, Error> {
        let mut current = Some(env);
        while let Some(id) = current {
            let frame = self.env(id);
            if frame.bindings.contains_key(name) {
                return Ok(id);
            }
            current = frame.parent;
        }
        Err(Error::unbound(name))
    }

    /// Bind `name` in `env` itself, replacing any previous binding there.
    pub fn bind(&mut self, env: EnvId, name: impl Into<String>, value: Option<ValueId>) {
        let old = self.env_mut(env).set(name.into(), value);
        self.replace_edge(env.into(), old.map(NodeId::from), value.map(NodeId::from));
    }

    /// Bindings of one frame, sorted by name
    pub fn bindings(&self, env: EnvId) -> Vec<(&str, Option<ValueId>)> {
        let mut result: Vec<_> = self
            .env(env)
            .bindings
            .iter()
            .map(|(name, value)| (name.as_str(), *value))
            .collect();
        result.sort_by(|a, b| a.0.cmp(b.0));
        result
    }
}
