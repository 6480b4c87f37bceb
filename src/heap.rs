//! Node arena, dependency graph and mark-and-sweep collector.
//!
//! Every [`Value`] and every [`Environment`] is a node in one [`Heap`]. Structural
//! references (pair fields, closure bodies and scopes, environment parents and bindings)
//! are mirrored by dependency edges: `B ∈ A.dependencies ⇔ A ∈ B.upper_dependencies`.
//! All mutation goes through the setters here (and [`Heap::bind`]) so the two stay in
//! sync. The collector marks from a root environment with an explicit worklist, then
//! unlinks every unmarked node from its neighbours before freeing any of them, so cycles
//! among garbage are reclaimed safely.
//!
//! Handles carry a generation: freeing a slot bumps it, so a handle to a reclaimed node
//! never aliases whatever is allocated in that slot later.

use std::collections::HashSet;

use crate::Error;
use crate::ast::{FALSE, NumberType, TRUE, Value};
use crate::evaluator::Environment;

/// Identity of a heap node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId {
    index: usize,
    generation: u32,
}

/// Handle to a value node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ValueId(NodeId);

/// Handle to an environment node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EnvId(NodeId);

impl From<ValueId> for NodeId {
    fn from(id: ValueId) -> Self {
        id.0
    }
}

impl From<EnvId> for NodeId {
    fn from(id: EnvId) -> Self {
        id.0
    }
}

#[derive(Debug)]
enum NodeKind {
    Value(Value),
    Env(Environment),
}

impl NodeKind {
    fn children(&self) -> Vec<NodeId> {
        match self {
            NodeKind::Value(value) => value.children(),
            NodeKind::Env(env) => env.children(),
        }
    }

    fn refers_to(&self, target: NodeId) -> bool {
        match self {
            NodeKind::Value(value) => value.refers_to(target),
            NodeKind::Env(env) => env.refers_to(target),
        }
    }
}

#[derive(Debug)]
struct Node {
    kind: NodeKind,
    /// Nodes this one keeps alive
    dependencies: HashSet<NodeId>,
    /// Nodes keeping this one alive
    upper_dependencies: HashSet<NodeId>,
    marked: bool,
}

#[derive(Debug, Default)]
struct Slot {
    generation: u32,
    node: Option<Node>,
}

/// Pair field addressed by [`Heap::set_pair_field`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairField {
    First,
    Second,
    Name,
}

/// Collector statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeapStats {
    pub collections: u64,
    pub total_allocated: u64,
    pub total_freed: u64,
    pub peak_nodes: usize,
}

/// Owner of every value and environment node
#[derive(Debug, Default)]
pub struct Heap {
    slots: Vec<Slot>,
    free_list: Vec<usize>,
    live: usize,
    stats: HeapStats,
}

impl Heap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live nodes
    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    pub fn stats(&self) -> &HeapStats {
        &self.stats
    }

    /// Whether the handle still refers to a live node
    pub fn contains(&self, id: impl Into<NodeId>) -> bool {
        self.try_node(id.into()).is_some()
    }

    /// Register a node and add one edge per structural reference it holds
    fn insert(&mut self, kind: NodeKind) -> NodeId {
        let children = kind.children();
        let node = Node {
            kind,
            dependencies: HashSet::new(),
            upper_dependencies: HashSet::new(),
            marked: false,
        };

        let id = match self.free_list.pop() {
            Some(index) => {
                let slot = &mut self.slots[index];
                slot.node = Some(node);
                NodeId {
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    node: Some(node),
                });
                NodeId {
                    index: self.slots.len() - 1,
                    generation: 0,
                }
            }
        };

        for child in children {
            self.add_dependency(id, Some(child));
        }

        self.live += 1;
        self.stats.total_allocated += 1;
        self.stats.peak_nodes = self.stats.peak_nodes.max(self.live);
        id
    }

    pub fn alloc(&mut self, value: Value) -> ValueId {
        ValueId(self.insert(NodeKind::Value(value)))
    }

    pub(crate) fn insert_env(&mut self, env: Environment) -> EnvId {
        EnvId(self.insert(NodeKind::Env(env)))
    }

    pub fn number(&mut self, n: NumberType) -> ValueId {
        self.alloc(Value::Number(n))
    }

    pub fn symbol(&mut self, name: impl Into<String>) -> ValueId {
        self.alloc(Value::Symbol(name.into()))
    }

    pub fn boolean(&mut self, b: bool) -> ValueId {
        self.symbol(if b { TRUE } else { FALSE })
    }

    pub fn cons(&mut self, first: Option<ValueId>, second: Option<ValueId>) -> ValueId {
        self.alloc(Value::Pair {
            first,
            second,
            name: None,
        })
    }

    /// Build `(items... . tail)`; a `None` tail gives a proper list, no items gives `tail`
    pub fn list_from(&mut self, items: &[Option<ValueId>], tail: Option<ValueId>) -> Option<ValueId> {
        items
            .iter()
            .rev()
            .fold(tail, |acc, item| Some(self.cons(*item, acc)))
    }

    fn try_node(&self, id: NodeId) -> Option<&Node> {
        self.slots
            .get(id.index)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.node.as_ref())
    }

    fn try_node_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.slots
            .get_mut(id.index)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.node.as_mut())
    }

    fn node(&self, id: NodeId) -> &Node {
        match self.try_node(id) {
            Some(node) => node,
            None => panic!("dangling heap handle {id:?}"),
        }
    }

    fn node_mut(&mut self, id: NodeId) -> &mut Node {
        match self.try_node_mut(id) {
            Some(node) => node,
            None => panic!("dangling heap handle {id:?}"),
        }
    }

    /// # Panics
    /// If the handle was reclaimed by a sweep.
    pub fn get(&self, id: ValueId) -> &Value {
        match &self.node(id.0).kind {
            NodeKind::Value(value) => value,
            NodeKind::Env(_) => unreachable!("value handle refers to an environment"),
        }
    }

    fn get_mut(&mut self, id: ValueId) -> &mut Value {
        match &mut self.node_mut(id.0).kind {
            NodeKind::Value(value) => value,
            NodeKind::Env(_) => unreachable!("value handle refers to an environment"),
        }
    }

    /// # Panics
    /// If the handle was reclaimed by a sweep.
    pub fn env(&self, id: EnvId) -> &Environment {
        match &self.node(id.0).kind {
            NodeKind::Env(env) => env,
            NodeKind::Value(_) => unreachable!("environment handle refers to a value"),
        }
    }

    /// Callers must follow up with [`Heap::replace_edge`] for any reference they change.
    pub(crate) fn env_mut(&mut self, id: EnvId) -> &mut Environment {
        match &mut self.node_mut(id.0).kind {
            NodeKind::Env(env) => env,
            NodeKind::Value(_) => unreachable!("environment handle refers to a value"),
        }
    }

    pub fn dependencies(&self, id: impl Into<NodeId>) -> impl Iterator<Item = NodeId> + '_ {
        self.node(id.into()).dependencies.iter().copied()
    }

    pub fn upper_dependencies(&self, id: impl Into<NodeId>) -> impl Iterator<Item = NodeId> + '_ {
        self.node(id.into()).upper_dependencies.iter().copied()
    }

    pub fn has_dependency(&self, owner: impl Into<NodeId>, target: impl Into<NodeId>) -> bool {
        self.node(owner.into())
            .dependencies
            .contains(&target.into())
    }

    /// No-op for a missing target, a self edge, or an edge that already exists
    pub(crate) fn add_dependency(&mut self, owner: NodeId, target: Option<NodeId>) {
        let Some(target) = target else { return };
        if target == owner || !self.node_mut(owner).dependencies.insert(target) {
            return;
        }
        self.node_mut(target).upper_dependencies.insert(owner);
    }

    pub(crate) fn remove_dependency(&mut self, owner: NodeId, target: Option<NodeId>) {
        let Some(target) = target else { return };
        if target == owner || !self.node_mut(owner).dependencies.remove(&target) {
            return;
        }
        self.node_mut(target).upper_dependencies.remove(&owner);
    }

    /// Re-point one structural reference of `owner` from `old` to `new`.
    ///
    /// Must be called after the field itself was updated. The edge to `old` is kept when
    /// another field of `owner` still refers to it.
    pub(crate) fn replace_edge(&mut self, owner: NodeId, old: Option<NodeId>, new: Option<NodeId>) {
        if old == new {
            return;
        }
        self.add_dependency(owner, new);
        if let Some(old) = old
            && !self.node(owner).kind.refers_to(old)
        {
            self.remove_dependency(owner, Some(old));
        }
    }

    /// Replace one field of a pair, keeping dependency edges in sync.
    pub fn set_pair_field(
        &mut self,
        pair: ValueId,
        field: PairField,
        value: Option<ValueId>,
    ) -> Result<(), Error> {
        let old = match self.get_mut(pair) {
            Value::Pair {
                first,
                second,
                name,
            } => {
                let slot = match field {
                    PairField::First => first,
                    PairField::Second => second,
                    PairField::Name => name,
                };
                std::mem::replace(slot, value)
            }
            other => {
                return Err(Error::runtime(format!(
                    "expected a pair, got a {}",
                    other.type_name()
                )));
            }
        };
        self.replace_edge(pair.0, old.map(NodeId::from), value.map(NodeId::from));
        Ok(())
    }

    pub fn set_first(&mut self, pair: ValueId, value: Option<ValueId>) -> Result<(), Error> {
        self.set_pair_field(pair, PairField::First, value)
    }

    pub fn set_second(&mut self, pair: ValueId, value: Option<ValueId>) -> Result<(), Error> {
        self.set_pair_field(pair, PairField::Second, value)
    }

    /// Set the cached name (a symbol node) of a pair
    pub fn set_pair_name(&mut self, pair: ValueId, name: Option<ValueId>) -> Result<(), Error> {
        self.set_pair_field(pair, PairField::Name, name)
    }

    /// Mark everything reachable from `root`; returns the number of marked nodes
    fn mark(&mut self, root: NodeId) -> usize {
        let mut marked = 0;
        let mut worklist = vec![root];

        while let Some(id) = worklist.pop() {
            let Some(node) = self.try_node_mut(id) else {
                continue;
            };
            if node.marked {
                continue;
            }
            node.marked = true;
            marked += 1;
            worklist.extend(node.dependencies.iter().copied());
        }

        marked
    }

    /// Reclaim every node unreachable from `root`; returns the number freed.
    ///
    /// All edges touching doomed nodes are removed before any of them is freed, so
    /// doomed nodes referring to each other (or to survivors) never leave dangling
    /// entries behind.
    pub fn sweep(&mut self, root: EnvId) -> usize {
        let marked = self.mark(root.0);

        let doomed: Vec<NodeId> = self
            .slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| match &slot.node {
                Some(node) if !node.marked => Some(NodeId {
                    index,
                    generation: slot.generation,
                }),
                _ => None,
            })
            .collect();

        for &id in &doomed {
            let node = self.node(id);
            let uppers: Vec<NodeId> = node.upper_dependencies.iter().copied().collect();
            let lowers: Vec<NodeId> = node.dependencies.iter().copied().collect();
            for upper in uppers {
                self.remove_dependency(upper, Some(id));
            }
            for lower in lowers {
                self.remove_dependency(id, Some(lower));
            }
        }

        for &id in &doomed {
            self.free(id.index);
        }

        for node in self.slots.iter_mut().filter_map(|slot| slot.node.as_mut()) {
            node.marked = false;
        }

        self.stats.collections += 1;
        self.stats.total_freed += doomed.len() as u64;
        tracing::debug!(
            marked,
            freed = doomed.len(),
            live = self.live,
            "heap sweep"
        );
        doomed.len()
    }

    fn free(&mut self, index: usize) {
        let slot = &mut self.slots[index];
        if slot.node.take().is_some() {
            slot.generation = slot.generation.wrapping_add(1);
            self.free_list.push(index);
            self.live -= 1;
        }
    }

    /// Deallocate every node regardless of reachability; returns the number released
    pub fn release_all(&mut self) -> usize {
        let released = self.live;
        for index in 0..self.slots.len() {
            self.free(index);
        }
        self.stats.total_freed += released as u64;
        tracing::debug!(released, "heap teardown");
        released
    }

    /// Verify edge symmetry and that edges mirror structural references exactly.
    #[cfg(test)]
    pub(crate) fn check_consistency(&self) -> Result<(), String> {
        let mut live = 0;
        for (index, slot) in self.slots.iter().enumerate() {
            let Some(node) = &slot.node else { continue };
            live += 1;
            let id = NodeId {
                index,
                generation: slot.generation,
            };

            for dep in &node.dependencies {
                let target = self
                    .try_node(*dep)
                    .ok_or_else(|| format!("{id:?} depends on dead node {dep:?}"))?;
                if !target.upper_dependencies.contains(&id) {
                    return Err(format!("{dep:?} is missing upper edge to {id:?}"));
                }
            }
            for upper in &node.upper_dependencies {
                let owner = self
                    .try_node(*upper)
                    .ok_or_else(|| format!("{id:?} kept alive by dead node {upper:?}"))?;
                if !owner.dependencies.contains(&id) {
                    return Err(format!("{upper:?} is missing edge to {id:?}"));
                }
            }

            let structural: HashSet<NodeId> = node
                .kind
                .children()
                .into_iter()
                .filter(|child| *child != id)
                .collect();
            if structural != node.dependencies {
                return Err(format!(
                    "{id:?} edges {:?} do not mirror references {structural:?}",
                    node.dependencies
                ));
            }
        }

        if live != self.live {
            return Err(format!("live count {} but {live} occupied slots", self.live));
        }
        Ok(())
    }

    /// Nodes reachable from `root` by structural references, independent of edges.
    #[cfg(test)]
    pub(crate) fn reachable_from(&self, root: EnvId) -> HashSet<NodeId> {
        let mut seen = HashSet::new();
        let mut worklist = vec![root.0];
        while let Some(id) = worklist.pop() {
            if seen.insert(id) {
                worklist.extend(self.node(id).kind.children());
            }
        }
        seen
    }

    #[cfg(test)]
    pub(crate) fn live_nodes(&self) -> HashSet<NodeId> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.node.is_some())
            .map(|(index, slot)| NodeId {
                index,
                generation: slot.generation,
            })
            .collect()
    }
}
