//! The persistent node tree and its arena.
//!
//! One [`Node`] exists per rendered tree position. Nodes reference each
//! other exclusively through [`NodeId`] handles into a slab-backed arena;
//! the sibling "linked list" is an id chain (`next`), the child list hangs
//! off `head`, and the short-lived replacement chain hangs off
//! `alternate`. Handles are generational so a stale id held by a pending
//! continuation can never alias a recycled slot.

use std::any::Any;
use std::collections::HashMap;
use std::rc::Rc;

use bitflags::bitflags;
use slab::Slab;

use crate::deferred::Resolver;
use crate::element::{Key, Props, RefHook, Tag};
use crate::host::{DirtySpan, HostProducer, HostSpec, HostStep, TreeValues, ValueItem};
use crate::routine::{Procedure, ProcedureKind};

bitflags! {
    /// Per-node bookkeeping bits.
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub(crate) struct NodeFlags: u16 {
        /// Value changed since the parent last folded this node.
        const DIRTY = 1 << 0;
        /// Keyed node changed sibling position this update.
        const MOVED = 1 << 1;
        /// Update explicitly requested reuse-unchanged.
        const COPIED = 1 << 2;
        /// Node has been unmounted; set exactly once.
        const UNMOUNTED = 1 << 3;
        /// Resumable machine reported completion; never steps again.
        const FINISHED = 1 << 4;
        /// The procedure's current resumption is outstanding; the node
        /// must not commit or be resumed again until it lands.
        const STEPPING = 1 << 5;
        /// Externally-driven update in progress this round.
        const EXTERNAL_UPDATE = 1 << 6;
        /// New props stored and not yet consumed by the procedure.
        const PROPS_AVAILABLE = 1 << 7;
        /// Props consumed during the current resumption.
        const PROPS_TAKEN = 1 << 8;
        /// Async machine parked waiting for new props.
        const WAITING_PROPS = 1 << 9;
        /// Node has committed at least once.
        const SETTLED = 1 << 10;
        /// Node must recompute its aggregate on the next commit pass.
        const NEEDS_COMMIT = 1 << 11;
        /// Parent's current settling pass is counting this node.
        const AWAITED = 1 << 12;
        /// A commit frame for this node is on the stack; error routing can
        /// re-render a subtree mid-commit, and the re-render must not start
        /// a second frame for the same node.
        const COMMITTING = 1 << 13;
        /// A children pass for this node is on the stack; the node must
        /// not commit until the pass has linked the new chain.
        const RECONCILING = 1 << 14;
    }
}

/// A generational handle to a node in the arena.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct NodeId {
    index: u32,
    generation: u32,
}

/// Children of this node still pending for one update pass.
///
/// Replaced wholesale when a newer update supersedes the pass; a stale
/// child completion is filtered out by its cleared `AWAITED` flag.
pub(crate) struct SettleState {
    /// Pending children not yet settled.
    pub remaining: usize,
}

/// Host-node producer state, fixed after the first invocation.
pub(crate) enum HostProducerState<H: HostSpec> {
    /// Producer not fetched from the host yet (first commit pending).
    Unresolved,
    /// One-shot callback, invoked per commit.
    Callback(HostProducer<H>),
    /// Resumable step source, pulled per commit.
    Step(Box<dyn HostStep<H>>),
}

/// Host-node specifics.
pub(crate) struct HostState<H: HostSpec> {
    pub producer: HostProducerState<H>,
    /// The value this node itself resolved to at the last commit.
    pub own: Option<H::Value>,
    /// Aggregated child values handed to the producer.
    pub child_values: TreeValues<H::Value>,
}

/// Logic-node specifics: the procedure plus its scheduling state.
pub(crate) struct LogicState<H: HostSpec> {
    /// `None` only while the procedure is taken out for a call.
    pub procedure: Option<Procedure<H>>,
    pub kind: ProcedureKind,
    /// Ancestor-scoped key/value bindings set by this node.
    pub provisions: HashMap<Rc<str>, Rc<dyn Any>>,
    /// A step has started and its result has not committed yet. Distinct
    /// from [`NodeFlags::STEPPING`], which covers only the window where
    /// the procedure's own resumption is outstanding.
    pub inflight: bool,
    /// At most one coalesced step is queued behind the in-flight one.
    pub enqueued: bool,
    /// Callers waiting on the coalesced next step rather than the
    /// in-flight one.
    pub next_waiters: Vec<Resolver<TreeValues<H::Value>>>,
}

/// Per-kind node payload.
pub(crate) enum NodeKind<H: HostSpec> {
    /// Resolved text or nothing; never has children; always settled.
    Leaf { text: Option<Rc<str>> },
    /// Transparent container.
    Group,
    /// Pass-through boundary contributing no value to its parent.
    Detached,
    /// Externally-defined renderable tag.
    Host(HostState<H>),
    /// Stateful logic procedure.
    Logic(LogicState<H>),
}

/// One position in the persistent tree.
pub(crate) struct Node<H: HostSpec> {
    pub tag: Tag<H>,
    pub key: Option<Key>,
    pub props: Props,
    pub flags: NodeFlags,
    pub parent: Option<NodeId>,
    /// Next sibling; the chain is owned by the parent's child list.
    pub next: Option<NodeId>,
    /// First child.
    pub head: Option<NodeId>,
    /// During an in-flight replacement, the old node this one supersedes.
    pub alternate: Option<NodeId>,
    /// Bumped at the start of every children update of this node.
    pub epoch: u64,
    /// Bumped per logic/unmount step; stale deferred continuations are
    /// discarded by comparing against it.
    pub step_seq: u64,
    /// This node's committed value sequence. For most kinds this is also
    /// its contribution to the parent; a Detached node stores its
    /// arranged aggregate here but contributes nothing.
    pub value: TreeValues<H::Value>,
    /// Changed interval of `value` since the parent last consumed it.
    pub span: Option<DirtySpan>,
    /// Target a Detached node arranges into.
    pub target: Option<H::Target>,
    pub ref_hook: Option<RefHook<H>>,
    /// In-progress children settling pass, if any.
    pub settling: Option<SettleState>,
    /// Outstanding handles resolved with this node's value sequence at its
    /// next commit (rejected on unmount).
    pub waiters: Vec<Resolver<TreeValues<H::Value>>>,
    pub kind: NodeKind<H>,
}

impl<H: HostSpec> Node<H> {
    /// A freshly constructed node. New nodes start dirty and moved so the
    /// first commit always reports a value.
    pub fn new(tag: Tag<H>, key: Option<Key>, kind: NodeKind<H>) -> Self {
        Node {
            tag,
            key,
            props: Props::new(),
            flags: NodeFlags::DIRTY | NodeFlags::MOVED | NodeFlags::NEEDS_COMMIT,
            parent: None,
            next: None,
            head: None,
            alternate: None,
            epoch: 0,
            step_seq: 0,
            value: Vec::new(),
            span: None,
            target: None,
            ref_hook: None,
            settling: None,
            waiters: Vec::new(),
            kind,
        }
    }

    /// Whether this node recurses into the reconciler (versus resolving
    /// directly to a value).
    pub fn is_grouping(&self) -> bool {
        !matches!(self.kind, NodeKind::Leaf { .. })
    }

    pub fn logic(&self) -> Option<&LogicState<H>> {
        match &self.kind {
            NodeKind::Logic(state) => Some(state),
            _ => None,
        }
    }

    pub fn logic_mut(&mut self) -> Option<&mut LogicState<H>> {
        match &mut self.kind {
            NodeKind::Logic(state) => Some(state),
            _ => None,
        }
    }

    /// The contribution this node makes to its parent's flattened value
    /// sequence.
    pub fn contribution(&self) -> TreeValues<H::Value> {
        match &self.kind {
            NodeKind::Detached => Vec::new(),
            NodeKind::Leaf { text } => match text {
                Some(text) => vec![ValueItem::Text(text.clone())],
                None => Vec::new(),
            },
            _ => self.value.clone(),
        }
    }
}

struct Slot<H: HostSpec> {
    generation: u32,
    node: Node<H>,
}

/// Slab-backed node storage with generational handles.
pub(crate) struct Arena<H: HostSpec> {
    slots: Slab<Slot<H>>,
    next_generation: u32,
}

impl<H: HostSpec> Arena<H> {
    pub fn new() -> Self {
        Arena {
            slots: Slab::new(),
            next_generation: 1,
        }
    }

    pub fn insert(&mut self, node: Node<H>) -> NodeId {
        let generation = self.next_generation;
        self.next_generation = self.next_generation.wrapping_add(1);
        let index = self.slots.insert(Slot { generation, node }) as u32;
        NodeId { index, generation }
    }

    pub fn get(&self, id: NodeId) -> Option<&Node<H>> {
        self.slots
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .map(|slot| &slot.node)
    }

    pub fn get_mut(&mut self, id: NodeId) -> Option<&mut Node<H>> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .map(|slot| &mut slot.node)
    }

    /// Panicking accessor for handles the engine knows are live. A failure
    /// here is a broken internal invariant, not a recoverable condition.
    pub fn node(&self, id: NodeId) -> &Node<H> {
        self.get(id).expect("node handle outlived its slot")
    }

    /// See [`Arena::node`].
    pub fn node_mut(&mut self, id: NodeId) -> &mut Node<H> {
        self.get_mut(id).expect("node handle outlived its slot")
    }

    pub fn remove(&mut self, id: NodeId) -> Option<Node<H>> {
        let live = self
            .slots
            .get(id.index as usize)
            .is_some_and(|slot| slot.generation == id.generation);
        if live {
            Some(self.slots.remove(id.index as usize).node)
        } else {
            None
        }
    }

    /// Collect a sibling chain into a vector of handles.
    pub fn chain(&self, head: Option<NodeId>) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut cursor = head;
        while let Some(id) = cursor {
            out.push(id);
            cursor = self.node(id).next;
        }
        out
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.slots.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::element::Tag;
    use crate::host::HostYield;

    struct NullHost;

    impl HostSpec for NullHost {
        type Tag = &'static str;
        type Value = String;
        type Target = &'static str;

        fn producer(&mut self, _tag: &&'static str) -> HostProducer<Self> {
            Box::new(|_invoke| Ok(HostYield::Value(String::new())))
        }

        fn arrange(
            &mut self,
            _target: &&'static str,
            _values: &[ValueItem<String>],
            _span: Option<DirtySpan>,
        ) {
        }
    }

    #[test]
    fn stale_handles_do_not_alias_recycled_slots() {
        let mut arena: Arena<NullHost> = Arena::new();
        let a = arena.insert(Node::new(Tag::Group, None, NodeKind::Group));
        assert!(arena.get(a).is_some());
        arena.remove(a);
        let b = arena.insert(Node::new(Tag::Group, None, NodeKind::Group));
        // The slab reuses the slot, but the old handle stays dead.
        assert!(arena.get(a).is_none());
        assert!(arena.get(b).is_some());
        assert_eq!(arena.len(), 1);
    }

    #[test]
    fn chain_follows_next_links() {
        let mut arena: Arena<NullHost> = Arena::new();
        let a = arena.insert(Node::new(Tag::Group, None, NodeKind::Group));
        let b = arena.insert(Node::new(Tag::Group, None, NodeKind::Group));
        let c = arena.insert(Node::new(Tag::Group, None, NodeKind::Group));
        arena.node_mut(a).next = Some(b);
        arena.node_mut(b).next = Some(c);
        assert_eq!(arena.chain(Some(a)), vec![a, b, c]);
        assert!(arena.chain(None).is_empty());
    }
}
