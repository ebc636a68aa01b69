//! Child-list alignment: matching a freshly supplied child sequence
//! against the previously materialized child chain.
//!
//! The pass is a single forward walk over the flattened new children with a
//! cursor over the existing chain. A keyed lookup table over the
//! not-yet-consumed suffix is built lazily, at the first position where
//! cursor and item identity disagree; matched table entries are detached
//! and relinked at the cursor. Unkeyed items scan the cursor forward past
//! keyed nodes (which stay available for later keyed lookup) and consume
//! the first unkeyed one, so interleaved keyed/unkeyed reorderings resolve
//! without any quadratic re-scan.

use std::collections::{HashMap, HashSet};

use crate::element::{flatten, Child, Element, FlatChild, Key, Tag};
use crate::node::{Arena, HostProducerState, HostState, LogicState, Node, NodeFlags, NodeId, NodeKind, SettleState};
use crate::renderer::{unmount, Core};
use crate::schedule;
use crate::host::HostSpec;

/// Whether an update completed synchronously or left deferred work behind.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum Settle {
    /// Everything settled; the subtree is ready to commit.
    Ready,
    /// At least one deferred completion is outstanding.
    Pending,
}

/// Update `parent`'s child chain to match `children`.
///
/// Returns [`Settle::Pending`] when any child left a deferred completion
/// behind; `parent.settling` then tracks the outstanding count and the
/// commit runs once the last child settles.
pub(crate) fn reconcile_children<H: HostSpec>(
    core: &mut Core<H>,
    parent: NodeId,
    children: &[Child<H>],
) -> Settle {
    let entry_epoch = {
        let node = core.arena.node_mut(parent);
        node.epoch += 1;
        // A newer update supersedes any still-settling older one; stale
        // completions fall through to the superseding pass's counter only
        // if this pass re-awaits the same child.
        node.settling = None;
        node.flags |= NodeFlags::RECONCILING;
        node.epoch
    };
    let head = core.arena.node(parent).head;
    let old = core.arena.chain(head);
    for &id in &old {
        core.arena.node_mut(id).flags -= NodeFlags::AWAITED;
    }

    let mut flat = Vec::new();
    flatten(children, &mut flat);

    let mut oi = 0usize;
    let mut by_key: Option<HashMap<Key, NodeId>> = None;
    let mut seen_keys: HashSet<Key> = HashSet::new();
    let mut visited: HashSet<NodeId> = HashSet::new();
    let mut new_chain: Vec<NodeId> = Vec::new();
    let mut pending: Vec<NodeId> = Vec::new();
    let mut changed = false;

    for item in &flat {
        let mut key = match item {
            FlatChild::Element(el) => el.key.clone(),
            _ => None,
        };
        // A duplicate key within one update degrades to unkeyed for the
        // later occurrence.
        if let Some(k) = &key {
            if seen_keys.contains(k) {
                key = None;
            }
        }

        let (matched, from_table) = align(&core.arena, &old, &mut oi, &mut by_key, &key);
        if let Some(k) = key {
            seen_keys.insert(k);
        }
        if from_table {
            if let Some(id) = matched {
                core.arena.node_mut(id).flags |= NodeFlags::MOVED;
                changed = true;
            }
        }

        let (slot, settle) = diff_item(core, parent, matched, item, &mut visited, &mut changed);
        if let Some(id) = slot {
            new_chain.push(id);
            if settle == Settle::Pending {
                pending.push(id);
            }
        }
    }

    // An error routed to this node while the pass above was mounting its
    // children re-renders it re-entrantly; the inner pass bumped the epoch
    // and linked its own chain, so this one is stale. Dispose of whatever
    // it created that the newer chain does not own, and stand down.
    if core.arena.node(parent).epoch != entry_epoch {
        let current: HashSet<NodeId> = core
            .arena
            .chain(core.arena.node(parent).head)
            .into_iter()
            .collect();
        for &id in &new_chain {
            if !current.contains(&id) {
                unmount(core, id, true);
            }
        }
        core.arena.node_mut(parent).flags -= NodeFlags::RECONCILING;
        return Settle::Ready;
    }

    // Trailing cleanup: everything unvisited (including unconsumed keyed
    // table entries) unmounts.
    if new_chain != old {
        changed = true;
    }
    for &old_id in &old {
        if !visited.contains(&old_id) {
            changed = true;
            unmount(core, old_id, true);
        }
    }

    relink(&mut core.arena, parent, &new_chain);
    for &id in &new_chain {
        if core
            .arena
            .node(id)
            .flags
            .intersects(NodeFlags::NEEDS_COMMIT | NodeFlags::DIRTY | NodeFlags::MOVED)
        {
            changed = true;
            break;
        }
    }
    {
        let node = core.arena.node_mut(parent);
        if changed {
            node.flags |= NodeFlags::NEEDS_COMMIT;
        }
        node.flags -= NodeFlags::RECONCILING;
    }

    if pending.is_empty() {
        Settle::Ready
    } else {
        for &id in &pending {
            core.arena.node_mut(id).flags |= NodeFlags::AWAITED;
        }
        core.arena.node_mut(parent).settling = Some(SettleState {
            remaining: pending.len(),
        });
        Settle::Pending
    }
}

/// Pick the existing node (if any) the current item aligns with.
///
/// Returns the candidate and whether it came out of the keyed table (in
/// which case it changed sibling position).
fn align<H: HostSpec>(
    arena: &Arena<H>,
    old: &[NodeId],
    oi: &mut usize,
    by_key: &mut Option<HashMap<Key, NodeId>>,
    key: &Option<Key>,
) -> (Option<NodeId>, bool) {
    if let Some(k) = key {
        if *oi < old.len() {
            let cursor = old[*oi];
            if arena.node(cursor).key.as_ref() == Some(k) {
                *oi += 1;
                // The cursor node may also sit in an already-built table.
                if let Some(table) = by_key {
                    table.remove(k);
                }
                return (Some(cursor), false);
            }
        }
        let table =
            by_key.get_or_insert_with(|| build_key_table(arena, &old[(*oi).min(old.len())..]));
        return (table.remove(k), true);
    }

    // Unkeyed: scan past keyed existing nodes, preserving them for keyed
    // lookup, and consume the first unkeyed one. The table must exist
    // before the scan passes them, or a later lookup would miss them.
    while *oi < old.len() && arena.node(old[*oi]).key.is_some() {
        if by_key.is_none() {
            *by_key = Some(build_key_table(arena, &old[*oi..]));
        }
        *oi += 1;
    }
    if *oi < old.len() {
        let cursor = old[*oi];
        *oi += 1;
        (Some(cursor), false)
    } else {
        (None, false)
    }
}

fn build_key_table<H: HostSpec>(arena: &Arena<H>, rest: &[NodeId]) -> HashMap<Key, NodeId> {
    let mut table = HashMap::new();
    for &id in rest {
        if let Some(key) = &arena.node(id).key {
            table.entry(key.clone()).or_insert(id);
        }
    }
    table
}

/// Diff one aligned (existing, new) pair, producing the node for this
/// position (if any) and whether its update settled.
fn diff_item<H: HostSpec>(
    core: &mut Core<H>,
    parent: NodeId,
    matched: Option<NodeId>,
    item: &FlatChild<'_, H>,
    visited: &mut HashSet<NodeId>,
    changed: &mut bool,
) -> (Option<NodeId>, Settle) {
    match item {
        FlatChild::Absent => {
            if let Some(old_id) = matched {
                visited.insert(old_id);
                unmount(core, old_id, true);
                *changed = true;
            }
            (None, Settle::Ready)
        }
        FlatChild::Text(text) => {
            let transformed = core.host.transform_text(text.as_ref());
            if let Some(old_id) = matched {
                visited.insert(old_id);
                if let NodeKind::Leaf { .. } = core.arena.node(old_id).kind {
                    let node = core.arena.node_mut(old_id);
                    if let NodeKind::Leaf { text: slot } = &mut node.kind {
                        if slot.as_deref() != Some(&*transformed) {
                            *slot = Some(transformed);
                            node.flags |= NodeFlags::DIRTY;
                            *changed = true;
                        }
                    }
                    return (Some(old_id), Settle::Ready);
                }
                unmount(core, old_id, true);
            }
            let mut node = Node::new(
                Tag::Group,
                None,
                NodeKind::Leaf {
                    text: Some(transformed),
                },
            );
            node.parent = Some(parent);
            let id = core.arena.insert(node);
            *changed = true;
            (Some(id), Settle::Ready)
        }
        FlatChild::Element(el) => diff_element(core, parent, matched, el, visited, changed),
    }
}

fn diff_element<H: HostSpec>(
    core: &mut Core<H>,
    parent: NodeId,
    matched: Option<NodeId>,
    el: &Element<H>,
    visited: &mut HashSet<NodeId>,
    changed: &mut bool,
) -> (Option<NodeId>, Settle) {
    // The reuse-unchanged sentinel keeps whatever sits at this identity,
    // skipping its subtree; with nothing to copy it renders nothing.
    if let Tag::Copy = el.tag {
        return match matched {
            Some(old_id) => {
                visited.insert(old_id);
                core.arena.node_mut(old_id).flags |= NodeFlags::COPIED;
                (Some(old_id), Settle::Ready)
            }
            None => (None, Settle::Ready),
        };
    }

    if let Some(old_id) = matched {
        let node = core.arena.node(old_id);
        // A text leaf never structurally matches an element, whatever tag
        // it was stored under.
        if node.is_grouping() && node.tag.matches(&el.tag) {
            visited.insert(old_id);
            let settle = update_node(core, old_id, el);
            return (Some(old_id), settle);
        }
    }

    let (new_id, settle) = mount_node(core, parent, el);
    *changed = true;
    if let Some(old_id) = matched {
        visited.insert(old_id);
        match settle {
            // Synchronous settle: the old node can go right away.
            Settle::Ready => unmount(core, old_id, true),
            // Replacement with overlap: keep the old node alive behind the
            // new one until the new one's first settle lands.
            Settle::Pending => {
                core.arena.node_mut(new_id).alternate = Some(old_id);
            }
        }
    }
    (Some(new_id), settle)
}

/// Update a structurally matching node in place.
pub(crate) fn update_node<H: HostSpec>(
    core: &mut Core<H>,
    id: NodeId,
    el: &Element<H>,
) -> Settle {
    {
        let node = core.arena.node_mut(id);
        if el.ref_hook.is_some() {
            node.ref_hook = el.ref_hook.clone();
        }
    }
    let is_logic = matches!(core.arena.node(id).kind, NodeKind::Logic(_));
    if is_logic {
        let node = core.arena.node_mut(id);
        node.props = el.props.clone();
        return schedule::update(core, id);
    }

    {
        let node = core.arena.node_mut(id);
        if node.props != el.props {
            node.props = el.props.clone();
            node.flags |= NodeFlags::NEEDS_COMMIT;
        }
        if el.target.is_some() {
            node.target = el.target.clone();
        }
    }
    let children = el.children.clone();
    reconcile_children(core, id, &children)
}

/// Construct a node for a description with no reusable existing node, and
/// begin its first update.
pub(crate) fn mount_node<H: HostSpec>(
    core: &mut Core<H>,
    parent: NodeId,
    el: &Element<H>,
) -> (NodeId, Settle) {
    let kind = match &el.tag {
        Tag::Host(_) => NodeKind::Host(HostState {
            producer: HostProducerState::Unresolved,
            own: None,
            child_values: Vec::new(),
        }),
        Tag::Group => NodeKind::Group,
        Tag::Detached => NodeKind::Detached,
        Tag::Logic(spawn) => {
            let procedure = spawn.instantiate();
            let kind = procedure.kind();
            NodeKind::Logic(LogicState {
                procedure: Some(procedure),
                kind,
                provisions: HashMap::new(),
                inflight: false,
                enqueued: false,
                next_waiters: Vec::new(),
            })
        }
        Tag::Copy => unreachable!("copy elements never mount"),
    };
    let mut node = Node::new(el.tag.clone(), el.key.clone(), kind);
    node.parent = Some(parent);
    node.props = el.props.clone();
    node.target = el.target.clone();
    node.ref_hook = el.ref_hook.clone();
    let id = core.arena.insert(node);

    let settle = if matches!(core.arena.node(id).kind, NodeKind::Logic(_)) {
        schedule::update(core, id)
    } else {
        let children = el.children.clone();
        reconcile_children(core, id, &children)
    };
    (id, settle)
}

fn relink<H: HostSpec>(arena: &mut Arena<H>, parent: NodeId, chain: &[NodeId]) {
    let mut prev: Option<NodeId> = None;
    for &id in chain {
        let node = arena.node_mut(id);
        node.parent = Some(parent);
        node.next = None;
        if let Some(p) = prev {
            arena.node_mut(p).next = Some(id);
        }
        prev = Some(id);
    }
    arena.node_mut(parent).head = chain.first().copied();
}
