//! Bottom-up commit: folding child values into parents, producing host
//! values, and tracking minimal dirty ranges.
//!
//! A commit pass runs once a node's children have all settled. Children
//! that still need their own commit are committed first; clean (or
//! explicitly copied) children contribute their cached value, which is what
//! keeps a single-child refresh from re-invoking every sibling's host
//! callback on the way back up.

use std::rc::Rc;

use crate::element::Tag;
use crate::host::{DirtySpan, HostInvoke, HostSpec, HostYield, TreeValues, ValueItem};
use crate::node::{HostProducerState, NodeFlags, NodeId, NodeKind};
use crate::renderer::{unmount, Core, Wake};
use crate::routine::ProcedureKind;
use crate::schedule;

enum CommitKind {
    Leaf,
    Spliced,
    Detached,
    Host,
}

/// Commit one node: aggregate its children, refresh its own value, and
/// settle anything waiting on it.
///
/// Safe to call on nodes that do not currently need work; it returns
/// without touching the host. A node whose commit frame is already on the
/// stack (an error-routing re-render can land here) is skipped; the outer
/// frame picks up the re-rendered children when it resumes.
pub(crate) fn commit_node<H: HostSpec>(core: &mut Core<H>, id: NodeId) {
    let Some(node) = core.arena.get_mut(id) else {
        return;
    };
    if node.flags.intersects(
        NodeFlags::UNMOUNTED
            | NodeFlags::STEPPING
            | NodeFlags::COMMITTING
            | NodeFlags::RECONCILING,
    ) || node.settling.is_some()
    {
        return;
    }
    node.flags |= NodeFlags::COMMITTING;
    do_commit(core, id);
    if let Some(node) = core.arena.get_mut(id) {
        node.flags -= NodeFlags::COMMITTING;
    }
}

fn do_commit<H: HostSpec>(core: &mut Core<H>, id: NodeId) {
    let node = core.arena.node(id);
    let first_settle = !node.flags.contains(NodeFlags::SETTLED);
    let needs = node.flags.contains(NodeFlags::NEEDS_COMMIT) || first_settle;
    // Error routing can re-render a subtree while an outer commit frame is
    // still walking it; a bumped epoch tells that stale frame to abandon
    // its result instead of overwriting the newer one.
    let entry_epoch = node.epoch;
    let kind = match &node.kind {
        NodeKind::Leaf { .. } => CommitKind::Leaf,
        NodeKind::Group | NodeKind::Logic(_) => CommitKind::Spliced,
        NodeKind::Detached => CommitKind::Detached,
        NodeKind::Host(_) => CommitKind::Host,
    };

    if needs {
        match kind {
            CommitKind::Leaf => {}
            CommitKind::Spliced => {
                let (values, span) = aggregate(core, id);
                let Some(node) = core.arena.get_mut(id) else {
                    return;
                };
                if node.epoch != entry_epoch {
                    return;
                }
                if values != node.value {
                    node.flags |= NodeFlags::DIRTY;
                    let end = values.len().max(node.value.len());
                    let fresh = span.unwrap_or(DirtySpan { start: 0, end });
                    node.span = Some(DirtySpan::union(node.span, fresh));
                    node.value = values;
                }
            }
            CommitKind::Detached => {
                let (values, span) = aggregate(core, id);
                let Some(node) = core.arena.get_mut(id) else {
                    return;
                };
                if node.epoch != entry_epoch {
                    return;
                }
                let changed = values != node.value;
                node.value = values;
                let target = node.target.clone();
                if changed || first_settle {
                    if let Some(target) = target {
                        let node = core.arena.node(id);
                        core.host.arrange(&target, &node.value, span);
                    }
                }
                // The detached boundary consumes its own dirtiness; it
                // contributes nothing upward.
                let node = core.arena.node_mut(id);
                node.flags -= NodeFlags::DIRTY;
                node.span = None;
            }
            CommitKind::Host => {
                let (values, span) = aggregate(core, id);
                let stale = core
                    .arena
                    .get(id)
                    .map_or(true, |n| n.epoch != entry_epoch || n.flags.contains(NodeFlags::UNMOUNTED));
                if stale {
                    return;
                }
                if let Err(err) = produce_host_value(core, id, values, span) {
                    // Routed; this commit is abandoned. The accepting
                    // ancestor re-renders and re-commits as needed.
                    schedule::route_error(core, id, std::sync::Arc::new(err));
                    return;
                }
            }
        }
        let Some(node) = core.arena.get_mut(id) else {
            return;
        };
        node.flags -= NodeFlags::NEEDS_COMMIT;
    }

    // Committing is what completes a logic node's in-flight step.
    let Some(node) = core.arena.get_mut(id) else {
        return;
    };
    let seq = node.step_seq;
    if let Some(logic) = node.logic_mut() {
        if logic.inflight {
            logic.inflight = false;
            core.driver.push(Wake::Advance { node: id, seq });
        }
    }

    let node = core.arena.node_mut(id);
    node.flags |= NodeFlags::SETTLED;

    if first_settle {
        // The node is now the committed representative of its position;
        // the nodes it superseded unwind in order.
        if let Some(alt) = core.arena.node_mut(id).alternate.take() {
            unmount(core, alt, true);
        }
        let node = core.arena.node(id);
        if let Some(hook) = node.ref_hook.clone() {
            let values = node.contribution();
            hook(&values);
        }
    }

    let Some(node) = core.arena.get_mut(id) else {
        return;
    };
    if !node.waiters.is_empty() {
        let waiters = std::mem::take(&mut node.waiters);
        let values = node.value.clone();
        for waiter in waiters {
            core.settle_later(waiter, Ok(values.clone()));
        }
    }
}

/// Fold the child chain into a flattened value sequence, merging adjacent
/// text runs and unioning dirty sub-ranges, then clear the children's
/// transient flags.
fn aggregate<H: HostSpec>(
    core: &mut Core<H>,
    id: NodeId,
) -> (TreeValues<H::Value>, Option<DirtySpan>) {
    let kids = core.arena.chain(core.arena.node(id).head);
    let mut out: TreeValues<H::Value> = Vec::new();
    let mut span: Option<DirtySpan> = None;

    for child in kids {
        let Some(cn) = core.arena.get(child) else {
            continue;
        };
        let pending = cn.flags.contains(NodeFlags::STEPPING) || cn.settling.is_some();
        let copied = cn.flags.contains(NodeFlags::COPIED);
        if !pending && !copied && cn.flags.contains(NodeFlags::NEEDS_COMMIT) {
            commit_node(core, child);
        }
        let Some(cn) = core.arena.get(child) else {
            continue;
        };
        if cn.flags.contains(NodeFlags::UNMOUNTED) {
            continue;
        }

        let dirty = cn.flags.intersects(NodeFlags::DIRTY | NodeFlags::MOVED);
        let child_span = cn.span;
        let contribution = live_contribution(core, child);

        let start = out.len();
        let mut merged_at_boundary = false;
        for (i, item) in contribution.into_iter().enumerate() {
            let merges = matches!(&item, ValueItem::Text(_))
                && matches!(out.last(), Some(ValueItem::Text(_)));
            if merges {
                let text = match &item {
                    ValueItem::Text(text) => text.clone(),
                    ValueItem::Node(_) => unreachable!(),
                };
                if let Some(ValueItem::Text(run)) = out.last_mut() {
                    let combined = format!("{}{}", run, text);
                    *run = Rc::from(combined.as_str());
                }
                if i == 0 {
                    merged_at_boundary = true;
                }
            } else {
                out.push(item);
            }
        }
        let end = out.len();

        if dirty {
            // Exact sub-range when the child reported one and no boundary
            // merge shifted its indices; otherwise conservatively from the
            // nearest preceding non-text value to the end of the
            // contribution.
            let exact = child_span
                .filter(|_| !merged_at_boundary)
                .filter(|s| start + s.end <= end);
            let contribution_span = match exact {
                Some(s) => DirtySpan {
                    start: start + s.start,
                    end: start + s.end,
                },
                None => DirtySpan {
                    start: nearest_non_text(&out, start),
                    end,
                },
            };
            span = Some(DirtySpan::union(span, contribution_span));
        }

        let cn = core.arena.node_mut(child);
        cn.flags -= NodeFlags::DIRTY | NodeFlags::MOVED | NodeFlags::COPIED;
        cn.span = None;
    }

    (out, span)
}

/// The value sequence a child contributes right now: its own if it has
/// ever settled, otherwise the newest settled node in its alternate chain
/// (the mechanism that keeps a replaced node's value visible until the
/// replacement lands).
fn live_contribution<H: HostSpec>(core: &Core<H>, mut id: NodeId) -> TreeValues<H::Value> {
    loop {
        let Some(node) = core.arena.get(id) else {
            return Vec::new();
        };
        if node.flags.contains(NodeFlags::SETTLED) {
            return node.contribution();
        }
        match node.alternate {
            Some(alt) => id = alt,
            None => return Vec::new(),
        }
    }
}

/// Index of the nearest non-text value at or before `at`, or 0.
fn nearest_non_text<V>(values: &[ValueItem<V>], at: usize) -> usize {
    let mut i = at.min(values.len());
    while i > 0 {
        if matches!(values.get(i - 1), Some(ValueItem::Node(_))) {
            return i - 1;
        }
        i -= 1;
    }
    0
}

/// Invoke (or pull) the host producer for a host node and fold the result
/// into the node's own value and dirty flag.
fn produce_host_value<H: HostSpec>(
    core: &mut Core<H>,
    id: NodeId,
    values: TreeValues<H::Value>,
    span: Option<DirtySpan>,
) -> Result<(), anyhow::Error> {
    if core.arena.get(id).is_none() {
        return Ok(());
    }
    let tag = match &core.arena.node(id).tag {
        Tag::Host(tag) => tag.clone(),
        _ => unreachable!("host commit on a non-host node"),
    };

    // First commit fetches the producer from the host.
    let unresolved = {
        let NodeKind::Host(state) = &core.arena.node(id).kind else {
            unreachable!("host commit on a non-host node");
        };
        matches!(state.producer, HostProducerState::Unresolved)
    };
    if unresolved {
        let producer = core.host.producer(&tag);
        if let NodeKind::Host(state) = &mut core.arena.node_mut(id).kind {
            state.producer = HostProducerState::Callback(producer);
        }
    }

    let mut producer = {
        let NodeKind::Host(state) = &mut core.arena.node_mut(id).kind else {
            unreachable!("host commit on a non-host node");
        };
        state.child_values = values;
        std::mem::replace(&mut state.producer, HostProducerState::Unresolved)
    };

    let result = {
        let node = core.arena.node(id);
        let NodeKind::Host(state) = &node.kind else {
            unreachable!("host commit on a non-host node");
        };
        let invoke = HostInvoke {
            tag: &tag,
            props: &node.props,
            children: &state.child_values,
            span,
        };
        match &mut producer {
            HostProducerState::Callback(callback) => match callback(invoke) {
                Ok(HostYield::Value(value)) => Ok(value),
                Ok(HostYield::Step(mut step)) => {
                    // The first call constructed a resumable step; pull its
                    // first value now and switch the node over for good.
                    let invoke = HostInvoke {
                        tag: &tag,
                        props: &node.props,
                        children: &state.child_values,
                        span,
                    };
                    let pulled = step.pull(invoke);
                    producer = HostProducerState::Step(step);
                    pulled
                }
                Err(err) => Err(err),
            },
            HostProducerState::Step(step) => step.pull(invoke),
            HostProducerState::Unresolved => unreachable!("producer resolved above"),
        }
    };

    if let NodeKind::Host(state) = &mut core.arena.node_mut(id).kind {
        state.producer = producer;
    }

    let value = result?;
    let node = core.arena.node_mut(id);
    let NodeKind::Host(state) = &mut node.kind else {
        unreachable!("host commit on a non-host node");
    };
    let changed = state.own.as_ref() != Some(&value);
    state.own = Some(value.clone());
    if changed {
        node.flags |= NodeFlags::DIRTY;
        node.span = Some(DirtySpan { start: 0, end: 1 });
    }
    node.value = vec![ValueItem::Node(value.clone())];

    // Tell the event sink what now lives under this host value.
    let NodeKind::Host(state) = &core.arena.node(id).kind else {
        unreachable!("host commit on a non-host node");
    };
    core.router.retarget(&value, &state.child_values);
    Ok(())
}

/// Propagate a completed commit of `id` upward: settle the parent's join
/// if this node was being awaited, otherwise re-commit ancestors so the
/// refreshed value shows at the root.
pub(crate) fn after_commit<H: HostSpec>(core: &mut Core<H>, id: NodeId) {
    let Some(node) = core.arena.get(id) else {
        return;
    };
    let was_awaited = node.flags.contains(NodeFlags::AWAITED);
    // A scheduler with a coalesced follow-up queued (or a self-driving
    // machine about to consume fresh props) has not produced the result
    // its parent is waiting on yet; keep the join open.
    let continuing = node.logic().is_some_and(|l| {
        l.enqueued
            || (l.kind == ProcedureKind::ResumableDeferred
                && !node.flags.contains(NodeFlags::FINISHED)
                && node.flags.contains(NodeFlags::PROPS_AVAILABLE))
    });
    let Some(parent) = node.parent else {
        return;
    };

    if was_awaited && !continuing {
        core.arena.node_mut(id).flags -= NodeFlags::AWAITED;
        let parent_done = {
            let Some(p) = core.arena.get_mut(parent) else {
                return;
            };
            match &mut p.settling {
                Some(settling) => {
                    settling.remaining = settling.remaining.saturating_sub(1);
                    if settling.remaining == 0 {
                        p.settling = None;
                        true
                    } else {
                        false
                    }
                }
                // The pass this node was counted under has been superseded
                // or already completed; show the value regardless.
                None => true,
            }
        };
        if parent_done {
            commit_node(core, parent);
            after_commit(core, parent);
        }
        return;
    }

    bubble(core, parent);
}

/// Re-commit `id` and every ancestor above it, so a value refreshed deep
/// in the tree shows at the root. Nodes still mid-settle are skipped by
/// the guard in [`commit_node`]. Clean siblings along the way contribute
/// their cached values; ancestors whose aggregate comes out unchanged do
/// not re-arrange.
pub(crate) fn bubble<H: HostSpec>(core: &mut Core<H>, mut id: NodeId) {
    loop {
        let Some(node) = core.arena.get_mut(id) else {
            return;
        };
        node.flags |= NodeFlags::NEEDS_COMMIT;
        commit_node(core, id);
        match core.arena.get(id).and_then(|n| n.parent) {
            Some(parent) => id = parent,
            None => return,
        }
    }
}
