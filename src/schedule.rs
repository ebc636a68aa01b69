//! The logic-node scheduler: one-step-at-a-time update cycles with
//! in-flight/enqueued coalescing, plus the context handed to procedures
//! and error routing.
//!
//! Overlapping requests on one node collapse: while a step is in flight,
//! at most one more step is queued behind it, and every further request
//! shares that queued step's result. A resumable-deferred node never
//! starts a second resumption while one is outstanding; instead it
//! self-drives after each commit for as long as fresh props keep arriving,
//! parking on the props-wait signal otherwise.

use std::rc::Rc;
use std::sync::Arc;

use crate::commit::{after_commit, commit_node};
use crate::deferred::Deferred;
use crate::element::{Child, Props};
use crate::error::TreeError;
use crate::host::HostSpec;
use crate::node::{NodeFlags, NodeId};
use crate::reconcile::{reconcile_children, Settle};
use crate::renderer::{Core, LogicHandle, Wake};
use crate::routine::{Flow, Procedure, ProcedureKind, Resumed};

/// How a `run` request was absorbed.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum RunOutcome {
    /// The step (and its subtree) settled synchronously.
    Ready,
    /// A step is in flight; the request rides on its completion.
    PendingInflight,
    /// The request was coalesced into the single enqueued step.
    PendingEnqueued,
}

impl RunOutcome {
    pub fn settle(self) -> Settle {
        match self {
            RunOutcome::Ready => Settle::Ready,
            _ => Settle::Pending,
        }
    }
}

/// Externally-driven update: store already happened (the caller wrote the
/// node's props), so mark the props fresh and run.
pub(crate) fn update<H: HostSpec>(core: &mut Core<H>, id: NodeId) -> Settle {
    {
        let node = core.arena.node_mut(id);
        node.flags |= NodeFlags::EXTERNAL_UPDATE | NodeFlags::PROPS_AVAILABLE;
        node.flags -= NodeFlags::WAITING_PROPS;
    }
    let outcome = run(core, id, true);
    if let Some(node) = core.arena.get_mut(id) {
        node.flags -= NodeFlags::EXTERNAL_UPDATE;
    }
    outcome.settle()
}

/// Funnel for both externally-driven updates and self-initiated
/// refreshes: start a step if none is in flight, otherwise coalesce.
pub(crate) fn run<H: HostSpec>(
    core: &mut Core<H>,
    id: NodeId,
    has_new_props: bool,
) -> RunOutcome {
    let Some(node) = core.arena.get(id) else {
        return RunOutcome::Ready;
    };
    if node.flags.contains(NodeFlags::UNMOUNTED) {
        return RunOutcome::Ready;
    }
    let Some(logic) = node.logic() else {
        return RunOutcome::Ready;
    };
    let kind = logic.kind;
    if logic.inflight {
        if kind == ProcedureKind::ResumableDeferred {
            // No new step while one is outstanding for this kind; a
            // request without fresh props observes the in-flight result,
            // one with fresh props rides the self-driven continuation.
            return if has_new_props {
                RunOutcome::PendingEnqueued
            } else {
                RunOutcome::PendingInflight
            };
        }
        // Coalesce to exactly one enqueued step; later requests share it.
        core.arena
            .node_mut(id)
            .logic_mut()
            .expect("logic node changed kind")
            .enqueued = true;
        return RunOutcome::PendingEnqueued;
    }
    if node.flags.contains(NodeFlags::FINISHED) {
        return RunOutcome::Ready;
    }
    step(core, id)
}

/// Execute one unit of the node's procedure.
fn step<H: HostSpec>(core: &mut Core<H>, id: NodeId) -> RunOutcome {
    let input = resume_input(core, id);
    let seq = begin_step(core, id);
    let kind = core
        .arena
        .node(id)
        .logic()
        .expect("step on a non-logic node")
        .kind;

    let mut procedure = take_procedure(core, id);
    enum Eval<H: HostSpec> {
        Children(Result<Vec<Child<H>>, anyhow::Error>),
        DeferredChildren(Result<Deferred<Vec<Child<H>>>, anyhow::Error>),
        Flow(Result<Flow<H>, anyhow::Error>),
        DeferredFlow(Deferred<Flow<H>>),
    }
    let eval = {
        let mut cx = LogicCx {
            core: &mut *core,
            node: id,
        };
        match &mut procedure {
            Procedure::Immediate(f) => Eval::Children(f(&mut cx)),
            Procedure::Deferred(f) => Eval::DeferredChildren(f(&mut cx)),
            Procedure::Resumable(r) => Eval::Flow(r.resume(&mut cx, input)),
            Procedure::ResumableDeferred(r) => Eval::DeferredFlow(r.resume(&mut cx, input)),
        }
    };
    put_back(core, id, procedure);

    match eval {
        Eval::Children(Ok(children)) => deliver_children(core, id, Ok(children)),
        Eval::Children(Err(err)) => deliver_children(core, id, Err(TreeError::raised(err))),
        Eval::Flow(result) => deliver_flow(
            core,
            id,
            result.map_err(TreeError::raised),
            kind == ProcedureKind::Resumable,
        ),
        Eval::DeferredChildren(Err(err)) => {
            deliver_children(core, id, Err(TreeError::raised(err)))
        }
        Eval::DeferredChildren(Ok(deferred)) => {
            if let Some(outcome) = deferred.peek() {
                deliver_children(core, id, outcome)
            } else {
                let driver = core.driver.clone();
                deferred.on_settle(move |outcome| {
                    driver.push(Wake::StepChildren {
                        node: id,
                        seq,
                        result: outcome.clone(),
                    });
                });
                RunOutcome::PendingInflight
            }
        }
        Eval::DeferredFlow(deferred) => {
            if let Some(outcome) = deferred.peek() {
                deliver_flow(core, id, outcome, true)
            } else {
                let driver = core.driver.clone();
                deferred.on_settle(move |outcome| {
                    driver.push(Wake::StepFlow {
                        node: id,
                        seq,
                        result: outcome.clone(),
                        injected: false,
                    });
                });
                RunOutcome::PendingInflight
            }
        }
    }
}

/// A deferred-kind procedure's value arrived: feed it to the reconciler.
pub(crate) fn deliver_children<H: HostSpec>(
    core: &mut Core<H>,
    id: NodeId,
    result: Result<Vec<Child<H>>, TreeError>,
) -> RunOutcome {
    match result {
        Ok(children) => settle_step_children(core, id, children),
        Err(err) => {
            step_failed(core, id, err);
            RunOutcome::Ready
        }
    }
}

/// A resumable machine's flow arrived: interpret yield/return and feed the
/// reconciler. `enforce_props` applies the one-props-per-resumption usage
/// check (skipped for injected error resumptions).
pub(crate) fn deliver_flow<H: HostSpec>(
    core: &mut Core<H>,
    id: NodeId,
    result: Result<Flow<H>, TreeError>,
    enforce_props: bool,
) -> RunOutcome {
    match result {
        Ok(flow) => {
            if enforce_props && matches!(flow, Flow::Yield(_)) {
                let flags = core.arena.node(id).flags;
                assert!(
                    flags.contains(NodeFlags::PROPS_TAKEN),
                    "logic procedure yielded without consuming props"
                );
            }
            let children = match flow {
                Flow::Yield(children) => children,
                Flow::Return(children) => {
                    core.arena.node_mut(id).flags |= NodeFlags::FINISHED;
                    children.unwrap_or_default()
                }
            };
            settle_step_children(core, id, children)
        }
        Err(err) => {
            step_failed(core, id, err);
            RunOutcome::Ready
        }
    }
}

fn settle_step_children<H: HostSpec>(
    core: &mut Core<H>,
    id: NodeId,
    children: Vec<Child<H>>,
) -> RunOutcome {
    core.arena.node_mut(id).flags -= NodeFlags::STEPPING;
    match reconcile_children(core, id, &children) {
        Settle::Ready => RunOutcome::Ready,
        Settle::Pending => RunOutcome::PendingInflight,
    }
}

fn step_failed<H: HostSpec>(core: &mut Core<H>, id: NodeId, err: TreeError) {
    {
        let node = core.arena.node_mut(id);
        node.flags -= NodeFlags::STEPPING;
        if let Some(logic) = node.logic_mut() {
            logic.inflight = false;
        }
    }
    let arc = match err {
        TreeError::Raised(arc) => arc,
        other => Arc::new(anyhow::Error::new(other)),
    };
    route_error(core, id, arc);
}

/// Promote the enqueued step, or self-drive a resumable-deferred node.
pub(crate) fn advance<H: HostSpec>(core: &mut Core<H>, id: NodeId, seq: u64) {
    let Some(node) = core.arena.get(id) else {
        return;
    };
    if node.flags.contains(NodeFlags::UNMOUNTED) || node.step_seq != seq {
        return;
    }
    let Some(logic) = node.logic() else {
        return;
    };
    if logic.inflight {
        return;
    }
    let kind = logic.kind;
    let enqueued = logic.enqueued;
    let finished = node.flags.contains(NodeFlags::FINISHED);
    let props_available = node.flags.contains(NodeFlags::PROPS_AVAILABLE);

    if enqueued {
        if let Some(logic) = core.arena.node_mut(id).logic_mut() {
            logic.enqueued = false;
        }
        promote_next_waiters(core, id);
        finish_direct_run(core, id);
        return;
    }

    // Unfinished resumable-deferred nodes keep driving themselves as long
    // as fresh props arrive, and park on the props-wait otherwise.
    if kind == ProcedureKind::ResumableDeferred && !finished {
        if props_available {
            promote_next_waiters(core, id);
            finish_direct_run(core, id);
        } else {
            core.arena.node_mut(id).flags |= NodeFlags::WAITING_PROPS;
        }
    }
}

fn finish_direct_run<H: HostSpec>(core: &mut Core<H>, id: NodeId) {
    if step(core, id) == RunOutcome::Ready {
        commit_node(core, id);
        after_commit(core, id);
    }
}

fn promote_next_waiters<H: HostSpec>(core: &mut Core<H>, id: NodeId) {
    let moved = {
        let Some(logic) = core.arena.node_mut(id).logic_mut() else {
            return;
        };
        std::mem::take(&mut logic.next_waiters)
    };
    core.arena.node_mut(id).waiters.extend(moved);
}

fn begin_step(core: &mut Core<impl HostSpec>, id: NodeId) -> u64 {
    let node = core.arena.node_mut(id);
    node.step_seq += 1;
    node.flags |= NodeFlags::STEPPING;
    node.flags -= NodeFlags::PROPS_TAKEN;
    if let Some(logic) = node.logic_mut() {
        logic.inflight = true;
    }
    node.step_seq
}

/// The value a machine is resumed with.
fn resume_input<H: HostSpec>(core: &mut Core<H>, id: NodeId) -> Resumed<H> {
    let node = core.arena.node(id);
    if node.settling.is_some() {
        // Still transitioning: hand over the pending completion of the
        // previous step's aggregate.
        let (deferred, resolver) = Deferred::new();
        core.arena.node_mut(id).waiters.push(resolver);
        Resumed::Pending(deferred)
    } else {
        Resumed::Values(node.value.clone())
    }
}

fn take_procedure<H: HostSpec>(core: &mut Core<H>, id: NodeId) -> Procedure<H> {
    core.arena
        .node_mut(id)
        .logic_mut()
        .expect("procedure on a non-logic node")
        .procedure
        .take()
        .expect("procedure resumed re-entrantly")
}

fn put_back<H: HostSpec>(core: &mut Core<H>, id: NodeId, procedure: Procedure<H>) {
    if let Some(node) = core.arena.get_mut(id) {
        if let Some(logic) = node.logic_mut() {
            logic.procedure = Some(procedure);
        }
    }
}

/// Route an error to the nearest ancestor whose machine accepts injected
/// errors; with no acceptor, surface it to the external caller.
pub(crate) fn route_error<H: HostSpec>(core: &mut Core<H>, from: NodeId, err: Arc<anyhow::Error>) {
    enum Caught<H: HostSpec> {
        Sync(Result<Flow<H>, anyhow::Error>),
        Deferred(Deferred<Flow<H>>),
    }

    let mut cursor = core.arena.get(from).and_then(|n| n.parent);
    while let Some(id) = cursor {
        let Some(node) = core.arena.get(id) else {
            break;
        };
        cursor = node.parent;
        let acceptable = node.logic().is_some_and(|l| l.kind.is_resumable())
            && !node
                .flags
                .intersects(NodeFlags::FINISHED | NodeFlags::UNMOUNTED);
        if !acceptable {
            continue;
        }

        let mut procedure = take_procedure(core, id);
        let caught = {
            let mut cx = LogicCx {
                core: &mut *core,
                node: id,
            };
            match &mut procedure {
                Procedure::Resumable(r) => r.catch(&mut cx, err.clone()).map(Caught::Sync),
                Procedure::ResumableDeferred(r) => {
                    r.catch(&mut cx, err.clone()).map(Caught::Deferred)
                }
                _ => None,
            }
        };
        put_back(core, id, procedure);

        match caught {
            None => continue,
            Some(Caught::Sync(result)) => {
                begin_step(core, id);
                match result {
                    Ok(flow) => {
                        if deliver_flow(core, id, Ok(flow), false) == RunOutcome::Ready {
                            commit_node(core, id);
                            after_commit(core, id);
                        }
                    }
                    Err(next) => {
                        // The machine's own catch raised; keep walking from
                        // the acceptor.
                        step_failed(core, id, TreeError::raised(next));
                    }
                }
                return;
            }
            Some(Caught::Deferred(deferred)) => {
                let seq = begin_step(core, id);
                if let Some(outcome) = deferred.peek() {
                    if deliver_flow(core, id, outcome, false) == RunOutcome::Ready {
                        commit_node(core, id);
                        after_commit(core, id);
                    }
                } else {
                    let driver = core.driver.clone();
                    deferred.on_settle(move |outcome| {
                        driver.push(Wake::StepFlow {
                            node: id,
                            seq,
                            result: outcome.clone(),
                            injected: true,
                        });
                    });
                }
                return;
            }
        }
    }

    // No acceptor anywhere up the chain: fatal.
    fail_upward(core, from, TreeError::Raised(err));
}

/// Reject every outstanding handle on the failing node's ancestor path and
/// record the fatal error for the surface call to re-raise.
pub(crate) fn fail_upward<H: HostSpec>(core: &mut Core<H>, from: NodeId, err: TreeError) {
    if core.fatal.is_none() {
        core.fatal = Some(err.clone());
    }
    let mut rejected = Vec::new();
    let mut cursor = Some(from);
    while let Some(id) = cursor {
        let Some(node) = core.arena.get_mut(id) else {
            break;
        };
        cursor = node.parent;
        node.settling = None;
        rejected.extend(std::mem::take(&mut node.waiters));
        if let Some(logic) = node.logic_mut() {
            rejected.extend(std::mem::take(&mut logic.next_waiters));
        }
    }
    for waiter in rejected {
        core.settle_later(waiter, Err(err.clone()));
    }
}

/// The context object handed to a logic procedure while it executes.
///
/// Borrow-scoped to one resumption; for anything that outlives the call
/// (event handlers, timers), take a [`LogicCx::handle`].
pub struct LogicCx<'a, H: HostSpec> {
    pub(crate) core: &'a mut Core<H>,
    pub(crate) node: NodeId,
}

impl<'a, H: HostSpec> LogicCx<'a, H> {
    /// Consume the props for this resumption.
    ///
    /// A resumable procedure must call this exactly once per resumption
    /// before yielding.
    ///
    /// # Panics
    ///
    /// Panics when called twice without an intervening yield; that is a
    /// usage error at the offending call site, never routed through the
    /// tree.
    pub fn props(&mut self) -> Props {
        let node = self.core.arena.node_mut(self.node);
        if node.flags.contains(NodeFlags::PROPS_TAKEN) {
            panic!("props consumed twice without an intervening yield");
        }
        node.flags |= NodeFlags::PROPS_TAKEN;
        node.flags -= NodeFlags::PROPS_AVAILABLE;
        node.props.clone()
    }

    /// Store an ancestor-scoped binding on this node, visible to
    /// descendant logic nodes via [`LogicCx::provision`].
    pub fn provide<T: 'static>(&mut self, key: impl Into<Rc<str>>, value: T) {
        let node = self.core.arena.node_mut(self.node);
        if let Some(logic) = node.logic_mut() {
            logic.provisions.insert(key.into(), Rc::new(value));
        }
    }

    /// Look up the nearest ancestor logic node's binding for `key`.
    ///
    /// Non-logic ancestors are skipped; returns `None` when no ancestor
    /// has provided the key (or the stored type differs).
    pub fn provision<T: 'static>(&self, key: &str) -> Option<Rc<T>> {
        let mut cursor = self.core.arena.get(self.node).and_then(|n| n.parent);
        while let Some(id) = cursor {
            let node = self.core.arena.get(id)?;
            cursor = node.parent;
            if let Some(logic) = node.logic() {
                if let Some(value) = logic.provisions.get(key) {
                    return value.clone().downcast::<T>().ok();
                }
            }
        }
        None
    }

    /// A cloneable handle to this node that outlives the resumption.
    pub fn handle(&self) -> LogicHandle<H> {
        LogicHandle::new(self.core.driver.clone(), self.node)
    }
}
