//! The renderer surface: root caching, the wake queue that reenters the
//! engine safely, and unmounting.
//!
//! All engine state lives in a [`Core`] behind a single `RefCell`. External
//! completions (a host resolving a deferred step, a handle refresh) never
//! borrow it directly; they enqueue a [`Wake`] on the driver, which drains
//! the queue only while no engine pass is running. That makes resolving a
//! deferred from inside a host callback or a procedure safe: the wake is
//! processed when the current pass finishes.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::rc::{Rc, Weak};
use std::sync::Arc;

use crate::commit::{after_commit, commit_node};
use crate::deferred::{Deferred, Outcome, Resolver};
use crate::element::{Child, Tag};
use crate::error::TreeError;
use crate::host::{EventRouter, HostSpec, NoopRouter, TreeValues};
use crate::node::{Arena, Node, NodeFlags, NodeId, NodeKind};
use crate::reconcile::{reconcile_children, Settle};
use crate::routine::{Finalize, Flow, Procedure, ProcedureKind};
use crate::schedule::{self, LogicCx, RunOutcome};

/// Engine state: the arena, the host, and everything owned by the root
/// scheduler.
pub(crate) struct Core<H: HostSpec> {
    pub arena: Arena<H>,
    pub host: H,
    pub router: Box<dyn EventRouter<H>>,
    /// Root cache: target object to its materialized root node.
    pub roots: HashMap<H::Target, NodeId>,
    pub driver: Driver<H>,
    /// Engine-surface resolutions, settled only after the current borrow
    /// of the core is released so user callbacks cannot re-enter it.
    pub outbox: Vec<OutboxEntry<H>>,
    /// An unroutable error waiting to be re-raised by the surface call.
    pub fatal: Option<TreeError>,
}

type OutboxEntry<H> = (
    Resolver<TreeValues<<H as HostSpec>::Value>>,
    Outcome<TreeValues<<H as HostSpec>::Value>>,
);

impl<H: HostSpec> Core<H> {
    /// Queue an engine-surface resolution for after the current pass.
    pub fn settle_later(
        &mut self,
        resolver: Resolver<TreeValues<H::Value>>,
        outcome: Outcome<TreeValues<H::Value>>,
    ) {
        self.outbox.push((resolver, outcome));
    }
}

/// Work items entering the engine from outside the current borrow.
pub(crate) enum Wake<H: HostSpec> {
    /// A resumable machine's deferred resumption settled.
    StepFlow {
        node: NodeId,
        seq: u64,
        result: Outcome<Flow<H>>,
        /// Error-injection resumptions skip the props usage check.
        injected: bool,
    },
    /// A deferred-kind procedure's value settled.
    StepChildren {
        node: NodeId,
        seq: u64,
        result: Outcome<Vec<Child<H>>>,
    },
    /// A committed step wants its follow-up promoted.
    Advance { node: NodeId, seq: u64 },
    /// Self-initiated re-execution requested through a handle.
    Refresh {
        node: NodeId,
        resolver: Option<Resolver<TreeValues<H::Value>>>,
    },
    /// An asynchronous unmount finalize settled; tear down the children.
    FinalizeDone {
        node: NodeId,
        seq: u64,
        detach: bool,
    },
}

/// Cloneable entry point for wakes; holds the core weakly so pending
/// completions cannot keep a dropped renderer alive.
pub(crate) struct Driver<H: HostSpec> {
    core: Weak<RefCell<Core<H>>>,
    queue: Rc<RefCell<VecDeque<Wake<H>>>>,
    /// True while some frame is borrowing the core; wakes queue up
    /// instead of draining.
    active: Rc<Cell<bool>>,
}

impl<H: HostSpec> Clone for Driver<H> {
    fn clone(&self) -> Self {
        Driver {
            core: self.core.clone(),
            queue: self.queue.clone(),
            active: self.active.clone(),
        }
    }
}

impl<H: HostSpec> Driver<H> {
    pub fn push(&self, wake: Wake<H>) {
        self.queue.borrow_mut().push_back(wake);
        self.kick();
    }

    /// Drain the queue unless a pass is already running (in which case the
    /// running frame picks the items up).
    pub fn kick(&self) {
        if self.active.get() {
            return;
        }
        let Some(core) = self.core.upgrade() else {
            self.reject_orphans();
            return;
        };
        self.active.set(true);
        self.drain(&core);
        self.active.set(false);
    }

    fn drain(&self, core: &Rc<RefCell<Core<H>>>) {
        loop {
            flush_outbox(core);
            let wake = self.queue.borrow_mut().pop_front();
            let Some(wake) = wake else {
                return;
            };
            {
                let mut core = core.borrow_mut();
                dispatch(&mut core, wake);
            }
        }
    }

    /// The renderer is gone; settle what can still be settled.
    fn reject_orphans(&self) {
        let orphans: Vec<Wake<H>> = self.queue.borrow_mut().drain(..).collect();
        for wake in orphans {
            if let Wake::Refresh {
                resolver: Some(resolver),
                ..
            } = wake
            {
                resolver.reject(TreeError::RendererGone);
            }
        }
    }
}

fn flush_outbox<H: HostSpec>(core: &Rc<RefCell<Core<H>>>) {
    loop {
        let batch = std::mem::take(&mut core.borrow_mut().outbox);
        if batch.is_empty() {
            return;
        }
        for (resolver, outcome) in batch {
            resolver.settle(outcome);
        }
    }
}

fn dispatch<H: HostSpec>(core: &mut Core<H>, wake: Wake<H>) {
    match wake {
        Wake::StepFlow {
            node,
            seq,
            result,
            injected,
        } => {
            let Some(n) = core.arena.get(node) else {
                return;
            };
            if n.flags.contains(NodeFlags::UNMOUNTED) || n.step_seq != seq {
                return;
            }
            let enforce = !injected
                && n.logic()
                    .is_some_and(|l| l.kind == ProcedureKind::ResumableDeferred);
            if schedule::deliver_flow(core, node, result, enforce) == RunOutcome::Ready {
                commit_node(core, node);
                after_commit(core, node);
            }
        }
        Wake::StepChildren { node, seq, result } => {
            let Some(n) = core.arena.get(node) else {
                return;
            };
            if n.flags.contains(NodeFlags::UNMOUNTED) || n.step_seq != seq {
                return;
            }
            if schedule::deliver_children(core, node, result) == RunOutcome::Ready {
                commit_node(core, node);
                after_commit(core, node);
            }
        }
        Wake::Advance { node, seq } => schedule::advance(core, node, seq),
        Wake::Refresh { node, resolver } => {
            let live = core
                .arena
                .get(node)
                .is_some_and(|n| !n.flags.contains(NodeFlags::UNMOUNTED));
            if !live {
                if let Some(resolver) = resolver {
                    core.settle_later(resolver, Err(TreeError::Unmounted));
                }
                return;
            }
            match schedule::run(core, node, false) {
                RunOutcome::Ready => {
                    if let Some(resolver) = resolver {
                        core.arena.node_mut(node).waiters.push(resolver);
                    }
                    commit_node(core, node);
                    after_commit(core, node);
                }
                RunOutcome::PendingInflight => {
                    if let Some(resolver) = resolver {
                        core.arena.node_mut(node).waiters.push(resolver);
                    }
                }
                RunOutcome::PendingEnqueued => {
                    if let Some(resolver) = resolver {
                        if let Some(logic) = core.arena.node_mut(node).logic_mut() {
                            logic.next_waiters.push(resolver);
                        }
                    }
                }
            }
        }
        Wake::FinalizeDone { node, seq, detach } => {
            let valid = core
                .arena
                .get(node)
                .is_some_and(|n| n.flags.contains(NodeFlags::UNMOUNTED) && n.step_seq == seq);
            if valid {
                unmount_children_and_remove(core, node, detach);
            }
        }
    }
}

/// Unmount a node: finalize its procedure or host step exactly once, then
/// tear down its children and drop it from the arena.
///
/// `detach` tells host nodes whether they must actually detach their value
/// or sit inside a subtree an ancestor already detached. It flips to false
/// below a host node and resets to true crossing a detached boundary.
/// Unmounting twice is a no-op.
pub(crate) fn unmount<H: HostSpec>(core: &mut Core<H>, id: NodeId, detach: bool) {
    let seq;
    let mut rejected = Vec::new();
    {
        let Some(node) = core.arena.get_mut(id) else {
            return;
        };
        if node.flags.contains(NodeFlags::UNMOUNTED) {
            return;
        }
        node.flags |= NodeFlags::UNMOUNTED;
        // Release the props-wait so no resumption stays parked forever,
        // and invalidate stale continuations.
        node.flags -= NodeFlags::WAITING_PROPS;
        node.step_seq += 1;
        seq = node.step_seq;
        node.settling = None;
        rejected.extend(std::mem::take(&mut node.waiters));
        if let Some(logic) = node.logic_mut() {
            logic.enqueued = false;
            logic.inflight = false;
            rejected.extend(std::mem::take(&mut logic.next_waiters));
        }
    }
    for waiter in rejected {
        core.settle_later(waiter, Err(TreeError::Unmounted));
    }

    let child_detach = match &core.arena.node(id).kind {
        NodeKind::Host(_) => false,
        NodeKind::Detached => true,
        _ => detach,
    };

    // A node unmounted mid-replacement drags the chain it superseded
    // along with it.
    let alternate = core.arena.node_mut(id).alternate.take();
    if let Some(alt) = alternate {
        unmount(core, alt, detach);
    }

    match &core.arena.node(id).kind {
        NodeKind::Logic(_) => {
            if finalize_logic(core, id, seq, child_detach) {
                // Asynchronous teardown; children follow once it settles.
                return;
            }
        }
        NodeKind::Host(_) => release_host(core, id, detach),
        _ => {}
    }

    unmount_children_and_remove(core, id, child_detach);
}

/// Run a resumable machine's early-return hook. Returns `true` when the
/// teardown is asynchronous and children unmounting has been deferred.
fn finalize_logic<H: HostSpec>(
    core: &mut Core<H>,
    id: NodeId,
    seq: u64,
    child_detach: bool,
) -> bool {
    let resumable = {
        let node = core.arena.node(id);
        node.logic().is_some_and(|l| l.kind.is_resumable())
            && !node.flags.contains(NodeFlags::FINISHED)
    };
    if !resumable {
        return false;
    }
    core.arena.node_mut(id).flags |= NodeFlags::FINISHED;
    let Some(mut procedure) = core
        .arena
        .node_mut(id)
        .logic_mut()
        .and_then(|l| l.procedure.take())
    else {
        return false;
    };

    let finalized = {
        let mut cx = LogicCx {
            core: &mut *core,
            node: id,
        };
        match &mut procedure {
            Procedure::Resumable(r) => r.finalize(&mut cx),
            Procedure::ResumableDeferred(r) => r.finalize(&mut cx),
            _ => Ok(Finalize::Done),
        }
    };
    if let Some(logic) = core.arena.node_mut(id).logic_mut() {
        logic.procedure = Some(procedure);
    }

    match finalized {
        Ok(Finalize::Done) => false,
        Ok(Finalize::Pending(deferred)) => {
            if deferred.is_settled() {
                return false;
            }
            let driver = core.driver.clone();
            deferred.on_settle(move |_| {
                driver.push(Wake::FinalizeDone {
                    node: id,
                    seq,
                    detach: child_detach,
                });
            });
            true
        }
        Err(err) => {
            // Teardown errors still route; they are never dropped.
            schedule::route_error(core, id, Arc::new(err));
            false
        }
    }
}

fn release_host<H: HostSpec>(core: &mut Core<H>, id: NodeId, detach: bool) {
    let tag = match &core.arena.node(id).tag {
        Tag::Host(tag) => tag.clone(),
        _ => return,
    };
    // Finalize a resumable step exactly once.
    {
        let NodeKind::Host(state) = &mut core.arena.node_mut(id).kind else {
            return;
        };
        if let crate::node::HostProducerState::Step(step) = &mut state.producer {
            step.finalize();
        }
    }

    let own = {
        let NodeKind::Host(state) = &core.arena.node(id).kind else {
            return;
        };
        state.own.clone()
    };
    if let Some(own) = own {
        if detach {
            core.host.release(&tag, &own);
        }
        core.router.clear(&own);
    }
}

fn unmount_children_and_remove<H: HostSpec>(core: &mut Core<H>, id: NodeId, child_detach: bool) {
    let kids = core.arena.chain(core.arena.node(id).head);
    for kid in kids {
        unmount(core, kid, child_detach);
    }
    core.arena.remove(id);
}

/// Root update entry: reconcile against the cached root for `target`.
pub(crate) fn update_root<H: HostSpec>(
    core: &mut Core<H>,
    target: H::Target,
    tree: Option<Vec<Child<H>>>,
) -> Result<UpdateStatus<H::Value>, TreeError> {
    core.fatal = None;
    let Some(children) = tree else {
        // Absent tree: evict the mapping and unmount.
        if let Some(root) = core.roots.remove(&target) {
            unmount(core, root, true);
            core.host.arrange(&target, &[], None);
        }
        return Ok(UpdateStatus::Committed(Vec::new()));
    };

    let root = match core.roots.get(&target) {
        Some(&root) if core.arena.get(root).is_some() => root,
        _ => {
            let mut node = Node::new(Tag::Detached, None, NodeKind::Detached);
            node.target = Some(target.clone());
            let id = core.arena.insert(node);
            core.roots.insert(target.clone(), id);
            id
        }
    };

    let settle = reconcile_children(core, root, &children);
    if let Some(err) = core.fatal.take() {
        return Err(err);
    }
    match settle {
        Settle::Ready => {
            commit_node(core, root);
            if let Some(err) = core.fatal.take() {
                return Err(err);
            }
            Ok(UpdateStatus::Committed(core.arena.node(root).value.clone()))
        }
        Settle::Pending => {
            let (deferred, resolver) = Deferred::new();
            core.arena.node_mut(root).waiters.push(resolver);
            Ok(UpdateStatus::Pending(deferred))
        }
    }
}

/// The result of a surface update: a committed value sequence, or a handle
/// settling once outstanding deferred steps land.
#[derive(Debug)]
pub enum UpdateStatus<V> {
    /// The whole tree settled synchronously.
    Committed(TreeValues<V>),
    /// Deferred completions are outstanding; settles with the root's
    /// committed values (of whichever update ultimately wins).
    Pending(Deferred<TreeValues<V>>),
}

/// The engine's external surface.
///
/// Owns the persistent trees (one per target) and the host. Cheap to
/// clone is not a goal here; a single renderer drives all targets of one
/// host.
pub struct Renderer<H: HostSpec> {
    core: Rc<RefCell<Core<H>>>,
    driver: Driver<H>,
}

impl<H: HostSpec> Renderer<H> {
    /// Create a renderer with no event routing.
    pub fn new(host: H) -> Self {
        Renderer::with_event_router(host, Box::new(NoopRouter))
    }

    /// Create a renderer forwarding commit targets to `router`.
    pub fn with_event_router(host: H, router: Box<dyn EventRouter<H>>) -> Self {
        let queue = Rc::new(RefCell::new(VecDeque::new()));
        let active = Rc::new(Cell::new(false));
        let core = Rc::new(RefCell::new(Core {
            arena: Arena::new(),
            host,
            router,
            roots: HashMap::new(),
            driver: Driver {
                core: Weak::new(),
                queue: queue.clone(),
                active: active.clone(),
            },
            outbox: Vec::new(),
            fatal: None,
        }));
        let driver = Driver {
            core: Rc::downgrade(&core),
            queue,
            active,
        };
        core.borrow_mut().driver = driver.clone();
        Renderer { core, driver }
    }

    /// Update (or mount) the tree for `target`.
    ///
    /// Re-invoking with a new tree against the same target reconciles in
    /// place. Invoking with `None` clears the target and unmounts its
    /// tree.
    ///
    /// # Errors
    ///
    /// Returns [`TreeError::Raised`] when a procedure or host callback
    /// failed and no ancestor accepted the error.
    pub fn update(
        &self,
        target: H::Target,
        tree: Option<Vec<Child<H>>>,
    ) -> Result<UpdateStatus<H::Value>, TreeError> {
        let was_active = self.driver.active.replace(true);
        let result = {
            let mut core = self.core.borrow_mut();
            update_root(&mut core, target, tree)
        };
        self.driver.active.set(was_active);
        self.driver.kick();
        result
    }
}

/// A cloneable reference to a logic node, usable from event handlers and
/// timers after the resumption that created it has returned.
pub struct LogicHandle<H: HostSpec> {
    driver: Driver<H>,
    node: NodeId,
}

impl<H: HostSpec> Clone for LogicHandle<H> {
    fn clone(&self) -> Self {
        LogicHandle {
            driver: self.driver.clone(),
            node: self.node,
        }
    }
}

impl<H: HostSpec> LogicHandle<H> {
    pub(crate) fn new(driver: Driver<H>, node: NodeId) -> Self {
        LogicHandle { driver, node }
    }

    /// Re-execute the node without new props.
    ///
    /// The returned handle settles with the node's committed value
    /// sequence, or rejects with [`TreeError::Unmounted`] /
    /// [`TreeError::RendererGone`].
    pub fn refresh(&self) -> Deferred<TreeValues<H::Value>> {
        let (deferred, resolver) = Deferred::new();
        self.driver.push(Wake::Refresh {
            node: self.node,
            resolver: Some(resolver),
        });
        deferred
    }

    /// Whether the node is still mounted. While the engine is mid-pass
    /// this reports `true`; the next refresh settles authoritatively.
    pub fn is_live(&self) -> bool {
        let Some(core) = self.driver.core.upgrade() else {
            return false;
        };
        let live = match core.try_borrow() {
            Ok(core) => core
                .arena
                .get(self.node)
                .is_some_and(|n| !n.flags.contains(NodeFlags::UNMOUNTED)),
            Err(_) => true,
        };
        live
    }
}
