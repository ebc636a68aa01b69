//! Stateful logic procedures and their four driver kinds.
//!
//! A logic node wraps a user-supplied procedure. Rather than duck-typing
//! whatever the procedure returns, the kind is a tagged union fixed at
//! construction, with one driver strategy per tag:
//!
//! - [`Procedure::Immediate`]: a plain function, invoked once per step.
//! - [`Procedure::Deferred`]: a function producing one deferred child
//!   description per step.
//! - [`Procedure::Resumable`]: a [`Routine`] state machine, resumed
//!   synchronously; each resumption receives the node's last committed
//!   value and yields the next child description.
//! - [`Procedure::ResumableDeferred`]: an [`AsyncRoutine`], where each
//!   resumption itself settles later.
//!
//! Resumable machines are the error boundaries of a tree: overriding
//! [`Routine::catch`] (or [`AsyncRoutine::catch`]) lets a machine accept an
//! error raised anywhere below it and yield a fallback description.

use std::sync::Arc;

use crate::deferred::Deferred;
use crate::element::Child;
use crate::host::{HostSpec, TreeValues};
use crate::schedule::LogicCx;

/// What one resumption of a machine produced.
pub enum Flow<H: HostSpec> {
    /// The next child description for the node.
    Yield(Vec<Child<H>>),
    /// The machine finished, optionally rendering a final description.
    /// A finished node never steps again.
    Return(Option<Vec<Child<H>>>),
}

impl<H: HostSpec> Clone for Flow<H> {
    fn clone(&self) -> Self {
        match self {
            Flow::Yield(children) => Flow::Yield(children.clone()),
            Flow::Return(children) => Flow::Return(children.clone()),
        }
    }
}

/// The value a machine is resumed with: the node's last committed
/// aggregate, or — while the node is still transitioning — the pending
/// completion of the previous step's aggregate.
pub enum Resumed<H: HostSpec> {
    /// The committed value sequence.
    Values(TreeValues<H::Value>),
    /// The previous step has not committed yet; this settles when it does.
    Pending(Deferred<TreeValues<H::Value>>),
}

/// The result of one synchronous resumption.
pub type StepResult<H> = Result<Flow<H>, anyhow::Error>;

/// The hook invoked when a resumable machine is torn down early.
pub enum Finalize {
    /// Teardown finished synchronously.
    Done,
    /// Teardown is asynchronous; the node's children unmount once this
    /// settles.
    Pending(Deferred<()>),
}

/// A resumable logic procedure, stepped synchronously.
///
/// The driver resumes the machine once per update cycle. A machine must
/// consume exactly one props value (via [`LogicCx::props`]) per resumption
/// before yielding; consuming zero or two is a usage error and panics.
pub trait Routine<H: HostSpec> {
    /// Resume with the node's last committed value, producing the next
    /// description.
    fn resume(&mut self, cx: &mut LogicCx<'_, H>, input: Resumed<H>) -> StepResult<H>;

    /// Resume with an injected error from a descendant.
    ///
    /// Return `Some` to accept: the machine behaves as if its current
    /// suspension point raised the error, and the returned flow is treated
    /// as a normal update. Return `None` (the default) to let the error
    /// keep walking up the tree.
    fn catch(
        &mut self,
        cx: &mut LogicCx<'_, H>,
        error: Arc<anyhow::Error>,
    ) -> Option<StepResult<H>> {
        let _ = (cx, error);
        None
    }

    /// Early-return hook, invoked exactly once when the node unmounts
    /// before the machine finished.
    fn finalize(&mut self, cx: &mut LogicCx<'_, H>) -> Result<Finalize, anyhow::Error> {
        let _ = cx;
        Ok(Finalize::Done)
    }
}

/// A resumable logic procedure whose every resumption settles later.
pub trait AsyncRoutine<H: HostSpec> {
    /// Begin one resumption; the returned deferred settles with the flow
    /// (or rejects with [`TreeError::Raised`](crate::TreeError::Raised)).
    fn resume(&mut self, cx: &mut LogicCx<'_, H>, input: Resumed<H>) -> Deferred<Flow<H>>;

    /// Resume with an injected error; `None` (the default) declines.
    fn catch(
        &mut self,
        cx: &mut LogicCx<'_, H>,
        error: Arc<anyhow::Error>,
    ) -> Option<Deferred<Flow<H>>> {
        let _ = (cx, error);
        None
    }

    /// Early-return hook, invoked exactly once when the node unmounts
    /// before the machine finished.
    fn finalize(&mut self, cx: &mut LogicCx<'_, H>) -> Result<Finalize, anyhow::Error> {
        let _ = cx;
        Ok(Finalize::Done)
    }
}

/// A one-shot step function: invoked once per step, returns the node's
/// next child description.
pub type ImmediateFn<H> =
    Box<dyn FnMut(&mut LogicCx<'_, H>) -> Result<Vec<Child<H>>, anyhow::Error>>;

/// A one-shot deferred step function: invoked once per step, returns a
/// handle settling with the node's next child description.
pub type DeferredFn<H> =
    Box<dyn FnMut(&mut LogicCx<'_, H>) -> Result<Deferred<Vec<Child<H>>>, anyhow::Error>>;

/// A logic procedure, one of the four kinds.
pub enum Procedure<H: HostSpec> {
    /// Plain function; each step invokes it once.
    Immediate(ImmediateFn<H>),
    /// Function returning a single deferred description per step.
    Deferred(DeferredFn<H>),
    /// Synchronously stepped machine.
    Resumable(Box<dyn Routine<H>>),
    /// Machine whose every resumption settles later.
    ResumableDeferred(Box<dyn AsyncRoutine<H>>),
}

impl<H: HostSpec> Procedure<H> {
    /// Convenience constructor for [`Procedure::Immediate`].
    pub fn immediate(
        f: impl FnMut(&mut LogicCx<'_, H>) -> Result<Vec<Child<H>>, anyhow::Error> + 'static,
    ) -> Self {
        Procedure::Immediate(Box::new(f))
    }

    /// Convenience constructor for [`Procedure::Deferred`].
    pub fn deferred(
        f: impl FnMut(&mut LogicCx<'_, H>) -> Result<Deferred<Vec<Child<H>>>, anyhow::Error>
            + 'static,
    ) -> Self {
        Procedure::Deferred(Box::new(f))
    }

    /// Convenience constructor for [`Procedure::Resumable`].
    pub fn resumable(routine: impl Routine<H> + 'static) -> Self {
        Procedure::Resumable(Box::new(routine))
    }

    /// Convenience constructor for [`Procedure::ResumableDeferred`].
    pub fn resumable_deferred(routine: impl AsyncRoutine<H> + 'static) -> Self {
        Procedure::ResumableDeferred(Box::new(routine))
    }

    /// The fixed kind tag.
    pub fn kind(&self) -> ProcedureKind {
        match self {
            Procedure::Immediate(_) => ProcedureKind::Immediate,
            Procedure::Deferred(_) => ProcedureKind::Deferred,
            Procedure::Resumable(_) => ProcedureKind::Resumable,
            Procedure::ResumableDeferred(_) => ProcedureKind::ResumableDeferred,
        }
    }
}

/// The four procedure kinds, fixed at construction.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ProcedureKind {
    /// Plain function.
    Immediate,
    /// Function returning one deferred value.
    Deferred,
    /// Synchronously stepped machine.
    Resumable,
    /// Machine with deferred resumptions.
    ResumableDeferred,
}

impl ProcedureKind {
    /// Whether this kind is a resumable state machine (and therefore may
    /// accept injected errors and needs finalizing on unmount).
    pub fn is_resumable(self) -> bool {
        matches!(
            self,
            ProcedureKind::Resumable | ProcedureKind::ResumableDeferred
        )
    }
}
