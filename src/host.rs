//! The host-renderer seam.
//!
//! The engine never produces pixels, DOM nodes, or terminal cells itself.
//! Everything a rendered tree ultimately resolves to is owned by a host
//! implementing [`HostSpec`]: the engine asks it for a producer per host
//! tag, hands the producer the node's props plus aggregated child values at
//! every commit, and arranges the final value sequence into the host's
//! target. Event routing is a second, even narrower collaborator
//! ([`EventRouter`]) that is told the current delegation targets after each
//! host commit.

use std::fmt::Debug;
use std::hash::Hash;
use std::rc::Rc;

use crate::element::Props;

/// One item in a flattened value sequence: a merged text run or a single
/// host value.
#[derive(Clone, Debug, PartialEq)]
pub enum ValueItem<V> {
    /// A run of text. Adjacent text contributions are merged into one run
    /// during commit.
    Text(Rc<str>),
    /// A value produced by a host node.
    Node(V),
}

impl<V> ValueItem<V> {
    /// The text run, if this item is one.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            ValueItem::Text(t) => Some(t),
            ValueItem::Node(_) => None,
        }
    }

    /// The host value, if this item is one.
    pub fn as_node(&self) -> Option<&V> {
        match self {
            ValueItem::Text(_) => None,
            ValueItem::Node(v) => Some(v),
        }
    }
}

/// An ordered sequence of committed values.
pub type TreeValues<V> = Vec<ValueItem<V>>;

/// The minimal changed interval of a flattened value sequence, as
/// half-open indices `start..end` into the sequence.
///
/// Recomputed by every commit and handed to the host (via
/// [`HostSpec::arrange`] and [`HostInvoke::span`]) so it can apply sparse
/// patches instead of re-reading the whole sequence.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DirtySpan {
    /// First changed index.
    pub start: usize,
    /// One past the last changed index.
    pub end: usize,
}

impl DirtySpan {
    pub(crate) fn union(a: Option<DirtySpan>, b: DirtySpan) -> DirtySpan {
        match a {
            None => b,
            Some(a) => DirtySpan {
                start: a.start.min(b.start),
                end: a.end.max(b.end),
            },
        }
    }
}

/// Everything a host producer sees when invoked for a commit.
pub struct HostInvoke<'a, H: HostSpec> {
    /// The host tag of the node being committed.
    pub tag: &'a H::Tag,
    /// The node's current props.
    pub props: &'a Props,
    /// The node's aggregated child values, in flattened order.
    pub children: &'a [ValueItem<H::Value>],
    /// The changed interval of `children` since the previous commit, when
    /// one is known. `None` on the first invocation.
    pub span: Option<DirtySpan>,
}

/// What a host producer returns from its first invocation.
pub enum HostYield<H: HostSpec> {
    /// A value, produced directly. The producer callback is invoked again
    /// on later commits.
    Value(H::Value),
    /// A resumable step source. The engine pulls one value per commit from
    /// it and never invokes the original callback again.
    Step(Box<dyn HostStep<H>>),
}

/// A resumable host value source, pulled once per commit.
pub trait HostStep<H: HostSpec> {
    /// Produce the value for this commit.
    fn pull(&mut self, invoke: HostInvoke<'_, H>) -> Result<H::Value, anyhow::Error>;

    /// Called exactly once when the owning node unmounts.
    fn finalize(&mut self) {}
}

/// The per-tag callback handed out by [`HostSpec::producer`].
pub type HostProducer<H> =
    Box<dyn FnMut(HostInvoke<'_, H>) -> Result<HostYield<H>, anyhow::Error>>;

/// The pluggable host-rendering callback table.
///
/// Implementations own the values the tree resolves to. The engine calls
/// in, never the other way around: every method is invoked from within a
/// commit or unmount pass.
pub trait HostSpec: 'static {
    /// Identity of an externally-defined renderable tag.
    type Tag: Clone + PartialEq + Debug + 'static;
    /// The value a host node resolves to.
    type Value: Clone + PartialEq + Debug + 'static;
    /// An external target object trees are rendered into; used as the
    /// root-cache key.
    type Target: Clone + PartialEq + Eq + Hash + Debug + 'static;

    /// Return the producer for a tag.
    ///
    /// Called once per host node, at its first commit. The producer's first
    /// invocation may return [`HostYield::Step`] to switch the node to
    /// pull-per-commit mode.
    fn producer(&mut self, tag: &Self::Tag) -> HostProducer<Self>
    where
        Self: Sized;

    /// Transform a raw leaf string before it is stored.
    fn transform_text(&mut self, text: &str) -> Rc<str> {
        Rc::from(text)
    }

    /// Apply a committed value sequence to a target.
    ///
    /// Called when the root (or a detached node carrying a target) commits
    /// with changes; `span` is the changed interval when known.
    fn arrange(
        &mut self,
        target: &Self::Target,
        values: &[ValueItem<Self::Value>],
        span: Option<DirtySpan>,
    );

    /// Detach a host value that is being removed from the tree.
    ///
    /// Only invoked for the values the host actually has to detach: a node
    /// removed underneath an already-released host value is not reported
    /// again.
    fn release(&mut self, tag: &Self::Tag, value: &Self::Value) {
        let _ = (tag, value);
    }
}

/// External event-propagation sink.
///
/// After every host commit the engine reports the node's newly aggregated
/// child values so the sink can route emitted events to the right subtree;
/// on unmount the record is cleared. The engine does not own event
/// dispatch.
pub trait EventRouter<H: HostSpec> {
    /// Record the current delegation targets under a host value.
    fn retarget(&mut self, host: &H::Value, children: &[ValueItem<H::Value>]);

    /// Drop the delegation record for a host value.
    fn clear(&mut self, host: &H::Value);
}

/// An [`EventRouter`] that routes nothing.
pub struct NoopRouter;

impl<H: HostSpec> EventRouter<H> for NoopRouter {
    fn retarget(&mut self, _host: &H::Value, _children: &[ValueItem<H::Value>]) {}

    fn clear(&mut self, _host: &H::Value) {}
}
