//! Element descriptions: the input language of the reconciler.
//!
//! An [`Element`] describes one position in the desired tree: a tag, an
//! optional identity key, props, and children. Descriptions are inert
//! values; nothing happens until they are handed to
//! [`Renderer::update`](crate::Renderer::update) or yielded by a logic
//! procedure.

use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

use crate::host::{HostSpec, ValueItem};
use crate::routine::Procedure;

/// Explicit identity for a child, overriding positional matching during
/// reconciliation.
///
/// Keys are compared among siblings only; a key duplicated within one
/// update is silently treated as unkeyed for the later occurrence.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct Key(Rc<str>);

impl Key {
    /// Create a key from anything string-like.
    pub fn new(key: impl Into<Rc<str>>) -> Self {
        Key(key.into())
    }

    /// The key text.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Key {
    fn from(key: &str) -> Self {
        Key(Rc::from(key))
    }
}

impl From<String> for Key {
    fn from(key: String) -> Self {
        Key(Rc::from(key.as_str()))
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A single prop value.
#[derive(Clone, Debug, PartialEq)]
pub enum PropValue {
    /// Boolean prop.
    Bool(bool),
    /// Integer prop.
    Int(i64),
    /// Floating-point prop.
    Float(f64),
    /// Text prop.
    Text(Rc<str>),
}

impl From<bool> for PropValue {
    fn from(v: bool) -> Self {
        PropValue::Bool(v)
    }
}

impl From<i64> for PropValue {
    fn from(v: i64) -> Self {
        PropValue::Int(v)
    }
}

impl From<f64> for PropValue {
    fn from(v: f64) -> Self {
        PropValue::Float(v)
    }
}

impl From<&str> for PropValue {
    fn from(v: &str) -> Self {
        PropValue::Text(Rc::from(v))
    }
}

impl From<String> for PropValue {
    fn from(v: String) -> Self {
        PropValue::Text(Rc::from(v.as_str()))
    }
}

/// An ordered prop map.
///
/// Props compare structurally; an in-place node update whose props compare
/// equal does not mark the node for re-commit.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct Props {
    entries: BTreeMap<Rc<str>, PropValue>,
}

impl Props {
    /// Create an empty prop map.
    pub fn new() -> Self {
        Props::default()
    }

    /// Set a prop, replacing any previous value under the same name.
    pub fn set(&mut self, name: impl Into<Rc<str>>, value: impl Into<PropValue>) {
        self.entries.insert(name.into(), value.into());
    }

    /// Builder-style [`Props::set`].
    pub fn with(mut self, name: impl Into<Rc<str>>, value: impl Into<PropValue>) -> Self {
        self.set(name, value);
        self
    }

    /// Look up a prop by name.
    pub fn get(&self, name: &str) -> Option<&PropValue> {
        self.entries.get(name)
    }

    /// Returns `true` when no props are set.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate over the props in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &PropValue)> {
        self.entries.iter().map(|(k, v)| (&**k, v))
    }
}

/// A factory for logic-node procedures.
///
/// The factory, not the procedure instance, is the structural identity of a
/// logic element: two elements made from the same (cloned) `LogicSpawn`
/// reconcile in place, while a different factory forces a replacement.
pub struct LogicSpawn<H: HostSpec> {
    name: Rc<str>,
    make: Rc<dyn Fn() -> Procedure<H>>,
}

impl<H: HostSpec> LogicSpawn<H> {
    /// Create a factory with a diagnostic name.
    pub fn new(name: impl Into<Rc<str>>, make: impl Fn() -> Procedure<H> + 'static) -> Self {
        LogicSpawn {
            name: name.into(),
            make: Rc::new(make),
        }
    }

    /// The diagnostic name.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn instantiate(&self) -> Procedure<H> {
        (self.make)()
    }

    pub(crate) fn same(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.make, &other.make)
    }
}

impl<H: HostSpec> Clone for LogicSpawn<H> {
    fn clone(&self) -> Self {
        LogicSpawn {
            name: self.name.clone(),
            make: self.make.clone(),
        }
    }
}

impl<H: HostSpec> fmt::Debug for LogicSpawn<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LogicSpawn({})", self.name)
    }
}

/// The tag of an element: what kind of node it describes.
pub enum Tag<H: HostSpec> {
    /// An externally-defined renderable tag.
    Host(H::Tag),
    /// A transparent container whose children are spliced into the
    /// parent's value sequence.
    Group,
    /// Reuse the existing node at this identity unchanged, skipping its
    /// subtree entirely. With no matching existing node it renders
    /// nothing.
    Copy,
    /// A boundary that commits its subtree but contributes no value to its
    /// parent; optionally carries its own target to arrange into.
    Detached,
    /// A stateful logic procedure.
    Logic(LogicSpawn<H>),
}

impl<H: HostSpec> Tag<H> {
    /// Structural identity across updates: same kind, and for host tags
    /// and logic factories, the same tag value or factory.
    pub(crate) fn matches(&self, other: &Tag<H>) -> bool {
        match (self, other) {
            (Tag::Host(a), Tag::Host(b)) => a == b,
            (Tag::Group, Tag::Group) => true,
            (Tag::Detached, Tag::Detached) => true,
            (Tag::Logic(a), Tag::Logic(b)) => a.same(b),
            _ => false,
        }
    }
}

impl<H: HostSpec> Clone for Tag<H> {
    fn clone(&self) -> Self {
        match self {
            Tag::Host(t) => Tag::Host(t.clone()),
            Tag::Group => Tag::Group,
            Tag::Copy => Tag::Copy,
            Tag::Detached => Tag::Detached,
            Tag::Logic(s) => Tag::Logic(s.clone()),
        }
    }
}

impl<H: HostSpec> fmt::Debug for Tag<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tag::Host(t) => write!(f, "Host({:?})", t),
            Tag::Group => write!(f, "Group"),
            Tag::Copy => write!(f, "Copy"),
            Tag::Detached => write!(f, "Detached"),
            Tag::Logic(s) => write!(f, "{:?}", s),
        }
    }
}

/// A callback invoked with a node's committed value sequence the first
/// time it settles.
pub type RefHook<H> = Rc<dyn Fn(&[ValueItem<<H as HostSpec>::Value>])>;

/// One position in a desired tree.
pub struct Element<H: HostSpec> {
    pub(crate) tag: Tag<H>,
    pub(crate) key: Option<Key>,
    pub(crate) props: Props,
    pub(crate) children: Rc<Vec<Child<H>>>,
    pub(crate) target: Option<H::Target>,
    pub(crate) ref_hook: Option<RefHook<H>>,
}

impl<H: HostSpec> Element<H> {
    fn with_tag(tag: Tag<H>) -> Self {
        Element {
            tag,
            key: None,
            props: Props::new(),
            children: Rc::new(Vec::new()),
            target: None,
            ref_hook: None,
        }
    }

    /// Describe a host node.
    pub fn host(tag: H::Tag) -> Self {
        Element::with_tag(Tag::Host(tag))
    }

    /// Describe a grouping fragment.
    pub fn group() -> Self {
        Element::with_tag(Tag::Group)
    }

    /// Describe a reuse-unchanged sentinel.
    pub fn copy() -> Self {
        Element::with_tag(Tag::Copy)
    }

    /// Describe a detached boundary, optionally arranging into `target`.
    pub fn detached(target: Option<H::Target>) -> Self {
        let mut el = Element::with_tag(Tag::Detached);
        el.target = target;
        el
    }

    /// Describe a logic node.
    pub fn logic(spawn: LogicSpawn<H>) -> Self {
        Element::with_tag(Tag::Logic(spawn))
    }

    /// Attach an identity key.
    pub fn with_key(mut self, key: impl Into<Key>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Replace the props wholesale.
    pub fn with_props(mut self, props: Props) -> Self {
        self.props = props;
        self
    }

    /// Set a single prop.
    pub fn with_prop(mut self, name: impl Into<Rc<str>>, value: impl Into<PropValue>) -> Self {
        self.props.set(name, value);
        self
    }

    /// Replace the children wholesale.
    pub fn with_children(mut self, children: Vec<Child<H>>) -> Self {
        self.children = Rc::new(children);
        self
    }

    /// Append one child.
    pub fn with_child(mut self, child: impl Into<Child<H>>) -> Self {
        Rc::make_mut(&mut self.children).push(child.into());
        self
    }

    /// Attach a callback invoked with the node's committed value sequence
    /// the first time it settles.
    pub fn with_ref(mut self, hook: impl Fn(&[ValueItem<H::Value>]) + 'static) -> Self {
        self.ref_hook = Some(Rc::new(hook));
        self
    }

    /// The element's key, if any.
    pub fn key(&self) -> Option<&Key> {
        self.key.as_ref()
    }
}

impl<H: HostSpec> Clone for Element<H> {
    fn clone(&self) -> Self {
        Element {
            tag: self.tag.clone(),
            key: self.key.clone(),
            props: self.props.clone(),
            children: self.children.clone(),
            target: self.target.clone(),
            ref_hook: self.ref_hook.clone(),
        }
    }
}

impl<H: HostSpec> fmt::Debug for Element<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Element")
            .field("tag", &self.tag)
            .field("key", &self.key)
            .field("children", &self.children.len())
            .finish()
    }
}

/// One entry in a child description sequence.
pub enum Child<H: HostSpec> {
    /// A nested element.
    Element(Element<H>),
    /// A text leaf.
    Text(Rc<str>),
    /// Renders nothing, but still occupies an alignment position: whatever
    /// node previously lived at this position is unmounted.
    Absent,
    /// A nested sequence, flattened into the parent's sequence one level
    /// at a time.
    Many(Vec<Child<H>>),
}

impl<H: HostSpec> Clone for Child<H> {
    fn clone(&self) -> Self {
        match self {
            Child::Element(e) => Child::Element(e.clone()),
            Child::Text(t) => Child::Text(t.clone()),
            Child::Absent => Child::Absent,
            Child::Many(v) => Child::Many(v.clone()),
        }
    }
}

impl<H: HostSpec> From<Element<H>> for Child<H> {
    fn from(el: Element<H>) -> Self {
        Child::Element(el)
    }
}

impl<H: HostSpec> From<&str> for Child<H> {
    fn from(text: &str) -> Self {
        Child::Text(Rc::from(text))
    }
}

impl<H: HostSpec> From<String> for Child<H> {
    fn from(text: String) -> Self {
        Child::Text(Rc::from(text.as_str()))
    }
}

// Booleans render nothing, matching the convention that `cond && child`
// style constructions drop the child when the condition is false.
impl<H: HostSpec> From<bool> for Child<H> {
    fn from(_: bool) -> Self {
        Child::Absent
    }
}

impl<H: HostSpec> From<i64> for Child<H> {
    fn from(n: i64) -> Self {
        Child::Text(Rc::from(n.to_string().as_str()))
    }
}

impl<H: HostSpec> From<f64> for Child<H> {
    fn from(n: f64) -> Self {
        Child::Text(Rc::from(n.to_string().as_str()))
    }
}

impl<H: HostSpec, T: Into<Child<H>>> From<Option<T>> for Child<H> {
    fn from(value: Option<T>) -> Self {
        match value {
            Some(v) => v.into(),
            None => Child::Absent,
        }
    }
}

impl<H: HostSpec> From<Vec<Child<H>>> for Child<H> {
    fn from(children: Vec<Child<H>>) -> Self {
        Child::Many(children)
    }
}

/// A borrowed, fully flattened child item.
pub(crate) enum FlatChild<'a, H: HostSpec> {
    Element(&'a Element<H>),
    Text(&'a Rc<str>),
    Absent,
}

/// Normalize nested child sequences into a flat item list.
pub(crate) fn flatten<'a, H: HostSpec>(
    children: &'a [Child<H>],
    out: &mut Vec<FlatChild<'a, H>>,
) {
    for child in children {
        match child {
            Child::Element(el) => out.push(FlatChild::Element(el)),
            Child::Text(text) => out.push(FlatChild::Text(text)),
            Child::Absent => out.push(FlatChild::Absent),
            Child::Many(nested) => flatten(nested, out),
        }
    }
}
