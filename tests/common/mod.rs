//! Shared mock host for the integration tests.
//!
//! `TestHost` renders every host node to a string of the form
//! `tag(child,child,...)` and logs everything the engine asks of it into a
//! [`Recorder`] the test keeps a clone of. Two tag conventions drive the
//! special paths: a tag starting with `boom` fails on every invocation, and
//! a tag starting with `step` switches the node to a pull-per-commit step
//! source.

#![allow(dead_code)]

use std::cell::RefCell;
use std::rc::Rc;

use reweave::{
    DirtySpan, EventRouter, HostInvoke, HostProducer, HostSpec, HostStep, HostYield, Renderer,
    TreeValues, UpdateStatus, ValueItem,
};

#[derive(Default)]
struct Stats {
    log: Vec<String>,
    arranged: Vec<(&'static str, Vec<String>, Option<DirtySpan>)>,
}

/// A handle on the host's event log, shared between a test and its host.
#[derive(Clone, Default)]
pub struct Recorder {
    stats: Rc<RefCell<Stats>>,
}

impl Recorder {
    pub fn push(&self, entry: impl Into<String>) {
        self.stats.borrow_mut().log.push(entry.into());
    }

    /// The full event log, in order.
    pub fn log(&self) -> Vec<String> {
        self.stats.borrow().log.clone()
    }

    pub fn count(&self, entry: &str) -> usize {
        self.stats.borrow().log.iter().filter(|e| *e == entry).count()
    }

    /// How many times the producer for `tag` was fetched (once per node).
    pub fn produced(&self, tag: &str) -> usize {
        self.count(&format!("produce:{tag}"))
    }

    /// How many times the producer for `tag` was invoked (once per commit).
    pub fn invoked(&self, tag: &str) -> usize {
        self.count(&format!("invoke:{tag}"))
    }

    pub fn released(&self, tag: &str) -> usize {
        self.count(&format!("release:{tag}"))
    }

    pub fn arrangements(&self) -> Vec<(&'static str, Vec<String>, Option<DirtySpan>)> {
        self.stats.borrow().arranged.clone()
    }

    pub fn last_arranged(&self) -> (&'static str, Vec<String>, Option<DirtySpan>) {
        self.stats
            .borrow()
            .arranged
            .last()
            .cloned()
            .expect("nothing arranged yet")
    }
}

/// The string-rendering host all integration tests share.
pub struct TestHost {
    recorder: Recorder,
    upcase: bool,
}

impl TestHost {
    pub fn new() -> (TestHost, Recorder) {
        let recorder = Recorder::default();
        (
            TestHost {
                recorder: recorder.clone(),
                upcase: false,
            },
            recorder,
        )
    }

    /// A host whose text transform uppercases every leaf.
    pub fn upcasing() -> (TestHost, Recorder) {
        let (mut host, recorder) = TestHost::new();
        host.upcase = true;
        (host, recorder)
    }
}

/// A renderer over a fresh [`TestHost`] plus the host's recorder.
pub fn renderer() -> (Renderer<TestHost>, Recorder) {
    let (host, recorder) = TestHost::new();
    (Renderer::new(host), recorder)
}

/// Flatten a value sequence to plain strings for assertions.
pub fn show(values: &[ValueItem<String>]) -> Vec<String> {
    values
        .iter()
        .map(|item| match item {
            ValueItem::Text(text) => text.to_string(),
            ValueItem::Node(value) => value.clone(),
        })
        .collect()
}

/// Unwrap a synchronously committed update.
pub fn committed(status: UpdateStatus<String>) -> Vec<String> {
    match status {
        UpdateStatus::Committed(values) => show(&values),
        UpdateStatus::Pending(_) => panic!("expected a synchronous commit"),
    }
}

/// Unwrap a pending update.
pub fn pending(status: UpdateStatus<String>) -> reweave::Deferred<TreeValues<String>> {
    match status {
        UpdateStatus::Pending(deferred) => deferred,
        UpdateStatus::Committed(values) => {
            panic!("expected a pending update, got {:?}", show(&values))
        }
    }
}

struct PullStep {
    tag: &'static str,
    recorder: Recorder,
    pulls: u32,
}

impl HostStep<TestHost> for PullStep {
    fn pull(&mut self, invoke: HostInvoke<'_, TestHost>) -> Result<String, anyhow::Error> {
        self.pulls += 1;
        self.recorder.push(format!("pull:{}", self.tag));
        Ok(format!(
            "{}#{}({})",
            self.tag,
            self.pulls,
            show(invoke.children).join(",")
        ))
    }

    fn finalize(&mut self) {
        self.recorder.push(format!("finalize:{}", self.tag));
    }
}

impl HostSpec for TestHost {
    type Tag = &'static str;
    type Value = String;
    type Target = &'static str;

    fn producer(&mut self, tag: &Self::Tag) -> HostProducer<Self> {
        self.recorder.push(format!("produce:{tag}"));
        let recorder = self.recorder.clone();
        let tag = *tag;
        Box::new(move |invoke: HostInvoke<'_, TestHost>| {
            recorder.push(format!("invoke:{tag}"));
            if tag.starts_with("boom") {
                return Err(anyhow::anyhow!("{tag} exploded"));
            }
            if tag.starts_with("step") {
                return Ok(HostYield::Step(Box::new(PullStep {
                    tag,
                    recorder: recorder.clone(),
                    pulls: 0,
                })));
            }
            Ok(HostYield::Value(format!(
                "{}({})",
                tag,
                show(invoke.children).join(",")
            )))
        })
    }

    fn transform_text(&mut self, text: &str) -> Rc<str> {
        if self.upcase {
            Rc::from(text.to_uppercase().as_str())
        } else {
            Rc::from(text)
        }
    }

    fn arrange(
        &mut self,
        target: &Self::Target,
        values: &[ValueItem<String>],
        span: Option<DirtySpan>,
    ) {
        self.recorder.push(format!("arrange:{target}"));
        self.recorder
            .stats
            .borrow_mut()
            .arranged
            .push((target, show(values), span));
    }

    fn release(&mut self, tag: &Self::Tag, _value: &String) {
        self.recorder.push(format!("release:{tag}"));
    }
}

/// An [`EventRouter`] that logs retarget/clear calls into the recorder.
pub struct LoggingRouter {
    pub recorder: Recorder,
}

impl EventRouter<TestHost> for LoggingRouter {
    fn retarget(&mut self, host: &String, children: &[ValueItem<String>]) {
        self.recorder
            .push(format!("retarget:{host}<-[{}]", show(children).join(",")));
    }

    fn clear(&mut self, host: &String) {
        self.recorder.push(format!("clear:{host}"));
    }
}
