//! Logic-node scheduling: the four procedure kinds, refresh, step
//! coalescing, provisions, and the props protocol.

mod common;

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use common::{committed, pending, renderer, show, TestHost};
use reweave::{
    Child, Deferred, Element, Flow, LogicCx, LogicHandle, LogicSpawn, Procedure, PropValue,
    Resolver, Resumed, Routine, StepResult, TreeError,
};

fn prop_text(props: &reweave::Props, name: &str) -> String {
    match props.get(name) {
        Some(PropValue::Text(text)) => text.to_string(),
        _ => String::new(),
    }
}

#[test]
fn immediate_logic_rerenders_on_new_props() {
    let (renderer, _rec) = renderer();
    let calls = Rc::new(Cell::new(0u32));
    let spawn = {
        let calls = calls.clone();
        LogicSpawn::new("greeter", move || {
            let calls = calls.clone();
            Procedure::immediate(move |cx| {
                calls.set(calls.get() + 1);
                let name = prop_text(&cx.props(), "name");
                Ok(vec![format!("hi {name}").into()])
            })
        })
    };
    let tree = |name: &'static str| {
        Some(vec![Element::logic(spawn.clone())
            .with_prop("name", name)
            .into()])
    };

    let status = renderer.update("root", tree("ada")).unwrap();
    assert_eq!(committed(status), vec!["hi ada"]);

    let status = renderer.update("root", tree("bob")).unwrap();
    assert_eq!(committed(status), vec!["hi bob"]);
    assert_eq!(calls.get(), 2);
}

struct Counter {
    n: u32,
    resumes: Rc<Cell<u32>>,
    handle_slot: Rc<RefCell<Option<LogicHandle<TestHost>>>>,
}

impl Routine<TestHost> for Counter {
    fn resume(
        &mut self,
        cx: &mut LogicCx<'_, TestHost>,
        _input: Resumed<TestHost>,
    ) -> StepResult<TestHost> {
        cx.props();
        self.resumes.set(self.resumes.get() + 1);
        *self.handle_slot.borrow_mut() = Some(cx.handle());
        let n = self.n;
        self.n += 1;
        Ok(Flow::Yield(vec![format!("c{n}").into()]))
    }
}

fn counter_spawn(
    resumes: Rc<Cell<u32>>,
    handle_slot: Rc<RefCell<Option<LogicHandle<TestHost>>>>,
) -> LogicSpawn<TestHost> {
    LogicSpawn::new("counter", move || {
        Procedure::resumable(Counter {
            n: 0,
            resumes: resumes.clone(),
            handle_slot: handle_slot.clone(),
        })
    })
}

#[test]
fn refresh_reruns_without_new_props() {
    let (renderer, rec) = renderer();
    let resumes = Rc::new(Cell::new(0u32));
    let handle_slot = Rc::new(RefCell::new(None));
    let spawn = counter_spawn(resumes.clone(), handle_slot.clone());

    let status = renderer
        .update("root", Some(vec![Element::logic(spawn).into()]))
        .unwrap();
    assert_eq!(committed(status), vec!["c0"]);

    let handle = handle_slot.borrow().clone().unwrap();
    let done = handle.refresh();
    assert_eq!(show(&done.peek().unwrap().unwrap()), vec!["c1"]);
    assert_eq!(resumes.get(), 2);

    let (_, values, _) = rec.last_arranged();
    assert_eq!(values, vec!["c1"]);
}

#[test]
fn handle_reports_liveness() {
    let (renderer, _rec) = renderer();
    let handle_slot = Rc::new(RefCell::new(None));
    let spawn = counter_spawn(Rc::new(Cell::new(0)), handle_slot.clone());

    renderer
        .update("root", Some(vec![Element::logic(spawn).into()]))
        .unwrap();
    let handle = handle_slot.borrow().clone().unwrap();
    assert!(handle.is_live());

    renderer.update("root", Some(vec!["plain".into()])).unwrap();
    assert!(!handle.is_live());
    assert!(matches!(
        handle.refresh().peek(),
        Some(Err(TreeError::Unmounted))
    ));
}

#[test]
fn refresh_after_renderer_drop_is_rejected() {
    let (renderer, _rec) = renderer();
    let handle_slot = Rc::new(RefCell::new(None));
    let spawn = counter_spawn(Rc::new(Cell::new(0)), handle_slot.clone());
    renderer
        .update("root", Some(vec![Element::logic(spawn).into()]))
        .unwrap();
    let handle = handle_slot.borrow().clone().unwrap();

    drop(renderer);
    assert!(matches!(
        handle.refresh().peek(),
        Some(Err(TreeError::RendererGone))
    ));
}

#[test]
fn overlapping_requests_coalesce_into_one_enqueued_step() {
    let (renderer, _rec) = renderer();
    let calls = Rc::new(Cell::new(0u32));
    let slots: Rc<RefCell<Vec<Resolver<Vec<Child<TestHost>>>>>> =
        Rc::new(RefCell::new(Vec::new()));
    let handle_slot: Rc<RefCell<Option<LogicHandle<TestHost>>>> = Rc::new(RefCell::new(None));
    let spawn = {
        let calls = calls.clone();
        let slots = slots.clone();
        let handle_slot = handle_slot.clone();
        LogicSpawn::new("loader", move || {
            let calls = calls.clone();
            let slots = slots.clone();
            let handle_slot = handle_slot.clone();
            Procedure::deferred(move |cx| {
                calls.set(calls.get() + 1);
                *handle_slot.borrow_mut() = Some(cx.handle());
                let (deferred, resolver) = Deferred::new();
                slots.borrow_mut().push(resolver);
                Ok(deferred)
            })
        })
    };

    let root = pending(
        renderer
            .update("root", Some(vec![Element::logic(spawn).into()]))
            .unwrap(),
    );
    assert_eq!(calls.get(), 1);

    // Three requests while the first step is in flight share one
    // coalesced follow-up step.
    let handle = handle_slot.borrow().clone().unwrap();
    let first = handle.refresh();
    let second = handle.refresh();
    let third = handle.refresh();
    assert_eq!(calls.get(), 1);

    let resolver = slots.borrow_mut().remove(0);
    resolver.resolve(vec!["v1".into()]);
    assert_eq!(calls.get(), 2);
    assert!(!first.is_settled());

    let resolver = slots.borrow_mut().remove(0);
    resolver.resolve(vec!["v2".into()]);
    assert_eq!(calls.get(), 2);

    for waiter in [&first, &second, &third] {
        assert_eq!(show(&waiter.peek().unwrap().unwrap()), vec!["v2"]);
    }
    assert_eq!(show(&root.peek().unwrap().unwrap()), vec!["v2"]);
}

struct Feed {
    resumes: Rc<Cell<u32>>,
    seen: Rc<RefCell<Vec<String>>>,
    slots: Rc<RefCell<Vec<Resolver<Flow<TestHost>>>>>,
}

impl reweave::AsyncRoutine<TestHost> for Feed {
    fn resume(
        &mut self,
        cx: &mut LogicCx<'_, TestHost>,
        _input: Resumed<TestHost>,
    ) -> Deferred<Flow<TestHost>> {
        let msg = prop_text(&cx.props(), "msg");
        self.resumes.set(self.resumes.get() + 1);
        self.seen.borrow_mut().push(msg);
        let (deferred, resolver) = Deferred::new();
        self.slots.borrow_mut().push(resolver);
        deferred
    }
}

#[test]
fn resumable_deferred_coalesces_overlapping_updates() {
    let (renderer, rec) = renderer();
    let resumes = Rc::new(Cell::new(0u32));
    let seen = Rc::new(RefCell::new(Vec::new()));
    let slots: Rc<RefCell<Vec<Resolver<Flow<TestHost>>>>> = Rc::new(RefCell::new(Vec::new()));
    let spawn = {
        let resumes = resumes.clone();
        let seen = seen.clone();
        let slots = slots.clone();
        LogicSpawn::new("feed", move || {
            Procedure::resumable_deferred(Feed {
                resumes: resumes.clone(),
                seen: seen.clone(),
                slots: slots.clone(),
            })
        })
    };
    let tree = |msg: &'static str| {
        Some(vec![Element::logic(spawn.clone())
            .with_prop("msg", msg)
            .into()])
    };

    let first = pending(renderer.update("root", tree("one")).unwrap());
    let second = pending(renderer.update("root", tree("two")).unwrap());
    let third = pending(renderer.update("root", tree("three")).unwrap());
    // No re-entrant resumption while one is outstanding.
    assert_eq!(resumes.get(), 1);

    let resolver = slots.borrow_mut().remove(0);
    resolver.resolve(Flow::Yield(vec!["got one".into()]));

    // The single coalesced resumption sees only the latest props.
    assert_eq!(resumes.get(), 2);
    assert_eq!(&*seen.borrow(), &["one", "three"]);

    let resolver = slots.borrow_mut().remove(0);
    resolver.resolve(Flow::Yield(vec!["got three".into()]));

    for waiter in [&first, &second, &third] {
        assert_eq!(show(&waiter.peek().unwrap().unwrap()), vec!["got three"]);
    }
    let (_, values, _) = rec.last_arranged();
    assert_eq!(values, vec!["got three"]);
    assert_eq!(rec.arrangements().len(), 1);
}

struct Finisher {
    resumes: Rc<Cell<u32>>,
}

impl Routine<TestHost> for Finisher {
    fn resume(
        &mut self,
        cx: &mut LogicCx<'_, TestHost>,
        _input: Resumed<TestHost>,
    ) -> StepResult<TestHost> {
        cx.props();
        self.resumes.set(self.resumes.get() + 1);
        Ok(Flow::Return(Some(vec!["done".into()])))
    }
}

#[test]
fn finished_routine_never_steps_again() {
    let (renderer, _rec) = renderer();
    let resumes = Rc::new(Cell::new(0u32));
    let spawn = {
        let resumes = resumes.clone();
        LogicSpawn::new("finisher", move || {
            Procedure::resumable(Finisher {
                resumes: resumes.clone(),
            })
        })
    };
    let tree = |n: i64| Some(vec![Element::logic(spawn.clone()).with_prop("n", n).into()]);

    let status = renderer.update("root", tree(1)).unwrap();
    assert_eq!(committed(status), vec!["done"]);

    let status = renderer.update("root", tree(2)).unwrap();
    assert_eq!(committed(status), vec!["done"]);
    assert_eq!(resumes.get(), 1);
}

struct Provider;

impl Routine<TestHost> for Provider {
    fn resume(
        &mut self,
        cx: &mut LogicCx<'_, TestHost>,
        _input: Resumed<TestHost>,
    ) -> StepResult<TestHost> {
        cx.props();
        cx.provide("theme", String::from("dark"));
        let reader = Element::logic(reader_spawn());
        Ok(Flow::Yield(vec![Element::group().with_child(reader).into()]))
    }
}

fn reader_spawn() -> LogicSpawn<TestHost> {
    LogicSpawn::new("reader", || {
        Procedure::immediate(|cx| {
            let theme = cx
                .provision::<String>("theme")
                .map(|theme| (*theme).clone())
                .unwrap_or_default();
            Ok(vec![format!("theme={theme}").into()])
        })
    })
}

#[test]
fn provisions_reach_descendants_through_non_logic_nodes() {
    let (renderer, _rec) = renderer();
    let spawn = LogicSpawn::new("provider", || Procedure::resumable(Provider));

    let status = renderer
        .update("root", Some(vec![Element::logic(spawn).into()]))
        .unwrap();
    assert_eq!(committed(status), vec!["theme=dark"]);

    // With no providing ancestor the lookup comes back empty.
    let status = renderer
        .update("other", Some(vec![Element::logic(reader_spawn()).into()]))
        .unwrap();
    assert_eq!(committed(status), vec!["theme="]);
}

struct DoubleTake;

impl Routine<TestHost> for DoubleTake {
    fn resume(
        &mut self,
        cx: &mut LogicCx<'_, TestHost>,
        _input: Resumed<TestHost>,
    ) -> StepResult<TestHost> {
        cx.props();
        cx.props();
        Ok(Flow::Yield(vec![]))
    }
}

#[test]
#[should_panic(expected = "props consumed twice")]
fn double_props_take_panics() {
    let (renderer, _rec) = renderer();
    let spawn = LogicSpawn::new("greedy", || Procedure::resumable(DoubleTake));
    let _ = renderer.update("root", Some(vec![Element::logic(spawn).into()]));
}

struct NoTake;

impl Routine<TestHost> for NoTake {
    fn resume(
        &mut self,
        _cx: &mut LogicCx<'_, TestHost>,
        _input: Resumed<TestHost>,
    ) -> StepResult<TestHost> {
        Ok(Flow::Yield(vec!["x".into()]))
    }
}

#[test]
#[should_panic(expected = "yielded without consuming props")]
fn yield_without_taking_props_panics() {
    let (renderer, _rec) = renderer();
    let spawn = LogicSpawn::new("sloppy", || Procedure::resumable(NoTake));
    let _ = renderer.update("root", Some(vec![Element::logic(spawn).into()]));
}
