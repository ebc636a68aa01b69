//! Error routing: boundary recovery, skipping non-accepting ancestors,
//! and unroutable failures.

mod common;

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

use common::{committed, renderer, TestHost};
use reweave::{
    Element, Flow, LogicCx, LogicSpawn, Procedure, Resumed, Routine, StepResult, TreeError,
};

/// A boundary routine: renders whatever `render` yields, and on a caught
/// descendant error falls back to a text description.
struct Guard {
    render: fn() -> Vec<reweave::Child<TestHost>>,
    caught: Rc<RefCell<Vec<String>>>,
}

impl Routine<TestHost> for Guard {
    fn resume(
        &mut self,
        cx: &mut LogicCx<'_, TestHost>,
        _input: Resumed<TestHost>,
    ) -> StepResult<TestHost> {
        cx.props();
        Ok(Flow::Yield((self.render)()))
    }

    fn catch(
        &mut self,
        _cx: &mut LogicCx<'_, TestHost>,
        error: Arc<anyhow::Error>,
    ) -> Option<StepResult<TestHost>> {
        self.caught.borrow_mut().push(error.to_string());
        Some(Ok(Flow::Yield(vec!["fallback".into()])))
    }
}

fn guard_spawn(
    render: fn() -> Vec<reweave::Child<TestHost>>,
    caught: Rc<RefCell<Vec<String>>>,
) -> LogicSpawn<TestHost> {
    LogicSpawn::new("guard", move || {
        Procedure::resumable(Guard {
            render,
            caught: caught.clone(),
        })
    })
}

#[test]
fn boundary_catches_a_descendant_producer_failure() {
    let (renderer, rec) = renderer();
    let caught = Rc::new(RefCell::new(Vec::new()));
    let spawn = guard_spawn(
        || {
            vec![Element::host("outer")
                .with_child(Element::host("boom_inner"))
                .into()]
        },
        caught.clone(),
    );

    let status = renderer
        .update("root", Some(vec![Element::logic(spawn).into()]))
        .unwrap();
    assert_eq!(committed(status), vec!["fallback"]);
    assert_eq!(caught.borrow().len(), 1);
    assert!(caught.borrow()[0].contains("boom_inner exploded"));

    let (_, values, _) = rec.last_arranged();
    assert_eq!(values, vec!["fallback"]);
    assert_eq!(rec.arrangements().len(), 1);
}

#[test]
fn routing_skips_non_accepting_ancestors() {
    let (renderer, _rec) = renderer();
    let caught = Rc::new(RefCell::new(Vec::new()));
    // An immediate logic node sits between the failing host and the
    // boundary; it cannot accept injected errors and is skipped.
    let middle = LogicSpawn::new("middle", || {
        Procedure::immediate(|_cx| Ok(vec![Element::host("boom_leaf").into()]))
    });
    let tree = vec![Element::logic(wrapper_spawn(middle, caught.clone())).into()];

    let status = renderer.update("root", Some(tree)).unwrap();
    assert_eq!(committed(status), vec!["fallback"]);
    assert_eq!(caught.borrow().len(), 1);
    assert!(caught.borrow()[0].contains("boom_leaf exploded"));
}

/// A boundary that renders the given logic spawn as its only child.
fn wrapper_spawn(
    middle: LogicSpawn<TestHost>,
    caught: Rc<RefCell<Vec<String>>>,
) -> LogicSpawn<TestHost> {
    LogicSpawn::new("wrapper", move || {
        Procedure::resumable(Wrapper {
            middle: middle.clone(),
            caught: caught.clone(),
        })
    })
}

struct Wrapper {
    middle: LogicSpawn<TestHost>,
    caught: Rc<RefCell<Vec<String>>>,
}

impl Routine<TestHost> for Wrapper {
    fn resume(
        &mut self,
        cx: &mut LogicCx<'_, TestHost>,
        _input: Resumed<TestHost>,
    ) -> StepResult<TestHost> {
        cx.props();
        Ok(Flow::Yield(vec![Element::logic(self.middle.clone()).into()]))
    }

    fn catch(
        &mut self,
        _cx: &mut LogicCx<'_, TestHost>,
        error: Arc<anyhow::Error>,
    ) -> Option<StepResult<TestHost>> {
        self.caught.borrow_mut().push(error.to_string());
        Some(Ok(Flow::Yield(vec!["fallback".into()])))
    }
}

#[test]
fn procedure_error_routes_to_the_boundary() {
    let (renderer, _rec) = renderer();
    let failing = LogicSpawn::new("failing", || {
        Procedure::immediate(|_cx| Err(anyhow::anyhow!("step blew up")))
    });
    let caught = Rc::new(RefCell::new(Vec::new()));
    let tree = vec![Element::logic(wrapper_spawn(failing, caught.clone())).into()];

    let status = renderer.update("root", Some(tree)).unwrap();
    assert_eq!(committed(status), vec!["fallback"]);
    assert!(caught.borrow()[0].contains("step blew up"));
}

#[test]
fn unroutable_producer_error_reaches_the_caller() {
    let (renderer, _rec) = renderer();
    let result = renderer.update("root", Some(vec![Element::host("boom_top").into()]));
    match result {
        Err(TreeError::Raised(err)) => assert!(err.to_string().contains("boom_top exploded")),
        other => panic!("expected a raised error, got ok={}", other.is_ok()),
    }
}

#[test]
fn unroutable_procedure_error_reaches_the_caller() {
    let (renderer, _rec) = renderer();
    let failing = LogicSpawn::new("failing", || {
        Procedure::immediate(|_cx| Err(anyhow::anyhow!("no boundary here")))
    });
    let result = renderer.update("root", Some(vec![Element::logic(failing).into()]));
    match result {
        Err(TreeError::Raised(err)) => assert!(err.to_string().contains("no boundary here")),
        other => panic!("expected a raised error, got ok={}", other.is_ok()),
    }
}

#[test]
fn raised_errors_downcast_to_the_source_type() {
    #[derive(Debug)]
    struct Custom(u32);

    impl std::fmt::Display for Custom {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "custom error {}", self.0)
        }
    }

    impl std::error::Error for Custom {}

    let (renderer, _rec) = renderer();
    let failing = LogicSpawn::new("failing", || {
        Procedure::immediate(|_cx| Err(anyhow::Error::new(Custom(7))))
    });
    let err = renderer
        .update("root", Some(vec![Element::logic(failing).into()]))
        .unwrap_err();
    assert!(err.is::<Custom>());
    assert_eq!(err.downcast_ref::<Custom>().unwrap().0, 7);
}
