#![warn(missing_docs)]
#![doc = include_str!("../README.md")]

mod commit;
mod deferred;
mod element;
mod error;
mod host;
mod node;
mod reconcile;
mod renderer;
mod routine;
mod schedule;

pub use deferred::{Deferred, Outcome, Resolver};
pub use element::{Child, Element, Key, LogicSpawn, PropValue, Props, RefHook, Tag};
pub use error::TreeError;
pub use host::{
    DirtySpan, EventRouter, HostInvoke, HostProducer, HostSpec, HostStep, HostYield, NoopRouter,
    TreeValues, ValueItem,
};
pub use renderer::{LogicHandle, Renderer, UpdateStatus};
pub use routine::{
    AsyncRoutine, DeferredFn, Finalize, Flow, ImmediateFn, Procedure, ProcedureKind, Resumed,
    Routine, StepResult,
};
pub use schedule::LogicCx;
