//! Tasks: descriptors, registry, creation, and orchestration
//!
//! A [`Task`] is the immutable product of parsing one script. The
//! [`Registry`] holds tasks by unique ID alongside their latest execution
//! results. [`TaskCreator`] joins a source provider with engines, and
//! [`TaskRunner`] drives creators and registers what they produce, emitting
//! registration events along the way.

mod creator;
mod events;
mod registry;
mod runner;
mod task;

pub use creator::TaskCreator;
pub use events::{
    default_task_id_provider, ErrorHandler, TaskEvent, TaskEventEmitter, TaskEventHandler,
    TaskEventKind, TaskIdProvider, TaskIdProviderAware,
};
pub use registry::{MemoryRegistry, Registry};
pub use runner::TaskRunner;
pub use task::Task;
