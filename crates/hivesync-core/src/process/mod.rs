//! Rollback-capable process trees.
//!
//! A tree is built from leaf [`Step`]s wrapped in [`StepComponent`] and
//! composed with [`SequentialProcess`]. When a child fails, every sibling
//! that already succeeded is rolled back in reverse order and the failure
//! travels up to the parent, which repeats the same protocol. Trees are
//! started through the [`ProcessManager`], which owns the context for the
//! duration of the run and returns it in the [`ProcessReport`].

mod component;
mod control;
mod listener;
mod manager;
mod result;
mod sequential;
mod state;

pub use component::{ProcessComponent, ProcessFailure, RollbackFailure, Step, StepComponent};
pub use control::{ProcessId, RunControl, RunSignal};
pub use listener::{ListenerId, ResultListeners};
pub use manager::{ProcessHandle, ProcessManager, ProcessReport};
pub use result::ResultProcess;
pub use sequential::SequentialProcess;
pub use state::ProcessState;
