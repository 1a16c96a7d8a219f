//! The execution engine: takes a claimed run and its registered function,
//! replays step history through the step cache, and persists exactly one
//! terminal or suspending transition per pass.
//!
//! ```text
//!                 ┌──────────────┐
//!   claimed run -> │ load history │
//!                 └──────┬───────┘
//!                        v
//!                ┌───────────────┐
//!                │ advance sleeps│
//!                └───────┬───────┘
//!                        v
//!                ┌───────────────┐      Ok(output)      complete_workflow_run
//!                │ invoke fn     │ ───────────────────> sleep/reschedule/fail
//!                └───────────────┘  Err(WorkflowControl)
//! ```

mod executor;
mod step;

pub use executor::{execute_pass, BoxFuture, EngineError, WorkflowContext, WorkflowFn};
pub use step::{Step, StepConfig, WorkflowControl};
