//! Task module - the task record, per-problem outputs and trace records.
//!
//! Everything here is plain data plus pure state checks; persistence lives in
//! [`crate::store`] and orchestration in [`crate::service`].

mod problem;
pub mod task;
mod trace;

pub use problem::{OptionItem, Problem, ProblemOverride, ProblemSummary, Solution, TaggingResult};
pub use task::{AssetRef, CropRegion, Task, TaskError, TaskHints, TaskStatus};
pub use trace::{CallKind, TraceEvent};
