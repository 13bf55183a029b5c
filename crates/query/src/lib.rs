//! The query layer: dataflow programs and the admission-controlled
//! controller that runs them.
//!
//! Architecture role:
//! - [`program`] defines the compiled-program seam and the JSON read-spec
//!   program format
//! - [`controller`] admits, queues, budgets, runs, and cancels queries,
//!   enforcing per-query and process-wide memory ceilings through the
//!   shared memory pool

/// Admission, queueing, budgets, cancellation.
pub mod controller;
/// Programs and program resolution.
pub mod program;

pub use controller::{Controller, Query, QueryResults, QueryState};
pub use program::{
    JsonProgramResolver, Program, ProgramContext, ProgramOutput, ProgramResolver, ReadProgram,
};
