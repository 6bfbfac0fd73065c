// Specialized step types dispatched by the executor

pub mod loop_step;
pub mod merge;
pub mod sub_workflow;
