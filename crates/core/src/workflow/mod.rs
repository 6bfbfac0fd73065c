// DAG-based workflow execution engine

pub mod dag;
pub mod executor;
pub mod handlers;
pub mod parser;
pub mod step_executor;


pub use dag::{EdgeKind, WorkflowDag};
pub use executor::WorkflowExecutor;
pub use parser::{parse, parse_str, ParsedWorkflow};
pub use step_executor::{
    AgentInvoker, AgentRequest, ApiInvoker, ApiRequest, DisabledApiInvoker, StepExecutor,
};
