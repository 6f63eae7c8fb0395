pub mod completion;
pub mod context;
pub mod driver;
pub mod durable;
pub mod error;
mod incoming;
pub mod journal;
pub mod machine;
pub mod options;
pub mod registry;

pub use context::{
    CallFuture, Context, InvocationHandle, ObjectContext, SharedObjectContext,
    SharedWorkflowContext, WorkflowContext,
};
pub use driver::InvocationDriver;
pub use durable::{DurableFuture, all, race, wait_each};
pub use error::Error;
pub use machine::{
    InvocationInput, Lifecycle, RunContext, StartInfo, StateMachine, encode_awakeable_id,
};
pub use options::EngineOptions;
pub use registry::{
    Endpoint, EndpointBuilder, HandlerShape, Service, ServiceDefinition, VirtualObject, Workflow,
};
