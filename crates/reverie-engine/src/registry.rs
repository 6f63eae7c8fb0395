use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use serde::Serialize;
use serde::de::DeserializeOwned;

use reverie_types::manifest::{
    HandlerManifest, HandlerType, InputPayload, Manifest, OutputPayload, ProtocolMode,
    ServiceManifest, ServiceType,
};
use reverie_types::{Json, PayloadCodec};

use crate::context::{
    Context, ObjectContext, SharedObjectContext, SharedWorkflowContext, WorkflowContext,
};
use crate::error::Error;
use crate::machine::StateMachine;

/// Which façade a handler receives and how it is advertised.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandlerShape {
    Stateless,
    Shared,
    Exclusive,
    Workflow,
    SharedWorkflow,
}

impl HandlerShape {
    fn manifest_ty(self) -> Option<HandlerType> {
        match self {
            Self::Stateless => None,
            Self::Shared | Self::SharedWorkflow => Some(HandlerType::Shared),
            Self::Exclusive => Some(HandlerType::Exclusive),
            Self::Workflow => Some(HandlerType::Workflow),
        }
    }
}

/// Type-erased handler entrypoint; the wrapper knows which façade to
/// construct.
#[async_trait]
pub trait ErasedHandler: Send + Sync {
    async fn invoke(&self, machine: Arc<StateMachine>, input: Bytes) -> Result<Bytes, Error>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F> ErasedHandler for FnHandler<F>
where
    F: Fn(Arc<StateMachine>, Bytes) -> BoxFuture<'static, Result<Bytes, Error>> + Send + Sync,
{
    async fn invoke(&self, machine: Arc<StateMachine>, input: Bytes) -> Result<Bytes, Error> {
        (self.0)(machine, input).await
    }
}

/// One registered handler: shape, content types, and the erased
/// entrypoint.
#[derive(Clone)]
pub struct HandlerDescriptor {
    pub name: String,
    pub shape: HandlerShape,
    pub input_content_type: String,
    pub output_content_type: String,
    handler: Arc<dyn ErasedHandler>,
}

impl HandlerDescriptor {
    fn new<F>(name: &str, shape: HandlerShape, raw: F) -> Self
    where
        F: Fn(Arc<StateMachine>, Bytes) -> BoxFuture<'static, Result<Bytes, Error>>
            + Send
            + Sync
            + 'static,
    {
        Self {
            name: name.to_owned(),
            shape,
            input_content_type: Json.content_type().to_owned(),
            output_content_type: Json.content_type().to_owned(),
            handler: Arc::new(FnHandler(raw)),
        }
    }

    pub async fn invoke(&self, machine: Arc<StateMachine>, input: Bytes) -> Result<Bytes, Error> {
        self.handler.invoke(machine, input).await
    }

    fn manifest(&self) -> HandlerManifest {
        HandlerManifest {
            ty: self.shape.manifest_ty(),
            input: Some(InputPayload {
                required: Some(false),
                content_type: Some(self.input_content_type.clone()),
            }),
            output: Some(OutputPayload {
                set_content_type_if_empty: false,
                content_type: Some(self.output_content_type.clone()),
            }),
            ..HandlerManifest::new(self.name.clone())
        }
    }
}

/// A named set of handlers with the service kind that scopes them.
#[derive(Clone)]
pub struct ServiceDefinition {
    pub name: String,
    pub ty: ServiceType,
    pub handlers: Vec<HandlerDescriptor>,
}

macro_rules! erase_handler {
    ($f:ident, $ctx:ty, $make_ctx:expr) => {{
        move |machine: Arc<StateMachine>,
              input: Bytes|
              -> BoxFuture<'static, Result<Bytes, Error>> {
            let f = $f.clone();
            Box::pin(async move {
                let request = Json.decode(&input)?;
                #[allow(clippy::redundant_closure_call)]
                let ctx: $ctx = ($make_ctx)(machine);
                let response = f(ctx, request).await?;
                Ok(Json.encode(&response)?)
            })
        }
    }};
}

/// Builder for a stateless service.
pub struct Service {
    name: String,
    handlers: Vec<HandlerDescriptor>,
}

impl Service {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            handlers: Vec::new(),
        }
    }

    pub fn handler<Req, Res, F, Fut>(mut self, name: &str, f: F) -> Self
    where
        Req: DeserializeOwned + Send + 'static,
        Res: Serialize + Send + 'static,
        F: Fn(Context, Req) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = Result<Res, Error>> + Send + 'static,
    {
        let raw = erase_handler!(f, Context, |machine| Context::new(machine, Json));
        self.handlers
            .push(HandlerDescriptor::new(name, HandlerShape::Stateless, raw));
        self
    }
}

impl From<Service> for ServiceDefinition {
    fn from(service: Service) -> Self {
        Self {
            name: service.name,
            ty: ServiceType::Service,
            handlers: service.handlers,
        }
    }
}

/// Builder for a keyed virtual object.
pub struct VirtualObject {
    name: String,
    handlers: Vec<HandlerDescriptor>,
}

impl VirtualObject {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            handlers: Vec::new(),
        }
    }

    /// Handler with exclusive, serialized access to the object's state.
    pub fn exclusive<Req, Res, F, Fut>(mut self, name: &str, f: F) -> Self
    where
        Req: DeserializeOwned + Send + 'static,
        Res: Serialize + Send + 'static,
        F: Fn(ObjectContext, Req) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = Result<Res, Error>> + Send + 'static,
    {
        let raw = erase_handler!(f, ObjectContext, |machine| ObjectContext::new(
            machine, Json
        ));
        self.handlers
            .push(HandlerDescriptor::new(name, HandlerShape::Exclusive, raw));
        self
    }

    /// Concurrent handler with read-only state access.
    pub fn shared<Req, Res, F, Fut>(mut self, name: &str, f: F) -> Self
    where
        Req: DeserializeOwned + Send + 'static,
        Res: Serialize + Send + 'static,
        F: Fn(SharedObjectContext, Req) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = Result<Res, Error>> + Send + 'static,
    {
        let raw = erase_handler!(f, SharedObjectContext, |machine| {
            SharedObjectContext::new(machine, Json)
        });
        self.handlers
            .push(HandlerDescriptor::new(name, HandlerShape::Shared, raw));
        self
    }
}

impl From<VirtualObject> for ServiceDefinition {
    fn from(object: VirtualObject) -> Self {
        Self {
            name: object.name,
            ty: ServiceType::VirtualObject,
            handlers: object.handlers,
        }
    }
}

/// Builder for a workflow: one run handler plus shared handlers.
pub struct Workflow {
    name: String,
    handlers: Vec<HandlerDescriptor>,
}

impl Workflow {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            handlers: Vec::new(),
        }
    }

    /// The workflow's run handler, executed once per key.
    pub fn run<Req, Res, F, Fut>(mut self, name: &str, f: F) -> Self
    where
        Req: DeserializeOwned + Send + 'static,
        Res: Serialize + Send + 'static,
        F: Fn(WorkflowContext, Req) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = Result<Res, Error>> + Send + 'static,
    {
        let raw = erase_handler!(f, WorkflowContext, |machine| WorkflowContext::new(
            machine, Json
        ));
        self.handlers
            .push(HandlerDescriptor::new(name, HandlerShape::Workflow, raw));
        self
    }

    pub fn shared<Req, Res, F, Fut>(mut self, name: &str, f: F) -> Self
    where
        Req: DeserializeOwned + Send + 'static,
        Res: Serialize + Send + 'static,
        F: Fn(SharedWorkflowContext, Req) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = Result<Res, Error>> + Send + 'static,
    {
        let raw = erase_handler!(f, SharedWorkflowContext, |machine| {
            SharedWorkflowContext::new(machine, Json)
        });
        self.handlers.push(HandlerDescriptor::new(
            name,
            HandlerShape::SharedWorkflow,
            raw,
        ));
        self
    }
}

impl From<Workflow> for ServiceDefinition {
    fn from(workflow: Workflow) -> Self {
        Self {
            name: workflow.name,
            ty: ServiceType::Workflow,
            handlers: workflow.handlers,
        }
    }
}

/// Frozen, process-wide registry of services; built once at startup.
pub struct Endpoint {
    services: BTreeMap<String, ServiceDefinition>,
    protocol_mode: ProtocolMode,
}

pub struct EndpointBuilder {
    services: Vec<ServiceDefinition>,
    protocol_mode: ProtocolMode,
}

impl EndpointBuilder {
    pub fn bind(mut self, service: impl Into<ServiceDefinition>) -> Self {
        self.services.push(service.into());
        self
    }

    pub fn protocol_mode(mut self, mode: ProtocolMode) -> Self {
        self.protocol_mode = mode;
        self
    }

    pub fn build(self) -> Arc<Endpoint> {
        Arc::new(Endpoint {
            services: self
                .services
                .into_iter()
                .map(|s| (s.name.clone(), s))
                .collect(),
            protocol_mode: self.protocol_mode,
        })
    }
}

impl Endpoint {
    pub fn builder() -> EndpointBuilder {
        EndpointBuilder {
            services: Vec::new(),
            protocol_mode: ProtocolMode::BidiStream,
        }
    }

    pub fn resolve(&self, service: &str, handler: &str) -> Option<&HandlerDescriptor> {
        self.services
            .get(service)?
            .handlers
            .iter()
            .find(|h| h.name == handler)
    }

    /// Render the discovery manifest for this endpoint.
    pub fn manifest(&self) -> Manifest {
        Manifest::new(
            self.protocol_mode,
            self.services
                .values()
                .map(|s| ServiceManifest {
                    name: s.name.clone(),
                    ty: s.ty,
                    handlers: s.handlers.iter().map(|h| h.manifest()).collect(),
                })
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    fn endpoint() -> Arc<Endpoint> {
        Endpoint::builder()
            .bind(
                Service::new("Greeter")
                    .handler("greet", |_ctx: Context, name: String| async move {
                        Ok(format!("hello, {name}"))
                    }),
            )
            .bind(
                VirtualObject::new("Counter")
                    .exclusive("add", |_ctx: ObjectContext, n: u64| async move { Ok(n) })
                    .shared("get", |_ctx: SharedObjectContext, _: ()| async move {
                        Ok(0u64)
                    }),
            )
            .bind(Workflow::new("Signup").run(
                "run",
                |_ctx: WorkflowContext, _: ()| async move { Ok(()) },
            ))
            .build()
    }

    #[test]
    fn resolve_finds_registered_handlers() {
        let endpoint = endpoint();
        assert!(endpoint.resolve("Greeter", "greet").is_some());
        assert!(endpoint.resolve("Counter", "add").is_some());
        assert!(endpoint.resolve("Counter", "missing").is_none());
        assert!(endpoint.resolve("Unknown", "greet").is_none());
    }

    #[test]
    fn manifest_reflects_shapes_and_kinds() {
        let manifest = endpoint().manifest();
        assert_eq!(manifest.services.len(), 3);

        let counter = manifest
            .services
            .iter()
            .find(|s| s.name == "Counter")
            .unwrap();
        assert_eq!(counter.ty, ServiceType::VirtualObject);
        let add = counter.handlers.iter().find(|h| h.name == "add").unwrap();
        assert_eq!(add.ty, Some(HandlerType::Exclusive));
        let get = counter.handlers.iter().find(|h| h.name == "get").unwrap();
        assert_eq!(get.ty, Some(HandlerType::Shared));

        let greeter = manifest
            .services
            .iter()
            .find(|s| s.name == "Greeter")
            .unwrap();
        assert_eq!(greeter.ty, ServiceType::Service);
        assert_eq!(greeter.handlers[0].ty, None);

        let signup = manifest
            .services
            .iter()
            .find(|s| s.name == "Signup")
            .unwrap();
        assert_eq!(signup.ty, ServiceType::Workflow);
        assert_eq!(signup.handlers[0].ty, Some(HandlerType::Workflow));
    }
}
