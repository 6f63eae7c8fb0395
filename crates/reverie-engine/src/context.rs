use std::ops::Deref;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;

use reverie_types::{
    HandlerError, Json, PayloadCodec, RetryPolicy, Target, TerminalError,
};

use crate::durable::DurableFuture;
use crate::error::Error;
use crate::machine::{RunContext, StateMachine, ValueHandle};

/// Handle to a not-yet-started peer invocation produced by call/send.
pub struct InvocationHandle {
    machine: Arc<StateMachine>,
    handle: ValueHandle,
}

impl InvocationHandle {
    /// The runtime-assigned invocation id, resolved asynchronously.
    pub async fn invocation_id(self) -> Result<String, Error> {
        self.machine.flush_staged().await?;
        Ok(self.handle.wait().await?.into_invocation_id()?)
    }
}

/// The two halves of an outgoing call: the invocation-id handle and the
/// typed result future.
pub struct CallFuture<T> {
    pub invocation_id: InvocationHandle,
    pub result: DurableFuture<T>,
}

impl<T: Send + 'static> IntoFuture for CallFuture<T> {
    type Output = Result<T, Error>;
    type IntoFuture = futures::future::BoxFuture<'static, Self::Output>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(self.result.value())
    }
}

/// Base capability set available to every handler shape: side effects,
/// calls, sends, timers, awakeables, attach/get-output, deterministic
/// randomness, time, and cancellation.
///
/// The façade holds no state; every operation delegates to the state
/// machine.
#[derive(Clone)]
pub struct Context<C: PayloadCodec = Json> {
    machine: Arc<StateMachine>,
    codec: C,
}

impl<C: PayloadCodec> Context<C> {
    pub(crate) fn new(machine: Arc<StateMachine>, codec: C) -> Self {
        Self { machine, codec }
    }

    pub fn invocation_id(&self) -> String {
        self.machine.invocation_id()
    }

    pub fn headers(&self) -> Vec<(String, String)> {
        self.machine.input_headers()
    }

    /// Deterministic random bits, stable across replays.
    pub fn random_u64(&self) -> u64 {
        self.machine.random_u64()
    }

    pub fn random_fill(&self, dest: &mut [u8]) {
        self.machine.random_fill(dest);
    }

    /// Wall-clock time. Not journaled; use a side effect when the value
    /// must be stable across replays.
    pub fn now(&self) -> SystemTime {
        SystemTime::now()
    }

    /// Token fired when the invocation is aborted.
    pub fn cancellation(&self) -> CancellationToken {
        self.machine.cancellation().clone()
    }

    // --- Side effects

    /// Run a closure whose outcome is journaled; replay reuses the
    /// recorded result instead of re-executing.
    pub async fn run<T, F, Fut>(&self, name: &str, f: F) -> Result<T, Error>
    where
        T: Serialize + DeserializeOwned,
        F: Fn(RunContext) -> Fut,
        Fut: Future<Output = Result<T, HandlerError>>,
    {
        self.run_inner(name, None, f).await
    }

    /// Like [`Context::run`], retrying retryable failures locally.
    pub async fn run_with_retry<T, F, Fut>(
        &self,
        name: &str,
        retry_policy: RetryPolicy,
        f: F,
    ) -> Result<T, Error>
    where
        T: Serialize + DeserializeOwned,
        F: Fn(RunContext) -> Fut,
        Fut: Future<Output = Result<T, HandlerError>>,
    {
        self.run_inner(name, Some(retry_policy), f).await
    }

    async fn run_inner<T, F, Fut>(
        &self,
        name: &str,
        retry_policy: Option<RetryPolicy>,
        f: F,
    ) -> Result<T, Error>
    where
        T: Serialize + DeserializeOwned,
        F: Fn(RunContext) -> Fut,
        Fut: Future<Output = Result<T, HandlerError>>,
    {
        let codec = self.codec.clone();
        let bytes = self
            .machine
            .run(name, retry_policy, move |run_ctx| {
                let fut = f(run_ctx);
                let codec = codec.clone();
                async move {
                    let value = fut.await?;
                    codec.encode(&value).map_err(|err| {
                        HandlerError::Terminal(TerminalError::internal(format!(
                            "failed to serialize side effect result: {err}"
                        )))
                    })
                }
            })
            .await?;
        Ok(self.codec.decode(&bytes)?)
    }

    // --- Calls and sends

    /// Request/response call to another handler.
    pub async fn call<Req, Res>(
        &self,
        target: Target,
        request: &Req,
    ) -> Result<CallFuture<Res>, Error>
    where
        Req: Serialize,
        Res: DeserializeOwned + Send + 'static,
    {
        let parameter = self.codec.encode(request)?;
        let handles = self.machine.call(target, parameter).await?;
        let codec = self.codec.clone();
        Ok(CallFuture {
            invocation_id: InvocationHandle {
                machine: self.machine.clone(),
                handle: handles.invocation_id,
            },
            result: DurableFuture::new(self.machine.clone(), handles.result, move |value| {
                let bytes = value.into_success()?;
                Ok(codec.decode(&bytes)?)
            }),
        })
    }

    /// Fire-and-forget call, optionally delayed.
    pub async fn send<Req: Serialize>(
        &self,
        target: Target,
        request: &Req,
        delay: Option<Duration>,
    ) -> Result<InvocationHandle, Error> {
        let parameter = self.codec.encode(request)?;
        let handle = self.machine.send(target, parameter, delay).await?;
        Ok(InvocationHandle {
            machine: self.machine.clone(),
            handle,
        })
    }

    /// Ask the runtime to cancel another invocation.
    pub fn cancel_invocation(&self, invocation_id: &str) -> Result<(), Error> {
        self.machine.cancel_invocation(invocation_id.to_owned())
    }

    // --- Timers

    pub async fn sleep(&self, duration: Duration) -> Result<(), Error> {
        self.machine.sleep(duration).await
    }

    /// Durable timer that does not block until awaited.
    pub async fn timer(&self, duration: Duration) -> Result<DurableFuture<()>, Error> {
        let handle = self.machine.timer(duration, None).await?;
        Ok(DurableFuture::new(self.machine.clone(), handle, |value| {
            value.into_success()?;
            Ok(())
        }))
    }

    // --- Awakeables

    /// Allocate an externally resolvable rendezvous; returns its id and
    /// the future for the delivered value.
    pub fn awakeable<T>(&self) -> Result<(String, DurableFuture<T>), Error>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let (id, handle) = self.machine.awakeable()?;
        let codec = self.codec.clone();
        Ok((
            id,
            DurableFuture::new(self.machine.clone(), handle, move |value| {
                let bytes = value.into_success()?;
                Ok(codec.decode(&bytes)?)
            }),
        ))
    }

    pub fn resolve_awakeable<T: Serialize>(&self, id: &str, value: &T) -> Result<(), Error> {
        let bytes = self.codec.encode(value)?;
        self.machine.resolve_awakeable(id.to_owned(), bytes)
    }

    pub fn reject_awakeable(&self, id: &str, reason: &str) -> Result<(), Error> {
        self.machine.reject_awakeable(id.to_owned(), reason.to_owned())
    }

    // --- Attach / get output

    /// Attach to another invocation and await its result.
    pub async fn attach_invocation<T: DeserializeOwned>(
        &self,
        invocation_id: &str,
    ) -> Result<T, Error> {
        let value = self
            .machine
            .attach_invocation(invocation_id.to_owned())
            .await?;
        let bytes = value.into_success()?;
        Ok(self.codec.decode(&bytes)?)
    }

    /// The output of another invocation, `None` while it is still
    /// running.
    pub async fn get_invocation_output<T: DeserializeOwned>(
        &self,
        invocation_id: &str,
    ) -> Result<Option<T>, Error> {
        let value = self
            .machine
            .get_invocation_output(invocation_id.to_owned())
            .await?;
        match value.into_optional()? {
            Some(bytes) => Ok(Some(self.codec.decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub(crate) fn machine(&self) -> &Arc<StateMachine> {
        &self.machine
    }

    pub(crate) fn codec(&self) -> &C {
        &self.codec
    }
}

/// Keyed context with read-only state access.
#[derive(Clone)]
pub struct SharedObjectContext<C: PayloadCodec = Json> {
    inner: Context<C>,
}

impl<C: PayloadCodec> Deref for SharedObjectContext<C> {
    type Target = Context<C>;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl<C: PayloadCodec> SharedObjectContext<C> {
    pub(crate) fn new(machine: Arc<StateMachine>, codec: C) -> Self {
        Self {
            inner: Context::new(machine, codec),
        }
    }

    /// The key this invocation is bound to.
    pub fn key(&self) -> String {
        self.inner.machine().key().unwrap_or_default()
    }

    /// Read a state value; answered locally when eager state covers the
    /// key.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, Error> {
        match self.inner.machine().state_get(key).await? {
            Some(bytes) => Ok(Some(self.inner.codec().decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// All state keys of this object.
    pub async fn state_keys(&self) -> Result<Vec<String>, Error> {
        let bytes = self.inner.machine().state_keys().await?;
        Ok(self.inner.codec().decode(&bytes)?)
    }
}

/// Keyed context with exclusive (read-write) state access.
#[derive(Clone)]
pub struct ObjectContext<C: PayloadCodec = Json> {
    inner: SharedObjectContext<C>,
}

impl<C: PayloadCodec> Deref for ObjectContext<C> {
    type Target = SharedObjectContext<C>;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl<C: PayloadCodec> ObjectContext<C> {
    pub(crate) fn new(machine: Arc<StateMachine>, codec: C) -> Self {
        Self {
            inner: SharedObjectContext::new(machine, codec),
        }
    }

    pub fn set<T: Serialize>(&self, key: &str, value: &T) -> Result<(), Error> {
        let bytes = self.inner.inner.codec().encode(value)?;
        self.inner.inner.machine().state_set(key, bytes)
    }

    pub fn clear(&self, key: &str) -> Result<(), Error> {
        self.inner.inner.machine().state_clear(key)
    }

    pub fn clear_all(&self) -> Result<(), Error> {
        self.inner.inner.machine().state_clear_all()
    }
}

/// Context of a workflow's run handler: exclusive state plus durable
/// promises.
#[derive(Clone)]
pub struct WorkflowContext<C: PayloadCodec = Json> {
    inner: ObjectContext<C>,
}

impl<C: PayloadCodec> Deref for WorkflowContext<C> {
    type Target = ObjectContext<C>;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl<C: PayloadCodec> WorkflowContext<C> {
    pub(crate) fn new(machine: Arc<StateMachine>, codec: C) -> Self {
        Self {
            inner: ObjectContext::new(machine, codec),
        }
    }

    /// Await the named durable promise.
    pub fn promise<T>(&self, name: &str) -> Result<DurableFuture<T>, Error>
    where
        T: DeserializeOwned + Send + 'static,
    {
        promise_future(self.inner.inner.inner.clone(), name)
    }

    /// Current value of the named promise, `None` while unresolved.
    pub async fn peek_promise<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>, Error> {
        peek_promise(&self.inner.inner.inner, name).await
    }

    pub fn resolve_promise<T: Serialize>(&self, name: &str, value: &T) -> Result<(), Error> {
        resolve_promise(&self.inner.inner.inner, name, value)
    }

    pub fn reject_promise(&self, name: &str, reason: &str) -> Result<(), Error> {
        self.inner
            .inner
            .inner
            .machine()
            .reject_promise(name, reason.to_owned())
    }
}

/// Context of shared workflow handlers: read-only state plus promise
/// peeking/resolution, without the blocking wait.
#[derive(Clone)]
pub struct SharedWorkflowContext<C: PayloadCodec = Json> {
    inner: SharedObjectContext<C>,
}

impl<C: PayloadCodec> Deref for SharedWorkflowContext<C> {
    type Target = SharedObjectContext<C>;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl<C: PayloadCodec> SharedWorkflowContext<C> {
    pub(crate) fn new(machine: Arc<StateMachine>, codec: C) -> Self {
        Self {
            inner: SharedObjectContext::new(machine, codec),
        }
    }

    pub async fn peek_promise<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>, Error> {
        peek_promise(&self.inner.inner, name).await
    }

    pub fn resolve_promise<T: Serialize>(&self, name: &str, value: &T) -> Result<(), Error> {
        resolve_promise(&self.inner.inner, name, value)
    }

    pub fn reject_promise(&self, name: &str, reason: &str) -> Result<(), Error> {
        self.inner.inner.machine().reject_promise(name, reason.to_owned())
    }
}

fn promise_future<C: PayloadCodec, T>(
    ctx: Context<C>,
    name: &str,
) -> Result<DurableFuture<T>, Error>
where
    T: DeserializeOwned + Send + 'static,
{
    let handle = ctx.machine().get_promise(name)?;
    let codec = ctx.codec().clone();
    Ok(DurableFuture::new(
        ctx.machine().clone(),
        handle,
        move |value| {
            let bytes = value.into_success()?;
            Ok(codec.decode(&bytes)?)
        },
    ))
}

async fn peek_promise<C: PayloadCodec, T: DeserializeOwned>(
    ctx: &Context<C>,
    name: &str,
) -> Result<Option<T>, Error> {
    let value = ctx.machine().peek_promise(name).await?;
    match value.into_optional()? {
        Some(bytes) => Ok(Some(ctx.codec().decode(&bytes)?)),
        None => Ok(None),
    }
}

fn resolve_promise<C: PayloadCodec, T: Serialize>(
    ctx: &Context<C>,
    name: &str,
    value: &T,
) -> Result<(), Error> {
    let bytes = ctx.codec().encode(value)?;
    ctx.machine().resolve_promise(name, bytes)
}
