use std::sync::Arc;

use futures::stream::{FuturesUnordered, Stream, StreamExt};
use reverie_types::CompletionValue;

use crate::error::Error;
use crate::machine::{StateMachine, ValueHandle};

/// Non-blocking handle over a pending (or already replayed) completion.
///
/// Awaiting flushes any staged commands first, so write-only primitives
/// issued before this future reach the wire before the handler suspends.
pub struct DurableFuture<T> {
    machine: Arc<StateMachine>,
    handle: ValueHandle,
    decode: Box<dyn FnOnce(CompletionValue) -> Result<T, Error> + Send>,
}

impl<T> DurableFuture<T> {
    pub(crate) fn new(
        machine: Arc<StateMachine>,
        handle: ValueHandle,
        decode: impl FnOnce(CompletionValue) -> Result<T, Error> + Send + 'static,
    ) -> Self {
        Self {
            machine,
            handle,
            decode: Box::new(decode),
        }
    }

    /// Suspend until the completion arrives and decode it.
    pub async fn value(self) -> Result<T, Error> {
        self.machine.flush_staged().await?;
        let value = self.handle.wait().await?;
        (self.decode)(value)
    }
}

impl<T: Send + 'static> IntoFuture for DurableFuture<T> {
    type Output = Result<T, Error>;
    type IntoFuture = futures::future::BoxFuture<'static, Self::Output>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(self.value())
    }
}

/// Await every future in order; the first failure wins.
///
/// Later futures are not awaited after a failure, but their rendezvous
/// stay registered so incoming notifications still find a home.
pub async fn all<T>(futures: Vec<DurableFuture<T>>) -> Result<Vec<T>, Error> {
    let mut results = Vec::with_capacity(futures.len());
    for future in futures {
        results.push(future.value().await?);
    }
    Ok(results)
}

/// Await the first future to settle, success or failure.
pub async fn race<T: Send + 'static>(futures: Vec<DurableFuture<T>>) -> Result<T, Error> {
    let mut pending: FuturesUnordered<_> = futures.into_iter().map(|f| f.value()).collect();
    match pending.next().await {
        Some(outcome) => outcome,
        None => Err(Error::Retryable {
            message: "raced an empty set of futures".to_owned(),
        }),
    }
}

/// Yield `(input index, outcome)` pairs in completion order; each
/// outcome is observed exactly once.
pub fn wait_each<T: Send + 'static>(
    futures: Vec<DurableFuture<T>>,
) -> impl Stream<Item = (usize, Result<T, Error>)> {
    futures
        .into_iter()
        .enumerate()
        .map(|(index, future)| async move { (index, future.value().await) })
        .collect::<FuturesUnordered<_>>()
}
