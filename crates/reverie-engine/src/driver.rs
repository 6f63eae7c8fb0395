use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use reverie_protocol::io::FrameReader;

use crate::error::Error;
use crate::incoming::incoming_loop;
use crate::machine::{BoxedRead, StateMachine};
use crate::options::EngineOptions;
use crate::registry::{Endpoint, HandlerDescriptor};

/// Per-invocation glue: handshake, handler dispatch, outcome mapping,
/// and ordered teardown.
pub struct InvocationDriver {
    endpoint: Arc<Endpoint>,
    options: EngineOptions,
}

impl InvocationDriver {
    pub fn new(endpoint: Arc<Endpoint>) -> Self {
        Self::with_options(endpoint, EngineOptions::default())
    }

    pub fn with_options(endpoint: Arc<Endpoint>, options: EngineOptions) -> Self {
        Self { endpoint, options }
    }

    /// Drive one invocation over a bidirectional byte stream.
    ///
    /// Returns `Ok` whenever the outcome was reported to the runtime
    /// (success, terminal failure, or transient failure alike); errors
    /// only when the handler cannot even be resolved or started.
    pub async fn serve<R, W>(
        &self,
        service: &str,
        handler: &str,
        reader: R,
        writer: W,
        cancellation: CancellationToken,
    ) -> Result<(), Error>
    where
        R: AsyncRead + Send + 'static,
        W: AsyncWrite + Send + 'static,
    {
        let descriptor = self
            .endpoint
            .resolve(service, handler)
            .ok_or_else(|| Error::UnknownHandler {
                service: service.to_owned(),
                handler: handler.to_owned(),
            })?
            .clone();

        let machine = Arc::new(StateMachine::with_options(
            Box::pin(writer),
            cancellation.child_token(),
            self.options.clone(),
        ));
        let boxed_reader: BoxedRead = Box::pin(reader);
        let frame_reader =
            FrameReader::with_chunk_size(boxed_reader, self.options.read_chunk_size);

        self.run_invocation(&descriptor, machine, frame_reader).await
    }

    async fn run_invocation(
        &self,
        descriptor: &HandlerDescriptor,
        machine: Arc<StateMachine>,
        mut frame_reader: FrameReader<BoxedRead>,
    ) -> Result<(), Error> {
        let input = match machine.start(&mut frame_reader).await {
            Ok(input) => input,
            Err(err) => {
                debug!(error = %err, "start handshake failed");
                machine.transient_failure(err.code(), err.to_string()).await;
                let _ = machine.shutdown_writer().await;
                machine.close();
                return Err(err);
            }
        };

        // From here on the reader belongs to the incoming activity.
        let incoming = tokio::spawn(incoming_loop(frame_reader, machine.clone()));

        let outcome = self
            .invoke_handler(descriptor, &machine, input.value)
            .await;
        self.report_outcome(&machine, outcome).await;

        // Teardown order matters: complete the writer, then stop and
        // await the incoming activity, then let the reader drop with it.
        // Each step is guarded so one broken step cannot skip the rest.
        if let Err(err) = machine.shutdown_writer().await {
            debug!(error = %err, "writer shutdown failed");
        }
        incoming.abort();
        let _ = incoming.await;
        machine.close();
        Ok(())
    }

    async fn invoke_handler(
        &self,
        descriptor: &HandlerDescriptor,
        machine: &Arc<StateMachine>,
        input: Bytes,
    ) -> Result<Bytes, Error> {
        let cancelled = machine.cancellation().clone();
        tokio::select! {
            outcome = descriptor.invoke(machine.clone(), input) => outcome,
            _ = cancelled.cancelled() => Err(Error::Aborted),
        }
    }

    async fn report_outcome(&self, machine: &Arc<StateMachine>, outcome: Result<Bytes, Error>) {
        match outcome {
            Ok(value) => {
                if let Err(err) = machine.complete_success(value).await {
                    debug!(error = %err, "failed to write output, reporting transient failure");
                    machine.transient_failure(err.code(), err.to_string()).await;
                }
            }
            Err(Error::Terminal(terminal)) => {
                if let Err(err) = machine.complete_failure(terminal).await {
                    debug!(error = %err, "failed to write terminal output");
                    machine.transient_failure(err.code(), err.to_string()).await;
                }
            }
            Err(Error::Aborted) => {
                debug!(invocation.id = %machine.invocation_id(), "invocation aborted");
            }
            Err(err) => {
                machine.transient_failure(err.code(), err.to_string()).await;
            }
        }
    }
}
