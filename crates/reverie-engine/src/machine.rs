use std::collections::{HashMap, VecDeque};
use std::pin::Pin;
use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use bytes::{BufMut, Bytes, BytesMut};
use prost::Message;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use reverie_protocol::decoder::RawMessage;
use reverie_protocol::error::ProtocolError;
use reverie_protocol::header::{MessageFlags, MessageType};
use reverie_protocol::io::{FrameReader, FrameWriter, encode_frame};
use reverie_protocol::messages as pb;
use reverie_types::{CompletionValue, HandlerError, RetryPolicy, Target, TerminalError, codes};

use crate::completion::{CompletionManager, CompletionSlot};
use crate::error::Error;
use crate::journal::{EntryType, Journal, JournalEntry};
use crate::options::EngineOptions;

pub type BoxedRead = Pin<Box<dyn AsyncRead + Send>>;
pub type BoxedWrite = Pin<Box<dyn AsyncWrite + Send>>;

/// Per-invocation lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Lifecycle {
    WaitingStart,
    Replaying,
    Processing,
    Closed,
}

impl Lifecycle {
    fn name(self) -> &'static str {
        match self {
            Self::WaitingStart => "WaitingStart",
            Self::Replaying => "Replaying",
            Self::Processing => "Processing",
            Self::Closed => "Closed",
        }
    }
}

/// Metadata extracted from the `Start` frame.
#[derive(Clone, Debug)]
pub struct StartInfo {
    pub invocation_id: String,
    pub raw_invocation_id: Bytes,
    pub key: Option<String>,
    pub known_entries: u32,
    pub random_seed: u64,
}

/// Input bytes and headers extracted from the `Input` frame.
#[derive(Clone, Debug)]
pub struct InvocationInput {
    pub value: Bytes,
    pub headers: Vec<(String, String)>,
}

/// Result of preparing a completion-bearing operation: either the value
/// recorded during a previous execution, or a rendezvous to await.
#[derive(Debug)]
pub enum ValueHandle {
    Ready(CompletionValue),
    Slot(CompletionSlot),
}

impl ValueHandle {
    pub async fn wait(self) -> Result<CompletionValue, Error> {
        match self {
            Self::Ready(value) => Ok(value),
            Self::Slot(slot) => slot.wait().await,
        }
    }
}

/// The two rendezvous of an outgoing call: the invocation-id slot and
/// the result slot, in journal order.
#[derive(Debug)]
pub struct CallHandles {
    pub invocation_id: ValueHandle,
    pub result: ValueHandle,
}

/// Restricted context visible inside a side-effect closure.
///
/// Side effects may log and observe cancellation; nested durable
/// primitives are not reachable from here.
#[derive(Clone, Debug)]
pub struct RunContext {
    name: String,
    attempt: u32,
    cancellation: CancellationToken,
}

impl RunContext {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// 1-based execution attempt, incremented by local retries.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }
}

/// Per-key overlay over the eager state sent in `Start`.
///
/// `Some(bytes)` is a known value, `None` a known-absent key. When
/// `complete` is set the overlay is authoritative for unknown keys too.
#[derive(Debug, Default)]
struct EagerState {
    known: HashMap<String, Option<Bytes>>,
    complete: bool,
}

enum EagerGet {
    Value(Bytes),
    Absent,
    Unknown,
}

impl EagerState {
    fn from_start(state_map: Vec<pb::StateEntry>, partial_state: bool) -> Self {
        if partial_state {
            return Self::default();
        }
        Self {
            known: state_map
                .into_iter()
                .map(|e| {
                    (
                        String::from_utf8_lossy(&e.key).into_owned(),
                        Some(e.value),
                    )
                })
                .collect(),
            complete: true,
        }
    }

    fn get(&self, key: &str) -> EagerGet {
        match self.known.get(key) {
            Some(Some(value)) => EagerGet::Value(value.clone()),
            Some(None) => EagerGet::Absent,
            None if self.complete => EagerGet::Absent,
            None => EagerGet::Unknown,
        }
    }

    fn set(&mut self, key: String, value: Bytes) {
        self.known.insert(key, Some(value));
    }

    fn clear(&mut self, key: String) {
        self.known.insert(key, None);
    }

    fn clear_all(&mut self) {
        self.known.clear();
        self.complete = true;
    }
}

/// A command frame captured during the start handshake, waiting to be
/// consumed by the primitive that originally produced it.
#[derive(Debug)]
struct ReplayedCommand {
    ty: MessageType,
    flags: MessageFlags,
    payload: Bytes,
}

struct Core {
    lifecycle: Lifecycle,
    journal: Journal,
    replay_queue: VecDeque<ReplayedCommand>,
    start_info: Option<StartInfo>,
    input_headers: Vec<(String, String)>,
    eager: EagerState,
    next_signal_index: u32,
    rng: StdRng,
    /// Reusable serialization buffer; staged frames live here until the
    /// next flush.
    staged: BytesMut,
}

impl Core {
    fn ensure_open(&self, operation: &'static str) -> Result<(), Error> {
        match self.lifecycle {
            Lifecycle::Replaying | Lifecycle::Processing => Ok(()),
            other => Err(Error::IllegalState {
                state: other.name(),
                operation,
            }),
        }
    }

    fn pop_replay(
        &mut self,
        expected: MessageType,
        operation: &'static str,
    ) -> Result<ReplayedCommand, Error> {
        let cmd = self
            .replay_queue
            .pop_front()
            .ok_or_else(|| Error::JournalMismatch {
                index: self.journal.len(),
                expected: operation,
                actual: "no replayed entry left".to_owned(),
            })?;
        if cmd.ty != expected {
            return Err(Error::JournalMismatch {
                index: self.journal.len(),
                expected: operation,
                actual: format!("{:?}", cmd.ty),
            });
        }
        Ok(cmd)
    }

    fn finish_replay_if_drained(&mut self) {
        if self.lifecycle == Lifecycle::Replaying && self.replay_queue.is_empty() {
            self.lifecycle = Lifecycle::Processing;
            let id = self
                .start_info
                .as_ref()
                .map(|s| s.invocation_id.clone())
                .unwrap_or_default();
            debug!(invocation.id = %id, "replay complete, processing new operations");
        }
    }

    fn debug_id(&self) -> &str {
        self.start_info
            .as_ref()
            .map(|s| s.invocation_id.as_str())
            .unwrap_or("")
    }
}

/// The per-invocation orchestrator.
///
/// Owns the journal, both completion managers, the staged output buffer,
/// and the write half of the stream. The handler activity drives every
/// method here except [`StateMachine::route_notification`] and
/// [`StateMachine::notify_stream_closed`], which the incoming activity
/// calls; the managers and the cancellation token are the only state both
/// sides touch, and the core mutex is never held across an await.
pub struct StateMachine {
    core: Mutex<Core>,
    journal_completions: CompletionManager,
    signal_completions: CompletionManager,
    writer: tokio::sync::Mutex<FrameWriter<BoxedWrite>>,
    cancellation: CancellationToken,
    options: EngineOptions,
}

impl StateMachine {
    pub fn new(writer: BoxedWrite, cancellation: CancellationToken) -> Self {
        Self::with_options(writer, cancellation, EngineOptions::default())
    }

    pub fn with_options(
        writer: BoxedWrite,
        cancellation: CancellationToken,
        options: EngineOptions,
    ) -> Self {
        Self {
            core: Mutex::new(Core {
                lifecycle: Lifecycle::WaitingStart,
                journal: Journal::default(),
                replay_queue: VecDeque::new(),
                start_info: None,
                input_headers: Vec::new(),
                eager: EagerState::default(),
                next_signal_index: 1,
                rng: StdRng::seed_from_u64(0),
                staged: BytesMut::new(),
            }),
            journal_completions: CompletionManager::default(),
            signal_completions: CompletionManager::default(),
            writer: tokio::sync::Mutex::new(FrameWriter::new(writer)),
            cancellation,
            options,
        }
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn invocation_id(&self) -> String {
        self.core.lock().unwrap().debug_id().to_owned()
    }

    pub fn key(&self) -> Option<String> {
        self.core
            .lock()
            .unwrap()
            .start_info
            .as_ref()
            .and_then(|s| s.key.clone())
    }

    pub fn input_headers(&self) -> Vec<(String, String)> {
        self.core.lock().unwrap().input_headers.clone()
    }

    /// Deterministic PRNG output, seeded from the `Start` frame.
    pub fn random_u64(&self) -> u64 {
        self.core.lock().unwrap().rng.random()
    }

    pub fn random_fill(&self, dest: &mut [u8]) {
        self.core.lock().unwrap().rng.fill(dest);
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.core.lock().unwrap().lifecycle
    }

    // --- Start handshake

    /// Consume `Start`, `Input`, and the replayed frame window; returns
    /// the handler input.
    pub async fn start(
        &self,
        reader: &mut FrameReader<BoxedRead>,
    ) -> Result<InvocationInput, Error> {
        {
            let core = self.core.lock().unwrap();
            if core.lifecycle != Lifecycle::WaitingStart {
                return Err(Error::IllegalState {
                    state: core.lifecycle.name(),
                    operation: "Start",
                });
            }
        }

        let frame = self.expect_frame(reader).await?;
        if frame.ty() != MessageType::Start {
            return Err(ProtocolError::UnexpectedMessage {
                expected: "Start",
                actual: frame.ty(),
            }
            .into());
        }
        let start: pb::StartMessage = frame.decode_as()?;
        trace!(
            invocation.id = %start.debug_id,
            invocation.raw_id = %hex::encode(&start.id),
            "start frame received"
        );
        let known_entries = start.known_entries.max(1);

        let frame = self.expect_frame(reader).await?;
        if frame.ty() != MessageType::Input {
            return Err(ProtocolError::UnexpectedMessage {
                expected: "Input",
                actual: frame.ty(),
            }
            .into());
        }
        let input: pb::InputCommandMessage = frame.decode_as()?;
        let headers: Vec<(String, String)> = input
            .headers
            .into_iter()
            .map(|h| (h.key, h.value))
            .collect();

        {
            let mut core = self.core.lock().unwrap();
            core.journal.initialize(known_entries);
            core.journal
                .append(JournalEntry::completed(EntryType::Input, None));
            core.eager = EagerState::from_start(start.state_map, start.partial_state);
            core.rng = StdRng::seed_from_u64(start.random_seed);
            core.input_headers = headers.clone();
            core.start_info = Some(StartInfo {
                invocation_id: start.debug_id.clone(),
                raw_invocation_id: start.id,
                key: (!start.key.is_empty()).then(|| start.key),
                known_entries,
                random_seed: start.random_seed,
            });
            core.lifecycle = Lifecycle::Replaying;
        }

        let mut remaining = known_entries - 1;
        while remaining > 0 {
            let frame = self.expect_frame(reader).await?;
            remaining -= 1;
            if frame.ty().is_command() {
                let mut core = self.core.lock().unwrap();
                core.replay_queue.push_back(ReplayedCommand {
                    ty: frame.ty(),
                    flags: frame.flags(),
                    payload: frame.payload,
                });
            } else {
                self.route_notification(&frame)?;
            }
        }

        {
            let mut core = self.core.lock().unwrap();
            if core.replay_queue.is_empty() {
                core.lifecycle = Lifecycle::Processing;
            }
            debug!(
                invocation.id = %core.debug_id(),
                journal.known_entries = known_entries,
                replayed_commands = core.replay_queue.len(),
                lifecycle = core.lifecycle.name(),
                "invocation started"
            );
        }

        Ok(InvocationInput {
            value: input.value,
            headers,
        })
    }

    async fn expect_frame(
        &self,
        reader: &mut FrameReader<BoxedRead>,
    ) -> Result<RawMessage, Error> {
        reader
            .read_frame()
            .await?
            .ok_or(ProtocolError::UnexpectedEof)
            .map_err(Error::from)
    }

    // --- Incoming frames (shared by handshake and the reader activity)

    /// Route one incoming frame to the completion managers.
    ///
    /// Called from the incoming-notification activity; deliberately never
    /// touches the core mutex.
    pub fn route_notification(&self, frame: &RawMessage) -> Result<(), Error> {
        match frame.ty() {
            MessageType::EntryAck => {
                // Observed and discarded.
                let ack: pb::EntryAckMessage = frame.decode_as()?;
                trace!(entry_index = ack.entry_index, "entry ack");
            }
            MessageType::ProposeRunCompletion => {
                let msg: pb::ProposeRunCompletionMessage = frame.decode_as()?;
                let value = match msg.result {
                    Some(pb::propose_run_completion_message::Result::Value(b)) => {
                        CompletionValue::Success(b)
                    }
                    Some(pb::propose_run_completion_message::Result::Failure(f)) => {
                        CompletionValue::Failure(failure_to_terminal(f))
                    }
                    None => CompletionValue::Void,
                };
                trace!(completion_id = msg.result_completion_id, "replayed run result");
                self.journal_completions
                    .try_complete(msg.result_completion_id, value);
            }
            MessageType::Signal => {
                let msg: pb::SignalMessage = frame.decode_as()?;
                let value = match msg.result {
                    Some(pb::signal_message::Result::Value(b)) => CompletionValue::Success(b),
                    Some(pb::signal_message::Result::Void(_)) | None => CompletionValue::Void,
                    Some(pb::signal_message::Result::Failure(f)) => {
                        CompletionValue::Failure(failure_to_terminal(f))
                    }
                };
                trace!(signal_index = msg.idx, "signal notification");
                self.signal_completions.try_complete(msg.idx, value);
            }
            ty if ty.is_notification() => {
                let msg: pb::CompletionMessage = frame.decode_as()?;
                let value = completion_to_value(msg.result)?;
                trace!(completion_id = msg.completion_id, ty = ?ty, "completion notification");
                self.journal_completions.try_complete(msg.completion_id, value);
            }
            other => {
                trace!(ty = ?other, "ignoring unexpected frame");
            }
        }
        Ok(())
    }

    /// The incoming stream ended: fire the linked cancellation token and
    /// fail whatever is still waiting, so handler code observes the
    /// closure as an abort whether it is blocked on the token or on a
    /// rendezvous.
    pub fn notify_stream_closed(&self) {
        debug!(invocation.id = %self.invocation_id(), "incoming stream closed");
        self.cancellation.cancel();
        self.journal_completions.cancel_all();
        self.signal_completions.cancel_all();
    }

    // --- Shared primitive plumbing

    /// Prepare a completion-bearing command: replay it against the queue
    /// or journal it and stage its frame.
    fn completable<M: Message + Default>(
        &self,
        operation: &'static str,
        ty: MessageType,
        entry_ty: EntryType,
        name: Option<String>,
        build: impl FnOnce(u32) -> M,
        extract: impl FnOnce(M) -> (u32, Option<CompletionValue>),
    ) -> Result<ValueHandle, Error> {
        let mut core = self.core.lock().unwrap();
        match core.lifecycle {
            Lifecycle::Replaying => {
                let cmd = core.pop_replay(ty, operation)?;
                let msg =
                    M::decode(cmd.payload.clone()).map_err(|source| ProtocolError::Decode {
                        ty,
                        source,
                    })?;
                let completed = cmd.flags.contains(MessageFlags::COMPLETED);
                let (completion_id, replayed_result) = extract(msg);
                let index = core.journal.append(JournalEntry::pending(entry_ty, name));
                if completion_id != index {
                    return Err(Error::JournalMismatch {
                        index,
                        expected: operation,
                        actual: format!("completion id {completion_id}"),
                    });
                }
                let handle = match replayed_result {
                    Some(value) if completed => {
                        core.journal.resolve(index);
                        ValueHandle::Ready(value)
                    }
                    _ => ValueHandle::Slot(self.journal_completions.get_or_register(index)),
                };
                core.finish_replay_if_drained();
                Ok(handle)
            }
            Lifecycle::Processing => {
                let index = core.journal.append(JournalEntry::pending(entry_ty, name));
                let msg = build(index);
                encode_frame(&mut core.staged, ty, MessageFlags::NONE, &msg);
                trace!(invocation.id = %core.debug_id(), journal.index = index, op = operation, "command staged");
                Ok(ValueHandle::Slot(
                    self.journal_completions.get_or_register(index),
                ))
            }
            other => Err(Error::IllegalState {
                state: other.name(),
                operation,
            }),
        }
    }

    /// Journal and stage a command that completes immediately and never
    /// receives a notification. Does not flush; the next suspending
    /// primitive (or the output) flushes for it.
    fn write_command<M: Message + Default>(
        &self,
        operation: &'static str,
        ty: MessageType,
        entry_ty: EntryType,
        name: Option<String>,
        build: impl FnOnce() -> M,
    ) -> Result<u32, Error> {
        let mut core = self.core.lock().unwrap();
        match core.lifecycle {
            Lifecycle::Replaying => {
                core.pop_replay(ty, operation)?;
                let index = core.journal.append(JournalEntry::completed(entry_ty, name));
                core.finish_replay_if_drained();
                Ok(index)
            }
            Lifecycle::Processing => {
                let index = core.journal.append(JournalEntry::completed(entry_ty, name));
                let msg = build();
                encode_frame(&mut core.staged, ty, MessageFlags::NONE, &msg);
                trace!(invocation.id = %core.debug_id(), journal.index = index, op = operation, "command staged");
                Ok(index)
            }
            other => Err(Error::IllegalState {
                state: other.name(),
                operation,
            }),
        }
    }

    /// Move staged frames to the writer and flush the stream.
    pub(crate) async fn flush_staged(&self) -> Result<(), Error> {
        let chunk = {
            let mut core = self.core.lock().unwrap();
            if core.staged.is_empty() {
                None
            } else {
                Some(core.staged.split().freeze())
            }
        };
        let mut writer = self.writer.lock().await;
        if let Some(chunk) = chunk {
            writer.write_raw(chunk);
        }
        writer.flush().await?;
        Ok(())
    }

    // --- Timers

    /// Non-blocking durable timer; the returned handle resolves on the
    /// sleep completion notification.
    pub async fn timer(
        &self,
        duration: Duration,
        name: Option<String>,
    ) -> Result<ValueHandle, Error> {
        let wake_up_time = now_millis().saturating_add(duration.as_millis() as u64);
        let entry_name = name.clone();
        let handle = self.completable(
            "Sleep",
            MessageType::Sleep,
            EntryType::Sleep,
            entry_name,
            |index| pb::SleepCommandMessage {
                wake_up_time,
                completion_id: index,
                name,
                result: None,
            },
            |msg: pb::SleepCommandMessage| {
                let result = msg.result.map(|r| match r {
                    pb::sleep_command_message::Result::Void(_) => CompletionValue::Void,
                    pb::sleep_command_message::Result::Failure(f) => {
                        CompletionValue::Failure(failure_to_terminal(f))
                    }
                });
                (msg.completion_id, result)
            },
        )?;
        self.flush_staged().await?;
        Ok(handle)
    }

    pub async fn sleep(&self, duration: Duration) -> Result<(), Error> {
        let handle = self.timer(duration, None).await?;
        handle.wait().await?.into_success()?;
        Ok(())
    }

    // --- Calls

    /// Request/response call. Reserves two journal slots: the auxiliary
    /// invocation-id slot first, then the result slot carried as the
    /// command's `completion_id`.
    pub async fn call(&self, target: Target, parameter: Bytes) -> Result<CallHandles, Error> {
        let handles = {
            let mut core = self.core.lock().unwrap();
            match core.lifecycle {
                Lifecycle::Replaying => {
                    let cmd = core.pop_replay(MessageType::Call, "Call")?;
                    let msg = pb::CallCommandMessage::decode(cmd.payload.clone()).map_err(
                        |source| ProtocolError::Decode {
                            ty: MessageType::Call,
                            source,
                        },
                    )?;
                    let aux_index = core
                        .journal
                        .append(JournalEntry::completed(EntryType::Call, None));
                    let result_index = core
                        .journal
                        .append(JournalEntry::pending(EntryType::Call, None));
                    if msg.invocation_id_notification_idx != aux_index
                        || msg.completion_id != result_index
                    {
                        return Err(Error::JournalMismatch {
                            index: result_index,
                            expected: "Call",
                            actual: format!(
                                "invocation id idx {} / completion id {}",
                                msg.invocation_id_notification_idx, msg.completion_id
                            ),
                        });
                    }
                    let invocation_id =
                        ValueHandle::Slot(self.journal_completions.get_or_register(aux_index));
                    let result = match msg.result {
                        Some(result) if cmd.flags.contains(MessageFlags::COMPLETED) => {
                            core.journal.resolve(result_index);
                            ValueHandle::Ready(match result {
                                pb::call_command_message::Result::Value(b) => {
                                    CompletionValue::Success(b)
                                }
                                pb::call_command_message::Result::Failure(f) => {
                                    CompletionValue::Failure(failure_to_terminal(f))
                                }
                            })
                        }
                        _ => ValueHandle::Slot(
                            self.journal_completions.get_or_register(result_index),
                        ),
                    };
                    core.finish_replay_if_drained();
                    CallHandles {
                        invocation_id,
                        result,
                    }
                }
                Lifecycle::Processing => {
                    let aux_index = core
                        .journal
                        .append(JournalEntry::completed(EntryType::Call, None));
                    let result_index = core
                        .journal
                        .append(JournalEntry::pending(EntryType::Call, None));
                    let msg = pb::CallCommandMessage {
                        service_name: target.service,
                        handler_name: target.handler,
                        key: target.key.unwrap_or_default(),
                        idempotency_key: target.idempotency_key,
                        headers: to_wire_headers(target.headers),
                        parameter,
                        invocation_id_notification_idx: aux_index,
                        completion_id: result_index,
                        result: None,
                    };
                    encode_frame(&mut core.staged, MessageType::Call, MessageFlags::NONE, &msg);
                    trace!(invocation.id = %core.debug_id(), journal.index = result_index, "call staged");
                    CallHandles {
                        invocation_id: ValueHandle::Slot(
                            self.journal_completions.get_or_register(aux_index),
                        ),
                        result: ValueHandle::Slot(
                            self.journal_completions.get_or_register(result_index),
                        ),
                    }
                }
                other => {
                    return Err(Error::IllegalState {
                        state: other.name(),
                        operation: "Call",
                    });
                }
            }
        };
        self.flush_staged().await?;
        Ok(handles)
    }

    /// Fire-and-forget call; the handle resolves to the invocation id.
    pub async fn send(
        &self,
        target: Target,
        parameter: Bytes,
        delay: Option<Duration>,
    ) -> Result<ValueHandle, Error> {
        let invoke_time = delay
            .map(|d| now_millis().saturating_add(d.as_millis() as u64))
            .unwrap_or(0);
        let handle = self.completable(
            "OneWayCall",
            MessageType::OneWayCall,
            EntryType::OneWayCall,
            None,
            |index| pb::OneWayCallCommandMessage {
                service_name: target.service,
                handler_name: target.handler,
                key: target.key.unwrap_or_default(),
                idempotency_key: target.idempotency_key,
                headers: to_wire_headers(target.headers),
                parameter,
                invoke_time,
                invocation_id_notification_idx: index,
            },
            |msg: pb::OneWayCallCommandMessage| (msg.invocation_id_notification_idx, None),
        )?;
        self.flush_staged().await?;
        Ok(handle)
    }

    /// Write a cancel signal addressed to another invocation.
    pub fn cancel_invocation(&self, target_invocation_id: String) -> Result<(), Error> {
        self.write_command(
            "SendSignal",
            MessageType::SendSignal,
            EntryType::SendSignal,
            None,
            || pb::SendSignalCommandMessage {
                target_invocation_id,
                // Built-in cancel signal index.
                signal_idx: 1,
            },
        )?;
        Ok(())
    }

    // --- Side effects

    /// Run a side-effect closure with local retries, journaling the
    /// outcome so replay never re-executes it.
    pub async fn run<F, Fut>(
        &self,
        name: &str,
        retry_policy: Option<RetryPolicy>,
        thunk: F,
    ) -> Result<Bytes, Error>
    where
        F: Fn(RunContext) -> Fut,
        Fut: Future<Output = Result<Bytes, HandlerError>>,
    {
        let retry_policy = retry_policy.or_else(|| self.options.default_run_retry.clone());
        let replaying = {
            let core = self.core.lock().unwrap();
            core.ensure_open("Run")?;
            core.lifecycle == Lifecycle::Replaying
        };

        if replaying {
            let owned_name = name.to_owned();
            let handle = self.completable(
                "Run",
                MessageType::Run,
                EntryType::Run,
                Some(owned_name.clone()),
                |index| pb::RunCommandMessage {
                    name: owned_name,
                    completion_id: index,
                },
                |msg: pb::RunCommandMessage| (msg.completion_id, None),
            )?;
            return Ok(handle.wait().await?.into_success()?);
        }

        let started = Instant::now();
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let run_ctx = RunContext {
                name: name.to_owned(),
                attempt,
                cancellation: self.cancellation.child_token(),
            };
            match thunk(run_ctx).await {
                Ok(bytes) => {
                    self.record_run_result(
                        name,
                        pb::propose_run_completion_message::Result::Value(bytes.clone()),
                    )?;
                    self.flush_staged().await?;
                    return Ok(bytes);
                }
                Err(HandlerError::Terminal(terminal)) => {
                    debug!(run.name = name, attempt, "side effect failed terminally");
                    self.record_run_result(
                        name,
                        pb::propose_run_completion_message::Result::Failure(
                            terminal_to_failure(&terminal),
                        ),
                    )?;
                    self.flush_staged().await?;
                    return Err(Error::Terminal(terminal));
                }
                Err(HandlerError::Retryable { message }) => {
                    let delay = retry_policy
                        .as_ref()
                        .and_then(|p| p.next_delay(attempt, started.elapsed()));
                    match (&retry_policy, delay) {
                        (Some(_), Some(delay)) => {
                            debug!(
                                run.name = name,
                                attempt,
                                backoff_ms = delay.as_millis() as u64,
                                "side effect failed, retrying"
                            );
                            tokio::time::sleep(delay).await;
                        }
                        (Some(_), None) => {
                            let terminal = TerminalError::new(
                                codes::INTERNAL,
                                format!("run '{name}' failed after {attempt} attempts: {message}"),
                            );
                            self.record_run_result(
                                name,
                                pb::propose_run_completion_message::Result::Failure(
                                    terminal_to_failure(&terminal),
                                ),
                            )?;
                            self.flush_staged().await?;
                            return Err(Error::Terminal(terminal));
                        }
                        // No policy: propagate as a transient failure so
                        // the runtime retries the whole invocation; the
                        // journal records nothing.
                        (None, _) => return Err(Error::Retryable { message }),
                    }
                }
            }
        }
    }

    fn record_run_result(
        &self,
        name: &str,
        result: pb::propose_run_completion_message::Result,
    ) -> Result<(), Error> {
        let mut core = self.core.lock().unwrap();
        core.ensure_open("Run")?;
        let index = core
            .journal
            .append(JournalEntry::completed(EntryType::Run, Some(name.to_owned())));
        let command = pb::RunCommandMessage {
            name: name.to_owned(),
            completion_id: index,
        };
        encode_frame(&mut core.staged, MessageType::Run, MessageFlags::NONE, &command);
        let proposal = pb::ProposeRunCompletionMessage {
            result_completion_id: index,
            result: Some(result),
        };
        encode_frame(
            &mut core.staged,
            MessageType::ProposeRunCompletion,
            MessageFlags::NONE,
            &proposal,
        );
        trace!(invocation.id = %core.debug_id(), journal.index = index, run.name = name, "run recorded");
        Ok(())
    }

    // --- Awakeables

    /// Allocate the next signal index and derive the externally
    /// resolvable id. Purely local: no command, no journal entry.
    pub fn awakeable(&self) -> Result<(String, ValueHandle), Error> {
        let mut core = self.core.lock().unwrap();
        core.ensure_open("Awakeable")?;
        let raw_id = core
            .start_info
            .as_ref()
            .map(|s| s.raw_invocation_id.clone())
            .ok_or(Error::IllegalState {
                state: "WaitingStart",
                operation: "Awakeable",
            })?;
        let signal_index = core.next_signal_index;
        core.next_signal_index += 1;
        let id = encode_awakeable_id(&raw_id, signal_index);
        trace!(invocation.id = %core.debug_id(), signal_index, "awakeable allocated");
        Ok((
            id,
            ValueHandle::Slot(self.signal_completions.get_or_register(signal_index)),
        ))
    }

    pub fn resolve_awakeable(&self, id: String, value: Bytes) -> Result<(), Error> {
        self.write_command(
            "CompleteAwakeable",
            MessageType::CompleteAwakeable,
            EntryType::CompleteAwakeable,
            None,
            || pb::CompleteAwakeableCommandMessage {
                awakeable_id: id,
                result: Some(pb::complete_awakeable_command_message::Result::Value(value)),
            },
        )?;
        Ok(())
    }

    pub fn reject_awakeable(&self, id: String, reason: String) -> Result<(), Error> {
        self.write_command(
            "CompleteAwakeable",
            MessageType::CompleteAwakeable,
            EntryType::CompleteAwakeable,
            None,
            || pb::CompleteAwakeableCommandMessage {
                awakeable_id: id,
                result: Some(pb::complete_awakeable_command_message::Result::Failure(
                    pb::Failure {
                        code: codes::INTERNAL as u32,
                        message: reason,
                    },
                )),
            },
        )?;
        Ok(())
    }

    // --- Keyed state

    /// Read a state key, answering from the eager overlay when it is
    /// authoritative; only unknown keys cost a round-trip.
    pub async fn state_get(&self, key: &str) -> Result<Option<Bytes>, Error> {
        {
            let core = self.core.lock().unwrap();
            core.ensure_open("GetState")?;
            match core.eager.get(key) {
                EagerGet::Value(value) => return Ok(Some(value)),
                EagerGet::Absent => return Ok(None),
                EagerGet::Unknown => {}
            }
        }
        let owned_key = key.to_owned();
        let handle = self.completable(
            "GetState",
            MessageType::GetState,
            EntryType::GetState,
            Some(owned_key.clone()),
            |index| pb::GetStateCommandMessage {
                key: Bytes::from(owned_key.into_bytes()),
                completion_id: index,
                result: None,
            },
            |msg: pb::GetStateCommandMessage| {
                let result = msg.result.map(|r| match r {
                    pb::get_state_command_message::Result::Value(b) => {
                        CompletionValue::Success(b)
                    }
                    pb::get_state_command_message::Result::Void(_) => CompletionValue::Void,
                    pb::get_state_command_message::Result::Failure(f) => {
                        CompletionValue::Failure(failure_to_terminal(f))
                    }
                });
                (msg.completion_id, result)
            },
        )?;
        self.flush_staged().await?;
        Ok(handle.wait().await?.into_optional()?)
    }

    /// List state keys; the result is normalized to a JSON string array.
    pub async fn state_keys(&self) -> Result<Bytes, Error> {
        let handle = self.completable(
            "GetStateKeys",
            MessageType::GetStateKeys,
            EntryType::GetStateKeys,
            None,
            |index| pb::GetStateKeysCommandMessage {
                completion_id: index,
                result: None,
            },
            |msg: pb::GetStateKeysCommandMessage| {
                let result = msg.result.map(|r| match r {
                    pb::get_state_keys_command_message::Result::StateKeys(keys) => {
                        state_keys_to_json(keys)
                    }
                    pb::get_state_keys_command_message::Result::Failure(f) => {
                        CompletionValue::Failure(failure_to_terminal(f))
                    }
                });
                (msg.completion_id, result)
            },
        )?;
        self.flush_staged().await?;
        Ok(handle.wait().await?.into_success()?)
    }

    pub fn state_set(&self, key: &str, value: Bytes) -> Result<(), Error> {
        let owned_key = key.to_owned();
        let wire_value = value.clone();
        self.write_command(
            "SetState",
            MessageType::SetState,
            EntryType::SetState,
            Some(owned_key.clone()),
            || pb::SetStateCommandMessage {
                key: Bytes::from(owned_key.into_bytes()),
                value: wire_value,
            },
        )?;
        self.core.lock().unwrap().eager.set(key.to_owned(), value);
        Ok(())
    }

    pub fn state_clear(&self, key: &str) -> Result<(), Error> {
        let owned_key = key.to_owned();
        self.write_command(
            "ClearState",
            MessageType::ClearState,
            EntryType::ClearState,
            Some(owned_key.clone()),
            || pb::ClearStateCommandMessage {
                key: Bytes::from(owned_key.into_bytes()),
            },
        )?;
        self.core.lock().unwrap().eager.clear(key.to_owned());
        Ok(())
    }

    pub fn state_clear_all(&self) -> Result<(), Error> {
        self.write_command(
            "ClearAllState",
            MessageType::ClearAllState,
            EntryType::ClearAllState,
            None,
            || pb::ClearAllStateCommandMessage {},
        )?;
        self.core.lock().unwrap().eager.clear_all();
        Ok(())
    }

    // --- Workflow promises

    /// Durable named rendezvous; resolves when somebody completes it.
    pub fn get_promise(&self, key: &str) -> Result<ValueHandle, Error> {
        let owned_key = key.to_owned();
        self.completable(
            "GetPromise",
            MessageType::GetPromise,
            EntryType::GetPromise,
            Some(owned_key.clone()),
            |index| pb::GetPromiseCommandMessage {
                key: owned_key,
                completion_id: index,
                result: None,
            },
            |msg: pb::GetPromiseCommandMessage| {
                let result = msg.result.map(|r| match r {
                    pb::get_promise_command_message::Result::Value(b) => {
                        CompletionValue::Success(b)
                    }
                    pb::get_promise_command_message::Result::Failure(f) => {
                        CompletionValue::Failure(failure_to_terminal(f))
                    }
                });
                (msg.completion_id, result)
            },
        )
    }

    /// Current value of a promise, `Void` when unresolved.
    pub async fn peek_promise(&self, key: &str) -> Result<CompletionValue, Error> {
        let owned_key = key.to_owned();
        let handle = self.completable(
            "PeekPromise",
            MessageType::PeekPromise,
            EntryType::PeekPromise,
            Some(owned_key.clone()),
            |index| pb::PeekPromiseCommandMessage {
                key: owned_key,
                completion_id: index,
                result: None,
            },
            |msg: pb::PeekPromiseCommandMessage| {
                let result = msg.result.map(|r| match r {
                    pb::peek_promise_command_message::Result::Value(b) => {
                        CompletionValue::Success(b)
                    }
                    pb::peek_promise_command_message::Result::Void(_) => CompletionValue::Void,
                    pb::peek_promise_command_message::Result::Failure(f) => {
                        CompletionValue::Failure(failure_to_terminal(f))
                    }
                });
                (msg.completion_id, result)
            },
        )?;
        self.flush_staged().await?;
        handle.wait().await
    }

    pub fn resolve_promise(&self, key: &str, value: Bytes) -> Result<(), Error> {
        self.complete_promise(
            key,
            pb::complete_promise_command_message::Completion::CompletionValue(value),
        )
    }

    pub fn reject_promise(&self, key: &str, reason: String) -> Result<(), Error> {
        self.complete_promise(
            key,
            pb::complete_promise_command_message::Completion::CompletionFailure(pb::Failure {
                code: codes::INTERNAL as u32,
                message: reason,
            }),
        )
    }

    /// Non-suspending: stages the command and registers the completion
    /// rendezvous without awaiting it, so the later notification still
    /// finds a home.
    fn complete_promise(
        &self,
        key: &str,
        completion: pb::complete_promise_command_message::Completion,
    ) -> Result<(), Error> {
        let owned_key = key.to_owned();
        let _handle = self.completable(
            "CompletePromise",
            MessageType::CompletePromise,
            EntryType::CompletePromise,
            Some(owned_key.clone()),
            |index| pb::CompletePromiseCommandMessage {
                key: owned_key,
                completion_id: index,
                completion: Some(completion),
                result: None,
            },
            |msg: pb::CompletePromiseCommandMessage| {
                let result = msg.result.map(|r| match r {
                    pb::complete_promise_command_message::Result::Void(_) => CompletionValue::Void,
                    pb::complete_promise_command_message::Result::Failure(f) => {
                        CompletionValue::Failure(failure_to_terminal(f))
                    }
                });
                (msg.completion_id, result)
            },
        )?;
        Ok(())
    }

    // --- Attach / get output

    pub async fn attach_invocation(&self, invocation_id: String) -> Result<CompletionValue, Error> {
        let wire_id = invocation_id.clone();
        let handle = self.completable(
            "AttachInvocation",
            MessageType::AttachInvocation,
            EntryType::AttachInvocation,
            None,
            |index| pb::AttachInvocationCommandMessage {
                invocation_id: wire_id,
                completion_id: index,
                result: None,
            },
            |msg: pb::AttachInvocationCommandMessage| {
                let result = msg.result.map(|r| match r {
                    pb::attach_invocation_command_message::Result::Value(b) => {
                        CompletionValue::Success(b)
                    }
                    pb::attach_invocation_command_message::Result::Failure(f) => {
                        CompletionValue::Failure(failure_to_terminal(f))
                    }
                });
                (msg.completion_id, result)
            },
        )?;
        self.flush_staged().await?;
        handle.wait().await
    }

    /// Completed output of another invocation, `Void` when not yet done.
    pub async fn get_invocation_output(
        &self,
        invocation_id: String,
    ) -> Result<CompletionValue, Error> {
        let wire_id = invocation_id.clone();
        let handle = self.completable(
            "GetInvocationOutput",
            MessageType::GetInvocationOutput,
            EntryType::GetInvocationOutput,
            None,
            |index| pb::GetInvocationOutputCommandMessage {
                invocation_id: wire_id,
                completion_id: index,
                result: None,
            },
            |msg: pb::GetInvocationOutputCommandMessage| {
                let result = msg.result.map(|r| match r {
                    pb::get_invocation_output_command_message::Result::Value(b) => {
                        CompletionValue::Success(b)
                    }
                    pb::get_invocation_output_command_message::Result::Void(_) => {
                        CompletionValue::Void
                    }
                    pb::get_invocation_output_command_message::Result::Failure(f) => {
                        CompletionValue::Failure(failure_to_terminal(f))
                    }
                });
                (msg.completion_id, result)
            },
        )?;
        self.flush_staged().await?;
        handle.wait().await
    }

    // --- Output and lifecycle end

    /// Successful completion: `Output` (value always set, even when
    /// empty) followed by `End`.
    pub async fn complete_success(&self, value: Bytes) -> Result<(), Error> {
        self.write_output(pb::output_command_message::Result::Value(value))
            .await
    }

    /// Terminal failure: `Output` carrying the failure, then `End`.
    pub async fn complete_failure(&self, terminal: TerminalError) -> Result<(), Error> {
        self.write_output(pb::output_command_message::Result::Failure(
            terminal_to_failure(&terminal),
        ))
        .await
    }

    async fn write_output(
        &self,
        result: pb::output_command_message::Result,
    ) -> Result<(), Error> {
        {
            let mut core = self.core.lock().unwrap();
            match core.lifecycle {
                Lifecycle::Processing => {}
                Lifecycle::Replaying => {
                    return Err(Error::JournalMismatch {
                        index: core.journal.len(),
                        expected: "end of replay before output",
                        actual: format!("{} replayed entries left", core.replay_queue.len()),
                    });
                }
                other => {
                    return Err(Error::IllegalState {
                        state: other.name(),
                        operation: "Output",
                    });
                }
            }
            core.journal
                .append(JournalEntry::completed(EntryType::Output, None));
            encode_frame(
                &mut core.staged,
                MessageType::Output,
                MessageFlags::NONE,
                &pb::OutputCommandMessage {
                    result: Some(result),
                },
            );
            encode_frame(
                &mut core.staged,
                MessageType::End,
                MessageFlags::NONE,
                &pb::EndMessage {},
            );
            core.lifecycle = Lifecycle::Closed;
            debug!(invocation.id = %core.debug_id(), "invocation output written");
        }
        self.flush_staged().await
    }

    /// Transient failure: `Error` then `End`, best effort. A broken
    /// stream during error reporting is swallowed; there is no retry of
    /// error reporting.
    pub async fn transient_failure(&self, code: u16, message: String) {
        let proceed = {
            let mut core = self.core.lock().unwrap();
            if core.lifecycle == Lifecycle::Closed {
                false
            } else {
                encode_frame(
                    &mut core.staged,
                    MessageType::Error,
                    MessageFlags::NONE,
                    &pb::ErrorMessage {
                        code: code as u32,
                        message: message.clone(),
                        related_command_index: None,
                    },
                );
                encode_frame(
                    &mut core.staged,
                    MessageType::End,
                    MessageFlags::NONE,
                    &pb::EndMessage {},
                );
                core.lifecycle = Lifecycle::Closed;
                debug!(invocation.id = %core.debug_id(), code, %message, "transient failure written");
                true
            }
        };
        if proceed && let Err(err) = self.flush_staged().await {
            debug!(error = %err, "stream broke while reporting failure");
        }
    }

    /// Idempotent teardown: marks the machine closed and drains every
    /// pending rendezvous with a cancellation error.
    pub fn close(&self) {
        {
            let mut core = self.core.lock().unwrap();
            core.lifecycle = Lifecycle::Closed;
        }
        self.journal_completions.cancel_all();
        self.signal_completions.cancel_all();
    }

    /// Flush and close the write half of the stream.
    pub async fn shutdown_writer(&self) -> Result<(), Error> {
        let chunk = {
            let mut core = self.core.lock().unwrap();
            if core.staged.is_empty() {
                None
            } else {
                Some(core.staged.split().freeze())
            }
        };
        let mut writer = self.writer.lock().await;
        if let Some(chunk) = chunk {
            writer.write_raw(chunk);
        }
        writer.shutdown().await?;
        Ok(())
    }

}

/// `"sign_1"` + base64url (no padding) of the raw invocation id followed
/// by the big-endian signal index.
pub fn encode_awakeable_id(raw_invocation_id: &[u8], signal_index: u32) -> String {
    let mut buf = BytesMut::with_capacity(raw_invocation_id.len() + 4);
    buf.put_slice(raw_invocation_id);
    buf.put_u32(signal_index);
    format!("sign_1{}", URL_SAFE_NO_PAD.encode(buf.freeze()))
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

fn to_wire_headers(headers: Vec<(String, String)>) -> Vec<pb::Header> {
    headers
        .into_iter()
        .map(|(key, value)| pb::Header { key, value })
        .collect()
}

fn failure_to_terminal(failure: pb::Failure) -> TerminalError {
    TerminalError::new(failure.code as u16, failure.message)
}

fn terminal_to_failure(terminal: &TerminalError) -> pb::Failure {
    pb::Failure {
        code: terminal.code as u32,
        message: terminal.message.clone(),
    }
}

fn state_keys_to_json(keys: pb::StateKeys) -> CompletionValue {
    let names: Vec<String> = keys
        .keys
        .iter()
        .map(|k| String::from_utf8_lossy(k).into_owned())
        .collect();
    match serde_json::to_vec(&names) {
        Ok(json) => CompletionValue::Success(Bytes::from(json)),
        Err(err) => CompletionValue::Failure(TerminalError::internal(format!(
            "failed to encode state keys: {err}"
        ))),
    }
}

fn completion_to_value(
    result: Option<pb::completion_message::Result>,
) -> Result<CompletionValue, Error> {
    Ok(match result {
        None | Some(pb::completion_message::Result::Void(_)) => CompletionValue::Void,
        Some(pb::completion_message::Result::Value(b)) => CompletionValue::Success(b),
        Some(pb::completion_message::Result::Failure(f)) => {
            CompletionValue::Failure(failure_to_terminal(f))
        }
        Some(pb::completion_message::Result::InvocationId(id)) => {
            CompletionValue::InvocationId(id)
        }
        Some(pb::completion_message::Result::StateKeys(keys)) => state_keys_to_json(keys),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn awakeable_id_round_trips() {
        let raw = Bytes::from_static(b"\x01\x02\x03\x04");
        let id = encode_awakeable_id(&raw, 1);
        assert!(id.starts_with("sign_1"));

        let decoded = URL_SAFE_NO_PAD.decode(&id["sign_1".len()..]).unwrap();
        assert_eq!(&decoded[..4], &raw[..]);
        assert_eq!(&decoded[4..], &[0, 0, 0, 1]);
    }

    #[test]
    fn awakeable_id_uses_url_safe_alphabet() {
        // Raw bytes that would produce '+' and '/' in plain base64.
        let raw: Vec<u8> = (0u8..=255).collect();
        let id = encode_awakeable_id(&raw, 0xFFFF_FFFF);
        assert!(!id.contains('+'));
        assert!(!id.contains('/'));
        assert!(!id.contains('='));
    }

    #[test]
    fn eager_state_overlay_tracks_writes() {
        let mut eager = EagerState::from_start(
            vec![pb::StateEntry {
                key: Bytes::from_static(b"a"),
                value: Bytes::from_static(b"1"),
            }],
            false,
        );
        assert!(matches!(eager.get("a"), EagerGet::Value(_)));
        assert!(matches!(eager.get("b"), EagerGet::Absent));

        eager.set("b".into(), Bytes::from_static(b"2"));
        assert!(matches!(eager.get("b"), EagerGet::Value(_)));

        eager.clear("a".into());
        assert!(matches!(eager.get("a"), EagerGet::Absent));

        eager.clear_all();
        assert!(matches!(eager.get("b"), EagerGet::Absent));
    }

    #[test]
    fn partial_state_is_unknown_until_written() {
        let mut eager = EagerState::from_start(Vec::new(), true);
        assert!(matches!(eager.get("k"), EagerGet::Unknown));
        eager.set("k".into(), Bytes::from_static(b"v"));
        assert!(matches!(eager.get("k"), EagerGet::Value(_)));
        eager.clear_all();
        assert!(matches!(eager.get("other"), EagerGet::Absent));
    }

    #[test_log::test(tokio::test)]
    async fn no_commands_before_start_or_after_close() {
        let (sdk, _runtime) = tokio::io::duplex(256);
        let (_read_half, write_half) = tokio::io::split(sdk);
        let machine = StateMachine::new(Box::pin(write_half), CancellationToken::new());

        assert!(matches!(
            machine.state_set("k", Bytes::new()),
            Err(Error::IllegalState { .. })
        ));
        assert!(matches!(
            machine.complete_success(Bytes::new()).await,
            Err(Error::IllegalState { .. })
        ));

        machine.close();
        assert!(matches!(machine.awakeable(), Err(Error::IllegalState { .. })));
    }
}
