//! The call-session bridge.
//!
//! One `SessionBridge::open` call turns an accepted telephony stream and a
//! connected agent stream into a running session: four relay tasks in a
//! per-session `JoinSet`, supervised by a fifth task that drives teardown.
//!
//! ```text
//!  telephony source ──► caller relay ──audio──► agent writer ──► agent sink
//!          │                 └──control──┐          ▲   ▲
//!          │                             ▼          │   │ priority (cancel)
//!          │                        control loop ───┘───┘
//!          │                             ▲   │ dispatch
//!  telephony sink ◄── agent relay ──control──┘   ▼
//!                        ▲              FunctionDispatcher
//!                  agent source
//! ```

use super::transport::{
    AgentEvent, AgentSink, AgentSource, AgentStream, TelephonyEvent, TelephonySink,
    TelephonySource, TelephonyStream,
};
use futures_util::future::BoxFuture;
use restaurant_core::{AudioFrame, BargeInDetector, ControlEvent, DispatchError, FunctionDispatcher};
use serde::Serialize;
use serde_json::Value;
use std::{
    collections::{HashSet, VecDeque},
    fmt,
    sync::{
        Arc, Mutex, OnceLock,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};
use tokio::{
    sync::{mpsc, watch},
    task::JoinSet,
    time::{Instant, Interval, MissedTickBehavior, interval_at, sleep, timeout},
};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, warn};
use utoipa::ToSchema;
use uuid::Uuid;

/// Timing and sizing knobs for every session opened by a bridge.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Longest silence tolerated on the control channel.
    pub control_timeout: Duration,
    /// How long one caller-audio read may block before it counts as a skip.
    pub audio_read_timeout: Duration,
    /// Consecutive skipped reads tolerated before the session times out.
    pub max_audio_skips: u32,
    /// How long tasks get to exit on their own once closing starts.
    pub shutdown_grace: Duration,
    /// Period of agent keep-alives; `None` disables them.
    pub keepalive_interval: Option<Duration>,
    /// Capacity of the bounded channels between session tasks.
    pub channel_capacity: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            control_timeout: Duration::from_secs(120),
            audio_read_timeout: Duration::from_millis(2000),
            max_audio_skips: 5,
            shutdown_grace: Duration::from_millis(2000),
            keepalive_interval: Some(Duration::from_secs(8)),
            channel_capacity: 64,
        }
    }
}

/// Session lifecycle. Transitions only ever move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Created,
    Active,
    Closing,
    Closed,
}

/// Why a session ended. Only the first reason recorded for a session sticks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The telephony side reported the end of the call.
    CallerHangup,
    /// The telephony stream ended without a stop event.
    TelephonyClosed,
    AgentClosed,
    Transport(String),
    Timeout,
    Shutdown,
    Internal(String),
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::CallerHangup => write!(f, "caller hung up"),
            CloseReason::TelephonyClosed => write!(f, "telephony stream closed"),
            CloseReason::AgentClosed => write!(f, "agent stream closed"),
            CloseReason::Transport(e) => write!(f, "transport error: {e}"),
            CloseReason::Timeout => write!(f, "timed out"),
            CloseReason::Shutdown => write!(f, "server shutdown"),
            CloseReason::Internal(e) => write!(f, "internal error: {e}"),
        }
    }
}

/// Per-session counters, reported when the session closes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, ToSchema)]
pub struct SessionStats {
    pub caller_frames: u64,
    pub agent_frames: u64,
    pub dropped_frames: u64,
    pub function_calls: u64,
    pub barge_ins: u64,
}

/// Point-in-time view of a live session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
pub struct SessionSnapshot {
    pub id: Uuid,
    pub state: SessionState,
    pub agent_speaking: bool,
    pub caller_speaking: bool,
    pub outstanding_call: Option<String>,
    pub stats: SessionStats,
}

#[derive(Default)]
struct Counters {
    caller_frames: AtomicU64,
    agent_frames: AtomicU64,
    dropped_frames: AtomicU64,
    function_calls: AtomicU64,
    barge_ins: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> SessionStats {
        SessionStats {
            caller_frames: self.caller_frames.load(Ordering::Relaxed),
            agent_frames: self.agent_frames.load(Ordering::Relaxed),
            dropped_frames: self.dropped_frames.load(Ordering::Relaxed),
            function_calls: self.function_calls.load(Ordering::Relaxed),
            barge_ins: self.barge_ins.load(Ordering::Relaxed),
        }
    }
}

struct SessionShared {
    id: Uuid,
    state: watch::Sender<SessionState>,
    reason: OnceLock<CloseReason>,
    cancel: CancellationToken,
    counters: Counters,
    agent_speaking: AtomicBool,
    caller_speaking: AtomicBool,
    outstanding_call: Mutex<Option<String>>,
}

impl SessionShared {
    fn new() -> Self {
        let (state, _) = watch::channel(SessionState::Created);
        Self {
            id: Uuid::new_v4(),
            state,
            reason: OnceLock::new(),
            cancel: CancellationToken::new(),
            counters: Counters::default(),
            agent_speaking: AtomicBool::new(false),
            caller_speaking: AtomicBool::new(false),
            outstanding_call: Mutex::new(None),
        }
    }

    /// Moves the lifecycle forward to `next`. Returns false if it was already there or past it.
    fn advance(&self, next: SessionState) -> bool {
        self.state.send_if_modified(|current| {
            if next > *current {
                *current = next;
                true
            } else {
                false
            }
        })
    }

    fn activate(&self) {
        if self.advance(SessionState::Active) {
            info!(session_id = %self.id, "Session active");
        }
    }

    fn close(&self, reason: CloseReason) {
        if self.reason.set(reason.clone()).is_ok() {
            info!(session_id = %self.id, %reason, "Closing session");
        }
        self.advance(SessionState::Closing);
        self.cancel.cancel();
    }

    fn set_outstanding(&self, call_id: Option<String>) {
        *self
            .outstanding_call
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = call_id;
    }

    fn outstanding(&self) -> Option<String> {
        self.outstanding_call
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Applies the per-direction ordering rule. Frames older than the last
    /// forwarded one are dropped; equal sequence numbers pass.
    fn accept_sequence(&self, last: &mut Option<u64>, frame: &AudioFrame) -> bool {
        if let Some(prev) = *last {
            if frame.sequence < prev {
                self.counters.dropped_frames.fetch_add(1, Ordering::Relaxed);
                debug!(
                    direction = %frame.direction,
                    sequence = frame.sequence,
                    last = prev,
                    "Dropping out-of-order frame"
                );
                return false;
            }
        }
        *last = Some(frame.sequence);
        true
    }
}

/// Handle on a running session. Cheap to clone.
#[derive(Clone)]
pub struct SessionHandle {
    shared: Arc<SessionShared>,
}

impl SessionHandle {
    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    pub fn state(&self) -> SessionState {
        *self.shared.state.borrow()
    }

    /// Watches lifecycle transitions.
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.shared.state.subscribe()
    }

    /// Starts teardown. Idempotent; the first reason wins.
    pub fn close(&self, reason: CloseReason) {
        self.shared.close(reason);
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.shared.reason.get().cloned()
    }

    /// Resolves once every task of the session has exited.
    pub async fn closed(&self) {
        let mut rx = self.shared.state.subscribe();
        let _ = rx.wait_for(|state| *state == SessionState::Closed).await;
    }

    pub fn stats(&self) -> SessionStats {
        self.shared.counters.snapshot()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            id: self.shared.id,
            state: self.state(),
            agent_speaking: self.shared.agent_speaking.load(Ordering::Relaxed),
            caller_speaking: self.shared.caller_speaking.load(Ordering::Relaxed),
            outstanding_call: self.shared.outstanding(),
            stats: self.stats(),
        }
    }
}

/// Opens and closes call sessions.
#[derive(Clone)]
pub struct SessionBridge {
    dispatcher: Arc<FunctionDispatcher>,
    config: BridgeConfig,
}

impl SessionBridge {
    pub fn new(dispatcher: Arc<FunctionDispatcher>, config: BridgeConfig) -> Self {
        Self { dispatcher, config }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Starts bridging `telephony` and `agent`. Must be called inside a Tokio runtime.
    pub fn open(&self, telephony: TelephonyStream, agent: AgentStream) -> SessionHandle {
        let shared = Arc::new(SessionShared::new());
        let capacity = self.config.channel_capacity.max(1);

        let (caller_audio_tx, caller_audio_rx) = mpsc::channel(capacity);
        let (control_tx, control_rx) = mpsc::channel(capacity);
        let (agent_control_tx, agent_control_rx) = mpsc::channel(capacity);
        let (priority_tx, priority_rx) = mpsc::channel(capacity);
        let (telephony_cmd_tx, telephony_cmd_rx) = mpsc::channel(capacity);

        let mut tasks = JoinSet::new();
        tasks.spawn(
            relay_caller(
                shared.clone(),
                telephony.source,
                caller_audio_tx,
                control_tx.clone(),
                self.config.clone(),
            )
            .in_current_span(),
        );
        tasks.spawn(
            relay_agent(
                shared.clone(),
                agent.source,
                telephony.sink,
                telephony_cmd_rx,
                control_tx,
            )
            .in_current_span(),
        );
        tasks.spawn(
            run_control(
                shared.clone(),
                self.dispatcher.clone(),
                ControlChannels {
                    inbound: control_rx,
                    agent: agent_control_tx,
                    priority: priority_tx,
                    telephony: telephony_cmd_tx,
                },
                self.config.control_timeout,
            )
            .in_current_span(),
        );
        tasks.spawn(
            write_agent(
                shared.clone(),
                agent.sink,
                AgentQueues {
                    priority: priority_rx,
                    control: agent_control_rx,
                    audio: caller_audio_rx,
                },
                self.config.keepalive_interval,
            )
            .in_current_span(),
        );

        tokio::spawn(supervise(shared.clone(), tasks, self.config.shutdown_grace).in_current_span());
        info!(session_id = %shared.id, "Session opened");
        SessionHandle { shared }
    }

    pub fn close(&self, handle: &SessionHandle, reason: CloseReason) {
        handle.close(reason);
    }
}

/// Sends `item` unless the session is cancelled first. Returns false if it was not delivered.
async fn forward<T>(cancel: &CancellationToken, tx: &mpsc::Sender<T>, item: T) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        sent = tx.send(item) => sent.is_ok(),
    }
}

/// Telephony source → agent writer (audio) and control loop (events).
async fn relay_caller(
    shared: Arc<SessionShared>,
    mut source: Box<dyn TelephonySource>,
    audio_tx: mpsc::Sender<AudioFrame>,
    control_tx: mpsc::Sender<ControlEvent>,
    config: BridgeConfig,
) {
    let mut skips = 0u32;
    let mut last_sequence = None;

    loop {
        let next = tokio::select! {
            biased;
            _ = shared.cancel.cancelled() => break,
            next = timeout(config.audio_read_timeout, source.recv()) => next,
        };

        let event = match next {
            Err(_) => {
                skips += 1;
                if skips > config.max_audio_skips {
                    warn!(skips, "Caller audio stalled, giving up");
                    shared.close(CloseReason::Timeout);
                    break;
                }
                debug!(skips, "Caller audio read timed out");
                continue;
            }
            Ok(Ok(Some(event))) => event,
            Ok(Ok(None)) => {
                shared.close(CloseReason::TelephonyClosed);
                break;
            }
            Ok(Err(e)) => {
                error!(error = %e, "Telephony stream failed");
                shared.close(CloseReason::Transport(e.to_string()));
                break;
            }
        };
        skips = 0;

        match event {
            TelephonyEvent::Audio(frame) => {
                if !shared.accept_sequence(&mut last_sequence, &frame) {
                    continue;
                }
                shared.counters.caller_frames.fetch_add(1, Ordering::Relaxed);
                shared.activate();
                if !forward(&shared.cancel, &audio_tx, frame).await {
                    break;
                }
            }
            TelephonyEvent::Control(ControlEvent::SessionEnded) => {
                shared.close(CloseReason::CallerHangup);
                break;
            }
            TelephonyEvent::Control(event) => {
                if !forward(&shared.cancel, &control_tx, event).await {
                    break;
                }
            }
        }
    }
}

/// Agent source → telephony sink (audio) and control loop (events). Also owns
/// the telephony sink, so control commands for the caller's leg come through here.
///
/// A barge-in cancel mutes the agent leg: frames still streaming from the
/// interrupted response are dropped until the agent starts speaking again.
async fn relay_agent(
    shared: Arc<SessionShared>,
    mut source: Box<dyn AgentSource>,
    mut sink: Box<dyn TelephonySink>,
    mut commands: mpsc::Receiver<ControlEvent>,
    control_tx: mpsc::Sender<ControlEvent>,
) {
    let mut last_sequence = None;
    let mut muted = false;

    loop {
        tokio::select! {
            biased;
            _ = shared.cancel.cancelled() => break,
            Some(command) = commands.recv() => {
                if command == ControlEvent::BargeInCancel {
                    muted = true;
                }
                if let Err(e) = sink.send_event(command).await {
                    shared.close(CloseReason::Transport(e.to_string()));
                    break;
                }
            }
            next = source.recv() => match next {
                Ok(Some(AgentEvent::Audio(frame))) => {
                    if !shared.accept_sequence(&mut last_sequence, &frame) {
                        continue;
                    }
                    if muted {
                        shared.counters.dropped_frames.fetch_add(1, Ordering::Relaxed);
                        debug!(sequence = frame.sequence, "Dropping agent audio after barge-in");
                        continue;
                    }
                    shared.counters.agent_frames.fetch_add(1, Ordering::Relaxed);
                    shared.activate();
                    if let Err(e) = sink.send_audio(frame).await {
                        error!(error = %e, "Failed to write agent audio to the caller");
                        shared.close(CloseReason::Transport(e.to_string()));
                        break;
                    }
                }
                Ok(Some(AgentEvent::Control(event))) => {
                    if event == ControlEvent::AgentSpeechStarted && muted {
                        debug!("Agent speaking again, unmuting");
                        muted = false;
                    }
                    if !forward(&shared.cancel, &control_tx, event).await {
                        break;
                    }
                }
                Ok(None) => {
                    shared.close(CloseReason::AgentClosed);
                    break;
                }
                Err(e) => {
                    error!(error = %e, "Agent stream failed");
                    shared.close(CloseReason::Transport(e.to_string()));
                    break;
                }
            },
        }
    }

    sink.close().await;
}

struct ControlChannels {
    inbound: mpsc::Receiver<ControlEvent>,
    /// Function results, in order with the rest of the agent traffic.
    agent: mpsc::Sender<ControlEvent>,
    /// Jumps ahead of queued results and audio.
    priority: mpsc::Sender<ControlEvent>,
    telephony: mpsc::Sender<ControlEvent>,
}

struct PendingCall {
    call_id: String,
    name: String,
    arguments: Value,
}

struct InFlight {
    call_id: String,
    name: String,
    future: BoxFuture<'static, Result<Value, DispatchError>>,
}

fn start_call(
    shared: &SessionShared,
    dispatcher: &Arc<FunctionDispatcher>,
    call: PendingCall,
) -> InFlight {
    info!(call_id = %call.call_id, function = %call.name, "Dispatching function call");
    shared.set_outstanding(Some(call.call_id.clone()));
    shared.counters.function_calls.fetch_add(1, Ordering::Relaxed);

    let dispatcher = dispatcher.clone();
    let name = call.name.clone();
    let arguments = call.arguments;
    InFlight {
        call_id: call.call_id,
        name: call.name,
        future: Box::pin(async move { dispatcher.dispatch(&name, &arguments).await }),
    }
}

/// Resolves with the in-flight call's result; pending forever when nothing is in flight.
async fn next_result(slot: &mut Option<InFlight>) -> (String, String, Result<Value, DispatchError>) {
    let Some(call) = slot.as_mut() else {
        return std::future::pending().await;
    };
    let result = call.future.as_mut().await;
    (call.call_id.clone(), call.name.clone(), result)
}

/// Barge-in detection and function-call dispatch.
///
/// At most one call is in flight; later requests wait in a FIFO. The dispatch
/// future is polled from this task's `select!`, so a slow backend never stalls
/// the audio relays, and it is dropped with the task on close.
async fn run_control(
    shared: Arc<SessionShared>,
    dispatcher: Arc<FunctionDispatcher>,
    mut channels: ControlChannels,
    control_timeout: Duration,
) {
    let mut detector = BargeInDetector::new();
    let mut queue: VecDeque<PendingCall> = VecDeque::new();
    let mut seen_calls: HashSet<String> = HashSet::new();
    let mut in_flight: Option<InFlight> = None;
    let idle = sleep(control_timeout);
    tokio::pin!(idle);

    loop {
        tokio::select! {
            biased;
            _ = shared.cancel.cancelled() => break,
            (call_id, name, result) = next_result(&mut in_flight) => {
                in_flight = None;
                shared.set_outstanding(None);
                match &result {
                    Ok(_) => info!(%call_id, function = %name, "Function call completed"),
                    Err(e) => warn!(%call_id, function = %name, error = %e, "Function call failed"),
                }
                let event = ControlEvent::FunctionCallResult { call_id, name, result };
                if !forward(&shared.cancel, &channels.agent, event).await {
                    break;
                }
                if let Some(next) = queue.pop_front() {
                    in_flight = Some(start_call(&shared, &dispatcher, next));
                }
                idle.as_mut().reset(Instant::now() + control_timeout);
            }
            event = channels.inbound.recv() => {
                let Some(event) = event else { break };
                idle.as_mut().reset(Instant::now() + control_timeout);

                if let Some(cancel) = detector.observe(&event) {
                    shared.counters.barge_ins.fetch_add(1, Ordering::Relaxed);
                    info!("Barge-in, cancelling agent speech");
                    if !forward(&shared.cancel, &channels.priority, cancel.clone()).await
                        || !forward(&shared.cancel, &channels.telephony, cancel).await
                    {
                        break;
                    }
                }
                shared.agent_speaking.store(detector.agent_speaking(), Ordering::Relaxed);

                match event {
                    ControlEvent::SessionStarted => shared.activate(),
                    ControlEvent::SessionEnded => {
                        shared.close(CloseReason::CallerHangup);
                        break;
                    }
                    ControlEvent::CallerSpeechStarted => {
                        shared.caller_speaking.store(true, Ordering::Relaxed);
                    }
                    ControlEvent::CallerSpeechStopped => {
                        shared.caller_speaking.store(false, Ordering::Relaxed);
                    }
                    ControlEvent::FunctionCallRequested { call_id, name, arguments } => {
                        if !seen_calls.insert(call_id.clone()) {
                            warn!(%call_id, function = %name, "Ignoring duplicate function call");
                            continue;
                        }
                        let call = PendingCall { call_id, name, arguments };
                        if in_flight.is_none() {
                            in_flight = Some(start_call(&shared, &dispatcher, call));
                        } else {
                            debug!(call_id = %call.call_id, queued = queue.len() + 1, "Queueing function call");
                            queue.push_back(call);
                        }
                    }
                    ControlEvent::AgentSpeechStarted | ControlEvent::AgentSpeechStopped => {}
                    other => debug!(event = other.kind(), "Ignoring control event"),
                }
            }
            () = &mut idle => {
                warn!(timeout = ?control_timeout, "No control traffic, closing session");
                shared.close(CloseReason::Timeout);
                break;
            }
        }
    }
}

struct AgentQueues {
    priority: mpsc::Receiver<ControlEvent>,
    control: mpsc::Receiver<ControlEvent>,
    audio: mpsc::Receiver<AudioFrame>,
}

async fn tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// Sole writer on the agent sink: priority events, then results, then audio.
async fn write_agent(
    shared: Arc<SessionShared>,
    mut sink: Box<dyn AgentSink>,
    mut queues: AgentQueues,
    keepalive: Option<Duration>,
) {
    let mut ticker = keepalive.map(|period| {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    });

    loop {
        let written = tokio::select! {
            biased;
            _ = shared.cancel.cancelled() => break,
            Some(event) = queues.priority.recv() => sink.send_event(event).await,
            Some(event) = queues.control.recv() => sink.send_event(event).await,
            Some(frame) = queues.audio.recv() => sink.send_audio(frame).await,
            _ = tick(&mut ticker) => sink.keep_alive().await,
        };
        if let Err(e) = written {
            error!(error = %e, "Failed to write to the agent");
            shared.close(CloseReason::Transport(e.to_string()));
            break;
        }
    }

    sink.close().await;
}

async fn drain(tasks: &mut JoinSet<()>) {
    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            error!(error = %e, "Session task failed during shutdown");
        }
    }
}

/// Owns the task set: the first task to finish starts teardown for all of them.
async fn supervise(shared: Arc<SessionShared>, mut tasks: JoinSet<()>, grace: Duration) {
    if let Some(Err(e)) = tasks.join_next().await {
        error!(error = %e, "Session task failed");
        shared.close(CloseReason::Internal(e.to_string()));
    }
    shared.close(CloseReason::Internal("session task exited".to_string()));

    if timeout(grace, drain(&mut tasks)).await.is_err() {
        warn!(grace = ?grace, "Session tasks did not stop in time, aborting");
        tasks.shutdown().await;
    }

    shared.advance(SessionState::Closed);
    let stats = shared.counters.snapshot();
    let reason = shared
        .reason
        .get()
        .map(ToString::to_string)
        .unwrap_or_default();
    info!(
        session_id = %shared.id,
        %reason,
        caller_frames = stats.caller_frames,
        agent_frames = stats.agent_frames,
        dropped_frames = stats.dropped_frames,
        function_calls = stats.function_calls,
        barge_ins = stats.barge_ins,
        "Session closed"
    );
}
