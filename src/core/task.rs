//! Processing nodes.
//!
//! A task is the executable unit of a stream: it owns an input queue, zero or
//! more typed output channels, per-input statistics, a runtime-parameter
//! registry, and a processing-state machine. Concrete task kinds implement
//! [`TaskUnit`]; the dispatch loop in this module gives all of them the same
//! control-message handling and statistics behaviour.
//!
//! The split between [`TaskShared`] and [`TaskCore`] mirrors who touches
//! what: `TaskShared` is the clonable cross-thread handle (queue sender,
//! processing state, using-data flag, output channels), while `TaskCore` is
//! owned by the dispatch context and holds everything only that context may
//! mutate.

use crate::core::channel::OutputChannel;
use crate::core::control::{ControlMessage, ParametersChange, RecordingStateChange};
use crate::core::envelope::Envelope;
use crate::core::params::{ParamValue, Parameter, ParameterRegistry};
use crate::core::state::ProcessingState;
use crate::core::stats::ChannelStats;
use crate::messages::header::NativeMessage;
use anyhow::Result;
use async_trait::async_trait;
use std::any::Any;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use tokio::sync::watch;

/// What travels through a task's input queue.
pub enum QueueItem {
    /// A message tagged with the input slot it arrived on.
    Envelope { envelope: Envelope, slot: usize },
    /// An opaque request handled in the task's own dispatch context. Used
    /// where state must only ever be touched from one thread.
    Marker(Box<dyn Any + Send>),
    /// Queue deactivation sentinel; the dispatch loop exits when it sees it.
    Close,
}

/// Marker posted by device-side code to move the task into Failure from its
/// own dispatch context.
pub struct FailureNotice;

/// Named channel endpoint recorded for each of a task's inputs.
pub struct InputConnection {
    pub name: String,
    pub type_name: String,
}

/// Scheduling attributes declared in the configuration. Parsed and carried,
/// but not applied to OS threads; see the builder.
#[derive(Debug, Clone, Default)]
pub struct ThreadPolicy {
    pub scheduler: Option<String>,
    pub priority: Option<i32>,
}

/// Cross-thread handle to a task.
pub struct TaskShared {
    name: Mutex<String>,
    index: AtomicUsize,
    queue_tx: flume::Sender<QueueItem>,
    active: AtomicBool,
    state: Mutex<ProcessingState>,
    error: Mutex<Option<String>>,
    using_data: watch::Sender<bool>,
    always_using_data: AtomicBool,
    changed_params: AtomicBool,
    outputs: RwLock<Vec<OutputChannel>>,
    upstream: Mutex<Vec<Weak<TaskShared>>>,
    next: Mutex<Option<Arc<TaskShared>>>,
    stats: Mutex<Vec<ChannelStats>>,
    /// Extra term OR-ed into the using-data calculation. Publishers hang
    /// their connection/subscriber counts here; controllers their
    /// recording-enabled flag.
    extra_using: Mutex<Option<Box<dyn Fn() -> bool + Send + Sync>>>,
}

impl TaskShared {
    pub fn new(name: &str, using_data: bool) -> (Arc<Self>, flume::Receiver<QueueItem>) {
        let (queue_tx, queue_rx) = flume::unbounded();
        let (using_tx, _) = watch::channel(using_data);
        let shared = Arc::new(Self {
            name: Mutex::new(name.to_string()),
            index: AtomicUsize::new(0),
            queue_tx,
            active: AtomicBool::new(true),
            state: Mutex::new(ProcessingState::Invalid),
            error: Mutex::new(None),
            using_data: using_tx,
            always_using_data: AtomicBool::new(false),
            changed_params: AtomicBool::new(false),
            outputs: RwLock::new(Vec::new()),
            upstream: Mutex::new(Vec::new()),
            next: Mutex::new(None),
            stats: Mutex::new(vec![ChannelStats::new()]),
            extra_using: Mutex::new(None),
        });
        (shared, queue_rx)
    }

    pub fn name(&self) -> String {
        self.name.lock().expect("task name mutex").clone()
    }

    pub fn set_name(&self, name: &str) {
        *self.name.lock().expect("task name mutex") = name.to_string();
    }

    pub fn index(&self) -> usize {
        self.index.load(Ordering::Relaxed)
    }

    pub fn set_index(&self, index: usize) {
        self.index.store(index, Ordering::Relaxed);
    }

    // --- queue ----------------------------------------------------------

    /// Enqueue a message for dispatch. Fails once the queue is deactivated.
    pub fn put(&self, envelope: Envelope, slot: usize) -> bool {
        self.is_queue_active() && self.queue_tx.send(QueueItem::Envelope { envelope, slot }).is_ok()
    }

    pub fn post_marker(&self, marker: Box<dyn Any + Send>) -> bool {
        self.is_queue_active() && self.queue_tx.send(QueueItem::Marker(marker)).is_ok()
    }

    /// Record an error seen off-thread and request the Failure transition in
    /// the task's own dispatch context.
    pub fn post_failure(&self, error: &str) {
        self.set_error_text(error, false);
        let _ = self.post_marker(Box::new(FailureNotice));
    }

    pub fn queue_len(&self) -> usize {
        self.queue_tx.len()
    }

    pub fn is_queue_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Stop accepting input and tell the dispatch loop to exit once it has
    /// drained what is already queued.
    pub fn deactivate(&self) {
        self.active.store(false, Ordering::Release);
        let _ = self.queue_tx.send(QueueItem::Close);
    }

    // --- state and error ------------------------------------------------

    pub fn state(&self) -> ProcessingState {
        *self.state.lock().expect("task state mutex")
    }

    pub(crate) fn set_state(&self, state: ProcessingState) {
        *self.state.lock().expect("task state mutex") = state;
    }

    pub fn error_text(&self) -> Option<String> {
        self.error.lock().expect("task error mutex").clone()
    }

    pub fn has_error(&self) -> bool {
        self.error.lock().expect("task error mutex").is_some()
    }

    /// Record an error. The first error wins unless `force` is set.
    pub fn set_error_text(&self, error: &str, force: bool) {
        let mut slot = self.error.lock().expect("task error mutex");
        if slot.is_none() || force {
            tracing::error!(task = %self.name(), error, "task error");
            *slot = Some(error.to_string());
        }
    }

    pub fn clear_error(&self) {
        *self.error.lock().expect("task error mutex") = None;
    }

    // --- using-data -----------------------------------------------------

    pub fn is_using_data(&self) -> bool {
        *self.using_data.borrow()
    }

    pub fn watch_using_data(&self) -> watch::Receiver<bool> {
        self.using_data.subscribe()
    }

    pub fn set_always_using_data(&self, value: bool) {
        self.always_using_data.store(value, Ordering::Relaxed);
    }

    pub fn set_extra_using_data(&self, probe: Box<dyn Fn() -> bool + Send + Sync>) {
        *self.extra_using.lock().expect("extra-using mutex") = Some(probe);
    }

    /// A task wants data iff some downstream recipient wants it, or it is
    /// configured to always pull, or it is self-testing, or a task-specific
    /// probe (clients connected, recording on) says so.
    pub fn calculate_using_data(&self) -> bool {
        if self.always_using_data.load(Ordering::Relaxed) {
            return true;
        }
        if self.state() == ProcessingState::AutoDiagnostic {
            return true;
        }
        if let Some(probe) = &*self.extra_using.lock().expect("extra-using mutex") {
            if probe() {
                return true;
            }
        }
        self.outputs
            .read()
            .expect("outputs lock")
            .iter()
            .any(OutputChannel::any_recipients_using_data)
    }

    /// Set the using-data flag, propagating changes to the tasks feeding our
    /// inputs. A request to turn the flag off is only honoured when the
    /// calculation agrees nothing downstream still wants data.
    pub fn set_using_data(self: &Arc<Self>, value: bool) {
        let value = if value { true } else { self.calculate_using_data() };
        let changed = self.using_data.send_if_modified(|current| {
            if *current != value {
                *current = value;
                true
            } else {
                false
            }
        });
        if !changed {
            return;
        }
        tracing::debug!(task = %self.name(), value, "using-data changed");
        if value {
            self.reset_stats();
        }
        let upstream = self.upstream.lock().expect("upstream mutex").clone();
        for sender in upstream {
            if let Some(sender) = sender.upgrade() {
                sender.set_using_data(value);
            }
        }
    }

    /// Recompute from current conditions and propagate.
    pub fn update_using_data(self: &Arc<Self>) {
        self.set_using_data(self.calculate_using_data());
    }

    pub fn add_upstream(&self, sender: &Arc<TaskShared>) {
        self.upstream
            .lock()
            .expect("upstream mutex")
            .push(Arc::downgrade(sender));
    }

    // --- outputs and the downstream link --------------------------------

    pub fn add_output_channel(&self, channel: OutputChannel) -> usize {
        let mut outputs = self.outputs.write().expect("outputs lock");
        outputs.push(channel);
        outputs.len() - 1
    }

    pub fn output_count(&self) -> usize {
        self.outputs.read().expect("outputs lock").len()
    }

    pub fn with_output<R>(&self, index: usize, f: impl FnOnce(&OutputChannel) -> R) -> Option<R> {
        self.outputs.read().expect("outputs lock").get(index).map(f)
    }

    pub fn with_output_mut<R>(
        &self,
        index: usize,
        f: impl FnOnce(&mut OutputChannel) -> R,
    ) -> Option<R> {
        self.outputs
            .write()
            .expect("outputs lock")
            .get_mut(index)
            .map(f)
    }

    pub fn set_next(&self, next: Arc<TaskShared>) {
        *self.next.lock().expect("next mutex") = Some(next);
    }

    pub fn next(&self) -> Option<Arc<TaskShared>> {
        self.next.lock().expect("next mutex").clone()
    }

    /// Hand an envelope straight to the next task in the stream. Control
    /// messages travel this way; so do data messages of tasks without
    /// channel wiring of their own.
    pub fn forward_next(&self, envelope: Envelope, slot: usize) -> bool {
        match self.next() {
            Some(next) => next.put(envelope, slot),
            None => true, // end of the line, nothing to do
        }
    }

    /// Wrap a native message and deliver it on the given output slot. A slot
    /// with no channel configured swallows the message; that is a valid
    /// topology, not an error.
    pub fn send_native(&self, message: Arc<dyn NativeMessage>, slot: usize) -> bool {
        self.send_envelope(Envelope::wrap_native(message), slot)
    }

    pub fn send_envelope(&self, envelope: Envelope, slot: usize) -> bool {
        let outputs = self.outputs.read().expect("outputs lock");
        match outputs.get(slot) {
            Some(channel) => channel.deliver(&envelope),
            None => true,
        }
    }

    /// Entry point for device-side readers: account the message on input
    /// slot 0 and forward it on output slot 0.
    pub fn acquire_external(&self, envelope: Envelope) -> bool {
        self.account_envelope(0, &envelope);
        self.send_envelope(envelope, 0)
    }

    // --- statistics -----------------------------------------------------

    pub fn ensure_stats_slots(&self, count: usize) {
        let mut stats = self.stats.lock().expect("stats mutex");
        while stats.len() < count {
            stats.push(ChannelStats::new());
        }
    }

    pub fn update_input_stats(&self, slot: usize, size: usize, sequence: u32) {
        let mut stats = self.stats.lock().expect("stats mutex");
        if let Some(entry) = stats.get_mut(slot) {
            entry.update(size, sequence);
        }
    }

    pub fn update_input_stats_raw(&self, slot: usize, size: usize) {
        let mut stats = self.stats.lock().expect("stats mutex");
        if let Some(entry) = stats.get_mut(slot) {
            entry.update_raw(size);
        }
    }

    fn account_envelope(&self, slot: usize, envelope: &Envelope) {
        match envelope.native() {
            Ok(native) => {
                self.update_input_stats(slot, envelope.size(), native.header().sequence())
            }
            Err(_) => self.update_input_stats_raw(slot, envelope.size()),
        }
    }

    pub fn reset_stats(&self) {
        for entry in self.stats.lock().expect("stats mutex").iter_mut() {
            entry.reset();
        }
    }

    pub fn stats_snapshot(&self) -> Vec<ChannelStats> {
        let mut stats = self.stats.lock().expect("stats mutex");
        for entry in stats.iter_mut() {
            entry.calculate_rates();
        }
        stats.clone()
    }

    pub fn has_changed_parameters(&self) -> bool {
        self.changed_params.load(Ordering::Relaxed)
    }

    pub(crate) fn set_changed_parameters(&self, value: bool) {
        self.changed_params.store(value, Ordering::Relaxed);
    }
}

/// Dispatch-side task state.
pub struct TaskCore {
    pub shared: Arc<TaskShared>,
    pub queue_rx: flume::Receiver<QueueItem>,
    pub params: ParameterRegistry,
    pub inputs: Vec<InputConnection>,
    pub last_state: ProcessingState,
    pub thread_policy: ThreadPolicy,
    pub runtime: tokio::runtime::Handle,
}

impl TaskCore {
    pub fn new(name: &str, using_data: bool) -> Self {
        let (shared, queue_rx) = TaskShared::new(name, using_data);
        let mut params = ParameterRegistry::new();
        params.register(
            Parameter::string_value("processingState", "Processing State", "")
                .with_advanced(true),
        );
        params.register(Parameter::bool_value("editingEnabled", "Editing Enabled", true).with_editable(false));
        params.register(
            Parameter::bool_value("alwaysUsingData", "Always Using Data", false)
                .with_advanced(true),
        );
        Self {
            shared,
            queue_rx,
            params,
            inputs: Vec::new(),
            last_state: ProcessingState::Invalid,
            thread_policy: ThreadPolicy::default(),
            runtime: tokio::runtime::Handle::current(),
        }
    }

    pub fn name(&self) -> String {
        self.shared.name()
    }

    pub fn add_input(&mut self, connection: InputConnection) {
        self.inputs.push(connection);
        self.shared.ensure_stats_slots(self.inputs.len());
    }

    /// Pin the task as a data sink: it always wants input, independent of
    /// anything downstream. Keeps the registry's view in step with the flag.
    pub fn pin_always_using_data(&mut self) {
        self.shared.set_always_using_data(true);
        if let Some(parameter) = self.params.get_mut("alwaysUsingData") {
            parameter.set_value_and_original(ParamValue::Bool(true));
        }
    }
}

/// Behaviour of one concrete task kind. Default implementations give the
/// common cases: state hooks succeed, data forwards to the next task,
/// recording/shutdown/timeout requests are ignored.
#[async_trait]
pub trait TaskUnit: Send {
    fn core(&self) -> &TaskCore;
    fn core_mut(&mut self) -> &mut TaskCore;

    /// Run on the runtime before the dispatch loop starts: bind sockets,
    /// open devices, spawn device-side loops.
    async fn start(&mut self) -> Result<()> {
        Ok(())
    }

    /// Whether this unit's dispatch loop runs on a dedicated OS thread.
    fn dedicated_thread(&self) -> bool {
        false
    }

    fn enter_initialize(&mut self) -> bool {
        self.core().shared.reset_stats();
        self.core().shared.clear_error();
        true
    }

    fn enter_auto_diagnostic(&mut self) -> bool {
        true
    }

    fn enter_calibrate(&mut self) -> bool {
        true
    }

    fn enter_run(&mut self) -> bool {
        true
    }

    fn enter_stop(&mut self) -> bool {
        true
    }

    fn deliver_data(&mut self, envelope: Envelope, slot: usize) -> Result<()> {
        self.core().shared.forward_next(envelope, slot);
        Ok(())
    }

    /// Bracket hooks around a parameters-change batch. Controllers use them
    /// to let the hosted algorithm prepare for and react to new values.
    fn begin_parameters_change(&mut self) {}
    fn end_parameters_change(&mut self) {}

    fn handle_recording_state_change(&mut self, _request: &RecordingStateChange) -> bool {
        true
    }

    fn handle_shutdown_request(&mut self) -> bool {
        true
    }

    fn handle_timeout(&mut self) -> bool {
        true
    }

    fn handle_marker(&mut self, _marker: Box<dyn Any + Send>) {}

    /// Called after the dispatch loop exits, in the dispatch context.
    fn handle_close(&mut self) {}
}

/// Drive the task to `goal`, visiting intermediate states per the transition
/// table and running the per-state hooks. Returns true iff the goal state was
/// reached; a hook failure lands the task in Failure.
pub fn enter_processing_state(unit: &mut dyn TaskUnit, goal: ProcessingState) -> bool {
    let shared = unit.core().shared.clone();
    tracing::info!(task = %shared.name(), current = %shared.state(), %goal, "state change");

    if goal.is_normal() {
        unit.core_mut().last_state = goal;
    }

    let mut ok = true;
    let mut current = shared.state();
    while current != goal {
        let next = ProcessingState::next_toward(goal, current);
        ok = match next {
            ProcessingState::Initialize => unit.enter_initialize(),
            ProcessingState::AutoDiagnostic => unit.enter_auto_diagnostic(),
            ProcessingState::Calibrate => unit.enter_calibrate(),
            ProcessingState::Run => unit.enter_run(),
            ProcessingState::Stop => unit.enter_stop(),
            // Invalid and Failure are never legitimate waypoints.
            _ => false,
        };
        if !ok {
            break;
        }
        current = next;
        shared.set_state(current);
    }

    if !ok {
        if !shared.has_error() {
            shared.set_error_text("Unknown", false);
        }
        enter_failure(unit);
    }

    mirror_state_parameter(unit);
    unit.core().shared.update_using_data();
    ok
}

/// Move into Failure, visiting Stop first if we were not already there.
pub fn enter_failure(unit: &mut dyn TaskUnit) {
    let shared = unit.core().shared.clone();
    if shared.state() == ProcessingState::Failure {
        return;
    }
    if shared.state() != ProcessingState::Stop {
        let _ = unit.enter_stop();
    }
    shared.set_state(ProcessingState::Failure);
    mirror_state_parameter(unit);
}

/// Restore the most recent normal state, typically after recovering from
/// Failure.
pub fn enter_last_processing_state(unit: &mut dyn TaskUnit) -> bool {
    unit.core().shared.clear_error();
    let last = unit.core().last_state;
    if last == ProcessingState::Invalid {
        return true;
    }
    enter_processing_state(unit, last)
}

/// Record an error and fail the task.
pub fn fail(unit: &mut dyn TaskUnit, error: &str) {
    let shared = unit.core().shared.clone();
    shared.set_error_text(error, false);
    enter_failure(unit);
    shared.update_using_data();
}

fn mirror_state_parameter(unit: &mut dyn TaskUnit) {
    let state = unit.core().shared.state();
    if let Some(parameter) = unit.core_mut().params.get_mut("processingState") {
        parameter.set_value_and_original(ParamValue::String(state.name().to_string()));
    }
}

fn do_parameters_change(unit: &mut dyn TaskUnit, request: &ParametersChange) -> bool {
    unit.begin_parameters_change();
    let applied = unit
        .core_mut()
        .params
        .apply(&request.values, request.originals);
    if let Err(err) = applied {
        // The offending message is consumed, not re-dispatched.
        unit.end_parameters_change();
        fail(unit, &err.to_string());
        return true;
    }

    let shared = unit.core().shared.clone();
    if let Some(always) = unit.core().params.get_bool("alwaysUsingData") {
        shared.set_always_using_data(always);
    }
    shared.set_changed_parameters(unit.core().params.has_changed());

    // A processingState entry in the batch doubles as a state-change request.
    let requested = unit
        .core()
        .params
        .get_string("processingState")
        .and_then(ProcessingState::from_name);
    if let Some(goal) = requested {
        if goal.is_normal() && goal != shared.state() {
            enter_processing_state(unit, goal);
        }
    }

    unit.end_parameters_change();
    shared.update_using_data();
    true
}

fn handle_control(unit: &mut dyn TaskUnit, control: &ControlMessage) -> bool {
    match control {
        ControlMessage::ParametersChange(request) => do_parameters_change(unit, request),
        ControlMessage::ProcessingStateChange(goal) => {
            enter_processing_state(unit, *goal);
            true
        }
        ControlMessage::RecordingStateChange(request) => {
            unit.handle_recording_state_change(request)
        }
        ControlMessage::Shutdown => unit.handle_shutdown_request(),
        ControlMessage::ClearStats => {
            unit.core().shared.reset_stats();
            true
        }
        ControlMessage::Timeout => unit.handle_timeout(),
    }
}

pub enum Flow {
    Continue,
    Break,
}

/// Process one queue item: the common demultiplex shared by every task kind.
pub fn dispatch(unit: &mut dyn TaskUnit, item: QueueItem) -> Flow {
    match item {
        QueueItem::Close => Flow::Break,
        QueueItem::Marker(marker) => {
            if marker.downcast_ref::<FailureNotice>().is_some() {
                enter_failure(unit);
                unit.core().shared.update_using_data();
            } else {
                unit.handle_marker(marker);
            }
            Flow::Continue
        }
        QueueItem::Envelope { envelope, slot } => {
            if let Some(control) = envelope.as_control().cloned() {
                // Control messages propagate to the next task before local
                // handling; timeouts stay local.
                if control.forwards_downstream() {
                    unit.core().shared.forward_next(envelope.duplicate(), 0);
                }
                if !handle_control(unit, &control) {
                    fail(unit, &format!("failed {} request", control.name()));
                }
            } else {
                match envelope.native() {
                    Ok(native) => {
                        let sequence = native.header().sequence();
                        unit.core()
                            .shared
                            .update_input_stats(slot, envelope.size(), sequence);
                    }
                    Err(_) if envelope.is_raw() => {
                        unit.core()
                            .shared
                            .update_input_stats_raw(slot, envelope.size());
                    }
                    Err(err) => {
                        fail(unit, &format!("undecodable message: {err}"));
                        return Flow::Continue;
                    }
                }
                if let Err(err) = unit.deliver_data(envelope, slot) {
                    fail(unit, &format!("failed to deliver message: {err}"));
                }
            }
            Flow::Continue
        }
    }
}

/// Dispatch loop for tasks living on the async runtime.
pub async fn run_dispatch(mut unit: Box<dyn TaskUnit>) {
    let rx = unit.core().queue_rx.clone();
    let name = unit.core().name();
    tracing::debug!(task = %name, "dispatch loop starting");
    while let Ok(item) = rx.recv_async().await {
        if matches!(dispatch(unit.as_mut(), item), Flow::Break) {
            break;
        }
    }
    unit.handle_close();
    tracing::debug!(task = %name, "dispatch loop finished");
}

/// Dispatch loop for tasks with a dedicated OS thread.
pub fn run_dispatch_blocking(mut unit: Box<dyn TaskUnit>) {
    let rx = unit.core().queue_rx.clone();
    let name = unit.core().name();
    tracing::debug!(task = %name, "dispatch thread starting");
    while let Ok(item) = rx.recv() {
        if matches!(dispatch(unit.as_mut(), item), Flow::Break) {
            break;
        }
    }
    unit.handle_close();
    tracing::debug!(task = %name, "dispatch thread finished");
}
