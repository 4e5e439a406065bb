//! Algorithm hosting interface.
//!
//! An algorithm is the pluggable numeric stage a controller task hosts. It
//! registers its runtime parameters at startup, consumes native messages,
//! and emits derived messages through the context handed to each call.

pub mod factory;
pub mod offset;
pub mod passthrough;

use crate::core::envelope::Envelope;
use crate::core::params::ParameterRegistry;
use crate::core::task::TaskShared;
use crate::messages::header::NativeMessage;
use crate::tasks::recorder::Recorder;
use anyhow::Result;
use std::sync::Arc;

/// Timer management request made by an algorithm during a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerRequest {
    Start(u32),
    Cancel,
}

/// What an algorithm sees of its hosting controller during a call: the
/// parameter registry, the output channels, and the alarm timer.
pub struct AlgorithmContext<'a> {
    pub params: &'a ParameterRegistry,
    shared: &'a Arc<TaskShared>,
    recorders: &'a [Recorder],
    recording: bool,
    timer_request: &'a mut Option<TimerRequest>,
}

impl<'a> AlgorithmContext<'a> {
    pub fn new(
        params: &'a ParameterRegistry,
        shared: &'a Arc<TaskShared>,
        recorders: &'a [Recorder],
        recording: bool,
        timer_request: &'a mut Option<TimerRequest>,
    ) -> Self {
        Self {
            params,
            shared,
            recorders,
            recording,
            timer_request,
        }
    }

    /// Emit a message on the given output slot. When recording is on, a
    /// duplicate goes to the channel's recorder first.
    pub fn send(&mut self, message: Arc<dyn NativeMessage>, slot: usize) -> bool {
        let envelope = Envelope::wrap_native(message);
        if self.recording {
            if let Some(recorder) = self.recorders.get(slot) {
                if !recorder.put(envelope.duplicate()) {
                    tracing::error!(task = %self.shared.name(), slot, "failed to record output");
                    self.shared.set_error_text("Failed to record data", false);
                }
            }
        }
        self.shared.send_envelope(envelope, slot)
    }

    /// Arrange for `process_alarm` to be invoked every `secs` seconds.
    pub fn set_timer_secs(&mut self, secs: u32) {
        *self.timer_request = Some(if secs > 0 {
            TimerRequest::Start(secs)
        } else {
            TimerRequest::Cancel
        });
    }

    pub fn cancel_timer(&mut self) {
        *self.timer_request = Some(TimerRequest::Cancel);
    }
}

/// A hosted processing stage. All hooks default to success; `process` is the
/// one method every algorithm must provide.
pub trait Algorithm: Send {
    /// Called once before any processing. Register runtime parameters here.
    fn startup(&mut self, params: &mut ParameterRegistry) -> Result<()>;

    fn shutdown(&mut self) {}

    fn reset(&mut self) -> bool {
        true
    }

    fn begin_auto_diag(&mut self) -> bool {
        true
    }

    fn begin_calibration(&mut self) -> bool {
        true
    }

    fn begin_run(&mut self) -> bool {
        true
    }

    fn stop(&mut self) -> bool {
        true
    }

    fn begin_parameter_changes(&mut self) {}

    fn end_parameter_changes(&mut self, _params: &ParameterRegistry) {}

    fn recording_started(&mut self) {}

    fn recording_stopped(&mut self) {}

    /// Handle one data message. Returning false puts the controller into
    /// Failure.
    fn process(
        &mut self,
        message: &Arc<dyn NativeMessage>,
        slot: usize,
        ctx: &mut AlgorithmContext,
    ) -> bool;

    /// Invoked on alarm-timer expiry while the controller is active.
    fn process_alarm(&mut self, _ctx: &mut AlgorithmContext) {}
}
