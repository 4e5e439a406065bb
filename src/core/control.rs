//! Control-plane messages.
//!
//! Control messages ride the same queues as data but short-circuit normal
//! processing. The set of subtypes is closed: adding one requires a
//! coordinated update of every task's dispatch table.

use crate::core::state::ProcessingState;
use std::path::PathBuf;

/// Classification code for raw device bytes.
pub const KIND_RAW: u32 = 0;
/// Classification code for data envelopes.
pub const KIND_DATA: u32 = 1;
/// Base classification code for control envelopes. A control envelope's code
/// is `KIND_CONTROL + subtype`, so control detection is a single range check.
pub const KIND_CONTROL: u32 = 0x10;

/// Batched runtime-parameter update. Values ride in the generic value shape
/// used by the remote-control surface: a list of name/value pairs plus a flag
/// marking them as configured originals rather than runtime edits.
#[derive(Debug, Clone)]
pub struct ParametersChange {
    pub originals: bool,
    pub values: Vec<(String, serde_json::Value)>,
}

/// Start (with a target directory) or stop recording.
#[derive(Debug, Clone)]
pub struct RecordingStateChange {
    pub path: Option<PathBuf>,
}

impl RecordingStateChange {
    pub fn start(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
        }
    }

    pub fn stop() -> Self {
        Self { path: None }
    }

    pub fn is_on(&self) -> bool {
        self.path.is_some()
    }
}

#[derive(Debug, Clone)]
pub enum ControlMessage {
    ParametersChange(ParametersChange),
    ProcessingStateChange(ProcessingState),
    RecordingStateChange(RecordingStateChange),
    Shutdown,
    ClearStats,
    Timeout,
}

impl ControlMessage {
    pub fn subtype(&self) -> u32 {
        match self {
            ControlMessage::ParametersChange(_) => 0,
            ControlMessage::ProcessingStateChange(_) => 1,
            ControlMessage::RecordingStateChange(_) => 2,
            ControlMessage::Shutdown => 3,
            ControlMessage::ClearStats => 4,
            ControlMessage::Timeout => 5,
        }
    }

    pub fn kind_code(&self) -> u32 {
        KIND_CONTROL + self.subtype()
    }

    pub fn name(&self) -> &'static str {
        match self {
            ControlMessage::ParametersChange(_) => "parameters-change",
            ControlMessage::ProcessingStateChange(_) => "processing-state-change",
            ControlMessage::RecordingStateChange(_) => "recording-state-change",
            ControlMessage::Shutdown => "shutdown",
            ControlMessage::ClearStats => "clear-stats",
            ControlMessage::Timeout => "timeout",
        }
    }

    /// Timeouts are local to the task that scheduled them and never travel
    /// downstream.
    pub fn forwards_downstream(&self) -> bool {
        !matches!(self, ControlMessage::Timeout)
    }
}
