//! Task processing states and the transition graph between them.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProcessingState {
    Invalid,
    Initialize,
    AutoDiagnostic,
    Calibrate,
    Run,
    Stop,
    Failure,
}

use ProcessingState::*;

pub const STATE_COUNT: usize = 7;

/// Transition matrix for processing state changes. The first index is the
/// goal state, the second the current state; the stored value is the next
/// state to visit on the way to the goal.
#[rustfmt::skip]
const TRANSITIONS: [[ProcessingState; STATE_COUNT]; STATE_COUNT] = [
    // goal: Invalid -- not a state to move to, stay put
    //  Invalid     Initialize  AutoDiag    Calibrate   Run         Stop        Failure
    [   Invalid,    Invalid,    Invalid,    Invalid,    Invalid,    Invalid,    Invalid    ],
    // goal: Initialize
    [   Initialize, Initialize, Stop,       Stop,       Stop,       Initialize, Initialize ],
    // goal: AutoDiagnostic
    [   Initialize, AutoDiagnostic, Stop,   Stop,       Stop,       Initialize, Initialize ],
    // goal: Calibrate
    [   Initialize, Calibrate,  Stop,       Calibrate,  Stop,       Initialize, Initialize ],
    // goal: Run
    [   Initialize, Run,        Stop,       Stop,       Run,        Initialize, Initialize ],
    // goal: Stop
    [   Initialize, Stop,       Stop,       Stop,       Stop,       Stop,       Initialize ],
    // goal: Failure
    [   Failure,    Failure,    Failure,    Failure,    Failure,    Failure,    Failure    ],
];

impl ProcessingState {
    pub const fn index(self) -> usize {
        match self {
            Invalid => 0,
            Initialize => 1,
            AutoDiagnostic => 2,
            Calibrate => 3,
            Run => 4,
            Stop => 5,
            Failure => 6,
        }
    }

    /// The state to visit next when moving from `current` toward `goal`.
    pub fn next_toward(goal: ProcessingState, current: ProcessingState) -> ProcessingState {
        TRANSITIONS[goal.index()][current.index()]
    }

    /// A state an operator can legitimately command a task into.
    pub fn is_normal(self) -> bool {
        !matches!(self, Invalid | Failure)
    }

    /// States in which a task performs work on data messages.
    pub fn is_active(self) -> bool {
        matches!(self, AutoDiagnostic | Calibrate | Run)
    }

    pub fn name(self) -> &'static str {
        match self {
            Invalid => "Invalid",
            Initialize => "Initialize",
            AutoDiagnostic => "AutoDiagnostic",
            Calibrate => "Calibrate",
            Run => "Run",
            Stop => "Stop",
            Failure => "Failure",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "Invalid" => Invalid,
            "Initialize" => Initialize,
            "AutoDiagnostic" => AutoDiagnostic,
            "Calibrate" => Calibrate,
            "Run" => Run,
            "Stop" => Stop,
            "Failure" => Failure,
            _ => return None,
        })
    }

    pub fn from_index(index: usize) -> Option<Self> {
        Some(match index {
            0 => Invalid,
            1 => Initialize,
            2 => AutoDiagnostic,
            3 => Calibrate,
            4 => Run,
            5 => Stop,
            6 => Failure,
            _ => return None,
        })
    }
}

impl std::fmt::Display for ProcessingState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Walk the table from `current` toward `goal` the way the task driver
    /// does, bailing out if it fails to converge.
    fn walk(mut current: ProcessingState, goal: ProcessingState) -> Vec<ProcessingState> {
        let mut visited = Vec::new();
        for _ in 0..8 {
            if current == goal {
                return visited;
            }
            current = ProcessingState::next_toward(goal, current);
            visited.push(current);
        }
        panic!("did not converge from {:?} to {:?}", visited, goal);
    }

    #[test]
    fn run_from_scratch_passes_through_initialize() {
        assert_eq!(walk(Invalid, Run), vec![Initialize, Run]);
    }

    #[test]
    fn initialize_after_run_visits_stop() {
        assert_eq!(walk(Run, Initialize), vec![Stop, Initialize]);
    }

    #[test]
    fn every_normal_goal_is_reachable_from_every_state() {
        for goal_idx in 0..STATE_COUNT {
            let goal = ProcessingState::from_index(goal_idx).unwrap();
            if !goal.is_normal() {
                continue;
            }
            for cur_idx in 0..STATE_COUNT {
                let current = ProcessingState::from_index(cur_idx).unwrap();
                walk(current, goal);
            }
        }
    }

    #[test]
    fn failure_is_absorbing_until_commanded_out() {
        assert_eq!(ProcessingState::next_toward(Failure, Run), Failure);
        // Recovery routes through Initialize.
        assert_eq!(ProcessingState::next_toward(Run, Failure), Initialize);
    }
}
