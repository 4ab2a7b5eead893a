//! Capture state machine states and tick dispatch table

use std::fmt;

use serde::{Deserialize, Serialize};

/// Capture sequence state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CaptureState {
    /// No capture sequence. Ticks here are unexpected.
    #[default]
    Inactive,
    /// Armed; the next tick anchors the time base
    Starting,
    /// Validating the anchor against incoming ticks
    WarmingUp,
    /// Time base established, first content captured
    Started,
    /// Waiting for the first scheduled frame
    MovingToRun,
    /// Filling and integrating on every tick
    Running,
    /// Capture halting
    MovingToInactive,
}

/// Work one tick performs in a state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TickAction {
    HaltOutputs,
    Anchor,
    WarmUp,
    AcquireFirstContent,
    AwaitRunFrom,
    Run,
    FinishHalt,
}

/// Next state chosen by a tick action
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Transition {
    pub next: CaptureState,
    /// Run the next state's action on this same tick
    pub same_tick: bool,
}

impl Transition {
    /// Move to `next` and wait for the following tick
    pub fn to(next: CaptureState) -> Self {
        Self {
            next,
            same_tick: false,
        }
    }

    /// Move to `next` and handle it on this tick
    pub fn then(next: CaptureState) -> Self {
        Self {
            next,
            same_tick: true,
        }
    }
}

impl CaptureState {
    pub(crate) fn tick_action(self) -> TickAction {
        match self {
            CaptureState::Inactive => TickAction::HaltOutputs,
            CaptureState::Starting => TickAction::Anchor,
            CaptureState::WarmingUp => TickAction::WarmUp,
            CaptureState::Started => TickAction::AcquireFirstContent,
            CaptureState::MovingToRun => TickAction::AwaitRunFrom,
            CaptureState::Running => TickAction::Run,
            CaptureState::MovingToInactive => TickAction::FinishHalt,
        }
    }

    /// Whether the time base has been established
    pub fn is_locked(self) -> bool {
        matches!(
            self,
            CaptureState::Started | CaptureState::MovingToRun | CaptureState::Running
        )
    }
}

impl fmt::Display for CaptureState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CaptureState::Inactive => "inactive",
            CaptureState::Starting => "starting",
            CaptureState::WarmingUp => "warming-up",
            CaptureState::Started => "started",
            CaptureState::MovingToRun => "moving-to-run",
            CaptureState::Running => "running",
            CaptureState::MovingToInactive => "moving-to-inactive",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_state_has_an_action() {
        let states = [
            CaptureState::Inactive,
            CaptureState::Starting,
            CaptureState::WarmingUp,
            CaptureState::Started,
            CaptureState::MovingToRun,
            CaptureState::Running,
            CaptureState::MovingToInactive,
        ];
        let actions: Vec<_> = states.iter().map(|s| s.tick_action()).collect();
        for (i, a) in actions.iter().enumerate() {
            assert!(!actions[i + 1..].contains(a));
        }
    }

    #[test]
    fn test_locked_states() {
        assert!(!CaptureState::WarmingUp.is_locked());
        assert!(CaptureState::Started.is_locked());
        assert!(CaptureState::Running.is_locked());
        assert!(!CaptureState::MovingToInactive.is_locked());
    }
}
