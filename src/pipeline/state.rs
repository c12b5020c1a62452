//! Load state machine

use std::sync::{Mutex, PoisonError};

use log::{debug, warn};

use super::error::FailureKind;

/// Where a run is.
///
/// `Idle -> Staging -> Opening -> Rendering(i) -> Done`, with `Failed(kind)`
/// reachable from every non-terminal state. Terminal states absorb.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Staging,
    Opening,
    /// Rendering the given page
    Rendering(usize),
    Done,
    Failed(FailureKind),
}

impl PipelineState {
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed(_))
    }

    #[must_use]
    pub const fn is_running(&self) -> bool {
        matches!(self, Self::Staging | Self::Opening | Self::Rendering(_))
    }

    /// Whether moving from `self` to `next` is allowed
    #[must_use]
    pub fn can_transition_to(&self, next: &PipelineState) -> bool {
        match (self, next) {
            (Self::Idle, Self::Staging)
            | (Self::Staging, Self::Opening)
            | (Self::Opening, Self::Rendering(_))
            | (Self::Rendering(_), Self::Rendering(_))
            | (Self::Opening | Self::Rendering(_), Self::Done) => true,
            (from, Self::Failed(_)) => !from.is_terminal(),
            _ => false,
        }
    }
}

/// Shared, checked holder of a run's state
#[derive(Debug)]
pub(crate) struct StateCell {
    state: Mutex<PipelineState>,
}

impl StateCell {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(PipelineState::Idle),
        }
    }

    pub(crate) fn get(&self) -> PipelineState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Move to `next`; illegal transitions are refused and logged
    pub(crate) fn advance(&self, next: PipelineState) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if !state.can_transition_to(&next) {
            warn!("Refusing pipeline transition {:?} -> {:?}", *state, next);
            debug_assert!(false, "illegal pipeline transition {:?} -> {next:?}", *state);
            return false;
        }
        if !matches!((*state, next), (PipelineState::Rendering(_), PipelineState::Rendering(_))) {
            debug!("Pipeline {:?} -> {:?}", *state, next);
        }
        *state = next;
        true
    }
}
