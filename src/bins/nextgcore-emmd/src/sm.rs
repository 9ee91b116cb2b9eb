//! EMM State Machine
//!
//! Registration state of a subscriber as seen by the common-procedure engine.

use std::fmt;

use crate::context::UeId;

// ============================================================================
// EMM State
// ============================================================================

/// EMM registration state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum EmmState {
    /// Initial state
    #[default]
    Initial,
    /// De-registered state
    DeRegistered,
    /// Registered state
    Registered,
    /// Authentication state
    Authentication,
    /// Security mode state
    SecurityMode,
    /// Initial context setup state
    InitialContextSetup,
    /// Exception state
    Exception,
}

impl EmmState {
    /// Common procedures may only run while de-registered or registered.
    pub fn permits_common_procedure(&self) -> bool {
        matches!(self, EmmState::DeRegistered | EmmState::Registered)
    }
}

impl fmt::Display for EmmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EmmState::Initial => write!(f, "INITIAL"),
            EmmState::DeRegistered => write!(f, "DE_REGISTERED"),
            EmmState::Registered => write!(f, "REGISTERED"),
            EmmState::Authentication => write!(f, "AUTHENTICATION"),
            EmmState::SecurityMode => write!(f, "SECURITY_MODE"),
            EmmState::InitialContextSetup => write!(f, "INITIAL_CONTEXT_SETUP"),
            EmmState::Exception => write!(f, "EXCEPTION"),
        }
    }
}

// ============================================================================
// EMM FSM
// ============================================================================

/// EMM State Machine
#[derive(Debug, Clone)]
pub struct EmmFsm {
    /// Current state
    state: EmmState,
    /// Subscriber identifier
    ue_id: UeId,
}

impl EmmFsm {
    /// Create a new EMM FSM in the initial state
    pub fn new(ue_id: UeId) -> Self {
        Self {
            state: EmmState::Initial,
            ue_id,
        }
    }

    /// Initial transition: a fresh context starts de-registered
    pub fn init(&mut self) {
        if self.state == EmmState::Initial {
            self.transition(EmmState::DeRegistered);
        }
    }

    /// Get current state
    pub fn state(&self) -> EmmState {
        self.state
    }

    /// Transition to a new state
    pub fn transition(&mut self, new_state: EmmState) {
        log::debug!("EMM FSM [ue_id={}]: {} -> {}", self.ue_id, self.state, new_state);
        self.state = new_state;
    }
}
