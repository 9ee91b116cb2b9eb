//! EMM Procedures
//!
//! Records for common procedures (request/response exchanges run by the
//! engine) and for specific procedures (attach, TAU) that may own them.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use crate::config::TimerConfig;
use crate::context::{EmmContext, UeId};
use crate::emm_build::RequestedIdentityType;
use crate::emm_sap::{EmmAsPrimitive, EmmSecurityData};
use crate::sm::EmmState;
use crate::timer::{NasTimer, NasTimerKind, TimerId, TimerService};

// ============================================================================
// Procedure Types
// ============================================================================

/// Common procedure type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommonProcType {
    /// Identification
    Identification,
}

impl CommonProcType {
    /// Retransmission timer guarding the request
    pub fn timer_kind(&self) -> NasTimerKind {
        match self {
            CommonProcType::Identification => NasTimerKind::T3470,
        }
    }
}

impl fmt::Display for CommonProcType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommonProcType::Identification => write!(f, "IDENTIFICATION"),
        }
    }
}

/// Terminal outcome of a common procedure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcedureOutcome {
    /// Response received and processed
    Success,
    /// Rejected by the network or the peer
    Reject,
    /// Retransmissions exhausted
    Abort,
}

// ============================================================================
// Terminal Notifier
// ============================================================================

pub type SuccessHandler = Box<dyn FnOnce(&mut EmmContext) + Send>;
pub type FailureHandler = Box<dyn FnOnce(&mut EmmContext, ProcedureOutcome) + Send>;

/// Initiator callbacks. Each fires at most once; the notifier is consumed
/// when the procedure concludes.
#[derive(Default)]
pub struct TerminalNotifier {
    on_success: Option<SuccessHandler>,
    on_failure: Option<FailureHandler>,
}

impl TerminalNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_success(mut self, f: impl FnOnce(&mut EmmContext) + Send + 'static) -> Self {
        self.on_success = Some(Box::new(f));
        self
    }

    pub fn on_failure(
        mut self,
        f: impl FnOnce(&mut EmmContext, ProcedureOutcome) + Send + 'static,
    ) -> Self {
        self.on_failure = Some(Box::new(f));
        self
    }

    /// Success reaches the initiator only when `notify` is set; reject and
    /// abort always do.
    pub(crate) fn deliver(self, ctx: &mut EmmContext, outcome: ProcedureOutcome, notify: bool) {
        match outcome {
            ProcedureOutcome::Success => {
                if let (true, Some(f)) = (notify, self.on_success) {
                    f(ctx);
                }
            }
            ProcedureOutcome::Reject | ProcedureOutcome::Abort => {
                if let Some(f) = self.on_failure {
                    f(ctx, outcome);
                }
            }
        }
    }
}

impl fmt::Debug for TerminalNotifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TerminalNotifier")
            .field("on_success", &self.on_success.is_some())
            .field("on_failure", &self.on_failure.is_some())
            .finish()
    }
}

// ============================================================================
// Common Procedures
// ============================================================================

/// Fields shared by every common procedure
#[derive(Debug)]
pub struct ProcBase {
    /// Owning subscriber
    pub ue_id: UeId,
    /// Owning specific procedure; never kept alive by the child
    pub parent: Option<Weak<dyn OwningProcedure>>,
    pub(crate) notifier: Option<TerminalNotifier>,
    /// Registration state when the procedure was started
    pub previous_state: EmmState,
}

/// Identification procedure
#[derive(Debug)]
pub struct IdentificationProc {
    pub base: ProcBase,
    /// Identity requested from the UE
    pub identity_type: RequestedIdentityType,
    /// Requests sent so far beyond the initial one
    pub retransmission_count: u32,
    /// T3470
    pub t3470: NasTimer,
}

/// Type-specific parameters given when starting a common procedure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommonProcParams {
    Identification { identity_type: RequestedIdentityType },
}

impl CommonProcParams {
    pub fn proc_type(&self) -> CommonProcType {
        match self {
            CommonProcParams::Identification { .. } => CommonProcType::Identification,
        }
    }

    pub(crate) fn instantiate(self, base: ProcBase) -> CommonProcedure {
        match self {
            CommonProcParams::Identification { identity_type } => {
                CommonProcedure::Identification(IdentificationProc {
                    base,
                    identity_type,
                    retransmission_count: 0,
                    t3470: NasTimer::new(NasTimerKind::T3470),
                })
            }
        }
    }

    pub(crate) fn apply(self, procedure: &mut CommonProcedure) {
        match (self, procedure) {
            (
                CommonProcParams::Identification { identity_type },
                CommonProcedure::Identification(proc),
            ) => proc.identity_type = identity_type,
        }
    }
}

/// Active common procedure
#[derive(Debug)]
pub enum CommonProcedure {
    Identification(IdentificationProc),
}

impl CommonProcedure {
    pub fn proc_type(&self) -> CommonProcType {
        match self {
            CommonProcedure::Identification(_) => CommonProcType::Identification,
        }
    }

    pub fn base(&self) -> &ProcBase {
        match self {
            CommonProcedure::Identification(proc) => &proc.base,
        }
    }

    pub fn base_mut(&mut self) -> &mut ProcBase {
        match self {
            CommonProcedure::Identification(proc) => &mut proc.base,
        }
    }

    pub fn retransmission_count(&self) -> u32 {
        match self {
            CommonProcedure::Identification(proc) => proc.retransmission_count,
        }
    }

    pub(crate) fn retransmission_count_mut(&mut self) -> &mut u32 {
        match self {
            CommonProcedure::Identification(proc) => &mut proc.retransmission_count,
        }
    }

    pub fn timer(&self) -> &NasTimer {
        match self {
            CommonProcedure::Identification(proc) => &proc.t3470,
        }
    }

    pub(crate) fn timer_mut(&mut self) -> &mut NasTimer {
        match self {
            CommonProcedure::Identification(proc) => &mut proc.t3470,
        }
    }

    /// Request message for the access stratum
    pub(crate) fn request(&self, security: Option<EmmSecurityData>) -> EmmAsPrimitive {
        match self {
            CommonProcedure::Identification(proc) => EmmAsPrimitive::SendIdentityRequest {
                ue_id: proc.base.ue_id,
                security,
                identity_type: proc.identity_type,
            },
        }
    }
}

// ============================================================================
// Specific (Owning) Procedures
// ============================================================================

/// Capability a child procedure holds on its owner
pub trait OwningProcedure: Send + Sync {
    /// (Re)arm the owner's retry timer while `stale_ue_id` is cleaned up
    fn restart_retry(&self, stale_ue_id: UeId);
}

/// Specific procedure type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SpecificProcType {
    Attach,
    TrackingAreaUpdate,
}

impl fmt::Display for SpecificProcType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpecificProcType::Attach => write!(f, "ATTACH"),
            SpecificProcType::TrackingAreaUpdate => write!(f, "TAU"),
        }
    }
}

#[derive(Debug)]
struct RetryState {
    retry_timer: NasTimer,
    old_ue_id: Option<UeId>,
    retry_count: u32,
}

/// Retry bookkeeping read when the retry timer fires
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RetryExpiry {
    pub old_ue_id: Option<UeId>,
    pub retry_count: u32,
}

/// Pending specific procedure of a subscriber
pub struct SpecificProcedure {
    ue_id: UeId,
    proc_type: SpecificProcType,
    timers: Arc<dyn TimerService>,
    retry: TimerConfig,
    state: Mutex<RetryState>,
}

impl SpecificProcedure {
    pub fn new(
        ue_id: UeId,
        proc_type: SpecificProcType,
        timers: Arc<dyn TimerService>,
        retry: TimerConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            ue_id,
            proc_type,
            timers,
            retry,
            state: Mutex::new(RetryState {
                retry_timer: NasTimer::new(NasTimerKind::SpecificRetry),
                old_ue_id: None,
                retry_count: 0,
            }),
        })
    }

    fn state(&self) -> MutexGuard<'_, RetryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn ue_id(&self) -> UeId {
        self.ue_id
    }

    pub fn proc_type(&self) -> SpecificProcType {
        self.proc_type
    }

    /// Stale subscriber this procedure is waiting on
    pub fn old_ue_id(&self) -> Option<UeId> {
        self.state().old_ue_id
    }

    pub fn retry_timer_id(&self) -> Option<TimerId> {
        self.state().retry_timer.id()
    }

    /// Parent reference handed to child common procedures
    pub fn as_parent(self: &Arc<Self>) -> Weak<dyn OwningProcedure> {
        let parent = Arc::downgrade(self);
        parent
    }

    pub(crate) fn stop(&self) {
        self.state().retry_timer.stop(&*self.timers);
    }

    /// Consume a retry timer event. `None` if `timer_id` is not the armed one.
    pub(crate) fn retry_expired(&self, timer_id: TimerId) -> Option<RetryExpiry> {
        let mut state = self.state();
        if !state.retry_timer.matches(timer_id) {
            return None;
        }
        state.retry_timer.mark_fired();
        Some(RetryExpiry {
            old_ue_id: state.old_ue_id,
            retry_count: state.retry_count,
        })
    }

    /// Arm the retry timer again; false once the retry budget is spent
    pub(crate) fn rearm(&self) -> bool {
        let mut state = self.state();
        if state.retry_count >= self.retry.max_count {
            return false;
        }
        state.retry_count += 1;
        state.retry_timer.start(&*self.timers, self.ue_id, self.retry.duration);
        true
    }

    /// Stop waiting and return the stale subscriber waited on
    pub(crate) fn finish_retry(&self) -> Option<UeId> {
        let mut state = self.state();
        state.retry_timer.stop(&*self.timers);
        state.retry_count = 0;
        state.old_ue_id.take()
    }
}

impl OwningProcedure for SpecificProcedure {
    fn restart_retry(&self, stale_ue_id: UeId) {
        let mut state = self.state();
        state.retry_timer.start(&*self.timers, self.ue_id, self.retry.duration);
        state.old_ue_id = Some(stale_ue_id);
        state.retry_count = 1;
        log::info!(
            "[ue_id={}] {} retry armed, waiting on stale ue_id={}",
            self.ue_id,
            self.proc_type,
            stale_ue_id
        );
    }
}

impl fmt::Debug for SpecificProcedure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpecificProcedure")
            .field("ue_id", &self.ue_id)
            .field("proc_type", &self.proc_type)
            .field("retry", &self.retry)
            .field("state", &*self.state())
            .finish()
    }
}
