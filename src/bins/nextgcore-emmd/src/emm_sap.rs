//! EMM Service Access Points
//!
//! Primitives exchanged between the EMM engine and the registration,
//! access-stratum and core-network layers, and the dispatcher routing them.
//!
//! Layer handlers run inside the sending subscriber's lock domain and must
//! not call back into the engine. Work that needs the engine (context
//! release, session teardown) is queued and processed by the run loop.

use std::fmt;
use std::sync::Arc;

use crate::context::{NasSecurityContext, UeId};
use crate::emm_build::{EmmCause, RequestedIdentityType};
use crate::error::EmmResult;
use crate::procedure::{CommonProcType, ProcedureOutcome, SpecificProcType};
use crate::sm::EmmState;

// ============================================================================
// Registration Layer (EMMREG)
// ============================================================================

/// Primitives delivered to the EMM registration layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EmmRegPrimitive {
    /// A common procedure has begun
    CommonProcStarted {
        ue_id: UeId,
        proc_type: CommonProcType,
    },
    /// A common procedure reached a terminal outcome
    CommonProcConcluded {
        ue_id: UeId,
        proc_type: CommonProcType,
        outcome: ProcedureOutcome,
        /// Whether the owning procedure should be informed
        notify: bool,
        /// Whether the procedure record is released
        free: bool,
        /// Registration state when the procedure started
        previous_state: EmmState,
    },
    /// An owning procedure's retry timer ran out; it may continue
    SpecificProcRetry {
        ue_id: UeId,
        proc_type: SpecificProcType,
        old_ue_id: Option<UeId>,
    },
}

// ============================================================================
// Access Stratum (EMMAS)
// ============================================================================

/// Security parameters handed to the access stratum with a message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EmmSecurityData {
    pub ksi: u8,
    pub dl_count: u32,
    pub ul_count: u32,
    pub selected_enc_algorithm: u8,
    pub selected_int_algorithm: u8,
}

impl From<&NasSecurityContext> for EmmSecurityData {
    fn from(sc: &NasSecurityContext) -> Self {
        Self {
            ksi: sc.ksi,
            dl_count: sc.dl_count,
            ul_count: sc.ul_count,
            selected_enc_algorithm: sc.selected_enc_algorithm,
            selected_int_algorithm: sc.selected_int_algorithm,
        }
    }
}

/// Primitives delivered to the access stratum
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EmmAsPrimitive {
    /// Send an Identity Request over the air
    SendIdentityRequest {
        ue_id: UeId,
        /// `None` when no security context exists yet
        security: Option<EmmSecurityData>,
        identity_type: RequestedIdentityType,
    },
}

// ============================================================================
// Core Network (EMMCN)
// ============================================================================

/// Primitives delivered to the core-network side
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EmmCnPrimitive {
    /// Remove a subscriber context without an over-the-air detach
    ImplicitDetach {
        ue_id: UeId,
        emm_cause: Option<EmmCause>,
        detach_type: Option<u8>,
    },
    /// Tear down the application-layer session binding of a subscriber
    SessionTeardown { ue_id: UeId },
}

// ============================================================================
// SAP
// ============================================================================

/// Tagged primitive accepted by the dispatcher
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EmmSap {
    Reg(EmmRegPrimitive),
    As(EmmAsPrimitive),
    Cn(EmmCnPrimitive),
}

impl EmmSap {
    /// Primitive name
    pub fn name(&self) -> &'static str {
        match self {
            EmmSap::Reg(EmmRegPrimitive::CommonProcStarted { .. }) => "EMMREG_COMMON_PROC_REQ",
            EmmSap::Reg(EmmRegPrimitive::CommonProcConcluded { outcome, .. }) => match outcome {
                ProcedureOutcome::Success => "EMMREG_COMMON_PROC_CNF",
                ProcedureOutcome::Reject => "EMMREG_COMMON_PROC_REJ",
                ProcedureOutcome::Abort => "EMMREG_COMMON_PROC_ABORT",
            },
            EmmSap::Reg(EmmRegPrimitive::SpecificProcRetry { .. }) => "EMMREG_SPECIFIC_PROC_RETRY",
            EmmSap::As(EmmAsPrimitive::SendIdentityRequest { .. }) => "EMMAS_SECURITY_REQ",
            EmmSap::Cn(EmmCnPrimitive::ImplicitDetach { .. }) => "EMMCN_IMPLICIT_DETACH_UE",
            EmmSap::Cn(EmmCnPrimitive::SessionTeardown { .. }) => "EMMCN_SESSION_TEARDOWN",
        }
    }

    /// Subscriber the primitive refers to
    pub fn ue_id(&self) -> UeId {
        match self {
            EmmSap::Reg(EmmRegPrimitive::CommonProcStarted { ue_id, .. })
            | EmmSap::Reg(EmmRegPrimitive::CommonProcConcluded { ue_id, .. })
            | EmmSap::Reg(EmmRegPrimitive::SpecificProcRetry { ue_id, .. })
            | EmmSap::As(EmmAsPrimitive::SendIdentityRequest { ue_id, .. })
            | EmmSap::Cn(EmmCnPrimitive::ImplicitDetach { ue_id, .. })
            | EmmSap::Cn(EmmCnPrimitive::SessionTeardown { ue_id }) => *ue_id,
        }
    }
}

impl fmt::Display for EmmSap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [ue_id={}]", self.name(), self.ue_id())
    }
}

/// Registration layer
pub trait EmmRegSap: Send + Sync {
    fn emm_reg_send(&self, primitive: &EmmRegPrimitive) -> EmmResult<()>;
}

/// Access stratum
pub trait EmmAsSap: Send + Sync {
    fn emm_as_send(&self, primitive: &EmmAsPrimitive) -> EmmResult<()>;
}

/// Core-network layer
pub trait EmmCnSap: Send + Sync {
    fn emm_cn_send(&self, primitive: &EmmCnPrimitive) -> EmmResult<()>;
}

/// Routes primitives to the layer that owns them
#[derive(Clone)]
pub struct EmmSapDispatcher {
    reg: Arc<dyn EmmRegSap>,
    as_sap: Arc<dyn EmmAsSap>,
    cn: Arc<dyn EmmCnSap>,
}

impl EmmSapDispatcher {
    pub fn new(reg: Arc<dyn EmmRegSap>, as_sap: Arc<dyn EmmAsSap>, cn: Arc<dyn EmmCnSap>) -> Self {
        Self { reg, as_sap, cn }
    }

    /// Deliver one primitive
    pub fn send(&self, sap: EmmSap) -> EmmResult<()> {
        log::debug!("{}", sap);
        let rv = match &sap {
            EmmSap::Reg(primitive) => self.reg.emm_reg_send(primitive),
            EmmSap::As(primitive) => self.as_sap.emm_as_send(primitive),
            EmmSap::Cn(primitive) => self.cn.emm_cn_send(primitive),
        };
        if let Err(e) = &rv {
            log::error!("{} failed: {}", sap, e);
        }
        rv
    }
}

impl fmt::Debug for EmmSapDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EmmSapDispatcher").finish_non_exhaustive()
    }
}
