//! NextGCore EMM common procedures
//!
//! EPS Mobility Management common-procedure engine of the MME: request
//! retransmission and abort, the identification procedure, and resolution
//! of duplicate subscriber identities.

pub mod config;
pub mod conflict;
pub mod context;
pub mod emm_build;
pub mod emm_handler;
pub mod emm_sap;
pub mod engine;
pub mod error;
pub mod identification;
pub mod procedure;
pub mod sm;
pub mod timer;


pub use config::{EmmConfig, TimerConfig};
pub use conflict::{detect_conflict, IdentityConflict};
pub use context::{
    EmmContext, EmmContextRef, EmmContextStore, NasSecurityContext, SessionBindingStore, UeId,
};
pub use emm_build::{build_identity_request, EmmCause, RequestedIdentityType};
pub use emm_handler::{handle_identity_response, parse_identity_response};
pub use emm_sap::{
    EmmAsPrimitive, EmmAsSap, EmmCnPrimitive, EmmCnSap, EmmRegPrimitive, EmmRegSap, EmmSap,
    EmmSapDispatcher, EmmSecurityData,
};
pub use engine::EmmEngine;
pub use error::{EmmError, EmmResult};
pub use identification::LearnedIdentity;
pub use procedure::{
    CommonProcType, CommonProcedure, OwningProcedure, ProcedureOutcome, SpecificProcType,
    SpecificProcedure, TerminalNotifier,
};
pub use sm::EmmState;
pub use timer::{NasTimerKind, TimerEvent, TimerId, TimerService, TimerWheel};
