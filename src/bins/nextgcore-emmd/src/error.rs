//! EMM error types

use thiserror::Error;

use crate::context::UeId;
use crate::procedure::CommonProcType;
use crate::sm::EmmState;

/// EMM engine error type
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EmmError {
    /// Common procedure requested while the registration state forbids it
    #[error("Common procedure not permitted in EMM state {0}")]
    InvalidState(EmmState),

    /// No EMM context for the subscriber
    #[error("EMM context not found: ue_id={0}")]
    ContextNotFound(UeId),

    /// Procedure already concluded or never started
    #[error("{proc_type} procedure not found: ue_id={ue_id}")]
    ProcedureNotFound { ue_id: UeId, proc_type: CommonProcType },

    /// A SAP layer refused the primitive
    #[error("SAP send failed: {0}")]
    SendFailed(String),

    /// Identity type this procedure cannot request or accept
    #[error("Unsupported identity type: {0}")]
    UnsupportedIdentityType(u8),

    /// Malformed NAS message
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl EmmError {
    /// True when the error refers to a subscriber or procedure that is
    /// already gone. Late and duplicate network events produce these.
    pub fn is_stale(&self) -> bool {
        matches!(
            self,
            EmmError::ContextNotFound(_) | EmmError::ProcedureNotFound { .. }
        )
    }
}

/// EMM result type
pub type EmmResult<T> = Result<T, EmmError>;

/// Turn stale-reference errors into a quiet success.
pub(crate) fn absorb_stale(result: EmmResult<()>) -> EmmResult<()> {
    match result {
        Err(e) if e.is_stale() => {
            log::debug!("Ignoring stale event: {}", e);
            Ok(())
        }
        other => other,
    }
}
