//! EMM Identification Procedure (TS 24.301 5.4.4)
//!
//! The network sends an IDENTITY REQUEST and starts T3470; the procedure
//! completes when the IDENTITY RESPONSE carrying the requested identity
//! arrives.

use std::fmt;
use std::sync::Weak;

use crate::conflict::{self, Resolution};
use crate::context::{EmmContext, UeId};
use crate::emm_build::RequestedIdentityType;
use crate::engine::EmmEngine;
use crate::error::{absorb_stale, EmmError, EmmResult};
use crate::procedure::{
    CommonProcParams, CommonProcType, OwningProcedure, ProcedureOutcome, TerminalNotifier,
};

/// Mobile identity type value of a TMSI
const IDENTITY_TYPE_TMSI: u8 = 4;

/// Identity carried by an Identity Response
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LearnedIdentity {
    Imsi(String),
    Imei(String),
    Imeisv(String),
    Tmsi(u32),
}

impl fmt::Display for LearnedIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LearnedIdentity::Imsi(imsi) => write!(f, "IMSI[{}]", imsi),
            LearnedIdentity::Imei(imei) => write!(f, "IMEI[{}]", imei),
            LearnedIdentity::Imeisv(imeisv) => write!(f, "IMEISV[{}]", imeisv),
            LearnedIdentity::Tmsi(tmsi) => write!(f, "TMSI[{:#010x}]", tmsi),
        }
    }
}

impl EmmEngine {
    /// Start the identification procedure for `ue_id`.
    ///
    /// `parent` is the owning specific procedure, if any; it is asked to
    /// retry when the learned IMSI turns out to belong to a stale context.
    pub fn identification_initiate(
        &self,
        ue_id: UeId,
        parent: Option<Weak<dyn OwningProcedure>>,
        identity_type: RequestedIdentityType,
        notifier: TerminalNotifier,
    ) -> EmmResult<()> {
        self.contexts
            .with_context(ue_id, |ctx| {
                log::info!(
                    "[ue_id={}] Initiate identification type = {} ({})",
                    ue_id,
                    identity_type,
                    identity_type as u8
                );
                self.start(
                    ctx,
                    CommonProcParams::Identification { identity_type },
                    parent,
                    Some(notifier),
                )
            })
            .unwrap_or(Err(EmmError::ContextNotFound(ue_id)))
    }

    /// Process the identity learned from an Identity Response.
    ///
    /// Responses for unknown subscribers or for an identification that is
    /// no longer running are dropped.
    pub fn identification_complete(&self, ue_id: UeId, identity: LearnedIdentity) -> EmmResult<()> {
        if let LearnedIdentity::Tmsi(tmsi) = identity {
            log::error!(
                "[ue_id={}] Identity response carries TMSI {:#010x}, never requested",
                ue_id,
                tmsi
            );
            return Err(EmmError::UnsupportedIdentityType(IDENTITY_TYPE_TMSI));
        }
        absorb_stale(self.complete_identification(ue_id, &identity))
    }

    fn complete_identification(&self, ue_id: UeId, identity: &LearnedIdentity) -> EmmResult<()> {
        let imsi = match identity {
            LearnedIdentity::Imsi(imsi) => Some(imsi.as_str()),
            _ => None,
        };
        let stale_hint = || imsi.and_then(|imsi| conflict::indexed_elsewhere(&self.contexts, ue_id, imsi));

        loop {
            let hint = stale_hint();
            let outcome = self.contexts.lock_pair(ue_id, hint, |ctx, stale| {
                // The IMSI index may have moved while the locks were taken
                if stale_hint() != hint {
                    return None;
                }
                Some(self.identification_complete_locked(ctx, stale, identity))
            });

            match outcome {
                None => return Err(EmmError::ContextNotFound(ue_id)),
                Some(None) => log::debug!("[ue_id={}] IMSI index changed, retrying", ue_id),
                Some(Some(rv)) => return rv,
            }
        }
    }

    fn identification_complete_locked(
        &self,
        ctx: &mut EmmContext,
        stale: Option<&mut EmmContext>,
        identity: &LearnedIdentity,
    ) -> EmmResult<()> {
        let ue_id = ctx.ue_id;
        let proc_type = CommonProcType::Identification;

        let procedure = ctx
            .common_procs
            .get_mut(&proc_type)
            .ok_or(EmmError::ProcedureNotFound { ue_id, proc_type })?;

        // Response received: no retransmission may race past this point
        procedure.timer_mut().stop(&*self.timers);

        log::info!("[ue_id={}] Identification complete: {}", ue_id, identity);

        match identity {
            LearnedIdentity::Imsi(imsi) => {
                if self.resolve_imsi(ctx, stale, imsi)? == Resolution::Deferred {
                    return Ok(());
                }
            }
            LearnedIdentity::Imei(imei) => ctx.imei_bcd = Some(imei.clone()),
            LearnedIdentity::Imeisv(imeisv) => ctx.imeisv_bcd = Some(imeisv.clone()),
            LearnedIdentity::Tmsi(_) => {
                return Err(EmmError::UnsupportedIdentityType(IDENTITY_TYPE_TMSI))
            }
        }

        self.conclude(ctx, proc_type, ProcedureOutcome::Success, true, true)
    }
}
