//! Identity Conflict Resolution
//!
//! A learned IMSI may already belong to another live subscriber, typically
//! one that reconnected before its old context was torn down. The stale
//! side is cleaned up asynchronously and the owning procedure of the new
//! side is rescheduled through its retry timer.

use std::sync::Weak;

use crate::context::{EmmContext, EmmContextStore, SessionBindingStore, UeId};
use crate::emm_build::EmmCause;
use crate::emm_sap::{EmmCnPrimitive, EmmSap};
use crate::engine::EmmEngine;
use crate::error::EmmResult;
use crate::procedure::{CommonProcType, ProcedureOutcome};

/// Detach type of an implicit detach that sends nothing to the UE
pub const IMPLICIT_DETACH_NO_SIGNALLING: u8 = 0;

/// Another subscriber already claiming an IMSI
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityConflict {
    /// EMM context indexed under the IMSI
    StaleEmmContext(UeId),
    /// Session binding held by the application layer
    StaleSessionBinding(UeId),
}

impl IdentityConflict {
    pub fn stale_ue_id(&self) -> UeId {
        match self {
            IdentityConflict::StaleEmmContext(ue_id)
            | IdentityConflict::StaleSessionBinding(ue_id) => *ue_id,
        }
    }
}

/// Whether completion went on to commit the identity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Resolution {
    /// No conflict; the IMSI is bound to the completing subscriber
    Committed,
    /// Conflict handled; the procedure is already concluded
    Deferred,
}

/// Subscriber other than `ue_id` indexed under `imsi` in the EMM store
pub(crate) fn indexed_elsewhere(contexts: &EmmContextStore, ue_id: UeId, imsi: &str) -> Option<UeId> {
    contexts.find_by_imsi(imsi).filter(|other| *other != ue_id)
}

/// Look for another subscriber claiming `imsi`. The EMM context store is
/// authoritative and consulted first.
pub fn detect_conflict(
    contexts: &EmmContextStore,
    sessions: &SessionBindingStore,
    ue_id: UeId,
    imsi: &str,
) -> Option<IdentityConflict> {
    if let Some(other) = indexed_elsewhere(contexts, ue_id, imsi) {
        return Some(IdentityConflict::StaleEmmContext(other));
    }
    sessions
        .find_by_imsi(imsi)
        .filter(|other| *other != ue_id)
        .map(IdentityConflict::StaleSessionBinding)
}

impl EmmEngine {
    /// Resolve the IMSI learned by the identification procedure of `ctx`.
    ///
    /// `stale` is the locked context of the subscriber indexed under the
    /// IMSI, when there is one.
    pub(crate) fn resolve_imsi(
        &self,
        ctx: &mut EmmContext,
        stale: Option<&mut EmmContext>,
        imsi: &str,
    ) -> EmmResult<Resolution> {
        let ue_id = ctx.ue_id;

        let Some(conflict) = detect_conflict(&self.contexts, &self.sessions, ue_id, imsi) else {
            ctx.imsi_bcd = Some(imsi.to_string());
            self.contexts.index_imsi(imsi, ue_id);
            return Ok(Resolution::Committed);
        };

        let old_ue_id = conflict.stale_ue_id();
        let signalled = match conflict {
            IdentityConflict::StaleEmmContext(_) => {
                log::warn!(
                    "[ue_id={}] IMSI[{}] already held by EMM context ue_id={}, implicit detach",
                    ue_id,
                    imsi,
                    old_ue_id
                );
                self.restart_parent_retry(ctx, old_ue_id);
                if let Some(stale) = stale.filter(|stale| stale.ue_id == old_ue_id) {
                    stale.emm_cause = Some(EmmCause::IllegalUe);
                }
                self.sap.send(EmmSap::Cn(EmmCnPrimitive::ImplicitDetach {
                    ue_id: old_ue_id,
                    emm_cause: Some(EmmCause::IllegalUe),
                    detach_type: Some(IMPLICIT_DETACH_NO_SIGNALLING),
                }))
            }
            IdentityConflict::StaleSessionBinding(_) => {
                log::warn!(
                    "[ue_id={}] IMSI[{}] already bound to session of ue_id={}, tearing down",
                    ue_id,
                    imsi,
                    old_ue_id
                );
                let signalled =
                    self.sap.send(EmmSap::Cn(EmmCnPrimitive::SessionTeardown { ue_id: old_ue_id }));
                self.restart_parent_retry(ctx, old_ue_id);
                signalled
            }
        };

        let concluded = self.conclude(
            ctx,
            CommonProcType::Identification,
            ProcedureOutcome::Success,
            false,
            true,
        );
        signalled.and(concluded)?;
        Ok(Resolution::Deferred)
    }

    fn restart_parent_retry(&self, ctx: &EmmContext, stale_ue_id: UeId) {
        let owner = ctx
            .common_procedure(CommonProcType::Identification)
            .and_then(|procedure| procedure.base().parent.as_ref())
            .and_then(Weak::upgrade);

        match owner {
            Some(owner) => owner.restart_retry(stale_ue_id),
            None => log::warn!(
                "[ue_id={}] No owning procedure to retry after conflict with ue_id={}",
                ctx.ue_id,
                stale_ue_id
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emm_build::RequestedIdentityType;
    use crate::emm_sap::EmmRegPrimitive;
    use crate::engine::test_support::harness;
    use crate::procedure::{SpecificProcType, TerminalNotifier};
    use crate::sm::EmmState;
    use crate::timer::NasTimerKind;
    use crate::LearnedIdentity;

    const IMSI: &str = "001010123456789";

    #[test]
    fn test_detect_conflict_order() {
        let contexts = EmmContextStore::new();
        let sessions = SessionBindingStore::new();
        assert_eq!(detect_conflict(&contexts, &sessions, 2, IMSI), None);

        sessions.bind(IMSI, 3);
        assert_eq!(
            detect_conflict(&contexts, &sessions, 2, IMSI),
            Some(IdentityConflict::StaleSessionBinding(3))
        );

        contexts.index_imsi(IMSI, 1);
        assert_eq!(
            detect_conflict(&contexts, &sessions, 2, IMSI),
            Some(IdentityConflict::StaleEmmContext(1))
        );

        // Own entries never conflict
        assert_eq!(detect_conflict(&contexts, &sessions, 1, IMSI), Some(IdentityConflict::StaleSessionBinding(3)));
        assert_eq!(detect_conflict(&contexts, &sessions, 3, IMSI), Some(IdentityConflict::StaleEmmContext(1)));
    }

    #[test]
    fn test_stale_emm_context_conflict() {
        let h = harness();
        let old = h.engine.contexts().create(1);
        old.lock().unwrap().imsi_bcd = Some(IMSI.into());
        h.engine.contexts().index_imsi(IMSI, 1);

        let new = h.engine.contexts().create(2);
        let attach = h
            .engine
            .create_specific_procedure(2, SpecificProcType::Attach)
            .unwrap();
        h.engine
            .identification_initiate(
                2,
                Some(attach.as_parent()),
                RequestedIdentityType::Imsi,
                TerminalNotifier::new().on_success(|_| panic!("initiator must not be notified")),
            )
            .unwrap();
        h.sap.take();

        h.engine
            .identification_complete(2, LearnedIdentity::Imsi(IMSI.into()))
            .unwrap();

        assert_eq!(
            h.sap.take(),
            vec![
                EmmSap::Cn(EmmCnPrimitive::ImplicitDetach {
                    ue_id: 1,
                    emm_cause: Some(EmmCause::IllegalUe),
                    detach_type: Some(IMPLICIT_DETACH_NO_SIGNALLING),
                }),
                EmmSap::Reg(EmmRegPrimitive::CommonProcConcluded {
                    ue_id: 2,
                    proc_type: CommonProcType::Identification,
                    outcome: ProcedureOutcome::Success,
                    notify: false,
                    free: true,
                    previous_state: EmmState::DeRegistered,
                }),
            ]
        );

        assert_eq!(old.lock().unwrap().emm_cause, Some(EmmCause::IllegalUe));
        assert!(new.lock().unwrap().imsi_bcd.is_none());
        assert_eq!(h.engine.contexts().find_by_imsi(IMSI), Some(1));
        assert_eq!(attach.old_ue_id(), Some(1));
        assert_eq!(
            h.wheel.pending(2, NasTimerKind::SpecificRetry),
            attach.retry_timer_id()
        );
        assert!(attach.retry_timer_id().is_some());
        assert_eq!(new.lock().unwrap().common_procedure_count(), 0);
    }

    #[test]
    fn test_stale_session_binding_conflict() {
        let h = harness();
        h.engine.sessions().bind(IMSI, 7);
        h.engine.contexts().create(2);
        let tau = h
            .engine
            .create_specific_procedure(2, SpecificProcType::TrackingAreaUpdate)
            .unwrap();
        h.engine
            .identification_initiate(2, Some(tau.as_parent()), RequestedIdentityType::Imsi, TerminalNotifier::new())
            .unwrap();
        h.sap.take();

        h.engine
            .identification_complete(2, LearnedIdentity::Imsi(IMSI.into()))
            .unwrap();

        let names = h.sap.names();
        assert_eq!(names, vec!["EMMCN_SESSION_TEARDOWN", "EMMREG_COMMON_PROC_CNF"]);
        assert_eq!(tau.old_ue_id(), Some(7));
        assert_eq!(h.engine.contexts().find_by_imsi(IMSI), None);
    }

    #[test]
    fn test_conflict_without_parent() {
        let h = harness();
        h.engine.contexts().create(1);
        h.engine.contexts().index_imsi(IMSI, 1);
        h.engine.contexts().create(2);
        h.engine
            .identification_initiate(2, None, RequestedIdentityType::Imsi, TerminalNotifier::new())
            .unwrap();
        h.sap.take();

        h.engine
            .identification_complete(2, LearnedIdentity::Imsi(IMSI.into()))
            .unwrap();
        assert_eq!(h.sap.names(), vec!["EMMCN_IMPLICIT_DETACH_UE", "EMMREG_COMMON_PROC_CNF"]);
        assert_eq!(h.wheel.count(), 0);
    }

    #[test]
    fn test_no_conflict_commits_identity() {
        let h = harness();
        let ctx = h.engine.contexts().create(2);
        h.engine
            .identification_initiate(2, None, RequestedIdentityType::Imsi, TerminalNotifier::new())
            .unwrap();

        h.engine
            .identification_complete(2, LearnedIdentity::Imsi(IMSI.into()))
            .unwrap();

        assert_eq!(ctx.lock().unwrap().imsi_bcd.as_deref(), Some(IMSI));
        assert_eq!(h.engine.contexts().find_by_imsi(IMSI), Some(2));
    }
}
