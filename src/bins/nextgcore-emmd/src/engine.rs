//! EMM Common Procedure Engine
//!
//! Retransmission, abort and terminal notification shared by every
//! request/response EMM procedure. All operations on one subscriber run
//! inside that subscriber's lock domain in the [`EmmContextStore`].

use std::collections::hash_map::Entry;
use std::sync::{Arc, Weak};

use crate::config::{EmmConfig, TimerConfig};
use crate::context::{EmmContext, EmmContextStore, SessionBindingStore, UeId};
use crate::emm_sap::{EmmCnPrimitive, EmmRegPrimitive, EmmSap, EmmSapDispatcher, EmmSecurityData};
use crate::error::{absorb_stale, EmmError, EmmResult};
use crate::procedure::{
    CommonProcParams, CommonProcType, OwningProcedure, ProcBase, ProcedureOutcome,
    SpecificProcType, SpecificProcedure, TerminalNotifier,
};
use crate::timer::{NasTimerKind, TimerEvent, TimerId, TimerService};

/// EMM common procedure engine
pub struct EmmEngine {
    config: EmmConfig,
    pub(crate) contexts: Arc<EmmContextStore>,
    pub(crate) sessions: Arc<SessionBindingStore>,
    pub(crate) timers: Arc<dyn TimerService>,
    pub(crate) sap: EmmSapDispatcher,
}

impl EmmEngine {
    pub fn new(
        config: EmmConfig,
        contexts: Arc<EmmContextStore>,
        sessions: Arc<SessionBindingStore>,
        timers: Arc<dyn TimerService>,
        sap: EmmSapDispatcher,
    ) -> Self {
        Self {
            config,
            contexts,
            sessions,
            timers,
            sap,
        }
    }

    pub fn config(&self) -> &EmmConfig {
        &self.config
    }

    pub fn contexts(&self) -> &Arc<EmmContextStore> {
        &self.contexts
    }

    pub fn sessions(&self) -> &Arc<SessionBindingStore> {
        &self.sessions
    }

    fn timer_config(&self, proc_type: CommonProcType) -> TimerConfig {
        match proc_type {
            CommonProcType::Identification => self.config.t3470,
        }
    }

    fn with_context(
        &self,
        ue_id: UeId,
        f: impl FnOnce(&mut EmmContext) -> EmmResult<()>,
    ) -> EmmResult<()> {
        self.contexts
            .with_context(ue_id, f)
            .unwrap_or(Err(EmmError::ContextNotFound(ue_id)))
    }

    /// Register the pending specific procedure of a subscriber. A previous
    /// one is replaced and its retry timer stopped.
    pub fn create_specific_procedure(
        &self,
        ue_id: UeId,
        proc_type: SpecificProcType,
    ) -> EmmResult<Arc<SpecificProcedure>> {
        self.contexts
            .with_context(ue_id, |ctx| {
                if let Some(previous) = ctx.specific_proc.take() {
                    previous.stop();
                }
                let procedure = SpecificProcedure::new(
                    ue_id,
                    proc_type,
                    Arc::clone(&self.timers),
                    self.config.specific_retry,
                );
                ctx.specific_proc = Some(Arc::clone(&procedure));
                log::debug!("[ue_id={}] {} procedure created", ue_id, proc_type);
                procedure
            })
            .ok_or(EmmError::ContextNotFound(ue_id))
    }

    // ========================================================================
    // Start
    // ========================================================================

    /// Start (or restart) a common procedure and send its request.
    ///
    /// An unreleased procedure of the same type is reused; its previous
    /// initiator, if any, is concluded with [`ProcedureOutcome::Reject`].
    /// Nothing is left behind if the state forbids it or the request cannot
    /// be sent.
    pub(crate) fn start(
        &self,
        ctx: &mut EmmContext,
        params: CommonProcParams,
        parent: Option<Weak<dyn OwningProcedure>>,
        notifier: Option<TerminalNotifier>,
    ) -> EmmResult<()> {
        let ue_id = ctx.ue_id;
        let proc_type = params.proc_type();
        let state = ctx.state();

        if !state.permits_common_procedure() {
            log::warn!("[ue_id={}] {} not permitted in EMM state {}", ue_id, proc_type, state);
            return Err(EmmError::InvalidState(state));
        }

        let procedure = match ctx.common_procs.entry(proc_type) {
            Entry::Occupied(entry) => {
                log::debug!("[ue_id={}] Reusing {} procedure", ue_id, proc_type);
                let existing = entry.into_mut();
                params.apply(existing);
                existing
            }
            Entry::Vacant(entry) => entry.insert(params.instantiate(ProcBase {
                ue_id,
                parent: None,
                notifier: None,
                previous_state: state,
            })),
        };

        *procedure.retransmission_count_mut() = 0;
        let base = procedure.base_mut();
        base.parent = parent;
        base.previous_state = state;
        let displaced = std::mem::replace(&mut base.notifier, notifier);

        if let Some(displaced) = displaced {
            log::debug!("[ue_id={}] {} initiator replaced, rejecting previous", ue_id, proc_type);
            displaced.deliver(ctx, ProcedureOutcome::Reject, true);
        }

        if let Err(e) = self.send_request(ctx, proc_type) {
            if let Some(mut procedure) = ctx.common_procs.remove(&proc_type) {
                procedure.timer_mut().stop(&*self.timers);
            }
            return Err(e);
        }

        self.sap.send(EmmSap::Reg(EmmRegPrimitive::CommonProcStarted { ue_id, proc_type }))
    }

    /// Send the procedure's request and arm its retransmission timer
    fn send_request(&self, ctx: &mut EmmContext, proc_type: CommonProcType) -> EmmResult<()> {
        let ue_id = ctx.ue_id;
        let security = ctx.security.as_ref().map(EmmSecurityData::from);
        let duration = self.timer_config(proc_type).duration;

        let procedure = ctx
            .common_procs
            .get_mut(&proc_type)
            .ok_or(EmmError::ProcedureNotFound { ue_id, proc_type })?;

        self.sap.send(EmmSap::As(procedure.request(security)))?;
        procedure.timer_mut().start(&*self.timers, ue_id, duration);
        Ok(())
    }

    // ========================================================================
    // Timer Expiry
    // ========================================================================

    /// Route a fired timer to its handler
    pub fn handle_timer(&self, event: TimerEvent) -> EmmResult<()> {
        match event.kind {
            NasTimerKind::T3470 => self.on_timeout(event.ue_id, event.id),
            NasTimerKind::SpecificRetry => self.on_specific_retry_timeout(event.ue_id, event.id),
        }
    }

    /// Retransmission timer of a common procedure fired
    pub fn on_timeout(&self, ue_id: UeId, timer_id: TimerId) -> EmmResult<()> {
        absorb_stale(self.with_context(ue_id, |ctx| self.common_proc_expired(ctx, timer_id)))
    }

    fn common_proc_expired(&self, ctx: &mut EmmContext, timer_id: TimerId) -> EmmResult<()> {
        let ue_id = ctx.ue_id;
        let Some(procedure) = ctx
            .common_procs
            .values_mut()
            .find(|procedure| procedure.timer().matches(timer_id))
        else {
            log::debug!("[ue_id={}] Stale timer event (id={}) ignored", ue_id, timer_id);
            return Ok(());
        };

        procedure.timer_mut().mark_fired();
        let proc_type = procedure.proc_type();
        let max_count = self.timer_config(proc_type).max_count;

        let count = procedure.retransmission_count_mut();
        *count += 1;
        let attempts = *count;

        log::warn!(
            "[ue_id={}] {} expired, retransmission counter = {}",
            ue_id,
            proc_type.timer_kind(),
            attempts
        );

        if attempts < max_count {
            self.send_request(ctx, proc_type)
        } else {
            self.abort_exhausted(ctx, proc_type)
        }
    }

    /// Retransmissions exhausted: conclude with abort, drop every procedure
    /// of the subscriber and ask the core network to clean up.
    fn abort_exhausted(&self, ctx: &mut EmmContext, proc_type: CommonProcType) -> EmmResult<()> {
        let ue_id = ctx.ue_id;
        log::error!("[ue_id={}] {} procedure aborted", ue_id, proc_type);

        let concluded = self.conclude(ctx, proc_type, ProcedureOutcome::Abort, false, true);
        self.release_all(ctx, ProcedureOutcome::Abort);

        let cleanup = if self.contexts.contains(ue_id) {
            EmmCnPrimitive::ImplicitDetach {
                ue_id,
                emm_cause: None,
                detach_type: None,
            }
        } else {
            EmmCnPrimitive::SessionTeardown { ue_id }
        };
        let signalled = self.sap.send(EmmSap::Cn(cleanup));

        concluded.and(signalled)
    }

    /// Retry timer of the pending specific procedure fired
    pub fn on_specific_retry_timeout(&self, ue_id: UeId, timer_id: TimerId) -> EmmResult<()> {
        absorb_stale(self.with_context(ue_id, |ctx| self.specific_retry_expired(ctx, timer_id)))
    }

    fn specific_retry_expired(&self, ctx: &mut EmmContext, timer_id: TimerId) -> EmmResult<()> {
        let ue_id = ctx.ue_id;
        let Some((procedure, expiry)) = ctx.specific_proc.as_ref().and_then(|procedure| {
            procedure
                .retry_expired(timer_id)
                .map(|expiry| (Arc::clone(procedure), expiry))
        }) else {
            log::debug!("[ue_id={}] Stale retry timer event (id={}) ignored", ue_id, timer_id);
            return Ok(());
        };

        let stale_lingers = expiry
            .old_ue_id
            .is_some_and(|old| self.contexts.contains(old) || self.sessions.contains_ue(old));

        if stale_lingers && procedure.rearm() {
            log::debug!(
                "[ue_id={}] {} still waiting on ue_id={:?}",
                ue_id,
                procedure.proc_type(),
                expiry.old_ue_id
            );
            return Ok(());
        }

        let old_ue_id = procedure.finish_retry();
        log::info!("[ue_id={}] {} retry (old ue_id={:?})", ue_id, procedure.proc_type(), old_ue_id);
        self.sap.send(EmmSap::Reg(EmmRegPrimitive::SpecificProcRetry {
            ue_id,
            proc_type: procedure.proc_type(),
            old_ue_id,
        }))
    }

    // ========================================================================
    // Delivery Outcomes and Abort
    // ========================================================================

    /// Lower layers could not deliver the request: release everything,
    /// whether or not `proc_type` is still running
    pub fn on_lower_layer_failure(&self, ue_id: UeId, proc_type: CommonProcType) -> EmmResult<()> {
        absorb_stale(self.with_context(ue_id, |ctx| {
            log::warn!("[ue_id={}] Lower layer failure during {}", ue_id, proc_type);
            self.release_all(ctx, ProcedureOutcome::Reject);
            Ok(())
        }))
    }

    /// Request not delivered because of a handover: send it again without
    /// consuming a retransmission
    pub fn on_non_delivery_handover(&self, ue_id: UeId, proc_type: CommonProcType) -> EmmResult<()> {
        absorb_stale(self.with_context(ue_id, |ctx| {
            log::info!("[ue_id={}] {} request not delivered (handover), resending", ue_id, proc_type);
            self.send_request(ctx, proc_type)
        }))
    }

    /// Administrative abort: disarm the timer only. The caller follows up
    /// with [`EmmEngine::reject`] or a release.
    pub fn abort(&self, ue_id: UeId, proc_type: CommonProcType) -> EmmResult<()> {
        absorb_stale(self.with_context(ue_id, |ctx| {
            let procedure = ctx
                .common_procs
                .get_mut(&proc_type)
                .ok_or(EmmError::ProcedureNotFound { ue_id, proc_type })?;
            log::info!("[ue_id={}] Abort {} procedure", ue_id, proc_type);
            procedure.timer_mut().stop(&*self.timers);
            Ok(())
        }))
    }

    /// Conclude a procedure as rejected, informing its initiator
    pub fn reject(&self, ue_id: UeId, proc_type: CommonProcType) -> EmmResult<()> {
        absorb_stale(self.with_context(ue_id, |ctx| {
            self.conclude(ctx, proc_type, ProcedureOutcome::Reject, true, true)
        }))
    }

    // ========================================================================
    // Conclusion and Release
    // ========================================================================

    /// Terminal step of a procedure: disarm, report to the registration
    /// layer, deliver the initiator notification, then free if asked.
    pub(crate) fn conclude(
        &self,
        ctx: &mut EmmContext,
        proc_type: CommonProcType,
        outcome: ProcedureOutcome,
        notify: bool,
        free: bool,
    ) -> EmmResult<()> {
        let ue_id = ctx.ue_id;
        let procedure = ctx
            .common_procs
            .get_mut(&proc_type)
            .ok_or(EmmError::ProcedureNotFound { ue_id, proc_type })?;

        procedure.timer_mut().stop(&*self.timers);
        let previous_state = procedure.base().previous_state;
        let notifier = procedure.base_mut().notifier.take();

        let rv = self.sap.send(EmmSap::Reg(EmmRegPrimitive::CommonProcConcluded {
            ue_id,
            proc_type,
            outcome,
            notify,
            free,
            previous_state,
        }));

        if let Some(notifier) = notifier {
            notifier.deliver(ctx, outcome, notify);
        }

        if free {
            ctx.common_procs.remove(&proc_type);
            log::debug!("[ue_id={}] {} procedure freed", ue_id, proc_type);
        }
        rv
    }

    /// Drop every common procedure and the pending specific procedure.
    /// Initiators not yet notified receive `outcome`.
    pub(crate) fn release_all(&self, ctx: &mut EmmContext, outcome: ProcedureOutcome) {
        let ue_id = ctx.ue_id;
        let procedures: Vec<_> = ctx.common_procs.drain().map(|(_, p)| p).collect();

        for mut procedure in procedures {
            procedure.timer_mut().stop(&*self.timers);
            if let Some(notifier) = procedure.base_mut().notifier.take() {
                notifier.deliver(ctx, outcome, true);
            }
            log::debug!("[ue_id={}] {} procedure released", ue_id, procedure.proc_type());
        }

        if let Some(specific) = ctx.specific_proc.take() {
            specific.stop();
            log::debug!("[ue_id={}] {} procedure released", ue_id, specific.proc_type());
        }
    }
}

impl EmmEngine {
    /// Core-network cleanup of a subscriber: release its procedures, drop
    /// its session bindings and remove its context
    pub fn release_context(&self, ue_id: UeId) -> bool {
        self.contexts
            .with_context(ue_id, |ctx| self.release_all(ctx, ProcedureOutcome::Abort));
        self.sessions.unbind_ue(ue_id);
        self.contexts.remove(ue_id)
    }
}

impl std::fmt::Debug for EmmEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmmEngine")
            .field("config", &self.config)
            .field("contexts", &self.contexts.count())
            .finish_non_exhaustive()
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::harness;
    use super::*;
    use crate::emm_build::RequestedIdentityType;
    use crate::emm_sap::{EmmAsPrimitive, EmmSap};
    use crate::sm::EmmState;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    const IMSI: CommonProcParams = CommonProcParams::Identification {
        identity_type: RequestedIdentityType::Imsi,
    };

    fn start(h: &super::test_support::Harness, ue_id: UeId) -> EmmResult<()> {
        h.engine
            .contexts
            .with_context(ue_id, |ctx| h.engine.start(ctx, IMSI, None, None))
            .unwrap()
    }

    fn retransmissions(h: &super::test_support::Harness, ue_id: UeId) -> Option<u32> {
        h.engine
            .contexts
            .with_context(ue_id, |ctx| {
                ctx.common_procedure(CommonProcType::Identification)
                    .map(|p| p.retransmission_count())
            })
            .flatten()
    }

    #[test]
    fn test_start_sends_request_then_started() {
        let h = harness();
        h.engine.contexts.create(1);

        start(&h, 1).unwrap();
        assert_eq!(h.sap.names(), vec!["EMMAS_SECURITY_REQ", "EMMREG_COMMON_PROC_REQ"]);
        assert!(h.wheel.pending(1, NasTimerKind::T3470).is_some());
        assert_eq!(retransmissions(&h, 1), Some(0));
    }

    #[test]
    fn test_start_rejected_state() {
        let h = harness();
        let ctx = h.engine.contexts.create(1);
        ctx.lock().unwrap().set_state(EmmState::SecurityMode);

        assert_eq!(start(&h, 1), Err(EmmError::InvalidState(EmmState::SecurityMode)));
        assert!(h.sap.take().is_empty());
        assert_eq!(h.wheel.count(), 0);
        assert_eq!(retransmissions(&h, 1), None);
    }

    #[test]
    fn test_start_send_failure_leaves_nothing() {
        let h = harness();
        h.engine.contexts.create(1);
        h.sap.fail_as.store(true, Ordering::SeqCst);

        assert!(matches!(start(&h, 1), Err(EmmError::SendFailed(_))));
        assert!(h.sap.take().is_empty());
        assert_eq!(h.wheel.count(), 0);
        assert_eq!(retransmissions(&h, 1), None);
    }

    #[test]
    fn test_start_twice_reuses_procedure() {
        let h = harness();
        h.engine.contexts.create(1);

        start(&h, 1).unwrap();
        start(&h, 1).unwrap();

        assert_eq!(h.wheel.count(), 1);
        let count = h
            .engine
            .contexts
            .with_context(1, |ctx| ctx.common_procedure_count())
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_timeout_retries_then_aborts() {
        let h = harness();
        h.engine.contexts.create(1);
        start(&h, 1).unwrap();
        h.sap.take();

        for expected in 1..5 {
            let id = h.wheel.pending(1, NasTimerKind::T3470).unwrap();
            h.engine.handle_timer(h.wheel.fire(id).unwrap()).unwrap();
            assert_eq!(retransmissions(&h, 1), Some(expected));
        }
        assert_eq!(h.sap.names(), vec!["EMMAS_SECURITY_REQ"; 4]);

        let id = h.wheel.pending(1, NasTimerKind::T3470).unwrap();
        h.engine.handle_timer(h.wheel.fire(id).unwrap()).unwrap();
        assert_eq!(
            h.sap.take()[4..].to_vec(),
            vec![
                EmmSap::Reg(EmmRegPrimitive::CommonProcConcluded {
                    ue_id: 1,
                    proc_type: CommonProcType::Identification,
                    outcome: ProcedureOutcome::Abort,
                    notify: false,
                    free: true,
                    previous_state: EmmState::DeRegistered,
                }),
                EmmSap::Cn(EmmCnPrimitive::ImplicitDetach {
                    ue_id: 1,
                    emm_cause: None,
                    detach_type: None,
                }),
            ]
        );
        assert_eq!(retransmissions(&h, 1), None);
        assert_eq!(h.wheel.count(), 0);
    }

    #[test]
    fn test_stale_timer_event_ignored() {
        let h = harness();
        h.engine.contexts.create(1);
        start(&h, 1).unwrap();
        h.sap.take();

        let id = h.wheel.pending(1, NasTimerKind::T3470).unwrap();
        h.engine.on_timeout(1, id + 1000).unwrap();
        h.engine.on_timeout(42, id).unwrap();

        assert!(h.sap.take().is_empty());
        assert_eq!(retransmissions(&h, 1), Some(0));
    }

    #[test]
    fn test_lower_layer_failure_releases_all() {
        let h = harness();
        h.engine.contexts.create(1);
        let attach = h
            .engine
            .create_specific_procedure(1, SpecificProcType::Attach)
            .unwrap();
        start(&h, 1).unwrap();
        h.sap.take();

        h.engine
            .on_lower_layer_failure(1, CommonProcType::Identification)
            .unwrap();

        assert!(h.sap.take().is_empty());
        assert_eq!(h.wheel.count(), 0);
        assert_eq!(retransmissions(&h, 1), None);
        let specific = h
            .engine
            .contexts
            .with_context(1, |ctx| ctx.specific_procedure().is_some())
            .unwrap();
        assert!(!specific);
        assert_eq!(Arc::strong_count(&attach), 1);
    }

    #[test]
    fn test_lower_layer_failure_without_common_procedure() {
        let h = harness();
        h.engine.contexts.create(1);
        let attach = h
            .engine
            .create_specific_procedure(1, SpecificProcType::Attach)
            .unwrap();
        attach.restart_retry(4);
        assert_eq!(h.wheel.count(), 1);

        h.engine
            .on_lower_layer_failure(1, CommonProcType::Identification)
            .unwrap();

        assert_eq!(h.wheel.count(), 0);
        let specific = h
            .engine
            .contexts
            .with_context(1, |ctx| ctx.specific_procedure().is_some())
            .unwrap();
        assert!(!specific);
        assert!(h.sap.take().is_empty());
    }

    #[test]
    fn test_restart_rejects_displaced_initiator() {
        let h = harness();
        h.engine.contexts.create(1);
        let first = Arc::new(Mutex::new(Vec::new()));
        let second = Arc::new(AtomicU32::new(0));

        let f = Arc::clone(&first);
        let notifier = TerminalNotifier::new().on_failure(move |_, outcome| {
            f.lock().unwrap().push(outcome);
        });
        h.engine
            .contexts
            .with_context(1, |ctx| h.engine.start(ctx, IMSI, None, Some(notifier)))
            .unwrap()
            .unwrap();

        let s = Arc::clone(&second);
        let notifier = TerminalNotifier::new().on_success(move |_| {
            s.fetch_add(1, Ordering::SeqCst);
        });
        h.engine
            .contexts
            .with_context(1, |ctx| h.engine.start(ctx, IMSI, None, Some(notifier)))
            .unwrap()
            .unwrap();
        assert_eq!(*first.lock().unwrap(), vec![ProcedureOutcome::Reject]);
        assert_eq!(h.wheel.count(), 1);

        h.engine
            .contexts
            .with_context(1, |ctx| {
                h.engine.conclude(
                    ctx,
                    CommonProcType::Identification,
                    ProcedureOutcome::Success,
                    true,
                    true,
                )
            })
            .unwrap()
            .unwrap();
        assert_eq!(second.load(Ordering::SeqCst), 1);
        assert_eq!(first.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_non_delivery_handover_resends_without_counting() {
        let h = harness();
        h.engine.contexts.create(1);
        start(&h, 1).unwrap();
        h.sap.take();

        h.engine
            .on_non_delivery_handover(1, CommonProcType::Identification)
            .unwrap();

        assert!(matches!(
            h.sap.take().as_slice(),
            [EmmSap::As(EmmAsPrimitive::SendIdentityRequest { ue_id: 1, .. })]
        ));
        assert_eq!(retransmissions(&h, 1), Some(0));
        assert_eq!(h.wheel.count(), 1);
    }

    #[test]
    fn test_abort_only_disarms() {
        let h = harness();
        h.engine.contexts.create(1);
        start(&h, 1).unwrap();
        h.sap.take();

        h.engine.abort(1, CommonProcType::Identification).unwrap();
        assert!(h.sap.take().is_empty());
        assert_eq!(h.wheel.count(), 0);
        assert_eq!(retransmissions(&h, 1), Some(0));

        h.engine.reject(1, CommonProcType::Identification).unwrap();
        assert_eq!(h.sap.names(), vec!["EMMREG_COMMON_PROC_REJ"]);
        assert_eq!(retransmissions(&h, 1), None);
    }

    #[test]
    fn test_terminal_notifier_fires_once() {
        let h = harness();
        h.engine.contexts.create(1);
        let failures = Arc::new(AtomicU32::new(0));
        let outcome = Arc::new(Mutex::new(None));

        let f = Arc::clone(&failures);
        let o = Arc::clone(&outcome);
        let notifier = TerminalNotifier::new().on_failure(move |_, result| {
            f.fetch_add(1, Ordering::SeqCst);
            *o.lock().unwrap() = Some(result);
        });
        h.engine
            .contexts
            .with_context(1, |ctx| h.engine.start(ctx, IMSI, None, Some(notifier)))
            .unwrap()
            .unwrap();

        for _ in 0..5 {
            let id = h.wheel.pending(1, NasTimerKind::T3470).unwrap();
            h.engine.handle_timer(h.wheel.fire(id).unwrap()).unwrap();
        }
        assert_eq!(failures.load(Ordering::SeqCst), 1);
        assert_eq!(*outcome.lock().unwrap(), Some(ProcedureOutcome::Abort));
    }

    #[test]
    fn test_operations_on_missing_context_are_noops() {
        let h = harness();
        assert_eq!(h.engine.on_timeout(9, 1), Ok(()));
        assert_eq!(h.engine.abort(9, CommonProcType::Identification), Ok(()));
        assert_eq!(
            h.engine.on_lower_layer_failure(9, CommonProcType::Identification),
            Ok(())
        );
        assert_eq!(
            h.engine.on_non_delivery_handover(9, CommonProcType::Identification),
            Ok(())
        );
        assert!(h.sap.take().is_empty());
        assert!(matches!(
            h.engine.create_specific_procedure(9, SpecificProcType::Attach),
            Err(EmmError::ContextNotFound(9))
        ));
    }

    #[test]
    fn test_specific_retry_waits_for_stale_context() {
        let h = harness();
        h.engine.contexts.create(1);
        h.engine.contexts.create(2);
        let attach = h
            .engine
            .create_specific_procedure(2, SpecificProcType::Attach)
            .unwrap();

        attach.restart_retry(1);
        let id = attach.retry_timer_id().unwrap();
        h.engine.handle_timer(h.wheel.fire(id).unwrap()).unwrap();
        // Stale context 1 still present: re-armed, nothing reported
        assert!(h.sap.take().is_empty());
        let id = attach.retry_timer_id().unwrap();

        h.engine.contexts.remove(1);
        h.engine.handle_timer(h.wheel.fire(id).unwrap()).unwrap();
        assert_eq!(
            h.sap.take(),
            vec![EmmSap::Reg(EmmRegPrimitive::SpecificProcRetry {
                ue_id: 2,
                proc_type: SpecificProcType::Attach,
                old_ue_id: Some(1),
            })]
        );
        assert!(attach.retry_timer_id().is_none());
    }

    #[test]
    fn test_release_context() {
        let h = harness();
        h.engine.contexts.create(1);
        h.engine.contexts.index_imsi("001010000000001", 1);
        h.engine.sessions.bind("001010000000001", 1);
        h.engine
            .create_specific_procedure(1, SpecificProcType::Attach)
            .unwrap()
            .restart_retry(5);
        start(&h, 1).unwrap();
        assert_eq!(h.wheel.count(), 2);

        assert!(h.engine.release_context(1));
        assert_eq!(h.wheel.count(), 0);
        assert!(!h.engine.contexts.contains(1));
        assert_eq!(h.engine.contexts.find_by_imsi("001010000000001"), None);
        assert!(!h.engine.sessions.contains_ue(1));
        assert!(!h.engine.release_context(1));
    }

    #[test]
    fn test_specific_retry_budget() {
        let h = harness();
        h.engine.contexts.create(1);
        h.engine.contexts.create(2);
        let attach = h
            .engine
            .create_specific_procedure(2, SpecificProcType::TrackingAreaUpdate)
            .unwrap();
        attach.restart_retry(1);

        let max = h.engine.config().specific_retry.max_count;
        for _ in 0..max {
            let id = attach.retry_timer_id().unwrap();
            h.engine.handle_timer(h.wheel.fire(id).unwrap()).unwrap();
        }
        assert_eq!(h.sap.names(), vec!["EMMREG_SPECIFIC_PROC_RETRY"]);
        assert_eq!(h.wheel.count(), 0);
    }
}
