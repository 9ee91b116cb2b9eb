//! Shared fixtures for EMM integration tests

#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use nextgcore_emmd::{
    CommonProcType, EmmAsPrimitive, EmmAsSap, EmmCnPrimitive, EmmCnSap, EmmConfig,
    EmmContextStore, EmmEngine, EmmRegPrimitive, EmmRegSap, EmmResult, EmmSap, EmmSapDispatcher,
    NasTimerKind, SessionBindingStore, TimerWheel, UeId,
};

/// Records every primitive the engine emits, in order
#[derive(Default)]
pub struct SapCapture {
    messages: Mutex<Vec<EmmSap>>,
}

impl SapCapture {
    fn capture(&self, sap: EmmSap) {
        log::debug!("Captured primitive: {}", sap);
        self.messages.lock().unwrap().push(sap);
    }

    /// All captured primitives
    pub fn messages(&self) -> Vec<EmmSap> {
        self.messages.lock().unwrap().clone()
    }

    /// Captured primitive names
    pub fn names(&self) -> Vec<&'static str> {
        self.messages.lock().unwrap().iter().map(EmmSap::name).collect()
    }

    /// Number of primitives with the given name
    pub fn count_named(&self, name: &str) -> usize {
        self.names().into_iter().filter(|n| *n == name).count()
    }

    /// Drain the capture buffer
    pub fn take(&self) -> Vec<EmmSap> {
        std::mem::take(&mut *self.messages.lock().unwrap())
    }
}

impl EmmRegSap for SapCapture {
    fn emm_reg_send(&self, primitive: &EmmRegPrimitive) -> EmmResult<()> {
        self.capture(EmmSap::Reg(primitive.clone()));
        Ok(())
    }
}

impl EmmAsSap for SapCapture {
    fn emm_as_send(&self, primitive: &EmmAsPrimitive) -> EmmResult<()> {
        self.capture(EmmSap::As(primitive.clone()));
        Ok(())
    }
}

impl EmmCnSap for SapCapture {
    fn emm_cn_send(&self, primitive: &EmmCnPrimitive) -> EmmResult<()> {
        self.capture(EmmSap::Cn(primitive.clone()));
        Ok(())
    }
}

/// Engine wired to a capturing SAP and a manually driven timer wheel
pub struct TestEnv {
    pub engine: Arc<EmmEngine>,
    pub capture: Arc<SapCapture>,
    pub wheel: Arc<TimerWheel>,
}

impl TestEnv {
    pub fn new() -> Self {
        Self::with_config(EmmConfig::default())
    }

    pub fn with_config(config: EmmConfig) -> Self {
        let _ = env_logger::builder().is_test(true).try_init();

        let capture = Arc::new(SapCapture::default());
        let wheel = Arc::new(TimerWheel::new());
        let sap = EmmSapDispatcher::new(capture.clone(), capture.clone(), capture.clone());
        let engine = EmmEngine::new(
            config,
            Arc::new(EmmContextStore::new()),
            Arc::new(SessionBindingStore::new()),
            wheel.clone(),
            sap,
        );

        Self {
            engine: Arc::new(engine),
            capture,
            wheel,
        }
    }

    /// Fire the armed T3470 of `ue_id` and hand the event to the engine
    pub fn fire_t3470(&self, ue_id: UeId) {
        let id = self
            .wheel
            .pending(ue_id, NasTimerKind::T3470)
            .expect("T3470 armed");
        let event = self.wheel.fire(id).expect("timer pending");
        self.engine.handle_timer(event).unwrap();
    }

    /// Fire the armed retry timer of `ue_id`'s specific procedure
    pub fn fire_specific_retry(&self, ue_id: UeId) {
        let id = self
            .wheel
            .pending(ue_id, NasTimerKind::SpecificRetry)
            .expect("retry timer armed");
        let event = self.wheel.fire(id).expect("timer pending");
        self.engine.handle_timer(event).unwrap();
    }

    /// Retransmission counter of the identification procedure, if running
    pub fn retransmissions(&self, ue_id: UeId) -> Option<u32> {
        self.engine
            .contexts()
            .with_context(ue_id, |ctx| {
                ctx.common_procedure(CommonProcType::Identification)
                    .map(|procedure| procedure.retransmission_count())
            })
            .flatten()
    }
}
