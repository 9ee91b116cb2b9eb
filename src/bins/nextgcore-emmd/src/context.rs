//! EMM Context Management
//!
//! Per-subscriber EMM state plus the two stores the engine consults: the
//! EMM context store (one lock domain per subscriber, indexed by IMSI) and
//! the application-layer session binding store.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::emm_build::EmmCause;
use crate::procedure::{CommonProcType, CommonProcedure, SpecificProcedure};
use crate::sm::{EmmFsm, EmmState};

/// Transport-local subscriber identifier (MME UE S1AP ID)
pub type UeId = u32;

// ============================================================================
// NAS Security Context
// ============================================================================

/// Current NAS security context of a subscriber
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NasSecurityContext {
    /// Key set identifier
    pub ksi: u8,
    /// Downlink NAS count
    pub dl_count: u32,
    /// Uplink NAS count
    pub ul_count: u32,
    /// Selected ciphering algorithm
    pub selected_enc_algorithm: u8,
    /// Selected integrity algorithm
    pub selected_int_algorithm: u8,
}

// ============================================================================
// EMM Context
// ============================================================================

/// EMM context of one subscriber
#[derive(Debug)]
pub struct EmmContext {
    /// Subscriber identifier
    pub ue_id: UeId,
    fsm: EmmFsm,
    /// Security context, `None` until security mode control completes
    pub security: Option<NasSecurityContext>,
    /// IMSI BCD string
    pub imsi_bcd: Option<String>,
    /// IMEI BCD string
    pub imei_bcd: Option<String>,
    /// IMEISV BCD string
    pub imeisv_bcd: Option<String>,
    /// Cause recorded when the context is marked for removal
    pub emm_cause: Option<EmmCause>,
    pub(crate) common_procs: HashMap<CommonProcType, CommonProcedure>,
    pub(crate) specific_proc: Option<Arc<SpecificProcedure>>,
}

impl EmmContext {
    /// Create a context in the de-registered state
    pub fn new(ue_id: UeId) -> Self {
        let mut fsm = EmmFsm::new(ue_id);
        fsm.init();
        Self {
            ue_id,
            fsm,
            security: None,
            imsi_bcd: None,
            imei_bcd: None,
            imeisv_bcd: None,
            emm_cause: None,
            common_procs: HashMap::new(),
            specific_proc: None,
        }
    }

    pub fn state(&self) -> EmmState {
        self.fsm.state()
    }

    pub fn set_state(&mut self, state: EmmState) {
        self.fsm.transition(state);
    }

    /// Active common procedure of the given type
    pub fn common_procedure(&self, proc_type: CommonProcType) -> Option<&CommonProcedure> {
        self.common_procs.get(&proc_type)
    }

    pub fn common_procedure_count(&self) -> usize {
        self.common_procs.len()
    }

    /// Pending specific procedure (attach, TAU), if any
    pub fn specific_procedure(&self) -> Option<&Arc<SpecificProcedure>> {
        self.specific_proc.as_ref()
    }
}

fn lock_context(ctx: &Mutex<EmmContext>) -> MutexGuard<'_, EmmContext> {
    ctx.lock().unwrap_or_else(PoisonError::into_inner)
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

// ============================================================================
// EMM Context Store
// ============================================================================

/// Shared handle to one subscriber's lock domain
pub type EmmContextRef = Arc<Mutex<EmmContext>>;

/// Authoritative EMM context store
///
/// Lock order: a subscriber mutex may be held while the map or index locks
/// are taken, never the reverse. Two subscriber mutexes are always taken in
/// ascending [`UeId`] order (see [`EmmContextStore::lock_pair`]).
#[derive(Debug, Default)]
pub struct EmmContextStore {
    mme_ue_list: RwLock<HashMap<UeId, EmmContextRef>>,
    imsi_ue_hash: RwLock<HashMap<String, UeId>>,
}

impl EmmContextStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the context for `ue_id`, or return the existing one
    pub fn create(&self, ue_id: UeId) -> EmmContextRef {
        let mut list = write(&self.mme_ue_list);
        Arc::clone(list.entry(ue_id).or_insert_with(|| {
            log::debug!("[ue_id={}] EMM context added", ue_id);
            Arc::new(Mutex::new(EmmContext::new(ue_id)))
        }))
    }

    pub fn get(&self, ue_id: UeId) -> Option<EmmContextRef> {
        read(&self.mme_ue_list).get(&ue_id).cloned()
    }

    pub fn contains(&self, ue_id: UeId) -> bool {
        read(&self.mme_ue_list).contains_key(&ue_id)
    }

    /// Remove a context and every IMSI index entry pointing at it
    pub fn remove(&self, ue_id: UeId) -> bool {
        let removed = write(&self.mme_ue_list).remove(&ue_id).is_some();
        if removed {
            write(&self.imsi_ue_hash).retain(|_, id| *id != ue_id);
            log::debug!("[ue_id={}] EMM context removed", ue_id);
        }
        removed
    }

    pub fn find_by_imsi(&self, imsi_bcd: &str) -> Option<UeId> {
        read(&self.imsi_ue_hash).get(imsi_bcd).copied()
    }

    /// Index `ue_id` by IMSI. A previous IMSI of `ue_id` is dropped from
    /// the index and a previous owner of `imsi_bcd` is replaced.
    pub fn index_imsi(&self, imsi_bcd: &str, ue_id: UeId) {
        let mut hash = write(&self.imsi_ue_hash);
        hash.retain(|imsi, id| *id != ue_id || imsi.as_str() == imsi_bcd);
        hash.insert(imsi_bcd.to_string(), ue_id);
    }

    pub fn count(&self) -> usize {
        read(&self.mme_ue_list).len()
    }

    /// Run `f` inside the lock domain of `ue_id`
    pub fn with_context<R>(&self, ue_id: UeId, f: impl FnOnce(&mut EmmContext) -> R) -> Option<R> {
        let ctx = self.get(ue_id)?;
        let mut guard = lock_context(&ctx);
        Some(f(&mut *guard))
    }

    /// Run `f` holding the lock domains of `ue_id` and, when it exists and
    /// differs, `other`. Locks are acquired in ascending identifier order.
    /// Returns `None` if `ue_id` itself has no context.
    pub fn lock_pair<R>(
        &self,
        ue_id: UeId,
        other: Option<UeId>,
        f: impl FnOnce(&mut EmmContext, Option<&mut EmmContext>) -> R,
    ) -> Option<R> {
        let first = self.get(ue_id)?;
        let second = other
            .filter(|id| *id != ue_id)
            .and_then(|id| self.get(id).map(|ctx| (id, ctx)));

        let Some((other_id, second)) = second else {
            let mut guard = lock_context(&first);
            return Some(f(&mut *guard, None));
        };

        if ue_id < other_id {
            let mut a = lock_context(&first);
            let mut b = lock_context(&second);
            Some(f(&mut *a, Some(&mut *b)))
        } else {
            let mut b = lock_context(&second);
            let mut a = lock_context(&first);
            Some(f(&mut *a, Some(&mut *b)))
        }
    }
}

// ============================================================================
// Session Binding Store
// ============================================================================

/// IMSI bindings held by the session-management layer
#[derive(Debug, Default)]
pub struct SessionBindingStore {
    imsi_hash: RwLock<HashMap<String, UeId>>,
}

impl SessionBindingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind(&self, imsi_bcd: &str, ue_id: UeId) {
        write(&self.imsi_hash).insert(imsi_bcd.to_string(), ue_id);
    }

    /// Drop every binding held by `ue_id`
    pub fn unbind_ue(&self, ue_id: UeId) -> bool {
        let mut hash = write(&self.imsi_hash);
        let before = hash.len();
        hash.retain(|_, id| *id != ue_id);
        hash.len() != before
    }

    pub fn find_by_imsi(&self, imsi_bcd: &str) -> Option<UeId> {
        read(&self.imsi_hash).get(imsi_bcd).copied()
    }

    pub fn contains_ue(&self, ue_id: UeId) -> bool {
        read(&self.imsi_hash).values().any(|id| *id == ue_id)
    }
}
