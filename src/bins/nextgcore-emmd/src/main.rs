//! NextGCore EMM daemon
//!
//! Hosts the MME's EMM common-procedure engine and drives its timers

use anyhow::Result;
use clap::Parser;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use nextgcore_emmd::{
    build_identity_request, EmmAsPrimitive, EmmAsSap, EmmCnPrimitive, EmmCnSap, EmmConfig,
    EmmContextStore, EmmEngine, EmmError, EmmRegPrimitive, EmmRegSap, EmmResult,
    EmmSapDispatcher, SessionBindingStore, TimerWheel,
};

/// Upper bound on one run loop sleep
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// NextGCore EMM - EPS Mobility Management common procedures
#[derive(Parser, Debug)]
#[command(name = "nextgcore-emmd")]
#[command(author = "NextGCore")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "EPC EMM common-procedure engine")]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/nextgcore/emm.yaml")]
    config: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Disable color output
    #[arg(long)]
    no_color: bool,
}

// ============================================================================
// SAP Layers
// ============================================================================

/// Registration layer
struct EmmRegLayer;

impl EmmRegSap for EmmRegLayer {
    fn emm_reg_send(&self, primitive: &EmmRegPrimitive) -> EmmResult<()> {
        match primitive {
            EmmRegPrimitive::CommonProcConcluded {
                ue_id,
                proc_type,
                outcome,
                notify,
                previous_state,
                ..
            } => log::info!(
                "[ue_id={}] {} concluded: {:?} (notify={}, previous state {})",
                ue_id,
                proc_type,
                outcome,
                notify,
                previous_state
            ),
            EmmRegPrimitive::SpecificProcRetry {
                ue_id,
                proc_type,
                old_ue_id,
            } => log::info!("[ue_id={}] {} may retry (old ue_id={:?})", ue_id, proc_type, old_ue_id),
            other => log::debug!("{:?}", other),
        }
        Ok(())
    }
}

/// Access stratum: encodes NAS messages for the S1AP downlink
struct NasAccessStratum;

impl EmmAsSap for NasAccessStratum {
    fn emm_as_send(&self, primitive: &EmmAsPrimitive) -> EmmResult<()> {
        match primitive {
            EmmAsPrimitive::SendIdentityRequest {
                ue_id,
                security,
                identity_type,
            } => {
                let nas = build_identity_request(*identity_type);
                log::info!(
                    "[ue_id={}] Identity request ({}) {} bytes, {}",
                    ue_id,
                    identity_type,
                    nas.len(),
                    if security.is_some() { "protected" } else { "plain" }
                );
            }
        }
        Ok(())
    }
}

/// Core network: hands cleanup work to the run loop
struct CoreNetworkQueue {
    tx: Mutex<Sender<EmmCnPrimitive>>,
}

impl EmmCnSap for CoreNetworkQueue {
    fn emm_cn_send(&self, primitive: &EmmCnPrimitive) -> EmmResult<()> {
        self.tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .send(primitive.clone())
            .map_err(|e| EmmError::SendFailed(e.to_string()))
    }
}

// ============================================================================
// Application
// ============================================================================

/// EMM application state
pub struct EmmApp {
    /// Running flag
    running: Arc<AtomicBool>,
    /// Timer wheel driving T3470 and retry timers
    wheel: Arc<TimerWheel>,
    /// Common procedure engine
    engine: EmmEngine,
    /// Core-network cleanup queue
    cleanup_rx: Receiver<EmmCnPrimitive>,
}

impl EmmApp {
    /// Create a new EMM application
    pub fn new(config: EmmConfig) -> Self {
        let wheel = Arc::new(TimerWheel::new());
        let (tx, cleanup_rx) = mpsc::channel();

        let sap = EmmSapDispatcher::new(
            Arc::new(EmmRegLayer),
            Arc::new(NasAccessStratum),
            Arc::new(CoreNetworkQueue { tx: Mutex::new(tx) }),
        );
        let engine = EmmEngine::new(
            config,
            Arc::new(EmmContextStore::new()),
            Arc::new(SessionBindingStore::new()),
            wheel.clone(),
            sap,
        );

        Self {
            running: Arc::new(AtomicBool::new(true)),
            wheel,
            engine,
            cleanup_rx,
        }
    }

    /// Run the EMM main loop
    pub fn run(&self) -> Result<()> {
        log::info!("EMM running...");

        while self.running.load(Ordering::SeqCst) {
            self.poll();
            std::thread::sleep(self.wheel.next().min(POLL_INTERVAL));
        }

        log::info!("EMM main loop exited");
        Ok(())
    }

    /// Process expired timers, then queued core-network cleanup
    fn poll(&self) {
        for event in self.wheel.expire() {
            if let Err(e) = self.engine.handle_timer(event) {
                log::error!("[ue_id={}] {} handling failed: {}", event.ue_id, event.kind, e);
            }
        }

        while let Ok(primitive) = self.cleanup_rx.try_recv() {
            match primitive {
                EmmCnPrimitive::ImplicitDetach { ue_id, emm_cause, .. } => {
                    log::info!("[ue_id={}] Implicit detach (cause {:?})", ue_id, emm_cause);
                    self.engine.release_context(ue_id);
                }
                EmmCnPrimitive::SessionTeardown { ue_id } => {
                    log::info!("[ue_id={}] Session teardown", ue_id);
                    self.engine.sessions().unbind_ue(ue_id);
                }
            }
        }
    }

    /// Shutdown the EMM application
    pub fn shutdown(&mut self) {
        log::info!("Shutting down EMM...");
        log::debug!(
            "{} contexts, {} timers pending at shutdown",
            self.engine.contexts().count(),
            self.wheel.count()
        );
        log::info!("EMM shutdown complete");
    }

    /// Signal the application to stop
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Get the running flag for signal handlers
    pub fn running_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }
}

fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    // Initialize logging
    let log_level = match args.log_level.to_lowercase().as_str() {
        "trace" => log::LevelFilter::Trace,
        "debug" => log::LevelFilter::Debug,
        "info" => log::LevelFilter::Info,
        "warn" => log::LevelFilter::Warn,
        "error" => log::LevelFilter::Error,
        _ => log::LevelFilter::Info,
    };

    let mut builder = env_logger::Builder::new();
    builder.filter_level(log_level).format_timestamp_millis();
    if args.no_color {
        builder.write_style(env_logger::WriteStyle::Never);
    }
    builder.init();

    log::info!("NextGCore EMM v{}", env!("CARGO_PKG_VERSION"));
    log::info!("Configuration: {}", args.config);

    let config = EmmConfig::load(&args.config)?;
    let mut app = EmmApp::new(config);

    // Setup signal handlers
    let running = app.running_flag();
    ctrlc::set_handler(move || {
        log::info!("Received shutdown signal");
        running.store(false, Ordering::SeqCst);
    })?;

    app.run()?;
    app.shutdown();

    log::info!("NextGCore EMM terminated");
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================
