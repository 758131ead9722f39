//! Periodic firing of due timers

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use super::duration_millis;
use crate::engine::{EngineError, WorkflowEngine};
use crate::persistence::HistoryStore;
use crate::queue::ResumeQueue;

/// Timer scanner configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TimerScannerConfig {
    /// Time between scans
    #[serde(with = "duration_millis")]
    pub interval: Duration,
}

impl Default for TimerScannerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
        }
    }
}

impl TimerScannerConfig {
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }
}

/// Scans for due timers and fires them through the engine
///
/// Several scanners may run against the same store: firing is checked
/// against the history, so a timer fired twice is recorded once.
pub struct TimerScanner<S: HistoryStore, Q: ResumeQueue> {
    engine: Arc<WorkflowEngine<S, Q>>,
    config: TimerScannerConfig,
    shutdown_tx: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl<S: HistoryStore, Q: ResumeQueue> TimerScanner<S, Q> {
    pub fn new(engine: Arc<WorkflowEngine<S, Q>>, config: TimerScannerConfig) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            engine,
            config,
            shutdown_tx,
            handle: Mutex::new(None),
        }
    }

    /// Fire everything due right now
    pub async fn scan_once(&self) -> Result<usize, EngineError> {
        self.engine.fire_due_timers().await
    }

    /// Start scanning in the background; a second call is a no-op
    pub fn start(&self) {
        let mut handle = self.handle.lock();
        if handle.is_some() {
            return;
        }

        self.shutdown_tx.send_replace(false);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let engine = Arc::clone(&self.engine);
        let interval = self.config.interval;

        info!(
            interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX),
            "Starting timer scanner"
        );

        *handle = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match engine.fire_due_timers().await {
                            Ok(0) => {}
                            Ok(fired) => debug!(fired, "Timer scan fired timers"),
                            Err(e) => error!("Timer scan failed: {}", e),
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        debug!("Timer scanner: shutdown requested");
                        break;
                    }
                }
            }
        }));
    }

    /// Stop scanning and wait for an in-progress scan to finish
    pub async fn shutdown(&self) {
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            self.shutdown_tx.send_replace(true);
            if let Err(e) = handle.await {
                error!("Timer scanner ended abnormally: {}", e);
            }
            info!("Timer scanner stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.lock().is_some()
    }
}
