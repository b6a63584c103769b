use std::sync::Arc;
use std::time::Duration;

use candle_feed_core::Reconciler;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

pub fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Recurring reconciliation pass.
/// The first tick fires immediately; later ticks follow the period.
pub struct ExtractionScheduler {
    reconciler: Arc<Reconciler>,
    shutdown_sender: Option<mpsc::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl ExtractionScheduler {
    pub fn new(reconciler: Arc<Reconciler>) -> Self {
        Self {
            reconciler,
            shutdown_sender: None,
            handle: None,
        }
    }

    /// Start the background task. No-op if it is already running.
    pub fn start(&mut self, period: Duration) {
        if self.handle.is_some() {
            warn!("Extraction scheduler already running");
            return;
        }
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        self.shutdown_sender = Some(shutdown_tx);

        info!(period_secs = period.as_secs(), "Starting extraction scheduler");
        self.handle = Some(tokio::spawn(Self::run_loop(
            self.reconciler.clone(),
            shutdown_rx,
            period,
        )));
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Stop the task and wait for an in-flight pass to finish.
    pub async fn stop(&mut self) {
        if let Some(sender) = self.shutdown_sender.take() {
            let _ = sender.send(()).await;
        }
        if let Some(handle) = self.handle.take()
            && let Err(e) = handle.await
        {
            error!(error = %e, "Extraction scheduler task failed");
        }
    }

    async fn run_loop(
        reconciler: Arc<Reconciler>,
        mut shutdown_rx: mpsc::Receiver<()>,
        period: Duration,
    ) {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("Extraction scheduler shutting down");
                    break;
                }
                _ = interval.tick() => {
                    let report = reconciler.run_pass(unix_now()).await;
                    if !report.all_ok() {
                        warn!(errors = ?report.errors(), "Scheduled pass finished with errors");
                    }
                }
            }
        }
    }
}
