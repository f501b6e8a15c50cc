//! Background expiry sweeper

use capflow_core::{StateError, SweepReport};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// One sweep pass; `Ok(None)` means the pass was skipped
pub type SweepFn = Arc<dyn Fn() -> Result<Option<SweepReport>, StateError> + Send + Sync>;

/// Periodically runs a sweep on the blocking pool until stopped
pub struct Sweeper {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl Sweeper {
    /// Start sweeping every `period`; the first pass runs one period from now
    pub fn spawn(period: Duration, sweep: SweepFn) -> Self {
        let (stop, mut stopped) = watch::channel(false);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            info!(period_secs = period.as_secs_f64(), "State sweeper started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let sweep = sweep.clone();
                        match tokio::task::spawn_blocking(move || sweep()).await {
                            Ok(Ok(Some(report))) if !report.is_empty() => info!(
                                removed_analyses = report.removed_analyses,
                                removed_entities = report.removed_entities,
                                "Swept expired state"
                            ),
                            Ok(Ok(Some(_))) => debug!("Sweep found nothing to remove"),
                            Ok(Ok(None)) => debug!("Sweep skipped"),
                            Ok(Err(e)) => error!(error = %e, "State sweep failed"),
                            Err(e) => error!(error = %e, "State sweep task failed"),
                        }
                    }
                    changed = stopped.changed() => {
                        if changed.is_err() || *stopped.borrow() {
                            break;
                        }
                    }
                }
            }

            info!("State sweeper stopped");
        });
        Self { stop, handle }
    }

    /// Signal the loop and wait for any pass in progress to finish
    pub async fn stop(self) {
        let _ = self.stop.send(true);
        if let Err(e) = self.handle.await {
            warn!(error = %e, "State sweeper did not stop cleanly");
        }
    }
}
