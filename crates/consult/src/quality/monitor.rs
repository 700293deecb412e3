//! Periodic transport sampling
//!
//! A monitor samples only while the session is ACTIVE and the transport is
//! connected, and stops on its own once the session reaches a terminal
//! status or the transport is lost.

use super::{interval_loss, LossThresholds, QualitySample, QualitySink, QualityUpdate};
use crate::config::QualityConfig;
use crate::media::{PeerTransport, TransportState, TransportStats};
use crate::session::{Session, SessionStatus};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Handle to a running monitor; dropping it also stops sampling
pub struct MonitorHandle {
    id: String,
    stop_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl MonitorHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Whether the sampling task has exited
    pub fn is_finished(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .map(|task| task.is_finished())
            .unwrap_or(true)
    }
}

/// Starts quality monitors for peer transports
#[derive(Debug, Clone)]
pub struct QualityMonitor {
    thresholds: LossThresholds,
    default_interval: Duration,
}

impl QualityMonitor {
    pub fn new(config: &QualityConfig) -> Self {
        Self {
            thresholds: LossThresholds::from(config),
            default_interval: config.sample_interval(),
        }
    }

    pub fn default_interval(&self) -> Duration {
        self.default_interval
    }

    /// Start sampling `transport` every `interval`
    ///
    /// `session` is the snapshot feed of the owning session.
    pub fn start_monitoring(
        &self,
        transport: Arc<dyn PeerTransport>,
        interval: Duration,
        session: watch::Receiver<Session>,
        sink: Arc<dyn QualitySink>,
    ) -> MonitorHandle {
        let id = Uuid::new_v4().to_string();
        let (stop_tx, stop_rx) = watch::channel(false);

        let task = tokio::spawn(run_monitor(
            id.clone(),
            transport,
            interval,
            self.thresholds,
            session,
            sink,
            stop_rx,
        ));

        MonitorHandle {
            id,
            stop_tx,
            task: Mutex::new(Some(task)),
        }
    }

    /// Stop a monitor and wait for it to exit; idempotent
    pub async fn stop_monitoring(&self, handle: &MonitorHandle) {
        handle.stop_tx.send_replace(true);
        let task = handle.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(monitor_id = %handle.id, error = %e, "Quality monitor task failed");
            }
        }
    }
}

async fn run_monitor(
    id: String,
    transport: Arc<dyn PeerTransport>,
    interval: Duration,
    thresholds: LossThresholds,
    mut session: watch::Receiver<Session>,
    sink: Arc<dyn QualitySink>,
    mut stop_rx: watch::Receiver<bool>,
) {
    let session_id = session.borrow().id.clone();
    info!(monitor_id = %id, session_id = %session_id, ?interval, "Quality monitor started");

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker.tick().await;

    let mut previous = TransportStats::default();

    loop {
        tokio::select! {
            changed = stop_rx.changed() => {
                if changed.is_err() || *stop_rx.borrow() {
                    break;
                }
                continue;
            }
            changed = session.changed() => {
                if changed.is_err() || session.borrow().status.is_terminal() {
                    break;
                }
                continue;
            }
            _ = ticker.tick() => {}
        }

        let status = session.borrow().status;
        if status.is_terminal() {
            break;
        }
        if status != SessionStatus::Active {
            continue;
        }

        match transport.state() {
            TransportState::Connected => {}
            state @ (TransportState::Failed | TransportState::Disconnected) => {
                warn!(monitor_id = %id, session_id = %session_id, ?state, "Transport lost");
                sink.report(QualityUpdate::Sample(QualitySample::lost())).await;
                sink.report(QualityUpdate::TransportLost { state }).await;
                break;
            }
            TransportState::Closed => break,
            TransportState::New | TransportState::Connecting => continue,
        }

        let stats = match transport.stats().await {
            Ok(stats) => stats,
            Err(e) => {
                warn!(monitor_id = %id, error = %e, "Failed to read transport stats");
                continue;
            }
        };

        let sample = QualitySample::new(interval_loss(&previous, &stats), &thresholds);
        debug!(
            monitor_id = %id,
            session_id = %session_id,
            quality = %sample.quality,
            loss_rate = sample.loss_rate,
            "Quality sample"
        );
        previous = stats;
        sink.report(QualityUpdate::Sample(sample)).await;
    }

    info!(monitor_id = %id, session_id = %session_id, "Quality monitor stopped");
}
