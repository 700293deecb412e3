//! Connection quality classification and monitoring

pub mod monitor;

pub use monitor::{MonitorHandle, QualityMonitor};

use crate::config::QualityConfig;
use crate::media::{TransportState, TransportStats};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Coarse connection quality
///
/// Ordered from best to worst, so `Good < Fair < Poor`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionQuality {
    Good,
    Fair,
    Poor,
}

impl std::fmt::Display for ConnectionQuality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionQuality::Good => write!(f, "good"),
            ConnectionQuality::Fair => write!(f, "fair"),
            ConnectionQuality::Poor => write!(f, "poor"),
        }
    }
}

/// Loss-rate boundaries between quality levels
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LossThresholds {
    /// Loss at or above this is `Fair`
    pub fair: f64,
    /// Loss at or above this is `Poor`
    pub poor: f64,
}

impl Default for LossThresholds {
    fn default() -> Self {
        Self::from(&QualityConfig::default())
    }
}

impl From<&QualityConfig> for LossThresholds {
    fn from(config: &QualityConfig) -> Self {
        Self {
            fair: config.fair_loss_threshold,
            poor: config.poor_loss_threshold,
        }
    }
}

/// Map a packet-loss fraction to a quality level
///
/// Monotonic: a higher loss never yields a better level.
pub fn classify(loss_rate: f64, thresholds: &LossThresholds) -> ConnectionQuality {
    if loss_rate.is_nan() || loss_rate >= thresholds.poor {
        ConnectionQuality::Poor
    } else if loss_rate >= thresholds.fair {
        ConnectionQuality::Fair
    } else {
        ConnectionQuality::Good
    }
}

/// Loss fraction between two cumulative stat snapshots
///
/// Computed as lost packets over sent packets in the interval; zero when
/// nothing was sent.
pub fn interval_loss(previous: &TransportStats, current: &TransportStats) -> f64 {
    let sent = current.packets_sent.saturating_sub(previous.packets_sent);
    let lost = current.packets_lost.saturating_sub(previous.packets_lost);
    if sent == 0 {
        return 0.0;
    }
    (lost as f64 / sent as f64).min(1.0)
}

/// One quality measurement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualitySample {
    pub quality: ConnectionQuality,
    pub loss_rate: f64,
    pub sampled_at: DateTime<Utc>,
}

impl QualitySample {
    pub fn new(loss_rate: f64, thresholds: &LossThresholds) -> Self {
        Self {
            quality: classify(loss_rate, thresholds),
            loss_rate,
            sampled_at: Utc::now(),
        }
    }

    /// Sample emitted when the transport is lost outright
    pub fn lost() -> Self {
        Self {
            quality: ConnectionQuality::Poor,
            loss_rate: 1.0,
            sampled_at: Utc::now(),
        }
    }
}

/// What a monitor reports
#[derive(Debug, Clone, PartialEq)]
pub enum QualityUpdate {
    Sample(QualitySample),
    /// Transport went to a failed or disconnected state; monitoring stops
    TransportLost { state: TransportState },
}

/// Destination for quality updates
#[async_trait]
pub trait QualitySink: Send + Sync {
    async fn report(&self, update: QualityUpdate);
}

#[async_trait]
impl QualitySink for mpsc::Sender<QualityUpdate> {
    async fn report(&self, update: QualityUpdate) {
        let _ = self.send(update).await;
    }
}
