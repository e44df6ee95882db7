// Operator notifications

use crate::core::bot_state::BotState;
use crate::core::position::Position;
use crate::core::types::HaltReason;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Mutex;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AlertLevel {
    Info,
    Warning,
    Critical,
    Emergency,
}

impl AlertLevel {
    pub fn for_halt(reason: HaltReason) -> Self {
        match reason {
            HaltReason::ReconciliationConflict
            | HaltReason::SubmissionFailed
            | HaltReason::EventStreamLost => AlertLevel::Emergency,
            HaltReason::OutOfRange
            | HaltReason::DrawdownExceeded
            | HaltReason::InsufficientBalance
            | HaltReason::DailyLossLimit
            | HaltReason::DailyFillLimit
            | HaltReason::ExposureLimit => AlertLevel::Critical,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HaltNotice {
    pub reason: HaltReason,
    pub detail: String,
    pub pair: String,
    pub sequence: u64,
    pub position: Position,
    pub active_orders: usize,
    pub timestamp: DateTime<Utc>,
}

impl HaltNotice {
    pub fn from_state(state: &BotState, reason: HaltReason, detail: impl Into<String>) -> Self {
        Self {
            reason,
            detail: detail.into(),
            pair: state.pair.clone(),
            sequence: state.sequence,
            position: state.position,
            active_orders: state.active_orders().count(),
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub timestamp: DateTime<Utc>,
    pub level: AlertLevel,
    pub message: String,
    pub halt: Option<HaltNotice>,
}

/// Delivery channel for operator-facing events.
pub trait Notifier: Send + Sync {
    fn halt(&self, notice: &HaltNotice);

    fn alert(&self, level: AlertLevel, message: &str);
}

/// Bounded in-memory record of recent alerts.
#[derive(Debug)]
pub struct AlertHistory {
    alerts: Mutex<VecDeque<Alert>>,
    max_alerts: usize,
}

impl AlertHistory {
    pub fn new(max_alerts: usize) -> Self {
        Self {
            alerts: Mutex::new(VecDeque::new()),
            max_alerts: max_alerts.max(1),
        }
    }

    pub fn push(&self, alert: Alert) {
        let mut alerts = self.alerts.lock().unwrap_or_else(|p| p.into_inner());
        alerts.push_back(alert);
        while alerts.len() > self.max_alerts {
            alerts.pop_front();
        }
    }

    pub fn snapshot(&self) -> Vec<Alert> {
        self.alerts
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    pub fn halts(&self) -> Vec<HaltNotice> {
        self.snapshot().into_iter().filter_map(|a| a.halt).collect()
    }
}

/// Writes notifications to the tracing log and keeps them in history.
#[derive(Debug)]
pub struct LogNotifier {
    history: AlertHistory,
}

impl LogNotifier {
    pub fn new() -> Self {
        Self::with_capacity(1000)
    }

    pub fn with_capacity(max_alerts: usize) -> Self {
        Self {
            history: AlertHistory::new(max_alerts),
        }
    }

    pub fn history(&self) -> &AlertHistory {
        &self.history
    }
}

impl Default for LogNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Notifier for LogNotifier {
    fn halt(&self, notice: &HaltNotice) {
        error!(
            reason = %notice.reason,
            pair = %notice.pair,
            sequence = notice.sequence,
            position = notice.position.quantity,
            realized_pnl = notice.position.realized_pnl,
            active_orders = notice.active_orders,
            "🚨 BOT HALTED: {}",
            notice.detail
        );
        self.history.push(Alert {
            timestamp: notice.timestamp,
            level: AlertLevel::for_halt(notice.reason),
            message: format!("{}: {}", notice.reason, notice.detail),
            halt: Some(notice.clone()),
        });
    }

    fn alert(&self, level: AlertLevel, message: &str) {
        match level {
            AlertLevel::Emergency | AlertLevel::Critical => error!("🚨 {}", message),
            AlertLevel::Warning => warn!("⚠️ {}", message),
            AlertLevel::Info => info!("ℹ️ {}", message),
        }
        self.history.push(Alert {
            timestamp: Utc::now(),
            level,
            message: message.to_string(),
            halt: None,
        });
    }
}
