//! Operator alerts.
//!
//! Pushes the events a human must hear about (unprotected position,
//! daily limit, forced exit) to a webhook. Delivery is best-effort and
//! never blocks or fails a trading path; an undeliverable alert is
//! logged and dropped.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;
use thiserror::Error;
use tracing::{error, info};

use crate::config::AlertsConfig;

const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("webhook request failed: {0}")]
    Http(String),

    #[error("webhook returned HTTP {0}")]
    Status(u16),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

impl fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            AlertSeverity::Info => "INFO",
            AlertSeverity::Warning => "WARNING",
            AlertSeverity::Critical => "CRITICAL",
        };
        write!(f, "{}", label)
    }
}

#[derive(Debug, Clone)]
pub struct Alert {
    pub severity: AlertSeverity,
    pub title: String,
    pub body: String,
    pub timestamp: DateTime<Utc>,
}

impl Alert {
    pub fn new(severity: AlertSeverity, title: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            severity,
            title: title.into(),
            body: body.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn info(title: impl Into<String>, body: impl Into<String>) -> Self {
        Self::new(AlertSeverity::Info, title, body)
    }

    pub fn warning(title: impl Into<String>, body: impl Into<String>) -> Self {
        Self::new(AlertSeverity::Warning, title, body)
    }

    pub fn critical(title: impl Into<String>, body: impl Into<String>) -> Self {
        Self::new(AlertSeverity::Critical, title, body)
    }

    fn render(&self) -> String {
        format!("[{}] {}: {}", self.severity, self.title, self.body)
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, alert: &Alert) -> Result<(), NotifyError>;
}

/// POSTs `{"text": ...}` to a webhook endpoint.
pub struct WebhookNotifier {
    http: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(WEBHOOK_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            http,
            url: url.into(),
        }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, alert: &Alert) -> Result<(), NotifyError> {
        let response = self
            .http
            .post(&self.url)
            .json(&json!({
                "text": alert.render(),
                "severity": alert.severity.to_string(),
                "timestamp": alert.timestamp.to_rfc3339(),
            }))
            .send()
            .await
            .map_err(|e| NotifyError::Http(e.to_string()))?;

        if !response.status().is_success() {
            return Err(NotifyError::Status(response.status().as_u16()));
        }
        Ok(())
    }
}

/// Fans alerts out to every configured notifier, swallowing delivery
/// failures. With no notifiers configured alerts only hit the log.
pub struct AlertRouter {
    notifiers: Vec<Box<dyn Notifier>>,
}

impl AlertRouter {
    pub fn new(notifiers: Vec<Box<dyn Notifier>>) -> Self {
        Self { notifiers }
    }

    pub fn from_config(config: &AlertsConfig) -> Self {
        let mut notifiers: Vec<Box<dyn Notifier>> = Vec::new();
        if let Some(url) = &config.webhook_url {
            notifiers.push(Box::new(WebhookNotifier::new(url)));
        }
        Self::new(notifiers)
    }

    pub async fn send(&self, alert: Alert) {
        info!(severity = %alert.severity, title = %alert.title, body = %alert.body, "Alert");
        for notifier in &self.notifiers {
            if let Err(e) = notifier.notify(&alert).await {
                error!(error = %e, title = %alert.title, "Alert delivery failed");
            }
        }
    }

    // Typed helpers so call sites read as what happened.

    pub async fn unprotected_position(&self, detail: impl Into<String>) {
        self.send(Alert::critical("Position without protective orders", detail))
            .await;
    }

    pub async fn position_adopted(&self, detail: impl Into<String>) {
        self.send(Alert::warning("Adopted untracked broker position", detail))
            .await;
    }

    pub async fn daily_limit_reached(&self, detail: impl Into<String>) {
        self.send(Alert::warning("Daily limit reached, trading paused", detail))
            .await;
    }

    pub async fn forced_exit(&self, detail: impl Into<String>) {
        self.send(Alert::warning("Position force-closed", detail)).await;
    }

    pub async fn breaker_tripped(&self, detail: impl Into<String>) {
        self.send(Alert::warning("Circuit breaker tripped", detail))
            .await;
    }

    pub async fn position_closed(&self, detail: impl Into<String>) {
        self.send(Alert::info("Position closed", detail)).await;
    }

    pub async fn stop_move_skipped(&self, detail: impl Into<String>) {
        self.send(Alert::warning("Stop move skipped", detail)).await;
    }
}
