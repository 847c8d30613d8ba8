use async_trait::async_trait;
use serde::Serialize;
use tracing::info;

use crate::config::model::NotificationSubscription;
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationEvent {
    Start,
    Success,
    Warning,
    Failure,
}

impl NotificationEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationEvent::Start => "start",
            NotificationEvent::Success => "success",
            NotificationEvent::Warning => "warning",
            NotificationEvent::Failure => "failure",
        }
    }

    pub fn wanted_by(&self, subscription: &NotificationSubscription) -> bool {
        match self {
            NotificationEvent::Start => subscription.on_start,
            NotificationEvent::Success => subscription.on_success,
            NotificationEvent::Warning => subscription.on_warning,
            NotificationEvent::Failure => subscription.on_failure,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationContext {
    pub schedule: String,
    pub volume: String,
    pub repository: String,
    pub error: Option<String>,
    pub snapshot_id: Option<String>,
    pub duration_seconds: Option<f64>,
}

/// Delivery of backup notifications. Formatting and transport belong to the
/// implementation; callers only pick who gets told about what.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send_backup_notification(
        &self,
        destination: &str,
        schedule_id: &str,
        event: NotificationEvent,
        context: &NotificationContext,
    ) -> Result<()>;
}

/// Writes notifications to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send_backup_notification(
        &self,
        destination: &str,
        schedule_id: &str,
        event: NotificationEvent,
        context: &NotificationContext,
    ) -> Result<()> {
        info!(
            destination,
            schedule_id,
            event = event.as_str(),
            schedule = %context.schedule,
            error = context.error.as_deref().unwrap_or(""),
            "backup notification"
        );
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscriptions_filter_events() {
        let sub = NotificationSubscription {
            destination: "ops".to_string(),
            on_start: false,
            on_success: false,
            on_warning: true,
            on_failure: true,
        };
        assert!(!NotificationEvent::Start.wanted_by(&sub));
        assert!(!NotificationEvent::Success.wanted_by(&sub));
        assert!(NotificationEvent::Warning.wanted_by(&sub));
        assert!(NotificationEvent::Failure.wanted_by(&sub));
    }
}
