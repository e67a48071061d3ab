use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use futures::future::join_all;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::AlertingSection;

use super::channel::{ChannelError, NotificationChannel};
use super::dashboard::{DashboardAlertRecord, DashboardAlertStore, DashboardChannel};
use super::event::AlertEvent;
use super::network::{SlackChannel, SnsChannel, TelegramChannel};
use super::retry::RetryPolicy;

#[derive(Debug, Error)]
pub enum DispatcherError {
    #[error("channel name {0} registered twice")]
    DuplicateChannel(String),
    #[error("channel configuration error: {0}")]
    Channel(#[from] ChannelError),
}

/// Per-channel delivery outcome, keyed by channel name.
pub type DispatchResult = BTreeMap<String, bool>;

/// Fans alerts out to every configured channel. The dashboard channel is
/// always first; network channels only exist when configured, and each one
/// is retried independently of the others.
pub struct AlertDispatcher {
    channels: Vec<Arc<dyn NotificationChannel>>,
    dashboard: Arc<DashboardAlertStore>,
    retry: RetryPolicy,
}

impl fmt::Debug for AlertDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AlertDispatcher")
            .field("channels", &self.channel_names())
            .field("retry", &self.retry)
            .finish()
    }
}

impl AlertDispatcher {
    pub fn new(dashboard: Arc<DashboardAlertStore>, retry: RetryPolicy) -> Self {
        let channel: Arc<dyn NotificationChannel> =
            Arc::new(DashboardChannel::new(Arc::clone(&dashboard)));
        Self {
            channels: vec![channel],
            dashboard,
            retry,
        }
    }

    pub fn from_config(
        config: &AlertingSection,
        dashboard: Arc<DashboardAlertStore>,
    ) -> Result<Self, DispatcherError> {
        let timeout = config.request_timeout();
        let mut dispatcher = Self::new(dashboard, RetryPolicy::new(config.retry.clone()));
        if let Some(sns) = &config.sns {
            let channel = SnsChannel::from_config(sns, timeout)?;
            dispatcher = dispatcher.with_channel(Arc::new(channel))?;
        }
        if let Some(telegram) = &config.telegram {
            let channel = TelegramChannel::from_config(telegram, timeout)?;
            dispatcher = dispatcher.with_channel(Arc::new(channel))?;
        }
        if let Some(slack) = &config.slack {
            let channel = SlackChannel::from_config(slack, timeout)?;
            dispatcher = dispatcher.with_channel(Arc::new(channel))?;
        }
        Ok(dispatcher)
    }

    pub fn with_channel(
        mut self,
        channel: Arc<dyn NotificationChannel>,
    ) -> Result<Self, DispatcherError> {
        if self
            .channels
            .iter()
            .any(|existing| existing.name() == channel.name())
        {
            return Err(DispatcherError::DuplicateChannel(channel.name().to_string()));
        }
        self.channels.push(channel);
        Ok(self)
    }

    pub fn channel_names(&self) -> Vec<String> {
        self.channels
            .iter()
            .map(|channel| channel.name().to_string())
            .collect()
    }

    pub fn dashboard(&self) -> &Arc<DashboardAlertStore> {
        &self.dashboard
    }

    /// Sends `event` to every channel concurrently. A failing or panicking
    /// channel is reported as `false` and never blocks the others.
    pub async fn dispatch(&self, event: AlertEvent) -> DispatchResult {
        let event = Arc::new(event.stamped());
        let tasks = self.channels.iter().map(|channel| {
            let name = channel.name().to_string();
            let handle = tokio::spawn(deliver(
                Arc::clone(channel),
                Arc::clone(&event),
                self.retry.clone(),
            ));
            async move {
                match handle.await {
                    Ok(delivered) => (name, delivered),
                    Err(err) => {
                        warn!(channel = %name, error = %err, "alert channel task aborted");
                        (name, false)
                    }
                }
            }
        });
        let results: DispatchResult = join_all(tasks).await.into_iter().collect();

        let succeeded: Vec<&str> = results
            .iter()
            .filter(|(_, delivered)| **delivered)
            .map(|(name, _)| name.as_str())
            .collect();
        let failed: Vec<&str> = results
            .iter()
            .filter(|(_, delivered)| !**delivered)
            .map(|(name, _)| name.as_str())
            .collect();
        if failed.is_empty() {
            info!(
                kind = %event.alert_kind,
                source = %event.data_source,
                succeeded = ?succeeded,
                "alert dispatched"
            );
        } else {
            warn!(
                kind = %event.alert_kind,
                source = %event.data_source,
                succeeded = ?succeeded,
                failed = ?failed,
                "alert dispatched with channel failures"
            );
        }
        results
    }

    pub fn get_recent(&self, limit: usize) -> Vec<DashboardAlertRecord> {
        self.dashboard.get_recent(limit)
    }

    pub fn acknowledge(&self, id: &str) -> bool {
        self.dashboard.acknowledge(id)
    }
}

async fn deliver(
    channel: Arc<dyn NotificationChannel>,
    event: Arc<AlertEvent>,
    retry: RetryPolicy,
) -> bool {
    if channel.kind().is_network() {
        let name = channel.name().to_string();
        let outcome = retry
            .run(&name, |_| {
                let channel = Arc::clone(&channel);
                let event = Arc::clone(&event);
                async move { channel.send(&event).await }
            })
            .await;
        match outcome {
            Ok(outcome) => {
                if outcome.attempts > 1 {
                    info!(
                        channel = %name,
                        attempts = outcome.attempts,
                        "alert delivered after retry"
                    );
                } else {
                    debug!(channel = %name, "alert delivered");
                }
                true
            }
            Err(_) => false,
        }
    } else {
        match channel.send(&event).await {
            Ok(()) => true,
            Err(err) => {
                warn!(channel = channel.name(), error = %err, "alert delivery failed");
                false
            }
        }
    }
}
