use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::event::AlertEvent;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("channel {channel} is missing required setting {setting}")]
    MissingSetting {
        channel: &'static str,
        setting: &'static str,
    },
    #[error("channel {channel} has an invalid endpoint {endpoint}: {reason}")]
    InvalidEndpoint {
        channel: &'static str,
        endpoint: String,
        reason: String,
    },
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("unexpected status {status}: {body}")]
    Rejected { status: u16, body: String },
    #[error("delivery failed: {0}")]
    Delivery(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    Dashboard,
    Sns,
    Telegram,
    Slack,
}

impl ChannelKind {
    /// Network channels are wrapped in the dispatcher's retry policy.
    pub fn is_network(self) -> bool {
        !matches!(self, ChannelKind::Dashboard)
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelKind::Dashboard => write!(f, "dashboard"),
            ChannelKind::Sns => write!(f, "sns"),
            ChannelKind::Telegram => write!(f, "telegram"),
            ChannelKind::Slack => write!(f, "slack"),
        }
    }
}

#[async_trait]
pub trait NotificationChannel: Send + Sync {
    fn name(&self) -> &str;

    fn kind(&self) -> ChannelKind;

    async fn send(&self, event: &AlertEvent) -> Result<(), ChannelError>;
}
