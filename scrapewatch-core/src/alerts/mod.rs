mod channel;
mod dashboard;
mod dispatcher;
mod event;
mod network;
mod retry;
mod threshold;

pub use channel::{ChannelError, ChannelKind, NotificationChannel};
pub use dashboard::{
    DashboardAlertRecord, DashboardAlertStore, DashboardChannel, DashboardError, DashboardStats,
    DEFAULT_DASHBOARD_CAPACITY,
};
pub use dispatcher::{AlertDispatcher, DispatchResult, DispatcherError};
pub use event::{AlertEvent, AlertKind};
pub use network::{SlackChannel, SnsChannel, TelegramChannel};
pub use retry::{RetryOutcome, RetryPolicy};
pub use threshold::ThresholdEvaluator;
