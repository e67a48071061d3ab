use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response};
use serde_json::json;
use url::Url;

use crate::config::{SlackSection, SnsSection, TelegramSection};

use super::channel::{ChannelError, ChannelKind, NotificationChannel};
use super::event::AlertEvent;

const SNS_SUBJECT_LIMIT: usize = 100;

fn http_client(timeout: Duration) -> Result<Client, ChannelError> {
    Ok(Client::builder().timeout(timeout).build()?)
}

fn require(
    channel: &'static str,
    setting: &'static str,
    value: &str,
) -> Result<(), ChannelError> {
    if value.trim().is_empty() {
        Err(ChannelError::MissingSetting { channel, setting })
    } else {
        Ok(())
    }
}

fn parse_endpoint(channel: &'static str, endpoint: &str) -> Result<Url, ChannelError> {
    let url = Url::parse(endpoint).map_err(|err| ChannelError::InvalidEndpoint {
        channel,
        endpoint: endpoint.to_string(),
        reason: err.to_string(),
    })?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(ChannelError::InvalidEndpoint {
            channel,
            endpoint: endpoint.to_string(),
            reason: format!("unsupported scheme {other}"),
        }),
    }
}

async fn ensure_success(response: Response) -> Result<(), ChannelError> {
    let status = response.status();
    if status.is_success() {
        return Ok(());
    }
    let body = response.text().await.unwrap_or_default();
    Err(ChannelError::Rejected {
        status: status.as_u16(),
        body: body.chars().take(512).collect(),
    })
}

/// Publishes to an SNS-style topic endpoint.
#[derive(Debug, Clone)]
pub struct SnsChannel {
    client: Client,
    endpoint: Url,
    topic_arn: String,
    auth_token: Option<String>,
    subject_prefix: Option<String>,
}

impl SnsChannel {
    pub fn from_config(config: &SnsSection, timeout: Duration) -> Result<Self, ChannelError> {
        require("sns", "endpoint", &config.endpoint)?;
        require("sns", "topic_arn", &config.topic_arn)?;
        let endpoint = parse_endpoint("sns", &config.endpoint)?;
        Ok(Self {
            client: http_client(timeout)?,
            endpoint,
            topic_arn: config.topic_arn.clone(),
            auth_token: config.auth_token.clone().filter(|token| !token.is_empty()),
            subject_prefix: config.subject_prefix.clone(),
        })
    }

    fn subject(&self, event: &AlertEvent) -> String {
        let subject = match &self.subject_prefix {
            Some(prefix) => format!("{prefix} {}", event.subject()),
            None => event.subject(),
        };
        subject.chars().take(SNS_SUBJECT_LIMIT).collect()
    }
}

#[async_trait]
impl NotificationChannel for SnsChannel {
    fn name(&self) -> &str {
        "sns"
    }

    fn kind(&self) -> ChannelKind {
        ChannelKind::Sns
    }

    async fn send(&self, event: &AlertEvent) -> Result<(), ChannelError> {
        let body = json!({
            "TopicArn": self.topic_arn,
            "Subject": self.subject(event),
            "Message": event.render_text(),
            "MessageAttributes": {
                "alert_kind": event.alert_kind.to_string(),
                "data_source": event.data_source,
            },
        });
        let mut request = self.client.post(self.endpoint.clone()).json(&body);
        if let Some(token) = &self.auth_token {
            request = request.bearer_auth(token);
        }
        ensure_success(request.send().await?).await
    }
}

#[derive(Debug, Clone)]
pub struct TelegramChannel {
    client: Client,
    send_url: Url,
    chat_id: String,
}

impl TelegramChannel {
    pub fn from_config(config: &TelegramSection, timeout: Duration) -> Result<Self, ChannelError> {
        require("telegram", "bot_token", &config.bot_token)?;
        require("telegram", "chat_id", &config.chat_id)?;
        let base = config.api_base.trim_end_matches('/');
        let send_url = parse_endpoint(
            "telegram",
            &format!("{base}/bot{token}/sendMessage", token = config.bot_token),
        )?;
        Ok(Self {
            client: http_client(timeout)?,
            send_url,
            chat_id: config.chat_id.clone(),
        })
    }
}

#[async_trait]
impl NotificationChannel for TelegramChannel {
    fn name(&self) -> &str {
        "telegram"
    }

    fn kind(&self) -> ChannelKind {
        ChannelKind::Telegram
    }

    async fn send(&self, event: &AlertEvent) -> Result<(), ChannelError> {
        let body = json!({
            "chat_id": self.chat_id,
            "text": event.render_text(),
            "disable_web_page_preview": true,
        });
        let response = self
            .client
            .post(self.send_url.clone())
            .json(&body)
            .send()
            .await?;
        ensure_success(response).await
    }
}

/// Slack incoming-webhook delivery.
#[derive(Debug, Clone)]
pub struct SlackChannel {
    client: Client,
    webhook_url: Url,
    channel: Option<String>,
    username: Option<String>,
}

impl SlackChannel {
    pub fn from_config(config: &SlackSection, timeout: Duration) -> Result<Self, ChannelError> {
        require("slack", "webhook_url", &config.webhook_url)?;
        Ok(Self {
            client: http_client(timeout)?,
            webhook_url: parse_endpoint("slack", &config.webhook_url)?,
            channel: config.channel.clone(),
            username: config.username.clone(),
        })
    }
}

#[async_trait]
impl NotificationChannel for SlackChannel {
    fn name(&self) -> &str {
        "slack"
    }

    fn kind(&self) -> ChannelKind {
        ChannelKind::Slack
    }

    async fn send(&self, event: &AlertEvent) -> Result<(), ChannelError> {
        let mut body = json!({ "text": event.render_text() });
        if let Some(channel) = &self.channel {
            body["channel"] = json!(channel);
        }
        if let Some(username) = &self.username {
            body["username"] = json!(username);
        }
        let response = self
            .client
            .post(self.webhook_url.clone())
            .json(&body)
            .send()
            .await?;
        ensure_success(response).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::AlertKind;

    const TIMEOUT: Duration = Duration::from_secs(2);

    #[test]
    fn telegram_requires_token() {
        let config = TelegramSection {
            bot_token: "  ".into(),
            chat_id: "42".into(),
            api_base: "https://api.telegram.org".into(),
        };
        let err = TelegramChannel::from_config(&config, TIMEOUT).unwrap_err();
        assert!(matches!(
            err,
            ChannelError::MissingSetting {
                channel: "telegram",
                setting: "bot_token"
            }
        ));
    }

    #[test]
    fn telegram_builds_send_message_url() {
        let config = TelegramSection {
            bot_token: "123:abc".into(),
            chat_id: "42".into(),
            api_base: "https://api.telegram.org/".into(),
        };
        let channel = TelegramChannel::from_config(&config, TIMEOUT).unwrap();
        assert_eq!(
            channel.send_url.as_str(),
            "https://api.telegram.org/bot123:abc/sendMessage"
        );
    }

    #[test]
    fn slack_rejects_non_http_webhook() {
        let config = SlackSection {
            webhook_url: "ftp://hooks.example.com/T000".into(),
            channel: None,
            username: None,
        };
        assert!(matches!(
            SlackChannel::from_config(&config, TIMEOUT),
            Err(ChannelError::InvalidEndpoint { channel: "slack", .. })
        ));
    }

    #[test]
    fn sns_subject_is_truncated() {
        let config = SnsSection {
            endpoint: "https://sns.example.com/publish".into(),
            topic_arn: "arn:aws:sns:sa-east-1:000000000000:scrapers".into(),
            auth_token: Some(String::new()),
            subject_prefix: Some("[prod]".into()),
        };
        let channel = SnsChannel::from_config(&config, TIMEOUT).unwrap();
        assert!(channel.auth_token.is_none());
        let event = AlertEvent::new(AlertKind::Anomaly, "x".repeat(200), "spike");
        let subject = channel.subject(&event);
        assert!(subject.starts_with("[prod] [ANOMALY]"));
        assert_eq!(subject.chars().count(), SNS_SUBJECT_LIMIT);
    }
}
