use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;

use crate::models::RoundNotice;
use crate::services::traits::{NotifyError, Notifier};

/// Posts the round notice as JSON to a notification endpoint
///
/// The endpoint owns fan-out to participants (email, chat, calendar).
pub struct WebhookNotifier {
    url: String,
    api_key: Option<String>,
    client: Client,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>, api_key: Option<String>, timeout: Duration) -> Result<Self, NotifyError> {
        let client = Client::builder().timeout(timeout).build()?;

        Ok(Self {
            url: url.into(),
            api_key,
            client,
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, notice: &RoundNotice) -> Result<(), NotifyError> {
        tracing::debug!(
            "Posting round notice for {} ({} groups) to {}",
            notice.round_id,
            notice.groups.len(),
            self.url
        );

        let mut request = self.client.post(&self.url).json(notice);
        if let Some(key) = &self.api_key {
            request = request.header("X-Api-Key", key);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(NotifyError::Rejected(response.status().as_u16()));
        }

        Ok(())
    }
}

/// Writes notices to the log instead of delivering them
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, notice: &RoundNotice) -> Result<(), NotifyError> {
        for group in &notice.groups {
            tracing::info!(
                "Round {} match {}: {:?} (score {:.3}, shared topics {:?})",
                notice.round_id,
                group.match_id,
                group.members,
                group.average_score,
                group.shared_topics
            );
        }
        Ok(())
    }
}
