use crate::keys::{AssetKey, SubscriberId};
use crate::render::Summary;
use crate::report::Asset;

mod telegram;

pub use telegram::{classify, format_html, TelegramNotifier};

/// MessageHandle is the opaque identifier of a delivered notification,
/// as returned by a Notifier and later used to edit it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct MessageHandle(String);

impl MessageHandle {
    pub fn new(handle: impl Into<String>) -> Self {
        Self(handle.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for MessageHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// AlertMessage holds the structured fields of a notification.
#[derive(Debug, Clone, PartialEq)]
pub struct AlertMessage {
    pub asset_name: String,
    pub address: String,
    pub city: String,
    pub image: Option<String>,
    pub key: AssetKey,
    pub summary: Summary,
}

impl AlertMessage {
    pub fn new(asset: &Asset, summary: Summary) -> Self {
        Self {
            asset_name: asset.name.clone(),
            address: asset.address.clone(),
            city: asset.city().to_string(),
            image: asset.image.clone(),
            key: asset.key,
            summary,
        }
    }

    /// Plain-text rendering of the message, without markup.
    pub fn to_text(&self) -> String {
        format!(
            "{} @ {}\n{}",
            self.asset_name,
            self.city,
            self.summary.to_text()
        )
    }
}

/// DeliveryError is the classified failure of a Notifier call.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    /// The subscriber endpoint no longer exists, and never will again.
    #[error("subscriber endpoint is gone: {0}")]
    Permanent(String),
    /// The subscriber endpoint moved to a new identity.
    #[error("subscriber endpoint migrated to {0}")]
    Migrated(SubscriberId),
    /// Any other failure, including rate limits and rejected requests.
    #[error("delivery failed: {0}")]
    Transient(String),
}

impl From<reqwest::Error> for DeliveryError {
    fn from(err: reqwest::Error) -> Self {
        DeliveryError::Transient(format!("{err:#}"))
    }
}

/// Notifier creates and edits notifications at subscriber endpoints.
pub trait Notifier: Send + Sync + 'static {
    fn create<'s>(
        &'s self,
        subscriber: &'s SubscriberId,
        message: &'s AlertMessage,
    ) -> impl std::future::Future<Output = Result<MessageHandle, DeliveryError>> + Send + 's;

    fn edit<'s>(
        &'s self,
        subscriber: &'s SubscriberId,
        handle: &'s MessageHandle,
        message: &'s AlertMessage,
    ) -> impl std::future::Future<Output = Result<(), DeliveryError>> + Send + 's;
}

#[derive(Debug)]
pub enum Sender {
    Disabled,
    Telegram(TelegramNotifier),
}

impl Sender {
    pub fn telegram(
        api: &url::Url,
        bot_token: &str,
        http_client: reqwest::Client,
    ) -> anyhow::Result<Sender> {
        Ok(Sender::Telegram(TelegramNotifier::new(
            api,
            bot_token,
            http_client,
        )?))
    }
}

impl Notifier for Sender {
    async fn create<'s>(
        &'s self,
        subscriber: &'s SubscriberId,
        message: &'s AlertMessage,
    ) -> Result<MessageHandle, DeliveryError> {
        match self {
            Sender::Disabled => {
                tracing::warn!(
                    %subscriber,
                    message = %message.to_text(),
                    "skipping sending alert (disabled)"
                );
                Ok(MessageHandle::new("disabled"))
            }
            Sender::Telegram(telegram) => telegram.create(subscriber, message).await,
        }
    }

    async fn edit<'s>(
        &'s self,
        subscriber: &'s SubscriberId,
        handle: &'s MessageHandle,
        message: &'s AlertMessage,
    ) -> Result<(), DeliveryError> {
        match self {
            Sender::Disabled => {
                tracing::warn!(
                    %subscriber,
                    %handle,
                    message = %message.to_text(),
                    "skipping editing alert (disabled)"
                );
                Ok(())
            }
            Sender::Telegram(telegram) => telegram.edit(subscriber, handle, message).await,
        }
    }
}
