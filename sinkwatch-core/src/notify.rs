use crate::data::Database;
use crate::error::{CoreError, Result};
use crate::model::DiscordSettings;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use std::time::Duration;
use tracing::{debug, info};

pub const DISCORD_SETTINGS_KEY: &str = "discord";
pub const DISCORD_WEBHOOK_PREFIX: &str = "https://discord.com/api/webhooks/";
const LEGACY_WEBHOOK_MARKER: &str = "discordapp.com/api/webhooks/";

/// Delivers a plain-text message to a destination such as a webhook URL.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, destination: &str, content: &str) -> Result<()>;
}

/// Posts `{"content": ...}` to Discord webhooks.
pub struct DiscordNotifier {
    client: Client,
}

impl DiscordNotifier {
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| CoreError::Notify(e.to_string()))?;
        Ok(Self { client })
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Notifier for DiscordNotifier {
    async fn send(&self, destination: &str, content: &str) -> Result<()> {
        let response = self
            .client
            .post(destination)
            .json(&serde_json::json!({ "content": content }))
            .send()
            .await
            .map_err(|e| CoreError::Notify(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(CoreError::Notify(format!("webhook answered {}", status)));
        }
        debug!("Webhook accepted message ({})", status);
        Ok(())
    }
}

pub fn is_discord_webhook(url: &str) -> bool {
    url.starts_with(DISCORD_WEBHOOK_PREFIX) || url.contains(LEGACY_WEBHOOK_MARKER)
}

/// Hides the webhook token: first 10 and last 4 characters survive.
pub fn mask_webhook(url: &str) -> String {
    let chars: Vec<char> = url.chars().collect();
    match chars.len() {
        0 => String::new(),
        n if n <= 12 => "****".to_string(),
        n => {
            let head: String = chars[..10].iter().collect();
            let tail: String = chars[n - 4..].iter().collect();
            format!("{}…{}", head, tail)
        }
    }
}

/// Stored settings, or disabled defaults when none were saved.
pub fn discord_settings(db: &Database) -> Result<DiscordSettings> {
    Ok(db
        .get_setting::<DiscordSettings>(DISCORD_SETTINGS_KEY)?
        .unwrap_or_default())
}

/// Validates and stores the webhook. An empty URL is only accepted when
/// notifications are being disabled.
pub fn set_discord_settings(
    db: &Database,
    webhook_url: &str,
    enabled: bool,
    now: DateTime<Utc>,
) -> Result<DiscordSettings> {
    let webhook_url = webhook_url.trim();
    if !webhook_url.is_empty() && !is_discord_webhook(webhook_url) {
        return Err(CoreError::Validation(format!(
            "webhook must start with {}",
            DISCORD_WEBHOOK_PREFIX
        )));
    }
    if enabled && webhook_url.is_empty() {
        return Err(CoreError::Validation(
            "a webhook URL is required to enable notifications".to_string(),
        ));
    }

    let settings = DiscordSettings {
        webhook_url: webhook_url.to_string(),
        enabled,
        updated_at: Some(now),
    };
    db.put_setting(DISCORD_SETTINGS_KEY, &settings, now)?;
    info!(
        "Discord notifications {} ({})",
        if enabled { "enabled" } else { "disabled" },
        mask_webhook(webhook_url)
    );
    Ok(settings)
}

/// Sends a test message. Returns `false` without sending when notifications
/// are disabled.
pub async fn send_test(db: &Database, notifier: &dyn Notifier) -> Result<bool> {
    let settings = discord_settings(db)?;
    if !settings.enabled || settings.webhook_url.is_empty() {
        return Ok(false);
    }
    notifier
        .send(&settings.webhook_url, "sinkwatch test notification")
        .await?;
    Ok(true)
}
