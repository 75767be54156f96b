// Tests for webhook delivery and notification settings

use async_trait::async_trait;
use chrono::Utc;
use sinkwatch_core::data::Database;
use sinkwatch_core::error::{CoreError, Result};
use sinkwatch_core::notify::{
    DiscordNotifier, Notifier, discord_settings, mask_webhook, send_test, set_discord_settings,
};
use std::sync::Mutex;
use tempfile::TempDir;
use wiremock::matchers::{body_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn create_test_db() -> (TempDir, Database) {
    let temp_dir = TempDir::new().unwrap();
    let db = Database::new(&temp_dir.path().join("test.db")).unwrap();
    (temp_dir, db)
}

#[derive(Default)]
struct RecordingNotifier {
    sent: Mutex<Vec<String>>,
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, destination: &str, _content: &str) -> Result<()> {
        self.sent.lock().unwrap().push(destination.to_string());
        Ok(())
    }
}

#[tokio::test]
async fn test_discord_notifier_posts_content() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/webhooks/1/token"))
        .and(body_json(serde_json::json!({ "content": "hello" })))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let notifier = DiscordNotifier::new().unwrap();
    let url = format!("{}/api/webhooks/1/token", server.uri());
    notifier.send(&url, "hello").await.unwrap();
}

#[tokio::test]
async fn test_discord_notifier_reports_error_status() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(429))
        .mount(&server)
        .await;

    let notifier = DiscordNotifier::new().unwrap();
    let result = notifier.send(&server.uri(), "hello").await;
    match result {
        Err(CoreError::Notify(msg)) => assert!(msg.contains("429")),
        other => panic!("expected notify error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_send_test_requires_enabled_settings() {
    let (_temp_dir, db) = create_test_db();
    let notifier = RecordingNotifier::default();
    let webhook = "https://discord.com/api/webhooks/42/abcdefgh";

    assert!(!send_test(&db, &notifier).await.unwrap());

    set_discord_settings(&db, webhook, false, Utc::now()).unwrap();
    assert!(!send_test(&db, &notifier).await.unwrap());
    assert!(notifier.sent.lock().unwrap().is_empty());

    set_discord_settings(&db, webhook, true, Utc::now()).unwrap();
    assert!(send_test(&db, &notifier).await.unwrap());
    assert_eq!(*notifier.sent.lock().unwrap(), vec![webhook.to_string()]);
}

#[test]
fn test_settings_persist_and_mask() {
    let (_temp_dir, db) = create_test_db();
    let webhook = "https://discordapp.com/api/webhooks/42/abcdefgh";

    set_discord_settings(&db, webhook, true, Utc::now()).unwrap();
    let settings = discord_settings(&db).unwrap();
    assert!(settings.enabled);
    assert_eq!(settings.webhook_url, webhook);
    assert!(settings.updated_at.is_some());
    assert_eq!(mask_webhook(&settings.webhook_url), "https://di…efgh");

    // Disabling may clear the webhook
    set_discord_settings(&db, "", false, Utc::now()).unwrap();
    assert_eq!(discord_settings(&db).unwrap().webhook_url, "");
}
