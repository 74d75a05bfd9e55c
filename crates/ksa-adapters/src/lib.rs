//! Outbound integrations: the K-Startup listing API and the Telegram channel.

use std::time::Duration;

use async_trait::async_trait;
use ksa_core::Announcement;
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "ksa-adapters";

pub const DEFAULT_API_URL: &str =
    "https://apis.data.go.kr/B552735/kisedKstartupService01/getAnnouncementInformation01";
pub const DEFAULT_TELEGRAM_API_BASE: &str = "https://api.telegram.org";

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);
const GREETING: &str = "🤖 K-Startup alert bot connected.";

/// Missing or unusable configuration at construction time. Fatal: the
/// component is never built in a degraded state.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    MissingEnv(&'static str),
    #[error("building http client: {0}")]
    HttpClient(#[from] reqwest::Error),
}

/// Source fetch or response-format failure.
#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("announcement api request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("announcement api returned status {status}")]
    HttpStatus { status: u16 },
    #[error("announcement api response is not a listing page: {0}")]
    MalformedBody(String),
}

/// Notification channel failure.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("telegram request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("telegram api error: {0}")]
    Api(String),
}

/// One page of the paginated listing endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct AnnouncementPage {
    #[serde(rename = "currentCount", default)]
    pub current_count: u32,
    #[serde(rename = "data")]
    pub announcements: Vec<Announcement>,
    #[serde(rename = "matchCount", default)]
    pub match_count: u64,
    #[serde(default)]
    pub page: u32,
    #[serde(rename = "perPage", default)]
    pub per_page: u32,
    #[serde(rename = "totalCount", default)]
    pub total_count: u64,
}

/// Paginated read access to the announcement listing.
#[async_trait]
pub trait AnnouncementSource: Send + Sync {
    async fn fetch_page(&self, per_page: u32, page: u32)
        -> Result<AnnouncementPage, UpstreamError>;
}

/// Keeps the announcements still open for application as of `as_of`
/// (`YYYYMMDD`). Callers inject the reference date; production passes
/// today in KST, tests pass fixed dates.
pub fn filter_ongoing(announcements: Vec<Announcement>, as_of: &str) -> Vec<Announcement> {
    announcements
        .into_iter()
        .filter(|a| a.is_open_as_of(as_of))
        .collect()
}

#[derive(Debug, Clone)]
pub struct KstartupClient {
    client: reqwest::Client,
    api_url: String,
    service_key: String,
}

impl KstartupClient {
    pub fn new(
        api_url: impl Into<String>,
        service_key: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, ConfigError> {
        let service_key = service_key.into();
        if service_key.is_empty() {
            return Err(ConfigError::MissingEnv("KSTARTUP_SERVICE_KEY"));
        }
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            api_url: api_url.into(),
            service_key,
        })
    }
}

#[async_trait]
impl AnnouncementSource for KstartupClient {
    async fn fetch_page(
        &self,
        per_page: u32,
        page: u32,
    ) -> Result<AnnouncementPage, UpstreamError> {
        debug!(per_page, page, "fetching announcement page");
        let response = self
            .client
            .get(&self.api_url)
            .query(&[
                ("serviceKey", self.service_key.as_str()),
                ("returnType", "json"),
            ])
            .query(&[("perPage", per_page), ("page", page)])
            .header(reqwest::header::ACCEPT, "*/*")
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(UpstreamError::HttpStatus {
                status: status.as_u16(),
            });
        }

        let body = response.text().await?;
        let parsed: AnnouncementPage = serde_json::from_str(&body)
            .map_err(|err| UpstreamError::MalformedBody(err.to_string()))?;
        debug!(
            count = parsed.announcements.len(),
            total = parsed.total_count,
            "announcement page fetched"
        );
        Ok(parsed)
    }
}

/// Delivery of formatted text messages to the configured channel.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, text: &str) -> Result<(), DeliveryError>;

    /// Sends strictly in order, awaiting each delivery and pausing `delay`
    /// between messages. The first failure aborts the remainder; messages
    /// already sent stay sent.
    async fn send_all(&self, texts: &[String], delay: Duration) -> Result<(), DeliveryError> {
        for (index, text) in texts.iter().enumerate() {
            self.send(text).await?;
            if index + 1 < texts.len() {
                tokio::time::sleep(delay).await;
            }
        }
        Ok(())
    }

    /// End-to-end channel probe; the default posts a greeting.
    async fn test_connection(&self) -> Result<(), DeliveryError> {
        self.send(GREETING).await
    }
}

#[derive(Debug, Deserialize)]
struct TelegramEnvelope {
    ok: bool,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    result: Option<JsonValue>,
}

#[derive(Debug, Clone)]
pub struct TelegramNotifier {
    client: reqwest::Client,
    // "{base}/bot{token}", the per-bot method root
    api_base: String,
    chat_id: String,
}

impl TelegramNotifier {
    pub fn new(
        api_base: impl Into<String>,
        bot_token: impl Into<String>,
        chat_id: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, ConfigError> {
        let bot_token = bot_token.into();
        if bot_token.is_empty() {
            return Err(ConfigError::MissingEnv("TELEGRAM_BOT_TOKEN"));
        }
        let chat_id = chat_id.into();
        if chat_id.is_empty() {
            return Err(ConfigError::MissingEnv("TELEGRAM_CHAT_ID"));
        }
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        let api_base = format!("{}/bot{}", api_base.into().trim_end_matches('/'), bot_token);
        Ok(Self {
            client,
            api_base,
            chat_id,
        })
    }

    async fn call(
        &self,
        method: &str,
        payload: JsonValue,
        timeout: Option<Duration>,
    ) -> Result<JsonValue, DeliveryError> {
        let url = format!("{}/{}", self.api_base, method);
        let mut request = self.client.post(&url).json(&payload);
        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }
        let response = request.send().await?;
        let status = response.status();
        let envelope: TelegramEnvelope = match response.json().await {
            Ok(envelope) => envelope,
            Err(err) if status.is_success() => return Err(DeliveryError::Request(err)),
            Err(_) => return Err(DeliveryError::Api(format!("http status {status}"))),
        };
        if !envelope.ok {
            return Err(DeliveryError::Api(
                envelope
                    .description
                    .unwrap_or_else(|| format!("http status {status}")),
            ));
        }
        Ok(envelope.result.unwrap_or(JsonValue::Null))
    }

    pub async fn bot_info(&self) -> Result<JsonValue, DeliveryError> {
        self.call("getMe", json!({}), Some(PROBE_TIMEOUT)).await
    }

    pub async fn chat_info(&self) -> Result<JsonValue, DeliveryError> {
        self.call("getChat", json!({ "chat_id": self.chat_id }), Some(PROBE_TIMEOUT))
            .await
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn send(&self, text: &str) -> Result<(), DeliveryError> {
        debug!(chars = text.chars().count(), "sending telegram message");
        self.call(
            "sendMessage",
            json!({
                "chat_id": self.chat_id,
                "text": text,
                "parse_mode": "Markdown",
                "disable_web_page_preview": true,
            }),
            None,
        )
        .await?;
        Ok(())
    }

    /// Probes the bot identity and the chat before posting the greeting.
    async fn test_connection(&self) -> Result<(), DeliveryError> {
        self.bot_info().await?;
        self.chat_info().await?;
        self.send(GREETING).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use super::*;

    fn announcement(serial_no: i64, recruiting: &str, receipt_end: &str) -> Announcement {
        Announcement {
            serial_no,
            title: format!("Program {serial_no}"),
            organizer: "KISED".into(),
            receipt_begin: "20260701".into(),
            receipt_end: receipt_end.into(),
            category: "Funding".into(),
            region: "National".into(),
            body: String::new(),
            detail_url: String::new(),
            online_receipt: None,
            business_years: String::new(),
            recruiting: recruiting.into(),
        }
    }

    #[test]
    fn filter_drops_closed_and_expired_records() {
        let records = vec![
            announcement(1, "Y", "20260901"),
            announcement(2, "N", "20260901"),
            announcement(3, "Y", "20260101"),
            announcement(4, "Y", "20260807"),
        ];
        let kept = filter_ongoing(records, "20260807");
        let serials: Vec<i64> = kept.iter().map(|a| a.serial_no).collect();
        assert_eq!(serials, vec![1, 4]);
    }

    #[test]
    fn filter_of_empty_input_is_empty() {
        assert!(filter_ongoing(Vec::new(), "20260807").is_empty());
    }

    struct FlakyNotifier {
        sent: Mutex<Vec<String>>,
        fail_on_call: usize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Notifier for FlakyNotifier {
        async fn send(&self, text: &str) -> Result<(), DeliveryError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call == self.fail_on_call {
                return Err(DeliveryError::Api("channel down".into()));
            }
            self.sent.lock().unwrap().push(text.to_string());
            Ok(())
        }
    }

    #[tokio::test]
    async fn send_all_aborts_on_first_failure() {
        let notifier = FlakyNotifier {
            sent: Mutex::new(Vec::new()),
            fail_on_call: 1,
            calls: AtomicUsize::new(0),
        };
        let texts = vec!["a".to_string(), "b".to_string(), "c".to_string()];

        let result = notifier.send_all(&texts, Duration::ZERO).await;

        assert!(matches!(result, Err(DeliveryError::Api(_))));
        assert_eq!(*notifier.sent.lock().unwrap(), vec!["a".to_string()]);
        // "c" was never attempted
        assert_eq!(notifier.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn send_all_delivers_everything_in_order() {
        let notifier = FlakyNotifier {
            sent: Mutex::new(Vec::new()),
            fail_on_call: usize::MAX,
            calls: AtomicUsize::new(0),
        };
        let texts = vec!["one".to_string(), "two".to_string()];

        notifier.send_all(&texts, Duration::ZERO).await.unwrap();

        assert_eq!(*notifier.sent.lock().unwrap(), texts);
    }

    #[test]
    fn empty_service_key_is_a_config_error() {
        let err = KstartupClient::new(DEFAULT_API_URL, "", Duration::from_secs(10)).unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnv("KSTARTUP_SERVICE_KEY")));
    }

    #[test]
    fn missing_telegram_credentials_are_config_errors() {
        let err = TelegramNotifier::new(DEFAULT_TELEGRAM_API_BASE, "", "chat", PROBE_TIMEOUT)
            .unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnv("TELEGRAM_BOT_TOKEN")));

        let err = TelegramNotifier::new(DEFAULT_TELEGRAM_API_BASE, "token", "", PROBE_TIMEOUT)
            .unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnv("TELEGRAM_CHAT_ID")));
    }
}
