//! The check-and-notify pipeline: fetch, filter, diff, notify, persist,
//! prune, with partial failures aggregated into a structured outcome.

mod message;
mod scheduler;

pub use scheduler::{BusinessHours, Scheduler, SchedulerStatus};

use std::collections::HashSet;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use ksa_adapters::{
    filter_ongoing, AnnouncementSource, ConfigError, DeliveryError, KstartupClient, Notifier,
    TelegramNotifier, UpstreamError, DEFAULT_API_URL, DEFAULT_TELEGRAM_API_BASE,
};
use ksa_core::{kst_now, today_ymd, Announcement, RunOutcome, StoreStats, StoredAnnouncement};
use ksa_storage::{FileBackend, HybridStore, PgBackend, SnapshotStore};
use serde::Serialize;
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "ksa-pipeline";

pub const DEFAULT_DATABASE_URL: &str = "postgres://localhost:5432/ksa";
pub const DEFAULT_DATA_FILE_PATH: &str = "./data/previous_announcements.json";

/// Environment-driven construction parameters, read once at startup.
/// Missing credentials fail here rather than degrading later.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub api_url: String,
    pub service_key: String,
    pub bot_token: String,
    pub chat_id: String,
    pub database_url: String,
    pub data_file_path: PathBuf,
    pub http_timeout: Duration,
    pub web_port: u16,
    pub scheduler_enabled: bool,
    pub check_cron: String,
    pub window: BusinessHours,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            api_url: env_or("KSTARTUP_API_URL", DEFAULT_API_URL),
            service_key: required_env("KSTARTUP_SERVICE_KEY")?,
            bot_token: required_env("TELEGRAM_BOT_TOKEN")?,
            chat_id: required_env("TELEGRAM_CHAT_ID")?,
            database_url: env_or("DATABASE_URL", DEFAULT_DATABASE_URL),
            data_file_path: PathBuf::from(env_or("DATA_FILE_PATH", DEFAULT_DATA_FILE_PATH)),
            http_timeout: Duration::from_secs(env_parse("KSA_HTTP_TIMEOUT_SECS", 10)),
            web_port: env_parse("KSA_WEB_PORT", 8000),
            scheduler_enabled: env_flag("KSA_SCHEDULER_ENABLED", true),
            check_cron: env_or("KSA_CHECK_CRON", scheduler::HOURLY_CRON),
            window: BusinessHours {
                start_hour: env_parse("KSA_WINDOW_START_HOUR", 9),
                end_hour: env_parse("KSA_WINDOW_END_HOUR", 18),
            },
        })
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn required_env(key: &'static str) -> Result<String, ConfigError> {
    match std::env::var(key) {
        Ok(value) if !value.is_empty() => Ok(value),
        _ => Err(ConfigError::MissingEnv(key)),
    }
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

fn env_flag(key: &str, default: bool) -> bool {
    std::env::var(key)
        .map(|value| matches!(value.as_str(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(default)
}

/// Tuning knobs for one pipeline instance. The delays are rate-limit
/// courtesy toward the two external services, not correctness
/// requirements; tests zero them.
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub page_size: u32,
    pub max_pages: u32,
    pub detail_message_cap: usize,
    pub keep_days: u64,
    pub page_delay: Duration,
    pub notify_delay: Duration,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            page_size: 100,
            max_pages: 3,
            detail_message_cap: 5,
            keep_days: 30,
            page_delay: Duration::from_millis(500),
            notify_delay: Duration::from_secs(3),
        }
    }
}

/// A current announcement is new iff its serial is absent from the previous
/// snapshot. A serial that dropped out of the snapshot and reappears counts
/// as new again; notification is at-least-once.
pub fn new_announcements(
    current: &[Announcement],
    previous: &[StoredAnnouncement],
) -> Vec<Announcement> {
    let seen: HashSet<i64> = previous.iter().map(|row| row.serial_no).collect();
    current
        .iter()
        .filter(|a| !seen.contains(&a.serial_no))
        .cloned()
        .collect()
}

/// Result of a snapshot-seeding run.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitOutcome {
    pub total_processed: usize,
    pub ongoing_announcements: usize,
    pub unique_announcements: usize,
    pub pages_processed: u32,
    pub max_pages: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProbeResult {
    pub success: bool,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionReport {
    pub source: ProbeResult,
    pub notifier: ProbeResult,
    pub storage: ProbeResult,
    pub stats: StoreStats,
}

/// Orchestrates runs against injected collaborators; constructed once and
/// shared. Runs are issued serially by the caller; the snapshot
/// replacement is not safe under concurrent writers.
pub struct Pipeline {
    source: Arc<dyn AnnouncementSource>,
    notifier: Arc<dyn Notifier>,
    store: Arc<dyn SnapshotStore>,
    options: PipelineOptions,
}

impl Pipeline {
    pub fn new(
        source: Arc<dyn AnnouncementSource>,
        notifier: Arc<dyn Notifier>,
        store: Arc<dyn SnapshotStore>,
        options: PipelineOptions,
    ) -> Self {
        Self {
            source,
            notifier,
            store,
            options,
        }
    }

    /// Builds the production pipeline: K-Startup client, Telegram notifier,
    /// Postgres-plus-file hybrid store.
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        let source = KstartupClient::new(&config.api_url, &config.service_key, config.http_timeout)
            .context("building announcement api client")?;
        let notifier = TelegramNotifier::new(
            DEFAULT_TELEGRAM_API_BASE,
            &config.bot_token,
            &config.chat_id,
            config.http_timeout,
        )
        .context("building telegram notifier")?;
        let primary = PgBackend::connect_lazy(&config.database_url)
            .context("preparing postgres snapshot backend")?;
        let fallback = FileBackend::new(&config.data_file_path);
        let store = HybridStore::new(Box::new(primary), Box::new(fallback));
        Ok(Self::new(
            Arc::new(source),
            Arc::new(notifier),
            Arc::new(store),
            PipelineOptions::default(),
        ))
    }

    pub fn with_options(mut self, options: PipelineOptions) -> Self {
        self.options = options;
        self
    }

    /// One full check. Always returns a structured outcome; a fetch failure
    /// short-circuits with zero counts.
    pub async fn check_and_notify(&self) -> RunOutcome {
        info!("announcement check started");
        let fetched = match self.fetch_pages(self.options.max_pages).await {
            Ok(fetched) => fetched,
            Err(err) => {
                warn!(error = %err, "announcement check aborted during fetch");
                return RunOutcome::failed(format!("announcement fetch failed: {err}"));
            }
        };
        let total = fetched.len();

        let today = today_ymd();
        let ongoing = filter_ongoing(fetched, &today);
        info!(total, ongoing = ongoing.len(), "announcements filtered");

        let previous = self.store.load().await;
        let new = new_announcements(&ongoing, &previous);
        info!(
            previous = previous.len(),
            new = new.len(),
            "diff against snapshot complete"
        );

        let mut errors = Vec::new();

        if new.is_empty() {
            info!("no new announcements, skipping notification");
        } else if let Err(err) = self.notify_new(&new).await {
            warn!(error = %err, "notification delivery failed");
            errors.push(format!("notification delivery failed: {err}"));
        }

        // persistence still happens after a failed delivery so the next
        // diff runs against the latest ongoing set
        if let Err(err) = self.store.save(&ongoing).await {
            warn!(error = %err, "snapshot save failed");
            errors.push(format!("snapshot save failed: {err}"));
        }

        // prune is cleanup; the store logs its own failures
        self.store.prune(self.options.keep_days).await;

        let message = if errors.is_empty() {
            format!("check completed, {} new announcement(s)", new.len())
        } else {
            format!("check completed with {} error(s)", errors.len())
        };
        info!(%message, "announcement check finished");
        RunOutcome {
            success: errors.is_empty(),
            message,
            total_announcements: total,
            ongoing_announcements: ongoing.len(),
            new_announcements: new.len(),
            errors,
        }
    }

    /// Seeds the snapshot without notifying: fetches up to `max_pages`
    /// pages, keeps the ongoing announcements, dedups by serial, saves.
    pub async fn initialize(&self, max_pages: u32) -> Result<InitOutcome> {
        let today = today_ymd();
        let mut ongoing = Vec::new();
        let mut total_processed = 0usize;
        let mut pages_processed = 0u32;

        let mut page = 1;
        while page <= max_pages {
            let batch = self
                .source
                .fetch_page(self.options.page_size, page)
                .await
                .context("fetching announcement page")?;
            if batch.announcements.is_empty() {
                break;
            }
            let count = batch.announcements.len();
            total_processed += count;
            pages_processed = page;
            ongoing.extend(filter_ongoing(batch.announcements, &today));
            if count < self.options.page_size as usize {
                break;
            }
            page += 1;
            if page <= max_pages {
                tokio::time::sleep(self.options.page_delay).await;
            }
        }

        let ongoing_count = ongoing.len();
        let mut seen = HashSet::new();
        let unique: Vec<Announcement> = ongoing
            .into_iter()
            .filter(|a| seen.insert(a.serial_no))
            .collect();
        info!(
            total_processed,
            ongoing = ongoing_count,
            unique = unique.len(),
            "initialization fetch complete"
        );

        self.store
            .save(&unique)
            .await
            .context("saving initial snapshot")?;

        Ok(InitOutcome {
            total_processed,
            ongoing_announcements: ongoing_count,
            unique_announcements: unique.len(),
            pages_processed,
            max_pages,
        })
    }

    /// Sends the currently open announcements (up to `limit`) without
    /// touching the snapshot.
    pub async fn send_current(&self, limit: u32) -> RunOutcome {
        match self.run_send_current(limit).await {
            Ok(outcome) => outcome,
            Err(err) => RunOutcome::failed(format!("sending current announcements failed: {err}")),
        }
    }

    /// Probes each collaborator independently; never fails as a whole.
    pub async fn test_connections(&self) -> ConnectionReport {
        let source = match self.source.fetch_page(1, 1).await {
            Ok(page) => ProbeResult {
                success: true,
                message: format!("connected, {} announcement(s) listed", page.total_count),
            },
            Err(err) => ProbeResult {
                success: false,
                message: format!("announcement api unreachable: {err}"),
            },
        };
        let notifier = match self.notifier.test_connection().await {
            Ok(()) => ProbeResult {
                success: true,
                message: "telegram channel reachable".into(),
            },
            Err(err) => ProbeResult {
                success: false,
                message: format!("telegram channel unreachable: {err}"),
            },
        };
        let stats = self.store.stats().await;
        let storage = ProbeResult {
            success: true,
            message: format!("{} announcement(s) in snapshot", stats.total_count),
        };
        ConnectionReport {
            source,
            notifier,
            storage,
            stats,
        }
    }

    async fn run_send_current(&self, limit: u32) -> Result<RunOutcome> {
        let batch = self.source.fetch_page(limit, 1).await?;
        let total = batch.announcements.len();
        let ongoing = filter_ongoing(batch.announcements, &today_ymd());

        if ongoing.is_empty() {
            self.notifier.send(message::NO_ONGOING).await?;
            return Ok(RunOutcome {
                success: true,
                message: "no announcements currently open".into(),
                total_announcements: total,
                ongoing_announcements: 0,
                new_announcements: 0,
                errors: Vec::new(),
            });
        }

        self.notifier
            .send(&message::current_header(ongoing.len()))
            .await?;
        let details: Vec<String> = ongoing.iter().map(message::announcement_detail).collect();
        self.notifier
            .send_all(&details, self.options.notify_delay)
            .await?;

        Ok(RunOutcome {
            success: true,
            message: format!("sent {} open announcement(s)", ongoing.len()),
            total_announcements: total,
            ongoing_announcements: ongoing.len(),
            new_announcements: 0,
            errors: Vec::new(),
        })
    }

    /// Pages are fetched in increasing order; an empty or undersized page
    /// means the listing is exhausted.
    async fn fetch_pages(&self, max_pages: u32) -> Result<Vec<Announcement>, UpstreamError> {
        let page_size = self.options.page_size;
        let mut all = Vec::new();
        let mut page = 1;
        while page <= max_pages {
            let batch = self.source.fetch_page(page_size, page).await?;
            if batch.announcements.is_empty() {
                break;
            }
            let count = batch.announcements.len();
            debug!(page, count, "announcement page received");
            all.extend(batch.announcements);
            if count < page_size as usize {
                break;
            }
            page += 1;
            if page <= max_pages {
                tokio::time::sleep(self.options.page_delay).await;
            }
        }
        Ok(all)
    }

    /// Summary first, then capped details, then the overflow pointer.
    async fn notify_new(&self, new: &[Announcement]) -> Result<(), DeliveryError> {
        self.notifier
            .send(&message::summary(new.len(), kst_now()))
            .await?;

        let details: Vec<String> = new
            .iter()
            .take(self.options.detail_message_cap)
            .map(message::announcement_detail)
            .collect();
        self.notifier
            .send_all(&details, self.options.notify_delay)
            .await?;

        if new.len() > self.options.detail_message_cap {
            let remaining = new.len() - self.options.detail_message_cap;
            self.notifier.send(&message::overflow(remaining)).await?;
        }
        Ok(())
    }
}
