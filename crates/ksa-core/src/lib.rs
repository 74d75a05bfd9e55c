//! Core domain model for the K-Startup announcement alert service.

use chrono::{DateTime, Days, FixedOffset, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "ksa-core";

/// One announcement as returned by the K-Startup listing API.
///
/// Field names map the upstream wire names via serde renames. A value is
/// never mutated after fetch; each poll cycle produces a fresh set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Announcement {
    /// Stable per-announcement sequence number; the diff key.
    #[serde(rename = "pbanc_sn")]
    pub serial_no: i64,
    #[serde(rename = "biz_pbanc_nm")]
    pub title: String,
    #[serde(rename = "pbanc_ntrp_nm", default)]
    pub organizer: String,
    /// Receipt window bounds, fixed-width `YYYYMMDD`.
    #[serde(rename = "pbanc_rcpt_bgng_dt", default)]
    pub receipt_begin: String,
    #[serde(rename = "pbanc_rcpt_end_dt", default)]
    pub receipt_end: String,
    #[serde(rename = "supt_biz_clsfc", default)]
    pub category: String,
    #[serde(rename = "supt_regin", default)]
    pub region: String,
    #[serde(rename = "pbanc_ctnt", default)]
    pub body: String,
    #[serde(rename = "detl_pg_url", default)]
    pub detail_url: String,
    #[serde(rename = "aply_mthd_onli_rcpt_istc", default)]
    pub online_receipt: Option<String>,
    #[serde(rename = "biz_enyy", default)]
    pub business_years: String,
    /// `"Y"` while recruitment is ongoing.
    #[serde(rename = "rcrt_prgs_yn", default)]
    pub recruiting: String,
}

impl Announcement {
    /// Whether recruitment is still open as of `as_of` (`YYYYMMDD`).
    ///
    /// Lexicographic comparison is valid because the date format is
    /// fixed-width and zero-padded.
    pub fn is_open_as_of(&self, as_of: &str) -> bool {
        self.recruiting == "Y" && self.receipt_end.as_str() >= as_of
    }
}

/// Durable projection of an [`Announcement`]. `serial_no` is the only field
/// used for diffing; the rest is carried for display and audit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredAnnouncement {
    pub serial_no: i64,
    pub title: String,
    pub receipt_begin: String,
    pub receipt_end: String,
    pub stored_at: DateTime<Utc>,
}

impl StoredAnnouncement {
    pub fn project(announcement: &Announcement, stored_at: DateTime<Utc>) -> Self {
        Self {
            serial_no: announcement.serial_no,
            title: announcement.title.clone(),
            receipt_begin: announcement.receipt_begin.clone(),
            receipt_end: announcement.receipt_end.clone(),
            stored_at,
        }
    }
}

/// Structured result of one pipeline run. Created fresh per invocation and
/// returned to the caller; never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunOutcome {
    pub success: bool,
    pub message: String,
    pub total_announcements: usize,
    pub ongoing_announcements: usize,
    pub new_announcements: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

impl RunOutcome {
    /// A run that aborted before producing any counts.
    pub fn failed(message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            success: false,
            errors: vec![message.clone()],
            message,
            total_announcements: 0,
            ongoing_announcements: 0,
            new_announcements: 0,
        }
    }
}

/// Aggregate statistics over the persisted snapshot.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StoreStats {
    pub total_count: usize,
    pub oldest_stored_at: Option<DateTime<Utc>>,
    pub newest_stored_at: Option<DateTime<Utc>>,
}

/// Korea Standard Time, the service's reference clock for "today" and the
/// scheduling window.
pub fn kst() -> FixedOffset {
    FixedOffset::east_opt(9 * 3600).expect("UTC+9 is a valid offset")
}

pub fn kst_now() -> DateTime<FixedOffset> {
    Utc::now().with_timezone(&kst())
}

/// Today's date in KST as fixed-width `YYYYMMDD`.
pub fn today_ymd() -> String {
    kst_now().format("%Y%m%d").to_string()
}

/// The `YYYYMMDD` date `days` days before today (KST).
pub fn cutoff_ymd(days: u64) -> String {
    let date = kst_now().date_naive() - Days::new(days);
    date.format("%Y%m%d").to_string()
}

/// Renders `20260807` as `2026-08-07`; anything that is not an 8-character
/// ASCII string passes through unchanged.
pub fn format_ymd(date: &str) -> String {
    if date.len() != 8 || !date.is_ascii() {
        return date.to_string();
    }
    format!("{}-{}-{}", &date[..4], &date[4..6], &date[6..8])
}
