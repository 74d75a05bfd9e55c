//! Telegram message bodies. Telegram Markdown; link previews are disabled
//! by the notifier.

use chrono::{DateTime, FixedOffset};
use ksa_core::{format_ymd, Announcement};

pub(crate) const NO_ONGOING: &str = "📭 No announcements are currently open.";

const WEBSITE_URL: &str = "https://www.k-startup.go.kr";

pub(crate) fn summary(count: usize, checked_at: DateTime<FixedOffset>) -> String {
    format!(
        "🚨 *New K-Startup announcements*\n\n📢 *{count}* new announcement(s) registered!\n\n⏰ Checked at: {}",
        checked_at.format("%Y-%m-%d %H:%M:%S %:z")
    )
}

pub(crate) fn current_header(count: usize) -> String {
    format!("📋 *{count} K-Startup announcement(s) currently open*")
}

pub(crate) fn overflow(remaining: usize) -> String {
    format!(
        "📋 {remaining} more new announcement(s) are waiting.\nSee the website: {WEBSITE_URL}"
    )
}

pub(crate) fn announcement_detail(announcement: &Announcement) -> String {
    let mut lines = vec![
        "🆕 *New K-Startup announcement*".to_string(),
        String::new(),
        format!("📋 *Title*: {}", announcement.title),
        format!("🏢 *Organizer*: {}", announcement.organizer),
        format!(
            "📅 *Receipt window*: {} ~ {}",
            format_ymd(&announcement.receipt_begin),
            format_ymd(&announcement.receipt_end)
        ),
        format!("🏷️ *Category*: {}", announcement.category),
        format!("🌍 *Region*: {}", announcement.region),
        format!("👥 *Business years*: {}", announcement.business_years),
        String::new(),
        format!("📝 {}", announcement.body),
        String::new(),
        format!("🔗 {}", announcement.detail_url),
    ];
    if let Some(online) = &announcement.online_receipt {
        lines.push(format!("📝 *Online application*: {online}"));
    }
    lines.join("\n")
}
