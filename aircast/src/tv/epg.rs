//! EPG generation and XMLTV export.

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::TvScheduleEntry;

/// One EPG row: a projection of a schedule entry for a channel.
#[derive(Debug, Clone, Serialize)]
pub struct EpgEntry {
    pub channel_id: String,
    pub channel_name: String,
    pub program_id: String,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

/// Project the schedule entries of one channel into EPG rows for the
/// window `[now, now + hours_ahead)`. Entries already running at `now` are
/// included.
pub fn project_channel(
    channel_id: &str,
    channel_name: &str,
    schedule: &[TvScheduleEntry],
    now: DateTime<Utc>,
    hours_ahead: u32,
) -> Vec<EpgEntry> {
    let horizon = now + chrono::Duration::hours(hours_ahead as i64);
    schedule
        .iter()
        .filter(|e| e.end_time() > now && e.start_time < horizon)
        .map(|e| EpgEntry {
            channel_id: channel_id.to_string(),
            channel_name: channel_name.to_string(),
            program_id: e.program.id.clone(),
            title: e.program.title.clone(),
            description: e.program.description.clone(),
            start_time: e.start_time,
            end_time: e.end_time(),
        })
        .collect()
}

/// Render EPG entries as an XMLTV document.
pub fn export_xmltv(entries: &[EpgEntry]) -> String {
    let mut out = String::new();
    out.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
    out.push_str("<tv generator-info-name=\"aircast\">\n");

    let mut seen_channels: Vec<&str> = Vec::new();
    for entry in entries {
        if !seen_channels.contains(&entry.channel_id.as_str()) {
            seen_channels.push(&entry.channel_id);
            out.push_str(&format!(
                "  <channel id=\"{}\">\n    <display-name>{}</display-name>\n  </channel>\n",
                xml_escape(&entry.channel_id),
                xml_escape(&entry.channel_name)
            ));
        }
    }

    for entry in entries {
        out.push_str(&format!(
            "  <programme start=\"{}\" stop=\"{}\" channel=\"{}\">\n",
            xmltv_time(entry.start_time),
            xmltv_time(entry.end_time),
            xml_escape(&entry.channel_id)
        ));
        out.push_str(&format!("    <title>{}</title>\n", xml_escape(&entry.title)));
        if let Some(desc) = &entry.description {
            out.push_str(&format!("    <desc>{}</desc>\n", xml_escape(desc)));
        }
        out.push_str("  </programme>\n");
    }
    out.push_str("</tv>\n");
    out
}

fn xmltv_time(t: DateTime<Utc>) -> String {
    t.format("%Y%m%d%H%M%S +0000").to_string()
}

fn xml_escape(raw: &str) -> String {
    raw.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}
