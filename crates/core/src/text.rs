//! Pure text helpers used while folding backend history into the transcript.

use chrono::{DateTime, NaiveDateTime, Utc};
use palaver_client::HistoryEntry;
use palaver_storage::MessageRole;

/// Combines already stored text with a chunk the backend sent starting at character `offset`.
///
/// * `offset == 0` replaces the stored text; the backend resent the entry from scratch.
/// * `offset >= existing` character count appends.
/// * anything in between keeps the first `offset` characters and splices the chunk after them.
///
/// Offsets count characters, never bytes.
pub fn merge_range(existing: &str, chunk: &str, offset: usize) -> String {
    if offset == 0 {
        return chunk.to_string();
    }

    match existing.char_indices().nth(offset) {
        Some((split, _)) => format!("{}{chunk}", &existing[..split]),
        None => format!("{existing}{chunk}"),
    }
}

/// `"user"` and `"human"` are the user; every other role string is the agent.
pub fn normalize_role(role: &str) -> MessageRole {
    match role.trim().to_ascii_lowercase().as_str() {
        "user" | "human" => MessageRole::User,
        _ => MessageRole::Agent,
    }
}

/// Whether `entry` should display the "tool working" indicator.
///
/// Only the single following raw entry is consulted: the indicator shows for an empty tool
/// call that is last in the page or followed by another entry without text.
pub fn shows_tool_placeholder(entry: &HistoryEntry, next: Option<&HistoryEntry>) -> bool {
    entry.is_tool_call && !entry.has_text() && next.is_none_or(|next| !next.has_text())
}

/// Parses a backend `dateTime`. Missing or unparsable values yield the current time.
pub fn parse_timestamp(raw: Option<&str>) -> DateTime<Utc> {
    raw.map(str::trim)
        .filter(|raw| !raw.is_empty())
        .and_then(|raw| {
            DateTime::parse_from_rfc3339(raw)
                .map(|parsed| parsed.with_timezone(&Utc))
                .ok()
                .or_else(|| {
                    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
                        .ok()
                        .map(|naive| naive.and_utc())
                })
        })
        .unwrap_or_else(Utc::now)
}

/// Decodes HTML entities until the text stops changing, so double-encoded text comes out clean.
///
/// Supports `amp`, `lt`, `gt`, `quot`, `apos`, `nbsp` and decimal or hex numeric references.
/// Unknown or malformed references are kept verbatim.
pub fn decode_html_entities(value: &str) -> String {
    let mut current = value.to_string();
    while current.contains('&') {
        let next = decode_once(&current);
        if next == current {
            break;
        }
        current = next;
    }
    current
}

fn decode_once(input: &str) -> String {
    let mut output = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find('&') {
        output.push_str(&rest[..start]);
        let candidate = &rest[start + 1..];
        let decoded = candidate
            .find(';')
            .and_then(|end| decode_entity(&candidate[..end]).map(|ch| (end, ch)));

        match decoded {
            Some((end, ch)) => {
                output.push(ch);
                rest = &candidate[end + 1..];
            }
            None => {
                output.push('&');
                rest = candidate;
            }
        }
    }

    output.push_str(rest);
    output
}

fn decode_entity(entity: &str) -> Option<char> {
    let entity = entity.to_ascii_lowercase();
    match entity.as_str() {
        "amp" => Some('&'),
        "lt" => Some('<'),
        "gt" => Some('>'),
        "quot" => Some('"'),
        "apos" => Some('\''),
        "nbsp" => Some('\u{a0}'),
        _ => {
            let code = if let Some(hex) = entity.strip_prefix("#x") {
                if hex.is_empty() || !hex.chars().all(|ch| ch.is_ascii_hexdigit()) {
                    return None;
                }
                u32::from_str_radix(hex, 16).ok()?
            } else if let Some(decimal) = entity.strip_prefix('#') {
                if decimal.is_empty() || !decimal.chars().all(|ch| ch.is_ascii_digit()) {
                    return None;
                }
                decimal.parse::<u32>().ok()?
            } else {
                return None;
            };
            char::from_u32(code)
        }
    }
}
