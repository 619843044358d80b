//! Content reference extraction from page URLs and titles

use url::Url;

use crate::types::ContentId;

/// Title used when the page reports none.
pub const DEFAULT_TITLE: &str = "YouTube Video";

const PATH_PREFIXES: &[&str] = &["shorts", "embed", "live"];

/// Extract the content id from a page URL.
///
/// Recognized forms:
/// - any URL with a non-empty `v` query parameter (`/watch?v=ID`)
/// - `youtu.be/ID`
/// - `/shorts/ID`, `/embed/ID`, `/live/ID` on YouTube hosts
pub fn content_id_from_url(raw: &str) -> Option<ContentId> {
    let url = Url::parse(raw.trim()).ok()?;

    if let Some((_, v)) = url.query_pairs().find(|(k, _)| k == "v") {
        if !v.is_empty() {
            return Some(ContentId::new(v.into_owned()));
        }
    }

    let host = url.host_str()?.to_ascii_lowercase();
    let mut segments = url.path_segments()?.filter(|s| !s.is_empty());

    if host == "youtu.be" || host.ends_with(".youtu.be") {
        return segments.next().map(ContentId::from);
    }

    if host == "youtube.com" || host.ends_with(".youtube.com") {
        let first = segments.next()?;
        if PATH_PREFIXES.contains(&first) {
            return segments.next().map(ContentId::from);
        }
    }

    None
}

/// Clean up a tab title for display.
///
/// Drops the unread-notification counter prefix (`"(3) "`) and the
/// `" - YouTube"` suffix.
pub fn normalize_title(raw: &str) -> String {
    let mut title = raw.trim();

    if title.starts_with('(') {
        if let Some(end) = title.find(") ") {
            if title[1..end].chars().all(|c| c.is_ascii_digit()) {
                title = title[end + 2..].trim_start();
            }
        }
    }

    if let Some(stripped) = title.strip_suffix(" - YouTube") {
        title = stripped.trim_end();
    }

    if title.is_empty() || title == "YouTube" {
        DEFAULT_TITLE.to_string()
    } else {
        title.to_string()
    }
}
