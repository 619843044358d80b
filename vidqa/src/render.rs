//! Plain-text rendering of the projected view

use vidqa_core::format::format_offset;
use vidqa_core::{Message, MigrationOutcome, ViewState};

pub fn view(view: &ViewState) -> String {
    let mut out = String::new();

    match (&view.active_session_id, &view.title) {
        (Some(id), Some(title)) => out.push_str(&format!("== {} [{}] ==\n", title, id)),
        (None, Some(title)) => out.push_str(&format!("== {} (no video) ==\n", title)),
        _ => out.push_str("== no page ==\n"),
    }

    if let Some(banner) = &view.banner {
        out.push_str(&format!("! {}\n", banner.message()));
    }

    for message in &view.conversation {
        out.push_str(&self::message(message));
        out.push('\n');
    }

    if view.loading {
        out.push_str("... waiting for answer\n");
    }
    out
}

fn message(message: &Message) -> String {
    match message {
        Message::User { text, .. } => format!("you> {}", text),
        Message::Assistant {
            text,
            citation_offsets,
            ..
        } => {
            if citation_offsets.is_empty() {
                format!("bot> {}", text)
            } else {
                let chips: Vec<String> = citation_offsets.iter().map(|s| format_offset(*s)).collect();
                format!("bot> {}  [{}]", text, chips.join(" "))
            }
        }
    }
}

pub fn migration(outcome: &MigrationOutcome) -> String {
    match outcome {
        MigrationOutcome::Migrated {
            content_id,
            messages,
        } => format!("Migrated {} message(s) into session {}", messages, content_id),
        MigrationOutcome::AlreadyMigrated => "Sessions already exist; nothing migrated".to_string(),
        MigrationOutcome::NothingToMigrate => "No legacy conversation found".to_string(),
        MigrationOutcome::NoContent => "URL has no video; legacy conversation kept".to_string(),
    }
}
