// src/format.rs
//! Telegram-flavoured HTML message for one article.

use serde::Serialize;

pub const DEFAULT_EXCERPT_CHARS: usize = 1200;
pub const DEFAULT_BUTTON_LABEL: &str = "Read full article";

/// Built fresh for every delivery attempt; never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FormattedMessage {
    pub text: String,
    pub link: String,
}

/// The single "read full article" action attached to a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReadMoreButton {
    pub label: String,
    pub url: String,
}

/// Cut to at most `max_chars` characters, appending "..." when cut.
pub fn excerpt(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max_chars).collect();
    out.truncate(out.trim_end().len());
    out.push_str("...");
    out
}

/// `{label}\n\n<b>{title}</b>\n\n{excerpt}`; title and excerpt are HTML-escaped
/// after truncation so no entity is ever cut in half.
pub fn format_message(
    category_label: &str,
    title: &str,
    body: &str,
    link: &str,
    excerpt_chars: usize,
) -> FormattedMessage {
    let title = html_escape::encode_text(title.trim());
    let short = excerpt(body.trim(), excerpt_chars);
    let short = html_escape::encode_text(&short);

    let mut text = String::with_capacity(category_label.len() + title.len() + short.len() + 16);
    text.push_str(&html_escape::encode_text(category_label.trim()));
    text.push_str("\n\n<b>");
    text.push_str(&title);
    text.push_str("</b>");
    if !short.is_empty() {
        text.push_str("\n\n");
        text.push_str(&short);
    }

    FormattedMessage {
        text,
        link: link.to_string(),
    }
}

impl FormattedMessage {
    pub fn button(&self, label: &str) -> Option<ReadMoreButton> {
        if self.link.trim().is_empty() {
            return None;
        }
        Some(ReadMoreButton {
            label: label.to_string(),
            url: self.link.clone(),
        })
    }
}
