//! Post-processing of the model's final answer text.

use devassist_core::context::LinkIndex;
use regex::{Captures, Regex};
use std::sync::OnceLock;

/// The sentinel fence some answers arrive wrapped in.
pub const ANSWER_FENCE: &str = "`````";

static LINK_REGEX: OnceLock<Regex> = OnceLock::new();

/// Markdown links (`[text](dest)`) or bare http(s) URLs.
fn link_regex() -> &'static Regex {
    LINK_REGEX.get_or_init(|| {
        Regex::new(r"\[([^\]\n]*)\]\(([^)\s]+)\)|(https?://[^\s<>()\[\]]+)")
            .expect("Failed to compile link regex")
    })
}

/// Turns raw answer text into what is shown and stored.
#[derive(Debug, Clone, Default)]
pub struct ResponseParser {
    links: LinkIndex,
}

impl ResponseParser {
    pub fn new(links: LinkIndex) -> Self {
        Self { links }
    }

    pub fn parse(&self, text: &str) -> String {
        let stripped = strip_fence(text);
        if self.links.is_empty() {
            return stripped.to_string();
        }
        self.rewrite_links(stripped)
    }

    /// Rewrite links to known entities into `[text](#eventKey)`.
    fn rewrite_links(&self, text: &str) -> String {
        link_regex()
            .replace_all(text, |caps: &Captures| {
                let whole = caps.get(0).map_or("", |m| m.as_str());

                if let (Some(label), Some(dest)) = (caps.get(1), caps.get(2)) {
                    if dest.as_str().starts_with('#') {
                        return whole.to_string();
                    }
                    return match self.links.get(dest.as_str()) {
                        Some(key) => format!("[{}](#{key})", label.as_str()),
                        None => whole.to_string(),
                    };
                }

                let Some(url) = caps.get(3) else {
                    return whole.to_string();
                };
                // part of a malformed markdown link
                if text[..url.start()].ends_with("](") {
                    return whole.to_string();
                }
                let bare = url.as_str().trim_end_matches(['.', ',', ';', ':', '!', '?', '\'', '"']);
                let trailing = &url.as_str()[bare.len()..];
                match self.links.get(bare) {
                    Some(key) => format!("[{bare}](#{key}){trailing}"),
                    None => whole.to_string(),
                }
            })
            .into_owned()
    }
}

/// Strip the outer answer fence if it wraps the whole trimmed text.
pub fn strip_fence(text: &str) -> &str {
    let trimmed = text.trim();
    if trimmed.len() < 2 * ANSWER_FENCE.len()
        || !trimmed.starts_with(ANSWER_FENCE)
        || !trimmed.ends_with(ANSWER_FENCE)
    {
        return trimmed;
    }
    let inner = &trimmed[ANSWER_FENCE.len()..trimmed.len() - ANSWER_FENCE.len()];
    let inner = inner
        .strip_prefix("\r\n")
        .or_else(|| inner.strip_prefix('\n'))
        .unwrap_or(inner);
    inner
        .strip_suffix("\r\n")
        .or_else(|| inner.strip_suffix('\n'))
        .unwrap_or(inner)
}
