//! Thread clustering - groups a conversation's messages into display threads
//!
//! A new thread starts when the silence between two messages exceeds the
//! configured gap, or when a message's category differs from the previous
//! message's. Messages without a topic signal fall in the `general` category.
//! Topic detection is a keyword heuristic and only meant as a display aid.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::events::{Message, SenderRole};

pub const DEFAULT_CATEGORY: &str = "general";
pub const FALLBACK_TITLE: &str = "General conversation";

const TOPIC_KEYWORDS: &[(&str, &[&str])] = &[
    (
        "billing",
        &["invoice", "invoices", "payment", "paid", "refund", "billing", "price", "quote"],
    ),
    (
        "scheduling",
        &["appointment", "meeting", "schedule", "reschedule", "calendar", "demo"],
    ),
    (
        "support",
        &["bug", "error", "broken", "crash", "issue", "problem"],
    ),
];

/// Clustering parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThreadConfig {
    /// Silence after which a new thread starts
    pub gap_minutes: i64,
    /// Titles longer than this are cut and suffixed with an ellipsis
    pub title_max_chars: usize,
}

impl Default for ThreadConfig {
    fn default() -> Self {
        Self {
            gap_minutes: 120,
            title_max_chars: 60,
        }
    }
}

impl ThreadConfig {
    /// Saturates instead of overflowing for huge `gap_minutes`
    pub fn gap(&self) -> Duration {
        Duration::try_minutes(self.gap_minutes).unwrap_or(Duration::MAX)
    }
}

/// Contiguous run of messages shown as one thread
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Thread {
    pub id: String,
    pub conversation_id: String,
    pub title: String,
    pub category: String,
    pub messages: Vec<Message>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub unread_count: usize,
}

/// Topic signal of a message: a leading `[Tag]` marker wins over keywords
pub fn derive_category(content: &str) -> Option<String> {
    let trimmed = content.trim_start();
    if let Some(rest) = trimmed.strip_prefix('[') {
        if let Some(end) = rest.find(']') {
            let tag = rest[..end].trim();
            if !tag.is_empty() {
                return Some(tag.to_lowercase());
            }
        }
    }

    let lower = content.to_lowercase();
    let words: Vec<&str> = lower
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect();
    TOPIC_KEYWORDS
        .iter()
        .find(|(_, keywords)| keywords.iter().any(|k| words.contains(k)))
        .map(|(category, _)| category.to_string())
}

/// Split a message list into threads, most recent thread first.
///
/// The input does not need to be sorted; the same set of messages always
/// produces the same threads.
pub fn cluster_threads(
    conversation_id: &str,
    messages: &[Message],
    config: &ThreadConfig,
) -> Vec<Thread> {
    let mut sorted: Vec<&Message> = messages.iter().collect();
    sorted.sort_by(|a, b| {
        a.created_at
            .cmp(&b.created_at)
            .then_with(|| a.id.cmp(&b.id))
    });

    let gap = config.gap();
    let mut threads = Vec::new();
    let mut run: Vec<Message> = Vec::new();
    let mut run_category = DEFAULT_CATEGORY.to_string();

    for message in sorted {
        let category =
            derive_category(&message.content).unwrap_or_else(|| DEFAULT_CATEGORY.to_string());
        if let Some(last) = run.last() {
            let silent = message.created_at - last.created_at > gap;
            if silent || category != run_category {
                let finished = std::mem::take(&mut run);
                threads.push(build_thread(conversation_id, finished, run_category, config));
            }
        }
        run_category = category;
        run.push(message.clone());
    }
    if !run.is_empty() {
        threads.push(build_thread(conversation_id, run, run_category, config));
    }

    threads.reverse();
    threads
}

fn build_thread(
    conversation_id: &str,
    messages: Vec<Message>,
    category: String,
    config: &ThreadConfig,
) -> Thread {
    // Callers never pass an empty run.
    let start_time = messages[0].created_at;
    let end_time = messages[messages.len() - 1].created_at;
    let title = messages
        .iter()
        .filter(|m| m.sender_role == SenderRole::External)
        .map(|m| m.content.split_whitespace().collect::<Vec<_>>().join(" "))
        .find(|text| !text.is_empty())
        .map(|text| truncate_title(&text, config.title_max_chars))
        .unwrap_or_else(|| FALLBACK_TITLE.to_string());

    Thread {
        id: format!("{}:{}", conversation_id, messages[0].id),
        conversation_id: conversation_id.to_string(),
        title,
        category,
        unread_count: messages.iter().filter(|m| m.is_unread()).count(),
        start_time,
        end_time,
        messages,
    }
}

fn truncate_title(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut title: String = text.chars().take(max_chars).collect();
    title.truncate(title.trim_end().len());
    title.push('…');
    title
}
