//! Content extraction from a conversation turn.
//!
//! Produces the searchable signals of a turn:
//!
//! | Field | Source |
//! |-------|--------|
//! | `user_query` | user texts, sentence-truncated to [`MAX_USER_QUERY_LEN`] |
//! | `ai_response_core` | assistant prose with code, system tags, tool markers, log and path lines removed, truncated to [`MAX_AI_RESPONSE_LEN`] |
//! | `tools_used` | every tool name, deduplicated |
//! | `files_modified` | base names of paths touched by write/edit tools |
//! | `code_languages`, `has_code` | fence languages and parsed code blocks |
//! | `vector_text` | labeled concatenation of the above, the only text embedded |
//!
//! Lengths are measured in bytes and cuts always land on char boundaries.

use regex::Regex;
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::LazyLock;

use crate::models::{ConversationTurn, Message};

pub const MAX_USER_QUERY_LEN: usize = 1000;
pub const MAX_AI_RESPONSE_LEN: usize = 2000;

/// Tools whose `path` argument names a file the assistant changed.
const FILE_MUTATING_TOOLS: &[&str] = &["Write", "StrReplace", "Edit", "MultiEdit"];

const SENTENCE_ENDS: &[char] = &['.', '!', '?', '。', '！', '？', '\n'];

static CODE_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```\w*.*?```").expect("valid regex"));
static FENCE_LANGUAGE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"```([a-zA-Z]+)").expect("valid regex"));
static SYSTEM_TAGS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?is)<think>.*?</think>",
        r"(?is)<context>.*?</context>",
        r"(?is)<git_status>.*?</git_status>",
        r"(?is)<system_reminder>.*?</system_reminder>",
        r"(?m)^\[Tool call\].*$",
        r"(?m)^\[Tool result\].*$",
        r"(?m)^\[Thinking\].*$",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("valid regex"))
    .collect()
});
static LOG_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^\d{4}[-/]\d{2}[-/]\d{2}[T ]\d{2}:\d{2}.*$").expect("valid regex")
});
static PATH_ONLY_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^[ \t]*(/[\w./\-]+|[A-Za-z]:\\[\w.\\\-]+)[ \t]*$").expect("valid regex")
});
static BLANK_RUN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\n{3,}").expect("valid regex"));

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractedContent {
    pub user_query: String,
    pub ai_response_core: String,
    pub tools_used: Vec<String>,
    pub files_modified: Vec<String>,
    pub code_languages: Vec<String>,
    pub has_code: bool,
    pub vector_text: String,
}

impl ExtractedContent {
    /// Nothing worth indexing.
    pub fn is_empty(&self) -> bool {
        self.user_query.is_empty() && self.ai_response_core.is_empty()
    }
}

pub fn extract_turn(turn: &ConversationTurn) -> ExtractedContent {
    let (tools_used, files_modified) = tool_info(&turn.ai_messages);
    let (code_languages, has_code) = code_info(&turn.ai_messages);

    let mut content = ExtractedContent {
        user_query: user_query(&turn.user_messages),
        ai_response_core: ai_core(&turn.ai_messages),
        tools_used,
        files_modified,
        code_languages,
        has_code,
        vector_text: String::new(),
    };
    content.vector_text = vector_text(&content);
    content
}

fn user_query(messages: &[Message]) -> String {
    let parts: Vec<&str> = messages
        .iter()
        .map(|m| m.text.trim())
        .filter(|t| !t.is_empty())
        .collect();
    truncate_at_sentence(&parts.join("\n"), MAX_USER_QUERY_LEN)
}

fn ai_core(messages: &[Message]) -> String {
    let parts: Vec<String> = messages
        .iter()
        .map(|m| {
            let text = remove_code_blocks(&m.text);
            let text = remove_system_tags(&text);
            filter_non_prose(&text).trim().to_string()
        })
        .filter(|t| !t.is_empty())
        .collect();
    truncate_at_sentence(&parts.join("\n"), MAX_AI_RESPONSE_LEN)
}

/// Delete fenced code blocks, fences included.
pub fn remove_code_blocks(text: &str) -> String {
    CODE_BLOCK.replace_all(text, "").into_owned()
}

fn remove_system_tags(text: &str) -> String {
    SYSTEM_TAGS
        .iter()
        .fold(text.to_string(), |acc, re| re.replace_all(&acc, "").into_owned())
}

/// Drop log lines and bare file-path lines, then squeeze blank runs.
fn filter_non_prose(text: &str) -> String {
    let text = LOG_LINE.replace_all(text, "");
    let text = PATH_ONLY_LINE.replace_all(&text, "");
    BLANK_RUN.replace_all(&text, "\n\n").into_owned()
}

fn tool_info(messages: &[Message]) -> (Vec<String>, Vec<String>) {
    let mut tools = BTreeSet::new();
    let mut files = BTreeSet::new();

    for call in messages.iter().flat_map(|m| &m.tool_calls) {
        if call.name.is_empty() {
            continue;
        }
        tools.insert(call.name.clone());

        if FILE_MUTATING_TOOLS.contains(&call.name.as_str()) {
            let name = call
                .arguments
                .get("path")
                .and_then(|p| Path::new(p).file_name())
                .and_then(|n| n.to_str());
            if let Some(name) = name {
                files.insert(name.to_string());
            }
        }
    }

    (tools.into_iter().collect(), files.into_iter().collect())
}

fn code_info(messages: &[Message]) -> (Vec<String>, bool) {
    let mut languages = BTreeSet::new();
    let mut has_code = false;

    for message in messages {
        for caps in FENCE_LANGUAGE.captures_iter(&message.text) {
            languages.insert(caps[1].to_string());
            has_code = true;
        }
        for block in &message.code_blocks {
            // "text" is the placeholder for unlabeled fences
            if !block.language.is_empty() && block.language != "text" {
                languages.insert(block.language.clone());
            }
            has_code = true;
        }
    }

    (languages.into_iter().collect(), has_code)
}

fn vector_text(content: &ExtractedContent) -> String {
    let mut parts = Vec::new();
    if !content.user_query.is_empty() {
        parts.push(format!("question: {}", content.user_query));
    }
    if !content.ai_response_core.is_empty() {
        parts.push(format!("answer: {}", content.ai_response_core));
    }
    if !content.tools_used.is_empty() {
        parts.push(format!("actions: {}", content.tools_used.join(", ")));
    }
    if !content.files_modified.is_empty() {
        parts.push(format!("files: {}", content.files_modified.join(", ")));
    }
    parts.join("\n\n")
}

fn floor_char_boundary(text: &str, index: usize) -> usize {
    if index >= text.len() {
        return text.len();
    }
    let mut i = index;
    while !text.is_char_boundary(i) {
        i -= 1;
    }
    i
}

/// Cut `text` to at most `max_len` bytes, preferring a sentence end past
/// the midpoint, then a word break (plus `...`), then a hard cut (plus `...`).
pub fn truncate_at_sentence(text: &str, max_len: usize) -> String {
    if text.len() <= max_len {
        return text.to_string();
    }

    let cut = floor_char_boundary(text, max_len);
    let truncated = &text[..cut];
    let half = max_len / 2;

    if let Some((idx, ch)) = truncated
        .char_indices()
        .rev()
        .find(|(_, c)| SENTENCE_ENDS.contains(c))
    {
        if idx > half {
            return truncated[..idx + ch.len_utf8()].to_string();
        }
    }

    if let Some((idx, _)) = truncated
        .char_indices()
        .rev()
        .find(|(_, c)| c.is_whitespace())
    {
        if idx > half {
            return format!("{}...", &truncated[..idx]);
        }
    }

    format!("{}...", truncated)
}
