//! Transcript parser.
//!
//! Agent transcripts are line-oriented text:
//!
//! ```text
//! user:
//! <user_query>
//! Fix the bug in the parser
//! </user_query>
//! assistant:
//! <think>internal reasoning</think>
//! I fixed it.
//! [Tool call] StrReplace
//!   path: src/parser.rs
//!   old_string: foo
//! [Tool result] StrReplace
//! ok
//! ```
//!
//! Parsing is a single pass over the lines. [`step`] is a pure transition
//! `(State, line) -> (State, Vec<Emission>)`; [`TranscriptParser`] applies
//! the emissions to the message under construction.

use regex::Regex;
use std::collections::BTreeMap;
use std::mem;
use std::sync::LazyLock;

use crate::models::{CodeBlock, Message, Role, ToolCall};

const TOOL_CALL: &str = "[Tool call]";
const TOOL_RESULT: &str = "[Tool result]";

/// Milliseconds between synthesized message timestamps.
const MESSAGE_SPACING_MS: i64 = 1000;

/// What the scanner is currently consuming.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mode {
    /// Ordinary message text.
    Text,
    /// Argument lines of a `[Tool call]` block.
    ToolCall(ToolCallBuilder),
    /// Output of a `[Tool result]` block, discarded.
    ToolResult,
    /// Inside a multi-line `<user_query>`, holding the content so far.
    UserQuery(String),
    /// Inside a multi-line `<think>`, discarded.
    Think,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct State {
    pub role: Option<Role>,
    pub mode: Mode,
}

impl Default for State {
    fn default() -> Self {
        Self {
            role: None,
            mode: Mode::Text,
        }
    }
}

/// Effects produced by a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Emission {
    /// Flush the current message and start a new one with this role.
    StartMessage(Role),
    /// Append text to the current message.
    Text(String),
    /// Attach a completed tool call to the current message.
    Tool(ToolCall),
}

/// Accumulates `key: value` / `key=value` argument lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCallBuilder {
    name: String,
    args: BTreeMap<String, String>,
    current_key: Option<String>,
    current_value: String,
}

impl ToolCallBuilder {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            args: BTreeMap::new(),
            current_key: None,
            current_value: String::new(),
        }
    }

    fn save_current(&mut self) {
        if let Some(key) = self.current_key.take() {
            let value = mem::take(&mut self.current_value);
            self.args.insert(key, value.trim().to_string());
        }
    }

    fn push_line(&mut self, line: &str) {
        let trimmed = line.trim();
        let top_level = !line.starts_with(' ') && !line.starts_with('\t');

        if top_level && trimmed.contains(':') {
            self.save_current();
            if let Some((key, value)) = trimmed.split_once(':') {
                self.current_key = Some(key.trim().to_string());
                self.current_value.push_str(value.trim());
            }
        } else if self.current_key.is_some() {
            if !self.current_value.is_empty() {
                self.current_value.push(' ');
            }
            self.current_value.push_str(trimmed);
        } else if let Some((key, value)) = trimmed.split_once('=') {
            let key = key.trim();
            if !key.is_empty() {
                self.args.insert(key.to_string(), value.trim().to_string());
            }
        }
    }

    fn finish(mut self) -> ToolCall {
        self.save_current();
        ToolCall {
            name: self.name,
            arguments: self.args,
        }
    }
}

fn role_marker(line: &str) -> Option<Role> {
    match line {
        "user:" => Some(Role::User),
        "assistant:" => Some(Role::Assistant),
        _ => None,
    }
}

/// Lines that end a tool block. They are then handled as ordinary lines.
fn is_terminator(line: &str) -> bool {
    line.is_empty()
        || line.starts_with(TOOL_CALL)
        || line.starts_with(TOOL_RESULT)
        || role_marker(line).is_some()
}

/// ASCII case-insensitive substring search returning a byte offset into `haystack`.
fn find_tag(haystack: &str, tag: &str) -> Option<usize> {
    haystack.to_ascii_lowercase().find(tag)
}

/// Advance the parser by one line.
pub fn step(state: State, line: &str) -> (State, Vec<Emission>) {
    let State { role, mode } = state;
    match mode {
        Mode::Text => text_step(role, line),
        Mode::ToolCall(mut builder) => {
            if is_terminator(line) {
                let (next, mut emissions) = text_step(role, line);
                emissions.insert(0, Emission::Tool(builder.finish()));
                (next, emissions)
            } else {
                builder.push_line(line);
                (
                    State {
                        role,
                        mode: Mode::ToolCall(builder),
                    },
                    Vec::new(),
                )
            }
        }
        Mode::ToolResult => {
            if is_terminator(line) {
                text_step(role, line)
            } else {
                (
                    State {
                        role,
                        mode: Mode::ToolResult,
                    },
                    Vec::new(),
                )
            }
        }
        Mode::UserQuery(mut content) => match find_tag(line, "</user_query>") {
            Some(end) => {
                content.push('\n');
                content.push_str(&line[..end]);
                let inner = content.trim();
                let emissions = if inner.is_empty() {
                    Vec::new()
                } else {
                    vec![Emission::Text(inner.to_string())]
                };
                (
                    State {
                        role,
                        mode: Mode::Text,
                    },
                    emissions,
                )
            }
            None => {
                content.push('\n');
                content.push_str(line);
                (
                    State {
                        role,
                        mode: Mode::UserQuery(content),
                    },
                    Vec::new(),
                )
            }
        },
        Mode::Think => {
            let mode = if find_tag(line, "</think>").is_some() {
                Mode::Text
            } else {
                Mode::Think
            };
            (State { role, mode }, Vec::new())
        }
    }
}

fn text_step(role: Option<Role>, line: &str) -> (State, Vec<Emission>) {
    let stay = |role| State {
        role,
        mode: Mode::Text,
    };

    if let Some(new_role) = role_marker(line) {
        return (stay(Some(new_role)), vec![Emission::StartMessage(new_role)]);
    }

    if line.starts_with(TOOL_CALL) && role == Some(Role::Assistant) {
        let name = line[TOOL_CALL.len()..].trim();
        if name.is_empty() {
            return (stay(role), Vec::new());
        }
        return (
            State {
                role,
                mode: Mode::ToolCall(ToolCallBuilder::new(name)),
            },
            Vec::new(),
        );
    }

    if line.starts_with(TOOL_RESULT) {
        return (
            State {
                role,
                mode: Mode::ToolResult,
            },
            Vec::new(),
        );
    }

    if let Some(open) = find_tag(line, "<user_query>") {
        let rest = &line[open + "<user_query>".len()..];
        return match find_tag(rest, "</user_query>") {
            Some(close) => {
                let inner = rest[..close].trim();
                let emissions = if inner.is_empty() {
                    Vec::new()
                } else {
                    vec![Emission::Text(inner.to_string())]
                };
                (stay(role), emissions)
            }
            None => (
                State {
                    role,
                    mode: Mode::UserQuery(rest.to_string()),
                },
                Vec::new(),
            ),
        };
    }

    if let Some(open) = find_tag(line, "<think>") {
        let rest = &line[open + "<think>".len()..];
        if find_tag(rest, "</think>").is_some() {
            return (stay(role), Vec::new());
        }
        return (
            State {
                role,
                mode: Mode::Think,
            },
            Vec::new(),
        );
    }

    (stay(role), vec![Emission::Text(line.to_string())])
}

/// Effects still pending when input ends.
pub fn finish(state: State) -> Vec<Emission> {
    match state.mode {
        Mode::ToolCall(builder) => vec![Emission::Tool(builder.finish())],
        Mode::UserQuery(content) => {
            let inner = content.trim();
            if inner.is_empty() {
                Vec::new()
            } else {
                vec![Emission::Text(inner.to_string())]
            }
        }
        Mode::Text | Mode::ToolResult | Mode::Think => Vec::new(),
    }
}

// ============ Message assembly ============

/// Incremental transcript parser.
///
/// Feed lines with [`TranscriptParser::feed`] and collect messages with
/// [`TranscriptParser::finish`].
pub struct TranscriptParser {
    state: State,
    base_timestamp: i64,
    message_index: i64,
    current_role: Option<Role>,
    text: String,
    tools: Vec<ToolCall>,
    messages: Vec<Message>,
}

impl TranscriptParser {
    pub fn new(base_timestamp: i64) -> Self {
        Self {
            state: State::default(),
            base_timestamp,
            message_index: 0,
            current_role: None,
            text: String::new(),
            tools: Vec::new(),
            messages: Vec::new(),
        }
    }

    pub fn feed(&mut self, line: &str) {
        let line = line.strip_suffix('\r').unwrap_or(line);
        let state = mem::take(&mut self.state);
        let (next, emissions) = step(state, line);
        self.state = next;
        for emission in emissions {
            self.apply(emission);
        }
    }

    pub fn finish(mut self) -> Vec<Message> {
        let state = mem::take(&mut self.state);
        for emission in finish(state) {
            self.apply(emission);
        }
        self.save_current();
        self.messages
    }

    fn apply(&mut self, emission: Emission) {
        match emission {
            Emission::StartMessage(role) => {
                self.save_current();
                self.current_role = Some(role);
                self.text.clear();
                self.tools.clear();
            }
            Emission::Text(text) => {
                if self.current_role.is_none() {
                    return;
                }
                if !self.text.is_empty() {
                    self.text.push('\n');
                }
                self.text.push_str(&text);
            }
            Emission::Tool(call) => self.tools.push(call),
        }
    }

    fn save_current(&mut self) {
        let Some(role) = self.current_role else {
            return;
        };

        let text = filter_message_text(&self.text);
        if text.is_empty() {
            return;
        }

        let timestamp = self.base_timestamp + self.message_index * MESSAGE_SPACING_MS;
        let mut message = Message {
            role,
            text,
            timestamp,
            tool_calls: Vec::new(),
            code_blocks: Vec::new(),
        };
        if role == Role::Assistant {
            message.code_blocks = extract_code_blocks(&message.text);
            message.tool_calls = mem::take(&mut self.tools);
        }

        self.messages.push(message);
        self.message_index += 1;
        self.tools.clear();
    }
}

/// Parse a whole transcript into messages.
pub fn parse_transcript(content: &str, base_timestamp: i64) -> Vec<Message> {
    let mut parser = TranscriptParser::new(base_timestamp);
    for line in content.split('\n') {
        parser.feed(line);
    }
    parser.finish()
}

// ============ Text cleanup ============

static THINK_SPAN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<think>.*?</think>").expect("valid regex"));
static USER_QUERY_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)</?user_query>").expect("valid regex"));

/// Drop leftover reasoning spans and query tags, collapse long blank runs, trim.
pub fn filter_message_text(text: &str) -> String {
    let text = THINK_SPAN.replace_all(text, "");
    let text = USER_QUERY_TAG.replace_all(&text, "");

    let mut kept = Vec::new();
    let mut blank_run = 0;
    for line in text.split('\n') {
        if line.trim().is_empty() {
            blank_run += 1;
            if blank_run <= 2 {
                kept.push(line);
            }
        } else {
            blank_run = 0;
            kept.push(line);
        }
    }
    kept.join("\n").trim().to_string()
}

/// Collect fenced code blocks. Unlabeled fences get language `text`; an
/// unclosed fence still yields what it contains.
pub fn extract_code_blocks(text: &str) -> Vec<CodeBlock> {
    let mut blocks = Vec::new();
    let mut language: Option<String> = None;
    let mut code: Vec<&str> = Vec::new();

    for line in text.split('\n') {
        if let Some(rest) = line.strip_prefix("```") {
            match language.take() {
                Some(lang) => {
                    if !code.is_empty() {
                        blocks.push(CodeBlock {
                            language: lang,
                            code: code.join("\n"),
                        });
                    }
                    code.clear();
                }
                None => {
                    let lang = rest.trim();
                    language = Some(if lang.is_empty() {
                        "text".to_string()
                    } else {
                        lang.to_string()
                    });
                }
            }
        } else if language.is_some() {
            code.push(line);
        }
    }

    if let Some(lang) = language {
        if !code.is_empty() {
            blocks.push(CodeBlock {
                language: lang,
                code: code.join("\n"),
            });
        }
    }

    blocks
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text_state(role: Option<Role>) -> State {
        State {
            role,
            mode: Mode::Text,
        }
    }

    #[test]
    fn role_marker_starts_message() {
        let (next, out) = step(State::default(), "assistant:");
        assert_eq!(next.role, Some(Role::Assistant));
        assert_eq!(out, vec![Emission::StartMessage(Role::Assistant)]);
    }

    #[test]
    fn tool_call_ignored_outside_assistant() {
        let (next, out) = step(text_state(Some(Role::User)), "[Tool call] Write");
        assert_eq!(next.mode, Mode::Text);
        assert_eq!(out, vec![Emission::Text("[Tool call] Write".into())]);
    }

    #[test]
    fn tool_call_with_empty_name_is_skipped() {
        let (next, out) = step(text_state(Some(Role::Assistant)), "[Tool call]   ");
        assert_eq!(next.mode, Mode::Text);
        assert!(out.is_empty());
    }

    #[test]
    fn blank_line_terminates_tool_block() {
        let (state, _) = step(text_state(Some(Role::Assistant)), "[Tool call] Write");
        let (state, _) = step(state, "path: /tmp/a.rs");
        let (state, _) = step(state, "contents: fn main()");
        let (state, _) = step(state, "  {}");
        let (state, out) = step(state, "");
        assert_eq!(state.mode, Mode::Text);
        let Emission::Tool(call) = &out[0] else {
            panic!("expected tool emission, got {:?}", out);
        };
        assert_eq!(call.name, "Write");
        assert_eq!(call.arguments["path"], "/tmp/a.rs");
        assert_eq!(call.arguments["contents"], "fn main() {}");
    }

    #[test]
    fn equals_arguments_accepted() {
        let (state, _) = step(text_state(Some(Role::Assistant)), "[Tool call] Grep");
        let (state, _) = step(state, "  pattern=foo");
        let out = finish(state);
        let Emission::Tool(call) = &out[0] else {
            panic!("expected tool emission");
        };
        assert_eq!(call.arguments["pattern"], "foo");
    }

    #[test]
    fn role_marker_terminates_tool_result_and_switches() {
        let (state, _) = step(text_state(Some(Role::Assistant)), "[Tool result] Write");
        let (state, out) = step(state, "some output");
        assert!(out.is_empty());
        let (state, out) = step(state, "user:");
        assert_eq!(state.role, Some(Role::User));
        assert_eq!(out, vec![Emission::StartMessage(Role::User)]);
    }

    #[test]
    fn user_query_same_line_and_multi_line() {
        let (_, out) = step(text_state(Some(Role::User)), "<user_query> hi </user_query>");
        assert_eq!(out, vec![Emission::Text("hi".into())]);

        let (state, out) = step(text_state(Some(Role::User)), "<USER_QUERY>");
        assert!(out.is_empty());
        let (state, _) = step(state, "line one");
        let (state, out) = step(state, "line two</user_query>");
        assert_eq!(state.mode, Mode::Text);
        assert_eq!(out, vec![Emission::Text("line one\nline two".into())]);
    }

    #[test]
    fn think_blocks_are_skipped() {
        let (state, out) = step(text_state(Some(Role::Assistant)), "<Think>");
        assert!(out.is_empty());
        let (state, out) = step(state, "secret");
        assert!(out.is_empty());
        let (state, _) = step(state, "</think>");
        assert_eq!(state.mode, Mode::Text);

        let (state, out) = step(state, "<think>inline</think>");
        assert_eq!(state.mode, Mode::Text);
        assert!(out.is_empty());
    }

    #[test]
    fn parses_full_transcript() {
        let content = "user:\n<user_query>\nFix the bug\n</user_query>\nassistant:\n<think>\nhmm\n</think>\nI fixed it.\n```go\nfunc X(){}\n```\n[Tool call] StrReplace\npath: src/main.go\nold: a\n\n[Tool result] StrReplace\nok\n\nDone.";
        let messages = parse_transcript(content, 1_000);
        assert_eq!(messages.len(), 2);

        assert_eq!(messages[0].role, Role::User);
        assert_eq!(messages[0].text, "Fix the bug");
        assert_eq!(messages[0].timestamp, 1_000);

        let ai = &messages[1];
        assert_eq!(ai.role, Role::Assistant);
        assert_eq!(ai.timestamp, 2_000);
        assert!(ai.text.starts_with("I fixed it."));
        assert!(ai.text.ends_with("Done."));
        assert!(!ai.text.contains("hmm"));
        assert!(!ai.text.contains("ok"));
        assert_eq!(ai.code_blocks.len(), 1);
        assert_eq!(ai.code_blocks[0].language, "go");
        assert_eq!(ai.tool_calls.len(), 1);
        assert_eq!(ai.tool_calls[0].arguments["path"], "src/main.go");
    }

    #[test]
    fn text_before_any_role_is_dropped() {
        let messages = parse_transcript("preamble\nuser:\nhello", 0);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].text, "hello");
    }

    #[test]
    fn empty_messages_do_not_advance_index() {
        let messages = parse_transcript("user:\n\nassistant:\nanswer", 0);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].role, Role::Assistant);
        assert_eq!(messages[0].timestamp, 0);
    }

    #[test]
    fn crlf_lines_are_recognized() {
        let messages = parse_transcript("user:\r\nhi\r\nassistant:\r\nhello\r\n", 0);
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].text, "hello");
    }

    #[test]
    fn code_block_extraction_handles_unlabeled_and_unclosed() {
        let blocks = extract_code_blocks("```\nplain\n```\ntext\n```rust\nfn a() {}");
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].language, "text");
        assert_eq!(blocks[1].language, "rust");
        assert_eq!(blocks[1].code, "fn a() {}");
    }

    #[test]
    fn filter_collapses_blank_runs() {
        assert_eq!(filter_message_text("a\n\n\n\n\nb"), "a\n\n\nb");
        assert_eq!(filter_message_text("<user_query>q</user_query>"), "q");
    }
}
