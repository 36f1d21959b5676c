//! Pair a message stream into conversation turns.
//!
//! Consecutive messages from the same side merge into one side of a turn.
//! A user message arriving after assistant output closes the current turn.
//! Trailing user messages with no reply form a final incomplete turn, which
//! keeps its index once the reply shows up in a later parse.

use crate::models::{ConversationTurn, Message, Role, ToolCall};

pub fn pair_messages(messages: &[Message]) -> Vec<ConversationTurn> {
    let mut turns = Vec::new();
    let mut user_side: Vec<Message> = Vec::new();
    let mut ai_side: Vec<Message> = Vec::new();

    for message in messages {
        match message.role {
            Role::User => {
                if !ai_side.is_empty() {
                    let index = turns.len();
                    turns.push(build_turn(
                        index,
                        std::mem::take(&mut user_side),
                        std::mem::take(&mut ai_side),
                    ));
                }
                user_side.push(message.clone());
            }
            Role::Assistant => ai_side.push(message.clone()),
        }
    }

    if !user_side.is_empty() || !ai_side.is_empty() {
        let index = turns.len();
        turns.push(build_turn(index, user_side, ai_side));
    }

    turns
}

fn build_turn(
    turn_index: usize,
    user_messages: Vec<Message>,
    ai_messages: Vec<Message>,
) -> ConversationTurn {
    let user_text = join_texts(&user_messages);
    let ai_text = join_texts(&ai_messages);

    let mut combined = Vec::new();
    if !user_text.is_empty() {
        combined.push(format!("User: {}", user_text));
    }
    if !ai_text.is_empty() {
        combined.push(format!("AI: {}", ai_text));
    }

    let tools: Vec<ToolCall> = ai_messages
        .iter()
        .flat_map(|m| m.tool_calls.iter().cloned())
        .collect();

    let timestamp = user_messages
        .first()
        .or_else(|| ai_messages.first())
        .map(|m| m.timestamp)
        .unwrap_or(0);

    ConversationTurn {
        turn_index,
        is_incomplete: ai_messages.is_empty(),
        user_messages,
        ai_messages,
        user_text,
        ai_text,
        combined_text: combined.join("\n\n"),
        tools,
        timestamp,
    }
}

fn join_texts(messages: &[Message]) -> String {
    messages
        .iter()
        .map(|m| m.text.trim())
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join("\n\n")
}
