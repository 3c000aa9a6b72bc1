use serde_json::Value;
use tracing::{debug, warn};

use super::{AgentEvent, Role, UsageStats};

/// Lines longer than this are dropped up to their newline
const MAX_LINE_BYTES: usize = 4 * 1024 * 1024;

/// Incremental decoder for the agent's newline-delimited JSON stream.
///
/// Bytes go in through [`StreamParser::push`] in whatever chunks the pipe
/// delivers; complete lines are decoded and normalized into [`AgentEvent`]s.
/// Once a completion record is seen the parser is finished and ignores all
/// further input, so at most one `Done` is ever produced.
#[derive(Debug, Default)]
pub struct StreamParser {
    pending: Vec<u8>,
    discarding: bool,
    usage: Option<UsageStats>,
    session_id: Option<String>,
    finished: bool,
}

impl StreamParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of stdout, returning the events of every completed line
    pub fn push(&mut self, chunk: &[u8]) -> Vec<AgentEvent> {
        let mut events = Vec::new();
        let mut rest = chunk;

        while !self.finished {
            match rest.iter().position(|&b| b == b'\n') {
                Some(pos) => {
                    let (head, tail) = rest.split_at(pos);
                    rest = &tail[1..];
                    if self.discarding {
                        self.discarding = false;
                        continue;
                    }
                    self.pending.extend_from_slice(head);
                    let line = std::mem::take(&mut self.pending);
                    self.handle_line(&line, &mut events);
                }
                None => {
                    if !self.discarding {
                        self.pending.extend_from_slice(rest);
                        if self.pending.len() > MAX_LINE_BYTES {
                            warn!(bytes = self.pending.len(), "Dropping oversized agent output line");
                            self.pending.clear();
                            self.discarding = true;
                        }
                    }
                    break;
                }
            }
        }

        events
    }

    /// Decode whatever unterminated line is left at end of stream
    pub fn finish(&mut self) -> Vec<AgentEvent> {
        let mut events = Vec::new();
        if !self.finished && !self.discarding && !self.pending.is_empty() {
            let line = std::mem::take(&mut self.pending);
            self.handle_line(&line, &mut events);
        }
        events
    }

    /// Synthesize the terminal event for a clean exit without a completion record
    pub fn complete(&mut self) -> AgentEvent {
        self.finished = true;
        AgentEvent::Done { usage: self.usage }
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    fn handle_line(&mut self, line: &[u8], events: &mut Vec<AgentEvent>) {
        let text = String::from_utf8_lossy(line);
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return;
        }
        match serde_json::from_str::<Value>(trimmed) {
            Ok(record) if record.is_object() => self.normalize(&record, events),
            Ok(_) | Err(_) => debug!(line = %trimmed, "Skipping non-JSON agent output"),
        }
    }

    fn normalize(&mut self, record: &Value, events: &mut Vec<AgentEvent>) {
        let kind = record.get("type").and_then(Value::as_str).unwrap_or("");

        if let Some(id) = str_field(record, &["session_id", "sessionId"]) {
            if self.session_id.as_deref() != Some(id) {
                self.session_id = Some(id.to_string());
                events.push(AgentEvent::Init {
                    session_id: id.to_string(),
                    model: str_field(record, &["model"]).map(String::from),
                });
            }
        }

        if let Some(usage) = parse_usage(record) {
            self.usage = Some(usage);
        }

        if let Some(thoughts) = record.get("thoughts") {
            events.extend(
                thought_texts(thoughts)
                    .into_iter()
                    .map(|content| AgentEvent::Thought { content }),
            );
        }

        match kind {
            "message" | "text" | "content" => {
                if let Some(content) = str_field(record, &["content", "text"]) {
                    if !content.is_empty() {
                        events.push(AgentEvent::Text {
                            content: content.to_string(),
                            role: parse_role(record),
                        });
                    }
                }
            }
            "thought" | "thinking" => {
                if let Some(content) = str_field(record, &["content", "text", "subject"]) {
                    events.push(AgentEvent::Thought {
                        content: content.to_string(),
                    });
                }
            }
            "tool_use" | "tool_call" | "toolCall" => {
                if let Some(call) = parse_tool_call(record) {
                    events.push(call);
                }
            }
            "tool_result" | "tool_response" | "toolResult" => {
                events.push(parse_tool_result(record));
            }
            "error" => events.push(AgentEvent::Error {
                message: error_message(record),
            }),
            "done" => self.finish_with(events),
            "result" => match record.get("status").and_then(Value::as_str) {
                None | Some("success") => self.finish_with(events),
                Some(_) => events.push(AgentEvent::Error {
                    message: error_message(record),
                }),
            },
            "init" => {}
            other => debug!(record_type = other, "Ignoring agent record"),
        }
    }

    fn finish_with(&mut self, events: &mut Vec<AgentEvent>) {
        self.finished = true;
        events.push(AgentEvent::Done { usage: self.usage });
    }
}

fn str_field<'a>(record: &'a Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter().find_map(|key| record.get(*key).and_then(Value::as_str))
}

fn u64_field(record: &Value, keys: &[&str]) -> Option<u64> {
    keys.iter().find_map(|key| record.get(*key).and_then(Value::as_u64))
}

fn parse_role(record: &Value) -> Option<Role> {
    match record.get("role").and_then(Value::as_str)? {
        "user" => Some(Role::User),
        "assistant" | "model" | "gemini" => Some(Role::Assistant),
        _ => None,
    }
}

fn parse_usage(record: &Value) -> Option<UsageStats> {
    let stats = ["stats", "tokens", "usage"]
        .iter()
        .find_map(|key| record.get(*key).filter(|v| v.is_object()))?;
    let input = u64_field(stats, &["input_tokens", "inputTokens", "input", "promptTokenCount"]);
    let output = u64_field(
        stats,
        &["output_tokens", "outputTokens", "output", "candidatesTokenCount"],
    );
    if input.is_none() && output.is_none() {
        return None;
    }
    Some(UsageStats {
        input_tokens: input.unwrap_or(0),
        output_tokens: output.unwrap_or(0),
        cached_tokens: u64_field(
            stats,
            &["cached", "cached_tokens", "cachedTokens", "cachedContentTokenCount"],
        )
        .unwrap_or(0),
    })
}

fn thought_texts(thoughts: &Value) -> Vec<String> {
    let render = |item: &Value| -> Option<String> {
        match item {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Object(_) => {
                let subject = str_field(item, &["subject"]);
                let body = str_field(item, &["description", "text", "content"]);
                match (subject, body) {
                    (Some(s), Some(b)) => Some(format!("{s}: {b}")),
                    (Some(t), None) | (None, Some(t)) => Some(t.to_string()),
                    (None, None) => None,
                }
            }
            _ => None,
        }
    };
    match thoughts {
        Value::Array(items) => items.iter().filter_map(render).collect(),
        other => render(other).into_iter().collect(),
    }
}

fn parse_tool_call(record: &Value) -> Option<AgentEvent> {
    let name = str_field(record, &["tool_name", "name", "tool", "function"])?;
    let id = str_field(record, &["tool_id", "id", "call_id", "callId"]).unwrap_or_default();
    let args = ["parameters", "args", "arguments", "input"]
        .iter()
        .find_map(|key| record.get(*key))
        .cloned()
        .unwrap_or(Value::Null);
    Some(AgentEvent::ToolCall {
        id: id.to_string(),
        name: name.to_string(),
        args,
    })
}

fn parse_tool_result(record: &Value) -> AgentEvent {
    let id = str_field(record, &["tool_id", "call_id", "tool_call_id", "callId", "id"])
        .unwrap_or_default()
        .to_string();
    let success = match record.get("status").and_then(Value::as_str) {
        Some(status) => status == "success",
        None => record.get("success").and_then(Value::as_bool).unwrap_or(true),
    };
    let output = ["output", "result", "content"]
        .iter()
        .find_map(|key| record.get(*key))
        .map(|value| match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
        .or_else(|| (!success).then(|| error_message(record)))
        .unwrap_or_default();
    AgentEvent::ToolResponse {
        id,
        output,
        success,
    }
}

fn error_message(record: &Value) -> String {
    str_field(record, &["message"])
        .or_else(|| record.get("error").and_then(|e| str_field(e, &["message"])))
        .or_else(|| record.get("error").and_then(Value::as_str))
        .unwrap_or("agent reported an error")
        .to_string()
}
