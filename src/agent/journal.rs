//! Newline-delimited-JSON trace journal (spec.md §4.6 "Tracing", §6
//! "Journal file format").
//!
//! Every LLM request/response and tool request/response is written as
//! one JSON object per line, `{timestamp, action, payload}`; a tool call
//! is correlated across its request and response events by a shared
//! UUID. Writes are serialized behind a `Mutex` so concurrent writers
//! (should the agent ever grow internal fan-out) never interleave a
//! partial line — matching spec.md §5's "journal recorder is
//! thread-safe (each write is atomic)".

use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

use serde_json::json;

/// The four event kinds spec.md §6 enumerates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JournalAction {
    ToolRequest,
    ToolResponse,
    LlmRequest,
    LlmResponse,
}

impl JournalAction {
    fn as_str(self) -> &'static str {
        match self {
            JournalAction::ToolRequest => "tool-request",
            JournalAction::ToolResponse => "tool-response",
            JournalAction::LlmRequest => "llm-request",
            JournalAction::LlmResponse => "llm-response",
        }
    }
}

pub struct Journal {
    writer: Mutex<Box<dyn Write + Send>>,
}

impl Journal {
    /// Opens (creating if needed) the NDJSON file at `path`, appending.
    pub fn open(path: &Path) -> std::io::Result<Self> {
        let file = std::fs::OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: Mutex::new(Box::new(file)),
        })
    }

    /// A journal that discards every event — used when no `trace-path`
    /// is configured and tracing is not required.
    pub fn discard() -> Self {
        Self {
            writer: Mutex::new(Box::new(std::io::sink())),
        }
    }

    fn record(&self, action: JournalAction, payload: serde_json::Value) {
        let event = json!({
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "action": action.as_str(),
            "payload": payload,
        });
        let line = match serde_json::to_string(&event) {
            Ok(line) => line,
            Err(_) => return,
        };
        if let Ok(mut writer) = self.writer.lock() {
            let _ = writeln!(writer, "{line}");
        }
    }

    pub fn llm_request(&self, payload: serde_json::Value) {
        self.record(JournalAction::LlmRequest, payload);
    }

    pub fn llm_response(&self, payload: serde_json::Value) {
        self.record(JournalAction::LlmResponse, payload);
    }

    /// `correlation_id` must equal the one passed to the matching
    /// [`Journal::tool_response`] call (spec.md §4.6: "Each tool call is
    /// correlated by a generated UUID appearing on both the request and
    /// the response event").
    pub fn tool_request(&self, correlation_id: &str, payload: serde_json::Value) {
        self.record(JournalAction::ToolRequest, json!({"id": correlation_id, "call": payload}));
    }

    pub fn tool_response(&self, correlation_id: &str, payload: serde_json::Value) {
        self.record(JournalAction::ToolResponse, json!({"id": correlation_id, "result": payload}));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discard_journal_never_panics() {
        let journal = Journal::discard();
        journal.llm_request(json!({"history_len": 1}));
        journal.tool_request("abc", json!({"name": "kubectl"}));
        journal.tool_response("abc", json!({"exit_code": 0}));
    }

    #[test]
    fn open_journal_writes_ndjson_lines() {
        let dir = std::env::temp_dir().join(format!("kagent-journal-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("trace.ndjson");

        let journal = Journal::open(&path).unwrap();
        journal.llm_request(json!({"history_len": 1}));
        journal.tool_request("corr-1", json!({"name": "kubectl"}));
        journal.tool_response("corr-1", json!({"exit_code": 0}));

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 3);
        for line in &lines {
            let value: serde_json::Value = serde_json::from_str(line).unwrap();
            assert!(value.get("timestamp").is_some());
            assert!(value.get("action").is_some());
            assert!(value.get("payload").is_some());
        }
        let request: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        let response: serde_json::Value = serde_json::from_str(lines[2]).unwrap();
        assert_eq!(request["payload"]["id"], response["payload"]["id"]);

        let _ = std::fs::remove_dir_all(&dir);
    }
}
