//! Final-result extraction from the execution log.
//!
//! After the container exits and all lines are persisted, the log blob is
//! re-read fresh and scanned from the last line backwards for a JSON object
//! of the shape the agent emits as its final record. Nothing in here may
//! affect the conversation's final status; failures are logged and
//! swallowed by the caller.

use std::sync::LazyLock;

use anyhow::Result;
use regex::Regex;
use sqlx::SqlitePool;
use tracing::{debug, warn};

use xsha_db::models::ConversationResult;
use xsha_db::queries::{execution_logs, results};

/// Log lines look like `[HH:MM:SS] STDOUT: {...}`; the optional prefixes
/// are stripped before JSON decoding.
static RESULT_LINE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:\[\d{2}:\d{2}:\d{2}\]\s*)?(?:\w+:\s*)?(\{.*\})\s*$")
        .expect("result line regex")
});

/// A validated final-result record.
#[derive(Debug, Clone, PartialEq)]
pub struct FinalResult {
    pub result_type: String,
    pub subtype: String,
    pub is_error: bool,
    pub session_id: String,
    /// The full decoded object, free-form fields included.
    pub payload: serde_json::Value,
}

/// Scan a log blob for the agent's final result record.
///
/// Lines are visited last-to-first since the record sits near the end of
/// the stream. A candidate line must decode as a JSON object with
/// `type == "result"`, a `subtype`, a boolean `is_error`, and a non-empty
/// string `session_id`; anything else is skipped.
pub fn scan_final_result(log_text: &str) -> Option<FinalResult> {
    for line in log_text.lines().rev() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let candidate = match RESULT_LINE_RE.captures(line) {
            Some(captures) => captures.get(1).map(|m| m.as_str()).unwrap_or(line),
            None if line.starts_with('{') && line.ends_with('}') => line,
            None => continue,
        };

        let Ok(value) = serde_json::from_str::<serde_json::Value>(candidate) else {
            continue;
        };
        let Some(object) = value.as_object() else {
            continue;
        };

        if object.get("type").and_then(|v| v.as_str()) != Some("result") {
            continue;
        }
        let Some(subtype) = object.get("subtype").and_then(|v| v.as_str()) else {
            continue;
        };
        let Some(is_error) = object.get("is_error").and_then(|v| v.as_bool()) else {
            continue;
        };
        let session_id = match object.get("session_id").and_then(|v| v.as_str()) {
            Some(session_id) if !session_id.is_empty() => session_id,
            _ => continue,
        };

        return Some(FinalResult {
            result_type: "result".to_string(),
            subtype: subtype.to_string(),
            is_error,
            session_id: session_id.to_string(),
            payload: value.clone(),
        });
    }

    None
}

/// Re-read the conversation's execution log and persist its final result
/// record, at most once per conversation.
///
/// Returns `Ok(None)` when there is no log, no parseable record, or a
/// result row already exists.
pub async fn persist_final_result(
    pool: &SqlitePool,
    conversation_id: i64,
) -> Result<Option<ConversationResult>> {
    // The caller's in-memory copy lacks lines appended by the pipe readers;
    // always re-read from storage.
    let Some(log) = execution_logs::get_by_conversation(pool, conversation_id).await? else {
        debug!(conversation_id, "no execution log to scan for a result");
        return Ok(None);
    };

    let Some(parsed) = scan_final_result(&log.logs) else {
        debug!(conversation_id, "no final result record in execution log");
        return Ok(None);
    };

    if results::exists_by_conversation(pool, conversation_id).await? {
        warn!(
            conversation_id,
            "conversation result already exists, skipping insert"
        );
        return Ok(None);
    }

    let row = results::insert_result(
        pool,
        &results::NewConversationResult {
            conversation_id,
            result_type: parsed.result_type,
            subtype: parsed.subtype,
            is_error: parsed.is_error,
            session_id: parsed.session_id,
            payload: parsed.payload,
        },
    )
    .await?;

    Ok(Some(row))
}
