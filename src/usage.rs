use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::record::ConversationRecord;
use crate::util::to_timestamp;

pub const PROVIDER_ID: &str = "google";
const UNKNOWN_MODEL: &str = "unknown";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    pub input: u64,
    pub output: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_read: Option<u64>,
}

/// Usage attributed to one assistant message of one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageRow {
    pub session_id: String,
    pub provider_id: String,
    pub model_id: String,
    pub tokens: TokenUsage,
    /// Epoch ms of the message.
    pub timestamp: i64,
    /// Epoch ms modification time of the session file.
    pub session_updated_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_path: Option<String>,
}

/// Zero counts are reported as absent.
pub(crate) fn non_zero(value: u64) -> Option<u64> {
    (value > 0).then_some(value)
}

/// One row per distinct token-bearing message id, in first-seen order.
/// A repeated id keeps its position but takes the later message's values.
pub fn extract_usage_rows(record: &ConversationRecord, modified_at_ms: i64) -> Vec<UsageRow> {
    let session_name = record.session_name().map(str::to_string);
    let project_path = record.project_path().map(str::to_string);
    let record_start = to_timestamp(record.start_time.as_deref(), modified_at_ms);

    let mut rows: Vec<UsageRow> = Vec::new();
    let mut positions: HashMap<&str, usize> = HashMap::new();

    for message in record.token_bearing_messages() {
        let row = UsageRow {
            session_id: record.session_id.clone(),
            provider_id: PROVIDER_ID.to_string(),
            model_id: message.model.unwrap_or(UNKNOWN_MODEL).to_string(),
            tokens: TokenUsage {
                input: message.tokens.input,
                output: message.tokens.output,
                cache_read: non_zero(message.tokens.cached),
            },
            timestamp: to_timestamp(message.timestamp, record_start),
            session_updated_at: modified_at_ms,
            session_name: session_name.clone(),
            project_path: project_path.clone(),
        };

        match positions.get(message.id) {
            Some(&index) => rows[index] = row,
            None => {
                positions.insert(message.id, rows.len());
                rows.push(row);
            }
        }
    }

    rows
}
