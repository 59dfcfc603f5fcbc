use std::fs;
use std::io;
use std::path::Path;

use serde::{Deserialize, Deserializer};
use serde_json::{Number, Value};
use thiserror::Error;
use tracing::trace;

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("failed to read session file: {0}")]
    Io(#[from] io::Error),
    #[error("invalid session JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("session record has no sessionId")]
    MissingSessionId,
}

/// One `session-*.json` document.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationRecord {
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub project_hash: Option<String>,
    #[serde(default)]
    pub start_time: Option<String>,
    #[serde(default)]
    pub last_updated: Option<String>,
    #[serde(default, deserialize_with = "lenient_messages")]
    pub messages: Vec<Message>,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub directories: Option<Vec<String>>,
}

impl ConversationRecord {
    pub fn session_name(&self) -> Option<&str> {
        self.summary
            .as_deref()
            .map(str::trim)
            .filter(|summary| !summary.is_empty())
    }

    /// First listed workspace directory, if it is non-blank.
    pub fn project_path(&self) -> Option<&str> {
        self.directories
            .as_ref()?
            .first()
            .map(|dir| dir.trim())
            .filter(|dir| !dir.is_empty())
    }

    pub fn token_bearing_messages(&self) -> impl Iterator<Item = TokenBearing<'_>> {
        self.messages.iter().filter_map(Message::token_bearing)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Message {
    Gemini(AssistantMessage),
    User,
    Info,
    Error,
    Warning,
    /// Entry that could not be decoded; kept so one bad message never discards the record.
    #[serde(skip)]
    Malformed,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AssistantMessage {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default, deserialize_with = "lenient_tokens")]
    pub tokens: Option<TokensSummary>,
}

/// Token counts of one assistant turn. Any JSON number is accepted; negative
/// values count as zero and fractions are truncated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct TokensSummary {
    #[serde(deserialize_with = "token_count")]
    pub input: u64,
    #[serde(deserialize_with = "token_count")]
    pub output: u64,
    #[serde(deserialize_with = "token_count")]
    pub cached: u64,
    #[serde(deserialize_with = "token_count")]
    pub total: u64,
    #[serde(default, deserialize_with = "optional_token_count")]
    pub thoughts: Option<u64>,
    #[serde(default, deserialize_with = "optional_token_count")]
    pub tool: Option<u64>,
}

/// An assistant message that carries a usable token summary.
#[derive(Debug, Clone, Copy)]
pub struct TokenBearing<'a> {
    pub id: &'a str,
    pub timestamp: Option<&'a str>,
    pub model: Option<&'a str>,
    pub tokens: TokensSummary,
}

impl Message {
    pub fn token_bearing(&self) -> Option<TokenBearing<'_>> {
        let Message::Gemini(message) = self else {
            return None;
        };
        let id = message.id.as_deref().filter(|id| !id.is_empty())?;
        let tokens = message.tokens.filter(|tokens| tokens.input > 0)?;
        Some(TokenBearing {
            id,
            timestamp: message.timestamp.as_deref(),
            model: message.model.as_deref(),
            tokens,
        })
    }
}

fn lenient_messages<'de, D>(deserializer: D) -> Result<Vec<Message>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<Vec<Value>>::deserialize(deserializer)?.unwrap_or_default();
    Ok(raw
        .into_iter()
        .map(|value| serde_json::from_value(value).unwrap_or(Message::Malformed))
        .collect())
}

fn lenient_tokens<'de, D>(deserializer: D) -> Result<Option<TokensSummary>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<Value>::deserialize(deserializer)?;
    Ok(raw.and_then(|value| serde_json::from_value(value).ok()))
}

fn count_from_number(number: &Number) -> u64 {
    number.as_u64().unwrap_or_else(|| {
        number
            .as_f64()
            .filter(|value| value.is_finite() && *value > 0.0)
            .map_or(0, |value| value as u64)
    })
}

fn token_count<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    let number = Number::deserialize(deserializer)?;
    Ok(count_from_number(&number))
}

fn optional_token_count<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    let number = Option::<Number>::deserialize(deserializer)?;
    Ok(number.as_ref().map(count_from_number))
}

pub fn read_record(path: &Path) -> Result<ConversationRecord, RecordError> {
    let raw = fs::read_to_string(path)?;
    let record: ConversationRecord = serde_json::from_str(&raw)?;
    if record.session_id.is_empty() {
        return Err(RecordError::MissingSessionId);
    }
    Ok(record)
}

/// [`read_record`] with every failure collapsed into absence.
pub fn load_record(path: &Path) -> Option<ConversationRecord> {
    match read_record(path) {
        Ok(record) => Some(record),
        Err(err) => {
            trace!(path = %path.display(), error = %err, "skipping session file");
            None
        }
    }
}
