//! Wire protocol types for bridge-worker communication.
//!
//! One JSON object per line in each direction:
//! - **stdin** (bridge → worker): [`Envelope`] wrapping a [`Command`]
//! - **stdout** (worker → bridge): [`Response`]
//!
//! stderr is free text and never parsed as protocol data.

use std::path::PathBuf;

use serde::{Deserialize, Deserializer, Serialize};

/// Correlation id attached to every command.
///
/// Allocated in strictly increasing order, so ordering by id is ordering by
/// submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(u64);

impl RequestId {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn get(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

/// One prior turn of a conversation, oldest first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: Role,
    pub content: String,
}

impl ChatTurn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Commands from bridge to worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Command {
    /// One-time setup. Must precede every other command on a fresh process.
    Initialize {
        careers_json_path: PathBuf,
        chroma_persist_dir: PathBuf,
        provider: String,
    },

    Chat {
        message: String,
        chat_history: Vec<ChatTurn>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        language: Option<String>,
    },

    /// First personalized message of a session.
    Greeting {
        assessment_summary: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        language: Option<String>,
    },
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Initialize { .. } => "initialize",
            Self::Chat { .. } => "chat",
            Self::Greeting { .. } => "greeting",
        }
    }
}

/// A command as written to the worker's stdin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub id: RequestId,
    #[serde(flatten)]
    pub command: Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    Success,
    Error,
}

/// A response line from the worker's stdout.
///
/// `id` is optional: workers that answer strictly in submission order may
/// omit it, in which case the response belongs to the oldest outstanding
/// command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<RequestId>,
    pub status: ResponseStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<ResponseData>,
}

impl Response {
    pub fn is_success(&self) -> bool {
        self.status == ResponseStatus::Success
    }

    /// Best description of a failure: top-level message, then `data.error`.
    pub fn error_message(&self) -> String {
        self.message
            .as_deref()
            .or_else(|| self.data.as_ref().and_then(|d| d.error.as_deref()))
            .filter(|m| !m.trim().is_empty())
            .unwrap_or("worker reported an error without a message")
            .to_string()
    }
}

/// Payload of a successful response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResponseData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub sources: Vec<Source>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Supporting document snippet returned alongside a reply.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Source {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub chunk_index: Option<u64>,
    #[serde(default)]
    pub snippet: String,
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}
