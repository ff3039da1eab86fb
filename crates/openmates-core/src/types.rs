use std::fmt;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! uuid_id {
    ($name:ident, $doc:expr) => {
        #[doc = $doc]
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(pub String);

        impl $name {
            /// UUIDv7 — time-sortable, so ids correlate with log ordering.
            pub fn new() -> Self {
                Self(Uuid::now_v7().to_string())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

uuid_id!(TaskId, "Opaque id for one orchestrated turn.");
uuid_id!(UserId, "Owner of a chat, key, and credit balance.");
uuid_id!(ChatId, "A conversation thread.");
uuid_id!(MessageId, "A single persisted message within a chat.");
uuid_id!(InvocationId, "One skill execution within a task.");
uuid_id!(EmbedId, "An auxiliary artifact produced by a skill.");

/// Role in a conversation turn, serialized the way provider APIs expect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
    Tool,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
            Role::System => write!(f, "system"),
            Role::Tool => write!(f, "tool"),
        }
    }
}

/// Selects how aggressively the preprocess stage should pick a main-stage model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelTier {
    Fast,
    Balanced,
    Max,
}

impl std::str::FromStr for ModelTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fast" => Ok(ModelTier::Fast),
            "balanced" => Ok(ModelTier::Balanced),
            "max" => Ok(ModelTier::Max),
            other => Err(format!("unknown model tier: {other}")),
        }
    }
}

/// How a skill is invoked by the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    Inline,
    Queued,
}

/// Lifecycle of an Embed artifact. Transitions exactly once, Processing -> {Finished, Error}.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbedStatus {
    Processing,
    Finished,
    Error,
}

/// Lifecycle of a creator-income reservation (see SPEC_FULL.md §4.I.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CreatorIncomeStatus {
    Reserved,
    Claimed,
}

/// One turn of conversation, already decrypted, as the pipeline consumes it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    pub model_id: Option<String>,
    pub tool_calls: Vec<ToolCall>,
    /// Set only on `Role::Tool` messages: the call this is the result of.
    pub tool_call_id: Option<String>,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self { role: Role::User, content: content.into(), model_id: None, tool_calls: Vec::new(), tool_call_id: None }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: Role::Assistant, content: content.into(), model_id: None, tool_calls: Vec::new(), tool_call_id: None }
    }

    pub fn assistant_with_tool_calls(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self { role: Role::Assistant, content: content.into(), model_id: None, tool_calls, tool_call_id: None }
    }

    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
            model_id: None,
            tool_calls: Vec::new(),
            tool_call_id: Some(tool_call_id.into()),
        }
    }
}

/// The model's structured request to invoke a skill, with accumulated JSON arguments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub call_id: String,
    pub function_name: String,
    pub arguments_raw: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arguments_parsed: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parse_error: Option<String>,
}

impl ToolCall {
    pub fn finalize(call_id: String, function_name: String, arguments_raw: String) -> Self {
        match serde_json::from_str::<serde_json::Value>(&arguments_raw) {
            Ok(v) => Self { call_id, function_name, arguments_raw, arguments_parsed: Some(v), parse_error: None },
            Err(e) => Self { call_id, function_name, arguments_raw, arguments_parsed: None, parse_error: Some(e.to_string()) },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique_and_display() {
        let a = TaskId::new();
        let b = TaskId::new();
        assert_ne!(a, b);
        assert_eq!(a.to_string(), a.0);
    }

    #[test]
    fn model_tier_parses() {
        assert_eq!("fast".parse::<ModelTier>().unwrap(), ModelTier::Fast);
        assert!("slow".parse::<ModelTier>().is_err());
    }

    #[test]
    fn tool_call_finalize_records_parse_error() {
        let tc = ToolCall::finalize("1".into(), "f".into(), "not json".into());
        assert!(tc.arguments_parsed.is_none());
        assert!(tc.parse_error.is_some());
    }
}
