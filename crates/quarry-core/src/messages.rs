use serde::{Deserialize, Serialize};

/// Author of a persisted chat message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::User => write!(f, "user"),
            Self::Assistant => write!(f, "assistant"),
        }
    }
}

impl std::str::FromStr for Role {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

/// One content block of a reasoning turn.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AssistantBlock {
    Text { text: String },
    ToolUse { name: String, input: serde_json::Value },
}

impl AssistantBlock {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn tool_use(name: impl Into<String>, input: serde_json::Value) -> Self {
        Self::ToolUse { name: name.into(), input }
    }
}

/// Structured messages observed from the agent capability while it runs.
///
/// `Assistant` carries one reasoning turn's content blocks. `ToolResults`
/// marks the boundary where the capability finished executing the tool
/// calls of the preceding turn.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReasonerMessage {
    Assistant { blocks: Vec<AssistantBlock> },
    ToolResults,
}

impl ReasonerMessage {
    /// Convenience: a turn containing a single text block.
    pub fn text(text: impl Into<String>) -> Self {
        Self::Assistant { blocks: vec![AssistantBlock::text(text)] }
    }

    /// Concatenated text content of this message, if any.
    pub fn text_content(&self) -> String {
        match self {
            Self::Assistant { blocks } => blocks
                .iter()
                .filter_map(|b| match b {
                    AssistantBlock::Text { text } => Some(text.as_str()),
                    AssistantBlock::ToolUse { .. } => None,
                })
                .collect(),
            Self::ToolResults => String::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn role_display_and_parse_roundtrip() {
        assert_eq!(Role::User.to_string(), "user");
        assert_eq!(Role::Assistant.to_string(), "assistant");
        assert_eq!("user".parse::<Role>().unwrap(), Role::User);
        assert_eq!("assistant".parse::<Role>().unwrap(), Role::Assistant);
        assert!("system".parse::<Role>().is_err());
    }

    #[test]
    fn text_message_helper() {
        let msg = ReasonerMessage::text("analyzing");
        assert_eq!(msg.text_content(), "analyzing");
    }

    #[test]
    fn text_content_skips_tool_use_blocks() {
        let msg = ReasonerMessage::Assistant {
            blocks: vec![
                AssistantBlock::text("running "),
                AssistantBlock::tool_use("execute_code", json!({"code": "tables()"})),
                AssistantBlock::text("now"),
            ],
        };
        assert_eq!(msg.text_content(), "running now");
        assert_eq!(ReasonerMessage::ToolResults.text_content(), "");
    }

    #[test]
    fn serde_tags() {
        let msg = ReasonerMessage::Assistant {
            blocks: vec![AssistantBlock::tool_use("execute_code", json!({"code": "1"}))],
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "assistant");
        assert_eq!(json["blocks"][0]["type"], "tool_use");
        assert_eq!(json["blocks"][0]["name"], "execute_code");

        let boundary = serde_json::to_value(ReasonerMessage::ToolResults).unwrap();
        assert_eq!(boundary["type"], "tool_results");
    }
}
