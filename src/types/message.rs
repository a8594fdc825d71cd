//! Chat request/response types shared by the router and provider adapters.

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

/// A single chat turn.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: MessageRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: text.into(),
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: text.into(),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: text.into(),
        }
    }
}

/// Message role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

/// Token accounting reported by a provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl Usage {
    pub fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens.saturating_add(completion_tokens),
        }
    }
}

/// Normalized provider response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatResponse {
    pub content: String,
    pub finish_reason: String,
    #[serde(default)]
    pub usage: Usage,
}

impl ChatResponse {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            finish_reason: "stop".to_string(),
            usage: Usage::default(),
        }
    }

    pub fn with_finish_reason(mut self, reason: impl Into<String>) -> Self {
        self.finish_reason = reason.into();
        self
    }

    pub fn with_usage(mut self, usage: Usage) -> Self {
        self.usage = usage;
        self
    }
}

/// Generation parameters forwarded to the adapter.
///
/// Unset fields are filled from the router configuration before the call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GenerationParams {
    pub model: Option<String>,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
}

/// A chat call as seen by a provider adapter.
#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    pub params: GenerationParams,
    pub cancel: Option<CancellationToken>,
}

impl ChatRequest {
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        Self {
            messages,
            ..Default::default()
        }
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.params.model = Some(model.into());
        self
    }

    pub fn temperature(mut self, temp: f64) -> Self {
        self.params.temperature = Some(temp);
        self
    }

    pub fn max_tokens(mut self, max: u32) -> Self {
        self.params.max_tokens = Some(max);
        self
    }

    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().map(|t| t.is_cancelled()).unwrap_or(false)
    }

    /// Concatenated system prompt(s), in order.
    pub fn system_prompt(&self) -> String {
        system_prompt(&self.messages)
    }

    /// Concatenated user and assistant turns, in order, with role tags.
    pub fn conversation_prompt(&self) -> String {
        conversation_prompt(&self.messages)
    }
}

pub fn system_prompt(messages: &[ChatMessage]) -> String {
    messages
        .iter()
        .filter(|m| m.role == MessageRole::System)
        .map(|m| m.content.as_str())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Assistant turns are kept so multi-turn conversations that share the
/// same final user message do not collide.
pub fn conversation_prompt(messages: &[ChatMessage]) -> String {
    messages
        .iter()
        .filter(|m| m.role != MessageRole::System)
        .map(|m| match m.role {
            MessageRole::Assistant => format!("assistant: {}", m.content),
            _ => m.content.clone(),
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_serializes_lowercase_role() {
        let json = serde_json::to_value(ChatMessage::assistant("hi")).unwrap();
        assert_eq!(json, serde_json::json!({"role": "assistant", "content": "hi"}));
    }

    #[test]
    fn test_response_round_trips_camel_case() {
        let resp = ChatResponse::new("ok").with_usage(Usage::new(3, 4));
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["finishReason"], "stop");
        assert_eq!(json["usage"]["totalTokens"], 7);
    }

    #[test]
    fn test_prompt_extraction() {
        let req = ChatRequest::new(vec![
            ChatMessage::system("be terse"),
            ChatMessage::user("hello"),
            ChatMessage::assistant("hi"),
            ChatMessage::user("bye"),
        ]);
        assert_eq!(req.system_prompt(), "be terse");
        assert_eq!(req.conversation_prompt(), "hello\nassistant: hi\nbye");
    }

    #[test]
    fn test_cancel_flag() {
        let token = CancellationToken::new();
        let req = ChatRequest::new(vec![]).with_cancel(token.clone());
        assert!(!req.is_cancelled());
        token.cancel();
        assert!(req.is_cancelled());
    }
}
