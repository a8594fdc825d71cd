//! 类型系统模块：定义聊天请求、响应与消息的核心数据类型。
//!
//! # Types Module
//!
//! Core value types passed between the router and provider adapters.
//!
//! | Type | Description |
//! |------|-------------|
//! | [`ChatMessage`] | Chat message with role and text content |
//! | [`MessageRole`] | system, user or assistant |
//! | [`ChatRequest`] | Messages + generation parameters + optional cancellation |
//! | [`ChatResponse`] | Normalized provider answer with token usage |
//!
//! ## Example
//!
//! ```rust
//! use ai_relay::types::{ChatMessage, ChatRequest};
//!
//! let request = ChatRequest::new(vec![
//!     ChatMessage::system("You are a helpful assistant"),
//!     ChatMessage::user("Summarize this job posting"),
//! ])
//! .temperature(0.2)
//! .max_tokens(512);
//! assert_eq!(request.messages.len(), 2);
//! ```

pub mod message;

pub use message::{ChatMessage, ChatRequest, ChatResponse, GenerationParams, MessageRole, Usage};
