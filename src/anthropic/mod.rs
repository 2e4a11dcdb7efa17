//! Cliente mínimo da API Anthropic Messages, usado como provedor de
//! reescrita de prompts bloqueados por política de conteúdo.

pub mod client;
pub mod error;
pub mod types;

pub use client::{AnthropicClient, MessageSender};
pub use error::AnthropicError;
pub use types::{Message, MessagesRequest, MessagesResponse, Usage};
