//! Erros do cliente Anthropic usado pelos provedores de reescrita.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AnthropicError {
    /// Chave vazia; o provedor fica desabilitado.
    #[error("missing API key")]
    MissingApiKey,

    /// HTTP 429. `retry_after_ms` vem do cabeçalho `retry-after`.
    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    /// HTTP 529: a API está sobrecarregada.
    #[error("API overloaded")]
    Overloaded,

    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
}

impl AnthropicError {
    /// Falhas passageiras, em que vale a pena tentar o próximo provedor em
    /// vez de desistir da reescrita.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::RateLimited { .. } | Self::Overloaded | Self::Network(_) => true,
            Self::Api { status, .. } => *status >= 500,
            Self::MissingApiKey => false,
        }
    }
}
