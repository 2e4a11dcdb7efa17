//! Tipos de requisição e resposta do endpoint `v1/messages`.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagesRequest {
    pub model: String,
    pub max_tokens: u32,
    /// Instruções de sistema; omitidas do JSON quando ausentes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    pub messages: Vec<Message>,
}

impl MessagesRequest {
    /// Requisição de uma única mensagem do usuário.
    pub fn single(model: &str, max_tokens: u32, system: Option<String>, content: String) -> Self {
        Self {
            model: model.to_string(),
            max_tokens,
            system,
            messages: vec![Message {
                role: "user".into(),
                content,
            }],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// "user" ou "assistant".
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagesResponse {
    pub id: String,
    pub content: Vec<ContentBlock>,
    pub model: String,
    pub stop_reason: Option<String>,
    pub usage: Usage,
}

impl MessagesResponse {
    /// Texto concatenado de todos os blocos do tipo "text".
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter(|b| b.content_type == "text")
            .map(|b| b.text.as_str())
            .collect::<Vec<_>>()
            .join("")
            .trim()
            .to_string()
    }
}

/// Bloco de conteúdo; `content_type` vira `"type"` no JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentBlock {
    #[serde(rename = "type")]
    pub content_type: String,
    #[serde(default)]
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_prompt_is_skipped_when_absent() {
        let req = MessagesRequest::single("claude-haiku-4-5", 512, None, "hi".into());
        let json = serde_json::to_string(&req).unwrap();
        assert!(!json.contains("system"));

        let req = MessagesRequest::single("claude-haiku-4-5", 512, Some("be brief".into()), "hi".into());
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["system"], "be brief");
        assert_eq!(json["messages"][0]["role"], "user");
    }

    #[test]
    fn response_text_joins_text_blocks() {
        let api_json = r#"{
            "id": "msg_123",
            "content": [
                {"type": "text", "text": "  A calm portrait "},
                {"type": "tool_use"},
                {"type": "text", "text": "in soft light.  "}
            ],
            "model": "claude-haiku-4-5",
            "stop_reason": "end_turn",
            "usage": {"input_tokens": 5, "output_tokens": 15}
        }"#;
        let resp: MessagesResponse = serde_json::from_str(api_json).unwrap();
        assert_eq!(resp.text(), "A calm portrait in soft light.");
    }

    #[test]
    fn null_stop_reason() {
        let json = r#"{
            "id": "msg_456",
            "content": [],
            "model": "test",
            "stop_reason": null,
            "usage": {"input_tokens": 0, "output_tokens": 0}
        }"#;
        let resp: MessagesResponse = serde_json::from_str(json).unwrap();
        assert_eq!(resp.stop_reason, None);
        assert_eq!(resp.text(), "");
    }
}
