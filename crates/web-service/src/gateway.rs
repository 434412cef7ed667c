// Copyright (C) 2024 Red Hat
// SPDX-License-Identifier: Apache-2.0

//! This module contains the upstream provider adapter. Without a configured
//! key the adapter runs in mock mode and echoes the last sanitized prompt,
//! which keeps the whole gateway usable offline.

use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("provider request failed: {0}")]
    Transport(String),

    #[error("provider returned {status}: {message}")]
    Upstream { status: u16, message: String },

    #[error("provider reply was malformed: {0}")]
    BadReply(String),
}

/// One provider wire message.
#[derive(Clone, Debug, Serialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

pub struct Gateway {
    pub api_key: String,
    pub base_url: String,
    pub default_model: String,
    pub models: Vec<String>,
}

const DEFAULT_MODELS: [&str; 3] = ["gpt-4o-mini", "gpt-4.1-mini", "gpt-4.1"];

impl Gateway {
    pub fn from_env() -> Gateway {
        let models: Vec<String> = match std::env::var("AVAILABLE_MODELS") {
            Ok(value) if !value.trim().is_empty() => value
                .split(',')
                .map(str::trim)
                .filter(|item| !item.is_empty())
                .map(String::from)
                .collect(),
            _ => DEFAULT_MODELS.iter().map(|model| model.to_string()).collect(),
        };
        let default_model =
            std::env::var("DEFAULT_MODEL").unwrap_or_else(|_| models[0].clone());
        Gateway {
            api_key: std::env::var("PROVIDER_API_KEY").unwrap_or_default(),
            base_url: std::env::var("PROVIDER_BASE_URL")
                .unwrap_or_else(|_| "https://api.openai.com/v1".to_string()),
            default_model,
            models,
        }
    }

    pub fn is_mock_mode(&self) -> bool {
        self.api_key.is_empty()
    }

    /// Forward the sanitized conversation and return the reply content plus
    /// the provider usage block.
    pub async fn chat(
        &self,
        messages: Vec<ChatMessage>,
        model: &str,
    ) -> Result<(String, serde_json::Value), GatewayError> {
        if self.is_mock_mode() {
            return Ok(mock_reply(&messages));
        }

        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        let api_key = self.api_key.clone();
        let body = serde_json::json!({"model": model, "messages": messages});
        // ureq is a blocking client, keep it off the async executor.
        let reply = tokio::task::spawn_blocking(move || post_chat(&url, &api_key, body))
            .await
            .map_err(|err| GatewayError::Transport(err.to_string()))??;

        let content = reply
            .pointer("/choices/0/message/content")
            .and_then(|value| value.as_str())
            .ok_or_else(|| GatewayError::BadReply("missing message content".to_string()))?
            .to_string();

        let mut usage = serde_json::Map::new();
        usage.insert("provider".to_string(), "openai".into());
        if let Some(reported) = reply.get("usage").and_then(|value| value.as_object()) {
            for key in ["prompt_tokens", "completion_tokens", "total_tokens"] {
                if let Some(value) = reported.get(key) {
                    usage.insert(key.to_string(), value.clone());
                }
            }
        }
        Ok((content, serde_json::Value::Object(usage)))
    }
}

fn mock_reply(messages: &[ChatMessage]) -> (String, serde_json::Value) {
    let last_user = messages
        .iter()
        .rev()
        .find(|message| message.role == "user")
        .map(|message| message.content.as_str())
        .unwrap_or("");
    let preview: String = last_user.chars().take(400).collect();
    (
        format!(
            "[MOCK MODE] Simulated response. No provider key configured. Last received prompt: {}",
            preview
        ),
        serde_json::json!({"provider": "mock", "prompt_tokens": 0, "completion_tokens": 0}),
    )
}

fn post_chat(
    url: &str,
    api_key: &str,
    body: serde_json::Value,
) -> Result<serde_json::Value, GatewayError> {
    match ureq::post(url)
        .set("Authorization", &format!("Bearer {}", api_key))
        .send_json(body)
    {
        Ok(response) => response
            .into_json()
            .map_err(|err| GatewayError::BadReply(err.to_string())),
        Err(ureq::Error::Status(status, response)) => Err(GatewayError::Upstream {
            status,
            message: response.into_string().unwrap_or_default(),
        }),
        Err(err) => Err(GatewayError::Transport(err.to_string())),
    }
}
