//! `AgentInvoker` for any OpenAI-compatible chat completions endpoint.
//!
//! The bearer token is read once from the environment variable named in
//! `AgentSettings::api_key_env` and held as a [`SecretString`]; it is only
//! exposed when building the request header.

use std::time::Duration;

use flowgate_core::workflow::nodes::{AgentInvoker, AgentRequest, AgentResponse};
use flowgate_types::config::{AgentSettings, HttpSettings};
use futures_util::future::BoxFuture;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

// No Debug derive: keeps the token out of logs.
pub struct OpenAiCompatInvoker {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    api_key: Option<SecretString>,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct ChatUsage {
    #[serde(default)]
    total_tokens: u64,
}

impl OpenAiCompatInvoker {
    pub fn new(settings: &AgentSettings, http: &HttpSettings) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(http.timeout_secs))
            .user_agent(http.user_agent.as_str())
            .build()?;

        let api_key = settings
            .api_key_env
            .as_deref()
            .and_then(|var| std::env::var(var).ok())
            .filter(|key| !key.is_empty())
            .map(SecretString::from);
        if settings.api_key_env.is_some() && api_key.is_none() {
            tracing::warn!(
                env = settings.api_key_env.as_deref().unwrap_or_default(),
                "agent api key variable is unset; calling endpoint without credentials"
            );
        }

        Ok(Self {
            client,
            endpoint: settings.endpoint.clone(),
            model: settings.model.clone(),
            api_key,
        })
    }

    pub fn with_api_key(mut self, api_key: SecretString) -> Self {
        self.api_key = Some(api_key);
        self
    }

    async fn complete(&self, request: AgentRequest) -> Result<AgentResponse, String> {
        let model = request.model.as_deref().unwrap_or(&self.model);
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = request.system.as_deref() {
            messages.push(ChatMessage {
                role: "system",
                content: system,
            });
        }
        messages.push(ChatMessage {
            role: "user",
            content: &request.prompt,
        });
        let body = ChatRequest {
            model,
            messages,
            temperature: request.temperature,
        };

        let mut builder = self.client.post(&self.endpoint).json(&body);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key.expose_secret());
        }
        let response = builder
            .send()
            .await
            .map_err(|e| format!("HTTP request failed: {e}"))?;

        let status = response.status();
        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            return Err(match status.as_u16() {
                401 | 403 => "authentication failed".to_string(),
                429 => "rate limited".to_string(),
                _ => format!("HTTP {status}: {error_body}"),
            });
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| format!("failed to parse response: {e}"))?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| "response contained no choices".to_string())?;

        Ok(AgentResponse {
            content,
            model: parsed.model.unwrap_or_else(|| model.to_string()),
            total_tokens: parsed.usage.map(|u| u.total_tokens).unwrap_or(0),
        })
    }
}

impl AgentInvoker for OpenAiCompatInvoker {
    fn invoke<'a>(&'a self, request: AgentRequest) -> BoxFuture<'a, Result<AgentResponse, String>> {
        Box::pin(self.complete(request))
    }
}
