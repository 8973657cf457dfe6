use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::ValueEnum;
use serde_json::{Value, json};

use crate::cli::Provider;
use crate::config::RuntimeConfig;
use crate::reasoning::{
    Message, ReasoningClient, ReasoningError, ReasoningRequest, ReasoningResponse,
    ToolCallRequest,
};

/// Connection defaults for a chat-completions compatible provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderEndpoint {
    pub base_url: String,
    pub api_key_env: Option<&'static str>,
    pub default_model: &'static str,
}

pub fn provider_endpoint(provider: Provider) -> ProviderEndpoint {
    match provider {
        Provider::Openai | Provider::Auto => ProviderEndpoint {
            base_url: "https://api.openai.com/v1".to_string(),
            api_key_env: Some("OPENAI_API_KEY"),
            default_model: "gpt-4.1-mini",
        },
        Provider::Groq => ProviderEndpoint {
            base_url: "https://api.groq.com/openai/v1".to_string(),
            api_key_env: Some("GROQ_API_KEY"),
            default_model: "llama-3.3-70b-versatile",
        },
        Provider::Deepseek => ProviderEndpoint {
            base_url: "https://api.deepseek.com/v1".to_string(),
            api_key_env: Some("DEEPSEEK_API_KEY"),
            default_model: "deepseek-chat",
        },
        Provider::Ollama => {
            let host = std::env::var("OLLAMA_HOST")
                .unwrap_or_else(|_| "http://localhost:11434".to_string());
            ProviderEndpoint {
                base_url: format!("{}/v1", host.trim_end_matches('/')),
                api_key_env: None,
                default_model: "llama3.1",
            }
        }
    }
}

pub fn validate_model_for_provider(provider: Provider, model_name: &str) -> Result<()> {
    let is_valid = match provider {
        Provider::Openai => {
            model_name.starts_with("gpt-")
                || model_name.starts_with("o1")
                || model_name.starts_with("o3")
                || model_name.starts_with("o4")
        }
        Provider::Deepseek => model_name.starts_with("deepseek"),
        Provider::Groq | Provider::Ollama => !model_name.trim().is_empty(),
        Provider::Auto => true,
    };

    if is_valid {
        return Ok(());
    }

    Err(anyhow::anyhow!(
        "model '{}' is not compatible with provider '{:?}'",
        model_name,
        provider
    ))
}

pub fn detect_provider() -> Option<Provider> {
    if env_present("OPENAI_API_KEY") {
        return Some(Provider::Openai);
    }
    if env_present("DEEPSEEK_API_KEY") {
        return Some(Provider::Deepseek);
    }
    if env_present("GROQ_API_KEY") {
        return Some(Provider::Groq);
    }
    if env_present("OLLAMA_HOST") {
        return Some(Provider::Ollama);
    }
    None
}

pub fn env_present(key: &str) -> bool {
    std::env::var(key)
        .map(|v| !v.trim().is_empty())
        .unwrap_or(false)
}

pub fn parse_provider_name(value: &str) -> Result<Provider> {
    Provider::from_str(value, true).map_err(|_| {
        anyhow::anyhow!(
            "invalid provider '{}'. Supported values: auto, openai, deepseek, groq, ollama",
            value
        )
    })
}

pub fn resolve_reasoning_client(
    cfg: &RuntimeConfig,
) -> Result<(Arc<dyn ReasoningClient>, Provider, String)> {
    let provider = match cfg.provider {
        Provider::Auto => detect_provider().context(
            "no provider could be auto-detected. Set one of OPENAI_API_KEY, DEEPSEEK_API_KEY, \
             GROQ_API_KEY, or use --provider ollama",
        )?,
        p => p,
    };

    let endpoint = provider_endpoint(provider);
    let api_key_env = cfg.api_key_env.as_deref().or(endpoint.api_key_env);
    let api_key = match api_key_env {
        Some(var) => Some(
            std::env::var(var)
                .with_context(|| format!("{var} is required for provider '{provider:?}'"))?,
        ),
        None => None,
    };
    let model_name = cfg
        .model
        .clone()
        .unwrap_or_else(|| endpoint.default_model.to_string());
    validate_model_for_provider(provider, &model_name)?;

    let client = OpenAiCompatibleClient::new(
        cfg.base_url.clone().unwrap_or(endpoint.base_url),
        api_key,
        model_name.clone(),
        Duration::from_secs(cfg.request_timeout_secs),
    )?;
    Ok((Arc::new(client), provider, model_name))
}

// ---------------------------------------------------------------------------
// Chat-completions client
// ---------------------------------------------------------------------------

/// Reasoning client for any service speaking the OpenAI chat-completions
/// tool-calling protocol.
#[derive(Debug, Clone)]
pub struct OpenAiCompatibleClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
}

impl OpenAiCompatibleClient {
    pub fn new(
        base_url: impl Into<String>,
        api_key: Option<String>,
        model: impl Into<String>,
        request_timeout: Duration,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            model: model.into(),
        })
    }

    pub fn request_body(&self, request: &ReasoningRequest) -> Value {
        let mut messages = Vec::<Value>::new();
        if !request.instructions.trim().is_empty() {
            messages.push(json!({ "role": "system", "content": request.instructions }));
        }
        messages.extend(request.messages.iter().map(chat_message));

        let mut body = json!({
            "model": request.model.clone().unwrap_or_else(|| self.model.clone()),
            "messages": messages,
        });
        if !request.tools.is_empty() {
            body["tools"] = Value::Array(
                request
                    .tools
                    .iter()
                    .map(|tool| {
                        json!({
                            "type": "function",
                            "function": {
                                "name": tool.name,
                                "description": tool.description,
                                "parameters": tool.parameters
                            }
                        })
                    })
                    .collect(),
            );
        }
        body
    }
}

fn chat_message(message: &Message) -> Value {
    match message {
        Message::User { content } => json!({ "role": "user", "content": content }),
        Message::Assistant {
            content,
            tool_calls,
        } => {
            let mut value = json!({ "role": "assistant", "content": content });
            if !tool_calls.is_empty() {
                value["tool_calls"] = Value::Array(
                    tool_calls
                        .iter()
                        .map(|call| {
                            json!({
                                "id": call.id,
                                "type": "function",
                                "function": {
                                    "name": call.name,
                                    "arguments": call.arguments.to_string()
                                }
                            })
                        })
                        .collect(),
                );
            }
            value
        }
        Message::Tool {
            call_id, content, ..
        } => json!({
            "role": "tool",
            "tool_call_id": call_id,
            "content": content.to_string()
        }),
        Message::Handoff { from, to, payload } => json!({
            "role": "user",
            "content": format!("[handoff from '{from}' to '{to}'] {payload}")
        }),
    }
}

/// Reads `choices[0].message` from a chat-completions response.
pub fn parse_chat_response(body: &Value) -> Result<ReasoningResponse, ReasoningError> {
    let message = body
        .pointer("/choices/0/message")
        .ok_or_else(|| ReasoningError::fatal("response has no choices"))?;

    let text = message
        .get("content")
        .and_then(Value::as_str)
        .map(str::to_string)
        .filter(|text| !text.is_empty());

    let mut tool_calls = Vec::<ToolCallRequest>::new();
    let raw_calls = message
        .get("tool_calls")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();
    for (index, call) in raw_calls.iter().enumerate() {
        let Some(name) = call.pointer("/function/name").and_then(Value::as_str) else {
            continue;
        };
        let id = call
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| format!("call-{index}"));
        let arguments = match call.pointer("/function/arguments") {
            Some(Value::String(raw)) if !raw.trim().is_empty() => {
                serde_json::from_str::<Value>(raw).map_err(|err| {
                    let snippet = raw.chars().take(200).collect::<String>();
                    ReasoningError::fatal(format!(
                        "tool call '{name}' ({id}) has malformed arguments ({err}): {snippet}"
                    ))
                })?
            }
            Some(Value::Object(map)) => Value::Object(map.clone()),
            _ => json!({}),
        };
        tool_calls.push(ToolCallRequest::new(id, name, arguments));
    }

    Ok(ReasoningResponse { text, tool_calls })
}

#[async_trait]
impl ReasoningClient for OpenAiCompatibleClient {
    async fn complete(
        &self,
        request: &ReasoningRequest,
    ) -> Result<ReasoningResponse, ReasoningError> {
        let url = format!("{}/chat/completions", self.base_url);
        let mut builder = self.http.post(&url).json(&self.request_body(request));
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await.map_err(|err| {
            let message = format!("request to {url} failed: {err}");
            if err.is_timeout() || err.is_connect() {
                ReasoningError::transient(message)
            } else {
                ReasoningError::fatal(message)
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let snippet = body.chars().take(300).collect::<String>();
            let message = format!("provider returned {status}: {snippet}");
            return Err(if status.as_u16() == 429 || status.is_server_error() {
                ReasoningError::transient(message)
            } else {
                ReasoningError::fatal(message)
            });
        }

        let body = response
            .json::<Value>()
            .await
            .map_err(|err| ReasoningError::fatal(format!("invalid provider response: {err}")))?;
        parse_chat_response(&body)
    }
}
