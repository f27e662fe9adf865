use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::debug;

use super::{Capability, CapabilityError, CapabilityRequest, CapabilityResponse, TokenUsage};

const REASONING_MODEL_PREFIXES: &[&str] = &["gpt-5", "o1", "o3", "o4"];

#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub api_base: String,
    pub api_key: String,
    pub model: String,
    pub structured_output: bool,
    pub request_timeout: Duration,
}

/// Chat-completions provider for OpenAI and compatible endpoints.
pub struct OpenAiCompatibleCapability {
    client: Client,
    endpoint: String,
    config: ProviderConfig,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_completion_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    seed: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<Value>,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
    usage: Option<ChatUsage>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    content: Option<String>,
    refusal: Option<String>,
}

#[derive(Deserialize)]
struct ChatUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
    #[serde(default)]
    total_tokens: u64,
}

impl OpenAiCompatibleCapability {
    pub fn new(config: ProviderConfig) -> Result<Self, CapabilityError> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|err| CapabilityError::Connection(err.to_string()))?;
        let endpoint = format!("{}/chat/completions", config.api_base.trim_end_matches('/'));
        Ok(Self {
            client,
            endpoint,
            config,
        })
    }

    fn is_reasoning_model(&self) -> bool {
        REASONING_MODEL_PREFIXES
            .iter()
            .any(|prefix| self.config.model.starts_with(prefix))
    }

    fn build_body<'a>(&'a self, request: &'a CapabilityRequest) -> ChatRequest<'a> {
        let reasoning = self.is_reasoning_model();
        let sampling = &request.sampling;

        let response_format = match (&request.response_schema, self.config.structured_output) {
            (Some(schema), true) => Some(json!({
                "type": "json_schema",
                "json_schema": {
                    "name": schema.name,
                    "strict": true,
                    "schema": schema.schema,
                }
            })),
            (Some(_), false) => Some(json!({ "type": "json_object" })),
            (None, _) => None,
        };

        ChatRequest {
            model: &self.config.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: &request.system_prompt,
                },
                ChatMessage {
                    role: "user",
                    content: &request.user_prompt,
                },
            ],
            temperature: (!reasoning).then_some(sampling.temperature),
            top_p: if reasoning { None } else { sampling.top_p },
            max_tokens: (!reasoning).then_some(sampling.max_output_tokens),
            max_completion_tokens: reasoning.then_some(sampling.max_output_tokens),
            seed: sampling.seed,
            response_format,
        }
    }
}

#[async_trait]
impl Capability for OpenAiCompatibleCapability {
    async fn invoke(
        &self,
        request: &CapabilityRequest,
    ) -> Result<CapabilityResponse, CapabilityError> {
        let body = self.build_body(request);
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await
            .map_err(map_transport_error)?;

        let status = response.status();
        let text = response.text().await.map_err(map_transport_error)?;
        if !status.is_success() {
            return Err(map_status(status, text));
        }

        let parsed = decode_envelope(&text)?;

        let usage = parsed.usage.map(|usage| TokenUsage {
            input_tokens: usage.prompt_tokens,
            output_tokens: usage.completion_tokens,
            total_tokens: usage.total_tokens,
        });
        let message = parsed
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message)
            .ok_or(CapabilityError::EmptyResponse)?;

        if let Some(refusal) = message.refusal.filter(|value| !value.trim().is_empty()) {
            return Err(CapabilityError::BadRequest(format!("model refused: {refusal}")));
        }
        let content = message.content.unwrap_or_default();
        if content.trim().is_empty() {
            return Err(CapabilityError::EmptyResponse);
        }

        debug!(
            stage = request.stage.as_str(),
            model = %self.config.model,
            chars = content.len(),
            "provider response received"
        );
        Ok(CapabilityResponse { content, usage })
    }
}

fn decode_envelope(text: &str) -> Result<ChatResponse, CapabilityError> {
    serde_json::from_str(text).map_err(|err| {
        let snippet = crate::util::truncate_chars(text.trim(), 200);
        CapabilityError::Decode(format!("{err} (body: {snippet})"))
    })
}

fn map_transport_error(err: reqwest::Error) -> CapabilityError {
    if err.is_timeout() {
        CapabilityError::Timeout(err.to_string())
    } else {
        CapabilityError::Connection(err.to_string())
    }
}

pub(crate) fn map_status(status: StatusCode, body: String) -> CapabilityError {
    let message = crate::util::truncate_chars(body.trim(), 500).to_string();
    match status.as_u16() {
        429 => CapabilityError::RateLimited(message),
        401 | 403 => CapabilityError::Auth(message),
        408 => CapabilityError::Timeout(message),
        code if (400..500).contains(&code) => CapabilityError::BadRequest(message),
        code => CapabilityError::Server {
            status: code,
            message,
        },
    }
}
