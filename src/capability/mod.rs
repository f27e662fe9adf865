//! Boundary to the external language-model capability.
//!
//! The pipeline only ever talks to [`Capability`]; provider request shapes live in [`http`],
//! admission control and retries in [`limiter`], and response parsing in [`json`].

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

pub mod http;
pub mod json;
pub mod limiter;
#[cfg(test)]
pub mod mock;

pub use http::{OpenAiCompatibleCapability, ProviderConfig};
pub use json::{JsonResponse, extract_first_json_object, invoke_json, schema_violations};
pub use limiter::{LimitedCapability, LimiterConfig, RetryPolicy};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Selection,
    Estimation,
    Critique,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Selection => "selection",
            Self::Estimation => "estimation",
            Self::Critique => "critique",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SamplingParams {
    pub temperature: f32,
    pub top_p: Option<f32>,
    pub max_output_tokens: u32,
    pub seed: Option<u64>,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: 0.1,
            top_p: Some(1.0),
            max_output_tokens: 400,
            seed: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResponseSchema {
    pub name: String,
    pub schema: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CapabilityRequest {
    pub stage: Stage,
    pub system_prompt: String,
    pub user_prompt: String,
    pub response_schema: Option<ResponseSchema>,
    pub sampling: SamplingParams,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CapabilityResponse {
    pub content: String,
    pub usage: Option<TokenUsage>,
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum CapabilityError {
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("server error (status {status}): {message}")]
    Server { status: u16, message: String },
    #[error("request timed out: {0}")]
    Timeout(String),
    #[error("authentication rejected: {0}")]
    Auth(String),
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("response did not match schema: {0}")]
    Schema(String),
    #[error("undecodable provider response: {0}")]
    Decode(String),
    #[error("empty response")]
    EmptyResponse,
}

impl CapabilityError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited(_) | Self::Connection(_) | Self::Server { .. } | Self::Timeout(_)
        )
    }
}

#[async_trait]
pub trait Capability: Send + Sync {
    async fn invoke(
        &self,
        request: &CapabilityRequest,
    ) -> Result<CapabilityResponse, CapabilityError>;
}

#[async_trait]
impl<T: Capability + ?Sized> Capability for Arc<T> {
    async fn invoke(
        &self,
        request: &CapabilityRequest,
    ) -> Result<CapabilityResponse, CapabilityError> {
        (**self).invoke(request).await
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StageUsage {
    pub calls: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
}

impl StageUsage {
    fn add(&mut self, other: &StageUsage) {
        self.calls += other.calls;
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.total_tokens += other.total_tokens;
    }
}

/// Token accounting owned by whoever drives the calls. Ledgers are merged upwards
/// (call -> concept -> run) instead of sharing one accumulator.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UsageLedger {
    stages: BTreeMap<Stage, StageUsage>,
}

impl UsageLedger {
    pub fn record(&mut self, stage: Stage, usage: Option<&TokenUsage>) {
        let entry = self.stages.entry(stage).or_default();
        entry.calls += 1;
        if let Some(usage) = usage {
            entry.input_tokens += usage.input_tokens;
            entry.output_tokens += usage.output_tokens;
            entry.total_tokens += usage.total_tokens;
        }
    }

    pub fn merge(&mut self, other: &UsageLedger) {
        for (stage, usage) in &other.stages {
            self.stages.entry(*stage).or_default().add(usage);
        }
    }

    pub fn stage(&self, stage: Stage) -> StageUsage {
        self.stages.get(&stage).copied().unwrap_or_default()
    }

    pub fn total(&self) -> StageUsage {
        let mut total = StageUsage::default();
        for usage in self.stages.values() {
            total.add(usage);
        }
        total
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn to_json(&self) -> serde_json::Value {
        let mut stages = serde_json::Map::new();
        for (stage, usage) in &self.stages {
            stages.insert(
                stage.as_str().to_string(),
                serde_json::to_value(usage).unwrap_or(serde_json::Value::Null),
            );
        }
        serde_json::json!({
            "stages": stages,
            "total": serde_json::to_value(self.total()).unwrap_or(serde_json::Value::Null),
        })
    }
}

#[cfg(test)]
mod tests;
