use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::mode::{SamplingProfile, WritingMode};

/// One call to the generation backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub prompt: String,
    pub system_prompt: String,
    #[serde(default)]
    pub context: Option<String>,
    #[serde(default)]
    pub mode: WritingMode,
    /// Takes precedence over the mode's default temperature.
    #[serde(default)]
    pub temperature: Option<f32>,
    /// Falls back to the configured process-wide ceiling when `None`.
    #[serde(default)]
    pub max_tokens: Option<u32>,
}

impl GenerationRequest {
    pub fn new(
        prompt: impl Into<String>,
        system_prompt: impl Into<String>,
        mode: WritingMode,
    ) -> Self {
        Self {
            prompt: prompt.into(),
            system_prompt: system_prompt.into(),
            context: None,
            mode,
            temperature: None,
            max_tokens: None,
        }
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        let context = context.into();
        self.context = if context.is_empty() { None } else { Some(context) };
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_temperature(mut self, temperature: Option<f32>) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn sampling(&self) -> SamplingProfile {
        self.mode.sampling_profile().with_temperature(self.temperature)
    }

    /// System instructions, optional context block and the task, in that order.
    pub fn full_prompt(&self) -> String {
        let mut parts = vec![self.system_prompt.clone()];
        if let Some(context) = self.context.as_deref().filter(|c| !c.is_empty()) {
            parts.push(format!("\n\nCONTEXT:\n{context}"));
        }
        parts.push(format!("\n\n{}", self.prompt));
        parts.join("\n")
    }
}

/// Outcome of a blocking generation call.  `success == false` iff the call
/// failed or the backend answered with something unusable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationResult {
    pub content: String,
    pub tokens_used: u64,
    pub latency_ms: u64,
    pub model: String,
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
}

impl GenerationResult {
    pub fn succeeded(content: String, tokens_used: u64, latency_ms: u64, model: &str) -> Self {
        Self {
            content,
            tokens_used,
            latency_ms,
            model: model.to_string(),
            success: true,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>, latency_ms: u64, model: &str) -> Self {
        Self {
            content: String::new(),
            tokens_used: 0,
            latency_ms,
            model: model.to_string(),
            success: false,
            error: Some(error.into()),
        }
    }
}

/// Items produced by a streaming generation.  Every stream ends with exactly
/// one terminal event: [`StreamEvent::Done`] or [`StreamEvent::Error`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamEvent {
    Token(String),
    Done,
    Error(String),
}

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Token(_))
    }
}

/// Seam between the orchestration layer and a concrete generation backend.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    /// Single round trip.  Never returns a Rust error; failures are reported
    /// through [`GenerationResult::success`].
    async fn generate(&self, request: &GenerationRequest) -> GenerationResult;

    /// Push fragments into `tx` as they arrive, then one terminal event.
    /// Returns early only when the receiver is gone.
    async fn generate_stream(&self, request: &GenerationRequest, tx: mpsc::Sender<StreamEvent>);

    fn model_name(&self) -> &str;
}
