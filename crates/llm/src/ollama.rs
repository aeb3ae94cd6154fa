//! Ollama-compatible generation and embedding backend.
//!
//! `POST /api/generate` with `stream: false` answers with a single JSON
//! object; with `stream: true` it answers with newline-delimited JSON records
//! `{ "response": "...", "done": bool }` terminated by `done = true`.

use std::fmt::Display;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use narrative_config::LlmConfig;
use narrative_core::{NarrativeError, Result};

use crate::generation::{GenerationRequest, GenerationResult, StreamEvent, TextGenerator};

#[derive(Debug, Clone)]
pub struct OllamaClient {
    /// Long-timeout client for generation.
    client: reqwest::Client,
    /// Short-timeout client for embeddings and catalogue calls.
    embed_client: reqwest::Client,
    base_url: String,
    model: String,
    embedding_model: String,
    default_max_tokens: u32,
}

/// `options` block of a generate request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenerateOptions {
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: u32,
    pub num_predict: u32,
}

#[derive(Debug, Serialize)]
struct GeneratePayload<'a> {
    model: &'a str,
    prompt: String,
    stream: bool,
    options: GenerateOptions,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    response: Option<String>,
    #[serde(default)]
    eval_count: Option<u64>,
    #[serde(default)]
    prompt_eval_count: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct StreamRecord {
    #[serde(default)]
    response: String,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    #[serde(default)]
    embedding: Vec<f32>,
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<TagEntry>,
}

#[derive(Debug, Deserialize)]
struct TagEntry {
    name: String,
}

impl OllamaClient {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.generation_timeout_secs))
            .build()
            .map_err(|err| NarrativeError::BackendUnavailable(err.to_string()))?;
        let embed_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.embedding_timeout_secs))
            .build()
            .map_err(|err| NarrativeError::BackendUnavailable(err.to_string()))?;

        info!(model = %config.model, base_url = %config.base_url, "generation backend configured");
        Ok(Self {
            client,
            embed_client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            embedding_model: config.embedding_model.clone(),
            default_max_tokens: config.max_tokens_per_generation,
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    pub fn generation_options(&self, request: &GenerationRequest) -> GenerateOptions {
        let sampling = request.sampling();
        GenerateOptions {
            temperature: sampling.temperature,
            top_p: sampling.top_p,
            top_k: sampling.top_k,
            num_predict: request.max_tokens.unwrap_or(self.default_max_tokens),
        }
    }

    fn payload(&self, request: &GenerationRequest, stream: bool) -> GeneratePayload<'_> {
        GeneratePayload {
            model: &self.model,
            prompt: request.full_prompt(),
            stream,
            options: self.generation_options(request),
        }
    }

    async fn generate_inner(&self, request: &GenerationRequest) -> Result<(String, u64)> {
        let response = self
            .client
            .post(self.endpoint("/api/generate"))
            .json(&self.payload(request, false))
            .send()
            .await
            .map_err(|err| NarrativeError::BackendUnavailable(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(NarrativeError::BackendUnavailable(format!(
                "backend returned {status}: {body}"
            )));
        }

        let body: GenerateResponse = response
            .json()
            .await
            .map_err(|err| NarrativeError::MalformedBackendResponse(err.to_string()))?;
        let content = body.response.ok_or_else(|| {
            NarrativeError::MalformedBackendResponse("response field missing".to_string())
        })?;
        let tokens = body.eval_count.unwrap_or(0) + body.prompt_eval_count.unwrap_or(0);
        Ok((content, tokens))
    }

    /// Embed `text` with the configured embedding model.
    pub async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let body = serde_json::json!({ "model": self.embedding_model, "prompt": text });
        let response = self
            .embed_client
            .post(self.endpoint("/api/embeddings"))
            .json(&body)
            .send()
            .await
            .map_err(|err| NarrativeError::BackendUnavailable(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(NarrativeError::BackendUnavailable(format!(
                "embedding backend returned {status}"
            )));
        }
        let parsed: EmbeddingResponse = response
            .json()
            .await
            .map_err(|err| NarrativeError::MalformedBackendResponse(err.to_string()))?;
        if parsed.embedding.is_empty() {
            return Err(NarrativeError::MalformedBackendResponse(
                "empty embedding".to_string(),
            ));
        }
        Ok(parsed.embedding)
    }

    /// Names of the models installed on the backend.
    pub async fn list_models(&self) -> Result<Vec<String>> {
        let response = self
            .embed_client
            .get(self.endpoint("/api/tags"))
            .send()
            .await
            .map_err(|err| NarrativeError::BackendUnavailable(err.to_string()))?;
        let parsed: TagsResponse = response
            .json()
            .await
            .map_err(|err| NarrativeError::MalformedBackendResponse(err.to_string()))?;
        let mut models: Vec<String> = parsed.models.into_iter().map(|m| m.name).collect();
        models.sort();
        models.dedup();
        Ok(models)
    }
}

#[async_trait]
impl TextGenerator for OllamaClient {
    async fn generate(&self, request: &GenerationRequest) -> GenerationResult {
        let started = Instant::now();
        let outcome = self.generate_inner(request).await;
        let latency_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok((content, tokens)) => {
                debug!(latency_ms, tokens, mode = request.mode.slug(), "generation complete");
                GenerationResult::succeeded(content, tokens, latency_ms, &self.model)
            }
            Err(err) => {
                error!(%err, latency_ms, "generation failed");
                GenerationResult::failed(err.to_string(), latency_ms, &self.model)
            }
        }
    }

    async fn generate_stream(&self, request: &GenerationRequest, tx: mpsc::Sender<StreamEvent>) {
        let started = Instant::now();
        let response = self
            .client
            .post(self.endpoint("/api/generate"))
            .json(&self.payload(request, true))
            .send()
            .await;

        let response = match response {
            Ok(response) => response,
            Err(err) => {
                error!(%err, "streaming generation failed to start");
                let _ = tx.send(StreamEvent::Error(err.to_string())).await;
                return;
            }
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!(%status, "streaming generation rejected");
            let _ = tx
                .send(StreamEvent::Error(format!("backend returned {status}: {body}")))
                .await;
            return;
        }

        let chunks = futures::stream::unfold(Some(response), |state| async move {
            let mut response = state?;
            match response.chunk().await {
                Ok(Some(bytes)) => Some((Ok(bytes), Some(response))),
                Ok(None) => None,
                Err(err) => Some((Err(err), None)),
            }
        });
        let summary = relay_ndjson(Box::pin(chunks), &tx).await;

        info!(
            fragments = summary.fragments,
            skipped = summary.skipped,
            latency_ms = started.elapsed().as_millis() as u64,
            mode = request.mode.slug(),
            "streaming generation finished"
        );
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

// ── NDJSON streaming ─────────────────────────────────────────────────────────

/// Splits an arbitrary byte stream into complete lines.  Bytes are buffered
/// until a newline arrives, so records and UTF-8 sequences may straddle
/// network chunks.
#[derive(Debug, Default)]
pub struct NdjsonDecoder {
    buffer: Vec<u8>,
}

impl NdjsonDecoder {
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            let text = String::from_utf8_lossy(&line[..line.len() - 1]).trim().to_string();
            if !text.is_empty() {
                lines.push(text);
            }
        }
        lines
    }

    /// Whatever is left once the connection closes without a final newline.
    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buffer);
        let text = String::from_utf8_lossy(&rest).trim().to_string();
        (!text.is_empty()).then_some(text)
    }
}

/// What one NDJSON line means for the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordOutcome {
    /// Incremental text, possibly followed by completion.
    Fragment { text: String, done: bool },
    /// Backend-reported failure inside the stream.
    Failed(String),
    /// Unparsable line; skipped.
    Malformed,
}

pub fn interpret_record(line: &str) -> RecordOutcome {
    match serde_json::from_str::<StreamRecord>(line) {
        Ok(record) => match record.error {
            Some(message) => RecordOutcome::Failed(message),
            None => RecordOutcome::Fragment {
                text: record.response,
                done: record.done,
            },
        },
        Err(err) => {
            warn!(%err, "skipping malformed stream record");
            RecordOutcome::Malformed
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelaySummary {
    pub fragments: usize,
    pub skipped: usize,
}

/// Decode NDJSON records from `chunks` and forward their text to `tx`,
/// finishing with exactly one terminal event.
pub async fn relay_ndjson<S, B, E>(mut chunks: S, tx: &mpsc::Sender<StreamEvent>) -> RelaySummary
where
    S: Stream<Item = std::result::Result<B, E>> + Unpin,
    B: AsRef<[u8]>,
    E: Display,
{
    let mut decoder = NdjsonDecoder::default();
    let mut summary = RelaySummary::default();

    while let Some(chunk) = chunks.next().await {
        let bytes = match chunk {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(%err, fragments = summary.fragments, "stream interrupted");
                let _ = tx.send(StreamEvent::Error(err.to_string())).await;
                return summary;
            }
        };
        for line in decoder.push(bytes.as_ref()) {
            match forward_line(&line, tx, &mut summary).await {
                LineFlow::Continue => {}
                LineFlow::Stop => return summary,
            }
        }
    }

    if let Some(line) = decoder.finish() {
        if let LineFlow::Stop = forward_line(&line, tx, &mut summary).await {
            return summary;
        }
    }
    let _ = tx.send(StreamEvent::Done).await;
    summary
}

enum LineFlow {
    Continue,
    Stop,
}

async fn forward_line(
    line: &str,
    tx: &mpsc::Sender<StreamEvent>,
    summary: &mut RelaySummary,
) -> LineFlow {
    match interpret_record(line) {
        RecordOutcome::Fragment { text, done } => {
            if !text.is_empty() {
                summary.fragments += 1;
                if tx.send(StreamEvent::Token(text)).await.is_err() {
                    return LineFlow::Stop;
                }
            }
            if done {
                let _ = tx.send(StreamEvent::Done).await;
                return LineFlow::Stop;
            }
            LineFlow::Continue
        }
        RecordOutcome::Failed(message) => {
            let _ = tx.send(StreamEvent::Error(message)).await;
            LineFlow::Stop
        }
        RecordOutcome::Malformed => {
            summary.skipped += 1;
            LineFlow::Continue
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mode::WritingMode;

    fn config() -> LlmConfig {
        LlmConfig {
            max_tokens_per_generation: 1234,
            ..LlmConfig::default()
        }
    }

    async fn collect(rx: &mut mpsc::Receiver<StreamEvent>) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    }

    #[test]
    fn options_follow_mode_and_default_ceiling() {
        let client = OllamaClient::new(&config()).unwrap();
        let req = GenerationRequest::new("p", "s", WritingMode::UserLead);
        let opts = client.generation_options(&req);
        assert_eq!(
            opts,
            GenerateOptions {
                temperature: 0.30,
                top_p: 0.80,
                top_k: 20,
                num_predict: 1234,
            }
        );

        let req = req.with_max_tokens(1000).with_temperature(Some(0.5));
        let opts = client.generation_options(&req);
        assert_eq!(opts.num_predict, 1000);
        assert!((opts.temperature - 0.5).abs() < f32::EPSILON);
    }

    #[test]
    fn payload_serializes_backend_shape() {
        let client = OllamaClient::new(&config()).unwrap();
        let req = GenerationRequest::new("Go on.", "Be brief.", WritingMode::AiLead);
        let value = serde_json::to_value(client.payload(&req, true)).unwrap();
        assert_eq!(value["model"], "llama3.1:8b");
        assert_eq!(value["stream"], true);
        assert_eq!(value["options"]["top_k"], 40);
        assert_eq!(value["options"]["num_predict"], 1234);
        assert!(value["prompt"].as_str().unwrap().ends_with("Go on."));
    }

    #[test]
    fn decoder_handles_records_split_across_chunks() {
        let mut decoder = NdjsonDecoder::default();
        assert!(decoder.push(b"{\"response\":\"The \",").is_empty());
        let lines = decoder.push(b"\"done\":false}\n{\"response\":\"kn");
        assert_eq!(lines, vec!["{\"response\":\"The \",\"done\":false}".to_string()]);
        let lines = decoder.push(b"ight\",\"done\":false}\n\n");
        assert_eq!(lines.len(), 1);
        assert!(decoder.finish().is_none());
    }

    #[test]
    fn decoder_keeps_multibyte_characters_intact() {
        let record = "{\"response\":\"café\",\"done\":false}\n".as_bytes();
        let (head, tail) = record.split_at(17);
        let mut decoder = NdjsonDecoder::default();
        assert!(decoder.push(head).is_empty());
        let lines = decoder.push(tail);
        assert_eq!(
            interpret_record(&lines[0]),
            RecordOutcome::Fragment {
                text: "café".to_string(),
                done: false
            }
        );
    }

    #[test]
    fn interpret_record_classifies_lines() {
        assert_eq!(
            interpret_record(r#"{"response":"","done":true}"#),
            RecordOutcome::Fragment {
                text: String::new(),
                done: true
            }
        );
        assert_eq!(
            interpret_record(r#"{"error":"model not found"}"#),
            RecordOutcome::Failed("model not found".to_string())
        );
        assert_eq!(interpret_record("not json"), RecordOutcome::Malformed);
    }

    #[tokio::test]
    async fn relay_forwards_fragments_then_done() {
        let body = concat!(
            "{\"response\":\"The \",\"done\":false}\n",
            "garbage line\n",
            "{\"response\":\"knight \",\"done\":false}\n",
            "{\"response\":\"rode.\",\"done\":false}\n",
            "{\"response\":\"\",\"done\":true}\n",
            "{\"response\":\"ignored\",\"done\":false}\n",
        );
        let chunks = futures::stream::iter(
            body.as_bytes()
                .chunks(7)
                .map(|c| Ok::<_, String>(c.to_vec()))
                .collect::<Vec<_>>(),
        );
        let (tx, mut rx) = mpsc::channel(64);
        let summary = relay_ndjson(chunks, &tx).await;
        drop(tx);

        assert_eq!(summary, RelaySummary { fragments: 3, skipped: 1 });
        assert_eq!(
            collect(&mut rx).await,
            vec![
                StreamEvent::Token("The ".into()),
                StreamEvent::Token("knight ".into()),
                StreamEvent::Token("rode.".into()),
                StreamEvent::Done,
            ]
        );
    }

    #[tokio::test]
    async fn relay_keeps_partial_output_on_transport_error() {
        let chunks = futures::stream::iter(vec![
            Ok(b"{\"response\":\"Half \",\"done\":false}\n".to_vec()),
            Err("connection reset".to_string()),
            Ok(b"{\"response\":\"never\",\"done\":false}\n".to_vec()),
        ]);
        let (tx, mut rx) = mpsc::channel(8);
        relay_ndjson(chunks, &tx).await;
        drop(tx);

        assert_eq!(
            collect(&mut rx).await,
            vec![
                StreamEvent::Token("Half ".into()),
                StreamEvent::Error("connection reset".into()),
            ]
        );
    }

    #[tokio::test]
    async fn relay_treats_close_without_done_as_completion() {
        let chunks = futures::stream::iter(vec![Ok::<_, String>(
            b"{\"response\":\"tail\",\"done\":false}".to_vec(),
        )]);
        let (tx, mut rx) = mpsc::channel(8);
        relay_ndjson(chunks, &tx).await;
        drop(tx);

        assert_eq!(
            collect(&mut rx).await,
            vec![StreamEvent::Token("tail".into()), StreamEvent::Done]
        );
    }

    #[tokio::test]
    async fn unreachable_backend_yields_failed_result() {
        let client = OllamaClient::new(&LlmConfig {
            base_url: "http://127.0.0.1:9".to_string(),
            generation_timeout_secs: 2,
            ..LlmConfig::default()
        })
        .unwrap();
        let result = client
            .generate(&GenerationRequest::new("p", "s", WritingMode::CoAuthor))
            .await;
        assert!(!result.success);
        assert!(result.error.is_some());
        assert!(result.content.is_empty());
    }

    #[tokio::test]
    #[ignore] // needs a running Ollama; run with `cargo test --ignored`
    async fn live_generation_round_trip() {
        let client = OllamaClient::new(&LlmConfig::default()).unwrap();
        let result = client
            .generate(&GenerationRequest::new("Say hello.", "Be brief.", WritingMode::UserLead))
            .await;
        assert!(result.success, "error: {:?}", result.error);
    }
}
