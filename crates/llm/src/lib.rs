//! Text generation for the narrative engine.
//!
//! [`TextGenerator`] is the seam the orchestration layer talks to;
//! [`OllamaClient`] is the production backend.  Sampling parameters are a
//! pure function of [`WritingMode`].

pub mod generation;
pub mod json;
pub mod mode;
pub mod ollama;

pub use generation::{GenerationRequest, GenerationResult, StreamEvent, TextGenerator};
pub use json::extract_json_output;
pub use mode::{SamplingProfile, WritingMode};
pub use ollama::{
    GenerateOptions, NdjsonDecoder, OllamaClient, RecordOutcome, RelaySummary, interpret_record,
    relay_ndjson,
};
