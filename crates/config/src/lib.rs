use std::env;
use std::fs;
use std::path::Path;

use anyhow::{Result, ensure};
use serde::{Deserialize, Serialize};

// ── Generation backend ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Base URL for the Ollama-compatible API.  Overridden at runtime by the
    /// `OLLAMA_BASE_URL` environment variable when set.
    pub base_url: String,
    pub model: String,
    /// Model used for `/api/embeddings`.  Overridden by `OLLAMA_EMBED_MODEL`.
    pub embedding_model: String,
    /// Ceiling applied when a generation request does not name its own
    /// `max_tokens`.
    pub max_tokens_per_generation: u32,
    /// Generation is slow; this timeout covers the whole request including
    /// the body of a streaming response.
    pub generation_timeout_secs: u64,
    /// Short timeout for embedding calls.
    pub embedding_timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434".to_string(),
            model: "llama3.1:8b".to_string(),
            embedding_model: "nomic-embed-text".to_string(),
            max_tokens_per_generation: 2000,
            generation_timeout_secs: 600,
            embedding_timeout_secs: 10,
        }
    }
}

// ── Retrieval ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    /// Maximum hits returned per collection.
    pub top_k: usize,
    /// Hits scoring below this are dropped before prompt assembly.
    pub relevance_threshold: f32,
    /// Per-collection query timeout.
    pub timeout_secs: u64,
    /// Trailing characters of the chapter shown to the model as recent text.
    pub recent_window_chars: usize,
    /// Trailing characters of the recent window used as the retrieval query.
    pub query_window_chars: usize,
    /// Upper bound on the size of one chapter chunk when indexing.
    pub chunk_size_chars: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: 5,
            relevance_threshold: 0.3,
            timeout_secs: 10,
            recent_window_chars: 2000,
            query_window_chars: 500,
            chunk_size_chars: 1200,
        }
    }
}

// ── Consistency analysis ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsistencyConfig {
    pub full_max_tokens: u32,
    pub quick_max_tokens: u32,
    pub full_timeout_secs: u64,
    /// Must stay below `full_timeout_secs`; quick checks back the editor's
    /// live feedback.  Enforced by [`ConsistencyConfig::validate`].
    pub quick_timeout_secs: u64,
}

impl ConsistencyConfig {
    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.quick_timeout_secs < self.full_timeout_secs,
            "consistency.quick_timeout_secs ({}) must be below consistency.full_timeout_secs ({})",
            self.quick_timeout_secs,
            self.full_timeout_secs
        );
        Ok(())
    }
}

impl Default for ConsistencyConfig {
    fn default() -> Self {
        Self {
            full_max_tokens: 1000,
            quick_max_tokens: 400,
            full_timeout_secs: 300,
            quick_timeout_secs: 45,
        }
    }
}

// ── Storage ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// JSON archive holding stories, chapters, characters, plotlines and bibles.
    pub archive_path: String,
    /// Append-only JSONL log of embedded chunks.
    pub chunk_log_path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            archive_path: ".narrative/archive.json".to_string(),
            chunk_log_path: ".narrative/chunks.jsonl".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub log_level: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub llm: LlmConfig,
    pub retrieval: RetrievalConfig,
    pub consistency: ConsistencyConfig,
    pub storage: StorageConfig,
    pub telemetry: TelemetryConfig,
}

impl AppConfig {
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let mut config = Self::default();
        if let Ok(raw) = fs::read_to_string(path) {
            config = toml::from_str(&raw)?;
        }

        if let Ok(value) = env::var("OLLAMA_BASE_URL") {
            if !value.is_empty() {
                config.llm.base_url = value;
            }
        }
        if let Ok(value) = env::var("OLLAMA_MODEL") {
            if !value.is_empty() {
                config.llm.model = value;
            }
        }
        if let Ok(value) = env::var("OLLAMA_EMBED_MODEL") {
            if !value.is_empty() {
                config.llm.embedding_model = value;
            }
        }

        config.consistency.validate()?;
        Ok(config)
    }

    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }

        let rendered = toml::to_string_pretty(self)?;
        fs::write(path, rendered)?;
        Ok(())
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.llm.base_url, "http://localhost:11434");
        assert_eq!(cfg.llm.model, "llama3.1:8b");
        assert_eq!(cfg.llm.max_tokens_per_generation, 2000);
        assert_eq!(cfg.retrieval.top_k, 5);
        assert!((cfg.retrieval.relevance_threshold - 0.3).abs() < f32::EPSILON);
        assert_eq!(cfg.retrieval.recent_window_chars, 2000);
        assert_eq!(cfg.retrieval.query_window_chars, 500);
        assert_eq!(cfg.telemetry.log_level, "info");
    }

    #[test]
    fn generation_timeout_is_longer_than_retrieval_timeouts() {
        let cfg = AppConfig::default();
        assert!(cfg.llm.generation_timeout_secs > cfg.llm.embedding_timeout_secs);
        assert!(cfg.llm.generation_timeout_secs > cfg.retrieval.timeout_secs);
    }

    #[test]
    fn quick_check_budget_is_below_full_analysis() {
        let cfg = ConsistencyConfig::default();
        assert!(cfg.quick_timeout_secs < cfg.full_timeout_secs);
        assert!(cfg.quick_max_tokens < cfg.full_max_tokens);
    }

    // ── load_from ──────────────────────────────────────────────────────────

    #[test]
    fn load_from_missing_file_returns_defaults() {
        let dir = TempDir::new().unwrap();
        let cfg = AppConfig::load_from(dir.path().join("nonexistent.toml")).unwrap();
        assert_eq!(cfg.retrieval.top_k, 5);
        assert_eq!(cfg.storage.archive_path, ".narrative/archive.json");
    }

    #[test]
    fn load_from_partial_toml_fills_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("partial.toml");
        fs::write(
            &path,
            r#"
[retrieval]
top_k = 8
relevance_threshold = 0.45

[consistency]
quick_timeout_secs = 10
"#,
        )
        .unwrap();

        let cfg = AppConfig::load_from(&path).unwrap();
        assert_eq!(cfg.retrieval.top_k, 8);
        assert!((cfg.retrieval.relevance_threshold - 0.45).abs() < f32::EPSILON);
        assert_eq!(cfg.retrieval.chunk_size_chars, 1200);
        assert_eq!(cfg.consistency.quick_timeout_secs, 10);
        assert_eq!(cfg.consistency.full_max_tokens, 1000);
    }

    #[test]
    fn load_from_invalid_toml_returns_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.toml");
        fs::write(&path, "this is not valid toml {{{{").unwrap();
        assert!(AppConfig::load_from(&path).is_err());
    }

    #[test]
    fn load_from_rejects_quick_timeout_not_below_full() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("slow_quick.toml");
        fs::write(
            &path,
            "[consistency]\nfull_timeout_secs = 30\nquick_timeout_secs = 30\n",
        )
        .unwrap();

        let err = AppConfig::load_from(&path).unwrap_err();
        assert!(err.to_string().contains("quick_timeout_secs"));
    }

    #[test]
    fn save_and_reload_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested/dir/config.toml");

        let mut cfg = AppConfig::default();
        cfg.llm.embedding_model = "mxbai-embed-large".to_string();
        cfg.storage.chunk_log_path = "/tmp/chunks.jsonl".to_string();
        cfg.save_to(&path).unwrap();
        assert!(path.exists());

        let loaded = AppConfig::load_from(&path).unwrap();
        assert_eq!(loaded.llm.embedding_model, "mxbai-embed-large");
        assert_eq!(loaded.storage.chunk_log_path, "/tmp/chunks.jsonl");
    }

    // ── Env var overrides ──────────────────────────────────────────────────

    #[test]
    fn env_overrides_backend_settings() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("env.toml");
        fs::write(
            &path,
            r#"
[llm]
base_url = "http://from-file:11434"
model = "file-model"
"#,
        )
        .unwrap();

        // SAFETY: test is single-threaded for these env vars.
        unsafe {
            env::set_var("OLLAMA_BASE_URL", "http://from-env:11434");
            env::set_var("OLLAMA_MODEL", "env-model");
        }
        let cfg = AppConfig::load_from(&path).unwrap();
        unsafe {
            env::remove_var("OLLAMA_BASE_URL");
            env::remove_var("OLLAMA_MODEL");
        }
        assert_eq!(cfg.llm.base_url, "http://from-env:11434");
        assert_eq!(cfg.llm.model, "env-model");
    }
}
