use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Vector collections.  Each one holds chunks of a single source kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Collection {
    Chapters,
    Characters,
    Bible,
}

impl Collection {
    pub const ALL: [Collection; 3] = [Self::Chapters, Self::Characters, Self::Bible];

    pub fn slug(self) -> &'static str {
        match self {
            Self::Chapters => "chapters",
            Self::Characters => "characters",
            Self::Bible => "bible",
        }
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.slug())
    }
}

/// Text waiting to be embedded and appended.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkDraft {
    pub story_id: Option<Uuid>,
    pub source_entity_id: Uuid,
    pub text: String,
    pub metadata: BTreeMap<String, String>,
}

impl ChunkDraft {
    pub fn new(story_id: Option<Uuid>, source_entity_id: Uuid, text: impl Into<String>) -> Self {
        Self {
            story_id,
            source_entity_id,
            text: text.into(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_meta(mut self, key: &str, value: impl Into<String>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }
}

/// A stored, embedded chunk.  Never mutated once appended; newer chunks for
/// the same source simply sit alongside older ones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddedChunk {
    pub id: Uuid,
    pub collection: Collection,
    #[serde(default)]
    pub story_id: Option<Uuid>,
    pub source_entity_id: Uuid,
    pub text: String,
    pub vector: Vec<f32>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    pub content_hash: String,
    pub created_at: DateTime<Utc>,
}

impl EmbeddedChunk {
    pub fn from_draft(collection: Collection, draft: ChunkDraft, vector: Vec<f32>) -> Self {
        Self {
            id: Uuid::new_v4(),
            collection,
            story_id: draft.story_id,
            source_entity_id: draft.source_entity_id,
            content_hash: content_hash(&draft.text),
            text: draft.text,
            vector,
            metadata: draft.metadata,
            created_at: Utc::now(),
        }
    }
}

/// One retrieval hit.  `score` is cosine similarity clamped to `[0, 1]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievedContext {
    pub collection: Collection,
    pub source_entity_id: Uuid,
    pub text: String,
    pub score: f32,
    pub metadata: BTreeMap<String, String>,
}

/// Restricts which chunks a query may return.  Empty fields match anything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryFilter {
    pub story_id: Option<Uuid>,
    pub exclude_source: Option<Uuid>,
    pub source_in: Vec<Uuid>,
    pub equals: BTreeMap<String, String>,
}

impl QueryFilter {
    pub fn for_story(story_id: Uuid) -> Self {
        Self {
            story_id: Some(story_id),
            ..Self::default()
        }
    }

    pub fn excluding(mut self, source: Option<Uuid>) -> Self {
        self.exclude_source = source;
        self
    }

    pub fn sources(mut self, ids: &[Uuid]) -> Self {
        self.source_in = ids.to_vec();
        self
    }

    pub fn matches(&self, chunk: &EmbeddedChunk) -> bool {
        if self.story_id.is_some() && chunk.story_id != self.story_id {
            return false;
        }
        if self.exclude_source == Some(chunk.source_entity_id) {
            return false;
        }
        if !self.source_in.is_empty() && !self.source_in.contains(&chunk.source_entity_id) {
            return false;
        }
        self.equals
            .iter()
            .all(|(key, value)| chunk.metadata.get(key) == Some(value))
    }
}

/// Hex SHA-256 of the chunk text, used to skip identical re-appends.
pub fn content_hash(text: &str) -> String {
    let digest = Sha256::digest(text.as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let mag_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let mag_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if mag_a == 0.0 || mag_b == 0.0 {
        return 0.0;
    }
    (dot / (mag_a * mag_b)).clamp(0.0, 1.0)
}
