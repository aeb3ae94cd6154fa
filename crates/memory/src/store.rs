//! Vector Store Adapter.
//!
//! Chunks are append-only.  Embedding happens before any lock is taken; the
//! write lock is held only for the in-memory push, so concurrent queries see
//! either the old or the new set of chunks and never wait on the network.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, info};

use narrative_core::Result;

use crate::chunk::{
    ChunkDraft, Collection, EmbeddedChunk, QueryFilter, RetrievedContext, content_hash,
    cosine_similarity,
};
use crate::chunk_log::ChunkLog;

/// Maps a text to its embedding.  Cloned freely; the future is `Send` so it
/// can be awaited from spawned tasks.
pub type EmbedFn =
    Arc<dyn Fn(String) -> Pin<Box<dyn Future<Output = Result<Vec<f32>>> + Send>> + Send + Sync>;

#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Embed and append `draft`.  Returns `false` when identical text is
    /// already stored for the same source in this collection.
    async fn upsert(&self, collection: Collection, draft: ChunkDraft) -> Result<bool>;

    /// Up to `k` hits matching `filter`, ordered by descending score.
    async fn query(
        &self,
        collection: Collection,
        text: &str,
        k: usize,
        filter: &QueryFilter,
    ) -> Result<Vec<RetrievedContext>>;
}

#[derive(Default)]
struct Shelves {
    chunks: HashMap<Collection, Vec<EmbeddedChunk>>,
    /// (collection, source, content hash) of everything stored.
    seen: HashSet<(Collection, uuid::Uuid, String)>,
}

impl Shelves {
    fn push(&mut self, chunk: EmbeddedChunk) -> bool {
        let key = (chunk.collection, chunk.source_entity_id, chunk.content_hash.clone());
        if !self.seen.insert(key) {
            return false;
        }
        self.chunks.entry(chunk.collection).or_default().push(chunk);
        true
    }

    fn contains(&self, collection: Collection, source: uuid::Uuid, hash: &str) -> bool {
        self.seen.contains(&(collection, source, hash.to_string()))
    }
}

/// Brute-force cosine store held in memory, optionally mirrored to a
/// [`ChunkLog`].
#[derive(Clone)]
pub struct InMemoryVectorStore {
    embed: EmbedFn,
    shelves: Arc<RwLock<Shelves>>,
    log: Option<ChunkLog>,
}

impl InMemoryVectorStore {
    pub fn new(embed: EmbedFn) -> Self {
        Self {
            embed,
            shelves: Arc::new(RwLock::new(Shelves::default())),
            log: None,
        }
    }

    /// Replay the chunk log at `path` and keep appending to it.
    pub fn open(embed: EmbedFn, path: impl AsRef<Path>) -> Result<Self> {
        let log = ChunkLog::new(path.as_ref());
        let mut shelves = Shelves::default();
        let mut replayed = 0usize;
        for chunk in log.load()? {
            if shelves.push(chunk) {
                replayed += 1;
            }
        }
        info!(chunks = replayed, path = %log.path().display(), "vector store replayed");
        Ok(Self {
            embed,
            shelves: Arc::new(RwLock::new(shelves)),
            log: Some(log),
        })
    }

    pub async fn len(&self, collection: Collection) -> usize {
        self.shelves
            .read()
            .await
            .chunks
            .get(&collection)
            .map_or(0, Vec::len)
    }

    pub async fn is_empty(&self) -> bool {
        self.shelves.read().await.chunks.values().all(Vec::is_empty)
    }
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    async fn upsert(&self, collection: Collection, draft: ChunkDraft) -> Result<bool> {
        let hash = content_hash(&draft.text);
        if self
            .shelves
            .read()
            .await
            .contains(collection, draft.source_entity_id, &hash)
        {
            debug!(%collection, source = %draft.source_entity_id, "chunk unchanged; skipping");
            return Ok(false);
        }

        let vector = (self.embed)(draft.text.clone()).await?;
        let chunk = EmbeddedChunk::from_draft(collection, draft, vector);

        let mut shelves = self.shelves.write().await;
        if shelves.contains(collection, chunk.source_entity_id, &chunk.content_hash) {
            return Ok(false);
        }
        if let Some(log) = &self.log {
            log.append(&chunk).await?;
        }
        Ok(shelves.push(chunk))
    }

    async fn query(
        &self,
        collection: Collection,
        text: &str,
        k: usize,
        filter: &QueryFilter,
    ) -> Result<Vec<RetrievedContext>> {
        if k == 0 || text.trim().is_empty() {
            return Ok(Vec::new());
        }
        let query_vec = (self.embed)(text.to_string()).await?;

        let shelves = self.shelves.read().await;
        let Some(chunks) = shelves.chunks.get(&collection) else {
            return Ok(Vec::new());
        };

        let mut scored: Vec<(f32, &EmbeddedChunk)> = chunks
            .iter()
            .filter(|chunk| filter.matches(chunk))
            .map(|chunk| (cosine_similarity(&chunk.vector, &query_vec), chunk))
            .collect();
        scored.sort_by(|a, b| b.0.total_cmp(&a.0));

        let mut seen_text = HashSet::new();
        let hits = scored
            .into_iter()
            .filter(|(_, chunk)| seen_text.insert(chunk.content_hash.as_str()))
            .take(k)
            .map(|(score, chunk)| RetrievedContext {
                collection,
                source_entity_id: chunk.source_entity_id,
                text: chunk.text.clone(),
                score,
                metadata: chunk.metadata.clone(),
            })
            .collect();
        Ok(hits)
    }
}
