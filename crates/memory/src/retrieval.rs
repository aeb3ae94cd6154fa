//! Retrieval Aggregator: concurrent fan-out over the three collections.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::chunk::{Collection, QueryFilter, RetrievedContext};
use crate::store::VectorStore;

/// Hits below this score never reach prompt assembly.
pub const DEFAULT_RELEVANCE_THRESHOLD: f32 = 0.3;

/// Retrieval results grouped by collection, each ordered by descending score.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AggregatedContext {
    pub chapters: Vec<RetrievedContext>,
    pub characters: Vec<RetrievedContext>,
    pub bible: Vec<RetrievedContext>,
}

impl AggregatedContext {
    /// Keep only hits with `score >= threshold`.
    pub fn above_threshold(mut self, threshold: f32) -> Self {
        for hits in [&mut self.chapters, &mut self.characters, &mut self.bible] {
            hits.retain(|hit| hit.score >= threshold);
        }
        self
    }

    pub fn len(&self) -> usize {
        self.chapters.len() + self.characters.len() + self.bible.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Clone)]
pub struct RetrievalAggregator {
    store: Arc<dyn VectorStore>,
    top_k: usize,
    branch_timeout: Duration,
}

impl RetrievalAggregator {
    pub fn new(store: Arc<dyn VectorStore>, top_k: usize, branch_timeout: Duration) -> Self {
        Self {
            store,
            top_k,
            branch_timeout,
        }
    }

    /// Query all collections concurrently.  A failing or slow collection
    /// contributes nothing; the others are unaffected.
    pub async fn retrieve_all(
        &self,
        story_id: Uuid,
        query: &str,
        character_ids: &[Uuid],
        exclude_chapter_id: Option<Uuid>,
    ) -> AggregatedContext {
        if query.trim().is_empty() {
            return AggregatedContext::default();
        }

        let chapter_filter = QueryFilter::for_story(story_id).excluding(exclude_chapter_id);
        let character_filter = QueryFilter::for_story(story_id).sources(character_ids);
        let bible_filter = QueryFilter::for_story(story_id);

        let (chapters, characters, bible) = tokio::join!(
            self.branch(Collection::Chapters, query, &chapter_filter),
            self.branch(Collection::Characters, query, &character_filter),
            self.branch(Collection::Bible, query, &bible_filter),
        );

        debug!(
            %story_id,
            chapters = chapters.len(),
            characters = characters.len(),
            bible = bible.len(),
            "retrieval complete"
        );
        AggregatedContext {
            chapters,
            characters,
            bible,
        }
    }

    async fn branch(
        &self,
        collection: Collection,
        query: &str,
        filter: &QueryFilter,
    ) -> Vec<RetrievedContext> {
        let lookup = self.store.query(collection, query, self.top_k, filter);
        match tokio::time::timeout(self.branch_timeout, lookup).await {
            Ok(Ok(hits)) => hits,
            Ok(Err(err)) => {
                warn!(%collection, %err, "retrieval branch failed; continuing without it");
                Vec::new()
            }
            Err(_) => {
                warn!(%collection, timeout_ms = self.branch_timeout.as_millis() as u64, "retrieval branch timed out");
                Vec::new()
            }
        }
    }
}
