//! Embedding wiring and best-effort re-indexing after chapter writes.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use narrative_core::Chapter;
use narrative_llm::OllamaClient;
use narrative_memory::{EmbedFn, Indexer};

/// Embedding function backed by the Ollama embeddings endpoint.
pub fn ollama_embed_fn(client: Arc<OllamaClient>) -> EmbedFn {
    Arc::new(move |text: String| {
        let client = Arc::clone(&client);
        Box::pin(async move { client.embed(&text).await })
    })
}

/// Work that outlives the call that started it.  Clones share one set, so
/// whoever owns the process can wait for everything before exiting.
#[derive(Clone, Default)]
pub struct BackgroundTasks {
    inner: Arc<Mutex<JoinSet<()>>>,
}

impl BackgroundTasks {
    pub fn new() -> Self {
        Self::default()
    }

    fn set(&self) -> MutexGuard<'_, JoinSet<()>> {
        // A panic while holding the lock cannot leave the set half-updated.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut set = self.set();
        while set.try_join_next().is_some() {}
        set.spawn(task);
    }

    /// Tasks spawned and not yet reaped.
    pub fn pending(&self) -> usize {
        self.set().len()
    }

    /// Wait until every task has finished, including ones spawned while
    /// waiting.
    pub async fn drain(&self) {
        loop {
            let mut batch = std::mem::take(&mut *self.set());
            if batch.is_empty() {
                return;
            }
            debug!(tasks = batch.len(), "waiting for background work");
            while let Some(joined) = batch.join_next().await {
                if let Err(err) = joined {
                    warn!(%err, "background task did not complete");
                }
            }
        }
    }
}

/// Re-embed `chapter` in the background.  Failures are logged and swallowed;
/// the chapter write that triggered this is never undone.
pub fn schedule_chapter_reindex(
    tasks: &BackgroundTasks,
    indexer: Indexer,
    chapter: Chapter,
    character_names: Vec<String>,
) {
    tasks.spawn(async move {
        match indexer.index_chapter(&chapter, &character_names).await {
            Ok(appended) => info!(chapter_id = %chapter.id, appended, "chapter re-indexed"),
            Err(err) => warn!(chapter_id = %chapter.id, %err, "chapter re-index failed; search index is stale"),
        }
    });
}
