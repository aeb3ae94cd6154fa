//! `StoryRuntime`: the orchestration layer every caller goes through.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use narrative_config::{AppConfig, RetrievalConfig};
use narrative_consistency::{AnalysisInputs, ConsistencyEngine, ConsistencyIssue, ConsistencyReport};
use narrative_core::{
    ArchiveStore, EntityKind, EntityStore, NarrativeError, Result, StoryStats, story_stats,
};
use narrative_llm::{GenerationRequest, OllamaClient, TextGenerator, WritingMode, extract_json_output};
use narrative_memory::{AggregatedContext, InMemoryVectorStore, Indexer, RetrievalAggregator, VectorStore};
use narrative_prompt::{
    BrainstormKind, ContinuationInputs, ImageKind, PromptParts, SummaryKind,
    build_bible_extraction_prompt, build_bible_update_prompt, build_brainstorm_prompt,
    build_character_analysis_prompt, build_continuation_prompt, build_dialogue_prompt,
    build_image_prompt, build_recap_prompt, build_rewrite_prompt, build_summary_prompt,
    tail_chars,
};

use crate::reindex::{BackgroundTasks, ollama_embed_fn, schedule_chapter_reindex};
use crate::session::{PersistTarget, StreamHandle, persist, spawn_session};

const BRAINSTORM_MAX_TOKENS: u32 = 1500;
const RECAP_MAX_TOKENS: u32 = 2000;
const BIBLE_MAX_TOKENS: u32 = 3000;
const CHARACTER_ANALYSIS_MAX_TOKENS: u32 = 1000;
const IMAGE_PROMPT_MAX_TOKENS: u32 = 500;
const BIBLE_UPDATE_MAX_TOKENS: u32 = 1500;

/// Caller's request to continue a chapter.
#[derive(Debug, Clone, PartialEq)]
pub struct ContinueRequest {
    pub story_id: Uuid,
    pub chapter_id: Uuid,
    pub mode: WritingMode,
    pub user_direction: Option<String>,
    pub word_target: u32,
    pub temperature: Option<f32>,
}

impl ContinueRequest {
    pub fn new(story_id: Uuid, chapter_id: Uuid, mode: WritingMode) -> Self {
        Self {
            story_id,
            chapter_id,
            mode,
            user_direction: None,
            word_target: 500,
            temperature: None,
        }
    }
}

/// Text produced by a successful blocking generation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Generated {
    pub content: String,
    pub tokens_used: u64,
    pub latency_ms: u64,
    pub model: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Continuation {
    pub generated: Generated,
    pub mode: WritingMode,
    pub chapter_word_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Recap {
    pub recap: String,
    pub story_title: String,
    pub chapter_count: usize,
    pub character_count: usize,
    pub word_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BibleExtraction {
    pub raw: String,
    /// Present iff `parsed`.
    pub bible: Option<serde_json::Value>,
    pub parsed: bool,
}

/// Additions to an existing story bible.  The bible itself is not modified.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BibleUpdate {
    pub raw: String,
    /// Present iff `parsed`.
    pub updates: Option<serde_json::Value>,
    pub parsed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImagePrompt {
    pub image_prompt: String,
    #[serde(rename = "type")]
    pub kind: ImageKind,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IndexSummary {
    pub chapters: usize,
    pub characters: usize,
    pub bible_entries: usize,
    pub failures: usize,
}

/// Continuation prompt plus what the post-generation write needs.
struct Prepared {
    request: GenerationRequest,
    target: PersistTarget,
}

#[derive(Clone)]
pub struct StoryRuntime {
    store: Arc<dyn EntityStore>,
    generator: Arc<dyn TextGenerator>,
    indexer: Indexer,
    aggregator: RetrievalAggregator,
    consistency: ConsistencyEngine,
    retrieval: RetrievalConfig,
    tasks: BackgroundTasks,
}

impl StoryRuntime {
    pub fn new(
        config: &AppConfig,
        store: Arc<dyn EntityStore>,
        generator: Arc<dyn TextGenerator>,
        vectors: Arc<dyn VectorStore>,
    ) -> Self {
        let retrieval = config.retrieval.clone();
        Self {
            indexer: Indexer::new(Arc::clone(&vectors), retrieval.chunk_size_chars),
            aggregator: RetrievalAggregator::new(
                vectors,
                retrieval.top_k,
                Duration::from_secs(retrieval.timeout_secs),
            ),
            consistency: ConsistencyEngine::new(Arc::clone(&generator), config.consistency.clone()),
            store,
            generator,
            retrieval,
            tasks: BackgroundTasks::new(),
        }
    }

    /// Production wiring: archive store, Ollama generator and embedder, and
    /// the JSONL-backed vector store.
    pub async fn from_config(config: &AppConfig) -> Result<Self> {
        let client = Arc::new(OllamaClient::new(&config.llm)?);
        let store = ArchiveStore::open(&config.storage.archive_path).await?;
        let vectors = InMemoryVectorStore::open(
            ollama_embed_fn(Arc::clone(&client)),
            &config.storage.chunk_log_path,
        )?;
        Ok(Self::new(config, Arc::new(store), client, Arc::new(vectors)))
    }

    pub fn model_name(&self) -> &str {
        self.generator.model_name()
    }

    /// Wait for streaming sessions and re-index jobs started by this runtime
    /// (or any clone of it).  Call before the process exits; work still in
    /// flight when the async runtime shuts down is lost.
    pub async fn drain(&self) {
        self.tasks.drain().await;
    }

    async fn prepare(&self, req: &ContinueRequest) -> Result<Prepared> {
        let story = self.store.story(req.story_id).await?;
        let chapter = self.store.chapter(req.chapter_id).await?;
        if chapter.story_id != story.id {
            return Err(NarrativeError::not_found(EntityKind::Chapter, req.chapter_id));
        }
        let (characters, plotlines, bible) = tokio::try_join!(
            self.store.characters(story.id),
            self.store.plotlines(story.id),
            self.store.story_bible(story.id),
        )?;

        let recent = tail_chars(&chapter.content, self.retrieval.recent_window_chars);
        let character_ids: Vec<Uuid> = characters.iter().map(|c| c.id).collect();
        let retrieved = if recent.trim().is_empty() {
            AggregatedContext::default()
        } else {
            let query = tail_chars(recent, self.retrieval.query_window_chars);
            self.aggregator
                .retrieve_all(story.id, query, &character_ids, Some(chapter.id))
                .await
                .above_threshold(self.retrieval.relevance_threshold)
        };
        info!(
            story_id = %story.id,
            chapter_id = %chapter.id,
            chapters = retrieved.chapters.len(),
            characters = retrieved.characters.len(),
            bible = retrieved.bible.len(),
            "context retrieved"
        );

        let parts = build_continuation_prompt(&ContinuationInputs {
            story: &story,
            chapter: &chapter,
            characters: &characters,
            plotlines: &plotlines,
            story_bible: bible.as_ref(),
            recent_content: recent,
            retrieved: &retrieved,
            mode: req.mode,
            user_direction: req.user_direction.as_deref(),
            word_target: req.word_target,
        });
        let request = GenerationRequest::new(parts.user_prompt, parts.system_prompt, req.mode)
            .with_context(parts.context)
            .with_max_tokens(req.word_target.saturating_mul(2))
            .with_temperature(req.temperature);

        Ok(Prepared {
            request,
            target: PersistTarget {
                story_id: story.id,
                chapter_id: chapter.id,
                character_names: characters.into_iter().map(|c| c.name).collect(),
            },
        })
    }

    /// Generate, append to the chapter, commit, then re-index in the
    /// background.  A failed or empty generation leaves the chapter untouched.
    #[instrument(skip(self), fields(story_id = %req.story_id, chapter_id = %req.chapter_id, mode = req.mode.slug()))]
    pub async fn continue_chapter(&self, req: &ContinueRequest) -> Result<Continuation> {
        let prepared = self.prepare(req).await?;
        let generated = self.generate(&prepared.request).await?;
        if generated.content.trim().is_empty() {
            warn!(tokens_used = generated.tokens_used, "backend returned an empty continuation");
            return Err(NarrativeError::MalformedBackendResponse(
                "continuation was empty".to_string(),
            ));
        }

        let chapter = persist(self.store.as_ref(), prepared.target.chapter_id, &generated.content).await?;
        schedule_chapter_reindex(
            &self.tasks,
            self.indexer.clone(),
            chapter.clone(),
            prepared.target.character_names,
        );

        Ok(Continuation {
            generated,
            mode: req.mode,
            chapter_word_count: chapter.word_count,
        })
    }

    /// Start a streaming continuation.  Preparation errors are returned
    /// before any frame is produced.
    #[instrument(skip(self), fields(story_id = %req.story_id, chapter_id = %req.chapter_id, mode = req.mode.slug()))]
    pub async fn continue_chapter_stream(&self, req: &ContinueRequest) -> Result<StreamHandle> {
        let prepared = self.prepare(req).await?;
        Ok(spawn_session(
            &self.tasks,
            Arc::clone(&self.generator),
            Arc::clone(&self.store),
            self.indexer.clone(),
            prepared.request,
            prepared.target,
        ))
    }

    #[instrument(skip(self, text, instructions), fields(story_id = %story_id))]
    pub async fn rewrite(
        &self,
        story_id: Uuid,
        text: &str,
        instructions: &str,
        mode: WritingMode,
    ) -> Result<Generated> {
        let story = self.store.story(story_id).await?;
        let characters = self.store.characters(story_id).await?;
        let parts = build_rewrite_prompt(&story, text, instructions, &characters, mode);
        self.generate(&request_from(parts, mode)).await
    }

    #[instrument(skip(self, scene_context, situation))]
    pub async fn dialogue(
        &self,
        character_id: Uuid,
        other_character_ids: &[Uuid],
        scene_context: &str,
        situation: &str,
        mode: WritingMode,
    ) -> Result<Generated> {
        let character = self.store.character(character_id).await?;
        let mut others = Vec::with_capacity(other_character_ids.len());
        for id in other_character_ids {
            match self.store.character(*id).await {
                Ok(other) => others.push(other),
                Err(NarrativeError::NotFound { .. }) => {
                    warn!(character_id = %id, "skipping unknown character in dialogue scene");
                }
                Err(err) => return Err(err),
            }
        }
        let parts = build_dialogue_prompt(&character, scene_context, &others, situation, mode);
        self.generate(&request_from(parts, mode)).await
    }

    /// Always creative: brainstorming runs in AI-lead mode.
    #[instrument(skip(self, current_context, specific_request), fields(story_id = %story_id, kind = %kind))]
    pub async fn brainstorm(
        &self,
        story_id: Uuid,
        kind: BrainstormKind,
        current_context: Option<&str>,
        specific_request: Option<&str>,
    ) -> Result<Generated> {
        let story = self.store.story(story_id).await?;
        let parts = build_brainstorm_prompt(&story, kind, current_context, specific_request);
        let request = request_from(parts, WritingMode::AiLead).with_max_tokens(BRAINSTORM_MAX_TOKENS);
        self.generate(&request).await
    }

    #[instrument(skip(self, content), fields(kind = kind.slug()))]
    pub async fn summarize(&self, content: &str, kind: SummaryKind) -> Result<Generated> {
        let parts = build_summary_prompt(content, kind);
        self.generate(&request_from(parts, WritingMode::UserLead)).await
    }

    #[instrument(skip(self), fields(story_id = %story_id))]
    pub async fn recap(&self, story_id: Uuid) -> Result<Recap> {
        let story = self.store.story(story_id).await?;
        let (chapters, characters, plotlines) = tokio::try_join!(
            self.store.chapters(story_id),
            self.store.characters(story_id),
            self.store.plotlines(story_id),
        )?;
        let parts = build_recap_prompt(&story, &chapters, &characters, &plotlines);
        let request = request_from(parts, WritingMode::UserLead).with_max_tokens(RECAP_MAX_TOKENS);
        let generated = self.generate(&request).await?;

        Ok(Recap {
            recap: generated.content,
            story_title: story.title,
            chapter_count: chapters.len(),
            character_count: characters.len(),
            word_count: chapters.iter().map(|c| c.word_count).sum(),
        })
    }

    /// Ask the model for a JSON story bible.  An unparsable reply is
    /// reported with `parsed = false`, not as an error.
    #[instrument(skip(self), fields(story_id = %story_id))]
    pub async fn extract_story_bible(&self, story_id: Uuid) -> Result<BibleExtraction> {
        let story = self.store.story(story_id).await?;
        let (chapters, characters) = tokio::try_join!(
            self.store.chapters(story_id),
            self.store.characters(story_id),
        )?;
        let content = chapters
            .iter()
            .filter(|c| !c.content.trim().is_empty())
            .map(|c| format!("Chapter {}: {}\n{}", c.number, c.title, c.content))
            .collect::<Vec<_>>()
            .join("\n\n");

        let parts = build_bible_extraction_prompt(&story, &content, &characters);
        let request = request_from(parts, WritingMode::UserLead).with_max_tokens(BIBLE_MAX_TOKENS);
        let generated = self.generate(&request).await?;

        let bible = extract_json_output::<serde_json::Value>(&generated.content).filter(|v| v.is_object());
        if bible.is_none() {
            warn!(%story_id, "story bible reply was not a JSON object");
        }
        Ok(BibleExtraction {
            parsed: bible.is_some(),
            bible,
            raw: generated.content,
        })
    }

    /// Ask which locations, rules, terms, themes and facts in `new_content`
    /// the stored bible does not already have.
    #[instrument(skip(self, new_content), fields(story_id = %story_id))]
    pub async fn update_story_bible(&self, story_id: Uuid, new_content: &str) -> Result<BibleUpdate> {
        let (story, existing) = tokio::try_join!(
            self.store.story(story_id),
            self.store.story_bible(story_id),
        )?;
        let parts = build_bible_update_prompt(&story, new_content, existing.as_ref());
        let request =
            request_from(parts, WritingMode::UserLead).with_max_tokens(BIBLE_UPDATE_MAX_TOKENS);
        let generated = self.generate(&request).await?;

        let updates =
            extract_json_output::<serde_json::Value>(&generated.content).filter(|v| v.is_object());
        if updates.is_none() {
            warn!(%story_id, "bible update reply was not a JSON object");
        }
        Ok(BibleUpdate {
            parsed: updates.is_some(),
            updates,
            raw: generated.content,
        })
    }

    #[instrument(skip(self, description, style), fields(kind = %kind))]
    pub async fn image_prompt(
        &self,
        description: &str,
        kind: ImageKind,
        style: Option<&str>,
    ) -> Result<ImagePrompt> {
        let parts = build_image_prompt(description, kind, style);
        let request =
            request_from(parts, WritingMode::UserLead).with_max_tokens(IMAGE_PROMPT_MAX_TOKENS);
        let generated = self.generate(&request).await?;
        Ok(ImagePrompt {
            image_prompt: generated.content.trim().to_string(),
            kind,
        })
    }

    #[instrument(skip(self, content), fields(character_id = %character_id))]
    pub async fn analyze_character(&self, character_id: Uuid, content: &str) -> Result<Generated> {
        let character = self.store.character(character_id).await?;
        let parts = build_character_analysis_prompt(&character, content);
        let request =
            request_from(parts, WritingMode::UserLead).with_max_tokens(CHARACTER_ANALYSIS_MAX_TOKENS);
        self.generate(&request).await
    }

    #[instrument(skip(self, content), fields(story_id = %story_id))]
    pub async fn check_consistency(
        &self,
        story_id: Uuid,
        content: &str,
        chapter_id: Option<Uuid>,
    ) -> Result<ConsistencyReport> {
        let story = self.store.story(story_id).await?;
        let (characters, plotlines, bible, chapters) = tokio::try_join!(
            self.store.characters(story_id),
            self.store.plotlines(story_id),
            self.store.story_bible(story_id),
            self.store.chapters(story_id),
        )?;
        let current = match chapter_id {
            Some(id) => Some(self.store.chapter(id).await?),
            None => None,
        };
        self.consistency
            .analyze(&AnalysisInputs {
                content,
                story: &story,
                characters: &characters,
                plotlines: &plotlines,
                story_bible: bible.as_ref(),
                previous_chapters: &chapters,
                current_chapter: current.as_ref(),
            })
            .await
    }

    #[instrument(skip(self, content), fields(story_id = %story_id))]
    pub async fn quick_check(&self, story_id: Uuid, content: &str) -> Result<Vec<ConsistencyIssue>> {
        let story = self.store.story(story_id).await?;
        let characters = self.store.characters(story_id).await?;
        Ok(self.consistency.quick_check(content, &characters, &story).await)
    }

    pub async fn story_stats(&self, story_id: Uuid) -> Result<StoryStats> {
        let story = self.store.story(story_id).await?;
        let (chapters, characters, plotlines) = tokio::try_join!(
            self.store.chapters(story_id),
            self.store.characters(story_id),
            self.store.plotlines(story_id),
        )?;
        Ok(story_stats(&story, &chapters, &characters, &plotlines))
    }

    /// Index every chapter, character and world rule of a story.  Individual
    /// failures are counted and logged; the rest still get indexed.
    #[instrument(skip(self), fields(story_id = %story_id))]
    pub async fn index_story(&self, story_id: Uuid) -> Result<IndexSummary> {
        self.store.story(story_id).await?;
        let (chapters, characters, bible) = tokio::try_join!(
            self.store.chapters(story_id),
            self.store.characters(story_id),
            self.store.story_bible(story_id),
        )?;
        let names: Vec<String> = characters.iter().map(|c| c.name.clone()).collect();
        let mut summary = IndexSummary::default();

        for chapter in &chapters {
            match self.indexer.index_chapter(chapter, &names).await {
                Ok(n) => summary.chapters += n,
                Err(err) => {
                    warn!(chapter_id = %chapter.id, %err, "chapter not indexed");
                    summary.failures += 1;
                }
            }
        }
        for character in &characters {
            match self.indexer.index_character(character).await {
                Ok(n) => summary.characters += n,
                Err(err) => {
                    warn!(character = %character.name, %err, "character not indexed");
                    summary.failures += 1;
                }
            }
        }
        if let Some(bible) = &bible {
            match self.indexer.index_bible(bible).await {
                Ok(n) => summary.bible_entries += n,
                Err(err) => {
                    warn!(%err, "story bible not indexed");
                    summary.failures += 1;
                }
            }
        }
        info!(
            chapters = summary.chapters,
            characters = summary.characters,
            bible = summary.bible_entries,
            failures = summary.failures,
            "story indexed"
        );
        Ok(summary)
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<Generated> {
        let result = self.generator.generate(request).await;
        if !result.success {
            return Err(NarrativeError::BackendUnavailable(
                result.error.unwrap_or_else(|| "generation failed".to_string()),
            ));
        }
        Ok(Generated {
            content: result.content,
            tokens_used: result.tokens_used,
            latency_ms: result.latency_ms,
            model: result.model,
        })
    }
}

fn request_from(parts: PromptParts, mode: WritingMode) -> GenerationRequest {
    GenerationRequest::new(parts.user_prompt, parts.system_prompt, mode).with_context(parts.context)
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use narrative_core::{Chapter, StoryArchive};
    use narrative_memory::{Collection, InMemoryVectorStore};

    use super::*;
    use crate::frame::StreamFrame;
    use crate::session::SessionState;
    use crate::testkit::{
        Fixture, ScriptedGenerator, fixture, letter_embed, slow_letter_embed, tokens,
    };

    fn runtime(archive: StoryArchive, generator: Arc<ScriptedGenerator>) -> (StoryRuntime, ArchiveStore) {
        let store = ArchiveStore::from_archive(archive);
        let rt = StoryRuntime::new(
            &AppConfig::default(),
            Arc::new(store.clone()),
            generator,
            Arc::new(InMemoryVectorStore::new(letter_embed())),
        );
        (rt, store)
    }

    fn continue_req(f: &Fixture) -> ContinueRequest {
        ContinueRequest {
            word_target: 300,
            ..ContinueRequest::new(f.story_id, f.chapter_id, WritingMode::UserLead)
        }
    }

    #[tokio::test]
    async fn continue_chapter_appends_and_shapes_the_request() {
        let f = fixture();
        let generator = ScriptedGenerator::replying("The knight rode.");
        let (rt, store) = runtime(f.archive.clone(), generator.clone());

        let mut req = continue_req(&f);
        req.user_direction = Some("Ren hears wolves.".to_string());
        req.temperature = Some(0.5);
        let out = rt.continue_chapter(&req).await.unwrap();

        assert_eq!(out.generated.content, "The knight rode.");
        assert_eq!(out.mode, WritingMode::UserLead);
        let chapter = store.chapter(f.chapter_id).await.unwrap();
        assert_eq!(chapter.content, "Night fell over the keep.\n\nThe knight rode.");
        assert_eq!(out.chapter_word_count, chapter.word_count);

        let sent = &generator.requests()[0];
        assert_eq!(sent.max_tokens, Some(600));
        assert_eq!(sent.temperature, Some(0.5));
        assert_eq!(sent.mode, WritingMode::UserLead);
        assert!(sent.prompt.contains("AUTHOR DIRECTION:\nRen hears wolves."));
        assert!(sent.prompt.contains("Night fell over the keep."));
        assert!(sent.context.as_deref().unwrap().contains("The cursed crown"));
    }

    #[tokio::test]
    async fn failed_generation_leaves_chapter_untouched() {
        let f = fixture();
        let (rt, store) = runtime(f.archive.clone(), ScriptedGenerator::failing());

        let err = rt.continue_chapter(&continue_req(&f)).await.unwrap_err();
        assert!(matches!(err, NarrativeError::BackendUnavailable(_)));
        let chapter = store.chapter(f.chapter_id).await.unwrap();
        assert_eq!(chapter.content, "Night fell over the keep.");
    }

    #[tokio::test]
    async fn whitespace_only_continuation_is_rejected_without_writing() {
        let f = fixture();
        let (rt, store) = runtime(f.archive.clone(), ScriptedGenerator::replying("  \n"));

        let err = rt.continue_chapter(&continue_req(&f)).await.unwrap_err();
        assert!(matches!(err, NarrativeError::MalformedBackendResponse(_)));
        let chapter = store.chapter(f.chapter_id).await.unwrap();
        assert_eq!(chapter.content, "Night fell over the keep.");
        assert_eq!(chapter.word_count, 5);
    }

    fn slow_indexing_runtime(
        f: &Fixture,
        generator: Arc<ScriptedGenerator>,
    ) -> (StoryRuntime, ArchiveStore, InMemoryVectorStore) {
        let store = ArchiveStore::from_archive(f.archive.clone());
        let vectors = InMemoryVectorStore::new(slow_letter_embed(Duration::from_millis(50)));
        let rt = StoryRuntime::new(
            &AppConfig::default(),
            Arc::new(store.clone()),
            generator,
            Arc::new(vectors.clone()),
        );
        (rt, store, vectors)
    }

    fn indexed_chapter_chunks(vectors: &InMemoryVectorStore) -> usize {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
            .block_on(vectors.len(Collection::Chapters))
    }

    // Plain #[test]s: the async runtime is torn down as soon as the command
    // returns, the way a CLI process exits.
    #[test]
    fn reindex_completes_before_runtime_shutdown() {
        let f = fixture();
        let generator = ScriptedGenerator::replying("The knight rode.");
        let (rt, _, vectors) = slow_indexing_runtime(&f, generator);

        let tokio_rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .unwrap();
        tokio_rt.block_on(async {
            rt.continue_chapter(&continue_req(&f)).await.unwrap();
            rt.drain().await;
        });
        drop(tokio_rt);

        assert!(indexed_chapter_chunks(&vectors) > 0);
    }

    #[test]
    fn dropped_stream_is_persisted_and_indexed_before_shutdown() {
        let f = fixture();
        let mut script = tokens(&["The ", "knight ", "rode."]);
        script.push(narrative_llm::StreamEvent::Done);
        let (rt, store, vectors) = slow_indexing_runtime(&f, ScriptedGenerator::streaming(script));

        let tokio_rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .unwrap();
        let content = tokio_rt.block_on(async {
            drop(rt.continue_chapter_stream(&continue_req(&f)).await.unwrap());
            rt.drain().await;
            store.chapter(f.chapter_id).await.unwrap().content
        });
        drop(tokio_rt);

        assert!(content.ends_with("The knight rode."));
        assert!(indexed_chapter_chunks(&vectors) > 0);
    }

    #[tokio::test]
    async fn chapter_from_another_story_is_not_found() {
        let f = fixture();
        let (rt, _) = runtime(f.archive.clone(), ScriptedGenerator::replying("x"));
        let mut req = continue_req(&f);
        req.story_id = Uuid::new_v4();
        assert!(matches!(
            rt.continue_chapter(&req).await.unwrap_err(),
            NarrativeError::NotFound { kind: EntityKind::Story, .. }
        ));

        let mut archive = f.archive.clone();
        let other = Uuid::new_v4();
        let mut story = archive.stories[0].clone();
        story.id = other;
        archive.stories.push(story);
        let (rt, _) = runtime(archive, ScriptedGenerator::replying("x"));
        req.story_id = other;
        assert!(matches!(
            rt.continue_chapter(&req).await.unwrap_err(),
            NarrativeError::NotFound { kind: EntityKind::Chapter, .. }
        ));
    }

    #[tokio::test]
    async fn retrieval_excludes_the_chapter_being_continued() {
        let mut f = fixture();
        let current = Uuid::new_v4();
        let mut chapter = Chapter {
            id: current,
            story_id: f.story_id,
            title: "Fire".to_string(),
            number: 3,
            content: "The keep burned through the night.".to_string(),
            summary: None,
            pov_character_id: None,
            key_events: Vec::new(),
            word_count: 0,
            reading_time_minutes: 0,
            updated_at: Utc::now(),
        };
        chapter.recalculate_word_count();
        f.archive.chapters.push(chapter);

        let generator = ScriptedGenerator::replying("Smoke rose.");
        let (rt, _) = runtime(f.archive.clone(), generator.clone());
        let summary = rt.index_story(f.story_id).await.unwrap();
        assert_eq!(summary.chapters, 2);
        assert_eq!(summary.characters, 1);
        assert_eq!(summary.failures, 0);

        let req = ContinueRequest::new(f.story_id, current, WritingMode::CoAuthor);
        rt.continue_chapter(&req).await.unwrap();

        let prompt = &generator.requests()[0].prompt;
        assert!(prompt.contains("[Previous Scene] Night fell over the keep."));
        assert!(!prompt.contains("[Previous Scene] The keep burned"));
    }

    #[tokio::test]
    async fn empty_chapter_asks_for_an_opening() {
        let f = fixture();
        let generator = ScriptedGenerator::replying("Rain.");
        let (rt, store) = runtime(f.archive.clone(), generator.clone());

        let req = ContinueRequest::new(f.story_id, f.empty_chapter_id, WritingMode::AiLead);
        rt.continue_chapter(&req).await.unwrap();

        assert!(generator.requests()[0].prompt.contains("Write its opening."));
        assert_eq!(store.chapter(f.empty_chapter_id).await.unwrap().content, "Rain.");
    }

    #[tokio::test]
    async fn streaming_continuation_round_trips_into_the_chapter() {
        let f = fixture();
        let mut script = tokens(&["The ", "knight ", "rode."]);
        script.push(narrative_llm::StreamEvent::Done);
        let (rt, store) = runtime(f.archive.clone(), ScriptedGenerator::streaming(script));

        let mut handle = rt.continue_chapter_stream(&continue_req(&f)).await.unwrap();
        let mut sse = String::new();
        while let Some(frame) = handle.frames.recv().await {
            sse.push_str(&frame.to_sse());
            if frame == StreamFrame::Done {
                break;
            }
        }
        let outcome = handle.outcome.await.unwrap();

        assert_eq!(sse, "data: The \n\ndata: knight \n\ndata: rode.\n\ndata: [DONE]\n\n");
        assert_eq!(outcome.state, SessionState::Persisted);
        assert_eq!(
            store.chapter(f.chapter_id).await.unwrap().content,
            "Night fell over the keep.\n\nThe knight rode."
        );
    }

    #[tokio::test]
    async fn brainstorm_and_recap_use_fixed_modes_and_budgets() {
        let f = fixture();
        let generator = ScriptedGenerator::replying("Ideas.");
        let (rt, _) = runtime(f.archive.clone(), generator.clone());

        rt.brainstorm(f.story_id, BrainstormKind::Conflict, None, Some("raise the stakes"))
            .await
            .unwrap();
        let recap = rt.recap(f.story_id).await.unwrap();

        let sent = generator.requests();
        assert_eq!(sent[0].mode, WritingMode::AiLead);
        assert_eq!(sent[0].max_tokens, Some(BRAINSTORM_MAX_TOKENS));
        assert_eq!(sent[1].mode, WritingMode::UserLead);
        assert_eq!(sent[1].max_tokens, Some(RECAP_MAX_TOKENS));
        assert_eq!(recap.story_title, "The Ember Crown");
        assert_eq!(recap.chapter_count, 2);
        assert_eq!(recap.character_count, 1);
        assert_eq!(recap.word_count, 5);
    }

    #[tokio::test]
    async fn bible_extraction_reports_whether_json_parsed() {
        let f = fixture();
        let reply = "Here you go:\n```json\n{\"world_name\": \"Vell\", \"world_rules\": []}\n```";
        let (rt, _) = runtime(f.archive.clone(), ScriptedGenerator::replying(reply));
        let out = rt.extract_story_bible(f.story_id).await.unwrap();
        assert!(out.parsed);
        assert_eq!(out.bible.unwrap()["world_name"], "Vell");

        let (rt, _) = runtime(f.archive.clone(), ScriptedGenerator::replying("I could not."));
        let out = rt.extract_story_bible(f.story_id).await.unwrap();
        assert!(!out.parsed);
        assert!(out.bible.is_none());
        assert_eq!(out.raw, "I could not.");
    }

    #[tokio::test]
    async fn bible_update_sends_the_stored_bible_and_parses_additions() {
        let f = fixture();
        let reply = "{\"new_locations\": [{\"name\": \"Karth\", \"description\": \"a pass\", \"importance\": \"high\"}]} Hope that helps {sic}";
        let generator = ScriptedGenerator::replying(reply);
        let (rt, _) = runtime(f.archive.clone(), generator.clone());

        let out = rt.update_story_bible(f.story_id, "They crossed at Karth.").await.unwrap();
        assert!(out.parsed);
        assert_eq!(out.updates.unwrap()["new_locations"][0]["name"], "Karth");

        let sent = &generator.requests()[0];
        assert_eq!(sent.mode, WritingMode::UserLead);
        assert_eq!(sent.max_tokens, Some(BIBLE_UPDATE_MAX_TOKENS));
        assert!(sent.prompt.contains("NEW CONTENT:\nThey crossed at Karth."));
        assert!(sent.prompt.contains("\"world_name\": \"Vell\""));

        let (rt, _) = runtime(f.archive.clone(), ScriptedGenerator::replying("Nothing new."));
        let out = rt.update_story_bible(f.story_id, "x").await.unwrap();
        assert!(!out.parsed);
        assert!(out.updates.is_none());
        assert_eq!(out.raw, "Nothing new.");

        let (rt, _) = runtime(f.archive.clone(), ScriptedGenerator::replying("{}"));
        let err = rt.update_story_bible(Uuid::new_v4(), "x").await.unwrap_err();
        assert!(matches!(err, NarrativeError::NotFound { .. }));
    }

    #[tokio::test]
    async fn image_prompt_uses_user_lead_and_default_style() {
        let generator = ScriptedGenerator::replying("  A lone knight on a snowy ridge.\n");
        let (rt, _) = runtime(fixture().archive, generator.clone());

        let out = rt.image_prompt("Ren on the ridge", ImageKind::Scene, None).await.unwrap();
        assert_eq!(out.image_prompt, "A lone knight on a snowy ridge.");
        assert_eq!(out.kind, ImageKind::Scene);
        assert_eq!(serde_json::to_value(&out).unwrap()["type"], "scene");

        let sent = &generator.requests()[0];
        assert_eq!(sent.mode, WritingMode::UserLead);
        assert_eq!(sent.max_tokens, Some(IMAGE_PROMPT_MAX_TOKENS));
        assert!(sent.prompt.contains("STYLE: cinematic, detailed, high quality, professional"));

        let (rt, _) = runtime(fixture().archive, ScriptedGenerator::failing());
        let err = rt.image_prompt("x", ImageKind::Cover, Some("ink")).await.unwrap_err();
        assert!(matches!(err, NarrativeError::BackendUnavailable(_)));
    }

    #[tokio::test]
    async fn analysis_and_dialogue_tools_target_the_character() {
        let f = fixture();
        let generator = ScriptedGenerator::replying("Notes.");
        let (rt, _) = runtime(f.archive.clone(), generator.clone());

        rt.analyze_character(f.character_id, "Ren drew her sword.").await.unwrap();
        rt.dialogue(f.character_id, &[Uuid::new_v4()], "At the gate.", "Refusing entry", WritingMode::CoAuthor)
            .await
            .unwrap();
        let err = rt.analyze_character(Uuid::new_v4(), "text").await.unwrap_err();
        assert!(matches!(err, NarrativeError::NotFound { kind: EntityKind::Character, .. }));

        let sent = generator.requests();
        assert_eq!(sent[0].max_tokens, Some(CHARACTER_ANALYSIS_MAX_TOKENS));
        assert_eq!(sent[0].mode, WritingMode::UserLead);
        assert!(sent[1].prompt.contains("Ren") || sent[1].system_prompt.contains("Ren"));
    }

    #[tokio::test]
    async fn consistency_checks_go_through_the_engine() {
        let f = fixture();
        let reply = r#"{"summary": "Mostly fine.", "issues": [
            {"type": "timeline", "severity": "high", "description": "Dawn came twice."}
        ], "recommendations": []}"#;
        let (rt, _) = runtime(f.archive.clone(), ScriptedGenerator::replying(reply));

        let report = rt
            .check_consistency(f.story_id, "Dawn came. Dawn came again.", Some(f.chapter_id))
            .await
            .unwrap();
        assert_eq!(report.issues().len(), 1);
        assert!((report.overall_score() - 0.8).abs() < 1e-6);

        let (rt, _) = runtime(f.archive.clone(), ScriptedGenerator::failing());
        assert!(rt.quick_check(f.story_id, "text").await.unwrap().is_empty());
        assert!(rt.check_consistency(f.story_id, "text", None).await.is_err());
    }

    #[tokio::test]
    async fn from_config_opens_the_archive_on_disk() {
        let f = fixture();
        let dir = tempfile::TempDir::new().unwrap();
        let archive_path = dir.path().join("archive.json");
        std::fs::write(&archive_path, serde_json::to_string(&f.archive).unwrap()).unwrap();

        let mut config = AppConfig::default();
        config.storage.archive_path = archive_path.display().to_string();
        config.storage.chunk_log_path = dir.path().join("chunks.jsonl").display().to_string();
        let rt = StoryRuntime::from_config(&config).await.unwrap();

        assert_eq!(rt.model_name(), config.llm.model);
        assert_eq!(rt.story_stats(f.story_id).await.unwrap().story_title, "The Ember Crown");
    }

    #[tokio::test]
    async fn stats_summarise_the_story() {
        let f = fixture();
        let (rt, _) = runtime(f.archive.clone(), ScriptedGenerator::replying("x"));
        let stats = rt.story_stats(f.story_id).await.unwrap();
        assert_eq!(stats.total_words, 5);
        assert_eq!(stats.chapter_count, 2);
        assert_eq!(stats.character_appearances.get("Ren"), Some(&1));
        assert!(matches!(
            rt.story_stats(Uuid::new_v4()).await.unwrap_err(),
            NarrativeError::NotFound { .. }
        ));
    }
}
