//! Fakes shared by the runtime tests.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::mpsc;
use uuid::Uuid;

use narrative_core::{
    ArchiveStore, Chapter, Character, CharacterRole, EntityStore, NarrativeError, Plotline,
    PlotlineStatus, Result, StoryArchive, StoryBible, StorySnapshot, WriteScope,
};
use narrative_llm::{GenerationRequest, GenerationResult, StreamEvent, TextGenerator};
use narrative_memory::EmbedFn;

/// Generator that replays a fixed reply and a fixed event script.
pub struct ScriptedGenerator {
    reply: Option<String>,
    script: Vec<StreamEvent>,
    gap: Duration,
    pub seen: Mutex<Vec<GenerationRequest>>,
}

impl ScriptedGenerator {
    pub fn replying(reply: &str) -> Arc<Self> {
        Arc::new(Self {
            reply: Some(reply.to_string()),
            script: Vec::new(),
            gap: Duration::ZERO,
            seen: Mutex::new(Vec::new()),
        })
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            reply: None,
            script: Vec::new(),
            gap: Duration::ZERO,
            seen: Mutex::new(Vec::new()),
        })
    }

    pub fn streaming(script: Vec<StreamEvent>) -> Arc<Self> {
        Self::streaming_with_gap(script, Duration::ZERO)
    }

    pub fn streaming_with_gap(script: Vec<StreamEvent>, gap: Duration) -> Arc<Self> {
        Arc::new(Self {
            reply: None,
            script,
            gap,
            seen: Mutex::new(Vec::new()),
        })
    }

    pub fn requests(&self) -> Vec<GenerationRequest> {
        self.seen.lock().unwrap().clone()
    }
}

pub fn tokens(parts: &[&str]) -> Vec<StreamEvent> {
    parts.iter().map(|p| StreamEvent::Token((*p).to_string())).collect()
}

#[async_trait]
impl TextGenerator for ScriptedGenerator {
    async fn generate(&self, request: &GenerationRequest) -> GenerationResult {
        self.seen.lock().unwrap().push(request.clone());
        match &self.reply {
            Some(body) => GenerationResult::succeeded(body.clone(), 42, 5, "scripted"),
            None => GenerationResult::failed("connection refused", 5, "scripted"),
        }
    }

    async fn generate_stream(&self, request: &GenerationRequest, tx: mpsc::Sender<StreamEvent>) {
        self.seen.lock().unwrap().push(request.clone());
        for event in self.script.clone() {
            if !self.gap.is_zero() {
                tokio::time::sleep(self.gap).await;
            }
            // The session keeps draining after a disconnect, so a send
            // failure here means the test dropped everything.
            if tx.send(event).await.is_err() {
                return;
            }
        }
    }

    fn model_name(&self) -> &str {
        "scripted"
    }
}

/// Letter-frequency embedding, enough to rank shared vocabulary first.
pub fn letter_embed() -> EmbedFn {
    Arc::new(|text: String| {
        Box::pin(async move {
            let mut v = vec![0.0f32; 26];
            for c in text.to_ascii_lowercase().chars() {
                if c.is_ascii_lowercase() {
                    v[(c as u8 - b'a') as usize] += 1.0;
                }
            }
            Ok(v)
        })
    })
}

/// `letter_embed` that takes `delay` per call.
pub fn slow_letter_embed(delay: Duration) -> EmbedFn {
    let inner = letter_embed();
    Arc::new(move |text: String| {
        let inner = Arc::clone(&inner);
        Box::pin(async move {
            tokio::time::sleep(delay).await;
            inner(text).await
        })
    })
}

pub fn failing_embed() -> EmbedFn {
    Arc::new(|_text: String| {
        Box::pin(async { Err(NarrativeError::BackendUnavailable("embedder down".into())) })
    })
}

pub struct Fixture {
    pub archive: StoryArchive,
    pub story_id: Uuid,
    pub chapter_id: Uuid,
    pub empty_chapter_id: Uuid,
    pub character_id: Uuid,
}

pub fn fixture() -> Fixture {
    let story_id = Uuid::new_v4();
    let chapter_id = Uuid::new_v4();
    let empty_chapter_id = Uuid::new_v4();
    let character_id = Uuid::new_v4();

    let chapter = |id: Uuid, number: u32, title: &str, content: &str| {
        let mut c = Chapter {
            id,
            story_id,
            title: title.to_string(),
            number,
            content: content.to_string(),
            summary: None,
            pov_character_id: None,
            key_events: Vec::new(),
            word_count: 0,
            reading_time_minutes: 0,
            updated_at: Utc::now(),
        };
        c.recalculate_word_count();
        c
    };

    let archive = StoryArchive {
        stories: vec![StorySnapshot {
            id: story_id,
            title: "The Ember Crown".to_string(),
            genre: "fantasy".to_string(),
            tone: "somber".to_string(),
            target_word_count: Some(90_000),
            synopsis: Some("A disgraced knight carries a cursed crown north.".to_string()),
            style_guide: None,
        }],
        chapters: vec![
            chapter(chapter_id, 1, "Departure", "Night fell over the keep."),
            chapter(empty_chapter_id, 2, "Crossing", ""),
        ],
        characters: vec![Character {
            id: character_id,
            story_id,
            name: "Ren".to_string(),
            role: CharacterRole::Protagonist,
            description: "A knight stripped of her rank.".to_string(),
            personality_traits: vec!["stubborn".to_string()],
            backstory: None,
            speech_pattern: Some("clipped".to_string()),
            goals: vec!["Return the crown".to_string()],
            current_state: None,
            chapter_appearances: vec![chapter_id],
        }],
        plotlines: vec![Plotline {
            id: Uuid::new_v4(),
            story_id,
            title: "The cursed crown".to_string(),
            description: "The crown whispers to whoever carries it.".to_string(),
            status: PlotlineStatus::Developing,
            importance: 9,
        }],
        bibles: vec![StoryBible {
            story_id,
            world_name: Some("Vell".to_string()),
            ..StoryBible::default()
        }],
    };

    Fixture {
        archive,
        story_id,
        chapter_id,
        empty_chapter_id,
        character_id,
    }
}

/// Reads from the wrapped archive but refuses every commit.
pub struct FailingCommitStore {
    pub inner: ArchiveStore,
}

struct RefusingScope {
    inner: Box<dyn WriteScope>,
}

#[async_trait]
impl WriteScope for RefusingScope {
    async fn append_chapter_content(&mut self, chapter_id: Uuid, text: &str) -> Result<Chapter> {
        self.inner.append_chapter_content(chapter_id, text).await
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        Err(NarrativeError::PersistenceFailure("disk full".into()))
    }
}

#[async_trait]
impl EntityStore for FailingCommitStore {
    async fn story(&self, id: Uuid) -> Result<StorySnapshot> {
        self.inner.story(id).await
    }

    async fn chapter(&self, id: Uuid) -> Result<Chapter> {
        self.inner.chapter(id).await
    }

    async fn chapters(&self, story_id: Uuid) -> Result<Vec<Chapter>> {
        self.inner.chapters(story_id).await
    }

    async fn character(&self, id: Uuid) -> Result<Character> {
        self.inner.character(id).await
    }

    async fn characters(&self, story_id: Uuid) -> Result<Vec<Character>> {
        self.inner.characters(story_id).await
    }

    async fn plotlines(&self, story_id: Uuid) -> Result<Vec<Plotline>> {
        self.inner.plotlines(story_id).await
    }

    async fn story_bible(&self, story_id: Uuid) -> Result<Option<StoryBible>> {
        self.inner.story_bible(story_id).await
    }

    async fn write_scope(&self) -> Result<Box<dyn WriteScope>> {
        Ok(Box::new(RefusingScope {
            inner: self.inner.write_scope().await?,
        }))
    }
}
