//! Turns entity content into chunks for the vector store.

use std::sync::Arc;

use regex::Regex;
use tracing::{debug, warn};

use narrative_core::{Chapter, Character, Result, StoryBible};

use crate::chunk::{ChunkDraft, Collection};
use crate::store::VectorStore;

/// Split `content` into chunks on paragraph boundaries.  Paragraphs are
/// packed together until the next one would push a chunk past `max_chars`;
/// a single oversized paragraph is broken on whitespace.
pub fn chunk_paragraphs(content: &str, max_chars: usize) -> Vec<String> {
    let max_chars = max_chars.max(1);
    let mut chunks = Vec::new();
    let mut current = String::new();

    let paragraphs = content
        .split("\n\n")
        .map(str::trim)
        .filter(|p| !p.is_empty());

    for paragraph in paragraphs {
        let pieces = if paragraph.chars().count() > max_chars {
            split_words(paragraph, max_chars)
        } else {
            vec![paragraph.to_string()]
        };
        for piece in pieces {
            let needed = if current.is_empty() { 0 } else { 2 } + piece.chars().count();
            if !current.is_empty() && current.chars().count() + needed > max_chars {
                chunks.push(std::mem::take(&mut current));
            }
            if !current.is_empty() {
                current.push_str("\n\n");
            }
            current.push_str(&piece);
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

fn split_words(paragraph: &str, max_chars: usize) -> Vec<String> {
    let mut pieces = Vec::new();
    let mut current = String::new();
    for word in paragraph.split_whitespace() {
        if !current.is_empty() && current.chars().count() + 1 + word.chars().count() > max_chars {
            pieces.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(word);
    }
    if !current.is_empty() {
        pieces.push(current);
    }
    pieces
}

/// Names from `names` that appear as whole words in `text`, case-insensitive.
pub fn mentioned_names(text: &str, names: &[String]) -> Vec<String> {
    names
        .iter()
        .filter(|name| !name.trim().is_empty())
        .filter(|name| {
            Regex::new(&format!(r"(?i)\b{}\b", regex::escape(name.trim())))
                .map(|re| re.is_match(text))
                .unwrap_or(false)
        })
        .cloned()
        .collect()
}

/// Writes chapter, character and bible content into the vector store.
#[derive(Clone)]
pub struct Indexer {
    store: Arc<dyn VectorStore>,
    chunk_size_chars: usize,
}

impl Indexer {
    pub fn new(store: Arc<dyn VectorStore>, chunk_size_chars: usize) -> Self {
        Self {
            store,
            chunk_size_chars,
        }
    }

    pub fn store(&self) -> Arc<dyn VectorStore> {
        Arc::clone(&self.store)
    }

    /// Index the chapter's current content.  Returns how many new chunks
    /// were appended.
    pub async fn index_chapter(&self, chapter: &Chapter, character_names: &[String]) -> Result<usize> {
        let mut appended = 0;
        for (idx, text) in chunk_paragraphs(&chapter.content, self.chunk_size_chars)
            .into_iter()
            .enumerate()
        {
            let mentioned = mentioned_names(&text, character_names);
            let draft = ChunkDraft::new(Some(chapter.story_id), chapter.id, text)
                .with_meta("story_id", chapter.story_id.to_string())
                .with_meta("chapter_title", chapter.title.clone())
                .with_meta("chapter_number", chapter.number.to_string())
                .with_meta("chunk_index", idx.to_string())
                .with_meta("characters", mentioned.join(", "));
            if self.store.upsert(Collection::Chapters, draft).await? {
                appended += 1;
            }
        }
        debug!(chapter_id = %chapter.id, appended, "chapter indexed");
        Ok(appended)
    }

    pub async fn index_character(&self, character: &Character) -> Result<usize> {
        let draft = ChunkDraft::new(Some(character.story_id), character.id, character.profile_text())
            .with_meta("story_id", character.story_id.to_string())
            .with_meta("character_name", character.name.clone())
            .with_meta("role", character.role.label());
        let appended = usize::from(self.store.upsert(Collection::Characters, draft).await?);
        debug!(character = %character.name, appended, "character indexed");
        Ok(appended)
    }

    /// Index every world rule of the bible, one chunk per rule.  A failing
    /// rule is logged and the rest still indexed.
    pub async fn index_bible(&self, bible: &StoryBible) -> Result<usize> {
        let mut appended = 0;
        let mut last_err = None;
        for rule in &bible.world_rules {
            let draft = ChunkDraft::new(
                Some(bible.story_id),
                rule.id,
                format!("{}: {}", rule.title, rule.description),
            )
            .with_meta("story_id", bible.story_id.to_string())
            .with_meta("type", rule.category.clone())
            .with_meta("title", rule.title.clone());
            match self.store.upsert(Collection::Bible, draft).await {
                Ok(true) => appended += 1,
                Ok(false) => {}
                Err(err) => {
                    warn!(rule = %rule.title, %err, "world rule not indexed");
                    last_err = Some(err);
                }
            }
        }
        match last_err {
            Some(err) if appended == 0 => Err(err),
            _ => Ok(appended),
        }
    }
}
