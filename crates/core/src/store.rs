//! Entity store collaborator.
//!
//! The core reads story snapshots through [`EntityStore`] and performs its one
//! write (chapter content + word count) through a [`WriteScope`], which is
//! acquired fresh for each commit and released on drop whether or not it was
//! committed.  [`ArchiveStore`] is a JSON-archive implementation used by the
//! CLI and the tests.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{EntityKind, NarrativeError, Result};
use crate::model::{Chapter, Character, Plotline, StoryBible, StorySnapshot};

#[async_trait]
pub trait EntityStore: Send + Sync {
    async fn story(&self, id: Uuid) -> Result<StorySnapshot>;
    async fn chapter(&self, id: Uuid) -> Result<Chapter>;
    /// Chapters of a story ordered by chapter number.
    async fn chapters(&self, story_id: Uuid) -> Result<Vec<Chapter>>;
    async fn character(&self, id: Uuid) -> Result<Character>;
    async fn characters(&self, story_id: Uuid) -> Result<Vec<Character>>;
    async fn plotlines(&self, story_id: Uuid) -> Result<Vec<Plotline>>;
    async fn story_bible(&self, story_id: Uuid) -> Result<Option<StoryBible>>;
    /// Acquire an independent write scope.  Callers must not assume any other
    /// scope (for example the one belonging to the originating request) is
    /// still alive.
    async fn write_scope(&self) -> Result<Box<dyn WriteScope>>;
}

#[async_trait]
pub trait WriteScope: Send {
    /// Stage `text` at the end of the chapter and return the staged chapter.
    async fn append_chapter_content(&mut self, chapter_id: Uuid, text: &str) -> Result<Chapter>;
    /// Make every staged change durable.  Dropping the scope without calling
    /// this discards the staged changes.
    async fn commit(self: Box<Self>) -> Result<()>;
}

/// Serialized form of everything an [`ArchiveStore`] holds.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StoryArchive {
    pub stories: Vec<StorySnapshot>,
    pub chapters: Vec<Chapter>,
    pub characters: Vec<Character>,
    pub plotlines: Vec<Plotline>,
    pub bibles: Vec<StoryBible>,
}

/// In-process entity store, optionally mirrored to a JSON file.
#[derive(Debug, Clone, Default)]
pub struct ArchiveStore {
    data: Arc<RwLock<StoryArchive>>,
    path: Option<PathBuf>,
}

impl ArchiveStore {
    pub fn from_archive(archive: StoryArchive) -> Self {
        Self {
            data: Arc::new(RwLock::new(archive)),
            path: None,
        }
    }

    /// Load the archive at `path`, or start empty when it does not exist.
    /// Every commit rewrites the file atomically.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let archive = if tokio::fs::try_exists(&path).await? {
            let raw = tokio::fs::read_to_string(&path).await?;
            serde_json::from_str(&raw)?
        } else {
            StoryArchive::default()
        };
        info!(
            path = %path.display(),
            stories = archive.stories.len(),
            chapters = archive.chapters.len(),
            "story archive loaded"
        );
        Ok(Self {
            data: Arc::new(RwLock::new(archive)),
            path: Some(path),
        })
    }

    pub async fn snapshot(&self) -> StoryArchive {
        self.data.read().await.clone()
    }
}

#[async_trait]
impl EntityStore for ArchiveStore {
    async fn story(&self, id: Uuid) -> Result<StorySnapshot> {
        let data = self.data.read().await;
        data.stories
            .iter()
            .find(|s| s.id == id)
            .cloned()
            .ok_or_else(|| NarrativeError::not_found(EntityKind::Story, id))
    }

    async fn chapter(&self, id: Uuid) -> Result<Chapter> {
        let data = self.data.read().await;
        data.chapters
            .iter()
            .find(|c| c.id == id)
            .cloned()
            .ok_or_else(|| NarrativeError::not_found(EntityKind::Chapter, id))
    }

    async fn chapters(&self, story_id: Uuid) -> Result<Vec<Chapter>> {
        let data = self.data.read().await;
        let mut chapters: Vec<Chapter> = data
            .chapters
            .iter()
            .filter(|c| c.story_id == story_id)
            .cloned()
            .collect();
        chapters.sort_by_key(|c| c.number);
        Ok(chapters)
    }

    async fn character(&self, id: Uuid) -> Result<Character> {
        let data = self.data.read().await;
        data.characters
            .iter()
            .find(|c| c.id == id)
            .cloned()
            .ok_or_else(|| NarrativeError::not_found(EntityKind::Character, id))
    }

    async fn characters(&self, story_id: Uuid) -> Result<Vec<Character>> {
        let data = self.data.read().await;
        Ok(data
            .characters
            .iter()
            .filter(|c| c.story_id == story_id)
            .cloned()
            .collect())
    }

    async fn plotlines(&self, story_id: Uuid) -> Result<Vec<Plotline>> {
        let data = self.data.read().await;
        Ok(data
            .plotlines
            .iter()
            .filter(|p| p.story_id == story_id)
            .cloned()
            .collect())
    }

    async fn story_bible(&self, story_id: Uuid) -> Result<Option<StoryBible>> {
        let data = self.data.read().await;
        Ok(data.bibles.iter().find(|b| b.story_id == story_id).cloned())
    }

    async fn write_scope(&self) -> Result<Box<dyn WriteScope>> {
        Ok(Box::new(ArchiveWriteScope {
            data: Arc::clone(&self.data),
            path: self.path.clone(),
            staged: HashMap::new(),
        }))
    }
}

struct ArchiveWriteScope {
    data: Arc<RwLock<StoryArchive>>,
    path: Option<PathBuf>,
    /// Appended fragments per chapter, replayed onto the latest committed
    /// chapter at commit time so concurrent scopes never clobber each other.
    staged: HashMap<Uuid, Vec<String>>,
}

#[async_trait]
impl WriteScope for ArchiveWriteScope {
    async fn append_chapter_content(&mut self, chapter_id: Uuid, text: &str) -> Result<Chapter> {
        let mut chapter = {
            let data = self.data.read().await;
            data.chapters
                .iter()
                .find(|c| c.id == chapter_id)
                .cloned()
                .ok_or_else(|| NarrativeError::not_found(EntityKind::Chapter, chapter_id))?
        };
        let pending = self.staged.entry(chapter_id).or_default();
        pending.push(text.to_string());
        for fragment in pending.iter() {
            chapter.append_generated(fragment);
        }
        Ok(chapter)
    }

    async fn commit(mut self: Box<Self>) -> Result<()> {
        let staged = std::mem::take(&mut self.staged);
        if staged.is_empty() {
            return Ok(());
        }

        // Writers serialize on the lock; the file is written before the new
        // state becomes visible so memory never runs ahead of disk.
        let mut guard = self.data.write().await;
        let mut next = guard.clone();
        for (chapter_id, fragments) in &staged {
            let chapter = next
                .chapters
                .iter_mut()
                .find(|c| c.id == *chapter_id)
                .ok_or_else(|| NarrativeError::not_found(EntityKind::Chapter, *chapter_id))?;
            for fragment in fragments {
                chapter.append_generated(fragment);
            }
        }
        if let Some(path) = &self.path {
            write_archive_atomic(path, &next)
                .await
                .map_err(|err| NarrativeError::PersistenceFailure(err.to_string()))?;
        }
        *guard = next;
        debug!(chapters = staged.len(), "write scope committed");
        Ok(())
    }
}

impl Drop for ArchiveWriteScope {
    fn drop(&mut self) {
        if !self.staged.is_empty() {
            debug!(chapters = self.staged.len(), "write scope dropped without commit; staged changes discarded");
        }
    }
}

/// Write to a `.tmp` sibling, fsync, then rename over the original.
async fn write_archive_atomic(path: &Path, archive: &StoryArchive) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp_path = {
        let filename = path
            .file_name()
            .map(|f| f.to_string_lossy().to_string())
            .unwrap_or_else(|| "archive.json".to_string());
        path.with_file_name(format!("{filename}.tmp"))
    };

    let rendered = serde_json::to_vec_pretty(archive)?;
    let write_result: Result<()> = async {
        let mut file = tokio::fs::File::create(&tmp_path).await?;
        file.write_all(&rendered).await?;
        file.flush().await?;
        file.sync_all().await?;
        Ok(())
    }
    .await;

    if let Err(err) = write_result {
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(err);
    }
    if let Err(err) = tokio::fs::rename(&tmp_path, path).await {
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(err.into());
    }
    Ok(())
}
