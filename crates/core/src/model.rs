//! Read-mostly snapshots of the story entities the core works against.
//!
//! Persistence of these records belongs to an external entity store; the only
//! write the core performs is [`Chapter::append_generated`] followed by a
//! commit through a [`crate::WriteScope`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Average adult reading speed used for reading-time estimates.
pub const WORDS_PER_MINUTE: usize = 200;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorySnapshot {
    pub id: Uuid,
    pub title: String,
    pub genre: String,
    pub tone: String,
    #[serde(default)]
    pub target_word_count: Option<u32>,
    #[serde(default)]
    pub synopsis: Option<String>,
    /// Free-form style constraints appended to every system prompt.
    #[serde(default)]
    pub style_guide: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chapter {
    pub id: Uuid,
    pub story_id: Uuid,
    pub title: String,
    pub number: u32,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub pov_character_id: Option<Uuid>,
    #[serde(default)]
    pub key_events: Vec<String>,
    #[serde(default)]
    pub word_count: usize,
    #[serde(default)]
    pub reading_time_minutes: usize,
    pub updated_at: DateTime<Utc>,
}

impl Chapter {
    /// Append generated text, separated from existing prose by a blank line.
    pub fn append_generated(&mut self, text: &str) {
        if self.content.is_empty() {
            self.content = text.to_string();
        } else {
            self.content.push_str("\n\n");
            self.content.push_str(text);
        }
        self.recalculate_word_count();
        self.updated_at = Utc::now();
    }

    pub fn recalculate_word_count(&mut self) -> usize {
        self.word_count = self.content.split_whitespace().count();
        self.reading_time_minutes = (self.word_count / WORDS_PER_MINUTE).max(1);
        self.word_count
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CharacterRole {
    Protagonist,
    Antagonist,
    Supporting,
    Minor,
}

impl CharacterRole {
    pub fn label(self) -> &'static str {
        match self {
            Self::Protagonist => "protagonist",
            Self::Antagonist => "antagonist",
            Self::Supporting => "supporting",
            Self::Minor => "minor",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Character {
    pub id: Uuid,
    pub story_id: Uuid,
    pub name: String,
    pub role: CharacterRole,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub personality_traits: Vec<String>,
    #[serde(default)]
    pub backstory: Option<String>,
    /// How the character talks: diction, verbal tics, register.
    #[serde(default)]
    pub speech_pattern: Option<String>,
    #[serde(default)]
    pub goals: Vec<String>,
    #[serde(default)]
    pub current_state: Option<String>,
    #[serde(default)]
    pub chapter_appearances: Vec<Uuid>,
}

impl Character {
    /// Multi-line profile used both in prompts and as the embedded text of the
    /// character's chunk.
    pub fn profile_text(&self) -> String {
        let mut lines = vec![format!("{} ({})", self.name, self.role.label())];
        if !self.description.is_empty() {
            lines.push(format!("Description: {}", self.description));
        }
        if !self.personality_traits.is_empty() {
            lines.push(format!("Personality: {}", self.personality_traits.join(", ")));
        }
        if let Some(speech) = &self.speech_pattern {
            lines.push(format!("Voice: {speech}"));
        }
        if let Some(backstory) = &self.backstory {
            lines.push(format!("Backstory: {backstory}"));
        }
        if !self.goals.is_empty() {
            lines.push(format!("Goals: {}", self.goals.join("; ")));
        }
        if let Some(state) = &self.current_state {
            lines.push(format!("Current state: {state}"));
        }
        lines.join("\n")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlotlineStatus {
    Setup,
    Developing,
    Climax,
    Resolved,
    Abandoned,
}

impl PlotlineStatus {
    /// Active plotlines are those still in play: neither resolved nor abandoned.
    pub fn is_active(self) -> bool {
        !matches!(self, Self::Resolved | Self::Abandoned)
    }

    pub fn slug(self) -> &'static str {
        match self {
            Self::Setup => "setup",
            Self::Developing => "developing",
            Self::Climax => "climax",
            Self::Resolved => "resolved",
            Self::Abandoned => "abandoned",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plotline {
    pub id: Uuid,
    pub story_id: Uuid,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub status: PlotlineStatus,
    /// 1 (background) to 10 (central).
    #[serde(default = "default_importance")]
    pub importance: u8,
}

fn default_importance() -> u8 {
    5
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorldRule {
    pub id: Uuid,
    /// physics / magic / society / technology / biology, or anything the
    /// author chooses.
    pub category: String,
    pub title: String,
    pub description: String,
    #[serde(default = "default_importance")]
    pub importance: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlossaryTerm {
    pub term: String,
    pub definition: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct StoryBible {
    pub story_id: Uuid,
    #[serde(default)]
    pub world_name: Option<String>,
    #[serde(default)]
    pub world_description: Option<String>,
    #[serde(default)]
    pub magic_system: Option<String>,
    #[serde(default)]
    pub technology_level: Option<String>,
    #[serde(default)]
    pub central_themes: Vec<String>,
    #[serde(default)]
    pub tone_guidelines: Option<String>,
    #[serde(default)]
    pub world_rules: Vec<WorldRule>,
    #[serde(default)]
    pub glossary: Vec<GlossaryTerm>,
    #[serde(default)]
    pub quick_facts: Vec<String>,
}
