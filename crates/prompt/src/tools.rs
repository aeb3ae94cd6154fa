//! Prompts for the editing and analysis tools around the main writer loop.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use narrative_core::{Chapter, Character, Plotline, StoryBible, StorySnapshot};
use narrative_llm::WritingMode;

use crate::PromptParts;
use crate::context::{characters_block, tail_chars};
use crate::continuation::mode_instructions;

pub fn build_rewrite_prompt(
    story: &StorySnapshot,
    original_text: &str,
    instructions: &str,
    characters: &[Character],
    mode: WritingMode,
) -> PromptParts {
    let mut system = format!(
        "You are an expert editor. Improve the text while keeping the author's voice and \
         intent.\n\n{}",
        mode_instructions(mode)
    );
    if let Some(style) = story.style_guide.as_deref().filter(|s| !s.trim().is_empty()) {
        system.push_str("\n\nSTYLE GUIDE:\n");
        system.push_str(style.trim());
    }

    let user = format!(
        "Rewrite the following text according to these instructions.\n\n\
         INSTRUCTIONS: {instructions}\n\n\
         ORIGINAL TEXT:\n{original_text}\n\n\
         REWRITTEN VERSION:"
    );

    PromptParts {
        system_prompt: system,
        user_prompt: user,
        context: format!(
            "STORY: {} ({}, {})\n\nCHARACTERS:\n{}",
            story.title,
            story.genre,
            story.tone,
            characters_block(characters)
        ),
    }
}

pub fn build_dialogue_prompt(
    character: &Character,
    scene_context: &str,
    other_characters: &[Character],
    situation: &str,
    mode: WritingMode,
) -> PromptParts {
    let system = format!(
        "You are an expert dialogue writer. Write dialogue that matches the character's voice, \
         background and personality.\n\n{}\n\nCHARACTER PROFILE:\n{}",
        mode_instructions(mode),
        character.profile_text()
    );

    let present = if other_characters.is_empty() {
        "(alone)".to_string()
    } else {
        other_characters
            .iter()
            .map(|c| format!("- {} ({}): {}", c.name, c.role.label(), c.description))
            .collect::<Vec<_>>()
            .join("\n")
    };

    let user = format!(
        "Write dialogue for {name} in the following scene.\n\n\
         SCENE CONTEXT:\n{scene_context}\n\n\
         OTHERS PRESENT:\n{present}\n\n\
         DIALOGUE SITUATION:\n{situation}\n\n\
         Write {name}'s dialogue, with brief action beats where needed:",
        name = character.name,
    );

    PromptParts {
        system_prompt: system,
        user_prompt: user,
        context: String::new(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BrainstormKind {
    Plot,
    Character,
    Scene,
    Dialogue,
    Conflict,
    Ending,
}

impl BrainstormKind {
    pub const ALL: [BrainstormKind; 6] = [
        Self::Plot,
        Self::Character,
        Self::Scene,
        Self::Dialogue,
        Self::Conflict,
        Self::Ending,
    ];

    pub fn slug(self) -> &'static str {
        match self {
            Self::Plot => "plot",
            Self::Character => "character",
            Self::Scene => "scene",
            Self::Dialogue => "dialogue",
            Self::Conflict => "conflict",
            Self::Ending => "ending",
        }
    }
}

impl fmt::Display for BrainstormKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.slug())
    }
}

impl FromStr for BrainstormKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|kind| kind.slug() == wanted)
            .ok_or_else(|| format!("unknown brainstorm kind '{s}'"))
    }
}

pub fn build_brainstorm_prompt(
    story: &StorySnapshot,
    kind: BrainstormKind,
    current_context: Option<&str>,
    specific_request: Option<&str>,
) -> PromptParts {
    let mut user = format!(
        "Brainstorm {kind} ideas for \"{}\", a {} story with a {} tone.",
        story.title, story.genre, story.tone
    );
    if let Some(synopsis) = story.synopsis.as_deref().filter(|s| !s.trim().is_empty()) {
        user.push_str(&format!("\n\nSYNOPSIS:\n{synopsis}"));
    }
    if let Some(ctx) = current_context.filter(|s| !s.trim().is_empty()) {
        user.push_str(&format!("\n\nWHERE THE STORY STANDS:\n{ctx}"));
    }
    if let Some(request) = specific_request.filter(|s| !s.trim().is_empty()) {
        user.push_str(&format!("\n\nCONSTRAINTS: {request}"));
    }
    user.push_str("\n\nGenerate 5 different creative options, ranging from safe to bold:");

    PromptParts {
        system_prompt: "You are a creative writing partner. Generate several diverse, interesting \
                        ideas that could take the story in exciting directions."
            .to_string(),
        user_prompt: user,
        context: String::new(),
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SummaryKind {
    #[default]
    Chapter,
    Story,
    Character,
}

impl SummaryKind {
    /// Unknown labels summarize as a chapter.
    pub fn from_label(label: &str) -> Self {
        match label.trim().to_ascii_lowercase().as_str() {
            "story" => Self::Story,
            "character" => Self::Character,
            _ => Self::Chapter,
        }
    }

    pub fn slug(self) -> &'static str {
        match self {
            Self::Chapter => "chapter",
            Self::Story => "story",
            Self::Character => "character",
        }
    }

    fn instruction(self) -> &'static str {
        match self {
            Self::Chapter => {
                "Summarize this chapter, highlighting key events, character developments and \
                 plot progressions."
            }
            Self::Story => {
                "Provide a comprehensive summary of this story so far, including main plot \
                 points, character arcs and themes."
            }
            Self::Character => {
                "Summarize this character's journey, development and current state."
            }
        }
    }
}

pub fn build_summary_prompt(content: &str, kind: SummaryKind) -> PromptParts {
    PromptParts {
        system_prompt: "You are an expert at analyzing and summarizing narrative content. Provide \
                        clear, concise summaries that capture the essential elements."
            .to_string(),
        user_prompt: format!(
            "{}\n\nCONTENT TO SUMMARIZE:\n{content}\n\nSUMMARY:",
            kind.instruction()
        ),
        context: String::new(),
    }
}

pub fn build_recap_prompt(
    story: &StorySnapshot,
    chapters: &[Chapter],
    characters: &[Character],
    plotlines: &[Plotline],
) -> PromptParts {
    let overview = format!(
        "{} ({}, {}){}",
        story.title,
        story.genre,
        story.tone,
        story
            .synopsis
            .as_deref()
            .map(|s| format!("\n{s}"))
            .unwrap_or_default()
    );

    let chapter_lines = if chapters.is_empty() {
        "(no chapters yet)".to_string()
    } else {
        chapters
            .iter()
            .map(|c| {
                let summary = c
                    .summary
                    .clone()
                    .filter(|s| !s.trim().is_empty())
                    .unwrap_or_else(|| tail_chars(&c.content, 300).to_string());
                format!("Chapter {} - {}: {}", c.number, c.title, summary)
            })
            .collect::<Vec<_>>()
            .join("\n")
    };

    let character_lines = if characters.is_empty() {
        "(no characters)".to_string()
    } else {
        characters
            .iter()
            .map(|c| {
                format!(
                    "- {} ({}): {}",
                    c.name,
                    c.role.label(),
                    c.current_state.as_deref().unwrap_or("state unknown")
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    };

    let plot_lines = if plotlines.is_empty() {
        "(no plotlines)".to_string()
    } else {
        plotlines
            .iter()
            .map(|p| format!("- {} [{}]: {}", p.title, p.status.slug(), p.description))
            .collect::<Vec<_>>()
            .join("\n")
    };

    PromptParts {
        system_prompt: "You are an expert narrative analyst. Provide a clear, organized recap of \
                        the story that helps the writer understand where things stand."
            .to_string(),
        user_prompt: format!(
            "Generate a recap of this story covering:\n\
             1. What has happened (major events)\n\
             2. Current character states and locations\n\
             3. Unresolved plot threads\n\
             4. Key themes and motifs\n\n\
             STORY OVERVIEW:\n{overview}\n\n\
             CHAPTERS SUMMARY:\n{chapter_lines}\n\n\
             CHARACTER STATES:\n{character_lines}\n\n\
             PLOTLINES:\n{plot_lines}\n\n\
             STORY RECAP:"
        ),
        context: String::new(),
    }
}

/// JSON shape requested from the model when extracting a story bible.
pub const BIBLE_SCHEMA: &str = r#"{
  "world_name": "name of the world or setting, or null",
  "world_description": "brief description of the setting",
  "time_period": "when the story takes place",
  "primary_locations": [{"name": "", "description": "", "importance": "high|medium|low"}],
  "magic_system": "description, or null",
  "technology_level": "description",
  "world_rules": [{"category": "physics|magic|society|technology|biology", "title": "", "description": "", "importance": 5}],
  "central_themes": [""],
  "glossary": [{"term": "", "definition": ""}],
  "tone_guidelines": "tone and style notes",
  "quick_facts": [""]
}"#;

pub fn build_bible_extraction_prompt(
    story: &StorySnapshot,
    story_content: &str,
    known_characters: &[Character],
) -> PromptParts {
    let mut user = format!(
        "Analyze this {} story (\"{}\") and produce a story bible.\n\nSTORY CONTENT:\n{story_content}",
        story.genre, story.title
    );
    if !known_characters.is_empty() {
        let names: Vec<&str> = known_characters.iter().map(|c| c.name.as_str()).collect();
        user.push_str(&format!("\n\nKNOWN CHARACTERS: {}", names.join(", ")));
    }
    user.push_str(&format!(
        "\n\nReturn a JSON object of this shape:\n{BIBLE_SCHEMA}\n\n\
         This is a {} story with a {} tone. Respond with ONLY the JSON object:",
        story.genre, story.tone
    ));

    PromptParts {
        system_prompt: "You are a story analyst and world-building specialist. Extract every \
                        world-building element that is stated or can reasonably be inferred. \
                        You MUST respond with valid JSON only."
            .to_string(),
        user_prompt: user,
        context: String::new(),
    }
}

pub fn build_character_analysis_prompt(character: &Character, content: &str) -> PromptParts {
    PromptParts {
        system_prompt: "Analyze how this character is portrayed in the given content. Compare \
                        against the established profile and identify:\n\
                        1. Consistency with established personality\n\
                        2. Voice and dialogue authenticity\n\
                        3. Actions that align or conflict with their nature\n\
                        4. Development or changes from their baseline\n\
                        5. Suggestions for improvement"
            .to_string(),
        user_prompt: format!(
            "CHARACTER PROFILE:\n{}\n\nCONTENT TO ANALYZE:\n{content}\n\nProvide a detailed \
             character analysis:",
            character.profile_text()
        ),
        context: String::new(),
    }
}

/// Style used when an image prompt names none.
pub const DEFAULT_IMAGE_STYLE: &str = "cinematic, detailed, high quality, professional";

/// What an image prompt depicts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageKind {
    Character,
    Scene,
    Cover,
}

impl ImageKind {
    pub const ALL: [ImageKind; 3] = [Self::Character, Self::Scene, Self::Cover];

    pub fn slug(self) -> &'static str {
        match self {
            Self::Character => "character",
            Self::Scene => "scene",
            Self::Cover => "cover",
        }
    }
}

impl fmt::Display for ImageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.slug())
    }
}

impl FromStr for ImageKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|kind| kind.slug() == wanted)
            .ok_or_else(|| format!("unknown image kind '{s}'"))
    }
}

pub fn build_image_prompt(description: &str, kind: ImageKind, style: Option<&str>) -> PromptParts {
    let style = style
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or(DEFAULT_IMAGE_STYLE);

    PromptParts {
        system_prompt: "You are an expert at writing prompts for image generation models. Turn \
                        story descriptions into vivid, specific prompts that produce \
                        high-quality images."
            .to_string(),
        user_prompt: format!(
            "Create a detailed image generation prompt for the following:\n\n\
             TYPE: {kind}\n\
             DESCRIPTION: {description}\n\
             STYLE: {style}\n\n\
             The prompt should cover:\n\
             1. Main subject description\n\
             2. Composition and framing\n\
             3. Lighting and atmosphere\n\
             4. Style and artistic direction\n\
             5. Technical quality specifications\n\n\
             IMAGE PROMPT:"
        ),
        context: String::new(),
    }
}

/// JSON shape requested when folding new content into an existing bible.
/// Only additions are asked for.
pub const BIBLE_UPDATE_SCHEMA: &str = r#"{
  "new_locations": [{"name": "", "description": "", "importance": "high|medium|low"}],
  "new_world_rules": [{"category": "", "title": "", "description": "", "importance": 5}],
  "new_glossary_terms": [{"term": "", "definition": ""}],
  "new_themes": [""],
  "new_quick_facts": [""]
}"#;

pub fn build_bible_update_prompt(
    story: &StorySnapshot,
    new_content: &str,
    existing: Option<&StoryBible>,
) -> PromptParts {
    let existing = existing
        .and_then(|bible| serde_json::to_string_pretty(bible).ok())
        .unwrap_or_else(|| "(no story bible yet)".to_string());

    PromptParts {
        system_prompt: "You are a story analyst keeping a story bible up to date. Compare the new \
                        content against the existing bible and return ONLY elements that are \
                        not already recorded. You MUST respond with valid JSON only."
            .to_string(),
        user_prompt: format!(
            "Find new world-building in this content from \"{}\" ({}).\n\n\
             NEW CONTENT:\n{new_content}\n\n\
             EXISTING STORY BIBLE:\n{existing}\n\n\
             Return a JSON object of this shape:\n{BIBLE_UPDATE_SCHEMA}\n\n\
             Only include sections that have new items. Respond with ONLY the JSON object:",
            story.title, story.genre
        ),
        context: String::new(),
    }
}
