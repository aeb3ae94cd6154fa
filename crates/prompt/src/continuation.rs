//! Continuation prompts: the prompt behind every "write the next part" call.

use narrative_core::{Chapter, Character, Plotline, StoryBible, StorySnapshot};
use narrative_llm::WritingMode;
use narrative_memory::AggregatedContext;

use crate::PromptParts;
use crate::context::{active_plotlines_block, bible_block, characters_block, tag_retrieved};

/// Everything a continuation prompt is built from.  Callers do the async
/// work (entity reads, retrieval) first; [`build_continuation_prompt`] is a
/// pure function of these values.
pub struct ContinuationInputs<'a> {
    pub story: &'a StorySnapshot,
    pub chapter: &'a Chapter,
    pub characters: &'a [Character],
    /// All plotlines; inactive ones are dropped here.
    pub plotlines: &'a [Plotline],
    pub story_bible: Option<&'a StoryBible>,
    /// Tail of the chapter the model continues from.
    pub recent_content: &'a str,
    /// Already filtered by relevance threshold.
    pub retrieved: &'a AggregatedContext,
    pub mode: WritingMode,
    pub user_direction: Option<&'a str>,
    pub word_target: u32,
}

/// Behavioural instructions for each writing mode.
pub fn mode_instructions(mode: WritingMode) -> &'static str {
    match mode {
        WritingMode::AiLead => {
            "You are an autonomous creative writer. Take bold creative decisions, introduce \
             compelling developments, and write with confidence. The author trusts your \
             creative vision."
        }
        WritingMode::UserLead => {
            "You are a supportive writing assistant. Continue the story following the \
             established direction closely. Do not introduce major new elements unless \
             essential. Match the author's style exactly."
        }
        WritingMode::CoAuthor => {
            "You are a collaborative co-author. Continue the story thoughtfully, building on \
             what is established while adding your own creative input. Balance the author's \
             vision with fresh ideas."
        }
    }
}

/// Mode instructions plus the story's style guide, if any.
pub fn writer_system_prompt(story: &StorySnapshot, mode: WritingMode) -> String {
    let mut prompt = format!(
        "{}\n\nYou are writing \"{}\", a {} story with a {} tone. Write prose only: no \
         headings, no commentary, no notes to the author.",
        mode_instructions(mode),
        story.title,
        story.genre,
        story.tone,
    );
    if let Some(style) = story.style_guide.as_deref().filter(|s| !s.trim().is_empty()) {
        prompt.push_str("\n\nSTYLE GUIDE:\n");
        prompt.push_str(style.trim());
    }
    prompt
}

pub fn build_continuation_prompt(inputs: &ContinuationInputs<'_>) -> PromptParts {
    let story = inputs.story;
    let chapter = inputs.chapter;

    let mut context = vec![format!("STORY: {} ({}, {})", story.title, story.genre, story.tone)];
    if let Some(synopsis) = story.synopsis.as_deref().filter(|s| !s.trim().is_empty()) {
        context.push(format!("SYNOPSIS:\n{synopsis}"));
    }
    context.push(format!("CHARACTERS:\n{}", characters_block(inputs.characters)));
    context.push(format!("ACTIVE PLOTLINES:\n{}", active_plotlines_block(inputs.plotlines)));
    context.push(format!("WORLD:\n{}", bible_block(inputs.story_bible)));

    let mut user = format!(
        "Continue Chapter {}: \"{}\". Write approximately {} words.",
        chapter.number, chapter.title, inputs.word_target
    );

    let tagged = tag_retrieved(inputs.retrieved);
    if !tagged.is_empty() {
        user.push_str("\n\nRELEVANT MATERIAL FROM EARLIER IN THE STORY:\n");
        user.push_str(&tagged.join("\n\n"));
    }

    if let Some(direction) = inputs.user_direction.map(str::trim).filter(|d| !d.is_empty()) {
        user.push_str("\n\nAUTHOR DIRECTION:\n");
        user.push_str(direction);
    }

    if inputs.recent_content.trim().is_empty() {
        user.push_str("\n\nThis chapter is empty. Write its opening.");
    } else {
        user.push_str("\n\nRECENT TEXT (continue from here):\n");
        user.push_str(inputs.recent_content);
    }
    user.push_str("\n\nContinue the story:");

    PromptParts {
        system_prompt: writer_system_prompt(story, inputs.mode),
        user_prompt: user,
        context: context.join("\n\n"),
    }
}
