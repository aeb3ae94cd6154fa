//! Prompt Assembler.
//!
//! Every builder is a pure function of its inputs: no clock, no randomness,
//! no I/O.  Identical inputs give byte-identical prompts.

use serde::Serialize;

pub mod context;
pub mod continuation;
pub mod tools;

pub use context::{tag_retrieved, tail_chars};
pub use continuation::{
    ContinuationInputs, build_continuation_prompt, mode_instructions, writer_system_prompt,
};
pub use tools::{
    BIBLE_SCHEMA, BIBLE_UPDATE_SCHEMA, BrainstormKind, DEFAULT_IMAGE_STYLE, ImageKind,
    SummaryKind, build_bible_extraction_prompt, build_bible_update_prompt,
    build_brainstorm_prompt, build_character_analysis_prompt, build_dialogue_prompt,
    build_image_prompt, build_recap_prompt, build_rewrite_prompt, build_summary_prompt,
};

/// The three parts handed to the generation engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PromptParts {
    pub system_prompt: String,
    pub user_prompt: String,
    /// Story knowledge placed ahead of the task.  Empty when unused.
    pub context: String,
}
