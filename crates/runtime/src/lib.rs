pub mod frame;
pub mod reindex;
pub mod session;
mod story;

#[cfg(test)]
mod testkit;

pub use frame::StreamFrame;
pub use reindex::{BackgroundTasks, ollama_embed_fn, schedule_chapter_reindex};
pub use session::{PersistTarget, SessionOutcome, SessionState, StreamHandle, spawn_session};
pub use story::{
    BibleExtraction, BibleUpdate, Continuation, ContinueRequest, Generated, ImagePrompt,
    IndexSummary, Recap, StoryRuntime,
};
