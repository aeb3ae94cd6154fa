//! Streaming Session Manager.
//!
//! One session owns one streaming generation:
//!
//! ```text
//! OPEN --(fragment)*--> CLOSING --> PERSISTED | PERSIST_FAILED | NOTHING_TO_PERSIST
//! ```
//!
//! The session runs on its own task and captures only plain values plus
//! shared service handles, so it outlives the request that started it.  A
//! caller that disconnects stops receiving frames; accumulation and the
//! final commit carry on regardless.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use narrative_core::{Chapter, EntityStore, Result};
use narrative_llm::{GenerationRequest, StreamEvent, TextGenerator};
use narrative_memory::Indexer;

use crate::frame::StreamFrame;
use crate::reindex::{BackgroundTasks, schedule_chapter_reindex};

const EVENT_BUFFER: usize = 128;
const FRAME_BUFFER: usize = 128;

/// Where generated text goes once the stream ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistTarget {
    pub story_id: Uuid,
    pub chapter_id: Uuid,
    /// Names scanned for when the chapter is re-indexed.
    pub character_names: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    Open,
    Closing,
    Persisted,
    PersistFailed,
    /// The stream produced only whitespace; nothing was written.
    NothingToPersist,
}

/// Final account of a session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionOutcome {
    pub state: SessionState,
    /// Concatenation of every fragment, in order.
    pub generated: String,
    pub fragments: usize,
    /// Terminal error reported by the generator, if the stream ended in one.
    pub stream_error: Option<String>,
    pub client_disconnected: bool,
    /// Chapter word count after a successful commit.
    pub word_count: Option<usize>,
    pub persist_error: Option<String>,
}

/// Caller side of a running session.
pub struct StreamHandle {
    pub frames: mpsc::Receiver<StreamFrame>,
    /// Resolves once the session has finished persisting.
    pub outcome: oneshot::Receiver<SessionOutcome>,
}

/// Start generating `request` and return immediately.  The session and the
/// re-index it triggers run on `tasks`, so they finish even if the handle is
/// dropped, as long as the owner drains `tasks` before shutting down.
pub fn spawn_session(
    tasks: &BackgroundTasks,
    generator: Arc<dyn TextGenerator>,
    store: Arc<dyn EntityStore>,
    indexer: Indexer,
    request: GenerationRequest,
    target: PersistTarget,
) -> StreamHandle {
    let (frame_tx, frames) = mpsc::channel(FRAME_BUFFER);
    let (event_tx, event_rx) = mpsc::channel(EVENT_BUFFER);

    tokio::spawn(async move {
        generator.generate_stream(&request, event_tx).await;
    });

    let (outcome_tx, outcome) = oneshot::channel();
    let session_tasks = tasks.clone();
    tasks.spawn(async move {
        let finished = run_session(event_rx, frame_tx, store, indexer, &session_tasks, target).await;
        let _ = outcome_tx.send(finished);
    });
    StreamHandle { frames, outcome }
}

async fn run_session(
    mut events: mpsc::Receiver<StreamEvent>,
    frames: mpsc::Sender<StreamFrame>,
    store: Arc<dyn EntityStore>,
    indexer: Indexer,
    tasks: &BackgroundTasks,
    target: PersistTarget,
) -> SessionOutcome {
    let mut outcome = SessionOutcome {
        state: SessionState::Open,
        generated: String::new(),
        fragments: 0,
        stream_error: None,
        client_disconnected: false,
        word_count: None,
        persist_error: None,
    };
    debug!(chapter_id = %target.chapter_id, "stream session open");

    let terminal = loop {
        let Some(event) = events.recv().await else {
            break StreamFrame::Done;
        };
        match event {
            StreamEvent::Token(text) => {
                outcome.generated.push_str(&text);
                outcome.fragments += 1;
                if !outcome.client_disconnected
                    && frames.send(StreamFrame::Token(text)).await.is_err()
                {
                    outcome.client_disconnected = true;
                    info!(chapter_id = %target.chapter_id, "client disconnected; generation continues");
                }
            }
            StreamEvent::Done => break StreamFrame::Done,
            StreamEvent::Error(message) => {
                warn!(chapter_id = %target.chapter_id, error = %message, fragments = outcome.fragments, "stream ended with error");
                outcome.stream_error = Some(message.clone());
                break StreamFrame::Error(message);
            }
        }
    };

    outcome.state = SessionState::Closing;
    if !outcome.client_disconnected {
        let _ = frames.send(terminal).await;
    }
    drop(frames);

    if outcome.generated.trim().is_empty() {
        outcome.state = SessionState::NothingToPersist;
        debug!(chapter_id = %target.chapter_id, "stream produced no text");
        return outcome;
    }

    match persist(store.as_ref(), target.chapter_id, &outcome.generated).await {
        Ok(chapter) => {
            outcome.state = SessionState::Persisted;
            outcome.word_count = Some(chapter.word_count);
            info!(
                story_id = %target.story_id,
                chapter_id = %target.chapter_id,
                fragments = outcome.fragments,
                word_count = chapter.word_count,
                "streamed text persisted"
            );
            schedule_chapter_reindex(tasks, indexer, chapter, target.character_names);
        }
        Err(err) => {
            outcome.state = SessionState::PersistFailed;
            outcome.persist_error = Some(err.to_string());
            error!(
                story_id = %target.story_id,
                chapter_id = %target.chapter_id,
                %err,
                chars = outcome.generated.len(),
                "streamed text could not be persisted"
            );
        }
    }
    outcome
}

/// Append through a freshly acquired write scope.  The scope is released on
/// every path: committed, or dropped on error.
pub(crate) async fn persist(store: &dyn EntityStore, chapter_id: Uuid, text: &str) -> Result<Chapter> {
    let mut scope = store.write_scope().await?;
    let chapter = scope.append_chapter_content(chapter_id, text).await?;
    scope.commit().await?;
    Ok(chapter)
}
