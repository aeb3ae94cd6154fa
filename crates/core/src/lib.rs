pub mod error;
pub mod model;
pub mod stats;
pub mod store;

pub use error::{EntityKind, NarrativeError, Result};
pub use model::{
    Chapter, Character, CharacterRole, GlossaryTerm, Plotline, PlotlineStatus, StoryBible,
    StorySnapshot, WorldRule,
};
pub use stats::{StoryStats, story_stats};
pub use store::{ArchiveStore, EntityStore, StoryArchive, WriteScope};
