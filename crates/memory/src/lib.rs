//! Semantic memory of a story: embedded chunks per collection, the indexer
//! that produces them and the aggregator that reads them back.

pub mod chunk;
pub mod chunk_log;
pub mod indexer;
pub mod retrieval;
pub mod store;

pub use chunk::{
    ChunkDraft, Collection, EmbeddedChunk, QueryFilter, RetrievedContext, content_hash,
    cosine_similarity,
};
pub use chunk_log::ChunkLog;
pub use indexer::{Indexer, chunk_paragraphs, mentioned_names};
pub use retrieval::{AggregatedContext, DEFAULT_RELEVANCE_THRESHOLD, RetrievalAggregator};
pub use store::{EmbedFn, InMemoryVectorStore, VectorStore};
