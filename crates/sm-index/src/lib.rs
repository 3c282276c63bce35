//! Code indexer building blocks.
//!
//! Enumerates candidate files under a root ([`walker`]), tags them with a
//! language ([`language`]), and cuts them into chunks by line span or by
//! symbol boundary ([`chunker`]). [`digest`] computes the file-level
//! SHA-256 used for incremental-diff decisions and the chunk-level
//! `contentSha`.

pub mod chunker;
pub mod digest;
pub mod language;
pub mod walker;

pub use chunker::{chunk_file, Chunk, ChunkMeta, ChunkMode};
pub use digest::{file_digest, sha256_hex};
pub use language::language_for_path;
pub use walker::{walk, PathSelector, WalkOptions, DEFAULT_EXCLUDES, MAX_FILE_BYTES};
